//! Traffic classification
//!
//! Maps an application's classification hint to the application type,
//! traffic class, RLC delivery mode and priority of the connection.

use common::types::{ApplicationType, TrafficClass};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Raw RLC type code for transparent mode
pub const RLC_TYPE_TM: u8 = 0;
/// Raw RLC type code for unacknowledged mode
pub const RLC_TYPE_UM: u8 = 1;
/// Raw RLC type code for acknowledged mode
pub const RLC_TYPE_AM: u8 = 2;

/// Priority given to safety traffic
pub const PRIORITY_HIGH: u8 = 1;
/// Priority of everything else
pub const PRIORITY_NORMAL: u8 = 2;

/// Classification result for one hint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficProfile {
    pub application: ApplicationType,
    pub traffic_class: TrafficClass,
    /// RLC delivery mode as configured (0 = TM, 1 = UM, 2 = AM); decoded at
    /// dispatch
    #[serde(default = "default_rlc_type")]
    pub rlc_type: u8,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

fn default_rlc_type() -> u8 {
    RLC_TYPE_UM
}

fn default_priority() -> u8 {
    PRIORITY_NORMAL
}

impl TrafficProfile {
    fn new(application: ApplicationType, traffic_class: TrafficClass, priority: u8) -> Self {
        Self { application, traffic_class, rlc_type: RLC_TYPE_UM, priority }
    }
}

/// Configurable hint → profile table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationTable {
    #[serde(default = "default_profiles")]
    pub profiles: BTreeMap<String, TrafficProfile>,
    /// Profile for hints without an entry
    #[serde(default = "default_fallback")]
    pub fallback: TrafficProfile,
}

fn default_profiles() -> BTreeMap<String, TrafficProfile> {
    BTreeMap::from([
        ("voice".to_string(), TrafficProfile::new(ApplicationType::Voip, TrafficClass::Conversational, PRIORITY_NORMAL)),
        ("game".to_string(), TrafficProfile::new(ApplicationType::Gaming, TrafficClass::Interactive, PRIORITY_NORMAL)),
        ("stream".to_string(), TrafficProfile::new(ApplicationType::Vod, TrafficClass::Streaming, PRIORITY_NORMAL)),
        (
            "safety-beacon".to_string(),
            TrafficProfile::new(ApplicationType::Alert, TrafficClass::Background, PRIORITY_HIGH),
        ),
    ])
}

fn default_fallback() -> TrafficProfile {
    TrafficProfile::new(ApplicationType::Cbr, TrafficClass::Background, PRIORITY_NORMAL)
}

impl Default for ClassificationTable {
    fn default() -> Self {
        Self { profiles: default_profiles(), fallback: default_fallback() }
    }
}

impl ClassificationTable {
    /// Classify a hint; unknown hints get the fallback profile
    pub fn classify(&self, hint: &str) -> &TrafficProfile {
        self.profiles.get(hint).unwrap_or(&self.fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_classification() {
        let table = ClassificationTable::default();

        let voice = table.classify("voice");
        assert_eq!(voice.application, ApplicationType::Voip);
        assert_eq!(voice.traffic_class, TrafficClass::Conversational);
        assert_eq!(voice.rlc_type, RLC_TYPE_UM);

        assert_eq!(table.classify("game").application, ApplicationType::Gaming);
        assert_eq!(table.classify("stream").traffic_class, TrafficClass::Streaming);

        let beacon = table.classify("safety-beacon");
        assert_eq!(beacon.application, ApplicationType::Alert);
        assert_eq!(beacon.priority, PRIORITY_HIGH);

        let other = table.classify("telemetry");
        assert_eq!(other.application, ApplicationType::Cbr);
        assert_eq!(other.priority, PRIORITY_NORMAL);
    }

    #[test]
    fn test_partial_override_keeps_defaults() {
        let table: ClassificationTable = serde_json::from_str(
            r#"{"fallback": {"application": "cbr", "traffic_class": "background", "rlc_type": 2}}"#,
        )
        .unwrap();
        assert_eq!(table.classify("unknown").rlc_type, RLC_TYPE_AM);
        assert_eq!(table.classify("voice").application, ApplicationType::Voip);
    }
}
