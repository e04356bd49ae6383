//! Scenario Configuration Structures
//!
//! A scenario lists the simulated nodes, the application flows between them,
//! scheduled mode switches and the layer settings shared by every node.
//! Files are YAML or TOML, picked by extension.

use anyhow::{anyhow, bail, Context};
use common::types::{DeliveryPath, Position};
use interfaces::Addressing;
use layers::{MuxConfig, NodeRole};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::Path;

/// Main scenario structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScenarioConfig {
    /// Scenario name, copied into the report
    #[serde(default = "default_name")]
    pub name: String,
    /// Run parameters
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Layer configuration applied to every node
    #[serde(default)]
    pub layers: MuxConfig,
    /// Simulated nodes
    pub nodes: Vec<NodeConfig>,
    /// Periodic application flows
    #[serde(default)]
    pub flows: Vec<FlowConfig>,
    /// Scheduled delivery path changes
    #[serde(default)]
    pub mode_switches: Vec<ModeSwitchConfig>,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

fn default_name() -> String {
    "unnamed".to_string()
}

/// Run parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    /// Simulated time in milliseconds
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,
    /// Seed of the start offset generator
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Transmission opportunity period
    #[serde(default = "default_tti_ms")]
    pub tti_ms: u64,
    /// PDUs a node may emit per opportunity, shared by its Tx entities
    #[serde(default = "default_pdus_per_tti")]
    pub pdus_per_tti: usize,
    /// One-hop link latency
    #[serde(default = "default_link_latency_ms")]
    pub link_latency_ms: u64,
}

fn default_duration_ms() -> u64 {
    10_000
}

fn default_seed() -> u64 {
    1
}

fn default_tti_ms() -> u64 {
    1
}

fn default_pdus_per_tti() -> usize {
    4
}

fn default_link_latency_ms() -> u64 {
    2
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            duration_ms: default_duration_ms(),
            seed: default_seed(),
            tti_ms: default_tti_ms(),
            pdus_per_tti: default_pdus_per_tti(),
            link_latency_ms: default_link_latency_ms(),
        }
    }
}

/// One simulated node
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    /// Node id
    pub id: u16,
    /// Node role
    pub role: NodeRole,
    /// IPv4 address
    pub ip: Option<Ipv4Addr>,
    /// Serving base station (UEs only)
    pub serving: Option<u16>,
    /// Position in meters
    #[serde(default)]
    pub position: Position,
    /// UEs reachable over the sidelink
    #[serde(default)]
    pub direct_peers: Vec<u16>,
}

/// Periodic application flow
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlowConfig {
    /// Sending node
    pub source: u16,
    /// "a.b.c.d" (IPv4, multicast allowed), "token:N" or "broadcast"
    pub destination: String,
    /// Classification hint
    #[serde(default = "default_hint")]
    pub hint: String,
    /// Send period
    pub period_ms: u64,
    /// Payload size in bytes
    pub size: usize,
    #[serde(default = "default_src_port")]
    pub src_port: u16,
    #[serde(default = "default_dst_port")]
    pub dst_port: u16,
    /// First send; random in [0, 1000) ms when absent
    pub start_ms: Option<u64>,
    /// Last send time; end of the run when absent
    pub stop_ms: Option<u64>,
}

fn default_hint() -> String {
    "default".to_string()
}

fn default_src_port() -> u16 {
    5000
}

fn default_dst_port() -> u16 {
    6000
}

/// Parsed flow destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDestination {
    Ip(Ipv4Addr),
    Token(u32),
    Broadcast,
}

impl FlowConfig {
    /// Parse the destination string
    pub fn parsed_destination(&self) -> anyhow::Result<FlowDestination> {
        let value = self.destination.trim();
        if value == "broadcast" {
            return Ok(FlowDestination::Broadcast);
        }
        if let Some(token) = value.strip_prefix("token:") {
            let token = token.parse::<u32>().with_context(|| format!("Invalid destination token: {}", value))?;
            return Ok(FlowDestination::Token(token));
        }
        value
            .parse::<Ipv4Addr>()
            .map(FlowDestination::Ip)
            .map_err(|_| anyhow!("Invalid flow destination: {}", value))
    }

    /// Addressing of the packets of this flow
    pub fn addressing(&self, source_ip: Option<Ipv4Addr>) -> anyhow::Result<Addressing> {
        let src_token = self.source as u32;
        Ok(match self.parsed_destination()? {
            FlowDestination::Ip(dst) => {
                let src = source_ip.ok_or_else(|| anyhow!("Node {} has no IP address for an IP flow", self.source))?;
                Addressing::Ip {
                    src: std::net::SocketAddrV4::new(src, self.src_port),
                    dst: std::net::SocketAddrV4::new(dst, self.dst_port),
                }
            }
            FlowDestination::Token(dst) => Addressing::NonIp { src: src_token, dst },
            FlowDestination::Broadcast => Addressing::NonIp { src: src_token, dst: Addressing::NON_IP_BROADCAST },
        })
    }
}

/// Scheduled path change between two peers
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModeSwitchConfig {
    /// Time of the switch
    pub at_ms: u64,
    /// One end of the pair
    pub a: u16,
    /// Other end of the pair
    pub b: u16,
    /// New delivery path
    pub path: DeliveryPath,
    /// Discard queued PDUs instead of draining them
    #[serde(default)]
    pub clear_buffer: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct LogConfig {
    /// Default log level when neither RUST_LOG nor --log-level is set
    pub level: Option<String>,
}

impl ScenarioConfig {
    /// Load a scenario from a YAML or TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Cannot read scenario {}", path.display()))?;
        let config: ScenarioConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => serde_yaml::from_str(&contents)?,
            Some("toml") => toml::from_str(&contents)?,
            other => bail!("Unsupported scenario format: {:?}", other),
        };
        config.validate()?;
        Ok(config)
    }

    /// Cross-check node references
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut ids = BTreeSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id) {
                bail!("Duplicate node id {}", node.id);
            }
        }
        for node in &self.nodes {
            if let Some(serving) = node.serving {
                if !ids.contains(&serving) {
                    bail!("Node {} served by unknown node {}", node.id, serving);
                }
            }
            if let Some(peer) = node.direct_peers.iter().find(|p| !ids.contains(*p)) {
                bail!("Node {} lists unknown direct peer {}", node.id, peer);
            }
        }
        for flow in &self.flows {
            if !ids.contains(&flow.source) {
                bail!("Flow from unknown node {}", flow.source);
            }
            if flow.period_ms == 0 {
                bail!("Flow from node {} has a zero period", flow.source);
            }
            flow.parsed_destination()?;
        }
        for switch in &self.mode_switches {
            if !ids.contains(&switch.a) || !ids.contains(&switch.b) {
                bail!("Mode switch between unknown nodes {} and {}", switch.a, switch.b);
            }
        }
        if self.simulation.tti_ms == 0 {
            bail!("tti_ms must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
name: pair
simulation:
  duration_ms: 500
  seed: 7
nodes:
  - { id: 1, role: base_station, ip: 10.0.0.1 }
  - { id: 2, role: peer_direct, ip: 10.0.0.2, serving: 1, direct_peers: [3] }
  - { id: 3, role: peer_direct, ip: 10.0.0.3, serving: 1, position: { x: 30.0, y: 0.0 } }
flows:
  - { source: 2, destination: 10.0.0.3, hint: voice, period_ms: 20, size: 60 }
  - { source: 3, destination: broadcast, hint: safety-beacon, period_ms: 100, size: 200 }
mode_switches:
  - { at_ms: 250, a: 2, b: 3, path: infrastructure }
"#;

    #[test]
    fn test_parse_yaml_scenario() {
        let config: ScenarioConfig = serde_yaml::from_str(SCENARIO).unwrap();
        config.validate().unwrap();
        assert_eq!(config.simulation.seed, 7);
        assert_eq!(config.simulation.tti_ms, 1);
        assert_eq!(config.nodes[0].role, NodeRole::BaseStation);
        assert_eq!(config.nodes[2].position.x, 30.0);
        assert_eq!(config.layers.cutoff_radius, 100.0);
        assert_eq!(config.mode_switches[0].path, DeliveryPath::Infrastructure);
        assert!(!config.mode_switches[0].clear_buffer);
    }

    #[test]
    fn test_flow_destinations() {
        let config: ScenarioConfig = serde_yaml::from_str(SCENARIO).unwrap();
        assert_eq!(
            config.flows[0].parsed_destination().unwrap(),
            FlowDestination::Ip(Ipv4Addr::new(10, 0, 0, 3))
        );
        assert_eq!(
            config.flows[1].addressing(None).unwrap(),
            Addressing::NonIp { src: 3, dst: Addressing::NON_IP_BROADCAST }
        );

        let mut flow = config.flows[0].clone();
        flow.destination = "token:9".into();
        assert_eq!(flow.parsed_destination().unwrap(), FlowDestination::Token(9));
        flow.destination = "nowhere".into();
        assert!(flow.parsed_destination().is_err());
        assert!(config.flows[0].addressing(None).is_err());
    }

    #[test]
    fn test_unknown_references_rejected() {
        let mut config: ScenarioConfig = serde_yaml::from_str(SCENARIO).unwrap();
        config.nodes[1].direct_peers.push(42);
        assert!(config.validate().is_err());

        let mut config: ScenarioConfig = serde_yaml::from_str(SCENARIO).unwrap();
        config.nodes.push(config.nodes[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml_scenario() {
        let config: ScenarioConfig = toml::from_str(
            r#"
            [[nodes]]
            id = 1
            role = "base_station"

            [[nodes]]
            id = 2
            role = "mobile"
            serving = 1

            [layers.pdcp]
            header_compressed_size = 4
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.layers.pdcp.header_compressed_size, Some(4));
        assert_eq!(config.simulation.duration_ms, 10_000);
    }
}
