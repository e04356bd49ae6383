//! Scenario harness
//!
//! Owns the event queue, the shared registry and one multiplexer per node,
//! and plays the roles the layers treat as collaborators: application traffic,
//! the MAC transmission opportunities and the links between nodes.

use crate::config::{FlowConfig, ScenarioConfig};
use anyhow::{bail, Context};
use bytes::Bytes;
use common::types::{DeliveryPath, NodeId, SimTime};
use common::utils::{bytes_to_hex_prefix, time::truncate_to_millis};
use interfaces::registry::{NodeKind, NodeRecord};
use interfaces::{AppPacket, DeliveryInterface, EventId, EventQueue, HeaderSizes, LayerEvent, Sink, StaticRegistry};
use layers::{ConnectionMux, DeliveredSdu, DispatchOutcome, MuxStats, NodeRole};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Events driving a run
#[derive(Debug)]
pub enum SimEvent {
    /// Next packet of a flow
    AppSend { flow: usize },
    /// Transmission opportunity for every node
    Tti,
    /// PDU reaching a node
    Arrival { node: NodeId, pdu: Bytes, sink: Sink },
    /// Event for one node's layers
    Layer { node: NodeId, event: LayerEvent },
}

/// Per-flow counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlowReport {
    pub source: u16,
    pub destination: String,
    pub hint: String,
    pub sent: u64,
    pub queued: u64,
    pub deferred: u64,
    pub dropped: u64,
}

/// Per-node counters
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub id: u16,
    pub role: NodeRole,
    pub stats: MuxStats,
    pub received_sdus: u64,
    pub received_bytes: u64,
    pub relayed_pdus: u64,
    /// Received SDUs per delivery path
    pub received_by_path: BTreeMap<String, u64>,
}

/// Outcome of a run
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub seed: u64,
    pub duration_ms: u64,
    pub events_processed: u64,
    pub nodes: Vec<NodeReport>,
    pub flows: Vec<FlowReport>,
}

#[derive(Debug, Default)]
struct Reception {
    sdus: u64,
    bytes: u64,
    relayed: u64,
    by_path: BTreeMap<DeliveryPath, u64>,
}

/// Delivery collaborator of one node, valid for one handler call
struct NodePort<'a> {
    node: NodeId,
    queue: &'a mut EventQueue<SimEvent>,
    latency_us: u64,
}

impl DeliveryInterface for NodePort<'_> {
    fn now(&self) -> SimTime {
        self.queue.now()
    }

    fn send(&mut self, pdu: Bytes, sink: Sink) {
        let at = self.queue.now().plus_micros(self.latency_us);
        trace!("Node {} -> {}: {}", self.node, sink.next_hop, bytes_to_hex_prefix(&pdu, 16));
        if sink.path == DeliveryPath::Multicast {
            for recipient in sink.recipients.clone() {
                schedule(self.queue, at, SimEvent::Arrival { node: recipient, pdu: pdu.clone(), sink: sink.clone() });
            }
        } else {
            let node = sink.next_hop;
            schedule(self.queue, at, SimEvent::Arrival { node, pdu, sink });
        }
    }

    fn schedule_at(&mut self, at: SimTime, event: LayerEvent) -> EventId {
        schedule(self.queue, at, SimEvent::Layer { node: self.node, event })
    }

    fn cancel(&mut self, id: EventId) -> bool {
        self.queue.cancel(id)
    }
}

fn schedule(queue: &mut EventQueue<SimEvent>, at: SimTime, event: SimEvent) -> EventId {
    let at = at.max(queue.now());
    match queue.schedule_at(at, event) {
        Ok(id) => id,
        Err(e) => {
            // unreachable once clamped to now
            error!("Failed to schedule event: {}", e);
            EventId(u64::MAX)
        }
    }
}

/// A scenario ready to run
pub struct Harness {
    config: ScenarioConfig,
    registry: Arc<StaticRegistry>,
    nodes: BTreeMap<NodeId, ConnectionMux>,
    queue: EventQueue<SimEvent>,
    flows: Vec<FlowReport>,
    receptions: BTreeMap<NodeId, Reception>,
    end: SimTime,
    events_processed: u64,
}

impl Harness {
    /// Register the nodes, build their multiplexers and schedule the run
    pub fn build(config: ScenarioConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let registry = Arc::new(StaticRegistry::new());
        for node in &config.nodes {
            registry.register(NodeRecord {
                id: NodeId(node.id),
                kind: match node.role {
                    NodeRole::BaseStation => NodeKind::BaseStation,
                    NodeRole::Mobile | NodeRole::PeerDirect => NodeKind::Ue,
                },
                ip: node.ip,
                serving: node.serving.map(NodeId),
                position: Some(node.position),
            })?;
        }
        for node in &config.nodes {
            for peer in &node.direct_peers {
                registry.add_direct_capability(NodeId(node.id), NodeId(*peer));
            }
        }

        let mut nodes = BTreeMap::new();
        for node in &config.nodes {
            let id = NodeId(node.id);
            let mux = ConnectionMux::new(id, node.role, config.layers.clone(), registry.clone())
                .with_context(|| format!("Cannot build node {}", id))?;
            nodes.insert(id, mux);
        }

        let mut harness = Self {
            end: SimTime::from_millis(config.simulation.duration_ms),
            flows: config
                .flows
                .iter()
                .map(|f| FlowReport {
                    source: f.source,
                    destination: f.destination.clone(),
                    hint: f.hint.clone(),
                    ..Default::default()
                })
                .collect(),
            receptions: nodes.keys().map(|id| (*id, Reception::default())).collect(),
            config,
            registry,
            nodes,
            queue: EventQueue::new(),
            events_processed: 0,
        };
        harness.schedule_initial_events()?;
        Ok(harness)
    }

    fn schedule_initial_events(&mut self) -> anyhow::Result<()> {
        let mut rng = StdRng::seed_from_u64(self.config.simulation.seed);
        for (index, flow) in self.config.flows.iter().enumerate() {
            let start = match flow.start_ms {
                Some(ms) => SimTime::from_millis(ms),
                None => {
                    let offset_us = (rng.gen::<f64>() * 1_000_000.0) as u64;
                    SimTime::from_micros(truncate_to_millis(offset_us))
                }
            };
            debug!("Flow {} from node {} starts at {}", index, flow.source, start);
            self.queue.schedule_at(start, SimEvent::AppSend { flow: index })?;
        }

        self.queue.schedule_at(SimTime::ZERO, SimEvent::Tti)?;

        for switch in &self.config.mode_switches {
            let at = SimTime::from_millis(switch.at_ms);
            for (node, peer) in [(switch.a, switch.b), (switch.b, switch.a)] {
                let event = LayerEvent::ModeSwitch {
                    peer: NodeId(peer),
                    new_path: switch.path,
                    clear_buffer: switch.clear_buffer,
                };
                self.queue.schedule_at(at, SimEvent::Layer { node: NodeId(node), event })?;
            }
        }
        Ok(())
    }

    /// Run until the configured duration elapsed
    pub fn run(mut self) -> anyhow::Result<ScenarioReport> {
        info!(
            "Running scenario '{}' with {} nodes and {} flows for {} ms",
            self.config.name,
            self.nodes.len(),
            self.config.flows.len(),
            self.config.simulation.duration_ms
        );
        while let Some(at) = self.queue.peek_time() {
            if at > self.end {
                break;
            }
            let Some((_, _, event)) = self.queue.pop() else {
                break;
            };
            self.events_processed += 1;
            self.handle(event)?;
        }
        info!("Scenario '{}' finished after {} events", self.config.name, self.events_processed);
        Ok(self.report())
    }

    fn latency_us(&self) -> u64 {
        self.config.simulation.link_latency_ms * 1000
    }

    fn handle(&mut self, event: SimEvent) -> anyhow::Result<()> {
        match event {
            SimEvent::AppSend { flow } => self.app_send(flow),
            SimEvent::Tti => {
                let opportunity = LayerEvent::TxOpportunity { max_pdus: self.config.simulation.pdus_per_tti };
                let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
                for id in ids {
                    self.layer_event(id, opportunity.clone())?;
                }
                let next = self.queue.now().plus_millis(self.config.simulation.tti_ms);
                self.queue.schedule_at(next, SimEvent::Tti)?;
                Ok(())
            }
            SimEvent::Arrival { node, pdu, sink } => self.arrival(node, pdu, sink),
            SimEvent::Layer { node, event } => self.layer_event(node, event),
        }
    }

    fn app_send(&mut self, index: usize) -> anyhow::Result<()> {
        let flow: &FlowConfig = &self.config.flows[index];
        let source = NodeId(flow.source);
        let source_ip = self.registry.record(source).and_then(|r| r.ip);
        let addressing = flow.addressing(source_ip)?;
        let packet = AppPacket {
            addressing,
            headers: match addressing {
                interfaces::Addressing::Ip { .. } => HeaderSizes::ipv4_udp(),
                interfaces::Addressing::NonIp { .. } => HeaderSizes::none(),
            },
            payload: Bytes::from(vec![0u8; flow.size]),
        };
        let hint = flow.hint.clone();
        let period = flow.period_ms;
        let stop = flow.stop_ms.map(SimTime::from_millis).unwrap_or(self.end);

        let latency_us = self.latency_us();
        let Some(mux) = self.nodes.get_mut(&source) else {
            bail!("Flow source {} has no multiplexer", source);
        };
        let mut port = NodePort { node: source, queue: &mut self.queue, latency_us };
        let dispatch = mux
            .submit(packet, &hint, &mut port)
            .with_context(|| format!("Node {} failed to submit '{}' traffic", source, hint))?;

        let report = &mut self.flows[index];
        report.sent += 1;
        match dispatch.outcome {
            DispatchOutcome::Queued => report.queued += 1,
            DispatchOutcome::Deferred => report.deferred += 1,
            DispatchOutcome::Dropped(_) => report.dropped += 1,
        }

        let next = self.queue.now().plus_millis(period);
        if next <= stop {
            self.queue.schedule_at(next, SimEvent::AppSend { flow: index })?;
        }
        Ok(())
    }

    fn arrival(&mut self, node: NodeId, pdu: Bytes, sink: Sink) -> anyhow::Result<()> {
        if !sink.recipients.contains(&node) {
            return self.relay(node, pdu, sink);
        }

        let Some(mux) = self.nodes.get_mut(&node) else {
            warn!("PDU for unknown node {} dropped", node);
            return Ok(());
        };
        mux.advance(self.queue.now());
        match mux.deliver(pdu, &sink) {
            Ok(Some(sdu)) => self.record(node, &sdu),
            Ok(None) => {}
            Err(e) if e.is_fatal() => return Err(e).with_context(|| format!("Node {} failed", node)),
            Err(e) => warn!("Node {}: PDU from {} rejected: {}", node, sink.origin, e),
        }
        Ok(())
    }

    fn relay(&mut self, node: NodeId, pdu: Bytes, sink: Sink) -> anyhow::Result<()> {
        if sink.path != DeliveryPath::Infrastructure {
            trace!("Node {} overheard PDU for {:?}", node, sink.recipients);
            return Ok(());
        }
        let at = self.queue.now().plus_micros(self.latency_us());
        for recipient in &sink.recipients {
            trace!("Node {} relays PDU from {} to {}", node, sink.origin, recipient);
            let relayed = Sink { next_hop: *recipient, ..sink.clone() };
            self.queue.schedule_at(at, SimEvent::Arrival { node: *recipient, pdu: pdu.clone(), sink: relayed })?;
        }
        if let Some(reception) = self.receptions.get_mut(&node) {
            reception.relayed += 1;
        }
        Ok(())
    }

    fn layer_event(&mut self, node: NodeId, event: LayerEvent) -> anyhow::Result<()> {
        let latency_us = self.latency_us();
        let Some(mux) = self.nodes.get_mut(&node) else {
            warn!("Event for unknown node {} dropped", node);
            return Ok(());
        };
        let mut port = NodePort { node, queue: &mut self.queue, latency_us };
        let delivered = mux.on_event(event, &mut port).with_context(|| format!("Node {} failed", node))?;
        for sdu in &delivered {
            self.record(node, sdu);
        }
        Ok(())
    }

    fn record(&mut self, node: NodeId, sdu: &DeliveredSdu) {
        trace!("Node {} received SN {} on LCID {} from {}", node, sdu.sn, sdu.lcid, sdu.origin);
        let reception = self.receptions.entry(node).or_default();
        reception.sdus += 1;
        reception.bytes += sdu.payload.len() as u64;
        *reception.by_path.entry(sdu.path).or_default() += 1;
    }

    fn report(&self) -> ScenarioReport {
        let nodes = self
            .nodes
            .iter()
            .map(|(id, mux)| {
                let reception = self.receptions.get(id);
                NodeReport {
                    id: id.value(),
                    role: mux.role(),
                    stats: mux.stats(),
                    received_sdus: reception.map(|r| r.sdus).unwrap_or(0),
                    received_bytes: reception.map(|r| r.bytes).unwrap_or(0),
                    relayed_pdus: reception.map(|r| r.relayed).unwrap_or(0),
                    received_by_path: reception
                        .map(|r| r.by_path.iter().map(|(path, n)| (format!("{:?}", path).to_lowercase(), *n)).collect())
                        .unwrap_or_default(),
                }
            })
            .collect();
        ScenarioReport {
            scenario: self.config.name.clone(),
            seed: self.config.simulation.seed,
            duration_ms: self.config.simulation.duration_ms,
            events_processed: self.events_processed,
            nodes,
            flows: self.flows.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
name: switch-pair
simulation:
  duration_ms: 400
  seed: 3
  pdus_per_tti: 2
nodes:
  - { id: 1, role: base_station, ip: 10.0.0.1 }
  - { id: 2, role: peer_direct, ip: 10.0.0.2, serving: 1, direct_peers: [3], position: { x: 0.0, y: 0.0 } }
  - { id: 3, role: peer_direct, ip: 10.0.0.3, serving: 1, position: { x: 40.0, y: 0.0 } }
  - { id: 4, role: mobile, ip: 10.0.0.4, serving: 1, position: { x: 900.0, y: 0.0 } }
layers:
  rlc:
    max_pdu_size: 64
flows:
  - { source: 2, destination: 10.0.0.3, hint: voice, period_ms: 20, size: 150, start_ms: 0, stop_ms: 300 }
  - { source: 3, destination: broadcast, hint: safety-beacon, period_ms: 100, size: 40, start_ms: 5 }
  - { source: 4, destination: 10.0.0.3, hint: stream, period_ms: 50, size: 100, start_ms: 10, stop_ms: 300 }
mode_switches:
  - { at_ms: 150, a: 2, b: 3, path: infrastructure }
"#;

    fn scenario() -> ScenarioConfig {
        serde_yaml::from_str(SCENARIO).unwrap()
    }

    fn node<'a>(report: &'a ScenarioReport, id: u16) -> &'a NodeReport {
        report.nodes.iter().find(|n| n.id == id).unwrap()
    }

    #[test]
    fn test_switch_scenario_is_lossless() {
        let report = Harness::build(scenario()).unwrap().run().unwrap();

        let voice = &report.flows[0];
        assert_eq!(voice.sent, 16);
        assert_eq!(voice.dropped, 0);

        let ue3 = node(&report, 3);
        // every voice SDU and every stream SDU from UE 4 arrives exactly once
        let stream = &report.flows[2];
        assert_eq!(ue3.received_sdus, voice.sent + stream.sent);
        assert!(ue3.received_by_path.get("direct").copied().unwrap_or(0) > 0);
        assert!(ue3.received_by_path.get("infrastructure").copied().unwrap_or(0) > 0);

        let ue2 = node(&report, 2);
        assert_eq!(ue2.stats.switches_completed, 1);
        assert_eq!(ue2.stats.routing_drops, 0);

        // beacons reach UE 2 only; UE 4 is out of range
        assert_eq!(ue2.received_sdus, report.flows[1].sent);
        assert_eq!(node(&report, 4).received_sdus, 0);
        assert!(node(&report, 1).relayed_pdus > 0);
    }

    #[test]
    fn test_runs_are_reproducible() {
        let mut config = scenario();
        for flow in &mut config.flows {
            flow.start_ms = None;
        }
        let first = Harness::build(config.clone()).unwrap().run().unwrap();
        let second = Harness::build(config).unwrap().run().unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_unknown_delivery_mode_aborts_run() {
        let mut config = scenario();
        if let Some(profile) = config.layers.classification.profiles.get_mut("voice") {
            profile.rlc_type = 9;
        }
        let result = Harness::build(config).unwrap().run();
        assert!(result.is_err());
    }
}
