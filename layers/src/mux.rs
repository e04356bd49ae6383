//! Connection multiplexer
//!
//! Entry point of a node's data plane. Outbound packets are classified,
//! mapped to an LCID, numbered and compressed by PDCP, routed according to
//! the node role and queued on the RLC Tx entity of their next hop. Inbound
//! PDUs are reassembled by the Rx entity of their origin and handed upwards.

use crate::d2d::{DeferredSdu, ModeSwitchCoordinator, PeerIndex, SwitchCompletion};
use crate::pdcp::{PdcpConfig, PdcpEntity, PdcpPdu};
use crate::rlc::{EntityKey, RlcConfig, RlcRxEntity, RlcTxEntity};
use crate::routing::{flow_direction, resolver_for, Resolver, Route, RouteContext};
use crate::rrc::{ClassificationTable, ConnectionDescriptor, FlowTable};
use crate::LayerError;
use bytes::Bytes;
use common::types::{DeliveryPath, Direction, FlowKey, Lcid, NodeId, RlcMode, SimTime};
use interfaces::{Addressing, AppPacket, DeliveryInterface, HeaderSizes, LayerEvent, Registry, Sink};
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

pub use crate::routing::{DropReason, NodeRole};

/// Multiplexer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MuxConfig {
    #[serde(default)]
    pub classification: ClassificationTable,
    #[serde(default)]
    pub pdcp: PdcpConfig,
    #[serde(default)]
    pub rlc: RlcConfig,
    /// Group-cast reach in meters
    #[serde(default = "default_cutoff_radius")]
    pub cutoff_radius: f64,
    /// Delay between drain checks of a switching peer
    #[serde(default = "default_drain_check_interval_us")]
    pub drain_check_interval_us: u64,
}

fn default_cutoff_radius() -> f64 {
    100.0
}

fn default_drain_check_interval_us() -> u64 {
    1000
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            classification: ClassificationTable::default(),
            pdcp: PdcpConfig::default(),
            rlc: RlcConfig::default(),
            cutoff_radius: default_cutoff_radius(),
            drain_check_interval_us: default_drain_check_interval_us(),
        }
    }
}

impl MuxConfig {
    pub fn validate(&self) -> Result<(), LayerError> {
        self.pdcp.validate()?;
        self.rlc.validate()?;
        if !(self.cutoff_radius > 0.0) {
            return Err(LayerError::ConfigurationError(format!(
                "Group-cast cutoff radius must be positive (got {})",
                self.cutoff_radius
            )));
        }
        if self.drain_check_interval_us == 0 {
            return Err(LayerError::ConfigurationError("Drain check interval must be positive".into()));
        }
        Ok(())
    }
}

/// What happened to a submitted packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Queued on an RLC Tx entity
    Queued,
    /// Waiting for the destination's mode switch to finish
    Deferred,
    Dropped(DropReason),
}

/// Result of `submit`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    /// `Lcid::NOT_FOUND` when an unroutable packet had no connection yet
    pub lcid: Lcid,
    /// PDCP sequence number, absent when the packet was not routable
    pub sn: Option<u32>,
    pub outcome: DispatchOutcome,
}

/// SDU handed to the upper layer
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredSdu {
    pub origin: NodeId,
    pub lcid: Lcid,
    pub sn: u32,
    pub path: DeliveryPath,
    pub headers: HeaderSizes,
    pub payload: Bytes,
}

/// Counters of one node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MuxStats {
    pub flows: usize,
    pub submitted: u64,
    pub queued: u64,
    pub deferred: u64,
    pub routing_drops: u64,
    pub overflow_drops: u64,
    pub pdus_sent: u64,
    pub pdus_received: u64,
    pub delivered: u64,
    pub rx_dropped: u64,
    pub rx_errors: u64,
    pub switches_completed: u64,
    pub discarded_by_switch: u64,
}

/// Per-node flow multiplexer
pub struct ConnectionMux {
    node: NodeId,
    role: NodeRole,
    resolve: Resolver,
    registry: Arc<dyn Registry>,
    config: MuxConfig,
    flows: FlowTable,
    pdcp: BTreeMap<Lcid, PdcpEntity>,
    rx_pdcp: BTreeMap<EntityKey, PdcpEntity>,
    tx: BTreeMap<EntityKey, RlcTxEntity>,
    rx: BTreeMap<EntityKey, RlcRxEntity>,
    peers: PeerIndex,
    switches: ModeSwitchCoordinator,
    stats: MuxStats,
    /// Rx counters of entities already replaced or torn down
    retired_rx_dropped: u64,
    /// Rotates the Tx entity served first at each opportunity
    tx_rotation: usize,
    now: SimTime,
}

impl ConnectionMux {
    /// Create the multiplexer of `node`
    pub fn new(node: NodeId, role: NodeRole, config: MuxConfig, registry: Arc<dyn Registry>) -> Result<Self, LayerError> {
        config.validate()?;
        info!("Creating connection multiplexer for node {} ({:?})", node, role);
        debug!(
            "Node {} config: compression={:?} queue={} PDUs max_pdu={} window={} radius={}m",
            node,
            config.pdcp.header_compressed_size,
            config.rlc.queue_capacity,
            config.rlc.max_pdu_size,
            config.rlc.rx_window,
            config.cutoff_radius
        );
        let switches = ModeSwitchCoordinator::new(config.rlc.queue_capacity, config.drain_check_interval_us);
        Ok(Self {
            node,
            role,
            resolve: resolver_for(role),
            registry,
            config,
            flows: FlowTable::new(),
            pdcp: BTreeMap::new(),
            rx_pdcp: BTreeMap::new(),
            tx: BTreeMap::new(),
            rx: BTreeMap::new(),
            peers: PeerIndex::new(),
            switches,
            stats: MuxStats::default(),
            retired_rx_dropped: 0,
            tx_rotation: 0,
            now: SimTime::ZERO,
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Virtual time of the last event seen
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Move the node's clock forward
    pub fn advance(&mut self, now: SimTime) {
        if now < self.now {
            warn!("Node {}: clock moved backwards from {} to {}", self.node, self.now, now);
            return;
        }
        self.now = now;
    }

    pub fn descriptor(&self, lcid: Lcid) -> Option<&ConnectionDescriptor> {
        self.flows.descriptor(lcid)
    }

    /// Current path towards a direct-capable peer
    pub fn current_path(&self, peer: NodeId) -> DeliveryPath {
        self.switches.current_path(peer)
    }

    /// Tx entity, if one exists
    pub fn tx_entity(&self, key: EntityKey) -> Option<&RlcTxEntity> {
        self.tx.get(&key)
    }

    /// Rx entity, if one exists
    pub fn rx_entity(&self, key: EntityKey) -> Option<&RlcRxEntity> {
        self.rx.get(&key)
    }

    fn route_context(&self) -> RouteContext<'_> {
        RouteContext {
            node: self.node,
            registry: self.registry.as_ref(),
            switches: &self.switches,
            cutoff_radius: self.config.cutoff_radius,
        }
    }

    /// Send an application packet
    pub fn submit(
        &mut self,
        packet: AppPacket,
        hint: &str,
        delivery: &mut dyn DeliveryInterface,
    ) -> Result<Dispatch, LayerError> {
        self.advance(delivery.now());
        self.stats.submitted += 1;

        let profile = self.config.classification.classify(hint).clone();
        let Some(mode) = RlcMode::from_u8(profile.rlc_type) else {
            error!("Node {}: unknown RLC type {} for '{}'", self.node, profile.rlc_type, hint);
            return Err(LayerError::UnknownDeliveryMode { code: profile.rlc_type, application: hint.to_string() });
        };

        let ctx = self.route_context();
        let direction = flow_direction(self.role, &ctx, &packet);
        let route = (self.resolve)(&ctx, &packet);
        let key = flow_key(&packet.addressing, direction);

        // a packet that cannot be routed never allocates an LCID
        let route = match route {
            Ok(route) => route,
            Err(reason) => {
                self.stats.routing_drops += 1;
                let lcid = self.flows.lookup(&key).unwrap_or(Lcid::NOT_FOUND);
                warn!("Node {}: dropping packet on LCID {} for {}: {}", self.node, lcid, key, reason);
                return Ok(Dispatch { lcid, sn: None, outcome: DispatchOutcome::Dropped(reason) });
            }
        };
        let (lcid, created) = self.flows.lookup_or_create(key)?;

        if created || self.flows.descriptor(lcid).is_none() {
            info!(
                "Node {}: new connection LCID {} for {} ({:?}/{:?}, {:?}, priority {})",
                self.node, lcid, key, profile.application, profile.traffic_class, mode, profile.priority
            );
            self.flows.set_descriptor(ConnectionDescriptor {
                lcid,
                application: profile.application,
                traffic_class: profile.traffic_class,
                rlc_type: profile.rlc_type,
                priority: profile.priority,
                direction,
                d2d_tx_peer: route.d2d_peer.map(|_| self.node),
                d2d_rx_peer: route.d2d_peer,
                multicast_group: route.multicast_group,
                path: route.path,
                last_sn: None,
            });
        }

        let pdcp_config = &self.config.pdcp;
        let pdcp = self.pdcp.entry(lcid).or_insert_with(|| PdcpEntity::new(lcid, pdcp_config));
        let sn = pdcp.next_sequence_number();
        let pdu = pdcp.compress(PdcpPdu::new(sn, packet.headers, packet.payload));
        trace!("Node {}: LCID {} SN {} modeled size {} bytes", self.node, lcid, sn, pdu.modeled_len(mode));
        let sdu = pdu.encode();

        if let Some(descriptor) = self.flows.descriptor_mut(lcid) {
            descriptor.path = route.path;
            descriptor.last_sn = Some(sn);
        }

        let outcome = match route.d2d_peer {
            Some(peer) => self.dispatch_to_peer(peer, &route, lcid, sn, mode, sdu, delivery),
            None => self.admit(route.next_hop, lcid, sn, mode, route.path, sdu, route.recipients),
        };
        Ok(Dispatch { lcid, sn: Some(sn), outcome })
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_to_peer(
        &mut self,
        peer: NodeId,
        route: &Route,
        lcid: Lcid,
        sn: u32,
        mode: RlcMode,
        sdu: Bytes,
        delivery: &mut dyn DeliveryInterface,
    ) -> DispatchOutcome {
        if self.switches.is_switching(peer) {
            if let Some(completion) = self.switches.reevaluate(peer, &self.peers, &mut self.tx, delivery) {
                self.apply_completion(completion);
            }
        }

        if self.switches.is_switching(peer) {
            let deferred = DeferredSdu { lcid, sn, mode, sdu, recipients: route.recipients.clone() };
            return if self.switches.defer(peer, deferred) {
                self.stats.deferred += 1;
                DispatchOutcome::Deferred
            } else {
                self.stats.overflow_drops += 1;
                DispatchOutcome::Dropped(DropReason::QueueFull)
            };
        }

        // a completion above may have moved the peer to another path
        let path = self.switches.current_path(peer);
        let Some(next_hop) = self.route_context().next_hop_for(peer, path) else {
            self.stats.routing_drops += 1;
            warn!("Node {}: no serving node for LCID {} towards peer {}", self.node, lcid, peer);
            return DispatchOutcome::Dropped(DropReason::NoServingNode);
        };
        self.peers.register(peer, EntityKey::new(next_hop, lcid));
        self.admit(next_hop, lcid, sn, mode, path, sdu, route.recipients.clone())
    }

    #[allow(clippy::too_many_arguments)]
    fn admit(
        &mut self,
        next_hop: NodeId,
        lcid: Lcid,
        sn: u32,
        mode: RlcMode,
        path: DeliveryPath,
        sdu: Bytes,
        recipients: Vec<NodeId>,
    ) -> DispatchOutcome {
        let key = EntityKey::new(next_hop, lcid);
        let rlc = &self.config.rlc;
        let entity = self
            .tx
            .entry(key)
            .or_insert_with(|| RlcTxEntity::new(key, mode, path, rlc.queue_capacity, rlc.max_pdu_size));
        if entity.admit(sn, sdu, recipients) {
            self.stats.queued += 1;
            DispatchOutcome::Queued
        } else {
            self.stats.overflow_drops += 1;
            DispatchOutcome::Dropped(DropReason::QueueFull)
        }
    }

    fn apply_completion(&mut self, completion: SwitchCompletion) {
        let SwitchCompletion { peer, path, deferred } = completion;
        for descriptor in self.flows.descriptors_for_peer(peer) {
            descriptor.path = path;
        }
        self.stats.switches_completed += 1;

        let next_hop = self.route_context().next_hop_for(peer, path);
        for sdu in deferred {
            let Some(next_hop) = next_hop else {
                self.stats.routing_drops += 1;
                warn!("Node {}: no serving node, dropping deferred SN {} for peer {}", self.node, sdu.sn, peer);
                continue;
            };
            self.peers.register(peer, EntityKey::new(next_hop, sdu.lcid));
            self.admit(next_hop, sdu.lcid, sdu.sn, sdu.mode, path, sdu.sdu, sdu.recipients);
        }
    }

    /// Send control traffic on the reserved LCID towards the serving node
    pub fn send_control(&mut self, payload: Bytes, delivery: &mut dyn DeliveryInterface) -> Result<Dispatch, LayerError> {
        self.advance(delivery.now());
        let lcid = Lcid::CONTROL;
        let Some(serving) = self.registry.serving_node(self.node) else {
            self.stats.routing_drops += 1;
            warn!("Node {}: no serving node for control traffic", self.node);
            return Ok(Dispatch { lcid, sn: None, outcome: DispatchOutcome::Dropped(DropReason::NoServingNode) });
        };
        let pdcp_config = &self.config.pdcp;
        let pdcp = self.pdcp.entry(lcid).or_insert_with(|| PdcpEntity::new(lcid, pdcp_config));
        let sn = pdcp.next_sequence_number();
        let sdu = PdcpPdu::new(sn, HeaderSizes::none(), payload).encode();
        debug!("Node {}: control message SN {} to {}", self.node, sn, serving);
        let outcome = self.admit(serving, lcid, sn, RlcMode::Tm, DeliveryPath::Infrastructure, sdu, vec![serving]);
        Ok(Dispatch { lcid, sn: Some(sn), outcome })
    }

    /// Receive a PDU emitted by `sink.origin`
    pub fn deliver(&mut self, pdu: Bytes, sink: &Sink) -> Result<Option<DeliveredSdu>, LayerError> {
        self.stats.pdus_received += 1;
        let key = EntityKey::new(sink.origin, sink.lcid);

        let sdu = match sink.mode {
            RlcMode::Tm => pdu,
            RlcMode::Um | RlcMode::Am => {
                let window = self.config.rlc.rx_window;
                let entity = self.rx.entry(key).or_insert_with(|| RlcRxEntity::new(key, sink.path, window));
                match entity.receive(pdu) {
                    Ok(Some(sdu)) => sdu,
                    Ok(None) => return Ok(None),
                    Err(e) => {
                        self.stats.rx_errors += 1;
                        warn!("Node {}: malformed PDU from {}: {}", self.node, key, e);
                        return Err(e);
                    }
                }
            }
        };

        self.finish_delivery(key, sink.path, sdu).map(Some)
    }

    fn finish_delivery(&mut self, key: EntityKey, path: DeliveryPath, sdu: Bytes) -> Result<DeliveredSdu, LayerError> {
        let pdu = PdcpPdu::parse(&sdu).map_err(|e| {
            self.stats.rx_errors += 1;
            e
        })?;
        let pdcp_config = &self.config.pdcp;
        let pdcp = self.rx_pdcp.entry(key).or_insert_with(|| PdcpEntity::new(key.lcid, pdcp_config));
        let pdu = pdcp.decompress(pdu);
        pdcp.record_delivery(pdu.sn);
        self.stats.delivered += 1;
        Ok(DeliveredSdu {
            origin: key.node,
            lcid: key.lcid,
            sn: pdu.sn,
            path,
            headers: pdu.headers,
            payload: pdu.payload,
        })
    }

    /// Switch the traffic exchanged with `peer` to `new_path`
    ///
    /// Returns SDUs completed by merging the peer's Rx state into the fresh
    /// entities of the new path.
    pub fn notify_mode_switch(
        &mut self,
        peer: NodeId,
        new_path: DeliveryPath,
        clear_buffer: bool,
        delivery: &mut dyn DeliveryInterface,
    ) -> Vec<DeliveredSdu> {
        self.advance(delivery.now());
        if let Some(completion) =
            self.switches.notify(peer, new_path, clear_buffer, &self.peers, &mut self.tx, delivery)
        {
            self.apply_completion(completion);
        }
        self.replace_rx_entities(peer, new_path, clear_buffer)
    }

    fn replace_rx_entities(&mut self, peer: NodeId, path: DeliveryPath, clear_buffer: bool) -> Vec<DeliveredSdu> {
        let keys: Vec<EntityKey> = self.rx.keys().filter(|k| k.node == peer).copied().collect();
        let mut delivered = Vec::new();
        for key in keys {
            let Some(prior) = self.rx.remove(&key) else {
                continue;
            };
            let mut fresh = RlcRxEntity::new(key, path, self.config.rlc.rx_window);
            let completed = fresh.reconcile_after_switch(prior.into_state(clear_buffer));
            self.rx.insert(key, fresh);
            for sdu in completed {
                match self.finish_delivery(key, path, sdu) {
                    Ok(sdu) => delivered.push(sdu),
                    Err(e) => warn!("Node {}: dropping reconciled SDU from {}: {}", self.node, key, e),
                }
            }
        }
        delivered
    }

    /// True while `peer` is switching and still has PDUs to drain
    pub fn is_draining(&self, peer: NodeId) -> bool {
        self.switches.is_draining(peer, &self.peers, &self.tx)
    }

    /// Handle an event delivered by the harness
    pub fn on_event(
        &mut self,
        event: LayerEvent,
        delivery: &mut dyn DeliveryInterface,
    ) -> Result<Vec<DeliveredSdu>, LayerError> {
        self.advance(delivery.now());
        match event {
            LayerEvent::TxOpportunity { max_pdus } => {
                self.transmit(max_pdus, delivery);
                for peer in self.switches.switching_peers() {
                    if let Some(completion) = self.switches.reevaluate(peer, &self.peers, &mut self.tx, delivery) {
                        self.apply_completion(completion);
                    }
                }
                Ok(Vec::new())
            }
            LayerEvent::DrainCheck { peer } => {
                if let Some(completion) = self.switches.on_drain_check(peer, &self.peers, &mut self.tx, delivery) {
                    self.apply_completion(completion);
                }
                Ok(Vec::new())
            }
            LayerEvent::ModeSwitch { peer, new_path, clear_buffer } => {
                Ok(self.notify_mode_switch(peer, new_path, clear_buffer, delivery))
            }
        }
    }

    /// Emit up to `max_pdus` PDUs for the whole node
    ///
    /// Entities are served one PDU at a time in turn; the entity served
    /// first rotates from one opportunity to the next.
    fn transmit(&mut self, max_pdus: usize, delivery: &mut dyn DeliveryInterface) {
        let keys: Vec<EntityKey> = self.tx.keys().copied().collect();
        if keys.is_empty() {
            return;
        }
        let start = self.tx_rotation % keys.len();
        self.tx_rotation = self.tx_rotation.wrapping_add(1);

        let mut budget = max_pdus;
        while budget > 0 {
            let mut emitted = false;
            for key in keys[start..].iter().chain(&keys[..start]) {
                if budget == 0 {
                    break;
                }
                let Some(entity) = self.tx.get_mut(key) else {
                    continue;
                };
                let Some(pdu) = entity.pull(1).pop() else {
                    continue;
                };
                let sink = Sink {
                    origin: self.node,
                    next_hop: key.node,
                    recipients: pdu.recipients,
                    lcid: key.lcid,
                    mode: entity.mode(),
                    path: entity.path(),
                };
                delivery.send(pdu.bytes, sink);
                self.stats.pdus_sent += 1;
                budget -= 1;
                emitted = true;
            }
            if !emitted {
                break;
            }
        }
    }

    /// Drop the RLC queues exchanged with a departing node
    ///
    /// A base station removes only the entities keyed on `node`; a UE removes
    /// all of its unicast entities. Group-cast entities always survive, and
    /// flows keep their LCIDs and descriptors.
    pub fn teardown_peer(&mut self, node: NodeId) {
        let role = self.role;
        let affected = move |key: EntityKey| role != NodeRole::BaseStation || key.node == node;

        let tx_keys: Vec<EntityKey> = self
            .tx
            .iter()
            .filter(|(key, entity)| entity.path() != DeliveryPath::Multicast && affected(**key))
            .map(|(key, _)| *key)
            .collect();
        for key in &tx_keys {
            self.tx.remove(key);
        }

        let rx_keys: Vec<EntityKey> = self
            .rx
            .iter()
            .filter(|(key, entity)| entity.path() != DeliveryPath::Multicast && affected(**key))
            .map(|(key, _)| *key)
            .collect();
        for key in &rx_keys {
            if let Some(entity) = self.rx.remove(key) {
                self.retired_rx_dropped += entity.stats().dropped;
            }
            self.rx_pdcp.remove(key);
        }

        let tx = &self.tx;
        self.peers.retain(|key| tx.contains_key(key));
        info!(
            "Node {}: removed {} Tx and {} Rx entities for departing node {}",
            self.node,
            tx_keys.len(),
            rx_keys.len(),
            node
        );
    }

    /// Drop every flow and entity of the node
    pub fn teardown(&mut self) {
        info!(
            "Node {}: tearing down {} flows, {} Tx and {} Rx entities",
            self.node,
            self.flows.len(),
            self.tx.len(),
            self.rx.len()
        );
        self.retired_rx_dropped += self.rx.values().map(|e| e.stats().dropped).sum::<u64>();
        self.flows.clear();
        self.pdcp.clear();
        self.rx_pdcp.clear();
        self.tx.clear();
        self.rx.clear();
        self.peers.clear();
        self.switches.clear();
    }

    /// Counter snapshot
    pub fn stats(&self) -> MuxStats {
        let switch_stats = self.switches.stats();
        MuxStats {
            flows: self.flows.len(),
            rx_dropped: self.retired_rx_dropped + self.rx.values().map(|e| e.stats().dropped).sum::<u64>(),
            discarded_by_switch: switch_stats.discarded,
            ..self.stats
        }
    }
}

fn flow_key(addressing: &Addressing, direction: Direction) -> FlowKey {
    match addressing {
        Addressing::Ip { src, dst } => FlowKey::Ip {
            src: *src.ip(),
            dst: *dst.ip(),
            src_port: src.port(),
            dst_port: dst.port(),
            direction,
        },
        Addressing::NonIp { src, dst } => FlowKey::NonIp { src: *src, dst: *dst },
    }
}
