//! The graph realisation engine.
//!
//! Translates each logical endpoint-to-endpoint flow rule into an ordered
//! sequence of switch-level entries along the shortest path, stacking a
//! transport VLAN per link segment, and keeps the store and the controller
//! in step: every pushed entry gets an `external` row, every failure tears
//! the session back down.
//!
//! VLAN handling on a multi-hop path (Generic algorithm):
//!
//! ```text
//!   first hop:   [ep vlan? pop] [rule pop? pop] push  set(T1)          output
//!   middle hop:  match T(i)                     set(T(i+1))            output
//!   last hop:    match Tn  pop  <base actions>  [service push/set]
//!                [egress-vlan push+set]                                output
//! ```
//!
//! The first hop always pushes the transport header, also when the packet
//! already carries a tag; the last hop's pop therefore always restores the
//! original stack before the service tag is applied. A single-switch path
//! skips the transport tag entirely. With `jolnet` enabled the environment
//! pre-tags all traffic and the transform degenerates to `set_vlan_id` on
//! every hop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use sdno_controller::{ControllerClient, TopologyProvider, WireFlow};
use sdno_nffg::{
    Action, Endpoint, EndpointKind, EntityStatus, FlowRule, Nffg, PortRef, ProfileGraph, Vnf,
};
use sdno_store::{FlowRuleRow, GraphStore, SessionStatus, RESOURCE_FLOW_RULE, RESOURCE_PORT};

use crate::config::Config;
use crate::domain::ResourceDescription;
use crate::error::{DoError, DoResult};
use crate::locks::SwitchLocks;
use crate::vlan::VlanAllocator;

/// Poll interval while waiting for a controller application to come up.
const APP_ACTIVE_POLL: Duration = Duration::from_millis(100);
/// Give up on an application after this many polls.
const APP_ACTIVE_POLLS_MAX: u32 = 100;

/// Position of a hop on the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HopPos {
    Single,
    First,
    Middle,
    Last,
}

pub struct Realiser {
    config: Arc<Config>,
    store: GraphStore,
    controller: Arc<dyn ControllerClient>,
    topology: Arc<RwLock<TopologyProvider>>,
    allocator: VlanAllocator,
    description: Arc<ResourceDescription>,
    locks: SwitchLocks,
}

impl Realiser {
    pub fn new(
        config: Arc<Config>,
        store: GraphStore,
        controller: Arc<dyn ControllerClient>,
        topology: Arc<RwLock<TopologyProvider>>,
        description: Arc<ResourceDescription>,
    ) -> Self {
        let allocator = VlanAllocator::new(config.allowed_vlan_ranges());
        Realiser {
            config,
            store,
            controller,
            topology,
            allocator,
            description,
            locks: SwitchLocks::new(),
        }
    }

    fn controller_writes_enabled(&self) -> bool {
        !self.config.domain_orchestrator.detached_mode
    }

    /*
     * Validation
     */

    /// Preconditions that must hold before realisation starts.
    pub fn validate(&self, nffg: &Nffg) -> DoResult<()> {
        for vnf in &nffg.vnfs {
            if !self.description.capability_available(vnf.capability()) {
                return Err(DoError::CapabilityMissing(format!(
                    "VNF '{}' needs capability '{}'",
                    vnf.name,
                    vnf.capability()
                )));
            }
        }

        for ep in &nffg.end_points {
            if ep.ttl.is_some() {
                return Err(DoError::useless("presence of 'ttl' on an end-point"));
            }
            match ep.kind {
                EndpointKind::Interface | EndpointKind::Vlan => {
                    if ep.local_ip.is_some() || ep.remote_ip.is_some() || ep.gre_key.is_some() {
                        return Err(DoError::useless(format!(
                            "end-point '{}' carries tunnel fields but is not a gre-tunnel",
                            ep.id
                        )));
                    }
                    if ep.node_id.is_none() || ep.interface.is_none() {
                        return Err(DoError::graph(format!(
                            "end-point '{}' has no switch/interface",
                            ep.id
                        )));
                    }
                    if ep.kind == EndpointKind::Vlan && ep.vlan_id.is_none() {
                        return Err(DoError::graph(format!(
                            "vlan end-point '{}' has no vlan id",
                            ep.id
                        )));
                    }
                }
                EndpointKind::GreTunnel => {
                    // Tunnel ports are created through the OVSDB southbound.
                    if !self.config.ovsdb.ovsdb_support {
                        return Err(DoError::UnsupportedFeature(format!(
                            "gre-tunnel end-point '{}' needs ovsdb support",
                            ep.id
                        )));
                    }
                    if ep.local_ip.is_none() || ep.remote_ip.is_none() {
                        return Err(DoError::graph(format!(
                            "gre-tunnel end-point '{}' needs local and remote ip",
                            ep.id
                        )));
                    }
                }
            }
        }

        for rule in &nffg.flow_rules {
            let Some(port_in) = rule.match_rule.port_in.as_deref() else {
                return Err(DoError::graph(format!(
                    "flow rule '{}' has no ingress ('port_in')",
                    rule.id
                )));
            };
            let ingress_ref = PortRef::parse(port_in).ok_or_else(|| {
                DoError::graph(format!(
                    "flow rule '{}' has an invalid ingress '{}'",
                    rule.id, port_in
                ))
            })?;
            if let PortRef::Endpoint(gid) = &ingress_ref {
                if nffg.endpoint(gid).is_none() {
                    return Err(DoError::graph(format!(
                        "flow rule '{}' references unknown end-point '{gid}'",
                        rule.id
                    )));
                }
            }

            let mut outputs = 0usize;
            for action in &rule.actions {
                match action {
                    Action::Output(out) => {
                        outputs += 1;
                        if outputs > 1 {
                            return Err(DoError::useless(format!(
                                "multiple 'output_to_port' not allowed (flow rule '{}')",
                                rule.id
                            )));
                        }
                        if let Some(PortRef::Endpoint(gid)) = PortRef::parse(out) {
                            if nffg.endpoint(&gid).is_none() {
                                return Err(DoError::graph(format!(
                                    "flow rule '{}' outputs to unknown end-point '{gid}'",
                                    rule.id
                                )));
                            }
                        }
                    }
                    Action::OutputToController => {
                        return Err(DoError::useless("presence of 'output_to_controller'"));
                    }
                    Action::OutputToQueue(_) => {
                        return Err(DoError::useless("presence of 'output_to_queue'"));
                    }
                    Action::PushVlan(Some(vid)) | Action::SetVlanId(vid) => {
                        if !self.allocator.is_allowed(*vid) {
                            return Err(DoError::graph(format!(
                                "vlan id {vid} not allowed; valid ids: {}",
                                self.config.vlan.available_ids
                            )));
                        }
                    }
                    _ => {}
                }
            }
        }

        // VNF-to-VNF wiring is declared unsupported.
        let profile = ProfileGraph::build(nffg);
        if !profile.attached_vnfs().is_empty() {
            return Err(DoError::UnsupportedFeature(
                "flows between two VNFs are not supported".to_string(),
            ));
        }

        Ok(())
    }

    /*
     * Update reconciliation
     */

    /// Applies the delete half of an update diff and flips flow rules whose
    /// endpoints were replaced back to `new` so they are reinstalled with
    /// the fresh port assignment.
    #[instrument(skip(self, diff))]
    pub async fn reconcile_update(&self, diff: &mut Nffg, session_id: &str) -> DoResult<()> {
        let mut updated_eps: Vec<String> = Vec::new();

        let mut kept_endpoints = Vec::with_capacity(diff.end_points.len());
        for ep in diff.end_points.drain(..) {
            match ep.status {
                Some(EntityStatus::ToBeDeleted) => {
                    if let Some(db_id) = ep.db_id {
                        self.delete_endpoint_cascade(db_id, session_id).await?;
                    }
                }
                Some(EntityStatus::New) | None => {
                    updated_eps.push(ep.id.clone());
                    kept_endpoints.push(ep);
                }
                _ => kept_endpoints.push(ep),
            }
        }
        diff.end_points = kept_endpoints;

        let mut kept_rules = Vec::with_capacity(diff.flow_rules.len());
        for mut rule in diff.flow_rules.drain(..) {
            match rule.status {
                Some(EntityStatus::ToBeDeleted) => {
                    self.delete_flow_rule_by_graph_id(&rule.id, session_id).await?;
                }
                Some(EntityStatus::New) | None => {
                    // A changed rule keeps its graph id; whatever the old
                    // definition installed goes first.
                    self.delete_flow_rule_by_graph_id(&rule.id, session_id).await?;
                    kept_rules.push(rule);
                }
                Some(EntityStatus::AlreadyDeployed) => {
                    if Self::references_updated_endpoint(&rule, &updated_eps) {
                        self.delete_flow_rule_by_graph_id(&rule.id, session_id).await?;
                        rule.status = Some(EntityStatus::New);
                    }
                    kept_rules.push(rule);
                }
                _ => kept_rules.push(rule),
            }
        }
        diff.flow_rules = kept_rules;

        let mut kept_vnfs = Vec::with_capacity(diff.vnfs.len());
        for vnf in diff.vnfs.drain(..) {
            match vnf.status {
                Some(EntityStatus::ToBeDeleted) => {
                    self.deactivate_vnf(&vnf, session_id).await;
                    if let Some(db_id) = vnf.db_id {
                        self.store.delete_vnf_by_id(db_id).await?;
                    }
                }
                _ => kept_vnfs.push(vnf),
            }
        }
        diff.vnfs = kept_vnfs;

        Ok(())
    }

    fn references_updated_endpoint(rule: &FlowRule, updated: &[String]) -> bool {
        let hits = |s: &str| {
            PortRef::endpoint_id(s)
                .map(|gid| updated.iter().any(|u| *u == gid))
                .unwrap_or(false)
        };
        rule.match_rule
            .port_in
            .as_deref()
            .map(hits)
            .unwrap_or(false)
            || rule.actions.iter().filter_map(|a| a.output()).any(hits)
    }

    /*
     * Realisation
     */

    /// Installs every `new` flow rule of the graph and activates the VNF
    /// applications. Assumes the graph (or diff) is already persisted with
    /// db ids filled in.
    #[instrument(skip(self, nffg))]
    pub async fn realise(&self, nffg: &Nffg, session_id: &str, user_id: &str) -> DoResult<()> {
        // Bridge ports attached through OVSDB must exist before the
        // topology snapshot is taken.
        self.provision_physical_ports().await?;

        {
            let mut topology = self.topology.write().await;
            if self.controller_writes_enabled() || topology.is_empty() {
                if let Err(err) = topology.refresh(self.controller.as_ref()).await {
                    // A stale snapshot beats no snapshot in detached mode.
                    if self.controller_writes_enabled() {
                        return Err(err.into());
                    }
                    warn!(error = %err, "topology refresh skipped (detached)");
                }
            }
        }

        let mut profile = ProfileGraph::build(nffg);
        self.setup_gre_endpoints(nffg, &mut profile).await?;

        let topology = self.topology.read().await;

        // Every switch any path touches, locked before the first install so
        // concurrent sessions cannot race the VLAN and collision probes.
        let switches = self.collect_switches(&profile, &topology)?;
        let _guards = self.locks.acquire_all(&switches).await;

        for rule in profile.flow_rules() {
            if !matches!(rule.status, None | Some(EntityStatus::New)) {
                continue;
            }
            let Some(port_in) = rule.match_rule.port_in.as_deref() else {
                continue;
            };
            let Some(gid) = PortRef::endpoint_id(port_in) else {
                debug!(rule = %rule.id, "skipping non-endpoint ingress");
                continue;
            };
            let ep_in = profile
                .endpoint(&gid)
                .cloned()
                .ok_or_else(|| DoError::graph(format!("unknown ingress end-point '{gid}'")))?;
            self.process_flow_rule(&topology, &profile, &ep_in, rule, session_id)
                .await?;
        }
        drop(_guards);
        drop(topology);

        self.instantiate_vnf_applications(nffg, &profile, user_id)
            .await?;

        Ok(())
    }

    /// Materialises GRE endpoints as bridge interfaces and rewrites them in
    /// the profile so routing treats them like plain interface endpoints.
    async fn setup_gre_endpoints(
        &self,
        nffg: &Nffg,
        profile: &mut ProfileGraph,
    ) -> DoResult<()> {
        for ep in &nffg.end_points {
            if ep.kind != EndpointKind::GreTunnel {
                continue;
            }
            let db_id = ep
                .db_id
                .ok_or_else(|| DoError::internal(format!("end-point '{}' not persisted", ep.id)))?;
            let port = self
                .store
                .port_for_endpoint(db_id)
                .await?
                .ok_or_else(|| DoError::internal(format!("end-point '{}' has no port", ep.id)))?;

            let bridge = self
                .config
                .physical_ports
                .gre_bridge
                .as_deref()
                .unwrap_or("br-gre");

            let is_new = matches!(ep.status, None | Some(EntityStatus::New));
            let mut node_id = self.config.gre_bridge_id().to_string();
            if is_new && self.controller_writes_enabled() {
                let tunnel = self
                    .controller
                    .add_gre_tunnel(
                        bridge,
                        &port.graph_port_id,
                        ep.local_ip.as_deref().unwrap_or_default(),
                        ep.remote_ip.as_deref().unwrap_or_default(),
                        ep.gre_key.as_deref(),
                    )
                    .await?;
                node_id = tunnel.bridge_id;
                info!(endpoint = %ep.id, port = %port.graph_port_id, "gre tunnel created");
            }

            let mut rewritten = Endpoint::interface_on(ep.id.clone(), node_id, port.graph_port_id);
            rewritten.status = ep.status;
            rewritten.db_id = ep.db_id;
            profile.replace_endpoint(rewritten);
        }
        Ok(())
    }

    /// Attaches the configured physical ports to their bridges through the
    /// controller's OVSDB southbound. The controller treats re-adding an
    /// existing port as a no-op, so this runs on every realisation.
    async fn provision_physical_ports(&self) -> DoResult<()> {
        if !self.config.ovsdb.ovsdb_support || !self.controller_writes_enabled() {
            return Ok(());
        }
        for (interface, bridge) in &self.config.physical_ports.ports {
            self.controller.add_port(bridge, interface).await?;
            debug!(%bridge, %interface, "physical port attached");
        }
        Ok(())
    }

    /// The set of switches the session will install on: both endpoint
    /// switches of every new rule plus every transit switch on their paths.
    fn collect_switches(
        &self,
        profile: &ProfileGraph,
        topology: &TopologyProvider,
    ) -> DoResult<Vec<String>> {
        let mut switches = Vec::new();
        for rule in profile.flow_rules() {
            if !matches!(rule.status, None | Some(EntityStatus::New)) {
                continue;
            }
            let ep_in = rule
                .match_rule
                .port_in
                .as_deref()
                .and_then(PortRef::endpoint_id)
                .and_then(|gid| profile.endpoint(&gid).cloned());
            let ep_out = rule
                .output_action()
                .and_then(PortRef::endpoint_id)
                .and_then(|gid| profile.endpoint(&gid).cloned());
            let Some(node_in) = ep_in.and_then(|e| e.node_id) else {
                continue;
            };
            switches.push(node_in.clone());

            if rule.has_drop() {
                continue;
            }
            if let Some(node_out) = ep_out.and_then(|e| e.node_id) {
                if node_out != node_in {
                    if let Some(path) = topology.shortest_path(&node_in, &node_out) {
                        switches.extend(path);
                    } else {
                        switches.push(node_out);
                    }
                }
            }
        }
        Ok(switches)
    }

    /// Realises one logical flow rule: drop short-circuit, egress
    /// resolution, routing, and the per-hop transform.
    async fn process_flow_rule(
        &self,
        topology: &TopologyProvider,
        profile: &ProfileGraph,
        ep_in: &Endpoint,
        rule: &FlowRule,
        session_id: &str,
    ) -> DoResult<()> {
        let node_in = ep_in
            .node_id
            .clone()
            .ok_or_else(|| DoError::graph(format!("end-point '{}' has no switch", ep_in.id)))?;
        let iface_in = ep_in
            .interface
            .clone()
            .ok_or_else(|| DoError::graph(format!("end-point '{}' has no interface", ep_in.id)))?;
        let port_in = topology
            .port_name_of(&node_in, &iface_in)
            .ok_or_else(|| DoError::graph(format!("unknown port {node_in}/{iface_in}")))?;

        // A vlan ingress endpoint narrows the match to its tenant tag.
        let mut rule = rule.clone();
        if ep_in.kind == EndpointKind::Vlan {
            rule.match_rule.vlan_id = ep_in.vlan_id;
        }

        // An identical match already on the ingress switch is a collision;
        // short of that, the ingress must not be consumed by an untagged
        // flow either.
        let mut ingress_probe = rule.clone();
        ingress_probe.match_rule.port_in = Some(port_in.clone());
        if self
            .store
            .flow_on_switch(&node_in, &port_in, &ingress_probe)
            .await?
            .is_some()
        {
            return Err(DoError::graph(format!(
                "cannot install flow rule '{}': collision on switch {node_in}",
                rule.id
            )));
        }
        if self.store.is_direct_endpoint(&port_in, &node_in).await? {
            return Err(DoError::graph(format!(
                "ingress end-point '{}' is a busy direct end-point",
                ep_in.id
            )));
        }

        // Drop rules shadow everything else: one external entry on the
        // ingress switch and we are done.
        if rule.has_drop() {
            let mut m = rule.match_rule.clone();
            m.port_in = Some(port_in);
            let efr = FlowRule::new(rule.id.clone(), rule.priority, m, vec![Action::Drop]);
            self.push_external(&node_in, efr, 0, session_id).await?;
            return Ok(());
        }

        // Flows wired into a VNF port are realised through the application
        // configuration, not as OpenFlow entries.
        if matches!(
            rule.output_action().and_then(PortRef::parse),
            Some(PortRef::VnfPort { .. })
        ) {
            debug!(rule = %rule.id, "egress is a VNF port, left to application configuration");
            return Ok(());
        }

        let out_gid = rule
            .output_action()
            .and_then(PortRef::endpoint_id)
            .ok_or_else(|| {
                DoError::graph(format!("flow rule '{}' has an invalid egress end-point", rule.id))
            })?;
        let ep_out = profile
            .endpoint(&out_gid)
            .cloned()
            .ok_or_else(|| {
                DoError::graph(format!("flow rule '{}' has an invalid egress end-point", rule.id))
            })?;
        let node_out = ep_out
            .node_id
            .clone()
            .ok_or_else(|| DoError::graph(format!("end-point '{}' has no switch", ep_out.id)))?;

        let path = if node_in == node_out {
            if ep_in.interface == ep_out.interface {
                return Err(DoError::graph(format!(
                    "flow rule '{}' is wrong: end-points are overlapping",
                    rule.id
                )));
            }
            vec![node_in.clone()]
        } else {
            let path = topology
                .shortest_path(&node_in, &node_out)
                .ok_or_else(|| DoError::NoPath {
                    src: node_in.clone(),
                    dst: node_out.clone(),
                })?;
            self.check_endpoints_off_transit(topology, &path, ep_in, &ep_out)?;
            path
        };
        debug!(rule = %rule.id, ?path, "routing flow rule");

        self.link_endpoints(topology, &path, ep_in, &ep_out, &rule, session_id)
            .await
    }

    /// An endpoint sitting on the port that carries the path itself is
    /// ambiguous and rejected.
    fn check_endpoints_off_transit(
        &self,
        topology: &TopologyProvider,
        path: &[String],
        ep_in: &Endpoint,
        ep_out: &Endpoint,
    ) -> DoResult<()> {
        if path.len() < 2 {
            return Ok(());
        }
        let in_port = ep_in
            .interface
            .as_deref()
            .and_then(|iface| topology.port_name_of(path[0].as_str(), iface));
        if in_port.is_some() && in_port == topology.switch_port_out(&path[0], &path[1]) {
            return Err(DoError::graph(format!(
                "end-point '{}' sits on a transit port of the path",
                ep_in.id
            )));
        }
        let last = path.len() - 1;
        let out_port = ep_out
            .interface
            .as_deref()
            .and_then(|iface| topology.port_name_of(path[last].as_str(), iface));
        if out_port.is_some() && out_port == topology.switch_port_out(&path[last], &path[last - 1]) {
            return Err(DoError::graph(format!(
                "end-point '{}' sits on a transit port of the path",
                ep_out.id
            )));
        }
        Ok(())
    }

    /// The per-hop transform: builds and pushes one external flow per
    /// switch on the path.
    async fn link_endpoints(
        &self,
        topology: &TopologyProvider,
        path: &[String],
        ep_in: &Endpoint,
        ep_out: &Endpoint,
        rule: &FlowRule,
        session_id: &str,
    ) -> DoResult<()> {
        // Pre-process the actions: service-tag operations and the plain
        // header rewrites survive to the egress hop, everything VLAN-shaped
        // is re-synthesised per hop.
        let mut base: Vec<Action> = Vec::new();
        let mut push_out: Option<u16> = None;
        let mut set_out: Option<u16> = None;
        let mut pop = false;
        for action in &rule.actions {
            match action {
                Action::PushVlan(vid) => push_out = *vid,
                Action::SetVlanId(vid) => set_out = Some(*vid),
                Action::PopVlan => pop = true,
                Action::Output(_) => {}
                other => base.push(other.clone()),
            }
        }

        let original_vlan = rule.match_rule.vlan_id;
        let mut internal_in: Option<u16> = None;

        for (i, hop) in path.iter().enumerate() {
            let pos = match (path.len(), i) {
                (1, _) => HopPos::Single,
                (_, 0) => HopPos::First,
                (n, i) if i == n - 1 => HopPos::Last,
                _ => HopPos::Middle,
            };

            let port_in = match pos {
                HopPos::Single | HopPos::First => topology
                    .port_name_of(hop, ep_in.interface.as_deref().unwrap_or_default())
                    .ok_or_else(|| DoError::graph(format!("unknown ingress port on {hop}")))?,
                _ => topology
                    .switch_port_in(hop, &path[i - 1])
                    .ok_or_else(|| DoError::graph(format!("no link into {hop}")))?,
            };
            let port_out = match pos {
                HopPos::Single | HopPos::Last => topology
                    .port_name_of(hop, ep_out.interface.as_deref().unwrap_or_default())
                    .ok_or_else(|| DoError::graph(format!("unknown egress port on {hop}")))?,
                _ => topology
                    .switch_port_out(hop, &path[i + 1])
                    .ok_or_else(|| DoError::graph(format!("no link out of {hop}")))?,
            };

            // Transport tag for the segment towards the next hop.
            let internal_out = match path.get(i + 1) {
                Some(next_hop) => {
                    let next_port_in = topology
                        .switch_port_in(next_hop, hop)
                        .ok_or_else(|| DoError::graph(format!("no link into {next_hop}")))?;
                    let vid = self
                        .allocator
                        .free_vlan_on(
                            &self.store,
                            next_hop,
                            &next_port_in,
                            &rule.match_rule,
                            internal_in,
                        )
                        .await?
                        .ok_or_else(|| {
                            DoError::graph(format!("no free vlan ids on the switch {next_hop}"))
                        })?;
                    Some(vid)
                }
                None => None,
            };

            let mut hop_match = rule.match_rule.clone();
            hop_match.port_in = Some(port_in);
            hop_match.vlan_id = internal_in.or(original_vlan);

            let actions = if self.config.other_options.jolnet {
                jolnet_hop_actions(pos, internal_out, ep_out, push_out, set_out, &base)
            } else {
                generic_hop_actions(pos, internal_out, ep_in, ep_out, push_out, set_out, pop, &base)
            };
            let mut actions = actions;
            actions.push(Action::Output(port_out));

            let efr = FlowRule::new(rule.id.clone(), rule.priority, hop_match, actions);
            self.push_external(hop, efr, i, session_id).await?;

            internal_in = internal_out;
        }
        Ok(())
    }

    /// Installs one synthesised external flow: collision probe, per-switch
    /// name uniqueness, controller push, store record.
    async fn push_external(
        &self,
        switch_id: &str,
        mut efr: FlowRule,
        suffix: usize,
        session_id: &str,
    ) -> DoResult<()> {
        let port_in = efr
            .match_rule
            .port_in
            .clone()
            .ok_or_else(|| DoError::internal("external flow without port_in"))?;

        // An identical match on the same switch would silently replace the
        // existing entry inside the switch; refuse instead.
        if self
            .store
            .flow_on_switch(switch_id, &port_in, &efr)
            .await?
            .is_some()
        {
            return Err(DoError::graph(format!(
                "cannot install flow rule '{}': collision on switch {switch_id}",
                efr.id
            )));
        }

        // Per-switch physical name: <graph_flow_rule_id>_<i>, bumping the
        // suffix past names taken by earlier installs of the same rule.
        let mut suffix = suffix;
        let mut name = format!("{}_{suffix}", efr.id);
        let mut probes = 0usize;
        while self.store.external_flow_exists(switch_id, &name).await? {
            suffix += 1;
            probes += 1;
            if probes > 4096 {
                return Err(DoError::internal(format!(
                    "flow name space exhausted for '{}' on {switch_id}",
                    efr.id
                )));
            }
            name = format!("{}_{suffix}", efr.id);
        }
        efr.internal_id = Some(name.clone());

        if self.controller_writes_enabled() {
            let wire = WireFlow::build(efr.priority, &efr.match_rule, &efr.actions)?;
            self.controller.create_flow(switch_id, &name, &wire).await?;
        }

        self.store
            .add_flow_rule(session_id, Some(switch_id), &efr, None)
            .await?;
        info!(flow = %name, switch = %switch_id, "external flow installed");
        Ok(())
    }

    /*
     * VNF applications
     */

    /// Activates and configures the applications emulating the graph's
    /// detached VNFs.
    async fn instantiate_vnf_applications(
        &self,
        nffg: &Nffg,
        profile: &ProfileGraph,
        user_id: &str,
    ) -> DoResult<()> {
        for vnf in profile.detached_vnfs() {
            match vnf.status {
                None | Some(EntityStatus::New) => {
                    self.activate_vnf(nffg, profile, vnf, user_id).await?;
                }
                Some(EntityStatus::ToBeUpdated) => {
                    // Ports changed: the application stays up, only its port
                    // configuration is re-pushed.
                    self.configure_vnf(nffg, profile, vnf).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn activate_vnf(
        &self,
        nffg: &Nffg,
        profile: &ProfileGraph,
        vnf: &Vnf,
        user_id: &str,
    ) -> DoResult<()> {
        let capability = self
            .description
            .app_for_capability(vnf.capability())
            .ok_or_else(|| DoError::CapabilityMissing(vnf.capability().to_string()))?;
        let app = capability.name;

        if self.controller_writes_enabled() {
            self.controller.activate_app(&app).await?;
            let mut polls = 0u32;
            while !self.controller.is_app_active(&app).await? {
                polls += 1;
                if polls >= APP_ACTIVE_POLLS_MAX {
                    return Err(DoError::internal(format!(
                        "application '{app}' did not become active"
                    )));
                }
                tokio::time::sleep(APP_ACTIVE_POLL).await;
            }
            info!(application = %app, vnf = %vnf.id, "application active");
        }

        self.configure_vnf(nffg, profile, vnf).await?;

        if self.config.nf_configuration.initial_configuration {
            // The external configuration service picks this up; pushing the
            // identity triple is all the orchestrator does here.
            let mut identity = serde_json::Map::new();
            identity.insert(
                vnf.id.clone(),
                json!({
                    "user-id": user_id,
                    "graph-id": nffg.id,
                    "nf-id": vnf.id,
                }),
            );
            let identity = serde_json::Value::Object(identity);
            if self.controller_writes_enabled() {
                self.controller.push_app_configuration(&app, &identity).await?;
            }
            debug!(vnf = %vnf.id, "initial configuration pushed");
        }
        Ok(())
    }

    /// Builds and pushes the per-port configuration of one VNF from the
    /// flows leaving its ports.
    async fn configure_vnf(
        &self,
        _nffg: &Nffg,
        profile: &ProfileGraph,
        vnf: &Vnf,
    ) -> DoResult<()> {
        let capability = self
            .description
            .app_for_capability(vnf.capability())
            .ok_or_else(|| DoError::CapabilityMissing(vnf.capability().to_string()))?;

        let topology = self.topology.read().await;
        let mut ports = serde_json::Map::new();
        for rule in profile.flows_from_vnf(&vnf.id) {
            let Some(PortRef::VnfPort { port_id, .. }) = rule
                .match_rule
                .port_in
                .as_deref()
                .and_then(PortRef::parse)
            else {
                continue;
            };
            let Some(out_gid) = rule.output_action().and_then(PortRef::endpoint_id) else {
                continue;
            };
            let ep = profile.endpoint(&out_gid).ok_or_else(|| {
                DoError::graph(format!(
                    "VNF '{}' port '{port_id}' outputs to unknown end-point '{out_gid}'",
                    vnf.id
                ))
            })?;
            let device = ep.node_id.clone().unwrap_or_default();
            let port_number = ep
                .interface
                .as_deref()
                .and_then(|iface| topology.port_name_of(&device, iface));
            ports.insert(
                port_id,
                json!({
                    "port-number": port_number,
                    "external-vlan": ep.vlan_id,
                    "flow-priority": rule.priority,
                    "device-id": device,
                }),
            );
        }
        drop(topology);

        let config = json!({ "ports": ports });
        if self.controller_writes_enabled() {
            self.controller
                .push_app_configuration(&capability.name, &config)
                .await?;
        }
        debug!(vnf = %vnf.id, application = %capability.name, "port configuration pushed");
        Ok(())
    }

    /// Best-effort application shutdown during deletes and rollbacks.
    async fn deactivate_vnf(&self, vnf: &Vnf, session_id: &str) {
        let app = match self.store.vnf_by_graph_id(session_id, &vnf.id).await {
            Ok(Some(row)) => row.application_name,
            _ => None,
        };
        let Some(app) = app.or_else(|| {
            self.description
                .app_for_capability(vnf.capability())
                .map(|c| c.name)
        }) else {
            return;
        };
        if self.controller_writes_enabled() {
            if let Err(err) = self.controller.deactivate_app(&app).await {
                warn!(application = %app, error = %err, "deactivation failed, continuing");
            }
        }
    }

    /*
     * Deletion cascades
     */

    /// Tears a whole session down: endpoints with their ports and flows,
    /// leftover flow rules, VNFs with their applications. Per-item failures
    /// are logged and skipped; the point is to free as much as possible.
    #[instrument(skip(self))]
    pub async fn delete_session_graph(&self, session_id: &str) -> DoResult<()> {
        for ep in self.store.endpoints_by_session(session_id).await? {
            if let Err(err) = self.delete_endpoint_cascade(ep.id, session_id).await {
                warn!(endpoint = ep.id, error = %err, "endpoint teardown failed, continuing");
            }
        }
        for rule in self.store.flow_rules_by_session(session_id, None).await? {
            if let Err(err) = self.delete_flow_rule_row(&rule).await {
                warn!(flow_rule = rule.id, error = %err, "flow teardown failed, continuing");
            }
        }
        for vnf_row in self.store.vnfs_by_session(session_id).await? {
            if let Some(app) = &vnf_row.application_name {
                if self.controller_writes_enabled() {
                    if let Err(err) = self.controller.deactivate_app(app).await {
                        warn!(application = %app, error = %err, "deactivation failed, continuing");
                    }
                }
            }
            if let Err(err) = self.store.delete_vnf_by_id(vnf_row.id).await {
                warn!(vnf = vnf_row.id, error = %err, "vnf teardown failed, continuing");
            }
        }
        self.store.update_ended(session_id).await?;
        Ok(())
    }

    /// Deletes an endpoint by walking its resources: linked flow rules
    /// (with their whole graph-id family), then the attachment port, then
    /// the endpoint row itself. A GRE endpoint's tunnel port is torn down
    /// on the bridge before its row goes, mirroring the creation in
    /// `setup_gre_endpoints`.
    pub async fn delete_endpoint_cascade(
        &self,
        endpoint_id: i64,
        session_id: &str,
    ) -> DoResult<()> {
        let is_gre = self
            .store
            .endpoint_by_id(endpoint_id)
            .await?
            .map(|row| row.r#type == EndpointKind::GreTunnel.as_str())
            .unwrap_or(false);

        for resource in self.store.endpoint_resources(endpoint_id).await? {
            match resource.resource_type.as_str() {
                RESOURCE_FLOW_RULE => {
                    self.delete_flow_rule_family(resource.resource_id, session_id)
                        .await?;
                }
                RESOURCE_PORT => {
                    if is_gre {
                        self.delete_gre_tunnel_port(resource.resource_id).await?;
                    }
                    self.store
                        .delete_port(resource.resource_id, session_id)
                        .await?;
                }
                other => warn!(resource = other, "unknown endpoint resource type"),
            }
        }
        self.store.delete_endpoint_by_id(endpoint_id).await?;
        Ok(())
    }

    /// Removes one GRE tunnel port from the bridge. A 404 means the port is
    /// already gone and is swallowed, like flow deletion.
    async fn delete_gre_tunnel_port(&self, port_id: i64) -> DoResult<()> {
        let Some(port) = self.store.port_by_id(port_id).await? else {
            return Ok(());
        };
        let bridge = self
            .config
            .physical_ports
            .gre_bridge
            .as_deref()
            .unwrap_or("br-gre");
        if self.controller_writes_enabled() {
            match self
                .controller
                .delete_gre_tunnel(bridge, &port.graph_port_id)
                .await
            {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {
                    debug!(port = %port.graph_port_id, %bridge, "gre tunnel already absent");
                }
                Err(err) => return Err(err.into()),
            }
        }
        info!(port = %port.graph_port_id, %bridge, "gre tunnel removed");
        Ok(())
    }

    /// Deletes the rule with this row id together with every sibling
    /// sharing its graph flow-rule id (the per-hop externals).
    async fn delete_flow_rule_family(&self, flow_rule_id: i64, session_id: &str) -> DoResult<()> {
        let Some(rule) = self.store.flow_rule_by_id(flow_rule_id).await? else {
            return Ok(());
        };
        self.delete_flow_rule_by_graph_id(&rule.graph_flow_rule_id, session_id)
            .await
    }

    /// Deletes every row (logical and external) of one graph flow rule.
    pub async fn delete_flow_rule_by_graph_id(
        &self,
        graph_flow_rule_id: &str,
        session_id: &str,
    ) -> DoResult<()> {
        for rule in self
            .store
            .flow_rules_by_session(session_id, Some(graph_flow_rule_id))
            .await?
        {
            self.delete_flow_rule_row(&rule).await?;
        }
        Ok(())
    }

    /// Removes one flow-rule row, deleting the physical entry from the
    /// switch first when the row is an installed external. A 404 from the
    /// controller means the entry is already gone and is swallowed.
    async fn delete_flow_rule_row(&self, rule: &FlowRuleRow) -> DoResult<()> {
        if rule.is_external() {
            if let (Some(internal_id), Some(switch_id)) = (&rule.internal_id, &rule.switch_id) {
                if self.controller_writes_enabled() {
                    match self.controller.delete_flow(switch_id, internal_id).await {
                        Ok(()) => {}
                        Err(err) if err.is_not_found() => {
                            debug!(flow = %internal_id, switch = %switch_id, "flow already absent");
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                info!(flow = %internal_id, switch = %switch_id, "external flow removed");
            }
        }
        self.store.delete_flow_rule_by_id(rule.id).await?;
        Ok(())
    }

    /*
     * Helpers for the coordinator
     */

    /// Application names for every VNF of the graph, from the capability
    /// document.
    pub fn application_names(&self, nffg: &Nffg) -> DoResult<HashMap<String, String>> {
        let mut names = HashMap::new();
        for vnf in &nffg.vnfs {
            let capability = self
                .description
                .app_for_capability(vnf.capability())
                .ok_or_else(|| DoError::CapabilityMissing(vnf.capability().to_string()))?;
            names.insert(vnf.id.clone(), capability.name);
        }
        Ok(names)
    }

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    pub async fn mark_status(&self, session_id: &str, status: SessionStatus) -> DoResult<()> {
        self.store.update_status(session_id, status).await?;
        Ok(())
    }
}

/// Action synthesis for one hop, Generic algorithm.
#[allow(clippy::too_many_arguments)]
fn generic_hop_actions(
    pos: HopPos,
    internal_out: Option<u16>,
    ep_in: &Endpoint,
    ep_out: &Endpoint,
    push_out: Option<u16>,
    set_out: Option<u16>,
    pop: bool,
    base: &[Action],
) -> Vec<Action> {
    let mut actions = Vec::new();
    match pos {
        HopPos::First => {
            if ep_in.kind == EndpointKind::Vlan {
                actions.push(Action::PopVlan);
            }
            if pop {
                actions.push(Action::PopVlan);
            }
            if let Some(vid) = internal_out {
                actions.push(Action::PushVlan(None));
                actions.push(Action::SetVlanId(vid));
            }
        }
        HopPos::Middle => {
            if let Some(vid) = internal_out {
                actions.push(Action::SetVlanId(vid));
            }
        }
        HopPos::Last => {
            actions.push(Action::PopVlan);
            actions.extend(base.iter().cloned());
            append_service_tag(&mut actions, ep_out, push_out, set_out);
        }
        HopPos::Single => {
            if ep_in.kind == EndpointKind::Vlan {
                actions.push(Action::PopVlan);
            }
            if pop {
                actions.push(Action::PopVlan);
            }
            actions.extend(base.iter().cloned());
            append_service_tag(&mut actions, ep_out, push_out, set_out);
        }
    }
    actions
}

/// Pre-tagged environments only ever rewrite the id.
fn jolnet_hop_actions(
    pos: HopPos,
    internal_out: Option<u16>,
    ep_out: &Endpoint,
    push_out: Option<u16>,
    set_out: Option<u16>,
    base: &[Action],
) -> Vec<Action> {
    let mut actions = Vec::new();
    match pos {
        HopPos::First | HopPos::Middle => {
            if let Some(vid) = internal_out {
                actions.push(Action::SetVlanId(vid));
            }
        }
        HopPos::Last | HopPos::Single => {
            actions.extend(base.iter().cloned());
            if let Some(vid) = push_out.or(set_out).or(ep_out.vlan_id) {
                actions.push(Action::SetVlanId(vid));
            }
        }
    }
    actions
}

/// Outer service tag on the egress hop: the tenant-requested push/set,
/// then the egress endpoint's own tag.
fn append_service_tag(
    actions: &mut Vec<Action>,
    ep_out: &Endpoint,
    push_out: Option<u16>,
    set_out: Option<u16>,
) {
    if let Some(vid) = push_out {
        actions.push(Action::PushVlan(None));
        actions.push(Action::SetVlanId(vid));
    } else if let Some(vid) = set_out {
        actions.push(Action::SetVlanId(vid));
    }
    if ep_out.kind == EndpointKind::Vlan {
        if let Some(vid) = ep_out.vlan_id {
            actions.push(Action::PushVlan(None));
            actions.push(Action::SetVlanId(vid));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sdno_nffg::Endpoint;

    fn iface_ep(id: &str) -> Endpoint {
        Endpoint::interface_on(id, "s1", "eth1")
    }

    fn vlan_ep(id: &str, vid: u16) -> Endpoint {
        Endpoint::vlan_on(id, "s1", "eth1", vid)
    }

    #[test]
    fn test_first_hop_always_pushes_transport() {
        // Also with a vlan match already present: the transport header goes
        // on top.
        let actions = generic_hop_actions(
            HopPos::First,
            Some(280),
            &iface_ep("a"),
            &iface_ep("b"),
            None,
            None,
            false,
            &[],
        );
        assert_eq!(
            actions,
            vec![Action::PushVlan(None), Action::SetVlanId(280)]
        );
    }

    #[test]
    fn test_first_hop_strips_tenant_tag_before_transport() {
        let actions = generic_hop_actions(
            HopPos::First,
            Some(280),
            &vlan_ep("a", 100),
            &iface_ep("b"),
            None,
            None,
            true,
            &[],
        );
        assert_eq!(
            actions,
            vec![
                Action::PopVlan,
                Action::PopVlan,
                Action::PushVlan(None),
                Action::SetVlanId(280)
            ]
        );
    }

    #[test]
    fn test_middle_hop_swaps_carrier() {
        let actions = generic_hop_actions(
            HopPos::Middle,
            Some(281),
            &iface_ep("a"),
            &iface_ep("b"),
            None,
            None,
            false,
            &[],
        );
        assert_eq!(actions, vec![Action::SetVlanId(281)]);
    }

    #[test]
    fn test_last_hop_pops_then_applies_service_tag() {
        let base = vec![Action::SetEthDst("aa:bb:cc:dd:ee:ff".to_string())];
        let actions = generic_hop_actions(
            HopPos::Last,
            None,
            &iface_ep("a"),
            &vlan_ep("b", 25),
            Some(62),
            None,
            false,
            &base,
        );
        assert_eq!(
            actions,
            vec![
                Action::PopVlan,
                Action::SetEthDst("aa:bb:cc:dd:ee:ff".to_string()),
                Action::PushVlan(None),
                Action::SetVlanId(62),
                Action::PushVlan(None),
                Action::SetVlanId(25),
            ]
        );
    }

    #[test]
    fn test_single_switch_has_no_transport_tag() {
        let actions = generic_hop_actions(
            HopPos::Single,
            None,
            &iface_ep("a"),
            &iface_ep("b"),
            None,
            Some(62),
            false,
            &[],
        );
        assert_eq!(actions, vec![Action::SetVlanId(62)]);
    }

    #[test]
    fn test_jolnet_never_pushes_or_pops() {
        for pos in [HopPos::First, HopPos::Middle, HopPos::Last, HopPos::Single] {
            let actions = jolnet_hop_actions(
                pos,
                Some(280),
                &vlan_ep("b", 25),
                None,
                None,
                &[],
            );
            assert!(actions
                .iter()
                .all(|a| matches!(a, Action::SetVlanId(_))));
        }
    }
}
