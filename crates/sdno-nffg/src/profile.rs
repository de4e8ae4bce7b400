//! Indexed in-memory view of a submitted NF-FG.
//!
//! Built once per realisation and consumed by the flow installer and the VNF
//! activation step. VNFs are partitioned into *detached* (their flows only
//! touch endpoints) and *attached* (some flow references another VNF's port).

use std::collections::HashMap;

use crate::model::{Endpoint, FlowRule, Nffg, PortRef, Vnf};

#[derive(Debug, Clone)]
pub struct ProfileGraph {
    endpoints: HashMap<String, Endpoint>,
    flow_rules: Vec<FlowRule>,
    detached: Vec<Vnf>,
    attached: Vec<Vnf>,
}

impl ProfileGraph {
    pub fn build(nffg: &Nffg) -> Self {
        let endpoints = nffg
            .end_points
            .iter()
            .map(|ep| (ep.id.clone(), ep.clone()))
            .collect();

        let mut detached = Vec::new();
        let mut attached = Vec::new();
        for vnf in &nffg.vnfs {
            if Self::is_attached(vnf, &nffg.flow_rules) {
                attached.push(vnf.clone());
            } else {
                detached.push(vnf.clone());
            }
        }

        ProfileGraph {
            endpoints,
            flow_rules: nffg.flow_rules.clone(),
            detached,
            attached,
        }
    }

    /// A VNF is attached when one of its flows has another VNF on the far
    /// side; endpoint-only flows keep it detached.
    fn is_attached(vnf: &Vnf, rules: &[FlowRule]) -> bool {
        for rule in rules {
            let touches_vnf = |s: &str| {
                matches!(PortRef::parse(s), Some(PortRef::VnfPort { vnf_id, .. }) if vnf_id == vnf.id)
            };
            let from_this = rule
                .match_rule
                .port_in
                .as_deref()
                .map(touches_vnf)
                .unwrap_or(false);
            let to_this = rule.output_action().map(touches_vnf).unwrap_or(false);
            if !from_this && !to_this {
                continue;
            }
            let far_side = if from_this {
                rule.output_action()
            } else {
                rule.match_rule.port_in.as_deref()
            };
            if let Some(PortRef::VnfPort { vnf_id, .. }) = far_side.and_then(PortRef::parse) {
                if vnf_id != vnf.id {
                    return true;
                }
            }
        }
        false
    }

    pub fn endpoint(&self, gid: &str) -> Option<&Endpoint> {
        self.endpoints.get(gid)
    }

    /// Rewrites an endpoint in place (used when a GRE tunnel endpoint is
    /// materialised as a bridge interface).
    pub fn replace_endpoint(&mut self, ep: Endpoint) {
        self.endpoints.insert(ep.id.clone(), ep);
    }

    pub fn flow_rules(&self) -> &[FlowRule] {
        &self.flow_rules
    }

    /// Flow rules whose ingress is an endpoint, in submission order.
    pub fn endpoint_flow_rules(&self) -> impl Iterator<Item = &FlowRule> {
        self.flow_rules.iter().filter(|fr| {
            fr.match_rule
                .port_in
                .as_deref()
                .and_then(PortRef::endpoint_id)
                .is_some()
        })
    }

    pub fn detached_vnfs(&self) -> &[Vnf] {
        &self.detached
    }

    pub fn attached_vnfs(&self) -> &[Vnf] {
        &self.attached
    }

    /// Flow rules whose ingress is a port of the given VNF.
    pub fn flows_from_vnf(&self, vnf_id: &str) -> Vec<&FlowRule> {
        self.flow_rules
            .iter()
            .filter(|fr| {
                matches!(
                    fr.match_rule.port_in.as_deref().and_then(PortRef::parse),
                    Some(PortRef::VnfPort { vnf_id: v, .. }) if v == vnf_id
                )
            })
            .collect()
    }
}
