//! Typed row models and their conversions to the in-memory NF-FG types.

use sqlx::FromRow;

use sdno_nffg::{Action, Match};

pub const RESOURCE_PORT: &str = "port";
pub const RESOURCE_FLOW_RULE: &str = "flow-rule";

/// Flow-rule kind marker: logical rules carry NULL, per-hop physical entries
/// carry `external`.
pub const FLOW_TYPE_EXTERNAL: &str = "external";

/// Lifecycle of one graph session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Initialization,
    Complete,
    Updating,
    Deleted,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initialization => "initialization",
            SessionStatus::Complete => "complete",
            SessionStatus::Updating => "updating",
            SessionStatus::Deleted => "deleted",
            SessionStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<SessionStatus> {
        match s {
            "initialization" => Some(SessionStatus::Initialization),
            "complete" => Some(SessionStatus::Complete),
            "updating" => Some(SessionStatus::Updating),
            "deleted" => Some(SessionStatus::Deleted),
            "error" => Some(SessionStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SessionRow {
    pub session_id: String,
    pub user_id: String,
    pub graph_id: String,
    pub graph_name: Option<String>,
    pub status: String,
    pub started_at: String,
    pub last_update: String,
    pub error: Option<String>,
    pub ended: Option<String>,
    pub description: Option<String>,
}

impl SessionRow {
    pub fn status(&self) -> SessionStatus {
        SessionStatus::parse(&self.status).unwrap_or(SessionStatus::Error)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct EndpointRow {
    pub id: i64,
    pub graph_endpoint_id: String,
    pub session_id: String,
    pub name: Option<String>,
    #[sqlx(rename = "type")]
    pub r#type: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct PortRow {
    pub id: i64,
    pub graph_port_id: String,
    pub session_id: String,
    pub switch_id: Option<String>,
    pub vlan_id: Option<i64>,
    pub ipv4_address: Option<String>,
    pub tunnel_remote_ip: Option<String>,
    pub gre_key: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct EndpointResourceRow {
    pub endpoint_id: i64,
    pub resource_type: String,
    pub resource_id: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct FlowRuleRow {
    pub id: i64,
    pub graph_flow_rule_id: String,
    pub internal_id: Option<String>,
    pub session_id: String,
    pub switch_id: Option<String>,
    #[sqlx(rename = "type")]
    pub r#type: Option<String>,
    pub priority: i64,
    pub status: Option<String>,
}

impl FlowRuleRow {
    pub fn is_external(&self) -> bool {
        self.r#type.as_deref() == Some(FLOW_TYPE_EXTERNAL)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct MatchRow {
    pub id: i64,
    pub flow_rule_id: i64,
    pub port_in_type: Option<String>,
    pub port_in: Option<String>,
    pub ether_type: Option<String>,
    pub vlan_id: Option<i64>,
    pub vlan_priority: Option<i64>,
    pub source_mac: Option<String>,
    pub dest_mac: Option<String>,
    pub source_ip: Option<String>,
    pub dest_ip: Option<String>,
    pub tos_bits: Option<String>,
    pub source_port: Option<i64>,
    pub dest_port: Option<i64>,
    pub protocol: Option<String>,
}

impl MatchRow {
    /// Rebuilds the in-memory match; `port_in` is handed back verbatim, the
    /// store resolves symbolic references before calling this.
    pub fn to_match(&self, port_in: Option<String>) -> Match {
        Match {
            port_in,
            ether_type: self.ether_type.clone(),
            vlan_id: self.vlan_id.map(|v| v as u16),
            vlan_priority: self.vlan_priority.map(|v| v as u16),
            source_mac: self.source_mac.clone(),
            dest_mac: self.dest_mac.clone(),
            source_ip: self.source_ip.clone(),
            dest_ip: self.dest_ip.clone(),
            tos_bits: self.tos_bits.clone(),
            source_port: self.source_port.map(|v| v as u16),
            dest_port: self.dest_port.map(|v| v as u16),
            protocol: self.protocol.clone(),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ActionRow {
    pub id: i64,
    pub flow_rule_id: i64,
    pub position: i64,
    pub output_type: Option<String>,
    pub output_to_port: Option<String>,
    pub output_to_controller: Option<bool>,
    pub drop_packet: Option<bool>,
    pub set_vlan_id: Option<i64>,
    pub set_vlan_priority: Option<i64>,
    pub push_vlan: Option<i64>,
    pub has_push_vlan: Option<bool>,
    pub pop_vlan: Option<bool>,
    pub set_eth_src: Option<String>,
    pub set_eth_dst: Option<String>,
    pub set_ip_src: Option<String>,
    pub set_ip_dst: Option<String>,
    pub set_ip_tos: Option<String>,
    pub set_l4_src_port: Option<i64>,
    pub set_l4_dst_port: Option<i64>,
    pub output_to_queue: Option<String>,
}

impl ActionRow {
    /// Rebuilds the action variant. `output` overrides the stored
    /// `output_to_port` when the store has resolved a symbolic reference.
    pub fn to_action(&self, output: Option<String>) -> Option<Action> {
        if self.drop_packet == Some(true) {
            return Some(Action::Drop);
        }
        if self.output_to_controller == Some(true) {
            return Some(Action::OutputToController);
        }
        if let Some(q) = &self.output_to_queue {
            return Some(Action::OutputToQueue(q.clone()));
        }
        if self.has_push_vlan == Some(true) {
            return Some(Action::PushVlan(self.push_vlan.map(|v| v as u16)));
        }
        if self.pop_vlan == Some(true) {
            return Some(Action::PopVlan);
        }
        if let Some(vid) = self.set_vlan_id {
            return Some(Action::SetVlanId(vid as u16));
        }
        if let Some(pcp) = self.set_vlan_priority {
            return Some(Action::SetVlanPriority(pcp as u16));
        }
        if let Some(mac) = &self.set_eth_src {
            return Some(Action::SetEthSrc(mac.clone()));
        }
        if let Some(mac) = &self.set_eth_dst {
            return Some(Action::SetEthDst(mac.clone()));
        }
        if let Some(ip) = &self.set_ip_src {
            return Some(Action::SetIpSrc(ip.clone()));
        }
        if let Some(ip) = &self.set_ip_dst {
            return Some(Action::SetIpDst(ip.clone()));
        }
        if let Some(tos) = &self.set_ip_tos {
            return Some(Action::SetIpTos(tos.clone()));
        }
        if let Some(p) = self.set_l4_src_port {
            return Some(Action::SetL4Src(p as u16));
        }
        if let Some(p) = self.set_l4_dst_port {
            return Some(Action::SetL4Dst(p as u16));
        }
        output
            .or_else(|| self.output_to_port.clone())
            .map(Action::Output)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct VnfRow {
    pub id: i64,
    pub graph_vnf_id: String,
    pub session_id: String,
    pub name: String,
    pub template: Option<String>,
    pub functional_capability: Option<String>,
    pub application_name: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct VnfPortRow {
    pub id: i64,
    pub graph_port_id: String,
    pub vnf_id: i64,
    pub name: Option<String>,
}

/// A flow rule with its match, as returned by the collision/busy-vlan
/// probes.
#[derive(Debug, Clone)]
pub struct StoredFlowRule {
    pub rule: FlowRuleRow,
    pub match_rule: MatchRow,
}
