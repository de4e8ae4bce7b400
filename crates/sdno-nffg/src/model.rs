//! Core NF-FG types.
//!
//! Endpoint kinds and entity statuses are closed enums; actions are tagged
//! variants rather than a bag of optional fields, so the realiser can match
//! on them without null checks.

use serde::{Deserialize, Serialize};

/// Lifecycle marker attached to graph entities during an update.
///
/// A freshly parsed graph carries no statuses; `Nffg::diff` fills them in
/// when reconciling a submitted graph against the deployed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    New,
    AlreadyDeployed,
    ToBeDeleted,
    ToBeUpdated,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::New => "new",
            EntityStatus::AlreadyDeployed => "already_deployed",
            EntityStatus::ToBeDeleted => "to_be_deleted",
            EntityStatus::ToBeUpdated => "to_be_updated",
        }
    }
}

/// Attachment-point flavour of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointKind {
    Interface,
    Vlan,
    GreTunnel,
}

impl EndpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::Interface => "interface",
            EndpointKind::Vlan => "vlan",
            EndpointKind::GreTunnel => "gre-tunnel",
        }
    }
}

/// A named attachment point on a switch.
///
/// `node_id`/`interface` locate the port; `vlan_id` is the tenant-facing tag
/// for `Vlan` endpoints; the `local_ip`/`remote_ip`/`gre_key` triple belongs
/// to `GreTunnel` endpoints, which the realiser rewrites to `Interface`
/// endpoints once the tunnel port exists on the GRE bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: EndpointKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gre_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EntityStatus>,
    /// Database row id, filled in once the endpoint is persisted.
    #[serde(skip)]
    pub db_id: Option<i64>,
}

impl Endpoint {
    pub fn interface_on(id: impl Into<String>, node_id: impl Into<String>, iface: impl Into<String>) -> Self {
        Endpoint {
            id: id.into(),
            name: None,
            kind: EndpointKind::Interface,
            node_id: Some(node_id.into()),
            interface: Some(iface.into()),
            vlan_id: None,
            local_ip: None,
            remote_ip: None,
            gre_key: None,
            ttl: None,
            status: None,
            db_id: None,
        }
    }

    pub fn vlan_on(
        id: impl Into<String>,
        node_id: impl Into<String>,
        iface: impl Into<String>,
        vlan_id: u16,
    ) -> Self {
        let mut ep = Self::interface_on(id, node_id, iface);
        ep.kind = EndpointKind::Vlan;
        ep.vlan_id = Some(vlan_id);
        ep
    }

    /// Equality over the user-supplied fields, ignoring status and db id.
    pub fn same_definition(&self, other: &Endpoint) -> bool {
        self.id == other.id
            && self.kind == other.kind
            && self.node_id == other.node_id
            && self.interface == other.interface
            && self.vlan_id == other.vlan_id
            && self.local_ip == other.local_ip
            && self.remote_ip == other.remote_ip
            && self.gre_key == other.gre_key
    }
}

/// Packet header match of a flow rule.
///
/// `port_in` is symbolic in logical rules (`endpoint:<gid>`,
/// `vnf:<vnf>:<port>`) and a concrete switch port in synthesised externals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Match {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_in: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ether_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_priority: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tos_bits: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

impl Match {
    pub fn from_port(port_in: impl Into<String>) -> Self {
        Match {
            port_in: Some(port_in.into()),
            ..Default::default()
        }
    }
}

/// One flow-rule action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Forward to a port; symbolic (`endpoint:<gid>`) in logical rules.
    Output(String),
    OutputToController,
    OutputToQueue(String),
    Drop,
    /// Push a VLAN header. Carries the service tag when the tenant asked for
    /// one; synthesised transport pushes carry `None` and are followed by a
    /// `SetVlanId`.
    PushVlan(Option<u16>),
    SetVlanId(u16),
    SetVlanPriority(u16),
    PopVlan,
    SetEthSrc(String),
    SetEthDst(String),
    SetIpSrc(String),
    SetIpDst(String),
    SetIpTos(String),
    SetL4Src(u16),
    SetL4Dst(u16),
}

impl Action {
    pub fn output(&self) -> Option<&str> {
        match self {
            Action::Output(port) => Some(port.as_str()),
            _ => None,
        }
    }

    pub fn is_drop(&self) -> bool {
        matches!(self, Action::Drop)
    }
}

/// A logical flow rule between symbolic endpoints, or (with `internal_id`
/// set) one physical OpenFlow entry synthesised from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRule {
    pub id: String,
    pub priority: u16,
    #[serde(rename = "match")]
    pub match_rule: Match,
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EntityStatus>,
    /// Per-switch physical flow name, only on `external` rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_id: Option<String>,
    #[serde(skip)]
    pub db_id: Option<i64>,
}

impl FlowRule {
    pub fn new(id: impl Into<String>, priority: u16, match_rule: Match, actions: Vec<Action>) -> Self {
        FlowRule {
            id: id.into(),
            priority,
            match_rule,
            actions,
            status: None,
            internal_id: None,
            db_id: None,
        }
    }

    /// The single output action of the rule, if any.
    pub fn output_action(&self) -> Option<&str> {
        self.actions.iter().find_map(|a| a.output())
    }

    pub fn has_drop(&self) -> bool {
        self.actions.iter().any(Action::is_drop)
    }

    /// Equality over the user-supplied fields, ignoring status and ids
    /// assigned at deployment time.
    pub fn same_definition(&self, other: &FlowRule) -> bool {
        self.id == other.id
            && self.priority == other.priority
            && self.match_rule == other.match_rule
            && self.actions == other.actions
    }
}

/// Port of a VNF, referenced by flow rules as `vnf:<vnf-id>:<port-id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VnfPort {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip)]
    pub db_id: Option<i64>,
}

/// A logical network function, realised by a controller-hosted application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vnf {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Capability label matched (case-insensitively) against the domain
    /// description to pick the implementing application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub functional_capability: Option<String>,
    #[serde(default)]
    pub ports: Vec<VnfPort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EntityStatus>,
    #[serde(skip)]
    pub db_id: Option<i64>,
}

impl Vnf {
    /// The capability label used for application lookup.
    pub fn capability(&self) -> &str {
        self.functional_capability.as_deref().unwrap_or(&self.name)
    }

    pub fn same_definition(&self, other: &Vnf) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.template == other.template
            && self.functional_capability == other.functional_capability
            && self.ports.len() == other.ports.len()
            && self
                .ports
                .iter()
                .zip(other.ports.iter())
                .all(|(a, b)| a.id == b.id && a.name == b.name)
    }
}

/// A parsed symbolic port reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortRef {
    /// `endpoint:<graph-endpoint-id>`
    Endpoint(String),
    /// `vnf:<vnf-id>:<port-id>`
    VnfPort { vnf_id: String, port_id: String },
}

impl PortRef {
    /// Parses `endpoint:<gid>` and `vnf:<vnf>:<port>` references; anything
    /// else (including concrete port numbers) yields `None`.
    pub fn parse(s: &str) -> Option<PortRef> {
        let mut parts = s.splitn(3, ':');
        match parts.next()? {
            "endpoint" => parts.next().map(|gid| PortRef::Endpoint(gid.to_string())),
            "vnf" => {
                let vnf_id = parts.next()?.to_string();
                let port_id = parts.next()?.to_string();
                Some(PortRef::VnfPort { vnf_id, port_id })
            }
            _ => None,
        }
    }

    pub fn endpoint_id(s: &str) -> Option<String> {
        match PortRef::parse(s)? {
            PortRef::Endpoint(gid) => Some(gid),
            _ => None,
        }
    }
}

/// A whole forwarding graph as submitted by the upper layers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Nffg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "end-points", default)]
    pub end_points: Vec<Endpoint>,
    #[serde(rename = "flow-rules", default)]
    pub flow_rules: Vec<FlowRule>,
    #[serde(rename = "VNFs", default)]
    pub vnfs: Vec<Vnf>,
}

impl Nffg {
    pub fn endpoint(&self, gid: &str) -> Option<&Endpoint> {
        self.end_points.iter().find(|ep| ep.id == gid)
    }

    pub fn endpoint_mut(&mut self, gid: &str) -> Option<&mut Endpoint> {
        self.end_points.iter_mut().find(|ep| ep.id == gid)
    }

    pub fn vnf(&self, gid: &str) -> Option<&Vnf> {
        self.vnfs.iter().find(|v| v.id == gid)
    }

    pub fn flow_rule(&self, gid: &str) -> Option<&FlowRule> {
        self.flow_rules.iter().find(|fr| fr.id == gid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_port_ref_parse() {
        assert_eq!(
            PortRef::parse("endpoint:ep1"),
            Some(PortRef::Endpoint("ep1".to_string()))
        );
        assert_eq!(
            PortRef::parse("vnf:fw:port0"),
            Some(PortRef::VnfPort {
                vnf_id: "fw".to_string(),
                port_id: "port0".to_string()
            })
        );
        assert_eq!(PortRef::parse("3"), None);
        assert_eq!(PortRef::parse("endpoint:"), Some(PortRef::Endpoint(String::new())));
        assert_eq!(PortRef::endpoint_id("vnf:fw:port0"), None);
    }

    #[test]
    fn test_flow_rule_output_action() {
        let fr = FlowRule::new(
            "f1",
            100,
            Match::from_port("endpoint:a"),
            vec![Action::SetVlanId(5), Action::Output("endpoint:b".to_string())],
        );
        assert_eq!(fr.output_action(), Some("endpoint:b"));
        assert!(!fr.has_drop());
    }

    #[test]
    fn test_nffg_json_round_trip() {
        let nffg = Nffg {
            id: Some("g1".to_string()),
            name: Some("demo".to_string()),
            description: None,
            end_points: vec![
                Endpoint::interface_on("a", "of:0000000000000001", "eth1"),
                Endpoint::vlan_on("b", "of:0000000000000002", "eth2", 25),
            ],
            flow_rules: vec![FlowRule::new(
                "f1",
                10,
                Match::from_port("endpoint:a"),
                vec![Action::Output("endpoint:b".to_string())],
            )],
            vnfs: vec![],
        };
        let json = serde_json::to_string(&nffg).unwrap();
        let back: Nffg = serde_json::from_str(&json).unwrap();
        assert_eq!(nffg, back);
    }

    #[test]
    fn test_endpoint_kind_serde_names() {
        let json = serde_json::to_value(EndpointKind::GreTunnel).unwrap();
        assert_eq!(json, serde_json::json!("gre-tunnel"));
        let json = serde_json::to_value(EntityStatus::AlreadyDeployed).unwrap();
        assert_eq!(json, serde_json::json!("already_deployed"));
    }
}
