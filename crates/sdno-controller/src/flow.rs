//! Wire representation of one OpenFlow entry.
//!
//! `WireFlow` is the dialect-neutral document built by the realiser from a
//! synthesised match and action list; each client encodes it into its own
//! REST body. Criteria and instructions keep the order they were built in,
//! so the treatment the switch applies follows the action order exactly.

use serde::Serialize;

use sdno_nffg::{Action, Match};

use crate::client::ControllerError;

/// One selector criterion (ONOS naming; ODL re-maps).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum Criterion {
    #[serde(rename = "IN_PORT")]
    InPort { port: String },
    #[serde(rename = "ETH_TYPE")]
    EthType { #[serde(rename = "ethType")] eth_type: String },
    #[serde(rename = "VLAN_VID")]
    VlanVid { #[serde(rename = "vlanId")] vlan_id: u16 },
    #[serde(rename = "VLAN_PCP")]
    VlanPcp { priority: u16 },
    #[serde(rename = "ETH_SRC")]
    EthSrc { mac: String },
    #[serde(rename = "ETH_DST")]
    EthDst { mac: String },
    #[serde(rename = "IPV4_SRC")]
    Ipv4Src { ip: String },
    #[serde(rename = "IPV4_DST")]
    Ipv4Dst { ip: String },
    #[serde(rename = "IP_DSCP")]
    IpDscp { #[serde(rename = "ipDscp")] dscp: String },
    #[serde(rename = "IP_PROTO")]
    IpProto { protocol: String },
    #[serde(rename = "TCP_SRC")]
    TcpSrc { #[serde(rename = "tcpPort")] port: u16 },
    #[serde(rename = "TCP_DST")]
    TcpDst { #[serde(rename = "tcpPort")] port: u16 },
}

/// One treatment instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum Instruction {
    #[serde(rename = "OUTPUT")]
    Output { port: String },
    #[serde(rename = "NOACTION")]
    Drop {},
    #[serde(rename = "L2MODIFICATION")]
    L2 {
        #[serde(flatten)]
        op: L2Op,
    },
    #[serde(rename = "L3MODIFICATION")]
    L3 {
        #[serde(flatten)]
        op: L3Op,
    },
    #[serde(rename = "L4MODIFICATION")]
    L4 {
        #[serde(flatten)]
        op: L4Op,
    },
    #[serde(rename = "QUEUE")]
    Queue { #[serde(rename = "queueId")] queue_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "subtype")]
pub enum L2Op {
    #[serde(rename = "VLAN_PUSH")]
    VlanPush {},
    #[serde(rename = "VLAN_POP")]
    VlanPop {},
    #[serde(rename = "VLAN_ID")]
    VlanId { #[serde(rename = "vlanId")] vlan_id: u16 },
    #[serde(rename = "VLAN_PCP")]
    VlanPcp { #[serde(rename = "vlanPcp")] pcp: u16 },
    #[serde(rename = "ETH_SRC")]
    EthSrc { mac: String },
    #[serde(rename = "ETH_DST")]
    EthDst { mac: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "subtype")]
pub enum L3Op {
    #[serde(rename = "IPV4_SRC")]
    Ipv4Src { ip: String },
    #[serde(rename = "IPV4_DST")]
    Ipv4Dst { ip: String },
    #[serde(rename = "IP_DSCP")]
    IpDscp { #[serde(rename = "ipDscp")] dscp: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "subtype")]
pub enum L4Op {
    #[serde(rename = "TCP_SRC")]
    TcpSrc { #[serde(rename = "tcpPort")] port: u16 },
    #[serde(rename = "TCP_DST")]
    TcpDst { #[serde(rename = "tcpPort")] port: u16 },
}

/// A dialect-neutral flow entry ready to be encoded for a controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WireFlow {
    pub priority: u16,
    #[serde(rename = "isPermanent")]
    pub is_permanent: bool,
    pub selector: Selector,
    pub treatment: Treatment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Selector {
    pub criteria: Vec<Criterion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Treatment {
    pub instructions: Vec<Instruction>,
}

impl WireFlow {
    /// Builds the wire document from a synthesised match and action list.
    ///
    /// The match's `port_in` and any `Output` action must already be
    /// concrete switch ports; symbolic references are a caller bug and
    /// reported as a payload error.
    pub fn build(priority: u16, m: &Match, actions: &[Action]) -> Result<WireFlow, ControllerError> {
        let mut criteria = Vec::new();

        if let Some(port_in) = &m.port_in {
            criteria.push(Criterion::InPort {
                port: port_in.clone(),
            });
        }
        if let Some(vid) = m.vlan_id {
            criteria.push(Criterion::VlanVid { vlan_id: vid });
        }
        if let Some(pcp) = m.vlan_priority {
            criteria.push(Criterion::VlanPcp { priority: pcp });
        }
        if let Some(et) = &m.ether_type {
            criteria.push(Criterion::EthType {
                eth_type: et.clone(),
            });
        }
        if let Some(mac) = &m.source_mac {
            criteria.push(Criterion::EthSrc { mac: mac.clone() });
        }
        if let Some(mac) = &m.dest_mac {
            criteria.push(Criterion::EthDst { mac: mac.clone() });
        }
        if let Some(ip) = &m.source_ip {
            criteria.push(Criterion::Ipv4Src { ip: ip.clone() });
        }
        if let Some(ip) = &m.dest_ip {
            criteria.push(Criterion::Ipv4Dst { ip: ip.clone() });
        }
        if let Some(tos) = &m.tos_bits {
            criteria.push(Criterion::IpDscp { dscp: tos.clone() });
        }
        if let Some(proto) = &m.protocol {
            criteria.push(Criterion::IpProto {
                protocol: proto.clone(),
            });
        }
        if let Some(p) = m.source_port {
            criteria.push(Criterion::TcpSrc { port: p });
        }
        if let Some(p) = m.dest_port {
            criteria.push(Criterion::TcpDst { port: p });
        }

        let mut instructions = Vec::new();
        for action in actions {
            instructions.push(match action {
                Action::Output(port) => Instruction::Output { port: port.clone() },
                Action::Drop => Instruction::Drop {},
                Action::PushVlan(_) => Instruction::L2 { op: L2Op::VlanPush {} },
                Action::PopVlan => Instruction::L2 { op: L2Op::VlanPop {} },
                Action::SetVlanId(vid) => Instruction::L2 {
                    op: L2Op::VlanId { vlan_id: *vid },
                },
                Action::SetVlanPriority(pcp) => Instruction::L2 {
                    op: L2Op::VlanPcp { pcp: *pcp },
                },
                Action::SetEthSrc(mac) => Instruction::L2 {
                    op: L2Op::EthSrc { mac: mac.clone() },
                },
                Action::SetEthDst(mac) => Instruction::L2 {
                    op: L2Op::EthDst { mac: mac.clone() },
                },
                Action::SetIpSrc(ip) => Instruction::L3 {
                    op: L3Op::Ipv4Src { ip: ip.clone() },
                },
                Action::SetIpDst(ip) => Instruction::L3 {
                    op: L3Op::Ipv4Dst { ip: ip.clone() },
                },
                Action::SetIpTos(tos) => Instruction::L3 {
                    op: L3Op::IpDscp { dscp: tos.clone() },
                },
                Action::SetL4Src(p) => Instruction::L4 {
                    op: L4Op::TcpSrc { port: *p },
                },
                Action::SetL4Dst(p) => Instruction::L4 {
                    op: L4Op::TcpDst { port: *p },
                },
                Action::OutputToQueue(q) => Instruction::Queue {
                    queue_id: q.clone(),
                },
                Action::OutputToController => Instruction::Output {
                    port: "CONTROLLER".to_string(),
                },
            });
        }

        Ok(WireFlow {
            priority,
            is_permanent: true,
            selector: Selector { criteria },
            treatment: Treatment { instructions },
        })
    }

    /// The output port of this flow, when it has one.
    pub fn output_port(&self) -> Option<&str> {
        self.treatment.instructions.iter().find_map(|i| match i {
            Instruction::Output { port } => Some(port.as_str()),
            _ => None,
        })
    }

    /// The VLAN id this flow matches on, when present.
    pub fn match_vlan(&self) -> Option<u16> {
        self.selector.criteria.iter().find_map(|c| match c {
            Criterion::VlanVid { vlan_id } => Some(*vlan_id),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_build_selector_and_treatment() {
        let m = Match {
            port_in: Some("1".to_string()),
            vlan_id: Some(280),
            ..Default::default()
        };
        let actions = vec![
            Action::PopVlan,
            Action::Output("2".to_string()),
        ];
        let flow = WireFlow::build(10, &m, &actions).unwrap();
        assert_eq!(flow.selector.criteria.len(), 2);
        assert_eq!(flow.output_port(), Some("2"));
        assert_eq!(flow.match_vlan(), Some(280));

        let json = serde_json::to_value(&flow).unwrap();
        assert_eq!(json["selector"]["criteria"][0]["type"], "IN_PORT");
        assert_eq!(json["selector"]["criteria"][1]["vlanId"], 280);
        assert_eq!(json["treatment"]["instructions"][0]["type"], "L2MODIFICATION");
        assert_eq!(json["treatment"]["instructions"][0]["subtype"], "VLAN_POP");
        assert_eq!(json["treatment"]["instructions"][1]["type"], "OUTPUT");
    }

    #[test]
    fn test_push_then_set_orders_instructions() {
        let m = Match::from_port("7");
        let actions = vec![
            Action::PushVlan(None),
            Action::SetVlanId(62),
            Action::Output("3".to_string()),
        ];
        let flow = WireFlow::build(5, &m, &actions).unwrap();
        let kinds: Vec<String> = flow
            .treatment
            .instructions
            .iter()
            .map(|i| serde_json::to_value(i).unwrap()["subtype"]
                .as_str()
                .unwrap_or("OUTPUT")
                .to_string())
            .collect();
        assert_eq!(kinds, vec!["VLAN_PUSH", "VLAN_ID", "OUTPUT"]);
    }
}
