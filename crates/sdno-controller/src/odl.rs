//! OpenDaylight REST dialect.
//!
//! Flows are named resources under the config datastore
//! (`/restconf/config/opendaylight-inventory:nodes/node/{sw}/table/0/flow/{name}`),
//! which makes create/delete symmetric: the caller-chosen flow name is the
//! controller-side identifier. Topology comes from the operational
//! `network-topology` model; applications are Karaf features toggled through
//! the same restconf surface.

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::client::{
    ControllerClient, ControllerError, Device, DevicePort, GreTunnelPort, Link, OdlVersion,
};
use crate::flow::{Instruction, L2Op, L3Op, L4Op, WireFlow};

pub struct OdlClient {
    http: Client,
    endpoint: String,
    username: String,
    password: String,
    #[allow(dead_code)]
    version: OdlVersion,
}

#[derive(Deserialize)]
struct TopologyDoc {
    #[serde(rename = "network-topology")]
    network_topology: NetworkTopology,
}

#[derive(Deserialize)]
struct NetworkTopology {
    topology: Vec<Topology>,
}

#[derive(Deserialize, Default)]
struct Topology {
    #[serde(default)]
    node: Vec<TopoNode>,
    #[serde(default)]
    link: Vec<TopoLink>,
}

#[derive(Deserialize)]
struct TopoNode {
    #[serde(rename = "node-id")]
    node_id: String,
    #[serde(rename = "termination-point", default)]
    termination_points: Vec<TerminationPoint>,
}

#[derive(Deserialize)]
struct TerminationPoint {
    #[serde(rename = "tp-id")]
    tp_id: String,
}

#[derive(Deserialize)]
struct TopoLink {
    source: LinkEnd,
    destination: DestLinkEnd,
}

#[derive(Deserialize)]
struct LinkEnd {
    #[serde(rename = "source-node")]
    node: String,
    #[serde(rename = "source-tp")]
    tp: String,
}

#[derive(Deserialize)]
struct DestLinkEnd {
    #[serde(rename = "dest-node")]
    node: String,
    #[serde(rename = "dest-tp")]
    tp: String,
}

/// `openflow:1:2` -> port `2`.
fn tp_port(tp_id: &str) -> String {
    tp_id.rsplit(':').next().unwrap_or(tp_id).to_string()
}

impl OdlClient {
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        version: OdlVersion,
    ) -> Self {
        OdlClient {
            http: Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            version,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn check(&self, response: Response) -> Result<Response, ControllerError> {
        let status = response.status();
        let url = response.url().to_string();
        debug!(%url, status = status.as_u16(), "controller response");
        if status.is_success() {
            Ok(response)
        } else {
            Err(ControllerError::Http {
                status: status.as_u16(),
                url,
            })
        }
    }

    async fn fetch_topology(&self) -> Result<Topology, ControllerError> {
        let url = self.url("/restconf/operational/network-topology:network-topology");
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .send()
            .await?;
        let response = self.check(response).await?;
        let doc: TopologyDoc = response.json().await?;
        doc.network_topology
            .topology
            .into_iter()
            .next()
            .ok_or_else(|| ControllerError::payload(url, "empty topology list"))
    }

    /// Encodes a `WireFlow` into the flow-node-inventory document.
    fn encode_flow(flow: &WireFlow, flow_name: &str) -> serde_json::Value {
        let mut m = serde_json::Map::new();
        for criterion in &flow.selector.criteria {
            use crate::flow::Criterion::*;
            match criterion {
                InPort { port } => {
                    m.insert("in-port".into(), json!(port));
                }
                EthType { eth_type } => {
                    m.insert(
                        "ethernet-match".into(),
                        json!({ "ethernet-type": { "type": eth_type } }),
                    );
                }
                VlanVid { vlan_id } => {
                    m.insert(
                        "vlan-match".into(),
                        json!({ "vlan-id": { "vlan-id": vlan_id, "vlan-id-present": true } }),
                    );
                }
                VlanPcp { priority } => {
                    m.insert("vlan-pcp".into(), json!(priority));
                }
                EthSrc { mac } => {
                    m.insert(
                        "ethernet-source".into(),
                        json!({ "address": mac }),
                    );
                }
                EthDst { mac } => {
                    m.insert(
                        "ethernet-destination".into(),
                        json!({ "address": mac }),
                    );
                }
                Ipv4Src { ip } => {
                    m.insert("ipv4-source".into(), json!(ip));
                }
                Ipv4Dst { ip } => {
                    m.insert("ipv4-destination".into(), json!(ip));
                }
                IpDscp { dscp } => {
                    m.insert("ip-match".into(), json!({ "ip-dscp": dscp }));
                }
                IpProto { protocol } => {
                    m.insert("protocol-match".into(), json!(protocol));
                }
                TcpSrc { port } => {
                    m.insert("tcp-source-port".into(), json!(port));
                }
                TcpDst { port } => {
                    m.insert("tcp-destination-port".into(), json!(port));
                }
            }
        }

        let mut actions = Vec::new();
        for (order, instruction) in flow.treatment.instructions.iter().enumerate() {
            let action = match instruction {
                Instruction::Output { port } => {
                    json!({ "order": order, "output-action": { "output-node-connector": port } })
                }
                Instruction::Drop {} => json!({ "order": order, "drop-action": {} }),
                Instruction::L2 { op } => match op {
                    L2Op::VlanPush {} => json!({
                        "order": order,
                        "push-vlan-action": { "ethernet-type": 33024 }
                    }),
                    L2Op::VlanPop {} => json!({ "order": order, "pop-vlan-action": {} }),
                    L2Op::VlanId { vlan_id } => json!({
                        "order": order,
                        "set-field": { "vlan-match": { "vlan-id": { "vlan-id": vlan_id, "vlan-id-present": true } } }
                    }),
                    L2Op::VlanPcp { pcp } => json!({
                        "order": order,
                        "set-field": { "vlan-match": { "vlan-pcp": pcp } }
                    }),
                    L2Op::EthSrc { mac } => json!({
                        "order": order,
                        "set-dl-src-action": { "address": mac }
                    }),
                    L2Op::EthDst { mac } => json!({
                        "order": order,
                        "set-dl-dst-action": { "address": mac }
                    }),
                },
                Instruction::L3 { op } => match op {
                    L3Op::Ipv4Src { ip } => json!({
                        "order": order,
                        "set-nw-src-action": { "ipv4-address": ip }
                    }),
                    L3Op::Ipv4Dst { ip } => json!({
                        "order": order,
                        "set-nw-dst-action": { "ipv4-address": ip }
                    }),
                    L3Op::IpDscp { dscp } => json!({
                        "order": order,
                        "set-nw-tos-action": { "tos": dscp }
                    }),
                },
                Instruction::L4 { op } => match op {
                    L4Op::TcpSrc { port } => json!({
                        "order": order,
                        "set-tp-src-action": { "port": port }
                    }),
                    L4Op::TcpDst { port } => json!({
                        "order": order,
                        "set-tp-dst-action": { "port": port }
                    }),
                },
                Instruction::Queue { queue_id } => json!({
                    "order": order,
                    "set-queue-action": { "queue-id": queue_id }
                }),
            };
            actions.push(action);
        }

        json!({
            "flow": [{
                "id": flow_name,
                "flow-name": flow_name,
                "table_id": 0,
                "priority": flow.priority,
                "hard-timeout": 0,
                "idle-timeout": 0,
                "match": serde_json::Value::Object(m),
                "instructions": {
                    "instruction": [{
                        "order": 0,
                        "apply-actions": { "action": actions }
                    }]
                }
            }]
        })
    }
}

#[async_trait]
impl ControllerClient for OdlClient {
    async fn list_devices(&self) -> Result<Vec<Device>, ControllerError> {
        let topo = self.fetch_topology().await?;
        Ok(topo
            .node
            .into_iter()
            .map(|n| Device {
                id: n.node_id,
                available: true,
            })
            .collect())
    }

    async fn list_links(&self) -> Result<Vec<Link>, ControllerError> {
        let topo = self.fetch_topology().await?;
        Ok(topo
            .link
            .into_iter()
            .map(|l| Link {
                src_device: l.source.node,
                src_port: tp_port(&l.source.tp),
                dst_device: l.destination.node,
                dst_port: tp_port(&l.destination.tp),
            })
            .collect())
    }

    async fn list_device_ports(&self, switch_id: &str) -> Result<Vec<DevicePort>, ControllerError> {
        let topo = self.fetch_topology().await?;
        let node = topo
            .node
            .into_iter()
            .find(|n| n.node_id == switch_id)
            .ok_or_else(|| {
                ControllerError::payload(
                    "network-topology",
                    format!("switch {switch_id} not in topology"),
                )
            })?;
        Ok(node
            .termination_points
            .into_iter()
            .map(|tp| DevicePort {
                number: tp_port(&tp.tp_id),
                name: Some(tp.tp_id),
            })
            .collect())
    }

    async fn create_flow(
        &self,
        switch_id: &str,
        flow_name: &str,
        flow: &WireFlow,
    ) -> Result<(), ControllerError> {
        let path = format!(
            "/restconf/config/opendaylight-inventory:nodes/node/{switch_id}/table/0/flow/{flow_name}"
        );
        let body = Self::encode_flow(flow, flow_name);
        let response = self
            .http
            .put(self.url(&path))
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await?;
        self.check(response).await.map(|_| ())
    }

    async fn delete_flow(&self, switch_id: &str, flow_name: &str) -> Result<(), ControllerError> {
        let path = format!(
            "/restconf/config/opendaylight-inventory:nodes/node/{switch_id}/table/0/flow/{flow_name}"
        );
        let response = self
            .http
            .delete(self.url(&path))
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .send()
            .await?;
        self.check(response).await.map(|_| ())
    }

    async fn activate_app(&self, app_name: &str) -> Result<(), ControllerError> {
        let path = "/restconf/operations/feature:install-feature";
        let body = json!({ "input": { "name": app_name } });
        let response = self
            .http
            .post(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await?;
        self.check(response).await.map(|_| ())
    }

    async fn deactivate_app(&self, app_name: &str) -> Result<(), ControllerError> {
        let path = "/restconf/operations/feature:uninstall-feature";
        let body = json!({ "input": { "name": app_name } });
        let response = self
            .http
            .post(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await?;
        self.check(response).await.map(|_| ())
    }

    async fn is_app_active(&self, app_name: &str) -> Result<bool, ControllerError> {
        let path = format!("/restconf/operational/feature:features/feature/{app_name}");
        let response = self
            .http
            .get(self.url(&path))
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .send()
            .await?;
        match self.check(response).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn push_app_configuration(
        &self,
        app_name: &str,
        config: &serde_json::Value,
    ) -> Result<(), ControllerError> {
        let path = format!("/restconf/config/{app_name}:configuration");
        let response = self
            .http
            .put(self.url(&path))
            .basic_auth(&self.username, Some(&self.password))
            .json(config)
            .send()
            .await?;
        self.check(response).await.map(|_| ())
    }

    async fn add_gre_tunnel(
        &self,
        bridge: &str,
        port_name: &str,
        local_ip: &str,
        remote_ip: &str,
        gre_key: Option<&str>,
    ) -> Result<GreTunnelPort, ControllerError> {
        let path = format!(
            "/restconf/config/network-topology:network-topology/topology/ovsdb:1/node/{bridge}/termination-point/{port_name}"
        );
        let mut options = vec![
            json!({ "ovsdb:option": "local_ip", "value": local_ip }),
            json!({ "ovsdb:option": "remote_ip", "value": remote_ip }),
        ];
        if let Some(key) = gre_key {
            options.push(json!({ "ovsdb:option": "key", "value": key }));
        }
        let body = json!({
            "network-topology:termination-point": [{
                "ovsdb:name": port_name,
                "tp-id": port_name,
                "ovsdb:interface-type": "ovsdb:interface-type-gre",
                "ovsdb:options": options,
            }]
        });
        let response = self
            .http
            .put(self.url(&path))
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await?;
        self.check(response).await?;
        Ok(GreTunnelPort {
            bridge_id: bridge.to_string(),
            port_name: port_name.to_string(),
        })
    }

    async fn delete_gre_tunnel(
        &self,
        bridge: &str,
        port_name: &str,
    ) -> Result<(), ControllerError> {
        let path = format!(
            "/restconf/config/network-topology:network-topology/topology/ovsdb:1/node/{bridge}/termination-point/{port_name}"
        );
        let response = self
            .http
            .delete(self.url(&path))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        self.check(response).await.map(|_| ())
    }

    async fn add_port(&self, bridge: &str, port_name: &str) -> Result<(), ControllerError> {
        let path = format!(
            "/restconf/config/network-topology:network-topology/topology/ovsdb:1/node/{bridge}/termination-point/{port_name}"
        );
        let body = json!({
            "network-topology:termination-point": [{
                "ovsdb:name": port_name,
                "tp-id": port_name,
            }]
        });
        let response = self
            .http
            .put(self.url(&path))
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await?;
        self.check(response).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdno_nffg::{Action, Match};

    #[test]
    fn test_tp_port_extraction() {
        assert_eq!(tp_port("openflow:1:2"), "2");
        assert_eq!(tp_port("eth0"), "eth0");
    }

    #[test]
    fn test_encode_flow_shape() {
        let m = Match {
            port_in: Some("1".to_string()),
            vlan_id: Some(280),
            ..Default::default()
        };
        let wire = WireFlow::build(
            20,
            &m,
            &[Action::PopVlan, Action::Output("2".to_string())],
        )
        .unwrap();
        let doc = OdlClient::encode_flow(&wire, "f1_0");
        let flow = &doc["flow"][0];
        assert_eq!(flow["id"], "f1_0");
        assert_eq!(flow["priority"], 20);
        assert_eq!(flow["match"]["in-port"], "1");
        assert_eq!(
            flow["match"]["vlan-match"]["vlan-id"]["vlan-id"],
            280
        );
        let actions = &flow["instructions"]["instruction"][0]["apply-actions"]["action"];
        assert!(actions[0].get("pop-vlan-action").is_some());
        assert_eq!(actions[1]["output-action"]["output-node-connector"], "2");
    }

    #[test]
    fn test_topology_doc_parsing() {
        let body = r#"{
            "network-topology": { "topology": [ {
                "topology-id": "flow:1",
                "node": [
                    {"node-id": "openflow:1",
                     "termination-point": [{"tp-id": "openflow:1:1"}, {"tp-id": "openflow:1:2"}]}
                ],
                "link": [
                    {"link-id": "l1",
                     "source": {"source-node": "openflow:1", "source-tp": "openflow:1:2"},
                     "destination": {"dest-node": "openflow:2", "dest-tp": "openflow:2:1"}}
                ]
            } ] }
        }"#;
        let doc: TopologyDoc = serde_json::from_str(body).unwrap();
        let topo = &doc.network_topology.topology[0];
        assert_eq!(topo.node[0].termination_points.len(), 2);
        assert_eq!(tp_port(&topo.link[0].source.tp), "2");
    }
}
