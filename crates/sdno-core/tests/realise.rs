//! End-to-end realisation tests against a recording mock controller and an
//! in-memory store.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::RwLock;

use sdno_controller::{
    ControllerClient, ControllerError, Device, DevicePort, GreTunnelPort, Link, TopologyProvider,
    WireFlow,
};
use sdno_core::{Config, DoError, DomainInfo, FunctionalCapability, SessionCoordinator};
use sdno_nffg::{Action, Endpoint, FlowRule, Match, Nffg, Vnf, VnfPort};
use sdno_store::{GraphStore, SessionStatus};

/// Recording controller over a fixed inventory.
#[derive(Default)]
struct MockController {
    devices: Vec<Device>,
    links: Vec<Link>,
    ports: HashMap<String, Vec<DevicePort>>,
    created: Mutex<Vec<(String, String, WireFlow)>>,
    deleted: Mutex<Vec<(String, String)>>,
    active_apps: Mutex<HashSet<String>>,
    configs: Mutex<Vec<(String, serde_json::Value)>>,
    gre_tunnels: Mutex<Vec<(String, String)>>,
    deleted_gre_tunnels: Mutex<Vec<(String, String)>>,
    added_ports: Mutex<Vec<(String, String)>>,
    fail_create_on: Option<String>,
}

impl MockController {
    fn device(mut self, id: &str, ports: &[(&str, &str)]) -> Self {
        self.devices.push(Device {
            id: id.to_string(),
            available: true,
        });
        self.ports.insert(
            id.to_string(),
            ports
                .iter()
                .map(|(number, name)| DevicePort {
                    number: number.to_string(),
                    name: Some(name.to_string()),
                })
                .collect(),
        );
        self
    }

    fn link(mut self, src: &str, src_port: &str, dst: &str, dst_port: &str) -> Self {
        self.links.push(Link {
            src_device: src.to_string(),
            src_port: src_port.to_string(),
            dst_device: dst.to_string(),
            dst_port: dst_port.to_string(),
        });
        self
    }

    fn fail_create_on(mut self, switch: &str) -> Self {
        self.fail_create_on = Some(switch.to_string());
        self
    }

    fn created(&self) -> Vec<(String, String, WireFlow)> {
        self.created.lock().unwrap().clone()
    }

    fn deleted(&self) -> Vec<(String, String)> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ControllerClient for MockController {
    async fn list_devices(&self) -> Result<Vec<Device>, ControllerError> {
        Ok(self.devices.clone())
    }

    async fn list_links(&self) -> Result<Vec<Link>, ControllerError> {
        Ok(self.links.clone())
    }

    async fn list_device_ports(&self, switch_id: &str) -> Result<Vec<DevicePort>, ControllerError> {
        Ok(self.ports.get(switch_id).cloned().unwrap_or_default())
    }

    async fn create_flow(
        &self,
        switch_id: &str,
        flow_name: &str,
        flow: &WireFlow,
    ) -> Result<(), ControllerError> {
        if self.fail_create_on.as_deref() == Some(switch_id) {
            return Err(ControllerError::Http {
                status: 500,
                url: format!("mock://flows/{switch_id}"),
            });
        }
        self.created.lock().unwrap().push((
            switch_id.to_string(),
            flow_name.to_string(),
            flow.clone(),
        ));
        Ok(())
    }

    async fn delete_flow(&self, switch_id: &str, flow_name: &str) -> Result<(), ControllerError> {
        self.deleted
            .lock()
            .unwrap()
            .push((switch_id.to_string(), flow_name.to_string()));
        Ok(())
    }

    async fn activate_app(&self, app_name: &str) -> Result<(), ControllerError> {
        self.active_apps.lock().unwrap().insert(app_name.to_string());
        Ok(())
    }

    async fn deactivate_app(&self, app_name: &str) -> Result<(), ControllerError> {
        self.active_apps.lock().unwrap().remove(app_name);
        Ok(())
    }

    async fn is_app_active(&self, app_name: &str) -> Result<bool, ControllerError> {
        Ok(self.active_apps.lock().unwrap().contains(app_name))
    }

    async fn push_app_configuration(
        &self,
        app_name: &str,
        config: &serde_json::Value,
    ) -> Result<(), ControllerError> {
        self.configs
            .lock()
            .unwrap()
            .push((app_name.to_string(), config.clone()));
        Ok(())
    }

    async fn add_gre_tunnel(
        &self,
        bridge: &str,
        port_name: &str,
        _local_ip: &str,
        _remote_ip: &str,
        _gre_key: Option<&str>,
    ) -> Result<GreTunnelPort, ControllerError> {
        self.gre_tunnels
            .lock()
            .unwrap()
            .push((bridge.to_string(), port_name.to_string()));
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
        self.deleted_gre_tunnels
            .lock()
            .unwrap()
            .push((bridge.to_string(), port_name.to_string()));
        Ok(())
    }

    async fn add_port(&self, bridge: &str, port_name: &str) -> Result<(), ControllerError> {
        self.added_ports
            .lock()
            .unwrap()
            .push((bridge.to_string(), port_name.to_string()));
        Ok(())
    }
}

/// s1(eth1=1, eth2=2, eth3=3) --(3:3)-- s2(eth1=1, eth2=2, eth3=3),
/// plus the GRE bridge br-gre(gre0=7) hanging off s1 port 4.
fn two_switch_mock() -> MockController {
    MockController::default()
        .device("s1", &[("1", "eth1"), ("2", "eth2"), ("3", "eth3"), ("4", "eth4")])
        .device("s2", &[("1", "eth1"), ("2", "eth2"), ("3", "eth3")])
        .device("br-gre", &[("4", "eth4"), ("7", "gre0"), ("8", "gre1")])
        .link("s1", "3", "s2", "3")
        .link("s1", "4", "br-gre", "4")
}

fn test_config() -> Config {
    Config::from_yaml(
        r#"
domain_orchestrator:
  ip: 127.0.0.1
  port: 9000
  detached_mode: false
vlan:
  available_ids: "280-289,62"
network_controller:
  controller_name: onos
onos:
  endpoint: http://127.0.0.1:8181
  username: onos
  password: rocks
  version: "1.x"
ovsdb:
  ovsdb_support: true
domain_description:
  domain_description_file: description.json
  domain_description_dynamic_file: description_dynamic.json
database:
  connection: "sqlite::memory:"
"#,
    )
    .unwrap()
}

fn test_domain_info() -> DomainInfo {
    let mut info = DomainInfo::default();
    info.capabilities.functional_capabilities.push(FunctionalCapability {
        name: "org.onosproject.dhcp".to_string(),
        capability_type: "dhcp".to_string(),
        template: None,
        ready: true,
    });
    info
}

struct Harness {
    coordinator: SessionCoordinator,
    store: GraphStore,
    controller: Arc<MockController>,
    _tempdir: tempfile::TempDir,
}

async fn harness(controller: MockController) -> Harness {
    harness_with_config(controller, test_config()).await
}

async fn harness_with_config(controller: MockController, config: Config) -> Harness {
    let controller = Arc::new(controller);
    let config = Arc::new(config);
    let store = GraphStore::connect_in_memory().await.unwrap();
    let tempdir = tempfile::tempdir().unwrap();
    let description = Arc::new(sdno_core::ResourceDescription::from_info(
        test_domain_info(),
        tempdir.path().join("description_dynamic.json"),
    ));
    let topology = Arc::new(RwLock::new(TopologyProvider::new(false)));
    let coordinator = SessionCoordinator::new(
        config,
        store.clone(),
        controller.clone(),
        topology,
        description,
        None,
    );
    Harness {
        coordinator,
        store,
        controller,
        _tempdir: tempdir,
    }
}

fn simple_graph(in_switch: &str, in_iface: &str, out_switch: &str, out_iface: &str) -> Nffg {
    Nffg {
        name: Some("demo".to_string()),
        end_points: vec![
            Endpoint::interface_on("a", in_switch, in_iface),
            Endpoint::interface_on("b", out_switch, out_iface),
        ],
        flow_rules: vec![FlowRule::new(
            "f1",
            10,
            Match::from_port("endpoint:a"),
            vec![Action::Output("endpoint:b".to_string())],
        )],
        ..Default::default()
    }
}

fn action_kinds(flow: &WireFlow) -> Vec<String> {
    serde_json::to_value(flow).unwrap()["treatment"]["instructions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| {
            i.get("subtype")
                .or_else(|| i.get("type"))
                .and_then(|v| v.as_str())
                .unwrap()
                .to_string()
        })
        .collect()
}

#[tokio::test]
async fn test_s1_same_switch_interface_endpoints() {
    let h = harness(two_switch_mock()).await;
    let graph_id = h
        .coordinator
        .post_graph(simple_graph("s1", "eth1", "s1", "eth2"), "admin")
        .await
        .unwrap();

    let created = h.controller.created();
    assert_eq!(created.len(), 1);
    let (switch, name, flow) = &created[0];
    assert_eq!(switch, "s1");
    assert_eq!(name, "f1_0");
    let json = serde_json::to_value(flow).unwrap();
    assert_eq!(json["selector"]["criteria"][0]["port"], "1");
    assert_eq!(action_kinds(flow), vec!["OUTPUT"]);
    assert_eq!(flow.output_port(), Some("2"));

    let status = h.coordinator.status_graph(&graph_id, "admin").await.unwrap();
    assert_eq!(status.status, SessionStatus::Complete);
    assert_eq!(status.percentage, 100);
}

#[tokio::test]
async fn test_s2_cross_switch_transport_vlan() {
    let h = harness(two_switch_mock()).await;
    h.coordinator
        .post_graph(simple_graph("s1", "eth1", "s2", "eth1"), "admin")
        .await
        .unwrap();

    let created = h.controller.created();
    assert_eq!(created.len(), 2);

    let (_, name1, first) = &created[0];
    assert_eq!(name1, "f1_0");
    assert_eq!(action_kinds(first), vec!["VLAN_PUSH", "VLAN_ID", "OUTPUT"]);
    assert_eq!(first.output_port(), Some("3"));
    assert_eq!(first.match_vlan(), None);

    let (switch2, name2, second) = &created[1];
    assert_eq!(switch2, "s2");
    assert_eq!(name2, "f1_1");
    // The carrier is the smallest id of the first allowed range.
    assert_eq!(second.match_vlan(), Some(280));
    assert_eq!(action_kinds(second), vec!["VLAN_POP", "OUTPUT"]);
    assert_eq!(second.output_port(), Some("1"));
}

#[tokio::test]
async fn test_s3_collision_is_rejected() {
    let h = harness(two_switch_mock()).await;
    h.coordinator
        .post_graph(simple_graph("s1", "eth1", "s1", "eth2"), "admin")
        .await
        .unwrap();

    // A second graph with the same ingress match on the same switch.
    let err = h
        .coordinator
        .post_graph(simple_graph("s1", "eth1", "s1", "eth3"), "admin")
        .await
        .unwrap_err();
    match err {
        DoError::GraphError(msg) => assert!(msg.contains("collision on switch s1"), "{msg}"),
        other => panic!("expected GraphError, got {other}"),
    }

    // The first graph survives untouched.
    assert_eq!(h.controller.created().len(), 1);
    assert_eq!(h.controller.deleted().len(), 0);
}

#[tokio::test]
async fn test_s5_drop_action_shadows_everything() {
    let h = harness(two_switch_mock()).await;
    let mut nffg = simple_graph("s1", "eth1", "s2", "eth1");
    nffg.flow_rules[0].actions = vec![
        Action::Drop,
        Action::Output("endpoint:b".to_string()),
    ];
    h.coordinator.post_graph(nffg, "admin").await.unwrap();

    let created = h.controller.created();
    assert_eq!(created.len(), 1);
    let (switch, _, flow) = &created[0];
    assert_eq!(switch, "s1");
    assert_eq!(action_kinds(flow), vec!["NOACTION"]);
}

#[tokio::test]
async fn test_s6_unreachable_endpoints() {
    // No link between the switches.
    let mock = MockController::default()
        .device("s1", &[("1", "eth1")])
        .device("s2", &[("1", "eth1")]);
    let h = harness(mock).await;

    let err = h
        .coordinator
        .post_graph(simple_graph("s1", "eth1", "s2", "eth1"), "admin")
        .await
        .unwrap_err();
    assert!(matches!(err, DoError::NoPath { .. }));

    // Rollback leaves no entity rows behind.
    assert!(h.controller.created().is_empty());
    let graphs = h.store.list_graphs().await.unwrap();
    assert!(graphs.is_empty());
}

#[tokio::test]
async fn test_rollback_removes_installed_flows() {
    let h = harness(two_switch_mock().fail_create_on("s2")).await;
    let err = h
        .coordinator
        .post_graph(simple_graph("s1", "eth1", "s2", "eth1"), "admin")
        .await
        .unwrap_err();
    assert!(matches!(err, DoError::Controller(_)));

    // The first hop made it to the switch and was torn down again.
    let created = h.controller.created();
    assert_eq!(created.len(), 1);
    let deleted = h.controller.deleted();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].0, "s1");
    assert_eq!(deleted[0].1, created[0].1);
}

#[tokio::test]
async fn test_round_trip_get_graph() {
    let h = harness(two_switch_mock()).await;
    let graph_id = h
        .coordinator
        .post_graph(simple_graph("s1", "eth1", "s2", "eth1"), "admin")
        .await
        .unwrap();

    let loaded = h.coordinator.get_graph(&graph_id, "admin").await.unwrap();
    assert_eq!(loaded.id.as_deref(), Some(graph_id.as_str()));
    assert_eq!(loaded.end_points.len(), 2);
    // Only the logical rule survives the projection.
    assert_eq!(loaded.flow_rules.len(), 1);
    assert_eq!(loaded.flow_rules[0].id, "f1");
    assert_eq!(
        loaded.flow_rules[0].match_rule.port_in.as_deref(),
        Some("endpoint:a")
    );
}

#[tokio::test]
async fn test_idempotent_update() {
    let h = harness(two_switch_mock()).await;
    let graph_id = h
        .coordinator
        .post_graph(simple_graph("s1", "eth1", "s2", "eth1"), "admin")
        .await
        .unwrap();

    let session = h
        .store
        .active_session("admin", &graph_id, true)
        .await
        .unwrap()
        .unwrap();
    let rows_before = h
        .store
        .flow_rules_by_session(&session.session_id, None)
        .await
        .unwrap()
        .len();
    let flows_before = h.controller.created().len();

    // Re-submitting the identical graph changes nothing.
    h.coordinator
        .put_graph(
            simple_graph("s1", "eth1", "s2", "eth1"),
            &graph_id,
            "admin",
        )
        .await
        .unwrap();

    let rows_after = h
        .store
        .flow_rules_by_session(&session.session_id, None)
        .await
        .unwrap()
        .len();
    assert_eq!(rows_before, rows_after);
    assert_eq!(h.controller.created().len(), flows_before);
    assert!(h.controller.deleted().is_empty());

    let status = h.coordinator.status_graph(&graph_id, "admin").await.unwrap();
    assert_eq!(status.status, SessionStatus::Complete);
}

#[tokio::test]
async fn test_s4_endpoint_change_reinstalls_dependent_flow() {
    let h = harness(two_switch_mock()).await;
    let graph_id = h
        .coordinator
        .post_graph(simple_graph("s1", "eth1", "s2", "eth1"), "admin")
        .await
        .unwrap();
    assert_eq!(h.controller.created().len(), 2);

    // Move endpoint a to eth2.
    h.coordinator
        .put_graph(
            simple_graph("s1", "eth2", "s2", "eth1"),
            &graph_id,
            "admin",
        )
        .await
        .unwrap();

    // The old pair of externals went away and a new pair landed, the first
    // hop now matching the new port.
    assert_eq!(h.controller.deleted().len(), 2);
    let created = h.controller.created();
    assert_eq!(created.len(), 4);
    let reinstalled_first = &created[2].2;
    let json = serde_json::to_value(reinstalled_first).unwrap();
    assert_eq!(json["selector"]["criteria"][0]["port"], "2");
}

#[tokio::test]
async fn test_transport_vlans_unique_per_link() {
    let h = harness(two_switch_mock()).await;

    // Two flows with identical (empty) header tuples crossing the same
    // link; their carriers must differ on s2's ingress port.
    let mut nffg = simple_graph("s1", "eth1", "s2", "eth1");
    nffg.end_points.push(Endpoint::interface_on("c", "s1", "eth2"));
    nffg.end_points.push(Endpoint::interface_on("d", "s2", "eth2"));
    nffg.flow_rules.push(FlowRule::new(
        "f2",
        10,
        Match::from_port("endpoint:c"),
        vec![Action::Output("endpoint:d".to_string())],
    ));
    h.coordinator.post_graph(nffg, "admin").await.unwrap();

    let created = h.controller.created();
    assert_eq!(created.len(), 4);
    let carriers: Vec<u16> = created
        .iter()
        .filter(|(switch, _, flow)| switch == "s2" && flow.match_vlan().is_some())
        .map(|(_, _, flow)| flow.match_vlan().unwrap())
        .collect();
    assert_eq!(carriers.len(), 2);
    assert_ne!(carriers[0], carriers[1]);
}

#[tokio::test]
async fn test_delete_graph_tears_everything_down() {
    let h = harness(two_switch_mock()).await;
    let graph_id = h
        .coordinator
        .post_graph(simple_graph("s1", "eth1", "s2", "eth1"), "admin")
        .await
        .unwrap();

    h.coordinator.delete_graph(&graph_id, "admin").await.unwrap();
    assert_eq!(h.controller.deleted().len(), 2);

    let err = h
        .coordinator
        .get_graph(&graph_id, "admin")
        .await
        .unwrap_err();
    assert!(matches!(err, DoError::SessionNotFound(_)));
}

#[tokio::test]
async fn test_vlan_endpoints_tag_and_untag() {
    let h = harness(two_switch_mock()).await;
    let nffg = Nffg {
        end_points: vec![
            Endpoint::vlan_on("a", "s1", "eth1", 100),
            Endpoint::vlan_on("b", "s2", "eth1", 200),
        ],
        flow_rules: vec![FlowRule::new(
            "f1",
            10,
            Match::from_port("endpoint:a"),
            vec![Action::Output("endpoint:b".to_string())],
        )],
        ..Default::default()
    };
    h.coordinator.post_graph(nffg, "admin").await.unwrap();

    let created = h.controller.created();
    assert_eq!(created.len(), 2);
    // Ingress: match the tenant tag, strip it, push the carrier.
    let first = &created[0].2;
    assert_eq!(first.match_vlan(), Some(100));
    assert_eq!(
        action_kinds(first),
        vec!["VLAN_POP", "VLAN_PUSH", "VLAN_ID", "OUTPUT"]
    );
    // Egress: strip the carrier, tag with the egress endpoint's vlan.
    let second = &created[1].2;
    assert_eq!(
        action_kinds(second),
        vec!["VLAN_POP", "VLAN_PUSH", "VLAN_ID", "OUTPUT"]
    );
}

fn gre_graph() -> Nffg {
    Nffg {
        end_points: vec![
            Endpoint::interface_on("a", "s1", "eth1"),
            Endpoint {
                id: "t".to_string(),
                name: None,
                kind: sdno_nffg::EndpointKind::GreTunnel,
                node_id: None,
                interface: None,
                vlan_id: None,
                local_ip: Some("10.0.0.1".to_string()),
                remote_ip: Some("10.0.0.2".to_string()),
                gre_key: Some("99".to_string()),
                ttl: None,
                status: None,
                db_id: None,
            },
        ],
        flow_rules: vec![FlowRule::new(
            "f1",
            10,
            Match::from_port("endpoint:a"),
            vec![Action::Output("endpoint:t".to_string())],
        )],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_gre_endpoint_is_materialised_and_routed() {
    let h = harness(two_switch_mock()).await;
    h.coordinator.post_graph(gre_graph(), "admin").await.unwrap();

    let tunnels = h.controller.gre_tunnels.lock().unwrap().clone();
    assert_eq!(tunnels.len(), 1);
    assert_eq!(tunnels[0].1, "gre0");

    // Two hops: s1 then the GRE bridge, egress on the tunnel port.
    let created = h.controller.created();
    assert_eq!(created.len(), 2);
    assert_eq!(created[1].0, "br-gre");
    assert_eq!(created[1].2.output_port(), Some("7"));
}

#[tokio::test]
async fn test_detached_vnf_application_lifecycle() {
    let h = harness(two_switch_mock()).await;
    let nffg = Nffg {
        end_points: vec![Endpoint::interface_on("a", "s1", "eth1")],
        flow_rules: vec![
            FlowRule::new(
                "f1",
                10,
                Match::from_port("endpoint:a"),
                vec![Action::Output("vnf:nf1:p0".to_string())],
            ),
            FlowRule::new(
                "f2",
                10,
                Match::from_port("vnf:nf1:p0"),
                vec![Action::Output("endpoint:a".to_string())],
            ),
        ],
        vnfs: vec![Vnf {
            id: "nf1".to_string(),
            name: "dhcp".to_string(),
            template: None,
            functional_capability: Some("dhcp".to_string()),
            ports: vec![VnfPort {
                id: "p0".to_string(),
                name: None,
                db_id: None,
            }],
            status: None,
            db_id: None,
        }],
        ..Default::default()
    };
    let graph_id = h.coordinator.post_graph(nffg, "admin").await.unwrap();

    assert!(h
        .controller
        .active_apps
        .lock()
        .unwrap()
        .contains("org.onosproject.dhcp"));

    let configs = h.controller.configs.lock().unwrap().clone();
    assert_eq!(configs.len(), 1);
    let (app, config) = &configs[0];
    assert_eq!(app, "org.onosproject.dhcp");
    assert_eq!(config["ports"]["p0"]["device-id"], "s1");
    assert_eq!(config["ports"]["p0"]["port-number"], "1");

    // Deleting the graph deactivates the application again.
    h.coordinator.delete_graph(&graph_id, "admin").await.unwrap();
    assert!(!h
        .controller
        .active_apps
        .lock()
        .unwrap()
        .contains("org.onosproject.dhcp"));
}

#[tokio::test]
async fn test_vnf_to_vnf_flows_are_unsupported() {
    let h = harness(two_switch_mock()).await;
    let vnf = |id: &str| Vnf {
        id: id.to_string(),
        name: "dhcp".to_string(),
        template: None,
        functional_capability: Some("dhcp".to_string()),
        ports: vec![VnfPort {
            id: "p0".to_string(),
            name: None,
            db_id: None,
        }],
        status: None,
        db_id: None,
    };
    let nffg = Nffg {
        flow_rules: vec![FlowRule::new(
            "f1",
            10,
            Match::from_port("vnf:nf1:p0"),
            vec![Action::Output("vnf:nf2:p0".to_string())],
        )],
        vnfs: vec![vnf("nf1"), vnf("nf2")],
        ..Default::default()
    };
    let err = h.coordinator.post_graph(nffg, "admin").await.unwrap_err();
    assert!(matches!(err, DoError::UnsupportedFeature(_)));
}

#[tokio::test]
async fn test_unknown_capability_is_rejected() {
    let h = harness(two_switch_mock()).await;
    let nffg = Nffg {
        vnfs: vec![Vnf {
            id: "nf1".to_string(),
            name: "firewall".to_string(),
            template: None,
            functional_capability: Some("firewall".to_string()),
            ports: vec![],
            status: None,
            db_id: None,
        }],
        ..Default::default()
    };
    let err = h.coordinator.post_graph(nffg, "admin").await.unwrap_err();
    assert!(matches!(err, DoError::CapabilityMissing(_)));
}

#[tokio::test]
async fn test_put_without_post_fails() {
    let h = harness(two_switch_mock()).await;
    let err = h
        .coordinator
        .put_graph(simple_graph("s1", "eth1", "s2", "eth1"), "nope", "admin")
        .await
        .unwrap_err();
    assert!(matches!(err, DoError::NoGraphFound(_)));
}

#[tokio::test]
async fn test_vlan_push_outside_allowed_range_is_rejected() {
    let h = harness(two_switch_mock()).await;
    let mut nffg = simple_graph("s1", "eth1", "s2", "eth1");
    nffg.flow_rules[0]
        .actions
        .insert(0, Action::PushVlan(Some(999)));
    let err = h.coordinator.post_graph(nffg, "admin").await.unwrap_err();
    assert!(matches!(err, DoError::GraphError(_)));
}

#[tokio::test]
async fn test_gre_tunnel_removed_on_delete() {
    let h = harness(two_switch_mock()).await;
    let graph_id = h.coordinator.post_graph(gre_graph(), "admin").await.unwrap();
    assert_eq!(h.controller.gre_tunnels.lock().unwrap().len(), 1);

    h.coordinator.delete_graph(&graph_id, "admin").await.unwrap();

    // The tunnel port created at setup is torn down on the same bridge.
    let removed = h.controller.deleted_gre_tunnels.lock().unwrap().clone();
    assert_eq!(removed, vec![("br-gre".to_string(), "gre0".to_string())]);
}

#[tokio::test]
async fn test_gre_tunnel_removed_on_rollback() {
    // The second hop (the GRE bridge) refuses the flow; the rollback must
    // free the tunnel port created moments before.
    let h = harness(two_switch_mock().fail_create_on("br-gre")).await;
    let err = h.coordinator.post_graph(gre_graph(), "admin").await.unwrap_err();
    assert!(matches!(err, DoError::Controller(_)));

    let removed = h.controller.deleted_gre_tunnels.lock().unwrap().clone();
    assert_eq!(removed, vec![("br-gre".to_string(), "gre0".to_string())]);
}

#[tokio::test]
async fn test_gre_rejected_without_ovsdb_support() {
    let mut config = test_config();
    config.ovsdb.ovsdb_support = false;
    let h = harness_with_config(two_switch_mock(), config).await;

    let err = h.coordinator.post_graph(gre_graph(), "admin").await.unwrap_err();
    assert!(matches!(err, DoError::UnsupportedFeature(_)));
    assert!(h.controller.gre_tunnels.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_physical_ports_attached_through_ovsdb() {
    let mut config = test_config();
    config
        .physical_ports
        .ports
        .insert("eth4".to_string(), "br-gre".to_string());
    let h = harness_with_config(two_switch_mock(), config).await;

    h.coordinator
        .post_graph(simple_graph("s1", "eth1", "s1", "eth2"), "admin")
        .await
        .unwrap();

    let added = h.controller.added_ports.lock().unwrap().clone();
    assert_eq!(added, vec![("br-gre".to_string(), "eth4".to_string())]);
}

#[tokio::test]
async fn test_physical_ports_ignored_without_ovsdb() {
    let mut config = test_config();
    config.ovsdb.ovsdb_support = false;
    config
        .physical_ports
        .ports
        .insert("eth4".to_string(), "br-gre".to_string());
    let h = harness_with_config(two_switch_mock(), config).await;

    h.coordinator
        .post_graph(simple_graph("s1", "eth1", "s1", "eth2"), "admin")
        .await
        .unwrap();

    assert!(h.controller.added_ports.lock().unwrap().is_empty());
}
