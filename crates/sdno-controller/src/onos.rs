//! ONOS REST dialect.
//!
//! Endpoints: `/onos/v1/devices`, `/onos/v1/links`,
//! `/onos/v1/devices/{id}/ports`, `/onos/v1/flows/{dev}`,
//! `/onos/v1/applications/{name}/active`. HTTP basic auth throughout.
//!
//! ONOS names flows by a numeric id returned in the `Location` header, not
//! by the caller-chosen name; the client remembers the mapping so deletes by
//! name reach the right entry within one process lifetime. A delete whose id
//! is unknown falls back to the name itself and surfaces the 404, which the
//! caller swallows.

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{Client, Response};
use serde::Deserialize;
use tracing::debug;

use crate::client::{
    ControllerClient, ControllerError, Device, DevicePort, GreTunnelPort, Link, OnosVersion,
};
use crate::flow::WireFlow;

pub struct OnosClient {
    http: Client,
    endpoint: String,
    username: String,
    password: String,
    #[allow(dead_code)]
    version: OnosVersion,
    /// (switch, flow name) -> ONOS flow id, learned at create time.
    flow_ids: DashMap<(String, String), String>,
}

#[derive(Deserialize)]
struct DevicesDoc {
    devices: Vec<DeviceDoc>,
}

#[derive(Deserialize)]
struct DeviceDoc {
    id: String,
    #[serde(default)]
    available: bool,
}

#[derive(Deserialize)]
struct LinksDoc {
    links: Vec<LinkDoc>,
}

#[derive(Deserialize)]
struct LinkDoc {
    src: ConnectPoint,
    dst: ConnectPoint,
}

#[derive(Deserialize)]
struct ConnectPoint {
    device: String,
    port: String,
}

#[derive(Deserialize)]
struct PortsDoc {
    ports: Vec<PortDoc>,
}

#[derive(Deserialize)]
struct PortDoc {
    port: String,
    #[serde(default)]
    annotations: PortAnnotations,
}

#[derive(Deserialize, Default)]
struct PortAnnotations {
    #[serde(rename = "portName")]
    port_name: Option<String>,
}

#[derive(Deserialize)]
struct AppDoc {
    state: String,
}

impl OnosClient {
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        version: OnosVersion,
    ) -> Self {
        OnosClient {
            http: Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            version,
            flow_ids: DashMap::new(),
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

    async fn get(&self, path: &str) -> Result<Response, ControllerError> {
        let response = self
            .http
            .get(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .send()
            .await?;
        self.check(response).await
    }
}

#[async_trait]
impl ControllerClient for OnosClient {
    async fn list_devices(&self) -> Result<Vec<Device>, ControllerError> {
        let doc: DevicesDoc = self.get("/onos/v1/devices").await?.json().await?;
        Ok(doc
            .devices
            .into_iter()
            .map(|d| Device {
                id: d.id,
                available: d.available,
            })
            .collect())
    }

    async fn list_links(&self) -> Result<Vec<Link>, ControllerError> {
        let doc: LinksDoc = self.get("/onos/v1/links").await?.json().await?;
        Ok(doc
            .links
            .into_iter()
            .map(|l| Link {
                src_device: l.src.device,
                src_port: l.src.port,
                dst_device: l.dst.device,
                dst_port: l.dst.port,
            })
            .collect())
    }

    async fn list_device_ports(&self, switch_id: &str) -> Result<Vec<DevicePort>, ControllerError> {
        let path = format!("/onos/v1/devices/{switch_id}/ports");
        let doc: PortsDoc = self.get(&path).await?.json().await?;
        Ok(doc
            .ports
            .into_iter()
            .map(|p| DevicePort {
                number: p.port,
                name: p.annotations.port_name,
            })
            .collect())
    }

    async fn create_flow(
        &self,
        switch_id: &str,
        flow_name: &str,
        flow: &WireFlow,
    ) -> Result<(), ControllerError> {
        let path = format!("/onos/v1/flows/{switch_id}");
        let response = self
            .http
            .post(self.url(&path))
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .json(flow)
            .send()
            .await?;
        let response = self.check(response).await?;

        // The assigned flow id is the last path segment of the Location
        // header.
        if let Some(location) = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
        {
            if let Some(id) = location.rsplit('/').next() {
                self.flow_ids.insert(
                    (switch_id.to_string(), flow_name.to_string()),
                    id.to_string(),
                );
            }
        }
        Ok(())
    }

    async fn delete_flow(&self, switch_id: &str, flow_name: &str) -> Result<(), ControllerError> {
        let flow_id = self
            .flow_ids
            .remove(&(switch_id.to_string(), flow_name.to_string()))
            .map(|(_, id)| id)
            .unwrap_or_else(|| flow_name.to_string());
        let path = format!("/onos/v1/flows/{switch_id}/{flow_id}");
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
        let path = format!("/onos/v1/applications/{app_name}/active");
        let response = self
            .http
            .post(self.url(&path))
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .send()
            .await?;
        self.check(response).await.map(|_| ())
    }

    async fn deactivate_app(&self, app_name: &str) -> Result<(), ControllerError> {
        let path = format!("/onos/v1/applications/{app_name}/active");
        let response = self
            .http
            .delete(self.url(&path))
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .send()
            .await?;
        self.check(response).await.map(|_| ())
    }

    async fn is_app_active(&self, app_name: &str) -> Result<bool, ControllerError> {
        let path = format!("/onos/v1/applications/{app_name}");
        match self.get(&path).await {
            Ok(response) => {
                let doc: AppDoc = response.json().await?;
                Ok(doc.state.eq_ignore_ascii_case("ACTIVE"))
            }
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn push_app_configuration(
        &self,
        app_name: &str,
        config: &serde_json::Value,
    ) -> Result<(), ControllerError> {
        let path = format!("/onos/v1/network/configuration/apps/{app_name}");
        let response = self
            .http
            .post(self.url(&path))
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
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
        // GRE interfaces surface through the OVSDB southbound as tunnel
        // ports on the configured bridge.
        let path = "/onos/v1/network/configuration/ports";
        let mut options = serde_json::json!({
            "local_ip": local_ip,
            "remote_ip": remote_ip,
        });
        if let Some(key) = gre_key {
            options["key"] = serde_json::json!(key);
        }
        let mut body = serde_json::Map::new();
        body.insert(
            format!("{bridge}/{port_name}"),
            serde_json::json!({
                "interface": {
                    "name": port_name,
                    "type": "gre",
                    "options": options,
                }
            }),
        );
        let body = serde_json::Value::Object(body);
        let response = self
            .http
            .post(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
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
        let path = format!("/onos/v1/network/configuration/ports/{bridge}%2F{port_name}");
        let response = self
            .http
            .delete(self.url(&path))
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .send()
            .await?;
        self.check(response).await.map(|_| ())
    }

    async fn add_port(&self, bridge: &str, port_name: &str) -> Result<(), ControllerError> {
        let path = "/onos/v1/network/configuration/ports";
        let mut body = serde_json::Map::new();
        body.insert(
            format!("{bridge}/{port_name}"),
            serde_json::json!({ "interface": { "name": port_name } }),
        );
        let body = serde_json::Value::Object(body);
        let response = self
            .http
            .post(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await?;
        self.check(response).await.map(|_| ())
    }
}
