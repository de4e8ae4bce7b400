//! The controller capability surface.
//!
//! Both REST dialects implement the same trait; the orchestrator core only
//! ever talks to `dyn ControllerClient`. Selection happens once at startup
//! from the configured controller name.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flow::WireFlow;

/// Errors surfaced by controller REST calls.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Non-2xx response from the controller.
    #[error("controller returned {status} for {url}")]
    Http { status: u16, url: String },

    /// Transport-level failure (connection refused, timeout, TLS, ...).
    #[error("controller request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Response body did not match the expected document shape.
    #[error("unexpected controller payload from {url}: {message}")]
    Payload { url: String, message: String },
}

impl ControllerError {
    pub fn payload(url: impl Into<String>, message: impl Into<String>) -> Self {
        ControllerError::Payload {
            url: url.into(),
            message: message.into(),
        }
    }

    /// True when the error is an HTTP 404, which delete paths swallow.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ControllerError::Http { status: 404, .. })
    }
}

/// Which controller dialect is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerKind {
    Onos,
    Opendaylight,
}

impl ControllerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerKind::Onos => "onos",
            ControllerKind::Opendaylight => "opendaylight",
        }
    }
}

/// Supported ONOS API generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnosVersion {
    #[serde(rename = "1.x")]
    V1,
}

/// Supported OpenDaylight releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OdlVersion {
    Carbon,
    Nitrogen,
}

/// An OpenFlow switch known to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub available: bool,
}

/// A directed inter-switch link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub src_device: String,
    pub src_port: String,
    pub dst_device: String,
    pub dst_port: String,
}

/// One port of a switch, with the human interface name when the controller
/// annotates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePort {
    pub number: String,
    pub name: Option<String>,
}

/// Result of a GRE tunnel creation: where the tunnel surfaced as a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreTunnelPort {
    pub bridge_id: String,
    pub port_name: String,
}

/// Capability set shared by every controller dialect.
///
/// All calls are fallible REST round-trips; implementations must not cache
/// (the topology provider layers caching on top).
#[async_trait]
pub trait ControllerClient: Send + Sync {
    /// Switch inventory.
    async fn list_devices(&self) -> Result<Vec<Device>, ControllerError>;

    /// Inter-switch link inventory.
    async fn list_links(&self) -> Result<Vec<Link>, ControllerError>;

    /// Ports of one switch.
    async fn list_device_ports(&self, switch_id: &str) -> Result<Vec<DevicePort>, ControllerError>;

    /// Installs one flow entry under the given per-switch name.
    async fn create_flow(
        &self,
        switch_id: &str,
        flow_name: &str,
        flow: &WireFlow,
    ) -> Result<(), ControllerError>;

    /// Removes one flow entry. A 404 is reported as such and left to the
    /// caller, which treats deletes as idempotent.
    async fn delete_flow(&self, switch_id: &str, flow_name: &str) -> Result<(), ControllerError>;

    /// Activates a controller-hosted application.
    async fn activate_app(&self, app_name: &str) -> Result<(), ControllerError>;

    /// Deactivates a controller-hosted application.
    async fn deactivate_app(&self, app_name: &str) -> Result<(), ControllerError>;

    /// Whether the application reports active.
    async fn is_app_active(&self, app_name: &str) -> Result<bool, ControllerError>;

    /// Pushes an application configuration document.
    async fn push_app_configuration(
        &self,
        app_name: &str,
        config: &serde_json::Value,
    ) -> Result<(), ControllerError>;

    /// Creates a GRE tunnel port on the given bridge and returns where it
    /// landed.
    async fn add_gre_tunnel(
        &self,
        bridge: &str,
        port_name: &str,
        local_ip: &str,
        remote_ip: &str,
        gre_key: Option<&str>,
    ) -> Result<GreTunnelPort, ControllerError>;

    /// Removes a GRE tunnel port.
    async fn delete_gre_tunnel(&self, bridge: &str, port_name: &str)
        -> Result<(), ControllerError>;

    /// Adds a plain port to a bridge (OVSDB-backed deployments).
    async fn add_port(&self, bridge: &str, port_name: &str) -> Result<(), ControllerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_kind_names() {
        assert_eq!(ControllerKind::Onos.as_str(), "onos");
        assert_eq!(ControllerKind::Opendaylight.as_str(), "opendaylight");
        let parsed: ControllerKind = serde_json::from_str("\"opendaylight\"").unwrap();
        assert_eq!(parsed, ControllerKind::Opendaylight);
    }

    #[test]
    fn test_not_found_detection() {
        let err = ControllerError::Http {
            status: 404,
            url: "/onos/v1/flows/of:1/12".to_string(),
        };
        assert!(err.is_not_found());
        let err = ControllerError::Http {
            status: 500,
            url: "/onos/v1/flows/of:1".to_string(),
        };
        assert!(!err.is_not_found());
    }
}
