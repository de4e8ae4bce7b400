//! Orchestrator configuration.
//!
//! One immutable `Config` value is built at startup and threaded through
//! every component; nothing reads configuration from globals. The file is
//! YAML with the historical section layout kept intact.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use sdno_controller::{ControllerKind, OdlVersion, OnosVersion};

use crate::error::{DoError, DoResult};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub domain_orchestrator: OrchestratorSection,
    pub vlan: VlanSection,
    #[serde(default)]
    pub physical_ports: PhysicalPortsSection,
    pub network_controller: NetworkControllerSection,
    #[serde(default)]
    pub opendaylight: Option<OdlSection>,
    #[serde(default)]
    pub onos: Option<OnosSection>,
    #[serde(default)]
    pub ovsdb: OvsdbSection,
    #[serde(default)]
    pub nf_configuration: NfConfigurationSection,
    pub domain_description: DomainDescriptionSection,
    #[serde(default)]
    pub other_options: OtherOptionsSection,
    pub database: DatabaseSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    pub ip: String,
    pub port: u16,
    /// Dry-run mode: skip every controller write.
    #[serde(default)]
    pub detached_mode: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VlanSection {
    /// Ranges string, e.g. `"280-289,62,737,90-95"`.
    pub available_ids: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PhysicalPortsSection {
    /// Physical ports to attach to their bridge through OVSDB
    /// (interface name -> bridge). Only honoured when `ovsdb_support` is
    /// set.
    #[serde(default)]
    pub ports: HashMap<String, String>,
    #[serde(default)]
    pub gre_bridge: Option<String>,
    #[serde(default)]
    pub gre_bridge_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkControllerSection {
    pub controller_name: ControllerKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OdlSection {
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub version: OdlVersion,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OnosSection {
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub version: OnosVersion,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OvsdbSection {
    #[serde(default)]
    pub ovsdb_support: bool,
    #[serde(default)]
    pub ovsdb_node_ip: Option<String>,
    #[serde(default)]
    pub ovsdb_node_port: Option<u16>,
    #[serde(default)]
    pub ovsdb_ip: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NfConfigurationSection {
    #[serde(default)]
    pub initial_configuration: bool,
    #[serde(default)]
    pub config_service_endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DomainDescriptionSection {
    pub domain_description_file: String,
    pub domain_description_dynamic_file: String,
    #[serde(default)]
    pub capabilities_app_name: Option<String>,
    #[serde(default)]
    pub discover_capabilities: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OtherOptionsSection {
    #[serde(default)]
    pub console_print: bool,
    /// When set, flows reference interfaces by name rather than by the
    /// controller port number.
    #[serde(default)]
    pub use_interfaces_names: bool,
    /// Pre-tagged environment: the hop transform only rewrites VLAN ids,
    /// never pushes or pops headers.
    #[serde(default)]
    pub jolnet: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSection {
    /// SQLite connection URL.
    pub connection: String,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> DoResult<Config> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| DoError::Config(format!("{}: {e}", path.as_ref().display())))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> DoResult<Config> {
        let config: Config =
            serde_yaml::from_str(raw).map_err(|e| DoError::Config(e.to_string()))?;
        if config.allowed_vlan_ranges().is_empty() {
            return Err(DoError::Config(format!(
                "no usable vlan ranges in '{}'",
                config.vlan.available_ids
            )));
        }
        match config.network_controller.controller_name {
            ControllerKind::Onos if config.onos.is_none() => {
                Err(DoError::Config("controller is onos but [onos] is missing".into()))
            }
            ControllerKind::Opendaylight if config.opendaylight.is_none() => Err(DoError::Config(
                "controller is opendaylight but [opendaylight] is missing".into(),
            )),
            _ => Ok(config),
        }
    }

    /// The parsed, sorted allowed VLAN ranges.
    pub fn allowed_vlan_ranges(&self) -> Vec<(u16, u16)> {
        parse_vlan_ranges(&self.vlan.available_ids)
    }

    /// True when the given VLAN id lies in an allowed range.
    pub fn vlan_id_allowed(&self, vid: u16) -> bool {
        self.allowed_vlan_ranges()
            .iter()
            .any(|(lo, hi)| (*lo..=*hi).contains(&vid))
    }

    pub fn gre_bridge_id(&self) -> &str {
        self.physical_ports
            .gre_bridge_id
            .as_deref()
            .unwrap_or("br-gre")
    }
}

/// Parses a ranges string such as `"280-289,62,737,90-95"`.
///
/// Single values become one-element ranges; entries with swapped bounds or
/// that do not parse are silently dropped. The result is sorted by low
/// bound.
pub fn parse_vlan_ranges(raw: &str) -> Vec<(u16, u16)> {
    let mut ranges = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (lo, hi) = match entry.split_once('-') {
            Some((lo, hi)) => (lo.trim(), hi.trim()),
            None => (entry, entry),
        };
        let (Ok(lo), Ok(hi)) = (lo.parse::<u16>(), hi.parse::<u16>()) else {
            continue;
        };
        if lo > hi {
            continue;
        }
        ranges.push((lo, hi));
    }
    ranges.sort_by_key(|(lo, _)| *lo);
    ranges
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
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
domain_description:
  domain_description_file: config/description.json
  domain_description_dynamic_file: config/description_dynamic.json
database:
  connection: "sqlite::memory:"
"#,
    )
    .unwrap()
}
