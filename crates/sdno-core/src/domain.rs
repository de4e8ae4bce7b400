//! Domain description handling.
//!
//! The domain publishes a capability document describing which
//! controller-hosted applications implement which network functions. The
//! realiser queries it to bind VNFs to applications; after each successful
//! realisation the dynamic copy is rewritten and handed to the publisher.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{DoError, DoResult};

/// One network function the domain can emulate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionalCapability {
    /// Controller application implementing the function.
    pub name: String,
    /// Capability label matched against `vnf.functional_capability`.
    #[serde(rename = "type")]
    pub capability_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default)]
    pub ready: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainCapabilities {
    #[serde(rename = "functional-capabilities", default)]
    pub functional_capabilities: Vec<FunctionalCapability>,
}

/// The published capability document of this domain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub capabilities: DomainCapabilities,
    /// Graphs currently deployed, refreshed after each realisation.
    #[serde(rename = "deployed-graphs", default)]
    pub deployed_graphs: Vec<String>,
}

impl DomainInfo {
    pub fn from_file(path: impl AsRef<Path>) -> DoResult<DomainInfo> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| DoError::Config(format!("{}: {e}", path.as_ref().display())))?;
        serde_json::from_str(&raw).map_err(|e| DoError::Config(e.to_string()))
    }

    /// Application implementing the given capability, matched
    /// case-insensitively against the capability label.
    pub fn app_for_capability(&self, capability: &str) -> Option<&FunctionalCapability> {
        self.capabilities
            .functional_capabilities
            .iter()
            .find(|c| c.capability_type.eq_ignore_ascii_case(capability))
    }
}

/// The domain's resource description files: a static seed and the dynamic
/// copy rewritten after every realisation.
///
/// Writers take a single-writer lock and replace the file atomically
/// (write-to-temp then rename), so the background publisher never reads a
/// torn document.
pub struct ResourceDescription {
    dynamic_path: PathBuf,
    info: RwLock<DomainInfo>,
    write_lock: Mutex<()>,
}

impl ResourceDescription {
    /// Loads the dynamic file when present, falling back to the static
    /// seed.
    pub fn load(static_path: impl AsRef<Path>, dynamic_path: impl AsRef<Path>) -> DoResult<Self> {
        let dynamic_path = dynamic_path.as_ref().to_path_buf();
        let info = if dynamic_path.exists() {
            DomainInfo::from_file(&dynamic_path)?
        } else {
            DomainInfo::from_file(static_path)?
        };
        Ok(ResourceDescription {
            dynamic_path,
            info: RwLock::new(info),
            write_lock: Mutex::new(()),
        })
    }

    /// In-memory description, used by tests and detached runs.
    pub fn from_info(info: DomainInfo, dynamic_path: impl Into<PathBuf>) -> Self {
        ResourceDescription {
            dynamic_path: dynamic_path.into(),
            info: RwLock::new(info),
            write_lock: Mutex::new(()),
        }
    }

    pub fn info(&self) -> DomainInfo {
        self.info.read().expect("domain info lock poisoned").clone()
    }

    pub fn app_for_capability(&self, capability: &str) -> Option<FunctionalCapability> {
        self.info
            .read()
            .expect("domain info lock poisoned")
            .app_for_capability(capability)
            .cloned()
    }

    pub fn capability_available(&self, capability: &str) -> bool {
        self.app_for_capability(capability).is_some()
    }

    /// Replaces the deployed-graph list after a realisation or deletion.
    pub fn set_deployed_graphs(&self, graph_ids: Vec<String>) {
        self.info
            .write()
            .expect("domain info lock poisoned")
            .deployed_graphs = graph_ids;
    }

    /// Writes the dynamic description atomically.
    pub async fn save(&self) -> DoResult<()> {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.info();
        let parent = self
            .dynamic_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let path = self.dynamic_path.clone();

        tokio::task::spawn_blocking(move || -> DoResult<()> {
            let file = NamedTempFile::new_in(&parent)
                .map_err(|e| DoError::Internal(format!("temp file: {e}")))?;
            serde_json::to_writer_pretty(&file, &snapshot)
                .map_err(|e| DoError::Internal(format!("serialize description: {e}")))?;
            file.persist(&path)
                .map_err(|e| DoError::Internal(format!("replace description: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| DoError::Internal(format!("description writer task: {e}")))??;

        debug!(path = %self.dynamic_path.display(), "domain description saved");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_domain_info() -> DomainInfo {
    DomainInfo {
        name: Some("test-domain".to_string()),
        capabilities: DomainCapabilities {
            functional_capabilities: vec![
                FunctionalCapability {
                    name: "org.onosproject.dhcp".to_string(),
                    capability_type: "dhcp".to_string(),
                    template: Some("dhcp.json".to_string()),
                    ready: true,
                },
                FunctionalCapability {
                    name: "org.onosproject.fwd".to_string(),
                    capability_type: "switch".to_string(),
                    template: None,
                    ready: true,
                },
            ],
        },
        deployed_graphs: vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_lookup_is_case_insensitive() {
        let info = test_domain_info();
        assert_eq!(
            info.app_for_capability("DHCP").map(|c| c.name.as_str()),
            Some("org.onosproject.dhcp")
        );
        assert!(info.app_for_capability("firewall").is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_file_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("description.json");
        let description = ResourceDescription::from_info(test_domain_info(), &path);

        description.save().await.unwrap();
        let first = DomainInfo::from_file(&path).unwrap();
        assert!(first.deployed_graphs.is_empty());

        description.set_deployed_graphs(vec!["g1".to_string()]);
        description.save().await.unwrap();
        let second = DomainInfo::from_file(&path).unwrap();
        assert_eq!(second.deployed_graphs, vec!["g1".to_string()]);
    }

    #[test]
    fn test_domain_info_round_trip() {
        let info = test_domain_info();
        let json = serde_json::to_string(&info).unwrap();
        let back: DomainInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(
            back.capabilities.functional_capabilities.len(),
            info.capabilities.functional_capabilities.len()
        );
    }
}
