//! Cached topology view with shortest-path routing.
//!
//! The provider snapshots the controller's device/link/port inventory and
//! answers the routing questions the realiser asks: which port faces a
//! neighbour, what the controller calls a human interface name, and the
//! BFS shortest path between two switches. The snapshot is refreshed before
//! each realisation attempt.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use tracing::debug;

use crate::client::{ControllerClient, ControllerError, DevicePort};

#[derive(Debug, Clone, Default)]
pub struct TopologyProvider {
    /// Switch ids, kept sorted for deterministic iteration.
    devices: BTreeSet<String>,
    /// (a, b) -> port on `a` facing `b`.
    link_ports: HashMap<(String, String), String>,
    /// Adjacency with neighbours in ascending switch-id order.
    adjacency: BTreeMap<String, BTreeSet<String>>,
    /// switch -> its ports.
    ports: HashMap<String, Vec<DevicePort>>,
    /// When set, `port_name_of` returns the interface name itself instead of
    /// the controller port number.
    use_interface_names: bool,
}

impl TopologyProvider {
    pub fn new(use_interface_names: bool) -> Self {
        TopologyProvider {
            use_interface_names,
            ..Default::default()
        }
    }

    /// Re-queries the whole inventory from the controller.
    pub async fn refresh(&mut self, client: &dyn ControllerClient) -> Result<(), ControllerError> {
        let devices = client.list_devices().await?;
        let links = client.list_links().await?;

        self.devices.clear();
        self.link_ports.clear();
        self.adjacency.clear();
        self.ports.clear();

        for device in &devices {
            self.devices.insert(device.id.clone());
            let ports = client.list_device_ports(&device.id).await?;
            self.ports.insert(device.id.clone(), ports);
        }
        for link in links {
            self.add_link(link.src_device, link.src_port, link.dst_device, link.dst_port);
        }
        debug!(
            devices = self.devices.len(),
            links = self.link_ports.len(),
            "topology refreshed"
        );
        Ok(())
    }

    /// Builds a provider from a fixed snapshot. Links are directed; feed
    /// both directions when the medium is symmetric.
    pub fn from_snapshot(
        devices: impl IntoIterator<Item = String>,
        links: impl IntoIterator<Item = (String, String, String, String)>,
        ports: impl IntoIterator<Item = (String, Vec<DevicePort>)>,
        use_interface_names: bool,
    ) -> Self {
        let mut provider = TopologyProvider::new(use_interface_names);
        for device in devices {
            provider.devices.insert(device);
        }
        for (src, src_port, dst, dst_port) in links {
            provider.add_link(src, src_port, dst, dst_port);
        }
        provider.ports = ports.into_iter().collect();
        provider
    }

    fn add_link(&mut self, src: String, src_port: String, dst: String, dst_port: String) {
        self.adjacency
            .entry(src.clone())
            .or_default()
            .insert(dst.clone());
        self.adjacency
            .entry(dst.clone())
            .or_default()
            .insert(src.clone());
        self.link_ports
            .insert((src.clone(), dst.clone()), src_port);
        self.link_ports.insert((dst, src), dst_port);
    }

    pub fn has_device(&self, switch_id: &str) -> bool {
        self.devices.contains(switch_id)
    }

    /// True until the first refresh (or snapshot) populates the provider.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Controller port identifier for a human interface name on a switch.
    pub fn port_name_of(&self, switch_id: &str, interface: &str) -> Option<String> {
        if self.use_interface_names {
            return Some(interface.to_string());
        }
        let ports = self.ports.get(switch_id)?;
        ports
            .iter()
            .find(|p| p.name.as_deref() == Some(interface) || p.number == interface)
            .map(|p| p.number.clone())
    }

    /// Port on `hop_a` that faces `hop_b`, when a link exists.
    pub fn switch_port_out(&self, hop_a: &str, hop_b: &str) -> Option<String> {
        self.link_ports
            .get(&(hop_a.to_string(), hop_b.to_string()))
            .cloned()
    }

    /// Port on `hop_b` where traffic from `hop_a` enters.
    pub fn switch_port_in(&self, hop_b: &str, hop_a: &str) -> Option<String> {
        self.link_ports
            .get(&(hop_b.to_string(), hop_a.to_string()))
            .cloned()
    }

    /// Unweighted BFS shortest path from `src` to `dst`, inclusive.
    ///
    /// Neighbours are visited in ascending switch-id order, so equal-length
    /// paths always resolve the same way for a given snapshot.
    pub fn shortest_path(&self, src: &str, dst: &str) -> Option<Vec<String>> {
        if !self.devices.contains(src) || !self.devices.contains(dst) {
            return None;
        }
        if src == dst {
            return Some(vec![src.to_string()]);
        }

        let mut predecessor: HashMap<&str, &str> = HashMap::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(src);
        predecessor.insert(src, src);

        while let Some(current) = queue.pop_front() {
            if current == dst {
                break;
            }
            let Some(neighbours) = self.adjacency.get(current) else {
                continue;
            };
            for next in neighbours {
                if !predecessor.contains_key(next.as_str()) {
                    predecessor.insert(next, current);
                    queue.push_back(next);
                }
            }
        }

        if !predecessor.contains_key(dst) {
            return None;
        }
        let mut path = vec![dst.to_string()];
        let mut cursor = dst;
        while cursor != src {
            cursor = predecessor[cursor];
            path.push(cursor.to_string());
        }
        path.reverse();
        Some(path)
    }
}
