//! Graph realisation engine.
//!
//! This crate turns validated NF-FG requests into switch-level OpenFlow
//! entries: it routes endpoint pairs over the live topology, allocates
//! conflict-free transport VLANs per hop, reconciles updates against the
//! deployed graph, activates the controller applications emulating the
//! requested VNFs, and keeps every allocated resource in the graph store so
//! later updates and deletes can tear it down again.

pub mod config;
pub mod domain;
pub mod error;
pub mod locks;
pub mod realiser;
pub mod session;
pub mod vlan;

pub use config::Config;
pub use domain::{DomainInfo, FunctionalCapability, ResourceDescription};
pub use error::{DoError, DoResult};
pub use locks::SwitchLocks;
pub use realiser::Realiser;
pub use session::{DescriptionPublisher, GraphStatus, SessionCoordinator};
pub use vlan::VlanAllocator;
