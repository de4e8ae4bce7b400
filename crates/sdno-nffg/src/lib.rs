//! NF-FG (Network Function Forwarding Graph) data model.
//!
//! An NF-FG declares endpoints (attachment points on switches), VNFs and the
//! flow rules connecting them. This crate holds the in-memory representation
//! used by the realisation engine: typed endpoints and actions, the entity
//! status markers driven by graph updates, the structural diff between a
//! deployed graph and a newly submitted one, and the `ProfileGraph` indexed
//! view consumed during realisation.

pub mod diff;
pub mod model;
pub mod profile;

pub use model::{
    Action, Endpoint, EndpointKind, EntityStatus, FlowRule, Match, Nffg, PortRef, Vnf, VnfPort,
};
pub use profile::ProfileGraph;
