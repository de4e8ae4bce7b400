//! GraphStore: transactional persistence of realised forwarding graphs.
//!
//! Nine tables back the store: graph sessions, endpoints, ports,
//! endpoint-resource joins, flow rules, matches, actions, VNFs and VNF
//! ports. The schema is part of the orchestrator's contract; every write
//! path runs in an explicit transaction so a failed realisation never
//! leaves dangling rows.

pub mod models;
pub mod schema;
pub mod store;

pub use models::{
    ActionRow, EndpointResourceRow, EndpointRow, FlowRuleRow, MatchRow, PortRow, SessionRow,
    SessionStatus, StoredFlowRule, VnfPortRow, VnfRow, RESOURCE_FLOW_RULE, RESOURCE_PORT,
};
pub use store::{GraphStore, StoreError};
