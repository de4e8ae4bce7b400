//! Controller plumbing: the `ControllerClient` capability surface, its two
//! REST dialect implementations (ONOS, OpenDaylight), the wire-flow JSON
//! encoding, and the cached topology view with shortest-path routing.

pub mod client;
pub mod flow;
pub mod odl;
pub mod onos;
pub mod topology;

pub use client::{
    ControllerClient, ControllerError, ControllerKind, Device, DevicePort, GreTunnelPort, Link,
    OdlVersion, OnosVersion,
};
pub use flow::WireFlow;
pub use odl::OdlClient;
pub use onos::OnosClient;
pub use topology::TopologyProvider;
