//! Error kinds of the orchestrator core.
//!
//! All errors implement `std::error::Error` via `thiserror`. The HTTP layer
//! maps each kind onto a status code with [`DoError::http_status`].

use thiserror::Error;

use sdno_controller::ControllerError;
use sdno_store::StoreError;

/// Result type alias for orchestrator operations.
pub type DoResult<T> = Result<T, DoError>;

#[derive(Debug, Error)]
pub enum DoError {
    /// No active session for (user, graph id).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Update of a graph that was never instantiated.
    #[error("no deployed graph found: {0}")]
    NoGraphFound(String),

    /// Collision, invalid path, overlapping endpoints, invalid egress.
    #[error("graph error: {0}")]
    GraphError(String),

    /// The request carries fields this domain does not process.
    #[error("unsupported information in request: {0}")]
    UselessInfo(String),

    /// The topology offers no path between the endpoints.
    #[error("no path between {src} and {dst}")]
    NoPath { src: String, dst: String },

    /// A requested VNF capability is not offered by this domain.
    #[error("capability not available on this domain: {0}")]
    CapabilityMissing(String),

    /// A declared-unsupported feature was requested (e.g. VNF-to-VNF flows).
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// The network controller returned a failure.
    #[error("controller error: {0}")]
    Controller(#[from] ControllerError),

    /// Graph store transaction failure.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// Publishing the domain description failed; never rolls back a
    /// realisation.
    #[error("messaging error: {0}")]
    Messaging(String),

    /// Bad or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Unexpected internal state.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DoError {
    pub fn graph(msg: impl Into<String>) -> Self {
        DoError::GraphError(msg.into())
    }

    pub fn useless(msg: impl Into<String>) -> Self {
        DoError::UselessInfo(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        DoError::Internal(msg.into())
    }

    /// The HTTP status the REST rim should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            DoError::SessionNotFound(_) | DoError::NoGraphFound(_) => 404,
            DoError::GraphError(_)
            | DoError::UselessInfo(_)
            | DoError::CapabilityMissing(_)
            | DoError::UnsupportedFeature(_) => 400,
            DoError::NoPath { .. } => 409,
            DoError::Controller(ControllerError::Http { status, .. }) => *status,
            DoError::Controller(_) => 502,
            DoError::Storage(_) | DoError::Internal(_) | DoError::Config(_) => 500,
            DoError::Messaging(_) => 500,
        }
    }
}
