//! Error types for the InstaSlice operator

use thiserror::Error;

/// Main error type for InstaSlice operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// No GPU on any ready node can place the requested profile
    #[error("no fit: {0}")]
    NoFit(String),

    /// Vendor GPU library reported a non-success code
    #[error("hardware error: {0}")]
    Hardware(String),

    /// Workload request the scheduler cannot honor (bad shape, bad count)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a no-fit error with the given message
    pub fn no_fit(msg: impl Into<String>) -> Self {
        Self::NoFit(msg.into())
    }

    /// Create a hardware error with the given message
    pub fn hardware(msg: impl Into<String>) -> Self {
        Self::Hardware(msg.into())
    }

    /// Create an invalid-request error with the given message
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// True when this error is an optimistic-concurrency write conflict.
    ///
    /// Conflicts are recovered locally: the loser discards its in-memory
    /// mutation, re-reads the inventory, and re-derives its decision.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(ae)) if ae.code == 409)
    }

    /// True when this error is a not-found response from the API server
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }

    /// True when this error is an already-exists response from the API server
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(ae)) if ae.code == 409 && ae.reason == "AlreadyExists")
    }
}

impl From<crate::gpu::GpuError> for Error {
    fn from(e: crate::gpu::GpuError) -> Self {
        Self::Hardware(e.to_string())
    }
}
