//! Error taxonomy for the pipeline.
//!
//! Each external seam gets its own small `thiserror` enum rather than one
//! monolithic error type. `ReconcileError` and `HandlerError` compose the
//! seam errors for the two process classes.

use thiserror::Error;

/// Errors talking to the declarative store (kube API server).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("kube api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("optimistic concurrency conflict on {0} after {1} attempts")]
    ConflictRetriesExhausted(String, u32),

    #[error("resource not found: {0}")]
    NotFound(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound(_) => true,
            StoreError::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }
}

/// Errors publishing/consuming on the message bus.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("nats error: {0}")]
    Nats(String),

    #[error("message payload could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Errors from the registry client.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("http error talking to registry: {0}")]
    Http(#[from] reqwest::Error),

    #[error("reference {0} is not a multi-platform image index")]
    NotAnIndex(String),

    #[error("could not parse tag reference {0}")]
    InvalidReference(String),

    #[error("registry returned an error: {0}")]
    Remote(String),
}

/// Errors invoking the external SBOM/scan tool subprocesses.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("i/o error running subprocess: {0}")]
    Io(#[from] std::io::Error),

    #[error("subprocess exited with non-zero status: {0}")]
    ExitStatus(std::process::ExitStatus),

    #[error("subprocess was cancelled")]
    Cancelled,

    #[error("subprocess produced an empty artifact")]
    EmptyArtifact,
}

/// Error surface for reconcilers (C3, C8, C9). Returned to the `kube`
/// controller runtime, which re-queues the key with backoff on `Err`.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("registry {0} referenced by scan job not found")]
    RegistryNotFound(String),
}

/// Error surface for worker handlers (C4-C7). Returned to the bus
/// subscriber, which applies the nak/retry policy of
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("malformed message payload: {0}")]
    MalformedPayload(String),

    #[error("could not decode message payload: {0}")]
    Decode(#[from] serde_json::Error),
}
