use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Invalid Example spec: {0}")]
    InvalidSpec(String),

    #[error("Deployment {0} already exists and is not owned by this Example")]
    NameConflict(String),

    #[error("Example is missing {0}")]
    MissingObjectKey(&'static str),

    #[error("Deployment {name} kept conflicting after {attempts} attempts")]
    ConflictRetriesExhausted { name: String, attempts: u32 },

    #[error("Timed out after {0:?} waiting for the API server")]
    Timeout(Duration),

    #[error("Reconcile aborted by shutdown")]
    Cancelled,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How the reconcile loop treats a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The object vanished; nothing left to do
    NotFound,
    /// Stale resourceVersion or a create race; re-fetch and retry
    Conflict,
    /// Network, timeout or server-side trouble; retry with backoff
    Transient,
    /// Needs a spec change before it can succeed
    Permanent,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => match resp.code {
                404 => ErrorKind::NotFound,
                409 => ErrorKind::Conflict,
                400 | 422 => ErrorKind::Permanent,
                _ => ErrorKind::Transient,
            },
            Error::KubeError(_) => ErrorKind::Transient,
            Error::ConflictRetriesExhausted { .. } => ErrorKind::Conflict,
            Error::Timeout(_) | Error::Cancelled => ErrorKind::Transient,
            Error::SerializationError(_)
            | Error::InvalidSpec(_)
            | Error::NameConflict(_)
            | Error::MissingObjectKey(_) => ErrorKind::Permanent,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::InvalidSpec(_) => "InvalidSpec",
            Error::NameConflict(_) => "NameConflict",
            Error::MissingObjectKey(_) => "MissingObjectKey",
            Error::ConflictRetriesExhausted { .. } => "ConflictRetriesExhausted",
            Error::Timeout(_) => "Timeout",
            Error::Cancelled => "Cancelled",
        }
    }
}

pub mod controllers;

pub use controllers::State;

/// Per-object retry delays
pub mod backoff;

/// Leader election over a coordination Lease
pub mod leader;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use metrics::Metrics;

/// CRDs
pub mod resources;
