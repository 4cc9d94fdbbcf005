use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, QaError>;

#[derive(Debug, thiserror::Error)]
pub enum QaError {
    #[error("no available instance names left after {attempts} attempts for slot {slot}; check for dangling instances")]
    AllocationExhausted { slot: usize, attempts: usize },

    #[error("cannot allocate a cluster IP: every address in {first}..={last} is in use; check the run state file")]
    PoolExhausted { first: String, last: String },

    #[error("tag '{tag}' is already in use by another run")]
    TagCollision { tag: String },

    #[error("failed to {operation} {target}: {detail}")]
    RemoteOperationFailed {
        operation: String,
        target: String,
        detail: String,
    },

    #[error("configuration playbook failed (log: {})", log.display())]
    ConfigurationFailed { log: PathBuf },

    #[error("QA workload failed on {host} (log: {})", log.display())]
    WorkloadFailed { host: String, log: PathBuf },

    #[error("failed to collect artifacts from {instance}: {detail}")]
    ArtifactCollectionFailed { instance: String, detail: String },

    #[error("remote API returned {status} for {method} {path}: {message}")]
    Api {
        method: &'static str,
        path: String,
        status: u16,
        message: String,
    },

    #[error("remote API transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("run state file {} is unreadable: {detail}", path.display())]
    StoreCorrupt { path: PathBuf, detail: String },

    #[error("run state is locked by another invocation (remove {} if no other run is active)", path.display())]
    StoreLocked { path: PathBuf },

    #[error("run '{tag}' aborted during {phase}")]
    RunAborted {
        tag: String,
        phase: &'static str,
        source: Box<QaError>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl QaError {
    pub(crate) fn remote(
        operation: impl Into<String>,
        target: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        QaError::RemoteOperationFailed {
            operation: operation.into(),
            target: target.into(),
            detail: detail.into(),
        }
    }
}
