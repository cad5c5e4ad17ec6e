use thiserror::Error;

/// Error taxonomy for control-plane operations (§7). Data-plane convergence
/// (peer programming, encryption) does not use this type: failures there are
/// logged and retried on the next event, never surfaced to a caller.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("kernel operation failed: {0}")]
    Kernel(#[from] KernelError),
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// A kernel-originated failure, classified per §7 so callers can decide
/// whether to roll back (fatal) or absorb and move on (transient).
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("transient: {0}")]
    Transient(anyhow::Error),

    #[error("fatal: {0}")]
    Fatal(anyhow::Error),
}

impl KernelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, KernelError::Transient(_))
    }

    /// Classify a raw kernel-layer error by the idiom the repo uses
    /// throughout (string match on "already exists" / "no such"), mirroring
    /// the pre-check-before-mutate style of `saExists`/`spExists`/`ExistChain`
    /// described in spec §7.
    pub fn classify(err: anyhow::Error) -> Self {
        let msg = err.to_string().to_lowercase();
        if msg.contains("already exists") || msg.contains("file exists") || msg.contains("exist") {
            KernelError::Transient(err)
        } else if msg.contains("no such") || msg.contains("not exist") || msg.contains("enoent") {
            KernelError::Transient(err)
        } else if msg.contains("timed out") || msg.contains("timeout") || msg.contains("eagain") {
            KernelError::Transient(err)
        } else {
            KernelError::Fatal(err)
        }
    }
}

impl From<anyhow::Error> for DriverError {
    fn from(err: anyhow::Error) -> Self {
        DriverError::Kernel(KernelError::classify(err))
    }
}
