//! Error taxonomy for orchestration.
//!
//! Module-local errors (`PoolError`, `RepositoryError`, `ConfigError`)
//! bubble up into [`QuarryError`], which maps onto process exit codes:
//! configuration problems exit 3, everything else exits 1.

use crate::config::ConfigError;
use crate::instance::PoolError;
use crate::repository::RepositoryError;
use crate::subunit::CodecError;

#[derive(Debug, thiserror::Error)]
pub enum QuarryError {
    #[error(transparent)]
    Misconfigured(#[from] ConfigError),

    #[error("unusable {key} value: {reason}")]
    BadConfigValue { key: &'static str, reason: String },

    #[error("provisioning instances failed: exit code {code}: {stderr}")]
    ProvisionFailed { code: i32, stderr: String },

    #[error("disposing of instances failed: exit code {code}: {stderr}")]
    DisposeFailed { code: i32, stderr: String },

    #[error("{key} callout failed: exit code {code}: {stderr}")]
    CalloutFailed {
        key: &'static str,
        code: i32,
        stderr: String,
    },

    #[error("non-zero exit code ({code}) from test listing")]
    ListFailed { code: i32 },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl QuarryError {
    /// The process exit code this error maps to: `3` for configuration
    /// errors, `1` otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            QuarryError::Misconfigured(_) | QuarryError::BadConfigValue { .. } => 3,
            _ => 1,
        }
    }
}
