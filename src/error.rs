#[derive(Debug, thiserror::Error)]
pub enum VpcError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("command '{cmd}' failed: {stderr}")]
    Driver { cmd: String, stderr: String },

    #[error("could not acquire state lock: {0}")]
    Lock(String),

    #[error("metadata I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("interrupted by signal")]
    Interrupted,
}

impl VpcError {
    /// Process exit code for this error class. 0 is reserved for success,
    /// 1 for anything without a dedicated class.
    pub fn exit_code(&self) -> i32 {
        match self {
            VpcError::Validation(_) | VpcError::NotFound { .. } | VpcError::Conflict(_) => 2,
            VpcError::Driver { .. } | VpcError::Io(_) | VpcError::Serialization(_) => 3,
            VpcError::Lock(_) => 4,
            VpcError::Interrupted => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, VpcError>;
