use thiserror::Error;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("forbidden: {reason}")]
    Forbidden {
        reason: String,
        required_role: Option<String>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("duplicate policy id: {0}")]
    DuplicatePolicyId(String),

    #[error("circular dependency: {0}")]
    CircularDependency(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("lock timeout: {0}")]
    LockTimeout(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("storage unavailable: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("evaluation error: {0}")]
    Evaluation(String),

    #[error("not approved: {0}")]
    NotApproved(String),

    #[error("consent insufficient: {0}")]
    ConsentInsufficient(String),

    #[error("crypto error: {0}")]
    Crypto(String),
}

impl VaultError {
    /// Forbidden error naming the role the caller was missing.
    pub fn missing_role(operation: &str, role: &str) -> VaultError {
        VaultError::Forbidden {
            reason: format!("operation '{}' requires role '{}'", operation, role),
            required_role: Some(role.to_string()),
        }
    }
}

impl Clone for VaultError {
    fn clone(&self) -> Self {
        match self {
            VaultError::Io(e) => VaultError::Storage(e.to_string()),
            VaultError::Forbidden {
                reason,
                required_role,
            } => VaultError::Forbidden {
                reason: reason.clone(),
                required_role: required_role.clone(),
            },
            VaultError::NotFound(s) => VaultError::NotFound(s.clone()),
            VaultError::Conflict(s) => VaultError::Conflict(s.clone()),
            VaultError::DuplicatePolicyId(s) => VaultError::DuplicatePolicyId(s.clone()),
            VaultError::CircularDependency(s) => VaultError::CircularDependency(s.clone()),
            VaultError::PreconditionFailed(s) => VaultError::PreconditionFailed(s.clone()),
            VaultError::Timeout(s) => VaultError::Timeout(s.clone()),
            VaultError::LockTimeout(s) => VaultError::LockTimeout(s.clone()),
            VaultError::InvalidInput(s) => VaultError::InvalidInput(s.clone()),
            VaultError::Integrity(s) => VaultError::Integrity(s.clone()),
            VaultError::Storage(s) => VaultError::Storage(s.clone()),
            VaultError::Serialization(s) => VaultError::Serialization(s.clone()),
            VaultError::Evaluation(s) => VaultError::Evaluation(s.clone()),
            VaultError::NotApproved(s) => VaultError::NotApproved(s.clone()),
            VaultError::ConsentInsufficient(s) => VaultError::ConsentInsufficient(s.clone()),
            VaultError::Crypto(s) => VaultError::Crypto(s.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::Serialization(e.to_string())
    }
}
