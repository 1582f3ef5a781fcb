//! Error types for referral-core

use thiserror::Error;

use crate::money::Money;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Referral cycle detected: {invitee} is already an ancestor of {inviter}")]
    CycleDetected { invitee: String, inviter: String },

    #[error("Inviter not found: {0}")]
    InviterNotFound(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Request not found: {0}")]
    RequestNotFound(String),

    #[error("No active admins available for assignment")]
    AdminPoolEmpty,

    #[error("Request already processed: {0}")]
    RequestAlreadyProcessed(String),

    #[error("Admin {admin_id} may not process request {request_id}")]
    NotOwner { request_id: String, admin_id: String },

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: Money, available: Money },

    #[error("Processing failed: {0}")]
    ProcessingFailed(String),

    #[error("Bonus level out of range: {0}")]
    LevelOutOfRange(u8),

    #[error("Rotation cursor contention")]
    Contention,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Transient failures the caller may retry with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ProcessingFailed(_) | EngineError::Contention)
    }

    /// The operation already happened once elsewhere; treat as success
    pub fn is_already_processed(&self) -> bool {
        matches!(self, EngineError::RequestAlreadyProcessed(_))
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::ProcessingFailed(format!("Database error: {}", e))
    }
}
