#![forbid(unsafe_code)]

use crate::token::TokenId;
use crate::ContractViolation;

/// Failures reported by the core behind the bridge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("database migrate error: {0}")]
    Migration(String),

    #[error("enrollment link rejected: {0}")]
    LinkRejected(String),

    #[error("no user key found")]
    KeyUnavailable,

    #[error("user key cannot be read: {0}")]
    KeyCorrupt(String),

    #[error("data decryption error")]
    Decrypt,

    #[error("no entry found: {0}")]
    NotFound(TokenId),

    #[error("code generation error: {0}")]
    Generation(String),

    #[error("invalid request: {0}")]
    Contract(#[from] ContractViolation),

    #[error("internal error: {0}")]
    Internal(String),
}
