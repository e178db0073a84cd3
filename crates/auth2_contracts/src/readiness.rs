#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

/// Launch readiness. Exactly one value is live; the only backward edge is the
/// confirmed reset that re-enters `Migrating`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadinessState {
    Migrating,
    AwaitingAuthentication,
    AwaitingEncryptionKey,
    Ready,
}

impl ReadinessState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ready)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Migrating => "MIGRATING",
            Self::AwaitingAuthentication => "AWAITING_AUTHENTICATION",
            Self::AwaitingEncryptionKey => "AWAITING_ENCRYPTION_KEY",
            Self::Ready => "READY",
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Migrating => "Upgrading the token database",
            Self::AwaitingAuthentication => "Waiting for biometric authentication",
            Self::AwaitingEncryptionKey => "Waiting for the encryption key",
            Self::Ready => "Ready",
        }
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOutcome {
    pub attempted: bool,
    pub succeeded: bool,
    pub error_message: Option<String>,
}

impl MigrationOutcome {
    pub fn not_needed() -> Self {
        Self {
            attempted: false,
            succeeded: true,
            error_message: None,
        }
    }

    pub fn succeeded() -> Self {
        Self {
            attempted: true,
            succeeded: true,
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            attempted: true,
            succeeded: false,
            error_message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthenticationOutcome {
    Succeeded,
    Failed,
    Error(String),
}

impl AuthenticationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Why the gate is waiting on the user instead of advancing by itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateBlocker {
    /// Only the explicit, confirmed reset can clear this.
    MigrationFailed { message: String },
    AuthenticationFailed { message: String },
    EncryptionKeyRequired,
    /// Terminal for the process.
    EnvelopeCorrupt { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateStatus {
    pub state: ReadinessState,
    pub blocker: Option<GateBlocker>,
}

impl GateStatus {
    pub fn initial() -> Self {
        Self {
            state: ReadinessState::Migrating,
            blocker: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == ReadinessState::Ready
    }
}
