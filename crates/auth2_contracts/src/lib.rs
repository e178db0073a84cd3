#![forbid(unsafe_code)]

pub mod bridge;
pub mod common;
pub mod envelope;
pub mod readiness;
pub mod token;

pub use bridge::BridgeError;
pub use common::{ContractViolation, SchemaVersion, Validate};
