//! Crate-wide error taxonomy and process exit codes.
//!
//! Each subsystem boundary gets its own `thiserror` enum; the supervisor
//! aggregates everything into `anyhow::Error` at the top level. Nothing in
//! this crate unwinds a panic out of the tick loop for an expected failure
//! mode — see the error handling design notes for the policy per kind.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor read timed out after {0}ms")]
    Timeout(u64),
    #[error("sensor I/O error: {0}")]
    Io(String),
    #[error("no primary or backup reading available")]
    NoSource,
}

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("gpio write failed for relay {relay}: {reason}")]
    GpioWriteFailed { relay: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("migration {version} failed: {reason}")]
    MigrationFailed { version: u32, reason: String },
    #[error("store backend unavailable: {0}")]
    Unavailable(String),
    #[error("append failed: {0}")]
    AppendFailed(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("no current_stage row persisted")]
    NoStageRow,
}

#[derive(Debug, Error)]
pub enum BleError {
    #[error("publish timed out after {0}ms")]
    PublishTimeout(u64),
    #[error("adapter unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("advertisement registration failed: {0}")]
    AdvertiseFailed(String),
}

/// Out-of-range or semantically invalid writes are rejected atomically;
/// state is left unchanged.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid threshold profile: {0}")]
    InvalidThresholds(&'static str),
    #[error("unknown enum discriminant {value} for {field}")]
    UnknownDiscriminant { field: &'static str, value: u8 },
    #[error("payload wrong size: expected {expected}, got {actual}")]
    WrongSize { expected: usize, actual: usize },
}

/// Process exit codes, normative per the external interface contract.
pub mod exit_code {
    pub const CLEAN: i32 = 0;
    pub const MIGRATION_FAILURE: i32 = 1;
    pub const STORE_UNAVAILABLE: i32 = 2;
    pub const RELAY_INIT_FAILED: i32 = 3;
    pub const UNHANDLED_FATAL: i32 = 70;
}
