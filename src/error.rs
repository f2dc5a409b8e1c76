//! Error types for the presence hub
//!
//! Connection-fatal errors, per-frame decode/validation errors and
//! history bridge failures. Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::message::EnvelopeKind;

/// Application-level errors
///
/// All of these end the connection they occur on. None of them
/// ever reach the hub as values; the hub only sees an unregister.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// The hub event loop is gone (fatal - internal channel broken)
    #[error("Hub closed")]
    HubClosed,

    /// Handshake rejected by the identity collaborator
    #[error("Unauthorized")]
    Unauthorized,

    /// No frame (not even a pong) within the liveness deadline
    #[error("Liveness deadline expired")]
    DeadlineExpired,

    /// A single write did not complete within the write deadline
    #[error("Write deadline expired")]
    WriteTimeout,
}

/// Malformed inbound payload
///
/// Non-fatal: the frame is dropped and the connection stays open.
#[derive(Debug, Error)]
#[error("malformed envelope: {0}")]
pub struct DecodeError(#[from] pub serde_json::Error);

/// Well-formed envelope missing fields its kind requires
///
/// Non-fatal: the envelope is dropped and the connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{0} requires non-empty content")]
    MissingContent(EnvelopeKind),

    #[error("{0} requires a recipient user id")]
    MissingRecipient(EnvelopeKind),

    #[error("{0} requires a sender user id")]
    MissingSender(EnvelopeKind),
}

/// History collaborator failure
///
/// Swallowed at the hub boundary; the request is dropped.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history backend unavailable: {0}")]
    Unavailable(String),

    #[error("history query failed: {0}")]
    Query(String),
}

/// Invalid startup configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid session entry '{0}', expected TOKEN:USER_ID:NAME")]
    InvalidSession(String),

    #[error("ping period must be shorter than pong wait")]
    PingNotBeforeDeadline,

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}
