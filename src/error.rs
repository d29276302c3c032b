use thiserror::Error;

use crate::peer::types::{Phase, Role};

/// Ошибки разбора кода сигнализации
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed signaling code: {0}")]
    Malformed(String),
    #[error("unknown signaling code kind: {0}")]
    UnknownKind(String),
    #[error("code kind {envelope} does not match description type {description}")]
    KindMismatch { envelope: String, description: String },
}

/// Ошибки движка WebRTC (webrtc-rs или loopback)
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error("session description rejected: {0}")]
    Description(String),
    #[error("data channel failure: {0}")]
    Channel(String),
    #[error("media track failure: {0}")]
    Track(String),
    #[error("connection closed")]
    Closed,
}

impl From<webrtc::Error> for EngineError {
    fn from(e: webrtc::Error) -> Self {
        EngineError::Setup(e.to_string())
    }
}

/// Ошибки привязки data channel к сессии
#[derive(Debug, Clone, Error)]
pub enum BindError {
    #[error("a data channel is already bound to this session")]
    AlreadyBound,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Ошибки операций сессии
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("{operation} is not allowed in phase {phase:?} (role {role:?})")]
    InvalidState {
        operation: &'static str,
        phase: Phase,
        role: Role,
    },
    #[error("unexpected {kind} code in phase {phase:?} (role {role:?})")]
    UnexpectedCode {
        kind: &'static str,
        phase: Phase,
        role: Role,
    },
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("local media is not available, start the camera first")]
    MediaUnavailable,
    #[error("message is empty")]
    EmptyMessage,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("session was hung up while {0} was in flight")]
    Aborted(&'static str),
}

impl SessionError {
    pub(crate) fn negotiation(e: EngineError) -> Self {
        SessionError::Negotiation(e.to_string())
    }
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
