pub mod commands;
pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod peer;
pub mod signaling;
pub mod status;
pub mod utils;

use std::sync::Arc;

pub use config::{CodeEncoding, ServerConfig, SessionConfig};
pub use error::{DecodeError, EngineError, SessionError};
pub use peer::PeerSessionManager;
pub use signaling::{decode, encode, SignalingCode};
pub use status::{Indicator, StatusReport};

/// Точка входа бинарника: консоль поверх webrtc-rs
pub fn run() -> std::io::Result<()> {
    logger::init();

    let config = SessionConfig::from_env();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(commands::serve(Arc::new(peer::RtcEngine::new()), config))
}
