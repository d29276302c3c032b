//! Граница между ядром и движком WebRTC.
//!
//! Движок не зовёт ядро напрямую: всё, что в браузере было обработчиками
//! `onconnectionstatechange`, `ondatachannel` и т.п., приходит сюда как
//! [`EngineEvent`] через канал, выданный при создании соединения.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::config::SessionConfig;
use crate::error::EngineError;
use crate::media::MediaTrack;
use crate::peer::types::{
    ConnectionState, GatheringState, IceState, RemoteTrack, SessionDescription, TrackKind,
};

pub type EventSink = mpsc::UnboundedSender<EngineEvent>;
pub type EventStream = mpsc::UnboundedReceiver<EngineEvent>;

pub enum EngineEvent {
    ConnectionState(ConnectionState),
    IceState(IceState),
    Gathering(GatheringState),
    /// Канал, открытый удалённой стороной (только у отвечающего)
    IncomingChannel(Arc<dyn DataChannel>),
    ChannelOpen,
    ChannelClosed,
    ChannelError(String),
    ChannelMessage(String),
    RemoteTrack(RemoteTrack),
}

impl fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineEvent::ConnectionState(s) => write!(f, "ConnectionState({s:?})"),
            EngineEvent::IceState(s) => write!(f, "IceState({s:?})"),
            EngineEvent::Gathering(s) => write!(f, "Gathering({s:?})"),
            EngineEvent::IncomingChannel(ch) => write!(f, "IncomingChannel({})", ch.label()),
            EngineEvent::ChannelOpen => f.write_str("ChannelOpen"),
            EngineEvent::ChannelClosed => f.write_str("ChannelClosed"),
            EngineEvent::ChannelError(e) => write!(f, "ChannelError({e})"),
            EngineEvent::ChannelMessage(m) => write!(f, "ChannelMessage({} bytes)", m.len()),
            EngineEvent::RemoteTrack(t) => write!(f, "RemoteTrack({t:?})"),
        }
    }
}

/// Фабрика peer connection
#[async_trait]
pub trait PeerEngine: Send + Sync {
    async fn connect(
        &self,
        config: &SessionConfig,
        events: EventSink,
    ) -> Result<Arc<dyn PeerConnection>, EngineError>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), EngineError>;

    /// Принимать медиа этого вида, даже если своего трека нет (recvonly)
    async fn ensure_receive(&self, kind: TrackKind) -> Result<(), EngineError>;

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, EngineError>;

    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    /// Локальное описание с уже собранными кандидатами
    async fn local_description(&self) -> Option<SessionDescription>;

    fn gathering_state(&self) -> watch::Receiver<GatheringState>;

    /// Закрытие не падает, даже если соединение уже закрыто
    async fn close(&self);
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    /// Подписывает события канала (open/close/error/message) на `events`
    fn wire(&self, events: EventSink);

    async fn send_text(&self, text: String) -> Result<(), EngineError>;

    async fn close(&self);
}
