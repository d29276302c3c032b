use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::error::BindError;
use crate::peer::engine::{DataChannel, EventSink, PeerConnection};
use crate::peer::types::ChannelState;

#[derive(Default)]
struct Slot {
    channel: Option<Arc<dyn DataChannel>>,
    state: ChannelState,
}

/// Жизненный цикл единственного канала сообщений сессии.
///
/// Звонящий создаёт канал сам ([`bind_caller`](Self::bind_caller)),
/// отвечающий получает его от движка ([`bind_incoming`](Self::bind_incoming)).
/// Дальше оба пути одинаковы. Привязка возможна ровно один раз.
#[derive(Clone, Default)]
pub struct DataChannelSession {
    slot: Arc<Mutex<Slot>>,
}

impl DataChannelSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Пустой слот после завершения звонка
    pub fn closed() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                channel: None,
                state: ChannelState::Closed,
            })),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_bound(&self) -> bool {
        self.slot().channel.is_some()
    }

    pub fn state(&self) -> ChannelState {
        self.slot().state
    }

    pub fn can_send(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Канал, если он открыт и в него можно писать
    pub fn open_channel(&self) -> Option<Arc<dyn DataChannel>> {
        let slot = self.slot();
        match slot.state {
            ChannelState::Open => slot.channel.clone(),
            _ => None,
        }
    }

    /// Звонящий: создаём канал на соединении и привязываем его
    pub async fn bind_caller(
        &self,
        pc: &dyn PeerConnection,
        label: &str,
        events: EventSink,
    ) -> Result<Arc<dyn DataChannel>, BindError> {
        if self.is_bound() {
            return Err(BindError::AlreadyBound);
        }
        let channel = pc.create_data_channel(label).await?;
        if let Err(e) = self.bind(channel.clone(), events) {
            channel.close().await;
            return Err(e);
        }
        Ok(channel)
    }

    /// Отвечающий: канал пришёл от движка
    pub fn bind_incoming(
        &self,
        channel: Arc<dyn DataChannel>,
        events: EventSink,
    ) -> Result<(), BindError> {
        self.bind(channel, events)
    }

    fn bind(&self, channel: Arc<dyn DataChannel>, events: EventSink) -> Result<(), BindError> {
        {
            let mut slot = self.slot();
            if slot.channel.is_some() {
                warn!("refusing to bind data channel {}: already bound", channel.label());
                return Err(BindError::AlreadyBound);
            }
            slot.channel = Some(channel.clone());
            slot.state = ChannelState::Connecting;
        }
        info!("data channel {} bound", channel.label());
        // wire после освобождения замка: движок может сразу прислать ChannelOpen
        channel.wire(events);
        Ok(())
    }

    /// Переход по событию движка; true, если состояние изменилось
    pub fn transition(&self, next: ChannelState) -> bool {
        let mut slot = self.slot();
        if slot.channel.is_none() {
            debug!("ignoring channel state {next:?}: nothing bound");
            return false;
        }
        if slot.state == next {
            return false;
        }
        // закрытый канал не переоткрывается
        if matches!(slot.state, ChannelState::Closed | ChannelState::Errored)
            && next == ChannelState::Open
        {
            warn!("ignoring open on a {:?} channel", slot.state);
            return false;
        }
        debug!("data channel {:?} -> {next:?}", slot.state);
        slot.state = next;
        true
    }

    /// Забирает канал при завершении звонка
    pub fn take(&self) -> Option<Arc<dyn DataChannel>> {
        let mut slot = self.slot();
        if slot.channel.is_some() {
            slot.state = ChannelState::Closed;
        }
        slot.channel.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::loopback::LoopbackChannel;
    use tokio::sync::mpsc;

    #[test]
    fn second_bind_is_rejected() {
        let session = DataChannelSession::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        session
            .bind_incoming(Arc::new(LoopbackChannel::detached("chat")), tx.clone())
            .unwrap();
        let second = session.bind_incoming(Arc::new(LoopbackChannel::detached("chat")), tx);
        assert!(matches!(second, Err(BindError::AlreadyBound)));
        assert_eq!(session.state(), ChannelState::Connecting);
    }

    #[test]
    fn state_follows_engine_events() {
        let session = DataChannelSession::new();
        assert!(!session.transition(ChannelState::Open));

        let (tx, _rx) = mpsc::unbounded_channel();
        session
            .bind_incoming(Arc::new(LoopbackChannel::detached("chat")), tx)
            .unwrap();
        assert!(!session.can_send());

        assert!(session.transition(ChannelState::Open));
        assert!(!session.transition(ChannelState::Open));
        assert!(session.can_send());
        assert!(session.open_channel().is_some());

        assert!(session.transition(ChannelState::Errored));
        assert!(!session.transition(ChannelState::Open));
        assert!(!session.can_send());
    }

    #[test]
    fn take_closes_and_unbinds() {
        let session = DataChannelSession::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        session
            .bind_incoming(Arc::new(LoopbackChannel::detached("chat")), tx)
            .unwrap();
        session.transition(ChannelState::Open);

        assert!(session.take().is_some());
        assert!(!session.is_bound());
        assert_eq!(session.state(), ChannelState::Closed);
        assert!(session.take().is_none());
    }
}
