//! In-memory движок: два соединения в одной сети `LoopbackNetwork`
//! соединяются без сокетов. Используется в тестах и для симуляции.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;

use crate::config::SessionConfig;
use crate::error::EngineError;
use crate::media::MediaTrack;
use crate::peer::engine::{DataChannel, EngineEvent, EventSink, PeerConnection, PeerEngine};
use crate::peer::types::{
    ConnectionState, GatheringState, IceState, RemoteTrack, SdpKind, SessionDescription,
    TrackKind,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Как ведёт себя сбор кандидатов
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GatheringMode {
    #[default]
    Immediate,
    After(Duration),
    /// Сбор никогда не завершается (симметричный NAT без TURN)
    Never,
}

#[derive(Default)]
struct NetworkState {
    next_id: u64,
    connections: Vec<Arc<LoopbackConnection>>,
}

/// Общая "сеть" для пары движков
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engine(&self) -> LoopbackEngine {
        LoopbackEngine {
            network: self.clone(),
            gathering: GatheringMode::default(),
            fail_offer: false,
            negotiation_delay: None,
        }
    }

    /// Все соединения в порядке создания
    pub fn connections(&self) -> Vec<Arc<LoopbackConnection>> {
        lock(&self.inner).connections.clone()
    }

    fn find(&self, id: &str) -> Option<Arc<LoopbackConnection>> {
        lock(&self.inner)
            .connections
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }
}

#[derive(Clone)]
pub struct LoopbackEngine {
    network: LoopbackNetwork,
    gathering: GatheringMode,
    fail_offer: bool,
    negotiation_delay: Option<Duration>,
}

impl LoopbackEngine {
    pub fn with_gathering(mut self, gathering: GatheringMode) -> Self {
        self.gathering = gathering;
        self
    }

    /// create_offer будет отклонён движком
    pub fn failing_offers(mut self) -> Self {
        self.fail_offer = true;
        self
    }

    /// create_offer/create_answer засыпают на `delay`, как медленный движок
    pub fn with_negotiation_delay(mut self, delay: Duration) -> Self {
        self.negotiation_delay = Some(delay);
        self
    }
}

#[async_trait]
impl PeerEngine for LoopbackEngine {
    async fn connect(
        &self,
        _config: &SessionConfig,
        events: EventSink,
    ) -> Result<Arc<dyn PeerConnection>, EngineError> {
        let conn = {
            let mut net = lock(&self.network.inner);
            net.next_id += 1;
            let conn = Arc::new(LoopbackConnection {
                id: format!("lb{}", net.next_id),
                network: Arc::downgrade(&self.network.inner),
                events,
                gathering_mode: self.gathering,
                fail_offer: self.fail_offer,
                negotiation_delay: self.negotiation_delay,
                gathering: Arc::new(watch::channel(GatheringState::New).0),
                state: Mutex::new(ConnState::default()),
            });
            net.connections.push(conn.clone());
            conn
        };
        Ok(conn as Arc<dyn PeerConnection>)
    }
}

#[derive(Default)]
struct ConnState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    peer: Option<Weak<LoopbackConnection>>,
    channel: Option<Arc<LoopbackChannel>>,
    channels_created: usize,
    tracks: Vec<(String, TrackKind)>,
    receive_only: Vec<TrackKind>,
    closed: bool,
}

pub struct LoopbackConnection {
    id: String,
    network: Weak<Mutex<NetworkState>>,
    events: EventSink,
    gathering_mode: GatheringMode,
    fail_offer: bool,
    negotiation_delay: Option<Duration>,
    gathering: Arc<watch::Sender<GatheringState>>,
    state: Mutex<ConnState>,
}

impl LoopbackConnection {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Подсунуть ядру произвольное событие, как будто его прислал движок
    pub fn inject(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Сколько data channel создано локально через create_data_channel
    pub fn channels_created(&self) -> usize {
        lock(&self.state).channels_created
    }

    pub fn track_ids(&self) -> Vec<String> {
        lock(&self.state).tracks.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Виды медиа, добавленные через ensure_receive
    pub fn receive_only(&self) -> Vec<TrackKind> {
        lock(&self.state).receive_only.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn has_remote_description(&self) -> bool {
        lock(&self.state).remote.is_some()
    }

    fn lookup(&self, id: &str) -> Option<Arc<LoopbackConnection>> {
        let inner = self.network.upgrade()?;
        LoopbackNetwork { inner }.find(id)
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if lock(&self.state).closed {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    /// Медленный движок; после close ожидание заканчивается ошибкой
    async fn negotiate(&self) -> Result<(), EngineError> {
        if let Some(delay) = self.negotiation_delay {
            tokio::time::sleep(delay).await;
        }
        self.ensure_open()
    }

    fn render_sdp(&self) -> String {
        let state = lock(&self.state);
        let mut sdp = format!("v=0\r\no=loopback {} 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n", self.id);
        for (id, kind) in &state.tracks {
            let media = media_name(*kind);
            sdp.push_str(&format!("m={media} 9 UDP/TLS/RTP/SAVPF 96\r\na=msid:loopback {id}\r\n"));
        }
        for kind in &state.receive_only {
            let media = media_name(*kind);
            sdp.push_str(&format!("m={media} 9 UDP/TLS/RTP/SAVPF 96\r\na=recvonly\r\n"));
        }
        sdp.push_str("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n");
        sdp
    }

    fn start_gathering(&self) {
        self.gathering.send_replace(GatheringState::Gathering);
        let _ = self.events.send(EngineEvent::Gathering(GatheringState::Gathering));

        match self.gathering_mode {
            GatheringMode::Immediate => complete_gathering(&self.gathering, &self.events),
            GatheringMode::After(delay) => {
                let gathering = self.gathering.clone();
                let events = self.events.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    complete_gathering(&gathering, &events);
                });
            }
            GatheringMode::Never => {}
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Звонящий применил answer: оба конца переходят в connected
    fn establish(caller: &Arc<Self>, answerer: &Arc<Self>) {
        lock(&caller.state).peer = Some(Arc::downgrade(answerer));
        lock(&answerer.state).peer = Some(Arc::downgrade(caller));

        for conn in [caller, answerer] {
            conn.emit(EngineEvent::ConnectionState(ConnectionState::Connecting));
            conn.emit(EngineEvent::IceState(IceState::Checking));
        }

        for (from, to) in [(caller, answerer), (answerer, caller)] {
            let tracks = lock(&from.state).tracks.clone();
            for (id, kind) in tracks {
                to.emit(EngineEvent::RemoteTrack(RemoteTrack {
                    id,
                    stream_id: from.id.clone(),
                    kind,
                }));
            }
        }

        let offered = lock(&caller.state).channel.clone();
        if let Some(local) = offered {
            let remote = Arc::new(LoopbackChannel::detached(local.label()));
            lock(&answerer.state).channel = Some(remote.clone());
            answerer.emit(EngineEvent::IncomingChannel(remote.clone() as Arc<dyn DataChannel>));
            LoopbackChannel::link(&local, &remote);
        }

        for conn in [caller, answerer] {
            conn.emit(EngineEvent::ConnectionState(ConnectionState::Connected));
            conn.emit(EngineEvent::IceState(IceState::Connected));
        }
    }
}

fn complete_gathering(gathering: &watch::Sender<GatheringState>, events: &EventSink) {
    gathering.send_replace(GatheringState::Complete);
    let _ = events.send(EngineEvent::Gathering(GatheringState::Complete));
}

fn media_name(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Audio => "audio",
        TrackKind::Video => "video",
    }
}

fn loopback_origin(sdp: &str) -> Option<&str> {
    sdp.lines()
        .find_map(|line| line.strip_prefix("o=loopback "))
        .and_then(|rest| rest.split_whitespace().next())
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), EngineError> {
        self.ensure_open()?;
        lock(&self.state)
            .tracks
            .push((track.id().to_owned(), track.kind()));
        Ok(())
    }

    async fn ensure_receive(&self, kind: TrackKind) -> Result<(), EngineError> {
        self.ensure_open()?;
        let mut state = lock(&self.state);
        if !state.tracks.iter().any(|(_, k)| *k == kind) && !state.receive_only.contains(&kind) {
            state.receive_only.push(kind);
        }
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, EngineError> {
        self.ensure_open()?;
        let channel = Arc::new(LoopbackChannel::detached(label));
        let mut state = lock(&self.state);
        state.channel = Some(channel.clone());
        state.channels_created += 1;
        Ok(channel as Arc<dyn DataChannel>)
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        self.negotiate().await?;
        if self.fail_offer {
            return Err(EngineError::Description("offer creation rejected".into()));
        }
        Ok(SessionDescription::offer(self.render_sdp()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.negotiate().await?;
        let has_offer = matches!(
            lock(&self.state).remote,
            Some(SessionDescription {
                kind: SdpKind::Offer,
                ..
            })
        );
        if !has_offer {
            return Err(EngineError::Description("no remote offer to answer".into()));
        }
        Ok(SessionDescription::answer(self.render_sdp()))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.ensure_open()?;
        lock(&self.state).local = Some(desc);
        self.start_gathering();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.ensure_open()?;
        let peer_id = loopback_origin(&desc.sdp)
            .ok_or_else(|| EngineError::Description("not a loopback description".into()))?;
        let peer = self
            .lookup(peer_id)
            .ok_or_else(|| EngineError::Description(format!("unknown loopback peer {peer_id}")))?;

        match desc.kind {
            SdpKind::Offer => {
                lock(&self.state).remote = Some(desc);
                Ok(())
            }
            SdpKind::Answer => {
                let offered = matches!(
                    lock(&self.state).local,
                    Some(SessionDescription {
                        kind: SdpKind::Offer,
                        ..
                    })
                );
                if !offered {
                    return Err(EngineError::Description("answer without a local offer".into()));
                }
                let me = self.lookup(&self.id).ok_or(EngineError::Closed)?;
                lock(&self.state).remote = Some(desc);
                LoopbackConnection::establish(&me, &peer);
                Ok(())
            }
        }
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let mut desc = lock(&self.state).local.clone()?;
        if *self.gathering.borrow() == GatheringState::Complete {
            desc.sdp.push_str("a=candidate:1 1 udp 2130706431 127.0.0.1 9 typ host\r\n");
        }
        Some(desc)
    }

    fn gathering_state(&self) -> watch::Receiver<GatheringState> {
        self.gathering.subscribe()
    }

    async fn close(&self) {
        let (channel, peer) = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
            (state.channel.take(), state.peer.take())
        };

        if let Some(channel) = channel {
            channel.close().await;
        }
        self.emit(EngineEvent::ConnectionState(ConnectionState::Closed));
        if let Some(peer) = peer.and_then(|p| p.upgrade()) {
            peer.emit(EngineEvent::ConnectionState(ConnectionState::Disconnected));
            peer.emit(EngineEvent::IceState(IceState::Disconnected));
        }
    }
}

/// Канал сообщений loopback-соединения
pub struct LoopbackChannel {
    label: String,
    sink: Mutex<Option<EventSink>>,
    peer: Mutex<Weak<LoopbackChannel>>,
    open: AtomicBool,
    closed: AtomicBool,
}

impl LoopbackChannel {
    /// Канал без пары
    pub fn detached(label: &str) -> Self {
        Self {
            label: label.to_owned(),
            sink: Mutex::new(None),
            peer: Mutex::new(Weak::new()),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn deliver(&self, event: EngineEvent) {
        if let Some(sink) = lock(&self.sink).as_ref() {
            let _ = sink.send(event);
        }
    }

    fn link(a: &Arc<Self>, b: &Arc<Self>) {
        *lock(&a.peer) = Arc::downgrade(b);
        *lock(&b.peer) = Arc::downgrade(a);
        for ch in [a, b] {
            ch.open.store(true, Ordering::SeqCst);
            ch.deliver(EngineEvent::ChannelOpen);
        }
    }
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn wire(&self, events: EventSink) {
        // под замком sink, иначе link может открыть канал между проверкой и записью
        let mut sink = lock(&self.sink);
        if self.open.load(Ordering::SeqCst) && !self.is_closed() {
            let _ = events.send(EngineEvent::ChannelOpen);
        }
        *sink = Some(events);
    }

    async fn send_text(&self, text: String) -> Result<(), EngineError> {
        if self.is_closed() || !self.open.load(Ordering::SeqCst) {
            return Err(EngineError::Channel("data channel is not open".into()));
        }
        let peer = lock(&self.peer).upgrade();
        match peer {
            Some(peer) => {
                peer.deliver(EngineEvent::ChannelMessage(text));
                Ok(())
            }
            None => Err(EngineError::Channel("peer channel is gone".into())),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.deliver(EngineEvent::ChannelClosed);
        let peer = std::mem::take(&mut *lock(&self.peer)).upgrade();
        if let Some(peer) = peer {
            if !peer.closed.swap(true, Ordering::SeqCst) {
                peer.deliver(EngineEvent::ChannelClosed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn linked_channels_deliver_text() {
        let a = Arc::new(LoopbackChannel::detached("chat"));
        let b = Arc::new(LoopbackChannel::detached("chat"));
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        a.wire(tx_a);
        LoopbackChannel::link(&a, &b);
        assert!(matches!(rx_a.recv().await, Some(EngineEvent::ChannelOpen)));

        // b подписывается уже после открытия и всё равно видит open
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        b.wire(tx_b);
        assert!(matches!(rx_b.recv().await, Some(EngineEvent::ChannelOpen)));

        a.send_text("hi".into()).await.unwrap();
        match rx_b.recv().await {
            Some(EngineEvent::ChannelMessage(text)) => assert_eq!(text, "hi"),
            other => panic!("unexpected {other:?}"),
        }

        a.close().await;
        assert!(matches!(rx_a.recv().await, Some(EngineEvent::ChannelClosed)));
        assert!(matches!(rx_b.recv().await, Some(EngineEvent::ChannelClosed)));
        assert!(b.send_text("late".into()).await.is_err());
    }

    #[tokio::test]
    async fn answer_requires_known_peer() {
        let network = LoopbackNetwork::new();
        let engine = network.engine();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pc = engine.connect(&SessionConfig::default(), tx).await.unwrap();

        let foreign = SessionDescription::offer("v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n");
        assert!(pc.set_remote_description(foreign).await.is_err());
        assert!(pc.create_answer().await.is_err());
    }

    #[tokio::test]
    async fn local_description_gains_candidates_after_gathering() {
        let network = LoopbackNetwork::new();
        let engine = network.engine().with_gathering(GatheringMode::Never);
        let (tx, _rx) = mpsc::unbounded_channel();
        let pc = engine.connect(&SessionConfig::default(), tx).await.unwrap();

        let offer = pc.create_offer().await.unwrap();
        pc.set_local_description(offer).await.unwrap();
        let desc = pc.local_description().await.unwrap();
        assert!(!desc.sdp.contains("a=candidate"));
        assert_eq!(*pc.gathering_state().borrow(), GatheringState::Gathering);
    }

    #[tokio::test]
    async fn receive_only_kinds_show_up_in_the_offer() {
        let network = LoopbackNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pc = network
            .engine()
            .connect(&SessionConfig::default(), tx)
            .await
            .unwrap();

        pc.ensure_receive(TrackKind::Video).await.unwrap();
        pc.ensure_receive(TrackKind::Video).await.unwrap();
        assert_eq!(network.connections()[0].receive_only(), vec![TrackKind::Video]);

        let offer = pc.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=recvonly"));
        assert!(!offer.sdp.contains("m=audio"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_offer_fails_once_closed() {
        let network = LoopbackNetwork::new();
        let engine = network
            .engine()
            .with_negotiation_delay(Duration::from_millis(200));
        let (tx, _rx) = mpsc::unbounded_channel();
        let pc = engine.connect(&SessionConfig::default(), tx).await.unwrap();

        let pending = tokio::spawn({
            let pc = pc.clone();
            async move { pc.create_offer().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        pc.close().await;
        assert!(matches!(pending.await.unwrap(), Err(EngineError::Closed)));
    }
}
