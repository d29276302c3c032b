use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{BindError, EngineError, Result, SessionError};
use crate::media::LocalMedia;
use crate::peer::engine::{EngineEvent, EventSink, EventStream, PeerConnection, PeerEngine};
use crate::peer::ice::{analyze_candidates, IceGatheringGate};
use crate::peer::state::Session;
use crate::peer::types::{
    Capabilities, ChannelState, ConnectionState, Phase, Role, SdpKind, SendOutcome,
    SessionDescription, SessionEvent, TrackKind,
};
use crate::signaling::{self, SignalingCode};
use crate::status::StatusReport;
use crate::utils::random_id;

/// Состояние, общее для менеджера и задачи, которая разбирает события движка
struct Shared {
    session: Mutex<Session>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

/// Управляет единственной peer-to-peer сессией: роли, рукопожатие
/// offer/answer, data channel и завершение звонка.
///
/// События для UI приходят в приёмник, возвращаемый из [`new`](Self::new).
pub struct PeerSessionManager {
    engine: Arc<dyn PeerEngine>,
    config: SessionConfig,
    gate: IceGatheringGate,
    shared: Arc<Shared>,
}

impl PeerSessionManager {
    pub fn new(
        engine: Arc<dyn PeerEngine>,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let gate = IceGatheringGate::new(config.gather_timeout);
        let manager = Self {
            engine,
            config,
            gate,
            shared: Arc::new(Shared {
                session: Mutex::new(Session::default()),
                events,
            }),
        };
        (manager, rx)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.shared.session().phase
    }

    pub fn role(&self) -> Role {
        self.shared.session().role
    }

    pub fn channel_state(&self) -> ChannelState {
        self.shared.session().channel.state()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.shared.session().capabilities()
    }

    pub fn status(&self) -> StatusReport {
        self.shared.session().status()
    }

    /// Локальные медиа готовы, можно звонить
    pub fn start(&self, media: Arc<dyn LocalMedia>) -> Result<()> {
        {
            let mut s = self.shared.session();
            if !matches!(s.phase, Phase::Idle | Phase::Closed) {
                return Err(invalid_state("start", &s));
            }
            info!("local media ready with {} track(s)", media.tracks().len());
            s.media = Some(media);
            s.role = Role::Unassigned;
            s.phase = Phase::LocalMediaReady;
        }
        self.shared.emit(SessionEvent::PhaseChanged(Phase::LocalMediaReady));
        self.shared.emit_capabilities();
        Ok(())
    }

    /// Звонящий: создаём соединение, канал и offer
    pub async fn create_call(&self) -> Result<SignalingCode> {
        const OP: &str = "create_call";

        let (generation, media, session_id) = {
            let mut s = self.shared.session();
            match (s.phase, s.role) {
                (Phase::Idle | Phase::Closed, _) => return Err(SessionError::MediaUnavailable),
                (Phase::LocalMediaReady, Role::Unassigned) => {}
                _ => return Err(invalid_state(OP, &s)),
            }
            s.assign_role(Role::Caller);
            let session_id = random_id();
            s.session_id = Some(session_id.clone());
            (s.generation, s.media.clone(), session_id)
        };
        info!("create_call: starting session {session_id}");
        self.shared.emit_capabilities();

        let (pc, sink) = self.open_connection(generation, OP).await?;
        self.attach_media(generation, &pc, media.as_deref(), OP).await?;
        self.receive_missing_kinds(generation, &pc, media.as_deref(), OP)
            .await?;

        let channel = self.shared.live(generation, OP)?.channel.clone();
        let bound = channel
            .bind_caller(pc.as_ref(), &self.config.channel_label, sink)
            .await;
        self.shared.ensure_live(generation, OP)?;
        bound.map_err(|e| SessionError::Negotiation(e.to_string()))?;

        debug!("Creating offer...");
        let offer = pc.create_offer().await;
        let offer = self.shared.checked(generation, OP, offer)?;
        let applied = pc.set_local_description(offer).await;
        self.shared.checked(generation, OP, applied)?;

        let description = self.gathered_description(generation, &pc, OP).await?;

        let code = {
            let mut s = self.shared.live(generation, OP)?;
            s.advance(Phase::AwaitingRemoteAnswer);
            SignalingCode::new(description, Some(session_id))
        };
        self.shared.emit(SessionEvent::PhaseChanged(Phase::AwaitingRemoteAnswer));
        self.shared.emit_capabilities();
        Ok(code)
    }

    /// Разбор кода по типу: offer делает нас отвечающим, answer завершает
    /// рукопожатие звонящего.
    pub async fn join_call(&self, code: SignalingCode) -> Result<Option<SignalingCode>> {
        match code.kind {
            SdpKind::Offer => self.accept_offer(code).await.map(Some),
            SdpKind::Answer => self.accept_answer(code).await.map(|_| None),
        }
    }

    /// Отвечающий: вставленный текст должен быть offer
    pub async fn answer_call(&self, text: &str) -> Result<SignalingCode> {
        let code = signaling::decode(text)?;
        if code.kind != SdpKind::Offer {
            let s = self.shared.session();
            return Err(unexpected_code(code.kind, &s));
        }
        self.accept_offer(code).await
    }

    /// Звонящий: вставленный текст должен быть answer
    pub async fn set_answer(&self, text: &str) -> Result<()> {
        let code = signaling::decode(text)?;
        if code.kind != SdpKind::Answer {
            let s = self.shared.session();
            return Err(unexpected_code(code.kind, &s));
        }
        self.accept_answer(code).await
    }

    async fn accept_offer(&self, code: SignalingCode) -> Result<SignalingCode> {
        const OP: &str = "join_call";

        let (generation, media) = {
            let mut s = self.shared.session();
            let fresh = matches!(s.phase, Phase::Idle | Phase::LocalMediaReady | Phase::Closed);
            if s.role != Role::Unassigned || !fresh {
                return Err(unexpected_code(SdpKind::Offer, &s));
            }
            s.assign_role(Role::Answerer);
            s.phase = Phase::AwaitingLocalAnswer;
            s.session_id = code.session_id.clone();
            (s.generation, s.media.clone())
        };
        info!(
            "join_call: answering offer {}",
            code.session_id.as_deref().unwrap_or("<unversioned>")
        );
        self.shared.emit(SessionEvent::PhaseChanged(Phase::AwaitingLocalAnswer));
        self.shared.emit_capabilities();

        // входящий data channel привяжет handle_engine_event
        let (pc, _sink) = self.open_connection(generation, OP).await?;
        self.attach_media(generation, &pc, media.as_deref(), OP).await?;

        debug!("Setting remote description (offer)...");
        let applied = pc.set_remote_description(code.description).await;
        self.shared.checked(generation, OP, applied)?;

        debug!("Creating answer...");
        let answer = pc.create_answer().await;
        let answer = self.shared.checked(generation, OP, answer)?;
        let applied = pc.set_local_description(answer).await;
        self.shared.checked(generation, OP, applied)?;

        let description = self.gathered_description(generation, &pc, OP).await?;

        let (reply, changed) = {
            let mut s = self.shared.live(generation, OP)?;
            let changed = s.advance(Phase::ConnectedPending);
            (SignalingCode::new(description, s.session_id.clone()), changed)
        };
        if changed {
            self.shared.emit(SessionEvent::PhaseChanged(Phase::ConnectedPending));
        }
        self.shared.emit_capabilities();
        Ok(reply)
    }

    async fn accept_answer(&self, code: SignalingCode) -> Result<()> {
        const OP: &str = "set_answer";

        let (generation, pc) = {
            let mut s = self.shared.session();
            if s.role != Role::Caller || s.phase != Phase::AwaitingRemoteAnswer {
                return Err(unexpected_code(SdpKind::Answer, &s));
            }
            if let (Some(ours), Some(theirs)) = (&s.session_id, &code.session_id) {
                if ours != theirs {
                    warn!("answer belongs to session {theirs}, expected {ours}");
                    return Err(unexpected_code(SdpKind::Answer, &s));
                }
            }
            let Some(pc) = s.connection.clone() else {
                return Err(invalid_state(OP, &s));
            };
            // сразу занимаем фазу, чтобы второй answer не прошёл параллельно
            s.phase = Phase::ConnectedPending;
            (s.generation, pc)
        };

        debug!("Setting remote description (answer)...");
        if let Err(e) = pc.set_remote_description(code.description).await {
            let mut s = self.shared.live(generation, OP)?;
            if s.phase == Phase::ConnectedPending {
                s.phase = Phase::AwaitingRemoteAnswer;
            }
            return Err(SessionError::negotiation(e));
        }
        // движок мог успеть довести нас до Connected
        let pending = self.shared.live(generation, OP)?.phase == Phase::ConnectedPending;

        info!("Remote description set successfully");
        if pending {
            self.shared.emit(SessionEvent::PhaseChanged(Phase::ConnectedPending));
        }
        self.shared.emit_capabilities();
        Ok(())
    }

    /// Завершение звонка. Не падает, повторный вызов ничего не делает.
    pub async fn hang_up(&self) {
        let (released, had_channel) = {
            let mut s = self.shared.session();
            if s.phase == Phase::Closed {
                debug!("hang_up: already closed");
                return;
            }
            let had_channel = s.channel.is_bound();
            (s.teardown(), had_channel)
        };
        info!("hanging up");

        if let Some(pump) = released.pump {
            pump.abort();
        }
        for track in &released.tracks {
            track.stop();
        }

        // события до await: start может успеть открыть новую сессию
        self.shared.emit(SessionEvent::PhaseChanged(Phase::Closed));
        if had_channel {
            self.shared.emit(SessionEvent::ChannelState(ChannelState::Closed));
        }
        self.shared.emit(SessionEvent::Status(StatusReport::default()));
        self.shared.emit_capabilities();

        if let Some(channel) = released.channel {
            channel.close().await;
        }
        if let Some(pc) = released.connection {
            pc.close().await;
        }
    }

    /// Отправка текста. Без открытого канала сообщение остаётся локальным.
    pub async fn send_message(&self, text: &str) -> Result<SendOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyMessage);
        }

        let channel = self.shared.session().channel.open_channel();
        let outcome = match channel {
            Some(channel) => {
                channel
                    .send_text(text.to_owned())
                    .await
                    .map_err(|e| SessionError::Transport(e.to_string()))?;
                SendOutcome::Sent
            }
            None => {
                debug!("no open data channel, keeping message local");
                SendOutcome::LocalOnly
            }
        };

        self.shared.emit(SessionEvent::Transcript {
            text: text.to_owned(),
            is_local: true,
        });
        Ok(outcome)
    }

    /// Переключает микрофон; возвращает true, если звук теперь выключен
    pub fn toggle_audio(&self) -> Result<bool> {
        self.toggle_track(TrackKind::Audio)
    }

    /// Переключает камеру; возвращает true, если видео теперь выключено
    pub fn toggle_video(&self) -> Result<bool> {
        self.toggle_track(TrackKind::Video)
    }

    fn toggle_track(&self, kind: TrackKind) -> Result<bool> {
        let mut s = self.shared.session();
        let track = s
            .media
            .as_ref()
            .and_then(|m| m.first_track(kind))
            .ok_or(SessionError::MediaUnavailable)?;

        let flag = match kind {
            TrackKind::Audio => &mut s.audio_muted,
            TrackKind::Video => &mut s.video_disabled,
        };
        *flag = !*flag;
        track.set_enabled(!*flag);
        debug!("{kind:?} track {} enabled={}", track.id(), !*flag);
        Ok(*flag)
    }

    /// Создаёт соединение движка и запускает разбор его событий
    async fn open_connection(
        &self,
        generation: u64,
        op: &'static str,
    ) -> Result<(Arc<dyn PeerConnection>, EventSink)> {
        let (sink, stream) = mpsc::unbounded_channel();
        let pc = self.engine.connect(&self.config, sink.clone()).await;
        let pc = self.shared.checked(generation, op, pc)?;

        let status = {
            let mut s = self.shared.session();
            if s.is_live(generation) {
                s.connection = Some(pc.clone());
                s.sink = Some(sink.clone());
                s.connection_state = ConnectionState::New;
                s.ice_state = Default::default();
                s.pump = Some(spawn_event_pump(self.shared.clone(), generation, stream));
                Some(s.status())
            } else {
                None
            }
        };
        let Some(status) = status else {
            debug!("{op}: session closed while connecting, discarding connection");
            pc.close().await;
            return Err(SessionError::Aborted(op));
        };

        self.shared.emit(SessionEvent::Status(status));
        Ok((pc, sink))
    }

    async fn attach_media(
        &self,
        generation: u64,
        pc: &Arc<dyn PeerConnection>,
        media: Option<&dyn LocalMedia>,
        op: &'static str,
    ) -> Result<()> {
        let Some(media) = media else {
            debug!("{op}: no local media, data channel only");
            return Ok(());
        };
        for track in media.tracks() {
            let added = pc.add_track(track.clone()).await;
            self.shared.checked(generation, op, added)?;
            self.shared.live(generation, op)?.attached_tracks.push(track);
        }
        Ok(())
    }

    /// Звонящий всегда готов принимать звук и видео, даже без своих треков
    async fn receive_missing_kinds(
        &self,
        generation: u64,
        pc: &Arc<dyn PeerConnection>,
        media: Option<&dyn LocalMedia>,
        op: &'static str,
    ) -> Result<()> {
        for kind in [TrackKind::Audio, TrackKind::Video] {
            if media.and_then(|m| m.first_track(kind)).is_some() {
                continue;
            }
            debug!("{op}: no local {kind:?} track, offering to receive only");
            let added = pc.ensure_receive(kind).await;
            self.shared.checked(generation, op, added)?;
        }
        Ok(())
    }

    /// Ждём кандидатов и забираем локальное описание с ними
    async fn gathered_description(
        &self,
        generation: u64,
        pc: &Arc<dyn PeerConnection>,
        op: &'static str,
    ) -> Result<SessionDescription> {
        let outcome = self.gate.wait(pc.as_ref()).await;
        debug!("ICE gathering gate resolved: {outcome:?}");
        let description = pc.local_description().await;
        self.shared.ensure_live(generation, op)?;
        let description = description.ok_or_else(|| {
            SessionError::Negotiation("engine has no local description".into())
        })?;
        analyze_candidates(&description.sdp);
        Ok(description)
    }
}

impl Drop for PeerSessionManager {
    fn drop(&mut self) {
        if let Some(pump) = self.shared.session().pump.take() {
            pump.abort();
        }
    }
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Сессия, если операция всё ещё актуальна после await
    fn live(&self, generation: u64, op: &'static str) -> Result<MutexGuard<'_, Session>> {
        let s = self.session();
        if s.is_live(generation) {
            Ok(s)
        } else {
            debug!("{op}: session was hung up, abandoning");
            Err(SessionError::Aborted(op))
        }
    }

    fn ensure_live(&self, generation: u64, op: &'static str) -> Result<()> {
        self.live(generation, op).map(drop)
    }

    /// Ошибка движка после завершения звонка означает отмену, а не сбой
    fn checked<T>(
        &self,
        generation: u64,
        op: &'static str,
        result: std::result::Result<T, EngineError>,
    ) -> Result<T> {
        self.ensure_live(generation, op)?;
        result.map_err(SessionError::negotiation)
    }

    fn emit(&self, event: SessionEvent) {
        // UI мог уже уйти, это не ошибка ядра
        let _ = self.events.send(event);
    }

    fn emit_capabilities(&self) {
        let caps = self.session().capabilities();
        self.emit(SessionEvent::Capabilities(caps));
    }

    /// Синхронная обработка одного уведомления движка
    fn handle_engine_event(&self, generation: u64, event: EngineEvent) -> bool {
        let mut s = self.session();
        if s.generation != generation {
            debug!("dropping stale engine event {event:?}");
            if let EngineEvent::IncomingChannel(channel) = event {
                tokio::spawn(async move { channel.close().await });
            }
            return false;
        }

        match event {
            EngineEvent::ConnectionState(state) => {
                info!("Peer connection state changed to: {state:?}");
                s.connection_state = state;
                let reached = state == ConnectionState::Connected
                    && s.phase == Phase::ConnectedPending
                    && s.advance(Phase::Connected);
                let status = s.status();
                drop(s);
                self.emit(SessionEvent::Status(status));
                if reached {
                    self.emit(SessionEvent::PhaseChanged(Phase::Connected));
                    self.emit_capabilities();
                }
            }
            EngineEvent::IceState(state) => {
                debug!("ICE connection state changed to: {state:?}");
                s.ice_state = state;
                let status = s.status();
                drop(s);
                self.emit(SessionEvent::Status(status));
            }
            EngineEvent::Gathering(state) => {
                debug!("ICE gathering state changed to: {state:?}");
            }
            EngineEvent::IncomingChannel(channel) => {
                let bound = match (s.role, s.sink.clone()) {
                    (Role::Answerer, Some(sink)) => s.channel.bind_incoming(channel.clone(), sink),
                    (role, _) => {
                        warn!("unexpected incoming data channel for role {role:?}");
                        Err(BindError::AlreadyBound)
                    }
                };
                drop(s);
                if let Err(e) = bound {
                    warn!("ignoring incoming data channel {}: {e}", channel.label());
                    tokio::spawn(async move { channel.close().await });
                }
            }
            EngineEvent::ChannelOpen => self.channel_transition(s, ChannelState::Open),
            EngineEvent::ChannelClosed => self.channel_transition(s, ChannelState::Closed),
            EngineEvent::ChannelError(e) => {
                warn!("data channel error: {e}");
                self.channel_transition(s, ChannelState::Errored)
            }
            EngineEvent::ChannelMessage(text) => {
                drop(s);
                debug!("Received message, length: {}", text.len());
                self.emit(SessionEvent::Transcript {
                    text,
                    is_local: false,
                });
            }
            EngineEvent::RemoteTrack(track) => {
                drop(s);
                info!("remote {:?} track {} arrived", track.kind, track.id);
                self.emit(SessionEvent::RemoteTrack(track));
            }
        }
        true
    }

    fn channel_transition(&self, s: MutexGuard<'_, Session>, next: ChannelState) {
        let changed = s.channel.transition(next);
        drop(s);
        if changed {
            info!("data channel is now {next:?}");
            self.emit(SessionEvent::ChannelState(next));
            self.emit_capabilities();
        }
    }
}

fn spawn_event_pump(
    shared: Arc<Shared>,
    generation: u64,
    mut stream: EventStream,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = stream.recv().await {
            if !shared.handle_engine_event(generation, event) {
                break;
            }
        }
        debug!("engine event pump for generation {generation} finished");
    })
}

fn invalid_state(operation: &'static str, s: &Session) -> SessionError {
    SessionError::InvalidState {
        operation,
        phase: s.phase,
        role: s.role,
    }
}

fn unexpected_code(kind: SdpKind, s: &Session) -> SessionError {
    SessionError::UnexpectedCode {
        kind: kind.as_str(),
        phase: s.phase,
        role: s.role,
    }
}
