use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::media::{LocalMedia, MediaTrack};
use crate::peer::data_channel::DataChannelSession;
use crate::peer::engine::{DataChannel, EventSink, PeerConnection};
use crate::peer::types::{Capabilities, ConnectionState, IceState, Phase, Role};
use crate::status::{project, StatusReport};

/// Единственная сессия менеджера.
///
/// `generation` увеличивается при каждом завершении звонка: операции и
/// события движка, помеченные старым поколением, отбрасываются.
#[derive(Default)]
pub struct Session {
    pub generation: u64,
    pub role: Role,
    pub phase: Phase,
    pub connection: Option<Arc<dyn PeerConnection>>,
    /// Канал событий текущего соединения, нужен для привязки входящего data channel
    pub sink: Option<EventSink>,
    pub pump: Option<JoinHandle<()>>,
    pub channel: DataChannelSession,
    pub media: Option<Arc<dyn LocalMedia>>,
    pub attached_tracks: Vec<Arc<dyn MediaTrack>>,
    pub session_id: Option<String>,
    pub connection_state: ConnectionState,
    pub ice_state: IceState,
    pub audio_muted: bool,
    pub video_disabled: bool,
}

impl Session {
    pub fn is_live(&self, generation: u64) -> bool {
        self.generation == generation && self.phase != Phase::Closed
    }

    /// Роль назначается один раз за сессию
    pub fn assign_role(&mut self, role: Role) -> bool {
        if self.role != Role::Unassigned || role == Role::Unassigned {
            return false;
        }
        self.role = role;
        true
    }

    /// Только вперёд; возвращает true, если фаза изменилась
    pub fn advance(&mut self, next: Phase) -> bool {
        if next <= self.phase {
            return false;
        }
        self.phase = next;
        true
    }

    pub fn status(&self) -> StatusReport {
        if self.connection.is_none() {
            return StatusReport::default();
        }
        project(self.connection_state, self.ice_state)
    }

    pub fn capabilities(&self) -> Capabilities {
        let fresh = matches!(self.phase, Phase::Idle | Phase::Closed);
        Capabilities {
            can_start: fresh,
            can_call: self.phase == Phase::LocalMediaReady && self.role == Role::Unassigned,
            can_join: self.role == Role::Unassigned
                && matches!(self.phase, Phase::Idle | Phase::LocalMediaReady | Phase::Closed),
            can_set_answer: self.role == Role::Caller && self.phase == Phase::AwaitingRemoteAnswer,
            can_hang_up: !fresh,
            can_send: self.channel.can_send(),
        }
    }

    /// Всё, что нужно освободить при завершении звонка
    pub fn teardown(&mut self) -> Teardown {
        self.generation += 1;
        self.phase = Phase::Closed;
        self.role = Role::Unassigned;
        self.session_id = None;
        self.sink = None;
        self.connection_state = ConnectionState::Closed;
        self.ice_state = IceState::Closed;
        self.audio_muted = false;
        self.video_disabled = false;

        let mut tracks = std::mem::take(&mut self.attached_tracks);
        if let Some(media) = self.media.take() {
            for track in media.tracks() {
                if !tracks.iter().any(|t| Arc::ptr_eq(t, &track)) {
                    tracks.push(track);
                }
            }
        }

        // новый пустой слот: старый мог остаться у незавершённой операции
        let channel = std::mem::replace(&mut self.channel, DataChannelSession::closed());
        Teardown {
            channel: channel.take(),
            connection: self.connection.take(),
            pump: self.pump.take(),
            tracks,
        }
    }
}

pub struct Teardown {
    pub channel: Option<Arc<dyn DataChannel>>,
    pub connection: Option<Arc<dyn PeerConnection>>,
    pub pump: Option<JoinHandle<()>>,
    pub tracks: Vec<Arc<dyn MediaTrack>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_is_assigned_once() {
        let mut session = Session::default();
        assert!(session.assign_role(Role::Caller));
        assert!(!session.assign_role(Role::Answerer));
        assert!(!session.assign_role(Role::Caller));
        assert_eq!(session.role, Role::Caller);
    }

    #[test]
    fn phase_only_moves_forward() {
        let mut session = Session::default();
        assert!(session.advance(Phase::LocalMediaReady));
        assert!(session.advance(Phase::AwaitingRemoteAnswer));
        assert!(!session.advance(Phase::LocalMediaReady));
        assert!(!session.advance(Phase::AwaitingRemoteAnswer));
        assert_eq!(session.phase, Phase::AwaitingRemoteAnswer);
    }

    #[test]
    fn teardown_invalidates_generation() {
        let mut session = Session {
            phase: Phase::LocalMediaReady,
            ..Default::default()
        };
        let generation = session.generation;
        assert!(session.is_live(generation));

        let released = session.teardown();
        assert!(released.connection.is_none());
        assert!(!session.is_live(generation));
        assert_eq!(session.phase, Phase::Closed);
        assert_eq!(session.role, Role::Unassigned);
        assert!(session.capabilities().can_start);
        assert_eq!(session.channel.state(), crate::peer::types::ChannelState::Closed);
    }
}
