use tracing::debug;

use crate::commands::{Console, Reply};
use crate::error::Result;
use crate::peer::types::{SendOutcome, SessionEvent};
use crate::status::Indicator;

impl Console {
    /// текст по каналу
    pub(crate) async fn send(&mut self, text: &str) -> Result<Reply> {
        match self.manager.send_message(text).await? {
            SendOutcome::Sent => Ok(Reply::Silent),
            SendOutcome::LocalOnly => Ok(Reply::Text(
                "(not connected, the message stays local)".to_owned(),
            )),
        }
    }

    pub(crate) fn mute(&mut self) -> Result<Reply> {
        let muted = self.manager.toggle_audio()?;
        let state = if muted { "muted" } else { "on" };
        Ok(Reply::Text(format!("microphone {state}")))
    }

    pub(crate) fn video(&mut self) -> Result<Reply> {
        let disabled = self.manager.toggle_video()?;
        let state = if disabled { "off" } else { "on" };
        Ok(Reply::Text(format!("camera {state}")))
    }

    pub(crate) fn status(&self) -> Reply {
        let report = self.manager.status();
        Reply::Text(format!(
            "phase {:?}, role {:?}, connection {}, ice {}, chat {:?}",
            self.manager.phase(),
            self.manager.role(),
            indicator(report.connection),
            indicator(report.ice),
            self.manager.channel_state(),
        ))
    }

    /// получение fingerprint
    pub(crate) fn fingerprint(&self) -> Reply {
        match &self.last_code {
            Some(code) => Reply::Text(format!("fingerprint {}", code.fingerprint())),
            None => Reply::Text("no code exchanged yet".to_owned()),
        }
    }
}

fn indicator(value: Indicator) -> &'static str {
    match value {
        Indicator::Disconnected => "disconnected",
        Indicator::Connecting => "connecting",
        Indicator::Connected => "connected",
    }
}

/// Строка для консоли; None, если событие не интересно человеку
pub fn describe_event(event: &SessionEvent) -> Option<String> {
    match event {
        SessionEvent::PhaseChanged(phase) => Some(format!("* {phase:?}")),
        SessionEvent::Status(report) => Some(format!(
            "* connection {}, ice {}",
            indicator(report.connection),
            indicator(report.ice)
        )),
        SessionEvent::ChannelState(state) => Some(format!("* chat channel {state:?}")),
        SessionEvent::Capabilities(caps) => {
            debug!("capabilities: {caps:?}");
            None
        }
        SessionEvent::Transcript { text, is_local } => {
            let who = if *is_local { "you" } else { "peer" };
            Some(format!("{who}: {text}"))
        }
        SessionEvent::RemoteTrack(track) => {
            Some(format!("* remote {:?} track {}", track.kind, track.id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Command;
    use crate::config::SessionConfig;
    use crate::peer::loopback::LoopbackNetwork;
    use crate::peer::types::{Capabilities, ChannelState};
    use crate::peer::PeerSessionManager;
    use crate::status::StatusReport;
    use std::sync::Arc;

    #[test]
    fn transcript_lines_name_the_author() {
        let local = SessionEvent::Transcript {
            text: "hi".into(),
            is_local: true,
        };
        let remote = SessionEvent::Transcript {
            text: "hello".into(),
            is_local: false,
        };
        assert_eq!(describe_event(&local).as_deref(), Some("you: hi"));
        assert_eq!(describe_event(&remote).as_deref(), Some("peer: hello"));
        assert_eq!(
            describe_event(&SessionEvent::Status(StatusReport::default())).as_deref(),
            Some("* connection disconnected, ice disconnected")
        );
        assert_eq!(
            describe_event(&SessionEvent::ChannelState(ChannelState::Open)).as_deref(),
            Some("* chat channel Open")
        );
        assert!(describe_event(&SessionEvent::Capabilities(Capabilities::default())).is_none());
    }

    #[tokio::test]
    async fn utility_commands_before_a_call() {
        let network = LoopbackNetwork::new();
        let (manager, _events) =
            PeerSessionManager::new(Arc::new(network.engine()), SessionConfig::default());
        let mut console = Console::new(Arc::new(manager));

        assert_eq!(
            console.execute(Command::Fingerprint).await.unwrap(),
            Reply::Text("no code exchanged yet".into())
        );
        assert!(console.execute(Command::Mute).await.is_err());

        console
            .execute(Command::Start { data_only: false })
            .await
            .unwrap();
        assert_eq!(
            console.execute(Command::Mute).await.unwrap(),
            Reply::Text("microphone muted".into())
        );
        assert_eq!(
            console.execute(Command::Video).await.unwrap(),
            Reply::Text("camera off".into())
        );
        assert_eq!(
            console.execute(Command::Send("hi".into())).await.unwrap(),
            Reply::Text("(not connected, the message stays local)".into())
        );
        assert_eq!(
            console.execute(Command::Quit).await.unwrap(),
            Reply::Quit
        );
    }
}
