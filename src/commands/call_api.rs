use std::sync::Arc;
use tracing::info;

use crate::commands::{Console, Reply};
use crate::error::{Result, SessionError};
use crate::media::{LocalMedia, MediaTrack, SampleTrack, StaticMedia};
use crate::peer::types::TrackKind;
use crate::signaling::{self, SignalingCode};
use crate::utils::random_id;

impl Console {
    /// Готовит локальные треки. Захват устройств снаружи пишет в них сэмплы.
    pub(crate) fn start(&mut self, data_only: bool) -> Result<Reply> {
        let media: Arc<dyn LocalMedia> = if data_only {
            Arc::new(StaticMedia::data_only())
        } else {
            let stream_id = format!("lancall-{}", random_id());
            let tracks: Vec<Arc<dyn MediaTrack>> = vec![
                Arc::new(SampleTrack::new(TrackKind::Audio, "audio", stream_id.clone())),
                Arc::new(SampleTrack::new(TrackKind::Video, "video", stream_id)),
            ];
            Arc::new(StaticMedia::new(tracks))
        };
        let count = media.tracks().len();
        self.manager.start(media)?;
        self.last_code = None;
        Ok(Reply::Text(format!(
            "local media ready ({count} track(s)), `call` or `answer <code>`"
        )))
    }

    /// A-сторона: печатаем offer
    pub(crate) async fn call(&mut self) -> Result<Reply> {
        let code = self.manager.create_call().await?;
        let text = self.render(&code)?;
        info!("offer ready, fingerprint {}", code.fingerprint());
        let reply = format!(
            "offer (fingerprint {}), send this to the other side:\n{text}",
            code.fingerprint()
        );
        self.last_code = Some(code);
        Ok(Reply::Text(reply))
    }

    /// B-сторона: принимаем offer, печатаем answer
    pub(crate) async fn answer(&mut self, pasted: &str) -> Result<Reply> {
        let code = self.manager.answer_call(pasted).await?;
        let text = self.render(&code)?;
        let reply = format!(
            "answer (fingerprint {}), send this back to the caller:\n{text}",
            code.fingerprint()
        );
        self.last_code = Some(code);
        Ok(Reply::Text(reply))
    }

    /// A-сторона: применяем answer
    pub(crate) async fn accept(&mut self, pasted: &str) -> Result<Reply> {
        self.manager.set_answer(pasted).await?;
        if let Ok(code) = signaling::decode(pasted) {
            self.last_code = Some(code);
        }
        Ok(Reply::Text("answer applied, connecting...".to_owned()))
    }

    pub(crate) async fn hangup(&mut self) -> Result<Reply> {
        self.manager.hang_up().await;
        self.last_code = None;
        Ok(Reply::Text("call ended".to_owned()))
    }

    fn render(&self, code: &SignalingCode) -> Result<String> {
        code.encode(self.encoding)
            .map_err(|e| SessionError::Negotiation(format!("encoding signaling code: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::peer::loopback::LoopbackNetwork;
    use crate::peer::types::Phase;
    use crate::peer::PeerSessionManager;

    fn console(network: &LoopbackNetwork) -> Console {
        let (manager, _events) =
            PeerSessionManager::new(Arc::new(network.engine()), SessionConfig::default());
        Console::new(Arc::new(manager))
    }

    fn pasted(reply: Reply) -> String {
        match reply {
            Reply::Text(text) => text.lines().last().unwrap_or_default().to_owned(),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn console_pair_completes_handshake() {
        let network = LoopbackNetwork::new();
        let mut alice = console(&network);
        let mut bob = console(&network);

        alice.start(false).unwrap();
        let offer = pasted(alice.call().await.unwrap());
        let answer = pasted(bob.answer(&offer).await.unwrap());
        alice.accept(&answer).await.unwrap();

        assert!(alice.manager.phase() >= Phase::ConnectedPending);
        assert_eq!(
            alice.last_code.as_ref().map(SignalingCode::fingerprint),
            bob.last_code.as_ref().map(SignalingCode::fingerprint)
        );

        alice.hangup().await.unwrap();
        assert_eq!(alice.manager.phase(), Phase::Closed);
        assert!(alice.last_code.is_none());
    }

    #[tokio::test]
    async fn call_without_start_reports_missing_media() {
        let network = LoopbackNetwork::new();
        let mut alice = console(&network);
        assert!(matches!(
            alice.call().await,
            Err(SessionError::MediaUnavailable)
        ));
    }
}
