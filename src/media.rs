//! Локальные медиа. Захват камеры и микрофона живёт вне ядра: ядро получает
//! готовый список треков, прикрепляет их к соединению и останавливает при
//! завершении звонка.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::EngineError;
use crate::peer::types::TrackKind;

pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    /// Необратимо: остановленный трек больше не выдаёт данные
    fn stop(&self);
    fn is_stopped(&self) -> bool;

    /// Трек webrtc-rs, если он есть у источника
    fn local_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        None
    }
}

/// Источник локальных медиа (аналог MediaStream)
pub trait LocalMedia: Send + Sync {
    fn tracks(&self) -> Vec<Arc<dyn MediaTrack>>;

    fn first_track(&self, kind: TrackKind) -> Option<Arc<dyn MediaTrack>> {
        self.tracks().into_iter().find(|t| t.kind() == kind)
    }
}

/// Просто набор треков
#[derive(Clone, Default)]
pub struct StaticMedia {
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl StaticMedia {
    pub fn new(tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self { tracks }
    }

    /// Без треков: только текстовый канал
    pub fn data_only() -> Self {
        Self::default()
    }
}

impl LocalMedia for StaticMedia {
    fn tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.tracks.clone()
    }
}

/// Трек, в который внешний захват пишет готовые сэмплы
pub struct SampleTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    track: Arc<TrackLocalStaticSample>,
}

impl SampleTrack {
    pub fn new(kind: TrackKind, id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        let id = id.into();
        let mime_type = match kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.clone(),
            stream_id.into(),
        ));
        Self {
            id,
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            track,
        }
    }

    /// Пишет сэмпл; выключенный или остановленный трек молча его отбрасывает.
    /// Возвращает true, если сэмпл ушёл в трек.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<bool, EngineError> {
        if self.is_stopped() || !self.is_enabled() {
            return Ok(false);
        }
        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| EngineError::Track(e.to_string()))?;
        Ok(true)
    }
}

impl MediaTrack for SampleTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && !self.is_stopped()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn local_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        Some(self.track.clone() as Arc<dyn TrackLocal + Send + Sync>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_track_drops_samples() {
        let track = SampleTrack::new(TrackKind::Audio, "mic", "local");
        assert!(track.is_enabled());

        track.set_enabled(false);
        let written = track
            .write_sample(Bytes::from_static(&[1, 2, 3]), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(!written);
    }

    #[test]
    fn stopped_track_stays_disabled() {
        let track = SampleTrack::new(TrackKind::Video, "cam", "local");
        track.stop();
        track.set_enabled(true);
        assert!(track.is_stopped());
        assert!(!track.is_enabled());
        assert!(track.local_track().is_some());
    }

    #[test]
    fn first_track_finds_by_kind() {
        let mic: Arc<dyn MediaTrack> = Arc::new(SampleTrack::new(TrackKind::Audio, "mic", "s"));
        let cam: Arc<dyn MediaTrack> = Arc::new(SampleTrack::new(TrackKind::Video, "cam", "s"));
        let media = StaticMedia::new(vec![mic, cam]);
        assert_eq!(media.first_track(TrackKind::Video).unwrap().id(), "cam");
        assert!(StaticMedia::data_only().first_track(TrackKind::Audio).is_none());
    }
}
