//! Движок на webrtc-rs. Обработчики `on_*` ничего не решают сами: они только
//! переводят состояния webrtc-rs в наши типы и кладут их в канал событий.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use crate::config::{default_ice_servers, ServerConfig, SessionConfig};
use crate::error::EngineError;
use crate::media::MediaTrack;
use crate::peer::engine::{DataChannel, EngineEvent, EventSink, PeerConnection, PeerEngine};
use crate::peer::types::{
    ConnectionState, GatheringState, IceState, RemoteTrack, SessionDescription, TrackKind,
};
use crate::utils::add_ice_url_scheme;

/// Настоящий WebRTC через webrtc-rs
#[derive(Debug, Clone, Copy, Default)]
pub struct RtcEngine;

impl RtcEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerEngine for RtcEngine {
    async fn connect(
        &self,
        config: &SessionConfig,
        events: EventSink,
    ) -> Result<Arc<dyn PeerConnection>, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(rtc_config(&config.ice_servers)).await?);
        let (gathering, _) = watch::channel(GatheringState::New);
        let gathering = Arc::new(gathering);

        install_handlers(&pc, &events, &gathering);
        info!("peer connection created");

        Ok(Arc::new(RtcConnection {
            pc,
            gathering,
        }) as Arc<dyn PeerConnection>)
    }
}

/// Создает конфигурацию для peer connection
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    let servers = if servers.is_empty() {
        default_ice_servers()
    } else {
        servers.to_vec()
    };

    RTCConfiguration {
        ice_servers: ice_servers(&servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn install_handlers(
    pc: &Arc<RTCPeerConnection>,
    events: &EventSink,
    gathering: &Arc<watch::Sender<GatheringState>>,
) {
    let tx = events.clone();
    let weak = Arc::downgrade(pc);
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        debug!("Peer connection state changed to: {st:?}");
        if matches!(
            st,
            RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
        ) {
            let weak = weak.clone();
            tokio::spawn(async move { dump_selected_pair(weak, "BEFORE-FAIL").await });
        }
        if let Some(state) = connection_state(st) {
            let _ = tx.send(EngineEvent::ConnectionState(state));
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |st: RTCIceConnectionState| {
        if let Some(state) = ice_state(st) {
            let _ = tx.send(EngineEvent::IceState(state));
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    let watch_tx = gathering.clone();
    pc.on_ice_gathering_state_change(Box::new(move |st: RTCIceGathererState| {
        if let Some(state) = gathering_state(st) {
            watch_tx.send_replace(state);
            let _ = tx.send(EngineEvent::Gathering(state));
        }
        Box::pin(async {})
    }));

    let watch_tx = gathering.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        match cand {
            Some(c) => {
                if let Ok(init) = c.to_json() {
                    debug!("LOCAL candidate={} sdp_mid={:?}", init.candidate, init.sdp_mid);
                }
            }
            None => {
                // cand == None означает конец сбора
                debug!("ICE candidate gathering completed (null candidate received)");
                watch_tx.send_replace(GatheringState::Complete);
            }
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        info!("incoming data channel {}", dc.label());
        let channel = Arc::new(RtcDataChannel { dc }) as Arc<dyn DataChannel>;
        let _ = tx.send(EngineEvent::IncomingChannel(channel));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _t: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(TrackKind::Audio),
                RTPCodecType::Video => Some(TrackKind::Video),
                _ => None,
            };
            match kind {
                Some(kind) => {
                    let _ = tx.send(EngineEvent::RemoteTrack(RemoteTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                    }));
                }
                None => warn!("remote track {} has unknown kind", track.id()),
            }
            Box::pin(async {})
        },
    ));
}

/// Быстрый снимок getStats: выбранная пара
async fn dump_selected_pair(pc: Weak<RTCPeerConnection>, moment: &str) {
    let Some(pc) = pc.upgrade() else {
        return;
    };
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                debug!(
                    "STATS {moment}: {}:{} bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}

fn connection_state(st: RTCPeerConnectionState) -> Option<ConnectionState> {
    Some(match st {
        RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => return None,
    })
}

fn ice_state(st: RTCIceConnectionState) -> Option<IceState> {
    Some(match st {
        RTCIceConnectionState::New => IceState::New,
        RTCIceConnectionState::Checking => IceState::Checking,
        RTCIceConnectionState::Connected => IceState::Connected,
        RTCIceConnectionState::Completed => IceState::Completed,
        RTCIceConnectionState::Disconnected => IceState::Disconnected,
        RTCIceConnectionState::Failed => IceState::Failed,
        RTCIceConnectionState::Closed => IceState::Closed,
        _ => return None,
    })
}

fn gathering_state(st: RTCIceGathererState) -> Option<GatheringState> {
    Some(match st {
        RTCIceGathererState::New => GatheringState::New,
        RTCIceGathererState::Gathering => GatheringState::Gathering,
        RTCIceGathererState::Complete => GatheringState::Complete,
        _ => return None,
    })
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    let converted = match desc.kind {
        crate::peer::types::SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        crate::peer::types::SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    converted.map_err(|e| EngineError::Description(e.to_string()))
}

fn from_rtc(desc: RTCSessionDescription) -> Option<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Some(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Some(SessionDescription::answer(desc.sdp)),
        other => {
            warn!("unsupported local description type {other:?}");
            None
        }
    }
}

pub struct RtcConnection {
    pc: Arc<RTCPeerConnection>,
    gathering: Arc<watch::Sender<GatheringState>>,
}

#[async_trait]
impl PeerConnection for RtcConnection {
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), EngineError> {
        let local = track
            .local_track()
            .ok_or_else(|| EngineError::Track(format!("track {} has no RTP source", track.id())))?;
        let sender = self
            .pc
            .add_track(local)
            .await
            .map_err(|e| EngineError::Track(e.to_string()))?;

        // RTCP надо читать, иначе не работают перехватчики (NACK и т.п.)
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn ensure_receive(&self, kind: TrackKind) -> Result<(), EngineError> {
        let codec = match kind {
            TrackKind::Audio => RTPCodecType::Audio,
            TrackKind::Video => RTPCodecType::Video,
        };
        self.pc
            .add_transceiver_from_kind(
                codec,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| EngineError::Track(e.to_string()))?;
        debug!("recvonly {kind:?} transceiver added");
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, EngineError> {
        let dc = self
            .pc
            .create_data_channel(label, Some(RTCDataChannelInit::default()))
            .await
            .map_err(|e| EngineError::Channel(e.to_string()))?;
        Ok(Arc::new(RtcDataChannel { dc }) as Arc<dyn DataChannel>)
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| EngineError::Description(e.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| EngineError::Description(e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|e| EngineError::Description(e.to_string()))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| EngineError::Description(e.to_string()))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc.local_description().await.and_then(from_rtc)
    }

    fn gathering_state(&self) -> watch::Receiver<GatheringState> {
        self.gathering.subscribe()
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("closing peer connection: {e}");
        }
    }
}

pub struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    fn wire(&self, events: EventSink) {
        let tx = events.clone();
        self.dc.on_open(Box::new(move || {
            debug!("data channel opened");
            let _ = tx.send(EngineEvent::ChannelOpen);
            Box::pin(async {})
        }));

        let tx = events.clone();
        self.dc.on_close(Box::new(move || {
            debug!("data channel closed");
            let _ = tx.send(EngineEvent::ChannelClosed);
            Box::pin(async {})
        }));

        let tx = events.clone();
        self.dc.on_error(Box::new(move |e: webrtc::Error| {
            let _ = tx.send(EngineEvent::ChannelError(e.to_string()));
            Box::pin(async {})
        }));

        let tx = events.clone();
        self.dc.on_message(Box::new(move |msg: DataChannelMessage| {
            if msg.is_string {
                let text = String::from_utf8_lossy(&msg.data).into_owned();
                let _ = tx.send(EngineEvent::ChannelMessage(text));
            } else {
                debug!("dropping binary message, length: {}", msg.data.len());
            }
            Box::pin(async {})
        }));

        // входящий канал мог открыться раньше, чем мы подписались
        if self.dc.ready_state() == RTCDataChannelState::Open {
            let _ = events.send(EngineEvent::ChannelOpen);
        }
    }

    async fn send_text(&self, text: String) -> Result<(), EngineError> {
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| EngineError::Channel(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            warn!("closing data channel: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_map_onto_core_types() {
        assert_eq!(
            connection_state(RTCPeerConnectionState::Connected),
            Some(ConnectionState::Connected)
        );
        assert_eq!(connection_state(RTCPeerConnectionState::Unspecified), None);
        assert_eq!(
            ice_state(RTCIceConnectionState::Completed),
            Some(IceState::Completed)
        );
        assert_eq!(
            gathering_state(RTCIceGathererState::Complete),
            Some(GatheringState::Complete)
        );
        assert_eq!(gathering_state(RTCIceGathererState::Closed), None);
    }

    #[test]
    fn ice_servers_get_a_scheme() {
        let servers = vec![
            ServerConfig::stun("a", "stun.example.org:3478"),
            ServerConfig {
                id: "b".into(),
                r#type: "turn".into(),
                url: "turn.example.org:3478".into(),
                username: Some("user".into()),
                credential: Some("secret".into()),
            },
        ];
        let converted = ice_servers(&servers);
        assert_eq!(converted[0].urls, vec!["stun:stun.example.org:3478".to_string()]);
        assert_eq!(converted[1].urls, vec!["turn:turn.example.org:3478".to_string()]);
        assert_eq!(converted[1].username, "user");
    }

    #[test]
    fn empty_server_list_falls_back_to_defaults() {
        let config = rtc_config(&[]);
        assert_eq!(config.ice_servers.len(), default_ice_servers().len());
        assert_eq!(config.ice_candidate_pool_size, 10);
    }

    #[tokio::test]
    async fn engine_builds_a_connection() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let pc = RtcEngine::new()
            .connect(&SessionConfig::default(), tx)
            .await
            .unwrap();
        assert_eq!(*pc.gathering_state().borrow(), GatheringState::New);
        assert!(pc.local_description().await.is_none());
        pc.close().await;
    }
    #[tokio::test]
    async fn receive_only_offer_negotiates_audio_and_video() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let pc = RtcEngine::new()
            .connect(&SessionConfig::default(), tx)
            .await
            .unwrap();
        pc.ensure_receive(TrackKind::Audio).await.unwrap();
        pc.ensure_receive(TrackKind::Video).await.unwrap();

        let offer = pc.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("a=recvonly"));
        pc.close().await;
    }
}
