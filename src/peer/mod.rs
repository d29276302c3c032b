pub mod connection;
pub mod data_channel;
pub mod engine;
pub mod ice;
pub mod loopback;
pub mod rtc;
pub mod state;
pub mod types;

pub use connection::PeerSessionManager;
pub use data_channel::DataChannelSession;
pub use engine::{DataChannel, EngineEvent, PeerConnection, PeerEngine};
pub use ice::{GatherOutcome, IceGatheringGate};
pub use loopback::{GatheringMode, LoopbackEngine, LoopbackNetwork};
pub use rtc::RtcEngine;
pub use types::{
    Capabilities, ChannelState, ConnectionState, GatheringState, IceState, Phase, RemoteTrack,
    Role, SdpKind, SendOutcome, SessionDescription, SessionEvent, TrackKind,
};
