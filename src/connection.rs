//! Capability surface of the negotiable endpoint.
//!
//! The media/transport engine itself (ICE gathering, DTLS, SRTP) lives outside of this crate. All
//! the negotiation layer needs from it is captured by the [Connection] trait: the ability to create
//! and apply session descriptions, add remote candidates, read its raw state and subscribe to its
//! events. [crate::rtc::RtcConnection] implements it on top of webrtc-rs.

use crate::error::Error;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use tokio::sync::broadcast;

/// Negotiable WebRTC endpoint.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, Error>;

    async fn create_answer(&self) -> Result<SessionDescription, Error>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), Error>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), Error>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), Error>;

    /// Returns a snapshot of the raw, unnormalized state attributes of this connection.
    async fn raw_state(&self) -> RawState;

    /// Subscribes to the events emitted by this connection from now on.
    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;

    async fn close(&self) -> Result<(), Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

impl Display for SdpType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SdpType::Offer => "offer",
            SdpType::Pranswer => "pranswer",
            SdpType::Answer => "answer",
            SdpType::Rollback => "rollback",
        };
        f.write_str(name)
    }
}

/// Session description in the same JSON shape browsers use: `{"type":"offer","sdp":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new<S: Into<String>>(sdp_type: SdpType, sdp: S) -> Self {
        SessionDescription {
            sdp_type,
            sdp: sdp.into(),
        }
    }

    pub fn offer<S: Into<String>>(sdp: S) -> Self {
        Self::new(SdpType::Offer, sdp)
    }

    pub fn answer<S: Into<String>>(sdp: S) -> Self {
        Self::new(SdpType::Answer, sdp)
    }
}

/// ICE candidate as exchanged with the remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new<S: Into<String>>(candidate: S) -> Self {
        IceCandidate {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

/// Raw state attributes as reported by a [Connection].
///
/// Some engines expose a consolidated `ready_state`, others only the individual signaling and
/// ICE attributes. [crate::monitor::derive_state] turns either shape into a single state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawState {
    pub ready_state: Option<crate::monitor::ConnectionState>,
    pub signaling_state: SignalingState,
    pub ice_connection_state: IceConnectionState,
    pub ice_gathering_state: IceGatheringState,
    pub has_local_description: bool,
    pub has_remote_description: bool,
}

impl Default for RawState {
    fn default() -> Self {
        RawState {
            ready_state: None,
            signaling_state: SignalingState::Stable,
            ice_connection_state: IceConnectionState::New,
            ice_gathering_state: IceGatheringState::New,
            has_local_description: false,
            has_remote_description: false,
        }
    }
}

/// Events emitted by a [Connection].
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    NegotiationNeeded,
    /// Locally gathered candidate. `None` marks the end of gathering.
    IceCandidate(Option<IceCandidate>),
    SignalingStateChange(SignalingState),
    IceConnectionStateChange(IceConnectionState),
    IceGatheringStateChange(IceGatheringState),
    /// Remote peer opened a data channel with a given label.
    DataChannel(String),
    /// Remote peer added a media track of a given kind.
    Track(String),
    Close,
}
