//! [Connection] implementation backed by [webrtc](https://webrtc.rs) `RTCPeerConnection`.

use crate::connection::{
    Connection, ConnectionEvent, IceCandidate, IceConnectionState, IceGatheringState, RawState,
    SdpType, SessionDescription, SignalingState,
};
use crate::error::Error;
use async_trait::async_trait;
use std::fmt::Formatter;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

#[derive(Clone, Default)]
pub struct RtcOptions {
    pub rtc_config: RTCConfiguration,
}

impl RtcOptions {
    pub fn with_ice_servers(urls: &[&str]) -> Self {
        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: urls.iter().map(|&url| url.to_owned()).collect(),
                ..Default::default()
            }],
            ..Default::default()
        };
        RtcOptions { rtc_config }
    }
}

/// webrtc-rs peer connection exposed through the [Connection] capability.
pub struct RtcConnection {
    pc: Arc<RTCPeerConnection>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl RtcConnection {
    pub async fn new(options: RtcOptions) -> Result<Self, Error> {
        // Create a MediaEngine object to configure the supported codec
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        // Interceptors provide NACKs, RTCP reports and other features of the RTP/RTCP pipeline.
        // Every peer connection needs its own registry.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(options.rtc_config).await?);
        let (events, _) = broadcast::channel(256);
        Self::bind_events(&pc, &events);
        Ok(RtcConnection { pc, events })
    }

    fn bind_events(pc: &RTCPeerConnection, events: &broadcast::Sender<ConnectionEvent>) {
        {
            let events = events.clone();
            pc.on_negotiation_needed(Box::new(move || {
                let _ = events.send(ConnectionEvent::NegotiationNeeded);
                Box::pin(async move {})
            }));
        }
        {
            let events = events.clone();
            pc.on_ice_candidate(Box::new(move |candidate| {
                match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => {
                            let _ = events.send(ConnectionEvent::IceCandidate(Some(
                                candidate_from_init(init),
                            )));
                        }
                        Err(e) => log::warn!("failed to serialize local candidate: {}", e),
                    },
                    // ICE gathering complete
                    None => {
                        let _ = events.send(ConnectionEvent::IceCandidate(None));
                    }
                }
                Box::pin(async move {})
            }));
        }
        {
            let events = events.clone();
            pc.on_signaling_state_change(Box::new(move |s| {
                if let Some(state) = signaling_state(s) {
                    let _ = events.send(ConnectionEvent::SignalingStateChange(state));
                }
                Box::pin(async move {})
            }));
        }
        {
            let events = events.clone();
            pc.on_ice_connection_state_change(Box::new(move |s| {
                let _ = events.send(ConnectionEvent::IceConnectionStateChange(
                    ice_connection_state(s),
                ));
                Box::pin(async move {})
            }));
        }
        {
            let events = events.clone();
            pc.on_ice_gathering_state_change(Box::new(move |s| {
                let state = match s {
                    RTCIceGathererState::Gathering => Some(IceGatheringState::Gathering),
                    RTCIceGathererState::Complete => Some(IceGatheringState::Complete),
                    RTCIceGathererState::New => Some(IceGatheringState::New),
                    RTCIceGathererState::Unspecified | RTCIceGathererState::Closed => None,
                };
                if let Some(state) = state {
                    let _ = events.send(ConnectionEvent::IceGatheringStateChange(state));
                }
                Box::pin(async move {})
            }));
        }
        {
            let events = events.clone();
            pc.on_peer_connection_state_change(Box::new(move |s| {
                if s == RTCPeerConnectionState::Closed {
                    let _ = events.send(ConnectionEvent::Close);
                }
                Box::pin(async move {})
            }));
        }
        {
            let events = events.clone();
            pc.on_data_channel(Box::new(move |dc| {
                let _ = events.send(ConnectionEvent::DataChannel(dc.label().to_owned()));
                Box::pin(async move {})
            }));
        }
        {
            let events = events.clone();
            pc.on_track(Box::new(move |track, _, _| {
                let _ = events.send(ConnectionEvent::Track(track.kind().to_string()));
                Box::pin(async move {})
            }));
        }
    }

    /// Creates a new data channel. On a fresh connection this triggers negotiation.
    pub async fn create_data_channel(
        &self,
        label: &str,
        init: Option<RTCDataChannelInit>,
    ) -> Result<Arc<RTCDataChannel>, Error> {
        Ok(self.pc.create_data_channel(label, init).await?)
    }
}

impl AsRef<RTCPeerConnection> for RtcConnection {
    fn as_ref(&self) -> &RTCPeerConnection {
        &self.pc
    }
}

impl std::fmt::Debug for RtcConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcConnection")
            .field("signaling_state", &self.pc.signaling_state())
            .field("ice_connection_state", &self.pc.ice_connection_state())
            .finish()
    }
}

#[async_trait]
impl Connection for RtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        let offer = self.pc.create_offer(None).await?;
        Ok(description_from_rtc(offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, Error> {
        let answer = self.pc.create_answer(None).await?;
        Ok(description_from_rtc(answer))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), Error> {
        let description = description_to_rtc(description)?;
        self.pc.set_local_description(description).await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), Error> {
        let description = description_to_rtc(description)?;
        self.pc.set_remote_description(description).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), Error> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn raw_state(&self) -> RawState {
        let signaling_state =
            signaling_state(self.pc.signaling_state()).unwrap_or(SignalingState::Stable);
        let ice_gathering_state = match self.pc.ice_gathering_state() {
            RTCIceGatheringState::Gathering => IceGatheringState::Gathering,
            RTCIceGatheringState::Complete => IceGatheringState::Complete,
            RTCIceGatheringState::New | RTCIceGatheringState::Unspecified => IceGatheringState::New,
        };
        RawState {
            // webrtc-rs has no consolidated ready state, it's always inferred
            ready_state: None,
            signaling_state,
            ice_connection_state: ice_connection_state(self.pc.ice_connection_state()),
            ice_gathering_state,
            has_local_description: self.pc.local_description().await.is_some(),
            has_remote_description: self.pc.remote_description().await.is_some(),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), Error> {
        // RTCPeerConnection::close holds a std mutex guard across await points, so its future
        // isn't Send and has to be driven from a blocking thread
        let pc = self.pc.clone();
        let runtime = Handle::current();
        tokio::task::spawn_blocking(move || runtime.block_on(pc.close()))
            .await
            .map_err(|e| Error::connection(e.to_string()))??;
        // webrtc-rs doesn't always report the final state change once closed
        let _ = self.events.send(ConnectionEvent::Close);
        Ok(())
    }
}

fn signaling_state(s: RTCSignalingState) -> Option<SignalingState> {
    match s {
        RTCSignalingState::Stable => Some(SignalingState::Stable),
        RTCSignalingState::HaveLocalOffer => Some(SignalingState::HaveLocalOffer),
        RTCSignalingState::HaveRemoteOffer => Some(SignalingState::HaveRemoteOffer),
        RTCSignalingState::HaveLocalPranswer => Some(SignalingState::HaveLocalPranswer),
        RTCSignalingState::HaveRemotePranswer => Some(SignalingState::HaveRemotePranswer),
        RTCSignalingState::Closed => Some(SignalingState::Closed),
        RTCSignalingState::Unspecified => None,
    }
}

fn ice_connection_state(s: RTCIceConnectionState) -> IceConnectionState {
    match s {
        RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
    }
}

fn candidate_from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn description_from_rtc(description: RTCSessionDescription) -> SessionDescription {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer | RTCSdpType::Unspecified => SdpType::Offer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Rollback => SdpType::Rollback,
    };
    SessionDescription::new(sdp_type, description.sdp)
}

fn description_to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, Error> {
    let description = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
        // rollback carries no SDP to be parsed
        SdpType::Rollback => serde_json::from_value(serde_json::to_value(&description)?)?,
    };
    Ok(description)
}
