//! `rtc-coupling` couples a WebRTC peer connection with a text based signalling channel, so that
//! connection negotiation happens on its own:
//! - [Signaller] keeps a directory of peers reachable over a [Messenger], answers directory
//!   requests of other peers and routes messages addressed to specific peers.
//! - [Negotiator] binds a single [Connection] to a single remote peer: it turns negotiation
//!   requests into offers, answers remote offers, and buffers ICE candidates that arrive before
//!   a remote description is known.
//! - [StateMonitor] reduces the raw state of a connection into a single [ConnectionState] and
//!   reports its changes.
//!
//! Messages exchanged over a messenger are single text lines, e.g. `/announce|{"id":"a"}` or
//! `/to|b|/sdp|{"type":"offer","sdp":"..."}|{"id":"a"}`. See [codec] for details.
//!
//! # Examples
//!
//! ```rust,no_run
//! use rtc_coupling::{
//!     Connection, Error, MemoryHub, Negotiator, NegotiatorOptions, RtcConnection, RtcOptions,
//!     Signaller, SignallerOptions,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     // in-process messenger hub, real applications would use ie. WebSockets
//!     let hub = MemoryHub::new();
//!     let alice = Signaller::new(hub.connect(), SignallerOptions::with_id("alice"));
//!     let bob = Signaller::new(hub.connect(), SignallerOptions::with_id("bob"));
//!     alice.announce(None).await?;
//!     bob.announce(None).await?;
//!
//!     let c1 = Arc::new(RtcConnection::new(RtcOptions::default()).await?);
//!     let c2 = Arc::new(RtcConnection::new(RtcOptions::default()).await?);
//!     let n1 = Negotiator::start(c1.clone(), "bob", alice, NegotiatorOptions::default()).await;
//!     let n2 = Negotiator::start(c2.clone(), "alice", bob, NegotiatorOptions::default()).await;
//!
//!     // creating a data channel triggers negotiation
//!     let _dc = c1.create_data_channel("test-dc", None).await?;
//!
//!     let mut states = n1.monitor().subscribe();
//!     while let Ok(state) = states.recv().await {
//!         if state.is_active() {
//!             break;
//!         }
//!     }
//!
//!     c1.close().await?;
//!     c2.close().await?;
//!     n1.closed().await;
//!     n2.closed().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod connection;
pub mod error;
pub mod messenger;
pub mod monitor;
pub mod negotiator;
pub mod rtc;
pub mod signaller;

#[cfg(test)]
mod mock;

pub use codec::{Attributes, DirectoryRequest, Envelope, Message};
pub use connection::{
    Connection, ConnectionEvent, IceCandidate, IceConnectionState, IceGatheringState, RawState,
    SdpType, SessionDescription, SignalingState,
};
pub use error::{Error, Result};
pub use messenger::{MemoryHub, MemoryMessenger, Messenger, MessengerEvent};
pub use monitor::{derive_state, get_state, is_active, ConnectionState, StateEvents, StateMonitor};
pub use negotiator::{
    CandidateQueue, NegotiationEvent, Negotiator, NegotiatorOptions, RoundKind, SdpFilter, Stage,
};
pub use rtc::{RtcConnection, RtcOptions};
pub use signaller::{
    BlockId, PeerChannel, PeerRecord, RequestOptions, Signaller, SignallerEvent, SignallerOptions,
};
