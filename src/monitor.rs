use crate::connection::{
    Connection, ConnectionEvent, IceConnectionState, IceGatheringState, RawState, SignalingState,
};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio_util::sync::CancellationToken;

/// Normalized lifecycle state of a [Connection].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Active,
    Closed,
}

impl ConnectionState {
    pub fn is_active(&self) -> bool {
        *self == ConnectionState::Active
    }

    pub fn is_closed(&self) -> bool {
        *self == ConnectionState::Closed
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::New => "new",
            ConnectionState::HaveLocalOffer => "have-local-offer",
            ConnectionState::HaveRemoteOffer => "have-remote-offer",
            ConnectionState::HaveLocalPranswer => "have-local-pranswer",
            ConnectionState::HaveRemotePranswer => "have-remote-pranswer",
            ConnectionState::Active => "active",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

impl From<SignalingState> for ConnectionState {
    fn from(value: SignalingState) -> Self {
        match value {
            SignalingState::Stable => ConnectionState::New,
            SignalingState::HaveLocalOffer => ConnectionState::HaveLocalOffer,
            SignalingState::HaveRemoteOffer => ConnectionState::HaveRemoteOffer,
            SignalingState::HaveLocalPranswer => ConnectionState::HaveLocalPranswer,
            SignalingState::HaveRemotePranswer => ConnectionState::HaveRemotePranswer,
            SignalingState::Closed => ConnectionState::Closed,
        }
    }
}

/// Derives a single normalized state out of raw connection attributes.
///
/// A consolidated `ready_state` always wins. Otherwise the state is inferred from the signaling
/// state: a stable connection that already holds both descriptions has finished at least one
/// offer/answer round and is reported as `have-remote-pranswer`, which becomes `active` once ICE
/// reports a connection (or finished gathering).
pub fn derive_state(raw: Option<&RawState>) -> ConnectionState {
    let raw = match raw {
        None => return ConnectionState::Closed,
        Some(raw) => raw,
    };
    if let Some(ready_state) = raw.ready_state {
        return ready_state;
    }
    let mut state = ConnectionState::from(raw.signaling_state);
    if raw.signaling_state == SignalingState::Stable
        && raw.has_local_description
        && raw.has_remote_description
    {
        state = ConnectionState::HaveRemotePranswer;
    }
    if state == ConnectionState::HaveRemotePranswer && ice_ready(raw) {
        state = ConnectionState::Active;
    }
    state
}

fn ice_ready(raw: &RawState) -> bool {
    matches!(
        raw.ice_connection_state,
        IceConnectionState::Connected | IceConnectionState::Completed
    ) || raw.ice_gathering_state == IceGatheringState::Complete
}

/// Normalized state of a given connection. Absent connection is reported as closed.
pub async fn get_state(connection: Option<&dyn Connection>) -> ConnectionState {
    match connection {
        None => ConnectionState::Closed,
        Some(connection) => {
            let raw = connection.raw_state().await;
            derive_state(Some(&raw))
        }
    }
}

/// Checks if connection is active. Besides the derived state being `active`, the signaling state
/// must be `stable`: a derived `active` can show up transiently in the middle of renegotiation.
pub fn is_active(raw: &RawState) -> bool {
    raw.signaling_state == SignalingState::Stable && derive_state(Some(raw)).is_active()
}

/// Watches over a [Connection] and emits normalized state transitions.
///
/// Transitions are edge-triggered: the same state is never emitted twice in a row. Once the
/// connection reaches `closed`, the monitor stops listening but its last state stays queryable.
#[derive(Clone)]
pub struct StateMonitor {
    state: Arc<ArcSwap<ConnectionState>>,
    events: broadcast::Sender<ConnectionState>,
    /// Initial state handed to subscribers until the first transition, set only when the
    /// connection was already active at start.
    initial: Arc<Mutex<Option<ConnectionState>>>,
    stop: CancellationToken,
}

impl StateMonitor {
    pub async fn start(connection: Arc<dyn Connection>) -> Self {
        // subscribe before reading the initial state, so that no change slips in between
        let mut rx = connection.subscribe();
        let initial = get_state(Some(&*connection)).await;
        let state = Arc::new(ArcSwap::from_pointee(initial));
        let (events, _) = broadcast::channel(64);
        let pending = Arc::new(Mutex::new(if initial.is_active() {
            Some(initial)
        } else {
            None
        }));
        let stop = CancellationToken::new();
        let monitor = StateMonitor {
            state: state.clone(),
            events: events.clone(),
            initial: pending.clone(),
            stop: stop.clone(),
        };
        if initial.is_closed() {
            stop.cancel();
            return monitor;
        }
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    event = rx.recv() => event,
                };
                let next = match event {
                    Ok(ConnectionEvent::SignalingStateChange(_))
                    | Ok(ConnectionEvent::IceConnectionStateChange(_))
                    | Ok(ConnectionEvent::IceGatheringStateChange(_))
                    | Err(RecvError::Lagged(_)) => get_state(Some(&*connection)).await,
                    Ok(ConnectionEvent::Close) | Err(RecvError::Closed) => ConnectionState::Closed,
                    Ok(_) => continue,
                };
                let prev = state.swap(Arc::new(next));
                if *prev != next {
                    log::trace!("connection state changed: {} -> {}", prev, next);
                    let mut pending = pending.lock().unwrap_or_else(|e| e.into_inner());
                    pending.take();
                    let _ = events.send(next);
                }
                if next.is_closed() {
                    break;
                }
            }
            stop.cancel();
        });
        monitor
    }

    /// Last observed state of the connection.
    pub fn state(&self) -> ConnectionState {
        **self.state.load()
    }

    /// Subscribes to future state transitions. If the connection was already active when the
    /// monitor started, subscribers attached before the first transition receive `active` first.
    pub fn subscribe(&self) -> StateEvents {
        let initial = self.initial.lock().unwrap_or_else(|e| e.into_inner());
        StateEvents {
            initial: *initial,
            rx: self.events.subscribe(),
        }
    }

    /// Detaches the monitor from its connection. Calling it more than once has no effect.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves once the monitor has been stopped or the connection got closed.
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }
}

/// Stream of state transitions returned by [StateMonitor::subscribe].
#[derive(Debug)]
pub struct StateEvents {
    initial: Option<ConnectionState>,
    rx: broadcast::Receiver<ConnectionState>,
}

impl StateEvents {
    pub async fn recv(&mut self) -> Result<ConnectionState, RecvError> {
        match self.initial.take() {
            Some(state) => Ok(state),
            None => self.rx.recv().await,
        }
    }

    pub fn try_recv(&mut self) -> Result<ConnectionState, TryRecvError> {
        match self.initial.take() {
            Some(state) => Ok(state),
            None => self.rx.try_recv(),
        }
    }
}

impl std::fmt::Debug for StateMonitor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMonitor")
            .field("state", &self.state())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
