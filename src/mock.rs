//! Scriptable [Connection] used by tests.

use crate::connection::{
    Connection, ConnectionEvent, IceCandidate, RawState, SdpType, SessionDescription,
    SignalingState,
};
use crate::error::Error;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, Semaphore};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    Close,
}

pub struct MockConnection {
    state: Mutex<RawState>,
    calls: Mutex<Vec<Call>>,
    events: broadcast::Sender<ConnectionEvent>,
    /// When set, `create_offer` waits for a permit before completing.
    offer_gate: Mutex<Option<Arc<Semaphore>>>,
    fail_set_remote: AtomicBool,
    fail_create_offer: AtomicBool,
}

impl MockConnection {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(MockConnection {
            state: Mutex::new(RawState::default()),
            calls: Mutex::new(Vec::new()),
            events,
            offer_gate: Mutex::new(None),
            fail_set_remote: AtomicBool::new(false),
            fail_create_offer: AtomicBool::new(false),
        })
    }

    pub fn update<F: FnOnce(&mut RawState)>(&self, f: F) {
        let mut state = self.state.lock().unwrap();
        f(&mut state);
    }

    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    /// Makes `create_offer` hang until permits are added to returned semaphore.
    pub fn gate_offers(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.offer_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn fail_set_remote(&self, fail: bool) {
        self.fail_set_remote.store(fail, Ordering::SeqCst);
    }

    pub fn fail_create_offer(&self, fail: bool) {
        self.fail_create_offer.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn set_signaling(&self, next: SignalingState) {
        self.update(|s| s.signaling_state = next);
        self.emit(ConnectionEvent::SignalingStateChange(next));
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        self.record(Call::CreateOffer);
        let gate = self.offer_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let permit = gate.acquire().await.map_err(|e| Error::connection(e.to_string()))?;
            permit.forget();
        }
        if self.fail_create_offer.load(Ordering::SeqCst) {
            return Err(Error::connection("create offer failed"));
        }
        Ok(SessionDescription::offer("v=0 mock-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, Error> {
        self.record(Call::CreateAnswer);
        Ok(SessionDescription::answer("v=0 mock-answer"))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), Error> {
        self.record(Call::SetLocal(description.sdp_type));
        self.update(|s| s.has_local_description = true);
        match description.sdp_type {
            SdpType::Offer => self.set_signaling(SignalingState::HaveLocalOffer),
            SdpType::Pranswer => self.set_signaling(SignalingState::HaveLocalPranswer),
            SdpType::Answer | SdpType::Rollback => self.set_signaling(SignalingState::Stable),
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), Error> {
        self.record(Call::SetRemote(description.sdp_type));
        if self.fail_set_remote.load(Ordering::SeqCst) {
            return Err(Error::connection("set remote description failed"));
        }
        self.update(|s| s.has_remote_description = true);
        match description.sdp_type {
            SdpType::Offer => self.set_signaling(SignalingState::HaveRemoteOffer),
            SdpType::Pranswer => self.set_signaling(SignalingState::HaveRemotePranswer),
            SdpType::Answer | SdpType::Rollback => self.set_signaling(SignalingState::Stable),
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), Error> {
        self.record(Call::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn raw_state(&self) -> RawState {
        self.state.lock().unwrap().clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), Error> {
        self.record(Call::Close);
        self.set_signaling(SignalingState::Closed);
        self.emit(ConnectionEvent::Close);
        Ok(())
    }
}
