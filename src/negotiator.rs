use crate::codec::{Attributes, Message};
use crate::connection::{Connection, ConnectionEvent, IceCandidate, SdpType, SessionDescription};
use crate::error::Error;
use crate::monitor::{ConnectionState, StateEvents, StateMonitor};
use crate::signaller::{PeerChannel, RequestOptions, Signaller, SignallerEvent};
use arc_swap::{ArcSwap, ArcSwapOption};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt::Formatter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Transformation applied to locally created session descriptions before they are applied.
pub type SdpFilter = Arc<dyn Fn(SessionDescription) -> SessionDescription + Send + Sync>;

#[derive(Clone)]
pub struct NegotiatorOptions {
    /// Timeout of the directory request used to reach the target peer. `None` waits forever.
    pub request_timeout: Option<Duration>,
    pub sdp_filter: Option<SdpFilter>,
    pub event_capacity: usize,
}

impl Default for NegotiatorOptions {
    fn default() -> Self {
        NegotiatorOptions {
            request_timeout: None,
            sdp_filter: None,
            event_capacity: 64,
        }
    }
}

impl std::fmt::Debug for NegotiatorOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiatorOptions")
            .field("request_timeout", &self.request_timeout)
            .field("sdp_filter", &self.sdp_filter.is_some())
            .field("event_capacity", &self.event_capacity)
            .finish()
    }
}

/// Step of negotiation at which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Discovery,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddIceCandidate,
    Transmit,
}

#[derive(Debug, Clone)]
pub enum NegotiationEvent {
    /// Local description has been applied and sent to the remote peer.
    LocalDescription(SdpType),
    /// Remote description has been applied.
    RemoteDescription(SdpType),
    Failed { stage: Stage, reason: Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Negotiating(RoundKind),
    Closed,
}

/// Remote ICE candidates waiting for the remote description.
///
/// Until [CandidateQueue::flush] is called candidates are buffered in arrival order. Flushing
/// hands them out exactly once, after that every accepted candidate is meant to be applied right
/// away.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    remote_ready: bool,
    pending: VecDeque<IceCandidate>,
}

impl CandidateQueue {
    pub fn new(remote_ready: bool) -> Self {
        CandidateQueue {
            remote_ready,
            pending: VecDeque::new(),
        }
    }

    /// Returns the candidate back if it can be applied immediately, otherwise buffers it.
    pub fn accept(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_ready {
            Some(candidate)
        } else {
            self.pending.push_back(candidate);
            None
        }
    }

    /// Marks remote description as applied and drains buffered candidates.
    pub fn flush(&mut self) -> Vec<IceCandidate> {
        self.remote_ready = true;
        self.pending.drain(..).collect()
    }

    pub fn is_remote_ready(&self) -> bool {
        self.remote_ready
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Drives a single [Connection] through offer/answer rounds with a single remote peer.
///
/// At most one round is in flight at any time: negotiation requested while another round is in
/// progress is dropped, not queued. Every round holds a [Signaller::block] until its description
/// has been sent out. Simultaneous offers from both sides (glare) are not resolved here, callers
/// needing it should decide which side is allowed to offer (ie. by comparing peer ids).
///
/// Dropping the negotiator detaches it from both the connection and the signaller.
pub struct Negotiator {
    inner: Arc<NegotiatorInner>,
    monitor: StateMonitor,
}

struct NegotiatorInner {
    connection: Arc<dyn Connection>,
    target: String,
    signaller: Signaller,
    options: NegotiatorOptions,
    phase: ArcSwap<Phase>,
    channel: ArcSwapOption<PeerChannel>,
    offer_pending: AtomicBool,
    candidates: Mutex<CandidateQueue>,
    remote_descriptions: mpsc::UnboundedSender<SessionDescription>,
    events: broadcast::Sender<NegotiationEvent>,
    shutdown: CancellationToken,
}

impl Negotiator {
    pub async fn start<S: Into<String>>(
        connection: Arc<dyn Connection>,
        target: S,
        signaller: Signaller,
        options: NegotiatorOptions,
    ) -> Self {
        let monitor = StateMonitor::start(connection.clone()).await;
        let monitor_rx = monitor.subscribe();
        let connection_rx = connection.subscribe();
        let signaller_rx = signaller.subscribe();
        let raw = connection.raw_state().await;
        let (events, _) = broadcast::channel(options.event_capacity);
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        let phase = if monitor.state().is_closed() {
            Phase::Closed
        } else {
            Phase::Idle
        };
        let inner = Arc::new(NegotiatorInner {
            connection,
            target: target.into(),
            signaller,
            options,
            phase: ArcSwap::from_pointee(phase),
            channel: ArcSwapOption::empty(),
            offer_pending: AtomicBool::new(false),
            candidates: Mutex::new(CandidateQueue::new(raw.has_remote_description)),
            remote_descriptions: remote_tx,
            events,
            shutdown: CancellationToken::new(),
        });
        if phase == Phase::Closed {
            inner.shutdown.cancel();
        } else {
            Self::spawn_channel_request(inner.clone());
            Self::spawn_remote_worker(inner.clone(), remote_rx);
            Self::spawn_event_loop(
                inner.clone(),
                monitor.clone(),
                monitor_rx,
                connection_rx,
                signaller_rx,
            );
        }
        Negotiator { inner, monitor }
    }

    fn spawn_channel_request(inner: Arc<NegotiatorInner>) {
        tokio::spawn(async move {
            let mut criteria = Attributes::new();
            criteria.insert("id".into(), Value::String(inner.target.clone()));
            let options = RequestOptions {
                timeout: inner.options.request_timeout,
            };
            let result = tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                result = inner.signaller.request(criteria, options) => result,
            };
            match result {
                Ok(channel) => inner.open_channel(channel),
                Err(e) => inner.fail(Stage::Discovery, e),
            }
        });
    }

    fn spawn_remote_worker(
        inner: Arc<NegotiatorInner>,
        mut rx: mpsc::UnboundedReceiver<SessionDescription>,
    ) {
        tokio::spawn(async move {
            loop {
                let description = tokio::select! {
                    biased;
                    _ = inner.shutdown.cancelled() => break,
                    description = rx.recv() => match description {
                        Some(description) => description,
                        None => break,
                    },
                };
                inner.apply_remote_description(description).await;
            }
        });
    }

    fn spawn_event_loop(
        inner: Arc<NegotiatorInner>,
        monitor: StateMonitor,
        mut monitor_rx: StateEvents,
        mut connection_rx: broadcast::Receiver<ConnectionEvent>,
        mut signaller_rx: broadcast::Receiver<SignallerEvent>,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = inner.shutdown.cancelled() => break,
                    state = monitor_rx.recv() => match state {
                        Ok(ConnectionState::Closed) | Err(RecvError::Closed) => break,
                        _ => {}
                    },
                    event = connection_rx.recv() => match event {
                        Ok(ConnectionEvent::NegotiationNeeded) => inner.negotiation_needed(),
                        Ok(ConnectionEvent::IceCandidate(Some(candidate))) => {
                            inner.local_candidate(candidate).await
                        }
                        Ok(ConnectionEvent::Close) | Err(RecvError::Closed) => break,
                        Err(RecvError::Lagged(n)) => log::warn!(
                            "negotiator for {} missed {} connection events",
                            inner.target,
                            n
                        ),
                        Ok(_) => {}
                    },
                    event = signaller_rx.recv() => match event {
                        Ok(SignallerEvent::Sdp {
                            description,
                            source,
                        }) if inner.accepts(&source) => {
                            inner.open_channel(inner.signaller.to(inner.target.clone()));
                            let _ = inner.remote_descriptions.send(description);
                        }
                        Ok(SignallerEvent::Candidate { candidate, source })
                            if inner.accepts(&source) =>
                        {
                            inner.remote_candidate(candidate).await
                        }
                        Err(RecvError::Closed) => break,
                        Err(RecvError::Lagged(n)) => log::warn!(
                            "negotiator for {} missed {} signaller events",
                            inner.target,
                            n
                        ),
                        Ok(_) => {}
                    },
                }
            }
            log::debug!("negotiator for {} detached", inner.target);
            inner.phase.store(Arc::new(Phase::Closed));
            inner.shutdown.cancel();
            monitor.stop();
        });
    }

    pub fn target(&self) -> &str {
        &self.inner.target
    }

    /// Monitor of the underlying connection state.
    pub fn monitor(&self) -> &StateMonitor {
        &self.monitor
    }

    /// Checks if an offer/answer round is currently in flight.
    pub fn is_negotiating(&self) -> bool {
        matches!(**self.inner.phase.load(), Phase::Negotiating(_))
    }

    /// Checks if the target peer has been reached, so that negotiation messages can be sent to it.
    pub fn is_channel_open(&self) -> bool {
        self.inner.channel.load().is_some()
    }

    pub fn is_closed(&self) -> bool {
        **self.inner.phase.load() == Phase::Closed
    }

    /// Number of remote candidates waiting for the remote description.
    pub async fn queued_candidates(&self) -> usize {
        self.inner.candidates.lock().await.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NegotiationEvent> {
        self.inner.events.subscribe()
    }

    /// Detaches negotiator from its connection and signaller. The connection itself stays open.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
        self.monitor.stop();
    }

    /// Resolves once the negotiator has been detached.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await
    }
}

impl Drop for Negotiator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("target", &self.inner.target)
            .field("phase", &**self.inner.phase.load())
            .field("state", &self.monitor.state())
            .finish()
    }
}

impl NegotiatorInner {
    fn accepts(&self, source: &Option<String>) -> bool {
        match source {
            Some(source) => *source == self.target,
            None => true,
        }
    }

    fn emit(&self, event: NegotiationEvent) {
        let _ = self.events.send(event);
    }

    fn fail(&self, stage: Stage, reason: Error) {
        log::warn!(
            "negotiation with {} failed at {:?}: {}",
            self.target,
            stage,
            reason
        );
        self.emit(NegotiationEvent::Failed { stage, reason });
    }

    /// Moves from idle into negotiating phase. Returns false if any other round is in flight.
    fn try_begin(&self, kind: RoundKind) -> bool {
        let prev = self.phase.rcu(|phase| match **phase {
            Phase::Idle => Arc::new(Phase::Negotiating(kind)),
            _ => phase.clone(),
        });
        *prev == Phase::Idle
    }

    fn finish(&self) {
        self.phase.rcu(|phase| match **phase {
            Phase::Negotiating(_) => Arc::new(Phase::Idle),
            _ => phase.clone(),
        });
    }

    fn open_channel(self: &Arc<Self>, channel: PeerChannel) {
        let prev = self.channel.rcu(|current| match current {
            Some(current) => Some(current.clone()),
            None => Some(Arc::new(channel.clone())),
        });
        if prev.is_none() {
            log::debug!("channel to {} is open", self.target);
        }
        if self.offer_pending.swap(false, Ordering::AcqRel) {
            self.negotiation_needed();
        }
    }

    fn negotiation_needed(self: &Arc<Self>) {
        if self.channel.load().is_none() {
            self.offer_pending.store(true, Ordering::Release);
            // channel might have been opened in the meantime
            if self.channel.load().is_none() || !self.offer_pending.swap(false, Ordering::AcqRel) {
                log::debug!("offer to {} deferred until channel is open", self.target);
                return;
            }
        }
        if !self.try_begin(RoundKind::Offer) {
            log::debug!(
                "negotiation with {} already in progress, dropping request",
                self.target
            );
            return;
        }
        let inner = self.clone();
        tokio::spawn(async move { inner.negotiate(RoundKind::Offer).await });
    }

    /// Runs a single round. The negotiating phase must already be acquired.
    async fn negotiate(&self, kind: RoundKind) {
        let block = self.signaller.block();
        let result = self.run_round(kind).await;
        self.signaller.clear_block(block);
        self.finish();
        if let Err((stage, reason)) = result {
            self.fail(stage, reason);
        }
    }

    async fn run_round(&self, kind: RoundKind) -> Result<(), (Stage, Error)> {
        let description = match kind {
            RoundKind::Offer => self
                .connection
                .create_offer()
                .await
                .map_err(|e| (Stage::CreateOffer, e))?,
            RoundKind::Answer => self
                .connection
                .create_answer()
                .await
                .map_err(|e| (Stage::CreateAnswer, e))?,
        };
        let description = match &self.options.sdp_filter {
            Some(filter) => filter(description),
            None => description,
        };
        let sdp_type = description.sdp_type;
        self.connection
            .set_local_description(description.clone())
            .await
            .map_err(|e| (Stage::SetLocalDescription, e))?;
        let channel = match self.channel.load_full() {
            Some(channel) => channel,
            None => Arc::new(self.signaller.to(self.target.clone())),
        };
        channel
            .send(Message::Sdp {
                description,
                source: None,
            })
            .await
            .map_err(|e| (Stage::Transmit, e))?;
        log::debug!("sent {} to {}", sdp_type, self.target);
        self.emit(NegotiationEvent::LocalDescription(sdp_type));
        Ok(())
    }

    async fn apply_remote_description(self: &Arc<Self>, description: SessionDescription) {
        let sdp_type = description.sdp_type;
        if let Err(e) = self.connection.set_remote_description(description).await {
            self.fail(Stage::SetRemoteDescription, e);
            return;
        }
        log::debug!("applied remote {} from {}", sdp_type, self.target);
        {
            let mut candidates = self.candidates.lock().await;
            for candidate in candidates.flush() {
                self.add_candidate(candidate).await;
            }
        }
        self.emit(NegotiationEvent::RemoteDescription(sdp_type));
        if sdp_type == SdpType::Offer {
            if self.try_begin(RoundKind::Answer) {
                self.negotiate(RoundKind::Answer).await;
            } else {
                log::debug!(
                    "received offer from {} while negotiating, not answering",
                    self.target
                );
            }
        }
    }

    async fn remote_candidate(&self, candidate: IceCandidate) {
        let mut candidates = self.candidates.lock().await;
        match candidates.accept(candidate) {
            Some(candidate) => self.add_candidate(candidate).await,
            None => log::trace!(
                "queued candidate from {} ({} pending)",
                self.target,
                candidates.len()
            ),
        }
    }

    async fn add_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.connection.add_ice_candidate(candidate).await {
            self.fail(Stage::AddIceCandidate, e);
        }
    }

    async fn local_candidate(&self, candidate: IceCandidate) {
        match self.channel.load_full() {
            Some(channel) => {
                let message = Message::Candidate {
                    candidate,
                    source: None,
                };
                if let Err(e) = channel.send(message).await {
                    log::debug!("failed to send candidate to {}: {}", self.target, e);
                }
            }
            None => log::trace!("no channel to {}, dropping local candidate", self.target),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::codec::Message;
    use crate::connection::{Connection, ConnectionEvent, IceCandidate, SdpType, SessionDescription};
    use crate::messenger::{MemoryHub, Messenger, MessengerEvent};
    use crate::mock::{Call, MockConnection};
    use crate::monitor::ConnectionState;
    use crate::negotiator::{CandidateQueue, NegotiationEvent, Negotiator, NegotiatorOptions, Stage};
    use crate::signaller::{Signaller, SignallerOptions};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio::time::{sleep, timeout};

    async fn eventually<F: Fn() -> bool>(f: F) {
        timeout(Duration::from_secs(2), async {
            while !f() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not met on time")
    }

    /// Collects lines seen on the hub starting with a given prefix for a given time.
    async fn lines(
        rx: &mut broadcast::Receiver<MessengerEvent>,
        prefix: &str,
        wait: Duration,
    ) -> Vec<String> {
        let mut result = Vec::new();
        let _ = timeout(wait, async {
            while let Ok(event) = rx.recv().await {
                if let MessengerEvent::Message(line) = event {
                    if line.starts_with(prefix) {
                        result.push(line);
                    }
                }
            }
        })
        .await;
        result
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000 typ host", n, n))
    }

    struct Setup {
        hub: MemoryHub,
        local: Signaller,
        remote: Signaller,
        conn: Arc<MockConnection>,
        tap: broadcast::Receiver<MessengerEvent>,
        _tap_messenger: Arc<crate::messenger::MemoryMessenger>,
    }

    fn setup() -> Setup {
        let hub = MemoryHub::new();
        let tap_messenger = hub.connect();
        let tap = tap_messenger.subscribe();
        let local = Signaller::new(hub.connect(), SignallerOptions::with_id("a"));
        let remote = Signaller::new(hub.connect(), SignallerOptions::with_id("b"));
        Setup {
            hub,
            local,
            remote,
            conn: MockConnection::new(),
            tap,
            _tap_messenger: tap_messenger,
        }
    }

    async fn negotiator(setup: &Setup, target: &str, options: NegotiatorOptions) -> Negotiator {
        Negotiator::start(
            setup.conn.clone() as Arc<dyn Connection>,
            target,
            setup.local.clone(),
            options,
        )
        .await
    }

    #[test]
    fn candidate_queue_flushes_in_order_once() {
        let mut queue = CandidateQueue::new(false);
        assert_eq!(queue.accept(candidate(1)), None);
        assert_eq!(queue.accept(candidate(2)), None);
        assert_eq!(queue.accept(candidate(3)), None);
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.flush(), vec![candidate(1), candidate(2), candidate(3)]);
        assert!(queue.is_empty());
        assert!(queue.flush().is_empty());
        assert_eq!(queue.accept(candidate(4)), Some(candidate(4)));
        assert!(queue.is_empty());
    }

    #[test]
    fn candidate_queue_passes_through_when_remote_is_ready() {
        let mut queue = CandidateQueue::new(true);
        assert!(queue.is_remote_ready());
        assert_eq!(queue.accept(candidate(1)), Some(candidate(1)));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn negotiation_needed_sends_single_offer() {
        let mut s = setup();
        let neg = negotiator(&s, "b", NegotiatorOptions::default()).await;
        eventually(|| neg.is_channel_open()).await;

        s.conn.emit(ConnectionEvent::NegotiationNeeded);
        let sent = lines(&mut s.tap, "/to|b|/sdp|", Duration::from_millis(200)).await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains(r#""type":"offer""#));
        assert!(sent[0].ends_with(r#"|{"id":"a"}"#));

        eventually(|| !neg.is_negotiating()).await;
        assert!(!s.local.is_blocked());
        assert_eq!(s.conn.calls(), vec![Call::CreateOffer, Call::SetLocal(SdpType::Offer)]);
        eventually(|| neg.monitor().state() == ConnectionState::HaveLocalOffer).await;
    }

    #[tokio::test]
    async fn concurrent_negotiation_requests_are_dropped() {
        let mut s = setup();
        let gate = s.conn.gate_offers();
        let neg = negotiator(&s, "b", NegotiatorOptions::default()).await;
        eventually(|| neg.is_channel_open()).await;

        s.conn.emit(ConnectionEvent::NegotiationNeeded);
        eventually(|| s.conn.count(&Call::CreateOffer) == 1).await;
        assert!(neg.is_negotiating());
        assert!(s.local.is_blocked());

        s.conn.emit(ConnectionEvent::NegotiationNeeded);
        s.conn.emit(ConnectionEvent::NegotiationNeeded);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(s.conn.count(&Call::CreateOffer), 1);

        gate.add_permits(1);
        let sent = lines(&mut s.tap, "/to|b|/sdp|", Duration::from_millis(200)).await;
        assert_eq!(sent.len(), 1);
        eventually(|| !neg.is_negotiating()).await;
        assert_eq!(s.conn.count(&Call::CreateOffer), 1);
        assert!(!s.local.is_blocked());
    }

    #[tokio::test]
    async fn remote_offer_during_offer_round_is_not_answered() {
        let mut s = setup();
        let gate = s.conn.gate_offers();
        let neg = negotiator(&s, "b", NegotiatorOptions::default()).await;
        eventually(|| neg.is_channel_open()).await;

        s.conn.emit(ConnectionEvent::NegotiationNeeded);
        eventually(|| s.conn.count(&Call::CreateOffer) == 1).await;

        s.remote
            .to("a")
            .send(Message::Sdp {
                description: SessionDescription::offer("v=0 remote-offer"),
                source: None,
            })
            .await
            .unwrap();
        eventually(|| s.conn.count(&Call::SetRemote(SdpType::Offer)) == 1).await;

        let sent = lines(&mut s.tap, "/to|b|/sdp|", Duration::from_millis(100)).await;
        assert!(sent.is_empty());
        assert!(neg.is_negotiating());
        assert_eq!(s.conn.count(&Call::CreateAnswer), 0);

        gate.add_permits(1);
        let sent = lines(&mut s.tap, "/to|b|/sdp|", Duration::from_millis(200)).await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains(r#""type":"offer""#));
        eventually(|| !neg.is_negotiating()).await;
        assert_eq!(s.conn.count(&Call::CreateAnswer), 0);
        assert!(!s.local.is_blocked());
    }

    #[tokio::test]
    async fn early_candidates_are_applied_after_remote_offer() {
        let mut s = setup();
        let neg = negotiator(&s, "b", NegotiatorOptions::default()).await;
        let to_a = s.remote.to("a");

        for n in 1..=3 {
            to_a.send(Message::Candidate {
                candidate: candidate(n),
                source: None,
            })
            .await
            .unwrap();
        }
        sleep(Duration::from_millis(50)).await;
        assert_eq!(neg.queued_candidates().await, 3);
        assert!(s.conn.calls().is_empty());

        to_a.send(Message::Sdp {
            description: SessionDescription::offer("v=0 remote-offer"),
            source: None,
        })
        .await
        .unwrap();

        let answers = lines(&mut s.tap, "/to|b|/sdp|", Duration::from_millis(200)).await;
        assert_eq!(answers.len(), 1);
        assert!(answers[0].contains(r#""type":"answer""#));
        eventually(|| !neg.is_negotiating()).await;
        assert_eq!(
            s.conn.calls(),
            vec![
                Call::SetRemote(SdpType::Offer),
                Call::AddCandidate(candidate(1).candidate),
                Call::AddCandidate(candidate(2).candidate),
                Call::AddCandidate(candidate(3).candidate),
                Call::CreateAnswer,
                Call::SetLocal(SdpType::Answer),
            ]
        );
        assert_eq!(neg.queued_candidates().await, 0);

        // once remote description is there, candidates are applied right away
        to_a.send(Message::Candidate {
            candidate: candidate(4),
            source: None,
        })
        .await
        .unwrap();
        eventually(|| s.conn.count(&Call::AddCandidate(candidate(4).candidate)) == 1).await;
        assert_eq!(s.conn.count(&Call::AddCandidate(candidate(1).candidate)), 1);
    }

    #[tokio::test]
    async fn messages_from_other_peers_are_ignored() {
        let s = setup();
        let neg = negotiator(&s, "b", NegotiatorOptions::default()).await;
        let stranger = Signaller::new(s.hub.connect(), SignallerOptions::with_id("c"));

        stranger
            .to("a")
            .send(Message::Sdp {
                description: SessionDescription::offer("v=0 stranger"),
                source: None,
            })
            .await
            .unwrap();
        stranger
            .to("a")
            .send(Message::Candidate {
                candidate: candidate(9),
                source: None,
            })
            .await
            .unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(s.conn.calls().is_empty());
        assert_eq!(neg.queued_candidates().await, 0);
    }

    #[tokio::test]
    async fn local_candidates_need_open_channel() {
        let mut s = setup();
        let unreachable = negotiator(&s, "ghost", NegotiatorOptions::default()).await;
        s.conn.emit(ConnectionEvent::IceCandidate(Some(candidate(1))));
        let sent = lines(&mut s.tap, "/to|ghost|/candidate|", Duration::from_millis(100)).await;
        assert!(sent.is_empty());
        assert!(!unreachable.is_channel_open());
        drop(unreachable);

        let neg = negotiator(&s, "b", NegotiatorOptions::default()).await;
        eventually(|| neg.is_channel_open()).await;
        s.conn.emit(ConnectionEvent::IceCandidate(Some(candidate(2))));
        s.conn.emit(ConnectionEvent::IceCandidate(None));
        let sent = lines(&mut s.tap, "/to|b|/candidate|", Duration::from_millis(100)).await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("10.0.0.2"));
    }

    #[tokio::test]
    async fn offer_waits_for_channel() {
        let mut s = setup();
        // remote peer is busy, so it won't answer directory request until unblocked
        let block = s.remote.block();
        let neg = negotiator(&s, "b", NegotiatorOptions::default()).await;

        s.conn.emit(ConnectionEvent::NegotiationNeeded);
        sleep(Duration::from_millis(50)).await;
        assert!(!neg.is_channel_open());
        assert_eq!(s.conn.count(&Call::CreateOffer), 0);

        s.remote.clear_block(block);
        let sent = lines(&mut s.tap, "/to|b|/sdp|", Duration::from_millis(200)).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(s.conn.count(&Call::CreateOffer), 1);
    }

    #[tokio::test]
    async fn failed_round_returns_to_idle_without_retry() {
        let mut s = setup();
        let neg = negotiator(&s, "b", NegotiatorOptions::default()).await;
        let mut events = neg.subscribe();
        eventually(|| neg.is_channel_open()).await;

        s.conn.fail_create_offer(true);
        s.conn.emit(ConnectionEvent::NegotiationNeeded);
        let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
        match event {
            NegotiationEvent::Failed { stage, .. } => assert_eq!(stage, Stage::CreateOffer),
            other => panic!("unexpected event: {:?}", other),
        }
        eventually(|| !neg.is_negotiating()).await;
        assert!(!s.local.is_blocked());
        let sent = lines(&mut s.tap, "/to|b|/sdp|", Duration::from_millis(50)).await;
        assert!(sent.is_empty());
        assert_eq!(s.conn.count(&Call::CreateOffer), 1);

        s.conn.fail_create_offer(false);
        s.conn.emit(ConnectionEvent::NegotiationNeeded);
        let sent = lines(&mut s.tap, "/to|b|/sdp|", Duration::from_millis(200)).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(s.conn.count(&Call::CreateOffer), 2);
    }

    #[tokio::test]
    async fn failed_remote_description_keeps_candidates_queued() {
        let s = setup();
        let neg = negotiator(&s, "b", NegotiatorOptions::default()).await;
        let mut events = neg.subscribe();
        let to_a = s.remote.to("a");
        s.conn.fail_set_remote(true);

        to_a.send(Message::Candidate {
            candidate: candidate(1),
            source: None,
        })
        .await
        .unwrap();
        to_a.send(Message::Sdp {
            description: SessionDescription::offer("v=0 broken"),
            source: None,
        })
        .await
        .unwrap();

        let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
        match event {
            NegotiationEvent::Failed { stage, .. } => {
                assert_eq!(stage, Stage::SetRemoteDescription)
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(neg.queued_candidates().await, 1);
        assert_eq!(s.conn.calls(), vec![Call::SetRemote(SdpType::Offer)]);
        assert!(!neg.is_negotiating());
    }

    #[tokio::test]
    async fn sdp_filter_is_applied_to_local_descriptions() {
        let mut s = setup();
        let options = NegotiatorOptions {
            sdp_filter: Some(Arc::new(|mut description: SessionDescription| {
                description.sdp.push_str(" filtered");
                description
            })),
            ..NegotiatorOptions::default()
        };
        let neg = negotiator(&s, "b", options).await;
        eventually(|| neg.is_channel_open()).await;

        s.conn.emit(ConnectionEvent::NegotiationNeeded);
        let sent = lines(&mut s.tap, "/to|b|/sdp|", Duration::from_millis(200)).await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("mock-offer filtered"));
    }

    #[tokio::test]
    async fn detaches_when_connection_closes() {
        let s = setup();
        let neg = negotiator(&s, "b", NegotiatorOptions::default()).await;
        eventually(|| neg.is_channel_open()).await;

        s.conn.close().await.unwrap();
        timeout(Duration::from_secs(1), neg.closed()).await.unwrap();
        assert!(neg.is_closed());
        assert_eq!(neg.monitor().state(), ConnectionState::Closed);

        s.remote
            .to("a")
            .send(Message::Candidate {
                candidate: candidate(1),
                source: None,
            })
            .await
            .unwrap();
        s.conn.emit(ConnectionEvent::NegotiationNeeded);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(s.conn.calls(), vec![Call::Close]);
    }

    #[tokio::test]
    async fn peers_negotiate_over_shared_hub() {
        let hub = MemoryHub::new();
        let sa = Signaller::new(hub.connect(), SignallerOptions::with_id("a"));
        let sb = Signaller::new(hub.connect(), SignallerOptions::with_id("b"));
        let ca = MockConnection::new();
        let cb = MockConnection::new();
        let na =
            Negotiator::start(ca.clone() as Arc<dyn Connection>, "b", sa, Default::default()).await;
        let nb =
            Negotiator::start(cb.clone() as Arc<dyn Connection>, "a", sb, Default::default()).await;
        eventually(|| na.is_channel_open() && nb.is_channel_open()).await;

        ca.emit(ConnectionEvent::NegotiationNeeded);
        eventually(|| ca.count(&Call::SetRemote(SdpType::Answer)) == 1).await;
        assert_eq!(
            cb.calls(),
            vec![
                Call::SetRemote(SdpType::Offer),
                Call::CreateAnswer,
                Call::SetLocal(SdpType::Answer)
            ]
        );
        eventually(|| na.monitor().state() == ConnectionState::HaveRemotePranswer).await;
        eventually(|| nb.monitor().state() == ConnectionState::HaveRemotePranswer).await;
    }
}
