use crate::codec::{self, Attributes, DirectoryRequest, Envelope, Message};
use crate::connection::{IceCandidate, SessionDescription};
use crate::error::{Error, Result};
use crate::messenger::{Messenger, MessengerEvent};
use arc_swap::ArcSwap;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Formatter;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Handle of a block acquired with [Signaller::block].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(Uuid);

/// Remote peer known to the signaller through its announcements.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub id: String,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignallerEvent {
    /// Underlying messenger has been opened.
    Open,
    /// Underlying messenger has been closed.
    Close,
    /// The last outstanding block has been cleared.
    Unblock,
    /// Previously unknown peer has announced itself.
    PeerAnnounce(PeerRecord),
    /// Already known peer has announced updated attributes.
    PeerUpdate(PeerRecord),
    /// Peer has left.
    PeerLeave(String),
    Sdp {
        description: SessionDescription,
        source: Option<String>,
    },
    Candidate {
        candidate: IceCandidate,
        source: Option<String>,
    },
    /// Any command without a dedicated handler.
    Message { command: String, args: Vec<Value> },
}

#[derive(Debug, Clone)]
pub struct SignallerOptions {
    /// Id of the local peer. Random UUID v4 is generated when not provided.
    pub id: Option<String>,
    /// Initial attributes of the local peer.
    pub attributes: Attributes,
    pub event_capacity: usize,
}

impl Default for SignallerOptions {
    fn default() -> Self {
        SignallerOptions {
            id: None,
            attributes: Attributes::new(),
            event_capacity: 256,
        }
    }
}

impl SignallerOptions {
    pub fn with_id<S: Into<String>>(id: S) -> Self {
        SignallerOptions {
            id: Some(id.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// How long to wait for any peer to acknowledge a request. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

/// Peer directory and message router on top of a [Messenger].
///
/// Signaller announces the attributes of the local peer, answers directory requests of other
/// peers and delivers messages to specific peers (see [Signaller::to]). It also provides a simple
/// mutual exclusion primitive ([Signaller::block]): while any block is held, directory requests
/// coming from other peers are answered only after the last block has been cleared.
#[derive(Clone)]
pub struct Signaller(Arc<SignallerInner>);

struct SignallerInner {
    id: String,
    messenger: Arc<dyn Messenger>,
    attributes: ArcSwap<Attributes>,
    peers: ArcSwap<HashMap<String, PeerRecord>>,
    blocks: Mutex<BlockSet>,
    pending_requests: Mutex<HashMap<String, oneshot::Sender<String>>>,
    events: broadcast::Sender<SignallerEvent>,
    shutdown: CancellationToken,
}

impl SignallerInner {
    fn blocks(&self) -> MutexGuard<'_, BlockSet> {
        self.blocks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pending_requests(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<String>>> {
        self.pending_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for SignallerInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Outstanding blocks together with directory requests waiting for them to be cleared.
#[derive(Debug, Default)]
struct BlockSet {
    held: Vec<BlockId>,
    deferred: Vec<DirectoryRequest>,
}

/// Removes a pending request entry once [Signaller::request] returns or gets cancelled.
struct PendingRequest<'a> {
    inner: &'a SignallerInner,
    request_id: String,
}

impl<'a> Drop for PendingRequest<'a> {
    fn drop(&mut self) {
        self.inner.pending_requests().remove(&self.request_id);
    }
}

impl Signaller {
    /// Creates a new signaller bound to a given messenger. Must be called from within a tokio
    /// runtime, as it spawns a task dispatching incoming messages.
    pub fn new(messenger: Arc<dyn Messenger>, options: SignallerOptions) -> Self {
        let id = options
            .id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut attributes = options.attributes;
        attributes.insert("id".into(), Value::String(id.clone()));
        let (events, _) = broadcast::channel(options.event_capacity);
        let rx = messenger.subscribe();
        let inner = Arc::new(SignallerInner {
            id,
            messenger,
            attributes: ArcSwap::from_pointee(attributes),
            peers: ArcSwap::from_pointee(HashMap::new()),
            blocks: Mutex::new(BlockSet::default()),
            pending_requests: Mutex::new(HashMap::new()),
            events,
            shutdown: CancellationToken::new(),
        });
        Self::spawn_dispatcher(Arc::downgrade(&inner), inner.shutdown.clone(), rx);
        Signaller(inner)
    }

    fn spawn_dispatcher(
        weak: Weak<SignallerInner>,
        shutdown: CancellationToken,
        mut rx: broadcast::Receiver<MessengerEvent>,
    ) {
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => event,
                };
                let signaller = match weak.upgrade() {
                    Some(inner) => Signaller(inner),
                    None => break,
                };
                match event {
                    Ok(MessengerEvent::Open) => signaller.emit(SignallerEvent::Open),
                    Ok(MessengerEvent::Close) => signaller.emit(SignallerEvent::Close),
                    Ok(MessengerEvent::Message(line)) => signaller.dispatch(&line).await,
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("signaller {} missed {} messages", signaller.id(), n);
                    }
                    Err(RecvError::Closed) => {
                        signaller.emit(SignallerEvent::Close);
                        break;
                    }
                }
            }
        });
    }

    /// Id of the local peer.
    pub fn id(&self) -> &str {
        &self.0.id
    }

    /// Snapshot of the local peer attributes.
    pub fn attributes(&self) -> Arc<Attributes> {
        self.0.attributes.load_full()
    }

    /// Snapshot of the currently known remote peers.
    pub fn peers(&self) -> Arc<HashMap<String, PeerRecord>> {
        self.0.peers.load_full()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignallerEvent> {
        self.0.events.subscribe()
    }

    /// Merges `data` into local attributes (existing keys missing in `data` are kept) and
    /// broadcasts them to all peers.
    pub async fn announce(&self, data: Option<Attributes>) -> Result<()> {
        let attributes = self.merge_attributes(data);
        self.send(Message::Announce((*attributes).clone())).await
    }

    fn merge_attributes(&self, data: Option<Attributes>) -> Arc<Attributes> {
        if let Some(data) = data {
            self.0.attributes.rcu(|current| {
                let mut merged = Attributes::clone(current);
                for (key, value) in data.iter() {
                    merged.insert(key.clone(), value.clone());
                }
                // the id is not negotiable
                merged.insert("id".into(), Value::String(self.0.id.clone()));
                merged
            });
        }
        self.0.attributes.load_full()
    }

    /// Broadcasts a message to all peers.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.transmit(Envelope::broadcast(message)).await
    }

    /// Returns a sender bound to a specific peer.
    pub fn to<S: Into<String>>(&self, target: S) -> PeerChannel {
        PeerChannel {
            signaller: self.clone(),
            target: target.into(),
        }
    }

    /// Broadcasts the intent of leaving and forgets all known peers.
    pub async fn leave(&self) -> Result<()> {
        self.0.peers.store(Arc::new(HashMap::new()));
        self.send(Message::Leave {
            id: self.0.id.clone(),
        })
        .await
    }

    /// Looks up a peer whose attributes match all of the `criteria` and returns a channel to the
    /// first one which acknowledged the request.
    ///
    /// Without a configured timeout, a request which no peer acknowledges never completes.
    pub async fn request(
        &self,
        criteria: Attributes,
        options: RequestOptions,
    ) -> Result<PeerChannel> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.0.pending_requests().insert(request_id.clone(), tx);
        let _guard = PendingRequest {
            inner: &self.0,
            request_id: request_id.clone(),
        };
        let request = DirectoryRequest {
            criteria,
            source: self.0.id.clone(),
            request_id,
        };
        self.send(Message::Request(request)).await?;
        let responder = match options.timeout {
            None => rx.await,
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(responder) => responder,
                Err(_) => return Err(Error::RequestTimeout),
            },
        };
        match responder {
            Ok(responder) => Ok(self.to(responder)),
            Err(_) => Err(Error::MessengerClosed),
        }
    }

    /// Acquires a new block. Until every block has been cleared, directory requests of other peers
    /// are left unanswered.
    pub fn block(&self) -> BlockId {
        let id = BlockId(Uuid::new_v4());
        self.0.blocks().held.push(id);
        log::trace!("signaller {} acquired block {:?}", self.0.id, id);
        id
    }

    /// Releases a block. [SignallerEvent::Unblock] is emitted if it was the last one. Unknown ids
    /// are ignored.
    ///
    /// Requests deferred while blocked are answered once the last block is cleared, even if a new
    /// block is acquired right after.
    pub fn clear_block(&self, id: BlockId) {
        let deferred = {
            let mut blocks = self.0.blocks();
            match blocks.held.iter().position(|b| *b == id) {
                Some(pos) => {
                    blocks.held.remove(pos);
                }
                None => return,
            }
            if !blocks.held.is_empty() {
                return;
            }
            std::mem::take(&mut blocks.deferred)
        };
        log::trace!("signaller {} unblocked", self.0.id);
        self.emit(SignallerEvent::Unblock);
        if !deferred.is_empty() {
            let signaller = self.clone();
            tokio::spawn(async move {
                for request in deferred {
                    signaller.acknowledge(request).await;
                }
            });
        }
    }

    pub fn is_blocked(&self) -> bool {
        !self.0.blocks().held.is_empty()
    }

    fn emit(&self, event: SignallerEvent) {
        // nobody listening is not an error
        let _ = self.0.events.send(event);
    }

    async fn transmit(&self, envelope: Envelope) -> Result<()> {
        let line = codec::encode(&envelope)?;
        self.0.messenger.send(line).await
    }

    async fn dispatch(&self, line: &str) {
        if let Some(target) = codec::peek_target(line) {
            if target != self.0.id {
                return;
            }
        }
        let envelope = match codec::decode(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::debug!("signaller {} dropped `{}`: {}", self.0.id, line, e);
                return;
            }
        };
        let directed = envelope.target.is_some();
        match envelope.message {
            Message::Announce(attributes) => self.handle_announce(attributes, directed).await,
            Message::Request(request) => self.handle_request(request).await,
            Message::AckRequest {
                request_id,
                responder,
            } => {
                let tx = self.0.pending_requests().remove(&request_id);
                if let Some(tx) = tx {
                    let _ = tx.send(responder);
                }
            }
            Message::Sdp {
                description,
                source,
            } => self.emit(SignallerEvent::Sdp {
                description,
                source,
            }),
            Message::Candidate { candidate, source } => {
                self.emit(SignallerEvent::Candidate { candidate, source })
            }
            Message::Leave { id } => {
                self.0.peers.rcu(|peers| {
                    let mut peers = HashMap::clone(peers);
                    peers.remove(&id);
                    peers
                });
                self.emit(SignallerEvent::PeerLeave(id));
            }
            Message::Custom { command, args } => {
                self.emit(SignallerEvent::Message { command, args })
            }
        }
    }

    async fn handle_announce(&self, attributes: Attributes, directed: bool) {
        let id = match attributes.get("id") {
            Some(Value::String(id)) => id.clone(),
            _ => {
                log::debug!("signaller {} ignored announce without id", self.0.id);
                return;
            }
        };
        if id == self.0.id {
            return;
        }
        let previous = self.0.peers.rcu(|peers| {
            let mut peers = HashMap::clone(peers);
            let record = peers.entry(id.clone()).or_insert_with(|| PeerRecord {
                id: id.clone(),
                attributes: Attributes::new(),
            });
            for (key, value) in attributes.iter() {
                record.attributes.insert(key.clone(), value.clone());
            }
            peers
        });
        let record = match self.0.peers.load().get(&id) {
            Some(record) => record.clone(),
            None => return,
        };
        if previous.contains_key(&id) {
            self.emit(SignallerEvent::PeerUpdate(record));
        } else {
            log::debug!("signaller {} discovered peer {}", self.0.id, id);
            self.emit(SignallerEvent::PeerAnnounce(record));
            if !directed {
                // let the newcomer know about us
                if let Err(e) = self.to(id).announce(None).await {
                    log::debug!("signaller {} failed to reply announce: {}", self.0.id, e);
                }
            }
        }
    }

    async fn handle_request(&self, request: DirectoryRequest) {
        if request.source == self.0.id {
            return;
        }
        let request = {
            let mut blocks = self.0.blocks();
            if blocks.held.is_empty() {
                Some(request)
            } else {
                log::trace!(
                    "signaller {} is blocked, deferring request {}",
                    self.0.id,
                    request.request_id
                );
                blocks.deferred.push(request);
                None
            }
        };
        if let Some(request) = request {
            self.acknowledge(request).await;
        }
    }

    async fn acknowledge(&self, request: DirectoryRequest) {
        if !request.matches(&self.0.attributes.load()) {
            return;
        }
        let ack = Message::AckRequest {
            request_id: request.request_id,
            responder: self.0.id.clone(),
        };
        if let Err(e) = self.to(request.source).send(ack).await {
            log::debug!("signaller {} failed to acknowledge request: {}", self.0.id, e);
        }
    }
}

impl std::fmt::Debug for Signaller {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signaller")
            .field("id", &self.0.id)
            .field("blocked", &self.is_blocked())
            .finish()
    }
}

/// Sender bound to a single remote peer.
#[derive(Clone)]
pub struct PeerChannel {
    signaller: Signaller,
    target: String,
}

impl PeerChannel {
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Sends a message to the target peer only. Negotiation messages are tagged with the id of
    /// the local peer.
    pub async fn send(&self, message: Message) -> Result<()> {
        let source = Some(self.signaller.0.id.clone());
        let message = match message {
            Message::Sdp {
                description,
                source: None,
            } => Message::Sdp {
                description,
                source,
            },
            Message::Candidate {
                candidate,
                source: None,
            } => Message::Candidate { candidate, source },
            other => other,
        };
        self.signaller
            .transmit(Envelope::directed(self.target.clone(), message))
            .await
    }

    /// Merges `data` into local attributes and announces them to the target peer only.
    pub async fn announce(&self, data: Option<Attributes>) -> Result<()> {
        let attributes = self.signaller.merge_attributes(data);
        self.send(Message::Announce((*attributes).clone())).await
    }
}

impl std::fmt::Debug for PeerChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerChannel")
            .field("source", &self.signaller.0.id)
            .field("target", &self.target)
            .finish()
    }
}
