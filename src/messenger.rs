//! Transport capability used by the [crate::signaller::Signaller].
//!
//! A messenger only needs to be able to broadcast text lines and to notify about incoming ones.
//! Routing of directed messages is done by the receiving signallers, so a messenger is free to
//! deliver every line to every participant.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessengerEvent {
    Open,
    Close,
    Message(String),
}

#[async_trait]
pub trait Messenger: Send + Sync {
    /// Sends a line to all other participants.
    async fn send(&self, line: String) -> Result<()>;

    /// Subscribes to events of this messenger.
    fn subscribe(&self) -> broadcast::Receiver<MessengerEvent>;
}

#[async_trait]
impl<T: Messenger + ?Sized> Messenger for Arc<T> {
    async fn send(&self, line: String) -> Result<()> {
        (**self).send(line).await
    }

    fn subscribe(&self) -> broadcast::Receiver<MessengerEvent> {
        (**self).subscribe()
    }
}

/// In-process switchboard. Every line sent by one of its messengers is delivered to all the
/// others, in the order it was sent.
#[derive(Debug, Clone)]
pub struct MemoryHub {
    tx: broadcast::Sender<(usize, String)>,
    next_id: Arc<AtomicUsize>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        MemoryHub {
            tx,
            next_id: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Creates a new messenger attached to this hub. Must be called from within a tokio runtime.
    pub fn connect(&self) -> Arc<MemoryMessenger> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (events, _) = broadcast::channel(1024);
        let shutdown = CancellationToken::new();
        let mut rx = self.tx.subscribe();
        {
            let events = events.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let msg = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        msg = rx.recv() => msg,
                    };
                    match msg {
                        Ok((origin, line)) => {
                            if origin != id {
                                let _ = events.send(MessengerEvent::Message(line));
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("memory messenger #{} skipped {} lines", id, n);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            });
        }
        Arc::new(MemoryMessenger {
            id,
            hub: self.tx.clone(),
            events,
            open: AtomicBool::new(true),
            shutdown,
        })
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct MemoryMessenger {
    id: usize,
    hub: broadcast::Sender<(usize, String)>,
    events: broadcast::Sender<MessengerEvent>,
    open: AtomicBool,
    shutdown: CancellationToken,
}

impl MemoryMessenger {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Marks messenger as open and notifies subscribers.
    pub fn open(&self) {
        self.open.store(true, Ordering::Release);
        let _ = self.events.send(MessengerEvent::Open);
    }

    /// Marks messenger as closed and notifies subscribers. Closed messenger refuses to send.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.events.send(MessengerEvent::Close);
        }
    }
}

#[async_trait]
impl Messenger for MemoryMessenger {
    async fn send(&self, line: String) -> Result<()> {
        if !self.is_open() {
            return Err(Error::MessengerClosed);
        }
        log::trace!("memory messenger #{} sends: {}", self.id, line);
        // no receivers simply means nobody else is connected
        let _ = self.hub.send((self.id, line));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<MessengerEvent> {
        self.events.subscribe()
    }
}

impl Drop for MemoryMessenger {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
