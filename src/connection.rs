//! Per-node connection state.
//!
//! A [`NodeConnection`] is created by `prepare` and lives in the registry until
//! `remove`. It moves through these states:
//!
//! ```text
//! Pending --register--> Registered --attach--> Streaming
//!                           ^                      |
//!                           +-------detach---------+
//! (any) --close--> Closed
//! ```
//!
//! All fields that change after creation sit behind one mutex owned by the
//! connection, separate from the registry lock, so every guard check and the
//! transition it protects happen atomically.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{DispatchError, Result};
use crate::proto::{DispatchEvent, ExecutionResult};
use crate::spec::FunctionSpec;

/// Capacity of each queue in a queue pair.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Pending,
    Registered,
    Streaming,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Pending => write!(f, "pending"),
            ConnectionState::Registered => write!(f, "registered"),
            ConnectionState::Streaming => write!(f, "streaming"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// What closing a connection did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// A stream was attached; its queue pair was torn down.
    Detached,
    /// No stream was attached.
    Idle,
    /// The connection had been closed before.
    AlreadyClosed,
}

/// Scheduler-side ends of an attached queue pair.
struct QueuePair {
    session: u64,
    requests: Option<mpsc::Sender<DispatchEvent>>,
    results: Option<mpsc::Receiver<ExecutionResult>>,
}

/// Stream-side ends of an attached queue pair, owned by the multiplexing loop.
pub(crate) struct StreamEnds {
    pub session: u64,
    pub requests: mpsc::Receiver<DispatchEvent>,
    pub results: mpsc::Sender<ExecutionResult>,
}

#[derive(Default)]
struct Inner {
    registered: bool,
    channel: Option<QueuePair>,
    next_session: u64,
}

pub struct NodeConnection {
    urn: String,
    secret: String,
    spec: FunctionSpec,
    closed: CancellationToken,
    inner: Mutex<Inner>,
}

impl fmt::Debug for NodeConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConnection")
            .field("urn", &self.urn)
            .field("state", &self.state())
            .finish()
    }
}

impl NodeConnection {
    pub fn new(urn: impl Into<String>, secret: impl Into<String>, spec: FunctionSpec) -> Self {
        Self {
            urn: urn.into(),
            secret: secret.into(),
            spec,
            closed: CancellationToken::new(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn urn(&self) -> &str {
        &self.urn
    }

    pub fn spec(&self) -> &FunctionSpec {
        &self.spec
    }

    pub(crate) fn secret_matches(&self, secret: &str) -> bool {
        self.secret == secret
    }

    pub(crate) fn same_secret(&self, other: &NodeConnection) -> bool {
        self.secret == other.secret
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        let inner = self.lock();
        if self.closed.is_cancelled() {
            ConnectionState::Closed
        } else if inner.channel.is_some() {
            ConnectionState::Streaming
        } else if inner.registered {
            ConnectionState::Registered
        } else {
            ConnectionState::Pending
        }
    }

    pub fn is_registered(&self) -> bool {
        self.lock().registered
    }

    pub fn is_connected(&self) -> bool {
        self.lock().channel.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub(crate) fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// `Pending -> Registered`.
    pub(crate) fn mark_registered(&self) -> Result<()> {
        let mut inner = self.lock();
        if self.closed.is_cancelled() {
            return Err(DispatchError::Closed(self.urn.clone()));
        }
        if inner.registered {
            return Err(DispatchError::AlreadyRegistered(self.urn.clone()));
        }
        inner.registered = true;
        Ok(())
    }

    /// `Registered -> Streaming`. Creates a fresh queue pair and hands the
    /// stream-side ends to the caller.
    pub(crate) fn attach(&self, capacity: usize) -> Result<StreamEnds> {
        let mut inner = self.lock();
        if self.closed.is_cancelled() {
            return Err(DispatchError::Closed(self.urn.clone()));
        }
        if !inner.registered {
            return Err(DispatchError::NotRegistered(self.urn.clone()));
        }
        if inner.channel.is_some() {
            return Err(DispatchError::AlreadyConnected(self.urn.clone()));
        }

        let (request_tx, request_rx) = mpsc::channel(capacity);
        let (result_tx, result_rx) = mpsc::channel(capacity);

        inner.next_session += 1;
        let session = inner.next_session;
        inner.channel = Some(QueuePair {
            session,
            requests: Some(request_tx),
            results: Some(result_rx),
        });

        Ok(StreamEnds {
            session,
            requests: request_rx,
            results: result_tx,
        })
    }

    /// `Streaming -> Registered`. Only detaches the queue pair created by the
    /// given session, so a stale detach never tears down a newer stream.
    pub(crate) fn detach(&self, session: u64) {
        let mut inner = self.lock();
        if inner.channel.as_ref().map(|c| c.session) == Some(session) {
            inner.channel = None;
        }
    }

    /// Signal `closed` and tear down the attached queue pair.
    ///
    /// Safe to call repeatedly; only the first call signals. The inbound queue
    /// is closed under the same lock as the signal, so a reader that has not
    /// yet enqueued cannot deliver into it afterwards.
    pub fn close(&self) -> CloseOutcome {
        let mut inner = self.lock();
        if self.closed.is_cancelled() {
            return CloseOutcome::AlreadyClosed;
        }
        self.closed.cancel();

        match inner.channel.take() {
            Some(mut pair) => {
                pair.requests = None;
                if let Some(results) = pair.results.as_mut() {
                    results.close();
                }
                CloseOutcome::Detached
            }
            None => CloseOutcome::Idle,
        }
    }

    /// Enqueue a request for the attached stream, waiting while the outbound
    /// queue is full. A producer woken by `close` gets `Closed`; one woken by
    /// the stream ending gets `NotConnected`.
    pub async fn dispatch(&self, event: DispatchEvent) -> Result<()> {
        let sender = self.request_sender()?;
        sender.send(event).await.map_err(|_| {
            if self.closed.is_cancelled() {
                DispatchError::Closed(self.urn.clone())
            } else {
                DispatchError::NotConnected(self.urn.clone())
            }
        })
    }

    /// Producer handle for the outbound queue of the attached stream.
    pub fn request_sender(&self) -> Result<mpsc::Sender<DispatchEvent>> {
        let inner = self.lock();
        if self.closed.is_cancelled() {
            return Err(DispatchError::Closed(self.urn.clone()));
        }
        inner
            .channel
            .as_ref()
            .and_then(|c| c.requests.clone())
            .ok_or_else(|| DispatchError::NotConnected(self.urn.clone()))
    }

    /// Take the consumer end of the inbound queue. Each attached stream hands
    /// out its receiver once. Dropping it ends the stream with `StreamFailed`;
    /// the node can subscribe again for a fresh queue pair.
    pub fn take_results(&self) -> Option<mpsc::Receiver<ExecutionResult>> {
        self.lock()
            .channel
            .as_mut()
            .and_then(|c| c.results.take())
    }

    /// Drop the connection's own producer handle for the outbound queue. Once
    /// every handle from [`request_sender`](Self::request_sender) is gone the
    /// multiplexing loop ends with `ChannelTerminated`.
    pub fn terminate_requests(&self) {
        if let Some(pair) = self.lock().channel.as_mut() {
            pair.requests = None;
        }
    }
}
