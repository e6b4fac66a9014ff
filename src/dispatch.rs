//! Dispatch engine: admission, registration and the per-stream multiplexing
//! loop.
//!
//! # Stream lifecycle
//!
//! 1. [`Dispatcher::attach`] authenticates the node and moves its connection
//!    to `Streaming`, creating a fresh queue pair.
//! 2. [`StreamSession::run`] spawns a reader task (stream → inbound queue) and
//!    multiplexes the outbound queue onto the stream until one of:
//!    - the connection is closed (`Closed`)
//!    - the reader hits a receive error or end of stream, or the result
//!      consumer hangs up (`StreamFailed`)
//!    - every outbound producer is gone (`ChannelTerminated`)
//!    - a stream write fails (`SendFailed`)
//! 3. The queue pair is detached when the session is dropped, whatever the
//!    cause, so the node can subscribe again.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use uuid::Uuid;

use crate::auth::Credentials;
use crate::config::DispatchConfig;
use crate::connection::{CloseOutcome, NodeConnection, StreamEnds};
use crate::error::{DispatchError, Result};
use crate::proto::{DispatchEvent, ExecutionResult};
use crate::registry::ConnectionRegistry;
use crate::spec::FunctionSpec;

/// Sink for messages written to a node's stream.
pub type EventSink = mpsc::Sender<std::result::Result<DispatchEvent, Status>>;

/// Slots between the multiplexing loop and the transport. The outbound queue
/// is the bound on outstanding requests, so this stays minimal.
pub const STREAM_WRITE_BUFFER: usize = 1;

/// Channel carrying a stream's writes from the multiplexing loop to the
/// transport.
pub fn event_channel() -> (
    EventSink,
    mpsc::Receiver<std::result::Result<DispatchEvent, Status>>,
) {
    mpsc::channel(STREAM_WRITE_BUFFER)
}

pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, config: DispatchConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn queue_capacity(&self) -> usize {
        self.config.queue_capacity
    }

    /// Admit a node before it connects. Returns the handle the scheduler uses
    /// to push requests and drain results.
    pub async fn prepare(
        &self,
        urn: impl Into<String>,
        secret: impl Into<String>,
        spec: FunctionSpec,
    ) -> Result<Arc<NodeConnection>> {
        let conn = Arc::new(NodeConnection::new(urn, secret, spec));
        self.registry.add(conn.clone()).await?;
        tracing::info!(urn = %conn.urn(), "Node prepared");
        Ok(conn)
    }

    pub async fn remove(&self, urn: &str) -> Result<CloseOutcome> {
        self.registry.remove(urn).await
    }

    /// One-shot registration. Returns the spec assigned at `prepare` time.
    pub async fn register(
        &self,
        credentials: &Credentials,
        node_type: &str,
    ) -> Result<FunctionSpec> {
        if node_type.is_empty() {
            return Err(DispatchError::MissingNodeType);
        }

        let conn = self
            .registry
            .lookup(&credentials.urn, &credentials.secret)
            .await?;
        conn.mark_registered()?;

        tracing::info!(urn = %conn.urn(), node_type, "Node registered");
        Ok(conn.spec().clone())
    }

    /// Authenticate and attach a fresh queue pair to the node's connection.
    pub async fn attach(&self, credentials: &Credentials) -> Result<StreamSession> {
        let conn = self
            .registry
            .lookup(&credentials.urn, &credentials.secret)
            .await?;
        let ends = conn.attach(self.config.queue_capacity)?;

        tracing::info!(urn = %conn.urn(), session = ends.session, "Node stream attached");
        Ok(StreamSession {
            guard: DetachGuard {
                session: ends.session,
                conn,
            },
            ends,
        })
    }

    /// Attach and run the multiplexing loop until it terminates. Always
    /// returns an error: either the attach failure or the termination cause.
    pub async fn subscribe<S>(
        &self,
        credentials: &Credentials,
        inbound: S,
        outbound: EventSink,
    ) -> Result<()>
    where
        S: Stream<Item = std::result::Result<ExecutionResult, Status>> + Send + 'static,
    {
        let session = self.attach(credentials).await?;
        Err(session.run(inbound, outbound).await)
    }
}

/// Detaches the queue pair when dropped, including on panic or cancellation
/// of the task running the session.
struct DetachGuard {
    conn: Arc<NodeConnection>,
    session: u64,
}

impl Drop for DetachGuard {
    fn drop(&mut self) {
        self.conn.detach(self.session);
        tracing::debug!(urn = %self.conn.urn(), session = self.session, "Node stream detached");
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// An attached stream that has not started multiplexing yet.
pub struct StreamSession {
    ends: StreamEnds,
    guard: DetachGuard,
}

impl StreamSession {
    pub fn connection(&self) -> &Arc<NodeConnection> {
        &self.guard.conn
    }

    /// Run the multiplexing loop and return why it stopped.
    pub async fn run<S>(self, inbound: S, outbound: EventSink) -> DispatchError
    where
        S: Stream<Item = std::result::Result<ExecutionResult, Status>> + Send + 'static,
    {
        let StreamSession { ends, guard } = self;
        let StreamEnds {
            mut requests,
            results,
            ..
        } = ends;

        let urn = guard.conn.urn().to_string();
        let closed = guard.conn.close_token();
        let reader_failed = CancellationToken::new();

        let _reader = AbortOnDrop(tokio::spawn(read_results(
            urn.clone(),
            inbound,
            results,
            closed.clone(),
            reader_failed.clone(),
        )));

        let cause = loop {
            tokio::select! {
                biased;
                _ = closed.cancelled() => break DispatchError::Closed(urn.clone()),
                _ = reader_failed.cancelled() => break DispatchError::StreamFailed(urn.clone()),
                request = requests.recv() => {
                    let Some(event) = request else {
                        break DispatchError::ChannelTerminated(urn.clone());
                    };
                    tokio::select! {
                        biased;
                        _ = closed.cancelled() => break DispatchError::Closed(urn.clone()),
                        sent = outbound.send(Ok(event)) => {
                            if sent.is_err() {
                                tracing::error!(urn = %urn, "Node stream write failed");
                                break DispatchError::SendFailed(urn.clone());
                            }
                        }
                    }
                }
            }
        };

        tracing::info!(urn = %urn, cause = %cause, "Node stream terminated");
        cause
    }
}

/// Move results from the stream into the inbound queue until the stream ends
/// or the connection is closed.
async fn read_results<S>(
    urn: String,
    inbound: S,
    results: mpsc::Sender<ExecutionResult>,
    closed: CancellationToken,
    failed: CancellationToken,
) where
    S: Stream<Item = std::result::Result<ExecutionResult, Status>> + Send + 'static,
{
    let mut inbound = std::pin::pin!(inbound);

    loop {
        let message = tokio::select! {
            biased;
            _ = closed.cancelled() => return,
            message = inbound.next() => message,
        };

        match message {
            Some(Ok(result)) => {
                tokio::select! {
                    biased;
                    _ = closed.cancelled() => return,
                    sent = results.send(result) => {
                        if sent.is_err() {
                            tracing::warn!(urn = %urn, "Result consumer dropped, ending stream");
                            failed.cancel();
                            return;
                        }
                    }
                }
            }
            Some(Err(status)) => {
                tracing::error!(urn = %urn, error = %status, "Node stream receive failed");
                failed.cancel();
                return;
            }
            None => {
                tracing::warn!(urn = %urn, "Node stream closed by peer");
                failed.cancel();
                return;
            }
        }
    }
}

impl DispatchEvent {
    /// Event with a freshly generated id.
    pub fn with_payload(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload: payload.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}
