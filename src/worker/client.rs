use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Streaming};

use crate::auth::Credentials;
use crate::connection::DEFAULT_QUEUE_CAPACITY;
use crate::error::Result;
use crate::proto::node_handler_client::NodeHandlerClient;
use crate::proto::{DispatchEvent, ExecutionResult, NodeRegistrationRequest};
use crate::spec::FunctionSpec;

/// Connection from a worker node to the dispatch server.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    client: NodeHandlerClient<Channel>,
    credentials: Credentials,
}

impl WorkerClient {
    pub async fn connect(addr: impl Into<String>, credentials: Credentials) -> Result<Self> {
        let channel = Endpoint::from_shared(addr.into())?.connect().await?;
        Ok(Self::from_channel(channel, credentials))
    }

    pub fn from_channel(channel: Channel, credentials: Credentials) -> Self {
        Self {
            client: NodeHandlerClient::new(channel),
            credentials,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Register this node and return the function spec it was admitted with.
    pub async fn register(&mut self, node_type: &str) -> Result<FunctionSpec> {
        let mut request = Request::new(NodeRegistrationRequest {
            urn: self.credentials.urn.clone(),
            node_type: node_type.to_string(),
        });
        self.credentials.apply(request.metadata_mut())?;

        let response = self.client.register(request).await?.into_inner();
        FunctionSpec::from_registration(response)
    }

    /// Open the duplex stream. Results pushed into the returned sender are
    /// streamed to the server; dispatch events arrive on the returned stream.
    pub async fn subscribe(
        &mut self,
    ) -> Result<(mpsc::Sender<ExecutionResult>, Streaming<DispatchEvent>)> {
        let (tx, rx) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
        let mut request = Request::new(ReceiverStream::new(rx));
        self.credentials.apply(request.metadata_mut())?;

        let events = self.client.subscribe(request).await?.into_inner();
        Ok((tx, events))
    }

    /// Answer every dispatch event with a successful result carrying the
    /// event's own payload. Returns the number of events handled once the
    /// server ends the stream cleanly, or the stream's error status.
    pub async fn run_echo(&mut self) -> Result<u64> {
        let (results, mut events) = self.subscribe().await?;
        let mut handled = 0u64;

        while let Some(event) = events.message().await? {
            tracing::debug!(urn = %self.credentials.urn, id = %event.id, "Handling dispatch event");

            let result = ExecutionResult {
                id: event.id,
                success: true,
                payload: event.payload,
                error: String::new(),
            };
            if results.send(result).await.is_err() {
                break;
            }
            handled += 1;
        }

        Ok(handled)
    }
}
