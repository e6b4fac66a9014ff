use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::auth::Credentials;
use crate::dispatch::{event_channel, Dispatcher};
use crate::proto::node_handler_server::NodeHandler;
use crate::proto::{DispatchEvent, ExecutionResult, NodeRegistrationRequest, NodeRegistrationResponse};

/// gRPC service for worker nodes
pub struct NodeService {
    dispatcher: Arc<Dispatcher>,
}

impl NodeService {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

type DispatchStream =
    Pin<Box<dyn tokio_stream::Stream<Item = Result<DispatchEvent, Status>> + Send>>;

#[tonic::async_trait]
impl NodeHandler for NodeService {
    type SubscribeStream = DispatchStream;

    async fn register(
        &self,
        request: Request<NodeRegistrationRequest>,
    ) -> Result<Response<NodeRegistrationResponse>, Status> {
        let credentials = Credentials::from_metadata(request.metadata())?;
        let req = request.into_inner();

        let spec = self
            .dispatcher
            .register(&credentials, &req.node_type)
            .await?;

        Ok(Response::new(NodeRegistrationResponse {
            urn: credentials.urn,
            parameters: spec.parameters_to_proto(),
            content: spec.content,
        }))
    }

    async fn subscribe(
        &self,
        request: Request<Streaming<ExecutionResult>>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let credentials = Credentials::from_metadata(request.metadata())?;

        // Attach before answering so guard failures reach the caller as the
        // RPC status rather than as a stream item.
        let session = self.dispatcher.attach(&credentials).await?;
        let inbound = request.into_inner();

        let (tx, rx) = event_channel();

        tokio::spawn(async move {
            let cause = session.run(inbound, tx.clone()).await;
            // Fails only if the node already hung up.
            let _ = tx.send(Err(Status::from(cause))).await;
        });

        let stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream) as Self::SubscribeStream))
    }
}
