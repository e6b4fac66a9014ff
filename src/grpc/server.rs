use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::dispatch::Dispatcher;
use crate::grpc::node_service::NodeService;
use crate::proto::node_handler_server::NodeHandlerServer;

pub struct GrpcServer {
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, dispatcher: Arc<Dispatcher>) -> Self {
        Self { addr, dispatcher }
    }

    /// Serve until `shutdown` is cancelled.
    ///
    /// On shutdown every node connection is closed first so that active
    /// streams end and the server can drain.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        let service = NodeService::new(self.dispatcher.clone());
        let dispatcher = self.dispatcher.clone();

        tracing::info!(addr = %self.addr, "Starting gRPC server");

        Server::builder()
            .add_service(NodeHandlerServer::new(service))
            .serve_with_shutdown(self.addr, drain_on_shutdown(dispatcher, shutdown))
            .await
    }

    /// Serve on an already bound listener. Used when the caller picks an
    /// ephemeral port.
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), tonic::transport::Error> {
        let service = NodeService::new(self.dispatcher.clone());
        let dispatcher = self.dispatcher.clone();

        tracing::info!(addr = ?listener.local_addr().ok(), "Starting gRPC server");

        Server::builder()
            .add_service(NodeHandlerServer::new(service))
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                drain_on_shutdown(dispatcher, shutdown),
            )
            .await
    }
}

async fn drain_on_shutdown(dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) {
    shutdown.cancelled().await;
    let closed = dispatcher.registry().drain().await;
    tracing::info!(closed, "Shutting down gRPC server");
}
