use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::grpc::GrpcServer;
use crate::manifest::Manifest;
use crate::registry::ConnectionRegistry;

/// Owns the registry and wires the dispatch server, manifest and dashboard
/// together for one process.
pub struct ControlPlane {
    pub config: ServerConfig,
    pub dispatcher: Arc<Dispatcher>,
}

impl ControlPlane {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(registry, config.dispatch.clone()));
        Self { config, dispatcher }
    }

    /// Prepare the nodes listed in the configured manifest, if any.
    pub async fn load_manifest(&self) -> Result<usize> {
        let Some(path) = &self.config.manifest_path else {
            return Ok(0);
        };

        let manifest = Manifest::load(path).await?;
        let prepared = manifest.apply(&self.dispatcher).await?;
        tracing::info!(path = %path.display(), prepared, "Loaded node manifest");
        Ok(prepared)
    }

    /// Run the control plane until `shutdown` is cancelled.
    ///
    /// 1. Prepares nodes from the manifest
    /// 2. Optionally spawns the status dashboard
    /// 3. Runs the gRPC server (blocking)
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest is invalid or the gRPC server fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.load_manifest().await?;
        self.spawn_dashboard();

        let server = GrpcServer::new(self.config.listen_addr, self.dispatcher.clone());
        server.run(shutdown).await?;
        tracing::info!("Control plane stopped");
        Ok(())
    }

    /// Like [`run`](Self::run) but serves on an already bound listener.
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        self.load_manifest().await?;
        self.spawn_dashboard();

        let server = GrpcServer::new(self.config.listen_addr, self.dispatcher.clone());
        server.run_with_listener(listener, shutdown).await?;
        Ok(())
    }

    fn spawn_dashboard(&self) {
        if let Some(dashboard_addr) = self.config.dashboard_addr {
            let state = DashboardState {
                registry: self.dispatcher.registry().clone(),
            };
            tokio::spawn(async move {
                run_dashboard(dashboard_addr, state).await;
            });
        }
    }
}
