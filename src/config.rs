use std::net::SocketAddr;
use std::path::PathBuf;

use crate::connection::DEFAULT_QUEUE_CAPACITY;

/// Settings for the dispatch engine.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Capacity of the outbound request queue and the inbound result queue
    /// created for every attached stream.
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Address for the HTTP status dashboard. Disabled when `None`.
    pub dashboard_addr: Option<SocketAddr>,
    /// JSON manifest of nodes to prepare at startup.
    pub manifest_path: Option<PathBuf>,
    pub dispatch: DispatchConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:50061"
                .parse()
                .expect("default listen address is valid"),
            dashboard_addr: None,
            manifest_path: None,
            dispatch: DispatchConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_dashboard(mut self, addr: SocketAddr) -> Self {
        self.dashboard_addr = Some(addr);
        self
    }

    pub fn with_manifest(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifest_path = Some(path.into());
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.dispatch.queue_capacity = capacity;
        self
    }
}
