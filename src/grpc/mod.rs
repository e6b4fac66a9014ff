pub mod node_service;
pub mod server;

pub use node_service::NodeService;
pub use server::GrpcServer;
