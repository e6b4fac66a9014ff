pub mod auth;
pub mod config;
pub mod connection;
pub mod control_plane;
pub mod dashboard;
pub mod dispatch;
pub mod error;
pub mod grpc;
pub mod manifest;
pub mod registry;
pub mod shutdown;
pub mod spec;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("sigma.node.v1");
}
