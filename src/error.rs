use std::fmt;

use thiserror::Error;
use tonic::Status;

/// Why an admission was rejected because the URN is already known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionKind {
    /// The existing entry was admitted with a different secret.
    SecretMismatch,
    /// The same identity was admitted twice with the same secret.
    Duplicate,
}

impl fmt::Display for CollisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollisionKind::SecretMismatch => write!(f, "URN collision with different secrets"),
            CollisionKind::Duplicate => write!(f, "connection already added"),
        }
    }
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Unknown node URN: {0}")]
    UnknownIdentity(String),

    #[error("Invalid secret for node {0}")]
    InvalidSecret(String),

    #[error("Cannot admit node {urn}: {kind}")]
    Collision { urn: String, kind: CollisionKind },

    #[error("Node {0} is already registered")]
    AlreadyRegistered(String),

    #[error("Node {0} is not registered")]
    NotRegistered(String),

    #[error("Node {0} already has an active stream")]
    AlreadyConnected(String),

    #[error("Node {0} has been closed")]
    Closed(String),

    #[error("Stream of node {0} failed")]
    StreamFailed(String),

    #[error("Request channel of node {0} terminated")]
    ChannelTerminated(String),

    #[error("Missing node type")]
    MissingNodeType,

    #[error("Node {0} has no active stream")]
    NotConnected(String),

    #[error("Failed to write to the stream of node {0}")]
    SendFailed(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("gRPC error: {0}")]
    Grpc(#[from] Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

impl From<DispatchError> for Status {
    fn from(err: DispatchError) -> Self {
        let message = err.to_string();
        match err {
            DispatchError::Auth(_) => Status::unauthenticated(message),
            DispatchError::UnknownIdentity(_) => Status::not_found(message),
            DispatchError::InvalidSecret(_) => Status::permission_denied(message),
            DispatchError::Collision { .. }
            | DispatchError::AlreadyRegistered(_)
            | DispatchError::AlreadyConnected(_) => Status::already_exists(message),
            DispatchError::NotRegistered(_) | DispatchError::NotConnected(_) => {
                Status::failed_precondition(message)
            }
            DispatchError::Closed(_) | DispatchError::ChannelTerminated(_) => {
                Status::aborted(message)
            }
            DispatchError::MissingNodeType | DispatchError::InvalidParameter(_) => {
                Status::invalid_argument(message)
            }
            DispatchError::Grpc(status) => status,
            DispatchError::StreamFailed(_)
            | DispatchError::SendFailed(_)
            | DispatchError::Manifest(_)
            | DispatchError::Transport(_) => Status::internal(message),
        }
    }
}
