//! Worker-side client for the node handler service.
//!
//! Used by the `worker` CLI subcommand and by integration tests:
//! - **Registration**: sends credentials and the node type, decodes the spec
//! - **Subscription**: opens the duplex stream, results out and events in
//! - **Echo loop**: answers every dispatch event with its own payload

pub mod client;

pub use client::WorkerClient;
