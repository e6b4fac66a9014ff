//! Startup manifest of nodes to admit.
//!
//! The registry is volatile; a manifest lets the server rebuild it at start
//! by running `prepare` for every listed node.
//!
//! ```json
//! {
//!   "nodes": [
//!     {
//!       "urn": "urn:node:1",
//!       "secret": "s3cr3t",
//!       "content": "function handler(input) { return input; }",
//!       "parameters": [{ "name": "timeout_ms", "value": 5000 }]
//!     }
//!   ]
//! }
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::dispatch::Dispatcher;
use crate::error::{DispatchError, Result};
use crate::spec::{FunctionSpec, Parameter};

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestNode {
    pub urn: String,
    pub secret: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

impl ManifestNode {
    pub fn spec(&self) -> FunctionSpec {
        FunctionSpec {
            content: self.content.clone().into_bytes(),
            parameters: self.parameters.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub nodes: Vec<ManifestNode>,
}

impl Manifest {
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| DispatchError::Manifest(e.to_string()))
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| DispatchError::Manifest(format!("{}: {}", path.display(), e)))?;
        Self::parse(&json)
    }

    /// Prepare every node in the manifest. Stops at the first rejected node.
    pub async fn apply(&self, dispatcher: &Dispatcher) -> Result<usize> {
        for node in &self.nodes {
            dispatcher
                .prepare(node.urn.clone(), node.secret.clone(), node.spec())
                .await?;
        }
        Ok(self.nodes.len())
    }
}
