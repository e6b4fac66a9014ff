use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::connection::{CloseOutcome, ConnectionState, NodeConnection};
use crate::error::{CollisionKind, DispatchError, Result};

/// Point-in-time view of one connection, used for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSummary {
    pub urn: String,
    pub state: ConnectionState,
}

/// Admission control for node connections, keyed by URN.
///
/// Lookups share the read lock; `add` and `remove` take the write lock. Each
/// connection guards its own mutable state, so holding a looked-up
/// `Arc<NodeConnection>` after the lock is released is fine.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    conns: RwLock<HashMap<String, Arc<NodeConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new connection. Never overwrites an existing entry.
    pub async fn add(&self, conn: Arc<NodeConnection>) -> Result<()> {
        let mut conns = self.conns.write().await;

        if let Some(existing) = conns.get(conn.urn()) {
            let kind = if existing.same_secret(&conn) {
                CollisionKind::Duplicate
            } else {
                CollisionKind::SecretMismatch
            };
            tracing::warn!(urn = %conn.urn(), kind = ?kind, "Rejected node admission");
            return Err(DispatchError::Collision {
                urn: conn.urn().to_string(),
                kind,
            });
        }

        conns.insert(conn.urn().to_string(), conn);
        Ok(())
    }

    /// Find a connection and check its secret.
    pub async fn lookup(&self, urn: &str, secret: &str) -> Result<Arc<NodeConnection>> {
        let conns = self.conns.read().await;

        let conn = conns
            .get(urn)
            .ok_or_else(|| DispatchError::UnknownIdentity(urn.to_string()))?;

        if !conn.secret_matches(secret) {
            return Err(DispatchError::InvalidSecret(urn.to_string()));
        }

        Ok(conn.clone())
    }

    /// Delete a connection and close it. Any stream attached to it ends with
    /// `Closed`. Returns what the close did to the attached queue pair.
    pub async fn remove(&self, urn: &str) -> Result<CloseOutcome> {
        let mut conns = self.conns.write().await;
        let conn = conns
            .remove(urn)
            .ok_or_else(|| DispatchError::UnknownIdentity(urn.to_string()))?;
        let outcome = conn.close();

        tracing::info!(urn = %urn, outcome = ?outcome, "Node connection removed");
        Ok(outcome)
    }

    /// Close and remove every connection. Returns how many were removed.
    pub async fn drain(&self) -> usize {
        let mut conns = self.conns.write().await;
        let count = conns.len();
        for (_, conn) in conns.drain() {
            conn.close();
        }
        count
    }

    pub async fn get(&self, urn: &str) -> Option<Arc<NodeConnection>> {
        self.conns.read().await.get(urn).cloned()
    }

    pub async fn contains(&self, urn: &str) -> bool {
        self.conns.read().await.contains_key(urn)
    }

    pub async fn len(&self) -> usize {
        self.conns.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conns.read().await.is_empty()
    }

    /// Summaries of all connections sorted by URN.
    pub async fn summaries(&self) -> Vec<ConnectionSummary> {
        let conns = self.conns.read().await;
        let mut summaries: Vec<ConnectionSummary> = conns
            .values()
            .map(|conn| ConnectionSummary {
                urn: conn.urn().to_string(),
                state: conn.state(),
            })
            .collect();
        summaries.sort_by(|a, b| a.urn.cmp(&b.urn));
        summaries
    }
}
