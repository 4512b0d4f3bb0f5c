//! Connection registry — every live client connection and its outbound queue

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::RelayError;
use crate::protocol::Frame;

/// Opaque identifier assigned to a connection when it is admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outcome of a non-blocking send to one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The connection's outbound queue is full (slow or stalled reader)
    Full,
    /// The connection's writer is gone
    Closed,
}

/// Registry-side view of a live connection
#[derive(Debug)]
pub struct ConnectionHandle {
    outbound: mpsc::Sender<Frame>,
    closed: CancellationToken,
    user_id: Option<String>,
    connected_at: DateTime<Utc>,
}

impl ConnectionHandle {
    /// Queue a frame for this connection without waiting.
    pub fn try_deliver(&self, frame: &Frame) -> Delivery {
        match self.outbound.try_send(frame.clone()) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Signal the connection's tasks to stop
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn set_user_id(&mut self, user_id: impl Into<String>) {
        self.user_id = Some(user_id.into());
    }
}

/// Transport-side half of an admitted connection.
///
/// The transport drains `outbound` into the socket and stops reading once
/// `closed` is cancelled.
#[derive(Debug)]
pub struct Admitted {
    pub id: ConnectionId,
    pub closed: CancellationToken,
    pub outbound: mpsc::Receiver<Frame>,
}

/// Owns every live connection. Not synchronized; the relay hub is its only user.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    max_connections: usize,
    outbound_buffer: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize, outbound_buffer: usize) -> Self {
        Self {
            connections: HashMap::new(),
            max_connections,
            outbound_buffer: outbound_buffer.max(1),
        }
    }

    /// Admit a new connection, or refuse it when the limit is reached
    pub fn admit(&mut self) -> Result<Admitted, RelayError> {
        if self.connections.len() >= self.max_connections {
            return Err(RelayError::TooManyConnections {
                limit: self.max_connections,
            });
        }

        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.outbound_buffer);
        let closed = CancellationToken::new();
        self.connections.insert(
            id,
            ConnectionHandle {
                outbound: tx,
                closed: closed.clone(),
                user_id: None,
                connected_at: Utc::now(),
            },
        );
        debug!("Admitted connection {} ({} live)", id, self.connections.len());

        Ok(Admitted {
            id,
            closed,
            outbound: rx,
        })
    }

    /// Remove a connection and close it. Removing an unknown id is a no-op.
    pub fn remove(&mut self, id: ConnectionId) -> Option<ConnectionHandle> {
        let handle = self.connections.remove(&id)?;
        handle.close();
        info!(
            "Removed connection {} (user: {}, connected {}s)",
            id,
            handle.user_id().unwrap_or("-"),
            (Utc::now() - handle.connected_at).num_seconds()
        );
        Some(handle)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionHandle> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut ConnectionHandle> {
        self.connections.get_mut(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close and forget every connection (hub shutdown)
    pub fn close_all(&mut self) {
        for (_, handle) in self.connections.drain() {
            handle.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_assigns_unique_ids() {
        let mut registry = ConnectionRegistry::new(8, 4);
        let a = registry.admit().unwrap();
        let b = registry.admit().unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(a.id));
    }

    #[test]
    fn test_admit_refuses_over_limit() {
        let mut registry = ConnectionRegistry::new(1, 4);
        let a = registry.admit().unwrap();
        let err = registry.admit().unwrap_err();
        assert!(matches!(err, RelayError::TooManyConnections { limit: 1 }));

        // A slot frees up once a connection leaves
        registry.remove(a.id);
        assert!(registry.admit().is_ok());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut registry = ConnectionRegistry::new(8, 4);
        let a = registry.admit().unwrap();
        assert!(registry.remove(a.id).is_some());
        assert!(registry.remove(a.id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_cancels_close_token() {
        let mut registry = ConnectionRegistry::new(8, 4);
        let a = registry.admit().unwrap();
        assert!(!a.closed.is_cancelled());
        registry.remove(a.id);
        assert!(a.closed.is_cancelled());
    }

    #[tokio::test]
    async fn test_try_deliver_sent() {
        let mut registry = ConnectionRegistry::new(8, 4);
        let mut a = registry.admit().unwrap();
        let frame: Frame = Frame::from("hello");
        assert_eq!(registry.get(a.id).unwrap().try_deliver(&frame), Delivery::Sent);
        assert_eq!(&*a.outbound.recv().await.unwrap(), "hello");
    }

    #[test]
    fn test_try_deliver_full_and_closed() {
        let mut registry = ConnectionRegistry::new(8, 1);
        let a = registry.admit().unwrap();
        let frame: Frame = Frame::from("x");
        let handle = registry.get(a.id).unwrap();
        assert_eq!(handle.try_deliver(&frame), Delivery::Sent);
        assert_eq!(handle.try_deliver(&frame), Delivery::Full);

        drop(a.outbound);
        assert_eq!(handle.try_deliver(&frame), Delivery::Closed);
    }

    #[test]
    fn test_user_id_recorded() {
        let mut registry = ConnectionRegistry::new(8, 4);
        let a = registry.admit().unwrap();
        assert!(registry.get(a.id).unwrap().user_id().is_none());
        registry.get_mut(a.id).unwrap().set_user_id("u1");
        assert_eq!(registry.get(a.id).unwrap().user_id(), Some("u1"));
    }

    #[test]
    fn test_close_all() {
        let mut registry = ConnectionRegistry::new(8, 4);
        let a = registry.admit().unwrap();
        let b = registry.admit().unwrap();
        registry.close_all();
        assert!(registry.is_empty());
        assert!(a.closed.is_cancelled());
        assert!(b.closed.is_cancelled());
    }
}
