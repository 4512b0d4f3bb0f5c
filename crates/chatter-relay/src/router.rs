//! Relay hub — the single task that owns connection and room state
//!
//! Connection tasks never touch the registry or the room directory directly.
//! They send [`Command`]s through a [`RelayHandle`] and the hub applies them one
//! at a time, so admission, membership changes and broadcasts are serialized
//! and messages within a room go out in the order they were received.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;
use crate::protocol::{InboundEvent, RelayEvent, RoomId};
use crate::registry::{Admitted, ConnectionId, ConnectionRegistry, Delivery};
use crate::rooms::RoomDirectory;

/// Tunables for the hub and the per-connection tasks
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Connections beyond this are refused at handshake time
    pub max_connections: usize,
    /// Frames queued per connection before it counts as stalled
    pub outbound_buffer: usize,
    /// Pending commands queued for the hub
    pub command_buffer: usize,
    /// How often the server pings each client
    pub heartbeat_interval: Duration,
    /// A connection with no inbound frame for this long is closed
    pub idle_timeout: Duration,
    /// Origins allowed to open a connection; empty or `"*"` allows any
    pub allowed_origins: Vec<String>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            outbound_buffer: 64,
            command_buffer: 1024,
            heartbeat_interval: Duration::from_secs(25),
            idle_timeout: Duration::from_secs(60),
            allowed_origins: vec!["http://localhost:4000".to_string()],
        }
    }
}

/// Point-in-time counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    pub connections: usize,
    pub rooms: usize,
}

enum Command {
    Admit {
        reply: oneshot::Sender<Result<Admitted, RelayError>>,
    },
    Inbound {
        from: ConnectionId,
        event: InboundEvent,
    },
    Disconnect {
        id: ConnectionId,
    },
    Members {
        room: RoomId,
        reply: oneshot::Sender<HashSet<ConnectionId>>,
    },
    Stats {
        reply: oneshot::Sender<RelayStats>,
    },
}

/// Cloneable sender side of the hub
#[derive(Clone)]
pub struct RelayHandle {
    commands: mpsc::Sender<Command>,
}

impl RelayHandle {
    /// Register a new connection with the hub
    pub async fn admit(&self) -> Result<Admitted, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Admit { reply }).await?;
        rx.await.map_err(|_| RelayError::HubClosed)?
    }

    /// Hand an inbound event from `from` to the hub
    pub async fn dispatch(&self, from: ConnectionId, event: InboundEvent) -> Result<(), RelayError> {
        self.send(Command::Inbound { from, event }).await
    }

    /// Remove a connection and all of its memberships. Safe to call repeatedly.
    pub async fn disconnect(&self, id: ConnectionId) {
        if self.send(Command::Disconnect { id }).await.is_err() {
            debug!("Hub already stopped, skipping disconnect of {}", id);
        }
    }

    /// Fire-and-forget variant of [`disconnect`](Self::disconnect) for sync contexts
    pub fn disconnect_detached(&self, id: ConnectionId) {
        let handle = self.clone();
        tokio::spawn(async move { handle.disconnect(id).await });
    }

    /// Current members of a room; empty for unknown rooms
    pub async fn members(&self, room: &RoomId) -> Result<HashSet<ConnectionId>, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Members {
            room: room.clone(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| RelayError::HubClosed)
    }

    pub async fn stats(&self) -> Result<RelayStats, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply }).await?;
        rx.await.map_err(|_| RelayError::HubClosed)
    }

    async fn send(&self, command: Command) -> Result<(), RelayError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RelayError::HubClosed)
    }
}

/// Coordinator owning the connection registry and the room directory
pub struct RelayHub {
    registry: ConnectionRegistry,
    rooms: RoomDirectory,
    commands: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
}

impl RelayHub {
    /// Start the hub task. It runs until `shutdown` is cancelled or every
    /// handle is dropped, then closes all remaining connections.
    pub fn spawn(options: &RelayOptions, shutdown: CancellationToken) -> (RelayHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(options.command_buffer.max(1));
        let hub = Self {
            registry: ConnectionRegistry::new(options.max_connections, options.outbound_buffer),
            rooms: RoomDirectory::new(),
            commands: rx,
            shutdown,
        };
        let task = tokio::spawn(hub.run());
        (RelayHandle { commands: tx }, task)
    }

    async fn run(mut self) {
        info!("Relay hub started");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Relay hub shutting down");
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => {
                        debug!("All relay handles dropped");
                        break;
                    }
                },
            }
        }

        let remaining = self.registry.len();
        self.registry.close_all();
        info!("Relay hub stopped ({} connections closed)", remaining);
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Admit { reply } => {
                let result = self.registry.admit();
                if let Err(e) = &result {
                    warn!("Refusing connection: {}", e);
                }
                if let Err(Ok(admitted)) = reply.send(result) {
                    // Caller gave up waiting; do not leak the slot
                    self.disconnect(admitted.id);
                }
            }
            Command::Inbound { from, event } => self.route(from, event),
            Command::Disconnect { id } => self.disconnect(id),
            Command::Members { room, reply } => {
                let _ = reply.send(self.rooms.members(&room));
            }
            Command::Stats { reply } => {
                let _ = reply.send(RelayStats {
                    connections: self.registry.len(),
                    rooms: self.rooms.room_count(),
                });
            }
        }
    }

    fn route(&mut self, from: ConnectionId, event: InboundEvent) {
        // Events can still be in flight after their connection was evicted
        if !self.registry.contains(from) {
            debug!("Ignoring '{}' from departed connection {}", event.name(), from);
            return;
        }

        match event {
            InboundEvent::JoinChat { room_id } => {
                if self.rooms.join(room_id.clone(), from) {
                    info!("Connection {} joined chat {}", from, room_id);
                }
            }
            InboundEvent::LeaveChat { room_id } => {
                if self.rooms.leave(&room_id, from) {
                    info!("Connection {} left chat {}", from, room_id);
                }
            }
            InboundEvent::SendMessage { room_id, message } => {
                let delivered = self.broadcast(&room_id, &RelayEvent::receive_message(message));
                debug!("Message in chat {} relayed to {} members", room_id, delivered);
            }
            InboundEvent::DeleteMessage { room_id, message_id } => {
                let delivered = self.broadcast(&room_id, &RelayEvent::message_deleted(&message_id));
                info!(
                    "Message {} deleted in chat {} ({} members notified)",
                    message_id, room_id, delivered
                );
            }
            InboundEvent::NewUser { user_id } => {
                if let Some(handle) = self.registry.get_mut(from) {
                    debug!("Connection {} identified as user {}", from, user_id);
                    handle.set_user_id(user_id);
                }
            }
            InboundEvent::Disconnect => self.disconnect(from),
        }
    }

    /// Queue `event` for every current member of `room`. Members that cannot
    /// take it right now are evicted; the rest still receive it.
    fn broadcast(&mut self, room: &RoomId, event: &RelayEvent) -> usize {
        let members = self.rooms.members(room);
        if members.is_empty() {
            return 0;
        }

        let frame = match event.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to serialize '{}' event: {}", event.event, e);
                return 0;
            }
        };

        let mut delivered = 0;
        let mut stalled = Vec::new();
        for id in members {
            let Some(handle) = self.registry.get(id) else {
                stalled.push(id);
                continue;
            };
            match handle.try_deliver(&frame) {
                Delivery::Sent => delivered += 1,
                Delivery::Full => {
                    warn!("Connection {} is not keeping up, dropping it", id);
                    stalled.push(id);
                }
                Delivery::Closed => {
                    debug!("Connection {} writer already gone", id);
                    stalled.push(id);
                }
            }
        }

        for id in stalled {
            self.disconnect(id);
        }
        delivered
    }

    fn disconnect(&mut self, id: ConnectionId) {
        let left = self.rooms.leave_all(id);
        if self.registry.remove(id).is_some() {
            debug!("Connection {} left {} rooms on disconnect", id, left);
        }
    }
}
