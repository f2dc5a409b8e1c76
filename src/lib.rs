//! Real-time presence and private message hub
//!
//! Tracks which users are reachable over WebSocket and routes private
//! messages between them, across any number of devices per user.
//!
//! # Features
//! - Presence: online/offline notices on a user's first/last connection
//! - Private messages delivered to every device of the recipient
//! - Delivery receipts (`message_delivered` / `message_failed`)
//! - Echo of outgoing messages to the sender's other sessions
//! - Conversation history through an injected `HistoryBridge`
//! - Keepalive pings and a liveness deadline per connection
//! - Slow consumers are disconnected instead of blocking anyone
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `Hub` is the central actor owning the registry and user index
//! - Each connection runs an inbound and an outbound pump that talk to the
//!   hub only through events and their own bounded outbound queue
//! - `Presence` is the one piece of shared state: a read-only projection
//!   behind a reader-writer lock
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use presence_hub::{serve, ConnectionSettings, EmptyHistory, Hub, HubSettings, StaticSessions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:8083").await.unwrap();
//!     let (hub, handle) = Hub::new(Arc::new(EmptyHistory), HubSettings::default());
//!     tokio::spawn(hub.run());
//!
//!     let sessions = StaticSessions::new(vec!["secret:1:alice".parse().unwrap()]);
//!     serve(listener, handle, Arc::new(sessions), ConnectionSettings::default()).await;
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod hub;
pub mod identity;
pub mod message;
pub mod presence;
pub mod server;
pub mod types;

// Re-export main types for convenience
pub use config::Config;
pub use connection::{Connection, ConnectionHandle, ConnectionSettings, Delivery, Outbound};
pub use error::{AppError, ConfigError, DecodeError, HistoryError, ValidationError};
pub use history::{EmptyHistory, HistoryBridge, HistoryEntry};
pub use hub::{Hub, HubEvent, HubHandle, HubSettings};
pub use identity::{IdentityResolver, SessionEntry, StaticSessions};
pub use message::{Envelope, EnvelopeKind};
pub use presence::Presence;
pub use server::{accept_connection, serve};
pub use types::{ConnectionId, Identity, UserId};
