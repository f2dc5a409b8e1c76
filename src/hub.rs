//! Hub actor implementation
//!
//! The single owner of the connection registry and the user index. Every
//! state transition happens inside `Hub::run`, one event at a time, so the
//! hub itself needs no locks. The only shared state is the `Presence`
//! projection, written here and read from anywhere.
//!
//! Sends to connections never block: each goes through
//! `ConnectionHandle::enqueue`, and a connection whose queue is full is
//! evicted after the current fan-out finishes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionHandle, Delivery};
use crate::error::AppError;
use crate::history::HistoryBridge;
use crate::message::Envelope;
use crate::presence::Presence;
use crate::types::{ConnectionId, UserId};

/// Hub event queue capacity
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Messages returned per history request
pub const DEFAULT_HISTORY_PAGE_SIZE: u32 = 50;

/// Events processed by the hub loop
#[derive(Debug)]
pub enum HubEvent {
    /// Connection came up
    Register(ConnectionHandle),
    /// Connection went away
    Unregister(ConnectionId),
    /// Pre-encoded payload for every connection
    Broadcast(String),
    /// Validated private message from `origin`
    PrivateMessage {
        origin: ConnectionId,
        envelope: Envelope,
    },
    /// Validated history request from `origin`
    LoadHistory {
        origin: ConnectionId,
        envelope: Envelope,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct HubSettings {
    pub event_capacity: usize,
    pub history_page_size: u32,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
        }
    }
}

/// Cloneable ingress into the hub loop
#[derive(Debug, Clone)]
pub struct HubHandle {
    sender: mpsc::Sender<HubEvent>,
    presence: Presence,
}

impl HubHandle {
    pub async fn send(&self, event: HubEvent) -> Result<(), AppError> {
        self.sender.send(event).await.map_err(|_| AppError::HubClosed)
    }

    pub async fn register(&self, handle: ConnectionHandle) -> Result<(), AppError> {
        self.send(HubEvent::Register(handle)).await
    }

    pub async fn unregister(&self, id: ConnectionId) -> Result<(), AppError> {
        self.send(HubEvent::Unregister(id)).await
    }

    /// Encode once and fan out to every connection
    pub async fn broadcast(&self, envelope: &Envelope) -> Result<(), AppError> {
        let payload = envelope.encode()?;
        self.send(HubEvent::Broadcast(payload)).await
    }

    pub async fn send_private_message(
        &self,
        origin: ConnectionId,
        envelope: Envelope,
    ) -> Result<(), AppError> {
        self.send(HubEvent::PrivateMessage { origin, envelope }).await
    }

    pub async fn request_history(
        &self,
        origin: ConnectionId,
        envelope: Envelope,
    ) -> Result<(), AppError> {
        self.send(HubEvent::LoadHistory { origin, envelope }).await
    }

    /// Read-only presence for collaborators outside the hub loop
    pub fn presence(&self) -> &Presence {
        &self.presence
    }
}

/// userId -> active connections, in registration order
///
/// A key exists only while its list is non-empty.
#[derive(Debug, Default)]
struct UserIndex {
    users: HashMap<UserId, Vec<ConnectionId>>,
}

impl UserIndex {
    /// Add a connection; returns the user's connection count afterwards
    fn insert(&mut self, user_id: UserId, id: ConnectionId) -> usize {
        let connections = self.users.entry(user_id).or_default();
        if !connections.contains(&id) {
            connections.push(id);
        }
        connections.len()
    }

    /// Remove a connection; returns the user's connection count afterwards
    fn remove(&mut self, user_id: UserId, id: ConnectionId) -> usize {
        let Some(connections) = self.users.get_mut(&user_id) else {
            return 0;
        };
        connections.retain(|c| *c != id);
        let remaining = connections.len();
        if remaining == 0 {
            self.users.remove(&user_id);
        }
        remaining
    }

    fn connections(&self, user_id: UserId) -> &[ConnectionId] {
        self.users.get(&user_id).map(Vec::as_slice).unwrap_or(&[])
    }

    fn contains(&self, user_id: UserId) -> bool {
        self.users.contains_key(&user_id)
    }

    fn user_ids(&self) -> impl Iterator<Item = UserId> + '_ {
        self.users.keys().copied()
    }
}

/// The hub actor
pub struct Hub {
    /// All active connections: ConnectionId -> handle
    registry: HashMap<ConnectionId, ConnectionHandle>,
    /// Active connections per user
    users: UserIndex,
    presence: Presence,
    history: Arc<dyn HistoryBridge>,
    history_page_size: u32,
    receiver: mpsc::Receiver<HubEvent>,
}

impl Hub {
    /// Create the hub and its ingress handle
    ///
    /// An event capacity of zero is treated as one.
    pub fn new(history: Arc<dyn HistoryBridge>, settings: HubSettings) -> (Self, HubHandle) {
        let (sender, receiver) = mpsc::channel(settings.event_capacity.max(1));
        let presence = Presence::new();
        let hub = Self {
            registry: HashMap::new(),
            users: UserIndex::default(),
            presence: presence.clone(),
            history,
            history_page_size: settings.history_page_size,
            receiver,
        };
        (hub, HubHandle { sender, presence })
    }

    /// Run the event loop until every `HubHandle` is dropped
    pub async fn run(mut self) {
        info!("Hub started");

        while let Some(event) = self.receiver.recv().await {
            self.handle_event(event);
        }

        info!("Hub shutting down");
    }

    /// Process a single event
    fn handle_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::Register(handle) => self.register(handle),
            HubEvent::Unregister(id) => self.evict(vec![id]),
            HubEvent::Broadcast(payload) => {
                let dropped = self.fan_out(&payload, None);
                self.evict(dropped);
            }
            HubEvent::PrivateMessage { origin, envelope } => {
                self.route_private_message(origin, envelope)
            }
            HubEvent::LoadHistory { origin, envelope } => {
                self.route_history_request(origin, envelope)
            }
        }
    }

    fn register(&mut self, handle: ConnectionHandle) {
        let id = handle.id();
        let identity = handle.identity().clone();

        if self.registry.contains_key(&id) {
            return;
        }
        self.registry.insert(id, handle);
        let count = self.users.insert(identity.user_id, id);
        self.presence.set(identity.user_id, count);

        info!(
            connection_id = %id,
            user_id = %identity.user_id,
            connections = count,
            "Connection registered"
        );

        let mut dropped = Vec::new();

        if count == 1 {
            if let Some(payload) = encode(&Envelope::user_online(&identity)) {
                dropped.extend(self.fan_out(&payload, Some(id)));
            }
        }

        if let Some(payload) = encode(&Envelope::online_users(self.online_names())) {
            dropped.extend(self.send_each(&[id], &payload).1);
        }

        self.evict(dropped);

        debug!(
            "Total connections: {}, online users: {}",
            self.registry.len(),
            self.users.users.len()
        );
    }

    /// Unregister connections, including any that overflow while the
    /// resulting offline notices go out
    fn evict(&mut self, ids: Vec<ConnectionId>) {
        let mut pending = ids;
        while let Some(id) = pending.pop() {
            let Some(handle) = self.registry.remove(&id) else {
                continue;
            };
            handle.close();

            let identity = handle.identity();
            let remaining = self.users.remove(identity.user_id, id);
            self.presence.set(identity.user_id, remaining);

            info!(
                connection_id = %id,
                user_id = %identity.user_id,
                connections = remaining,
                "Connection unregistered"
            );

            if remaining == 0 {
                if let Some(payload) = encode(&Envelope::user_offline(identity)) {
                    pending.extend(self.fan_out(&payload, None));
                }
            }
        }
    }

    /// Enqueue on every registered connection except `except`
    ///
    /// Returns the connections that dropped the payload; the caller evicts
    /// them once iteration is over.
    fn fan_out(&self, payload: &str, except: Option<ConnectionId>) -> Vec<ConnectionId> {
        debug!("Broadcasting to {} connections", self.registry.len());
        let mut dropped = Vec::new();
        for (id, handle) in &self.registry {
            if Some(*id) == except {
                continue;
            }
            if handle.enqueue(payload.to_owned()) == Delivery::Dropped {
                dropped.push(*id);
            }
        }
        dropped
    }

    /// Enqueue on each listed connection; returns (delivered count, dropped)
    fn send_each(&self, ids: &[ConnectionId], payload: &str) -> (usize, Vec<ConnectionId>) {
        let mut delivered = 0;
        let mut dropped = Vec::new();
        for id in ids {
            let Some(handle) = self.registry.get(id) else {
                continue;
            };
            match handle.enqueue(payload.to_owned()) {
                Delivery::Delivered => delivered += 1,
                Delivery::Dropped => dropped.push(*id),
            }
        }
        (delivered, dropped)
    }

    fn route_private_message(&mut self, origin: ConnectionId, envelope: Envelope) {
        let (Some(from), Some(to)) = (envelope.from_user_id, envelope.to_user_id) else {
            return;
        };
        debug!(from = %from, to = %to, "Routing private message");

        let mut dropped = Vec::new();

        let recipients = self.users.connections(to).to_vec();
        let delivered = if recipients.is_empty() {
            debug!(to = %to, "Recipient offline");
            0
        } else {
            match encode(&envelope) {
                Some(payload) => {
                    let (delivered, failed) = self.send_each(&recipients, &payload);
                    dropped.extend(failed);
                    delivered
                }
                None => 0,
            }
        };

        let senders = self.users.connections(from).to_vec();
        if delivered > 0 {
            if let Some(payload) = encode(&Envelope::message_delivered(
                Some(to),
                envelope.message_id,
            )) {
                dropped.extend(self.send_each(&senders, &payload).1);
            }

            let others: Vec<ConnectionId> =
                senders.iter().copied().filter(|id| *id != origin).collect();
            if !others.is_empty() {
                if let Some(payload) = encode(&envelope.to_echo()) {
                    dropped.extend(self.send_each(&others, &payload).1);
                }
            }
        } else if let Some(payload) =
            encode(&Envelope::message_failed(Some(to), envelope.message_id))
        {
            dropped.extend(self.send_each(&senders, &payload).1);
        }

        self.evict(dropped);
    }

    fn route_history_request(&mut self, origin: ConnectionId, envelope: Envelope) {
        let (Some(from), Some(to)) = (envelope.from_user_id, envelope.to_user_id) else {
            return;
        };

        if !self.users.contains(from) {
            debug!(user_id = %from, "History requester not registered");
            return;
        }

        let offset = envelope.offset.unwrap_or(0);
        let entries = match self.history.load(from, to, self.history_page_size, offset) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(user_id = %from, with = %to, error = %e, "Failed to load history");
                return;
            }
        };

        let target = if self.registry.contains_key(&origin) {
            origin
        } else {
            match self.users.connections(from).first() {
                Some(id) => *id,
                None => return,
            }
        };

        let count = entries.len();
        if let Some(payload) = encode(&Envelope::history_loaded(to, offset, entries)) {
            let (delivered, dropped) = self.send_each(&[target], &payload);
            if delivered > 0 {
                debug!(user_id = %from, messages = count, "Sent history");
            }
            self.evict(dropped);
        }
    }

    /// One display name per online user, ordered by user id
    fn online_names(&self) -> Vec<String> {
        let mut user_ids: Vec<UserId> = self.users.user_ids().collect();
        user_ids.sort();
        user_ids
            .into_iter()
            .filter_map(|user_id| {
                let id = self.users.connections(user_id).first()?;
                let handle = self.registry.get(id)?;
                Some(handle.identity().display_name.clone())
            })
            .collect()
    }
}

fn encode(envelope: &Envelope) -> Option<String> {
    match envelope.encode() {
        Ok(payload) => Some(payload),
        Err(e) => {
            error!(kind = %envelope.kind, error = %e, "Failed to encode envelope");
            None
        }
    }
}
