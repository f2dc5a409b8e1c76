//! Connection: one WebSocket bound to one authenticated user
//!
//! Split in two halves:
//! - `ConnectionHandle` lives in the hub's registry. It owns the producer side
//!   of the bounded outbound queue and the shutdown signal.
//! - `Connection` owns the transport and runs the inbound and outbound pumps.
//!
//! Either pump exiting ends the whole connection: the other pump is stopped,
//! the hub is told to unregister, and the transport is dropped.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, trace, warn};

use crate::error::AppError;
use crate::hub::{HubEvent, HubHandle};
use crate::message::{Envelope, EnvelopeKind};
use crate::types::{ConnectionId, Identity};

/// Outbound queue capacity per connection
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Interval between keepalive pings (must be shorter than the pong wait)
pub const DEFAULT_PING_PERIOD: Duration = Duration::from_secs(54);

/// Liveness deadline: time allowed without any inbound frame
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(60);

/// Time allowed for a single frame write
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);

/// Per-connection tunables
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub queue_capacity: usize,
    pub ping_period: Duration,
    pub pong_wait: Duration,
    pub write_wait: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            ping_period: DEFAULT_PING_PERIOD,
            pong_wait: DEFAULT_PONG_WAIT,
            write_wait: DEFAULT_WRITE_WAIT,
        }
    }
}

/// Outcome of a non-blocking enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Queue full (connection torn down) or already closed
    Dropped,
}

/// Hub-side view of a connection
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: Identity,
    outbound: mpsc::Sender<String>,
    shutdown: watch::Sender<bool>,
}

/// Consumer side of a connection's outbound queue
#[derive(Debug)]
pub struct Outbound {
    queue: mpsc::Receiver<String>,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionHandle {
    /// Create a handle and the matching outbound queue
    ///
    /// A capacity of zero is treated as one.
    pub fn new(identity: Identity, capacity: usize) -> (Self, Outbound) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = Self {
            id: ConnectionId::new(),
            identity,
            outbound: outbound_tx,
            shutdown: shutdown_tx,
        };
        let outbound = Outbound {
            queue: outbound_rx,
            shutdown: shutdown_rx,
        };
        (handle, outbound)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Push a payload without waiting
    ///
    /// A full queue means the peer is not keeping up: the connection is torn
    /// down on the spot instead of making the caller wait.
    pub fn enqueue(&self, payload: String) -> Delivery {
        if self.is_closed() {
            return Delivery::Dropped;
        }
        match self.outbound.try_send(payload) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => {
                warn!(
                    connection_id = %self.id,
                    user_id = %self.identity.user_id,
                    "Outbound queue full, dropping connection"
                );
                self.close();
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => Delivery::Dropped,
        }
    }

    /// Signal both pumps to stop. Idempotent.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow() || self.outbound.is_closed()
    }
}

impl Outbound {
    /// Next queued payload; `None` once the handle is gone and the queue drained
    pub async fn recv(&mut self) -> Option<String> {
        self.queue.recv().await
    }

    /// Next queued payload if one is ready
    pub fn try_recv(&mut self) -> Option<String> {
        self.queue.try_recv().ok()
    }

    /// Whether the hub side closed this connection or dropped its handle
    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }
}

/// Transport-side half of a connection
pub struct Connection<S> {
    handle: ConnectionHandle,
    outbound: Outbound,
    ws: WebSocketStream<S>,
    hub: HubHandle,
    settings: ConnectionSettings,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Bind an upgraded transport to an already-resolved identity
    pub fn new(
        ws: WebSocketStream<S>,
        identity: Identity,
        hub: HubHandle,
        settings: ConnectionSettings,
    ) -> Self {
        let (handle, outbound) = ConnectionHandle::new(identity, settings.queue_capacity);
        Self {
            handle,
            outbound,
            ws,
            hub,
            settings,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    /// Register with the hub and run both pumps in the background
    ///
    /// Returns immediately. The returned task completes once the connection
    /// has ended and the hub has been told to unregister it.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let Connection {
            handle,
            outbound,
            ws,
            hub,
            settings,
        } = self;

        let id = handle.id();
        let identity = handle.identity().clone();

        // Registration is sent before either pump exists, so the hub always
        // sees Register before the matching Unregister.
        if hub.register(handle).await.is_err() {
            warn!(connection_id = %id, "Hub closed, dropping new connection");
            return;
        }

        let (sink, stream) = ws.split();

        let mut read_task = tokio::spawn(inbound_pump(
            stream,
            id,
            identity.clone(),
            hub.clone(),
            settings.pong_wait,
        ));
        let mut write_task = tokio::spawn(outbound_pump(
            sink,
            outbound,
            id,
            settings.ping_period,
            settings.write_wait,
        ));

        tokio::select! {
            result = &mut read_task => {
                write_task.abort();
                log_pump_exit("Inbound", id, result);
            }
            result = &mut write_task => {
                read_task.abort();
                log_pump_exit("Outbound", id, result);
            }
        }

        let _ = hub.unregister(id).await;

        info!(
            connection_id = %id,
            user_id = %identity.user_id,
            "Connection closed"
        );
    }
}

fn log_pump_exit(
    pump: &str,
    id: ConnectionId,
    result: Result<Result<(), AppError>, tokio::task::JoinError>,
) {
    match result {
        Ok(Ok(())) => debug!(connection_id = %id, "{} pump finished", pump),
        Ok(Err(e)) => debug!(connection_id = %id, error = %e, "{} pump failed", pump),
        Err(e) => warn!(connection_id = %id, error = %e, "{} pump panicked", pump),
    }
}

/// Read frames, turn valid envelopes into hub events
///
/// Every inbound frame (pongs included) restarts the liveness deadline.
async fn inbound_pump<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    id: ConnectionId,
    identity: Identity,
    hub: HubHandle,
    pong_wait: Duration,
) -> Result<(), AppError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = match timeout(pong_wait, stream.next()).await {
            Err(_) => return Err(AppError::DeadlineExpired),
            Ok(None) => return Ok(()),
            Ok(Some(frame)) => frame?,
        };

        match frame {
            Message::Text(text) => {
                if let Some(event) = route_frame(text.as_str(), id, &identity) {
                    hub.send(event).await?;
                }
            }
            Message::Close(_) => {
                debug!(connection_id = %id, "Client sent close frame");
                return Ok(());
            }
            Message::Ping(_) | Message::Pong(_) => {
                trace!(connection_id = %id, "Keepalive frame");
            }
            _ => {
                // Binary and raw frames are not part of the protocol
            }
        }
    }
}

/// Decode, stamp and validate one text frame
///
/// Returns the hub event to forward, or `None` when the frame is dropped.
/// Bad frames never close the connection.
pub(crate) fn route_frame(text: &str, id: ConnectionId, identity: &Identity) -> Option<HubEvent> {
    let mut envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(connection_id = %id, error = %e, "Dropping undecodable frame");
            return None;
        }
    };

    envelope.stamp_sender(identity);
    envelope.strip_foreign_fields();

    if let Err(e) = envelope.validate() {
        debug!(connection_id = %id, error = %e, "Dropping invalid envelope");
        return None;
    }

    match envelope.kind {
        EnvelopeKind::PrivateMessage => Some(HubEvent::PrivateMessage {
            origin: id,
            envelope,
        }),
        EnvelopeKind::LoadHistory => Some(HubEvent::LoadHistory {
            origin: id,
            envelope,
        }),
        kind => {
            debug!(connection_id = %id, kind = %kind, "Ignoring client envelope");
            None
        }
    }
}

/// Drain the outbound queue to the transport and send keepalive pings
async fn outbound_pump<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: Outbound,
    id: ConnectionId,
    ping_period: Duration,
    write_wait: Duration,
) -> Result<(), AppError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ticker = interval_at(Instant::now() + ping_period, ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = outbound.shutdown.changed() => {
                debug!(connection_id = %id, "Connection closed by hub");
                let _ = timeout(write_wait, sink.send(Message::Close(None))).await;
                return Ok(());
            }

            payload = outbound.queue.recv() => match payload {
                Some(text) => write_frame(&mut sink, Message::Text(text.into()), write_wait).await?,
                None => {
                    let _ = timeout(write_wait, sink.send(Message::Close(None))).await;
                    return Ok(());
                }
            },

            _ = ticker.tick() => {
                write_frame(&mut sink, Message::Ping(Default::default()), write_wait).await?;
            }
        }
    }
}

async fn write_frame<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    frame: Message,
    write_wait: Duration,
) -> Result<(), AppError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    timeout(write_wait, sink.send(frame))
        .await
        .map_err(|_| AppError::WriteTimeout)??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserId;

    fn alice() -> Identity {
        Identity::new(UserId(1), "alice")
    }

    #[test]
    fn test_enqueue_delivers_in_order() {
        let (handle, mut outbound) = ConnectionHandle::new(alice(), 4);

        assert_eq!(handle.enqueue("one".to_string()), Delivery::Delivered);
        assert_eq!(handle.enqueue("two".to_string()), Delivery::Delivered);

        assert_eq!(outbound.try_recv().as_deref(), Some("one"));
        assert_eq!(outbound.try_recv().as_deref(), Some("two"));
        assert!(outbound.try_recv().is_none());
    }

    #[test]
    fn test_enqueue_overflow_tears_down() {
        let (handle, outbound) = ConnectionHandle::new(alice(), 2);

        assert_eq!(handle.enqueue("a".to_string()), Delivery::Delivered);
        assert_eq!(handle.enqueue("b".to_string()), Delivery::Delivered);
        assert!(!outbound.is_shut_down());

        assert_eq!(handle.enqueue("c".to_string()), Delivery::Dropped);
        assert!(handle.is_closed());
        assert!(outbound.is_shut_down());

        // Once torn down, nothing more gets in
        assert_eq!(handle.enqueue("d".to_string()), Delivery::Dropped);
    }

    #[test]
    fn test_dropping_handle_shuts_down_outbound() {
        let (handle, outbound) = ConnectionHandle::new(alice(), 2);
        drop(handle);
        assert!(outbound.is_shut_down());
    }

    #[test]
    fn test_enqueue_after_receiver_dropped() {
        let (handle, outbound) = ConnectionHandle::new(alice(), 2);
        drop(outbound);
        assert_eq!(handle.enqueue("a".to_string()), Delivery::Dropped);
    }

    #[test]
    fn test_route_frame_stamps_identity() {
        let id = ConnectionId::new();
        let frame = r#"{"type":"private_message","content":"hi","to_user_id":2,"from_user_id":99,"nickname":"mallory"}"#;

        match route_frame(frame, id, &alice()) {
            Some(HubEvent::PrivateMessage { origin, envelope }) => {
                assert_eq!(origin, id);
                assert_eq!(envelope.from_user_id, Some(UserId(1)));
                assert_eq!(envelope.display_name.as_deref(), Some("alice"));
                assert_eq!(envelope.content.as_deref(), Some("hi"));
            }
            other => panic!("unexpected routing: {:?}", other),
        }
    }

    #[test]
    fn test_route_frame_strips_fields_foreign_to_kind() {
        let frame = r#"{"type":"private_message","content":"hi","to_user_id":2,
            "users":["admin"],"offset":9,
            "messages":[{"id":1,"sender_id":2,"receiver_id":1,"content":"forged",
                         "created_at":"2024-01-01T00:00:00Z","is_read":true}]}"#;

        match route_frame(frame, ConnectionId::new(), &alice()) {
            Some(HubEvent::PrivateMessage { envelope, .. }) => {
                assert_eq!(envelope.content.as_deref(), Some("hi"));
                assert!(envelope.users.is_none());
                assert!(envelope.offset.is_none());
                assert!(envelope.messages.is_none());
            }
            other => panic!("unexpected routing: {:?}", other),
        }

        let frame = r#"{"type":"load_history","to_user_id":2,"content":"x","users":["admin"]}"#;
        match route_frame(frame, ConnectionId::new(), &alice()) {
            Some(HubEvent::LoadHistory { envelope, .. }) => {
                assert!(envelope.content.is_none());
                assert!(envelope.users.is_none());
            }
            other => panic!("unexpected routing: {:?}", other),
        }
    }

    #[test]
    fn test_zero_capacity_queue_still_usable() {
        let (handle, mut outbound) = ConnectionHandle::new(alice(), 0);
        assert_eq!(handle.enqueue("a".to_string()), Delivery::Delivered);
        assert_eq!(outbound.try_recv().as_deref(), Some("a"));
    }

    #[test]
    fn test_route_frame_load_history() {
        let frame = r#"{"type":"load_history","to_user_id":2,"offset":50}"#;
        match route_frame(frame, ConnectionId::new(), &alice()) {
            Some(HubEvent::LoadHistory { envelope, .. }) => {
                assert_eq!(envelope.offset, Some(50));
                assert_eq!(envelope.from_user_id, Some(UserId(1)));
            }
            other => panic!("unexpected routing: {:?}", other),
        }
    }

    #[test]
    fn test_route_frame_drops_bad_frames() {
        let id = ConnectionId::new();
        assert!(route_frame("{{{", id, &alice()).is_none());
        assert!(route_frame(r#"{"type":"private_message","to_user_id":2}"#, id, &alice()).is_none());
        assert!(route_frame(r#"{"type":"private_message","content":"hi"}"#, id, &alice()).is_none());
        assert!(route_frame(r#"{"type":"join"}"#, id, &alice()).is_none());
    }
}
