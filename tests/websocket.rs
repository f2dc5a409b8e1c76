//! End-to-end tests: real TCP listener, real WebSocket clients.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use presence_hub::{
    serve, ConnectionSettings, EmptyHistory, Envelope, EnvelopeKind, Hub, HubHandle,
    HubSettings, StaticSessions, UserId,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(3);

/// Start a hub and server on a random port; returns (ws base url, hub handle)
async fn start_server(settings: ConnectionSettings) -> (String, HubHandle) {
    let sessions = StaticSessions::new(vec![
        "alice-laptop:1:alice".parse().unwrap(),
        "alice-phone:1:alice".parse().unwrap(),
        "bob:2:bob".parse().unwrap(),
        "carol:3:carol".parse().unwrap(),
    ]);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (hub, handle) = Hub::new(Arc::new(EmptyHistory), HubSettings::default());
    tokio::spawn(hub.run());
    tokio::spawn(serve(listener, handle.clone(), Arc::new(sessions), settings));

    (format!("ws://{}", addr), handle)
}

/// Connect and wait for the online_users snapshot that follows registration
async fn connect(base: &str, token: &str) -> (Client, Envelope) {
    let (mut ws, _) = connect_async(format!("{}/ws?token={}", base, token))
        .await
        .expect("handshake failed");
    let snapshot = next_envelope(&mut ws).await;
    assert_eq!(snapshot.kind, EnvelopeKind::OnlineUsers);
    (ws, snapshot)
}

async fn next_envelope(ws: &mut Client) -> Envelope {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return Envelope::decode(text.as_str()).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {:?}", other),
            }
        }
    })
    .await
    .expect("timed out waiting for envelope")
}

/// Assert nothing arrives for a short while
async fn assert_quiet(ws: &mut Client) {
    let result = tokio::time::timeout(Duration::from_millis(200), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text.to_string(),
                Some(Ok(_)) => continue,
                _ => return String::new(),
            }
        }
    })
    .await;
    if let Ok(text) = result {
        panic!("unexpected frame: {}", text);
    }
}

async fn send_json(ws: &mut Client, json: &str) {
    ws.send(Message::Text(json.to_string().into())).await.unwrap();
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}

#[tokio::test]
async fn test_unknown_token_rejected() {
    let (base, handle) = start_server(ConnectionSettings::default()).await;

    assert!(connect_async(format!("{}/ws?token=nope", base)).await.is_err());
    assert!(connect_async(format!("{}/ws", base)).await.is_err());
    assert!(handle.presence().online_user_ids().is_empty());
}

#[tokio::test]
async fn test_presence_follows_connections() {
    let (base, handle) = start_server(ConnectionSettings::default()).await;
    let presence = handle.presence().clone();

    let (mut alice, snapshot) = connect(&base, "alice-laptop").await;
    assert_eq!(snapshot.users, Some(vec!["alice".to_string()]));
    assert!(presence.is_online(UserId(1)));

    let (mut bob, snapshot) = connect(&base, "bob").await;
    assert_eq!(
        snapshot.users,
        Some(vec!["alice".to_string(), "bob".to_string()])
    );

    let online = next_envelope(&mut alice).await;
    assert_eq!(online.kind, EnvelopeKind::UserOnline);
    assert_eq!(online.from_user_id, Some(UserId(2)));

    // A second device does not announce alice again
    let (_alice_phone, _) = connect(&base, "alice-phone").await;
    assert_quiet(&mut bob).await;
    assert_eq!(presence.connection_count(UserId(1)), 2);

    bob.close(None).await.unwrap();
    let offline = next_envelope(&mut alice).await;
    assert_eq!(offline.kind, EnvelopeKind::UserOffline);
    assert_eq!(offline.display_name.as_deref(), Some("bob"));
    wait_for(|| !presence.is_online(UserId(2))).await;
}

#[tokio::test]
async fn test_private_message_delivery_and_echo() {
    let (base, _handle) = start_server(ConnectionSettings::default()).await;

    let (mut laptop, _) = connect(&base, "alice-laptop").await;
    let (mut phone, _) = connect(&base, "alice-phone").await;
    let (mut bob, _) = connect(&base, "bob").await;
    assert_eq!(next_envelope(&mut laptop).await.kind, EnvelopeKind::UserOnline);
    assert_eq!(next_envelope(&mut phone).await.kind, EnvelopeKind::UserOnline);

    // Sender fields on the wire are replaced by the session identity
    send_json(
        &mut laptop,
        r#"{"type":"private_message","content":"hi bob","to_user_id":2,"from_user_id":3,"nickname":"carol","message_id":7}"#,
    )
    .await;

    let received = next_envelope(&mut bob).await;
    assert_eq!(received.kind, EnvelopeKind::PrivateMessage);
    assert_eq!(received.content.as_deref(), Some("hi bob"));
    assert_eq!(received.from_user_id, Some(UserId(1)));
    assert_eq!(received.display_name.as_deref(), Some("alice"));
    assert_quiet(&mut bob).await;

    let receipt = next_envelope(&mut laptop).await;
    assert_eq!(receipt.kind, EnvelopeKind::MessageDelivered);
    assert_eq!(receipt.message_id, Some(7));
    assert_quiet(&mut laptop).await;

    assert_eq!(next_envelope(&mut phone).await.kind, EnvelopeKind::MessageDelivered);
    let echo = next_envelope(&mut phone).await;
    assert_eq!(echo.kind, EnvelopeKind::MessageEcho);
    assert_eq!(echo.content.as_deref(), Some("hi bob"));
}

#[tokio::test]
async fn test_message_to_offline_user_fails() {
    let (base, _handle) = start_server(ConnectionSettings::default()).await;
    let (mut alice, _) = connect(&base, "alice-laptop").await;

    send_json(
        &mut alice,
        r#"{"type":"private_message","content":"hello?","to_user_id":3}"#,
    )
    .await;

    let failed = next_envelope(&mut alice).await;
    assert_eq!(failed.kind, EnvelopeKind::MessageFailed);
    assert_eq!(failed.to_user_id, Some(UserId(3)));
    assert_quiet(&mut alice).await;
}

#[tokio::test]
async fn test_bad_frames_keep_connection_open() {
    let (base, handle) = start_server(ConnectionSettings::default()).await;
    let (mut alice, _) = connect(&base, "alice-laptop").await;

    send_json(&mut alice, "this is not json").await;
    send_json(&mut alice, r#"{"type":"private_message","to_user_id":2}"#).await;
    send_json(&mut alice, r#"{"type":"load_history"}"#).await;
    send_json(&mut alice, r#"{"type":"join"}"#).await;

    send_json(
        &mut alice,
        r#"{"type":"private_message","content":"still here","to_user_id":2}"#,
    )
    .await;
    assert_eq!(next_envelope(&mut alice).await.kind, EnvelopeKind::MessageFailed);
    assert!(handle.presence().is_online(UserId(1)));
}

#[tokio::test]
async fn test_history_request_answered() {
    let (base, _handle) = start_server(ConnectionSettings::default()).await;
    let (mut alice, _) = connect(&base, "alice-laptop").await;

    send_json(&mut alice, r#"{"type":"load_history","to_user_id":2,"offset":0}"#).await;

    let history = next_envelope(&mut alice).await;
    assert_eq!(history.kind, EnvelopeKind::HistoryLoaded);
    assert_eq!(history.to_user_id, Some(UserId(2)));
    assert_eq!(history.messages, Some(Vec::new()));
}

#[tokio::test]
async fn test_silent_client_hits_liveness_deadline() {
    let settings = ConnectionSettings {
        ping_period: Duration::from_millis(100),
        pong_wait: Duration::from_millis(300),
        ..ConnectionSettings::default()
    };
    let (base, handle) = start_server(settings).await;
    let presence = handle.presence().clone();

    let (mut bob, _) = connect(&base, "bob").await;
    // Never polled again, so pings go unanswered
    let (_carol, _) = connect(&base, "carol").await;
    assert_eq!(next_envelope(&mut bob).await.kind, EnvelopeKind::UserOnline);
    assert!(presence.is_online(UserId(3)));

    // bob keeps reading, which answers pings and keeps bob alive
    let offline = next_envelope(&mut bob).await;
    assert_eq!(offline.kind, EnvelopeKind::UserOffline);
    assert_eq!(offline.from_user_id, Some(UserId(3)));
    assert!(!presence.is_online(UserId(3)));
    assert!(presence.is_online(UserId(2)));
}
