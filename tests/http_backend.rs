// tests/http_backend.rs
//
// End-to-end checks against a local axum backend speaking the same REST,
// SSE, STOMP (plain and SockJS) and raw WebSocket protocols as the real one.

use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::{self, StreamExt};
use serde_json::json;
use tokio::time::Duration;

use maville_notify::transport::stomp::frame::{StompDecoder, StompFrame};
use maville_notify::transport::stomp::sockjs;
use maville_notify::{
    // ---
    create_sse_transport,
    create_stomp_transport,
    create_websocket_transport,
    ConnectionManager,
    ConnectionStatus,
    NotificationEnvelope,
    NotificationsApi,
    NotifyConfig,
    NotifyError,
    Topic,
    UserIdentity,
    WebSocketProtocol,
    BROADCAST_TOPIC,
};

#[derive(Clone, Default)]
struct Backend {
    stomp_frames: Arc<Mutex<Vec<StompFrame>>>,
    raw_received: Arc<Mutex<Vec<String>>>,
    stream_users: Arc<Mutex<Vec<String>>>,
}

impl Backend {
    fn commands(&self) -> Vec<String> {
        self.stomp_frames
            .lock()
            .unwrap()
            .iter()
            .map(|f| f.command.clone())
            .collect()
    }

    fn frames(&self, command: &str) -> Vec<StompFrame> {
        self.stomp_frames
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.command == command)
            .cloned()
            .collect()
    }
}

fn routes(backend: Backend) -> Router {
    Router::new()
        .route("/api/notifications/unread/:user", get(unread))
        .route(
            "/api/residents/:email/notifications",
            get(resident_notifications).delete(clear_resident),
        )
        .route("/api/prestataires/:neq/notifications", get(unknown_prestataire))
        .route("/api/notifications/stream/:user", get(event_stream))
        .route("/stomp", get(stomp_plain))
        .route("/ws/:server/:session/websocket", get(stomp_sockjs))
        .route("/raw", get(raw_socket))
        .with_state(backend)
}

async fn spawn_backend() -> (String, String, Backend) {
    // ---
    let backend = Backend::default();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let app = routes(backend.clone());
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    (format!("http://{addr}"), format!("ws://{addr}"), backend)
}

//
// REST handlers
//

async fn unread(Path(user): Path<String>) -> Json<serde_json::Value> {
    Json(json!([{
        "id": 41,
        "message": format!("Bonjour {user}"),
        "typeChangement": "STATUT",
        "dateCreation": "2025-02-11T09:30:00",
        "lu": false,
        "projetId": 8
    }]))
}

async fn resident_notifications(Path(email): Path<String>) -> Json<serde_json::Value> {
    Json(json!({
        "notifications": [{"id": "n-1", "message": "Travaux terminés", "type": "FIN", "date": "2025-02-12", "lu": false, "destinataire": email}],
        "total": 1,
        "non_lues": 1
    }))
}

async fn clear_resident() -> Json<serde_json::Value> {
    Json(json!({"success": true, "message": "Notifications supprimées", "count": 1}))
}

async fn unknown_prestataire() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"message": "Prestataire introuvable"}))).into_response()
}

async fn event_stream(
    Path(user): Path<String>,
    State(backend): State<Backend>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    // ---
    backend.stream_users.lock().unwrap().push(user);

    let events = vec![
        Ok(Event::default().event("connected").data(r#"{"status":"connected"}"#)),
        Ok(Event::default().comment("keep-alive")),
        Ok(Event::default()
            .event("notification")
            .data(r#"{"payload":{"message":"Votre requête est acceptée"},"timestamp":"2025-03-01T10:00:00.000Z"}"#)),
        Ok(Event::default().data(r#"{"hello":"world"}"#)),
        Ok(Event::default().data(r#"{"type":"success","payload":{"message":"Profil mis à jour"}}"#)),
    ];

    Sse::new(stream::iter(events).chain(stream::pending()))
}

//
// WebSocket handlers
//

async fn stomp_plain(ws: WebSocketUpgrade, State(backend): State<Backend>) -> Response {
    ws.on_upgrade(move |socket| stomp_session(socket, false, backend))
}

async fn stomp_sockjs(ws: WebSocketUpgrade, State(backend): State<Backend>) -> Response {
    ws.on_upgrade(move |socket| stomp_session(socket, true, backend))
}

async fn stomp_session(mut socket: WebSocket, use_sockjs: bool, backend: Backend) {
    // ---
    if use_sockjs && socket.send(Message::Text("o".into())).await.is_err() {
        return;
    }

    let mut decoder = StompDecoder::new();

    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let chunks: Vec<String> = if use_sockjs {
            serde_json::from_str(&text).unwrap_or_default()
        } else {
            vec![text]
        };

        for chunk in chunks {
            for frame in decoder.push(&chunk).unwrap_or_default() {
                backend.stomp_frames.lock().unwrap().push(frame.clone());

                let reply = match frame.command.as_str() {
                    "CONNECT" => Some(
                        StompFrame::new("CONNECTED")
                            .header("version", "1.2")
                            .header("heart-beat", "0,0")
                            .header("server", "mock-broker/1.0"),
                    ),
                    "SUBSCRIBE" if frame.get("destination") == Some(BROADCAST_TOPIC) => Some(
                        StompFrame::new("MESSAGE")
                            .header("destination", BROADCAST_TOPIC)
                            .header("subscription", frame.get("id").unwrap_or_default())
                            .header("message-id", "1")
                            .header("content-type", "application/json")
                            .with_body(r#"{"message":"Collecte reportée","projetId":3}"#),
                    ),
                    "DISCONNECT" => return,
                    _ => None,
                };

                if let Some(reply) = reply {
                    let encoded = reply.encode();
                    let text = match use_sockjs {
                        true => format!("a{}", sockjs::encode(&[encoded.as_str()])),
                        false => encoded,
                    };
                    if socket.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn raw_socket(ws: WebSocketUpgrade, State(backend): State<Backend>) -> Response {
    ws.on_upgrade(move |socket| raw_session(socket, backend))
}

async fn raw_session(mut socket: WebSocket, backend: Backend) {
    // ---
    let welcome = json!({
        "type": "notification",
        "payload": {"message": "Bienvenue"},
        "timestamp": "2025-01-01T00:00:00.000Z"
    });

    for text in ["not an envelope".to_string(), welcome.to_string()] {
        if socket.send(Message::Text(text)).await.is_err() {
            return;
        }
    }

    while let Some(Ok(Message::Text(text))) = socket.recv().await {
        backend.raw_received.lock().unwrap().push(text);
    }
}

//
// Helpers
//

type Inbox = Arc<Mutex<Vec<NotificationEnvelope>>>;

fn listen(manager: &ConnectionManager, topic: impl Into<Topic>) -> (Inbox, maville_notify::Subscription) {
    let inbox: Inbox = Arc::default();
    let sink = inbox.clone();
    let sub = manager.subscribe(topic, move |env: &NotificationEnvelope| sink.lock().unwrap().push(env.clone()));
    (inbox, sub)
}

async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

//
// Tests
//

#[tokio::test]
async fn rest_client_maps_records_and_errors() {
    // ---
    let (http, _ws, _backend) = spawn_backend().await;
    let client = NotificationsApi::http_client(Duration::from_secs(2)).unwrap();
    let api = NotificationsApi::new(client, &format!("{http}/api")).unwrap();

    let unread = api.fetch_unread("marie@test.com").await.unwrap();
    assert_eq!(unread.len(), 1);
    let payload = unread[0].to_payload();
    assert_eq!(payload.id, "41");
    assert_eq!(payload.message.as_deref(), Some("Bonjour marie@test.com"));
    assert_eq!(payload.kind, "STATUT");
    assert_eq!(payload.projet_id, Some(8));

    let resident = UserIdentity::resident("marie@test.com");
    let list = api.list(&resident).await.unwrap();
    assert_eq!(list.total, 1);
    assert_eq!(list.non_lues, Some(1));
    assert_eq!(list.notifications[0].destinataire.as_deref(), Some("marie@test.com"));

    let cleared = api.clear_all(&resident).await.unwrap();
    assert!(cleared.success);
    assert_eq!(cleared.count, 1);

    match api.list(&UserIdentity::prestataire("1234567890")).await {
        Err(NotifyError::Api { status, message }) => {
            assert_eq!(status, 404);
            assert_eq!(message, "Prestataire introuvable");
        }
        other => panic!("expected an API error, got {other:?}"),
    }
}

#[tokio::test]
async fn sse_stream_delivers_typed_envelopes() {
    // ---
    // Arrange
    // ---
    let (http, _ws, backend) = spawn_backend().await;
    let config = NotifyConfig::new(format!("{http}/api"));
    let client = NotificationsApi::http_client(config.connect_timeout).unwrap();
    let sse = create_sse_transport(&config, client, &UserIdentity::resident("marie@test.com")).unwrap();
    let (inbox, _sub) = listen(&sse, Topic::wildcard());

    // ---
    // Act
    // ---
    sse.connect();

    // ---
    // Assert
    // ---
    assert!(eventually(|| inbox.lock().unwrap().len() == 2).await);
    assert_eq!(sse.status(), ConnectionStatus::Connected);
    assert_eq!(*backend.stream_users.lock().unwrap(), vec!["marie@test.com".to_string()]);

    let received = inbox.lock().unwrap().clone();
    assert_eq!(received[0].kind(), "notification");
    assert_eq!(received[0].payload_str("message"), Some("Votre requête est acceptée"));
    assert_eq!(received[0].timestamp(), "2025-03-01T10:00:00.000Z");
    assert_eq!(received[1].kind(), "success");

    sse.disconnect();
    assert_eq!(sse.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn stomp_handshake_subscribe_send_and_disconnect() {
    // ---
    // Arrange
    // ---
    let (http, ws, backend) = spawn_backend().await;
    let config = NotifyConfig::new(format!("{http}/api"))
        .with_ws_url(format!("{ws}/stomp"))
        .with_sockjs(false);
    let stomp = create_stomp_transport(&config).unwrap();

    let mut inboxes = Vec::new();
    for topic in UserIdentity::Stpm.destinations() {
        inboxes.push(listen(&stomp, topic));
    }

    // ---
    // Act
    // ---
    stomp.connect();
    assert!(eventually(|| inboxes[0].0.lock().unwrap().len() == 1).await);

    stomp.send("/app/notifications", &json!({"message": "ping"}));
    assert!(eventually(|| !backend.frames("SEND").is_empty()).await);

    stomp.disconnect();

    // ---
    // Assert
    // ---
    assert!(eventually(|| backend.commands().last().map(String::as_str) == Some("DISCONNECT")).await);

    let connect = &backend.frames("CONNECT")[0];
    assert_eq!(connect.get("accept-version"), Some("1.2"));
    assert!(connect.get("host").is_some_and(|h| h.starts_with("127.0.0.1:")));
    assert!(connect.get("heart-beat").is_some());

    let subscribes = backend.frames("SUBSCRIBE");
    let destinations: Vec<&str> = subscribes.iter().filter_map(|f| f.get("destination")).collect();
    assert_eq!(destinations.len(), 2);
    assert!(destinations.contains(&BROADCAST_TOPIC));
    assert!(destinations.contains(&"/topic/notifications/stpm"));
    assert!(subscribes.iter().all(|f| f.get("id").is_some_and(|id| id.starts_with("sub-"))));

    let send = &backend.frames("SEND")[0];
    assert_eq!(send.get("destination"), Some("/app/notifications"));
    assert_eq!(send.get("content-type"), Some("application/json"));
    assert_eq!(send.body, r#"{"message":"ping"}"#);

    let envelope = inboxes[0].0.lock().unwrap()[0].clone();
    assert_eq!(envelope.kind(), "notification");
    assert_eq!(envelope.payload_str("message"), Some("Collecte reportée"));
    assert!(inboxes[1].0.lock().unwrap().is_empty());
}

#[tokio::test]
async fn stomp_over_sockjs_receives_messages() {
    // ---
    let (http, _ws, backend) = spawn_backend().await;
    let config = NotifyConfig::new(format!("{http}/api"))
        .with_ws_url(format!("{http}/ws"))
        .with_sockjs(true);
    let stomp = create_websocket_transport(&config).unwrap();
    let (inbox, _sub) = listen(&stomp, BROADCAST_TOPIC);

    stomp.connect();

    assert!(eventually(|| inbox.lock().unwrap().len() == 1).await);
    assert_eq!(stomp.status(), ConnectionStatus::Connected);
    assert_eq!(backend.commands()[..2], ["CONNECT".to_string(), "SUBSCRIBE".to_string()]);
    assert_eq!(inbox.lock().unwrap()[0].payload_field("projetId"), Some(&json!(3)));

    stomp.disconnect();
}

#[tokio::test]
async fn raw_websocket_skips_malformed_frames() {
    // ---
    let (http, ws, backend) = spawn_backend().await;
    let config = NotifyConfig::new(format!("{http}/api"))
        .with_ws_url(format!("{ws}/raw"))
        .with_ws_protocol(WebSocketProtocol::Raw);
    let raw = create_websocket_transport(&config).unwrap();
    let (inbox, _sub) = listen(&raw, Topic::wildcard());

    raw.connect();
    assert!(eventually(|| inbox.lock().unwrap().len() == 1).await);
    assert_eq!(inbox.lock().unwrap()[0].payload_str("message"), Some("Bienvenue"));

    raw.send("ignored-destination", &json!({"type": "success", "payload": {}}));
    assert!(eventually(|| backend.raw_received.lock().unwrap().len() == 1).await);
    assert_eq!(
        backend.raw_received.lock().unwrap()[0],
        r#"{"payload":{},"type":"success"}"#
    );

    raw.disconnect();
}

#[tokio::test]
async fn unreachable_backend_ends_in_error() {
    // ---
    let config = NotifyConfig::new("http://127.0.0.1:9/api")
        .with_ws_url("ws://127.0.0.1:9/stomp")
        .with_sockjs(false)
        .with_reconnect(maville_notify::ReconnectPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            jitter: false,
        });
    let stomp = create_stomp_transport(&config).unwrap();

    stomp.connect();
    assert!(eventually(|| stomp.status() == ConnectionStatus::Error).await);
}
