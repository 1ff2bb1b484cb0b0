//! Integration tests for the Veil relay server
//!
//! These tests spin up a real server and connect clients to verify
//! authentication, frame handling and relaying work correctly.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use veil_server::broker::{ChatRequestInput, FinishApproval};
use veil_server::store::{NewUser, User};
use veil_server::{accept_connection, ServerState, Store};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    port: u16,
    state: Arc<ServerState>,
    store: Arc<Store>,
    handle: tokio::task::JoinHandle<()>,
}

/// Start a test server on a random available port
async fn start_test_server() -> TestServer {
    start_server_with_store(Arc::new(Store::open_in_memory().unwrap())).await
}

async fn start_server_with_store(store: Arc<Store>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let state = Arc::new(ServerState::with_store(store.clone()));

    let accept_state = state.clone();
    let handle = tokio::spawn(async move {
        while let Ok((stream, peer_addr)) = listener.accept().await {
            tokio::spawn(accept_connection(stream, peer_addr, accept_state.clone()));
        }
    });

    TestServer {
        port,
        state,
        store,
        handle,
    }
}

impl TestServer {
    fn user(&self, username: &str) -> (User, String) {
        let user = self
            .store
            .create_user(&NewUser {
                username: username.to_string(),
                name: format!("{} test", username),
                public_key: format!("pk-{}", username),
                wrapped_private_key: format!("wrapped-{}", username),
            })
            .unwrap();
        let token = self
            .store
            .create_session(&user.id, Duration::from_secs(3600))
            .unwrap();
        (user, token)
    }

    fn url(&self, token: &str) -> String {
        format!("ws://127.0.0.1:{}/?token={}", self.port, token)
    }

    async fn connect(&self, token: &str) -> Client {
        let (ws_stream, _) = connect_async(self.url(token))
            .await
            .expect("Failed to connect");
        ws_stream
    }

    /// Request from `sender`, approve as `recipient`; returns the chat id.
    fn chat(&self, sender: &User, recipient: &User) -> String {
        let req = self
            .state
            .broker
            .send_chat_request(
                &sender.id,
                &ChatRequestInput {
                    username: recipient.username.clone(),
                },
            )
            .unwrap();
        self.state
            .approve_chat_request(
                &recipient.id,
                &FinishApproval {
                    request_id: req.id,
                    encrypted_recipient_key: "recipient-copy".to_string(),
                    encrypted_sender_key: "sender-copy".to_string(),
                },
            )
            .unwrap()
            .chat_id
    }

    async fn wait_online(&self, user_id: &str, connections: usize) {
        timeout(Duration::from_secs(5), async {
            while self.state.registry.connection_count(user_id) != connections {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Timeout waiting for registry");
    }
}

async fn send(client: &mut Client, frame: Value) {
    client
        .send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();
}

async fn recv(client: &mut Client) -> Value {
    let msg = timeout(Duration::from_secs(5), client.next())
        .await
        .expect("Timeout waiting for frame")
        .expect("Stream closed")
        .expect("Read error");

    if let Message::Text(text) = msg {
        serde_json::from_str(&text).unwrap()
    } else {
        panic!("Expected text message");
    }
}

async fn assert_rejected(url: String) {
    match connect_async(url).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
        Err(e) => panic!("Expected 401, got {}", e),
        Ok(_) => panic!("Connection should have been rejected"),
    }
}

#[tokio::test]
async fn test_rejects_missing_unknown_and_expired_tokens() {
    let server = start_test_server().await;
    let (user, _) = server.user("alice");
    let expired = server.store.create_session(&user.id, Duration::ZERO).unwrap();

    assert_rejected(format!("ws://127.0.0.1:{}", server.port)).await;
    assert_rejected(server.url("")).await;
    assert_rejected(server.url("not-a-session")).await;
    assert_rejected(server.url(&expired)).await;

    assert!(server.state.registry.online_users().is_empty());
    server.handle.abort();
}

#[tokio::test]
async fn test_me_returns_identity() {
    let server = start_test_server().await;
    let (alice, token) = server.user("alice");
    let mut client = server.connect(&token).await;

    send(&mut client, json!({"type": "me", "data": null})).await;
    let reply = recv(&mut client).await;
    assert_eq!(reply["type"], "me");
    assert_eq!(reply["data"]["id"], alice.id.as_str());
    assert_eq!(reply["data"]["username"], "alice");
    assert_eq!(reply["data"]["name"], "alice test");

    server.handle.abort();
}

#[tokio::test]
async fn test_invalid_frame_keeps_connection_open() {
    let server = start_test_server().await;
    let (_, token) = server.user("alice");
    let mut client = server.connect(&token).await;

    client
        .send(Message::Text("{not json".to_string().into()))
        .await
        .unwrap();
    let reply = recv(&mut client).await;
    assert_eq!(reply, json!({"type": "error", "data": {"message": "Invalid message"}}));

    send(&mut client, json!({"type": "typing", "data": {}})).await;
    assert_eq!(recv(&mut client).await["type"], "error");

    // Still usable
    send(&mut client, json!({"type": "me"})).await;
    assert_eq!(recv(&mut client).await["type"], "me");

    server.handle.abort();
}

#[tokio::test]
async fn test_binary_frame_gets_error() {
    let server = start_test_server().await;
    let (_, token) = server.user("alice");
    let mut client = server.connect(&token).await;

    client.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    let reply = recv(&mut client).await;
    assert_eq!(reply, json!({"type": "error", "data": {"message": "Invalid message"}}));

    send(&mut client, json!({"type": "me"})).await;
    assert_eq!(recv(&mut client).await["type"], "me");

    server.handle.abort();
}

#[tokio::test]
async fn test_form_encoded_token_accepted() {
    let server = start_test_server().await;
    let (alice, token) = server.user("alice");

    // Hex tokens are unchanged by form encoding; an encoded spelling decodes to the same token
    let encoded: String = token.chars().map(|c| format!("%{:02X}", c as u32)).collect();
    let (mut client, _) = connect_async(server.url(&encoded)).await.unwrap();

    send(&mut client, json!({"type": "me"})).await;
    assert_eq!(recv(&mut client).await["data"]["id"], alice.id.as_str());

    server.handle.abort();
}

#[tokio::test]
async fn test_slow_database_does_not_stall_other_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("veil.db");
    let server = start_server_with_store(Arc::new(Store::open(&path).unwrap())).await;
    let (alice, alice_token) = server.user("alice");
    let (bob, _) = server.user("bob");
    let (carol, carol_token) = server.user("carol");
    let chat_id = server.chat(&alice, &bob);

    let mut alice_client = server.connect(&alice_token).await;
    let mut carol_client = server.connect(&carol_token).await;
    server.wait_online(&alice.id, 1).await;
    server.wait_online(&carol.id, 1).await;

    // Another writer holds the database lock for a while
    let (locked_tx, locked_rx) = std::sync::mpsc::channel();
    let writer_path = path.clone();
    let writer = std::thread::spawn(move || {
        let conn = rusqlite::Connection::open(writer_path).unwrap();
        conn.execute_batch("BEGIN IMMEDIATE;").unwrap();
        locked_tx.send(()).unwrap();
        std::thread::sleep(Duration::from_millis(600));
        conn.execute_batch("COMMIT;").unwrap();
    });
    locked_rx.recv().unwrap();

    send(
        &mut alice_client,
        json!({"type": "event", "data": {"chat": chat_id, "content": "AAAA"}}),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    send(&mut carol_client, json!({"type": "me"})).await;
    assert_eq!(recv(&mut carol_client).await["type"], "me");
    assert!(
        started.elapsed() < Duration::from_millis(300),
        "me reply waited on the database: {:?}",
        started.elapsed()
    );

    // The event goes through once the lock is released
    assert_eq!(recv(&mut alice_client).await["data"]["content"], "AAAA");
    writer.join().unwrap();

    server.handle.abort();
}

#[tokio::test]
async fn test_keep_alive_gets_no_reply() {
    let server = start_test_server().await;
    let (_, token) = server.user("alice");
    let mut client = server.connect(&token).await;

    send(&mut client, json!({"type": "keep-alive", "data": null})).await;
    let result = timeout(Duration::from_millis(300), client.next()).await;
    assert!(result.is_err(), "keep-alive should not be answered");

    server.handle.abort();
}

#[tokio::test]
async fn test_event_relayed_to_all_participants() {
    let server = start_test_server().await;
    let (alice, alice_token) = server.user("alice");
    let (bob, bob_token) = server.user("bob");
    let (_, carol_token) = server.user("carol");
    let chat_id = server.chat(&alice, &bob);

    let mut alice_client = server.connect(&alice_token).await;
    let mut bob_client = server.connect(&bob_token).await;
    let mut carol_client = server.connect(&carol_token).await;
    server.wait_online(&bob.id, 1).await;

    send(
        &mut alice_client,
        json!({"type": "event", "data": {"chat": chat_id, "content": "c2VhbGVk"}}),
    )
    .await;

    for client in [&mut bob_client, &mut alice_client] {
        let event = recv(client).await;
        assert_eq!(event["type"], "event");
        assert_eq!(event["data"]["from"], alice.id.as_str());
        assert_eq!(event["data"]["chat"], chat_id.as_str());
        assert_eq!(event["data"]["content"], "c2VhbGVk");
        assert!(event["data"]["timestamp"].as_i64().unwrap() > 0);
    }

    // Not a participant
    let result = timeout(Duration::from_millis(300), carol_client.next()).await;
    assert!(result.is_err(), "Carol should not receive the event");

    server.handle.abort();
}

#[tokio::test]
async fn test_event_reaches_every_connection_of_a_user() {
    let server = start_test_server().await;
    let (alice, alice_token) = server.user("alice");
    let (bob, bob_token) = server.user("bob");
    let chat_id = server.chat(&alice, &bob);

    let mut alice_client = server.connect(&alice_token).await;
    let mut bob_phone = server.connect(&bob_token).await;
    let mut bob_laptop = server.connect(&bob_token).await;
    server.wait_online(&bob.id, 2).await;

    send(
        &mut alice_client,
        json!({"type": "event", "data": {"chat": chat_id, "content": "AAAA"}}),
    )
    .await;

    assert_eq!(recv(&mut bob_phone).await["data"]["content"], "AAAA");
    assert_eq!(recv(&mut bob_laptop).await["data"]["content"], "AAAA");

    server.handle.abort();
}

#[tokio::test]
async fn test_approval_sends_overview_reload_to_requester() {
    let server = start_test_server().await;
    let (alice, alice_token) = server.user("alice");
    let (bob, _) = server.user("bob");

    let mut alice_client = server.connect(&alice_token).await;
    server.wait_online(&alice.id, 1).await;

    server.chat(&alice, &bob);

    assert_eq!(recv(&mut alice_client).await, json!({"type": "overview-reload"}));

    server.handle.abort();
}

#[tokio::test]
async fn test_disconnect_removes_connection() {
    let server = start_test_server().await;
    let (alice, token) = server.user("alice");

    let mut first = server.connect(&token).await;
    let _second = server.connect(&token).await;
    server.wait_online(&alice.id, 2).await;

    first.close(None).await.unwrap();
    server.wait_online(&alice.id, 1).await;
    assert!(server.state.registry.is_online(&alice.id));

    server.handle.abort();
}

#[tokio::test]
async fn test_channels_exchange_events_through_server() {
    use veil_client::websocket::{Channel, ChannelConfig, ChannelState, EventKind, ServerEvent};

    let server = start_test_server().await;
    let (alice, alice_token) = server.user("alice");
    let (bob, bob_token) = server.user("bob");
    let chat_id = server.chat(&alice, &bob);

    let config = ChannelConfig::default().with_server_url(format!("ws://127.0.0.1:{}", server.port));
    let alice_channel = Channel::new(config.clone());
    let bob_channel = Channel::new(config);

    let received = Arc::new(Mutex::new(Vec::new()));
    let me_count = Arc::new(AtomicUsize::new(0));
    {
        let received = received.clone();
        bob_channel.on(
            EventKind::Event,
            Arc::new(move |event: &ServerEvent| {
                if let ServerEvent::Event(chat_event) = event {
                    received.lock().unwrap().push(chat_event.clone());
                }
            }),
        );
        let me_count = me_count.clone();
        bob_channel.on(
            EventKind::Me,
            Arc::new(move |_: &ServerEvent| {
                me_count.fetch_add(1, Ordering::SeqCst);
            }),
        );
    }

    alice_channel.set_credential(alice_token);
    bob_channel.set_credential(bob_token);
    alice_channel.connect().unwrap();
    bob_channel.connect().unwrap();

    let mut alice_state = alice_channel.subscribe_state();
    timeout(
        Duration::from_secs(5),
        alice_state.wait_for(|s| *s == ChannelState::Connected),
    )
    .await
    .expect("Timeout waiting for alice")
    .unwrap();
    server.wait_online(&bob.id, 1).await;

    // Bob's identity confirmation is answered once per connection
    timeout(Duration::from_secs(5), async {
        while me_count.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Timeout waiting for me");

    alice_channel.send_event(&chat_id, "c2VhbGVk").unwrap();

    timeout(Duration::from_secs(5), async {
        while received.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Timeout waiting for relayed event");

    let event = received.lock().unwrap()[0].clone();
    assert_eq!(event.from, alice.id);
    assert_eq!(event.chat, chat_id);
    assert_eq!(event.content, "c2VhbGVk");
    assert_eq!(me_count.load(Ordering::SeqCst), 1);

    alice_channel.close();
    bob_channel.close();
    alice_channel.closed().await;
    bob_channel.closed().await;
    server.wait_online(&alice.id, 0).await;
    server.handle.abort();
}
