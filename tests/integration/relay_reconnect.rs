// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::needless_continue,
    clippy::match_same_arms,
    clippy::doc_markdown,
    clippy::manual_let_else,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Reconnect behaviour of the chat transport against a real relay.
//!
//! ## Disconnect simulation
//!
//! Aborting the relay's `JoinHandle` leaves established sockets running on
//! their own tasks, so the client sits behind a TCP proxy instead. Killing
//! the proxy aborts every forwarding task, which drops both streams and the
//! client sees the connection die. A new proxy on the same port lets the
//! next retry succeed.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pairchat::config::ReconnectConfig;
use pairchat::net::{self, ChatConfig, ChatHandle, ChatUpdate};
use pairchat::transport::ConnectionStatus;
use pairchat::user::LocalUser;
use pairchat_relay::relay::{self, RelayState};
use tokio::sync::mpsc;

// =============================================================================
// TCP Proxy helper
// =============================================================================

/// Forwards a client-facing port to the relay. `kill()` severs every
/// proxied connection.
struct TcpProxy {
    client_addr: String,
    accept_handle: tokio::task::JoinHandle<()>,
    conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl TcpProxy {
    async fn new(proxy_port: u16, backend_addr: &str) -> Self {
        let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{proxy_port}"))
            .await
            .unwrap_or_else(|e| panic!("proxy: failed to bind to port {proxy_port}: {e}"));
        let client_addr = listener.local_addr().unwrap().to_string();
        let backend = backend_addr.to_string();
        let conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let tracked = Arc::clone(&conn_handles);

        let accept_handle = tokio::spawn(async move {
            while let Ok((mut client_stream, _)) = listener.accept().await {
                let backend = backend.clone();
                let conn_handle = tokio::spawn(async move {
                    let Ok(mut backend_stream) = tokio::net::TcpStream::connect(&backend).await
                    else {
                        return;
                    };
                    // No sub-tasks, so aborting this one drops both streams.
                    let _ = tokio::io::copy_bidirectional(&mut client_stream, &mut backend_stream)
                        .await;
                });
                tracked.lock().push(conn_handle);
            }
        });

        Self {
            client_addr,
            accept_handle,
            conn_handles,
        }
    }

    fn kill(self) {
        self.accept_handle.abort();
        for h in self.conn_handles.lock().iter() {
            h.abort();
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

async fn find_free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind to port 0");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

async fn start_relay() -> (String, Arc<RelayState>) {
    let state = Arc::new(RelayState::new());
    let (addr, _handle) = relay::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start relay server");
    (addr.to_string(), state)
}

/// Chat config with fast retries. History always goes straight to the relay.
fn chat_config(ws_addr: &str, relay_addr: &str, local: LocalUser, target: &str) -> ChatConfig {
    ChatConfig {
        server_url: format!("ws://{ws_addr}/ws"),
        api_base: format!("http://{relay_addr}/"),
        session_cookie: None,
        local,
        target: target.into(),
        connect_timeout: Duration::from_secs(2),
        history_timeout: Duration::from_secs(5),
        typing_quiet_period: Duration::from_millis(200),
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            max_attempts: 20,
            message_queue_cap: 100,
            join_timeout: Duration::from_secs(2),
        },
        channel_capacity: 128,
    }
}

async fn wait_for<F>(
    rx: &mut mpsc::Receiver<ChatUpdate>,
    timeout: Duration,
    description: &str,
    pred: F,
) -> ChatUpdate
where
    F: Fn(&ChatUpdate) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(update)) if pred(&update) => return update,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("channel closed while waiting for {description}"),
            Err(_) => panic!("timeout waiting for {description}"),
        }
    }
}

async fn wait_for_connected(rx: &mut mpsc::Receiver<ChatUpdate>) {
    wait_for(rx, Duration::from_secs(15), "Connected", |u| {
        *u == ChatUpdate::Status(ConnectionStatus::Connected)
    })
    .await;
}

async fn wait_for_reconnecting(rx: &mut mpsc::Receiver<ChatUpdate>) -> u32 {
    match wait_for(rx, Duration::from_secs(10), "Reconnecting", |u| {
        matches!(u, ChatUpdate::Status(ConnectionStatus::Reconnecting { .. }))
    })
    .await
    {
        ChatUpdate::Status(ConnectionStatus::Reconnecting { attempt }) => attempt,
        other => panic!("expected Reconnecting, got: {other:?}"),
    }
}

async fn wait_for_text(rx: &mut mpsc::Receiver<ChatUpdate>, text: &str) {
    wait_for(rx, Duration::from_secs(15), text, |u| {
        matches!(u, ChatUpdate::MessageAppended { message, .. } if message.text == text)
    })
    .await;
}

/// Open a chat and wait until it is joined and history has settled, so
/// later sends land in the log instead of the history buffer.
async fn open_connected(config: ChatConfig) -> (ChatHandle, mpsc::Receiver<ChatUpdate>) {
    let (handle, mut rx) = net::open_chat(config).expect("open_chat failed");
    let (mut connected, mut history) = (false, false);
    while !(connected && history) {
        match wait_for(&mut rx, Duration::from_secs(15), "ready", |u| {
            matches!(
                u,
                ChatUpdate::Status(ConnectionStatus::Connected)
                    | ChatUpdate::HistoryLoaded { .. }
                    | ChatUpdate::HistoryFailed
            )
        })
        .await
        {
            ChatUpdate::Status(_) => connected = true,
            _ => history = true,
        }
    }
    (handle, rx)
}

// =============================================================================
// Tests
// =============================================================================

/// After the connection is severed the transport retries, rejoins the room,
/// and messaging resumes in both directions.
#[tokio::test]
async fn rejoins_room_after_connection_loss() {
    let (relay_addr, _state) = start_relay().await;
    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, &relay_addr).await;
    let proxy_addr = proxy.client_addr.clone();

    let (alice, mut alice_rx) = open_connected(chat_config(
        &proxy_addr,
        &relay_addr,
        LocalUser::new("alice", "Alice"),
        "bob",
    ))
    .await;
    let (bob, mut bob_rx) = open_connected(chat_config(
        &relay_addr,
        &relay_addr,
        LocalUser::new("bob", "Bob"),
        "alice",
    ))
    .await;

    proxy.kill();
    assert_eq!(wait_for_reconnecting(&mut alice_rx).await, 1);

    let _proxy2 = TcpProxy::new(proxy_port, &relay_addr).await;
    wait_for_connected(&mut alice_rx).await;

    alice.send("back online").await.unwrap();
    wait_for_text(&mut bob_rx, "back online").await;

    bob.send("welcome back").await.unwrap();
    wait_for_text(&mut alice_rx, "welcome back").await;
}

/// Messages submitted while disconnected are shown immediately as pending,
/// then delivered and confirmed once the room is rejoined.
#[tokio::test]
async fn messages_sent_while_disconnected_are_delivered_after_rejoin() {
    let (relay_addr, _state) = start_relay().await;
    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, &relay_addr).await;
    let proxy_addr = proxy.client_addr.clone();

    let (alice, mut alice_rx) = open_connected(chat_config(
        &proxy_addr,
        &relay_addr,
        LocalUser::new("alice", "Alice"),
        "bob",
    ))
    .await;
    let (_bob, mut bob_rx) = open_connected(chat_config(
        &relay_addr,
        &relay_addr,
        LocalUser::new("bob", "Bob"),
        "alice",
    ))
    .await;

    proxy.kill();
    wait_for_reconnecting(&mut alice_rx).await;

    for text in ["queued one", "queued two"] {
        alice.send(text).await.unwrap();
    }
    match wait_for(&mut alice_rx, Duration::from_secs(5), "pending echo", |u| {
        matches!(u, ChatUpdate::MessageAppended { .. })
    })
    .await
    {
        ChatUpdate::MessageAppended { message, .. } => {
            assert_eq!(message.text, "queued one");
            assert!(message.pending);
        }
        other => panic!("expected MessageAppended, got: {other:?}"),
    }

    let _proxy2 = TcpProxy::new(proxy_port, &relay_addr).await;

    wait_for_text(&mut bob_rx, "queued one").await;
    wait_for_text(&mut bob_rx, "queued two").await;

    wait_for(&mut alice_rx, Duration::from_secs(15), "confirmation", |u| {
        *u == ChatUpdate::MessageConfirmed { index: 1 }
    })
    .await;
    let snapshot = alice.snapshot();
    assert_eq!(snapshot.messages.len(), 2);
    assert!(snapshot.messages.iter().all(|m| !m.pending));
}

/// A server-initiated close is treated like any other loss.
#[tokio::test]
async fn reconnects_after_server_closes_connections() {
    let (relay_addr, state) = start_relay().await;
    let (_alice, mut alice_rx) = open_connected(chat_config(
        &relay_addr,
        &relay_addr,
        LocalUser::new("alice", "Alice"),
        "bob",
    ))
    .await;

    state.close_all_connections().await;
    wait_for_reconnecting(&mut alice_rx).await;
    wait_for_connected(&mut alice_rx).await;
}

/// With the relay gone for good the transport stops after the retry budget.
#[tokio::test]
async fn gives_up_after_retry_budget() {
    let (relay_addr, _state) = start_relay().await;
    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, &relay_addr).await;

    let mut config = chat_config(
        &proxy.client_addr,
        &relay_addr,
        LocalUser::new("alice", "Alice"),
        "bob",
    );
    config.reconnect.max_attempts = 2;
    let (mut alice, mut alice_rx) = open_connected(config).await;

    proxy.kill();
    wait_for(&mut alice_rx, Duration::from_secs(20), "Disconnected", |u| {
        *u == ChatUpdate::Status(ConnectionStatus::Disconnected)
    })
    .await;
    assert_eq!(alice.snapshot().status, ConnectionStatus::Disconnected);

    alice.close().await;
}

/// Closing the chat while a retry is pending stops promptly.
#[tokio::test]
async fn close_during_reconnect_is_prompt() {
    let (relay_addr, _state) = start_relay().await;
    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, &relay_addr).await;

    let (mut alice, mut alice_rx) = open_connected(chat_config(
        &proxy.client_addr,
        &relay_addr,
        LocalUser::new("alice", "Alice"),
        "bob",
    ))
    .await;

    proxy.kill();
    wait_for_reconnecting(&mut alice_rx).await;

    tokio::time::timeout(Duration::from_secs(5), alice.close())
        .await
        .expect("close should not wait for the retry loop");
    wait_for(&mut alice_rx, Duration::from_secs(5), "Closed", |u| {
        *u == ChatUpdate::Closed
    })
    .await;
    assert_eq!(alice.snapshot().status, ConnectionStatus::Disconnected);
}
