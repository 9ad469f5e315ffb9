// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::needless_continue,
    clippy::match_same_arms,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! End-to-end chat sessions against an in-process relay.
//!
//! Both the WebSocket and the history endpoint are served by
//! `pairchat_relay`, so these tests cover the whole path: join handshake,
//! history over HTTP, live delivery, and echo reconciliation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use pairchat::config::ReconnectConfig;
use pairchat::net::{self, ChatConfig, ChatHandle, ChatUpdate};
use pairchat::transport::ConnectionStatus;
use pairchat::user::LocalUser;
use pairchat_proto::room::RoomId;
use pairchat_relay::relay::{self, RelayState};
use pairchat_relay::store::StoredMessage;
use tokio::sync::mpsc;

async fn start_relay() -> (String, Arc<RelayState>) {
    let state = Arc::new(RelayState::new());
    let (addr, _handle) = relay::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start relay server");
    (addr.to_string(), state)
}

fn chat_config(relay_addr: &str, local: LocalUser, target: &str) -> ChatConfig {
    ChatConfig {
        server_url: format!("ws://{relay_addr}/ws"),
        api_base: format!("http://{relay_addr}/"),
        session_cookie: None,
        local,
        target: target.into(),
        connect_timeout: Duration::from_secs(5),
        history_timeout: Duration::from_secs(5),
        typing_quiet_period: Duration::from_millis(200),
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            max_attempts: 5,
            message_queue_cap: 100,
            join_timeout: Duration::from_secs(5),
        },
        channel_capacity: 64,
    }
}

fn alice() -> LocalUser {
    LocalUser::new("alice", "Alice").with_last_name("Liddell")
}

fn bob() -> LocalUser {
    LocalUser::new("bob", "Bob")
}

/// Wait for an update matching `pred`, skipping everything else.
async fn wait_for<F>(rx: &mut mpsc::Receiver<ChatUpdate>, description: &str, pred: F) -> ChatUpdate
where
    F: Fn(&ChatUpdate) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(update)) if pred(&update) => return update,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("update channel closed while waiting for {description}"),
            Err(_) => panic!("timeout waiting for {description}"),
        }
    }
}

/// Open a chat and wait until it is joined and history has settled.
async fn open_ready(config: ChatConfig) -> (ChatHandle, mpsc::Receiver<ChatUpdate>, usize) {
    let (handle, mut rx) = net::open_chat(config).expect("open_chat failed");
    let mut connected = false;
    let mut records = None;
    while !connected || records.is_none() {
        match wait_for(&mut rx, "connected and history", |u| {
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
            ChatUpdate::HistoryLoaded { records: n } => records = Some(n),
            ChatUpdate::HistoryFailed => panic!("history failed"),
            _ => unreachable!(),
        }
    }
    (handle, rx, records.unwrap_or_default())
}

async fn wait_for_appended(rx: &mut mpsc::Receiver<ChatUpdate>, text: &str) -> (usize, bool) {
    match wait_for(rx, text, |u| {
        matches!(u, ChatUpdate::MessageAppended { message, .. } if message.text == text)
    })
    .await
    {
        ChatUpdate::MessageAppended { index, message } => (index, message.pending),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn stored_history_is_shown_before_live_messages() {
    let (addr, state) = start_relay().await;
    let room_id = RoomId::derive(&"alice".into(), &"bob".into()).unwrap();
    for (minute, text) in [(0, "first"), (1, "second")] {
        state
            .store
            .append(
                &room_id,
                StoredMessage {
                    sender_id: "bob".into(),
                    first_name: "Bob".into(),
                    last_name: String::new(),
                    photo_url: None,
                    text: text.into(),
                    created_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap(),
                },
            )
            .await;
    }

    let (alice_handle, mut alice_rx, records) = open_ready(chat_config(&addr, alice(), "bob")).await;
    assert_eq!(records, 2);
    assert_eq!(alice_handle.room_id(), &room_id);

    let snapshot = alice_handle.snapshot();
    let texts: Vec<_> = snapshot.messages.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, ["first", "second"]);
    assert!(!snapshot.loading_history);
    assert!(alice_handle.take_scroll_request());
    assert!(!alice_handle.is_own_message(&snapshot.messages[0]));

    let (bob_handle, _bob_rx, _) = open_ready(chat_config(&addr, bob(), "alice")).await;
    bob_handle.send("third").await.unwrap();

    let (index, pending) = wait_for_appended(&mut alice_rx, "third").await;
    assert_eq!(index, 2);
    assert!(!pending);
    let message = &alice_handle.snapshot().messages[2];
    assert_eq!(message.first_name, "Bob");
    assert_eq!(message.sender_id, Some("bob".into()));
}

#[tokio::test]
async fn own_message_is_echoed_once_and_confirmed() {
    let (addr, _state) = start_relay().await;
    let (alice_handle, mut alice_rx, _) = open_ready(chat_config(&addr, alice(), "bob")).await;
    let (_bob_handle, mut bob_rx, _) = open_ready(chat_config(&addr, bob(), "alice")).await;

    alice_handle.send("  hello bob  ").await.unwrap();

    let (index, pending) = wait_for_appended(&mut alice_rx, "hello bob").await;
    assert!(pending);
    let confirmed = wait_for(&mut alice_rx, "confirmation", |u| {
        matches!(u, ChatUpdate::MessageConfirmed { .. })
    })
    .await;
    assert_eq!(confirmed, ChatUpdate::MessageConfirmed { index });

    let snapshot = alice_handle.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert!(!snapshot.messages[0].pending);
    assert!(alice_handle.is_own_message(&snapshot.messages[0]));
    assert_eq!(snapshot.seen_marker, Some(0));

    let (bob_index, bob_pending) = wait_for_appended(&mut bob_rx, "hello bob").await;
    assert_eq!(bob_index, 0);
    assert!(!bob_pending);
}

#[tokio::test]
async fn reopening_a_chat_loads_the_conversation_as_history() {
    let (addr, _state) = start_relay().await;
    let (mut alice_handle, mut alice_rx, records) =
        open_ready(chat_config(&addr, alice(), "bob")).await;
    assert_eq!(records, 0);

    alice_handle.send("are you there?").await.unwrap();
    wait_for(&mut alice_rx, "confirmation", |u| {
        matches!(u, ChatUpdate::MessageConfirmed { .. })
    })
    .await;
    alice_handle.close().await;

    let (reopened, _rx, records) = open_ready(chat_config(&addr, alice(), "bob")).await;
    assert_eq!(records, 1);
    let snapshot = reopened.snapshot();
    assert_eq!(snapshot.messages[0].text, "are you there?");
    assert_eq!(snapshot.messages[0].last_name, "Liddell");
    assert!(reopened.is_own_message(&snapshot.messages[0]));
}

#[tokio::test]
async fn unreachable_history_keeps_the_live_conversation() {
    let (addr, _state) = start_relay().await;

    // A port nobody listens on.
    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let mut config = chat_config(&addr, alice(), "bob");
    config.api_base = format!("http://{dead_addr}/");
    let (alice_handle, mut alice_rx) = net::open_chat(config).unwrap();
    wait_for(&mut alice_rx, "history failure", |u| {
        matches!(u, ChatUpdate::HistoryFailed)
    })
    .await;
    assert!(!alice_handle.snapshot().loading_history);

    let (bob_handle, _bob_rx, _) = open_ready(chat_config(&addr, bob(), "alice")).await;
    bob_handle.send("still here").await.unwrap();
    wait_for_appended(&mut alice_rx, "still here").await;
    assert_eq!(alice_handle.snapshot().messages.len(), 1);
}

#[tokio::test]
async fn close_reports_disconnected_then_closed() {
    let (addr, _state) = start_relay().await;
    let (mut handle, mut rx, _) = open_ready(chat_config(&addr, alice(), "bob")).await;

    handle.close().await;
    handle.close().await;

    let mut last_status = None;
    while let Some(update) = rx.recv().await {
        match update {
            ChatUpdate::Status(status) => last_status = Some(status),
            ChatUpdate::Closed => break,
            _ => {}
        }
    }
    assert_eq!(last_status, Some(ConnectionStatus::Disconnected));
    assert_eq!(handle.snapshot().status, ConnectionStatus::Disconnected);
    assert!(handle.send("too late").await.is_err());
}
