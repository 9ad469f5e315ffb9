// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::needless_continue,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Typing presence between two chat screens through the relay.
//!
//! The sender debounces keystrokes into one `typing` per burst and one
//! `stopTyping` after the quiet period or on send; the relay forwards both
//! to the other member of the room only.

use std::time::Duration;

use pairchat::config::ReconnectConfig;
use pairchat::net::{self, ChatConfig, ChatHandle, ChatUpdate};
use pairchat::transport::ConnectionStatus;
use pairchat::user::LocalUser;
use tokio::sync::mpsc;

const QUIET: Duration = Duration::from_millis(300);

async fn start_relay() -> String {
    let (addr, _handle) = pairchat_relay::relay::start_server("127.0.0.1:0")
        .await
        .expect("failed to start relay server");
    addr.to_string()
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
        typing_quiet_period: QUIET,
        reconnect: ReconnectConfig::default(),
        channel_capacity: 64,
    }
}

async fn open_connected(
    relay_addr: &str,
    id: &str,
    target: &str,
) -> (ChatHandle, mpsc::Receiver<ChatUpdate>) {
    let (handle, mut rx) =
        net::open_chat(chat_config(relay_addr, LocalUser::new(id, id), target)).unwrap();
    next_matching(&mut rx, Duration::from_secs(10), |u| {
        *u == ChatUpdate::Status(ConnectionStatus::Connected)
    })
    .await
    .expect("never connected");
    (handle, rx)
}

/// Next update matching `pred` within `timeout`, or `None`.
async fn next_matching<F>(
    rx: &mut mpsc::Receiver<ChatUpdate>,
    timeout: Duration,
    pred: F,
) -> Option<ChatUpdate>
where
    F: Fn(&ChatUpdate) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(update)) if pred(&update) => return Some(update),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

fn is_peer_typing(update: &ChatUpdate) -> bool {
    matches!(update, ChatUpdate::PeerTyping(_))
}

#[tokio::test]
async fn typing_shows_on_peer_and_clears_after_quiet_period() {
    let addr = start_relay().await;
    let (alice, _alice_rx) = open_connected(&addr, "alice", "bob").await;
    let (bob, mut bob_rx) = open_connected(&addr, "bob", "alice").await;

    alice.input("h").await.unwrap();
    let started = next_matching(&mut bob_rx, Duration::from_secs(5), is_peer_typing).await;
    assert_eq!(started, Some(ChatUpdate::PeerTyping(true)));
    assert!(bob.snapshot().peer_typing);

    let stopped = next_matching(&mut bob_rx, QUIET * 5, is_peer_typing).await;
    assert_eq!(stopped, Some(ChatUpdate::PeerTyping(false)));
    assert!(!bob.snapshot().peer_typing);
}

#[tokio::test]
async fn a_burst_of_keystrokes_starts_typing_once() {
    let addr = start_relay().await;
    let (alice, _alice_rx) = open_connected(&addr, "alice", "bob").await;
    let (_bob, mut bob_rx) = open_connected(&addr, "bob", "alice").await;

    for text in ["h", "he", "hel", "hell", "hello"] {
        alice.input(text).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let mut seen = Vec::new();
    while let Some(update) = next_matching(&mut bob_rx, QUIET * 5, is_peer_typing).await {
        let done = update == ChatUpdate::PeerTyping(false);
        seen.push(update);
        if done {
            break;
        }
    }
    assert_eq!(
        seen,
        [ChatUpdate::PeerTyping(true), ChatUpdate::PeerTyping(false)]
    );
}

#[tokio::test]
async fn sending_stops_typing_before_the_message_arrives() {
    let addr = start_relay().await;
    let (alice, _alice_rx) = open_connected(&addr, "alice", "bob").await;
    let (_bob, mut bob_rx) = open_connected(&addr, "bob", "alice").await;

    alice.input("hi").await.unwrap();
    assert_eq!(
        next_matching(&mut bob_rx, Duration::from_secs(5), is_peer_typing).await,
        Some(ChatUpdate::PeerTyping(true))
    );

    alice.send("hi").await.unwrap();
    let next = next_matching(&mut bob_rx, Duration::from_secs(5), |u| {
        matches!(
            u,
            ChatUpdate::PeerTyping(_) | ChatUpdate::MessageAppended { .. }
        )
    })
    .await;
    assert_eq!(next, Some(ChatUpdate::PeerTyping(false)));
    let message = next_matching(&mut bob_rx, Duration::from_secs(5), |u| {
        matches!(u, ChatUpdate::MessageAppended { .. })
    })
    .await;
    assert!(matches!(
        message,
        Some(ChatUpdate::MessageAppended { message, .. }) if message.text == "hi"
    ));
}

#[tokio::test]
async fn typing_does_not_leak_to_other_conversations() {
    let addr = start_relay().await;
    let (alice, _alice_rx) = open_connected(&addr, "alice", "bob").await;
    let (_bob, mut bob_rx) = open_connected(&addr, "bob", "alice").await;
    let (_carol_bob, mut carol_rx) = open_connected(&addr, "carol", "bob").await;

    alice.input("psst").await.unwrap();
    assert_eq!(
        next_matching(&mut bob_rx, Duration::from_secs(5), is_peer_typing).await,
        Some(ChatUpdate::PeerTyping(true))
    );
    assert_eq!(
        next_matching(&mut carol_rx, Duration::from_millis(500), is_peer_typing).await,
        None
    );
}

#[tokio::test]
async fn clearing_the_input_stops_typing() {
    let addr = start_relay().await;
    let (alice, _alice_rx) = open_connected(&addr, "alice", "bob").await;
    let (_bob, mut bob_rx) = open_connected(&addr, "bob", "alice").await;

    alice.input("oops").await.unwrap();
    assert_eq!(
        next_matching(&mut bob_rx, Duration::from_secs(5), is_peer_typing).await,
        Some(ChatUpdate::PeerTyping(true))
    );
    alice.input("").await.unwrap();
    // Well inside the quiet period, so only the explicit clear can stop it.
    assert_eq!(
        next_matching(&mut bob_rx, QUIET / 2, is_peer_typing).await,
        Some(ChatUpdate::PeerTyping(false))
    );
}

#[tokio::test]
async fn closing_the_chat_mid_burst_stops_typing_on_peer() {
    let addr = start_relay().await;
    let (mut alice, _alice_rx) = open_connected(&addr, "alice", "bob").await;
    let (bob, mut bob_rx) = open_connected(&addr, "bob", "alice").await;

    alice.input("brb").await.unwrap();
    assert_eq!(
        next_matching(&mut bob_rx, Duration::from_secs(5), is_peer_typing).await,
        Some(ChatUpdate::PeerTyping(true))
    );
    alice.close().await;
    // Well inside the quiet period, so the close itself must end the burst.
    assert_eq!(
        next_matching(&mut bob_rx, QUIET / 2, is_peer_typing).await,
        Some(ChatUpdate::PeerTyping(false))
    );
    assert!(!bob.snapshot().peer_typing);
}
