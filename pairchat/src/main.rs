//! `PairChat` -- line-mode terminal chat with one other user.
//!
//! Each line typed on stdin is sent as a message; `/quit` leaves. Incoming
//! messages, typing presence, and connection changes are printed to stdout.
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/pairchat/config.toml`).
//!
//! ```bash
//! cargo run --bin pairchat -- --server-url ws://127.0.0.1:7777/ws \
//!     --api-base http://127.0.0.1:7777 --user-id u1 --first-name Ada --target u2
//! ```

use std::io;
use std::path::Path;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use pairchat::config::{CliArgs, ClientConfig};
use pairchat::net::{self, ChatHandle, ChatUpdate};
use pairchat_proto::room::ParticipantId;

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: cannot load configuration: {e}");
            std::process::exit(1);
        }
    };

    // Logs go to a file so stdout stays readable.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("pairchat starting");

    let Some(chat_config) = config.to_chat_config() else {
        eprintln!(
            "Missing settings: server URL, API base, user id, first name, and target are required"
        );
        return Ok(());
    };
    let peer = chat_config.target.clone();

    let (mut handle, mut updates) = match net::open_chat(chat_config) {
        Ok(opened) => opened,
        Err(e) => {
            eprintln!("Cannot open chat: {e}");
            return Ok(());
        }
    };
    println!("Chatting with {peer} (room {}). /quit to leave.", handle.room_id());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                None => break,
                Some(line) if line.trim() == "/quit" => break,
                Some(line) => submit(&handle, line).await,
            },
            update = updates.recv() => match update {
                None | Some(ChatUpdate::Closed) => break,
                Some(update) => render(&handle, &update, &peer, &config.timestamp_format),
            },
        }
    }

    handle.close().await;
    tracing::info!("pairchat exiting");
    Ok(())
}

async fn submit(handle: &ChatHandle, line: String) {
    // One line is a whole burst: typing starts, then the send ends it.
    if let Err(e) = handle.input(line.clone()).await {
        tracing::warn!(err = %e, "input dropped");
        return;
    }
    if let Err(e) = handle.send(line).await {
        tracing::warn!(err = %e, "message dropped");
    }
}

fn render(handle: &ChatHandle, update: &ChatUpdate, peer: &ParticipantId, timestamp_format: &str) {
    match update {
        ChatUpdate::MessageAppended { message, .. } => {
            let time = message
                .created_at
                .with_timezone(&chrono::Local)
                .format(timestamp_format);
            let who = if handle.is_own_message(message) {
                "you".to_string()
            } else {
                format!("{} {}", message.first_name, message.last_name)
                    .trim_end()
                    .to_string()
            };
            let mark = if message.failed {
                " (not delivered)"
            } else if message.pending {
                " …"
            } else {
                ""
            };
            println!("[{time}] {who}: {}{mark}", message.text);
        }
        ChatUpdate::MessageConfirmed { .. } => {}
        ChatUpdate::MessageFailed { index } => {
            if let Some(message) = handle.snapshot().messages.get(*index) {
                println!("  (not delivered: {})", message.text);
            }
        }
        ChatUpdate::MessageTooLong { len, max } => {
            println!("  (message is {len} bytes, the limit is {max}; not sent)");
        }
        ChatUpdate::PeerTyping(true) => println!("  {peer} is typing…"),
        ChatUpdate::PeerTyping(false) => {}
        ChatUpdate::Status(status) => println!("  ({status})"),
        ChatUpdate::HistoryLoaded { records } => println!("  ({records} earlier messages)"),
        ChatUpdate::HistoryFailed => println!("  (history unavailable)"),
        ChatUpdate::Closed => {}
    }
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("pairchat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}
