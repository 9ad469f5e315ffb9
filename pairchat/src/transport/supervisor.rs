//! Connection supervisor: join handshake, outbound queue, and reconnects.
//!
//! [`ChatTransport::open`] spawns one background task per chat screen. The
//! task owns the current [`Connection`] exclusively and runs this cycle:
//!
//! ```text
//! connect ─▶ joinChat ─▶ wait for `joined` ─▶ flush queue ─▶ forward events
//!    ▲                                                           │
//!    └──── backoff (exponential, jittered, bounded) ◀── lost ────┘
//! ```
//!
//! Messages submitted while not joined are queued and flushed after the next
//! join, so on every connection the join announcement precedes any send.
//! Typing signals are fire-and-forget and dropped while not joined.
//!
//! A message that will never go out (evicted from a full queue, refused by
//! the encoder, or still queued when the transport gives up) is reported as
//! [`TransportEvent::Undelivered`]. A message the encoder refuses is dropped
//! on its own; it does not cost the connection.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;

use pairchat_proto::event::{
    ClientEvent, ClientMessageId, JoinChat, SendMessage, ServerEvent, TypingSignal,
};
use pairchat_proto::room::{ParticipantId, RoomId};

use super::{Connection, ConnectionStatus, Connector, TransportError};
use crate::config::ReconnectConfig;
use crate::user::LocalUser;

/// Capacity of the command channel into the supervisor task.
const COMMAND_BUFFER: usize = 64;

/// Events produced by the transport for the chat session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection state changed.
    Status(ConnectionStatus),
    /// A well-formed event arrived from the server.
    Inbound(ServerEvent),
    /// A submitted message was dropped without reaching the server.
    Undelivered(ClientMessageId),
}

#[derive(Debug)]
enum Command {
    Send(SendMessage),
    Typing(bool),
    Shutdown,
}

/// Who is talking to whom, fixed for the transport's lifetime.
#[derive(Debug, Clone)]
struct Pair {
    local: LocalUser,
    target: ParticipantId,
    room_id: RoomId,
}

/// Owner of the single live connection for one chat screen.
///
/// Dropping the transport aborts the supervisor task; [`close`](Self::close)
/// shuts it down gracefully.
pub struct ChatTransport {
    room_id: RoomId,
    local: LocalUser,
    target: ParticipantId,
    cmd_tx: mpsc::Sender<Command>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ChatTransport {
    /// Start the supervisor for the `(local, target)` pair.
    ///
    /// Returns immediately; connection progress is reported through
    /// [`TransportEvent::Status`] on the returned receiver.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidParticipants`] if either participant
    /// id is empty.
    pub fn open<C: Connector>(
        connector: C,
        local: LocalUser,
        target: ParticipantId,
        config: ReconnectConfig,
        event_buffer: usize,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), TransportError> {
        let room_id = RoomId::derive(&local.id, &target)?;
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (evt_tx, evt_rx) = mpsc::channel(event_buffer);

        let pair = Pair {
            local: local.clone(),
            target: target.clone(),
            room_id: room_id.clone(),
        };
        tracing::info!(room_id = %room_id, target = %target, "opening chat transport");
        let task = tokio::spawn(supervise(connector, pair, config, cmd_rx, evt_tx));

        Ok((
            Self {
                room_id,
                local,
                target,
                cmd_tx,
                task: Some(task),
            },
            evt_rx,
        ))
    }

    /// The locally derived room for this pair.
    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Submit a chat message.
    ///
    /// No local echo happens here; the caller decides whether to show the
    /// message before the server echoes it back.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the transport was
    /// closed or gave up reconnecting.
    pub async fn send(&self, text: String, client_id: ClientMessageId) -> Result<(), TransportError> {
        let msg = SendMessage {
            first_name: self.local.first_name.clone(),
            last_name: self.local.last_name.clone(),
            user_id: self.local.id.clone(),
            target_user_id: self.target.clone(),
            text,
            photo_url: self.local.photo_url.clone(),
            client_id: Some(client_id),
        };
        self.cmd_tx
            .send(Command::Send(msg))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Tell the peer the local user started typing.
    pub fn signal_typing(&self) {
        self.signal(true);
    }

    /// Tell the peer the local user stopped typing.
    pub fn signal_stop_typing(&self) {
        self.signal(false);
    }

    fn signal(&self, typing: bool) {
        if let Err(e) = self.cmd_tx.try_send(Command::Typing(typing)) {
            tracing::debug!(err = %e, typing, "typing signal dropped");
        }
    }

    /// Whether [`close`](Self::close) has completed or the supervisor exited.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.task.as_ref().is_none_or(tokio::task::JoinHandle::is_finished)
    }

    /// Tear down the connection and stop reconnecting.
    ///
    /// Closing an already-closed transport is a no-op.
    pub async fn close(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let _ = self.cmd_tx.send(Command::Shutdown).await;
        if let Err(e) = task.await
            && !e.is_cancelled()
        {
            tracing::warn!(err = %e, "transport task failed");
        }
        tracing::info!(room_id = %self.room_id, "chat transport closed");
    }
}

impl Drop for ChatTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Compute the delay before retry number `attempt` (1-based).
///
/// Exponential growth from `initial_delay`, capped at `max_delay`, with
/// "equal jitter": half the delay is fixed and half is random.
#[must_use]
pub fn backoff_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let base = config
        .initial_delay
        .saturating_mul(1u32 << exp)
        .min(config.max_delay);
    let half = base / 2;
    let half_ms = u64::try_from(half.as_millis()).unwrap_or(u64::MAX);
    half + Duration::from_millis(rand::rng().random_range(0..=half_ms))
}

enum Exit {
    Lost,
    Shutdown,
}

enum Waited<T> {
    Done(T),
    Shutdown,
}

async fn supervise<C: Connector>(
    connector: C,
    pair: Pair,
    config: ReconnectConfig,
    mut cmd_rx: mpsc::Receiver<Command>,
    evt_tx: mpsc::Sender<TransportEvent>,
) {
    let mut queue: VecDeque<SendMessage> = VecDeque::new();
    let mut attempt: u32 = 0;
    let mut shutdown = false;
    emit(&evt_tx, ConnectionStatus::Connecting).await;

    loop {
        let established = establish(&connector, &pair, config.join_timeout, &evt_tx);
        match wait_with_commands(
            established,
            &mut cmd_rx,
            &mut queue,
            config.message_queue_cap,
            &evt_tx,
        )
        .await
        {
            Waited::Shutdown => {
                shutdown = true;
                break;
            }
            Waited::Done(Ok(mut conn)) => {
                attempt = 0;
                emit(&evt_tx, ConnectionStatus::Connected).await;
                let exit = match flush_queue(&mut conn, &mut queue, &evt_tx).await {
                    Ok(()) => run_connection(&mut conn, &pair, &mut cmd_rx, &evt_tx, &mut queue).await,
                    Err(e) => {
                        tracing::warn!(err = %e, "flushing queued messages failed");
                        Exit::Lost
                    }
                };
                conn.close().await;
                if matches!(exit, Exit::Shutdown) {
                    shutdown = true;
                    break;
                }
                tracing::warn!(room_id = %pair.room_id, "connection lost");
            }
            Waited::Done(Err(e)) => {
                tracing::warn!(err = %e, attempt, "connection attempt failed");
            }
        }

        attempt += 1;
        if attempt > config.max_attempts {
            tracing::error!(
                attempts = config.max_attempts,
                room_id = %pair.room_id,
                "giving up reconnecting"
            );
            break;
        }
        emit(&evt_tx, ConnectionStatus::Reconnecting { attempt }).await;
        let delay = backoff_delay(&config, attempt);
        tracing::info!(attempt, delay_ms = delay.as_millis(), "reconnecting after backoff");
        let sleep = tokio::time::sleep(delay);
        if let Waited::Shutdown = wait_with_commands(
            sleep,
            &mut cmd_rx,
            &mut queue,
            config.message_queue_cap,
            &evt_tx,
        )
        .await
        {
            shutdown = true;
            break;
        }
    }

    if !queue.is_empty() {
        tracing::warn!(dropped = queue.len(), "discarding unsent messages");
        // After a local close nobody reads the events any more.
        if !shutdown {
            for msg in queue.drain(..) {
                report_undelivered(&evt_tx, &msg).await;
            }
        }
    }
    emit(&evt_tx, ConnectionStatus::Disconnected).await;
}

/// Connect, announce the join, and wait for the server's acknowledgement.
async fn establish<C: Connector>(
    connector: &C,
    pair: &Pair,
    join_timeout: Duration,
    evt_tx: &mpsc::Sender<TransportEvent>,
) -> Result<C::Conn, TransportError> {
    let mut conn = connector.connect().await?;
    let join = ClientEvent::JoinChat(JoinChat {
        first_name: pair.local.first_name.clone(),
        user_id: pair.local.id.clone(),
        target_user_id: pair.target.clone(),
    });
    conn.send(&join).await?;

    let joined = tokio::time::timeout(join_timeout, wait_for_joined(&mut conn, evt_tx))
        .await
        .map_err(|_| TransportError::Timeout)
        .and_then(|r| r);
    match joined {
        Ok(room_id) if room_id == pair.room_id => {
            tracing::info!(room_id = %room_id, "joined room");
            Ok(conn)
        }
        Ok(room_id) => {
            tracing::error!(
                expected = %pair.room_id,
                actual = %room_id,
                "server placed connection in a different room"
            );
            conn.close().await;
            Err(TransportError::RoomMismatch {
                expected: pair.room_id.clone(),
                actual: room_id,
            })
        }
        Err(e) => {
            conn.close().await;
            Err(e)
        }
    }
}

async fn wait_for_joined<T: Connection>(
    conn: &mut T,
    evt_tx: &mpsc::Sender<TransportEvent>,
) -> Result<RoomId, TransportError> {
    loop {
        match conn.recv().await {
            Some(ServerEvent::Joined(joined)) => return Ok(joined.room_id),
            Some(ServerEvent::Error(err)) => return Err(TransportError::JoinRejected(err.reason)),
            Some(other) => {
                // The peer may already be talking while our ack is in flight.
                let _ = evt_tx.send(TransportEvent::Inbound(other)).await;
            }
            None => return Err(TransportError::ConnectionClosed),
        }
    }
}

async fn flush_queue<T: Connection>(
    conn: &mut T,
    queue: &mut VecDeque<SendMessage>,
    evt_tx: &mpsc::Sender<TransportEvent>,
) -> Result<(), TransportError> {
    if !queue.is_empty() {
        tracing::info!(count = queue.len(), "flushing queued messages");
    }
    while let Some(msg) = queue.pop_front() {
        match conn.send(&ClientEvent::SendMessage(msg.clone())).await {
            Ok(()) => {}
            Err(TransportError::Protocol(e)) => reject(evt_tx, &msg, &e).await,
            Err(e) => {
                queue.push_front(msg);
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Forward events in both directions until the connection drops or the
/// transport shuts down.
async fn run_connection<T: Connection>(
    conn: &mut T,
    pair: &Pair,
    cmd_rx: &mut mpsc::Receiver<Command>,
    evt_tx: &mpsc::Sender<TransportEvent>,
    queue: &mut VecDeque<SendMessage>,
) -> Exit {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None | Some(Command::Shutdown) => return Exit::Shutdown,
                Some(Command::Send(msg)) => {
                    match conn.send(&ClientEvent::SendMessage(msg.clone())).await {
                        Ok(()) => {}
                        // Resending would fail the same way on every connection.
                        Err(TransportError::Protocol(e)) => reject(evt_tx, &msg, &e).await,
                        Err(e) => {
                            tracing::warn!(err = %e, "send failed, queueing for reconnect");
                            queue.push_front(msg);
                            return Exit::Lost;
                        }
                    }
                }
                Some(Command::Typing(typing)) => {
                    let signal = TypingSignal { room_id: pair.room_id.clone() };
                    let event = if typing {
                        ClientEvent::Typing(signal)
                    } else {
                        ClientEvent::StopTyping(signal)
                    };
                    if let Err(e) = conn.send(&event).await {
                        tracing::debug!(err = %e, "typing signal failed");
                        return Exit::Lost;
                    }
                }
            },
            inbound = conn.recv() => match inbound {
                None => return Exit::Lost,
                Some(ServerEvent::Joined(joined)) => {
                    tracing::debug!(room_id = %joined.room_id, "duplicate join acknowledgement");
                }
                Some(ServerEvent::Error(err)) => {
                    tracing::warn!(reason = %err.reason, "server reported an error");
                }
                Some(event) => {
                    if evt_tx.send(TransportEvent::Inbound(event)).await.is_err() {
                        return Exit::Shutdown;
                    }
                }
            },
        }
    }
}

/// Drive `fut` to completion while servicing commands that arrive meanwhile.
async fn wait_with_commands<F: Future>(
    fut: F,
    cmd_rx: &mut mpsc::Receiver<Command>,
    queue: &mut VecDeque<SendMessage>,
    queue_cap: usize,
    evt_tx: &mpsc::Sender<TransportEvent>,
) -> Waited<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return Waited::Done(out),
            cmd = cmd_rx.recv() => match cmd {
                None | Some(Command::Shutdown) => return Waited::Shutdown,
                Some(Command::Send(msg)) => {
                    if let Some(evicted) = enqueue(queue, msg, queue_cap) {
                        report_undelivered(evt_tx, &evicted).await;
                    }
                }
                Some(Command::Typing(typing)) => {
                    tracing::debug!(typing, "not joined, dropping typing signal");
                }
            },
        }
    }
}

/// Queue `msg`, returning the oldest message if the queue overflowed.
fn enqueue(queue: &mut VecDeque<SendMessage>, msg: SendMessage, cap: usize) -> Option<SendMessage> {
    queue.push_back(msg);
    if queue.len() <= cap.max(1) {
        return None;
    }
    let evicted = queue.pop_front()?;
    tracing::warn!(client_id = ?evicted.client_id, "outbound queue full, dropping oldest message");
    Some(evicted)
}

async fn reject(
    evt_tx: &mpsc::Sender<TransportEvent>,
    msg: &SendMessage,
    err: &pairchat_proto::event::ProtocolError,
) {
    tracing::warn!(err = %err, client_id = ?msg.client_id, "message refused by encoder, dropping");
    report_undelivered(evt_tx, msg).await;
}

async fn report_undelivered(evt_tx: &mpsc::Sender<TransportEvent>, msg: &SendMessage) {
    if let Some(client_id) = msg.client_id {
        let _ = evt_tx.send(TransportEvent::Undelivered(client_id)).await;
    }
}

async fn emit(evt_tx: &mpsc::Sender<TransportEvent>, status: ConnectionStatus) {
    tracing::debug!(%status, "connection status");
    let _ = evt_tx.send(TransportEvent::Status(status)).await;
}
