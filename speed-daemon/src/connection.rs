//! Per-connection actor: parses inbound frames, drives the
//! Unidentified/Camera/Dispatcher handshake, runs the optional
//! heartbeat timer, and serialises all outbound writes through a
//! single writer task.

use std::time::Duration;

use tokio::io::{BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::codec::{DecodeError, Encode, Frame, Message};
use crate::engine::{EngineHandle, Ticket};
use crate::registry::{Outbox, RegistryHandle};

const OUTBOX_BUFFER_SIZE: usize = 32;

/// The spawned task draining the registry's dispatcher mailbox into this
/// connection's own outbox, plus the handle used to stop it gracefully.
struct ForwardTask {
    handle: tokio::task::JoinHandle<()>,
    stop: oneshot::Sender<()>,
}

pub async fn handle(stream: TcpStream, registry: RegistryHandle, engine: EngineHandle) {
    let addr = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let writer = BufWriter::new(writer);

    let (outbox_tx, outbox_rx) = mpsc::channel::<Message>(OUTBOX_BUFFER_SIZE);
    let (set_heartbeat, heartbeat_rx) = oneshot::channel::<u32>();

    let writer_task = tokio::spawn(writer_loop(writer, outbox_rx, registry.clone(), addr));
    let heartbeat_task = tokio::spawn(heartbeat_loop(outbox_tx.clone(), heartbeat_rx));

    let mut forward_task: Option<ForwardTask> = None;
    let role = run_session(
        &mut reader,
        outbox_tx.clone(),
        set_heartbeat,
        &registry,
        &engine,
        &mut forward_task,
    )
    .await;

    // Dropping our clone of outbox_tx lets the writer's recv() loop end
    // once every other clone (heartbeat task, dispatcher-forward task) is
    // also gone.
    drop(outbox_tx);
    heartbeat_task.abort();

    // Stop the forward task gracefully rather than aborting it: a plain
    // abort can cut it off mid-send, silently dropping a Ticket that was
    // already pulled out of the registry's mailbox. Awaiting it lets it
    // drain and requeue anything left over first (see `forward_tickets`).
    if let Some(ForwardTask { handle, stop }) = forward_task {
        let _ = stop.send(());
        let _ = handle.await;
    }

    if let Role::Dispatcher {
        roads,
        registry_outbox,
    } = &role
    {
        registry
            .unregister_dispatcher(roads.clone(), registry_outbox.clone())
            .await;
        debug!(?addr, "dispatcher connection closed, unregistered from its roads");
    }

    let _ = writer_task.await;

    info!(?addr, "connection closed");
}

/// Owns the socket's write half and the connection's single outbound
/// mailbox. Every frame is written exactly once and in receipt order;
/// once a write fails (or a terminal Error has already gone out) the
/// loop keeps draining the mailbox without touching the socket again,
/// requeueing any Ticket it finds so a dead dispatcher never silently
/// swallows one (spec: tickets merely enqueued but never written must
/// not be lost).
async fn writer_loop(
    mut writer: BufWriter<tokio::net::tcp::OwnedWriteHalf>,
    mut outbox_rx: mpsc::Receiver<Message>,
    registry: RegistryHandle,
    addr: Option<std::net::SocketAddr>,
) {
    let mut socket_alive = true;

    while let Some(msg) = outbox_rx.recv().await {
        if !socket_alive {
            requeue_if_ticket(&registry, msg).await;
            continue;
        }

        let is_terminal_error = matches!(msg, Message::Error { .. });
        if let Err(e) = msg.encode(&mut writer).await {
            warn!(?addr, error = ?e, "write failed");
            socket_alive = false;
            requeue_if_ticket(&registry, msg).await;
            continue;
        }

        if is_terminal_error {
            socket_alive = false;
        }
    }
}

async fn requeue_if_ticket(registry: &RegistryHandle, msg: Message) {
    if let Message::Ticket {
        plate,
        road,
        mile1,
        timestamp1,
        mile2,
        timestamp2,
        speed_x100,
    } = msg
    {
        registry
            .requeue_ticket(Ticket {
                plate,
                road,
                mile1,
                timestamp1,
                mile2,
                timestamp2,
                speed_x100,
            })
            .await;
    }
}

/// Drains the registry's per-dispatcher mailbox into this connection's
/// own outbox until told to stop. On stop, closes the mailbox and
/// drains whatever is already buffered in it back into
/// `pending_tickets` via `requeue_ticket`, so a ticket the registry
/// already handed to this dispatcher but that never made it past this
/// task is never silently lost (spec.md §4.2/§5).
async fn forward_tickets(
    mut dispatcher_rx: mpsc::Receiver<Message>,
    forward_outbox: mpsc::Sender<Message>,
    registry: RegistryHandle,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            maybe_msg = dispatcher_rx.recv() => match maybe_msg {
                Some(msg) => {
                    if forward_outbox.send(msg).await.is_err() {
                        break;
                    }
                }
                None => return,
            },
        }
    }

    dispatcher_rx.close();
    while let Ok(msg) = dispatcher_rx.try_recv() {
        requeue_if_ticket(&registry, msg).await;
    }
}

async fn heartbeat_loop(outbox: mpsc::Sender<Message>, rx: oneshot::Receiver<u32>) {
    let interval_deciseconds = match rx.await {
        Ok(interval) => interval,
        Err(_) => return, // connection ended before WantHeartbeat arrived
    };
    if interval_deciseconds == 0 {
        return;
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(interval_deciseconds as u64 * 100));
    ticker.tick().await; // first tick fires immediately; consume it so cadence starts one interval out
    loop {
        ticker.tick().await;
        if outbox.send(Message::Heartbeat).await.is_err() {
            return;
        }
    }
}

enum Role {
    Unidentified,
    Camera { road: u16, mile: u16, limit: u16 },
    Dispatcher { roads: Vec<u16>, registry_outbox: Outbox },
}

/// Drives the read side of the connection until it closes or a
/// protocol/state violation forces it shut. Returns the role the
/// connection ended up in, for any final bookkeeping at the call site.
async fn run_session(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    outbox: mpsc::Sender<Message>,
    mut set_heartbeat: Option<oneshot::Sender<u32>>,
    registry: &RegistryHandle,
    engine: &EngineHandle,
    forward_task: &mut Option<ForwardTask>,
) -> Role {
    let mut role = Role::Unidentified;
    let mut heartbeat_requested = false;

    loop {
        let frame = match Frame::decode(reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return role, // clean EOF at a frame boundary
            Err(e) => {
                send_error(&outbox, decode_error_message(&e)).await;
                return role;
            }
        };

        match frame {
            Frame::WantHeartbeat { interval } => {
                if heartbeat_requested {
                    send_error(&outbox, "heartbeat already requested".into()).await;
                    return role;
                }
                heartbeat_requested = true;
                if let Some(tx) = set_heartbeat.take() {
                    let _ = tx.send(interval);
                }
            }
            Frame::IAmCamera { road, mile, limit } => match role {
                Role::Unidentified => {
                    debug!(road, mile, limit, "camera identified");
                    role = Role::Camera { road, mile, limit };
                }
                _ => {
                    send_error(&outbox, "already identified".into()).await;
                    return role;
                }
            },
            Frame::IAmDispatcher { roads } => match role {
                Role::Unidentified => {
                    if roads.is_empty() || roads.len() > 255 {
                        send_error(&outbox, "invalid road count".into()).await;
                        return role;
                    }
                    let (registry_outbox, dispatcher_rx) =
                        registry.register_dispatcher(roads.clone()).await;
                    let (stop_tx, stop_rx) = oneshot::channel();
                    let forward_outbox = outbox.clone();
                    let registry_for_forward = registry.clone();
                    let handle = tokio::spawn(forward_tickets(
                        dispatcher_rx,
                        forward_outbox,
                        registry_for_forward,
                        stop_rx,
                    ));
                    *forward_task = Some(ForwardTask {
                        handle,
                        stop: stop_tx,
                    });
                    role = Role::Dispatcher {
                        roads,
                        registry_outbox,
                    };
                }
                _ => {
                    send_error(&outbox, "already identified".into()).await;
                    return role;
                }
            },
            Frame::Plate { plate, timestamp } => match &role {
                Role::Camera { road, mile, limit } => {
                    engine.record(plate, *road, *mile, timestamp, *limit).await;
                }
                _ => {
                    send_error(&outbox, "plate report from a non-camera".into()).await;
                    return role;
                }
            },
        }
    }
}

fn decode_error_message(err: &DecodeError) -> String {
    match err {
        DecodeError::MalformedType(_) => "unknown message type".to_string(),
        DecodeError::Truncated => "truncated frame".to_string(),
        DecodeError::Io(e) => {
            error!(error = ?e, "io error decoding frame");
            "i/o error".to_string()
        }
    }
}

async fn send_error(outbox: &mpsc::Sender<Message>, msg: String) {
    let _ = outbox.send(Message::Error { msg }).await;
}
