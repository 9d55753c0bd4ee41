// Per-connection server session: one read-dispatch loop driving the state
// machine, one writer task that owns the socket's send side, and one
// liveness task for the TestConn/ConfConn keep-alive. Cancellation is a
// shared watch channel; whichever task fails first flips it.
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use syrinx_wire::{
    disconn, nack, read_frame, write_frame, Keyset, Packet, PROTOCOL_VERSION_MAJOR,
};

use crate::core::{RouterCore, WRITE_QUEUE_DEPTH};
use crate::matcher::{self, SubMutation};
use crate::subast;

#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionConfig {
    pub(crate) max_frame_bytes: usize,
    pub(crate) test_conn_interval: Duration,
    pub(crate) test_conn_timeout: Duration,
}

// Reaps the session's records even if the read loop unwinds. The normal
// exit path disarms it and reaps inline so callers observe a consistent
// table immediately after teardown.
struct ReapGuard {
    core: Arc<RouterCore>,
    session_id: u64,
    armed: bool,
}

impl ReapGuard {
    fn new(core: &Arc<RouterCore>, session_id: u64) -> Self {
        Self {
            core: Arc::clone(core),
            session_id,
            armed: true,
        }
    }

    fn disarm(mut self) -> u64 {
        self.armed = false;
        self.session_id
    }
}

impl Drop for ReapGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let core = Arc::clone(&self.core);
        let session_id = self.session_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { core.reap_session(session_id).await });
        }
    }
}

pub(crate) async fn run_session(
    core: Arc<RouterCore>,
    config: SessionConfig,
    stream: TcpStream,
    peer: SocketAddr,
) {
    if let Err(err) = stream.set_nodelay(true) {
        tracing::debug!(error = %err, "set_nodelay failed");
    }
    let (mut read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_DEPTH);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let writer = tokio::spawn(run_writer_loop(
        write_half,
        out_rx,
        cancel_tx.clone(),
        cancel_rx.clone(),
    ));
    let last_rx = Arc::new(StdMutex::new(Instant::now()));
    let liveness = tokio::spawn(run_liveness(
        out_tx.clone(),
        cancel_tx.clone(),
        cancel_rx.clone(),
        Arc::clone(&last_rx),
        config.test_conn_interval,
        config.test_conn_timeout,
    ));

    let guard = run_read_loop(
        &core,
        &config,
        peer,
        &mut read_half,
        &out_tx,
        &cancel_tx,
        cancel_rx,
        &last_rx,
    )
    .await;

    let _ = cancel_tx.send(true);
    let _ = liveness.await;
    let _ = writer.await;
    if let Some(guard) = guard {
        let session_id = guard.disarm();
        core.reap_session(session_id).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_read_loop(
    core: &Arc<RouterCore>,
    config: &SessionConfig,
    peer: SocketAddr,
    read_half: &mut tokio::net::tcp::OwnedReadHalf,
    out_tx: &mpsc::Sender<Bytes>,
    cancel_tx: &watch::Sender<bool>,
    mut cancel_rx: watch::Receiver<bool>,
    last_rx: &Arc<StdMutex<Instant>>,
) -> Option<ReapGuard> {
    let mut scratch = BytesMut::with_capacity(8 * 1024);
    let mut guard: Option<ReapGuard> = None;
    // Connection-level default keys from the handshake, merged into every
    // notification / subscription this session sends.
    let mut conn_keys_nfn: Vec<Keyset> = Vec::new();
    let mut conn_keys_sub: Vec<Keyset> = Vec::new();

    loop {
        let frame = tokio::select! {
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
                continue;
            }
            frame = read_frame(read_half, &mut scratch, config.max_frame_bytes) => frame,
        };
        *last_rx.lock().expect("last_rx lock") = Instant::now();
        let body = match frame {
            Ok(Some(body)) => body,
            Ok(None) => break,
            Err(err @ syrinx_wire::Error::FrameTooLarge { .. }) => {
                tracing::warn!(%peer, error = %err, "oversized frame");
                send_disconn(out_tx, disconn::REASON_PROTOCOL_VIOLATION).await;
                break;
            }
            Err(err) => {
                tracing::debug!(error = %err, "session read failed");
                break;
            }
        };
        let packet = match Packet::decode(body) {
            Ok(packet) => packet,
            Err(err) => {
                tracing::warn!(error = %err, "undecodable packet");
                send_disconn(out_tx, disconn::REASON_PROTOCOL_VIOLATION).await;
                break;
            }
        };

        let session_id = match &guard {
            Some(guard) => guard.session_id,
            // Pre-handshake: only ConnRequest (and the keep-alive probe)
            // are legal.
            None => match packet {
                Packet::ConnRequest {
                    xid,
                    version_major,
                    version_minor: _,
                    options,
                    keys_nfn,
                    keys_sub,
                } => {
                    if version_major != PROTOCOL_VERSION_MAJOR {
                        send(
                            out_tx,
                            &Packet::Nack {
                                xid,
                                code: nack::VERSION_INCOMPATIBLE,
                                message: format!(
                                    "unsupported protocol version {version_major}"
                                ),
                                args: vec![],
                            },
                        )
                        .await;
                        break;
                    }
                    conn_keys_nfn = keys_nfn;
                    conn_keys_sub = keys_sub;
                    let session_id = core
                        .register_session(peer, out_tx.clone(), cancel_tx.clone())
                        .await;
                    guard = Some(ReapGuard::new(core, session_id));
                    // The negotiated option set is the requested one; no
                    // options are rewritten by this router.
                    if !send(out_tx, &Packet::ConnReply { xid, options }).await {
                        break;
                    }
                    continue;
                }
                Packet::TestConn => {
                    send(out_tx, &Packet::ConfConn).await;
                    continue;
                }
                other => {
                    send(
                        out_tx,
                        &Packet::Nack {
                            xid: other.xid().unwrap_or(0),
                            code: nack::NOT_CONNECTED,
                            message: "connection handshake required".into(),
                            args: vec![],
                        },
                    )
                    .await;
                    break;
                }
            },
        };

        // Connected-state dispatch.
        match packet {
            Packet::NotifyEmit {
                name_value,
                deliver_insecure,
                keys,
            } => {
                let keys = syrinx_wire::merge_keysets(&keys, &conn_keys_nfn, &[]);
                matcher::dispatch_notification(core, &name_value, deliver_insecure, &keys).await;
            }
            Packet::SubAddRequest {
                xid,
                expression,
                accept_insecure,
                keys,
            } => {
                let keys = syrinx_wire::merge_keysets(&keys, &conn_keys_sub, &[]);
                handle_sub_add(core, session_id, out_tx, xid, expression, accept_insecure, keys)
                    .await;
            }
            Packet::SubModRequest {
                xid,
                sub_id,
                expression,
                accept_insecure,
                add_keys,
                del_keys,
            } => {
                handle_sub_mod(
                    core,
                    session_id,
                    out_tx,
                    xid,
                    sub_id,
                    expression,
                    accept_insecure,
                    add_keys,
                    del_keys,
                )
                .await;
            }
            Packet::SubDelRequest { xid, sub_id } => {
                match core.delete_subscription(session_id, sub_id).await {
                    Some(record) => {
                        send(out_tx, &Packet::SubReply { xid, sub_id }).await;
                        matcher::notify_quenches(core, SubMutation::Deleted(&record)).await;
                    }
                    None => {
                        send_nack(out_tx, xid, nack::UNKNOWN_SUBSCRIPTION, sub_id).await;
                    }
                }
            }
            Packet::QuenchAddRequest {
                xid,
                names,
                deliver_insecure,
                keys,
            } => {
                let record = core
                    .add_quench(
                        session_id,
                        names.into_iter().collect(),
                        deliver_insecure,
                        keys,
                    )
                    .await;
                send(
                    out_tx,
                    &Packet::QuenchReply {
                        xid,
                        quench_id: record.quench_id,
                    },
                )
                .await;
            }
            Packet::QuenchModRequest {
                xid,
                quench_id,
                add_names,
                del_names,
                deliver_insecure,
                add_keys,
                del_keys,
            } => {
                match core
                    .modify_quench(
                        session_id,
                        quench_id,
                        &add_names,
                        &del_names,
                        deliver_insecure,
                        &add_keys,
                        &del_keys,
                    )
                    .await
                {
                    Some(_) => {
                        send(out_tx, &Packet::QuenchReply { xid, quench_id }).await;
                    }
                    None => {
                        send_nack(out_tx, xid, nack::UNKNOWN_QUENCH, quench_id).await;
                    }
                }
            }
            Packet::QuenchDelRequest { xid, quench_id } => {
                match core.delete_quench(session_id, quench_id).await {
                    Some(_) => {
                        send(out_tx, &Packet::QuenchReply { xid, quench_id }).await;
                    }
                    None => {
                        send_nack(out_tx, xid, nack::UNKNOWN_QUENCH, quench_id).await;
                    }
                }
            }
            Packet::DisconnRequest { xid } => {
                send(out_tx, &Packet::DisconnReply { xid }).await;
                tracing::debug!(session_id, "orderly disconnect");
                break;
            }
            Packet::TestConn => {
                send(out_tx, &Packet::ConfConn).await;
            }
            Packet::ConfConn => {}
            // Everything else is router-to-client traffic or a duplicate
            // handshake; receiving it here is a protocol violation.
            other => {
                tracing::warn!(session_id, packet = ?other, "illegal packet in connected state");
                send_disconn(out_tx, disconn::REASON_PROTOCOL_VIOLATION).await;
                break;
            }
        }
    }
    guard
}

async fn handle_sub_add(
    core: &Arc<RouterCore>,
    session_id: u64,
    out_tx: &mpsc::Sender<Bytes>,
    xid: u32,
    expression: String,
    accept_insecure: bool,
    keys: Vec<Keyset>,
) {
    let ast = match subast::parse(&expression) {
        Ok(ast) => ast,
        Err(err) => {
            tracing::debug!(session_id, %err, "subscription rejected");
            send(
                out_tx,
                &Packet::Nack {
                    xid,
                    code: nack::PARSE_ERROR,
                    message: err.to_string(),
                    args: vec![syrinx_wire::Value::Str(expression)],
                },
            )
            .await;
            return;
        }
    };
    let names = subast::names(&ast);
    let record = core
        .add_subscription(session_id, expression, ast, names, accept_insecure, keys)
        .await;
    send(
        out_tx,
        &Packet::SubReply {
            xid,
            sub_id: record.sub_id,
        },
    )
    .await;
    matcher::notify_quenches(core, SubMutation::Added(&record)).await;
}

#[allow(clippy::too_many_arguments)]
async fn handle_sub_mod(
    core: &Arc<RouterCore>,
    session_id: u64,
    out_tx: &mpsc::Sender<Bytes>,
    xid: u32,
    sub_id: u64,
    expression: String,
    accept_insecure: bool,
    add_keys: Vec<Keyset>,
    del_keys: Vec<Keyset>,
) {
    // An empty expression keeps the current one.
    let parsed = if expression.is_empty() {
        None
    } else {
        match subast::parse(&expression) {
            Ok(ast) => {
                let names = subast::names(&ast);
                Some((expression, ast, names))
            }
            Err(err) => {
                tracing::debug!(session_id, sub_id, %err, "modification rejected");
                send(
                    out_tx,
                    &Packet::Nack {
                        xid,
                        code: nack::PARSE_ERROR,
                        message: err.to_string(),
                        args: vec![syrinx_wire::Value::Str(expression)],
                    },
                )
                .await;
                return;
            }
        }
    };
    match core
        .modify_subscription(session_id, sub_id, parsed, accept_insecure, &add_keys, &del_keys)
        .await
    {
        Some(record) => {
            send(out_tx, &Packet::SubReply { xid, sub_id }).await;
            matcher::notify_quenches(core, SubMutation::Modified(&record)).await;
        }
        None => {
            send_nack(out_tx, xid, nack::UNKNOWN_SUBSCRIPTION, sub_id).await;
        }
    }
}

async fn send(out_tx: &mpsc::Sender<Bytes>, packet: &Packet) -> bool {
    out_tx.send(packet.encode()).await.is_ok()
}

async fn send_disconn(out_tx: &mpsc::Sender<Bytes>, reason: u32) {
    send(
        out_tx,
        &Packet::Disconn {
            reason,
            args: String::new(),
        },
    )
    .await;
}

async fn send_nack(out_tx: &mpsc::Sender<Bytes>, xid: u32, code: u32, id: u64) {
    send(
        out_tx,
        &Packet::Nack {
            xid,
            code,
            message: format!("unknown id {id}"),
            args: vec![syrinx_wire::Value::Int64(id as i64)],
        },
    )
    .await;
}

// Single-writer loop: the only code that touches the send half. Biased
// toward draining the queue so a Disconn enqueued just before cancellation
// still reaches the peer.
pub(crate) async fn run_writer_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
    cancel_tx: watch::Sender<bool>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            body = rx.recv() => {
                let Some(body) = body else { break };
                if let Err(err) = write_frame(&mut write_half, &body).await {
                    tracing::debug!(error = %err, "session writer stopped");
                    let _ = cancel_tx.send(true);
                    break;
                }
            }
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }
        }
    }
    // Drop whatever is still queued rather than blocking on the peer.
    while rx.try_recv().is_ok() {}
}

// Keep-alive: after an idle interval, probe with TestConn; if no inbound
// traffic lands within the grace period, tear the session down.
async fn run_liveness(
    out: mpsc::Sender<Bytes>,
    cancel_tx: watch::Sender<bool>,
    mut cancel_rx: watch::Receiver<bool>,
    last_rx: Arc<StdMutex<Instant>>,
    interval: Duration,
    timeout: Duration,
) {
    let test_conn = Packet::TestConn.encode();
    let mut ping_sent_at: Option<Instant> = None;
    loop {
        let last = *last_rx.lock().expect("last_rx lock");
        let deadline = match ping_sent_at {
            Some(sent) if last < sent => sent + timeout,
            _ => {
                ping_sent_at = None;
                last + interval
            }
        };
        if Instant::now() >= deadline {
            match ping_sent_at {
                Some(_) => {
                    tracing::info!("idle session timed out");
                    let disconn = Packet::Disconn {
                        reason: disconn::REASON_IDLE_TIMEOUT,
                        args: String::new(),
                    }
                    .encode();
                    let _ = out.send(disconn).await;
                    let _ = cancel_tx.send(true);
                    break;
                }
                None => {
                    if out.send(test_conn.clone()).await.is_err() {
                        break;
                    }
                    ping_sent_at = Some(Instant::now());
                }
            }
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep_until(deadline.into()) => {}
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }
        }
    }
}
