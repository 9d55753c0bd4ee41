// Client session tasks: a reader that decodes and routes inbound packets,
// and a single-writer loop that owns the socket's send side. Both watch a
// shared cancel channel; either one failing flips it.
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use syrinx_wire::{disconn, read_frame, write_frame, Packet};

use crate::client::{ClientInner, ClientState, DisconnEvent, ReplyTable};
use crate::subscription::QuenchNotification;

pub(crate) struct Session {
    pub(crate) out: mpsc::Sender<Bytes>,
    pub(crate) cancel: watch::Sender<bool>,
    pub(crate) reader: JoinHandle<()>,
    pub(crate) writer: JoinHandle<()>,
}

pub(crate) async fn run_writer(
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
                    tracing::debug!(error = %err, "client writer stopped");
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
    while rx.try_recv().is_ok() {}
}

pub(crate) async fn run_reader(
    inner: Arc<ClientInner>,
    mut read_half: OwnedReadHalf,
    cancel_tx: watch::Sender<bool>,
    mut cancel_rx: watch::Receiver<bool>,
    out_tx: mpsc::Sender<Bytes>,
    max_frame_bytes: usize,
) {
    let mut scratch = BytesMut::with_capacity(8 * 1024);
    // Event published on the disconnect channel once the session is gone;
    // None for a deliberate, client-initiated teardown.
    let mut event: Option<DisconnEvent> = None;
    loop {
        let frame = tokio::select! {
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
                continue;
            }
            frame = read_frame(&mut read_half, &mut scratch, max_frame_bytes) => frame,
        };
        let body = match frame {
            Ok(Some(body)) => body,
            Ok(None) => {
                event = Some(DisconnEvent::local());
                break;
            }
            Err(err) => {
                tracing::debug!(error = %err, "client read failed");
                event = Some(DisconnEvent::local());
                break;
            }
        };
        let packet = match Packet::decode(body) {
            Ok(packet) => packet,
            Err(err) => {
                tracing::warn!(error = %err, "undecodable packet from router");
                event = Some(DisconnEvent::local());
                break;
            }
        };
        match packet {
            Packet::ConnReply { xid, .. } => {
                if !deliver_reply(&inner, ReplyTable::Conn, xid, packet) {
                    break;
                }
            }
            Packet::DisconnReply { xid } => {
                if !deliver_reply(&inner, ReplyTable::Conn, xid, packet) {
                    break;
                }
            }
            Packet::SubReply { xid, .. } => {
                if !deliver_reply(&inner, ReplyTable::Sub, xid, packet) {
                    break;
                }
            }
            Packet::QuenchReply { xid, .. } => {
                if !deliver_reply(&inner, ReplyTable::Quench, xid, packet) {
                    break;
                }
            }
            Packet::Nack { xid, .. } => {
                if !deliver_nack(&inner, xid, packet) {
                    break;
                }
            }
            Packet::NotifyDeliver {
                sub_ids_secure,
                sub_ids_insecure,
                name_value,
            } => {
                inner.route_deliveries(&sub_ids_secure, &sub_ids_insecure, name_value);
            }
            Packet::SubAddNotify {
                quench_id,
                term_id,
                sub_expr,
            } => {
                inner.route_quench_event(
                    quench_id,
                    QuenchNotification::Add { term_id, sub_expr },
                );
            }
            Packet::SubModNotify {
                quench_id,
                term_id,
                sub_expr,
            } => {
                inner.route_quench_event(
                    quench_id,
                    QuenchNotification::Modify { term_id, sub_expr },
                );
            }
            Packet::SubDelNotify { quench_id, term_id } => {
                inner.route_quench_event(quench_id, QuenchNotification::Delete { term_id });
            }
            Packet::Disconn { reason, args } => {
                tracing::info!(reason, %args, "router disconnected us");
                event = Some(DisconnEvent { reason, args });
                break;
            }
            // Keep-alive probe: answer directly so liveness needs no help
            // from the application.
            Packet::TestConn => {
                let _ = out_tx.try_send(Packet::ConfConn.encode());
            }
            Packet::ConfConn => {}
            other => {
                tracing::warn!(packet = ?other, "illegal packet from router");
                event = Some(DisconnEvent::local());
                break;
            }
        }
    }
    let _ = cancel_tx.send(true);
    inner.on_session_closed(event).await;
}

// Complete the rendezvous registered under this XID. A reply for an
// unknown XID is a late reply and is discarded, except during the
// handshake where the connect rendezvous must see every reply so the
// caller can verify the echo. Returns false when the session must die.
fn deliver_reply(inner: &ClientInner, table: ReplyTable, xid: u32, packet: Packet) -> bool {
    if let Some(tx) = inner.take_rendezvous(table, xid) {
        let _ = tx.send(packet);
        return true;
    }
    if inner.state() == ClientState::Connecting {
        if let Some(tx) = inner.take_handshake_rendezvous() {
            let _ = tx.send(packet);
            return true;
        }
        tracing::warn!(xid, "reply with no pending handshake");
        return false;
    }
    metrics::counter!("syrinx_client_late_replies_total").increment(1);
    tracing::debug!(xid, "late reply discarded");
    true
}

// A Nack correlates only by XID, so try every table.
fn deliver_nack(inner: &ClientInner, xid: u32, packet: Packet) -> bool {
    for table in [ReplyTable::Conn, ReplyTable::Sub, ReplyTable::Quench] {
        if let Some(tx) = inner.take_rendezvous(table, xid) {
            let _ = tx.send(packet);
            return true;
        }
    }
    if inner.state() == ClientState::Connecting {
        if let Some(tx) = inner.take_handshake_rendezvous() {
            let _ = tx.send(packet);
            return true;
        }
    }
    metrics::counter!("syrinx_client_late_replies_total").increment(1);
    tracing::debug!(xid, "unmatched nack discarded");
    true
}

impl DisconnEvent {
    /// Synthetic event for a transport-level loss.
    pub(crate) fn local() -> Self {
        Self {
            reason: disconn::REASON_LOCAL,
            args: String::new(),
        }
    }
}
