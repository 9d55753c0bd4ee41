// The client proper: connection state machine, transaction correlator, and
// the operation surface (connect/disconnect, notify, subscription and
// quench lifecycles).
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use syrinx_wire::{
    merge_keysets, Keyset, NameValue, Packet, PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR,
};

use crate::config::ClientOptions;
use crate::session::{self, Session};
use crate::subscription::{Quench, QuenchNotification, Subscription};
use crate::{ClientError, Result};

const DISCONN_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientState {
    Closed = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

impl ClientState {
    fn from_u32(value: u32) -> Self {
        match value {
            1 => ClientState::Connecting,
            2 => ClientState::Connected,
            3 => ClientState::Disconnecting,
            _ => ClientState::Closed,
        }
    }
}

/// A disconnection observed on the session: either a server-initiated
/// Disconn (redirect, idle timeout, shutdown) or a transport loss
/// (`reason == disconn::REASON_LOCAL`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnEvent {
    pub reason: u32,
    pub args: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyTable {
    Conn,
    Sub,
    Quench,
}

#[derive(Default)]
struct Tables {
    conn_replies: HashMap<u32, oneshot::Sender<Packet>>,
    sub_replies: HashMap<u32, oneshot::Sender<Packet>>,
    quench_replies: HashMap<u32, oneshot::Sender<Packet>>,
    subscriptions: HashMap<u64, mpsc::Sender<NameValue>>,
    quenches: HashMap<u64, mpsc::Sender<QuenchNotification>>,
}

impl Tables {
    fn reply_map(&mut self, table: ReplyTable) -> &mut HashMap<u32, oneshot::Sender<Packet>> {
        match table {
            ReplyTable::Conn => &mut self.conn_replies,
            ReplyTable::Sub => &mut self.sub_replies,
            ReplyTable::Quench => &mut self.quench_replies,
        }
    }

    fn contains_xid(&self, xid: u32) -> bool {
        self.conn_replies.contains_key(&xid)
            || self.sub_replies.contains_key(&xid)
            || self.quench_replies.contains_key(&xid)
    }

    fn pending(&self) -> usize {
        self.conn_replies.len() + self.sub_replies.len() + self.quench_replies.len()
    }
}

pub(crate) struct ClientInner {
    endpoint: String,
    conn_options: NameValue,
    keys_nfn: Vec<Keyset>,
    keys_sub: Vec<Keyset>,
    options: ClientOptions,
    state: AtomicU32,
    next_xid: AtomicU32,
    session: Mutex<Option<Session>>,
    tables: StdMutex<Tables>,
    disconn_tx: mpsc::Sender<DisconnEvent>,
}

impl ClientInner {
    pub(crate) fn state(&self) -> ClientState {
        ClientState::from_u32(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ClientState) {
        self.state.store(state as u32, Ordering::Release);
    }

    fn transition(&self, from: ClientState, to: ClientState) -> bool {
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // Allocate a fresh XID and park a rendezvous under it. XIDs are never
    // zero and never collide with an in-flight request, wraparound
    // included; both properties are enforced under the table lock.
    fn register_rendezvous(&self, table: ReplyTable) -> (u32, oneshot::Receiver<Packet>) {
        let mut tables = self.tables.lock().expect("tables lock");
        loop {
            let xid = self.next_xid.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if xid == 0 || tables.contains_xid(xid) {
                continue;
            }
            let (tx, rx) = oneshot::channel();
            tables.reply_map(table).insert(xid, tx);
            return (xid, rx);
        }
    }

    fn remove_rendezvous(&self, table: ReplyTable, xid: u32) {
        self.tables
            .lock()
            .expect("tables lock")
            .reply_map(table)
            .remove(&xid);
    }

    pub(crate) fn take_rendezvous(
        &self,
        table: ReplyTable,
        xid: u32,
    ) -> Option<oneshot::Sender<Packet>> {
        self.tables
            .lock()
            .expect("tables lock")
            .reply_map(table)
            .remove(&xid)
    }

    // During the handshake exactly one request can be outstanding, and the
    // caller must see every reply to verify the echoed XID itself. Hand
    // back that single rendezvous whatever XID the reply carried.
    pub(crate) fn take_handshake_rendezvous(&self) -> Option<oneshot::Sender<Packet>> {
        let mut tables = self.tables.lock().expect("tables lock");
        let xid = tables.conn_replies.keys().next().copied()?;
        tables.conn_replies.remove(&xid)
    }

    fn fail_pending(&self) {
        let mut tables = self.tables.lock().expect("tables lock");
        // Dropping the senders completes every parked rendezvous with a
        // ConnectionLost failure on the caller side.
        tables.conn_replies.clear();
        tables.sub_replies.clear();
        tables.quench_replies.clear();
    }

    pub(crate) fn route_deliveries(
        &self,
        sub_ids_secure: &[u64],
        sub_ids_insecure: &[u64],
        name_value: NameValue,
    ) {
        let mut tables = self.tables.lock().expect("tables lock");
        for sub_id in sub_ids_secure.iter().chain(sub_ids_insecure) {
            match tables.subscriptions.get(sub_id) {
                Some(tx) => match tx.try_send(name_value.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Lossy by design: a slow subscriber loses
                        // notifications, not the session.
                        metrics::counter!("syrinx_client_deliveries_dropped_total")
                            .increment(1);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        tables.subscriptions.remove(sub_id);
                    }
                },
                None => {
                    metrics::counter!("syrinx_client_deliveries_dropped_total").increment(1);
                    tracing::debug!(sub_id, "delivery for unknown subscription");
                }
            }
        }
    }

    pub(crate) fn route_quench_event(&self, quench_id: u64, event: QuenchNotification) {
        let mut tables = self.tables.lock().expect("tables lock");
        match tables.quenches.get(&quench_id) {
            Some(tx) => match tx.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    metrics::counter!("syrinx_client_deliveries_dropped_total").increment(1);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tables.quenches.remove(&quench_id);
                }
            },
            None => {
                metrics::counter!("syrinx_client_deliveries_dropped_total").increment(1);
                tracing::debug!(quench_id, "event for unknown quench");
            }
        }
    }

    // Reader-side teardown: runs as the reader task exits, so it must not
    // join the session tasks. Deliberate disconnects pass `None` and leave
    // the final state change to `teardown`.
    pub(crate) async fn on_session_closed(&self, event: Option<DisconnEvent>) {
        let _session = self.session.lock().await.take();
        self.fail_pending();
        if self.transition(ClientState::Connected, ClientState::Closed)
            || self.transition(ClientState::Connecting, ClientState::Closed)
        {
            if let Some(event) = event {
                let _ = self.disconn_tx.try_send(event);
            }
        }
    }

    // Full teardown for deliberate paths: cancel both tasks, wait for them,
    // fail whatever is still parked.
    async fn teardown(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            self.set_state(ClientState::Disconnecting);
            let _ = session.cancel.send(true);
            drop(session.out);
            let _ = session.reader.await;
            let _ = session.writer.await;
        }
        self.fail_pending();
        self.set_state(ClientState::Closed);
    }

    async fn send_packet(&self, packet: &Packet) -> Result<()> {
        let out = {
            let session = self.session.lock().await;
            match session.as_ref() {
                Some(session) => session.out.clone(),
                None => return Err(ClientError::NotConnected),
            }
        };
        out.send(packet.encode())
            .await
            .map_err(|_| ClientError::ConnectionLost)
    }

    // Send-and-await: allocate an XID, park, enqueue, then race the reply
    // against the deadline. The table entry is removed exactly once: by
    // the reader on reply, or here on timeout / send failure.
    async fn request(
        &self,
        table: ReplyTable,
        build: impl FnOnce(u32) -> Packet,
        timeout: Duration,
    ) -> Result<Packet> {
        let (xid, rx) = self.register_rendezvous(table);
        let packet = build(xid);
        if let Err(err) = self.send_packet(&packet).await {
            self.remove_rendezvous(table, xid);
            return Err(err);
        }
        let reply = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(ClientError::ConnectionLost),
            Err(_) => {
                self.remove_rendezvous(table, xid);
                return Err(ClientError::Timeout);
            }
        };
        if reply.xid() != Some(xid) {
            return Err(ClientError::ProtocolViolation(format!(
                "mismatched transaction id: expected {xid}, received {:?}",
                reply.xid()
            )));
        }
        Ok(reply)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.state() != ClientState::Connected {
            return Err(ClientError::NotConnected);
        }
        Ok(())
    }
}

/// A client of a syrinx router.
pub struct Client {
    inner: Arc<ClientInner>,
    disconn_rx: Mutex<mpsc::Receiver<DisconnEvent>>,
}

impl Client {
    /// Create a client for `endpoint` (`host:port`). Connection options
    /// and default key material ride on every handshake.
    pub fn new(
        endpoint: impl Into<String>,
        conn_options: NameValue,
        keys_nfn: Vec<Keyset>,
        keys_sub: Vec<Keyset>,
    ) -> Self {
        Self::with_options(
            endpoint,
            conn_options,
            keys_nfn,
            keys_sub,
            ClientOptions::default(),
        )
    }

    pub fn with_options(
        endpoint: impl Into<String>,
        conn_options: NameValue,
        keys_nfn: Vec<Keyset>,
        keys_sub: Vec<Keyset>,
        options: ClientOptions,
    ) -> Self {
        let (disconn_tx, disconn_rx) = mpsc::channel(DISCONN_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ClientInner {
                endpoint: endpoint.into(),
                conn_options,
                keys_nfn,
                keys_sub,
                options,
                state: AtomicU32::new(ClientState::Closed as u32),
                next_xid: AtomicU32::new(0),
                session: Mutex::new(None),
                tables: StdMutex::new(Tables::default()),
                disconn_tx,
            }),
            disconn_rx: Mutex::new(disconn_rx),
        }
    }

    /// Dial the endpoint and run the handshake. On a Nack the session is
    /// closed again and the failure returned; nothing is retried.
    pub async fn connect(&self) -> Result<()> {
        if !self
            .inner
            .transition(ClientState::Closed, ClientState::Connecting)
        {
            return Err(ClientError::AlreadyConnected);
        }
        let stream = match TcpStream::connect(&self.inner.endpoint).await {
            Ok(stream) => stream,
            Err(err) => {
                self.inner.set_state(ClientState::Closed);
                return Err(err.into());
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(error = %err, "set_nodelay failed");
        }
        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::channel(self.inner.options.write_queue_depth);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let reader = tokio::spawn(session::run_reader(
            Arc::clone(&self.inner),
            read_half,
            cancel_tx.clone(),
            cancel_rx.clone(),
            out_tx.clone(),
            self.inner.options.max_frame_bytes,
        ));
        let writer = tokio::spawn(session::run_writer(
            write_half,
            out_rx,
            cancel_tx.clone(),
            cancel_rx,
        ));
        *self.inner.session.lock().await = Some(Session {
            out: out_tx,
            cancel: cancel_tx,
            reader,
            writer,
        });

        let inner = &self.inner;
        let result = inner
            .request(
                ReplyTable::Conn,
                |xid| Packet::ConnRequest {
                    xid,
                    version_major: PROTOCOL_VERSION_MAJOR,
                    version_minor: PROTOCOL_VERSION_MINOR,
                    options: inner.conn_options.clone(),
                    keys_nfn: inner.keys_nfn.clone(),
                    keys_sub: inner.keys_sub.clone(),
                },
                inner.options.connect_timeout,
            )
            .await;
        match result {
            Ok(Packet::ConnReply { .. }) => {
                // The session may have died between the reply and now; only
                // a live handshake may promote to Connected.
                if !self
                    .inner
                    .transition(ClientState::Connecting, ClientState::Connected)
                {
                    self.inner.teardown().await;
                    return Err(ClientError::ConnectionLost);
                }
                tracing::debug!(endpoint = %self.inner.endpoint, "connected");
                Ok(())
            }
            Ok(Packet::Nack { code, message, .. }) => {
                self.inner.teardown().await;
                Err(ClientError::Nack { code, message })
            }
            Ok(other) => {
                self.inner.teardown().await;
                Err(ClientError::ProtocolViolation(format!(
                    "unexpected handshake reply {other:?}"
                )))
            }
            Err(err) => {
                self.inner.teardown().await;
                Err(err)
            }
        }
    }

    /// Orderly disconnect. On timeout the connection is closed anyway and
    /// the error reported.
    pub async fn disconnect(&self) -> Result<()> {
        if !self
            .inner
            .transition(ClientState::Connected, ClientState::Disconnecting)
        {
            return Err(ClientError::NotConnected);
        }
        let result = self
            .inner
            .request(
                ReplyTable::Conn,
                |xid| Packet::DisconnRequest { xid },
                self.inner.options.disconnect_timeout,
            )
            .await;
        self.inner.teardown().await;
        match result {
            Ok(Packet::DisconnReply { .. }) => Ok(()),
            Ok(Packet::Nack { code, message, .. }) => Err(ClientError::Nack { code, message }),
            Ok(other) => Err(ClientError::ProtocolViolation(format!(
                "unexpected disconnect reply {other:?}"
            ))),
            Err(err) => Err(err),
        }
    }

    /// Emit a notification. No reply is expected; a full write queue
    /// backpressures the caller.
    pub async fn notify(
        &self,
        name_value: NameValue,
        deliver_insecure: bool,
        keys: Vec<Keyset>,
    ) -> Result<()> {
        self.inner.ensure_connected()?;
        self.inner
            .send_packet(&Packet::NotifyEmit {
                name_value,
                deliver_insecure,
                keys,
            })
            .await
    }

    /// Register a subscription and return its handle.
    pub async fn subscribe(
        &self,
        expression: impl Into<String>,
        accept_insecure: bool,
        keys: Vec<Keyset>,
    ) -> Result<Subscription> {
        self.inner.ensure_connected()?;
        let expression = expression.into();
        let reply = self
            .inner
            .request(
                ReplyTable::Sub,
                |xid| Packet::SubAddRequest {
                    xid,
                    expression: expression.clone(),
                    accept_insecure,
                    keys: keys.clone(),
                },
                self.inner.options.subscription_timeout,
            )
            .await?;
        match reply {
            Packet::SubReply { sub_id, .. } => {
                let (tx, rx) = mpsc::channel(self.inner.options.notification_queue_capacity);
                self.inner
                    .tables
                    .lock()
                    .expect("tables lock")
                    .subscriptions
                    .insert(sub_id, tx);
                tracing::debug!(sub_id, "subscribed");
                Ok(Subscription {
                    sub_id,
                    expression,
                    accept_insecure,
                    keys,
                    notifications: rx,
                })
            }
            Packet::Nack { code, message, .. } => Err(ClientError::Nack { code, message }),
            other => Err(ClientError::ProtocolViolation(format!(
                "unexpected subscribe reply {other:?}"
            ))),
        }
    }

    /// Modify a subscription. An empty expression leaves the current one
    /// in place; added keys that already exist and deleted keys that do
    /// not are fine.
    pub async fn subscription_modify(
        &self,
        sub: &mut Subscription,
        expression: &str,
        accept_insecure: bool,
        add_keys: Vec<Keyset>,
        del_keys: Vec<Keyset>,
    ) -> Result<()> {
        self.inner.ensure_connected()?;
        let sub_id = sub.sub_id;
        let reply = self
            .inner
            .request(
                ReplyTable::Sub,
                |xid| Packet::SubModRequest {
                    xid,
                    sub_id,
                    expression: expression.to_string(),
                    accept_insecure,
                    add_keys: add_keys.clone(),
                    del_keys: del_keys.clone(),
                },
                self.inner.options.subscription_timeout,
            )
            .await?;
        match reply {
            Packet::SubReply { sub_id: replied, .. } => {
                if replied != sub_id {
                    tracing::warn!(sub_id, replied, "subscription id mismatch in reply");
                }
                if !expression.is_empty() {
                    sub.expression = expression.to_string();
                }
                sub.accept_insecure = accept_insecure;
                sub.keys = merge_keysets(&sub.keys, &add_keys, &del_keys);
                Ok(())
            }
            Packet::Nack { code, message, .. } => Err(ClientError::Nack { code, message }),
            other => Err(ClientError::ProtocolViolation(format!(
                "unexpected modify reply {other:?}"
            ))),
        }
    }

    /// Delete a subscription, consuming its handle.
    pub async fn subscription_delete(&self, sub: Subscription) -> Result<()> {
        self.inner.ensure_connected()?;
        let sub_id = sub.sub_id;
        let result = self
            .inner
            .request(
                ReplyTable::Sub,
                |xid| Packet::SubDelRequest { xid, sub_id },
                self.inner.options.subscription_timeout,
            )
            .await;
        // The handle is gone either way; stop routing to it.
        self.inner
            .tables
            .lock()
            .expect("tables lock")
            .subscriptions
            .remove(&sub_id);
        match result? {
            Packet::SubReply { sub_id: replied, .. } => {
                if replied != sub_id {
                    tracing::warn!(sub_id, replied, "subscription id mismatch in reply");
                }
                Ok(())
            }
            Packet::Nack { code, message, .. } => Err(ClientError::Nack { code, message }),
            other => Err(ClientError::ProtocolViolation(format!(
                "unexpected delete reply {other:?}"
            ))),
        }
    }

    /// Register a quench over a set of attribute names.
    pub async fn quench(
        &self,
        names: BTreeSet<String>,
        deliver_insecure: bool,
        keys: Vec<Keyset>,
    ) -> Result<Quench> {
        self.inner.ensure_connected()?;
        let reply = self
            .inner
            .request(
                ReplyTable::Quench,
                |xid| Packet::QuenchAddRequest {
                    xid,
                    names: names.iter().cloned().collect(),
                    deliver_insecure,
                    keys: keys.clone(),
                },
                self.inner.options.quench_timeout,
            )
            .await?;
        match reply {
            Packet::QuenchReply { quench_id, .. } => {
                let (tx, rx) = mpsc::channel(self.inner.options.notification_queue_capacity);
                self.inner
                    .tables
                    .lock()
                    .expect("tables lock")
                    .quenches
                    .insert(quench_id, tx);
                tracing::debug!(quench_id, "quenching");
                Ok(Quench {
                    quench_id,
                    names,
                    deliver_insecure,
                    keys,
                    notifications: rx,
                })
            }
            Packet::Nack { code, message, .. } => Err(ClientError::Nack { code, message }),
            other => Err(ClientError::ProtocolViolation(format!(
                "unexpected quench reply {other:?}"
            ))),
        }
    }

    /// Modify a quench's name set, insecure flag, and keys.
    pub async fn quench_modify(
        &self,
        quench: &mut Quench,
        add_names: BTreeSet<String>,
        del_names: BTreeSet<String>,
        deliver_insecure: bool,
        add_keys: Vec<Keyset>,
        del_keys: Vec<Keyset>,
    ) -> Result<()> {
        self.inner.ensure_connected()?;
        let quench_id = quench.quench_id;
        let reply = self
            .inner
            .request(
                ReplyTable::Quench,
                |xid| Packet::QuenchModRequest {
                    xid,
                    quench_id,
                    add_names: add_names.iter().cloned().collect(),
                    del_names: del_names.iter().cloned().collect(),
                    deliver_insecure,
                    add_keys: add_keys.clone(),
                    del_keys: del_keys.clone(),
                },
                self.inner.options.quench_timeout,
            )
            .await?;
        match reply {
            Packet::QuenchReply {
                quench_id: replied, ..
            } => {
                if replied != quench_id {
                    tracing::warn!(quench_id, replied, "quench id mismatch in reply");
                }
                for name in add_names {
                    quench.names.insert(name);
                }
                for name in &del_names {
                    quench.names.remove(name);
                }
                quench.deliver_insecure = deliver_insecure;
                quench.keys = merge_keysets(&quench.keys, &add_keys, &del_keys);
                Ok(())
            }
            Packet::Nack { code, message, .. } => Err(ClientError::Nack { code, message }),
            other => Err(ClientError::ProtocolViolation(format!(
                "unexpected quench modify reply {other:?}"
            ))),
        }
    }

    /// Delete a quench, consuming its handle.
    pub async fn quench_delete(&self, quench: Quench) -> Result<()> {
        self.inner.ensure_connected()?;
        let quench_id = quench.quench_id;
        let result = self
            .inner
            .request(
                ReplyTable::Quench,
                |xid| Packet::QuenchDelRequest { xid, quench_id },
                self.inner.options.quench_timeout,
            )
            .await;
        self.inner
            .tables
            .lock()
            .expect("tables lock")
            .quenches
            .remove(&quench_id);
        match result? {
            Packet::QuenchReply { .. } => Ok(()),
            Packet::Nack { code, message, .. } => Err(ClientError::Nack { code, message }),
            other => Err(ClientError::ProtocolViolation(format!(
                "unexpected quench delete reply {other:?}"
            ))),
        }
    }

    /// Receive the next disconnection event. Redirects arrive here; the
    /// application decides whether and where to reconnect.
    pub async fn next_disconn(&self) -> Option<DisconnEvent> {
        self.disconn_rx.lock().await.recv().await
    }

    /// Number of requests currently awaiting a reply. Zero whenever the
    /// client is idle or freshly disconnected.
    pub fn pending_requests(&self) -> usize {
        self.inner.tables.lock().expect("tables lock").pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_inner() -> Arc<ClientInner> {
        let (disconn_tx, _disconn_rx) = mpsc::channel(DISCONN_CHANNEL_CAPACITY);
        Arc::new(ClientInner {
            endpoint: "127.0.0.1:2917".into(),
            conn_options: NameValue::new(),
            keys_nfn: vec![],
            keys_sub: vec![],
            options: ClientOptions::default(),
            state: AtomicU32::new(ClientState::Closed as u32),
            next_xid: AtomicU32::new(0),
            session: Mutex::new(None),
            tables: StdMutex::new(Tables::default()),
            disconn_tx,
        })
    }

    #[test]
    fn xids_are_monotonic_and_never_zero() {
        let inner = bare_inner();
        let (first, _rx1) = inner.register_rendezvous(ReplyTable::Conn);
        let (second, _rx2) = inner.register_rendezvous(ReplyTable::Sub);
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[test]
    fn xid_wraparound_skips_zero_and_in_flight_entries() {
        let inner = bare_inner();
        let (one, _rx) = inner.register_rendezvous(ReplyTable::Sub);
        assert_eq!(one, 1);
        // Force the counter to wrap: the next candidates are 0 (never
        // legal) and 1 (still in flight), so 2 is allocated.
        inner.next_xid.store(u32::MAX, Ordering::Relaxed);
        let (next, _rx) = inner.register_rendezvous(ReplyTable::Sub);
        assert_eq!(next, 2);
    }

    #[test]
    fn rendezvous_entries_are_removed_exactly_once() {
        let inner = bare_inner();
        let (xid, _rx) = inner.register_rendezvous(ReplyTable::Quench);
        assert!(inner.take_rendezvous(ReplyTable::Quench, xid).is_some());
        assert!(inner.take_rendezvous(ReplyTable::Quench, xid).is_none());
    }

    #[test]
    fn fail_pending_completes_receivers_with_error() {
        let inner = bare_inner();
        let (_xid, mut rx) = inner.register_rendezvous(ReplyTable::Conn);
        inner.fail_pending();
        assert!(rx.try_recv().is_err());
        assert_eq!(inner.tables.lock().expect("tables lock").pending(), 0);
    }

    #[tokio::test]
    async fn full_delivery_queue_drops_but_keeps_entry() {
        let inner = bare_inner();
        let (tx, mut rx) = mpsc::channel(1);
        inner
            .tables
            .lock()
            .expect("tables lock")
            .subscriptions
            .insert(7, tx);
        let nv = NameValue::new();
        inner.route_deliveries(&[7], &[], nv.clone());
        inner.route_deliveries(&[7], &[], nv.clone());
        // First delivery queued, second dropped.
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
        assert!(inner
            .tables
            .lock()
            .expect("tables lock")
            .subscriptions
            .contains_key(&7));
    }

    #[test]
    fn operations_require_a_connection() {
        let inner = bare_inner();
        assert!(matches!(
            inner.ensure_connected(),
            Err(ClientError::NotConnected)
        ));
    }
}
