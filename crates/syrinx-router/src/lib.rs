//! Content-based publish/subscribe router.
//!
//! # Purpose
//! Accepts client sessions over TCP, matches emitted notifications against
//! the live subscription set, and tells quenching producers when the
//! subscription set changes.
//!
//! # Design notes
//! All state is in memory. Sessions, subscriptions, and quenches reference
//! each other by id through the core tables; the dispatch path works on
//! snapshots so expression evaluation never runs under a lock.
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use syrinx_wire::{disconn, write_frame, Packet, DEFAULT_MAX_FRAME_BYTES};

mod core;
mod matcher;
mod session;
pub mod subast;

use crate::core::RouterCore;
use crate::session::SessionConfig;

/// Default listener port.
pub const DEFAULT_PORT: u16 = 2917;

const DEFAULT_MAX_CONNECTIONS: usize = 1024;
const DEFAULT_TEST_CONN_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_TEST_CONN_TIMEOUT: Duration = Duration::from_secs(10);

pub type Result<T> = std::result::Result<T, RouterError>;

#[derive(thiserror::Error, Debug)]
pub enum RouterError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no usable listener protocol configured")]
    NoListeners,
}

/// A listener endpoint: `{network, marshal, address}`. Only `tcp`/`xdr` is
/// served; anything else is skipped with a warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Protocol {
    pub network: String,
    pub marshal: String,
    pub address: String,
}

impl Protocol {
    pub fn tcp_xdr(address: impl Into<String>) -> Self {
        Self {
            network: "tcp".into(),
            marshal: "xdr".into(),
            address: address.into(),
        }
    }
}

/// The router. Configure with the setters, then `start()`.
pub struct Router {
    protocols: BTreeMap<String, Protocol>,
    max_connections: usize,
    do_failover: bool,
    test_conn_interval: Duration,
    test_conn_timeout: Duration,
    failover_protocol: Option<Protocol>,
    max_frame_bytes: usize,
    core: Arc<RouterCore>,
    listeners: Vec<tokio::task::JoinHandle<()>>,
    local_addrs: Vec<SocketAddr>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            protocols: BTreeMap::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            do_failover: false,
            test_conn_interval: DEFAULT_TEST_CONN_INTERVAL,
            test_conn_timeout: DEFAULT_TEST_CONN_TIMEOUT,
            failover_protocol: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            core: Arc::new(RouterCore::new()),
            listeners: Vec::new(),
            local_addrs: Vec::new(),
        }
    }

    pub fn add_protocol(&mut self, address: impl Into<String>, mut protocol: Protocol) {
        let address = address.into();
        protocol.address.clone_from(&address);
        self.protocols.insert(address, protocol);
    }

    /// Hard cap on concurrent connections; 0 means unlimited.
    pub fn set_max_connections(&mut self, max_connections: usize) {
        self.max_connections = max_connections;
    }

    pub fn set_do_failover(&mut self, do_failover: bool) {
        self.do_failover = do_failover;
    }

    pub fn set_test_conn_interval(&mut self, interval: Duration) {
        self.test_conn_interval = interval;
    }

    pub fn set_test_conn_timeout(&mut self, timeout: Duration) {
        self.test_conn_timeout = timeout;
    }

    pub fn set_failover_protocol(&mut self, protocol: Protocol) {
        self.failover_protocol = Some(protocol);
    }

    pub fn set_max_frame_bytes(&mut self, max_frame_bytes: usize) {
        self.max_frame_bytes = max_frame_bytes;
    }

    /// Bind every configured listener and start accepting sessions.
    pub async fn start(&mut self) -> Result<()> {
        let session_config = SessionConfig {
            max_frame_bytes: self.max_frame_bytes,
            test_conn_interval: self.test_conn_interval,
            test_conn_timeout: self.test_conn_timeout,
        };
        let failover_args = self
            .failover_protocol
            .as_ref()
            .map(|protocol| protocol.address.clone())
            .unwrap_or_default();
        for protocol in self.protocols.values() {
            if protocol.network != "tcp" {
                tracing::warn!(
                    network = %protocol.network,
                    "network protocol is unsupported, skipping listener"
                );
                continue;
            }
            if protocol.marshal != "xdr" {
                tracing::warn!(
                    marshal = %protocol.marshal,
                    "marshal protocol is unsupported, skipping listener"
                );
                continue;
            }
            let listener = TcpListener::bind(&protocol.address).await?;
            let local_addr = listener.local_addr()?;
            tracing::info!(
                network = %protocol.network,
                marshal = %protocol.marshal,
                address = %local_addr,
                "listening"
            );
            self.local_addrs.push(local_addr);
            self.listeners.push(tokio::spawn(run_accept_loop(
                Arc::clone(&self.core),
                listener,
                session_config,
                self.max_connections,
                failover_args.clone(),
            )));
        }
        if self.listeners.is_empty() {
            return Err(RouterError::NoListeners);
        }
        Ok(())
    }

    /// Address of the first bound listener; useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addrs.first().copied()
    }

    /// Broadcast a redirect to the failover endpoint to every session.
    pub async fn failover(&self) {
        if !self.do_failover {
            tracing::warn!("failover requested but disabled");
            return;
        }
        let args = self
            .failover_protocol
            .as_ref()
            .map(|protocol| protocol.address.clone())
            .unwrap_or_default();
        let body = Packet::Disconn {
            reason: disconn::REASON_REDIRECT,
            args,
        }
        .encode();
        let outs: Vec<_> = {
            let sessions = self.core.sessions.read().await;
            sessions.values().map(|handle| handle.out.clone()).collect()
        };
        tracing::info!(sessions = outs.len(), "broadcasting failover redirect");
        for out in outs {
            let _ = out.send(body.clone()).await;
        }
    }

    /// Log every connected client.
    pub async fn log_clients(&self) {
        let sessions = self.core.sessions.read().await;
        tracing::info!(count = sessions.len(), "connected clients");
        for handle in sessions.values() {
            tracing::info!(session_id = handle.session_id, peer = %handle.peer, "client");
        }
    }

    /// Stop accepting, tell every client the router is going away, and tear
    /// their sessions down.
    pub async fn shutdown(&mut self) {
        for listener in self.listeners.drain(..) {
            listener.abort();
        }
        let handles: Vec<_> = {
            let sessions = self.core.sessions.read().await;
            sessions.values().cloned().collect()
        };
        let body = Packet::Disconn {
            reason: disconn::REASON_SHUTDOWN,
            args: String::new(),
        }
        .encode();
        for handle in handles {
            let _ = handle.out.send(body.clone()).await;
            let _ = handle.cancel.send(true);
        }
    }

    pub async fn session_count(&self) -> usize {
        self.core.session_count().await
    }

    pub async fn subscription_count(&self) -> usize {
        self.core.subscription_count().await
    }

    pub async fn quench_count(&self) -> usize {
        self.core.quench_count().await
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.abort();
        }
    }
}

async fn run_accept_loop(
    core: Arc<RouterCore>,
    listener: TcpListener,
    config: SessionConfig,
    max_connections: usize,
    failover_args: String,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                continue;
            }
        };
        let active = core.connections.fetch_add(1, Ordering::Relaxed) + 1;
        if max_connections != 0 && active > max_connections {
            core.connections.fetch_sub(1, Ordering::Relaxed);
            metrics::counter!("syrinx_router_connections_refused_total").increment(1);
            tracing::warn!(%peer, "connection refused: at capacity");
            tokio::spawn(refuse_connection(stream, failover_args.clone()));
            continue;
        }
        tracing::debug!(%peer, "connection accepted");
        let core_for_session = Arc::clone(&core);
        tokio::spawn(async move {
            session::run_session(Arc::clone(&core_for_session), config, stream, peer).await;
            core_for_session.connections.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

// Over-capacity accepts get a Disconn naming the failover endpoint (when
// one is configured), then the socket closes.
async fn refuse_connection(mut stream: TcpStream, args: String) {
    let body = Packet::Disconn {
        reason: disconn::REASON_TOO_MANY_CONNECTIONS,
        args,
    }
    .encode();
    let _ = write_frame(&mut stream, &body).await;
}
