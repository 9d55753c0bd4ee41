// Router-side state: the session table, the subscription table, and the
// quench table. Records reference their owning session by id, never by
// pointer; mutation replaces the shared record so the dispatch path can
// evaluate snapshots without holding any lock.
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};

use syrinx_wire::{merge_keysets, Keyset, SubAst};

use crate::matcher::{self, SubMutation};

// Outbound queue depth per session; senders block when it fills, which is
// the backpressure path for publishers.
pub(crate) const WRITE_QUEUE_DEPTH: usize = 4;

#[derive(Debug, Clone)]
pub(crate) struct SessionHandle {
    pub(crate) session_id: u64,
    pub(crate) peer: SocketAddr,
    pub(crate) out: mpsc::Sender<Bytes>,
    pub(crate) cancel: watch::Sender<bool>,
}

#[derive(Debug)]
pub(crate) struct SubRecord {
    pub(crate) sub_id: u64,
    // Stable for the lifetime of the subscription, across modifications.
    pub(crate) term_id: u64,
    pub(crate) owner: u64,
    pub(crate) expression: String,
    pub(crate) ast: SubAst,
    pub(crate) names: BTreeSet<String>,
    pub(crate) accept_insecure: bool,
    pub(crate) keys: Vec<Keyset>,
}

#[derive(Debug)]
pub(crate) struct QuenchRecord {
    pub(crate) quench_id: u64,
    pub(crate) owner: u64,
    pub(crate) names: BTreeSet<String>,
    pub(crate) deliver_insecure: bool,
    pub(crate) keys: Vec<Keyset>,
}

pub(crate) struct RouterCore {
    next_session_id: AtomicU64,
    next_sub_id: AtomicU64,
    next_term_id: AtomicU64,
    next_quench_id: AtomicU64,
    // Accepted sockets, including those still in handshake; the accept loop
    // uses this for the max-connections cap.
    pub(crate) connections: AtomicUsize,
    pub(crate) sessions: RwLock<HashMap<u64, SessionHandle>>,
    pub(crate) subscriptions: RwLock<HashMap<u64, Arc<SubRecord>>>,
    pub(crate) quenches: RwLock<HashMap<u64, Arc<QuenchRecord>>>,
}

impl RouterCore {
    pub(crate) fn new() -> Self {
        Self {
            next_session_id: AtomicU64::new(1),
            next_sub_id: AtomicU64::new(1),
            next_term_id: AtomicU64::new(1),
            next_quench_id: AtomicU64::new(1),
            connections: AtomicUsize::new(0),
            sessions: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            quenches: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) async fn register_session(
        &self,
        peer: SocketAddr,
        out: mpsc::Sender<Bytes>,
        cancel: watch::Sender<bool>,
    ) -> u64 {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let handle = SessionHandle {
            session_id,
            peer,
            out,
            cancel,
        };
        self.sessions.write().await.insert(session_id, handle);
        metrics::counter!("syrinx_router_sessions_opened_total").increment(1);
        tracing::info!(session_id, %peer, "session connected");
        session_id
    }

    pub(crate) async fn session_out(&self, session_id: u64) -> Option<mpsc::Sender<Bytes>> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .map(|handle| handle.out.clone())
    }

    pub(crate) async fn add_subscription(
        &self,
        owner: u64,
        expression: String,
        ast: SubAst,
        names: BTreeSet<String>,
        accept_insecure: bool,
        keys: Vec<Keyset>,
    ) -> Arc<SubRecord> {
        let sub_id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let term_id = self.next_term_id.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(SubRecord {
            sub_id,
            term_id,
            owner,
            expression,
            ast,
            names,
            accept_insecure,
            keys,
        });
        self.subscriptions
            .write()
            .await
            .insert(sub_id, Arc::clone(&record));
        record
    }

    /// Replace a subscription record. `expression` carries the re-parsed
    /// tree when the request changed it; `None` keeps the current one.
    /// Returns `None` when the id is unknown or owned by another session.
    pub(crate) async fn modify_subscription(
        &self,
        owner: u64,
        sub_id: u64,
        expression: Option<(String, SubAst, BTreeSet<String>)>,
        accept_insecure: bool,
        add_keys: &[Keyset],
        del_keys: &[Keyset],
    ) -> Option<Arc<SubRecord>> {
        let mut subscriptions = self.subscriptions.write().await;
        let current = subscriptions.get(&sub_id)?;
        if current.owner != owner {
            return None;
        }
        let (expression, ast, names) = match expression {
            Some(parts) => parts,
            None => (
                current.expression.clone(),
                current.ast.clone(),
                current.names.clone(),
            ),
        };
        let record = Arc::new(SubRecord {
            sub_id,
            term_id: current.term_id,
            owner,
            expression,
            ast,
            names,
            accept_insecure,
            keys: merge_keysets(&current.keys, add_keys, del_keys),
        });
        subscriptions.insert(sub_id, Arc::clone(&record));
        Some(record)
    }

    pub(crate) async fn delete_subscription(
        &self,
        owner: u64,
        sub_id: u64,
    ) -> Option<Arc<SubRecord>> {
        let mut subscriptions = self.subscriptions.write().await;
        if subscriptions.get(&sub_id)?.owner != owner {
            return None;
        }
        subscriptions.remove(&sub_id)
    }

    pub(crate) async fn add_quench(
        &self,
        owner: u64,
        names: BTreeSet<String>,
        deliver_insecure: bool,
        keys: Vec<Keyset>,
    ) -> Arc<QuenchRecord> {
        let quench_id = self.next_quench_id.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(QuenchRecord {
            quench_id,
            owner,
            names,
            deliver_insecure,
            keys,
        });
        self.quenches
            .write()
            .await
            .insert(quench_id, Arc::clone(&record));
        record
    }

    pub(crate) async fn modify_quench(
        &self,
        owner: u64,
        quench_id: u64,
        add_names: &[String],
        del_names: &[String],
        deliver_insecure: bool,
        add_keys: &[Keyset],
        del_keys: &[Keyset],
    ) -> Option<Arc<QuenchRecord>> {
        let mut quenches = self.quenches.write().await;
        let current = quenches.get(&quench_id)?;
        if current.owner != owner {
            return None;
        }
        let mut names = current.names.clone();
        for name in add_names {
            names.insert(name.clone());
        }
        for name in del_names {
            names.remove(name);
        }
        let record = Arc::new(QuenchRecord {
            quench_id,
            owner,
            names,
            deliver_insecure,
            keys: merge_keysets(&current.keys, add_keys, del_keys),
        });
        quenches.insert(quench_id, Arc::clone(&record));
        Some(record)
    }

    pub(crate) async fn delete_quench(
        &self,
        owner: u64,
        quench_id: u64,
    ) -> Option<Arc<QuenchRecord>> {
        let mut quenches = self.quenches.write().await;
        if quenches.get(&quench_id)?.owner != owner {
            return None;
        }
        quenches.remove(&quench_id)
    }

    /// Remove a dead session and everything it owned. Two passes: collect
    /// the owned records under the write lock, then notify quenchers
    /// outside it. Idempotent.
    pub(crate) async fn reap_session(self: &Arc<Self>, session_id: u64) {
        let known = self.sessions.write().await.remove(&session_id).is_some();
        let owned_subs: Vec<Arc<SubRecord>> = {
            let mut subscriptions = self.subscriptions.write().await;
            let ids: Vec<u64> = subscriptions
                .values()
                .filter(|record| record.owner == session_id)
                .map(|record| record.sub_id)
                .collect();
            ids.into_iter()
                .filter_map(|sub_id| subscriptions.remove(&sub_id))
                .collect()
        };
        for record in &owned_subs {
            matcher::notify_quenches(self, SubMutation::Deleted(record)).await;
        }
        self.quenches
            .write()
            .await
            .retain(|_, record| record.owner != session_id);
        if known {
            metrics::counter!("syrinx_router_sessions_reaped_total").increment(1);
            tracing::info!(
                session_id,
                reaped_subscriptions = owned_subs.len(),
                "session reaped"
            );
        }
    }

    pub(crate) async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub(crate) async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    pub(crate) async fn quench_count(&self) -> usize {
        self.quenches.read().await.len()
    }
}
