// Owner-visible subscription and quench handles. Each carries the bounded
// channel its deliveries arrive on; the client's reader task feeds it by
// server-assigned id.
use std::collections::BTreeSet;

use syrinx_wire::{Keyset, NameValue, SubAst};
use tokio::sync::mpsc;

/// An active subscription. Deliveries arrive on `next()`; if the owner
/// falls behind, deliveries are dropped, not buffered without bound.
#[derive(Debug)]
pub struct Subscription {
    pub(crate) sub_id: u64,
    pub(crate) expression: String,
    pub(crate) accept_insecure: bool,
    pub(crate) keys: Vec<Keyset>,
    pub(crate) notifications: mpsc::Receiver<NameValue>,
}

impl Subscription {
    /// Server-assigned subscription id.
    pub fn id(&self) -> u64 {
        self.sub_id
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn accept_insecure(&self) -> bool {
        self.accept_insecure
    }

    pub fn keys(&self) -> &[Keyset] {
        &self.keys
    }

    /// Next delivered notification. Returns `None` once the subscription
    /// has been deleted or the client torn down.
    pub async fn next(&mut self) -> Option<NameValue> {
        self.notifications.recv().await
    }

    pub fn try_next(&mut self) -> Option<NameValue> {
        self.notifications.try_recv().ok()
    }
}

/// A subscription-set change observed by a quenching producer.
#[derive(Debug, Clone, PartialEq)]
pub enum QuenchNotification {
    Add { term_id: u64, sub_expr: SubAst },
    Modify { term_id: u64, sub_expr: SubAst },
    Delete { term_id: u64 },
}

/// An active quench over a set of attribute names.
#[derive(Debug)]
pub struct Quench {
    pub(crate) quench_id: u64,
    pub(crate) names: BTreeSet<String>,
    pub(crate) deliver_insecure: bool,
    pub(crate) keys: Vec<Keyset>,
    pub(crate) notifications: mpsc::Receiver<QuenchNotification>,
}

impl Quench {
    /// Server-assigned quench id.
    pub fn id(&self) -> u64 {
        self.quench_id
    }

    pub fn names(&self) -> &BTreeSet<String> {
        &self.names
    }

    pub fn deliver_insecure(&self) -> bool {
        self.deliver_insecure
    }

    pub fn keys(&self) -> &[Keyset] {
        &self.keys
    }

    pub async fn next(&mut self) -> Option<QuenchNotification> {
        self.notifications.recv().await
    }

    pub fn try_next(&mut self) -> Option<QuenchNotification> {
        self.notifications.try_recv().ok()
    }
}
