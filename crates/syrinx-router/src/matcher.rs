// Matching and dispatch. Notifications are evaluated against a snapshot of
// the subscription table and coalesced into one NotifyDeliver per
// destination session; subscription mutations fan out to the quenches whose
// name sets they touch.
use std::collections::BTreeMap;
use std::sync::Arc;

use syrinx_wire::{keysets_match, Keyset, NameValue, Packet};

use crate::core::{QuenchRecord, RouterCore, SubRecord};
use crate::subast;

pub(crate) enum SubMutation<'a> {
    Added(&'a SubRecord),
    Modified(&'a SubRecord),
    Deleted(&'a SubRecord),
}

#[derive(Default)]
struct DeliveryGroups {
    secure: Vec<u64>,
    insecure: Vec<u64>,
}

/// Route one emitted notification. Evaluation happens on a snapshot of
/// `Arc` records collected under the read lock; no lock is held while any
/// expression runs or any delivery is enqueued.
pub(crate) async fn dispatch_notification(
    core: &RouterCore,
    name_value: &NameValue,
    deliver_insecure: bool,
    keys: &[Keyset],
) {
    let records: Vec<Arc<SubRecord>> = core
        .subscriptions
        .read()
        .await
        .values()
        .cloned()
        .collect();

    let mut per_owner: BTreeMap<u64, DeliveryGroups> = BTreeMap::new();
    for record in records {
        if !subast::evaluate(&record.ast, name_value) {
            continue;
        }
        // A subscription lands in at most one group: key match wins, the
        // insecure leg needs both sides to opt in.
        let secure = keysets_match(keys, &record.keys);
        let insecure = record.accept_insecure && deliver_insecure;
        if !secure && !insecure {
            continue;
        }
        let groups = per_owner.entry(record.owner).or_default();
        if secure {
            groups.secure.push(record.sub_id);
        } else {
            groups.insecure.push(record.sub_id);
        }
    }
    if per_owner.is_empty() {
        return;
    }

    for (owner, mut groups) in per_owner {
        groups.secure.sort_unstable();
        groups.insecure.sort_unstable();
        let Some(out) = core.session_out(owner).await else {
            // Owner raced with teardown; its records are on the way out.
            continue;
        };
        let body = Packet::NotifyDeliver {
            sub_ids_secure: groups.secure,
            sub_ids_insecure: groups.insecure,
            name_value: name_value.clone(),
        }
        .encode();
        metrics::counter!("syrinx_router_deliveries_total").increment(1);
        // Bounded send: a slow consumer backpressures the publisher.
        let _ = out.send(body).await;
    }
}

/// Tell interested quenches about a subscription mutation.
pub(crate) async fn notify_quenches(core: &RouterCore, mutation: SubMutation<'_>) {
    let record = match &mutation {
        SubMutation::Added(record)
        | SubMutation::Modified(record)
        | SubMutation::Deleted(record) => *record,
    };
    let quenches: Vec<Arc<QuenchRecord>> = core.quenches.read().await.values().cloned().collect();
    for quench in quenches {
        let overlaps = record
            .names
            .iter()
            .any(|name| quench.names.contains(name));
        if !overlaps {
            continue;
        }
        if !keysets_match(&record.keys, &quench.keys) && !quench.deliver_insecure {
            continue;
        }
        let packet = match mutation {
            SubMutation::Added(_) => Packet::SubAddNotify {
                quench_id: quench.quench_id,
                term_id: record.term_id,
                sub_expr: record.ast.clone(),
            },
            SubMutation::Modified(_) => Packet::SubModNotify {
                quench_id: quench.quench_id,
                term_id: record.term_id,
                sub_expr: record.ast.clone(),
            },
            SubMutation::Deleted(_) => Packet::SubDelNotify {
                quench_id: quench.quench_id,
                term_id: record.term_id,
            },
        };
        let Some(out) = core.session_out(quench.owner).await else {
            continue;
        };
        metrics::counter!("syrinx_router_quench_notifies_total").increment(1);
        let _ = out.send(packet.encode()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::BTreeSet;
    use syrinx_wire::{Keyset, Value};
    use tokio::sync::{mpsc, watch};

    async fn session(core: &Arc<RouterCore>) -> (u64, mpsc::Receiver<Bytes>) {
        let (out, out_rx) = mpsc::channel(crate::core::WRITE_QUEUE_DEPTH);
        let (cancel, _cancel_rx) = watch::channel(false);
        let id = core
            .register_session("127.0.0.1:9".parse().unwrap(), out, cancel)
            .await;
        (id, out_rx)
    }

    async fn subscribe(
        core: &Arc<RouterCore>,
        owner: u64,
        expression: &str,
        accept_insecure: bool,
        keys: Vec<Keyset>,
    ) -> Arc<SubRecord> {
        let ast = subast::parse(expression).expect("parse");
        let names = subast::names(&ast);
        core.add_subscription(
            owner,
            expression.to_string(),
            ast,
            names,
            accept_insecure,
            keys,
        )
        .await
    }

    fn recv_packet(rx: &mut mpsc::Receiver<Bytes>) -> Option<Packet> {
        rx.try_recv()
            .ok()
            .map(|body| Packet::decode(body).expect("decode"))
    }

    fn nv(pairs: &[(&str, Value)]) -> NameValue {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[tokio::test]
    async fn matches_are_batched_per_session() {
        let core = Arc::new(RouterCore::new());
        let (owner, mut rx) = session(&core).await;
        let first = subscribe(&core, owner, "exists(foo)", true, vec![]).await;
        let second = subscribe(&core, owner, "string(foo) == \"bar\"", true, vec![]).await;
        // A third subscription that must not match.
        subscribe(&core, owner, "exists(baz)", true, vec![]).await;

        let notification = nv(&[("foo", Value::Str("bar".into()))]);
        dispatch_notification(&core, &notification, true, &[]).await;

        match recv_packet(&mut rx).expect("deliver") {
            Packet::NotifyDeliver {
                sub_ids_secure,
                sub_ids_insecure,
                name_value,
            } => {
                assert!(sub_ids_secure.is_empty());
                assert_eq!(sub_ids_insecure, vec![first.sub_id, second.sub_id]);
                assert_eq!(name_value, notification);
            }
            other => panic!("unexpected packet {other:?}"),
        }
        // Exactly one packet for the whole notification.
        assert!(recv_packet(&mut rx).is_none());
    }

    #[tokio::test]
    async fn secure_and_insecure_groups_are_split() {
        let core = Arc::new(RouterCore::new());
        let (owner, mut rx) = session(&core).await;
        let shared = Keyset::from_keys([&b"secret"[..]]);
        let keyed = subscribe(
            &core,
            owner,
            "exists(foo)",
            false,
            vec![shared.clone()],
        )
        .await;
        let open = subscribe(&core, owner, "exists(foo)", true, vec![]).await;
        // Neither keys nor insecure opt-in: never delivered.
        subscribe(&core, owner, "exists(foo)", false, vec![]).await;

        let notification = nv(&[("foo", Value::Int32(1))]);
        dispatch_notification(&core, &notification, true, &[shared]).await;

        match recv_packet(&mut rx).expect("deliver") {
            Packet::NotifyDeliver {
                sub_ids_secure,
                sub_ids_insecure,
                ..
            } => {
                assert_eq!(sub_ids_secure, vec![keyed.sub_id]);
                assert_eq!(sub_ids_insecure, vec![open.sub_id]);
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_match_sends_nothing() {
        let core = Arc::new(RouterCore::new());
        let (owner, mut rx) = session(&core).await;
        subscribe(&core, owner, "exists(baz)", true, vec![]).await;
        dispatch_notification(&core, &nv(&[("foo", Value::Int32(1))]), true, &[]).await;
        assert!(recv_packet(&mut rx).is_none());
    }

    #[tokio::test]
    async fn quench_hears_about_matching_subscription() {
        let core = Arc::new(RouterCore::new());
        let (quencher, mut quench_rx) = session(&core).await;
        let (subscriber, _sub_rx) = session(&core).await;
        let quench = core
            .add_quench(
                quencher,
                BTreeSet::from(["foo".to_string()]),
                true,
                vec![],
            )
            .await;

        let record = subscribe(&core, subscriber, "exists(foo) && int32(n) > 0", true, vec![]).await;
        notify_quenches(&core, SubMutation::Added(&record)).await;

        match recv_packet(&mut quench_rx).expect("notify") {
            Packet::SubAddNotify {
                quench_id,
                term_id,
                sub_expr,
            } => {
                assert_eq!(quench_id, quench.quench_id);
                assert_eq!(term_id, record.term_id);
                assert_eq!(sub_expr, record.ast);
            }
            other => panic!("unexpected packet {other:?}"),
        }

        // A subscription over unrelated names stays invisible.
        let other = subscribe(&core, subscriber, "exists(volume)", true, vec![]).await;
        notify_quenches(&core, SubMutation::Added(&other)).await;
        assert!(recv_packet(&mut quench_rx).is_none());

        notify_quenches(&core, SubMutation::Deleted(&record)).await;
        match recv_packet(&mut quench_rx).expect("notify") {
            Packet::SubDelNotify { term_id, .. } => assert_eq!(term_id, record.term_id),
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[tokio::test]
    async fn quench_key_predicate_gates_delivery() {
        let core = Arc::new(RouterCore::new());
        let (quencher, mut quench_rx) = session(&core).await;
        let (subscriber, _sub_rx) = session(&core).await;
        // Keyed quench with no insecure opt-in.
        core.add_quench(
            quencher,
            BTreeSet::from(["foo".to_string()]),
            false,
            vec![Keyset::from_keys([&b"qk"[..]])],
        )
        .await;

        let unkeyed = subscribe(&core, subscriber, "exists(foo)", true, vec![]).await;
        notify_quenches(&core, SubMutation::Added(&unkeyed)).await;
        assert!(recv_packet(&mut quench_rx).is_none());

        let keyed = subscribe(
            &core,
            subscriber,
            "exists(foo)",
            true,
            vec![Keyset::from_keys([&b"qk"[..]])],
        )
        .await;
        notify_quenches(&core, SubMutation::Added(&keyed)).await;
        assert!(matches!(
            recv_packet(&mut quench_rx),
            Some(Packet::SubAddNotify { .. })
        ));
    }
}
