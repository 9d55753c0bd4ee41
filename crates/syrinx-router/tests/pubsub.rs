//! End-to-end publish/subscribe and quench scenarios over real TCP
//! sessions, driving the router with the real client library.
mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::Result;
use common::{addr_of, start_router, wait_for_sessions, wait_for_subscriptions, RawPeer};
use syrinx_client::{Client, ClientError, QuenchNotification};
use syrinx_router::subast;
use syrinx_wire::{nack, NameValue, Packet, Value};
use tokio::time::timeout;

fn nv(pairs: &[(&str, Value)]) -> NameValue {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

#[tokio::test]
async fn happy_handshake() -> Result<()> {
    let router = start_router().await?;
    let client = Client::new(addr_of(&router).to_string(), NameValue::new(), vec![], vec![]);
    client.connect().await?;
    // A second connect on a live session is a caller error.
    assert!(matches!(
        client.connect().await,
        Err(ClientError::AlreadyConnected)
    ));
    client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn unsupported_version_is_nacked() -> Result<()> {
    let router = start_router().await?;
    let mut peer = RawPeer::connect(addr_of(&router)).await?;
    peer.send(&Packet::ConnRequest {
        xid: 1,
        version_major: 5,
        version_minor: 0,
        options: NameValue::new(),
        keys_nfn: vec![],
        keys_sub: vec![],
    })
    .await?;
    match peer.recv_within(Duration::from_secs(2)).await? {
        Some(Packet::Nack { xid, code, .. }) => {
            assert_eq!(xid, 1);
            assert_eq!(code, nack::VERSION_INCOMPATIBLE);
        }
        other => panic!("expected version nack, got {other:?}"),
    }
    // The router hangs up after the refusal.
    assert!(peer.recv_within(Duration::from_secs(2)).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn matching_notification_is_delivered_once() -> Result<()> {
    let router = start_router().await?;
    let addr = addr_of(&router).to_string();
    let publisher = Client::new(addr.clone(), NameValue::new(), vec![], vec![]);
    let subscriber = Client::new(addr, NameValue::new(), vec![], vec![]);
    publisher.connect().await?;
    subscriber.connect().await?;

    let mut sub = subscriber.subscribe("exists(foo)", true, vec![]).await?;
    // First subscription on a fresh router.
    assert_eq!(sub.id(), 1);

    let notification = nv(&[("foo", Value::Str("bar".into()))]);
    publisher.notify(notification.clone(), true, vec![]).await?;

    let delivered = timeout(Duration::from_secs(2), sub.next())
        .await?
        .expect("delivery");
    assert_eq!(delivered, notification);
    // Exactly once: nothing further queued.
    assert!(sub.try_next().is_none());

    publisher.disconnect().await?;
    subscriber.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn non_matching_notification_is_silent() -> Result<()> {
    let router = start_router().await?;
    let addr = addr_of(&router).to_string();
    let publisher = Client::new(addr.clone(), NameValue::new(), vec![], vec![]);
    let subscriber = Client::new(addr, NameValue::new(), vec![], vec![]);
    publisher.connect().await?;
    subscriber.connect().await?;

    let mut sub = subscriber.subscribe("exists(baz)", true, vec![]).await?;
    publisher
        .notify(nv(&[("foo", Value::Str("bar".into()))]), true, vec![])
        .await?;

    assert!(timeout(Duration::from_millis(500), sub.next()).await.is_err());

    publisher.disconnect().await?;
    subscriber.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn quench_fires_on_subscribe() -> Result<()> {
    let router = start_router().await?;
    let addr = addr_of(&router).to_string();
    let quencher = Client::new(addr.clone(), NameValue::new(), vec![], vec![]);
    let subscriber = Client::new(addr, NameValue::new(), vec![], vec![]);
    quencher.connect().await?;
    subscriber.connect().await?;

    let mut quench = quencher
        .quench(BTreeSet::from(["foo".to_string()]), true, vec![])
        .await?;

    let expression = "exists(foo) && int32(n) > 0";
    let sub = subscriber.subscribe(expression, true, vec![]).await?;

    match timeout(Duration::from_secs(2), quench.next())
        .await?
        .expect("quench event")
    {
        QuenchNotification::Add { term_id, sub_expr } => {
            assert!(term_id > 0);
            assert_eq!(sub_expr, subast::parse(expression)?);
        }
        other => panic!("expected add event, got {other:?}"),
    }

    // Deleting the subscription is observed too.
    subscriber.subscription_delete(sub).await?;
    match timeout(Duration::from_secs(2), quench.next())
        .await?
        .expect("quench event")
    {
        QuenchNotification::Delete { term_id } => assert!(term_id > 0),
        other => panic!("expected delete event, got {other:?}"),
    }

    quencher.quench_delete(quench).await?;
    quencher.disconnect().await?;
    subscriber.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn quench_modify_changes_name_set() -> Result<()> {
    let router = start_router().await?;
    let addr = addr_of(&router).to_string();
    let quencher = Client::new(addr.clone(), NameValue::new(), vec![], vec![]);
    let subscriber = Client::new(addr, NameValue::new(), vec![], vec![]);
    quencher.connect().await?;
    subscriber.connect().await?;

    let mut quench = quencher
        .quench(BTreeSet::from(["foo".to_string()]), true, vec![])
        .await?;
    quencher
        .quench_modify(
            &mut quench,
            BTreeSet::from(["volume".to_string()]),
            BTreeSet::from(["foo".to_string()]),
            true,
            vec![],
            vec![],
        )
        .await?;
    assert_eq!(quench.names(), &BTreeSet::from(["volume".to_string()]));

    // The old name no longer triggers; the new one does.
    subscriber.subscribe("exists(foo)", true, vec![]).await?;
    subscriber.subscribe("exists(volume)", true, vec![]).await?;

    match timeout(Duration::from_secs(2), quench.next())
        .await?
        .expect("quench event")
    {
        QuenchNotification::Add { sub_expr, .. } => {
            assert_eq!(sub_expr, subast::parse("exists(volume)")?);
        }
        other => panic!("expected add event, got {other:?}"),
    }

    quencher.disconnect().await?;
    subscriber.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn disconnect_cleans_up_subscriptions() -> Result<()> {
    let router = start_router().await?;
    let addr = addr_of(&router).to_string();
    let publisher = Client::new(addr.clone(), NameValue::new(), vec![], vec![]);
    let subscriber = Client::new(addr, NameValue::new(), vec![], vec![]);
    publisher.connect().await?;
    subscriber.connect().await?;

    subscriber.subscribe("exists(foo)", true, vec![]).await?;
    wait_for_subscriptions(&router, 1).await;

    subscriber.disconnect().await?;
    assert_eq!(subscriber.pending_requests(), 0);

    wait_for_subscriptions(&router, 0).await;
    wait_for_sessions(&router, 1).await;

    // A matching publish now delivers to no one; the publisher's own
    // session stays healthy.
    publisher
        .notify(nv(&[("foo", Value::Str("bar".into()))]), true, vec![])
        .await?;
    publisher.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn subscribe_then_delete_restores_router_state() -> Result<()> {
    let router = start_router().await?;
    let client = Client::new(addr_of(&router).to_string(), NameValue::new(), vec![], vec![]);
    client.connect().await?;

    assert_eq!(router.subscription_count().await, 0);
    let sub = client.subscribe("exists(foo)", true, vec![]).await?;
    wait_for_subscriptions(&router, 1).await;
    client.subscription_delete(sub).await?;
    wait_for_subscriptions(&router, 0).await;

    client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn modify_changes_matching_behavior() -> Result<()> {
    let router = start_router().await?;
    let addr = addr_of(&router).to_string();
    let publisher = Client::new(addr.clone(), NameValue::new(), vec![], vec![]);
    let subscriber = Client::new(addr, NameValue::new(), vec![], vec![]);
    publisher.connect().await?;
    subscriber.connect().await?;

    let mut sub = subscriber.subscribe("exists(baz)", true, vec![]).await?;
    subscriber
        .subscription_modify(&mut sub, "exists(foo)", true, vec![], vec![])
        .await?;
    assert_eq!(sub.expression(), "exists(foo)");

    let notification = nv(&[("foo", Value::Int32(1))]);
    publisher.notify(notification.clone(), true, vec![]).await?;
    let delivered = timeout(Duration::from_secs(2), sub.next())
        .await?
        .expect("delivery");
    assert_eq!(delivered, notification);

    publisher.disconnect().await?;
    subscriber.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn bad_expression_is_nacked_and_session_survives() -> Result<()> {
    let router = start_router().await?;
    let client = Client::new(addr_of(&router).to_string(), NameValue::new(), vec![], vec![]);
    client.connect().await?;

    match client.subscribe("exists(", true, vec![]).await {
        Err(ClientError::Nack { code, .. }) => assert_eq!(code, nack::PARSE_ERROR),
        other => panic!("expected parse nack, got {other:?}"),
    }

    // The session is still usable afterwards.
    let sub = client.subscribe("exists(foo)", true, vec![]).await?;
    client.subscription_delete(sub).await?;
    client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn secure_delivery_requires_shared_keys() -> Result<()> {
    let router = start_router().await?;
    let addr = addr_of(&router).to_string();
    let publisher = Client::new(addr.clone(), NameValue::new(), vec![], vec![]);
    let subscriber = Client::new(addr, NameValue::new(), vec![], vec![]);
    publisher.connect().await?;
    subscriber.connect().await?;

    let shared = syrinx_wire::Keyset::from_keys([&b"secret"[..]]);
    // Keyed subscription refusing insecure deliveries.
    let mut keyed = subscriber
        .subscribe("exists(foo)", false, vec![shared.clone()])
        .await?;

    // Publisher without the key: nothing arrives even with insecure
    // delivery on, because the subscription opted out of insecure.
    publisher
        .notify(nv(&[("foo", Value::Int32(1))]), true, vec![])
        .await?;
    assert!(timeout(Duration::from_millis(300), keyed.next())
        .await
        .is_err());

    // Publisher presenting the shared key: secure delivery.
    publisher
        .notify(nv(&[("foo", Value::Int32(2))]), false, vec![shared])
        .await?;
    let delivered = timeout(Duration::from_secs(2), keyed.next())
        .await?
        .expect("secure delivery");
    assert_eq!(delivered, nv(&[("foo", Value::Int32(2))]));

    publisher.disconnect().await?;
    subscriber.disconnect().await?;
    Ok(())
}
