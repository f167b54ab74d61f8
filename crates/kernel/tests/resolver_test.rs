#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Permission resolver tests: lookup order, backfill, revocation, bulk
//! checks, deadlines and degraded answers.

mod common;

use std::time::{Duration, Instant};

use common::{TestCluster, settings};
use permgate_kernel::error::PermissionError;
use permgate_kernel::key::{PermissionKey, ScopeType};
use permgate_kernel::resolver::DecisionSource;
use permgate_test_utils::eventually;

fn member_cluster() -> TestCluster {
    let cluster = TestCluster::new();
    cluster
        .authority
        .grants
        .define_role("member", &["read", "post"])
        .define_role("moderator", &["delete"])
        .assign("alice", "member", "global", None)
        .assign("alice", "moderator", "server", Some("7"));
    cluster
}

#[tokio::test]
async fn test_lookup_walks_tiers_and_backfills() {
    let cluster = member_cluster();
    let node = cluster.node("n1");

    let first = node
        .check_permission("alice", ScopeType::Server, Some("7"), "delete")
        .await
        .unwrap();
    assert!(first.allowed);
    assert_eq!(first.source, DecisionSource::Authority);
    assert!(!first.degraded);

    let second = node
        .check_permission("alice", ScopeType::Server, Some("7"), "delete")
        .await
        .unwrap();
    assert_eq!(second.source, DecisionSource::L1);

    // A second node finds the backfilled L2 entry.
    let peer = cluster.node("n2");
    let third = peer
        .check_permission("alice", ScopeType::Server, Some("7"), "delete")
        .await
        .unwrap();
    assert_eq!(third.source, DecisionSource::L2);
    assert!(third.allowed);

    assert_eq!(cluster.authority.calls.get(), 1);
}

#[tokio::test]
async fn test_denials_are_cached_too() {
    let cluster = member_cluster();
    let node = cluster.node("n1");
    for _ in 0..3 {
        let decision = node
            .check_permission("alice", ScopeType::Server, Some("8"), "delete")
            .await
            .unwrap();
        assert!(!decision.allowed);
    }
    assert_eq!(cluster.authority.calls.get(), 1);
}

#[tokio::test]
async fn test_revocation_is_visible_within_one_second() {
    let cluster = member_cluster();
    let node = cluster.node("n1");
    let peer = cluster.node("n2");

    for resolver in [&node, &peer] {
        assert!(
            resolver
                .check_permission("alice", ScopeType::Global, None, "read")
                .await
                .unwrap()
                .allowed
        );
    }

    let mut events = cluster
        .subscribe(&cluster.keys().invalidation_channel())
        .await;

    let started = Instant::now();
    cluster.authority.grants.revoke("alice", "member");
    node.invalidate_user("alice").await.unwrap();

    let local = node
        .check_permission("alice", ScopeType::Global, None, "read")
        .await
        .unwrap();
    assert!(!local.allowed);

    // The peer still holds its L1 copy until the event arrives.
    for message in common::drain(&mut events).await {
        peer.coordinator().handle_message(&message);
    }
    let remote = peer
        .check_permission("alice", ScopeType::Global, None, "read")
        .await
        .unwrap();
    assert!(!remote.allowed);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_listener_propagates_to_peers() {
    let cluster = member_cluster();
    let node = cluster.node("n1");
    let peer = cluster.node("n2");
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = permgate_kernel::listener::spawn(
        cluster.store.clone(),
        cluster.keys().invalidation_channel(),
        std::sync::Arc::new(peer.coordinator().clone()),
        shutdown_rx,
    );

    peer.check_permission("alice", ScopeType::Global, None, "read")
        .await
        .unwrap();
    cluster.authority.grants.revoke("alice", "member");

    // The listener may not be subscribed yet, so keep invalidating until the
    // peer observes it; invalidation is idempotent.
    let (node, peer) = (&node, &peer);
    let converged = eventually(Duration::from_secs(2), || async move {
        node.invalidate_user("alice").await.unwrap();
        !peer
            .check_permission("alice", ScopeType::Global, None, "read")
            .await
            .unwrap()
            .allowed
    })
    .await;
    assert!(converged);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_invalidate_role_and_scope() {
    let cluster = member_cluster();
    cluster.authority.grants.assign("bob", "moderator", "server", Some("7"));
    let node = cluster.node("n1");

    for subject in ["alice", "bob"] {
        node.check_permission(subject, ScopeType::Server, Some("7"), "delete")
            .await
            .unwrap();
    }
    let calls = cluster.authority.calls.get();

    cluster.authority.grants.define_role("moderator", &[]);
    node.invalidate_role("moderator").await.unwrap();
    for subject in ["alice", "bob"] {
        let decision = node
            .check_permission(subject, ScopeType::Server, Some("7"), "delete")
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.source, DecisionSource::Authority);
    }
    // subjects_with_role plus one check per subject
    assert_eq!(cluster.authority.calls.get(), calls + 3);

    node.check_permission("alice", ScopeType::Server, Some("9"), "read")
        .await
        .unwrap();
    let report = node.invalidate_scope("9").await.unwrap();
    assert_eq!(report.keys_removed, 1);
    let decision = node
        .check_permission("alice", ScopeType::Server, Some("9"), "read")
        .await
        .unwrap();
    assert_eq!(decision.source, DecisionSource::Authority);
}

#[tokio::test]
async fn test_bulk_check_batches_each_tier() {
    let cluster = member_cluster();
    let node = cluster.node("n1");
    let requests = [
        (ScopeType::Global, None, "read"),
        (ScopeType::Server, Some("7"), "delete"),
        (ScopeType::Server, Some("8"), "delete"),
        (ScopeType::Channel, Some("3"), "post"),
        (ScopeType::Global, Some("x"), "read"),
    ];

    let results = node.bulk_check_permissions("alice", &requests).await;
    let allowed: Vec<Option<bool>> = results
        .iter()
        .map(|r| r.as_ref().ok().map(|d| d.allowed))
        .collect();
    assert_eq!(
        allowed,
        vec![Some(true), Some(true), Some(false), Some(true), None]
    );
    assert!(matches!(results[4], Err(PermissionError::InvalidKey(_))));
    assert_eq!(cluster.authority.calls.get(), 1);

    let again = node.bulk_check_permissions("alice", &requests[..4]).await;
    assert!(
        again
            .iter()
            .all(|r| r.as_ref().unwrap().source == DecisionSource::L1)
    );

    node.local().clear();
    let from_l2 = node.bulk_check_permissions("alice", &requests[..4]).await;
    assert!(
        from_l2
            .iter()
            .all(|r| r.as_ref().unwrap().source == DecisionSource::L2)
    );
    assert_eq!(cluster.authority.calls.get(), 1);
}

#[tokio::test]
async fn test_backfill_skipped_when_invalidated_mid_lookup() {
    let cluster = member_cluster();
    let node = cluster.node("n1");
    let key = PermissionKey::new("alice", ScopeType::Global, None, "read").unwrap();
    let cache_key = cluster.keys().cache_key(&key);

    let gate = cluster.authority.hold();
    let check = {
        let node = node.clone();
        let key = key.clone();
        tokio::spawn(async move {
            node.check_permission_within(&key, Duration::from_secs(5))
                .await
        })
    };
    let authority = &cluster.authority;
    assert!(eventually(Duration::from_secs(1), || async move { authority.calls.get() == 1 }).await);

    node.invalidate_user("alice").await.unwrap();
    gate.open();

    let decision = check.await.unwrap().unwrap();
    assert_eq!(decision.source, DecisionSource::Authority);
    assert!(node.local().get_stale(&cache_key).is_none());
    assert!(node.distributed().get(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_deadline_abandons_lookup() {
    let cluster = member_cluster();
    let node = cluster.node("n1");
    let _gate = cluster.authority.hold();
    let key = PermissionKey::new("alice", ScopeType::Global, None, "read").unwrap();

    let err = node
        .check_permission_within(&key, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, PermissionError::Timeout(_)));
}

#[tokio::test]
async fn test_degraded_answer_from_stale_entry() {
    let cluster = member_cluster();
    let mut settings = settings();
    settings.resolver.l1_ttl_secs = 1;
    settings.resolver.l2_ttl_secs = 2;
    let node = cluster.node_with("n1", settings);

    node.check_permission("alice", ScopeType::Global, None, "read")
        .await
        .unwrap();
    cluster.clock.advance_ms(5_000);
    cluster.authority.failures.fail_always();

    let decision = node
        .check_permission("alice", ScopeType::Global, None, "read")
        .await
        .unwrap();
    assert!(decision.allowed);
    assert!(decision.degraded);
    assert_eq!(decision.source, DecisionSource::Stale);
    assert_eq!(node.metrics().degraded_decisions.get(), 1);

    // Nothing cached for this key: the failure surfaces, never an allow.
    let err = node
        .check_permission("alice", ScopeType::Global, None, "post")
        .await
        .unwrap_err();
    assert!(matches!(err, PermissionError::Unavailable { .. }));
}

#[tokio::test]
async fn test_l2_outage_falls_through_to_authority() {
    let cluster = member_cluster();
    let node = cluster.node("n1");
    cluster.store.reads.fail_always();

    let decision = node
        .check_permission("alice", ScopeType::Global, None, "read")
        .await
        .unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.source, DecisionSource::Authority);
}

#[tokio::test]
async fn test_revoked_subject_fails_closed() {
    let cluster = member_cluster();
    let node = cluster.node("n1");
    node.check_permission("alice", ScopeType::Global, None, "read")
        .await
        .unwrap();

    node.invalidate_user("alice").await.unwrap();
    cluster.authority.failures.fail_always();

    assert!(
        node.check_permission("alice", ScopeType::Global, None, "read")
            .await
            .is_err()
    );
}
