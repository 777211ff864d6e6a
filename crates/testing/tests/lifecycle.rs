use std::{sync::Arc, time::Duration};

use chrono::Utc;
use quorum_example_types::{
    item_types::{FakeItem, TestItem},
    node_types::MemoryImpl,
};
use quorum_testing::{test_builder::TestDescription, test_runner::TestRunner};
use quorum_types::{
    data::{ErrorCode, HashId},
    error::NodeError,
    item_state::ItemState,
    logging::setup_logging,
    traits::item::Item,
    ConsensusThresholds,
};
use tokio::time::sleep;

const MAX_WAIT: Duration = Duration::from_secs(10);

async fn launch() -> TestRunner<MemoryImpl> {
    setup_logging();
    TestDescription::default()
        .gen_launcher()
        .launch()
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_thresholds_are_refused() {
    setup_logging();
    let metadata = TestDescription {
        thresholds: Some(ConsensusThresholds {
            positive_consensus: 11,
            negative_consensus: 4,
            resync_break_consensus: 4,
        }),
        ..TestDescription::default()
    };
    let error = metadata.gen_launcher().launch().await.err().unwrap();
    assert!(matches!(error, NodeError::InvalidConfig { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_locked_item_is_not_elected() {
    let runner = launch().await;
    let id = HashId::random();
    runner.seed(id, ItemState::Locked, [0]).await.unwrap();

    let result = runner
        .node(0)
        .register_item(Arc::new(FakeItem(id)))
        .await
        .unwrap();
    assert_eq!(result.state, ItemState::Locked);
    assert!(result.errors.iter().any(|e| e.error == ErrorCode::BadState));
    assert_eq!(runner.node(0).count_elections(), 0);
    runner.shut_down().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cleanup_purges_expired_records() {
    let runner = launch().await;
    let expires_at = Utc::now() + chrono::Duration::seconds(3);
    let item = TestItem::ok().expiring(expires_at).shared();
    let id = item.id();

    let result = runner.register_and_wait(0, item, MAX_WAIT).await.unwrap();
    assert_eq!(result.state, ItemState::Approved);
    assert_eq!(result.expires_at, Some(expires_at));
    assert!(runner.wait_idle(MAX_WAIT).await);

    let node = runner.node(0);
    assert_eq!(node.cleanup_ledger().await.unwrap(), 0);
    let remaining = (expires_at - Utc::now()).to_std().unwrap_or_default();
    sleep(remaining + Duration::from_millis(200)).await;

    assert_eq!(node.cleanup_ledger().await.unwrap(), 1);
    assert_eq!(node.check_item(&id).await.unwrap().state, ItemState::Undefined);
    runner.shut_down().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ledger_failure_is_reported() {
    let runner = launch().await;
    let node = runner.node(0);
    node.ledger().set_unavailable(true);

    let error = node
        .register_item(TestItem::ok().shared())
        .await
        .unwrap_err();
    assert!(matches!(error, NodeError::LedgerFailure { .. }));
    assert!(node.check_item(&HashId::random()).await.is_err());

    node.ledger().set_unavailable(false);
    let result = node.check_item(&HashId::random()).await.unwrap();
    assert_eq!(result.state, ItemState::Undefined);
    runner.shut_down().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shut_down_node_refuses_work() {
    let runner = launch().await;
    runner.node(0).shut_down().await;

    let error = runner
        .node(0)
        .register_item(TestItem::ok().shared())
        .await
        .unwrap_err();
    assert!(matches!(error, NodeError::ShutDown));
    let error = runner.node(0).resync(HashId::random()).await.unwrap_err();
    assert!(matches!(error, NodeError::ShutDown));

    // the rest of the network carries on without it
    let item = TestItem::ok().shared();
    let id = item.id();
    runner.node(1).register_item(item).await.unwrap();
    for idx in 1..10 {
        let result = runner.node(idx).wait_item(&id, MAX_WAIT).await.unwrap();
        assert_eq!(result.state, ItemState::Approved);
    }
    runner.shut_down().await;
}
