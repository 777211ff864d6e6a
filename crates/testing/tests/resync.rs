use std::time::Duration;

use quorum::tasks::election::ElectionState;
use quorum_example_types::{item_types::TestItem, node_types::MemoryImpl};
use quorum_testing::{
    test_builder::{TestDescription, TimingData},
    test_runner::TestRunner,
};
use quorum_types::{
    data::HashId, error::NodeError, item_state::ItemState, logging::setup_logging,
    traits::item::Item, ConsensusThresholds,
};
use tokio::time::{sleep, Instant};

const MAX_WAIT: Duration = Duration::from_secs(10);

async fn launch(metadata: TestDescription) -> TestRunner<MemoryImpl> {
    setup_logging();
    metadata.gen_launcher().launch().await.unwrap()
}

/// Wait until node `idx` has no resync in flight
async fn wait_resyncs_done(runner: &TestRunner<MemoryImpl>, idx: usize, max_wait: Duration) {
    let deadline = Instant::now() + max_wait;
    while runner.node(idx).count_resyncs() > 0 {
        assert!(Instant::now() < deadline, "resync still running");
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resync_adopts_terminal_states() {
    let runner = launch(TestDescription::default()).await;

    for state in [ItemState::Approved, ItemState::Revoked, ItemState::Declined] {
        let id = HashId::random();
        runner.seed_all_but(id, state, 0).await.unwrap();
        let node = runner.node(0);
        assert_eq!(node.check_item(&id).await.unwrap().state, ItemState::Undefined);

        node.resync(id).await.unwrap();
        assert_eq!(node.check_item(&id).await.unwrap().state, ItemState::Pending);
        assert_eq!(node.wait_item(&id, MAX_WAIT).await.unwrap().state, state);
    }
    runner.shut_down().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resync_restores_destroyed_record() {
    let runner = launch(TestDescription::default()).await;
    let item = TestItem::ok().shared();
    let id = item.id();
    runner.node(0).register_item(item).await.unwrap();
    for result in runner.wait_all(&id, MAX_WAIT).await.unwrap() {
        assert_eq!(result.state, ItemState::Approved);
    }
    assert!(runner.wait_idle(MAX_WAIT).await);

    runner.destroy(0, &id).await.unwrap();
    let node = runner.node(0);
    assert_eq!(node.check_item(&id).await.unwrap().state, ItemState::Undefined);

    node.resync(id).await.unwrap();
    let result = node.wait_item(&id, MAX_WAIT).await.unwrap();
    assert_eq!(result.state, ItemState::Approved);
    assert!(result.have_copy);
    runner.shut_down().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resync_runs_while_decision_is_announced() {
    let runner = launch(TestDescription {
        timing_data: TimingData {
            max_consensus_received_check_time: 60_000,
            ..TimingData::default()
        },
        ..TestDescription::default()
    })
    .await;
    runner.switch_off(9);
    let item = TestItem::ok().shared();
    let id = item.id();
    runner.node(0).register_item(item).await.unwrap();
    for idx in 0..9 {
        let result = runner.node(idx).wait_item(&id, MAX_WAIT).await.unwrap();
        assert_eq!(result.state, ItemState::Approved);
    }
    // still waiting for node 9 to confirm
    assert!(
        runner
            .wait_for_phase(0, &id, ElectionState::DecidedApproved, MAX_WAIT)
            .await
    );

    runner.destroy(0, &id).await.unwrap();
    let node = runner.node(0);
    node.resync(id).await.unwrap();
    assert_eq!(
        node.wait_item(&id, MAX_WAIT).await.unwrap().state,
        ItemState::Approved
    );
    runner.shut_down().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resync_other_states_stays_pending() {
    let runner = launch(TestDescription::default()).await;
    let id = HashId::random();
    runner
        .seed_all_but(id, ItemState::PendingPositive, 0)
        .await
        .unwrap();

    runner.node(0).resync(id).await.unwrap();
    assert_eq!(
        runner.node(0).check_item(&id).await.unwrap().state,
        ItemState::Pending
    );
    wait_resyncs_done(&runner, 0, MAX_WAIT).await;
    assert_eq!(
        runner.node(0).check_item(&id).await.unwrap().state,
        ItemState::Pending
    );
    runner.shut_down().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resync_without_break_quorum_ends_pending() {
    let runner = launch(TestDescription {
        timing_data: TimingData {
            max_resync_time: 30_000,
            ..TimingData::default()
        },
        ..TestDescription::default()
    })
    .await;
    let id = HashId::random();
    // three peers each, well short of the break quorum of seven
    runner.seed(id, ItemState::Approved, 1..4).await.unwrap();
    runner.seed(id, ItemState::Declined, 4..7).await.unwrap();
    runner.seed(id, ItemState::Revoked, 7..10).await.unwrap();

    let start = Instant::now();
    runner.node(0).resync(id).await.unwrap();
    wait_resyncs_done(&runner, 0, MAX_WAIT).await;

    // concluded once every peer answered, long before the timeout
    assert!(start.elapsed() < MAX_WAIT);
    assert_eq!(
        runner.node(0).check_item(&id).await.unwrap().state,
        ItemState::Pending
    );
    runner.shut_down().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resync_with_timeout() {
    let max_resync_time = Duration::from_millis(1000);
    let runner = launch(TestDescription {
        timing_data: TimingData {
            max_resync_time: 1000,
            ..TimingData::default()
        },
        ..TestDescription::default()
    })
    .await;
    let id = HashId::random();
    runner
        .seed_all_but(id, ItemState::Approved, 0)
        .await
        .unwrap();
    // three reachable peers cannot make the break quorum
    for idx in 4..10 {
        runner.switch_off(idx);
    }

    let start = Instant::now();
    runner.node(0).resync(id).await.unwrap();
    wait_resyncs_done(&runner, 0, MAX_WAIT).await;

    assert!(start.elapsed() >= max_resync_time);
    assert_eq!(
        runner.node(0).check_item(&id).await.unwrap().state,
        ItemState::Pending
    );
    runner.shut_down().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resync_is_idempotent_and_yields_to_elections() {
    let runner = launch(TestDescription::default()).await;
    for idx in 1..10 {
        runner.switch_off(idx);
    }
    let node = runner.node(0);

    let id = HashId::random();
    node.resync(id).await.unwrap();
    node.resync(id).await.unwrap();
    assert_eq!(node.count_resyncs(), 1);

    let item = TestItem::ok().shared();
    let voted = item.id();
    node.register_item(item).await.unwrap();
    node.resync(voted).await.unwrap();
    assert_eq!(node.count_resyncs(), 1);
    assert_eq!(node.count_elections(), 1);
    runner.shut_down().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resync_refuses_locked_record() {
    let runner = launch(TestDescription::default()).await;
    let id = HashId::random();
    runner.seed(id, ItemState::Locked, [0]).await.unwrap();

    let error = runner.node(0).resync(id).await.unwrap_err();
    assert!(matches!(
        error,
        NodeError::BadItemState {
            state: ItemState::Locked,
            ..
        }
    ));
    assert_eq!(
        runner.node(0).check_item(&id).await.unwrap().state,
        ItemState::Locked
    );
    runner.shut_down().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resync_complex() {
    let runner = launch(TestDescription::default()).await;

    let sub_items: Vec<TestItem> = (0..5).map(|_| TestItem::ok()).collect();
    let sub_ids: Vec<HashId> = sub_items.iter().map(Item::id).collect();
    for sub_item in sub_items {
        let id = sub_item.id();
        runner.node(0).register_item(sub_item.shared()).await.unwrap();
        for result in runner.wait_all(&id, MAX_WAIT).await.unwrap() {
            assert_eq!(result.state, ItemState::Approved);
        }
    }

    let parent = sub_ids
        .iter()
        .fold(TestItem::ok(), |parent, id| parent.revoking(*id))
        .shared();
    let parent_id = parent.id();
    runner.node(0).register_item(parent).await.unwrap();
    for result in runner.wait_all(&parent_id, MAX_WAIT).await.unwrap() {
        assert_eq!(result.state, ItemState::Approved);
    }
    assert!(runner.wait_idle(MAX_WAIT).await);

    // node 0 forgets the parent and all but one of the revoked items
    runner.destroy(0, &parent_id).await.unwrap();
    for id in &sub_ids[1..] {
        runner.destroy(0, id).await.unwrap();
    }

    let node = runner.node(0);
    node.resync(parent_id).await.unwrap();
    assert_eq!(
        node.check_item(&parent_id).await.unwrap().state,
        ItemState::Pending
    );
    assert_eq!(
        node.wait_item(&parent_id, MAX_WAIT).await.unwrap().state,
        ItemState::Approved
    );
    wait_resyncs_done(&runner, 0, MAX_WAIT).await;
    for id in &sub_ids {
        assert_eq!(node.check_item(id).await.unwrap().state, ItemState::Revoked);
    }
    runner.shut_down().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_revoked_item_is_resynced_during_election() {
    // peers are split between LOCKED and REVOKED while the revoker is decided, so settle on
    // fewer agreeing peers than the default
    let runner = launch(TestDescription {
        thresholds: Some(ConsensusThresholds {
            positive_consensus: 7,
            negative_consensus: 4,
            resync_break_consensus: 4,
        }),
        ..TestDescription::default()
    })
    .await;

    let mut known = Vec::new();
    for _ in 0..2 {
        let item = TestItem::ok().shared();
        let id = item.id();
        runner.node(0).register_item(item).await.unwrap();
        for result in runner.wait_all(&id, MAX_WAIT).await.unwrap() {
            assert_eq!(result.state, ItemState::Approved);
        }
        known.push(id);
    }
    let (reference, revoked) = (known[0], known[1]);
    assert!(runner.wait_idle(MAX_WAIT).await);
    runner.destroy(0, &revoked).await.unwrap();

    let item = TestItem::ok()
        .referencing(reference)
        .revoking(revoked)
        .shared();
    let id = item.id();
    runner.node(1).register_item(item).await.unwrap();

    for idx in 1..10 {
        let result = runner.node(idx).wait_item(&id, MAX_WAIT).await.unwrap();
        assert_eq!(result.state, ItemState::Approved);
    }
    // node 0 recovered the revoked item from its peers while checking the revoker
    assert!(runner
        .wait_for_state(0, &revoked, ItemState::Revoked, MAX_WAIT)
        .await
        .unwrap());
    runner.shut_down().await;
}
