use std::{sync::Arc, time::Duration};

use quorum_example_types::{item_types::TestItem, node_types::MemoryImpl};
use quorum_testing::{test_builder::TestDescription, test_runner::TestRunner};
use quorum_types::{
    data::{ErrorCode, HashId},
    item_state::ItemState,
    logging::setup_logging,
    traits::item::Item,
};

const MAX_WAIT: Duration = Duration::from_secs(10);

async fn launch() -> TestRunner<MemoryImpl> {
    setup_logging();
    TestDescription::default()
        .gen_launcher()
        .launch()
        .await
        .unwrap()
}

/// Register an item and wait until every node approved it
async fn approve_everywhere(runner: &TestRunner<MemoryImpl>, item: TestItem) -> HashId {
    let id = item.id();
    runner.node(0).register_item(item.shared()).await.unwrap();
    for result in runner.wait_all(&id, MAX_WAIT).await.unwrap() {
        assert_eq!(result.state, ItemState::Approved);
    }
    id
}

async fn assert_state_everywhere(runner: &TestRunner<MemoryImpl>, id: &HashId, state: ItemState) {
    for idx in 0..runner.nodes().len() {
        assert!(
            runner.wait_for_state(idx, id, state, MAX_WAIT).await.unwrap(),
            "node {idx} never reached {state}"
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_approve_and_revoke() {
    let runner = launch().await;
    let revoked = approve_everywhere(&runner, TestItem::ok()).await;

    let item = TestItem::ok().revoking(revoked);
    let id = approve_everywhere(&runner, item).await;

    assert_state_everywhere(&runner, &revoked, ItemState::Revoked).await;
    let result = runner.node(0).check_item(&revoked).await.unwrap();
    assert!(result.expires_at.is_some());
    assert_eq!(
        runner.node(0).check_item(&id).await.unwrap().state,
        ItemState::Approved
    );
    runner.shut_down().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bad_revoking_items_decline_and_remove_lock() {
    let runner = launch().await;

    for bad_state in [
        ItemState::Pending,
        ItemState::PendingPositive,
        ItemState::PendingNegative,
        ItemState::Undefined,
        ItemState::Declined,
        ItemState::Revoked,
        ItemState::LockedForCreation,
    ] {
        let good = HashId::random();
        runner
            .seed(good, ItemState::Approved, 0..runner.nodes().len())
            .await
            .unwrap();
        let bad = HashId::random();
        if bad_state != ItemState::Undefined {
            runner
                .seed(bad, bad_state, 0..runner.nodes().len())
                .await
                .unwrap();
        }

        let item = TestItem::ok().revoking(good).revoking(bad).shared();
        let result = runner.register_and_wait(0, item, MAX_WAIT).await.unwrap();
        assert_eq!(result.state, ItemState::Declined, "revoking {bad_state}");
        assert!(result.errors.iter().any(|e| e.error == ErrorCode::BadRevoke));

        assert_state_everywhere(&runner, &good, ItemState::Approved).await;
        assert_state_everywhere(&runner, &bad, bad_state).await;
    }
    runner.shut_down().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_new_item_releases_revoke_lock() {
    let runner = launch().await;
    let revoked = approve_everywhere(&runner, TestItem::ok()).await;

    let child = TestItem::bad();
    let child_id = child.id();
    let item = TestItem::ok().revoking(revoked).with_new_item(child).shared();
    let result = runner.register_and_wait(0, item, MAX_WAIT).await.unwrap();

    assert_eq!(result.state, ItemState::Declined);
    assert!(result.errors.iter().any(|e| e.error == ErrorCode::BadNewItem));
    assert_state_everywhere(&runner, &revoked, ItemState::Approved).await;
    assert_state_everywhere(&runner, &child_id, ItemState::Undefined).await;
    runner.shut_down().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_competing_revocations_never_both_approve() {
    let runner = launch().await;
    let revoked = approve_everywhere(&runner, TestItem::ok()).await;
    assert!(runner.wait_idle(MAX_WAIT).await);

    let first = TestItem::ok().revoking(revoked).shared();
    let second = TestItem::ok().revoking(revoked).shared();
    let (first_id, second_id) = (first.id(), second.id());
    let (a, b) = tokio::join!(
        runner.node(0).register_item(first),
        runner.node(9).register_item(second)
    );
    a.unwrap();
    b.unwrap();
    assert!(runner.wait_idle(Duration::from_secs(20)).await);

    let firsts = runner.states(&first_id).await.unwrap();
    let seconds = runner.states(&second_id).await.unwrap();
    let revokeds = runner.states(&revoked).await.unwrap();
    for idx in 0..runner.nodes().len() {
        let first_approved = firsts[idx] == ItemState::Approved;
        let second_approved = seconds[idx] == ItemState::Approved;
        assert!(!(first_approved && second_approved), "node {idx}");
        if first_approved || second_approved {
            assert_eq!(revokeds[idx], ItemState::Revoked, "node {idx}");
        }
    }
    runner.shut_down().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_new_items_are_created_on_approval() {
    let runner = launch().await;
    let child = TestItem::ok();
    let child_id = child.id();

    approve_everywhere(&runner, TestItem::ok().with_new_item(child)).await;
    assert_state_everywhere(&runner, &child_id, ItemState::Approved).await;
    runner.shut_down().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_new_items_are_not_created_when_declined() {
    let runner = launch().await;
    let child = TestItem::ok();
    let child_id = child.id();

    let item = TestItem::bad().with_new_item(child).shared();
    let result = runner.register_and_wait(0, item, MAX_WAIT).await.unwrap();
    assert_eq!(result.state, ItemState::Declined);

    assert!(runner.wait_idle(MAX_WAIT).await);
    for state in runner.states(&child_id).await.unwrap() {
        assert_eq!(state, ItemState::Undefined);
    }
    runner.shut_down().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_existing_new_item_declines() {
    let runner = launch().await;
    let child = TestItem::ok();
    let child_id = approve_everywhere(&runner, child.clone()).await;

    let item = TestItem::ok().with_new_item(child).shared();
    let result = runner.register_and_wait(0, item, MAX_WAIT).await.unwrap();
    assert_eq!(result.state, ItemState::Declined);
    assert!(result
        .errors
        .iter()
        .any(|e| e.error == ErrorCode::NewItemExists));
    assert_state_everywhere(&runner, &child_id, ItemState::Approved).await;
    runner.shut_down().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_approved_reference_is_accepted() {
    let runner = launch().await;
    let reference = approve_everywhere(&runner, TestItem::ok()).await;

    approve_everywhere(&runner, TestItem::ok().referencing(reference)).await;
    assert_state_everywhere(&runner, &reference, ItemState::Approved).await;
    runner.shut_down().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bad_references_decline() {
    let runner = launch().await;

    for bad_state in [
        ItemState::Pending,
        ItemState::PendingPositive,
        ItemState::PendingNegative,
        ItemState::Declined,
        ItemState::Revoked,
        ItemState::LockedForCreation,
    ] {
        let reference = HashId::random();
        runner
            .seed(reference, bad_state, 0..runner.nodes().len())
            .await
            .unwrap();

        let item = TestItem::ok().referencing(reference).shared();
        let result = runner.register_and_wait(0, item, MAX_WAIT).await.unwrap();
        assert_eq!(result.state, ItemState::Declined, "referencing {bad_state}");
        assert!(result.errors.iter().any(|e| e.error == ErrorCode::BadRef));

        // the referenced item is left alone
        for state in runner.states(&reference).await.unwrap() {
            assert_eq!(state, bad_state);
        }
    }
    runner.shut_down().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_references_decline() {
    let runner = launch().await;
    let existing = approve_everywhere(&runner, TestItem::ok()).await;
    let missing = HashId::random();

    let item: Arc<dyn Item> = TestItem::ok()
        .referencing(existing)
        .referencing(missing)
        .shared();
    let result = runner.register_and_wait(0, item, MAX_WAIT).await.unwrap();
    assert_eq!(result.state, ItemState::Declined);

    assert_state_everywhere(&runner, &existing, ItemState::Approved).await;
    assert!(runner.node(0).get_item(&missing).is_none());
    runner.shut_down().await;
}
