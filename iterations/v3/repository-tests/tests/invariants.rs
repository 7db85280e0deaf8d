//! Covers the ten invariants enumerated for the repository core: one live
//! state per stream, per-stream serialisation, cache endurance, the pin
//! policy truth table, SYNC_ALWAYS tip retention, capability expiration
//! deferral, and idempotent close.

mod common;

use std::sync::Arc;

use agent_agency_repository::{CreateOpts, LoadOpts, SyncMode, WriteOpts};
use agent_agency_repository_contracts::{CacaoEnvelope, RepositoryError};

#[tokio::test]
async fn single_live_state_per_stream() {
    let h = common::harness(10, vec![]);
    let id = common::seed_genesis(&h, "a", serde_json::json!({})).await;
    h.repo.apply_create_opts(&id, &CreateOpts::default()).await.unwrap();

    let first = h.repo.load(&id, &LoadOpts::default()).await.unwrap();
    let second = h.repo.load(&id, &LoadOpts::default()).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let mut sub_a = h.repo.updates(first.current()).await;
    let mut sub_b = h.repo.updates(second.current()).await;
    h.repo
        .apply_commit(&id, common::commit("c1", serde_json::json!({"v": 1})), &WriteOpts::default())
        .await
        .unwrap();
    sub_a.changed().await.unwrap();
    sub_b.changed().await.unwrap();
    assert_eq!(sub_a.current(), sub_b.current());
}

#[tokio::test]
async fn commits_on_same_stream_apply_in_submission_order() {
    let h = common::harness(10, vec![]);
    let id = common::seed_genesis(&h, "a", serde_json::json!({})).await;
    h.repo.apply_create_opts(&id, &CreateOpts::default()).await.unwrap();

    let repo1 = h.repo.clone();
    let id1 = id.clone();
    let t1 = tokio::spawn(async move {
        repo1
            .apply_commit(&id1, common::commit("c1", serde_json::json!({"v": 1})), &WriteOpts::default())
            .await
    });
    tokio::task::yield_now().await;

    let repo2 = h.repo.clone();
    let id2 = id.clone();
    let t2 = tokio::spawn(async move {
        repo2
            .apply_commit(&id2, common::commit("c2", serde_json::json!({"v": 2})), &WriteOpts::default())
            .await
    });

    t1.await.unwrap().unwrap();
    t2.await.unwrap().unwrap();

    let state = h.repo.stream_state(&id).unwrap();
    assert_eq!(state.log.len(), 3);
    assert_eq!(state.log[1].cid.0, "c1");
    assert_eq!(state.log[2].cid.0, "c2");
}

#[tokio::test]
async fn endured_subscription_survives_cache_pressure() {
    let h = common::harness(1, vec![]);
    let a = common::seed_genesis(&h, "a", serde_json::json!({})).await;
    h.repo.apply_create_opts(&a, &CreateOpts::default()).await.unwrap();
    let running_a = h.repo.load(&a, &LoadOpts::default()).await.unwrap();
    let sub = h.repo.updates(running_a.current()).await;

    for label in ["b", "c", "d"] {
        let id = common::seed_genesis(&h, label, serde_json::json!({})).await;
        h.repo.apply_create_opts(&id, &CreateOpts::default()).await.unwrap();
    }

    assert_eq!(h.repo.stream_state(&a), Some(running_a.current()));
    assert!(!running_a.is_complete());
    drop(sub);

    let e = common::seed_genesis(&h, "e", serde_json::json!({})).await;
    h.repo.apply_create_opts(&e, &CreateOpts::default()).await.unwrap();
    assert_eq!(h.repo.stream_state(&a), None);
}

#[tokio::test]
async fn create_defaults_to_pinned() {
    let h = common::harness(10, vec![]);
    let id = common::seed_genesis(&h, "a", serde_json::json!({})).await;
    let running = h.repo.apply_create_opts(&id, &CreateOpts::default()).await.unwrap();
    assert!(running.is_pinned());
    assert_eq!(h.repo.list_pinned(Some(&id)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn update_with_pin_false_does_not_unpin() {
    let h = common::harness(10, vec![]);
    let id = common::seed_genesis(&h, "a", serde_json::json!({})).await;
    let running = h.repo.apply_create_opts(&id, &CreateOpts::default()).await.unwrap();
    assert!(running.is_pinned());

    let opts = WriteOpts { pin: Some(false), publish: false, anchor: false };
    h.repo
        .apply_commit(&id, common::commit("c1", serde_json::json!({})), &opts)
        .await
        .unwrap();
    assert!(running.is_pinned());
}

/// An update on an already-pinned stream must re-persist the new state,
/// not just the state pinning captured at create time: otherwise an
/// evict-then-reload rehydrates stale (pre-update) data.
#[tokio::test]
async fn update_on_pinned_stream_persists_new_state_across_eviction() {
    let h = common::harness(1, vec![]);
    let id = common::seed_genesis(&h, "a", serde_json::json!({})).await;
    h.repo.apply_create_opts(&id, &CreateOpts::default()).await.unwrap();

    h.repo
        .apply_commit(&id, common::commit("c1", serde_json::json!({"v": 1})), &WriteOpts::default())
        .await
        .unwrap();
    let updated_log = h.repo.stream_state(&id).unwrap().log;
    assert_eq!(updated_log.len(), 2);

    // cache_limit=1: loading a second stream evicts `id` from memory.
    let other = common::seed_genesis(&h, "b", serde_json::json!({})).await;
    h.repo.apply_create_opts(&other, &CreateOpts::default()).await.unwrap();
    assert_eq!(h.repo.stream_state(&id), None);

    let reloaded = h.repo.load(&id, &LoadOpts::default()).await.unwrap();
    assert_eq!(reloaded.current().log, updated_log);
}

#[tokio::test]
async fn indexed_stream_becomes_pinned_on_update_regardless_of_pin_opt() {
    let h = common::harness(10, vec!["gpt-test"]);
    let id = common::seed_model_genesis(&h, "indexed", "unindexed-model").await;

    let create_opts = CreateOpts { pin: Some(false), ..CreateOpts::default() };
    let running = h.repo.apply_create_opts(&id, &create_opts).await.unwrap();
    assert!(!running.is_pinned());

    // An update tags the stream with a model that does qualify for
    // indexing. Caller passes no pin preference at all; the pin still
    // flips because `should_index_stream` is now true (truth table:
    // UPDATE/LOAD, opts.pin = undefined, model? = true -> pin).
    let indexing_commit = common::commit("c1", serde_json::json!({"model": "gpt-test"}));
    h.repo.apply_commit(&id, indexing_commit, &WriteOpts::default()).await.unwrap();
    assert!(running.is_pinned());
    assert_eq!(h.indexing.indexed_records().await.len(), 1);
}

#[tokio::test]
async fn create_with_explicit_pin_false_is_honoured_even_when_indexed() {
    let h = common::harness(10, vec!["gpt-test"]);
    let id = common::seed_model_genesis(&h, "indexed", "gpt-test").await;

    // Per the pin-policy truth table, CREATE + opts.pin=false is an
    // unconditional no-op: an explicit create-time opt-out wins even over
    // an indexed model.
    let opts = CreateOpts { pin: Some(false), ..CreateOpts::default() };
    let running = h.repo.apply_create_opts(&id, &opts).await.unwrap();
    assert!(!running.is_pinned());
}

#[tokio::test]
async fn sync_always_retains_local_tip_unknown_to_network() {
    let h = common::harness(10, vec![]);
    let id = common::seed_genesis(&h, "a", serde_json::json!({})).await;

    // Network only knows about one commit past genesis.
    let net_commit = agent_agency_repository_contracts::Cid::new("net-c1");
    h.dispatcher
        .seed_commit(net_commit.clone(), serde_json::to_vec(&serde_json::json!({"v": "net"})).unwrap())
        .await;
    h.dispatcher.seed_tip(id.clone(), net_commit.clone()).await;

    // Local store has advanced two commits past genesis, on a branch the
    // network has not seen.
    let local_state = common::offline_state(&id, &[&id.genesis.0, "local-c1", "local-c2"], serde_json::json!({"v": "local"}));
    h.state_store.save(&local_state).await.unwrap();

    let load_opts = LoadOpts { sync: SyncMode::SyncAlways, ..LoadOpts::default() };
    let running = h.repo.load(&id, &load_opts).await.unwrap();

    let final_state = running.current();
    assert_eq!(final_state.tip.0, "local-c2");
    assert_eq!(final_state.log.len(), 3);
}

#[tokio::test]
async fn capability_expiration_is_deferred_then_enforced() {
    let h = common::harness(10, vec![]);
    let id = common::seed_genesis(&h, "a", serde_json::json!({})).await;
    h.repo.apply_create_opts(&id, &CreateOpts::default()).await.unwrap();

    let mut expiring_commit = common::commit("c1", serde_json::json!({}));
    expiring_commit.envelope = Some(CacaoEnvelope {
        expires_at: Some(chrono::Utc::now() - chrono::Duration::seconds(10)),
    });
    h.repo
        .apply_commit(&id, expiring_commit, &WriteOpts::default())
        .await
        .unwrap();

    let skip_opts = LoadOpts { skip_cacao_expiration_checks: true, ..LoadOpts::default() };
    h.repo.load(&id, &skip_opts).await.expect("deferred check must not raise");

    let err = h.repo.load(&id, &LoadOpts::default()).await.unwrap_err();
    assert!(matches!(err, RepositoryError::CapabilityExpired(_)));
}

#[tokio::test]
async fn close_is_idempotent_and_rejects_further_operations() {
    let h = common::harness(10, vec![]);
    let id = common::seed_genesis(&h, "a", serde_json::json!({})).await;
    h.repo.apply_create_opts(&id, &CreateOpts::default()).await.unwrap();

    h.repo.close().await.unwrap();
    h.repo.close().await.unwrap();

    let err = h.repo.load(&id, &LoadOpts::default()).await.unwrap_err();
    assert!(matches!(err, RepositoryError::QueueClosed));
}
