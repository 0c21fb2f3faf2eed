//! PostgreSQL store tests.
//!
//! Run with `DATABASE_URL` pointing at a scratch database and
//! `cargo test -- --ignored`. Each test works in its own pair of tables.

use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use spool_core::{
    CommitNotifier, CoreError, EntryState, EntryStore, NewEntry, NodeId, Payload,
    PostgresEntryStore, ReapPolicy, SearchKeys, TableNames,
};
use sqlx::PgPool;

async fn scratch_store() -> Result<PostgresEntryStore> {
    let url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = PgPool::connect(&url).await?;
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let tables = TableNames {
        table: format!("spool_test_{}", &suffix[..12]),
        history: format!("spool_test_{}_history", &suffix[..12]),
    };
    let store = PostgresEntryStore::new(pool, tables)?;
    store.ensure_schema().await?;
    Ok(store)
}

fn new_entry(owner: &NodeId) -> NewEntry {
    NewEntry::new(Payload::new("order.created", br#"{"order":1}"#.to_vec()), owner.clone())
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn concurrent_claims_never_overlap() -> Result<()> {
    let store = Arc::new(scratch_store().await?);
    let producer = NodeId::new("producer");
    for _ in 0..60 {
        store.append(new_entry(&producer)).await?;
    }

    let tasks = (0..6).map(|i| {
        let store = store.clone();
        tokio::spawn(async move {
            let node = NodeId::new(format!("node-{i}"));
            let mut ids = Vec::new();
            loop {
                let batch = store.claim_batch(4, &node, None).await?;
                if batch.is_empty() {
                    return Ok::<_, CoreError>(ids);
                }
                ids.extend(batch.into_iter().map(|e| e.id));
            }
        })
    });

    let mut all = Vec::new();
    for result in futures::future::join_all(tasks).await {
        all.extend(result??);
    }
    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(unique.len(), 60);
    assert_eq!(all.len(), 60);
    Ok(())
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn optimistic_update_and_reap() -> Result<()> {
    let store = scratch_store().await?;
    let node = NodeId::new("node-a");
    store.append(new_entry(&node)).await?;
    let claimed = store.claim_batch(1, &node, None).await?.remove(0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let policy = ReapPolicy {
        claim_timeout: Duration::from_millis(10),
        max_failure_retries: 3,
        penalize: false,
    };
    let reaped = store.reap_stale(policy).await?;
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].state, EntryState::Available);

    let mut done = claimed.clone();
    done.state = EntryState::Processed;
    let err = store.update(&claimed, &done).await.unwrap_err();
    assert!(matches!(err, CoreError::ConcurrentModification { .. }));

    let reclaimed = store.claim_batch(1, &node, Some(&node)).await?.remove(0);
    let mut done = reclaimed.clone();
    done.state = EntryState::Processed;
    store.update(&reclaimed, &done).await?;
    assert_eq!(store.count_by_state(EntryState::Processed).await?, 1);
    Ok(())
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn append_fires_notifier_and_purge_moves_history() -> Result<()> {
    let notifier = CommitNotifier::new();
    let mut subscription = notifier.subscribe();
    let store = scratch_store().await?.with_notifier(notifier);
    let node = NodeId::new("node-a");

    let entry =
        store.append(new_entry(&node).with_search_keys(SearchKeys::key1("cust-9"))).await?;
    assert_eq!(subscription.drain()[0].entry_ids, vec![entry.id]);
    assert_eq!(store.find_by_search_keys(Some("cust-9"), None).await?.len(), 1);

    let claimed = store.claim_batch(1, &node, None).await?.remove(0);
    let mut done = claimed.clone();
    done.state = EntryState::Processed;
    store.update(&claimed, &done).await?;

    let moved = store.purge(chrono::Utc::now() + chrono::Duration::seconds(1)).await?;
    assert_eq!(moved, 1);
    let archived = store.find_by_id(entry.id).await?.context("entry should be in history")?;
    assert_eq!(archived.state, EntryState::Processed);
    Ok(())
}
