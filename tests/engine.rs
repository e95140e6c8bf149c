//! Engine integration tests over a throwaway SQLite database.
//!
//! Each test builds its own temp database, so they run in parallel without
//! interference.

use std::time::Duration;

use sqlx::SqlitePool;
use tempfile::TempDir;

use research_forge::config::{Config, DbConfig};
use research_forge::db;
use research_forge::error::EngineError;
use research_forge::index::{IndexFilters, VectorIndex};
use research_forge::migrate;
use research_forge::models::{Chunk, OutputPatch, ReferenceDocument, TaskStatus};
use research_forge::queue::{FailOutcome, RetryPolicy, TaskQueue};
use research_forge::retrieval;
use research_forge::store::{OutputStore, SearchFilters};

fn test_config(tmp: &TempDir) -> Config {
    Config {
        db: DbConfig {
            path: tmp.path().join("forge.sqlite"),
        },
        queue: Default::default(),
        retrieval: Default::default(),
        embedding: Default::default(),
        generation: Default::default(),
        ingest: Default::default(),
    }
}

async fn setup() -> (TempDir, Config, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let pool = db::connect(&config).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    (tmp, config, pool)
}

fn short_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_secs(30),
        multiplier: 2.0,
    }
}

const LEASE: Duration = Duration::from_secs(300);

/// Force a task's lease into the past, simulating a crashed worker.
async fn expire_claim(pool: &SqlitePool, task_id: &str) {
    sqlx::query("UPDATE tasks SET claim_expires_at = ? WHERE id = ?")
        .bind(chrono::Utc::now().timestamp() - 60)
        .bind(task_id)
        .execute(pool)
        .await
        .unwrap();
}

/// Clear a task's backoff gate so it is immediately claimable again.
async fn clear_backoff(pool: &SqlitePool, task_id: &str) {
    sqlx::query("UPDATE tasks SET not_before = 0 WHERE id = ?")
        .bind(task_id)
        .execute(pool)
        .await
        .unwrap();
}

/// Register a parent reference document so chunks can point at it.
async fn add_reference_doc(index: &VectorIndex, id: &str) {
    let now = chrono::Utc::now().timestamp();
    index
        .upsert_document(&ReferenceDocument {
            id: id.to_string(),
            title: id.to_string(),
            path: format!("reference/{}.md", id),
            platform: None,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();
}

// ============ Queue ============

#[tokio::test]
async fn test_enqueue_idempotent_while_active() {
    let (_tmp, _config, pool) = setup().await;
    let queue = TaskQueue::new(pool.clone(), short_policy());

    let first = queue.enqueue("T1055", "Process Injection", "windows").await.unwrap();
    assert!(first.created);

    let second = queue.enqueue("T1055", "Process Injection", "windows").await.unwrap();
    assert!(!second.created);
    assert_eq!(first.task_id, second.task_id);

    // Still idempotent after the task is claimed
    let claimed = queue.claim("w1", LEASE).await.unwrap().unwrap();
    assert_eq!(claimed.id, first.task_id);
    let third = queue.enqueue("T1055", "Process Injection", "windows").await.unwrap();
    assert!(!third.created);
    assert_eq!(third.task_id, first.task_id);

    // A different key is independent
    let other = queue.enqueue("T1055", "Process Injection", "linux").await.unwrap();
    assert!(other.created);
}

#[tokio::test]
async fn test_enqueue_after_completion_creates_fresh_task() {
    let (_tmp, _config, pool) = setup().await;
    let queue = TaskQueue::new(pool.clone(), short_policy());

    let first = queue.enqueue("T1134", "", "windows").await.unwrap();
    let task = queue.claim("w1", LEASE).await.unwrap().unwrap();
    queue.complete(&task.id, "w1").await.unwrap();

    let second = queue.enqueue("T1134", "", "windows").await.unwrap();
    assert!(second.created);
    assert_ne!(first.task_id, second.task_id);
}

#[tokio::test]
async fn test_concurrent_claims_are_disjoint() {
    let (_tmp, _config, pool) = setup().await;
    let queue = TaskQueue::new(pool.clone(), short_policy());

    const N: usize = 8;
    for i in 0..N {
        queue
            .enqueue(&format!("T10{:02}", i), "", "windows")
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for i in 0..N {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            queue.claim(&format!("w{}", i), LEASE).await.unwrap()
        }));
    }

    let mut claimed_ids: Vec<String> = Vec::new();
    for handle in handles {
        let task = handle.await.unwrap().expect("every claimer should win one task");
        claimed_ids.push(task.id);
    }

    claimed_ids.sort();
    claimed_ids.dedup();
    assert_eq!(claimed_ids.len(), N, "claims must be disjoint");

    // Nothing left to claim
    assert!(queue.claim("late", LEASE).await.unwrap().is_none());
}

#[tokio::test]
async fn test_claim_is_fifo() {
    let (_tmp, _config, pool) = setup().await;
    let queue = TaskQueue::new(pool.clone(), short_policy());

    // created_at has second granularity; distinct ids make ordering
    // deterministic via the (created_at, id) sort only when times differ,
    // so verify FIFO over two tasks created a second apart.
    let first = queue.enqueue("T1001", "", "windows").await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    queue.enqueue("T1002", "", "windows").await.unwrap();

    let claimed = queue.claim("w1", LEASE).await.unwrap().unwrap();
    assert_eq!(claimed.id, first.task_id);
}

#[tokio::test]
async fn test_expired_lease_is_reclaimable() {
    let (_tmp, _config, pool) = setup().await;
    let queue = TaskQueue::new(pool.clone(), short_policy());

    let enq = queue.enqueue("T1003", "OS Credential Dumping", "windows").await.unwrap();
    let task_a = queue.claim("worker-a", LEASE).await.unwrap().unwrap();
    assert_eq!(task_a.id, enq.task_id);

    // Live lease: nothing for worker B
    assert!(queue.claim("worker-b", LEASE).await.unwrap().is_none());

    expire_claim(&pool, &task_a.id).await;

    let task_b = queue.claim("worker-b", LEASE).await.unwrap().unwrap();
    assert_eq!(task_b.id, task_a.id, "same task recovered after expiry");
    assert_eq!(task_b.owner.as_deref(), Some("worker-b"));
}

#[tokio::test]
async fn test_stale_worker_loses_ownership() {
    let (_tmp, _config, pool) = setup().await;
    let queue = TaskQueue::new(pool.clone(), short_policy());

    queue.enqueue("T1003", "", "windows").await.unwrap();
    let task = queue.claim("worker-a", LEASE).await.unwrap().unwrap();

    expire_claim(&pool, &task.id).await;
    queue.claim("worker-b", LEASE).await.unwrap().unwrap();

    // The original owner's operations must all fail with NotOwner
    let hb = queue.heartbeat(&task.id, "worker-a", LEASE).await;
    assert!(matches!(hb, Err(EngineError::NotOwner { .. })), "{:?}", hb);

    let done = queue.complete(&task.id, "worker-a").await;
    assert!(matches!(done, Err(EngineError::NotOwner { .. })));

    let failed = queue.fail(&task.id, "worker-a", "boom").await;
    assert!(matches!(failed, Err(EngineError::NotOwner { .. })));

    // The new owner is unaffected
    queue.heartbeat(&task.id, "worker-b", LEASE).await.unwrap();
    queue.complete(&task.id, "worker-b").await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_extends_live_claim() {
    let (_tmp, _config, pool) = setup().await;
    let queue = TaskQueue::new(pool.clone(), short_policy());

    queue.enqueue("T1003", "", "linux").await.unwrap();
    let task = queue.claim("w1", LEASE).await.unwrap().unwrap();
    let before = task.claim_expires_at.unwrap();

    queue
        .heartbeat(&task.id, "w1", Duration::from_secs(3600))
        .await
        .unwrap();

    let after = queue.get_task(&task.id).await.unwrap().claim_expires_at.unwrap();
    assert!(after > before);
}

#[tokio::test]
async fn test_fail_requeues_with_backoff_until_terminal() {
    let (_tmp, _config, pool) = setup().await;
    let queue = TaskQueue::new(
        pool.clone(),
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_secs(60),
            multiplier: 2.0,
        },
    );

    queue.enqueue("T1059", "Command and Scripting", "linux").await.unwrap();
    let task = queue.claim("w1", LEASE).await.unwrap().unwrap();

    // First failure: back to pending, gated by backoff
    let outcome = queue.fail(&task.id, "w1", "generation timeout").await.unwrap();
    assert_eq!(outcome, FailOutcome::Requeued);

    let after = queue.get_task(&task.id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Pending);
    assert_eq!(after.attempt_count, 1);
    assert_eq!(after.last_error.as_deref(), Some("generation timeout"));
    assert!(after.not_before > chrono::Utc::now().timestamp());

    // Backoff gate holds the task back
    assert!(queue.claim("w1", LEASE).await.unwrap().is_none());

    clear_backoff(&pool, &task.id).await;
    let task = queue.claim("w1", LEASE).await.unwrap().unwrap();

    // Second failure hits max_attempts: terminal
    let outcome = queue.fail(&task.id, "w1", "still broken").await.unwrap();
    assert_eq!(outcome, FailOutcome::Terminal);

    let after = queue.get_task(&task.id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Failed);
    assert_eq!(after.last_error.as_deref(), Some("still broken"));

    // Terminal tasks are never claimed again
    assert!(queue.claim("w1", LEASE).await.unwrap().is_none());

    // Operations against the failed task are classified as such
    let hb = queue.heartbeat(&after.id, "w1", LEASE).await;
    assert!(matches!(hb, Err(EngineError::MaxAttemptsExceeded(_))));
}

#[tokio::test]
async fn test_release_records_cancellation() {
    let (_tmp, _config, pool) = setup().await;
    let queue = TaskQueue::new(pool.clone(), short_policy());

    queue.enqueue("T1071", "", "windows").await.unwrap();
    let task = queue.claim("w1", LEASE).await.unwrap().unwrap();

    let outcome = queue.release(&task.id, "w1").await.unwrap();
    assert_eq!(outcome, FailOutcome::Requeued);

    let after = queue.get_task(&task.id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Pending);
    assert_eq!(after.last_error.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn test_requeue_revives_failed_task() {
    let (_tmp, _config, pool) = setup().await;
    let queue = TaskQueue::new(
        pool.clone(),
        RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
        },
    );

    queue.enqueue("T1105", "", "windows").await.unwrap();
    let task = queue.claim("w1", LEASE).await.unwrap().unwrap();
    assert_eq!(
        queue.fail(&task.id, "w1", "boom").await.unwrap(),
        FailOutcome::Terminal
    );

    // No failed task for an unknown key
    let missing = queue.requeue("T9999", "windows").await;
    assert!(matches!(missing, Err(EngineError::NotFound(_))));

    let revived_id = queue.requeue("T1105", "windows").await.unwrap();
    assert_eq!(revived_id, task.id);

    let revived = queue.get_task(&revived_id).await.unwrap();
    assert_eq!(revived.status, TaskStatus::Pending);
    assert_eq!(revived.attempt_count, 0);
    assert!(revived.last_error.is_none());

    let reclaimed = queue.claim("w2", LEASE).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, task.id);
}

#[tokio::test]
async fn test_queue_stats_by_status() {
    let (_tmp, _config, pool) = setup().await;
    let queue = TaskQueue::new(pool.clone(), short_policy());

    queue.enqueue("T1001", "", "windows").await.unwrap();
    queue.enqueue("T1002", "", "linux").await.unwrap();
    let task = queue.claim("w1", LEASE).await.unwrap().unwrap();
    queue.complete(&task.id, "w1").await.unwrap();

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.total, 2);
    assert!(stats.by_status.contains(&("completed".to_string(), 1)));
    assert!(stats.by_status.contains(&("pending".to_string(), 1)));
}

// ============ Output store ============

#[tokio::test]
async fn test_upsert_merges_partial_sections() {
    let (_tmp, _config, pool) = setup().await;
    let store = OutputStore::new(pool.clone());

    let first = OutputPatch {
        description: Some("Injection overview".into()),
        ..OutputPatch::new("T1055", "windows")
    };
    let created = store.upsert(&first).await.unwrap();
    assert!(created.created_at > 0);

    let second = OutputPatch {
        detection: Some("Watch for remote thread creation".into()),
        ..OutputPatch::new("T1055", "windows")
    };
    store.upsert(&second).await.unwrap();

    let merged = store.get("T1055", "windows").await.unwrap();
    assert_eq!(merged.description, "Injection overview");
    assert_eq!(merged.detection, "Watch for remote thread creation");
    assert_eq!(merged.created_at, created.created_at);
}

#[tokio::test]
async fn test_completeness_three_of_six_is_half() {
    let (_tmp, _config, pool) = setup().await;
    let store = OutputStore::new(pool.clone());

    let patch = OutputPatch {
        description: Some("a".into()),
        detection: Some("b".into()),
        mitigation: Some("c".into()),
        ..OutputPatch::new("T1547", "windows")
    };
    let stored = store.upsert(&patch).await.unwrap();
    assert_eq!(stored.completeness_score, 0.5);

    let fetched = store.get("T1547", "windows").await.unwrap();
    assert_eq!(fetched.completeness_score, 0.5);
}

#[tokio::test]
async fn test_store_round_trip_preserves_all_fields() {
    let (_tmp, _config, pool) = setup().await;
    let store = OutputStore::new(pool.clone());

    let mut custom = serde_json::Map::new();
    custom.insert("reviewed_by".to_string(), serde_json::json!("analyst-7"));

    let patch = OutputPatch {
        technique_name: Some("Process Injection".into()),
        description: Some("desc".into()),
        detection: Some("det".into()),
        mitigation: Some("mit".into()),
        playbook: Some("play".into()),
        references: Some("refs".into()),
        notes: Some("notes".into()),
        confidence_score: Some(7.5),
        sources: Some(vec!["doc-a".into(), "doc-b".into()]),
        tags: Some(vec!["windows".into(), "injection".into()]),
        related_techniques: Some(vec!["T1003".into()]),
        research_context: Some("[Source: doc-a]\ncontext".into()),
        custom_fields: Some(custom.clone()),
        ..OutputPatch::new("T1055", "windows")
    };

    store.upsert(&patch).await.unwrap();
    let output = store.get("T1055", "windows").await.unwrap();

    assert_eq!(output.technique_name, "Process Injection");
    assert_eq!(output.description, "desc");
    assert_eq!(output.detection, "det");
    assert_eq!(output.mitigation, "mit");
    assert_eq!(output.playbook, "play");
    assert_eq!(output.references, "refs");
    assert_eq!(output.notes, "notes");
    assert_eq!(output.confidence_score, 7.5);
    assert_eq!(output.sources, vec!["doc-a".to_string(), "doc-b".to_string()]);
    assert_eq!(output.tags, vec!["windows".to_string(), "injection".to_string()]);
    assert_eq!(output.related_techniques, vec!["T1003".to_string()]);
    assert_eq!(output.research_context.as_deref(), Some("[Source: doc-a]\ncontext"));
    assert_eq!(output.custom_fields, Some(custom));
    assert_eq!(output.completeness_score, 1.0);
    assert!(output.created_at > 0);
    assert!(output.last_updated >= output.created_at);
}

#[tokio::test]
async fn test_get_missing_is_not_found() {
    let (_tmp, _config, pool) = setup().await;
    let store = OutputStore::new(pool.clone());
    let missing = store.get("T0000", "windows").await;
    assert!(matches!(missing, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn test_validation_rejected_before_write() {
    let (_tmp, _config, pool) = setup().await;
    let store = OutputStore::new(pool.clone());

    let patch = OutputPatch {
        confidence_score: Some(42.0),
        description: Some("x".into()),
        ..OutputPatch::new("T1055", "windows")
    };
    let result = store.upsert(&patch).await;
    assert!(matches!(result, Err(EngineError::Validation(_))));

    // Nothing was persisted
    assert!(store.get("T1055", "windows").await.is_err());
}

#[tokio::test]
async fn test_search_full_text_and_filters() {
    let (_tmp, _config, pool) = setup().await;
    let store = OutputStore::new(pool.clone());

    store
        .upsert(&OutputPatch {
            technique_name: Some("OS Credential Dumping".into()),
            description: Some("Dumping credentials from lsass memory".into()),
            detection: Some("Monitor lsass handle access".into()),
            confidence_score: Some(8.0),
            sources: Some(vec!["a".into(), "b".into(), "c".into()]),
            tags: Some(vec!["windows".into(), "credential_access".into()]),
            ..OutputPatch::new("T1003", "windows")
        })
        .await
        .unwrap();

    store
        .upsert(&OutputPatch {
            technique_name: Some("Scheduled Task".into()),
            description: Some("Persistence via cron entries".into()),
            ..OutputPatch::new("T1053", "linux")
        })
        .await
        .unwrap();

    // Full-text query hits only the matching document
    let hits = store
        .search(Some("lsass"), &SearchFilters::default(), 10)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].technique_id, "T1003");

    // Platform filter
    let hits = store
        .search(
            None,
            &SearchFilters {
                platform: Some("linux".into()),
                ..Default::default()
            },
            10,
        )
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].technique_id, "T1053");

    // Quality threshold filters out the thin document
    let hits = store
        .search(
            None,
            &SearchFilters {
                min_quality_score: Some(0.25),
                ..Default::default()
            },
            10,
        )
        .await
        .unwrap();
    assert!(hits.iter().all(|h| h.quality_score >= 0.25));

    // has_section filter
    let hits = store
        .search(
            None,
            &SearchFilters {
                has_section: Some("detection".into()),
                ..Default::default()
            },
            10,
        )
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].technique_id, "T1003");

    // Tag filter
    let hits = store
        .search(
            None,
            &SearchFilters {
                tag: Some("credential_access".into()),
                ..Default::default()
            },
            10,
        )
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
}

#[tokio::test]
async fn test_archive_removes_from_primary_preserving_history() {
    let (_tmp, _config, pool) = setup().await;
    let store = OutputStore::new(pool.clone());

    store
        .upsert(&OutputPatch {
            description: Some("to be archived".into()),
            ..OutputPatch::new("T1027", "windows")
        })
        .await
        .unwrap();

    store.archive("T1027", "windows").await.unwrap();

    assert!(matches!(
        store.get("T1027", "windows").await,
        Err(EngineError::NotFound(_))
    ));

    let hits = store
        .search(Some("archived"), &SearchFilters::default(), 10)
        .await
        .unwrap();
    assert!(hits.is_empty());

    let analytics = store.analytics_summary().await.unwrap();
    assert_eq!(analytics.total_outputs, 0);
    assert_eq!(analytics.archived_outputs, 1);

    // Archiving twice is an error
    assert!(matches!(
        store.archive("T1027", "windows").await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_analytics_summary_aggregates() {
    let (_tmp, _config, pool) = setup().await;
    let store = OutputStore::new(pool.clone());

    for (technique, platform) in [("T1003", "windows"), ("T1055", "windows"), ("T1053", "linux")] {
        store
            .upsert(&OutputPatch {
                description: Some("content".into()),
                confidence_score: Some(5.0),
                ..OutputPatch::new(technique, platform)
            })
            .await
            .unwrap();
    }

    let analytics = store.analytics_summary().await.unwrap();
    assert_eq!(analytics.total_outputs, 3);
    assert!((analytics.avg_confidence - 5.0).abs() < 1e-9);
    assert!(analytics.avg_quality > 0.0);
    assert!(analytics.by_platform.contains(&("windows".to_string(), 2)));
    assert!(analytics.by_platform.contains(&("linux".to_string(), 1)));
    assert!(analytics
        .section_coverage
        .contains(&("description".to_string(), 3)));
    assert!(analytics
        .section_coverage
        .contains(&("detection".to_string(), 0)));
}

// ============ Vector index & retrieval ============

#[tokio::test]
async fn test_index_is_idempotent_by_content_hash() {
    let (_tmp, _config, pool) = setup().await;
    let index = VectorIndex::new(pool.clone());
    add_reference_doc(&index, "doc1").await;

    let chunk = Chunk::new("doc1", "identical text", vec![1.0, 0.0], None, vec![]);
    assert!(index.index_chunk(&chunk).await.unwrap());
    assert!(!index.index_chunk(&chunk).await.unwrap(), "re-index is a no-op");

    let stats = index.stats().await.unwrap();
    assert_eq!(stats.total_chunks, 1);
}

#[tokio::test]
async fn test_index_search_filters_and_orders() {
    let (_tmp, _config, pool) = setup().await;
    let index = VectorIndex::new(pool.clone());
    add_reference_doc(&index, "doc-win").await;
    add_reference_doc(&index, "doc-lin").await;

    let windows_hit = Chunk::new(
        "doc-win",
        "windows injection notes",
        vec![0.9, 0.1],
        Some("windows".into()),
        vec!["T1055".into()],
    );
    // Higher raw similarity, wrong platform
    let linux_hit = Chunk::new(
        "doc-lin",
        "linux notes",
        vec![1.0, 0.0],
        Some("linux".into()),
        vec!["T1055".into()],
    );
    index.index_chunk(&windows_hit).await.unwrap();
    index.index_chunk(&linux_hit).await.unwrap();

    let query = vec![1.0, 0.0];

    // Unfiltered: linux chunk ranks first on similarity
    let results = index.search(&query, 10, &IndexFilters::default()).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].chunk.document_id, "doc-lin");

    // Platform filter excludes the higher-similarity linux chunk entirely
    let filters = IndexFilters {
        platform: Some("windows".into()),
        technique: None,
    };
    let results = index.search(&query, 10, &filters).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk.document_id, "doc-win");

    // Technique filter
    let filters = IndexFilters {
        platform: None,
        technique: Some("T9999".into()),
    };
    assert!(index.search(&query, 10, &filters).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_index_tie_break_is_insertion_order() {
    let (_tmp, _config, pool) = setup().await;
    let index = VectorIndex::new(pool.clone());
    add_reference_doc(&index, "doc-a").await;
    add_reference_doc(&index, "doc-b").await;

    // Identical vectors => identical similarity; insertion order decides
    let first = Chunk::new("doc-a", "first inserted", vec![1.0, 0.0], None, vec![]);
    let second = Chunk::new("doc-b", "second inserted", vec![1.0, 0.0], None, vec![]);
    index.index_chunk(&first).await.unwrap();
    index.index_chunk(&second).await.unwrap();

    let results = index
        .search(&[1.0, 0.0], 10, &IndexFilters::default())
        .await
        .unwrap();
    assert_eq!(results[0].chunk.document_id, "doc-a");
    assert_eq!(results[1].chunk.document_id, "doc-b");
}

#[tokio::test]
async fn test_remove_document_deletes_its_chunks() {
    let (_tmp, _config, pool) = setup().await;
    let index = VectorIndex::new(pool.clone());
    add_reference_doc(&index, "doc-a").await;
    add_reference_doc(&index, "doc-b").await;

    index
        .index_chunk(&Chunk::new("doc-a", "keep", vec![1.0], None, vec![]))
        .await
        .unwrap();
    index
        .index_chunk(&Chunk::new("doc-b", "drop", vec![1.0], None, vec![]))
        .await
        .unwrap();

    let removed = index.remove_document("doc-b").await.unwrap();
    assert_eq!(removed, 1);

    let results = index.search(&[1.0], 10, &IndexFilters::default()).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk.document_id, "doc-a");
}

#[tokio::test]
async fn test_retrieval_respects_budget_and_filters() {
    let (_tmp, mut config, pool) = setup().await;
    config.retrieval.max_chars = 120;
    config.retrieval.max_chunks = 4;

    let index = VectorIndex::new(pool.clone());
    add_reference_doc(&index, "doc-win").await;
    index
        .index_chunk(&Chunk::new(
            "doc-win",
            &"windows evidence ".repeat(40),
            vec![1.0, 0.0],
            Some("windows".into()),
            vec![],
        ))
        .await
        .unwrap();

    let filters = IndexFilters {
        platform: Some("windows".into()),
        technique: None,
    };
    let block = retrieval::retrieve_with_vector(&index, &[1.0, 0.0], &filters, &config)
        .await
        .unwrap();

    assert!(!block.is_empty());
    assert!(block.text.len() <= 120, "budget exceeded: {}", block.text.len());
    assert_eq!(block.sources, vec!["doc-win".to_string()]);
}

#[tokio::test]
async fn test_retrieval_empty_index_yields_empty_context() {
    let (_tmp, config, pool) = setup().await;
    let index = VectorIndex::new(pool.clone());

    let block = retrieval::retrieve_with_vector(
        &index,
        &[1.0, 0.0],
        &IndexFilters::default(),
        &config,
    )
    .await
    .unwrap();

    assert!(block.is_empty());
    assert!(block.sources.is_empty());
}

// ============ End-to-end scenario ============

#[tokio::test]
async fn test_full_research_cycle() {
    let (_tmp, config, pool) = setup().await;
    let queue = TaskQueue::new(pool.clone(), short_policy());
    let store = OutputStore::new(pool.clone());
    let index = VectorIndex::new(pool.clone());
    add_reference_doc(&index, "doc-win").await;
    add_reference_doc(&index, "doc-lin").await;

    // Reference chunks: a linux chunk with higher raw similarity must not
    // leak into a windows task's context.
    index
        .index_chunk(&Chunk::new(
            "doc-win",
            "T1055 process injection on windows via CreateRemoteThread",
            vec![0.9, 0.1],
            Some("windows".into()),
            vec!["T1055".into()],
        ))
        .await
        .unwrap();
    index
        .index_chunk(&Chunk::new(
            "doc-lin",
            "ptrace based injection on linux",
            vec![1.0, 0.0],
            Some("linux".into()),
            vec!["T1055".into()],
        ))
        .await
        .unwrap();

    // Enqueue and claim
    queue.enqueue("T1055", "Process Injection", "windows").await.unwrap();
    let task = queue.claim("w1", LEASE).await.unwrap().unwrap();
    queue.start(&task.id, "w1").await.unwrap();

    // Retrieval filtered to the task's platform and technique
    let filters = IndexFilters {
        platform: Some(task.platform.clone()),
        technique: Some(task.technique_id.clone()),
    };
    let context = retrieval::retrieve_with_vector(&index, &[1.0, 0.0], &filters, &config)
        .await
        .unwrap();
    assert_eq!(context.sources, vec!["doc-win".to_string()]);
    assert!(context.text.contains("CreateRemoteThread"));

    // "Generation" produces a description section; upsert and complete
    let patch = OutputPatch {
        technique_name: Some(task.technique_name.clone()),
        description: Some("Adversaries inject code into live processes.".into()),
        confidence_score: Some(7.0),
        sources: Some(context.sources.clone()),
        research_context: Some(context.text.clone()),
        ..OutputPatch::new(&task.technique_id, &task.platform)
    };
    store.upsert(&patch).await.unwrap();
    queue.complete(&task.id, "w1").await.unwrap();

    // The document exists with a nonzero completeness and the task is done
    let output = store.get("T1055", "windows").await.unwrap();
    assert!(output.completeness_score > 0.0);
    assert_eq!(output.sources, vec!["doc-win".to_string()]);

    let finished = queue.get_task(&task.id).await.unwrap();
    assert_eq!(finished.status, TaskStatus::Completed);
}
