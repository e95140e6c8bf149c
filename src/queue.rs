//! Durable research task queue.
//!
//! Tasks live in the shared SQLite store and move through
//! pending → claimed → in_progress → completed/failed, driven only by this
//! API. The claim operation is a single conditional UPDATE (compare-and-swap
//! on status), so concurrent workers never receive the same task. Expired
//! claims become eligible again on the next claim call, which recovers from
//! crashed workers without operator intervention.

use std::time::Duration;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::{ResearchTask, TaskStatus};

/// Explicit retry policy passed into the queue.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_secs(config.base_delay_secs),
            multiplier: config.backoff_multiplier,
        }
    }

    /// Delay before a task that has failed `attempt` times (1-based) may be
    /// claimed again: `base_delay × multiplier^(attempt − 1)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent as i32);
        Duration::from_secs_f64(secs)
    }
}

/// Outcome of [`TaskQueue::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueResult {
    pub task_id: String,
    /// False when an active task already existed for the key.
    pub created: bool,
}

/// Outcome of [`TaskQueue::fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Returned to pending; claimable again after the backoff delay.
    Requeued,
    /// Max attempts reached; terminal, requires operator re-enqueue.
    Terminal,
}

/// Counts for operator inspection.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub total: i64,
    pub by_status: Vec<(String, i64)>,
    pub by_platform: Vec<(String, i64)>,
}

#[derive(Clone)]
pub struct TaskQueue {
    pool: SqlitePool,
    policy: RetryPolicy,
}

impl TaskQueue {
    pub fn new(pool: SqlitePool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Insert a pending task unless an active task already exists for the
    /// (technique, platform) key; in that case the existing task id is
    /// returned and nothing is written.
    pub async fn enqueue(
        &self,
        technique_id: &str,
        technique_name: &str,
        platform: &str,
    ) -> EngineResult<EnqueueResult> {
        if technique_id.trim().is_empty() || platform.trim().is_empty() {
            return Err(EngineError::Validation(
                "technique_id and platform must be non-empty".to_string(),
            ));
        }

        let now = chrono::Utc::now().timestamp();
        let task_id = Uuid::new_v4().to_string();

        // The partial unique index on active tasks makes the insert a no-op
        // when an active task for this key already exists.
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (id, technique_id, technique_name, platform, status,
                               attempt_count, not_before, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'pending', 0, 0, ?, ?)
            ON CONFLICT(technique_id, platform)
                WHERE status IN ('pending', 'claimed', 'in_progress')
                DO NOTHING
            "#,
        )
        .bind(&task_id)
        .bind(technique_id)
        .bind(technique_name)
        .bind(platform)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            info!(task_id = %task_id, technique_id, platform, "enqueued research task");
            return Ok(EnqueueResult {
                task_id,
                created: true,
            });
        }

        let existing: String = sqlx::query_scalar(
            r#"
            SELECT id FROM tasks
            WHERE technique_id = ? AND platform = ?
              AND status IN ('pending', 'claimed', 'in_progress')
            "#,
        )
        .bind(technique_id)
        .bind(platform)
        .fetch_one(&self.pool)
        .await?;

        Ok(EnqueueResult {
            task_id: existing,
            created: false,
        })
    }

    /// Atomically claim the oldest eligible task for `worker_id`.
    ///
    /// Eligible: pending with its backoff gate elapsed, or claimed/
    /// in_progress with an expired lease (reclamation). The conditional
    /// UPDATE is the only mutual-exclusion point; under concurrent callers
    /// exactly one receives a given task. Returns `None` when nothing is
    /// eligible.
    pub async fn claim(
        &self,
        worker_id: &str,
        lease_duration: Duration,
    ) -> EngineResult<Option<ResearchTask>> {
        let now = chrono::Utc::now().timestamp();
        let expires = now + lease_duration.as_secs() as i64;

        let row = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'claimed', owner = ?1, claim_expires_at = ?2, updated_at = ?3
            WHERE id = (
                SELECT id FROM tasks
                WHERE (status = 'pending' AND not_before <= ?3)
                   OR (status IN ('claimed', 'in_progress') AND claim_expires_at < ?3)
                ORDER BY created_at ASC, id ASC
                LIMIT 1
            )
            AND ((status = 'pending' AND not_before <= ?3)
              OR (status IN ('claimed', 'in_progress') AND claim_expires_at < ?3))
            RETURNING id, technique_id, technique_name, platform, status, owner,
                      claim_expires_at, attempt_count, not_before, last_error,
                      created_at, updated_at
            "#,
        )
        .bind(worker_id)
        .bind(expires)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let task = row_to_task(&row)?;
                info!(task_id = %task.id, worker = worker_id, "claimed task");
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// Mark a claimed task as actively being processed.
    pub async fn start(&self, task_id: &str, worker_id: &str) -> EngineResult<()> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE tasks SET status = 'in_progress', updated_at = ?
            WHERE id = ? AND owner = ? AND status = 'claimed' AND claim_expires_at >= ?
            "#,
        )
        .bind(now)
        .bind(task_id)
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.ownership_error(task_id, worker_id).await?);
        }
        Ok(())
    }

    /// Extend the claim expiry for a live claim.
    pub async fn heartbeat(
        &self,
        task_id: &str,
        worker_id: &str,
        lease_duration: Duration,
    ) -> EngineResult<()> {
        let now = chrono::Utc::now().timestamp();
        let expires = now + lease_duration.as_secs() as i64;

        let result = sqlx::query(
            r#"
            UPDATE tasks SET claim_expires_at = ?, updated_at = ?
            WHERE id = ? AND owner = ?
              AND status IN ('claimed', 'in_progress')
              AND claim_expires_at >= ?
            "#,
        )
        .bind(expires)
        .bind(now)
        .bind(task_id)
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.ownership_error(task_id, worker_id).await?);
        }
        Ok(())
    }

    /// Transition a held task to completed.
    pub async fn complete(&self, task_id: &str, worker_id: &str) -> EngineResult<()> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'completed', claim_expires_at = NULL, updated_at = ?
            WHERE id = ? AND owner = ? AND status IN ('claimed', 'in_progress')
            "#,
        )
        .bind(now)
        .bind(task_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.ownership_error(task_id, worker_id).await?);
        }
        info!(task_id, worker = worker_id, "task completed");
        Ok(())
    }

    /// Record a failure. Below the attempt budget the task returns to
    /// pending with an exponential backoff gate; at the budget it moves to
    /// the terminal failed state.
    pub async fn fail(
        &self,
        task_id: &str,
        worker_id: &str,
        error: &str,
    ) -> EngineResult<FailOutcome> {
        let now = chrono::Utc::now().timestamp();

        // Only the claim owner can fail the task, so the read-then-update
        // pair is race-free: the owner guard on the UPDATE catches a claim
        // lost between the two statements.
        let attempt_count: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT attempt_count FROM tasks
            WHERE id = ? AND owner = ? AND status IN ('claimed', 'in_progress')
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(attempt_count) = attempt_count else {
            return Err(self.ownership_error(task_id, worker_id).await?);
        };

        let next_attempt = attempt_count + 1;
        let terminal = next_attempt >= self.policy.max_attempts as i64;

        let (status, not_before) = if terminal {
            ("failed", 0)
        } else {
            let delay = self.policy.backoff_delay(next_attempt as u32);
            ("pending", now + delay.as_secs() as i64)
        };

        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, attempt_count = ?, not_before = ?, last_error = ?,
                owner = NULL, claim_expires_at = NULL, updated_at = ?
            WHERE id = ? AND owner = ? AND status IN ('claimed', 'in_progress')
            "#,
        )
        .bind(status)
        .bind(next_attempt)
        .bind(not_before)
        .bind(error)
        .bind(now)
        .bind(task_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.ownership_error(task_id, worker_id).await?);
        }

        if terminal {
            warn!(task_id, error, "task failed terminally after {} attempts", next_attempt);
            Ok(FailOutcome::Terminal)
        } else {
            info!(task_id, error, attempt = next_attempt, "task requeued with backoff");
            Ok(FailOutcome::Requeued)
        }
    }

    /// Voluntarily release a held claim before completion.
    pub async fn release(&self, task_id: &str, worker_id: &str) -> EngineResult<FailOutcome> {
        self.fail(task_id, worker_id, "cancelled").await
    }

    /// Operator re-enqueue of a terminally failed task: back to pending
    /// with a fresh attempt budget.
    pub async fn requeue(&self, technique_id: &str, platform: &str) -> EngineResult<String> {
        let active: Option<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM tasks
            WHERE technique_id = ? AND platform = ?
              AND status IN ('pending', 'claimed', 'in_progress')
            "#,
        )
        .bind(technique_id)
        .bind(platform)
        .fetch_optional(&self.pool)
        .await?;

        if active.is_some() {
            return Err(EngineError::Validation(format!(
                "an active task already exists for {}/{}",
                technique_id, platform
            )));
        }

        let now = chrono::Utc::now().timestamp();
        let row = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending', attempt_count = 0, not_before = 0,
                owner = NULL, claim_expires_at = NULL, last_error = NULL, updated_at = ?
            WHERE id = (
                SELECT id FROM tasks
                WHERE technique_id = ? AND platform = ? AND status = 'failed'
                ORDER BY updated_at DESC LIMIT 1
            )
            RETURNING id
            "#,
        )
        .bind(now)
        .bind(technique_id)
        .bind(platform)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let id: String = row.get("id");
                info!(task_id = %id, technique_id, platform, "failed task requeued by operator");
                Ok(id)
            }
            None => Err(EngineError::NotFound(format!(
                "no failed task for {}/{}",
                technique_id, platform
            ))),
        }
    }

    pub async fn get_task(&self, task_id: &str) -> EngineResult<ResearchTask> {
        let row = sqlx::query(
            r#"
            SELECT id, technique_id, technique_name, platform, status, owner,
                   claim_expires_at, attempt_count, not_before, last_error,
                   created_at, updated_at
            FROM tasks WHERE id = ?
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_task(&row),
            None => Err(EngineError::NotFound(format!("task {}", task_id))),
        }
    }

    pub async fn stats(&self) -> EngineResult<QueueStats> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
            .fetch_one(&self.pool)
            .await?;

        let status_rows =
            sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status ORDER BY status")
                .fetch_all(&self.pool)
                .await?;

        let platform_rows = sqlx::query(
            "SELECT platform, COUNT(*) AS n FROM tasks GROUP BY platform ORDER BY platform",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(QueueStats {
            total,
            by_status: status_rows
                .iter()
                .map(|row| (row.get("status"), row.get("n")))
                .collect(),
            by_platform: platform_rows
                .iter()
                .map(|row| (row.get("platform"), row.get("n")))
                .collect(),
        })
    }

    /// Build the right error for a guarded update that matched no rows.
    async fn ownership_error(&self, task_id: &str, worker_id: &str) -> EngineResult<EngineError> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(match status.as_deref() {
            None => EngineError::NotFound(format!("task {}", task_id)),
            Some("failed") => EngineError::MaxAttemptsExceeded(task_id.to_string()),
            Some(_) => EngineError::NotOwner {
                task_id: task_id.to_string(),
                worker: worker_id.to_string(),
            },
        })
    }
}

fn row_to_task(row: &SqliteRow) -> EngineResult<ResearchTask> {
    let status_str: String = row.get("status");
    let status = TaskStatus::parse(&status_str)
        .ok_or_else(|| EngineError::Validation(format!("unknown task status '{}'", status_str)))?;

    Ok(ResearchTask {
        id: row.get("id"),
        technique_id: row.get("technique_id"),
        technique_name: row.get("technique_name"),
        platform: row.get("platform"),
        status,
        owner: row.get("owner"),
        claim_expires_at: row.get("claim_expires_at"),
        attempt_count: row.get("attempt_count"),
        not_before: row.get("not_before"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
