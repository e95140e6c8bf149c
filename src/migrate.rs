use anyhow::Result;
use sqlx::SqlitePool;

/// Create the backing-store schema. Idempotent; safe to run on every start.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Reference documents feeding the vector index
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reference_documents (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            path TEXT NOT NULL,
            platform TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Embedded chunks, keyed by content hash
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            platform TEXT,
            techniques_json TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            FOREIGN KEY (document_id) REFERENCES reference_documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Research task queue
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            technique_id TEXT NOT NULL,
            technique_name TEXT NOT NULL DEFAULT '',
            platform TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            owner TEXT,
            claim_expires_at INTEGER,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            not_before INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One active task per (technique, platform); completed/failed rows do
    // not block a fresh enqueue.
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_active_key
        ON tasks(technique_id, platform)
        WHERE status IN ('pending', 'claimed', 'in_progress')
        "#,
    )
    .execute(pool)
    .await?;

    // Primary research output store
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS outputs (
            technique_id TEXT NOT NULL,
            platform TEXT NOT NULL,
            technique_name TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            detection TEXT NOT NULL DEFAULT '',
            mitigation TEXT NOT NULL DEFAULT '',
            playbook TEXT NOT NULL DEFAULT '',
            refs TEXT NOT NULL DEFAULT '',
            notes TEXT NOT NULL DEFAULT '',
            confidence_score REAL NOT NULL DEFAULT 0,
            quality_score REAL NOT NULL DEFAULT 0,
            completeness_score REAL NOT NULL DEFAULT 0,
            sources_json TEXT NOT NULL DEFAULT '[]',
            tags_json TEXT NOT NULL DEFAULT '[]',
            related_json TEXT NOT NULL DEFAULT '[]',
            research_context TEXT,
            custom_json TEXT,
            created_at INTEGER NOT NULL,
            last_updated INTEGER NOT NULL,
            PRIMARY KEY (technique_id, platform)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Archive collection; archived documents leave primary search entirely
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS outputs_archive (
            technique_id TEXT NOT NULL,
            platform TEXT NOT NULL,
            technique_name TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            detection TEXT NOT NULL DEFAULT '',
            mitigation TEXT NOT NULL DEFAULT '',
            playbook TEXT NOT NULL DEFAULT '',
            refs TEXT NOT NULL DEFAULT '',
            notes TEXT NOT NULL DEFAULT '',
            confidence_score REAL NOT NULL DEFAULT 0,
            quality_score REAL NOT NULL DEFAULT 0,
            completeness_score REAL NOT NULL DEFAULT 0,
            sources_json TEXT NOT NULL DEFAULT '[]',
            tags_json TEXT NOT NULL DEFAULT '[]',
            related_json TEXT NOT NULL DEFAULT '[]',
            research_context TEXT,
            custom_json TEXT,
            created_at INTEGER NOT NULL,
            last_updated INTEGER NOT NULL,
            archived_at INTEGER NOT NULL,
            PRIMARY KEY (technique_id, platform)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 virtual table over concatenated output sections
    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='outputs_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE outputs_fts USING fts5(
                technique_id UNINDEXED,
                platform UNINDEXED,
                content
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_platform ON chunks(platform)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, not_before)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_outputs_platform ON outputs(platform)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_outputs_quality ON outputs(quality_score DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
