//! Database statistics and health overview.
//!
//! Provides a quick summary of what's stored: queue depth by status,
//! indexed chunk counts, and output analytics. Used by `rforge stats` to
//! give confidence that ingestion and workers are doing their jobs.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::index::VectorIndex;
use crate::queue::{RetryPolicy, TaskQueue};
use crate::store::OutputStore;

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config, pool: &SqlitePool) -> Result<()> {
    let index = VectorIndex::new(pool.clone());
    let queue = TaskQueue::new(pool.clone(), RetryPolicy::from_config(&config.queue));
    let store = OutputStore::new(pool.clone());

    let index_stats = index.stats().await?;
    let queue_stats = queue.stats().await?;
    let analytics = store.analytics_summary().await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Research Forge — Database Stats");
    println!("===============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Reference documents: {}", index_stats.total_documents);
    println!("  Indexed chunks:      {}", index_stats.total_chunks);

    if !index_stats.chunks_by_platform.is_empty() {
        let mut platforms: Vec<_> = index_stats.chunks_by_platform.iter().collect();
        platforms.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        for (platform, count) in platforms {
            println!("    {:<16} {:>6}", platform, count);
        }
    }

    println!();
    println!("  Queue ({} tasks):", queue_stats.total);
    for (status, count) in &queue_stats.by_status {
        println!("    {:<16} {:>6}", status, count);
    }

    println!();
    println!(
        "  Outputs:     {} ({} archived)",
        analytics.total_outputs, analytics.archived_outputs
    );
    println!("    avg quality:      {:.2}", analytics.avg_quality);
    println!("    avg completeness: {:.2}", analytics.avg_completeness);
    println!("    avg confidence:   {:.1}", analytics.avg_confidence);

    if !analytics.by_platform.is_empty() {
        println!();
        println!("  Outputs by platform:");
        for (platform, count) in &analytics.by_platform {
            println!("    {:<16} {:>6}", platform, count);
        }
    }

    if analytics.total_outputs > 0 {
        println!();
        println!("  Section coverage:");
        for (section, count) in &analytics.section_coverage {
            println!(
                "    {:<16} {:>5} / {}",
                section, count, analytics.total_outputs
            );
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
