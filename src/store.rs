//! Research output store.
//!
//! One structured document per (technique_id, platform) key. Writes are
//! merge-upserts: the patch's populated fields overwrite, everything else
//! is preserved, and both derived scores are recomputed over the merged
//! result before the row is replaced. The merge itself is a pure function
//! ([`merge_output`]) so scoring stays independently testable.
//!
//! Each upsert runs inside a single `BEGIN IMMEDIATE` transaction that also
//! refreshes the FTS row, so a reader sees either the old or the new
//! document, never a half-merged one.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::models::{OutputPatch, ResearchOutput, SearchHit};
use crate::scoring;

/// Filters applied to output search.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub platform: Option<String>,
    pub tag: Option<String>,
    pub min_quality_score: Option<f64>,
    pub has_section: Option<String>,
}

/// Aggregates over the primary store.
#[derive(Debug, Clone, Default)]
pub struct AnalyticsSummary {
    pub total_outputs: i64,
    pub archived_outputs: i64,
    pub avg_quality: f64,
    pub avg_completeness: f64,
    pub avg_confidence: f64,
    pub by_platform: Vec<(String, i64)>,
    pub section_coverage: Vec<(String, i64)>,
}

#[derive(Clone)]
pub struct OutputStore {
    pool: SqlitePool,
}

impl OutputStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Merge-upsert a document at the patch's natural key.
    ///
    /// Returns the merged document as persisted.
    pub async fn upsert(&self, patch: &OutputPatch) -> EngineResult<ResearchOutput> {
        validate_patch(patch)?;

        let now = chrono::Utc::now().timestamp();
        let mut conn = self.pool.acquire().await?;

        // BEGIN IMMEDIATE takes the write lock up front so the read-merge-
        // write sequence is serialized against concurrent upserts.
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = upsert_in_tx(&mut *conn, patch, now).await;

        match result {
            Ok(merged) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                info!(
                    technique_id = %merged.technique_id,
                    platform = %merged.platform,
                    quality = merged.quality_score,
                    completeness = merged.completeness_score,
                    "stored research output"
                );
                Ok(merged)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    pub async fn get(&self, technique_id: &str, platform: &str) -> EngineResult<ResearchOutput> {
        let row = sqlx::query(&select_output_sql("outputs"))
            .bind(technique_id)
            .bind(platform)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_output(&row),
            None => Err(EngineError::NotFound(format!(
                "{}/{}",
                technique_id, platform
            ))),
        }
    }

    /// Full-text relevance search over concatenated section text, or a
    /// quality-ranked scan when no query is given. Filters are applied
    /// after ranking.
    pub async fn search(
        &self,
        query: Option<&str>,
        filters: &SearchFilters,
        limit: usize,
    ) -> EngineResult<Vec<SearchHit>> {
        let rows = match query {
            Some(q) if !q.trim().is_empty() => {
                sqlx::query(
                    r#"
                    SELECT o.technique_id, o.platform, o.technique_name,
                           o.description, o.detection, o.mitigation, o.playbook,
                           o.refs, o.notes, o.confidence_score, o.quality_score,
                           o.completeness_score, o.sources_json, o.tags_json,
                           o.related_json, o.research_context, o.custom_json,
                           o.created_at, o.last_updated
                    FROM outputs_fts f
                    JOIN outputs o
                      ON o.technique_id = f.technique_id AND o.platform = f.platform
                    WHERE outputs_fts MATCH ?
                    ORDER BY f.rank
                    "#,
                )
                .bind(q)
                .fetch_all(&self.pool)
                .await?
            }
            _ => {
                sqlx::query(
                    r#"
                    SELECT technique_id, platform, technique_name,
                           description, detection, mitigation, playbook,
                           refs, notes, confidence_score, quality_score,
                           completeness_score, sources_json, tags_json,
                           related_json, research_context, custom_json,
                           created_at, last_updated
                    FROM outputs
                    ORDER BY quality_score DESC, last_updated DESC, technique_id ASC
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut hits = Vec::new();
        for row in &rows {
            let output = row_to_output(row)?;
            if !matches_filters(&output, filters) {
                continue;
            }
            hits.push(SearchHit {
                technique_id: output.technique_id,
                platform: output.platform,
                technique_name: output.technique_name,
                quality_score: output.quality_score,
                completeness_score: output.completeness_score,
                last_updated: output.last_updated,
            });
            if hits.len() >= limit {
                break;
            }
        }

        Ok(hits)
    }

    /// Move a document to the archive collection, removing it from primary
    /// search while preserving its history.
    pub async fn archive(&self, technique_id: &str, platform: &str) -> EngineResult<()> {
        let now = chrono::Utc::now().timestamp();
        let mut conn = self.pool.acquire().await?;

        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = archive_in_tx(&mut *conn, technique_id, platform, now).await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                info!(technique_id, platform, "archived research output");
                Ok(())
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    pub async fn analytics_summary(&self) -> EngineResult<AnalyticsSummary> {
        let total_outputs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outputs")
            .fetch_one(&self.pool)
            .await?;

        let archived_outputs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outputs_archive")
            .fetch_one(&self.pool)
            .await?;

        let row = sqlx::query(
            r#"
            SELECT COALESCE(AVG(quality_score), 0.0) AS avg_quality,
                   COALESCE(AVG(completeness_score), 0.0) AS avg_completeness,
                   COALESCE(AVG(confidence_score), 0.0) AS avg_confidence
            FROM outputs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let platform_rows = sqlx::query(
            "SELECT platform, COUNT(*) AS n FROM outputs GROUP BY platform ORDER BY n DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let coverage_row = sqlx::query(
            r#"
            SELECT SUM(TRIM(description) != '') AS description,
                   SUM(TRIM(detection) != '') AS detection,
                   SUM(TRIM(mitigation) != '') AS mitigation,
                   SUM(TRIM(playbook) != '') AS playbook,
                   SUM(TRIM(refs) != '') AS "references",
                   SUM(TRIM(notes) != '') AS notes
            FROM outputs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let section_coverage = [
            "description",
            "detection",
            "mitigation",
            "playbook",
            "references",
            "notes",
        ]
        .iter()
        .map(|name| {
            let n: Option<i64> = coverage_row.get(*name);
            (name.to_string(), n.unwrap_or(0))
        })
        .collect();

        Ok(AnalyticsSummary {
            total_outputs,
            archived_outputs,
            avg_quality: row.get("avg_quality"),
            avg_completeness: row.get("avg_completeness"),
            avg_confidence: row.get("avg_confidence"),
            by_platform: platform_rows
                .iter()
                .map(|row| (row.get("platform"), row.get("n")))
                .collect(),
            section_coverage,
        })
    }
}

async fn upsert_in_tx(
    conn: &mut SqliteConnection,
    patch: &OutputPatch,
    now: i64,
) -> EngineResult<ResearchOutput> {
    let existing_row = sqlx::query(&select_output_sql("outputs"))
        .bind(&patch.technique_id)
        .bind(&patch.platform)
        .fetch_optional(&mut *conn)
        .await?;

    let existing = match existing_row {
        Some(row) => Some(row_to_output(&row)?),
        None => None,
    };

    let merged = merge_output(existing.as_ref(), patch, now);

    let sources_json = to_json(&merged.sources)?;
    let tags_json = to_json(&merged.tags)?;
    let related_json = to_json(&merged.related_techniques)?;
    let custom_json = match &merged.custom_fields {
        Some(map) => Some(to_json(map)?),
        None => None,
    };

    sqlx::query(
        r#"
        INSERT OR REPLACE INTO outputs
            (technique_id, platform, technique_name, description, detection,
             mitigation, playbook, refs, notes, confidence_score, quality_score,
             completeness_score, sources_json, tags_json, related_json,
             research_context, custom_json, created_at, last_updated)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&merged.technique_id)
    .bind(&merged.platform)
    .bind(&merged.technique_name)
    .bind(&merged.description)
    .bind(&merged.detection)
    .bind(&merged.mitigation)
    .bind(&merged.playbook)
    .bind(&merged.references)
    .bind(&merged.notes)
    .bind(merged.confidence_score)
    .bind(merged.quality_score)
    .bind(merged.completeness_score)
    .bind(&sources_json)
    .bind(&tags_json)
    .bind(&related_json)
    .bind(&merged.research_context)
    .bind(&custom_json)
    .bind(merged.created_at)
    .bind(merged.last_updated)
    .execute(&mut *conn)
    .await?;

    // Refresh the FTS row in the same transaction
    sqlx::query("DELETE FROM outputs_fts WHERE technique_id = ? AND platform = ?")
        .bind(&merged.technique_id)
        .bind(&merged.platform)
        .execute(&mut *conn)
        .await?;

    sqlx::query("INSERT INTO outputs_fts (technique_id, platform, content) VALUES (?, ?, ?)")
        .bind(&merged.technique_id)
        .bind(&merged.platform)
        .bind(fts_content(&merged))
        .execute(&mut *conn)
        .await?;

    Ok(merged)
}

async fn archive_in_tx(
    conn: &mut SqliteConnection,
    technique_id: &str,
    platform: &str,
    now: i64,
) -> EngineResult<()> {
    let moved = sqlx::query(
        r#"
        INSERT OR REPLACE INTO outputs_archive
            (technique_id, platform, technique_name, description, detection,
             mitigation, playbook, refs, notes, confidence_score, quality_score,
             completeness_score, sources_json, tags_json, related_json,
             research_context, custom_json, created_at, last_updated, archived_at)
        SELECT technique_id, platform, technique_name, description, detection,
               mitigation, playbook, refs, notes, confidence_score, quality_score,
               completeness_score, sources_json, tags_json, related_json,
               research_context, custom_json, created_at, last_updated, ?
        FROM outputs WHERE technique_id = ? AND platform = ?
        "#,
    )
    .bind(now)
    .bind(technique_id)
    .bind(platform)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if moved == 0 {
        return Err(EngineError::NotFound(format!(
            "{}/{}",
            technique_id, platform
        )));
    }

    sqlx::query("DELETE FROM outputs WHERE technique_id = ? AND platform = ?")
        .bind(technique_id)
        .bind(platform)
        .execute(&mut *conn)
        .await?;

    sqlx::query("DELETE FROM outputs_fts WHERE technique_id = ? AND platform = ?")
        .bind(technique_id)
        .bind(platform)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// Pure merge of a partial update onto an existing document.
///
/// Populated patch fields overwrite; absent fields preserve the existing
/// value. `created_at` is set only for new documents, and both derived
/// scores are recomputed over the merged result.
pub fn merge_output(
    existing: Option<&ResearchOutput>,
    patch: &OutputPatch,
    now: i64,
) -> ResearchOutput {
    let base = existing.cloned().unwrap_or_default();

    let pick = |new: &Option<String>, old: String| -> String {
        new.clone().unwrap_or(old)
    };

    let mut merged = ResearchOutput {
        technique_id: patch.technique_id.clone(),
        platform: patch.platform.clone(),
        technique_name: pick(&patch.technique_name, base.technique_name),
        description: pick(&patch.description, base.description),
        detection: pick(&patch.detection, base.detection),
        mitigation: pick(&patch.mitigation, base.mitigation),
        playbook: pick(&patch.playbook, base.playbook),
        references: pick(&patch.references, base.references),
        notes: pick(&patch.notes, base.notes),
        confidence_score: patch.confidence_score.unwrap_or(base.confidence_score),
        quality_score: 0.0,
        completeness_score: 0.0,
        sources: patch.sources.clone().unwrap_or(base.sources),
        tags: patch.tags.clone().unwrap_or(base.tags),
        related_techniques: patch
            .related_techniques
            .clone()
            .unwrap_or(base.related_techniques),
        research_context: patch
            .research_context
            .clone()
            .or(base.research_context),
        custom_fields: patch.custom_fields.clone().or(base.custom_fields),
        created_at: if existing.is_some() { base.created_at } else { now },
        last_updated: now,
    };

    merged.completeness_score = scoring::completeness_score(&merged);
    merged.quality_score = scoring::quality_score(&merged);
    merged
}

fn validate_patch(patch: &OutputPatch) -> EngineResult<()> {
    if patch.technique_id.trim().is_empty() || patch.platform.trim().is_empty() {
        return Err(EngineError::Validation(
            "technique_id and platform must be non-empty".to_string(),
        ));
    }
    if let Some(confidence) = patch.confidence_score {
        if !(0.0..=10.0).contains(&confidence) {
            return Err(EngineError::Validation(format!(
                "confidence_score {} out of range [0, 10]",
                confidence
            )));
        }
    }
    Ok(())
}

fn matches_filters(output: &ResearchOutput, filters: &SearchFilters) -> bool {
    if let Some(ref platform) = filters.platform {
        if &output.platform != platform {
            return false;
        }
    }
    if let Some(ref tag) = filters.tag {
        if !output.tags.iter().any(|t| t == tag) {
            return false;
        }
    }
    if let Some(min_quality) = filters.min_quality_score {
        if output.quality_score < min_quality {
            return false;
        }
    }
    if let Some(ref section) = filters.has_section {
        match output.section(section) {
            Some(text) if !text.trim().is_empty() => {}
            _ => return false,
        }
    }
    true
}

/// Concatenated section text indexed for full-text search.
fn fts_content(output: &ResearchOutput) -> String {
    let mut content = String::new();
    content.push_str(&output.technique_name);
    for (_, text) in output.sections() {
        if !text.is_empty() {
            content.push('\n');
            content.push_str(text);
        }
    }
    content
}

fn select_output_sql(table: &str) -> String {
    format!(
        "SELECT technique_id, platform, technique_name, description, detection, \
         mitigation, playbook, refs, notes, confidence_score, quality_score, \
         completeness_score, sources_json, tags_json, related_json, \
         research_context, custom_json, created_at, last_updated \
         FROM {} WHERE technique_id = ? AND platform = ?",
        table
    )
}

fn row_to_output(row: &SqliteRow) -> EngineResult<ResearchOutput> {
    let custom_json: Option<String> = row.get("custom_json");
    let custom_fields = match custom_json {
        Some(json) => Some(from_json(&json)?),
        None => None,
    };

    Ok(ResearchOutput {
        technique_id: row.get("technique_id"),
        platform: row.get("platform"),
        technique_name: row.get("technique_name"),
        description: row.get("description"),
        detection: row.get("detection"),
        mitigation: row.get("mitigation"),
        playbook: row.get("playbook"),
        references: row.get("refs"),
        notes: row.get("notes"),
        confidence_score: row.get("confidence_score"),
        quality_score: row.get("quality_score"),
        completeness_score: row.get("completeness_score"),
        sources: from_json(row.get::<String, _>("sources_json").as_str())?,
        tags: from_json(row.get::<String, _>("tags_json").as_str())?,
        related_techniques: from_json(row.get::<String, _>("related_json").as_str())?,
        research_context: row.get("research_context"),
        custom_fields,
        created_at: row.get("created_at"),
        last_updated: row.get("last_updated"),
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> EngineResult<String> {
    serde_json::to_string(value).map_err(|e| EngineError::Validation(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(json: &str) -> EngineResult<T> {
    serde_json::from_str(json).map_err(|e| EngineError::Validation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_new_document_sets_timestamps() {
        let patch = OutputPatch {
            description: Some("desc".into()),
            ..OutputPatch::new("T1055", "windows")
        };
        let merged = merge_output(None, &patch, 1000);
        assert_eq!(merged.created_at, 1000);
        assert_eq!(merged.last_updated, 1000);
        assert_eq!(merged.description, "desc");
        assert!(merged.completeness_score > 0.0);
    }

    #[test]
    fn test_merge_preserves_unspecified_sections() {
        let first = merge_output(
            None,
            &OutputPatch {
                description: Some("X".into()),
                ..OutputPatch::new("T1055", "windows")
            },
            1000,
        );

        let second = merge_output(
            Some(&first),
            &OutputPatch {
                detection: Some("Y".into()),
                ..OutputPatch::new("T1055", "windows")
            },
            2000,
        );

        assert_eq!(second.description, "X");
        assert_eq!(second.detection, "Y");
        assert_eq!(second.created_at, 1000);
        assert_eq!(second.last_updated, 2000);
    }

    #[test]
    fn test_merge_recomputes_scores() {
        let first = merge_output(
            None,
            &OutputPatch {
                description: Some("X".into()),
                detection: Some("Y".into()),
                mitigation: Some("Z".into()),
                ..OutputPatch::new("T1055", "windows")
            },
            1000,
        );
        assert_eq!(first.completeness_score, 0.5);

        let second = merge_output(
            Some(&first),
            &OutputPatch {
                playbook: Some("P".into()),
                references: Some("R".into()),
                notes: Some("N".into()),
                ..OutputPatch::new("T1055", "windows")
            },
            2000,
        );
        assert_eq!(second.completeness_score, 1.0);
        assert!(second.quality_score >= first.quality_score);
    }

    #[test]
    fn test_merge_overwrite_section() {
        let first = merge_output(
            None,
            &OutputPatch {
                description: Some("old".into()),
                ..OutputPatch::new("T1055", "windows")
            },
            1000,
        );
        let second = merge_output(
            Some(&first),
            &OutputPatch {
                description: Some("new".into()),
                ..OutputPatch::new("T1055", "windows")
            },
            2000,
        );
        assert_eq!(second.description, "new");
    }

    #[test]
    fn test_validate_rejects_out_of_range_confidence() {
        let patch = OutputPatch {
            confidence_score: Some(11.0),
            ..OutputPatch::new("T1055", "windows")
        };
        assert!(matches!(
            validate_patch(&patch),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_rejects_empty_key() {
        let patch = OutputPatch::new("", "windows");
        assert!(validate_patch(&patch).is_err());
    }

    #[test]
    fn test_filters_has_section() {
        let output = merge_output(
            None,
            &OutputPatch {
                detection: Some("watch lsass".into()),
                ..OutputPatch::new("T1003", "windows")
            },
            1000,
        );

        let with = SearchFilters {
            has_section: Some("detection".into()),
            ..Default::default()
        };
        let without = SearchFilters {
            has_section: Some("playbook".into()),
            ..Default::default()
        };
        assert!(matches_filters(&output, &with));
        assert!(!matches_filters(&output, &without));
    }

    #[test]
    fn test_filters_platform_and_quality() {
        let output = merge_output(
            None,
            &OutputPatch {
                description: Some("x".repeat(3000)),
                confidence_score: Some(5.0),
                ..OutputPatch::new("T1003", "windows")
            },
            1000,
        );

        let wrong_platform = SearchFilters {
            platform: Some("linux".into()),
            ..Default::default()
        };
        assert!(!matches_filters(&output, &wrong_platform));

        let high_bar = SearchFilters {
            min_quality_score: Some(0.9),
            ..Default::default()
        };
        assert!(!matches_filters(&output, &high_bar));

        let low_bar = SearchFilters {
            min_quality_score: Some(0.1),
            ..Default::default()
        };
        assert!(matches_filters(&output, &low_bar));
    }
}
