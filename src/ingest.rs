//! Reference document ingestion.
//!
//! Walks a directory of reference material (ATT&CK notes, write-ups,
//! advisories), splits each file into paragraph-boundary pieces, embeds
//! them, and indexes the result. Chunk ids are content hashes, so
//! re-ingesting unchanged text writes nothing.

use std::path::Path;

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use walkdir::WalkDir;

use crate::chunk::split_text;
use crate::config::Config;
use crate::embedding;
use crate::index::VectorIndex;
use crate::models::{extract_technique_ids, Chunk, ReferenceDocument};

pub struct IngestSummary {
    pub files_found: usize,
    pub documents_written: usize,
    pub chunks_written: usize,
    pub chunks_skipped: usize,
}

pub async fn run_ingest(
    config: &Config,
    pool: &SqlitePool,
    root: &Path,
    platform: Option<&str>,
) -> Result<IngestSummary> {
    if !config.embedding.is_enabled() {
        bail!("Ingestion requires embeddings. Set [embedding] provider in config.");
    }
    if !root.is_dir() {
        bail!("Ingest root is not a directory: {}", root.display());
    }

    let include = build_globset(&config.ingest.include_globs)?;
    let exclude = build_globset(&config.ingest.exclude_globs)?;

    let provider = embedding::create_provider(&config.embedding)?;
    let index = VectorIndex::new(pool.clone());

    let mut summary = IngestSummary {
        files_found: 0,
        documents_written: 0,
        chunks_written: 0,
        chunks_skipped: 0,
    };

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if !include.is_match(rel) || exclude.is_match(rel) {
            continue;
        }

        summary.files_found += 1;

        let text = std::fs::read_to_string(entry.path())
            .with_context(|| format!("Failed to read {}", entry.path().display()))?;

        let pieces = split_text(&text, config.ingest.chunk_max_chars);
        if pieces.is_empty() {
            continue;
        }

        let path_str = entry.path().display().to_string();
        let mut hasher = Sha256::new();
        hasher.update(path_str.as_bytes());
        let doc_id = format!("{:x}", hasher.finalize());

        let now = chrono::Utc::now().timestamp();
        let doc = ReferenceDocument {
            id: doc_id.clone(),
            title: title_of(&text, entry.path()),
            path: path_str,
            platform: platform.map(str::to_string),
            created_at: now,
            updated_at: now,
        };

        // Drop any stale chunks from a previous ingest of this file, then
        // re-index. Unchanged pieces hash to the same id and are no-ops
        // only across documents; within one document this stays exact.
        if index.document_by_path(&doc.path).await?.is_some() {
            index.remove_document(&doc.id).await?;
        }
        index.upsert_document(&doc).await?;

        let vectors = provider.embed(&pieces).await?;

        for (piece, vector) in pieces.iter().zip(vectors) {
            let techniques = extract_technique_ids(piece);
            let chunk = Chunk::new(
                &doc_id,
                piece,
                vector,
                platform.map(str::to_string),
                techniques,
            );
            if index.index_chunk(&chunk).await? {
                summary.chunks_written += 1;
            } else {
                summary.chunks_skipped += 1;
            }
        }

        summary.documents_written += 1;
    }

    println!("ingest {}", root.display());
    println!("  files found: {}", summary.files_found);
    println!("  documents written: {}", summary.documents_written);
    println!("  chunks written: {}", summary.chunks_written);
    println!("  chunks skipped (already indexed): {}", summary.chunks_skipped);
    println!("ok");

    Ok(summary)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

/// First markdown heading, or the file stem as a fallback.
fn title_of(text: &str, path: &Path) -> String {
    text.lines()
        .find_map(|line| line.strip_prefix('#').map(|rest| rest.trim_start_matches('#').trim().to_string()))
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_from_heading() {
        let text = "# Process Injection\n\nBody text.";
        assert_eq!(
            title_of(text, Path::new("notes/t1055.md")),
            "Process Injection"
        );
    }

    #[test]
    fn test_title_from_nested_heading() {
        let text = "## Detection Notes\nBody.";
        assert_eq!(title_of(text, Path::new("x.md")), "Detection Notes");
    }

    #[test]
    fn test_title_falls_back_to_file_stem() {
        let text = "No heading here.";
        assert_eq!(title_of(text, Path::new("notes/t1055.md")), "t1055");
    }

    #[test]
    fn test_globset_matching() {
        let set = build_globset(&["**/*.md".to_string()]).unwrap();
        assert!(set.is_match("a/b/c.md"));
        assert!(!set.is_match("a/b/c.rs"));
    }
}
