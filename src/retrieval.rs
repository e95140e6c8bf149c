//! Retrieval-augmentation engine.
//!
//! Builds the grounding context block for a research task: embed the query,
//! similarity-search the vector index with platform/technique filters,
//! deduplicate per source document, and greedily pack chunks into a bounded
//! context string.
//!
//! Retrieval never fails the pipeline: when the index is unreachable, the
//! embedding backend errors out, or the timeout elapses, the result is an
//! empty [`ContextBlock`] and a warning. Partial research is preferred
//! over none.

use std::time::Duration;

use tracing::{debug, warn};

use crate::chunk::floor_char_boundary;
use crate::config::Config;
use crate::embedding::{self, EmbeddingProvider};
use crate::error::EngineResult;
use crate::index::{IndexFilters, VectorIndex};
use crate::models::{ContextBlock, ScoredChunk};

const SOURCE_SEPARATOR: &str = "\n\n---\n\n";

/// Retrieve and assemble grounding context for a query.
///
/// Filters restrict results to the task's platform and technique tag when
/// given. Degrades to an empty block on any retrieval failure.
pub async fn retrieve_context(
    index: &VectorIndex,
    provider: &dyn EmbeddingProvider,
    config: &Config,
    query_text: &str,
    technique: Option<&str>,
    platform: Option<&str>,
) -> ContextBlock {
    if !config.embedding.is_enabled() {
        debug!("embeddings disabled; generating without retrieval context");
        return ContextBlock::default();
    }

    let timeout = Duration::from_secs(config.retrieval.timeout_secs);

    let query_vector = match tokio::time::timeout(
        timeout,
        embedding::embed_query(provider, query_text),
    )
    .await
    {
        Ok(Ok(vector)) => vector,
        Ok(Err(e)) => {
            warn!(error = %e, "query embedding failed; continuing with empty context");
            return ContextBlock::default();
        }
        Err(_) => {
            warn!("query embedding timed out; continuing with empty context");
            return ContextBlock::default();
        }
    };

    let filters = IndexFilters {
        platform: platform.map(str::to_string),
        technique: technique.map(str::to_string),
    };

    match tokio::time::timeout(
        timeout,
        retrieve_with_vector(index, &query_vector, &filters, config),
    )
    .await
    {
        Ok(Ok(block)) => block,
        Ok(Err(e)) => {
            warn!(error = %e, "vector search failed; continuing with empty context");
            ContextBlock::default()
        }
        Err(_) => {
            warn!("vector search timed out; continuing with empty context");
            ContextBlock::default()
        }
    }
}

/// Search with a pre-computed query vector and assemble the bounded block.
///
/// Split out from [`retrieve_context`] so the packing behavior is testable
/// without an embedding backend.
pub async fn retrieve_with_vector(
    index: &VectorIndex,
    query_vector: &[f32],
    filters: &IndexFilters,
    config: &Config,
) -> EngineResult<ContextBlock> {
    let candidates = index
        .search(query_vector, config.retrieval.candidate_k, filters)
        .await?;

    Ok(assemble_context(
        &candidates,
        config.retrieval.max_chunks,
        config.retrieval.max_chars,
    ))
}

/// Pack scored chunks into a context block within the character budget.
///
/// Candidates must arrive sorted by descending similarity. Chunks from a
/// source document already used are dropped (the highest-similarity
/// instance wins). Accumulation is greedy; the final chunk is truncated on
/// a char boundary rather than omitted. Output length never exceeds
/// `max_chars`.
pub fn assemble_context(
    candidates: &[ScoredChunk],
    max_chunks: usize,
    max_chars: usize,
) -> ContextBlock {
    let mut text = String::new();
    let mut sources: Vec<String> = Vec::new();
    let mut chunks_used = 0;

    for candidate in candidates {
        if chunks_used >= max_chunks {
            break;
        }
        let doc_id = &candidate.chunk.document_id;
        if sources.contains(doc_id) {
            continue;
        }

        let mut block = format!("[Source: {}]\n{}", doc_id, candidate.chunk.text);
        let separator = if text.is_empty() { "" } else { SOURCE_SEPARATOR };
        let budget = max_chars.saturating_sub(text.len() + separator.len());

        if block.len() > budget {
            let cut = floor_char_boundary(&block, budget);
            block.truncate(cut);
            if block.is_empty() {
                break;
            }
            text.push_str(separator);
            text.push_str(&block);
            sources.push(doc_id.clone());
            chunks_used += 1;
            break;
        }

        text.push_str(separator);
        text.push_str(&block);
        sources.push(doc_id.clone());
        chunks_used += 1;
    }

    debug_assert!(text.len() <= max_chars);

    ContextBlock {
        text,
        sources,
        chunks_used,
    }
}
