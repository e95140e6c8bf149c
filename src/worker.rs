//! Research worker orchestration.
//!
//! The claim → retrieve → generate → upsert → complete loop. Workers are
//! stateless between claims; every interleaving-sensitive step goes through
//! the queue or store API. Generation failures return the task to the queue
//! under the retry policy; a shutdown request mid-task releases the claim
//! so another worker can pick it up immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::{self, EmbeddingProvider};
use crate::generation::{self, Generator, SECTIONS};
use crate::index::VectorIndex;
use crate::models::{extract_technique_ids, ContextBlock, OutputPatch, ResearchTask};
use crate::queue::{RetryPolicy, TaskQueue};
use crate::retrieval;
use crate::store::OutputStore;

pub struct Worker {
    id: String,
    config: Config,
    queue: TaskQueue,
    store: OutputStore,
    index: VectorIndex,
    provider: Box<dyn EmbeddingProvider>,
    generator: Box<dyn Generator>,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        config: Config,
        pool: SqlitePool,
        generator: Box<dyn Generator>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let provider = embedding::create_provider(&config.embedding)?;
        let policy = RetryPolicy::from_config(&config.queue);

        Ok(Self {
            id: format!("worker-{}", &Uuid::new_v4().to_string()[..8]),
            queue: TaskQueue::new(pool.clone(), policy),
            store: OutputStore::new(pool.clone()),
            index: VectorIndex::new(pool),
            provider,
            generator,
            config,
            shutdown,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim and process tasks until the queue is drained (`once`) or a
    /// shutdown is requested. Returns the number of tasks processed.
    pub async fn run(&self, once: bool) -> Result<u64> {
        let lease = Duration::from_secs(self.config.queue.lease_secs);
        let poll = Duration::from_secs(self.config.queue.poll_interval_secs);
        let mut processed = 0u64;

        info!(worker = %self.id, model = self.generator.model_name(), "worker started");

        while !self.shutdown.load(Ordering::Relaxed) {
            match self.queue.claim(&self.id, lease).await {
                Ok(Some(task)) => {
                    self.process_task(&task, lease).await;
                    processed += 1;
                }
                Ok(None) => {
                    if once {
                        break;
                    }
                    tokio::time::sleep(poll).await;
                }
                Err(e) if e.is_retryable() => {
                    warn!(worker = %self.id, error = %e, "claim failed; backing off");
                    tokio::time::sleep(poll).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(worker = %self.id, processed, "worker stopped");
        Ok(processed)
    }

    /// Drive one task through retrieval, generation, and storage. All
    /// failure paths route back through the queue; this function only
    /// returns early on lost ownership.
    async fn process_task(&self, task: &ResearchTask, lease: Duration) {
        info!(
            task_id = %task.id,
            technique_id = %task.technique_id,
            platform = %task.platform,
            attempt = task.attempt_count + 1,
            "processing task"
        );

        if let Err(e) = self.queue.start(&task.id, &self.id).await {
            warn!(task_id = %task.id, error = %e, "could not start task");
            return;
        }

        let query = format!(
            "{} {} {} attack technique",
            task.technique_id, task.technique_name, task.platform
        );
        let context = retrieval::retrieve_context(
            &self.index,
            self.provider.as_ref(),
            &self.config,
            &query,
            Some(&task.technique_id),
            Some(&task.platform),
        )
        .await;

        let mut sections: Vec<(&str, String)> = Vec::with_capacity(SECTIONS.len());

        for section in SECTIONS {
            if self.shutdown.load(Ordering::Relaxed) {
                info!(task_id = %task.id, "shutdown requested; releasing claim");
                if let Err(e) = self.queue.release(&task.id, &self.id).await {
                    warn!(task_id = %task.id, error = %e, "release failed");
                }
                return;
            }

            // Generation can be slow; keep the lease alive between sections.
            if let Err(e) = self.queue.heartbeat(&task.id, &self.id, lease).await {
                warn!(task_id = %task.id, error = %e, "lost claim mid-task; abandoning");
                return;
            }

            let prompt = generation::section_prompt(
                section,
                &task.technique_id,
                &task.technique_name,
                &task.platform,
                &context.text,
            );

            match self.generator.generate(&prompt).await {
                Ok(text) => sections.push((section, text)),
                Err(e) => {
                    warn!(task_id = %task.id, section, error = %e, "generation failed");
                    if let Err(e) = self
                        .queue
                        .fail(&task.id, &self.id, &format!("{} generation: {}", section, e))
                        .await
                    {
                        warn!(task_id = %task.id, error = %e, "fail transition failed");
                    }
                    return;
                }
            }
        }

        let patch = build_patch(task, &context, &sections);

        if let Err(e) = self.store.upsert(&patch).await {
            warn!(task_id = %task.id, error = %e, "upsert failed");
            if let Err(e) = self
                .queue
                .fail(&task.id, &self.id, &format!("store upsert: {}", e))
                .await
            {
                warn!(task_id = %task.id, error = %e, "fail transition failed");
            }
            return;
        }

        if let Err(e) = self.queue.complete(&task.id, &self.id).await {
            warn!(task_id = %task.id, error = %e, "complete transition failed");
        }
    }
}

/// Assemble the document patch for a finished generation pass.
fn build_patch(
    task: &ResearchTask,
    context: &ContextBlock,
    sections: &[(&str, String)],
) -> OutputPatch {
    let mut patch = OutputPatch::new(&task.technique_id, &task.platform);
    patch.technique_name = Some(task.technique_name.clone());

    let mut combined = String::new();
    for (name, text) in sections {
        combined.push_str(text);
        combined.push('\n');
        match *name {
            "description" => patch.description = Some(text.clone()),
            "detection" => patch.detection = Some(text.clone()),
            "mitigation" => patch.mitigation = Some(text.clone()),
            "playbook" => patch.playbook = Some(text.clone()),
            "references" => patch.references = Some(text.clone()),
            "notes" => patch.notes = Some(text.clone()),
            _ => {}
        }
    }

    // Related techniques mentioned in the generated text, minus the subject
    let related: Vec<String> = extract_technique_ids(&combined)
        .into_iter()
        .filter(|id| id != &task.technique_id)
        .collect();

    patch.confidence_score = Some(confidence_for(context));
    patch.sources = Some(context.sources.clone());
    patch.tags = Some(vec![task.platform.clone()]);
    patch.related_techniques = Some(related);
    patch.research_context = if context.is_empty() {
        None
    } else {
        Some(context.text.clone())
    };

    patch
}

/// Deterministic confidence for a generation pass: grounded research earns
/// more than the no-context path, scaling with distinct sources.
pub fn confidence_for(context: &ContextBlock) -> f64 {
    if context.is_empty() {
        return 3.0;
    }
    5.0 + 0.5 * context.sources.len().min(8) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskStatus;

    fn task() -> ResearchTask {
        ResearchTask {
            id: "t1".into(),
            technique_id: "T1055".into(),
            technique_name: "Process Injection".into(),
            platform: "windows".into(),
            status: TaskStatus::InProgress,
            owner: Some("w1".into()),
            claim_expires_at: Some(0),
            attempt_count: 0,
            not_before: 0,
            last_error: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_confidence_empty_context_is_low() {
        assert_eq!(confidence_for(&ContextBlock::default()), 3.0);
    }

    #[test]
    fn test_confidence_scales_with_sources() {
        let context = ContextBlock {
            text: "ctx".into(),
            sources: vec!["a".into(), "b".into()],
            chunks_used: 2,
        };
        assert_eq!(confidence_for(&context), 6.0);

        let many = ContextBlock {
            text: "ctx".into(),
            sources: (0..20).map(|i| format!("s{}", i)).collect(),
            chunks_used: 20,
        };
        assert_eq!(confidence_for(&many), 9.0);
    }

    #[test]
    fn test_build_patch_fills_sections_and_related() {
        let context = ContextBlock {
            text: "[Source: d1]\nevidence".into(),
            sources: vec!["d1".into()],
            chunks_used: 1,
        };
        let sections = vec![
            ("description", "Often paired with T1003 dumping.".to_string()),
            ("detection", "Watch for handles. See T1055 itself.".to_string()),
        ];
        let patch = build_patch(&task(), &context, &sections);

        assert_eq!(patch.description.as_deref(), Some("Often paired with T1003 dumping."));
        assert!(patch.detection.is_some());
        assert_eq!(patch.mitigation, None);
        // Subject technique filtered out of related mentions
        assert_eq!(patch.related_techniques.as_deref(), Some(&["T1003".to_string()][..]));
        assert_eq!(patch.sources.as_deref(), Some(&["d1".to_string()][..]));
        assert_eq!(patch.research_context.as_deref(), Some("[Source: d1]\nevidence"));
    }

    #[test]
    fn test_build_patch_empty_context_omits_research_context() {
        let patch = build_patch(&task(), &ContextBlock::default(), &[]);
        assert_eq!(patch.research_context, None);
        assert_eq!(patch.confidence_score, Some(3.0));
    }
}
