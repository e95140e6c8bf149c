//! Generation adapter.
//!
//! The engine treats content generation as a black box: prompt in, text
//! out. Failures (timeouts, backend errors) propagate to the caller, which
//! records them as task failures subject to the queue's retry policy.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::GenerationConfig;

/// The six document sections generated per research task, in order.
pub const SECTIONS: [&str; 6] = [
    "description",
    "detection",
    "mitigation",
    "playbook",
    "references",
    "notes",
];

/// An opaque text generator.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Returns the model identifier used for generation.
    fn model_name(&self) -> &str;

    /// Produce text for a prompt. Potentially slow; errors and timeouts
    /// surface to the caller.
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Generator backed by a local Ollama server (`POST /api/generate`).
pub struct OllamaGenerator {
    endpoint: String,
    model: String,
    timeout: Duration,
    max_retries: u32,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for Ollama generator"))?;
        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model,
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let client = reqwest::Client::builder().timeout(self.timeout).build()?;
        let url = format!("{}/api/generate", self.endpoint);
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match client.post(&url).json(&body).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        let text = json
                            .get("response")
                            .and_then(|r| r.as_str())
                            .ok_or_else(|| {
                                anyhow::anyhow!("Invalid Ollama response: missing response field")
                            })?;
                        return Ok(text.trim().to_string());
                    }

                    if status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err =
                            Some(anyhow::anyhow!("Ollama error {}: {}", status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Ollama error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Generation failed after retries")))
    }
}

/// Create the configured [`Generator`]. The `disabled` provider fails on
/// first use with a descriptive error.
pub fn create_generator(config: &GenerationConfig) -> Result<Box<dyn Generator>> {
    match config.provider.as_str() {
        "ollama" => Ok(Box::new(OllamaGenerator::new(config)?)),
        "disabled" => Ok(Box::new(DisabledGenerator)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

/// Placeholder generator used when generation is not configured.
pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _prompt: &str) -> Result<String> {
        bail!("Generation provider is disabled")
    }
}

/// Build the prompt for one document section.
///
/// The preamble carries the technique identity and any retrieved grounding
/// context; the per-section instructions ask for the content that section
/// is scored on.
pub fn section_prompt(
    section: &str,
    technique_id: &str,
    technique_name: &str,
    platform: &str,
    context: &str,
) -> String {
    let mut prompt = format!(
        "Technique: {} - {}\nPlatform: {}\n\n",
        technique_id, technique_name, platform
    );

    if context.is_empty() {
        prompt.push_str("No research context is available; rely on general knowledge and state uncertainty explicitly.\n\n");
    } else {
        prompt.push_str("Research Context:\n");
        prompt.push_str(context);
        prompt.push_str("\n\n");
    }

    let instructions = match section {
        "description" => {
            "Write a comprehensive technical description: overview and purpose, \
             implementation details, how attackers use the technique, prerequisites, \
             common variations, and impact for defenders."
        }
        "detection" => {
            "Write detection guidance: key indicators and observables, log sources, \
             detection rules and hunt queries, behavioral anomalies, and false \
             positive considerations."
        }
        "mitigation" => {
            "Write mitigation strategies: preventive controls, detective controls, \
             response procedures, hardening recommendations, and implementation \
             priorities."
        }
        "playbook" => {
            "Write a purple team playbook: attack simulation steps, detection \
             validation methods, exercise objectives and success criteria, and \
             tools for simulation."
        }
        "references" => {
            "Compile references: MITRE ATT&CK mappings, CVE references, research \
             papers, vendor advisories, and tool documentation, as a structured list."
        }
        "notes" => {
            "Write analyst notes: research methodology, data quality assessment, \
             confidence and limitations, gaps in available information, and \
             correlation with other techniques."
        }
        _ => "Write professional, technical content for this section.",
    };

    prompt.push_str(&format!(
        "Generate professional, technical content for the {} section. {}",
        section, instructions
    ));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_prompt_carries_identity_and_context() {
        let prompt = section_prompt(
            "detection",
            "T1055",
            "Process Injection",
            "windows",
            "[Source: doc1]\nLSASS access patterns",
        );
        assert!(prompt.contains("T1055 - Process Injection"));
        assert!(prompt.contains("Platform: windows"));
        assert!(prompt.contains("LSASS access patterns"));
        assert!(prompt.contains("detection section"));
    }

    #[test]
    fn test_section_prompt_empty_context_path() {
        let prompt = section_prompt("description", "T1055", "Process Injection", "linux", "");
        assert!(prompt.contains("No research context is available"));
    }

    #[test]
    fn test_all_sections_have_instructions() {
        for section in SECTIONS {
            let prompt = section_prompt(section, "T1055", "PI", "windows", "ctx");
            assert!(prompt.contains(section), "missing section name: {}", section);
        }
    }

    #[tokio::test]
    async fn test_disabled_generator_errors() {
        let generator = DisabledGenerator;
        assert!(generator.generate("prompt").await.is_err());
    }
}
