use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::retriever::{Evidence, Topic};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use tracing::info;

#[derive(Serialize)]
struct OllamaGenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<i32>,
}

#[derive(Deserialize, Debug)]
struct OllamaGenerateResponse {
    response: String,
}

/// Topic summary writer backed by Ollama's /api/generate endpoint.
/// Prompts are grounded in retrieved evidence only; with no evidence
/// the fixed fallback sentence is returned without a network call.
pub struct Summarizer {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    request_timeout: Duration,
    template: String,
}

impl Summarizer {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Some(Duration::from_secs(300)))
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .build()
            .map_err(|e| PipelineError::LlmService(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.ollama_url.trim_end_matches('/').to_string(),
            model: config.summary_model.clone(),
            temperature: config.summary_temperature,
            max_tokens: config.summary_max_tokens,
            request_timeout: Duration::from_secs(config.summary_timeout_secs),
            template: Self::load_template(&config.prompts_dir),
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    /// External template wins when present so prompts can be tuned
    /// without a rebuild.
    fn load_template(prompts_dir: &str) -> String {
        let path = std::path::Path::new(prompts_dir).join("summary.txt");
        match std::fs::read_to_string(&path) {
            Ok(template) => {
                info!("loaded summary prompt from {}", path.display());
                template
            }
            Err(_) => {
                info!(
                    "using built-in summary prompt (no file at {})",
                    path.display()
                );
                Self::default_template()
            }
        }
    }

    fn default_template() -> String {
        r#"You summarize restaurant reviews. Write 2-3 sentences about the {topic} at {restaurant_name}, grounded only in the numbered excerpts below. Open by saying whether the sentiment is positive, negative, or mixed. Do not mention excerpts, reviewers, or summarizing. If the excerpts say almost nothing about {topic}, reply exactly: {fallback}

Excerpts:
{evidence}

Summary:"#
            .to_string()
    }

    fn fallback_sentence(topic: Topic) -> String {
        let mut label = topic.as_str().to_string();
        if let Some(first) = label.get_mut(0..1) {
            first.make_ascii_uppercase();
        }
        format!("{label} details are limited in the provided reviews.")
    }

    pub(crate) fn build_prompt(
        &self,
        restaurant_name: &str,
        topic: Topic,
        evidence: &[Evidence],
    ) -> String {
        let lines: Vec<String> = evidence
            .iter()
            .enumerate()
            .map(|(i, e)| {
                format!("[{}] Review ({:.0} stars): {}", i + 1, e.stars, e.text.trim())
            })
            .collect();

        self.template
            .replace("{restaurant_name}", restaurant_name.trim())
            .replace("{topic}", topic.as_str())
            .replace("{fallback}", &Self::fallback_sentence(topic))
            .replace("{evidence}", &lines.join("\n"))
    }

    pub async fn summarize(
        &self,
        restaurant_name: &str,
        topic: Topic,
        evidence: &[Evidence],
    ) -> Result<String> {
        if evidence.is_empty() {
            return Ok(Self::fallback_sentence(topic));
        }

        let request = OllamaGenerateRequest {
            model: self.model.clone(),
            prompt: self.build_prompt(restaurant_name, topic, evidence),
            stream: false,
            options: Some(OllamaOptions {
                temperature: Some(self.temperature),
                num_predict: Some(self.max_tokens as i32),
            }),
        };

        let send = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send();

        let response = match timeout(self.request_timeout, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Err(PipelineError::LlmService(format!(
                    "generate request failed: {e}"
                )));
            }
            Err(_) => {
                return Err(PipelineError::LlmService(format!(
                    "generate request timed out after {}s",
                    self.request_timeout.as_secs()
                )));
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::LlmService(format!(
                "generate returned {status}: {body}"
            )));
        }

        let payload: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::LlmService(format!("unparseable generate response: {e}")))?;

        let summary = payload.response.trim().to_string();
        if summary.is_empty() {
            return Err(PipelineError::LlmService(
                "generate returned an empty completion".to_string(),
            ));
        }

        Ok(summary)
    }

    pub async fn test_connection(&self) -> Result<()> {
        self.client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| {
                PipelineError::LlmService(format!(
                    "cannot reach Ollama at {}: {e}",
                    self.base_url
                ))
            })?
            .error_for_status()
            .map_err(|e| PipelineError::LlmService(format!("Ollama tags endpoint failed: {e}")))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evidence(review_id: &str, text: &str, stars: f32) -> Evidence {
        Evidence {
            chunk_id: format!("chunk-{review_id}"),
            review_id: review_id.to_string(),
            text: text.to_string(),
            score: 0.9,
            position: 0,
            stars,
        }
    }

    fn summarizer_with(config: &Config) -> Summarizer {
        Summarizer::new(config).unwrap()
    }

    #[test]
    fn prompt_numbers_evidence_with_stars() {
        let config = Config::default();
        let summarizer = summarizer_with(&config);
        let evidence = vec![
            evidence("r1", "The pasta was outstanding.", 5.0),
            evidence("r2", "Portions were tiny for the price.", 2.0),
        ];

        let prompt = summarizer.build_prompt("Cafe Luna", Topic::Food, &evidence);

        assert!(prompt.contains("Cafe Luna"));
        assert!(prompt.contains("the food at"));
        assert!(prompt.contains("[1] Review (5 stars): The pasta was outstanding."));
        assert!(prompt.contains("[2] Review (2 stars): Portions were tiny for the price."));
    }

    #[tokio::test]
    async fn empty_evidence_short_circuits_without_network() {
        let mut config = Config::default();
        // nothing listens here; proves no request is attempted
        config.ollama_url = "http://127.0.0.1:1".to_string();
        let summarizer = summarizer_with(&config);

        let summary = summarizer
            .summarize("Cafe Luna", Topic::Ambiance, &[])
            .await
            .unwrap();

        assert_eq!(
            summary,
            "Ambiance details are limited in the provided reviews."
        );
    }

    #[test]
    fn external_template_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("summary.txt"),
            "CUSTOM {restaurant_name} / {topic} / {evidence}",
        )
        .unwrap();

        let mut config = Config::default();
        config.prompts_dir = dir.path().to_string_lossy().into_owned();
        let summarizer = summarizer_with(&config);

        let prompt =
            summarizer.build_prompt("Cafe Luna", Topic::Service, &[evidence("r1", "Quick seating.", 4.0)]);

        assert!(prompt.starts_with("CUSTOM Cafe Luna / service /"));
        assert!(prompt.contains("[1] Review (4 stars): Quick seating."));
    }

    #[test]
    fn fallback_sentence_capitalizes_topic() {
        assert_eq!(
            Summarizer::fallback_sentence(Topic::Food),
            "Food details are limited in the provided reviews."
        );
        assert_eq!(
            Summarizer::fallback_sentence(Topic::Service),
            "Service details are limited in the provided reviews."
        );
    }
}
