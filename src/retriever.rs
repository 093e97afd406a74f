use crate::config::Config;
use crate::embeddings::EmbeddingGateway;
use crate::error::{PipelineError, Result};
use crate::index::normalize;
use crate::store::IndexStore;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// The three review aspects the dashboard summarizes. Each topic carries
/// a fixed anchor phrase; retrieval ranks chunks against the anchor's
/// embedding rather than against free-form queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Food,
    Service,
    Ambiance,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::Food, Topic::Service, Topic::Ambiance];

    pub fn anchor(&self) -> &'static str {
        match self {
            Topic::Food => "food taste flavor menu dishes portion fresh spicy presentation",
            Topic::Service => "service staff wait time hostess server rude friendly attentive",
            Topic::Ambiance => "ambiance atmosphere decor music lighting seating noise vibe",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Food => "food",
            Topic::Service => "service",
            Topic::Ambiance => "ambiance",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "food" => Ok(Topic::Food),
            "service" => Ok(Topic::Service),
            "ambiance" => Ok(Topic::Ambiance),
            other => Err(PipelineError::Config(format!(
                "unknown topic '{other}', expected food, service, or ambiance"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TopicQuery {
    pub restaurant_id: String,
    pub topic: Topic,
    pub top_k: usize,
    pub similarity_threshold: f32,
}

/// One retrieved chunk with enough context for prompting and display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evidence {
    pub chunk_id: String,
    pub review_id: String,
    pub text: String,
    pub score: f32,
    pub position: usize,
    pub stars: f32,
}

fn near_dup_key(text: &str, prefix_chars: usize) -> String {
    let collapsed = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed.chars().take(prefix_chars).collect()
}

/// Loads a restaurant's index and returns the strongest on-topic chunks.
/// Results are filtered by the similarity threshold, capped per review,
/// stripped of near-duplicate texts, and truncated to `top_k`. Short
/// result sets are returned as-is; nothing is ever padded in.
pub struct TopicRetriever {
    store: Arc<IndexStore>,
    gateway: Arc<dyn EmbeddingGateway>,
    anchors: RwLock<HashMap<Topic, Vec<f32>>>,
    oversample_factor: usize,
    max_chunks_per_review: usize,
    dedup_prefix_chars: usize,
}

impl TopicRetriever {
    pub fn new(
        store: Arc<IndexStore>,
        gateway: Arc<dyn EmbeddingGateway>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            gateway,
            anchors: RwLock::new(HashMap::new()),
            oversample_factor: config.oversample_factor.max(1),
            max_chunks_per_review: config.max_chunks_per_review.max(1),
            dedup_prefix_chars: config.dedup_prefix_chars,
        }
    }

    /// Each topic's anchor phrase is embedded at most once per process;
    /// afterwards the vector comes from the in-memory cache.
    async fn anchor_embedding(&self, topic: Topic) -> Result<Vec<f32>> {
        {
            let anchors = self.anchors.read().await;
            if let Some(vector) = anchors.get(&topic) {
                return Ok(vector.clone());
            }
        }

        let mut anchors = self.anchors.write().await;
        if let Some(vector) = anchors.get(&topic) {
            return Ok(vector.clone());
        }

        let mut embedded = self.gateway.embed(&[topic.anchor().to_string()]).await?;
        let mut vector = embedded.pop().ok_or_else(|| {
            PipelineError::EmbeddingService("gateway returned no vector for topic anchor".into())
        })?;
        if vector.is_empty() {
            return Err(PipelineError::EmbeddingService(
                "gateway returned an empty vector for topic anchor".into(),
            ));
        }
        normalize(&mut vector);
        anchors.insert(topic, vector.clone());
        debug!(topic = %topic, "cached topic anchor embedding");
        Ok(vector)
    }

    pub async fn retrieve(&self, query: &TopicQuery) -> Result<Vec<Evidence>> {
        let index = self.store.load(&query.restaurant_id).await?;
        let anchor = self.anchor_embedding(query.topic).await?;

        let want = query.top_k.saturating_mul(self.oversample_factor);
        let hits = index.search(&anchor, want)?;

        let mut evidence: Vec<Evidence> = hits
            .into_iter()
            .filter(|(_, score)| *score >= query.similarity_threshold)
            .filter_map(|(position, score)| {
                index.meta(position).map(|meta| Evidence {
                    chunk_id: meta.chunk_id.clone(),
                    review_id: meta.review_id.clone(),
                    text: meta.text.clone(),
                    score,
                    position: meta.position,
                    stars: meta.stars,
                })
            })
            .collect();

        evidence.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.position.cmp(&b.position))
        });

        // walk in rank order so every dedup decision keeps the stronger hit
        let mut per_review: HashMap<String, usize> = HashMap::new();
        let mut seen_texts: HashSet<String> = HashSet::new();
        let mut kept: Vec<Evidence> = Vec::new();
        for item in evidence {
            if kept.len() >= query.top_k {
                break;
            }
            let review_hits = per_review.entry(item.review_id.clone()).or_insert(0);
            if *review_hits >= self.max_chunks_per_review {
                continue;
            }
            if self.dedup_prefix_chars > 0
                && !seen_texts.insert(near_dup_key(&item.text, self.dedup_prefix_chars))
            {
                continue;
            }
            *review_hits += 1;
            kept.push(item);
        }

        debug!(
            restaurant_id = %query.restaurant_id,
            topic = %query.topic,
            kept = kept.len(),
            "topic retrieval complete"
        );
        Ok(kept)
    }
}
