use crate::error::{PipelineError, Result};
use std::env;
use std::str::FromStr;

// Tuning defaults. Every one of these can be overridden through the
// environment variable of the same name.
const CHUNK_MAX_TOKENS: usize = 280;
const CHUNK_OVERLAP_TOKENS: usize = 60;
const MIN_TOKENS_TO_CHUNK: usize = 320;
const MIN_CHUNK_TOKENS: usize = 30;
const MIN_REVIEW_CHARS: usize = 20;
const EMBED_BATCH_SIZE: usize = 64;
const EMBED_BATCH_COOLDOWN_MS: u64 = 250;
const EMBED_TIMEOUT_SECS: u64 = 60;
const FLAT_INDEX_MAX_CHUNKS: usize = 2048;
const TOP_K_PER_TOPIC: usize = 12;
const OVERSAMPLE_FACTOR: usize = 2;
const SIMILARITY_THRESHOLD: f32 = 0.25;
const MAX_CHUNKS_PER_REVIEW: usize = 1;
const DEDUP_PREFIX_CHARS: usize = 48;
const PIPELINE_WORKERS: usize = 2;
const RETRY_MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 500;
const SUMMARY_TEMPERATURE: f32 = 0.2;
const SUMMARY_MAX_TOKENS: u32 = 600;
const SUMMARY_TIMEOUT_SECS: u64 = 120;
const SUMMARY_CONCURRENCY: usize = 2;
const MAX_SCAN_ROWS: usize = 2_000_000;
const MIN_REVIEWS_PER_RESTAURANT: usize = 40;
const MAX_RESTAURANTS: usize = 25;
const SAMPLE_SEED: u64 = 5;

fn parsed<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Pipeline configuration, resolved once at startup. Components receive
/// the fields they need by value; nothing reads the environment after
/// `from_env` returns.
#[derive(Debug, Clone)]
pub struct Config {
    // chunking
    pub chunk_max_tokens: usize,
    pub chunk_overlap_tokens: usize,
    pub min_tokens_to_chunk: usize,
    pub min_chunk_tokens: usize,
    pub min_review_chars: usize,
    // embedding
    pub embed_batch_size: usize,
    pub embed_batch_cooldown_ms: u64,
    pub embed_timeout_secs: u64,
    // indexing
    pub flat_index_max_chunks: usize,
    // retrieval
    pub top_k_per_topic: usize,
    pub oversample_factor: usize,
    pub similarity_threshold: f32,
    pub max_chunks_per_review: usize,
    pub dedup_prefix_chars: usize,
    // orchestration
    pub pipeline_workers: usize,
    pub retry_max_attempts: u32,
    pub retry_backoff_ms: u64,
    // ollama
    pub ollama_url: String,
    pub embedding_model: String,
    pub summary_model: String,
    pub summary_temperature: f32,
    pub summary_max_tokens: u32,
    pub summary_timeout_secs: u64,
    pub summary_concurrency: usize,
    // ingest
    pub business_path: String,
    pub reviews_path: String,
    pub max_scan_rows: usize,
    pub min_reviews_per_restaurant: usize,
    pub max_restaurants: usize,
    pub sample_seed: u64,
    // paths
    pub data_dir: String,
    pub index_dir: String,
    pub status_db_path: String,
    pub summaries_path: String,
    pub prompts_dir: String,
}

impl Config {
    pub fn from_env() -> Self {
        let data_dir = string("DATA_DIR", "./data");
        let index_dir = string("INDEX_DIR", &format!("{}/indexes", data_dir));
        let status_db_path = string(
            "STATUS_DB_PATH",
            &format!("sqlite:{}/pipeline_status.db", data_dir),
        );
        let summaries_path = string("SUMMARIES_PATH", &format!("{}/summaries.json", data_dir));

        Self {
            chunk_max_tokens: parsed("CHUNK_MAX_TOKENS", CHUNK_MAX_TOKENS),
            chunk_overlap_tokens: parsed("CHUNK_OVERLAP_TOKENS", CHUNK_OVERLAP_TOKENS),
            min_tokens_to_chunk: parsed("MIN_TOKENS_TO_CHUNK", MIN_TOKENS_TO_CHUNK),
            min_chunk_tokens: parsed("MIN_CHUNK_TOKENS", MIN_CHUNK_TOKENS),
            min_review_chars: parsed("MIN_REVIEW_CHARS", MIN_REVIEW_CHARS),
            embed_batch_size: parsed("EMBED_BATCH_SIZE", EMBED_BATCH_SIZE),
            embed_batch_cooldown_ms: parsed("EMBED_BATCH_COOLDOWN_MS", EMBED_BATCH_COOLDOWN_MS),
            embed_timeout_secs: parsed("EMBED_TIMEOUT_SECS", EMBED_TIMEOUT_SECS),
            flat_index_max_chunks: parsed("FLAT_INDEX_MAX_CHUNKS", FLAT_INDEX_MAX_CHUNKS),
            top_k_per_topic: parsed("TOP_K_PER_TOPIC", TOP_K_PER_TOPIC),
            oversample_factor: parsed("OVERSAMPLE_FACTOR", OVERSAMPLE_FACTOR),
            similarity_threshold: parsed("SIMILARITY_THRESHOLD", SIMILARITY_THRESHOLD),
            max_chunks_per_review: parsed("MAX_CHUNKS_PER_REVIEW", MAX_CHUNKS_PER_REVIEW),
            dedup_prefix_chars: parsed("DEDUP_PREFIX_CHARS", DEDUP_PREFIX_CHARS),
            pipeline_workers: parsed("PIPELINE_WORKERS", PIPELINE_WORKERS),
            retry_max_attempts: parsed("RETRY_MAX_ATTEMPTS", RETRY_MAX_ATTEMPTS),
            retry_backoff_ms: parsed("RETRY_BACKOFF_MS", RETRY_BACKOFF_MS),
            ollama_url: string("OLLAMA_URL", "http://localhost:11434"),
            embedding_model: string("OLLAMA_EMBEDDING_MODEL", "nomic-embed-text"),
            summary_model: string("OLLAMA_SUMMARY_MODEL", "llama3.1:8b"),
            summary_temperature: parsed("SUMMARY_TEMPERATURE", SUMMARY_TEMPERATURE),
            summary_max_tokens: parsed("SUMMARY_MAX_TOKENS", SUMMARY_MAX_TOKENS),
            summary_timeout_secs: parsed("SUMMARY_TIMEOUT_SECS", SUMMARY_TIMEOUT_SECS),
            summary_concurrency: parsed("SUMMARY_CONCURRENCY", SUMMARY_CONCURRENCY),
            business_path: string("BUSINESS_PATH", &format!("{}/business.jsonl", data_dir)),
            reviews_path: string("REVIEWS_PATH", &format!("{}/reviews.jsonl", data_dir)),
            max_scan_rows: parsed("MAX_SCAN_ROWS", MAX_SCAN_ROWS),
            min_reviews_per_restaurant: parsed(
                "MIN_REVIEWS_PER_RESTAURANT",
                MIN_REVIEWS_PER_RESTAURANT,
            ),
            max_restaurants: parsed("MAX_RESTAURANTS", MAX_RESTAURANTS),
            sample_seed: parsed("SAMPLE_SEED", SAMPLE_SEED),
            prompts_dir: string("PROMPTS_DIR", "./prompts"),
            data_dir,
            index_dir,
            status_db_path,
            summaries_path,
        }
    }

    /// Rejects configurations that would make the pipeline misbehave in
    /// ways that are hard to diagnose downstream.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_max_tokens == 0 {
            return Err(PipelineError::Config("CHUNK_MAX_TOKENS must be > 0".into()));
        }
        if self.chunk_overlap_tokens >= self.chunk_max_tokens {
            return Err(PipelineError::Config(format!(
                "CHUNK_OVERLAP_TOKENS ({}) must be smaller than CHUNK_MAX_TOKENS ({})",
                self.chunk_overlap_tokens, self.chunk_max_tokens
            )));
        }
        if self.min_chunk_tokens > self.chunk_max_tokens {
            return Err(PipelineError::Config(format!(
                "MIN_CHUNK_TOKENS ({}) cannot exceed CHUNK_MAX_TOKENS ({})",
                self.min_chunk_tokens, self.chunk_max_tokens
            )));
        }
        if self.top_k_per_topic == 0 {
            return Err(PipelineError::Config("TOP_K_PER_TOPIC must be > 0".into()));
        }
        if self.oversample_factor == 0 {
            return Err(PipelineError::Config("OVERSAMPLE_FACTOR must be > 0".into()));
        }
        if !self.similarity_threshold.is_finite() {
            return Err(PipelineError::Config(
                "SIMILARITY_THRESHOLD must be a finite number".into(),
            ));
        }
        if self.embed_batch_size == 0 {
            return Err(PipelineError::Config("EMBED_BATCH_SIZE must be > 0".into()));
        }
        if self.pipeline_workers == 0 {
            return Err(PipelineError::Config("PIPELINE_WORKERS must be > 0".into()));
        }
        if self.retry_max_attempts == 0 {
            return Err(PipelineError::Config("RETRY_MAX_ATTEMPTS must be > 0".into()));
        }
        if self.reviews_path.trim().is_empty() || self.business_path.trim().is_empty() {
            return Err(PipelineError::Config(
                "REVIEWS_PATH and BUSINESS_PATH must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// One-line description for the startup log.
    pub fn summary(&self) -> String {
        format!(
            "embed_model={} summary_model={} ollama={} chunks={}t/{}o top_k={} threshold={} workers={} index_dir={}",
            self.embedding_model,
            self.summary_model,
            self.ollama_url,
            self.chunk_max_tokens,
            self.chunk_overlap_tokens,
            self.top_k_per_topic,
            self.similarity_threshold,
            self.pipeline_workers,
            self.index_dir,
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_max_tokens: CHUNK_MAX_TOKENS,
            chunk_overlap_tokens: CHUNK_OVERLAP_TOKENS,
            min_tokens_to_chunk: MIN_TOKENS_TO_CHUNK,
            min_chunk_tokens: MIN_CHUNK_TOKENS,
            min_review_chars: MIN_REVIEW_CHARS,
            embed_batch_size: EMBED_BATCH_SIZE,
            embed_batch_cooldown_ms: EMBED_BATCH_COOLDOWN_MS,
            embed_timeout_secs: EMBED_TIMEOUT_SECS,
            flat_index_max_chunks: FLAT_INDEX_MAX_CHUNKS,
            top_k_per_topic: TOP_K_PER_TOPIC,
            oversample_factor: OVERSAMPLE_FACTOR,
            similarity_threshold: SIMILARITY_THRESHOLD,
            max_chunks_per_review: MAX_CHUNKS_PER_REVIEW,
            dedup_prefix_chars: DEDUP_PREFIX_CHARS,
            pipeline_workers: PIPELINE_WORKERS,
            retry_max_attempts: RETRY_MAX_ATTEMPTS,
            retry_backoff_ms: RETRY_BACKOFF_MS,
            ollama_url: "http://localhost:11434".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            summary_model: "llama3.1:8b".to_string(),
            summary_temperature: SUMMARY_TEMPERATURE,
            summary_max_tokens: SUMMARY_MAX_TOKENS,
            summary_timeout_secs: SUMMARY_TIMEOUT_SECS,
            summary_concurrency: SUMMARY_CONCURRENCY,
            business_path: "./data/business.jsonl".to_string(),
            reviews_path: "./data/reviews.jsonl".to_string(),
            max_scan_rows: MAX_SCAN_ROWS,
            min_reviews_per_restaurant: MIN_REVIEWS_PER_RESTAURANT,
            max_restaurants: MAX_RESTAURANTS,
            sample_seed: SAMPLE_SEED,
            data_dir: "./data".to_string(),
            index_dir: "./data/indexes".to_string(),
            status_db_path: "sqlite:./data/pipeline_status.db".to_string(),
            summaries_path: "./data/summaries.json".to_string(),
            prompts_dir: "./prompts".to_string(),
        }
    }
}
