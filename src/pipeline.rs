use crate::config::Config;
use crate::embeddings::EmbeddingGateway;
use crate::error::{PipelineError, Result};
use crate::index::IndexBuilder;
use crate::ingest::Restaurant;
use crate::normalizer::TextNormalizer;
use crate::progress::{ProgressFeed, RunProgress, Stage};
use crate::retriever::{Evidence, Topic, TopicQuery, TopicRetriever};
use crate::status::{RestaurantStatus, StatusBoard};
use crate::store::IndexStore;
use crate::summarizer::Summarizer;
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

const MAX_BACKOFF_MS: u64 = 30_000;

/// Retries `op` on retryable errors with exponential backoff. Anything
/// the error taxonomy marks non-retryable is returned on first failure.
pub async fn retry_with_backoff<T, F, Fut>(
    max_attempts: u32,
    backoff_base_ms: u64,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let exp = (attempt - 1).min(16);
                let delay = backoff_base_ms.saturating_mul(1u64 << exp).min(MAX_BACKOFF_MS);
                warn!(attempt, delay_ms = delay, "retryable failure: {e}");
                sleep(Duration::from_millis(delay)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Debug, Default)]
pub struct BuildReport {
    pub succeeded: usize,
    pub failed: Vec<(String, String)>,
    pub skipped: usize,
}

#[derive(Debug, Default)]
pub struct SummaryReport {
    pub written: usize,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicSummary {
    pub topic: Topic,
    pub summary: String,
    pub evidence: Vec<Evidence>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestaurantSummaries {
    pub restaurant_id: String,
    pub name: String,
    pub generated_at: DateTime<Utc>,
    pub topics: Vec<TopicSummary>,
}

/// Drives the full index build and the summary pass. Each run gets a
/// fresh run id; restaurant work is fanned out over a bounded worker
/// pool and one restaurant's failure never aborts the rest.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    config: Arc<Config>,
    normalizer: TextNormalizer,
    gateway: Arc<dyn EmbeddingGateway>,
    store: Arc<IndexStore>,
    status: Arc<StatusBoard>,
    progress: ProgressFeed,
    run_id: String,
}

impl PipelineOrchestrator {
    pub fn new(
        config: Arc<Config>,
        gateway: Arc<dyn EmbeddingGateway>,
        store: Arc<IndexStore>,
        status: Arc<StatusBoard>,
        progress: ProgressFeed,
    ) -> Self {
        let normalizer = TextNormalizer::new(&config);
        Self {
            config,
            normalizer,
            gateway,
            store,
            status,
            progress,
            run_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Feed writes must never take a run down with them.
    async fn feed(
        &self,
        run: &Arc<Mutex<RunProgress>>,
        stage: Stage,
        event: &str,
        subject: Option<&str>,
        note: Option<&str>,
    ) {
        let mut snapshot = run.lock().await.clone();
        snapshot.stage = stage;
        if let Err(e) = self.progress.emit(&snapshot, event, subject, note).await {
            error!("progress feed write failed: {e}");
        }
    }

    pub async fn run_build(&self, restaurants: Vec<Restaurant>) -> Result<BuildReport> {
        let total = restaurants.len();
        let run = Arc::new(Mutex::new(RunProgress::new(&self.run_id, total)));
        self.feed(
            &run,
            Stage::Discover,
            "stage",
            None,
            Some(&format!("{total} restaurants queued")),
        )
        .await;

        for restaurant in &restaurants {
            self.status
                .register(&restaurant.restaurant_id, &self.run_id)
                .await?;
        }

        let permits = Arc::new(Semaphore::new(self.config.pipeline_workers.max(1)));
        let mut handles = Vec::with_capacity(total);

        for restaurant in restaurants {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| PipelineError::Task(format!("worker pool closed: {e}")))?;
            let worker = self.clone();
            let run = run.clone();
            let id = restaurant.restaurant_id.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                let id = restaurant.restaurant_id.clone();
                let outcome = worker.build_one(&restaurant, &run).await;
                if let Err(ref e) = outcome {
                    let detail = e.to_string();
                    match worker
                        .status
                        .advance(&id, &worker.run_id, RestaurantStatus::Failed, Some(&detail), 0)
                        .await
                    {
                        Ok(_) => {}
                        Err(se) => error!("could not record failure for {id}: {se}"),
                    }
                }
                outcome
            });
            handles.push((id, handle));
        }

        let mut report = BuildReport::default();
        for (id, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(PipelineError::Task(format!("task panicked: {e}"))),
            };
            match outcome {
                Ok(Some(chunk_count)) => {
                    report.succeeded += 1;
                    {
                        let mut guard = run.lock().await;
                        guard.done += 1;
                        guard.succeeded += 1;
                    }
                    self.feed(
                        &run,
                        Stage::Index,
                        "done",
                        Some(&id),
                        Some(&format!("{chunk_count} chunks indexed")),
                    )
                    .await;
                }
                Ok(None) => {
                    report.skipped += 1;
                    {
                        let mut guard = run.lock().await;
                        guard.done += 1;
                        guard.skipped += 1;
                    }
                    self.feed(&run, Stage::Index, "done", Some(&id), Some("skipped"))
                        .await;
                }
                Err(e) => {
                    let detail = e.to_string();
                    warn!("build failed for {id}: {detail}");
                    report.failed.push((id.clone(), detail.clone()));
                    {
                        let mut guard = run.lock().await;
                        guard.done += 1;
                        guard.failed += 1;
                    }
                    self.feed(&run, Stage::Index, "error", Some(&id), Some(&detail))
                        .await;
                }
            }
        }

        self.feed(
            &run,
            Stage::Finalize,
            "stage",
            None,
            Some(&format!(
                "succeeded={} failed={} skipped={}",
                report.succeeded,
                report.failed.len(),
                report.skipped
            )),
        )
        .await;
        info!(
            succeeded = report.succeeded,
            failed = report.failed.len(),
            skipped = report.skipped,
            "index build finished"
        );

        Ok(report)
    }

    /// Builds and persists one restaurant's index. Returns the indexed
    /// chunk count, or None when another worker already claimed the id.
    async fn build_one(
        &self,
        restaurant: &Restaurant,
        run: &Arc<Mutex<RunProgress>>,
    ) -> Result<Option<usize>> {
        let id = restaurant.restaurant_id.as_str();

        if !self.status.claim(id, &self.run_id).await? {
            info!("{id} already claimed in this run, skipping");
            return Ok(None);
        }

        let mut chunks = Vec::new();
        let mut unusable_reviews = 0usize;
        for review in &restaurant.reviews {
            match self.normalizer.normalize_and_chunk(review) {
                Ok(mut review_chunks) => chunks.append(&mut review_chunks),
                Err(PipelineError::EmptyInput(_)) => unusable_reviews += 1,
                Err(e) => return Err(e),
            }
        }
        if chunks.is_empty() {
            return Err(PipelineError::EmptyIndex(id.to_string()));
        }
        self.feed(
            run,
            Stage::Normalize,
            "progress",
            Some(id),
            Some(&format!(
                "{} chunks from {} reviews ({unusable_reviews} unusable)",
                chunks.len(),
                restaurant.reviews.len()
            )),
        )
        .await;

        let stars_by_review: HashMap<String, f32> = restaurant
            .reviews
            .iter()
            .map(|r| (r.review_id.clone(), r.stars))
            .collect();

        let batch_size = self.config.embed_batch_size.max(1);
        let total_batches = chunks.len().div_ceil(batch_size);
        let mut vectors = Vec::with_capacity(chunks.len());
        for (batch_idx, batch) in chunks.chunks(batch_size).enumerate() {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let batch_vectors = retry_with_backoff(
                self.config.retry_max_attempts,
                self.config.retry_backoff_ms,
                || self.gateway.embed(&texts),
            )
            .await?;
            if batch_vectors.len() != texts.len() {
                return Err(PipelineError::EmbeddingService(format!(
                    "received {} embeddings for {} chunks",
                    batch_vectors.len(),
                    texts.len()
                )));
            }
            vectors.extend(batch_vectors);

            self.feed(
                run,
                Stage::Embed,
                "progress",
                Some(id),
                Some(&format!("batch {}/{total_batches}", batch_idx + 1)),
            )
            .await;

            if batch_idx + 1 < total_batches && self.config.embed_batch_cooldown_ms > 0 {
                sleep(Duration::from_millis(self.config.embed_batch_cooldown_ms)).await;
            }
        }

        let builder = IndexBuilder::new(self.config.flat_index_max_chunks);
        let index = builder.build(
            id,
            self.gateway.model_name(),
            &chunks,
            &stars_by_review,
            vectors,
        )?;
        let chunk_count = index.len();
        self.store.save(&index).await?;

        let advanced = self
            .status
            .advance(
                id,
                &self.run_id,
                RestaurantStatus::Succeeded,
                None,
                chunk_count as i64,
            )
            .await?;
        if !advanced {
            warn!("{id} was already in a terminal state when build finished");
        }

        Ok(Some(chunk_count))
    }

    /// Writes topic summaries for every stored index to the summaries
    /// artifact. Per-restaurant failures are reported, not fatal.
    pub async fn run_summarize(
        &self,
        summarizer: &Summarizer,
        retriever: &TopicRetriever,
        names: &HashMap<String, String>,
    ) -> Result<SummaryReport> {
        let ids = self.store.list().await?;
        if ids.is_empty() {
            info!("no stored indexes, nothing to summarize");
            return Ok(SummaryReport::default());
        }

        let run = Arc::new(Mutex::new(RunProgress::new(&self.run_id, ids.len())));
        self.feed(
            &run,
            Stage::Summarize,
            "stage",
            None,
            Some(&format!("{} restaurants to summarize", ids.len())),
        )
        .await;

        let mut pending = ids.into_iter();
        let mut in_flight = FuturesUnordered::new();
        for _ in 0..self.config.summary_concurrency.max(1) {
            if let Some(id) = pending.next() {
                let name = names.get(&id).cloned().unwrap_or_else(|| id.clone());
                in_flight.push(self.summarize_one(summarizer, retriever, name, id));
            }
        }

        let mut report = SummaryReport::default();
        let mut results = Vec::new();
        while let Some((id, outcome)) = in_flight.next().await {
            match outcome {
                Ok(summaries) => {
                    results.push(summaries);
                    {
                        let mut guard = run.lock().await;
                        guard.done += 1;
                        guard.succeeded += 1;
                    }
                    self.feed(&run, Stage::Summarize, "done", Some(&id), None)
                        .await;
                }
                Err(e) => {
                    let detail = e.to_string();
                    warn!("summaries failed for {id}: {detail}");
                    report.failed.push((id.clone(), detail.clone()));
                    {
                        let mut guard = run.lock().await;
                        guard.done += 1;
                        guard.failed += 1;
                    }
                    self.feed(&run, Stage::Summarize, "error", Some(&id), Some(&detail))
                        .await;
                }
            }
            if let Some(id) = pending.next() {
                let name = names.get(&id).cloned().unwrap_or_else(|| id.clone());
                in_flight.push(self.summarize_one(summarizer, retriever, name, id));
            }
        }

        results.sort_by(|a, b| a.restaurant_id.cmp(&b.restaurant_id));
        report.written = results.len();

        let path = std::path::Path::new(&self.config.summaries_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(&results)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;

        self.feed(
            &run,
            Stage::Finalize,
            "stage",
            None,
            Some(&format!(
                "written={} failed={}",
                report.written,
                report.failed.len()
            )),
        )
        .await;
        info!(
            written = report.written,
            failed = report.failed.len(),
            path = %path.display(),
            "summaries written"
        );

        Ok(report)
    }

    async fn summarize_one(
        &self,
        summarizer: &Summarizer,
        retriever: &TopicRetriever,
        name: String,
        id: String,
    ) -> (String, Result<RestaurantSummaries>) {
        let mut topics = Vec::with_capacity(Topic::ALL.len());
        for topic in Topic::ALL {
            let query = TopicQuery {
                restaurant_id: id.clone(),
                topic,
                top_k: self.config.top_k_per_topic,
                similarity_threshold: self.config.similarity_threshold,
            };
            let evidence = match retriever.retrieve(&query).await {
                Ok(evidence) => evidence,
                Err(e) => return (id, Err(e)),
            };
            let summary = match retry_with_backoff(
                self.config.retry_max_attempts,
                self.config.retry_backoff_ms,
                || summarizer.summarize(&name, topic, &evidence),
            )
            .await
            {
                Ok(summary) => summary,
                Err(e) => return (id, Err(e)),
            };
            topics.push(TopicSummary {
                topic,
                summary,
                evidence,
            });
        }

        let summaries = RestaurantSummaries {
            restaurant_id: id.clone(),
            name,
            generated_at: Utc::now(),
            topics,
        };
        (id, Ok(summaries))
    }
}
