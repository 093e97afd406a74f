use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod embeddings;
mod error;
mod index;
mod ingest;
mod normalizer;
mod pipeline;
mod progress;
mod retriever;
mod status;
mod store;
mod summarizer;

use config::Config;
use embeddings::{EmbeddingGateway, OllamaEmbedder};
use error::PipelineError;
use pipeline::PipelineOrchestrator;
use progress::ProgressFeed;
use retriever::{Topic, TopicQuery, TopicRetriever};
use status::{RestaurantStatus, StatusBoard};
use store::IndexStore;
use summarizer::Summarizer;

fn get_log_dir() -> String {
    std::env::var("LOG_DIR").unwrap_or_else(|_| {
        if std::path::Path::new("/var/log").exists() && is_writable("/var/log") {
            "/var/log/bistro-rag".to_string()
        } else {
            "./logs".to_string()
        }
    })
}

fn get_log_level() -> String {
    std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
}

fn get_log_max_mb() -> u64 {
    std::env::var("LOG_MAX_MB")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5)
}

fn is_writable(path: &str) -> bool {
    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(format!("{}/test_write", path))
        .map(|_| {
            let _ = std::fs::remove_file(format!("{}/test_write", path));
            true
        })
        .unwrap_or(false)
}

fn setup_logging() -> Result<()> {
    let log_dir = get_log_dir();
    let log_level = get_log_level();

    std::fs::create_dir_all(&log_dir)?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

    let is_development = std::env::var("DEVELOPMENT").is_ok() || std::env::var("DEV").is_ok();
    let force_console = std::env::var("CONSOLE_LOGS").is_ok();

    if is_development || force_console {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .compact()
            .init();
        tracing::info!("Development mode: logging to console");
    } else {
        let log_file = format!("{}/bistro-rag.log", log_dir);
        let file_appender = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)?;

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(file_appender)
            .json()
            .init();
    }

    tracing::info!("Logging initialized");
    tracing::info!("Log directory: {}", log_dir);
    tracing::info!("Log level: {}", log_level);

    Ok(())
}

async fn start_log_cleanup_task(log_dir: String, max_mb: u64) {
    let max_bytes = max_mb * 1024 * 1024;
    let log_file = format!("{}/bistro-rag.log", log_dir);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(300));

        loop {
            interval.tick().await;

            if let Ok(metadata) = std::fs::metadata(&log_file) {
                if metadata.len() > max_bytes {
                    if let Err(e) = std::fs::write(
                        &log_file,
                        format!("[LOG TRUNCATED - Size exceeded {}MB]\n", max_mb),
                    ) {
                        eprintln!("Failed to truncate log file: {}", e);
                    }
                }
            }
        }
    });
}

fn print_usage() {
    println!(
        "Usage: bistro-rag [COMMAND]\n\n\
         Commands:\n\
         \x20 build               ingest reviews and build per-restaurant indexes\n\
         \x20 summarize           write topic summaries for every stored index\n\
         \x20 all                 build then summarize (default)\n\
         \x20 query <id> <topic>  print evidence for one restaurant topic (food|service|ambiance)\n\
         \x20 status              print the status board\n\
         \x20 help                show this help"
    );
}

async fn open_store(config: &Arc<Config>) -> Result<(Arc<IndexStore>, Arc<StatusBoard>)> {
    let store = Arc::new(IndexStore::new(
        &config.index_dir,
        config.flat_index_max_chunks,
    ));
    let status = Arc::new(StatusBoard::new(&config.status_db_path).await?);
    Ok((store, status))
}

async fn connect_embedder(config: &Arc<Config>) -> Result<Arc<OllamaEmbedder>> {
    let embedder = OllamaEmbedder::new(config);
    embedder.test_connection().await?;
    match embedder.verify_model().await {
        Ok(true) => {}
        Ok(false) => tracing::warn!(
            "Embedding model '{}' not listed by Ollama, continuing anyway",
            config.embedding_model
        ),
        Err(e) => tracing::warn!("Could not verify embedding model: {}", e),
    }
    Ok(Arc::new(embedder))
}

async fn cmd_build(config: Arc<Config>, also_summarize: bool) -> Result<()> {
    let restaurants = ingest::load_restaurants(&config).await?;
    if restaurants.is_empty() {
        anyhow::bail!(
            "no qualifying restaurants found in {}",
            config.business_path
        );
    }
    let names: HashMap<String, String> = restaurants
        .iter()
        .map(|r| (r.restaurant_id.clone(), r.name.clone()))
        .collect();

    let embedder = connect_embedder(&config).await?;
    let (store, status) = open_store(&config).await?;
    let progress = ProgressFeed::new(&get_log_dir())?;

    let orchestrator = PipelineOrchestrator::new(
        config.clone(),
        embedder.clone(),
        store.clone(),
        status.clone(),
        progress,
    );
    tracing::info!("Run {} starting", orchestrator.run_id());

    let report = orchestrator.run_build(restaurants).await?;
    println!(
        "Indexed {} restaurants ({} failed, {} skipped)",
        report.succeeded,
        report.failed.len(),
        report.skipped
    );
    for (id, detail) in &report.failed {
        eprintln!("  failed {id}: {detail}");
    }
    if report.succeeded == 0 && !report.failed.is_empty() {
        anyhow::bail!("every restaurant in the run failed to build");
    }

    if also_summarize {
        summarize_with(&config, &orchestrator, store, embedder, names).await?;
    }
    Ok(())
}

async fn summarize_with(
    config: &Arc<Config>,
    orchestrator: &PipelineOrchestrator,
    store: Arc<IndexStore>,
    embedder: Arc<OllamaEmbedder>,
    names: HashMap<String, String>,
) -> Result<()> {
    let summarizer = Summarizer::new(config)?;
    summarizer.test_connection().await?;
    let retriever = TopicRetriever::new(store, embedder as Arc<dyn EmbeddingGateway>, config);

    let report = orchestrator
        .run_summarize(&summarizer, &retriever, &names)
        .await?;
    println!(
        "Wrote summaries for {} restaurants to {} ({} failed)",
        report.written,
        config.summaries_path,
        report.failed.len()
    );
    for (id, detail) in &report.failed {
        eprintln!("  failed {id}: {detail}");
    }
    Ok(())
}

async fn cmd_summarize(config: Arc<Config>) -> Result<()> {
    // Names come from the business dump when available; ids otherwise.
    let names: HashMap<String, String> = match ingest::load_restaurants(&config).await {
        Ok(restaurants) => restaurants
            .into_iter()
            .map(|r| (r.restaurant_id, r.name))
            .collect(),
        Err(e) => {
            tracing::warn!("Could not load restaurant names: {}", e);
            HashMap::new()
        }
    };

    let embedder = connect_embedder(&config).await?;
    let (store, status) = open_store(&config).await?;
    let progress = ProgressFeed::new(&get_log_dir())?;
    let orchestrator = PipelineOrchestrator::new(
        config.clone(),
        embedder.clone(),
        store.clone(),
        status,
        progress,
    );

    summarize_with(&config, &orchestrator, store, embedder, names).await
}

async fn cmd_query(config: Arc<Config>, restaurant_id: &str, topic: Topic) -> Result<()> {
    // No connection probe here: the index loads before any anchor is
    // embedded, so a missing index is reported even with Ollama down.
    let embedder = Arc::new(OllamaEmbedder::new(&config));
    let (store, status) = open_store(&config).await?;
    let retriever =
        TopicRetriever::new(store, embedder as Arc<dyn EmbeddingGateway>, &config);

    let query = TopicQuery {
        restaurant_id: restaurant_id.to_string(),
        topic,
        top_k: config.top_k_per_topic,
        similarity_threshold: config.similarity_threshold,
    };

    match retriever.retrieve(&query).await {
        Ok(evidence) if evidence.is_empty() => {
            println!(
                "No evidence above the similarity threshold for {restaurant_id} on {topic}."
            );
            Ok(())
        }
        Ok(evidence) => {
            println!("{}", serde_json::to_string_pretty(&evidence)?);
            Ok(())
        }
        Err(PipelineError::IndexNotFound(_)) => {
            match status.get(restaurant_id).await? {
                Some(record) if record.status == RestaurantStatus::Failed => {
                    eprintln!(
                        "Index build failed for {restaurant_id}: {}",
                        record.detail.unwrap_or_else(|| "unknown error".to_string())
                    );
                }
                _ => {
                    eprintln!("No index built yet for {restaurant_id}; run `bistro-rag build` first.");
                }
            }
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

async fn cmd_status(config: Arc<Config>) -> Result<()> {
    let status = StatusBoard::new(&config.status_db_path).await?;
    let records = status.list().await?;
    if records.is_empty() {
        println!("Status board is empty; no runs recorded yet.");
        return Ok(());
    }
    for record in records {
        let detail = record.detail.unwrap_or_default();
        println!(
            "{:<24} {:<10} chunks={:<6} run={} updated={} {}",
            record.restaurant_id,
            record.status.as_str(),
            record.chunk_count,
            record.run_id,
            record.updated_at,
            detail
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenv::dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }
    setup_logging()?;

    let config = Config::from_env();
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e}");
        std::process::exit(2);
    }
    tracing::info!("Configuration: {}", config.summary());
    let config = Arc::new(config);

    tokio::fs::create_dir_all(&config.data_dir).await?;
    start_log_cleanup_task(get_log_dir(), get_log_max_mb()).await;

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("all");

    match command {
        "build" => cmd_build(config, false).await,
        "summarize" => cmd_summarize(config).await,
        "all" => cmd_build(config, true).await,
        "query" => {
            let (Some(restaurant_id), Some(topic_raw)) = (args.get(2), args.get(3)) else {
                eprintln!("query needs a restaurant id and a topic (food|service|ambiance)");
                std::process::exit(2);
            };
            let topic = match topic_raw.parse::<Topic>() {
                Ok(topic) => topic,
                Err(e) => {
                    eprintln!("{e}");
                    std::process::exit(2);
                }
            };
            cmd_query(config, restaurant_id, topic).await
        }
        "status" => cmd_status(config).await,
        "help" | "-h" | "--help" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            std::process::exit(2);
        }
    }
}
