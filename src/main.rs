use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use homedir::my_home;
use inquire::error::InquireResult;
use serde::Deserialize;

mod auth;
mod batch;
mod cli;
mod config;
mod eid;
mod embedding;
mod errors;
mod lock;
mod service;
mod sources;
mod storage;
mod store;
#[cfg(test)]
mod tests;
mod web;

use config::{Config, EmbeddingProvider};
use eid::OwnerId;
use embedding::{gemini::GeminiEmbedder, retry::RetryingEmbedder, Embedder};
use service::{EmbeddingService, GenerateRequest, SearchRequest};
use sources::{NewSource, SourceCatalog};
use store::{EmbeddingStore, PartitionFiles, TaskType};

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn base_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("VECDEDUP_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }
    let home = my_home()
        .map_err(|e| anyhow::anyhow!("could not determine home directory: {e:?}"))?
        .context("home directory path is empty")?;
    Ok(home.join(".local/share/vecdedup"))
}

fn build_embedder(config: &Config) -> anyhow::Result<Arc<dyn Embedder>> {
    let embedding = &config.embedding;
    let retry = embedding.retry.clone();

    match embedding.provider {
        EmbeddingProvider::Gemini => {
            let gemini = GeminiEmbedder::from_config(embedding, config.store.dimensions)
                .context("failed to set up Gemini embeddings")?;
            Ok(Arc::new(RetryingEmbedder::new(gemini, retry)))
        }
        #[cfg(feature = "local-embed")]
        EmbeddingProvider::Local => {
            let local = embedding::local::LocalEmbedder::new(
                &embedding.local_model,
                config.base_path(),
                embedding.max_input_chars,
            )
            .context("failed to load local embedding model")?;
            if local.dimensions() != config.store.dimensions {
                bail!(
                    "model {} produces {} dimensions but store.dimensions is {}",
                    embedding.local_model,
                    local.dimensions(),
                    config.store.dimensions
                );
            }
            Ok(Arc::new(RetryingEmbedder::new(local, retry)))
        }
        #[cfg(not(feature = "local-embed"))]
        EmbeddingProvider::Local => {
            bail!("local embeddings need a build with the `local-embed` feature")
        }
    }
}

fn build_service(config: &Config, embedder: Arc<dyn Embedder>) -> anyhow::Result<EmbeddingService> {
    let files = PartitionFiles::new(
        config.embeddings_dir(),
        config.embedding.model_name(),
        config.store.dimensions,
    )
    .context("failed to open embeddings directory")?;
    let store = EmbeddingStore::open(files, config.store.dimensions, config.store.index.clone())
        .context("failed to load embeddings")?;
    let sources = SourceCatalog::open(config.base_path()).context("failed to load sources")?;

    EmbeddingService::new(store, sources, embedder, config).context("failed to start batch pool")
}

/// Service for commands that only read or delete.
fn build_offline_service(config: &Config) -> anyhow::Result<EmbeddingService> {
    let embedder = Arc::new(embedding::Unavailable::new(config.embedding.model_name()));
    build_service(config, embedder)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportItem {
    #[serde(flatten)]
    source: NewSource,
    content: String,
    #[serde(default)]
    task_type: Option<TaskType>,
}

fn read_import_file(path: &std::path::Path) -> anyhow::Result<Vec<ImportItem>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    data.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid item", path.display(), idx + 1))
        })
        .collect()
}

fn create_progress_bar(total: u64) -> anyhow::Result<indicatif::ProgressBar> {
    let pb = indicatif::ProgressBar::new(total);
    pb.set_style(
        indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    pb.set_message("embedding");
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = cli::Args::parse();

    let base_path = base_path()?;
    let _lock = lock::FileLock::try_acquire(&base_path)
        .with_context(|| format!("failed to lock {}", base_path.display()))?;
    let config = Config::load_with(&base_path)?;

    match args.command {
        cli::Command::Daemon { bind } => {
            let bind = bind
                .or_else(|| std::env::var("VECDEDUP_ADDR").ok())
                .unwrap_or_else(|| config.server.bind.clone());

            let verifier = auth::StaticTokenVerifier::new(&config.auth);
            if verifier.is_empty() {
                log::warn!("no auth.tokens configured, every request will be rejected");
            }

            let embedder = build_embedder(&config)?;
            let service = build_service(&config, embedder)?;
            log::info!(
                "serving {} owners with {} ({} dims)",
                service.store().owner_count(),
                config.embedding.model_name(),
                service.store().dimensions()
            );
            let state = web::SharedState::new(Arc::new(service), Arc::new(verifier));

            web::start_daemon(state, &bind)
        }

        cli::Command::Stats { owner } => {
            let service = build_offline_service(&config)?;
            let stats = service.stats(&OwnerId::new(owner))?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }

        cli::Command::Cluster { owner, k } => {
            let service = build_offline_service(&config)?;
            let assignments = service.cluster(&OwnerId::new(owner), k)?;
            println!("{}", serde_json::to_string_pretty(&assignments)?);
            Ok(())
        }

        cli::Command::Search {
            owner,
            query,
            threshold,
            max_results,
        } => {
            let service = build_service(&config, build_embedder(&config)?)?;
            let request = SearchRequest {
                query,
                similarity_threshold: threshold,
                max_results,
                include_content: false,
            };
            let response = service.search(&OwnerId::new(owner), &request)?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }

        cli::Command::Delete {
            owner,
            source_ref_id,
            yes,
        } => {
            let owner = OwnerId::new(owner);
            let service = build_offline_service(&config)?;

            let Some(source) = service.sources().get(&owner, &source_ref_id)? else {
                bail!("source {source_ref_id} not found for {owner}");
            };

            if !yes {
                match inquire::prompt_confirmation(format!(
                    "Delete \"{}\" ({}) and all of its embeddings?",
                    source.title, source.id
                )) {
                    InquireResult::Ok(true) => {}
                    InquireResult::Ok(false) => return Ok(()),
                    InquireResult::Err(err) => bail!("An error occurred: {}", err),
                }
            }

            let deleted = service.delete_source(&owner, &source_ref_id)?;
            println!("{}", serde_json::to_string_pretty(&deleted)?);
            Ok(())
        }

        cli::Command::EmbedFile {
            owner,
            path,
            check_duplicates,
        } => {
            let owner = OwnerId::new(owner);
            let items = read_import_file(&path)?;
            if items.is_empty() {
                println!("nothing to embed in {}", path.display());
                return Ok(());
            }

            let service = build_service(&config, build_embedder(&config)?)?;

            let mut requests = Vec::with_capacity(items.len());
            for item in items {
                let source = service.register_source(&owner, item.source)?;
                requests.push(GenerateRequest {
                    source_ref_id: source.id,
                    content: item.content,
                    task_type: item.task_type,
                    check_duplicates,
                });
            }

            let pb = create_progress_bar(requests.len() as u64)?;
            let results = service.generate_batch_with(
                &owner,
                &requests,
                &batch::CancelToken::new(),
                |_| pb.inc(1),
            );
            pb.finish_and_clear();

            let failed = results
                .iter()
                .filter(|r| r.status == service::BatchStatus::Error)
                .count();
            println!("{}", serde_json::to_string_pretty(&results)?);
            if failed > 0 {
                bail!("{failed} of {} items failed", results.len());
            }
            Ok(())
        }
    }
}
