//! WebLLM admin CLI
//!
//! Inspect and manage the artifact cache from the command line.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use webllm::storage::artifact_cache::{ArtifactCache, ArtifactKind};
use webllm::storage::backend::open_backend;
use webllm::storage::fetch::{format_size, HttpFetcher};
use webllm::storage::settings::{load_app_config, load_settings, EngineSettings};
use webllm::system::gpu::{check_requirements, detect_gpu};
use webllm::types::config::AppConfig;
use webllm::types::progress::{ProgressReport, ProgressTracker};

const USAGE: &str = "usage: webllm <command>

commands:
  models                  list configured models and whether they are cached
  has <model_id>          exit 0 if the model is fully cached
  fetch <model_id>        download every artifact of a model
  delete <model_id> [kind]
                          delete a model (or one of config, tokenizer, weights, kernel)
  accelerator             show the detected accelerator and which models it can run";

fn open_cache(settings: &EngineSettings, app_config: &AppConfig) -> Result<ArtifactCache, String> {
    let kind = if settings.app_config_path.exists() {
        app_config.cache_backend
    } else {
        settings.cache_backend
    };
    let backend = open_backend(kind, &settings.cache_dir, settings.cache_quota_bytes).map_err(|e| e.to_string())?;
    let fetcher = HttpFetcher::new(Duration::from_secs(settings.download_timeout_secs)).map_err(|e| e.to_string())?;
    Ok(ArtifactCache::new(backend, Arc::new(fetcher)).with_fetch_concurrency(settings.max_concurrent_fetches))
}

async fn run(args: &[String], settings: &EngineSettings) -> Result<bool, String> {
    let app_config = load_app_config(&settings.app_config_path).map_err(|e| e.to_string())?;
    let record = |id: &str| {
        app_config
            .find_model(id)
            .ok_or_else(|| format!("unknown model: {id}"))
    };

    match args {
        [cmd] if cmd == "models" => {
            let cache = open_cache(settings, &app_config)?;
            for model in &app_config.model_list {
                let cached = cache.has(model).await.map_err(|e| e.to_string())?;
                println!("{}\t{}", model.model_id, if cached { "cached" } else { "-" });
            }
            let usage = cache.usage().await.map_err(|e| e.to_string())?;
            println!("{} cache: {}", cache.backend_name(), format_size(usage));
            Ok(true)
        }
        [cmd, id] if cmd == "has" => {
            let cache = open_cache(settings, &app_config)?;
            let cached = cache.has(record(id.as_str())?).await.map_err(|e| e.to_string())?;
            println!("{}", cached);
            Ok(cached)
        }
        [cmd, id] if cmd == "fetch" => {
            let cache = open_cache(settings, &app_config)?;
            let tracker = ProgressTracker::new(Some(Arc::new(|report: ProgressReport| {
                println!("[{:5.1}%] {}", report.progress * 100.0, report.text);
            })));
            let artifacts = cache
                .fetch_model(record(id.as_str())?, &tracker)
                .await
                .map_err(|e| e.to_string())?;
            println!(
                "{}: {} in {} shards",
                id,
                format_size(artifacts.manifest.total_bytes()),
                artifacts.manifest.records.len()
            );
            Ok(true)
        }
        [cmd, id, rest @ ..] if cmd == "delete" && rest.len() <= 1 => {
            let cache = open_cache(settings, &app_config)?;
            let model = record(id.as_str())?;
            let removed = match rest.first() {
                Some(kind) => {
                    let kind: ArtifactKind = kind.parse()?;
                    cache.delete_artifact(model, kind).await
                }
                None => cache.delete_all(model).await,
            }
            .map_err(|e| e.to_string())?;
            println!("removed {} entries", removed);
            Ok(true)
        }
        [cmd] if cmd == "accelerator" => {
            let info = detect_gpu();
            println!(
                "{} ({} MB, features: {})",
                info.name,
                info.vram_total_mb,
                info.features.iter().cloned().collect::<Vec<_>>().join(", ")
            );
            for model in &app_config.model_list {
                match check_requirements(model, &info) {
                    Ok(()) => println!("{}\tok", model.model_id),
                    Err(missing) => println!("{}\tmissing {}", model.model_id, missing.join(", ")),
                }
            }
            Ok(true)
        }
        _ => {
            eprintln!("{USAGE}");
            Ok(false)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let settings = load_settings();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args, &settings).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
