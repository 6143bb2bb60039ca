use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use adjutant_channels::{telegram::TelegramAdapter, TelegramConfig};
use adjutant_core::{AlwaysHealthy, Engine, PricingTable};
use adjutant_observability::{canonical_logs_dir_from_root, init_process_logging, ProcessKind};
use adjutant_providers::{OpenAiClassifier, OpenAiConfig, OpenAiExecutor};
use adjutant_store::Store;
use adjutant_tools::{SafetyPolicy, ShellTool, ToolRegistry};
use adjutant_types::{EngineConfig, Event};

#[derive(Parser, Debug)]
#[command(name = "adjutant-engine")]
#[command(about = "Persistent conversational agent engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine: ingest, workers, proactive loop.
    Serve {
        #[arg(long, env = "ADJUTANT_STATE_DIR")]
        state_dir: Option<String>,
    },
}

/// `config.json` in the state dir.
#[derive(Debug, Deserialize, Default)]
struct AppSettings {
    #[serde(default)]
    engine: EngineConfig,
    telegram: Option<TelegramConfig>,
    model: Option<ModelSettings>,
}

#[derive(Debug, Deserialize)]
struct ModelSettings {
    api_key: String,
    #[serde(default = "default_base_url")]
    base_url: String,
    #[serde(default = "default_classifier_model")]
    classifier_model: String,
    #[serde(default = "default_executor_model")]
    executor_model: String,
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_classifier_model() -> String {
    "openai/gpt-4o-mini".to_string()
}

fn default_executor_model() -> String {
    "openai/gpt-4o".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve { state_dir } => serve(resolve_state_dir(state_dir)).await,
    }
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    dirs::data_local_dir()
        .map(|dir| dir.join("adjutant"))
        .unwrap_or_else(|| PathBuf::from(".adjutant"))
}

async fn serve(state_dir: PathBuf) -> anyhow::Result<()> {
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("cannot create state dir {}", state_dir.display()))?;
    let logs_dir = canonical_logs_dir_from_root(&state_dir);
    let (_log_guard, log_info) = init_process_logging(ProcessKind::Engine, &logs_dir, 14)?;
    info!(
        state_dir = %state_dir.display(),
        logs = %log_info.logs_dir,
        "starting adjutant-engine"
    );

    let settings = load_settings(&state_dir.join("config.json"))?;
    let model = settings
        .model
        .context("config.json needs a `model` block (api_key, base_url, models)")?;
    let telegram_config = settings
        .telegram
        .context("config.json needs a `telegram` block (bot_token, allowed_users)")?;

    let store = Arc::new(Store::open(&state_dir.join("storage").join("adjutant.db")).await?);
    let platform = Arc::new(TelegramAdapter::new(telegram_config)?);

    let classifier = Arc::new(OpenAiClassifier::new(
        "openai-compatible",
        OpenAiConfig::new(&model.base_url, &model.api_key, &model.classifier_model),
    ));
    let executor = Arc::new(OpenAiExecutor::new(
        "openai-compatible",
        OpenAiConfig::new(&model.base_url, &model.api_key, &model.executor_model),
    ));

    let registry = ToolRegistry::new();
    registry.register(Arc::new(ShellTool)).await;

    let pricing = PricingTable::new()
        .with_rate(&model.classifier_model, 0.15, 0.60)
        .with_rate(&model.executor_model, 2.50, 10.00);

    let engine = Arc::new(Engine::new(
        store,
        platform.clone(),
        classifier,
        executor,
        registry,
        SafetyPolicy::default(),
        pricing,
        Arc::new(AlwaysHealthy),
        settings.engine,
    ));

    let mut background = engine.spawn_background();
    spawn_listener(platform, engine.clone());

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    engine.shutdown();
    while background.join_next().await.is_some() {}
    info!("all loops stopped");
    Ok(())
}

fn load_settings(path: &PathBuf) -> anyhow::Result<AppSettings> {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw)
            .with_context(|| format!("invalid config at {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            anyhow::bail!(
                "no config found at {}; create it with `telegram` and `model` blocks",
                path.display()
            )
        }
        Err(err) => Err(err.into()),
    }
}

/// Long-poll listener with exponential-backoff restart, forwarding events
/// into the ingest path.
fn spawn_listener(platform: Arc<TelegramAdapter>, engine: Arc<Engine>) {
    tokio::spawn(async move {
        let mut backoff_secs: u64 = 1;
        loop {
            let (tx, mut rx) = mpsc::channel::<Event>(64);

            let listener = {
                let platform = platform.clone();
                tokio::spawn(async move {
                    if let Err(e) = platform.listen(tx).await {
                        error!("telegram listener error: {e}");
                    }
                })
            };

            while let Some(event) = rx.recv().await {
                backoff_secs = 1;
                match engine.ingest_event(&event).await {
                    Ok(outcome) => info!(?outcome, "event ingested"),
                    Err(err) => warn!("ingest failed: {err}"),
                }
            }

            listener.abort();
            warn!("telegram listener stopped — restarting in {backoff_secs}s");
            tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
            backoff_secs = (backoff_secs * 2).min(60);
        }
    });
}
