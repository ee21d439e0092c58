use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use curation_bot::bot_config::BotConfig;
use curation_bot::config::Config;
use curation_bot::context::AppContext;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        // Tracing may not be up yet if configuration failed to load.
        let _ = init_tracing("INFO");
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    // Load and validate configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let bot = BotConfig::load(&config)
        .await
        .context("Failed to load bot configuration")?;

    // Initialize logging
    init_tracing(&bot.global_config.log_level)?;

    info!(
        database = %config.database_path.display(),
        sources = bot.target_lists.len(),
        "Starting curation-bot"
    );

    let ctx = AppContext::new(config, bot)
        .await
        .context("Failed to initialize")?;

    let report = ctx.run_batch().await?;

    let failed = report.failed_sources();
    if failed.is_empty() {
        info!(
            sources = report.sources.len(),
            new = report.new_items(),
            "Batch complete"
        );
    } else {
        warn!(
            sources = report.sources.len(),
            new = report.new_items(),
            failed = ?failed,
            "Batch complete with failed sources"
        );
    }

    Ok(())
}

/// Default filter for a bot-config log level (`DEBUG`, `INFO`, `WARNING`, ...).
fn filter_directive(log_level: &str) -> String {
    let level = match log_level.trim().to_ascii_uppercase().as_str() {
        "TRACE" => "trace",
        "DEBUG" => "debug",
        "WARN" | "WARNING" => "warn",
        "ERROR" | "CRITICAL" | "FATAL" => "error",
        _ => "info",
    };
    format!("{level},curation_bot={level}")
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(log_level)));

    // Check if JSON logging is requested
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| matches!(v.to_lowercase().as_str(), "json" | "structured"))
        .unwrap_or(false);

    if use_json {
        // Structured JSON logging for production
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    } else {
        // Pretty-printed logging for development
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    }

    Ok(())
}
