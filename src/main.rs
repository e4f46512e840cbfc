use claude_bridge::config::describe_search_paths;
use claude_bridge::{build_router, AppState, ProxyConfig, SharedLogger};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "claude-bridge",
    about = "Serve the Anthropic Messages API on top of OpenAI-compatible providers",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// JSONL request log path (overrides config)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in describe_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path);
        }
        return Ok(());
    }

    let mut config = ProxyConfig::find_and_load(cli.config.as_deref())?;

    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(log_file) = cli.log_file {
        config.logging.file = log_file;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("claude_bridge={},tower_http=info", config.logging.level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let logger = SharedLogger::new(&config.logging.file, config.logging.log_bodies)?;

    info!("claude-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("  Default provider: {}", config.routing.default_provider);
    for provider in &config.providers {
        info!(
            "  Provider {:<12} {} (reasoning: {}, max_context: {})",
            provider.key,
            provider.effective_base_url()?,
            provider.supports_reasoning,
            provider
                .max_context
                .map_or_else(|| "unbounded".to_string(), |c| c.to_string())
        );
    }
    info!("  Request log: {}", config.logging.file.display());

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    logger.info("startup", format!("Starting claude-bridge on {bind_addr}"));

    let state = Arc::new(AppState::new(config, logger)?);
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);
    info!("  To use with Claude Code:");
    info!("    ANTHROPIC_BASE_URL=http://{} claude", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
