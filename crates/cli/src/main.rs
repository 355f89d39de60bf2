use std::sync::Arc;

use {
    anyhow::Context,
    clap::Parser,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    obridge_config::AppConfig,
    obridge_gateway::{GatewayState, serve},
    obridge_relay::{
        backoff::RetryPolicy,
        dispatch::RelayDispatcher,
        limiter::RateLimiterRegistry,
        platform::{ChatClient, MemoryInstallationStore},
        provision::{ChannelProvisioner, MemoryMappingStore},
        tokens::MemoryTokenStore,
        transfer::FileTransferPipeline,
    },
    obridge_slack::{SlackClient, SlackClientFactory},
};

#[derive(Parser)]
#[command(name = "obridge", about = "obridge cross-workspace relay gateway")]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, default_value_t = false)]
    json_logs: bool,

    /// Address to bind to (overrides BIND_ADDR).
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on (overrides PORT).
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs)?;

    let config = AppConfig::from_env().context("load configuration")?;
    let bind = cli.bind.unwrap_or_else(|| config.bind.clone());
    let port = cli.port.unwrap_or(config.port);

    let state = build_state(&config);
    let listener = tokio::net::TcpListener::bind((bind.as_str(), port))
        .await
        .with_context(|| format!("bind {bind}:{port}"))?;
    serve(state, listener).await.context("serve relay gateway")
}

fn init_tracing(log_level: &str, json_logs: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .context("parse log filter")?;
    if json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
    Ok(())
}

/// Wire the core against the Slack client and the in-process stores.
fn build_state(config: &AppConfig) -> GatewayState {
    let policy = RetryPolicy::default();
    let http = reqwest::Client::new();
    let chat: Arc<dyn ChatClient> = Arc::new(SlackClient::new(config.slack_bot_token.clone()));

    let dispatcher = RelayDispatcher::new(
        Arc::clone(&chat),
        ChannelProvisioner::new(
            Arc::clone(&chat),
            Arc::new(MemoryMappingStore::new()),
            policy,
        ),
        FileTransferPipeline::new(
            http.clone(),
            Arc::clone(&chat),
            Arc::new(MemoryInstallationStore::new()),
            Arc::new(SlackClientFactory::new()),
            policy,
        ),
        Arc::new(RateLimiterRegistry::new()),
        policy,
    );

    GatewayState {
        relay_secret: config.relay_secret.clone(),
        bot_token: config.slack_bot_token.clone(),
        chat,
        tokens: Arc::new(MemoryTokenStore::new()),
        dispatcher: Arc::new(dispatcher),
        http,
        policy,
    }
}
