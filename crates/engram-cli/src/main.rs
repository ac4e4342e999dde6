//! Engram service binary

use anyhow::Context;
use clap::{Parser, Subcommand};
use engram_api::{build_router, ApiKeyAuthenticator, EngramService};
use engram_infra::{HttpLlmAdapter, LlmEndpointConfig, SqliteStore};
use engram_types::ServiceSettings;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "engram", version, about = "Behavioral learning service for AI agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the service
    Serve {
        /// Settings file (TOML); environment variables apply on top
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Validate a settings file and exit
    Check {
        #[arg(long)]
        config: PathBuf,
    },
}

fn load_settings(config: Option<&PathBuf>) -> anyhow::Result<ServiceSettings> {
    let settings = match config {
        Some(path) => ServiceSettings::from_file(
            path.to_str()
                .context("settings path is not valid UTF-8")?,
        )?,
        None => ServiceSettings::from_env()?,
    };
    settings.validate()?;
    Ok(settings)
}

fn llm_endpoint_from_env() -> LlmEndpointConfig {
    let mut endpoint = LlmEndpointConfig::default();
    if let Ok(base_url) = std::env::var("ENGRAM_LLM_BASE_URL") {
        endpoint.base_url = base_url;
    }
    endpoint.api_key = std::env::var("ENGRAM_LLM_API_KEY").ok();
    endpoint
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    engram_api::logging::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config } => {
            load_settings(Some(&config))?;
            println!("settings ok");
            Ok(())
        }
        Commands::Serve { config } => {
            let settings = load_settings(config.as_ref())?;
            let store = Arc::new(SqliteStore::open(&settings.database_path).await?);
            let llm = Arc::new(HttpLlmAdapter::new(llm_endpoint_from_env())?);

            let auth = Arc::new(ApiKeyAuthenticator::new(
                store.clone(),
                settings.invitation_codes.clone(),
            ));
            let bind = format!("{}:{}", settings.host, settings.port);
            let service = Arc::new(EngramService::new(store, llm, settings));
            let router = build_router(service, auth);

            let listener = tokio::net::TcpListener::bind(&bind)
                .await
                .with_context(|| format!("failed to bind {bind}"))?;
            info!(%bind, "engram listening");
            axum::serve(listener, router).await?;
            Ok(())
        }
    }
}
