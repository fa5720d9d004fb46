use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use tracing::warn;
use tracing_subscriber::{fmt, EnvFilter};

mod agent;
mod connection;
mod geometry;
mod image_store;
mod models;
mod report;
mod search;
mod server;
mod session;
mod settings;
mod telemetry;
mod transcript;

use settings::{resolve_effective_settings, LoopPolicies, ModelParams, SettingsLayer};

#[derive(Debug, Parser)]
#[command(name = "recon")]
#[command(about = "Image geolocation agent with live transcript streaming", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve uploads, static images and the session websocket.
    Start {
        /// Address to bind, e.g. 127.0.0.1:8000
        #[arg(long)]
        listen: Option<String>,
        /// Gemini model name (overrides MODEL_NAME)
        #[arg(long)]
        model: Option<String>,
        /// Directory holding uploads and crops
        #[arg(long)]
        static_dir: Option<String>,
        /// Maximum model calls per session
        #[arg(long)]
        max_turns: Option<u32>,
        #[arg(long)]
        temperature: Option<f32>,
        /// Do not install the Prometheus recorder
        #[arg(long)]
        no_metrics: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start { listen, model, static_dir, max_turns, temperature, no_metrics } => {
            let request = SettingsLayer {
                listen,
                model,
                static_dir,
                loop_policies: max_turns.map(|m| LoopPolicies { max_turns: Some(m), ..Default::default() }),
                model_params: temperature.map(|t| ModelParams { temperature: Some(t), ..Default::default() }),
                ..Default::default()
            };
            let settings = resolve_effective_settings(&SettingsLayer::builtin(), &SettingsLayer::from_env(), &request);
            if settings.gemini_api_key.is_none() {
                warn!("GEMINI_API_KEY is not set; sessions will fail at their first model call");
            }
            if settings.tavily_api_key.is_none() {
                warn!("TAVILY_API_KEY is not set; web_search will report failures to the model");
            }

            let addr: SocketAddr = settings.listen.parse()?;
            let metrics = if no_metrics { None } else { Some(telemetry::install_recorder()?) };
            let state = server::AppState::from_settings(settings, metrics)?;
            server::serve(addr, state).await?;
        }
    }
    Ok(())
}
