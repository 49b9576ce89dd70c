use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use tracing_subscriber::{EnvFilter, fmt};

mod client;
mod config;
mod events;
mod relay;
mod server;
mod session;
mod sse;
mod tools;

#[derive(Debug, Parser)]
#[command(name = "atlas_chat")]
#[command(about = "Chat relay for the single-cell atlas explorer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Start {
        #[arg(long, default_value = "127.0.0.1:12534")]
        listen: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start { listen } => {
            let addr: SocketAddr = listen.parse()?;
            let config = config::ChatConfig::from_env();
            let mut state = server::AppState::from_config(config)?;
            state.metrics =
                Some(metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?);

            let cancel = tokio_util::sync::CancellationToken::new();
            let sweeper = state.store.spawn_sweeper(
                state.config.sweep_interval_secs,
                state.config.session_ttl_secs,
                cancel.clone(),
            );

            server::serve(addr, state).await?;

            cancel.cancel();
            sweeper.await?;
        }
    }
    Ok(())
}
