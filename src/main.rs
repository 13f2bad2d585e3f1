use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// PostgreSQL CDC replicator fanning changes out to PostgreSQL, ClickHouse
/// and Redis
#[derive(Debug, Parser)]
#[command(name = "pg2many", version, about)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let args = Args::parse();
    let config = pg2many_lib::config::load(args.config.as_deref())?;

    tracing::info!("Starting pg2many");
    pg2many_lib::app::run(config).await?;
    tracing::info!("pg2many stopped");
    Ok(())
}

/// Structured JSON logging with env-based level filtering.
///
/// The default level can be overridden through `RUST_LOG`.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pg2many=info,pg2many_lib=info,tokio_postgres=warn"));

    let fmt_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_current_span(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
