use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use signalbus_bus::Publisher;
use signalbus_cli::{Cli, Manifest, execute};
use signalbus_infra::{PostgresRowStore, SignalBus, SignalBusConfig};

fn main() -> ExitCode {
    let cli = Cli::parse();
    signalbus_observability::init_with(cli.log_format, "info");

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "signalbus command failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let registry = Manifest::load(&cli.manifest)?.registry()?;
    let store = PostgresRowStore::connect(&cli.database_url, cli.max_connections)
        .context("failed to connect to the database")?;
    let publisher = publisher(cli)?;

    let bus = SignalBus::with_config(Arc::new(store), registry, publisher, SignalBusConfig::from_env());
    let mut stdout = io::stdout().lock();
    execute(&bus, &cli.command, &mut stdout)?;
    Ok(())
}

#[cfg(feature = "redis")]
fn publisher(cli: &Cli) -> Result<Arc<dyn Publisher>> {
    let url = cli
        .redis_url
        .as_deref()
        .context("no message bus configured; pass --redis-url or set SIGNALBUS_REDIS_URL")?;
    let publisher = signalbus_infra::publisher::RedisPublisher::new(url).context("invalid redis url")?;
    Ok(Arc::new(publisher))
}

#[cfg(not(feature = "redis"))]
fn publisher(_cli: &Cli) -> Result<Arc<dyn Publisher>> {
    anyhow::bail!("signalbus was built without a message bus client; enable the `redis` feature")
}
