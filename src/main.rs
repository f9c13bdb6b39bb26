//! NIHIA client CLI
//!
//! Connects to the Native Instruments Host Integration Agent and exercises
//! device control, event watching and display streaming.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod cli;
use cli::{Cli, Commands};

mod commands;

use nihia::ClientConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid --log-level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ClientConfig::load_or_default(cli.config.as_deref())?;
    debug!("Config: {:?}", config);

    let client = Arc::new(nihia::connect_client(&config).context("no NIHIA transport")?);
    let target = commands::Target {
        device_type: cli.device_type,
        serial: cli.serial.clone(),
    };

    // Handshakes and serial waits block; only `watch` stays on the runtime
    match cli.command {
        Commands::Devices { wait } => {
            let client = client.clone();
            blocking(move || commands::devices::list(&client, wait)).await?
        }
        Commands::Watch { global, count } => {
            commands::watch::watch(client.clone(), &config, target, global, count).await?
        }
        Commands::Focus => {
            let client = client.clone();
            blocking(move || commands::control::focus(&client, &target)).await?
        }
        Commands::Leds { colors } => {
            let client = client.clone();
            blocking(move || commands::control::leds(&client, &target, &colors)).await?
        }
        Commands::Keyzones { zones } => {
            let client = client.clone();
            blocking(move || commands::control::keyzones(&client, &target, &zones)).await?
        }
        Commands::Display {
            image,
            once,
            fit,
            seconds,
        } => {
            let client = client.clone();
            blocking(move || {
                commands::display::show(&client, &config, &target, &image, once, fit, seconds)
            })
            .await?
        }
    }

    blocking(move || {
        client.shutdown_all();
        Ok(())
    })
    .await
}

/// Run a synchronous command off the async worker threads
async fn blocking<F>(f: F) -> anyhow::Result<()>
where
    F: FnOnce() -> anyhow::Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("command task panicked")?
}
