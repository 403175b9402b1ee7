//! Move running pods to a specific node, bypassing the cluster scheduler.

mod app;
mod cli;
mod config;
mod error;
#[cfg(test)]
mod fixtures;
mod k8s;
mod retry;
#[cfg(test)]
mod retry_test;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use structopt::StructOpt;
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::cli::Opts;
use crate::config::Config;
use crate::error::EXIT_STARTUP;

#[tokio::main]
async fn main() {
    let opts = Opts::from_args();
    let config = Config::new().map(|mut config| {
        opts.apply(&mut config);
        config
    });

    // Setup tracing/logging system.
    let filter = match &config {
        Ok(config) => tracing_subscriber::EnvFilter::new(&config.rust_log),
        Err(_) => tracing_subscriber::EnvFilter::new("info"),
    };
    let logging = tracing_subscriber::registry()
        // Filter spans based on the configured directives.
        .with(filter)
        // Send a copy of all spans to stdout in compact form.
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true).with_ansi(true))
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system");

    let code = match logging.and(config) {
        Ok(config) => match run(Arc::new(config), &opts).await {
            Ok(code) => code,
            Err(err) => {
                tracing::error!(error = ?err, "error starting pod mover");
                EXIT_STARTUP
            }
        },
        Err(err) => {
            tracing::error!(error = ?err, "error starting pod mover");
            eprintln!("error starting pod mover: {:#}", err);
            EXIT_STARTUP
        }
    };

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    std::process::exit(code);
}

async fn run(config: Arc<Config>, opts: &Opts) -> Result<i32> {
    tracing::info!(
        namespace = %opts.namespace,
        node = %opts.node,
        scheduler_name = %config.scheduler_name,
        k8s_version = ?config.k8s_version,
        "starting pod mover",
    );
    let app = App::new(config, opts).await?;
    Ok(app.run().await)
}
