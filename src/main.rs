// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use mardb::server::{DbServer, LoadMode, ServerConfig};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// MAR database server
#[derive(Debug, Parser)]
#[command(name = "mardb-server", version, about)]
struct Cli {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Port to bind to
    #[arg(long, default_value_t = 9999)]
    port: u16,
    /// Default log filter (RUST_LOG overrides it)
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Log to this file instead of the console
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Seconds between background flushes of modified records
    #[arg(long, default_value_t = 30)]
    sync_interval: u64,
    /// How much of a database to load into memory on open
    #[arg(long, value_enum, default_value_t = LoadMode::Fast)]
    load_mode: LoadMode,
    /// Databases to load at startup
    #[arg(long, num_args = 1..)]
    preload: Vec<String>,
}

fn init_logging(cli: &Cli) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    match &cli.log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let name = path
                .file_name()
                .context("--log-file needs a file name")?;
            let appender =
                tracing_appender::rolling::never(dir.unwrap_or_else(|| Path::new(".")), name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(&cli)?;

    let cfg = ServerConfig {
        host: cli.host.clone(),
        port: cli.port,
        sync_interval: std::time::Duration::from_secs(cli.sync_interval.max(1)),
        load_mode: cli.load_mode,
    };
    let server = DbServer::bind(cfg)
        .await
        .with_context(|| format!("failed to bind {}:{}", cli.host, cli.port))?;
    server.preload(&cli.preload).await;
    server.run().await?;
    info!("server stopped");
    Ok(())
}
