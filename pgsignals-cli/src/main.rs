// Copyright 2025 Pgsignals Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use pgsignals_core::capture::CaptureSchema;
use pgsignals_core::config::{
    ListenConfig, SignalsConfig, DEFAULT_DATABASE, DEFAULT_PREFIX, DEFAULT_SCHEMA,
};
use pgsignals_core::dispatch::{Dispatcher, EventHandler, HandlerError, SignalGroup};
use pgsignals_core::event::{Event, OperationKind};
use pgsignals_core::listener::{Listener, PgChangeFeed};
use pgsignals_core::metrics;
use pgsignals_core::resolver::{MemoryResolver, Sender};
use sqlx::PgPool;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// PostgreSQL change capture and signal dispatch
#[derive(Parser)]
#[command(name = "pgsignals")]
#[command(version)]
#[command(about = "Capture PostgreSQL row changes and dispatch them as signals", long_about = None)]
struct Cli {
    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Prefix of the staging log, capture routine, triggers and channel
    #[arg(long, env = "PGSIGNALS_PREFIX", default_value = DEFAULT_PREFIX)]
    prefix: String,

    /// Label of the database, used as the install cache key
    #[arg(long, env = "PGSIGNALS_DEFAULT_DATABASE", default_value = DEFAULT_DATABASE)]
    database: String,

    /// Schema holding the captured tables
    #[arg(short, long, env = "PGSIGNALS_DEFAULT_SCHEMA", default_value = DEFAULT_SCHEMA)]
    schema: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen in the foreground and log every captured change
    Listen {
        /// Longest single wait for a signal, in seconds
        #[arg(long, default_value = "5", value_parser = parse_seconds)]
        poll_timeout: Duration,

        /// Stop after this many seconds
        #[arg(long, value_parser = parse_seconds)]
        listen_timeout: Option<Duration>,

        /// Stop after this many events
        #[arg(long)]
        events_limit: Option<u64>,

        /// Sender for a table, as TABLE=NAME (repeatable)
        #[arg(long = "sender", value_parser = parse_sender)]
        senders: Vec<(String, String)>,

        /// Serve Prometheus metrics on this address
        #[arg(long)]
        metrics_addr: Option<SocketAddr>,
    },

    /// Bind a table, replacing any existing binding
    Bind {
        /// Table to capture
        table: String,

        /// Operations to capture (repeatable, default: all)
        #[arg(short, long = "operation", value_enum)]
        operations: Vec<OperationArg>,
    },

    /// Remove a table's binding
    Unbind {
        /// Table to stop capturing
        table: String,
    },

    /// Install the staging log and capture routine
    Install,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OperationArg {
    Insert,
    Update,
    Delete,
}

impl From<OperationArg> for OperationKind {
    fn from(arg: OperationArg) -> Self {
        match arg {
            OperationArg::Insert => Self::Create,
            OperationArg::Update => Self::Update,
            OperationArg::Delete => Self::Delete,
        }
    }
}

fn parse_seconds(s: &str) -> Result<Duration, String> {
    let seconds: f64 = s.parse().map_err(|e| format!("{s:?} is not a number: {e}"))?;
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("{s:?} is not a valid duration: {e}"))
}

fn parse_sender(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((table, name)) if !table.is_empty() && !name.is_empty() => {
            Ok((table.to_string(), name.to_string()))
        }
        _ => Err(format!("expected TABLE=NAME, got {s:?}")),
    }
}

/// Logs every event it receives.
struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, sender: Option<&Sender>, event: &Event) -> Result<(), HandlerError> {
        info!(
            sender = sender.map_or("-", Sender::name),
            table = %event.table,
            operation = %event.operation,
            txid = event.txid,
            changed = ?event.changed_columns(),
            row = ?event.row(),
            "Change captured"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SignalsConfig::builder()
        .prefix(cli.prefix)
        .default_database(cli.database)
        .default_schema(cli.schema)
        .build()?;
    let schema = config.default_schema.clone();

    match cli.command {
        Commands::Listen {
            poll_timeout,
            listen_timeout,
            events_limit,
            senders,
            metrics_addr,
        } => {
            if let Some(addr) = metrics_addr {
                PrometheusBuilder::new().with_http_listener(addr).install()?;
                info!(%addr, "Serving Prometheus metrics");
            }
            metrics::init_metrics();

            let mut builder = ListenConfig::builder().poll_timeout(poll_timeout);
            if let Some(timeout) = listen_timeout {
                builder = builder.listen_timeout(timeout);
            }
            if let Some(limit) = events_limit {
                builder = builder.events_limit(limit);
            }
            let listen_config = builder.build()?;

            let resolver: MemoryResolver = senders.into_iter().collect();
            let mut dispatcher = Dispatcher::new(resolver);
            dispatcher.connect(SignalGroup::Any, LoggingHandler);

            let feed = PgChangeFeed::connect(&cli.database_url, &config, &schema).await?;
            let listener = Listener::new(feed, Arc::new(dispatcher), listen_config)?;
            let shutdown = listener.shutdown_handle();
            tokio::spawn(async move {
                match signal::ctrl_c().await {
                    Ok(()) => shutdown.shutdown(),
                    Err(e) => warn!(error = %e, "Cannot install Ctrl+C handler"),
                }
            });

            let summary = listener.run().await?;
            info!(
                events_dispatched = summary.events_dispatched,
                decode_failures = summary.decode_failures,
                stop_reason = ?summary.stop_reason,
                "Listener finished"
            );
        }

        Commands::Bind { table, operations } => {
            let capture = connect_capture(&cli.database_url, config).await?;
            if operations.is_empty() {
                capture.bind_all(&table, &schema).await?;
            } else {
                let operations: Vec<OperationKind> =
                    operations.into_iter().map(OperationKind::from).collect();
                capture.bind(&table, &operations, &schema).await?;
            }
        }

        Commands::Unbind { table } => {
            let capture = connect_capture(&cli.database_url, config).await?;
            capture.unbind(&table, &schema).await?;
        }

        Commands::Install => {
            let capture = connect_capture(&cli.database_url, config).await?;
            capture.install_capture_routine(&schema).await?;
        }
    }

    Ok(())
}

async fn connect_capture(
    database_url: &str,
    config: SignalsConfig,
) -> Result<CaptureSchema<PgPool>, sqlx::Error> {
    let pool = PgPool::connect(database_url).await?;
    Ok(CaptureSchema::new(
        config.default_database.clone(),
        pool,
        config,
    ))
}
