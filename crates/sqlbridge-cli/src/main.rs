//! sqlbridge CLI - run queries and updates against a database from a shell
//!
//! Every command goes through the same method-call bridge an embedding host uses,
//! so `connectDb`, `queryDatabase`, `updateData` and `disconnect` behave exactly
//! as they do in-process.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde_json::Value as Json;
use sqlbridge::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sqlbridge")]
#[command(about = "sqlbridge - chunked, reconnecting SQL Server client")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(flatten)]
    retry: RetryArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ConnectionArgs {
    /// Server address (sqlserver://host[:port]/db or jdbc:jtds:sqlserver://...)
    #[arg(short, long, env = "SQLBRIDGE_ADDRESS")]
    address: String,

    /// Login name
    #[arg(short, long, env = "SQLBRIDGE_USER")]
    user: String,

    /// Password
    #[arg(short, long, env = "SQLBRIDGE_PASSWORD", hide_env_values = true)]
    password: String,

    /// Login timeout in seconds (0 waits indefinitely)
    #[arg(short, long, default_value = "30")]
    timeout: u64,
}

#[derive(Args)]
struct RetryArgs {
    /// Attempts per query or update when the link drops
    #[arg(long, default_value = "3")]
    retries: u32,

    /// Delay before the first retry in milliseconds; later retries back off
    #[arg(long, default_value = "100")]
    retry_delay_ms: u64,
}

impl RetryArgs {
    fn config(&self) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(self.retries)
            .with_initial_delay(Duration::from_millis(self.retry_delay_ms))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a query and print its rows as JSON
    Query {
        /// SQL text
        sql: String,

        /// Print one fragment per chunk instead of a single array
        #[arg(long)]
        fragments: bool,

        /// Fetch every chunk on its own session
        #[arg(long)]
        dedicated: bool,

        /// Abort the query after this many milliseconds
        #[arg(long)]
        deadline_ms: Option<u64>,
    },

    /// Run a mutating statement and print the affected row count
    Update {
        /// SQL text
        sql: String,
    },

    /// Connect, then disconnect
    Ping,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; stdout is reserved for results
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let retry = cli.retry.config();
    let mut bridge = Bridge::new(Arc::new(SqlServerDriver), Handle::current())
        .with_update_retry(retry.clone());
    if let Commands::Query {
        fragments,
        dedicated,
        deadline_ms,
        ..
    } = &cli.command
    {
        let mut config = QueryConfig::default().with_retry(retry);
        if *dedicated {
            config = config.with_fetch_mode(FetchMode::Dedicated);
        }
        if let Some(ms) = deadline_ms {
            config = config.with_deadline(Duration::from_millis(*ms));
        }
        bridge = bridge.with_query_config(config)?;
        if *fragments {
            bridge = bridge.with_encoding(ResultEncoding::Fragments);
        }
    }

    let connect = MethodCall::new("connectDb")
        .with_argument("url", cli.connection.address.clone())
        .with_argument("username", cli.connection.user.clone())
        .with_argument("password", cli.connection.password.clone())
        .with_argument("timeoutInSeconds", cli.connection.timeout);
    call(&bridge, connect).await.context("connectDb failed")?;

    let outcome = match cli.command {
        Commands::Query { sql, .. } => {
            let rows = call(&bridge, MethodCall::new("queryDatabase").with_argument("query", sql)).await;
            rows.and_then(|rows| {
                println!("{}", serde_json::to_string_pretty(&rows)?);
                Ok(())
            })
        }
        Commands::Update { sql } => {
            let result = call(&bridge, MethodCall::new("updateData").with_argument("query", sql)).await;
            result.map(|payload| println!("{}", payload.as_str().unwrap_or_default()))
        }
        Commands::Ping => {
            println!("✓ Connected as {}", cli.connection.user);
            Ok(())
        }
    };

    bridge.shutdown().await;
    outcome
}

/// Run one bridge call, turning an error reply into an `anyhow` error
async fn call(bridge: &Bridge, call: MethodCall) -> anyhow::Result<Json> {
    let method = call.method.clone();
    debug!(%method, "Calling bridge");

    match bridge.handle(call).await {
        MethodResponse::Success { result } => Ok(result),
        MethodResponse::Error { code, message } => bail!("{method}: {code}: {message}"),
        MethodResponse::NotImplemented => bail!("{method}: not implemented"),
    }
}
