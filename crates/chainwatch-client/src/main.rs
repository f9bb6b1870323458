//! `chainwatch` command line client.
//!
//! `watch decode` prints what a cursor points at. `watch start` follows one
//! or more resource chains until Ctrl+C, writing every event as a JSON line
//! to stdout. Logs go to stderr.

use chainwatch_client::config::{self, ClientConfig, ConfigError};
use chainwatch_client::describe::describe_cursor;
use chainwatch_client::{
    Batch, ClientError, EventFilter, FilterError, HttpTransport, WatchSettings, WatchStart,
    WatchTransport, Watcher,
};
use chainwatch_types::{Cursor, CursorType, EventType, WatchError, NO_EVENT_CURSOR};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chainwatch", version, about = "Follow resource change chains")]
struct Cli {
    /// Client configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Cursor and watch operations.
    #[command(subcommand)]
    Watch(WatchCommand),
}

#[derive(Subcommand)]
enum WatchCommand {
    /// Print the resource type, oid and cluster time inside a cursor.
    Decode {
        #[arg(long)]
        cursor: String,
    },
    /// Follow resource chains and print events as JSON lines.
    Start(StartArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Resource types to watch, comma separated.
    #[arg(long, value_delimiter = ',', required = true)]
    rsc: Vec<CursorType>,

    /// Resume after this cursor (single resource only).
    #[arg(long, conflicts_with = "start_from")]
    cursor: Option<String>,

    /// Start from events newer than these unix seconds.
    #[arg(long)]
    start_from: Option<i64>,

    /// Detail fields to fetch, comma separated.
    #[arg(long, value_delimiter = ',')]
    fields: Vec<String>,

    /// Client-side filter, `key:value;key:value`.
    #[arg(long)]
    filter: Option<String>,

    /// Event types to fetch, comma separated.
    #[arg(long, value_delimiter = ',')]
    event_types: Vec<EventType>,

    /// Only events of this sub resource (partitioned types).
    #[arg(long)]
    sub_resource: Option<String>,

    /// Watch server base URL; overrides the configuration.
    #[arg(long)]
    server: Option<String>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid filter: {0}")]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Cursor(#[from] WatchError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("{0}")]
    Usage(String),
}

fn init_tracing(config: &ClientConfig) {
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Watch(WatchCommand::Decode { cursor }) => describe_cursor(&cursor)
            .map(|text| println!("{text}"))
            .map_err(CliError::from),
        Command::Watch(WatchCommand::Start(args)) => match config::load_config(cli.config.as_deref())
        {
            Ok(config) => {
                init_tracing(&config);
                start(config, args).await
            }
            Err(e) => Err(e.into()),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("chainwatch: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Checks that a resume cursor can be used for `resources`.
fn check_cursor(cursor: &str, resources: &[CursorType]) -> Result<(), CliError> {
    let [resource] = resources else {
        return Err(CliError::Usage(
            "--cursor can only be used with a single --rsc".to_string(),
        ));
    };
    if cursor == NO_EVENT_CURSOR {
        return Ok(());
    }
    let decoded = Cursor::decode(cursor)?;
    if decoded.cursor_type != *resource {
        return Err(WatchError::InvalidCursor(format!(
            "cursor belongs to {}, not {resource}",
            decoded.cursor_type
        ))
        .into());
    }
    Ok(())
}

async fn start(config: ClientConfig, args: StartArgs) -> Result<(), CliError> {
    let mut resources = args.rsc.clone();
    resources.sort();
    resources.dedup();

    let start = match (&args.cursor, args.start_from) {
        (Some(cursor), _) => {
            check_cursor(cursor, &resources)?;
            WatchStart::Cursor(cursor.clone())
        }
        (None, Some(sec)) => WatchStart::StartFrom(sec),
        (None, None) => WatchStart::Now,
    };
    let filter = EventFilter::parse(args.filter.as_deref().unwrap_or_default())?;

    let url = args.server.as_deref().unwrap_or(&config.server.url);
    let transport: Arc<dyn WatchTransport> =
        Arc::new(HttpTransport::new(url, config.poll.request_timeout())?);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received Ctrl+C, stopping watchers");
                cancel.cancel();
            }
        });
    }

    let mut tasks = JoinSet::new();
    for resource in resources {
        let settings = WatchSettings {
            resource,
            fields: args.fields.clone(),
            event_types: args.event_types.clone(),
            sub_resource: args.sub_resource.clone().unwrap_or_default(),
            filter: filter.clone(),
            backoff_initial: Duration::from_millis(config.poll.backoff_initial_ms),
            backoff_max: Duration::from_millis(config.poll.backoff_max_ms),
        };
        let mut watcher = Watcher::new(transport.clone(), start.clone(), settings);
        let cancel = cancel.clone();

        tracing::info!(%resource, %url, "watching");
        tasks.spawn(async move { watcher.run(&cancel, print_batch).await });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                cancel.cancel();
                first_error.get_or_insert(CliError::from(e));
            }
            Err(e) => {
                cancel.cancel();
                first_error.get_or_insert(CliError::Usage(format!("watch task failed: {e}")));
            }
        }
    }

    first_error.map_or(Ok(()), Err)
}

fn print_batch(batch: Batch) {
    let mut out = std::io::stdout().lock();
    for event in &batch.events {
        let written = serde_json::to_writer(&mut out, event)
            .map_err(std::io::Error::from)
            .and_then(|()| writeln!(out));
        if let Err(e) = written {
            tracing::error!(resource = %batch.resource, error = %e, "failed to write event");
            return;
        }
    }
    if let Err(e) = out.flush() {
        tracing::error!(error = %e, "failed to flush stdout");
    }
}
