//! Tether CLI - run a persistent worker behind a request/response relay
//!
//! Usage:
//!   tether ask <payload> [--timeout <dur>] [--wait-ready <dur>]
//!   tether serve
//!   tether config
//!
//! Examples:
//!   tether ask "What are the opening hours?" --wait-ready 30s
//!   echo '{"requestId":"r1","payload":"hi"}' | tether serve
//!   tether --config ./tether.toml config

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tether::config::{parse_duration, Settings, SettingsError};
use tether::worker::{wait_for_signal, Relay, ShutdownTrigger, WorkerResult};
use tether::{logging, Answer};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

/// How long finished requests get to write their replies after shutdown.
const REPLY_FLUSH_WINDOW: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Tether - a supervised, multiplexed relay in front of a long-running worker")]
#[command(version)]
struct Cli {
    /// Path to a tether.toml (defaults to TETHER_CONFIG, ./tether.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one payload and print the answer
    Ask {
        /// Text passed to the worker
        payload: String,

        /// Request deadline (e.g. "30s"); defaults to the configured timeout
        #[arg(short, long, value_parser = parse_duration)]
        timeout: Option<Duration>,

        /// How long to wait for the persistent worker before using the fallback
        #[arg(short, long, value_parser = parse_duration, default_value = "0ms")]
        wait_ready: Duration,
    },

    /// Relay newline-delimited JSON requests from stdin to stdout
    Serve,

    /// Print the resolved configuration
    Config,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServeRequest {
    request_id: Option<String>,
    payload: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServeReply {
    request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    metadata: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
}

impl ServeReply {
    fn from_outcome(request_id: String, outcome: WorkerResult<Answer>) -> Self {
        match outcome {
            Ok(answer) => Self {
                request_id: Some(request_id),
                result: Some(answer.text),
                metadata: answer.metadata,
                error: None,
                kind: None,
            },
            Err(e) => Self {
                request_id: Some(request_id),
                result: None,
                metadata: Map::new(),
                error: Some(e.to_string()),
                kind: Some(e.kind()),
            },
        }
    }

    fn invalid(reason: String) -> Self {
        Self {
            request_id: None,
            result: None,
            metadata: Map::new(),
            error: Some(reason),
            kind: Some("invalid_request"),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match load_settings(cli.config.as_ref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Commands::Config = cli.command {
        return cmd_config(&settings);
    }

    logging::init(&settings.logging.level, cli.debug);

    let relay = match Relay::from_settings(&settings) {
        Ok(relay) => Arc::new(relay),
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Ask {
            payload,
            timeout,
            wait_ready,
        } => cmd_ask(&relay, &payload, timeout, wait_ready).await,
        Commands::Serve => cmd_serve(relay).await,
        Commands::Config => ExitCode::SUCCESS,
    }
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings, SettingsError> {
    match path {
        Some(path) => Settings::from_file(path),
        None => Settings::load(),
    }
}

fn cmd_config(settings: &Settings) -> ExitCode {
    match settings.to_toml() {
        Ok(rendered) => {
            print!("{}", rendered);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error rendering configuration: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn cmd_ask(
    relay: &Relay,
    payload: &str,
    timeout: Option<Duration>,
    wait_ready: Duration,
) -> ExitCode {
    if !wait_ready.is_zero() && !relay.wait_ready(wait_ready).await {
        warn!(
            wait_ms = wait_ready.as_millis() as u64,
            "worker not ready in time"
        );
    }

    let request_id = Uuid::new_v4().to_string();
    let outcome = relay.ask_with_id(&request_id, payload, timeout).await;
    relay.shutdown(ShutdownTrigger::Requested).await;

    match outcome {
        Ok(answer) => {
            println!("{}", answer.text);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error ({}): {}", e.kind(), e);
            ExitCode::FAILURE
        }
    }
}

async fn cmd_serve(relay: Arc<Relay>) -> ExitCode {
    let stdout = Arc::new(Mutex::new(tokio::io::stdout()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();

    let signal = async {
        match wait_for_signal().await {
            Ok(trigger) => trigger,
            Err(e) => {
                warn!(error = %e, "cannot listen for signals");
                std::future::pending().await
            }
        }
    };
    tokio::pin!(signal);

    let trigger = loop {
        tokio::select! {
            trigger = &mut signal => break trigger,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    in_flight.spawn(handle_line(relay.clone(), stdout.clone(), line));
                }
                Ok(None) => break ShutdownTrigger::InputClosed,
                Err(e) => break ShutdownTrigger::Fatal(format!("failed to read stdin: {e}")),
            },
            Some(_) = in_flight.join_next() => {}
        }
    };

    // Input is exhausted: let in-flight requests finish unless a signal arrives.
    let trigger = if trigger == ShutdownTrigger::InputClosed {
        loop {
            tokio::select! {
                trigger = &mut signal => break trigger,
                next = in_flight.join_next() => {
                    if next.is_none() {
                        break ShutdownTrigger::InputClosed;
                    }
                }
            }
        }
    } else {
        trigger
    };

    let report = relay.shutdown(trigger.clone()).await;
    debug!(?report, "relay stopped");

    let flushed = tokio::time::timeout(REPLY_FLUSH_WINDOW, async {
        while in_flight.join_next().await.is_some() {}
    })
    .await;
    if flushed.is_err() {
        in_flight.abort_all();
    }

    match trigger {
        ShutdownTrigger::Fatal(reason) => {
            eprintln!("Error: {}", reason);
            ExitCode::FAILURE
        }
        _ => ExitCode::SUCCESS,
    }
}

async fn handle_line(relay: Arc<Relay>, stdout: Arc<Mutex<Stdout>>, line: String) {
    let reply = match serde_json::from_str::<ServeRequest>(&line) {
        Ok(request) => {
            let request_id = request
                .request_id
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let outcome = relay
                .ask_with_id(&request_id, &request.payload, None)
                .await;
            ServeReply::from_outcome(request_id, outcome)
        }
        Err(e) => {
            warn!(error = %e, "invalid request line");
            ServeReply::invalid(format!("invalid request: {e}"))
        }
    };

    let mut encoded = match serde_json::to_string(&reply) {
        Ok(encoded) => encoded,
        Err(e) => {
            warn!(error = %e, "failed to encode reply");
            return;
        }
    };
    encoded.push('\n');

    let mut stdout = stdout.lock().await;
    if let Err(e) = stdout.write_all(encoded.as_bytes()).await {
        warn!(error = %e, "failed to write reply");
        return;
    }
    let _ = stdout.flush().await;
}
