//! Operator CLI for faultline.
//!
//! Host commands bind the tool-side control endpoint, wait for an
//! instrumented app to connect and send it one command. The remaining
//! commands talk to the fault server directly or need no network at all.
//!
//! # Usage
//!
//! ```bash
//! # Ask the connected app for its orientation
//! faultline query getOrientation
//!
//! # Measure and activate a target
//! faultline position login-button
//! faultline click login-button
//!
//! # Switch the app to the polyfilled network stack, then stream
//! faultline network-mode polyfill
//! faultline stream http://127.0.0.1:3000/api/stream-xhr --policy cancel --after 3
//!
//! # Print app notifications until interrupted
//! faultline watch
//!
//! # Replay the canonical request sequence against the fault server
//! faultline probe --out probe.json
//!
//! # Run a headless demo app against a running host
//! faultline demo-app --url ws://127.0.0.1:8080/
//!
//! # List the fault server's routes
//! faultline --format json scenarios
//! ```

mod demo;
mod probe;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;

use faultline_core::config::{AppManifest, FaultlineConfig};
use faultline_core::harness::{NetworkHarness, NetworkMode};
use faultline_core::host::{ControlHost, HostError};
use faultline_core::protocol::{
    Command as AppCommand, ControlReply, DeviceQuery, FetchSpec, Notification, StreamPolicy, StreamRequest,
};
use faultline_server::{fault_table, ServerConfig};

/// How long `fetch` lets the socket writer flush before the host goes away.
const FLUSH_GRACE: Duration = Duration::from_millis(250);

/// Drive an instrumented app and probe the fault server.
#[derive(Parser)]
#[command(name = "faultline")]
#[command(about = "Remote-control an instrumented app and exercise HTTP failure handling")]
#[command(version)]
struct Cli {
    /// Address the control host binds to (defaults to the configured one)
    #[arg(short, long, env = "FAULTLINE_BIND")]
    bind: Option<String>,

    /// How long to wait for an app to connect, in milliseconds
    #[arg(short, long, default_value = "30000", env = "FAULTLINE_WAIT")]
    wait_ms: u64,

    /// How long to wait for a reply, in milliseconds
    #[arg(short, long, default_value = "5000", env = "FAULTLINE_TIMEOUT")]
    timeout_ms: u64,

    /// Output format: text or json
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum ModeArg {
    Native,
    Polyfill,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum PolicyArg {
    Complete,
    Cancel,
    Abandon,
    Fallback,
    Plain,
}

impl PolicyArg {
    fn with_after(self, after: usize) -> StreamPolicy {
        match self {
            PolicyArg::Complete => StreamPolicy::Complete,
            PolicyArg::Cancel => StreamPolicy::Cancel { after },
            PolicyArg::Abandon => StreamPolicy::Abandon { after },
            PolicyArg::Fallback => StreamPolicy::Fallback,
            PolicyArg::Plain => StreamPolicy::Plain,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Ask the app a device query by wire name (e.g. getColorScheme)
    Query {
        /// Wire name of the query
        name: String,
    },

    /// Get the normalized geometry of a target
    Position {
        /// Target id
        target: String,
    },

    /// Activate a target and wait for the app's echo
    Click {
        /// Target id
        target: String,
    },

    /// Switch the app between native and polyfilled networking
    NetworkMode {
        mode: ModeArg,
    },

    /// Have the app run a streaming scenario and print its report
    Stream {
        /// URL of a chunked endpoint
        url: String,
        /// How the body is consumed
        #[arg(short, long, default_value = "complete")]
        policy: PolicyArg,
        /// Chunks to read before cancelling or abandoning
        #[arg(short, long, default_value = "3")]
        after: usize,
        /// Run under this network mode only, restoring the previous one after
        #[arg(long)]
        mode: Option<ModeArg>,
    },

    /// Have the app issue a request without replying
    Fetch {
        url: String,
        /// HTTP method (defaults to GET)
        #[arg(short, long)]
        method: Option<String>,
        /// JSON body; anything that is not JSON is sent as a string
        #[arg(short, long)]
        body: Option<String>,
    },

    /// Print app notifications until interrupted
    Watch,

    /// Replay the canonical request sequence against the fault server
    Probe {
        /// Fault server base URL including /api (defaults to the configured one)
        #[arg(long, env = "FAULTLINE_SERVER_URL")]
        base_url: Option<String>,
        /// Write the log here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Use the polyfilled network stack
        #[arg(long)]
        polyfill: bool,
        /// Client timeout for the hang scenario, in milliseconds
        #[arg(long, default_value = "10000")]
        hang_timeout_ms: u64,
    },

    /// Run a headless instrumented app until interrupted
    DemoApp {
        /// Control host URL (defaults to ws://<configured bind>/)
        #[arg(short, long)]
        url: Option<String>,
        /// App manifest supplying the app name
        #[arg(short, long)]
        manifest: Option<PathBuf>,
        /// App name, when no manifest is given
        #[arg(short, long, default_value = "faultline-demo")]
        name: String,
    },

    /// List the fault server's routes and their behaviour
    Scenarios,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

#[derive(Debug)]
pub(crate) enum CliError {
    Connection(String),
    ActionFailed(String),
    Protocol(String),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Connection(_) => ExitCode::from(2),
            CliError::ActionFailed(_) => ExitCode::from(1),
            CliError::Protocol(_) => ExitCode::from(3),
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Connection(msg) => write!(f, "Connection error: {}", msg),
            CliError::ActionFailed(msg) => write!(f, "Action failed: {}", msg),
            CliError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl From<HostError> for CliError {
    fn from(e: HostError) -> Self {
        match e {
            HostError::Timeout(_) => CliError::ActionFailed(e.to_string()),
            HostError::Json(_) => CliError::Protocol(e.to_string()),
            HostError::Bind(_) | HostError::NotConnected | HostError::Disconnected => {
                CliError::Connection(e.to_string())
            }
        }
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let text = serde_json::to_string_pretty(value).map_err(|e| CliError::Protocol(e.to_string()))?;
    println!("{}", text);
    Ok(())
}

/// Prints a one-line `|time|action|target|` trace to stderr unless quiet.
fn trace(cli: &Cli, action: &str, target: &str) {
    if !cli.quiet {
        let now = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3fZ");
        eprintln!("|{}|{}|{}|", now, action, target);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = FaultlineConfig::load();

    // Commands that don't need an app
    match &cli.command {
        Command::Scenarios => return scenarios(&cli),
        Command::Probe {
            base_url,
            out,
            polyfill,
            hang_timeout_ms,
        } => {
            let base_url = base_url.clone().unwrap_or_else(|| config.fault_server_url.clone());
            return run_probe(&cli, &config, &base_url, out.as_ref(), *polyfill, *hang_timeout_ms).await;
        }
        Command::DemoApp { url, manifest, name } => {
            let url = url.clone().unwrap_or_else(|| format!("ws://{}/", config.control_bind));
            let manifest = match manifest {
                Some(path) => AppManifest::from_path(path)
                    .map_err(|e| CliError::ActionFailed(format!("Failed to read {}: {}", path.display(), e)))?,
                None => AppManifest::named(name.clone()),
            };
            tokio::select! {
                result = demo::run(&url, &manifest) => return result,
                _ = tokio::signal::ctrl_c() => return Ok(()),
            }
        }
        _ => {}
    }

    // Validate arguments before waiting on an app.
    let command = match &cli.command {
        Command::Query { name } => {
            let query = DeviceQuery::from_name(name).ok_or_else(|| {
                let known: Vec<&str> = DeviceQuery::ALL.iter().map(DeviceQuery::name).collect();
                CliError::Protocol(format!("Unknown query '{}' (expected one of: {})", name, known.join(", ")))
            })?;
            Some(AppCommand::Query(query))
        }
        Command::Position { target } => Some(AppCommand::GetPosition { target: target.clone() }),
        Command::Click { target } => Some(AppCommand::Click { target: target.clone() }),
        Command::NetworkMode { mode } => Some(AppCommand::SetNetworkMode {
            polyfill: *mode == ModeArg::Polyfill,
        }),
        Command::Stream {
            url,
            policy,
            after,
            mode,
        } => {
            let request = StreamRequest::new(url.clone(), policy.with_after(*after));
            Some(AppCommand::RunStream(match mode {
                Some(mode) => request.with_polyfill(*mode == ModeArg::Polyfill),
                None => request,
            }))
        }
        Command::Fetch { url, method, body } => Some(AppCommand::FetchData(FetchSpec {
            url: url.clone(),
            method: method.clone(),
            headers: Map::new(),
            body: body
                .as_ref()
                .map(|text| serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone()))),
            multipart: None,
        })),
        Command::Watch | Command::Scenarios | Command::Probe { .. } | Command::DemoApp { .. } => None,
    };

    let bind = cli.bind.clone().unwrap_or(config.control_bind);
    let host = ControlHost::bind(bind.as_str()).await?;
    if !cli.quiet {
        eprintln!("Waiting for an app on {}", host.url());
    }
    host.wait_for_app(Duration::from_millis(cli.wait_ms))
        .await
        .map_err(|e| CliError::Connection(format!("No app connected to {}: {}", host.url(), e)))?;

    let result = match command {
        Some(command) => execute(&host, command, &cli).await,
        None => watch(&host, &cli).await,
    };
    host.shutdown();
    result
}

/// Sends one command and prints its outcome.
async fn execute(host: &ControlHost, command: AppCommand, cli: &Cli) -> Result<(), CliError> {
    let timeout = Duration::from_millis(cli.timeout_ms);
    let name = command.name();

    match &command {
        AppCommand::Click { target } => {
            // A click has no reply; the app confirms by echoing the target id.
            let mut notifications = host.notifications();
            host.notify(&command)?;
            let echoed = tokio::time::timeout(timeout, async {
                while let Ok(notification) = notifications.recv().await {
                    if matches!(&notification, Notification::Action { action } if action == target) {
                        return true;
                    }
                }
                false
            })
            .await
            .unwrap_or(false);
            if !echoed {
                return Err(CliError::ActionFailed(format!("No target '{}' was activated", target)));
            }
            if cli.format == OutputFormat::Json {
                print_json(&json!({ "action": target }))?;
            }
            trace(cli, name, target);
            Ok(())
        }
        AppCommand::FetchData(spec) => {
            host.notify(&command)?;
            tokio::time::sleep(FLUSH_GRACE).await;
            if cli.format == OutputFormat::Json {
                print_json(&json!({ "sent": spec }))?;
            }
            trace(cli, name, &spec.url);
            Ok(())
        }
        _ => {
            let reply = host.request(&command, timeout).await.map_err(|e| match e {
                HostError::Timeout(_) => CliError::ActionFailed(format!("The app did not answer '{}'", name)),
                other => other.into(),
            })?;
            print_reply(&reply, cli)?;
            trace(cli, name, &describe(&command));
            Ok(())
        }
    }
}

fn describe(command: &AppCommand) -> String {
    match command {
        AppCommand::GetPosition { target } | AppCommand::Click { target } => target.clone(),
        AppCommand::Query(query) => query.name().to_string(),
        AppCommand::SetNetworkMode { polyfill } => format!("{:?}", NetworkMode::from_polyfill(*polyfill)),
        AppCommand::RunStream(request) => request.url.clone(),
        AppCommand::FetchData(spec) => spec.url.clone(),
        AppCommand::Unknown(name) => name.clone(),
    }
}

fn print_reply(reply: &ControlReply, cli: &Cli) -> Result<(), CliError> {
    if cli.format == OutputFormat::Json {
        let value = serde_json::to_value(reply).map_err(|e| CliError::Protocol(e.to_string()))?;
        return print_json(&value);
    }
    if let Some(position) = &reply.position {
        println!(
            "{} x={} y={} width={} height={}",
            position.id, position.x, position.y, position.width, position.height
        );
    }
    match &reply.value {
        Some(Value::String(text)) => println!("{}", text),
        Some(value) => print_json(value)?,
        None => {}
    }
    Ok(())
}

async fn watch(host: &ControlHost, cli: &Cli) -> Result<(), CliError> {
    let mut notifications = host.notifications();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            received = notifications.recv() => match received {
                Ok(notification) => {
                    let value = serde_json::to_value(&notification).map_err(|e| CliError::Protocol(e.to_string()))?;
                    if cli.format == OutputFormat::Json {
                        println!("{}", value);
                    } else {
                        match &notification {
                            Notification::Action { action } => println!("action {}", action),
                            Notification::Stream { .. } => println!("stream {}", value["stream"]),
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    if !cli.quiet {
                        eprintln!("Missed {} notifications", missed);
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return Err(CliError::Connection("Control host stopped".to_string()));
                }
            },
        }
    }
}

fn scenarios(cli: &Cli) -> Result<(), CliError> {
    let table = fault_table(&ServerConfig::default());
    if cli.format == OutputFormat::Json {
        let value = serde_json::to_value(&table).map_err(|e| CliError::Protocol(e.to_string()))?;
        return print_json(&value);
    }
    for scenario in &table {
        let marker = if scenario.is_fault() { "!" } else { " " };
        println!("{} {:<7} {:<28} {}", marker, scenario.method, scenario.path, scenario.summary);
    }
    Ok(())
}

async fn run_probe(
    cli: &Cli,
    config: &FaultlineConfig,
    base_url: &str,
    out: Option<&PathBuf>,
    polyfill: bool,
    hang_timeout_ms: u64,
) -> Result<(), CliError> {
    let harness = NetworkHarness::with_defaults()
        .map_err(|e| CliError::ActionFailed(format!("Failed to build HTTP client: {}", e)))?;
    harness.set_polyfill(polyfill);
    let steps = probe::canonical_steps(Duration::from_millis(hang_timeout_ms));
    let log = probe::run(
        &harness,
        base_url,
        &steps,
        Duration::from_millis(config.request_timeout_ms),
    )
    .await;

    let text = serde_json::to_string_pretty(&Value::Array(log)).map_err(|e| CliError::Protocol(e.to_string()))?;
    match out {
        Some(path) => {
            tokio::fs::write(path, text)
                .await
                .map_err(|e| CliError::ActionFailed(format!("Failed to write {}: {}", path.display(), e)))?;
            trace(cli, "probe", &path.display().to_string());
        }
        None => println!("{}", text),
    }
    Ok(())
}
