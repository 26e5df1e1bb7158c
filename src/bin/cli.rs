//! PLCLink CLI - front-end command-line interface
//!
//! Headless counterpart to the editor: issue control operations against
//! a running controller, decode live trace buffers, manage pre-shared
//! keys, and discover controllers on the local network.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use plclink_core::cli::{CliResult, ExitCodes};
use plclink_core::core::codec::decode_debug_buffer;
use plclink_core::core::discovery;
use plclink_core::core::psk::{ImportOutcome, MergeDecision, PskStore};
use plclink_core::core::rpc::client::{self, Connector, PlcProxy};

/// CLI output format
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON format for scripting
    Json,
}

/// Conflict handling for credential import
#[derive(Debug, Clone, Copy, ValueEnum)]
enum ConflictMode {
    /// Overwrite local records with imported ones
    Replace,
    /// Keep local records untouched
    Keep,
    /// Abort the import on the first conflict
    Cancel,
}

/// PLCLink CLI
#[derive(Parser, Debug)]
#[command(
    name = "plclink-cli",
    version,
    about = "PLCLink controller front-end",
    long_about = None
)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Project directory (for credential storage)
    #[arg(short = 'd', long, env = "PLCLINK_PROJECT")]
    project_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Query controller status
    Status {
        /// Controller URI (tcp://host:port)
        uri: String,
    },

    /// Start the loaded program
    Start {
        /// Controller URI
        uri: String,
    },

    /// Stop the running program
    Stop {
        /// Controller URI
        uri: String,
    },

    /// Fetch and decode live trace samples
    Trace {
        /// Controller URI
        uri: String,

        /// Comma-separated type tags in trace order (e.g. BOOL,DINT,REAL)
        #[arg(short, long, value_delimiter = ',', required = true)]
        types: Vec<String>,
    },

    /// Execute a script on the controller
    Exec {
        /// Controller URI
        uri: String,

        /// Script source
        script: String,
    },

    /// Discover controllers on the local network
    Discover {
        /// Seconds to wait for advertisements
        #[arg(short, long, default_value = "3")]
        timeout: u64,
    },

    /// Manage pre-shared keys
    #[command(subcommand)]
    Psk(PskCommands),
}

#[derive(Subcommand, Debug)]
enum PskCommands {
    /// List stored controller identities
    List,

    /// Delete a stored identity's secret
    Delete {
        /// Identity to delete
        id: String,
    },

    /// Export identities into a zip archive
    Export {
        /// Archive path to write
        output: PathBuf,

        /// IDs to export (all when omitted)
        ids: Vec<String>,
    },

    /// Import identities from a zip archive
    Import {
        /// Archive path to read
        archive: PathBuf,

        /// Conflict handling for IDs that already exist locally
        #[arg(long, value_enum, default_value_t = ConflictMode::Keep)]
        on_conflict: ConflictMode,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_ansi(atty::is(atty::Stream::Stderr))
        .with_writer(std::io::stderr)
        .init();

    let result = run(cli).await;
    if let Some(msg) = result.message() {
        if result.is_success() {
            println!("{msg}");
        } else {
            eprintln!("{msg}");
        }
    }
    result.to_exit_code()
}

async fn run(cli: Cli) -> CliResult {
    let project = cli.project_dir.clone();
    match cli.command {
        Commands::Status { uri } => {
            let proxy = match open(&uri, project.as_deref()).await {
                Ok(p) => p,
                Err(e) => return e,
            };
            let (status, counts) = proxy.get_plc_status().await;
            match cli.format {
                OutputFormat::Text => CliResult::success_with_message(format!(
                    "status: {status}  log counts: {counts:?}"
                )),
                OutputFormat::Json => CliResult::success_with_message(
                    serde_json::json!({
                        "status": status.to_string(),
                        "log_counts": counts,
                    })
                    .to_string(),
                ),
            }
        }

        Commands::Start { uri } => {
            let proxy = match open(&uri, project.as_deref()).await {
                Ok(p) => p,
                Err(e) => return e,
            };
            if proxy.start_plc().await {
                CliResult::success_with_message("program started")
            } else {
                CliResult::error(ExitCodes::ERROR, "start failed")
            }
        }

        Commands::Stop { uri } => {
            let proxy = match open(&uri, project.as_deref()).await {
                Ok(p) => p,
                Err(e) => return e,
            };
            if proxy.stop_plc().await {
                CliResult::success_with_message("program stopped")
            } else {
                CliResult::error(ExitCodes::ERROR, "stop failed")
            }
        }

        Commands::Trace { uri, types } => {
            let proxy = match open(&uri, project.as_deref()).await {
                Ok(p) => p,
                Err(e) => return e,
            };
            let (status, samples) = proxy.get_trace_variables().await;
            let mut lines = vec![format!("status: {status}, {} sample(s)", samples.len())];
            for sample in &samples {
                match decode_debug_buffer(&sample.buffer, &types) {
                    Ok(values) => {
                        let rendered: Vec<String> =
                            values.iter().map(ToString::to_string).collect();
                        lines.push(format!("tick {:>8}: {}", sample.tick, rendered.join(", ")));
                    }
                    Err(e) => {
                        return CliResult::decode_failed(format!(
                            "tick {}: {} (raw: {})",
                            sample.tick,
                            e,
                            hex::encode(&sample.buffer)
                        ));
                    }
                }
            }
            CliResult::success_with_message(lines.join("\n"))
        }

        Commands::Exec { uri, script } => {
            let proxy = match open(&uri, project.as_deref()).await {
                Ok(p) => p,
                Err(e) => return e,
            };
            let (code, output) = proxy.remote_exec(&script).await;
            if code == 0 {
                CliResult::success_with_message(output)
            } else {
                CliResult::error(ExitCodes::ERROR, format!("exit code {code}: {output}"))
            }
        }

        Commands::Discover { timeout } => {
            match discovery::browse(Duration::from_secs(timeout)) {
                Ok(services) if services.is_empty() => {
                    CliResult::success_with_message("no controllers found")
                }
                Ok(services) => {
                    let lines: Vec<String> = services
                        .iter()
                        .map(|s| {
                            format!(
                                "{}  {}",
                                s.name,
                                s.uri().unwrap_or_else(|| "<unresolved>".to_string())
                            )
                        })
                        .collect();
                    CliResult::success_with_message(lines.join("\n"))
                }
                Err(e) => CliResult::error(ExitCodes::ERROR, e.to_string()),
            }
        }

        Commands::Psk(psk) => run_psk(psk, project.as_deref()),
    }
}

async fn open(uri: &str, project: Option<&std::path::Path>) -> Result<PlcProxy, CliResult> {
    client::connect(uri, project)
        .await
        .map_err(|e| CliResult::connection_failed(e.to_string()))
}

fn run_psk(command: PskCommands, project: Option<&std::path::Path>) -> CliResult {
    let Some(project) = project else {
        return CliResult::error(
            ExitCodes::INVALID_ARGS,
            "psk commands need a project directory (-d or PLCLINK_PROJECT)",
        );
    };
    let store = PskStore::new(project);

    match command {
        PskCommands::List => match store.load() {
            Ok(records) if records.is_empty() => {
                CliResult::success_with_message("no stored identities")
            }
            Ok(records) => {
                let lines: Vec<String> = records
                    .iter()
                    .map(|r| {
                        format!(
                            "{}  {}  {}  {}",
                            r.id,
                            r.description,
                            r.last_uri.as_deref().unwrap_or("-"),
                            r.last_connect.as_deref().unwrap_or("-"),
                        )
                    })
                    .collect();
                CliResult::success_with_message(lines.join("\n"))
            }
            Err(e) => CliResult::credential_error(e.to_string()),
        },

        PskCommands::Delete { id } => match store.delete(&id) {
            Ok(()) => CliResult::success_with_message(format!("deleted {id}")),
            Err(e) => CliResult::credential_error(e.to_string()),
        },

        PskCommands::Export { output, ids } => {
            let ids = if ids.is_empty() {
                match store.load() {
                    Ok(records) => records.into_iter().map(|r| r.id).collect(),
                    Err(e) => return CliResult::credential_error(e.to_string()),
                }
            } else {
                ids
            };
            match store.export(&ids, &output) {
                Ok(()) => CliResult::success_with_message(format!(
                    "exported {} identit{} to {}",
                    ids.len(),
                    if ids.len() == 1 { "y" } else { "ies" },
                    output.display()
                )),
                Err(e) => CliResult::credential_error(e.to_string()),
            }
        }

        PskCommands::Import {
            archive,
            on_conflict,
        } => {
            let decision = match on_conflict {
                ConflictMode::Replace => MergeDecision::ReplaceAll,
                ConflictMode::Keep => MergeDecision::KeepAll,
                ConflictMode::Cancel => MergeDecision::Cancel,
            };
            match store.import(&archive, &mut |_existing, _imported| decision) {
                Ok(ImportOutcome::Applied(records)) => CliResult::success_with_message(format!(
                    "import applied, {} identit{} stored",
                    records.len(),
                    if records.len() == 1 { "y" } else { "ies" },
                )),
                Ok(ImportOutcome::Cancelled) => CliResult::error(
                    ExitCodes::CANCELLED,
                    "import cancelled, store unchanged",
                ),
                Err(e) => CliResult::credential_error(e.to_string()),
            }
        }
    }
}
