//! PLCLink service daemon
//!
//! Controller-side entry point: owns the worker thread that serializes
//! access to controller state, serves the RPC control endpoint, and
//! advertises it on the local network.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use plclink_core::config::{self, ServiceConfig};
use plclink_core::core::control::{ControlTarget, LocalRuntime};
use plclink_core::core::rpc::server::{RpcServer, ServerConfig};
use plclink_core::core::worker::Worker;

/// PLCLink controller service daemon
#[derive(Parser, Debug)]
#[command(
    name = "plclinkd",
    version,
    about = "PLCLink controller service daemon",
    long_about = None
)]
struct Args {
    /// Address to bind the control endpoint to
    #[arg(short = 'i', long, value_name = "ADDR")]
    ip: Option<String>,

    /// Port for the control endpoint
    #[arg(short, long)]
    port: Option<u16>,

    /// Service name to advertise on the local network
    #[arg(short = 'n', long)]
    service_name: Option<String>,

    /// Project directory holding credentials and runtime artifacts
    #[arg(short = 'd', long, env = "PLCLINK_PROJECT")]
    project_dir: Option<PathBuf>,

    /// Start the loaded program immediately
    #[arg(short, long)]
    autostart: bool,

    /// Do not advertise the endpoint even if a service name is configured
    #[arg(short = 'x', long)]
    no_publish: bool,

    /// Log level filter (error, warn, info, debug, trace)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Also write logs to the application log directory
    #[arg(long)]
    log_file: bool,
}

fn apply_overrides(config: &mut ServiceConfig, args: &Args) {
    if let Some(ip) = &args.ip {
        config.bind_address = ip.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(name) = &args.service_name {
        config.service_name = Some(name.clone());
    }
    if let Some(dir) = &args.project_dir {
        config.project_dir = Some(dir.clone());
    }
    if args.autostart {
        config.autostart = true;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.log_file {
        config.logging.file_enabled = true;
    }
}

fn init_logging(
    config: &ServiceConfig,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    if config.logging.file_enabled {
        let dir = config
            .logging
            .dir
            .clone()
            .or_else(config::log_dir)
            .context("could not determine log directory")?;
        std::fs::create_dir_all(&dir)?;
        let appender = tracing_appender::rolling::daily(dir, "plclinkd.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(atty::is(atty::Stream::Stdout))
            .init();
        Ok(None)
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = ServiceConfig::load().unwrap_or_default();
    apply_overrides(&mut config, &args);

    let _log_guard = init_logging(&config)?;
    config::init_directories().context("creating application directories")?;

    info!("Starting plclinkd v{}", env!("CARGO_PKG_VERSION"));

    let runtime = Arc::new(LocalRuntime::new());
    let worker = Arc::new(Worker::new());
    let worker_failed = Arc::new(AtomicBool::new(false));

    let server_config = ServerConfig {
        bind_address: config.bind_address.clone(),
        port: config.port,
        service_name: if args.no_publish {
            None
        } else {
            config.service_name.clone()
        },
    };
    let server = RpcServer::new(server_config, worker.clone(), runtime.clone());
    let handle = server.handle();

    // The worker thread owns all controller state. With autostart the
    // initial job is the program start; its failure is fatal.
    let worker_thread = {
        let worker = worker.clone();
        let runtime = runtime.clone();
        let autostart = config.autostart;
        let failed = worker_failed.clone();
        let handle = handle.clone();
        std::thread::Builder::new()
            .name("plc-worker".into())
            .spawn(move || {
                let result = if autostart {
                    worker.run_loop_with(|| runtime.start_plc())
                } else {
                    worker.run_loop()
                };
                if let Err(e) = result {
                    error!("worker loop terminated: {e}");
                    failed.store(true, Ordering::Relaxed);
                    handle.stop_blocking();
                }
            })?
    };

    {
        let handle = handle.clone();
        let worker = worker.clone();
        ctrlc::set_handler(move || {
            info!("shutdown requested");
            handle.stop_blocking();
            worker.stop();
        })?;
    }

    let tokio_runtime = tokio::runtime::Runtime::new()?;
    tokio_runtime.block_on(server.serve())?;

    worker.stop();
    let _ = worker_thread.join();

    if worker_failed.load(Ordering::Relaxed) {
        anyhow::bail!("worker initial job failed");
    }
    Ok(())
}
