//! RPC server
//!
//! Owns the endpoint remote front-ends connect to. Every inbound call
//! is routed through the worker so controller state is only touched
//! from the worker thread. The accept loop runs in generations: a
//! restart tears the current generation down (in-flight calls fail
//! with a recoverable connection-closed error) and rebinds the same
//! address and port; a stop unpublishes the service and is terminal.
//!
//! Idle connections are dropped after a fixed timeout to bound resource
//! growth from clients that vanished without closing. Shutdown never
//! waits on a network timeout: the accept loop and every connection
//! select on an in-process control signal as well.

use futures::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

use super::proto::{self, Reply, Request};
use super::RpcError;
use crate::core::control::ControlTarget;
use crate::core::discovery::ServiceAdvertiser;
use crate::core::worker::{Worker, WorkerError};

/// Idle time after which a silent connection is dropped
///
/// Large enough not to disturb an interactive session, small enough to
/// reclaim connections from vanished clients.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Protocol tag advertised with the service record
const PROTOCOL_TAG: &str = "TCP";

/// Server endpoint configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind; `0.0.0.0` binds all interfaces
    pub bind_address: String,
    /// Port to bind
    pub port: u16,
    /// Advertise under this name when set and the bind is routable
    pub service_name: Option<String>,
}

impl ServerConfig {
    /// Config for a concrete address and port, unadvertised
    pub fn new(bind_address: &str, port: u16) -> Self {
        Self {
            bind_address: bind_address.to_string(),
            port,
            service_name: None,
        }
    }

    /// Set the advertised service name
    #[must_use]
    pub fn service_name(mut self, name: &str) -> Self {
        self.service_name = Some(name.to_string());
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("127.0.0.1", 61131)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Restart,
    Stop,
}

/// Control handle for a serving [`RpcServer`]
///
/// Cloneable; all methods are safe from any task or thread.
#[derive(Clone)]
pub struct ServerHandle {
    tx: mpsc::Sender<Command>,
}

impl ServerHandle {
    /// Tear down the current accept loop and rebind the same endpoint
    pub async fn restart(&self) {
        let _ = self.tx.send(Command::Restart).await;
    }

    /// Tear down the accept loop and unpublish the service (terminal)
    pub async fn stop(&self) {
        let _ = self.tx.send(Command::Stop).await;
    }

    /// As [`ServerHandle::stop`], for non-async contexts (signal handlers)
    pub fn stop_blocking(&self) {
        let _ = self.tx.blocking_send(Command::Stop);
    }
}

/// RPC session server
pub struct RpcServer {
    config: ServerConfig,
    worker: Arc<Worker>,
    target: Arc<dyn ControlTarget>,
    advertiser: ServiceAdvertiser,
    ctrl_tx: mpsc::Sender<Command>,
    ctrl_rx: mpsc::Receiver<Command>,
}

impl RpcServer {
    /// Create an unbound server for a worker-guarded target
    pub fn new(config: ServerConfig, worker: Arc<Worker>, target: Arc<dyn ControlTarget>) -> Self {
        let (ctrl_tx, ctrl_rx) = mpsc::channel(4);
        Self {
            config,
            worker,
            target,
            advertiser: ServiceAdvertiser::new(PROTOCOL_TAG),
            ctrl_tx,
            ctrl_rx,
        }
    }

    /// Control handle for restart/stop
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            tx: self.ctrl_tx.clone(),
        }
    }

    fn publishable(&self) -> bool {
        self.config.service_name.is_some()
            && !matches!(
                self.config.bind_address.as_str(),
                "" | "localhost" | "127.0.0.1" | "::1"
            )
    }

    fn bind_listener(&self) -> Result<TcpListener, RpcError> {
        let address = if self.config.bind_address.is_empty() {
            "127.0.0.1"
        } else {
            self.config.bind_address.as_str()
        };
        let ip: IpAddr = address
            .parse()
            .map_err(|_| RpcError::ConnectionFailed(format!("invalid bind address {address}")))?;
        let addr = SocketAddr::new(ip, self.config.port);
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        // Rebinding the same port right after a restart must not trip
        // over lingering TIME_WAIT connections.
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        Ok(socket.listen(64)?)
    }

    /// Bind and accept calls until stopped
    ///
    /// Blocks (asynchronously) for the server's whole lifetime. When a
    /// service name is configured and the bind address is not loopback,
    /// the endpoint is also advertised on the local network.
    ///
    /// # Errors
    ///
    /// Fails when the endpoint cannot be bound.
    pub async fn serve(mut self) -> Result<(), RpcError> {
        if self.publishable() {
            if let Some(name) = self.config.service_name.clone() {
                self.advertiser
                    .register(&name, &self.config.bind_address, self.config.port);
            }
        }

        loop {
            let listener = self.bind_listener()?;
            let local = listener.local_addr()?;
            info!("control endpoint listening on {local}");

            let (conn_shutdown, _) = watch::channel(false);
            let command = self.accept_loop(&listener, &conn_shutdown).await;
            // Wakes every connection of this generation out of its read.
            let _ = conn_shutdown.send(true);
            drop(listener);

            match command {
                Command::Restart => {
                    info!("control endpoint restarting");
                }
                Command::Stop => break,
            }
        }

        self.advertiser.unregister();
        info!("control endpoint stopped");
        Ok(())
    }

    async fn accept_loop(
        &mut self,
        listener: &TcpListener,
        shutdown: &watch::Sender<bool>,
    ) -> Command {
        loop {
            tokio::select! {
                command = self.ctrl_rx.recv() => {
                    return command.unwrap_or(Command::Stop);
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("client connecting from {peer}");
                        let worker = self.worker.clone();
                        let target = self.target.clone();
                        let shutdown_rx = shutdown.subscribe();
                        tokio::spawn(async move {
                            if let Err(e) =
                                handle_connection(stream, peer, worker, target, shutdown_rx).await
                            {
                                debug!("connection from {peer} closed: {e}");
                            }
                        });
                    }
                    Err(e) => warn!("accept failed: {e}"),
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    worker: Arc<Worker>,
    target: Arc<dyn ControlTarget>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), RpcError> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => {
                debug!("dropping connection from {peer} for restart/stop");
                return Ok(());
            }
            next = tokio::time::timeout(IDLE_TIMEOUT, framed.next()) => match next {
                Err(_) => {
                    debug!("dropping idle connection from {peer}");
                    return Ok(());
                }
                Ok(None) => {
                    debug!("client {peer} disconnected");
                    return Ok(());
                }
                Ok(Some(Err(e))) => return Err(RpcError::Io(e)),
                Ok(Some(Ok(frame))) => frame,
            }
        };

        let reply = match proto::decode_request(&frame) {
            Ok(request) => dispatch(request, &worker, &target).await,
            Err(e) => {
                warn!("bad frame from {peer}: {e}");
                Reply::Error {
                    message: e.to_string(),
                }
            }
        };
        framed.send(proto::encode_reply(&reply)?).await?;
    }
}

async fn dispatch(request: Request, worker: &Arc<Worker>, target: &Arc<dyn ControlTarget>) -> Reply {
    let worker = worker.clone();
    let target = target.clone();
    match tokio::task::spawn_blocking(move || run_guarded(request, &worker, target)).await {
        Ok(reply) => reply,
        Err(e) => {
            error!("dispatch task failed: {e}");
            Reply::Error {
                message: "internal dispatch failure".into(),
            }
        }
    }
}

/// Execute one request on the worker thread and shape its reply
fn run_guarded(request: Request, worker: &Worker, target: Arc<dyn ControlTarget>) -> Reply {
    match request {
        Request::StartPlc => reply_unit(worker.call(move || target.start_plc())),
        Request::StopPlc => reply_unit(worker.call(move || target.stop_plc())),
        Request::GetStatus => match worker.call(move || Ok(target.status())) {
            Ok((status, log_counts)) => Reply::Status { status, log_counts },
            Err(e) => error_reply(&e),
        },
        Request::MatchMd5 { digest } => {
            match worker.call(move || Ok(target.match_md5(&digest))) {
                Ok(value) => Reply::Bool { value },
                Err(e) => error_reply(&e),
            }
        }
        Request::NewPlc { digest, object } => {
            reply_unit(worker.call(move || target.new_plc(&digest, &object)))
        }
        Request::SetTraceVariables { orders } => {
            reply_unit(worker.call(move || target.set_trace_variables(orders)))
        }
        Request::GetTraceVariables => match worker.call(move || Ok(target.get_trace_variables())) {
            Ok((status, samples)) => Reply::Trace { status, samples },
            Err(e) => error_reply(&e),
        },
        Request::RemoteExec { script } => {
            match worker.call(move || Ok(target.remote_exec(&script))) {
                Ok((code, output)) => Reply::ExecResult { code, output },
                Err(e) => error_reply(&e),
            }
        }
        Request::GetPlcId => match worker.call(move || Ok(target.identity())) {
            Ok(identity) => Reply::PlcId { identity },
            Err(e) => error_reply(&e),
        },
        Request::GetLogMessage { level, msgid } => {
            match worker.call(move || Ok(target.get_log_message(level, msgid))) {
                Ok(message) => Reply::Log { message },
                Err(e) => error_reply(&e),
            }
        }
        Request::ResetLogCount => {
            match worker.call(move || {
                target.reset_log_count();
                Ok(())
            }) {
                Ok(()) => Reply::Bool { value: true },
                Err(e) => error_reply(&e),
            }
        }
    }
}

fn reply_unit(result: Result<(), WorkerError>) -> Reply {
    match result {
        Ok(()) => Reply::Bool { value: true },
        Err(e) => error_reply(&e),
    }
}

fn error_reply(e: &WorkerError) -> Reply {
    Reply::Error {
        message: e.to_string(),
    }
}
