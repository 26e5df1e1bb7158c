//! Controller connector
//!
//! Fixed interface enumerating each remote operation, one typed method
//! per call. Every method declares a safe default to return when the
//! call fails at the transport or protocol level, so a disconnected
//! front-end degrades to a known state ("status unknown") instead of
//! surfacing raw transport errors. Semantic failures reported by the
//! controller are logged and degrade the same way.
//!
//! On a successful connect the controller's self-reported identity is
//! written into the project's credential store; a controller without an
//! identity is a warning, not an error.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::path::Path;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{info, warn};

use super::proto::{self, Reply, Request};
use super::RpcError;
use crate::core::control::{LogMessage, PlcStatus, PskIdentity, TraceOrder, TraceSample, LOG_LEVELS};
use crate::core::psk::PskStore;

/// The remote operation set as seen by the front-end
///
/// Implementations absorb transport and protocol failures into each
/// method's declared safe default.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Start the loaded program; safe default `false`
    async fn start_plc(&self) -> bool;

    /// Stop the running program; safe default `false`
    async fn stop_plc(&self) -> bool;

    /// Run state and log counts; safe default `(Broken, [0; 4])`
    async fn get_plc_status(&self) -> (PlcStatus, [u32; LOG_LEVELS]);

    /// Digest check; safe default `false`
    async fn match_md5(&self, digest: &str) -> bool;

    /// Install a program image; safe default `false`
    async fn new_plc(&self, digest: &str, object: Vec<u8>) -> bool;

    /// Replace the traced variable set; safe default `false`
    async fn set_trace_variables(&self, orders: Vec<TraceOrder>) -> bool;

    /// Drain trace samples; safe default `(Broken, [])`
    async fn get_trace_variables(&self) -> (PlcStatus, Vec<TraceSample>);

    /// Execute a script; safe default `(-1, "RemoteExec script failed!")`
    async fn remote_exec(&self, script: &str) -> (i32, String);

    /// Self-reported identity; safe default `None`
    async fn get_plc_id(&self) -> Option<PskIdentity>;

    /// Fetch one log message; safe default `None`
    async fn get_log_message(&self, level: u8, msgid: u32) -> Option<LogMessage>;

    /// Clear the log rings; safe default `false`
    async fn reset_log_count(&self) -> bool;
}

/// Connected proxy for one controller endpoint
pub struct PlcProxy {
    framed: Mutex<Framed<TcpStream, LengthDelimitedCodec>>,
    uri: String,
}

impl PlcProxy {
    /// Open a raw connection to a controller endpoint
    ///
    /// # Errors
    ///
    /// [`RpcError::ConnectionFailed`] when the endpoint is unreachable.
    pub async fn connect(host: &str, port: u16, uri: &str) -> Result<Self, RpcError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| RpcError::ConnectionFailed(e.to_string()))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            framed: Mutex::new(Framed::new(stream, LengthDelimitedCodec::new())),
            uri: uri.to_string(),
        })
    }

    /// The URI this proxy was connected with
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Issue one raw request and wait for its reply
    ///
    /// # Errors
    ///
    /// [`RpcError::ConnectionLost`] when the transport drops,
    /// [`RpcError::Protocol`] on malformed frames.
    pub async fn request(&self, request: Request) -> Result<Reply, RpcError> {
        let mut framed = self.framed.lock().await;
        framed
            .send(proto::encode_request(&request)?)
            .await
            .map_err(|_| RpcError::ConnectionLost)?;
        match framed.next().await {
            None => Err(RpcError::ConnectionLost),
            Some(Err(_)) => Err(RpcError::ConnectionLost),
            Some(Ok(frame)) => proto::decode_reply(&frame),
        }
    }

    /// One remote call with its declared safe default
    async fn call_or<T>(
        &self,
        request: Request,
        default: T,
        op: &'static str,
        extract: fn(Reply) -> Option<T>,
    ) -> T {
        match self.request(request).await {
            Ok(Reply::Error { message }) => {
                warn!("{op} failed on controller: {message}");
                default
            }
            Ok(reply) => match extract(reply) {
                Some(value) => value,
                None => {
                    warn!("{op}: unexpected reply kind");
                    default
                }
            },
            Err(e) => {
                warn!("{op}: connection problem: {e}");
                default
            }
        }
    }
}

#[async_trait]
impl Connector for PlcProxy {
    async fn start_plc(&self) -> bool {
        self.call_or(Request::StartPlc, false, "StartPLC", |r| match r {
            Reply::Bool { value } => Some(value),
            _ => None,
        })
        .await
    }

    async fn stop_plc(&self) -> bool {
        self.call_or(Request::StopPlc, false, "StopPLC", |r| match r {
            Reply::Bool { value } => Some(value),
            _ => None,
        })
        .await
    }

    async fn get_plc_status(&self) -> (PlcStatus, [u32; LOG_LEVELS]) {
        self.call_or(
            Request::GetStatus,
            (PlcStatus::Broken, [0; LOG_LEVELS]),
            "GetPLCstatus",
            |r| match r {
                Reply::Status { status, log_counts } => Some((status, log_counts)),
                _ => None,
            },
        )
        .await
    }

    async fn match_md5(&self, digest: &str) -> bool {
        self.call_or(
            Request::MatchMd5 {
                digest: digest.to_string(),
            },
            false,
            "MatchMD5",
            |r| match r {
                Reply::Bool { value } => Some(value),
                _ => None,
            },
        )
        .await
    }

    async fn new_plc(&self, digest: &str, object: Vec<u8>) -> bool {
        self.call_or(
            Request::NewPlc {
                digest: digest.to_string(),
                object,
            },
            false,
            "NewPLC",
            |r| match r {
                Reply::Bool { value } => Some(value),
                _ => None,
            },
        )
        .await
    }

    async fn set_trace_variables(&self, orders: Vec<TraceOrder>) -> bool {
        self.call_or(
            Request::SetTraceVariables { orders },
            false,
            "SetTraceVariables",
            |r| match r {
                Reply::Bool { value } => Some(value),
                _ => None,
            },
        )
        .await
    }

    async fn get_trace_variables(&self) -> (PlcStatus, Vec<TraceSample>) {
        self.call_or(
            Request::GetTraceVariables,
            (PlcStatus::Broken, Vec::new()),
            "GetTraceVariables",
            |r| match r {
                Reply::Trace { status, samples } => Some((status, samples)),
                _ => None,
            },
        )
        .await
    }

    async fn remote_exec(&self, script: &str) -> (i32, String) {
        self.call_or(
            Request::RemoteExec {
                script: script.to_string(),
            },
            (-1, "RemoteExec script failed!".to_string()),
            "RemoteExec",
            |r| match r {
                Reply::ExecResult { code, output } => Some((code, output)),
                _ => None,
            },
        )
        .await
    }

    async fn get_plc_id(&self) -> Option<PskIdentity> {
        self.call_or(Request::GetPlcId, None, "GetPLCID", |r| match r {
            Reply::PlcId { identity } => Some(identity),
            _ => None,
        })
        .await
    }

    async fn get_log_message(&self, level: u8, msgid: u32) -> Option<LogMessage> {
        self.call_or(
            Request::GetLogMessage { level, msgid },
            None,
            "GetLogMessage",
            |r| match r {
                Reply::Log { message } => Some(message),
                _ => None,
            },
        )
        .await
    }

    async fn reset_log_count(&self) -> bool {
        self.call_or(Request::ResetLogCount, false, "ResetLogCount", |r| match r {
            Reply::Bool { value } => Some(value),
            _ => None,
        })
        .await
    }
}

/// Connect to a controller URI and refresh its stored credentials
///
/// Accepts `tcp://host:port`. When the controller reports an identity
/// and a project directory is given, the ID, secret, and this URI are
/// recorded in the project's credential store. A controller without an
/// identity only logs a warning.
///
/// # Errors
///
/// [`RpcError::InvalidUri`] on an unparseable or non-`tcp` URI,
/// [`RpcError::ConnectionFailed`] when the endpoint is unreachable.
pub async fn connect(uri: &str, project_dir: Option<&Path>) -> Result<PlcProxy, RpcError> {
    let (host, port) = parse_uri(uri)?;
    let proxy = PlcProxy::connect(&host, port, uri).await?;
    info!("connected to controller at {uri}");

    match proxy.request(Request::GetPlcId).await {
        Ok(Reply::PlcId {
            identity: Some(identity),
        }) => {
            if let Some(dir) = project_dir {
                let store = PskStore::new(dir);
                if let Err(e) = store.upsert(&identity.id, &identity.secret, uri) {
                    warn!("failed to record controller identity: {e}");
                }
            }
        }
        Ok(_) => warn!("controller did not provide identity and security information"),
        Err(e) => warn!("identity query failed: {e}"),
    }

    Ok(proxy)
}

fn parse_uri(uri: &str) -> Result<(String, u16), RpcError> {
    let (scheme, location) = uri
        .split_once("://")
        .ok_or_else(|| RpcError::InvalidUri(uri.to_string()))?;
    if !scheme.eq_ignore_ascii_case("tcp") {
        return Err(RpcError::InvalidUri(uri.to_string()));
    }
    let (host, port) = location
        .rsplit_once(':')
        .ok_or_else(|| RpcError::InvalidUri(uri.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| RpcError::InvalidUri(uri.to_string()))?;
    if host.is_empty() {
        return Err(RpcError::InvalidUri(uri.to_string()));
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uri() {
        assert_eq!(
            parse_uri("tcp://10.0.0.5:61131").unwrap(),
            ("10.0.0.5".to_string(), 61131)
        );
        assert_eq!(
            parse_uri("TCP://bench:3000").unwrap(),
            ("bench".to_string(), 3000)
        );
        assert!(matches!(
            parse_uri("pyro://10.0.0.5:3000"),
            Err(RpcError::InvalidUri(_))
        ));
        assert!(matches!(
            parse_uri("tcp://nohostport"),
            Err(RpcError::InvalidUri(_))
        ));
        assert!(matches!(
            parse_uri("tcp://host:notaport"),
            Err(RpcError::InvalidUri(_))
        ));
    }

    #[test]
    fn test_safe_default_on_dead_connection() {
        tokio_test::block_on(async {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            // accept and immediately drop the connection
            tokio::spawn(async move {
                let _ = listener.accept().await;
            });

            let proxy = PlcProxy::connect(&addr.ip().to_string(), addr.port(), "tcp://test")
                .await
                .unwrap();
            assert!(!proxy.start_plc().await);
            let (status, counts) = proxy.get_plc_status().await;
            assert_eq!(status, PlcStatus::Broken);
            assert_eq!(counts, [0; LOG_LEVELS]);
            let (code, output) = proxy.remote_exec("echo hi").await;
            assert_eq!(code, -1);
            assert_eq!(output, "RemoteExec script failed!");
        });
    }

    #[test]
    fn test_connect_refuses_unreachable_endpoint() {
        tokio_test::block_on(async {
            // bind then drop to get a port nobody listens on
            let port = {
                let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
                listener.local_addr().unwrap().port()
            };
            let result = connect(&format!("tcp://127.0.0.1:{port}"), None).await;
            assert!(matches!(result, Err(RpcError::ConnectionFailed(_))));
        });
    }
}
