//! Local-network service discovery
//!
//! Publishes a running control endpoint under the fixed service type
//! `_plclink._tcp.local.` so front-ends can find a controller without a
//! known address, and browses for such advertisements. A registration
//! attempt that fails (network stack not ready yet) is retried every
//! two seconds until it succeeds or the registration is withdrawn;
//! nothing in the retry path ever escalates an error.

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::utils::net::local_ip;

/// Fully qualified mDNS service type for control endpoints
pub const SERVICE_TYPE: &str = "_plclink._tcp.local.";

/// Delay between registration attempts after a failure
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Discovery error types
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// Underlying mDNS stack error
    #[error("mDNS error: {0}")]
    Mdns(#[from] mdns_sd::Error),
}

/// An endpoint to advertise on the local network
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    /// Human-readable instance name
    pub name: String,
    /// Protocol tag carried as a TXT property
    pub protocol: String,
    /// Bind address; a wildcard requests a routing probe
    pub address: String,
    /// Endpoint port
    pub port: u16,
}

/// Publication backend behind the advertiser
///
/// Split out so the retry machinery can be exercised without a live
/// network stack.
pub trait PublishBackend: Send + 'static {
    /// Attempt to publish the record
    ///
    /// # Errors
    ///
    /// Any error schedules a retry in the advertiser.
    fn try_publish(&mut self, record: &ServiceRecord) -> Result<(), DiscoveryError>;

    /// Withdraw a successful publication (no-op when none is active)
    fn withdraw(&mut self);
}

/// mDNS publication backend
pub struct MdnsBackend {
    active: Option<(ServiceDaemon, String)>,
}

impl MdnsBackend {
    fn new() -> Self {
        Self { active: None }
    }
}

impl PublishBackend for MdnsBackend {
    fn try_publish(&mut self, record: &ServiceRecord) -> Result<(), DiscoveryError> {
        self.withdraw();

        let ip: IpAddr = match record.address.parse::<IpAddr>() {
            Ok(ip) if !ip.is_unspecified() => ip,
            // Wildcard bind: advertise the routable address instead.
            _ => local_ip(),
        };

        let daemon = ServiceDaemon::new()?;
        let props = [
            ("protocol", record.protocol.as_str()),
            ("description", "PLCLink remote controller"),
        ];
        let host = format!("{}.local.", record.name);
        let info = ServiceInfo::new(SERVICE_TYPE, &record.name, &host, ip, record.port, &props[..])?;
        let fullname = info.get_fullname().to_string();
        daemon.register(info)?;
        info!(name = %record.name, %ip, port = record.port, "service advertised");
        self.active = Some((daemon, fullname));
        Ok(())
    }

    fn withdraw(&mut self) {
        if let Some((daemon, fullname)) = self.active.take() {
            if let Err(e) = daemon.unregister(&fullname) {
                warn!("service unregister failed: {e}");
            }
            let _ = daemon.shutdown();
            info!(%fullname, "service withdrawn");
        }
    }
}

struct RetryGuard {
    cancel: Sender<()>,
    handle: JoinHandle<()>,
}

struct AdvState<B> {
    backend: B,
    published: bool,
}

/// Publishes and withdraws one named endpoint, retrying on failure
pub struct ServiceAdvertiser<B: PublishBackend = MdnsBackend> {
    protocol: String,
    state: Arc<Mutex<AdvState<B>>>,
    retry: Mutex<Option<RetryGuard>>,
}

impl ServiceAdvertiser<MdnsBackend> {
    /// Create an advertiser for the given protocol tag
    pub fn new(protocol: &str) -> Self {
        Self::with_backend(protocol, MdnsBackend::new())
    }
}

impl<B: PublishBackend> ServiceAdvertiser<B> {
    /// Create an advertiser over a custom backend
    pub fn with_backend(protocol: &str, backend: B) -> Self {
        Self {
            protocol: protocol.to_string(),
            state: Arc::new(Mutex::new(AdvState {
                backend,
                published: false,
            })),
            retry: Mutex::new(None),
        }
    }

    /// Whether a publication is currently active
    pub fn is_published(&self) -> bool {
        self.state.lock().published
    }

    /// Publish the endpoint, retrying in the background on failure
    ///
    /// Never raises: a failed attempt schedules the next one after the
    /// fixed backoff until it succeeds or [`ServiceAdvertiser::unregister`]
    /// is called. Any pending retry from an earlier registration is
    /// cancelled before the first new attempt.
    pub fn register(&self, name: &str, address: &str, port: u16) {
        self.cancel_retry();
        let record = ServiceRecord {
            name: name.to_string(),
            protocol: self.protocol.clone(),
            address: address.to_string(),
            port,
        };

        let mut st = self.state.lock();
        if st.published {
            st.backend.withdraw();
            st.published = false;
        }
        match st.backend.try_publish(&record) {
            Ok(()) => st.published = true,
            Err(e) => {
                drop(st);
                warn!(
                    "service registration failed ({e}), retrying every {}s",
                    RETRY_DELAY.as_secs()
                );
                self.spawn_retry(record);
            }
        }
    }

    /// Withdraw the publication and cancel any pending retry
    ///
    /// Idempotent: calling with nothing registered is a no-op. The
    /// retry timer is cancelled synchronously; no attempt fires after
    /// this returns.
    pub fn unregister(&self) {
        self.cancel_retry();
        let mut st = self.state.lock();
        if st.published {
            st.backend.withdraw();
            st.published = false;
        }
    }

    fn spawn_retry(&self, record: ServiceRecord) {
        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        let state = self.state.clone();
        let handle = thread::spawn(move || loop {
            match cancel_rx.recv_timeout(RETRY_DELAY) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => {}
            }
            let mut st = state.lock();
            match st.backend.try_publish(&record) {
                Ok(()) => {
                    st.published = true;
                    return;
                }
                Err(e) => debug!("service registration retry failed: {e}"),
            }
        });
        *self.retry.lock() = Some(RetryGuard {
            cancel: cancel_tx,
            handle,
        });
    }

    fn cancel_retry(&self) {
        let guard = self.retry.lock().take();
        if let Some(RetryGuard { cancel, handle }) = guard {
            let _ = cancel.send(());
            let _ = handle.join();
        }
    }
}

impl<B: PublishBackend> Drop for ServiceAdvertiser<B> {
    fn drop(&mut self) {
        self.unregister();
    }
}

/// A controller advertisement seen on the local network
#[derive(Debug, Clone)]
pub struct DiscoveredService {
    /// Instance name (service type suffix stripped)
    pub name: String,
    /// Protocol tag from the TXT properties
    pub protocol: String,
    /// Addresses the endpoint resolved to
    pub addresses: Vec<IpAddr>,
    /// Endpoint port
    pub port: u16,
}

impl DiscoveredService {
    /// Connection URI for the first resolved address
    pub fn uri(&self) -> Option<String> {
        self.addresses
            .first()
            .map(|ip| format!("{}://{}:{}", self.protocol.to_lowercase(), ip, self.port))
    }
}

/// Browse the local network for control endpoints
///
/// Collects advertisements resolved within the timeout.
///
/// # Errors
///
/// Fails only when the mDNS stack cannot be started.
pub fn browse(timeout: Duration) -> Result<Vec<DiscoveredService>, DiscoveryError> {
    let daemon = ServiceDaemon::new()?;
    let receiver = daemon.browse(SERVICE_TYPE)?;
    let deadline = Instant::now() + timeout;
    let mut found = Vec::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match receiver.recv_timeout(remaining) {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                let name = info
                    .get_fullname()
                    .strip_suffix(SERVICE_TYPE)
                    .map_or_else(|| info.get_fullname().to_string(), |n| {
                        n.trim_end_matches('.').to_string()
                    });
                found.push(DiscoveredService {
                    name,
                    protocol: info
                        .get_property_val_str("protocol")
                        .unwrap_or("tcp")
                        .to_string(),
                    addresses: info.get_addresses().iter().map(|a| IpAddr::from(*a)).collect(),
                    port: info.get_port(),
                });
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    let _ = daemon.shutdown();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backend that fails a configured number of attempts, then succeeds
    struct FlakyBackend {
        failures_left: u32,
        attempts: Arc<Mutex<u32>>,
        withdrawn: Arc<Mutex<u32>>,
    }

    impl PublishBackend for FlakyBackend {
        fn try_publish(&mut self, _record: &ServiceRecord) -> Result<(), DiscoveryError> {
            *self.attempts.lock() += 1;
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(DiscoveryError::Mdns(mdns_sd::Error::Msg(
                    "interface not ready".into(),
                )));
            }
            Ok(())
        }

        fn withdraw(&mut self) {
            *self.withdrawn.lock() += 1;
        }
    }

    fn flaky(failures: u32) -> (ServiceAdvertiser<FlakyBackend>, Arc<Mutex<u32>>, Arc<Mutex<u32>>) {
        let attempts = Arc::new(Mutex::new(0));
        let withdrawn = Arc::new(Mutex::new(0));
        let advertiser = ServiceAdvertiser::with_backend(
            "TCP",
            FlakyBackend {
                failures_left: failures,
                attempts: attempts.clone(),
                withdrawn: withdrawn.clone(),
            },
        );
        (advertiser, attempts, withdrawn)
    }

    #[test]
    fn test_register_succeeds_first_try() {
        let (advertiser, attempts, _) = flaky(0);
        advertiser.register("bench", "192.168.1.10", 61131);
        assert!(advertiser.is_published());
        assert_eq!(*attempts.lock(), 1);
    }

    #[test]
    fn test_register_retries_until_success() {
        let (advertiser, attempts, withdrawn) = flaky(1);
        advertiser.register("bench", "192.168.1.10", 61131);
        assert!(!advertiser.is_published());

        // one failed attempt immediately; the retry fires after the backoff
        let deadline = Instant::now() + Duration::from_secs(10);
        while !advertiser.is_published() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        assert!(advertiser.is_published());
        assert_eq!(*attempts.lock(), 2);

        advertiser.unregister();
        assert!(!advertiser.is_published());
        assert_eq!(*withdrawn.lock(), 1);
    }

    #[test]
    fn test_unregister_cancels_pending_retry() {
        let (advertiser, attempts, withdrawn) = flaky(u32::MAX);
        advertiser.register("bench", "0.0.0.0", 61131);
        advertiser.unregister();
        let after_cancel = *attempts.lock();
        // no retry may fire once unregister returned
        thread::sleep(RETRY_DELAY + Duration::from_millis(500));
        assert_eq!(*attempts.lock(), after_cancel);
        assert_eq!(*withdrawn.lock(), 0);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let (advertiser, _, withdrawn) = flaky(0);
        advertiser.unregister();
        advertiser.unregister();
        assert_eq!(*withdrawn.lock(), 0);
    }
}
