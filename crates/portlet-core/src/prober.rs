// ── Availability prober ──
//
// Decides whether an enabled service's tunnel endpoint answers and what
// address it answers on. Probers never touch the store: results are
// handed back to the lifecycle manager, which decides whether they
// still apply.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use dashmap::DashMap;
use tokio::net::{TcpStream, lookup_host};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::ProbeError;
use crate::model::{Endpoint, ServiceId};

/// Reachability check for a single service.
///
/// Implementations must observe `cancel` at every i/o boundary and
/// return [`ProbeError::Cancelled`] promptly once it fires.
pub trait Prober: Send + Sync + 'static {
    fn probe(
        &self,
        id: &ServiceId,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Endpoint, ProbeError>> + Send;
}

// ── ProbeTarget ──────────────────────────────────────────────────────

/// Where a service's local tunnel endpoint is expected to listen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    /// Advertised scheme (e.g. `http`), passed through to the endpoint.
    pub scheme: Option<String>,
    pub host: String,
    pub port: u16,
}

impl ProbeTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: None,
            host: host.into(),
            port,
        }
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into());
        self
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint {
            scheme: self.scheme.clone(),
            address: self.host.clone(),
            port: self.port,
        }
    }
}

// ── TcpProber ────────────────────────────────────────────────────────

/// Probes services by opening a TCP connection to their tunnel target.
///
/// A service with no registered target is treated as removed upstream
/// and fails fatally. Resolution or connect failures are transient.
#[derive(Default)]
pub struct TcpProber {
    targets: DashMap<ServiceId, ProbeTarget>,
}

impl TcpProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_targets(targets: impl IntoIterator<Item = (ServiceId, ProbeTarget)>) -> Self {
        Self {
            targets: targets.into_iter().collect(),
        }
    }

    /// Register or replace the target for `id`.
    pub fn set_target(&self, id: ServiceId, target: ProbeTarget) -> Option<ProbeTarget> {
        self.targets.insert(id, target)
    }

    pub fn remove_target(&self, id: &ServiceId) -> Option<ProbeTarget> {
        self.targets.remove(id).map(|(_, t)| t)
    }

    pub fn target(&self, id: &ServiceId) -> Option<ProbeTarget> {
        self.targets.get(id).map(|t| t.clone())
    }

    async fn probe_target(
        target: ProbeTarget,
        cancel: CancellationToken,
    ) -> Result<Endpoint, ProbeError> {
        let addrs: Vec<SocketAddr> = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ProbeError::Cancelled),
            resolved = lookup_host((target.host.as_str(), target.port)) => resolved
                .map_err(|e| ProbeError::transient(format!("cannot resolve {}: {e}", target.host)))?
                .collect(),
        };

        let mut last_error: Option<io::Error> = None;
        for addr in addrs {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ProbeError::Cancelled),
                connected = TcpStream::connect(addr) => match connected {
                    Ok(stream) => {
                        drop(stream);
                        trace!(%addr, "tcp probe connected");
                        return Ok(target.endpoint());
                    }
                    Err(e) => {
                        debug!(%addr, error = %e, "tcp probe attempt failed");
                        last_error = Some(e);
                    }
                },
            }
        }

        Err(match last_error {
            Some(e) => ProbeError::transient(format!(
                "cannot connect to {}:{}: {e}",
                target.host, target.port
            )),
            None => ProbeError::transient(format!("{} resolved to no addresses", target.host)),
        })
    }
}

impl Prober for TcpProber {
    fn probe(
        &self,
        id: &ServiceId,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Endpoint, ProbeError>> + Send {
        let target = self.target(id).ok_or_else(|| {
            ProbeError::fatal(format!("no tunnel target registered for service {id}"))
        });
        async move { Self::probe_target(target?, cancel).await }
    }
}
