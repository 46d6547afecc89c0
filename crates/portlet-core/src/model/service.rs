// ── Service domain type ──
//
// The connection state is a sum type so that "available implies
// enabled" and "available implies an address" cannot be violated by
// construction. The flat `enabled / available / scheme / address / port`
// view that presentation layers expect is derived from it.

use std::fmt;
use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::id::{GroupId, ServiceId};

// ── Endpoint ────────────────────────────────────────────────────────

/// Resolved local address of a reachable service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub scheme: Option<String>,
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: None,
            address: address.into(),
            port,
        }
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into());
        self
    }

    /// `address:port`, with IPv6 literals bracketed.
    pub fn socket_address(&self) -> String {
        if self.address.parse::<Ipv6Addr>().is_ok() {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// `scheme://address:port`, only when the service advertises a scheme.
    pub fn url(&self) -> Option<String> {
        self.scheme
            .as_ref()
            .map(|scheme| format!("{scheme}://{}", self.socket_address()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.url() {
            Some(url) => f.write_str(&url),
            None => f.write_str(&self.socket_address()),
        }
    }
}

// ── ServiceState ────────────────────────────────────────────────────

/// Lifecycle state of one service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ServiceState {
    /// Not requested by the user.
    #[default]
    Disconnected,
    /// Requested, waiting for a successful probe.
    Connecting,
    /// Requested and reachable at the given endpoint.
    Connected { endpoint: Endpoint },
}

impl ServiceState {
    pub fn status(&self) -> ConnectionStatus {
        match self {
            Self::Disconnected => ConnectionStatus::Disconnected,
            Self::Connecting => ConnectionStatus::Connecting,
            Self::Connected { .. } => ConnectionStatus::Connected,
        }
    }
}

/// Payload-free discriminant of [`ServiceState`], for display and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

// ── Service ─────────────────────────────────────────────────────────

/// A remote endpoint forwarded through a tunnel.
///
/// Records are immutable once stored: the store hands out `Arc<Service>`
/// and every change swaps in a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub group_id: GroupId,
    /// Display label.
    pub source_name: String,
    #[serde(flatten)]
    pub state: ServiceState,
}

impl Service {
    pub fn new(id: ServiceId, group_id: GroupId, source_name: impl Into<String>) -> Self {
        Self {
            id,
            group_id,
            source_name: source_name.into(),
            state: ServiceState::Disconnected,
        }
    }

    /// Copy of this record in a different state.
    pub fn with_state(&self, state: ServiceState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    pub fn enabled(&self) -> bool {
        !matches!(self.state, ServiceState::Disconnected)
    }

    pub fn available(&self) -> bool {
        matches!(self.state, ServiceState::Connected { .. })
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.status()
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        match &self.state {
            ServiceState::Connected { endpoint } => Some(endpoint),
            ServiceState::Disconnected | ServiceState::Connecting => None,
        }
    }

    pub fn scheme(&self) -> Option<&str> {
        self.endpoint().and_then(|e| e.scheme.as_deref())
    }

    pub fn address(&self) -> Option<&str> {
        self.endpoint().map(|e| e.address.as_str())
    }

    pub fn port(&self) -> Option<u16> {
        self.endpoint().map(|e| e.port)
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        ServiceSnapshot::from(self)
    }
}

// ── ServiceSnapshot ─────────────────────────────────────────────────

/// Flat read-only view of a service, shaped for presentation layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub id: ServiceId,
    pub group_id: GroupId,
    pub source_name: String,
    pub enabled: bool,
    pub available: bool,
    pub scheme: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
}

impl From<&Service> for ServiceSnapshot {
    fn from(service: &Service) -> Self {
        Self {
            id: service.id.clone(),
            group_id: service.group_id.clone(),
            source_name: service.source_name.clone(),
            enabled: service.enabled(),
            available: service.available(),
            scheme: service.scheme().map(str::to_owned),
            address: service.address().map(str::to_owned),
            port: service.port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc() -> Service {
        Service::new("svc-web".into(), "acme".into(), "Web dashboard")
    }

    #[test]
    fn new_service_is_disconnected() {
        let s = svc();
        assert!(!s.enabled());
        assert!(!s.available());
        assert!(s.address().is_none());
        assert_eq!(s.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn connecting_is_enabled_but_not_available() {
        let s = svc().with_state(ServiceState::Connecting);
        assert!(s.enabled());
        assert!(!s.available());
        assert!(s.port().is_none());
    }

    #[test]
    fn connected_exposes_endpoint_fields() {
        let endpoint = Endpoint::new("127.0.0.1", 4000).with_scheme("http");
        let s = svc().with_state(ServiceState::Connected { endpoint });
        assert!(s.enabled());
        assert!(s.available());
        assert_eq!(s.scheme(), Some("http"));
        assert_eq!(s.address(), Some("127.0.0.1"));
        assert_eq!(s.port(), Some(4000));
    }

    #[test]
    fn endpoint_formats_copy_and_open_strings() {
        let plain = Endpoint::new("127.0.0.1", 4000);
        assert_eq!(plain.socket_address(), "127.0.0.1:4000");
        assert!(plain.url().is_none());
        assert_eq!(plain.to_string(), "127.0.0.1:4000");

        let web = plain.with_scheme("https");
        assert_eq!(web.url().as_deref(), Some("https://127.0.0.1:4000"));
        assert_eq!(web.to_string(), "https://127.0.0.1:4000");
    }

    #[test]
    fn endpoint_brackets_ipv6_literals() {
        let e = Endpoint::new("::1", 8080);
        assert_eq!(e.socket_address(), "[::1]:8080");
    }

    #[test]
    fn snapshot_mirrors_derived_flags() {
        let endpoint = Endpoint::new("10.0.0.5", 22);
        let snap = svc().with_state(ServiceState::Connected { endpoint }).snapshot();
        assert!(snap.enabled && snap.available);
        assert_eq!(snap.address.as_deref(), Some("10.0.0.5"));
        assert_eq!(snap.scheme, None);

        let snap = svc().snapshot();
        assert!(!snap.enabled && !snap.available);
        assert_eq!(snap.address, None);
    }

    #[test]
    fn status_parses_from_snake_case() {
        assert_eq!("connecting".parse::<ConnectionStatus>().ok(), Some(ConnectionStatus::Connecting));
        assert_eq!(ConnectionStatus::Connected.to_string(), "connected");
    }
}
