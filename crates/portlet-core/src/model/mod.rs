// ── Domain model ──

mod group;
mod id;
mod service;

pub use group::Group;
pub use id::{GroupId, ServiceId};
pub use service::{ConnectionStatus, Endpoint, Service, ServiceSnapshot, ServiceState};
