// ── Service record store ──
//
// Lock-free record storage with push-based change notification.

mod collection;
mod service_store;

pub use service_store::ServiceStore;
