//! Duo for Linux: connection manager, discovery service, file transfer engine and router.
//! Protocol types and bookkeeping live in duo-core; this crate owns sockets, files and tasks.

pub mod config;
pub mod connection;
pub mod discovery;
pub mod events;
pub mod router;
pub mod store;
pub mod transfer;
pub mod transport;

use duo_core::DeviceKind;

/// This device as seen by peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub id: String,
    pub name: String,
    pub kind: DeviceKind,
}
