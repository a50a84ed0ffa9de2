//! Duo protocol core.
//! No I/O: envelopes, discovery datagrams, crypto adapter, digests, and transfer bookkeeping.
//! The host (duo-linux) owns sockets, files and timers.

pub mod chunk;
pub mod crypto;
pub mod envelope;
pub mod integrity;
pub mod network;
pub mod peers;
pub mod protocol;

pub use crypto::{ChaChaAdapter, CryptoAdapter, CryptoError, SessionKey};
pub use envelope::{decode_envelope, encode_envelope, Envelope, EnvelopeError};
pub use peers::{PeerAddress, PeerTable};
pub use protocol::{DeviceKind, PROTOCOL_VERSION};
