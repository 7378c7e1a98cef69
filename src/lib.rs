//! dimux is a DTLS 1.2 endpoint that serves many peers over one datagram
//! socket.
//!
//! Peers authenticate with pre-shared keys, using
//! TLS_PSK_WITH_AES_128_GCM_SHA256 or TLS_ECDHE_PSK_WITH_AES_128_GCM_SHA256.
//! The [`DtlsConnector`] acts as client towards peers the application sends
//! to first and as server towards peers that send it a CLIENT_HELLO.
//!
//! * Stateless cookie exchange before any per peer state exists (RFC 6347 4.2.1).
//! * Session resumption, optionally without the cookie exchange while few
//!   resumptions are unverified.
//! * Connection ids (RFC 9146) so peers survive address changes.
//! * A bounded connection store with least recently used eviction.
//! * Retransmission of flights with exponential backoff.
//!
//! Each connection is worked on by one serial executor on a shared worker
//! pool, so records of one peer are processed in order while many peers
//! progress in parallel.

#![forbid(unsafe_code)]
#![warn(clippy::all)]
// #![deny(missing_docs)]

#[macro_use]
extern crate log;

mod api;
mod buffer;
mod config;
mod connection;
mod connector;
mod crypto;
mod error;
mod event;
mod executor;
mod flight;
mod handshake;
mod message;
mod record;
mod rng;
mod session;
mod socket;
mod store;
mod timer;
mod types;
mod util;
mod window;

pub use api::{AlertHandler, EndpointContext, EndpointContextMatcher, HandshakeMode};
pub use api::{MessageCallback, RawData, RawDataChannel, SessionListener, StrictContextMatcher};
pub use config::{Config, ConfigBuilder};
pub use connector::{DtlsConnector, ForEach};
pub use crypto::{CipherSuite, PskStore, StaticPskStore};
pub use error::Error;
pub use event::HandshakeEvent;
pub use message::{Alert, AlertDescription, AlertLevel, ConnectionId, SessionId};
pub use session::SessionTicket;
pub use socket::DatagramSocket;
pub use store::{InMemorySessionCache, SessionCache};
pub use window::ReplayFilter;
