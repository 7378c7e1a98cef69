//! Wire formats of the handshake and alert protocols.

mod alert;
mod client_hello;
mod extension;
mod finished;
mod handshake;
mod hello_verify;
mod id;
mod key_exchange;
mod random;
mod server_hello;

pub use alert::{Alert, AlertDescription, AlertLevel};
pub use client_hello::{CipherSuiteVec, ClientHello};
pub use extension::{ExtensionType, Extensions};
pub use finished::{Finished, VERIFY_DATA_LEN};
pub use handshake::{Body, Handshake, HandshakeFragment, Header, MessageType};
pub use handshake::HANDSHAKE_HEADER_LEN;
pub use hello_verify::HelloVerifyRequest;
pub use id::{ConnectionId, Cookie, InvalidLength, SessionId};
pub use key_exchange::{ClientKeyExchange, ServerKeyExchange};
pub use random::Random;
pub use server_hello::ServerHello;

/// The change_cipher_spec record payload.
pub const CHANGE_CIPHER_SPEC: u8 = 1;
