//! Types exchanged with the application layer.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::crypto::CipherSuite;
use crate::event::HandshakeEvent;
use crate::message::{Alert, SessionId};
use crate::Error;

/// How a message wants its connection to be (re)established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeMode {
    /// Use the existing session, start a handshake only if there is none.
    #[default]
    Auto,
    /// Start a full handshake before sending.
    Full,
    /// Resume the session before sending, full handshake if there is nothing to resume.
    Resume,
    /// Only send on an established session, fail otherwise.
    NoHandshake,
}

/// Security context a message is sent or received in.
#[derive(Clone, PartialEq, Eq)]
pub struct EndpointContext {
    pub peer: SocketAddr,
    /// Server name indication.
    pub server_name: Option<String>,
    pub handshake_mode: HandshakeMode,
    /// PSK identity of the client.
    ///
    /// Outbound, the identity the connection is required to use.
    pub identity: Option<Vec<u8>>,
    pub session_id: Option<SessionId>,
    pub cipher_suite: Option<CipherSuite>,
    pub epoch: u16,
}

impl EndpointContext {
    pub fn new(peer: SocketAddr) -> Self {
        EndpointContext {
            peer,
            server_name: None,
            handshake_mode: HandshakeMode::Auto,
            identity: None,
            session_id: None,
            cipher_suite: None,
            epoch: 0,
        }
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn with_handshake_mode(mut self, mode: HandshakeMode) -> Self {
        self.handshake_mode = mode;
        self
    }

    pub fn with_identity(mut self, identity: impl Into<Vec<u8>>) -> Self {
        self.identity = Some(identity.into());
        self
    }
}

impl fmt::Debug for EndpointContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointContext")
            .field("peer", &self.peer)
            .field("server_name", &self.server_name)
            .field("handshake_mode", &self.handshake_mode)
            .field(
                "identity",
                &self.identity.as_ref().map(|i| String::from_utf8_lossy(i)),
            )
            .field("session_id", &self.session_id)
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// Outcome notifications of an outbound message.
///
/// Exactly one of `on_sent` or `on_error` is called per message.
pub trait MessageCallback: Send + Sync {
    /// A handshake is started before the message can be sent.
    fn on_connecting(&self) {}

    /// The message will be sent in this context.
    fn on_context_established(&self, _context: &EndpointContext) {}

    fn on_sent(&self) {}

    fn on_error(&self, _error: &Error) {}
}

/// A datagram payload with its peer.
#[derive(Clone)]
pub struct RawData {
    pub bytes: Vec<u8>,
    pub peer: SocketAddr,
    pub context: EndpointContext,
    pub callback: Option<Arc<dyn MessageCallback>>,
}

impl RawData {
    /// Outbound message to `peer` in a default context.
    pub fn outbound(bytes: impl Into<Vec<u8>>, peer: SocketAddr) -> Self {
        RawData {
            bytes: bytes.into(),
            peer,
            context: EndpointContext::new(peer),
            callback: None,
        }
    }

    pub fn with_context(mut self, context: EndpointContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_callback(mut self, callback: Arc<dyn MessageCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub(crate) fn connecting(&self) {
        if let Some(cb) = &self.callback {
            cb.on_connecting();
        }
    }

    pub(crate) fn context_established(&self, context: &EndpointContext) {
        if let Some(cb) = &self.callback {
            cb.on_context_established(context);
        }
    }

    pub(crate) fn sent(&self) {
        if let Some(cb) = &self.callback {
            cb.on_sent();
        }
    }

    pub(crate) fn failed(&self, error: &Error) {
        if let Some(cb) = &self.callback {
            cb.on_error(error);
        }
    }
}

impl fmt::Debug for RawData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawData")
            .field("len", &self.bytes.len())
            .field("peer", &self.peer)
            .field("context", &self.context)
            .finish()
    }
}

/// Receives decrypted application data.
pub trait RawDataChannel: Send + Sync {
    fn receive_data(&self, data: RawData);
}

/// Notified of alerts received from peers.
pub trait AlertHandler: Send + Sync {
    fn on_alert(&self, peer: SocketAddr, alert: Alert);
}

/// Observes handshake lifecycle events.
pub trait SessionListener: Send + Sync {
    fn on_event(&self, peer: SocketAddr, event: &HandshakeEvent);
}

/// Decides whether a message may be sent in an existing connection's context.
pub trait EndpointContextMatcher: Send + Sync {
    fn is_to_be_sent(&self, message: &EndpointContext, connection: &EndpointContext) -> bool;
}

/// Requires the connection to use the identity and server name the message asks for.
#[derive(Debug, Default, Clone, Copy)]
pub struct StrictContextMatcher;

impl EndpointContextMatcher for StrictContextMatcher {
    fn is_to_be_sent(&self, message: &EndpointContext, connection: &EndpointContext) -> bool {
        let identity_ok = match &message.identity {
            Some(required) => connection.identity.as_ref() == Some(required),
            None => true,
        };
        let server_name_ok = match &message.server_name {
            Some(required) => connection.server_name.as_ref() == Some(required),
            None => true,
        };
        identity_ok && server_name_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:5684".parse().unwrap()
    }

    #[test]
    fn strict_matcher() {
        let mut connection = EndpointContext::new(peer());
        connection.identity = Some(b"client".to_vec());

        let any = EndpointContext::new(peer());
        assert!(StrictContextMatcher.is_to_be_sent(&any, &connection));

        let same = EndpointContext::new(peer()).with_identity("client");
        assert!(StrictContextMatcher.is_to_be_sent(&same, &connection));

        let other = EndpointContext::new(peer()).with_identity("other");
        assert!(!StrictContextMatcher.is_to_be_sent(&other, &connection));

        let named = EndpointContext::new(peer()).with_server_name("coap.local");
        assert!(!StrictContextMatcher.is_to_be_sent(&named, &connection));
    }
}
