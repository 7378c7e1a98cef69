//! Lifecycle events of a handshake.
//!
//! Handshakers queue events while processing; the connector drains and
//! dispatches them to the [`SessionListener`](crate::SessionListener) inside the
//! connection's serial task, so listeners never observe two events of one
//! connection at the same time.

use crate::message::SessionId;
use crate::Error;

/// Events reported for every handshake.
#[derive(Debug, Clone)]
pub enum HandshakeEvent {
    /// The new session is usable for application data.
    ///
    /// The handshake may still be ongoing, e.g. to resend the final flight.
    Established {
        session_id: SessionId,
        /// Whether this was an abbreviated handshake.
        resumed: bool,
    },
    /// Nothing more to do for this handshake.
    Completed,
    /// The handshake was abandoned.
    Failed(Error),
}

impl HandshakeEvent {
    pub fn is_established(&self) -> bool {
        matches!(self, HandshakeEvent::Established { .. })
    }
}
