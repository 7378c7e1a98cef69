use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use zeroize::Zeroizing;

/// Source of pre-shared keys.
///
/// The server looks keys up by the identity the client presents; the client
/// picks the identity to present for a peer.
pub trait PskStore: Send + Sync {
    /// Key for `identity`, as presented by a client.
    fn key(&self, identity: &[u8], server_name: Option<&str>) -> Option<Zeroizing<Vec<u8>>>;

    /// Identity and key to use when connecting to `peer`.
    fn identity(
        &self,
        peer: SocketAddr,
        server_name: Option<&str>,
    ) -> Option<(Vec<u8>, Zeroizing<Vec<u8>>)>;
}

/// In-memory PSK table.
#[derive(Default)]
pub struct StaticPskStore {
    keys: HashMap<Vec<u8>, Zeroizing<Vec<u8>>>,
    client_identity: Option<Vec<u8>>,
}

impl StaticPskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key a client may authenticate with.
    pub fn with_key(mut self, identity: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        self.keys
            .insert(identity.into(), Zeroizing::new(key.into()));
        self
    }

    /// Identity to present when acting as client. Must have a key added.
    pub fn with_client_identity(mut self, identity: impl Into<Vec<u8>>) -> Self {
        self.client_identity = Some(identity.into());
        self
    }
}

impl PskStore for StaticPskStore {
    fn key(&self, identity: &[u8], _server_name: Option<&str>) -> Option<Zeroizing<Vec<u8>>> {
        self.keys.get(identity).cloned()
    }

    fn identity(
        &self,
        _peer: SocketAddr,
        _server_name: Option<&str>,
    ) -> Option<(Vec<u8>, Zeroizing<Vec<u8>>)> {
        let identity = self.client_identity.as_ref()?;
        let key = self.keys.get(identity)?;
        Some((identity.clone(), key.clone()))
    }
}

impl fmt::Debug for StaticPskStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticPskStore")
            .field("keys", &self.keys.len())
            .field("client_identity", &self.client_identity)
            .finish()
    }
}
