use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::crypto::{CipherSuite, PskStore};
use crate::window::ReplayFilter;
use crate::Error;

/// IPv6 (40) + UDP (8) header bytes subtracted from the MTU.
const IP_UDP_OVERHEAD: usize = 48;

/// Connector configuration
#[derive(Clone)]
pub struct Config {
    address: SocketAddr,
    max_connections: usize,
    stale_connection_threshold: Duration,
    max_retransmissions: u32,
    retransmission_timeout: Duration,
    max_retransmission_timeout: Duration,
    early_stop_retransmission: bool,
    server_only: bool,
    replay_filter: ReplayFilter,
    connection_id_length: Option<usize>,
    verify_peers_on_resumption_threshold: u8,
    outbound_message_buffer_size: usize,
    auto_resumption_timeout: Option<Duration>,
    mtu: usize,
    max_datagram_size: Option<usize>,
    receiver_threads: usize,
    connection_threads: usize,
    psk_store: Arc<dyn PskStore>,
    cipher_suites: Vec<CipherSuite>,
    server_name: Option<String>,
    use_server_session_id: bool,
    max_deferred_records: usize,
    max_deferred_messages: usize,
    receive_buffer_size: usize,
    rng_seed: Option<u64>,
}

impl Config {
    /// Create a new configuration builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            address: SocketAddr::from(([0, 0, 0, 0], 0)),
            max_connections: 150_000,
            stale_connection_threshold: Duration::from_secs(30 * 60),
            max_retransmissions: 4,
            retransmission_timeout: Duration::from_secs(1),
            max_retransmission_timeout: Duration::from_secs(60),
            early_stop_retransmission: true,
            server_only: false,
            replay_filter: ReplayFilter::Strict,
            connection_id_length: None,
            verify_peers_on_resumption_threshold: 30,
            outbound_message_buffer_size: 100_000,
            auto_resumption_timeout: None,
            mtu: 1280,
            max_datagram_size: None,
            receiver_threads: 1,
            connection_threads: 4,
            psk_store: None,
            cipher_suites: CipherSuite::all().to_vec(),
            server_name: None,
            use_server_session_id: true,
            max_deferred_records: 16,
            max_deferred_messages: 10,
            receive_buffer_size: 16_896,
            rng_seed: None,
        }
    }

    /// Address bound by [`DtlsConnector::start`](crate::DtlsConnector::start).
    #[inline(always)]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Max number of connections held by the connection store.
    #[inline(always)]
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Inactivity after which a connection is considered stale and may be removed.
    #[inline(always)]
    pub fn stale_connection_threshold(&self) -> Duration {
        self.stale_connection_threshold
    }

    /// Max number of times a flight is retransmitted before the handshake fails.
    #[inline(always)]
    pub fn max_retransmissions(&self) -> u32 {
        self.max_retransmissions
    }

    /// Timeout before the first retransmission of a flight.
    ///
    /// Doubled for every further retransmission.
    #[inline(always)]
    pub fn retransmission_timeout(&self) -> Duration {
        self.retransmission_timeout
    }

    /// Upper bound of the doubled retransmission timeout.
    #[inline(always)]
    pub fn max_retransmission_timeout(&self) -> Duration {
        self.max_retransmission_timeout
    }

    /// Stop retransmitting a flight once the peer's response started to arrive.
    #[inline(always)]
    pub fn early_stop_retransmission(&self) -> bool {
        self.early_stop_retransmission
    }

    /// Never initiate handshakes, only respond to them.
    #[inline(always)]
    pub fn server_only(&self) -> bool {
        self.server_only
    }

    /// Anti-replay filtering of received records.
    #[inline(always)]
    pub fn replay_filter(&self) -> ReplayFilter {
        self.replay_filter
    }

    /// Length of the connection ids this side asks peers to use.
    ///
    /// `None` disables the connection id extension. `Some(0)` supports sending
    /// records with the peer's connection id without asking for one.
    #[inline(always)]
    pub fn connection_id_length(&self) -> Option<usize> {
        self.connection_id_length
    }

    /// Percentage of `max_connections` that may be resuming without a
    /// HelloVerifyRequest round trip at the same time.
    #[inline(always)]
    pub fn verify_peers_on_resumption_threshold(&self) -> u8 {
        self.verify_peers_on_resumption_threshold
    }

    /// Absolute number of concurrent unverified resumptions allowed.
    pub fn resumption_verification_limit(&self) -> usize {
        let percent = self.verify_peers_on_resumption_threshold as usize;
        if percent == 0 {
            return 0;
        }
        (self.max_connections.saturating_mul(percent).saturating_add(50) / 100).max(1)
    }

    /// Max number of outbound messages accepted but not yet sent.
    #[inline(always)]
    pub fn outbound_message_buffer_size(&self) -> usize {
        self.outbound_message_buffer_size
    }

    /// Idle time after which the next send starts an abbreviated handshake.
    #[inline(always)]
    pub fn auto_resumption_timeout(&self) -> Option<Duration> {
        self.auto_resumption_timeout
    }

    /// Max transmission unit.
    #[inline(always)]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Largest UDP payload we produce.
    ///
    /// Derived from the MTU unless set explicitly.
    pub fn max_datagram_size(&self) -> usize {
        self.max_datagram_size
            .unwrap_or_else(|| self.mtu.saturating_sub(IP_UDP_OVERHEAD))
    }

    /// Number of threads receiving from the socket.
    #[inline(always)]
    pub fn receiver_threads(&self) -> usize {
        self.receiver_threads
    }

    /// Number of worker threads processing connections.
    #[inline(always)]
    pub fn connection_threads(&self) -> usize {
        self.connection_threads
    }

    /// Source of pre-shared keys.
    #[inline(always)]
    pub fn psk_store(&self) -> &Arc<dyn PskStore> {
        &self.psk_store
    }

    /// Cipher suites offered and accepted, in order of preference.
    #[inline(always)]
    pub fn cipher_suites(&self) -> &[CipherSuite] {
        &self.cipher_suites
    }

    /// Server name indicated when connecting, unless the message says otherwise.
    #[inline(always)]
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// For a server, issue session ids so that clients can resume.
    #[inline(always)]
    pub fn use_server_session_id(&self) -> bool {
        self.use_server_session_id
    }

    /// Max records of the next epoch buffered during a handshake.
    #[inline(always)]
    pub fn max_deferred_records(&self) -> usize {
        self.max_deferred_records
    }

    /// Max outbound messages held back while a handshake is in progress.
    #[inline(always)]
    pub fn max_deferred_messages(&self) -> usize {
        self.max_deferred_messages
    }

    /// Size of the buffer a receiver reads one datagram into.
    #[inline(always)]
    pub fn receive_buffer_size(&self) -> usize {
        self.receive_buffer_size
    }

    /// Seed for the random number generator, for deterministic tests.
    ///
    /// Only affects identifiers. Key material always comes from the OS.
    #[inline(always)]
    pub fn rng_seed(&self) -> Option<u64> {
        self.rng_seed
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("address", &self.address)
            .field("max_connections", &self.max_connections)
            .field("max_retransmissions", &self.max_retransmissions)
            .field("retransmission_timeout", &self.retransmission_timeout)
            .field("server_only", &self.server_only)
            .field("replay_filter", &self.replay_filter)
            .field("connection_id_length", &self.connection_id_length)
            .field("mtu", &self.mtu)
            .field("cipher_suites", &self.cipher_suites)
            .finish_non_exhaustive()
    }
}

/// Builder for connector configuration.
pub struct ConfigBuilder {
    address: SocketAddr,
    max_connections: usize,
    stale_connection_threshold: Duration,
    max_retransmissions: u32,
    retransmission_timeout: Duration,
    max_retransmission_timeout: Duration,
    early_stop_retransmission: bool,
    server_only: bool,
    replay_filter: ReplayFilter,
    connection_id_length: Option<usize>,
    verify_peers_on_resumption_threshold: u8,
    outbound_message_buffer_size: usize,
    auto_resumption_timeout: Option<Duration>,
    mtu: usize,
    max_datagram_size: Option<usize>,
    receiver_threads: usize,
    connection_threads: usize,
    psk_store: Option<Arc<dyn PskStore>>,
    cipher_suites: Vec<CipherSuite>,
    server_name: Option<String>,
    use_server_session_id: bool,
    max_deferred_records: usize,
    max_deferred_messages: usize,
    receive_buffer_size: usize,
    rng_seed: Option<u64>,
}

impl ConfigBuilder {
    /// Set the address to bind.
    ///
    /// Defaults to `0.0.0.0:0`.
    pub fn address(mut self, address: SocketAddr) -> Self {
        self.address = address;
        self
    }

    /// Set the max number of connections.
    ///
    /// Defaults to 150000.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the inactivity after which a connection is stale.
    ///
    /// Defaults to 30 minutes.
    pub fn stale_connection_threshold(mut self, threshold: Duration) -> Self {
        self.stale_connection_threshold = threshold;
        self
    }

    /// Set the max number of retransmissions per flight.
    ///
    /// Defaults to 4.
    pub fn max_retransmissions(mut self, retransmissions: u32) -> Self {
        self.max_retransmissions = retransmissions;
        self
    }

    /// Set the timeout before the first retransmission.
    ///
    /// Defaults to 1 second.
    pub fn retransmission_timeout(mut self, timeout: Duration) -> Self {
        self.retransmission_timeout = timeout;
        self
    }

    /// Set the upper bound of the retransmission timeout.
    ///
    /// Defaults to 60 seconds.
    pub fn max_retransmission_timeout(mut self, timeout: Duration) -> Self {
        self.max_retransmission_timeout = timeout;
        self
    }

    /// Set whether to stop retransmitting once the peer's response started.
    ///
    /// Defaults to true.
    pub fn early_stop_retransmission(mut self, early_stop: bool) -> Self {
        self.early_stop_retransmission = early_stop;
        self
    }

    /// Set whether this connector only acts as server.
    ///
    /// Defaults to false.
    pub fn server_only(mut self, server_only: bool) -> Self {
        self.server_only = server_only;
        self
    }

    /// Set the anti-replay filter.
    ///
    /// Defaults to [`ReplayFilter::Strict`].
    pub fn replay_filter(mut self, filter: ReplayFilter) -> Self {
        self.replay_filter = filter;
        self
    }

    /// Set the length of locally issued connection ids, `None` to disable.
    ///
    /// Defaults to `None`.
    pub fn connection_id_length(mut self, length: Option<usize>) -> Self {
        self.connection_id_length = length;
        self
    }

    /// Set the percentage of max connections allowed to resume unverified.
    ///
    /// 0 always verifies the peer. Defaults to 30.
    pub fn verify_peers_on_resumption_threshold(mut self, percent: u8) -> Self {
        self.verify_peers_on_resumption_threshold = percent;
        self
    }

    /// Set the max number of outbound messages in flight.
    ///
    /// Defaults to 100000.
    pub fn outbound_message_buffer_size(mut self, size: usize) -> Self {
        self.outbound_message_buffer_size = size;
        self
    }

    /// Set the idle time after which sending resumes the session first.
    ///
    /// Defaults to `None`, never.
    pub fn auto_resumption_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.auto_resumption_timeout = timeout;
        self
    }

    /// Set the max transmission unit (MTU).
    ///
    /// Defaults to 1280.
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set the largest UDP payload to produce.
    ///
    /// Defaults to the MTU minus IPv6 and UDP headers.
    pub fn max_datagram_size(mut self, size: usize) -> Self {
        self.max_datagram_size = Some(size);
        self
    }

    /// Set the number of receiver threads.
    ///
    /// Defaults to 1.
    pub fn receiver_threads(mut self, threads: usize) -> Self {
        self.receiver_threads = threads;
        self
    }

    /// Set the number of connection worker threads.
    ///
    /// Defaults to 4.
    pub fn connection_threads(mut self, threads: usize) -> Self {
        self.connection_threads = threads;
        self
    }

    /// Set the source of pre-shared keys. Required.
    pub fn psk_store(mut self, store: Arc<dyn PskStore>) -> Self {
        self.psk_store = Some(store);
        self
    }

    /// Set the cipher suites, in order of preference.
    ///
    /// Defaults to every supported suite.
    pub fn cipher_suites(mut self, suites: &[CipherSuite]) -> Self {
        self.cipher_suites = suites.to_vec();
        self
    }

    /// Set the server name to indicate when connecting.
    ///
    /// Defaults to `None`.
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Set whether a server issues session ids.
    ///
    /// Defaults to true.
    pub fn use_server_session_id(mut self, use_session_id: bool) -> Self {
        self.use_server_session_id = use_session_id;
        self
    }

    /// Set the max records of the next epoch buffered during a handshake.
    ///
    /// Defaults to 16.
    pub fn max_deferred_records(mut self, max: usize) -> Self {
        self.max_deferred_records = max;
        self
    }

    /// Set the max outbound messages held back during a handshake.
    ///
    /// Defaults to 10.
    pub fn max_deferred_messages(mut self, max: usize) -> Self {
        self.max_deferred_messages = max;
        self
    }

    /// Set the receive buffer size.
    ///
    /// Defaults to 16896.
    pub fn receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self
    }

    /// Set the rng seed.
    ///
    /// Defaults to `None`.
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Build the configuration.
    ///
    /// Returns `Error::ConfigError` if a value is out of range or the PSK store is missing.
    pub fn build(self) -> Result<Config, Error> {
        let Some(psk_store) = self.psk_store else {
            return Err(Error::ConfigError("A PSK store is required".into()));
        };
        if self.max_connections == 0 {
            return Err(Error::ConfigError("max_connections must be > 0".into()));
        }
        if self.stale_connection_threshold.is_zero() {
            return Err(Error::ConfigError(
                "stale_connection_threshold must be > 0".into(),
            ));
        }
        if self.mtu <= IP_UDP_OVERHEAD {
            return Err(Error::ConfigError(format!(
                "MTU {} does not exceed the IP/UDP overhead of {}",
                self.mtu, IP_UDP_OVERHEAD
            )));
        }
        if self.verify_peers_on_resumption_threshold > 100 {
            return Err(Error::ConfigError(format!(
                "Resumption threshold {}% above 100%",
                self.verify_peers_on_resumption_threshold
            )));
        }
        if self.retransmission_timeout.is_zero()
            || self.retransmission_timeout > self.max_retransmission_timeout
        {
            return Err(Error::ConfigError(format!(
                "Retransmission timeout {:?} must be > 0 and <= {:?}",
                self.retransmission_timeout, self.max_retransmission_timeout
            )));
        }
        if let Some(len) = self.connection_id_length {
            if len > crate::message::ConnectionId::MAX_LEN {
                return Err(Error::ConfigError(format!(
                    "Connection id length {} too large",
                    len
                )));
            }
        }
        if self.cipher_suites.is_empty() || self.cipher_suites.iter().any(|s| !s.is_supported()) {
            return Err(Error::ConfigError(format!(
                "Unsupported cipher suites: {:?}",
                self.cipher_suites
            )));
        }
        if self.receiver_threads == 0 || self.connection_threads == 0 {
            return Err(Error::ConfigError("Thread counts must be > 0".into()));
        }
        if self.outbound_message_buffer_size == 0 {
            return Err(Error::ConfigError(
                "outbound_message_buffer_size must be > 0".into(),
            ));
        }

        let config = Config {
            address: self.address,
            max_connections: self.max_connections,
            stale_connection_threshold: self.stale_connection_threshold,
            max_retransmissions: self.max_retransmissions,
            retransmission_timeout: self.retransmission_timeout,
            max_retransmission_timeout: self.max_retransmission_timeout,
            early_stop_retransmission: self.early_stop_retransmission,
            server_only: self.server_only,
            replay_filter: self.replay_filter,
            connection_id_length: self.connection_id_length,
            verify_peers_on_resumption_threshold: self.verify_peers_on_resumption_threshold,
            outbound_message_buffer_size: self.outbound_message_buffer_size,
            auto_resumption_timeout: self.auto_resumption_timeout,
            mtu: self.mtu,
            max_datagram_size: self.max_datagram_size,
            receiver_threads: self.receiver_threads,
            connection_threads: self.connection_threads,
            psk_store,
            cipher_suites: self.cipher_suites,
            server_name: self.server_name,
            use_server_session_id: self.use_server_session_id,
            max_deferred_records: self.max_deferred_records,
            max_deferred_messages: self.max_deferred_messages,
            receive_buffer_size: self.receive_buffer_size,
            rng_seed: self.rng_seed,
        };

        // A datagram must at least hold a record and handshake header with some payload.
        if config.max_datagram_size() < 128 {
            return Err(Error::ConfigError(format!(
                "Max datagram size {} too small",
                config.max_datagram_size()
            )));
        }

        Ok(config)
    }
}
