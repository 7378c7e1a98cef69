//! Bounded registry of connections.
//!
//! Connections live in an arena of slots. Indexes by peer address,
//! connection id and session id point into it, and a use counter orders the
//! slots for least recently used eviction. One short lock guards all of it;
//! connection state itself is never touched under this lock.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::connection::{Connection, NO_SLOT};
use crate::message::{ConnectionId, SessionId};
use crate::rng::SeededRng;
use crate::session::SessionTicket;
use crate::{Config, Error};

/// External storage of session tickets.
///
/// Lets sessions be resumed after their connection was evicted, or shared
/// between connectors.
pub trait SessionCache: Send + Sync {
    fn put(&self, ticket: SessionTicket);

    fn get(&self, session_id: &SessionId) -> Option<SessionTicket>;

    fn remove(&self, session_id: &SessionId);
}

/// Session cache keeping the most recently added tickets in memory.
pub struct InMemorySessionCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    tickets: HashMap<SessionId, SessionTicket>,
    order: VecDeque<SessionId>,
}

impl InMemorySessionCache {
    pub fn new(capacity: usize) -> Self {
        InMemorySessionCache {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionCache for InMemorySessionCache {
    fn put(&self, ticket: SessionTicket) {
        let mut inner = self.inner.lock();
        let id = ticket.session_id;
        if inner.tickets.insert(id, ticket).is_some() {
            inner.order.retain(|x| *x != id);
        }
        inner.order.push_back(id);
        while inner.tickets.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.tickets.remove(&oldest);
        }
    }

    fn get(&self, session_id: &SessionId) -> Option<SessionTicket> {
        self.inner.lock().tickets.get(session_id).cloned()
    }

    fn remove(&self, session_id: &SessionId) {
        let mut inner = self.inner.lock();
        if inner.tickets.remove(session_id).is_some() {
            inner.order.retain(|x| x != session_id);
        }
    }
}

impl fmt::Debug for InMemorySessionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemorySessionCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

struct Entry {
    connection: Arc<Connection>,
    used: u64,
    /// Index keys this entry was filed under, possibly since taken over.
    address: SocketAddr,
    session: Option<SessionId>,
}

#[derive(Default)]
struct StoreInner {
    slots: Vec<Option<Entry>>,
    free: Vec<usize>,
    len: usize,
    /// Use counter to slot, oldest first.
    lru: BTreeMap<u64, usize>,
    next_use: u64,
    by_address: HashMap<SocketAddr, usize>,
    by_cid: HashMap<ConnectionId, usize>,
    by_session: HashMap<SessionId, usize>,
}

impl StoreInner {
    fn touch(&mut self, slot: usize) -> Option<Arc<Connection>> {
        let next_use = self.next_use;
        let entry = self.slots.get_mut(slot)?.as_mut()?;
        self.lru.remove(&entry.used);
        entry.used = next_use;
        self.lru.insert(next_use, slot);
        self.next_use += 1;
        Some(Arc::clone(&entry.connection))
    }

    fn entry(&self, slot: usize) -> Option<&Entry> {
        self.slots.get(slot)?.as_ref()
    }

    fn points_to(&self, slot: usize, connection: &Arc<Connection>) -> bool {
        self.entry(slot)
            .map(|e| Arc::ptr_eq(&e.connection, connection))
            .unwrap_or(false)
    }

    fn file_address(&mut self, slot: usize, peer: SocketAddr) {
        if let Some(entry) = self.slots.get_mut(slot).and_then(|e| e.as_mut()) {
            entry.address = peer;
            self.by_address.insert(peer, slot);
        }
    }

    fn remove_slot(&mut self, slot: usize) -> Option<Arc<Connection>> {
        let entry = self.slots.get_mut(slot)?.take()?;
        self.lru.remove(&entry.used);
        if self.by_address.get(&entry.address) == Some(&slot) {
            self.by_address.remove(&entry.address);
        }
        if let Some(id) = entry.session {
            if self.by_session.get(&id) == Some(&slot) {
                self.by_session.remove(&id);
            }
        }
        if let Some(cid) = entry.connection.cid() {
            self.by_cid.remove(cid);
        }
        self.free.push(slot);
        self.len -= 1;
        entry.connection.set_slot(NO_SLOT);
        Some(entry.connection)
    }

    /// Slot to evict to make room: the oldest stale connection, else the
    /// least recently used one that is not handshaking.
    fn eviction_candidate(&self, stale_threshold: Duration) -> Option<usize> {
        let stale = self.lru.values().copied().find(|slot| {
            self.entry(*slot)
                .map(|e| e.connection.is_stale(stale_threshold))
                .unwrap_or(false)
        });
        stale.or_else(|| {
            self.lru.values().copied().find(|slot| {
                self.entry(*slot)
                    .map(|e| !e.connection.is_handshaking())
                    .unwrap_or(false)
            })
        })
    }
}

/// Connections of a connector, with their indexes.
pub(crate) struct ConnectionStore {
    capacity: usize,
    stale_threshold: Duration,
    cid_len: Option<usize>,
    rng: SeededRng,
    cache: RwLock<Option<Arc<dyn SessionCache>>>,
    inner: Mutex<StoreInner>,
}

impl ConnectionStore {
    pub(crate) fn new(config: &Config) -> Self {
        ConnectionStore {
            capacity: config.max_connections(),
            stale_threshold: config.stale_connection_threshold(),
            cid_len: config.connection_id_length().filter(|l| *l > 0),
            rng: SeededRng::new(config.rng_seed().map(|s| s.wrapping_add(1))),
            cache: RwLock::new(None),
            inner: Mutex::new(StoreInner::default()),
        }
    }

    pub(crate) fn set_session_cache(&self, cache: Option<Arc<dyn SessionCache>>) {
        *self.cache.write() = cache;
    }

    pub(crate) fn get(&self, peer: SocketAddr) -> Option<Arc<Connection>> {
        let mut inner = self.inner.lock();
        let slot = *inner.by_address.get(&peer)?;
        inner.touch(slot)
    }

    pub(crate) fn get_by_cid(&self, cid: &ConnectionId) -> Option<Arc<Connection>> {
        let mut inner = self.inner.lock();
        let slot = *inner.by_cid.get(cid)?;
        inner.touch(slot)
    }

    /// Add a connection and make it the one for its peer address.
    ///
    /// Issues a connection id if configured. When full, a connection is
    /// evicted and returned so the caller can fail its pending work.
    pub(crate) fn put(&self, connection: &Arc<Connection>) -> Result<Option<Arc<Connection>>, Error> {
        let mut inner = self.inner.lock();
        if connection.slot() != NO_SLOT {
            return Ok(None);
        }

        let mut evicted = None;
        if inner.len >= self.capacity {
            let Some(slot) = inner.eviction_candidate(self.stale_threshold) else {
                warn!("Connection store full, all {} connections handshaking", inner.len);
                return Err(Error::StoreExhausted);
            };
            evicted = inner.remove_slot(slot);
            if let Some(e) = &evicted {
                debug!("Evicting connection to {}", e.peer());
            }
        }

        self.issue_cid(&inner, connection);

        let slot = match inner.free.pop() {
            Some(slot) => slot,
            None => {
                inner.slots.push(None);
                inner.slots.len() - 1
            }
        };
        let used = inner.next_use;
        inner.next_use += 1;
        inner.slots[slot] = Some(Entry {
            connection: Arc::clone(connection),
            used,
            address: connection.peer(),
            session: None,
        });
        inner.lru.insert(used, slot);
        inner.len += 1;
        inner.by_address.insert(connection.peer(), slot);
        if let Some(cid) = connection.cid() {
            inner.by_cid.insert(*cid, slot);
        }
        connection.set_slot(slot);

        Ok(evicted)
    }

    /// Issue the connection id before the connection is stored, e.g. to
    /// announce it in a handshake.
    pub(crate) fn assign_cid(&self, connection: &Connection) {
        let inner = self.inner.lock();
        self.issue_cid(&inner, connection);
    }

    fn issue_cid(&self, inner: &StoreInner, connection: &Connection) {
        let Some(len) = self.cid_len else {
            return;
        };
        if connection.cid().is_some() {
            return;
        }
        let cid = loop {
            let cid = ConnectionId::random(len, &self.rng);
            if !inner.by_cid.contains_key(&cid) {
                break cid;
            }
        };
        connection.set_cid(cid);
    }

    /// Move `connection` to a new peer address.
    pub(crate) fn update_address(&self, connection: &Arc<Connection>, peer: SocketAddr) {
        let mut inner = self.inner.lock();
        let slot = connection.slot();
        if !inner.points_to(slot, connection) {
            return;
        }
        let old = connection.peer();
        if inner.by_address.get(&old) == Some(&slot) {
            inner.by_address.remove(&old);
        }
        // A connection that had this address keeps only its cid.
        inner.file_address(slot, peer);
        connection.set_peer(peer);
        debug!("Connection moved from {} to {}", old, peer);
    }

    /// Make `connection` the one for its address again, e.g. when the
    /// connection meant to replace it failed.
    pub(crate) fn restore_address(&self, connection: &Arc<Connection>) {
        let mut inner = self.inner.lock();
        let slot = connection.slot();
        if inner.points_to(slot, connection) {
            inner.file_address(slot, connection.peer());
        }
    }

    /// Record the ticket of an established session for resumption.
    pub(crate) fn put_ticket(&self, connection: &Arc<Connection>, ticket: SessionTicket) {
        let id = ticket.session_id;
        connection.set_ticket(Some(ticket.clone()));
        {
            let mut inner = self.inner.lock();
            let slot = connection.slot();
            if let Some(entry) = inner.slots.get_mut(slot).and_then(|e| e.as_mut()) {
                if Arc::ptr_eq(&entry.connection, connection) {
                    let previous = entry.session.replace(id);
                    if let Some(previous) = previous {
                        if inner.by_session.get(&previous) == Some(&slot) {
                            inner.by_session.remove(&previous);
                        }
                    }
                    inner.by_session.insert(id, slot);
                }
            }
        }
        if let Some(cache) = self.cache.read().as_ref() {
            cache.put(ticket);
        }
    }

    /// Ticket to resume `session_id`, from a live connection or the cache.
    pub(crate) fn find_ticket(&self, session_id: &SessionId) -> Option<SessionTicket> {
        if session_id.is_empty() {
            return None;
        }
        let connection = {
            let inner = self.inner.lock();
            inner
                .by_session
                .get(session_id)
                .and_then(|slot| inner.entry(*slot))
                .map(|e| Arc::clone(&e.connection))
        };
        if let Some(ticket) = connection.and_then(|c| c.ticket()) {
            if ticket.session_id == *session_id {
                return Some(ticket);
            }
        }
        self.cache.read().as_ref().and_then(|c| c.get(session_id))
    }

    /// Forget a session, e.g. after a fatal alert.
    pub(crate) fn remove_ticket(&self, session_id: &SessionId) {
        self.inner.lock().by_session.remove(session_id);
        if let Some(cache) = self.cache.read().as_ref() {
            cache.remove(session_id);
        }
    }

    /// Remove `connection`. Returns false if it was not stored.
    pub(crate) fn remove(&self, connection: &Arc<Connection>) -> bool {
        let mut inner = self.inner.lock();
        let slot = connection.slot();
        if !inner.points_to(slot, connection) {
            return false;
        }
        inner.remove_slot(slot).is_some()
    }

    /// Remove and return every connection idle for longer than the stale threshold.
    pub(crate) fn evict_stale(&self) -> Vec<Arc<Connection>> {
        let mut inner = self.inner.lock();
        let stale: Vec<usize> = inner
            .lru
            .values()
            .copied()
            .filter(|slot| {
                inner
                    .entry(*slot)
                    .map(|e| e.connection.is_stale(self.stale_threshold))
                    .unwrap_or(false)
            })
            .collect();
        stale
            .into_iter()
            .filter_map(|slot| inner.remove_slot(slot))
            .collect()
    }

    pub(crate) fn mark_all_resumption_required(&self) {
        for connection in self.connections() {
            connection.set_resumption_required(true);
        }
    }

    /// All stored connections, least recently used first.
    pub(crate) fn connections(&self) -> Vec<Arc<Connection>> {
        let inner = self.inner.lock();
        inner
            .lru
            .values()
            .filter_map(|slot| inner.entry(*slot))
            .map(|e| Arc::clone(&e.connection))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub(crate) fn clear(&self) {
        let mut inner = self.inner.lock();
        for entry in inner.slots.iter().flatten() {
            entry.connection.set_slot(NO_SLOT);
        }
        *inner = StoreInner::default();
    }
}

impl fmt::Debug for ConnectionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStore")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::crypto::{CipherSuite, StaticPskStore};
    use crate::executor::WorkerPool;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn store(max: usize, cid_len: Option<usize>) -> ConnectionStore {
        let config = Config::builder()
            .psk_store(Arc::new(StaticPskStore::new()))
            .max_connections(max)
            .connection_id_length(cid_len)
            .rng_seed(3)
            .build()
            .unwrap();
        ConnectionStore::new(&config)
    }

    fn ticket(id: u8) -> SessionTicket {
        SessionTicket {
            session_id: SessionId::try_new(&[id; 32]).unwrap(),
            cipher_suite: CipherSuite::PskAes128GcmSha256,
            master_secret: crate::crypto::MasterSecret::new(vec![id; 48]),
            identity: b"client".to_vec(),
            server_name: None,
            created: Instant::now(),
        }
    }

    #[test]
    fn lookup_by_address_and_cid() {
        let pool = WorkerPool::new("store-test", 1).unwrap();
        let store = store(10, Some(4));
        let a = Connection::new(addr(1), &pool);
        let b = Connection::new(addr(2), &pool);
        store.put(&a).unwrap();
        store.put(&b).unwrap();

        let cid_a = *a.cid().unwrap();
        assert_eq!(cid_a.len(), 4);
        assert_ne!(Some(&cid_a), b.cid());
        assert!(Arc::ptr_eq(&store.get(addr(1)).unwrap(), &a));
        assert!(Arc::ptr_eq(&store.get_by_cid(&cid_a).unwrap(), &a));
        assert!(store.get(addr(3)).is_none());

        store.update_address(&a, addr(3));
        assert!(store.get(addr(1)).is_none());
        assert!(Arc::ptr_eq(&store.get(addr(3)).unwrap(), &a));

        assert!(store.remove(&a));
        assert!(!store.remove(&a));
        assert!(store.get_by_cid(&cid_a).is_none());
        assert_eq!(store.len(), 1);
        pool.shutdown();
    }

    #[test]
    fn evicts_least_recently_used() {
        let pool = WorkerPool::new("store-test", 1).unwrap();
        let store = store(2, None);
        let a = Connection::new(addr(1), &pool);
        let b = Connection::new(addr(2), &pool);
        let c = Connection::new(addr(3), &pool);
        store.put(&a).unwrap();
        store.put(&b).unwrap();
        // a is now used more recently than b.
        store.get(addr(1)).unwrap();

        let evicted = store.put(&c).unwrap().unwrap();
        assert!(Arc::ptr_eq(&evicted, &b));
        assert!(store.get(addr(2)).is_none());
        assert_eq!(store.len(), 2);
        pool.shutdown();
    }

    #[test]
    fn handshaking_connections_are_not_evicted() {
        let pool = WorkerPool::new("store-test", 1).unwrap();
        let store = store(2, None);
        let a = Connection::new(addr(1), &pool);
        let b = Connection::new(addr(2), &pool);
        a.set_handshaking(true);
        store.put(&a).unwrap();
        store.put(&b).unwrap();

        let c = Connection::new(addr(3), &pool);
        let evicted = store.put(&c).unwrap().unwrap();
        assert!(Arc::ptr_eq(&evicted, &b));

        c.set_handshaking(true);
        let d = Connection::new(addr(4), &pool);
        assert!(matches!(store.put(&d), Err(Error::StoreExhausted)));
        pool.shutdown();
    }

    #[test]
    fn tickets_survive_eviction_in_cache() {
        let pool = WorkerPool::new("store-test", 1).unwrap();
        let store = store(1, None);
        let cache = Arc::new(InMemorySessionCache::new(10));
        store.set_session_cache(Some(cache.clone()));

        let a = Connection::new(addr(1), &pool);
        store.put(&a).unwrap();
        let t = ticket(7);
        store.put_ticket(&a, t.clone());
        assert!(store.find_ticket(&t.session_id).is_some());

        let b = Connection::new(addr(2), &pool);
        store.put(&b).unwrap();
        assert_eq!(cache.len(), 1);
        let found = store.find_ticket(&t.session_id).unwrap();
        assert_eq!(found.master_secret, t.master_secret);

        store.remove_ticket(&t.session_id);
        assert!(store.find_ticket(&t.session_id).is_none());
        assert!(store.find_ticket(&SessionId::empty()).is_none());
        pool.shutdown();
    }

    #[test]
    fn removal_leaves_keys_taken_over_by_others() {
        let pool = WorkerPool::new("store-test", 1).unwrap();
        let store = store(10, None);
        let a = Connection::new(addr(1), &pool);
        let b = Connection::new(addr(2), &pool);
        store.put(&a).unwrap();
        store.put(&b).unwrap();
        let t = ticket(4);
        store.put_ticket(&a, t.clone());
        store.put_ticket(&b, t.clone());

        // b takes over the address and the session of a.
        store.update_address(&b, addr(1));
        assert!(store.remove(&a));
        assert!(Arc::ptr_eq(&store.get(addr(1)).unwrap(), &b));
        assert!(store.find_ticket(&t.session_id).is_some());

        store.put_ticket(&b, ticket(5));
        assert!(store.find_ticket(&t.session_id).is_none());
        assert!(store.remove(&b));
        assert!(store.get(addr(1)).is_none());
        assert!(store.find_ticket(&ticket(5).session_id).is_none());
        pool.shutdown();
    }

    #[test]
    fn cache_is_bounded() {
        let cache = InMemorySessionCache::new(2);
        cache.put(ticket(1));
        cache.put(ticket(2));
        cache.put(ticket(3));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&ticket(1).session_id).is_none());
        assert!(cache.get(&ticket(3).session_id).is_some());
    }

    #[test]
    fn stale_connections_go_first() {
        let pool = WorkerPool::new("store-test", 1).unwrap();
        let config = Config::builder()
            .psk_store(Arc::new(StaticPskStore::new()))
            .max_connections(2)
            .stale_connection_threshold(Duration::from_millis(20))
            .build()
            .unwrap();
        let store = ConnectionStore::new(&config);
        let a = Connection::new(addr(1), &pool);
        let b = Connection::new(addr(2), &pool);
        store.put(&a).unwrap();
        store.put(&b).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        a.touch();

        let stale = store.evict_stale();
        assert_eq!(stale.len(), 1);
        assert!(Arc::ptr_eq(&stale[0], &b));
        assert_eq!(store.len(), 1);
        pool.shutdown();
    }
}
