//! Per peer connection state.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::api::{EndpointContext, RawData};
use crate::executor::{SerialExecutor, Task, WorkerPool};
use crate::handshake::Handshaker;
use crate::message::{ConnectionId, Random};
use crate::session::{DtlsSession, SessionTicket};
use crate::timer::TimerHandle;
use crate::types::Sequence;
use crate::Error;

/// Slot value of a connection that is not in a store.
pub(crate) const NO_SLOT: usize = usize::MAX;

/// State only touched from tasks of the connection's serial executor.
#[derive(Default)]
pub(crate) struct ConnectionState {
    /// Established session, if any.
    pub(crate) session: Option<DtlsSession>,
    /// Ongoing handshake. May coexist with an established session while a
    /// new one is negotiated or our final flight is not yet acknowledged.
    pub(crate) handshaker: Option<Handshaker>,
    /// Retransmission timer and the number of the flight it belongs to.
    pub(crate) retransmit: Option<(u8, TimerHandle)>,
    /// Timer ending a handshake whose final flight was sent.
    pub(crate) completion: Option<TimerHandle>,
    /// Counted against the unverified resumption limit.
    pub(crate) pending_unverified: bool,
    /// Connection this one takes over from once established.
    pub(crate) replaces: Option<Arc<Connection>>,
    /// Newest application record seen, for address updates.
    pub(crate) newest_read: Option<Sequence>,
    pub(crate) closed: bool,
}

impl ConnectionState {
    /// Whether a handshake is running and has no usable session yet.
    pub(crate) fn is_handshaking(&self) -> bool {
        self.handshaker
            .as_ref()
            .map(|h| !h.ctx().is_established())
            .unwrap_or(false)
    }

    pub(crate) fn cancel_timers(&mut self) {
        if let Some((_, timer)) = self.retransmit.take() {
            timer.cancel();
        }
        if let Some(timer) = self.completion.take() {
            timer.cancel();
        }
    }

    /// Drain the messages deferred by the ongoing handshake.
    pub(crate) fn take_deferred_messages(&mut self) -> Vec<RawData> {
        match self.handshaker.as_mut() {
            Some(hs) => hs.ctx_mut().deferred_messages.drain(..).collect(),
            None => Vec::new(),
        }
    }

    /// Security context of the established session.
    pub(crate) fn endpoint_context(&self, peer: SocketAddr) -> Option<EndpointContext> {
        let session = self.session.as_ref()?;
        let mut context = EndpointContext::new(peer);
        context.server_name = session.server_name().map(str::to_string);
        context.identity = Some(session.identity().to_vec());
        context.session_id = Some(session.session_id());
        context.cipher_suite = Some(session.cipher_suite());
        context.epoch = session.read_epoch();
        Some(context)
    }
}

/// A peer and everything this side knows about it.
///
/// The fields outside `state` are read by receiver threads and the store
/// without going through the serial executor.
pub(crate) struct Connection {
    peer: RwLock<SocketAddr>,
    cid: OnceCell<ConnectionId>,
    executor: RwLock<SerialExecutor>,
    /// Position in the store, [`NO_SLOT`] when not stored.
    slot: AtomicUsize,
    handshaking: AtomicBool,
    resumption_required: AtomicBool,
    /// Random of the CLIENT_HELLO that started the server handshake.
    started_by: Mutex<Option<Random>>,
    /// Ticket of the established session, kept for resumption lookups.
    ticket: Mutex<Option<SessionTicket>>,
    last_activity: Mutex<Instant>,
    state: Mutex<ConnectionState>,
}

impl Connection {
    pub(crate) fn new(peer: SocketAddr, pool: &Arc<WorkerPool>) -> Arc<Connection> {
        Arc::new(Connection {
            peer: RwLock::new(peer),
            cid: OnceCell::new(),
            executor: RwLock::new(SerialExecutor::new(Arc::clone(pool))),
            slot: AtomicUsize::new(NO_SLOT),
            handshaking: AtomicBool::new(false),
            resumption_required: AtomicBool::new(false),
            started_by: Mutex::new(None),
            ticket: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            state: Mutex::new(ConnectionState::default()),
        })
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        *self.peer.read()
    }

    pub(crate) fn set_peer(&self, peer: SocketAddr) {
        *self.peer.write() = peer;
    }

    pub(crate) fn cid(&self) -> Option<&ConnectionId> {
        self.cid.get()
    }

    /// Assign the connection id. It never changes afterwards.
    pub(crate) fn set_cid(&self, cid: ConnectionId) -> bool {
        self.cid.set(cid).is_ok()
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot.load(Ordering::Acquire)
    }

    pub(crate) fn set_slot(&self, slot: usize) {
        self.slot.store(slot, Ordering::Release);
    }

    /// Handshaking connections are protected from eviction.
    pub(crate) fn is_handshaking(&self) -> bool {
        self.handshaking.load(Ordering::Acquire)
    }

    pub(crate) fn set_handshaking(&self, handshaking: bool) {
        self.handshaking.store(handshaking, Ordering::Release);
    }

    pub(crate) fn is_resumption_required(&self) -> bool {
        self.resumption_required.load(Ordering::Acquire)
    }

    pub(crate) fn set_resumption_required(&self, required: bool) {
        self.resumption_required.store(required, Ordering::Release);
    }

    pub(crate) fn started_by(&self) -> Option<Random> {
        *self.started_by.lock()
    }

    pub(crate) fn set_started_by(&self, random: Option<Random>) {
        *self.started_by.lock() = random;
    }

    pub(crate) fn ticket(&self) -> Option<SessionTicket> {
        self.ticket.lock().clone()
    }

    pub(crate) fn set_ticket(&self, ticket: Option<SessionTicket>) {
        *self.ticket.lock() = ticket;
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Whether nothing happened on this connection for `threshold`.
    pub(crate) fn is_stale(&self, threshold: Duration) -> bool {
        self.idle_for() >= threshold
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock()
    }

    /// Queue `task` behind all earlier tasks of this connection.
    pub(crate) fn execute(&self, task: Task) -> Result<(), Error> {
        self.executor.read().execute(task)
    }

    /// Stop the executor and return the tasks that did not run yet.
    pub(crate) fn shutdown_executor(&self) -> Vec<Task> {
        self.executor.read().shutdown_now()
    }

    /// Run further tasks on `pool`, e.g. after a restart.
    pub(crate) fn replace_executor(&self, pool: &Arc<WorkerPool>) {
        *self.executor.write() = SerialExecutor::new(Arc::clone(pool));
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer())
            .field("cid", &self.cid())
            .field("handshaking", &self.is_handshaking())
            .field("resumption_required", &self.is_resumption_required())
            .finish_non_exhaustive()
    }
}
