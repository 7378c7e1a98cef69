//! Walking the connections of a connector.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::vec;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;

use super::Inner;
use crate::connection::{Connection, ConnectionState};

/// Visitor of a single connection. Returns true to end the walk.
pub(crate) type ConnectionVisitor =
    Box<dyn FnMut(&Arc<Inner>, &Arc<Connection>, &mut ConnectionState) -> bool + Send>;

/// Progress of a walk over the connections of a connector.
///
/// Connections are visited one after the other, each on its own serial
/// executor. A panicking visitor ends the walk.
#[derive(Debug)]
pub struct ForEach {
    stopped: Arc<AtomicBool>,
    done: Receiver<()>,
}

impl ForEach {
    /// Skip the connections not visited yet.
    pub fn cancel(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        matches!(self.done.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Block until the walk ended. Returns false on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        !matches!(self.done.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }
}

struct Walk {
    connections: Mutex<vec::IntoIter<Arc<Connection>>>,
    visitor: Mutex<ConnectionVisitor>,
    stopped: Arc<AtomicBool>,
    /// Dropped with the walk, which disconnects [`ForEach::done`].
    _done: Sender<()>,
}

impl Inner {
    /// Visit the stored connections, least recently used first.
    pub(super) fn for_each(self: &Arc<Self>, visitor: ConnectionVisitor) -> ForEach {
        let (done, finished) = bounded(0);
        let stopped = Arc::new(AtomicBool::new(false));
        let walk = Arc::new(Walk {
            connections: Mutex::new(self.store.connections().into_iter()),
            visitor: Mutex::new(visitor),
            stopped: Arc::clone(&stopped),
            _done: done,
        });
        self.walk_next(walk);
        ForEach {
            stopped,
            done: finished,
        }
    }

    fn walk_next(self: &Arc<Self>, walk: Arc<Walk>) {
        loop {
            if walk.stopped.load(Ordering::Acquire) {
                return;
            }
            let Some(connection) = walk.connections.lock().next() else {
                return;
            };
            let inner = Arc::clone(self);
            let target = Arc::clone(&connection);
            let next = Arc::clone(&walk);
            let task = Box::new(move || {
                inner.visit(&next, &target);
                inner.walk_next(next);
            });
            if self.execute_on(&connection, task).is_ok() {
                return;
            }
            // No executor left, e.g. after stop.
            self.visit(&walk, &connection);
        }
    }

    fn visit(self: &Arc<Self>, walk: &Walk, connection: &Arc<Connection>) {
        let mut state = connection.lock();
        if state.closed {
            return;
        }
        let mut visitor = walk.visitor.lock();
        if (*visitor)(self, connection, &mut *state) {
            walk.stopped.store(true, Ordering::Release);
        }
    }
}
