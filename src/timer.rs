//! Retransmission backoff and the timer service.
//!
//! The timer thread never touches connection state. Its tasks only hand work
//! over to a connection's serial executor.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::executor::Task;
use crate::Error;

/// Doubling retransmission timeout, capped at a maximum.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    max_rto: Duration,
    retries: u32,
    rto: Duration,
    left: u32,
}

impl ExponentialBackoff {
    pub fn new(start_rto: Duration, max_rto: Duration, retries: u32) -> Self {
        Self {
            max_rto,
            retries,
            rto: start_rto.min(max_rto),
            left: retries,
        }
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Count one retransmission and double the timeout.
    pub fn attempt(&mut self) {
        let (n, overflow) = self.left.overflowing_sub(1);

        if overflow {
            return;
        }

        self.left = n;
        self.rto = self.rto.saturating_mul(2).min(self.max_rto);
    }

    pub fn can_retry(&self) -> bool {
        self.left > 0
    }

    /// Retransmissions done so far.
    pub fn retransmissions(&self) -> u32 {
        self.retries - self.left
    }

    /// Give up retrying, the next expiry is final.
    pub fn exhaust(&mut self) {
        self.left = 0;
    }
}

struct TimerState {
    queue: BinaryHeap<Reverse<(Instant, u64)>>,
    tasks: HashMap<u64, Task>,
    next_id: u64,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

/// Cancels a scheduled task.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: u64,
    shared: Weak<TimerShared>,
}

impl TimerHandle {
    /// Cancel the task unless it already started.
    pub fn cancel(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.state.lock().tasks.remove(&self.id);
        }
    }
}

/// A single thread running delayed tasks.
pub struct Timer {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    pub fn new(name: &str) -> Result<Timer, Error> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                queue: BinaryHeap::new(),
                tasks: HashMap::new(),
                next_id: 0,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(thread_shared))?;

        Ok(Timer {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Run `task` on the timer thread after `delay`.
    pub fn schedule(&self, delay: Duration, task: Task) -> Result<TimerHandle, Error> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(Error::ExecutionRejected);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.tasks.insert(id, task);
        state.queue.push(Reverse((Instant::now() + delay, id)));
        self.shared.wakeup.notify_one();
        Ok(TimerHandle {
            id,
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Number of tasks waiting to run.
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    /// Stop the thread. Tasks not yet run are dropped and their count returned.
    pub fn shutdown(&self) -> usize {
        let dropped = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.queue.clear();
            let dropped = state.tasks.len();
            state.tasks.clear();
            self.shared.wakeup.notify_all();
            dropped
        };
        if let Some(thread) = self.thread.lock().take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
        dropped
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: Arc<TimerShared>) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }

        let Some(Reverse((deadline, id))) = state.queue.peek().copied() else {
            shared.wakeup.wait(&mut state);
            continue;
        };

        if deadline > Instant::now() {
            shared.wakeup.wait_until(&mut state, deadline);
            continue;
        }

        state.queue.pop();
        // Cancelled tasks are gone from the map.
        let Some(task) = state.tasks.remove(&id) else {
            continue;
        };

        drop(state);
        task();
        state = shared.state.lock();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn attempts() {
        let mut exp =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60), 3);

        assert_eq!(exp.rto(), Duration::from_secs(1));
        assert!(exp.can_retry());

        exp.attempt();
        assert_eq!(exp.rto(), Duration::from_secs(2));
        exp.attempt();
        assert_eq!(exp.rto(), Duration::from_secs(4));
        assert!(exp.can_retry());
        exp.attempt();
        assert_eq!(exp.rto(), Duration::from_secs(8));
        assert!(!exp.can_retry());
        assert_eq!(exp.retransmissions(), 3);

        exp.attempt();
        assert_eq!(exp.rto(), Duration::from_secs(8));
    }

    #[test]
    fn capped() {
        let mut exp =
            ExponentialBackoff::new(Duration::from_secs(10), Duration::from_secs(15), 5);
        exp.attempt();
        assert_eq!(exp.rto(), Duration::from_secs(15));
        exp.attempt();
        assert_eq!(exp.rto(), Duration::from_secs(15));
    }

    #[test]
    fn runs_in_deadline_order() {
        let timer = Timer::new("timer-test").unwrap();
        let (tx, rx) = mpsc::channel();
        for (i, ms) in [(1, 60u64), (2, 10), (3, 30)] {
            let tx = tx.clone();
            timer
                .schedule(Duration::from_millis(ms), Box::new(move || tx.send(i).unwrap()))
                .unwrap();
        }
        let got: Vec<i32> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(got, vec![2, 3, 1]);
    }

    #[test]
    fn cancel_and_shutdown() {
        let timer = Timer::new("timer-test").unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        let tx2 = tx.clone();
        let handle = timer
            .schedule(Duration::from_millis(20), Box::new(move || tx.send(()).unwrap()))
            .unwrap();
        handle.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        timer
            .schedule(Duration::from_secs(10), Box::new(move || tx2.send(()).unwrap()))
            .unwrap();
        assert_eq!(timer.pending(), 1);
        assert_eq!(timer.shutdown(), 1);
        assert!(matches!(
            timer.schedule(Duration::ZERO, Box::new(|| {})),
            Err(Error::ExecutionRejected)
        ));
    }
}
