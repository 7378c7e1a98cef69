//! Worker pool and the per connection serial executor on top of it.

use std::collections::VecDeque;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::Error;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Run `task`, containing a panic to the task itself.
///
/// Returns the panic message if it panicked.
pub fn run_contained(task: Task) -> Option<String> {
    panic::catch_unwind(AssertUnwindSafe(task))
        .err()
        .map(|payload| panic_message(payload.as_ref()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Fixed number of threads taking tasks from one channel.
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: &str, threads: usize) -> Result<Arc<WorkerPool>, Error> {
        let (sender, receiver) = unbounded::<Task>();
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads.max(1) {
            let receiver: Receiver<Task> = receiver.clone();
            let worker = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || {
                    // Ends when the sender is dropped and the channel drained.
                    for task in receiver.iter() {
                        if let Some(message) = run_contained(task) {
                            error!("Task panicked: {}", message);
                        }
                    }
                })?;
            workers.push(worker);
        }
        Ok(Arc::new(WorkerPool {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }))
    }

    pub fn execute(&self, task: Task) -> Result<(), Error> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(Error::ExecutionRejected);
        };
        sender.send(task).map_err(|_| Error::ExecutionRejected)
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Stop accepting tasks, let queued ones finish and join the workers.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
        debug!("Worker pool {} shut down", self.name);
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

struct SerialQueue {
    tasks: VecDeque<Task>,
    active: bool,
    shutdown: bool,
}

/// Runs tasks one at a time, in submission order, on a shared pool.
///
/// Each task is one pool job. At most one task of an executor is active.
#[derive(Clone)]
pub struct SerialExecutor {
    pool: Arc<WorkerPool>,
    queue: Arc<Mutex<SerialQueue>>,
}

impl SerialExecutor {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        SerialExecutor {
            pool,
            queue: Arc::new(Mutex::new(SerialQueue {
                tasks: VecDeque::new(),
                active: false,
                shutdown: false,
            })),
        }
    }

    pub fn execute(&self, task: Task) -> Result<(), Error> {
        let mut queue = self.queue.lock();
        if queue.shutdown {
            return Err(Error::ExecutionRejected);
        }
        queue.tasks.push_back(task);
        if !queue.active {
            queue.active = true;
            drop(queue);
            self.schedule_next();
        }
        Ok(())
    }

    fn schedule_next(&self) {
        let this = self.clone();
        let job: Task = Box::new(move || this.run_next());
        if self.pool.execute(job).is_err() {
            // Tasks stay queued for shutdown_now.
            self.queue.lock().active = false;
        }
    }

    fn run_next(&self) {
        let task = self.queue.lock().tasks.pop_front();
        if let Some(task) = task {
            if let Some(message) = run_contained(task) {
                error!("Serial task panicked: {}", message);
            }
        }

        let mut queue = self.queue.lock();
        if queue.tasks.is_empty() || queue.shutdown {
            queue.active = false;
        } else {
            drop(queue);
            self.schedule_next();
        }
    }

    /// Stop accepting tasks and return the ones never started.
    pub fn shutdown_now(&self) -> Vec<Task> {
        let mut queue = self.queue.lock();
        queue.shutdown = true;
        queue.tasks.drain(..).collect()
    }
}

impl fmt::Debug for SerialExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.queue.lock();
        f.debug_struct("SerialExecutor")
            .field("pending", &queue.tasks.len())
            .field("active", &queue.active)
            .field("shutdown", &queue.shutdown)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn serial_order_and_single_active_task() {
        let pool = WorkerPool::new("serial-test", 4).unwrap();
        let executor = SerialExecutor::new(pool.clone());
        let active = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();

        for i in 0..100 {
            let active = active.clone();
            let order = order.clone();
            let tx = tx.clone();
            executor
                .execute(Box::new(move || {
                    assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                    order.lock().push(i);
                    thread::yield_now();
                    active.fetch_sub(1, Ordering::SeqCst);
                    if i == 99 {
                        tx.send(()).unwrap();
                    }
                }))
                .unwrap();
        }

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*order.lock(), (0..100).collect::<Vec<_>>());
        pool.shutdown();
    }

    #[test]
    fn executors_share_the_pool() {
        let pool = WorkerPool::new("serial-test", 2).unwrap();
        let a = SerialExecutor::new(pool.clone());
        let b = SerialExecutor::new(pool.clone());
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            for e in [&a, &b] {
                let count = count.clone();
                e.execute(Box::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
            }
        }
        pool.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn shutdown_now_returns_pending() {
        let pool = WorkerPool::new("serial-test", 1).unwrap();
        let executor = SerialExecutor::new(pool.clone());
        let (block_tx, block_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();

        executor
            .execute(Box::new(move || {
                started_tx.send(()).unwrap();
                let _ = block_rx.recv();
            }))
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        executor.execute(Box::new(|| {})).unwrap();
        executor.execute(Box::new(|| {})).unwrap();

        let pending = executor.shutdown_now();
        assert_eq!(pending.len(), 2);
        assert!(executor.execute(Box::new(|| {})).is_err());

        block_tx.send(()).unwrap();
        pool.shutdown();
    }

    #[test]
    fn panicking_task_does_not_stall_the_queue() {
        let pool = WorkerPool::new("serial-test", 1).unwrap();
        let executor = SerialExecutor::new(pool.clone());
        let (tx, rx) = mpsc::channel();

        executor.execute(Box::new(|| panic!("task failed"))).unwrap();
        executor
            .execute(Box::new(move || tx.send(()).unwrap()))
            .unwrap();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!pool.is_shutdown());
        pool.shutdown();
    }

    #[test]
    fn contained_panic_reports_its_message() {
        assert_eq!(run_contained(Box::new(|| {})), None);
        let message = run_contained(Box::new(|| panic!("broken {}", 7)));
        assert_eq!(message.as_deref(), Some("broken 7"));
    }

    #[test]
    fn rejected_after_pool_shutdown() {
        let pool = WorkerPool::new("serial-test", 1).unwrap();
        pool.shutdown();
        assert!(matches!(
            pool.execute(Box::new(|| {})),
            Err(Error::ExecutionRejected)
        ));

        // The task stays queued for shutdown_now.
        let executor = SerialExecutor::new(pool);
        executor.execute(Box::new(|| {})).unwrap();
        assert_eq!(executor.shutdown_now().len(), 1);
    }
}
