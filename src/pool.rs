use std::{
    any::Any,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Condvar, Mutex, Weak,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{tick, Sender};

use crate::{
    worker::{Job, Message, Worker},
    PoolBuilder,
};

/// How long a worker may stay idle before the reclamation loop
/// terminates it, unless overridden at construction.
pub const DEFAULT_EXPIRE: Duration = Duration::from_secs(3);

/// A handler invoked with the payload of a panic recovered inside a
/// worker.
///
/// See [`Pool::set_panic_handler`].
pub type PanicHandler = Arc<dyn Fn(Box<dyn Any + Send>) + Send + Sync>;

type PoolResult<T> = Result<T, PoolError>;

/// An error returned from the [`Pool`] constructors or [`Pool::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The configured capacity is below one.
    InvalidCapacity,

    /// The configured expiry duration is zero.
    InvalidExpire,

    /// The task could not be submitted because the pool has been
    /// released.
    Closed,
}

impl std::error::Error for PoolError {}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            PoolError::InvalidCapacity => write!(f, "pool capacity can not be less than 1."),
            PoolError::InvalidExpire => write!(f, "pool expire duration can not be zero."),
            PoolError::Closed => write!(f, "the pool has been released."),
        }
    }
}

/// State shared between pool handles, worker threads and the
/// reclamation loop.
///
/// The idle set and the closed flag form a monitor with the condition
/// variable; `running` is read on the hot path and stays atomic so
/// [`Pool::running`] and [`Pool::free`] never take the lock.
pub(crate) struct Shared {
    capacity: usize,
    expire: Duration,
    running: AtomicUsize,
    closed: AtomicBool,
    idle: Mutex<Vec<Worker>>,
    idle_available: Condvar,
    panic_handler: Mutex<Option<PanicHandler>>,
    worker_seq: AtomicUsize,
}

impl Shared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn next_worker_id(&self) -> usize {
        self.worker_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Resolves a worker for one submission: pop the most recently
    /// idled worker, grow while below capacity, or block until one of
    /// those becomes possible again.
    ///
    /// The most recently idled worker is reused first. It is the
    /// warmest, and it keeps the idle vector ordered oldest-first from
    /// the head, which is what the reclamation scan relies on.
    fn acquire(this: &Arc<Self>) -> PoolResult<Sender<Message>> {
        let mut idle = this.idle.lock().unwrap();
        loop {
            if this.is_closed() {
                return Err(PoolError::Closed);
            }

            if let Some(worker) = idle.pop() {
                this.running.fetch_add(1, Ordering::SeqCst);
                return Ok(worker.inbox);
            }

            if this.running.load(Ordering::SeqCst) < this.capacity {
                this.running.fetch_add(1, Ordering::SeqCst);
                // Release lock before spawning a thread.
                drop(idle);
                return Ok(Worker::spawn(Arc::clone(this)));
            }

            // Saturated and nothing idle: wait for a worker to be
            // parked, then re-evaluate from the top.
            idle = this.idle_available.wait(idle).unwrap();
        }
    }

    /// Returns a worker that finished its task to the idle set and
    /// wakes one blocked submitter.
    ///
    /// Returns `false` if the pool was released while the task ran; the
    /// worker must then exit instead of re-idling. The running counter
    /// is decremented under the idle lock so `running + idle` never
    /// exceeds the capacity between the two updates.
    pub(crate) fn park(&self, worker: Worker) -> bool {
        let mut idle = self.idle.lock().unwrap();
        self.running.fetch_sub(1, Ordering::SeqCst);
        if self.is_closed() {
            return false;
        }
        idle.push(worker);
        self.idle_available.notify_one();
        true
    }

    /// Terminates every idle worker whose idle age exceeds the expiry
    /// threshold. Workers park at the tail, so the head of the vector
    /// holds the oldest entries and the scan stops at the first
    /// still-fresh one.
    fn reap_expired(&self) {
        let mut idle = self.idle.lock().unwrap();
        let now = Instant::now();
        let expired = idle
            .iter()
            .take_while(|worker| now.duration_since(worker.last_idle_at) > self.expire)
            .count();
        if expired == 0 {
            return;
        }
        for worker in idle.drain(..expired) {
            // The worker is idle, so its single-slot inbox is empty
            // and the send can not fail.
            let _ = worker.inbox.try_send(Message::Terminate);
        }
        log::debug!(
            "reclaimed {} expired workers, running: {}, idle: {}",
            expired,
            self.running.load(Ordering::SeqCst),
            idle.len()
        );
    }

    /// Routes a recovered task panic to the configured handler, or
    /// logs it. The handler is cloned out of the slot so user code
    /// never runs under the pool's locks.
    pub(crate) fn on_task_panic(&self, payload: Box<dyn Any + Send>) {
        let handler = self.panic_handler.lock().unwrap().clone();
        match handler {
            Some(handler) => handler(payload),
            None => log::error!("worker recovered a task panic: {}", panic_message(payload.as_ref())),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

/// Runs until every pool handle and worker is gone. Ticks are skipped
/// while the pool is released so that a later [`Pool::restart`] gets
/// reclamation back without respawning anything.
fn spawn_reclaimer(shared: Weak<Shared>, period: Duration) {
    let ticker = tick(period);
    thread::Builder::new()
        .name("wpool-reclaimer".into())
        .spawn(move || {
            for _ in ticker.iter() {
                let shared = match shared.upgrade() {
                    Some(shared) => shared,
                    None => break,
                };
                if shared.is_closed() {
                    continue;
                }
                shared.reap_expired();
            }
        })
        .expect("failed to spawn the reclaimer thread.");
}

/// A `Pool` owns a fixed capacity of reusable worker threads and hands
/// submitted tasks to them.
///
/// # Admission
///
/// A submission is served by the most recently idled worker when one
/// exists, by a freshly spawned worker while fewer than `capacity`
/// workers are running, and otherwise the submitting thread blocks
/// until a worker is returned to the idle set. The handoff itself
/// never executes the task; execution is asynchronous.
///
/// # Idle workers and expiry
///
/// A worker that finishes its task parks itself in the pool's idle set
/// rather than exiting. A background reclamation loop wakes once per
/// expiry period and terminates every worker that has been idle longer
/// than that period, so a pool that goes quiet shrinks back to zero
/// threads.
///
/// # Sharing
///
/// `Pool` is a cheap handle over shared state and can be cloned into
/// as many threads as needed; all clones drive the same pool.
///
/// # Examples
///
/// ```
/// use wpool::Pool;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let pool = Pool::new(4).unwrap();
///
/// let sum = Arc::new(AtomicUsize::new(0));
/// for _ in 0..10 {
///     let sum = sum.clone();
///     pool.submit(move || {
///         sum.fetch_add(1, Ordering::SeqCst);
///     }).unwrap();
/// }
///
/// # std::thread::sleep(std::time::Duration::from_millis(300));
/// assert_eq!(10, sum.load(Ordering::SeqCst));
/// pool.release();
/// ```
#[derive(Clone)]
pub struct Pool {
    shared: Arc<Shared>,
}

impl Pool {
    /// Creates a pool of at most `capacity` concurrent workers with
    /// the default expiry of [`DEFAULT_EXPIRE`].
    ///
    /// # Errors
    ///
    /// [`InvalidCapacity`] if `capacity` is zero.
    ///
    /// [`InvalidCapacity`]: PoolError::InvalidCapacity
    pub fn new(capacity: usize) -> Result<Self, PoolError> {
        Self::with_expire(capacity, DEFAULT_EXPIRE)
    }

    /// Creates a pool of at most `capacity` concurrent workers whose
    /// idle workers are reclaimed after `expire`.
    ///
    /// The reclamation loop starts immediately and runs for the life
    /// of the pool.
    ///
    /// # Errors
    ///
    /// [`InvalidCapacity`] if `capacity` is zero, [`InvalidExpire`] if
    /// `expire` is zero.
    ///
    /// [`InvalidCapacity`]: PoolError::InvalidCapacity
    /// [`InvalidExpire`]: PoolError::InvalidExpire
    pub fn with_expire(capacity: usize, expire: Duration) -> Result<Self, PoolError> {
        Self::with_config(capacity, expire, None)
    }

    /// Builds a pool from a configuration(builder).
    pub(crate) fn from_builder(builder: PoolBuilder) -> PoolResult<Self> {
        Self::with_config(builder.capacity, builder.expire, builder.panic_handler)
    }

    fn with_config(
        capacity: usize,
        expire: Duration,
        panic_handler: Option<PanicHandler>,
    ) -> PoolResult<Self> {
        if capacity < 1 {
            return Err(PoolError::InvalidCapacity);
        }
        if expire.is_zero() {
            return Err(PoolError::InvalidExpire);
        }
        let shared = Arc::new(Shared {
            capacity,
            expire,
            running: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            idle: Mutex::new(Vec::new()),
            idle_available: Condvar::new(),
            panic_handler: Mutex::new(panic_handler),
            worker_seq: AtomicUsize::new(0),
        });
        spawn_reclaimer(Arc::downgrade(&shared), expire);
        Ok(Pool { shared })
    }

    /// Hands `task` to a worker for asynchronous execution.
    ///
    /// Returns as soon as the task has been handed off; it does not
    /// wait for the task to run. The handoff itself blocks while the
    /// pool is saturated and no worker is idle.
    ///
    /// A panic inside `task` is recovered by the worker and routed to
    /// the panic handler (see [`Pool::set_panic_handler`]); it is
    /// never surfaced through `submit`.
    ///
    /// # Errors
    ///
    /// [`Closed`] if the pool has been released.
    ///
    /// [`Closed`]: PoolError::Closed
    ///
    /// # Examples
    ///
    /// ```
    /// use wpool::Pool;
    ///
    /// let pool = Pool::new(2).unwrap();
    /// pool.submit(|| println!("Hello World")).unwrap();
    /// pool.release();
    /// ```
    pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.is_closed() {
            return Err(PoolError::Closed);
        }
        let inbox = Shared::acquire(&self.shared)?;
        let job: Job = Box::new(task);
        // The worker was removed from the idle set (or freshly
        // spawned), so its empty single-slot inbox is ours alone.
        inbox
            .send(Message::Run(job))
            .expect("acquired worker disappeared before handoff.");
        Ok(())
    }

    /// Releases the pool.
    ///
    /// Marks the pool closed, terminates every idle worker and wakes
    /// every blocked submitter, which then fails with
    /// [`PoolError::Closed`]. Workers in the middle of a task finish
    /// it and exit instead of re-idling. Calling `release` more than
    /// once, from any number of threads, tears down only once.
    ///
    /// # Examples
    ///
    /// ```
    /// use wpool::Pool;
    ///
    /// let pool = Pool::new(2).unwrap();
    /// pool.release();
    ///
    /// assert!(pool.submit(|| println!("Hello")).is_err());
    /// ```
    pub fn release(&self) {
        if self
            .shared
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let mut idle = self.shared.idle.lock().unwrap();
        let terminated = idle.len();
        for worker in idle.drain(..) {
            let _ = worker.inbox.try_send(Message::Terminate);
        }
        self.shared.idle_available.notify_all();
        log::debug!("pool released, {terminated} idle workers terminated");
    }

    /// Reopens a released pool so it accepts submissions again.
    ///
    /// Returns `true` once the pool is open; calling this on a pool
    /// that was never released is a no-op.
    pub fn restart(&self) -> bool {
        let _ = self
            .shared
            .closed
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst);
        true
    }

    /// Returns `true` if the pool has been released.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Returns the number of workers currently executing a task.
    /// Never blocks.
    #[must_use]
    pub fn running(&self) -> usize {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Returns the number of unoccupied capacity slots. Never blocks.
    #[must_use]
    pub fn free(&self) -> usize {
        self.shared.capacity.saturating_sub(self.running())
    }

    /// Sets the handler invoked with the payload of every panic
    /// recovered inside a worker. Without a handler, recovered panics
    /// are logged at error level.
    pub fn set_panic_handler<F>(&self, handler: F)
    where
        F: Fn(Box<dyn Any + Send>) + Send + Sync + 'static,
    {
        *self.shared.panic_handler.lock().unwrap() = Some(Arc::new(handler));
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self) -> usize {
        self.shared.idle.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use crate::{Pool, PoolError};
    use crossbeam_channel::unbounded;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        thread,
        time::{Duration, Instant},
    };

    fn wait_until(deadline: Duration, cond: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn test_invalid_construction() {
        assert_eq!(Some(PoolError::InvalidCapacity), Pool::new(0).err());
        assert_eq!(
            Some(PoolError::InvalidExpire),
            Pool::with_expire(1, Duration::ZERO).err()
        );
    }

    #[test]
    fn test_submits_below_capacity_never_block() {
        let pool = Pool::new(4).unwrap();
        let (done_tx, done_rx) = unbounded();
        let start = Instant::now();
        for _ in 0..4 {
            let done = done_tx.clone();
            pool.submit(move || {
                thread::sleep(Duration::from_millis(200));
                done.send(()).unwrap();
            })
            .unwrap();
        }
        // All four handoffs return without waiting on task completion.
        assert!(start.elapsed() < Duration::from_millis(200));
        assert!(pool.running() <= 4);

        for _ in 0..4 {
            done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }
        pool.release();
    }

    #[test]
    fn test_every_task_runs_exactly_once_over_capacity() {
        let pool = Pool::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..10 {
                    let counter = counter.clone();
                    pool.submit(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(wait_until(Duration::from_secs(5), || {
            counter.load(Ordering::SeqCst) == 40
        }));
        pool.release();
    }

    #[test]
    fn test_bounded_concurrency() {
        let pool = Pool::new(2).unwrap();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let current = current.clone();
            let peak = peak.clone();
            let done = done.clone();
            pool.submit(move || {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                current.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
            assert!(pool.running() <= 2);
        }

        assert!(wait_until(Duration::from_secs(5), || {
            done.load(Ordering::SeqCst) == 5
        }));
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(wait_until(Duration::from_secs(1), || pool.running() == 0));
        pool.release();
    }

    #[test]
    fn test_reuses_most_recently_idled_worker() {
        let pool = Pool::new(4).unwrap();
        let ids = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let ids = ids.clone();
            pool.submit(move || {
                ids.lock().unwrap().push(thread::current().id());
            })
            .unwrap();
            // Wait for the park so the next submit reuses the worker
            // instead of growing.
            assert!(wait_until(Duration::from_secs(1), || pool.idle_count() == 1));
        }

        let ids = ids.lock().unwrap();
        assert_eq!(2, ids.len());
        assert_eq!(ids[0], ids[1]);
        pool.release();
    }

    #[test]
    fn test_release_is_idempotent_across_threads() {
        let pool = Pool::new(2).unwrap();
        pool.submit(|| ()).unwrap();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(thread::spawn(move || pool.release()));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(pool.is_closed());
        assert_eq!(Err(PoolError::Closed), pool.submit(|| ()));
        assert!(wait_until(Duration::from_secs(1), || pool.running() == 0));
    }

    #[test]
    fn test_release_wakes_blocked_submitters() {
        let pool = Pool::new(1).unwrap();
        let (gate_tx, gate_rx) = unbounded::<()>();
        pool.submit(move || {
            gate_rx.recv().ok();
        })
        .unwrap();

        let blocked = {
            let pool = pool.clone();
            thread::spawn(move || pool.submit(|| ()))
        };
        // Let the submitter reach the wait branch.
        thread::sleep(Duration::from_millis(100));
        pool.release();

        assert_eq!(Err(PoolError::Closed), blocked.join().unwrap());
        gate_tx.send(()).unwrap();
        assert!(wait_until(Duration::from_secs(1), || pool.running() == 0));
    }

    #[test]
    fn test_panicking_task_does_not_kill_the_pool() {
        let pool = Pool::new(1).unwrap();
        let seen = Arc::new(Mutex::new(None));
        {
            let seen = seen.clone();
            pool.set_panic_handler(move |payload| {
                *seen.lock().unwrap() = payload.downcast_ref::<&str>().map(|s| s.to_string());
            });
        }

        pool.submit(|| panic!("boom")).unwrap();
        assert!(wait_until(Duration::from_secs(1), || {
            seen.lock().unwrap().is_some()
        }));
        assert_eq!(Some("boom".to_string()), seen.lock().unwrap().clone());
        assert!(wait_until(Duration::from_secs(1), || pool.running() == 0));

        // The pool keeps serving submissions afterwards.
        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        pool.submit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert!(wait_until(Duration::from_secs(1), || {
            done.load(Ordering::SeqCst) == 1
        }));
        pool.release();
    }

    #[test]
    fn test_idle_worker_expires() {
        let pool = Pool::with_expire(1, Duration::from_secs(1)).unwrap();
        pool.submit(|| ()).unwrap();
        assert!(wait_until(Duration::from_secs(1), || pool.idle_count() == 1));
        assert!(wait_until(Duration::from_secs(3), || pool.idle_count() == 0));

        // The expired worker is gone; the next submit gets a fresh one.
        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        pool.submit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert!(wait_until(Duration::from_secs(1), || {
            done.load(Ordering::SeqCst) == 1
        }));
        pool.release();
    }

    #[test]
    fn test_restart_reopens_the_pool() {
        let pool = Pool::new(2).unwrap();
        pool.release();
        assert!(pool.is_closed());
        assert_eq!(Err(PoolError::Closed), pool.submit(|| ()));

        assert!(pool.restart());
        assert!(!pool.is_closed());

        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        pool.submit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert!(wait_until(Duration::from_secs(1), || {
            done.load(Ordering::SeqCst) == 1
        }));
        pool.release();
    }

    #[test]
    fn test_running_and_free_snapshots() {
        let pool = Pool::new(4).unwrap();
        assert_eq!(0, pool.running());
        assert_eq!(4, pool.free());

        let (gate_tx, gate_rx) = unbounded::<()>();
        pool.submit(move || {
            gate_rx.recv().ok();
        })
        .unwrap();
        assert!(wait_until(Duration::from_secs(1), || pool.running() == 1));
        assert_eq!(3, pool.free());

        gate_tx.send(()).unwrap();
        assert!(wait_until(Duration::from_secs(1), || pool.free() == 4));
        pool.release();
    }
}
