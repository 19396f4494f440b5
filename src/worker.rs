use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
    time::Instant,
};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::pool::Shared;

/// A unit of work accepted by [`Pool::submit`].
///
/// [`Pool::submit`]: crate::Pool::submit
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// A message delivered to a worker's single-slot inbox.
pub(crate) enum Message {
    Run(Job),
    Terminate,
}

/// A worker record as held in the pool's idle set: the sending side of
/// the worker's inbox plus the instant it was last parked.
pub(crate) struct Worker {
    pub(crate) inbox: Sender<Message>,
    pub(crate) last_idle_at: Instant,
}

impl Worker {
    pub(crate) fn parked(inbox: Sender<Message>) -> Self {
        Worker {
            inbox,
            last_idle_at: Instant::now(),
        }
    }

    /// Spawns a fresh worker thread bound to the pool and returns the
    /// sending side of its inbox. The caller has already reserved a
    /// running slot for it.
    pub(crate) fn spawn(shared: Arc<Shared>) -> Sender<Message> {
        let (sender, receiver) = bounded(1);
        let inbox = sender.clone();
        let id = shared.next_worker_id();
        thread::Builder::new()
            .name(format!("wpool-worker-{id}"))
            .spawn(move || run_loop(shared, receiver, sender))
            .expect("failed to spawn a worker thread.");
        inbox
    }
}

/// The worker loop: blocked in `recv` while idle, running a job
/// otherwise. A `Terminate` message or a disconnected inbox ends the
/// loop, as does a pool that was released while the job ran.
fn run_loop(shared: Arc<Shared>, inbox: Receiver<Message>, handle: Sender<Message>) {
    while let Ok(Message::Run(job)) = inbox.recv() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            shared.on_task_panic(payload);
        }
        if !shared.park(Worker::parked(handle.clone())) {
            break;
        }
    }
}
