use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;

use sink_protocol::SinkError;

use crate::sink::Sink;

/// Process-wide render scheduler: the set of sinks with pending dirty
/// tiles, priority-ordered, plus the single background thread that drains
/// it. Exactly one of these is meant to back a process via [`global`], but
/// tests construct private instances so cases do not interfere with each
/// other's worker thread.
pub struct Scheduler {
    dirty: Mutex<Vec<Arc<Sink>>>,
    not_empty: Condvar,
    reschedule: AtomicBool,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawns the background worker thread. Mirrors `sink_screen`'s
    /// documented "thread creation failure at scheduler bootstrap"
    /// error path; once this succeeds the singleton never needs to spawn
    /// another thread for the lifetime of the process.
    pub fn new() -> Result<Arc<Scheduler>, SinkError> {
        let stop = Arc::new(AtomicBool::new(false));
        let scheduler = Arc::new(Scheduler {
            dirty: Mutex::new(Vec::new()),
            not_empty: Condvar::new(),
            reschedule: AtomicBool::new(false),
            stop,
            worker: Mutex::new(None),
        });

        let worker_scheduler = Arc::clone(&scheduler);
        let handle = std::thread::Builder::new()
            .name("tiles-sink-worker".to_owned())
            .spawn(move || worker_loop(worker_scheduler))
            .map_err(SinkError::ThreadSpawn)?;

        *scheduler
            .worker
            .lock()
            .expect("scheduler worker handle lock poisoned") = Some(handle);

        Ok(scheduler)
    }

    /// The process-wide singleton, lazily created on first use. Bootstrap
    /// failure here is treated as fatal: a process that cannot spawn a
    /// single background thread has no sensible way to keep running an
    /// async renderer, so this panics rather than threading an error
    /// through every later `sink_screen` call that merely reuses it.
    pub fn global() -> Arc<Scheduler> {
        static GLOBAL: OnceLock<Arc<Scheduler>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| {
            Scheduler::new().expect("failed to bootstrap sink scheduler worker thread")
        }))
    }

    pub(crate) fn enqueue(&self, sink: Arc<Sink>) {
        let mut queue = self
            .dirty
            .lock()
            .expect("scheduler dirty queue lock poisoned");
        if queue.iter().any(|queued| Arc::ptr_eq(queued, &sink)) {
            return;
        }
        tracing::debug!(sink = %sink.id(), priority = sink.priority(), "sink entered dirty queue");
        queue.push(sink);
        // Descending priority, ties broken by insertion (append) order: a
        // stable sort preserves the relative order of equal-priority
        // entries exactly as they were pushed.
        queue.sort_by(|a, b| b.priority().cmp(&a.priority()));
        self.reschedule.store(true, Ordering::Release);
        self.not_empty.notify_one();
    }

    pub(crate) fn remove_if_queued(&self, id: sink_protocol::SinkId) {
        let mut queue = self
            .dirty
            .lock()
            .expect("scheduler dirty queue lock poisoned");
        queue.retain(|sink| sink.id() != id);
    }

    pub(crate) fn request_reschedule(&self) {
        self.reschedule.store(true, Ordering::Release);
    }

    pub(crate) fn reschedule_requested(&self) -> bool {
        self.reschedule.load(Ordering::Acquire)
    }

    fn dequeue_blocking(&self) -> Option<Arc<Sink>> {
        let mut queue = self
            .dirty
            .lock()
            .expect("scheduler dirty queue lock poisoned");
        loop {
            if self.stop.load(Ordering::Acquire) {
                return None;
            }
            if !queue.is_empty() {
                return Some(queue.remove(0));
            }
            queue = self
                .not_empty
                .wait(queue)
                .expect("scheduler dirty queue lock poisoned");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.not_empty.notify_all();
        if let Some(handle) = self
            .worker
            .lock()
            .expect("scheduler worker handle lock poisoned")
            .take()
        {
            let _ = handle.join();
        }
    }
}

fn worker_loop(scheduler: Arc<Scheduler>) {
    tracing::info!("sink scheduler worker started");
    loop {
        let sink = match scheduler.dequeue_blocking() {
            Some(sink) => sink,
            None => break,
        };
        scheduler.reschedule.store(false, Ordering::Release);
        sink.run_paint_pass(&scheduler);
        if sink.has_dirty_work() && !sink.is_closed() {
            scheduler.enqueue(sink);
        }
        // Otherwise this was the worker's only remaining reference; the
        // sink is deallocated here if every consumer handle has already
        // closed.
    }
    tracing::info!("sink scheduler worker stopped");
}
