//! Helper-thread tasks.
//!
//! A [`GcParallelTask`] owns a shareable body and a single worker thread,
//! spawned on the first `start` and parked between runs. Each `start`
//! dispatches one run to that worker; `join` waits until it is idle again.
//! If no thread can be spawned the run happens inline instead.

use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::warn;

/// Work that a [`GcParallelTask`] can run.
pub trait TaskBody: Send + Sync + 'static {
    /// Do the work. May be called from any thread.
    fn run(&self);

    /// Short name used for the helper thread.
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Dispatched,
    Running,
}

#[derive(Debug)]
struct Control {
    state: RunState,
    shutdown: bool,
}

struct Shared<T> {
    body: T,
    control: Mutex<Control>,
    /// Signalled on dispatch, completion and shutdown.
    wakeup: Condvar,
}

impl<T: TaskBody> Shared<T> {
    fn worker_loop(&self) {
        let mut control = self.control.lock();
        loop {
            while control.state != RunState::Dispatched && !control.shutdown {
                self.wakeup.wait(&mut control);
            }
            if control.shutdown {
                return;
            }
            control.state = RunState::Running;
            drop(control);

            self.run_body();

            control = self.control.lock();
            control.state = RunState::Idle;
            self.wakeup.notify_all();
        }
    }

    fn run_body(&self) {
        if panic::catch_unwind(AssertUnwindSafe(|| self.body.run())).is_err() {
            warn!(task = self.body.name(), "helper task panicked");
        }
    }
}

/// A body plus the worker thread that runs it.
pub struct GcParallelTask<T: TaskBody> {
    shared: Arc<Shared<T>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: TaskBody> GcParallelTask<T> {
    /// Wrap `body`. No thread exists until the first `start`.
    pub fn new(body: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                body,
                control: Mutex::new(Control {
                    state: RunState::Idle,
                    shutdown: false,
                }),
                wakeup: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Shared access to the body.
    #[inline]
    pub fn body(&self) -> &T {
        &self.shared.body
    }

    /// Dispatch a run to the worker thread, spawning it if needed. Falls
    /// back to running inline if no thread can be spawned. The caller must
    /// ensure no run is in flight.
    pub fn start(&self) {
        if !self.ensure_worker() {
            self.shared.run_body();
            return;
        }
        let mut control = self.shared.control.lock();
        debug_assert_eq!(control.state, RunState::Idle, "task started twice");
        control.state = RunState::Dispatched;
        self.shared.wakeup.notify_all();
    }

    fn ensure_worker(&self) -> bool {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return true;
        }
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("gc-{}", self.shared.body.name()))
            .spawn(move || shared.worker_loop());
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                true
            }
            Err(err) => {
                warn!(task = self.shared.body.name(), error = %err, "helper thread unavailable, running inline");
                false
            }
        }
    }

    /// Whether a run is dispatched or executing.
    pub fn is_running(&self) -> bool {
        self.shared.control.lock().state != RunState::Idle
    }

    /// Whether no run is in flight.
    pub fn is_idle(&self) -> bool {
        !self.is_running()
    }

    /// Wait for the in-flight run, if any. The worker stays parked.
    pub fn join(&self) {
        let mut control = self.shared.control.lock();
        while control.state != RunState::Idle {
            self.shared.wakeup.wait(&mut control);
        }
    }

    /// Start unless a run is already in flight.
    pub fn start_or_run_if_idle(&self) {
        if self.is_running() {
            return;
        }
        self.start();
    }

    /// Run inline on the current thread after any in-flight run finishes.
    pub fn run_from_main_thread(&self) {
        self.join();
        self.shared.run_body();
    }

    /// Whether the worker thread has been spawned.
    pub fn has_worker(&self) -> bool {
        self.worker.lock().is_some()
    }
}

impl<T: TaskBody> Drop for GcParallelTask<T> {
    fn drop(&mut self) {
        self.join();
        self.shared.control.lock().shutdown = true;
        self.shared.wakeup.notify_all();
        if let Some(worker) = self.worker.get_mut().take() {
            if worker.join().is_err() {
                warn!(task = self.shared.body.name(), "helper thread exited abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        runs: AtomicUsize,
        threads: Mutex<Vec<thread::ThreadId>>,
    }

    impl TaskBody for Counter {
        fn run(&self) {
            self.threads.lock().push(thread::current().id());
            self.runs.fetch_add(1, Ordering::SeqCst);
        }

        fn name(&self) -> &'static str {
            "counter"
        }
    }

    struct Panics;

    impl TaskBody for Panics {
        fn run(&self) {
            panic!("task failure");
        }

        fn name(&self) -> &'static str {
            "panics"
        }
    }

    #[test]
    fn test_start_and_join() {
        let task = GcParallelTask::new(Counter::default());
        assert!(!task.has_worker());
        task.start();
        task.join();
        assert_eq!(task.body().runs.load(Ordering::SeqCst), 1);
        assert!(task.is_idle());
    }

    #[test]
    fn test_runs_reuse_one_worker_thread() {
        let task = GcParallelTask::new(Counter::default());
        for _ in 0..3 {
            task.start_or_run_if_idle();
            task.join();
        }
        assert_eq!(task.body().runs.load(Ordering::SeqCst), 3);

        let threads = task.body().threads.lock();
        assert!(threads.iter().all(|id| *id == threads[0]));
        assert_ne!(threads[0], thread::current().id());
    }

    #[test]
    fn test_run_from_main_thread() {
        let task = GcParallelTask::new(Counter::default());
        task.run_from_main_thread();
        assert_eq!(task.body().runs.load(Ordering::SeqCst), 1);
        assert_eq!(task.body().threads.lock()[0], thread::current().id());
        assert!(!task.has_worker());
    }

    #[test]
    fn test_panicking_run_returns_to_idle() {
        let task = GcParallelTask::new(Panics);
        task.start();
        task.join();
        assert!(task.is_idle());
        task.start();
        task.join();
    }
}
