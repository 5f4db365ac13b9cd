//! Background release of nursery memory.
//!
//! When the nursery shrinks, whole chunks it no longer needs are queued here
//! and unmapped on a helper thread. A nursery smaller than one chunk instead
//! queues the unused tail of its only chunk, which is decommitted in place.

use super::chunk::{decommit_chunk_tail, round_down, round_up, NurseryChunk, CHUNK_USABLE_SIZE, PAGE_SIZE};
use super::task::{GcParallelTask, TaskBody};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

#[derive(Debug, Default)]
struct DecommitQueue {
    chunks: Vec<NurseryChunk>,
    /// `(chunk base, capacity)`: decommit the chunk at `base` past `capacity`.
    partial: Option<(usize, usize)>,
}

/// Body of the decommit task.
#[derive(Debug, Default)]
pub struct DecommitWork {
    queue: Mutex<DecommitQueue>,
    released_bytes: AtomicUsize,
}

/// One unit of queued work.
#[derive(Debug)]
enum Work {
    Chunk(NurseryChunk),
    /// `(chunk base, capacity)`.
    Tail(usize, usize),
}

impl DecommitWork {
    /// Bytes returned to the OS since creation.
    pub fn released_bytes(&self) -> usize {
        self.released_bytes.load(Ordering::Relaxed)
    }

    fn is_empty(&self) -> bool {
        let queue = self.queue.lock();
        queue.chunks.is_empty() && queue.partial.is_none()
    }

    /// Whole chunks first, then the partial range.
    fn next_work(&self) -> Option<Work> {
        let mut queue = self.queue.lock();
        if let Some(chunk) = queue.chunks.pop() {
            return Some(Work::Chunk(chunk));
        }
        queue.partial.take().map(|(base, capacity)| Work::Tail(base, capacity))
    }
}

impl TaskBody for DecommitWork {
    /// Drains the queue, including work queued while running.
    fn run(&self) {
        while let Some(work) = self.next_work() {
            match work {
                Work::Chunk(chunk) => {
                    drop(chunk);
                    self.released_bytes
                        .fetch_add(super::chunk::CHUNK_SIZE, Ordering::Relaxed);
                }
                Work::Tail(base, capacity) => {
                    if decommit_chunk_tail(base, capacity) {
                        let released = round_down(CHUNK_USABLE_SIZE, PAGE_SIZE) - round_up(capacity, PAGE_SIZE);
                        self.released_bytes.fetch_add(released, Ordering::Relaxed);
                    } else {
                        warn!(base = format_args!("{:#x}", base), capacity, "failed to decommit nursery tail");
                    }
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "nursery-decommit"
    }
}

/// Queues nursery memory and releases it off the main thread.
pub struct NurseryDecommitTask {
    task: GcParallelTask<DecommitWork>,
}

impl Default for NurseryDecommitTask {
    fn default() -> Self {
        Self::new()
    }
}

impl NurseryDecommitTask {
    /// Idle task with an empty queue.
    pub fn new() -> Self {
        Self {
            task: GcParallelTask::new(DecommitWork::default()),
        }
    }

    /// Hand a whole chunk over for unmapping.
    ///
    /// A pending partial decommit of the same chunk is dropped since the
    /// whole chunk goes away.
    pub fn queue_chunk(&self, chunk: NurseryChunk) {
        let mut queue = self.task.body().queue.lock();
        if queue.partial.is_some_and(|(base, _)| base == chunk.start()) {
            queue.partial = None;
        }
        queue.chunks.push(chunk);
    }

    /// Queue the tail of `chunk` past `new_capacity` for decommit.
    ///
    /// Nothing is queued if less than a page would be released.
    pub fn queue_range(&self, new_capacity: usize, chunk: &NurseryChunk) {
        let mut queue = self.task.body().queue.lock();
        if round_up(new_capacity, PAGE_SIZE) >= round_down(CHUNK_USABLE_SIZE, PAGE_SIZE) {
            queue.partial = None;
            return;
        }
        queue.partial = Some((chunk.start(), new_capacity));
    }

    /// Forget a queued partial decommit. Call after `join` before reusing
    /// the tail of the chunk.
    pub fn cancel_range(&self) {
        self.task.body().queue.lock().partial = None;
    }

    /// Start the helper unless it is already running.
    pub fn start_or_run_if_idle(&self) {
        if self.task.body().is_empty() {
            return;
        }
        self.task.start_or_run_if_idle();
    }

    /// Process the queue on the current thread.
    pub fn run_from_main_thread(&self) {
        self.task.run_from_main_thread();
    }

    /// Wait for an in-flight run.
    pub fn join(&self) {
        self.task.join();
    }

    /// Whether the helper is not running.
    pub fn is_idle(&self) -> bool {
        self.task.is_idle()
    }

    /// Whether work is queued but not yet processed.
    pub fn has_pending_work(&self) -> bool {
        !self.task.body().is_empty()
    }

    /// Bytes returned to the OS so far.
    pub fn released_bytes(&self) -> usize {
        self.task.body().released_bytes()
    }
}
