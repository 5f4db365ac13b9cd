//! GC scheduling: tunables, the high-frequency flag and heap thresholds.
//!
//! ```text
//!   set_parameter ──► SchedulingTunables ──┐
//!                                          ├──► GcHeapThreshold / MallocHeapThreshold
//!   collection end ─► SchedulingState ─────┘        (per zone)
//! ```

pub mod threshold;
pub mod tunables;

pub use threshold::{
    GcHeapThreshold, HeapSize, HeapThreshold, MallocHeapThreshold, exponential_moving_average,
    linear_interpolate,
};
pub use tunables::{ParamKey, SchedulingTunables, TunableError};

use crate::GcReason;
use std::time::Instant;

/// Mutable scheduling state shared by all zones.
#[derive(Debug, Default, Clone)]
pub struct SchedulingState {
    in_high_frequency_gc_mode: bool,
    last_last_ditch_time: Option<Instant>,
}

impl SchedulingState {
    /// Fresh state: low-frequency mode, no last-ditch collection yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether collections are currently happening in quick succession.
    #[inline]
    pub fn in_high_frequency_gc_mode(&self) -> bool {
        self.in_high_frequency_gc_mode
    }

    /// Recompute the flag from the previous collection's time.
    pub fn update_high_frequency_mode(
        &mut self,
        last_gc_time: Option<Instant>,
        current_time: Instant,
        tunables: &SchedulingTunables,
    ) {
        self.in_high_frequency_gc_mode = match last_gc_time {
            Some(last) => last + tunables.high_frequency_threshold() > current_time,
            None => false,
        };
    }

    /// Triggers that mean the heap is growing fast force high-frequency mode.
    pub fn update_high_frequency_mode_for_reason(&mut self, reason: GcReason) {
        if matches!(reason, GcReason::AllocTrigger | GcReason::TooMuchMalloc) {
            self.in_high_frequency_gc_mode = true;
        }
    }

    /// Whether enough time has passed to allow another last-ditch collection.
    pub fn may_run_last_ditch_gc(&self, now: Instant, tunables: &SchedulingTunables) -> bool {
        match self.last_last_ditch_time {
            Some(last) => now.saturating_duration_since(last) >= tunables.min_last_ditch_gc_period(),
            None => true,
        }
    }

    /// Record a last-ditch collection.
    pub fn note_last_ditch_gc(&mut self, now: Instant) {
        self.last_last_ditch_time = Some(now);
    }

    /// Update the flag and the last-ditch clock as a major collection
    /// starts. Collections tearing the heap down say nothing about the
    /// mutator and leave the state alone.
    pub fn on_major_gc_start(
        &mut self,
        reason: GcReason,
        last_gc_time: Option<Instant>,
        now: Instant,
        tunables: &SchedulingTunables,
    ) {
        if reason.is_shutdown_reason() {
            return;
        }
        self.update_high_frequency_mode(last_gc_time, now, tunables);
        self.update_high_frequency_mode_for_reason(reason);
        if reason == GcReason::LastDitch {
            self.note_last_ditch_gc(now);
        }
    }
}
