//! Named GC scheduling parameters.
//!
//! All mutation goes through [`SchedulingTunables::set_parameter`] and
//! [`SchedulingTunables::reset_parameter`]. Coupled pairs are adjusted
//! together before either returns, so readers never see a broken pair:
//!
//! - `small_heap_size_max_bytes < large_heap_size_min_bytes`
//! - `high_frequency_large_heap_growth <= high_frequency_small_heap_growth`
//! - `gc_min_nursery_bytes <= gc_max_nursery_bytes`

use crate::heap::chunk::{round_size, CHUNK_SIZE, PAGE_SIZE};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Eager trigger factor while in high-frequency mode.
pub const HIGH_FREQUENCY_EAGER_ALLOC_TRIGGER_FACTOR: f64 = 0.85;

/// Eager trigger factor otherwise.
pub const LOW_FREQUENCY_EAGER_ALLOC_TRIGGER_FACTOR: f64 = 0.9;

/// Growth factors below this could let an eager collection lower the trigger.
/// The high-frequency factor is the smaller of the two eager factors.
pub const MIN_HEAP_GROWTH_FACTOR: f64 = 1.0 / HIGH_FREQUENCY_EAGER_ALLOC_TRIGGER_FACTOR;

/// Upper bound for growth and incremental limit factors.
pub const MAX_HEAP_GROWTH_FACTOR: f64 = 100.0;

/// Nursery size parameters must be below this.
pub const MAX_NURSERY_BYTES_PARAM: usize = 128 * 1024 * 1024;

/// Compiled-in defaults.
pub mod defaults {
    use super::CHUNK_SIZE;

    /// Hard heap limit.
    pub const GC_MAX_BYTES: usize = 0xffff_ffff;
    /// Smallest nursery.
    pub const GC_MIN_NURSERY_BYTES: usize = 256 * 1024;
    /// Largest nursery.
    pub const GC_MAX_NURSERY_BYTES: usize = 64 * 1024 * 1024;
    /// Base for the zone GC heap trigger.
    pub const GC_ZONE_ALLOC_THRESHOLD_BASE: usize = 27 * 1024 * 1024;
    /// Base for the zone malloc heap trigger.
    pub const MALLOC_THRESHOLD_BASE: usize = 38 * 1024 * 1024;
    /// Incremental limit factor for small heaps.
    pub const SMALL_HEAP_INCREMENTAL_LIMIT: f64 = 1.50;
    /// Incremental limit factor for large heaps.
    pub const LARGE_HEAP_INCREMENTAL_LIMIT: f64 = 1.10;
    /// Allocation between incremental slices.
    pub const ZONE_ALLOC_DELAY_BYTES: usize = 1024 * 1024;
    /// Collections closer together than this are high frequency, in seconds.
    pub const HIGH_FREQUENCY_THRESHOLD_SECS: u64 = 1;
    /// Upper boundary of the small heap class.
    pub const SMALL_HEAP_SIZE_MAX_BYTES: usize = 100 * 1024 * 1024;
    /// Lower boundary of the large heap class.
    pub const LARGE_HEAP_SIZE_MIN_BYTES: usize = 500 * 1024 * 1024;
    /// High-frequency growth for small heaps.
    pub const HIGH_FREQUENCY_SMALL_HEAP_GROWTH: f64 = 3.0;
    /// High-frequency growth for large heaps.
    pub const HIGH_FREQUENCY_LARGE_HEAP_GROWTH: f64 = 1.5;
    /// Growth outside high-frequency mode.
    pub const LOW_FREQUENCY_HEAP_GROWTH: f64 = 1.5;
    /// Balanced heap limits are opt-in.
    pub const BALANCED_HEAP_LIMITS_ENABLED: bool = false;
    /// The `d` constant of the balanced heap limit.
    pub const HEAP_GROWTH_FACTOR: f64 = 50.0;
    /// Idle collection when less than this much nursery is free...
    pub const NURSERY_FREE_THRESHOLD_FOR_IDLE_COLLECTION: usize = CHUNK_SIZE / 4;
    /// ...and less than this fraction is free.
    pub const NURSERY_FREE_THRESHOLD_FOR_IDLE_COLLECTION_FRACTION: f64 = 0.25;
    /// An oversized nursery untouched for this long is collected and shrunk.
    pub const NURSERY_TIMEOUT_FOR_IDLE_COLLECTION_MS: u64 = 5000;
    /// Promotion rate above which pretenuring is considered.
    pub const PRETENURE_THRESHOLD: f64 = 0.6;
    /// Minimum tenured cells of a group before pretenuring it.
    pub const PRETENURE_GROUP_THRESHOLD: u32 = 3000;
    /// Fraction of a zone's nursery strings that must survive to pretenure.
    pub const PRETENURE_STRING_THRESHOLD: f64 = 0.55;
    /// Dead fraction of tenured strings that ends pretenuring.
    pub const STOP_PRETENURE_STRING_THRESHOLD: f64 = 0.9;
    /// Minimum time between last-ditch collections, in seconds.
    pub const MIN_LAST_DITCH_GC_PERIOD_SECS: u64 = 60;
    /// Headroom below which incremental slices become urgent.
    pub const URGENT_THRESHOLD_BYTES: usize = 16 * 1024 * 1024;
}

/// Identifies one tunable parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKey {
    /// Hard heap limit in bytes.
    MaxBytes,
    /// Minimum nursery size in bytes.
    MinNurseryBytes,
    /// Maximum nursery size in bytes.
    MaxNurseryBytes,
    /// High-frequency window in milliseconds.
    HighFrequencyTimeLimit,
    /// Small heap class boundary in MB.
    SmallHeapSizeMax,
    /// Large heap class boundary in MB.
    LargeHeapSizeMin,
    /// Small heap growth in high-frequency mode, percent.
    HighFrequencySmallHeapGrowth,
    /// Large heap growth in high-frequency mode, percent.
    HighFrequencyLargeHeapGrowth,
    /// Growth outside high-frequency mode, percent.
    LowFrequencyHeapGrowth,
    /// Non-zero selects the balanced heap limit model.
    BalancedHeapLimitsEnabled,
    /// The `d` constant of the balanced model.
    HeapGrowthFactor,
    /// Zone GC heap trigger base in MB.
    AllocationThreshold,
    /// Small heap incremental limit, percent.
    SmallHeapIncrementalLimit,
    /// Large heap incremental limit, percent.
    LargeHeapIncrementalLimit,
    /// Idle nursery collection free-bytes threshold.
    NurseryFreeThresholdForIdleCollection,
    /// Idle nursery collection free-space percentage.
    NurseryFreeThresholdForIdleCollectionPercent,
    /// Idle nursery timeout in milliseconds.
    NurseryTimeoutForIdleCollectionMs,
    /// Pretenure promotion rate, percent.
    PretenureThreshold,
    /// Pretenure group size.
    PretenureGroupThreshold,
    /// Pretenure string survival, percent.
    PretenureStringThreshold,
    /// Stop pretenuring strings dead fraction, percent.
    StopPretenureStringThreshold,
    /// Minimum last-ditch period in seconds.
    MinLastDitchGcPeriod,
    /// Slice allocation delay in KB.
    ZoneAllocDelayKb,
    /// Zone malloc heap trigger base in MB.
    MallocThresholdBase,
    /// Urgent headroom in MB.
    UrgentThresholdMb,
}

impl ParamKey {
    /// Every parameter.
    pub const ALL: [ParamKey; 25] = [
        ParamKey::MaxBytes,
        ParamKey::MinNurseryBytes,
        ParamKey::MaxNurseryBytes,
        ParamKey::HighFrequencyTimeLimit,
        ParamKey::SmallHeapSizeMax,
        ParamKey::LargeHeapSizeMin,
        ParamKey::HighFrequencySmallHeapGrowth,
        ParamKey::HighFrequencyLargeHeapGrowth,
        ParamKey::LowFrequencyHeapGrowth,
        ParamKey::BalancedHeapLimitsEnabled,
        ParamKey::HeapGrowthFactor,
        ParamKey::AllocationThreshold,
        ParamKey::SmallHeapIncrementalLimit,
        ParamKey::LargeHeapIncrementalLimit,
        ParamKey::NurseryFreeThresholdForIdleCollection,
        ParamKey::NurseryFreeThresholdForIdleCollectionPercent,
        ParamKey::NurseryTimeoutForIdleCollectionMs,
        ParamKey::PretenureThreshold,
        ParamKey::PretenureGroupThreshold,
        ParamKey::PretenureStringThreshold,
        ParamKey::StopPretenureStringThreshold,
        ParamKey::MinLastDitchGcPeriod,
        ParamKey::ZoneAllocDelayKb,
        ParamKey::MallocThresholdBase,
        ParamKey::UrgentThresholdMb,
    ];

    /// Snake-case name used in configuration strings.
    pub fn name(self) -> &'static str {
        match self {
            ParamKey::MaxBytes => "max_bytes",
            ParamKey::MinNurseryBytes => "min_nursery_bytes",
            ParamKey::MaxNurseryBytes => "max_nursery_bytes",
            ParamKey::HighFrequencyTimeLimit => "high_frequency_time_limit",
            ParamKey::SmallHeapSizeMax => "small_heap_size_max",
            ParamKey::LargeHeapSizeMin => "large_heap_size_min",
            ParamKey::HighFrequencySmallHeapGrowth => "high_frequency_small_heap_growth",
            ParamKey::HighFrequencyLargeHeapGrowth => "high_frequency_large_heap_growth",
            ParamKey::LowFrequencyHeapGrowth => "low_frequency_heap_growth",
            ParamKey::BalancedHeapLimitsEnabled => "balanced_heap_limits_enabled",
            ParamKey::HeapGrowthFactor => "heap_growth_factor",
            ParamKey::AllocationThreshold => "allocation_threshold",
            ParamKey::SmallHeapIncrementalLimit => "small_heap_incremental_limit",
            ParamKey::LargeHeapIncrementalLimit => "large_heap_incremental_limit",
            ParamKey::NurseryFreeThresholdForIdleCollection => {
                "nursery_free_threshold_for_idle_collection"
            }
            ParamKey::NurseryFreeThresholdForIdleCollectionPercent => {
                "nursery_free_threshold_for_idle_collection_percent"
            }
            ParamKey::NurseryTimeoutForIdleCollectionMs => "nursery_timeout_for_idle_collection_ms",
            ParamKey::PretenureThreshold => "pretenure_threshold",
            ParamKey::PretenureGroupThreshold => "pretenure_group_threshold",
            ParamKey::PretenureStringThreshold => "pretenure_string_threshold",
            ParamKey::StopPretenureStringThreshold => "stop_pretenure_string_threshold",
            ParamKey::MinLastDitchGcPeriod => "min_last_ditch_gc_period",
            ParamKey::ZoneAllocDelayKb => "zone_alloc_delay_kb",
            ParamKey::MallocThresholdBase => "malloc_threshold_base",
            ParamKey::UrgentThresholdMb => "urgent_threshold_mb",
        }
    }

    /// Look a parameter up by its [`name`](ParamKey::name).
    pub fn from_name(name: &str) -> Option<ParamKey> {
        ParamKey::ALL.into_iter().find(|key| key.name() == name)
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rejected parameter update. No tunable changes when this is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TunableError {
    /// Value outside the accepted range.
    #[error("value {value} is out of range for {key}")]
    OutOfRange {
        /// Parameter.
        key: ParamKey,
        /// Rejected value.
        value: u32,
    },
    /// Unit conversion overflowed.
    #[error("value {value} for {key} overflows when converted to bytes")]
    Overflow {
        /// Parameter.
        key: ParamKey,
        /// Rejected value.
        value: u32,
    },
}

/// Convert megabytes to bytes, limited to what fits in 32 bits.
pub fn megabytes_to_bytes(value: u32) -> Option<usize> {
    value
        .checked_mul(1024 * 1024)
        .map(|bytes| bytes as usize)
}

/// Convert kilobytes to bytes.
pub fn kilobytes_to_bytes(value: u32) -> Option<usize> {
    (value as usize).checked_mul(1024)
}

/// Policy knobs read by the heap thresholds and the nursery.
#[derive(Debug, Clone)]
pub struct SchedulingTunables {
    gc_max_bytes: usize,
    gc_min_nursery_bytes: usize,
    gc_max_nursery_bytes: usize,
    gc_zone_alloc_threshold_base: usize,
    small_heap_incremental_limit: f64,
    large_heap_incremental_limit: f64,
    zone_alloc_delay_bytes: usize,
    high_frequency_threshold: Duration,
    small_heap_size_max_bytes: usize,
    large_heap_size_min_bytes: usize,
    high_frequency_small_heap_growth: f64,
    high_frequency_large_heap_growth: f64,
    low_frequency_heap_growth: f64,
    balanced_heap_limits_enabled: bool,
    heap_growth_factor: f64,
    nursery_free_threshold_for_idle_collection: usize,
    nursery_free_threshold_for_idle_collection_fraction: f64,
    nursery_timeout_for_idle_collection: Duration,
    pretenure_threshold: f64,
    pretenure_group_threshold: u32,
    pretenure_string_threshold: f64,
    stop_pretenure_string_threshold: f64,
    min_last_ditch_gc_period: Duration,
    malloc_threshold_base: usize,
    urgent_threshold_bytes: usize,
}

impl Default for SchedulingTunables {
    fn default() -> Self {
        Self {
            gc_max_bytes: defaults::GC_MAX_BYTES,
            gc_min_nursery_bytes: round_size(defaults::GC_MIN_NURSERY_BYTES),
            gc_max_nursery_bytes: round_size(defaults::GC_MAX_NURSERY_BYTES),
            gc_zone_alloc_threshold_base: defaults::GC_ZONE_ALLOC_THRESHOLD_BASE,
            small_heap_incremental_limit: defaults::SMALL_HEAP_INCREMENTAL_LIMIT,
            large_heap_incremental_limit: defaults::LARGE_HEAP_INCREMENTAL_LIMIT,
            zone_alloc_delay_bytes: defaults::ZONE_ALLOC_DELAY_BYTES,
            high_frequency_threshold: Duration::from_secs(defaults::HIGH_FREQUENCY_THRESHOLD_SECS),
            small_heap_size_max_bytes: defaults::SMALL_HEAP_SIZE_MAX_BYTES,
            large_heap_size_min_bytes: defaults::LARGE_HEAP_SIZE_MIN_BYTES,
            high_frequency_small_heap_growth: defaults::HIGH_FREQUENCY_SMALL_HEAP_GROWTH,
            high_frequency_large_heap_growth: defaults::HIGH_FREQUENCY_LARGE_HEAP_GROWTH,
            low_frequency_heap_growth: defaults::LOW_FREQUENCY_HEAP_GROWTH,
            balanced_heap_limits_enabled: defaults::BALANCED_HEAP_LIMITS_ENABLED,
            heap_growth_factor: defaults::HEAP_GROWTH_FACTOR,
            nursery_free_threshold_for_idle_collection:
                defaults::NURSERY_FREE_THRESHOLD_FOR_IDLE_COLLECTION,
            nursery_free_threshold_for_idle_collection_fraction:
                defaults::NURSERY_FREE_THRESHOLD_FOR_IDLE_COLLECTION_FRACTION,
            nursery_timeout_for_idle_collection: Duration::from_millis(
                defaults::NURSERY_TIMEOUT_FOR_IDLE_COLLECTION_MS,
            ),
            pretenure_threshold: defaults::PRETENURE_THRESHOLD,
            pretenure_group_threshold: defaults::PRETENURE_GROUP_THRESHOLD,
            pretenure_string_threshold: defaults::PRETENURE_STRING_THRESHOLD,
            stop_pretenure_string_threshold: defaults::STOP_PRETENURE_STRING_THRESHOLD,
            min_last_ditch_gc_period: Duration::from_secs(defaults::MIN_LAST_DITCH_GC_PERIOD_SECS),
            malloc_threshold_base: defaults::MALLOC_THRESHOLD_BASE,
            urgent_threshold_bytes: defaults::URGENT_THRESHOLD_BYTES,
        }
    }
}

impl SchedulingTunables {
    /// Tunables with compiled-in defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store one parameter.
    ///
    /// Coupled parameters are adjusted in the same call. On error nothing
    /// changes.
    pub fn set_parameter(&mut self, key: ParamKey, value: u32) -> Result<(), TunableError> {
        let result = self.try_set_parameter(key, value);
        if let Err(err) = &result {
            debug!(%key, value, error = %err, "rejected GC parameter");
        }
        result
    }

    fn try_set_parameter(&mut self, key: ParamKey, value: u32) -> Result<(), TunableError> {
        let out_of_range = TunableError::OutOfRange { key, value };
        let overflow = TunableError::Overflow { key, value };
        let percent = value as f64 / 100.0;

        match key {
            ParamKey::MaxBytes => self.gc_max_bytes = value as usize,
            ParamKey::MinNurseryBytes => {
                let bytes = value as usize;
                if bytes < PAGE_SIZE || bytes >= MAX_NURSERY_BYTES_PARAM {
                    return Err(out_of_range);
                }
                let bytes = round_size(bytes);
                if bytes > self.gc_max_nursery_bytes {
                    return Err(out_of_range);
                }
                self.gc_min_nursery_bytes = bytes;
            }
            ParamKey::MaxNurseryBytes => {
                let bytes = value as usize;
                if bytes < PAGE_SIZE || bytes >= MAX_NURSERY_BYTES_PARAM {
                    return Err(out_of_range);
                }
                let bytes = round_size(bytes);
                if bytes < self.gc_min_nursery_bytes {
                    return Err(out_of_range);
                }
                self.gc_max_nursery_bytes = bytes;
            }
            ParamKey::HighFrequencyTimeLimit => {
                self.high_frequency_threshold = Duration::from_millis(value as u64);
            }
            ParamKey::SmallHeapSizeMax => {
                let bytes = megabytes_to_bytes(value).ok_or(overflow)?;
                self.set_small_heap_size_max_bytes(bytes);
            }
            ParamKey::LargeHeapSizeMin => {
                let bytes = megabytes_to_bytes(value).ok_or(overflow)?;
                if bytes == 0 {
                    return Err(out_of_range);
                }
                self.set_large_heap_size_min_bytes(bytes);
            }
            ParamKey::HighFrequencySmallHeapGrowth => {
                check_growth_factor(percent).ok_or(out_of_range)?;
                self.set_high_frequency_small_heap_growth(percent);
            }
            ParamKey::HighFrequencyLargeHeapGrowth => {
                check_growth_factor(percent).ok_or(out_of_range)?;
                self.set_high_frequency_large_heap_growth(percent);
            }
            ParamKey::LowFrequencyHeapGrowth => {
                check_growth_factor(percent).ok_or(out_of_range)?;
                self.low_frequency_heap_growth = percent;
            }
            ParamKey::BalancedHeapLimitsEnabled => self.balanced_heap_limits_enabled = value != 0,
            ParamKey::HeapGrowthFactor => self.heap_growth_factor = value as f64,
            ParamKey::AllocationThreshold => {
                self.gc_zone_alloc_threshold_base = megabytes_to_bytes(value).ok_or(overflow)?;
            }
            ParamKey::SmallHeapIncrementalLimit => {
                if !(1.0..=MAX_HEAP_GROWTH_FACTOR).contains(&percent) {
                    return Err(out_of_range);
                }
                self.small_heap_incremental_limit = percent;
            }
            ParamKey::LargeHeapIncrementalLimit => {
                if !(1.0..=MAX_HEAP_GROWTH_FACTOR).contains(&percent) {
                    return Err(out_of_range);
                }
                self.large_heap_incremental_limit = percent;
            }
            ParamKey::NurseryFreeThresholdForIdleCollection => {
                self.nursery_free_threshold_for_idle_collection =
                    (value as usize).min(self.gc_max_nursery_bytes);
            }
            ParamKey::NurseryFreeThresholdForIdleCollectionPercent => {
                check_percent(value).ok_or(out_of_range)?;
                self.nursery_free_threshold_for_idle_collection_fraction = percent;
            }
            ParamKey::NurseryTimeoutForIdleCollectionMs => {
                self.nursery_timeout_for_idle_collection = Duration::from_millis(value as u64);
            }
            ParamKey::PretenureThreshold => {
                // 100 disables pretenuring.
                check_percent(value).ok_or(out_of_range)?;
                self.pretenure_threshold = percent;
            }
            ParamKey::PretenureGroupThreshold => {
                if value == 0 {
                    return Err(out_of_range);
                }
                self.pretenure_group_threshold = value;
            }
            ParamKey::PretenureStringThreshold => {
                // 100 disables pretenuring.
                check_percent(value).ok_or(out_of_range)?;
                self.pretenure_string_threshold = percent;
            }
            ParamKey::StopPretenureStringThreshold => {
                check_percent(value).ok_or(out_of_range)?;
                self.stop_pretenure_string_threshold = percent;
            }
            ParamKey::MinLastDitchGcPeriod => {
                self.min_last_ditch_gc_period = Duration::from_secs(value as u64);
            }
            ParamKey::ZoneAllocDelayKb => {
                let bytes = kilobytes_to_bytes(value).ok_or(overflow)?;
                if bytes == 0 {
                    return Err(out_of_range);
                }
                self.zone_alloc_delay_bytes = bytes;
            }
            ParamKey::MallocThresholdBase => {
                self.malloc_threshold_base = megabytes_to_bytes(value).ok_or(overflow)?;
            }
            ParamKey::UrgentThresholdMb => {
                self.urgent_threshold_bytes = megabytes_to_bytes(value).ok_or(overflow)?;
            }
        }

        Ok(())
    }

    /// Restore one parameter's default, keeping coupled pairs consistent.
    pub fn reset_parameter(&mut self, key: ParamKey) {
        match key {
            ParamKey::MaxBytes => self.gc_max_bytes = defaults::GC_MAX_BYTES,
            ParamKey::MinNurseryBytes | ParamKey::MaxNurseryBytes => {
                // Reset together to keep min <= max.
                self.gc_min_nursery_bytes = round_size(defaults::GC_MIN_NURSERY_BYTES);
                self.gc_max_nursery_bytes = round_size(defaults::GC_MAX_NURSERY_BYTES);
            }
            ParamKey::HighFrequencyTimeLimit => {
                self.high_frequency_threshold =
                    Duration::from_secs(defaults::HIGH_FREQUENCY_THRESHOLD_SECS);
            }
            ParamKey::SmallHeapSizeMax => {
                self.set_small_heap_size_max_bytes(defaults::SMALL_HEAP_SIZE_MAX_BYTES)
            }
            ParamKey::LargeHeapSizeMin => {
                self.set_large_heap_size_min_bytes(defaults::LARGE_HEAP_SIZE_MIN_BYTES)
            }
            ParamKey::HighFrequencySmallHeapGrowth => {
                self.set_high_frequency_small_heap_growth(defaults::HIGH_FREQUENCY_SMALL_HEAP_GROWTH)
            }
            ParamKey::HighFrequencyLargeHeapGrowth => {
                self.set_high_frequency_large_heap_growth(defaults::HIGH_FREQUENCY_LARGE_HEAP_GROWTH)
            }
            ParamKey::LowFrequencyHeapGrowth => {
                self.low_frequency_heap_growth = defaults::LOW_FREQUENCY_HEAP_GROWTH
            }
            ParamKey::BalancedHeapLimitsEnabled => {
                self.balanced_heap_limits_enabled = defaults::BALANCED_HEAP_LIMITS_ENABLED
            }
            ParamKey::HeapGrowthFactor => self.heap_growth_factor = defaults::HEAP_GROWTH_FACTOR,
            ParamKey::AllocationThreshold => {
                self.gc_zone_alloc_threshold_base = defaults::GC_ZONE_ALLOC_THRESHOLD_BASE
            }
            ParamKey::SmallHeapIncrementalLimit => {
                self.small_heap_incremental_limit = defaults::SMALL_HEAP_INCREMENTAL_LIMIT
            }
            ParamKey::LargeHeapIncrementalLimit => {
                self.large_heap_incremental_limit = defaults::LARGE_HEAP_INCREMENTAL_LIMIT
            }
            ParamKey::NurseryFreeThresholdForIdleCollection => {
                self.nursery_free_threshold_for_idle_collection =
                    defaults::NURSERY_FREE_THRESHOLD_FOR_IDLE_COLLECTION
            }
            ParamKey::NurseryFreeThresholdForIdleCollectionPercent => {
                self.nursery_free_threshold_for_idle_collection_fraction =
                    defaults::NURSERY_FREE_THRESHOLD_FOR_IDLE_COLLECTION_FRACTION
            }
            ParamKey::NurseryTimeoutForIdleCollectionMs => {
                self.nursery_timeout_for_idle_collection =
                    Duration::from_millis(defaults::NURSERY_TIMEOUT_FOR_IDLE_COLLECTION_MS)
            }
            ParamKey::PretenureThreshold => self.pretenure_threshold = defaults::PRETENURE_THRESHOLD,
            ParamKey::PretenureGroupThreshold => {
                self.pretenure_group_threshold = defaults::PRETENURE_GROUP_THRESHOLD
            }
            ParamKey::PretenureStringThreshold => {
                self.pretenure_string_threshold = defaults::PRETENURE_STRING_THRESHOLD
            }
            ParamKey::StopPretenureStringThreshold => {
                self.stop_pretenure_string_threshold = defaults::STOP_PRETENURE_STRING_THRESHOLD
            }
            ParamKey::MinLastDitchGcPeriod => {
                self.min_last_ditch_gc_period =
                    Duration::from_secs(defaults::MIN_LAST_DITCH_GC_PERIOD_SECS)
            }
            ParamKey::ZoneAllocDelayKb => {
                self.zone_alloc_delay_bytes = defaults::ZONE_ALLOC_DELAY_BYTES
            }
            ParamKey::MallocThresholdBase => {
                self.malloc_threshold_base = defaults::MALLOC_THRESHOLD_BASE
            }
            ParamKey::UrgentThresholdMb => {
                self.urgent_threshold_bytes = defaults::URGENT_THRESHOLD_BYTES
            }
        }
    }

    /// Current value of a parameter in the units `set_parameter` accepts.
    pub fn get_parameter(&self, key: ParamKey) -> u32 {
        const MB: usize = 1024 * 1024;
        let percent = |factor: f64| (factor * 100.0).round() as u32;
        let clamp = |value: usize| value.min(u32::MAX as usize) as u32;

        match key {
            ParamKey::MaxBytes => clamp(self.gc_max_bytes),
            ParamKey::MinNurseryBytes => clamp(self.gc_min_nursery_bytes),
            ParamKey::MaxNurseryBytes => clamp(self.gc_max_nursery_bytes),
            ParamKey::HighFrequencyTimeLimit => {
                self.high_frequency_threshold.as_millis().min(u32::MAX as u128) as u32
            }
            ParamKey::SmallHeapSizeMax => clamp(self.small_heap_size_max_bytes / MB),
            ParamKey::LargeHeapSizeMin => clamp(self.large_heap_size_min_bytes / MB),
            ParamKey::HighFrequencySmallHeapGrowth => percent(self.high_frequency_small_heap_growth),
            ParamKey::HighFrequencyLargeHeapGrowth => percent(self.high_frequency_large_heap_growth),
            ParamKey::LowFrequencyHeapGrowth => percent(self.low_frequency_heap_growth),
            ParamKey::BalancedHeapLimitsEnabled => self.balanced_heap_limits_enabled as u32,
            ParamKey::HeapGrowthFactor => self.heap_growth_factor as u32,
            ParamKey::AllocationThreshold => clamp(self.gc_zone_alloc_threshold_base / MB),
            ParamKey::SmallHeapIncrementalLimit => percent(self.small_heap_incremental_limit),
            ParamKey::LargeHeapIncrementalLimit => percent(self.large_heap_incremental_limit),
            ParamKey::NurseryFreeThresholdForIdleCollection => {
                clamp(self.nursery_free_threshold_for_idle_collection)
            }
            ParamKey::NurseryFreeThresholdForIdleCollectionPercent => {
                percent(self.nursery_free_threshold_for_idle_collection_fraction)
            }
            ParamKey::NurseryTimeoutForIdleCollectionMs => {
                self.nursery_timeout_for_idle_collection.as_millis().min(u32::MAX as u128) as u32
            }
            ParamKey::PretenureThreshold => percent(self.pretenure_threshold),
            ParamKey::PretenureGroupThreshold => self.pretenure_group_threshold,
            ParamKey::PretenureStringThreshold => percent(self.pretenure_string_threshold),
            ParamKey::StopPretenureStringThreshold => percent(self.stop_pretenure_string_threshold),
            ParamKey::MinLastDitchGcPeriod => {
                self.min_last_ditch_gc_period.as_secs().min(u32::MAX as u64) as u32
            }
            ParamKey::ZoneAllocDelayKb => clamp(self.zone_alloc_delay_bytes / 1024),
            ParamKey::MallocThresholdBase => clamp(self.malloc_threshold_base / MB),
            ParamKey::UrgentThresholdMb => clamp(self.urgent_threshold_bytes / MB),
        }
    }

    fn set_small_heap_size_max_bytes(&mut self, value: usize) {
        self.small_heap_size_max_bytes = value;
        if self.small_heap_size_max_bytes >= self.large_heap_size_min_bytes {
            self.large_heap_size_min_bytes = self.small_heap_size_max_bytes + 1;
        }
        debug_assert!(self.large_heap_size_min_bytes > self.small_heap_size_max_bytes);
    }

    fn set_large_heap_size_min_bytes(&mut self, value: usize) {
        debug_assert!(value > 0);
        self.large_heap_size_min_bytes = value;
        if self.large_heap_size_min_bytes <= self.small_heap_size_max_bytes {
            self.small_heap_size_max_bytes = self.large_heap_size_min_bytes - 1;
        }
        debug_assert!(self.large_heap_size_min_bytes > self.small_heap_size_max_bytes);
    }

    fn set_high_frequency_large_heap_growth(&mut self, value: f64) {
        self.high_frequency_large_heap_growth = value;
        if self.high_frequency_large_heap_growth > self.high_frequency_small_heap_growth {
            self.high_frequency_small_heap_growth = self.high_frequency_large_heap_growth;
        }
        debug_assert!(self.high_frequency_large_heap_growth <= self.high_frequency_small_heap_growth);
    }

    fn set_high_frequency_small_heap_growth(&mut self, value: f64) {
        self.high_frequency_small_heap_growth = value;
        if self.high_frequency_small_heap_growth < self.high_frequency_large_heap_growth {
            self.high_frequency_large_heap_growth = self.high_frequency_small_heap_growth;
        }
        debug_assert!(self.high_frequency_large_heap_growth <= self.high_frequency_small_heap_growth);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Hard heap limit.
    #[inline]
    pub fn gc_max_bytes(&self) -> usize {
        self.gc_max_bytes
    }

    /// Smallest nursery capacity.
    #[inline]
    pub fn gc_min_nursery_bytes(&self) -> usize {
        self.gc_min_nursery_bytes
    }

    /// Largest nursery capacity.
    #[inline]
    pub fn gc_max_nursery_bytes(&self) -> usize {
        self.gc_max_nursery_bytes
    }

    /// Base of the zone GC heap trigger.
    #[inline]
    pub fn gc_zone_alloc_threshold_base(&self) -> usize {
        self.gc_zone_alloc_threshold_base
    }

    /// Incremental limit factor for small heaps.
    #[inline]
    pub fn small_heap_incremental_limit(&self) -> f64 {
        self.small_heap_incremental_limit
    }

    /// Incremental limit factor for large heaps.
    #[inline]
    pub fn large_heap_incremental_limit(&self) -> f64 {
        self.large_heap_incremental_limit
    }

    /// Allocation between incremental slices.
    #[inline]
    pub fn zone_alloc_delay_bytes(&self) -> usize {
        self.zone_alloc_delay_bytes
    }

    /// High-frequency window.
    #[inline]
    pub fn high_frequency_threshold(&self) -> Duration {
        self.high_frequency_threshold
    }

    /// Small heap class boundary.
    #[inline]
    pub fn small_heap_size_max_bytes(&self) -> usize {
        self.small_heap_size_max_bytes
    }

    /// Large heap class boundary.
    #[inline]
    pub fn large_heap_size_min_bytes(&self) -> usize {
        self.large_heap_size_min_bytes
    }

    /// High-frequency growth for small heaps.
    #[inline]
    pub fn high_frequency_small_heap_growth(&self) -> f64 {
        self.high_frequency_small_heap_growth
    }

    /// High-frequency growth for large heaps.
    #[inline]
    pub fn high_frequency_large_heap_growth(&self) -> f64 {
        self.high_frequency_large_heap_growth
    }

    /// Growth outside high-frequency mode.
    #[inline]
    pub fn low_frequency_heap_growth(&self) -> f64 {
        self.low_frequency_heap_growth
    }

    /// Whether the balanced model computes GC heap start thresholds.
    #[inline]
    pub fn balanced_heap_limits_enabled(&self) -> bool {
        self.balanced_heap_limits_enabled
    }

    /// The `d` constant of the balanced model.
    #[inline]
    pub fn heap_growth_factor(&self) -> f64 {
        self.heap_growth_factor
    }

    /// Idle nursery collection free-bytes threshold.
    #[inline]
    pub fn nursery_free_threshold_for_idle_collection(&self) -> usize {
        self.nursery_free_threshold_for_idle_collection
    }

    /// Idle nursery collection free fraction.
    #[inline]
    pub fn nursery_free_threshold_for_idle_collection_fraction(&self) -> f64 {
        self.nursery_free_threshold_for_idle_collection_fraction
    }

    /// Idle nursery timeout.
    #[inline]
    pub fn nursery_timeout_for_idle_collection(&self) -> Duration {
        self.nursery_timeout_for_idle_collection
    }

    /// Promotion rate above which pretenuring is considered.
    #[inline]
    pub fn pretenure_threshold(&self) -> f64 {
        self.pretenure_threshold
    }

    /// Minimum group size for pretenuring.
    #[inline]
    pub fn pretenure_group_threshold(&self) -> u32 {
        self.pretenure_group_threshold
    }

    /// Nursery string survival fraction that starts pretenuring.
    #[inline]
    pub fn pretenure_string_threshold(&self) -> f64 {
        self.pretenure_string_threshold
    }

    /// Dead tenured string fraction that stops pretenuring.
    #[inline]
    pub fn stop_pretenure_string_threshold(&self) -> f64 {
        self.stop_pretenure_string_threshold
    }

    /// Minimum time between last-ditch collections.
    #[inline]
    pub fn min_last_ditch_gc_period(&self) -> Duration {
        self.min_last_ditch_gc_period
    }

    /// Base of the zone malloc heap trigger.
    #[inline]
    pub fn malloc_threshold_base(&self) -> usize {
        self.malloc_threshold_base
    }

    /// Headroom below which slices become urgent.
    #[inline]
    pub fn urgent_threshold_bytes(&self) -> usize {
        self.urgent_threshold_bytes
    }
}

#[inline]
fn check_growth_factor(factor: f64) -> Option<()> {
    (MIN_HEAP_GROWTH_FACTOR..=MAX_HEAP_GROWTH_FACTOR)
        .contains(&factor)
        .then_some(())
}

#[inline]
fn check_percent(value: u32) -> Option<()> {
    (1..=100).contains(&value).then_some(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: usize = 1024 * 1024;

    #[test]
    fn test_defaults_satisfy_invariants() {
        let t = SchedulingTunables::default();
        assert!(t.large_heap_size_min_bytes() > t.small_heap_size_max_bytes());
        assert!(t.high_frequency_large_heap_growth() <= t.high_frequency_small_heap_growth());
        assert!(t.gc_min_nursery_bytes() <= t.gc_max_nursery_bytes());
        assert_eq!(t.gc_min_nursery_bytes(), 256 * 1024);
        assert_eq!(t.gc_max_nursery_bytes(), 64 * MB);
    }

    #[test]
    fn test_min_nursery_above_max_is_rejected() {
        let mut t = SchedulingTunables::default();
        t.set_parameter(ParamKey::MaxNurseryBytes, 1024 * 1024).unwrap();

        let err = t.set_parameter(ParamKey::MinNurseryBytes, 4 * 1024 * 1024);
        assert_eq!(
            err,
            Err(TunableError::OutOfRange {
                key: ParamKey::MinNurseryBytes,
                value: 4 * 1024 * 1024
            })
        );
        assert_eq!(t.gc_min_nursery_bytes(), 256 * 1024);
        assert_eq!(t.gc_max_nursery_bytes(), MB);
    }

    #[test]
    fn test_nursery_bounds_are_range_checked_and_rounded() {
        let mut t = SchedulingTunables::default();
        assert!(t.set_parameter(ParamKey::MinNurseryBytes, 100).is_err());
        assert!(t
            .set_parameter(ParamKey::MaxNurseryBytes, MAX_NURSERY_BYTES_PARAM as u32)
            .is_err());

        t.set_parameter(ParamKey::MinNurseryBytes, 10_000).unwrap();
        assert_eq!(t.gc_min_nursery_bytes(), 8 * 1024);

        t.set_parameter(ParamKey::MaxNurseryBytes, 3 * CHUNK_SIZE as u32 + 100).unwrap();
        assert_eq!(t.gc_max_nursery_bytes(), 3 * CHUNK_SIZE);
    }

    #[test]
    fn test_heap_size_boundaries_stay_ordered() {
        let mut t = SchedulingTunables::default();

        t.set_parameter(ParamKey::SmallHeapSizeMax, 600).unwrap();
        assert_eq!(t.small_heap_size_max_bytes(), 600 * MB);
        assert_eq!(t.large_heap_size_min_bytes(), 600 * MB + 1);

        t.set_parameter(ParamKey::LargeHeapSizeMin, 50).unwrap();
        assert_eq!(t.large_heap_size_min_bytes(), 50 * MB);
        assert_eq!(t.small_heap_size_max_bytes(), 50 * MB - 1);

        // Equal inputs nudge the other boundary by one byte.
        t.set_parameter(ParamKey::SmallHeapSizeMax, 50).unwrap();
        assert_eq!(t.large_heap_size_min_bytes(), 50 * MB + 1);
    }

    #[test]
    fn test_large_heap_size_min_rejects_zero_and_overflow() {
        let mut t = SchedulingTunables::default();
        assert!(matches!(
            t.set_parameter(ParamKey::LargeHeapSizeMin, 0),
            Err(TunableError::OutOfRange { .. })
        ));
        assert!(matches!(
            t.set_parameter(ParamKey::LargeHeapSizeMin, 4096),
            Err(TunableError::Overflow { .. })
        ));
        assert_eq!(t.large_heap_size_min_bytes(), defaults::LARGE_HEAP_SIZE_MIN_BYTES);
    }

    #[test]
    fn test_growth_factors_stay_ordered() {
        let mut t = SchedulingTunables::default();

        t.set_parameter(ParamKey::HighFrequencyLargeHeapGrowth, 400).unwrap();
        assert_eq!(t.high_frequency_large_heap_growth(), 4.0);
        assert_eq!(t.high_frequency_small_heap_growth(), 4.0);

        t.set_parameter(ParamKey::HighFrequencySmallHeapGrowth, 150).unwrap();
        assert_eq!(t.high_frequency_small_heap_growth(), 1.5);
        assert_eq!(t.high_frequency_large_heap_growth(), 1.5);
    }

    #[test]
    fn test_growth_factor_bounds() {
        let mut t = SchedulingTunables::default();
        assert!(t.set_parameter(ParamKey::LowFrequencyHeapGrowth, 110).is_err());
        assert!(t.set_parameter(ParamKey::LowFrequencyHeapGrowth, 10_001).is_err());
        assert!(t.set_parameter(ParamKey::LowFrequencyHeapGrowth, 118).is_ok());
        assert!(t.set_parameter(ParamKey::SmallHeapIncrementalLimit, 99).is_err());
        assert!(t.set_parameter(ParamKey::LargeHeapIncrementalLimit, 100).is_ok());
    }

    #[test]
    fn test_megabyte_conversion_is_checked() {
        assert_eq!(megabytes_to_bytes(1), Some(MB));
        assert_eq!(megabytes_to_bytes(4095), Some(4095 * MB));
        assert_eq!(megabytes_to_bytes(4096), None);
        assert_eq!(kilobytes_to_bytes(3), Some(3072));
    }

    #[test]
    fn test_zone_alloc_delay_rejects_zero() {
        let mut t = SchedulingTunables::default();
        assert!(t.set_parameter(ParamKey::ZoneAllocDelayKb, 0).is_err());
        t.set_parameter(ParamKey::ZoneAllocDelayKb, 512).unwrap();
        assert_eq!(t.zone_alloc_delay_bytes(), 512 * 1024);
    }

    #[test]
    fn test_idle_threshold_is_clamped_to_max_nursery() {
        let mut t = SchedulingTunables::default();
        t.set_parameter(ParamKey::NurseryFreeThresholdForIdleCollection, u32::MAX)
            .unwrap();
        assert_eq!(
            t.nursery_free_threshold_for_idle_collection(),
            t.gc_max_nursery_bytes()
        );
    }

    #[test]
    fn test_reset_restores_defaults_with_coupling() {
        let mut t = SchedulingTunables::default();
        t.set_parameter(ParamKey::MaxNurseryBytes, 8 * 1024 * 1024).unwrap();
        t.set_parameter(ParamKey::MinNurseryBytes, 8 * 1024 * 1024).unwrap();
        t.reset_parameter(ParamKey::MaxNurseryBytes);
        assert_eq!(t.gc_min_nursery_bytes(), 256 * 1024);
        assert_eq!(t.gc_max_nursery_bytes(), 64 * MB);

        t.set_parameter(ParamKey::SmallHeapSizeMax, 700).unwrap();
        t.reset_parameter(ParamKey::SmallHeapSizeMax);
        assert_eq!(t.small_heap_size_max_bytes(), 100 * MB);
        assert_eq!(t.large_heap_size_min_bytes(), 700 * MB + 1);
        assert!(t.large_heap_size_min_bytes() > t.small_heap_size_max_bytes());
    }

    #[test]
    fn test_get_parameter_reports_set_values() {
        let mut t = SchedulingTunables::default();
        t.set_parameter(ParamKey::HighFrequencySmallHeapGrowth, 250).unwrap();
        t.set_parameter(ParamKey::AllocationThreshold, 40).unwrap();
        t.set_parameter(ParamKey::PretenureThreshold, 70).unwrap();
        assert_eq!(t.get_parameter(ParamKey::HighFrequencySmallHeapGrowth), 250);
        assert_eq!(t.get_parameter(ParamKey::AllocationThreshold), 40);
        assert_eq!(t.get_parameter(ParamKey::PretenureThreshold), 70);
        assert_eq!(t.get_parameter(ParamKey::HighFrequencyTimeLimit), 1000);
    }

    #[test]
    fn test_param_names_are_unique() {
        for key in ParamKey::ALL {
            assert_eq!(ParamKey::from_name(key.name()), Some(key));
        }
        assert_eq!(ParamKey::from_name("no_such_param"), None);
    }
}
