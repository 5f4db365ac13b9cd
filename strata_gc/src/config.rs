//! GC configuration.
//!
//! [`GcConfig`] fixes what is decided once when a heap is built: which cell
//! kinds use the nursery, debugging aids, and the initial scheduling
//! parameters. Parameters can still be changed later through
//! [`GcHeap::set_parameter`](crate::GcHeap::set_parameter).

use crate::barrier::DEFAULT_STORE_BUFFER_ENTRIES;
use crate::heap::tenured::DEFAULT_BLOCK_SIZE;
use crate::scheduling::{ParamKey, SchedulingTunables, TunableError};
use std::time::Duration;
use thiserror::Error;

/// Env var holding the nursery profile threshold in milliseconds.
pub const PROFILE_NURSERY_ENV: &str = "STRATA_GC_PROFILE_NURSERY";

/// Env var holding `name=value` parameter overrides, comma separated.
pub const PARAMS_ENV: &str = "STRATA_GC_PARAMS";

/// Configuration for a [`GcHeap`](crate::GcHeap).
///
/// # Example
///
/// ```ignore
/// use strata_gc::{GcConfig, ParamKey};
///
/// let config = GcConfig {
///     nursery_strings: false,
///     parameters: vec![(ParamKey::MaxNurseryBytes, 4 * 1024 * 1024)],
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct GcConfig {
    // =========================================================================
    // Nursery
    // =========================================================================
    /// Allocate new cells in the nursery at all.
    ///
    /// Default: true
    pub generational: bool,

    /// Allow strings in the nursery.
    ///
    /// Default: true
    pub nursery_strings: bool,

    /// Allow BigInts in the nursery.
    ///
    /// Default: true
    pub nursery_bigints: bool,

    /// Cap on mapped nursery chunks, to simulate running out of memory.
    ///
    /// Default: None
    pub max_nursery_chunks: Option<usize>,

    /// Size of each store buffer list before a minor GC is requested.
    ///
    /// Default: 4096 entries
    pub store_buffer_entries: usize,

    // =========================================================================
    // Tenured
    // =========================================================================
    /// Size of tenured heap blocks.
    ///
    /// Default: 64KB
    pub tenured_block_size: usize,

    /// Cap on tenured cell bytes, to simulate running out of memory.
    ///
    /// Default: None
    pub max_tenured_bytes: Option<usize>,

    // =========================================================================
    // Scheduling
    // =========================================================================
    /// Parameter overrides applied in order when the heap is built.
    ///
    /// Default: empty
    pub parameters: Vec<(ParamKey, u32)>,

    // =========================================================================
    // Debugging
    // =========================================================================
    /// Log a per-phase profile for minor collections at least this long.
    ///
    /// Default: None
    pub profile_nursery: Option<Duration>,

    /// Fill fresh and swept nursery memory with marker bytes.
    ///
    /// Default: true in debug builds
    pub poison_nursery: bool,

    /// Validate memory accounting with a [`MemoryTracker`](crate::MemoryTracker).
    ///
    /// Default: true in debug builds or with the `memory-tracker` feature
    pub track_memory: bool,

    /// Check that no edge points into the nursery after each minor GC.
    ///
    /// Default: false
    pub verify_after_minor_gc: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            generational: true,
            nursery_strings: true,
            nursery_bigints: true,
            max_nursery_chunks: None,
            store_buffer_entries: DEFAULT_STORE_BUFFER_ENTRIES,

            tenured_block_size: DEFAULT_BLOCK_SIZE,
            max_tenured_bytes: None,

            parameters: Vec::new(),

            profile_nursery: None,
            poison_nursery: cfg!(debug_assertions),
            track_memory: cfg!(any(debug_assertions, feature = "memory-tracker")),
            verify_after_minor_gc: false,
        }
    }
}

impl GcConfig {
    /// Small nursery and low heap growth.
    pub fn low_memory() -> Self {
        Self {
            parameters: vec![
                (ParamKey::MinNurseryBytes, 64 * 1024),
                (ParamKey::MaxNurseryBytes, 4 * 1024 * 1024),
                (ParamKey::LowFrequencyHeapGrowth, 120),
                (ParamKey::HighFrequencyLargeHeapGrowth, 120),
                (ParamKey::HighFrequencySmallHeapGrowth, 150),
            ],
            ..Default::default()
        }
    }

    /// Large nursery and the balanced heap limit model.
    pub fn high_throughput() -> Self {
        Self {
            parameters: vec![
                (ParamKey::MinNurseryBytes, 1024 * 1024),
                (ParamKey::BalancedHeapLimitsEnabled, 1),
            ],
            ..Default::default()
        }
    }

    /// Every check switched on.
    pub fn debug() -> Self {
        Self {
            poison_nursery: true,
            track_memory: true,
            verify_after_minor_gc: true,
            ..Default::default()
        }
    }

    /// Defaults overridden from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let profile = std::env::var(PROFILE_NURSERY_ENV).ok();
        let params = std::env::var(PARAMS_ENV).ok();
        let mut config = Self::default();
        config.apply_env(profile.as_deref(), params.as_deref())?;
        Ok(config)
    }

    /// Apply the values of [`PROFILE_NURSERY_ENV`] and [`PARAMS_ENV`].
    pub fn apply_env(&mut self, profile: Option<&str>, params: Option<&str>) -> Result<(), ConfigError> {
        if let Some(value) = profile {
            let ms: u64 = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: PROFILE_NURSERY_ENV,
                value: value.to_string(),
            })?;
            self.profile_nursery = Some(Duration::from_millis(ms));
        }
        if let Some(value) = params {
            self.parameters.extend(parse_parameters(value)?);
        }
        Ok(())
    }

    /// Validate configuration values, including every parameter override.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store_buffer_entries < 16 {
            return Err(ConfigError::StoreBufferTooSmall);
        }
        if self.tenured_block_size < 4096 || !self.tenured_block_size.is_power_of_two() {
            return Err(ConfigError::InvalidBlockSize);
        }
        if self.max_nursery_chunks == Some(0) {
            return Err(ConfigError::NoNurseryChunks);
        }
        self.tunables().map(|_| ())
    }

    /// Tunables with every override applied.
    pub fn tunables(&self) -> Result<SchedulingTunables, ConfigError> {
        let mut tunables = SchedulingTunables::default();
        for &(key, value) in &self.parameters {
            tunables.set_parameter(key, value)?;
        }
        Ok(tunables)
    }
}

/// Parse `name=value,name=value`. Names are [`ParamKey::name`]s.
pub fn parse_parameters(overrides: &str) -> Result<Vec<(ParamKey, u32)>, ConfigError> {
    overrides
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let (name, value) = item
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidSyntax(item.to_string()))?;
            let key = ParamKey::from_name(name.trim())
                .ok_or_else(|| ConfigError::UnknownParameter(name.trim().to_string()))?;
            let value = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidSyntax(item.to_string()))?;
            Ok((key, value))
        })
        .collect()
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Store buffer lists must hold at least 16 entries.
    #[error("store buffer must hold at least 16 entries")]
    StoreBufferTooSmall,
    /// Tenured block size must be a power of two of at least 4KB.
    #[error("tenured block size must be a power of two, minimum 4KB")]
    InvalidBlockSize,
    /// The nursery chunk cap must allow one chunk.
    #[error("nursery chunk cap must be at least 1")]
    NoNurseryChunks,
    /// An environment variable could not be parsed.
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
    /// A parameter override is not `name=value`.
    #[error("invalid parameter override {0:?}")]
    InvalidSyntax(String),
    /// No parameter has this name.
    #[error("unknown GC parameter {0:?}")]
    UnknownParameter(String),
    /// A parameter value was rejected.
    #[error(transparent)]
    Parameter(#[from] TunableError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(GcConfig::default().validate().is_ok());
    }

    #[test]
    fn test_preset_configs_are_valid() {
        assert!(GcConfig::low_memory().validate().is_ok());
        assert!(GcConfig::high_throughput().validate().is_ok());
        assert!(GcConfig::debug().validate().is_ok());
    }

    #[test]
    fn test_invalid_block_size() {
        let config = GcConfig {
            tenured_block_size: 5000,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidBlockSize));
    }

    #[test]
    fn test_rejected_parameter() {
        let config = GcConfig {
            parameters: vec![(ParamKey::PretenureThreshold, 150)],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Parameter(_))));
    }

    #[test]
    fn test_parse_parameters() {
        let parsed = parse_parameters("max_nursery_bytes=1048576, pretenure_threshold=70,").unwrap();
        assert_eq!(
            parsed,
            vec![
                (ParamKey::MaxNurseryBytes, 1048576),
                (ParamKey::PretenureThreshold, 70)
            ]
        );
        assert_eq!(
            parse_parameters("bogus=1"),
            Err(ConfigError::UnknownParameter("bogus".to_string()))
        );
        assert!(matches!(parse_parameters("max_bytes"), Err(ConfigError::InvalidSyntax(_))));
    }

    #[test]
    fn test_apply_env() {
        let mut config = GcConfig::default();
        config
            .apply_env(Some("5"), Some("min_nursery_bytes=65536"))
            .unwrap();
        assert_eq!(config.profile_nursery, Some(Duration::from_millis(5)));
        assert_eq!(config.parameters, vec![(ParamKey::MinNurseryBytes, 65536)]);
        assert!(config.apply_env(Some("soon"), None).is_err());
    }
}
