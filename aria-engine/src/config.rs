//! Engine configuration.
//!
//! All tunables live in [`EngineConfig`], which deserializes from a
//! layered `config` source (file, then `ARIA_`-prefixed environment
//! overrides) or falls back to defaults.

use serde::{Deserialize, Serialize};

use aria_sync::{Error, Result};

/// Watchdog and loop-shape limits for the data-process scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Hard cap on outer wake-up iterations before the engine declares a
    /// runaway and drains commands only.
    pub outer_loop_max_iters: u32,
    /// Hard cap on inner topology iterations per wake-up.
    pub inner_loop_max_iters: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            outer_loop_max_iters: 100,
            inner_loop_max_iters: 1000,
        }
    }
}

/// Worker-thread parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Initial stack for the worker thread; a module bind can force a
    /// re-launch with a bigger one.
    pub stack_bytes: usize,
    /// Nominal thread priority (platform units).
    pub priority: i32,
    /// Ceiling the worker is raised to while handling propagation events.
    pub priority_ceiling: i32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            stack_bytes: 256 * 1024,
            priority: 10,
            priority_ceiling: 20,
        }
    }
}

/// Queue-pool sizing shared by every queue of the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuePoolConfig {
    pub max_arrays: usize,
    pub nodes_per_array: u16,
}

impl Default for QueuePoolConfig {
    fn default() -> Self {
        Self {
            max_arrays: 8,
            nodes_per_array: 32,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name used for the worker thread and log scoping.
    pub name: String,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub queue_pool: QueuePoolConfig,
    /// Timestamp discontinuity tolerance in microseconds; a stamped
    /// timestamp further than this from the extrapolated one raises the
    /// discontinuity event.
    pub ts_disc_tolerance_us: u64,
    /// Default frames accumulated per client output buffer; 0 means
    /// "fill as much as possible".
    pub default_frames_per_buffer: u32,
    /// Operating frame duration in microseconds, the endpoint threshold
    /// every module threshold must divide into.
    pub operating_frame_us: u32,
}

impl EngineConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ts_disc_tolerance_us: 2_000,
            default_frames_per_buffer: 1,
            operating_frame_us: 5_000,
            ..Self::default()
        }
    }

    /// Operating frame with the zero-config fallback applied.
    pub fn effective_operating_frame_us(&self) -> u32 {
        if self.operating_frame_us == 0 {
            5_000
        } else {
            self.operating_frame_us
        }
    }

    /// Load from an optional TOML file plus `ARIA_`-prefixed environment
    /// overrides (e.g. `ARIA_SCHEDULER__INNER_LOOP_MAX_ITERS=500`).
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("ARIA").separator("__"));
        let cfg = builder.build().map_err(|e| {
            tracing::error!(error = %e, "failed to assemble configuration");
            Error::BadParam
        })?;
        cfg.try_deserialize().map_err(|e| {
            tracing::error!(error = %e, "failed to deserialize configuration");
            Error::BadParam
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_watchdog_caps() {
        let cfg = EngineConfig::named("cntr");
        assert_eq!(cfg.scheduler.outer_loop_max_iters, 100);
        assert_eq!(cfg.scheduler.inner_loop_max_iters, 1000);
        assert_eq!(cfg.default_frames_per_buffer, 1);
    }

    #[test]
    fn load_without_file_yields_defaults() {
        let cfg = EngineConfig::load(None).unwrap();
        assert_eq!(cfg.scheduler.inner_loop_max_iters, 1000);
    }

    #[test]
    fn roundtrips_through_json() {
        let cfg = EngineConfig::named("cntr");
        let text = serde_json::to_string(&cfg).unwrap();
        let back: EngineConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.name, "cntr");
        assert_eq!(back.ts_disc_tolerance_us, 2_000);
    }
}
