//! Output timestamp extrapolation.
//!
//! Timestamps advance by the duration of the bytes produced. Durations
//! rarely divide evenly into microseconds, so the extrapolator keeps a
//! fractional-nanosecond carry; long sessions do not drift.

use crate::media_format::MediaFormat;

/// Timestamp tuple carried alongside data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimestampInfo {
    pub value_us: i64,
    pub valid: bool,
    /// Continues the previous stream; suppresses discontinuity checks.
    pub continue_flag: bool,
}

impl TimestampInfo {
    pub fn at(value_us: i64) -> Self {
        Self {
            value_us,
            valid: true,
            continue_flag: false,
        }
    }
}

/// Wall-clock source. The engine needs only "now, in microseconds";
/// tests substitute a fixed clock.
pub trait Clock: Send + Sync {
    fn now_us(&self) -> i64;
}

/// System monotonic clock.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    origin: std::sync::OnceLock<std::time::Instant>,
}

impl Clock for MonotonicClock {
    fn now_us(&self) -> i64 {
        let origin = self.origin.get_or_init(std::time::Instant::now);
        origin.elapsed().as_micros() as i64
    }
}

/// Extrapolates an output port's timestamp across produced frames.
#[derive(Debug, Default)]
pub struct TsExtrapolator {
    current_us: i64,
    valid: bool,
    /// Sub-microsecond remainder: numerator over the current format's
    /// bytes-per-second. Only meaningful for one format, so it resets on
    /// a media-format change.
    carry_frac: u64,
}

impl TsExtrapolator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt a stamped timestamp (resets the carry).
    pub fn set(&mut self, value_us: i64) {
        self.current_us = value_us;
        self.valid = true;
        self.carry_frac = 0;
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
        self.carry_frac = 0;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn current_us(&self) -> i64 {
        self.current_us
    }

    /// Advance by the duration of `bytes` under `mf`. Compressed formats
    /// carry no rate, so they do not advance.
    pub fn advance(&mut self, bytes: usize, mf: &MediaFormat) {
        let Some(pcm) = mf.as_pcm() else { return };
        let bytes_per_sec = pcm.bytes_per_sec();
        if bytes_per_sec == 0 || !self.valid {
            return;
        }
        let num = self.carry_frac as u128 + bytes as u128 * 1_000_000;
        self.current_us += (num / bytes_per_sec as u128) as i64;
        self.carry_frac = (num % bytes_per_sec as u128) as u64;
    }

    /// A media-format change invalidates the carry but keeps the value.
    pub fn on_media_format_change(&mut self) {
        self.carry_frac = 0;
    }

    /// Is `stamped` further than `tolerance_us` from the extrapolation.
    pub fn is_discontinuous(&self, stamped_us: i64, tolerance_us: u64) -> bool {
        if !self.valid {
            return false;
        }
        (stamped_us - self.current_us).unsigned_abs() > tolerance_us
    }
}
