//! Admit or reject requests based on observed capacity and host CPU load.

pub mod cpu;
mod future;
pub mod internal_event;
pub mod layer;
pub mod limiter;
pub mod service;
pub mod window;

use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};

pub use cpu::{CpuError, CpuProbe, CpuSampler, CpuSource, SysinfoProbe};
pub use future::ResponseFuture;
pub use layer::BbrLayer;
pub use limiter::{
    BbrLimiter, Completion, DROP_COOLDOWN, Limiter, LimiterError, LimiterStats, Outcome,
};
pub use service::BbrService;
pub use window::{Aggregation, MAX_BUCKETS, RollingCounter};

fn instant_now() -> std::time::Instant {
    tokio::time::Instant::now().into()
}

/// Configuration of the BBR limiter.
///
/// The defaults suit most services. A shorter `window` reacts faster to load changes but
/// estimates capacity from fewer samples; more `buckets` give finer expiry at the cost of a
/// longer scan per decision.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `window` | 10s | Trailing period the pass and latency statistics cover |
/// | `buckets` | 100 | Number of slots the window is split into |
/// | `cpu_threshold` | 0.8 | CPU fraction above which admission is bounded by the capacity estimate |
/// | `cpu_interval` | 500ms | How long each CPU measurement spans (at least 200ms) |
///
/// Zero or otherwise invalid values never fail construction; [`BbrSettings::normalized`]
/// replaces them with the defaults above.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use bbr_limiter::bbr::BbrSettings;
///
/// let settings = BbrSettings::builder()
///     .window(Duration::from_secs(5))
///     .buckets(50)
///     .cpu_threshold(0.9)
///     .build();
/// assert_eq!(settings.bucket_duration(), Duration::from_millis(100));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Builder, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BbrSettings {
    /// Length of the trailing statistics window.
    ///
    /// **Default**: 10 seconds
    #[builder(default = default_window())]
    #[serde(default = "default_window", rename = "window_ms", with = "millis")]
    pub(super) window: Duration,

    /// Number of buckets the window is divided into. Each bucket spans `window / buckets`.
    /// Counts above [`MAX_BUCKETS`] are capped.
    ///
    /// **Default**: 100
    #[builder(default = default_buckets())]
    #[serde(default = "default_buckets")]
    pub(super) buckets: usize,

    /// CPU usage, as a fraction in `(0, 1]`, above which the limiter starts enforcing the
    /// capacity estimate.
    ///
    /// **Default**: 0.8
    #[builder(default = default_cpu_threshold())]
    #[serde(default = "default_cpu_threshold")]
    pub(super) cpu_threshold: f64,

    /// Duration of each CPU measurement taken by the background sampler.
    ///
    /// The `sysinfo`-backed sampler measures over at least
    /// `sysinfo::MINIMUM_CPU_UPDATE_INTERVAL` (200ms), whatever shorter value is set here.
    ///
    /// **Default**: 500 milliseconds
    #[builder(default = default_cpu_interval())]
    #[serde(default = "default_cpu_interval", rename = "cpu_interval_ms", with = "millis")]
    pub(super) cpu_interval: Duration,
}

const fn default_window() -> Duration {
    Duration::from_secs(10)
}

const fn default_buckets() -> usize {
    100
}

const fn default_cpu_threshold() -> f64 {
    0.8
}

const fn default_cpu_interval() -> Duration {
    Duration::from_millis(500)
}

impl Default for BbrSettings {
    fn default() -> Self {
        Self {
            window: default_window(),
            buckets: default_buckets(),
            cpu_threshold: default_cpu_threshold(),
            cpu_interval: default_cpu_interval(),
        }
    }
}

impl BbrSettings {
    /// Returns a copy where every unset or out-of-range value is replaced by its default.
    pub fn normalized(mut self) -> Self {
        if self.window.is_zero() {
            self.window = default_window();
        }
        if self.buckets == 0 {
            self.buckets = default_buckets();
        }
        if !self.cpu_threshold.is_finite() || self.cpu_threshold <= 0.0 {
            self.cpu_threshold = default_cpu_threshold();
        }
        if self.cpu_interval.is_zero() {
            self.cpu_interval = default_cpu_interval();
        }
        self.buckets = self.buckets.min(MAX_BUCKETS);
        // A bucket must span at least one nanosecond.
        if self.bucket_duration().is_zero() {
            self.buckets = (self.window.as_nanos() as usize).max(1);
        }
        self
    }

    pub fn bucket_duration(&self) -> Duration {
        self.window / self.buckets.clamp(1, MAX_BUCKETS) as u32
    }

    pub fn get_window(&self) -> Duration {
        self.window
    }
    pub fn get_buckets(&self) -> usize {
        self.buckets
    }
    pub fn get_cpu_threshold(&self) -> f64 {
        self.cpu_threshold
    }
    pub fn get_cpu_interval(&self) -> Duration {
        self.cpu_interval
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
