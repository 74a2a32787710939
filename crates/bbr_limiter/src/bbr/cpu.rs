//! Background sampling of host CPU usage.
//!
//! A [`CpuSampler`] owns one dedicated OS thread that repeatedly measures aggregate CPU
//! usage over `interval` and publishes the result into a single atomic cell. Readers never
//! block: they see the latest published fraction, or `0.0` before the first sample lands.

use std::{
    fmt, io,
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use snafu::{ResultExt, Snafu, ensure};
use sysinfo::{MINIMUM_CPU_UPDATE_INTERVAL, System};

use super::internal_event::{CpuSampleFailed, CpuUsageSampled, InternalEvent};

const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);
const THREAD_NAME: &str = "bbr-cpu-sampler";

static SHARED: OnceLock<Arc<CpuSampler>> = OnceLock::new();

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CpuError {
    #[snafu(display("no CPUs reported by the host"))]
    NoCpus,

    #[snafu(display("CPU usage reading is not a number: {}", value))]
    InvalidReading { value: f64 },

    #[snafu(display("failed to spawn CPU sampler thread: {}", source))]
    SpawnThread { source: io::Error },
}

/// Measures aggregate host CPU usage.
pub trait CpuProbe: Send + 'static {
    /// Blocks for roughly `interval` and returns the usage observed over it, in percent
    /// (`0.0..=100.0`).
    fn measure(&mut self, interval: Duration) -> Result<f64, CpuError>;
}

/// [`CpuProbe`] backed by `sysinfo`.
///
/// `sysinfo` keeps CPU times unchanged when refreshed sooner than
/// [`MINIMUM_CPU_UPDATE_INTERVAL`] after the previous refresh, so every measurement spans at
/// least that long even when a shorter interval is requested.
pub struct SysinfoProbe {
    system: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self { system }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuProbe for SysinfoProbe {
    fn measure(&mut self, interval: Duration) -> Result<f64, CpuError> {
        // The previous refresh (or the one in `new`) is the baseline of this measurement.
        thread::sleep(interval.max(MINIMUM_CPU_UPDATE_INTERVAL));
        self.system.refresh_cpu_usage();

        ensure!(!self.system.cpus().is_empty(), NoCpusSnafu);
        let value = f64::from(self.system.global_cpu_usage());
        ensure!(value.is_finite(), InvalidReadingSnafu { value });
        Ok(value)
    }
}

/// Latest CPU usage of the host, refreshed by a background thread.
///
/// Share one sampler between every limiter of a process, either through
/// [`CpuSampler::shared`] or by handing the same `Arc` to each limiter.
#[derive(Debug)]
pub struct CpuSampler {
    usage: AtomicU64,
    interval_nanos: AtomicU64,
}

impl CpuSampler {
    /// Returns the process-wide sampler, starting it on first use.
    ///
    /// Every call returns the same handle, so only one sampling thread ever runs for it.
    pub fn shared() -> Arc<CpuSampler> {
        SHARED
            .get_or_init(|| {
                Self::start(DEFAULT_INTERVAL).unwrap_or_else(|error| {
                    error!(message = "CPU sampler unavailable; CPU usage will read as zero.", %error);
                    Arc::new(Self::idle(DEFAULT_INTERVAL))
                })
            })
            .clone()
    }

    /// Starts a sampler measuring with [`SysinfoProbe`].
    ///
    /// The sampling thread stops once every returned handle has been dropped.
    pub fn start(interval: Duration) -> Result<Arc<CpuSampler>, CpuError> {
        Self::start_with_probe(interval, SysinfoProbe::new())
    }

    pub fn start_with_probe<P: CpuProbe>(
        interval: Duration,
        probe: P,
    ) -> Result<Arc<CpuSampler>, CpuError> {
        let interval = if interval.is_zero() { DEFAULT_INTERVAL } else { interval };
        let sampler = Arc::new(Self::idle(interval));
        let weak = Arc::downgrade(&sampler);

        thread::Builder::new()
            .name(THREAD_NAME.to_owned())
            .spawn(move || sample_loop(weak, probe))
            .context(SpawnThreadSnafu)?;

        info!(message = "CPU sampler started.", interval_ms = %interval.as_millis());
        Ok(sampler)
    }

    pub(crate) fn idle(interval: Duration) -> Self {
        Self {
            usage: AtomicU64::new(0f64.to_bits()),
            interval_nanos: AtomicU64::new(duration_nanos(interval)),
        }
    }

    /// Most recent CPU usage as a fraction in `[0, 1]`.
    pub fn current(&self) -> f64 {
        f64::from_bits(self.usage.load(Ordering::Relaxed))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_nanos(self.interval_nanos.load(Ordering::Relaxed))
    }

    /// Changes the length of the next measurement. A zero interval is ignored.
    ///
    /// [`SysinfoProbe`] never measures over less than [`MINIMUM_CPU_UPDATE_INTERVAL`].
    pub fn set_interval(&self, interval: Duration) {
        if !interval.is_zero() {
            self.interval_nanos
                .store(duration_nanos(interval), Ordering::Relaxed);
        }
    }

    fn publish(&self, percent: f64) {
        let fraction = (percent / 100.0).clamp(0.0, 1.0);
        self.usage.store(fraction.to_bits(), Ordering::Relaxed);
        CpuUsageSampled { fraction }.emit();
    }
}

fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

fn sample_loop<P: CpuProbe>(sampler: Weak<CpuSampler>, mut probe: P) {
    loop {
        let Some(interval) = sampler.upgrade().map(|s| s.interval()) else {
            break;
        };

        let result = probe.measure(interval);

        let Some(sampler) = sampler.upgrade() else {
            break;
        };
        match result {
            Ok(percent) => sampler.publish(percent),
            Err(error) => {
                drop(sampler);
                CpuSampleFailed { error: &error }.emit();
                thread::sleep(interval);
            }
        }
    }
    debug!(message = "CPU sampler stopped.");
}

/// Where a limiter reads CPU usage from.
#[derive(Clone)]
pub enum CpuSource {
    /// A background [`CpuSampler`].
    Sampler(Arc<CpuSampler>),
    /// A caller-supplied function returning a fraction in `[0, 1]`.
    Custom(Arc<dyn Fn() -> f64 + Send + Sync>),
}

impl CpuSource {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        CpuSource::Custom(Arc::new(f))
    }

    pub fn current(&self) -> f64 {
        match self {
            CpuSource::Sampler(sampler) => sampler.current(),
            CpuSource::Custom(f) => f(),
        }
    }
}

impl fmt::Debug for CpuSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuSource::Sampler(sampler) => f.debug_tuple("Sampler").field(sampler).finish(),
            CpuSource::Custom(_) => f.debug_tuple("Custom").finish_non_exhaustive(),
        }
    }
}
