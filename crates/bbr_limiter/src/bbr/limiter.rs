use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::{Duration, Instant},
};

use arc_swap::ArcSwapOption;
use http::StatusCode;
use snafu::Snafu;

use super::{
    BbrSettings,
    cpu::{CpuSampler, CpuSource},
    instant_now,
    internal_event::{
        DropCooldownCleared, InternalEvent, RequestAdmitted, RequestCompleted, RequestRejected,
    },
    window::{Aggregation, RollingCounter},
};

/// How long the limiter keeps enforcing its capacity estimate after a rejection, even when
/// CPU usage has dropped back under the threshold.
pub const DROP_COOLDOWN: Duration = Duration::from_secs(1);

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LimiterError {
    /// The service is at its estimated capacity; the request was not admitted.
    #[snafu(display("rate limit exceeded"))]
    LimitExceeded,
}

impl LimiterError {
    /// HTTP status a server should answer a rejected request with.
    pub const fn status_code(&self) -> StatusCode {
        match self {
            LimiterError::LimitExceeded => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

/// Result classification reported when an admitted request finishes.
///
/// Only successful requests feed the capacity estimate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    /// Classifies an HTTP status code: `200..=299` is a success.
    pub fn from_status(status: u16) -> Self {
        if (200..=299).contains(&status) {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }

    pub const fn is_success(self) -> bool {
        matches!(self, Outcome::Success)
    }
}

impl From<StatusCode> for Outcome {
    fn from(status: StatusCode) -> Self {
        Outcome::from_status(status.as_u16())
    }
}

/// Admission control entry point.
pub trait Limiter: Send + Sync {
    /// Decides whether one more request may start.
    ///
    /// On success the caller owns a [`Completion`] for the request and reports its outcome
    /// through it once the request is done.
    fn allow(&self) -> Result<Completion, LimiterError>;
}

impl<L: Limiter + ?Sized> Limiter for Arc<L> {
    fn allow(&self) -> Result<Completion, LimiterError> {
        (**self).allow()
    }
}

/// A point-in-time view of the limiter's inputs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LimiterStats {
    pub cpu: f64,
    pub inflight: i64,
    /// Most successful completions seen in one bucket of the window.
    pub max_pass: i64,
    /// Fastest successful completion in the window, in milliseconds.
    pub min_rt_ms: i64,
    pub max_inflight: f64,
    /// Time since the last rejection, while the drop cooldown marker is set.
    pub since_last_drop: Option<Duration>,
}

#[derive(Debug)]
struct Shared {
    settings: BbrSettings,
    inflight: AtomicI64,
    last_drop: ArcSwapOption<Instant>,
    pass_stat: RollingCounter,
    rt_stat: RollingCounter,
    cpu: CpuSource,
}

impl Shared {
    fn should_drop(&self) -> bool {
        let cpu = self.cpu.current();
        if cpu < self.settings.cpu_threshold {
            let Some(last_drop) = self.last_drop.load().as_deref().copied() else {
                return false;
            };
            let since_last_drop = instant_now().saturating_duration_since(last_drop);
            if since_last_drop > DROP_COOLDOWN {
                self.last_drop.store(None);
                DropCooldownCleared { since_last_drop }.emit();
                return false;
            }
        }

        let inflight = self.inflight.load(Ordering::Acquire);
        if inflight <= 1 {
            return false;
        }

        let max_inflight = self.max_inflight();
        if inflight as f64 > max_inflight {
            self.last_drop.store(Some(Arc::new(instant_now())));
            RequestRejected {
                cpu,
                inflight,
                max_inflight,
            }
            .emit();
            return true;
        }

        false
    }

    /// `max_pass * min_rt / bucket_duration`: the number of requests that can be in flight at
    /// the best observed latency while completing at the best observed rate.
    fn max_inflight(&self) -> f64 {
        let max_pass = self.pass_stat.max() as f64;
        let min_rt_secs = self.rt_stat.min() as f64 / 1000.0;
        let bucket_secs = self.settings.bucket_duration().as_secs_f64();
        max_pass * min_rt_secs / bucket_secs
    }

    /// Decrements `inflight` without letting it go below zero. Returns the new value.
    fn release(&self) -> i64 {
        let previous = self
            .inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some((n - 1).max(0)))
            .unwrap_or_else(|n| n);
        (previous - 1).max(0)
    }
}

/// CPU-aware adaptive limiter.
///
/// Cloning is cheap and every clone shares the same statistics, so one limiter can guard a
/// whole service or one endpoint, whichever owns it.
#[derive(Clone, Debug)]
pub struct BbrLimiter {
    shared: Arc<Shared>,
}

impl BbrLimiter {
    /// Creates a limiter reading CPU usage from the process-wide [`CpuSampler`].
    ///
    /// The sampler's interval is updated to `settings`' CPU interval, unless that is zero.
    pub fn new(settings: BbrSettings) -> Self {
        Self::with_sampler(settings, CpuSampler::shared())
    }

    fn with_sampler(settings: BbrSettings, sampler: Arc<CpuSampler>) -> Self {
        sampler.set_interval(settings.cpu_interval);
        Self::with_cpu_source(settings, CpuSource::Sampler(sampler))
    }

    pub fn with_cpu_source(settings: BbrSettings, cpu: CpuSource) -> Self {
        let settings = settings.normalized();
        Self {
            shared: Arc::new(Shared {
                settings,
                inflight: AtomicI64::new(0),
                last_drop: ArcSwapOption::empty(),
                pass_stat: RollingCounter::new(settings.window, settings.buckets, Aggregation::Sum),
                rt_stat: RollingCounter::new(settings.window, settings.buckets, Aggregation::Min),
                cpu,
            }),
        }
    }

    pub fn settings(&self) -> &BbrSettings {
        &self.shared.settings
    }

    /// Number of admitted requests that have not completed yet.
    pub fn inflight(&self) -> i64 {
        self.shared.inflight.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn set_inflight(&self, inflight: i64) {
        self.shared.inflight.store(inflight, Ordering::SeqCst);
    }

    /// Current capacity estimate.
    pub fn max_inflight(&self) -> f64 {
        self.shared.max_inflight()
    }

    pub fn stats(&self) -> LimiterStats {
        let shared = &self.shared;
        LimiterStats {
            cpu: shared.cpu.current(),
            inflight: self.inflight(),
            max_pass: shared.pass_stat.max(),
            min_rt_ms: shared.rt_stat.min(),
            max_inflight: shared.max_inflight(),
            since_last_drop: shared
                .last_drop
                .load()
                .as_deref()
                .map(|last_drop| instant_now().saturating_duration_since(*last_drop)),
        }
    }
}

impl Limiter for BbrLimiter {
    fn allow(&self) -> Result<Completion, LimiterError> {
        if self.shared.should_drop() {
            return LimitExceededSnafu.fail();
        }

        let inflight = self.shared.inflight.fetch_add(1, Ordering::AcqRel) + 1;
        RequestAdmitted { inflight }.emit();

        Ok(Completion {
            shared: Some(Arc::clone(&self.shared)),
            start: instant_now(),
        })
    }
}

/// The in-flight slot held by an admitted request.
///
/// Call [`Completion::done`] once the request has finished. Dropping a completion without
/// calling `done` (a panic, a cancelled future) still frees the slot, but counts the request
/// as failed, so it does not feed the capacity estimate.
#[derive(Debug)]
#[must_use = "dropping a completion immediately records the request as failed"]
pub struct Completion {
    shared: Option<Arc<Shared>>,
    start: Instant,
}

impl Completion {
    /// Releases the slot and, for successful requests, records throughput and latency.
    pub fn done(mut self, outcome: Outcome) {
        self.finish(outcome);
    }

    /// Time since the request was admitted.
    pub fn elapsed(&self) -> Duration {
        instant_now().saturating_duration_since(self.start)
    }

    fn finish(&mut self, outcome: Outcome) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        let inflight = shared.release();

        let rtt = self.elapsed();
        if outcome.is_success() {
            shared.pass_stat.add(1);
            shared
                .rt_stat
                .add(i64::try_from(rtt.as_millis()).unwrap_or(i64::MAX));
        }

        RequestCompleted {
            rtt,
            success: outcome.is_success(),
            inflight,
        }
        .emit();
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.finish(Outcome::Failure);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::AtomicU64,
        thread,
    };

    use tokio::time;

    use super::*;
    use crate::test_utils::{fixed_cpu, trace_init};

    fn limiter(threshold: f64, cpu: CpuSource) -> BbrLimiter {
        let settings = BbrSettings::builder()
            .window(Duration::from_secs(1))
            .buckets(10)
            .cpu_threshold(threshold)
            .build();
        BbrLimiter::with_cpu_source(settings, cpu)
    }

    /// A CPU source whose reading can be changed while the limiter runs.
    fn adjustable_cpu(initial: f64) -> (CpuSource, Arc<AtomicU64>) {
        let cell = Arc::new(AtomicU64::new(initial.to_bits()));
        let reader = cell.clone();
        let source = CpuSource::from_fn(move || f64::from_bits(reader.load(Ordering::SeqCst)));
        (source, cell)
    }

    #[test]
    fn initially_allowed() {
        trace_init();

        let limiter = BbrLimiter::new(BbrSettings::default());
        let completion = limiter.allow().expect("first request is admitted");
        assert_eq!(limiter.inflight(), 1);
        completion.done(Outcome::Success);
        assert_eq!(limiter.inflight(), 0);
    }

    #[test]
    fn new_pushes_cpu_interval_into_sampler() {
        let sampler = Arc::new(CpuSampler::idle(Duration::from_millis(500)));

        let settings = BbrSettings::builder()
            .cpu_interval(Duration::from_millis(250))
            .build();
        let limiter = BbrLimiter::with_sampler(settings, sampler.clone());
        assert_eq!(sampler.interval(), Duration::from_millis(250));
        assert!(matches!(&limiter.shared.cpu, CpuSource::Sampler(s) if Arc::ptr_eq(s, &sampler)));
    }

    #[test]
    fn zero_cpu_interval_leaves_sampler_unchanged() {
        let sampler = Arc::new(CpuSampler::idle(Duration::from_millis(300)));

        let settings = BbrSettings::builder().cpu_interval(Duration::ZERO).build();
        let limiter = BbrLimiter::with_sampler(settings, sampler.clone());
        assert_eq!(sampler.interval(), Duration::from_millis(300));
        assert_eq!(limiter.settings().get_cpu_interval(), Duration::from_millis(500));
    }

    #[test]
    fn low_concurrency_is_never_rejected() {
        let limiter = limiter(0.5, fixed_cpu(1.0));

        assert!(limiter.allow().is_ok());
        limiter.set_inflight(1);
        assert!(limiter.allow().is_ok());
    }

    #[test]
    fn low_cpu_admits_despite_high_inflight() {
        let limiter = limiter(0.8, fixed_cpu(0.1));
        limiter.set_inflight(10_000);

        let completion = limiter.allow().expect("CPU is below threshold");
        assert_eq!(limiter.inflight(), 10_001);
        drop(completion);
    }

    #[test]
    fn rejects_when_overloaded() {
        let limiter = limiter(0.5, fixed_cpu(0.8));

        // Build some history; each request starts with nothing else in flight.
        for _ in 0..100 {
            limiter.allow().unwrap().done(Outcome::Success);
        }

        limiter.set_inflight(1000);
        let error = limiter.allow().expect_err("inflight exceeds the estimate");
        assert!(matches!(error, LimiterError::LimitExceeded));
        assert_eq!(limiter.inflight(), 1000, "rejection must not take a slot");
        assert!(limiter.stats().since_last_drop.is_some());
    }

    #[test]
    fn capacity_estimate_uses_best_rate_and_latency() {
        let limiter = limiter(0.5, fixed_cpu(0.9));
        limiter.shared.pass_stat.add(50);
        limiter.shared.rt_stat.add(20);

        // 50 per 100ms bucket at 20ms each keeps 10 requests busy.
        assert!((limiter.max_inflight() - 10.0).abs() < 1e-9);

        limiter.set_inflight(9);
        drop(limiter.allow().expect("below the estimate is admitted"));

        limiter.set_inflight(11);
        assert!(limiter.allow().is_err());
    }

    #[test]
    fn empty_history_estimates_zero_capacity() {
        let limiter = limiter(0.5, fixed_cpu(0.9));
        assert_eq!(limiter.max_inflight(), 0.0);

        let stats = limiter.stats();
        assert_eq!(stats.max_pass, 0);
        assert_eq!(stats.min_rt_ms, 1);
        assert_eq!(stats.since_last_drop, None);
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_rejecting_during_cooldown() {
        let (cpu, cell) = adjustable_cpu(0.9);
        let limiter = limiter(0.5, cpu);
        limiter.set_inflight(100);

        assert!(limiter.allow().is_err());

        // CPU recovers, but the last rejection was less than a second ago.
        cell.store(0.1f64.to_bits(), Ordering::SeqCst);
        time::advance(Duration::from_millis(500)).await;
        assert!(limiter.allow().is_err());

        time::advance(Duration::from_millis(1001)).await;
        assert!(limiter.allow().is_ok());
        assert_eq!(limiter.stats().since_last_drop, None);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_still_allows_within_estimate() {
        let (cpu, cell) = adjustable_cpu(0.9);
        let limiter = limiter(0.5, cpu);
        limiter.set_inflight(100);
        assert!(limiter.allow().is_err());

        cell.store(0.1f64.to_bits(), Ordering::SeqCst);
        limiter.set_inflight(1);
        assert!(limiter.allow().is_ok());
        assert!(limiter.stats().since_last_drop.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn only_successes_feed_statistics() {
        let limiter = limiter(0.5, fixed_cpu(0.0));

        let completion = limiter.allow().unwrap();
        time::advance(Duration::from_millis(40)).await;
        completion.done(Outcome::Failure);

        let stats = limiter.stats();
        assert_eq!(stats.inflight, 0);
        assert_eq!(stats.max_pass, 0);
        assert_eq!(stats.min_rt_ms, 1);

        let completion = limiter.allow().unwrap();
        time::advance(Duration::from_millis(25)).await;
        completion.done(Outcome::from(StatusCode::OK));

        let stats = limiter.stats();
        assert_eq!(stats.inflight, 0);
        assert_eq!(stats.max_pass, 1);
        assert_eq!(stats.min_rt_ms, 25);
    }

    #[test]
    fn dropped_completion_releases_slot_without_recording() {
        let limiter = limiter(0.5, fixed_cpu(0.0));

        let completion = limiter.allow().unwrap();
        assert_eq!(limiter.inflight(), 1);
        drop(completion);

        let stats = limiter.stats();
        assert_eq!(stats.inflight, 0);
        assert_eq!(stats.max_pass, 0);
    }

    #[test]
    fn completion_survives_panicking_handler() {
        let limiter = limiter(0.5, fixed_cpu(0.0));
        let cloned = limiter.clone();

        let result = thread::spawn(move || {
            let _completion = cloned.allow().unwrap();
            panic!("handler failed");
        })
        .join();

        assert!(result.is_err());
        assert_eq!(limiter.inflight(), 0);
    }

    #[test]
    fn release_never_goes_negative() {
        let limiter = limiter(0.5, fixed_cpu(0.0));
        assert_eq!(limiter.shared.release(), 0);
        assert_eq!(limiter.inflight(), 0);
    }

    #[test]
    fn concurrent_allow_and_done() {
        let (cpu, cell) = adjustable_cpu(0.9);
        let limiter = limiter(0.5, cpu);

        let workers: Vec<_> = (0..16)
            .map(|worker| {
                let limiter = limiter.clone();
                let cell = cell.clone();
                thread::spawn(move || {
                    let mut admitted = 0u64;
                    for step in 0..1_000u64 {
                        if step % 100 == 0 {
                            let cpu: f64 = if (step / 100 + worker) % 2 == 0 { 0.9 } else { 0.1 };
                            cell.store(cpu.to_bits(), Ordering::SeqCst);
                        }
                        if let Ok(completion) = limiter.allow() {
                            admitted += 1;
                            assert!(limiter.inflight() >= 1);
                            let outcome = if step % 3 == 0 {
                                Outcome::Failure
                            } else {
                                Outcome::Success
                            };
                            completion.done(outcome);
                        }
                        assert!(limiter.inflight() >= 0);
                    }
                    admitted
                })
            })
            .collect();

        let admitted: u64 = workers.into_iter().map(|w| w.join().unwrap()).sum();

        assert!(admitted > 0);
        assert_eq!(limiter.inflight(), 0);
        let stats = limiter.stats();
        assert!(stats.max_pass >= 0 && stats.max_pass as u64 <= admitted);
        assert!(stats.min_rt_ms >= 1);
    }

    #[test]
    fn outcome_classification() {
        assert_eq!(Outcome::from_status(200), Outcome::Success);
        assert_eq!(Outcome::from_status(299), Outcome::Success);
        assert_eq!(Outcome::from_status(199), Outcome::Failure);
        assert_eq!(Outcome::from_status(300), Outcome::Failure);
        assert_eq!(Outcome::from(StatusCode::NO_CONTENT), Outcome::Success);
        assert_eq!(Outcome::from(StatusCode::INTERNAL_SERVER_ERROR), Outcome::Failure);
    }

    #[test]
    fn rejection_maps_to_too_many_requests() {
        let error = LimiterError::LimitExceeded;
        assert_eq!(error.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(error.to_string(), "rate limit exceeded");
    }
}
