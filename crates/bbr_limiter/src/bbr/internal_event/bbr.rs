use std::time::Duration;

use metrics::{counter, gauge, histogram};

use super::InternalEvent;
use crate::bbr::cpu::CpuError;

#[derive(Clone, Copy, Debug)]
pub struct RequestAdmitted {
    pub inflight: i64,
}

impl InternalEvent for RequestAdmitted {
    fn emit(self) {
        counter!("bbr_requests_admitted_total").increment(1);
        gauge!("bbr_inflight").set(self.inflight as f64);
        trace!(target: "bbr_limiter::stats", inflight = self.inflight, "Request admitted");
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RequestRejected {
    pub cpu: f64,
    pub inflight: i64,
    pub max_inflight: f64,
}

impl InternalEvent for RequestRejected {
    fn emit(self) {
        counter!("bbr_requests_rejected_total").increment(1);
        // Histogram, since each rejection carries its own estimate and the spread matters
        // when diagnosing a shedding episode.
        histogram!("bbr_max_inflight").record(self.max_inflight);
        debug!(
            target: "bbr_limiter::stats",
            cpu = self.cpu,
            inflight = self.inflight,
            max_inflight = self.max_inflight,
            "Request rejected"
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RequestCompleted {
    pub rtt: Duration,
    pub success: bool,
    pub inflight: i64,
}

impl InternalEvent for RequestCompleted {
    fn emit(self) {
        gauge!("bbr_inflight").set(self.inflight as f64);
        if self.success {
            histogram!("bbr_observed_rtt_seconds").record(self.rtt);
        }
        trace!(
            target: "bbr_limiter::stats",
            rtt_ms = self.rtt.as_millis(),
            success = self.success,
            inflight = self.inflight,
            "Request completed"
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DropCooldownCleared {
    pub since_last_drop: Duration,
}

impl InternalEvent for DropCooldownCleared {
    fn emit(self) {
        debug!(
            target: "bbr_limiter::stats",
            since_last_drop_ms = self.since_last_drop.as_millis(),
            "Drop cooldown cleared"
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CpuUsageSampled {
    pub fraction: f64,
}

impl InternalEvent for CpuUsageSampled {
    fn emit(self) {
        gauge!("bbr_cpu_usage").set(self.fraction);
        trace!(target: "bbr_limiter::cpu", cpu = self.fraction, "CPU usage sampled");
    }
}

#[derive(Debug)]
pub struct CpuSampleFailed<'a> {
    pub error: &'a CpuError,
}

impl InternalEvent for CpuSampleFailed<'_> {
    fn emit(self) {
        counter!("bbr_cpu_sample_errors_total").increment(1);
        warn!(
            target: "bbr_limiter::cpu",
            message = "Failed to sample CPU usage; retrying after interval.",
            error = %self.error,
        );
    }
}
