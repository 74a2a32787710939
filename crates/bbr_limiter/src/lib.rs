//! Adaptive admission control using a BBR-style limiter
//!
//! This crate decides, per inbound request and without any externally configured rate,
//! whether a service can absorb one more in-flight request before latency collapses.
//!
//! # Algorithm Overview
//!
//! The limiter keeps two sliding windows over the last `window` of traffic:
//! 1. **Pass rate**: successful completions per bucket
//! 2. **Minimum latency**: the best round trip observed per bucket
//!
//! Their product (`max_pass * min_rt / bucket_duration`) estimates how many requests the
//! service can hold in flight at its best observed latency. Admission only tightens to that
//! bound once host CPU usage crosses `cpu_threshold`, and stays tight for one second after
//! the last rejection so a noisy CPU reading does not make it oscillate.
//!
//! # Features
//! - Self-tuning: no requests-per-second number to configure
//! - Lock-free CPU sampling on a dedicated background thread
//! - Completion guards that release their in-flight slot even on panic or cancellation
//! - Tower middleware for `http` services answering `429 Too Many Requests`
//!
//! # Safety & Concurrency
//! - Thread-safe: atomics for the hot counters, short read/write locks for the windows
//! - No unsafe code
//!
//! # Basic Usage
//! ```
//! use bbr_limiter::bbr::{BbrLimiter, BbrSettings, Limiter, Outcome};
//!
//! let limiter = BbrLimiter::new(BbrSettings::default());
//! match limiter.allow() {
//!     Ok(completion) => {
//!         // ... serve the request ...
//!         completion.done(Outcome::Success);
//!     }
//!     Err(error) => eprintln!("rejected: {error}"),
//! }
//! ```
//!
//! # Configuration
//! See [`bbr::BbrSettings`] for tuning parameters
//!
//! # Metrics
//! Emits metrics via the `InternalEvent` trait
pub mod bbr;
#[cfg(test)]
pub mod test_utils;

#[macro_use]
extern crate tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
