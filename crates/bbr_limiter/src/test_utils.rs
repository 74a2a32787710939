use crate::bbr::CpuSource;

/// Installs a test-friendly `tracing` subscriber once per process.
pub fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A CPU source that always reads `fraction`.
pub fn fixed_cpu(fraction: f64) -> CpuSource {
    CpuSource::from_fn(move || fraction)
}
