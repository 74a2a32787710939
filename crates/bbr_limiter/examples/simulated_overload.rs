// examples/simulated_overload.rs
//
// Drives a simulated HTTP handler with far more concurrent clients than it can serve and
// shows the BBR layer shedding the excess with 429s once "CPU" crosses the threshold.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use bbr_limiter::{
    Error as CrateError,
    bbr::{BbrLayer, BbrLimiter, BbrSettings, CpuSource},
};
use http::{Request, Response, StatusCode};
use tokio::time::sleep;
use tower::{ServiceBuilder, ServiceExt, service_fn};
use tracing::info;

const NUM_CLIENTS: usize = 64;
const REQUESTS_PER_CLIENT: usize = 50;
// The handler serves this many requests at full speed; beyond it latency grows.
const HANDLER_CAPACITY: usize = 8;
const BASE_LATENCY_MS: u64 = 20;

#[tokio::main]
async fn main() -> Result<(), CrateError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    // Simulated CPU: proportional to how far the handler is over capacity.
    let busy = Arc::new(AtomicUsize::new(0));
    let cpu_busy = busy.clone();
    let cpu = CpuSource::from_fn(move || {
        let busy = cpu_busy.load(Ordering::Relaxed) as f64;
        (busy / HANDLER_CAPACITY as f64).min(1.0)
    });

    let settings = BbrSettings::builder()
        .window(Duration::from_secs(2))
        .buckets(20)
        .cpu_threshold(0.8)
        .build();
    let limiter = BbrLimiter::with_cpu_source(settings, cpu);

    let handler_busy = busy.clone();
    let service = ServiceBuilder::new()
        .layer(BbrLayer::new(limiter.clone()))
        .service(service_fn(move |_request: Request<()>| {
            let busy = handler_busy.clone();
            async move {
                let load = busy.fetch_add(1, Ordering::Relaxed) + 1;
                let overload = load.saturating_sub(HANDLER_CAPACITY) as u64;
                sleep(Duration::from_millis(BASE_LATENCY_MS + overload * 5)).await;
                busy.fetch_sub(1, Ordering::Relaxed);
                Ok::<_, CrateError>(Response::new(String::from("ok")))
            }
        }));

    let served = Arc::new(AtomicU64::new(0));
    let rejected = Arc::new(AtomicU64::new(0));

    info!("Starting {} clients...", NUM_CLIENTS);
    let mut join_handles = Vec::new();
    for client in 0..NUM_CLIENTS {
        let service = service.clone();
        let served = served.clone();
        let rejected = rejected.clone();

        join_handles.push(tokio::spawn(async move {
            for _ in 0..REQUESTS_PER_CLIENT {
                let response = service.clone().oneshot(Request::new(())).await?;
                match response.status() {
                    StatusCode::TOO_MANY_REQUESTS => {
                        rejected.fetch_add(1, Ordering::Relaxed);
                        // Back off briefly before trying again.
                        sleep(Duration::from_millis(10)).await;
                    }
                    _ => {
                        served.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            info!("[Client {}] done", client);
            Ok::<(), CrateError>(())
        }));
    }

    for (idx, handle) in join_handles.into_iter().enumerate() {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => info!("[Main] Client {} failed: {:?}", idx, e),
            Err(e) => info!("[Main] Client {} panicked: {:?}", idx, e),
        }
    }

    let stats = limiter.stats();
    info!(
        served = served.load(Ordering::Relaxed),
        rejected = rejected.load(Ordering::Relaxed),
        max_pass = stats.max_pass,
        min_rt_ms = stats.min_rt_ms,
        max_inflight = stats.max_inflight,
        "All clients finished."
    );
    Ok(())
}
