use tower::Layer;

use super::{BbrLimiter, service::BbrService};

/// Enforces a [`Limiter`](super::Limiter) in front of an HTTP service.
///
/// All services produced by one layer share its limiter, and with it the statistics.
#[derive(Clone, Debug)]
pub struct BbrLayer<L = BbrLimiter> {
    limiter: L,
}

impl<L> BbrLayer<L> {
    pub const fn new(limiter: L) -> Self {
        BbrLayer { limiter }
    }
}

impl<S, L: Clone> Layer<S> for BbrLayer<L> {
    type Service = BbrService<S, L>;

    fn layer(&self, inner: S) -> Self::Service {
        BbrService::new(inner, self.limiter.clone())
    }
}
