use std::task::{Context, Poll};

use http::{HeaderValue, Request, Response, header::CONTENT_TYPE};
use tower::Service;

use super::{BbrLimiter, Limiter, LimiterError, future::ResponseFuture};

/// Service that admits or rejects HTTP requests with a [`Limiter`] before they reach the
/// inner service.
///
/// Rejected requests are answered immediately with `429 Too Many Requests`. Admitted requests
/// are reported back to the limiter with the classification of the inner response status;
/// an inner error counts as a failure.
#[derive(Clone, Debug)]
pub struct BbrService<S, L = BbrLimiter> {
    inner: S,
    limiter: L,
}

impl<S, L> BbrService<S, L> {
    pub const fn new(inner: S, limiter: L) -> Self {
        BbrService { inner, limiter }
    }

    pub fn limiter(&self) -> &L {
        &self.limiter
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, L, ReqBody, ResBody> Service<Request<ReqBody>> for BbrService<S, L>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    L: Limiter,
    ResBody: From<&'static str>,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future, ResBody>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        match self.limiter.allow() {
            Ok(completion) => ResponseFuture::admitted(self.inner.call(request), completion),
            Err(error) => ResponseFuture::rejected(rejection_response(&error)),
        }
    }
}

fn rejection_response<B: From<&'static str>>(error: &LimiterError) -> Response<B> {
    let mut response = Response::new(B::from("rate limit exceeded"));
    *response.status_mut() = error.status_code();
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
