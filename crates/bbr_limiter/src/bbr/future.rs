//! Future types

use std::{
    future::{Future, Ready},
    pin::Pin,
    task::{Context, Poll, ready},
};

use http::Response;
use pin_project::pin_project;

use super::{Completion, Outcome};

/// Future for the [`BbrService`](super::BbrService).
///
/// Owns the request's [`Completion`] while the inner future runs; dropping the future before
/// it resolves releases the in-flight slot as a failed request.
#[pin_project(project = ResponseFutureProj)]
pub enum ResponseFuture<F, B> {
    Admitted {
        #[pin]
        inner: F,
        completion: Option<Completion>,
    },
    Rejected {
        #[pin]
        response: Ready<Response<B>>,
    },
}

impl<F, B> ResponseFuture<F, B> {
    pub(super) fn admitted(inner: F, completion: Completion) -> Self {
        ResponseFuture::Admitted {
            inner,
            completion: Some(completion),
        }
    }

    pub(super) fn rejected(response: Response<B>) -> Self {
        ResponseFuture::Rejected {
            response: std::future::ready(response),
        }
    }
}

impl<F, B, E> Future for ResponseFuture<F, B>
where
    F: Future<Output = Result<Response<B>, E>>,
{
    type Output = Result<Response<B>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            ResponseFutureProj::Admitted { inner, completion } => {
                let result = ready!(inner.poll(cx));
                if let Some(completion) = completion.take() {
                    let outcome = match &result {
                        Ok(response) => Outcome::from(response.status()),
                        Err(_) => Outcome::Failure,
                    };
                    completion.done(outcome);
                }
                Poll::Ready(result)
            }
            ResponseFutureProj::Rejected { response } => response.poll(cx).map(Ok),
        }
    }
}
