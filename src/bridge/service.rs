use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tower::{ServiceExt as _, util::Oneshot};

/// Serves hyper connections with a cloneable tower service.
///
/// hyper calls services through `&self`; each request runs on its own clone
/// of the wrapped service via [`oneshot`](tower::ServiceExt::oneshot), so
/// readiness is honoured per request.
#[derive(Debug, Clone)]
pub struct TowerHyperService<S> {
    service: S,
}

impl<S> TowerHyperService<S> {
    /// Wrap a tower service.
    pub fn new(inner: S) -> Self {
        Self { service: inner }
    }
}

impl<S, R> hyper::service::Service<R> for TowerHyperService<S>
where
    S: tower::Service<R> + Clone,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = TowerHyperFuture<S, R>;

    fn call(&self, req: R) -> Self::Future {
        TowerHyperFuture {
            future: self.service.clone().oneshot(req),
        }
    }
}

/// Response future of a [`TowerHyperService`].
#[pin_project::pin_project]
#[derive(Debug)]
pub struct TowerHyperFuture<S, R>
where
    S: tower::Service<R>,
{
    #[pin]
    future: Oneshot<S, R>,
}

impl<S, R> Future for TowerHyperFuture<S, R>
where
    S: tower::Service<R>,
{
    type Output = Result<S::Response, S::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        self.project().future.poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use hyper::service::Service as _;

    use super::*;

    #[tokio::test]
    async fn calls_tower_service() {
        let service = TowerHyperService::new(tower::service_fn(|name: &'static str| async move {
            Ok::<_, Infallible>(format!("hello {name}"))
        }));

        assert_eq!(service.call("a").await.unwrap(), "hello a");
        assert_eq!(service.call("b").await.unwrap(), "hello b");
    }
}
