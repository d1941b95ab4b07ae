//! Tower middleware running the dispatcher in front of any service.
//!
//! The request type names its caller and target service through [`AdmissionRequest`]; [`Routed`]
//! adds both to an arbitrary payload. Each attempt clones the inner service and the request, so
//! both must be `Clone`.

use super::Dispatcher;
use crate::error::DispatchError;
use crate::rate_limit::CallerIdentity;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service;

/// Requests that can be admitted.
pub trait AdmissionRequest {
    /// Who is asking.
    fn caller(&self) -> CallerIdentity;
    /// Which downstream service is targeted.
    fn service(&self) -> &str;
}

/// A payload tagged with its caller and target service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routed<R> {
    /// Who is asking.
    pub caller: CallerIdentity,
    /// Target service.
    pub service: String,
    /// The request itself.
    pub request: R,
}

impl<R> Routed<R> {
    /// Tag `request`.
    pub fn new(caller: CallerIdentity, service: impl Into<String>, request: R) -> Self {
        Self { caller, service: service.into(), request }
    }
}

impl<R> AdmissionRequest for Routed<R> {
    fn caller(&self) -> CallerIdentity {
        self.caller.clone()
    }

    fn service(&self) -> &str {
        &self.service
    }
}

/// Wraps services in a [`DispatchService`] sharing one dispatcher.
pub struct DispatchLayer<T, E> {
    dispatcher: Arc<Dispatcher<T, E>>,
}

impl<T, E> DispatchLayer<T, E> {
    /// Layer over `dispatcher`.
    pub fn new(dispatcher: Arc<Dispatcher<T, E>>) -> Self {
        Self { dispatcher }
    }
}

impl<T, E> Clone for DispatchLayer<T, E> {
    fn clone(&self) -> Self {
        Self { dispatcher: Arc::clone(&self.dispatcher) }
    }
}

impl<T, E> std::fmt::Debug for DispatchLayer<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchLayer").finish_non_exhaustive()
    }
}

impl<S, T, E> Layer<S> for DispatchLayer<T, E> {
    type Service = DispatchService<S, T, E>;

    fn layer(&self, inner: S) -> Self::Service {
        DispatchService { inner, dispatcher: Arc::clone(&self.dispatcher) }
    }
}

/// Middleware that admits, retries and falls back around `S`.
pub struct DispatchService<S, T, E> {
    inner: S,
    dispatcher: Arc<Dispatcher<T, E>>,
}

impl<S: Clone, T, E> Clone for DispatchService<S, T, E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), dispatcher: Arc::clone(&self.dispatcher) }
    }
}

impl<S: std::fmt::Debug, T, E> std::fmt::Debug for DispatchService<S, T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchService").field("inner", &self.inner).finish_non_exhaustive()
    }
}

impl<S, Req, T, E> Service<Req> for DispatchService<S, T, E>
where
    S: Service<Req, Response = T, Error = E> + Clone + Send + 'static,
    S::Future: Send + 'static,
    Req: AdmissionRequest + Clone + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    type Response = T;
    type Error = DispatchError<E>;
    type Future = Pin<Box<dyn Future<Output = Result<T, DispatchError<E>>> + Send>>;

    // Readiness of the inner service is awaited per attempt on a fresh clone.
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let dispatcher = Arc::clone(&self.dispatcher);
        let inner = self.inner.clone();

        Box::pin(async move {
            let caller = req.caller();
            let service = req.service().to_string();
            let op = move |_: &str| {
                let svc = inner.clone();
                let req = req.clone();
                async move { svc.oneshot(req).await }
            };
            dispatcher.dispatch(&caller, &service, op).await.map(|served| served.value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::rate_limit::Priority;
    use crate::sleeper::InstantSleeper;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::service_fn;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Unavailable;

    #[tokio::test]
    async fn layer_retries_inner_service() {
        let dispatcher = Arc::new(
            Dispatcher::<String, Unavailable>::builder(PolicyConfig::default())
                .sleeper(Arc::new(InstantSleeper))
                .build()
                .unwrap(),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let inner = service_fn(move |req: Routed<&'static str>| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Unavailable)
                } else {
                    Ok(format!("{} via {}", req.request, req.service))
                }
            }
        });
        let svc = DispatchLayer::new(dispatcher).layer(inner);

        let caller = CallerIdentity::new("web", Priority::High);
        let response = svc.oneshot(Routed::new(caller, "search", "q=rust")).await.unwrap();
        assert_eq!(response, "q=rust via search");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
