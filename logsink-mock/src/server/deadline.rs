//! Per-request deadline, enforced by dropping the connection
//! of any request that is still unanswered once it expires.
//!
//! The connection itself has no lifetime limit: a keep-alive connection
//! can serve any number of requests as long as each completes in time.

use std::{sync::Arc, time::Duration};

use rama::{
    Layer, Service,
    extensions::ExtensionsMut,
    http::{Request, Response, StatusCode, service::web::response::IntoResponse},
    telemetry::tracing,
};
use tokio::sync::Notify;

#[derive(Debug, Clone, Default)]
/// Handle to drop the connection a request arrived on.
///
/// Inserted into the extensions of every accepted connection,
/// from which it is inherited by the requests served on it.
pub struct ConnectionAbort(Arc<Notify>);

impl ConnectionAbort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the connection, in-flight requests on it included.
    pub fn abort(&self) {
        self.0.notify_one();
    }

    async fn aborted(&self) {
        self.0.notified().await
    }
}

#[derive(Debug, Clone, Default)]
#[non_exhaustive]
/// Layer wrapping a connection service with [`ConnectionAbortService`].
pub struct ConnectionAbortLayer;

impl ConnectionAbortLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for ConnectionAbortLayer {
    type Service = ConnectionAbortService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ConnectionAbortService { inner }
    }
}

#[derive(Debug, Clone)]
/// Created using [`ConnectionAbortLayer`].
pub struct ConnectionAbortService<S> {
    inner: S,
}

impl<S, Input> Service<Input> for ConnectionAbortService<S>
where
    S: Service<Input, Output: Default>,
    Input: ExtensionsMut + Send + 'static,
{
    type Output = S::Output;
    type Error = S::Error;

    async fn serve(&self, mut input: Input) -> Result<Self::Output, Self::Error> {
        let abort = ConnectionAbort::new();
        input.extensions_mut().insert(abort.clone());

        tokio::select! {
            result = self.inner.serve(input) => result,
            _ = abort.aborted() => {
                tracing::debug!("connection aborted while serving a request");
                Ok(Default::default())
            }
        }
    }
}

#[derive(Debug, Clone)]
/// Layer wrapping a http service with [`RequestDeadlineService`].
pub struct RequestDeadlineLayer {
    timeout: Duration,
}

impl RequestDeadlineLayer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl<S> Layer<S> for RequestDeadlineLayer {
    type Service = RequestDeadlineService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestDeadlineService {
            inner,
            timeout: self.timeout,
        }
    }
}

#[derive(Debug, Clone)]
/// Created using [`RequestDeadlineLayer`].
pub struct RequestDeadlineService<S> {
    inner: S,
    timeout: Duration,
}

impl<S> Service<Request> for RequestDeadlineService<S>
where
    S: Service<Request, Output = Response>,
{
    type Output = Response;
    type Error = S::Error;

    async fn serve(&self, req: Request) -> Result<Self::Output, Self::Error> {
        let abort = req.extensions().get::<ConnectionAbort>().cloned();

        let Ok(result) = tokio::time::timeout(self.timeout, self.inner.serve(req)).await else {
            let Some(abort) = abort else {
                tracing::warn!(
                    "request not completed within {:?} and no connection to drop, returning status 408",
                    self.timeout
                );
                return Ok(StatusCode::REQUEST_TIMEOUT.into_response());
            };

            tracing::info!(
                "request not completed within {:?}, dropping the connection",
                self.timeout
            );
            abort.abort();
            // the connection service drops this future
            return std::future::pending().await;
        };
        result
    }
}
