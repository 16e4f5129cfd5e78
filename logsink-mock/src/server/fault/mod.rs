//! Probabilistic fault injection in front of the ingest endpoint.
//!
//! Each request independently rolls for (in priority order) an auth failure,
//! a stalled receive or a server error. Requests that survive all rolls are
//! forwarded, optionally delayed by a random network lag.

use std::{sync::Arc, time::Duration};

use rama::{
    Layer, Service,
    http::{Request, Response, StatusCode, service::web::response::IntoResponse},
    telemetry::tracing,
};

mod chance;
mod in_flight;


#[cfg(test)]
pub(crate) use self::chance::ScriptedSource;
pub use self::{
    chance::{ChanceSource, SeededSource, ThreadRngSource},
    in_flight::{InFlightGuard, InFlightRequests},
};

/// How long a stalled request is held before the stall is logged as elapsed.
pub const STALL_DURATION: Duration = Duration::from_secs(30);

/// Chances (each in `[0, 1]`) of the injected faults.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FaultPlan {
    pub fail_auth: f64,
    pub slow_receive: f64,
    pub bad_response: f64,
    /// Upper bound (exclusive) of the lag added to forwarded requests.
    pub max_lag: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Respond with `403 Forbidden`.
    Forbidden,
    /// Hold the request without ever answering it.
    Stall,
    /// Respond with `500 Internal Server Error`.
    ServerError,
    /// Hand the request to the inner service.
    Forward { lag: Option<Duration> },
}

impl FaultPlan {
    /// Picks the outcome for a single request.
    ///
    /// Every check uses a fresh draw, and a draw is only made
    /// when all earlier checks did not trigger.
    pub fn pick(&self, chance: &dyn ChanceSource) -> FaultOutcome {
        if chance.draw() < self.fail_auth {
            return FaultOutcome::Forbidden;
        }
        if chance.draw() < self.slow_receive {
            return FaultOutcome::Stall;
        }
        if chance.draw() < self.bad_response {
            return FaultOutcome::ServerError;
        }

        let lag = (!self.max_lag.is_zero()).then(|| chance.lag(self.max_lag));
        FaultOutcome::Forward { lag }
    }
}

#[derive(Debug, Clone)]
/// Layer wrapping a http service with [`FaultInjectionService`].
pub struct FaultInjectionLayer {
    plan: FaultPlan,
    chance: Arc<dyn ChanceSource>,
    in_flight: InFlightRequests,
}

impl FaultInjectionLayer {
    pub fn new(plan: FaultPlan, chance: Arc<dyn ChanceSource>) -> Self {
        Self {
            plan,
            chance,
            in_flight: InFlightRequests::new(),
        }
    }

    /// Handle to the in-flight counter shared by all services of this layer.
    pub fn in_flight(&self) -> InFlightRequests {
        self.in_flight.clone()
    }
}

impl<S> Layer<S> for FaultInjectionLayer {
    type Service = FaultInjectionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        FaultInjectionService {
            inner,
            plan: self.plan,
            chance: self.chance.clone(),
            in_flight: self.in_flight.clone(),
        }
    }

    fn into_layer(self, inner: S) -> Self::Service {
        FaultInjectionService {
            inner,
            plan: self.plan,
            chance: self.chance,
            in_flight: self.in_flight,
        }
    }
}

#[derive(Debug, Clone)]
/// Created using [`FaultInjectionLayer`].
pub struct FaultInjectionService<S> {
    inner: S,
    plan: FaultPlan,
    chance: Arc<dyn ChanceSource>,
    in_flight: InFlightRequests,
}

impl<S> Service<Request> for FaultInjectionService<S>
where
    S: Service<Request, Output = Response>,
{
    type Output = Response;
    type Error = S::Error;

    async fn serve(&self, req: Request) -> Result<Self::Output, Self::Error> {
        let slot = self.in_flight.enter();

        tracing::info!(
            in_flight = slot.position(),
            http.request.method = %req.method(),
            url.full = %req.uri(),
            network.protocol.version = ?req.version(),
            headers = ?req.headers(),
            "incoming request",
        );

        match self.plan.pick(self.chance.as_ref()) {
            FaultOutcome::Forbidden => {
                tracing::info!("triggered a fail auth chance, returning status 403");
                Ok(StatusCode::FORBIDDEN.into_response())
            }
            FaultOutcome::Stall => {
                tracing::info!(
                    "triggered a slow receive chance, sleeping for {}s",
                    STALL_DURATION.as_secs()
                );
                tokio::time::sleep(STALL_DURATION).await;
                // no status is ever written: the connection stays open until
                // the request deadline drops it, and with it this future (and slot)
                tracing::info!("slow receive elapsed, leaving the request unanswered");
                std::future::pending().await
            }
            FaultOutcome::ServerError => {
                tracing::info!("triggered a bad response chance, returning status 500");
                Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
            FaultOutcome::Forward { lag } => {
                let resp = self.inner.serve(req).await?;
                if let Some(lag) = lag {
                    tracing::debug!("delay response with a random network lag of {lag:?}");
                    tokio::time::sleep(lag).await;
                }
                Ok(resp)
            }
        }
    }
}
