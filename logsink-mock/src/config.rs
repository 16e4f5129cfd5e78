use std::{net::SocketAddr, sync::Arc, time::Duration};

use rama::{
    error::{BoxError, ErrorContext as _},
    net::socket::Interface,
};

use crate::{
    Args,
    server::fault::{ChanceSource, FaultPlan, SeededSource, ThreadRngSource},
    server::ingest::PayloadOptions,
};

/// Runtime configuration of the ingest endpoint.
///
/// Built once at startup and shared read-only with every request.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IngestConfig {
    pub fail_auth_chance: f64,
    pub slow_receive_chance: f64,
    pub bad_response_chance: f64,
    pub max_network_lag: Duration,
    pub disable_json_parsing: bool,
    pub show_timestamp: bool,
}

impl IngestConfig {
    pub fn fault_plan(&self) -> FaultPlan {
        FaultPlan {
            fail_auth: self.fail_auth_chance,
            slow_receive: self.slow_receive_chance,
            bad_response: self.bad_response_chance,
            max_lag: self.max_network_lag,
        }
    }

    pub fn payload_options(&self) -> PayloadOptions {
        PayloadOptions {
            raw: self.disable_json_parsing,
            show_timestamp: self.show_timestamp,
        }
    }
}

impl Args {
    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            fail_auth_chance: self.random_no_auth,
            slow_receive_chance: self.random_slow_receive,
            bad_response_chance: self.random_bad_response,
            max_network_lag: Duration::from_millis(self.random_network_lag),
            disable_json_parsing: self.disable_json_parsing,
            show_timestamp: self.show_timestamp,
        }
    }

    /// Network interface composed of the `--host` and `--port` arguments.
    pub fn interface(&self) -> Result<Interface, BoxError> {
        let addr = SocketAddr::new(self.host, self.port).to_string();
        addr.parse::<Interface>()
            .context("parse bind interface")
            .context_field("address", addr)
    }

    /// Source of the fault injection draws, seeded exactly once.
    pub fn chance_source(&self) -> Arc<dyn ChanceSource> {
        match self.seed {
            Some(seed) => Arc::new(SeededSource::new(seed)),
            None => Arc::new(ThreadRngSource),
        }
    }
}

/// Parses a probability, accepting values in the inclusive range [0, 1].
pub fn parse_probability(input: &str) -> Result<f64, String> {
    let chance: f64 = input
        .trim()
        .parse()
        .map_err(|err| format!("invalid chance '{input}': {err}"))?;
    if !(0.0..=1.0).contains(&chance) {
        return Err(format!("chance '{input}' is not within [0.0, 1.0]"));
    }
    Ok(chance)
}
