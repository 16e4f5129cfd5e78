#![cfg_attr(
    not(test),
    warn(clippy::print_stdout, clippy::dbg_macro),
    deny(clippy::unwrap_used, clippy::expect_used)
)]

use std::{net::IpAddr, path::PathBuf, time::Duration};

use rama::{
    error::BoxError,
    graceful,
    telemetry::tracing::{self, Instrument as _},
};

use clap::Parser;

pub mod config;
pub mod server;
pub mod utils;

#[cfg(test)]
pub mod test;

#[cfg(target_family = "unix")]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[cfg(target_os = "windows")]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// CLI arguments for configuring the mock ingestion endpoint.
#[derive(Debug, Clone, Parser)]
#[command(name = "logsink-mock")]
#[command(bin_name = "logsink-mock")]
#[command(version, about, long_about = None)]
pub struct Args {
    /// local port to launch the server at
    #[arg(long, short = 'p', default_value_t = 8083)]
    pub port: u16,

    /// local address to launch the server at
    #[arg(long, default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// chance to fail authentication, from 0.0 to 1.0
    #[arg(
        long,
        alias = "random_no_auth",
        value_name = "CHANCE",
        default_value_t = 0.,
        value_parser = config::parse_probability,
    )]
    pub random_no_auth: f64,

    /// chance to receive data slowly, from 0.0 to 1.0
    #[arg(
        long,
        alias = "random_slow_receive",
        value_name = "CHANCE",
        default_value_t = 0.,
        value_parser = config::parse_probability,
    )]
    pub random_slow_receive: f64,

    /// chance to return a 500 response status code, from 0.0 to 1.0
    #[arg(
        long,
        alias = "random_bad_response",
        value_name = "CHANCE",
        default_value_t = 0.,
        value_parser = config::parse_probability,
    )]
    pub random_bad_response: f64,

    /// maximum random network lag added to each forwarded request
    #[arg(
        long,
        alias = "random_network_lag",
        value_name = "MSEC",
        default_value_t = 0
    )]
    pub random_network_lag: u64,

    /// write payloads as-is instead of decoding them as JSON records
    #[arg(long, alias = "disable_json_parsing", default_value_t = false)]
    pub disable_json_parsing: bool,

    /// show timestamp in output before each request or log
    #[arg(long, alias = "show_timestamp", default_value_t = false)]
    pub show_timestamp: bool,

    /// seed the fault injection randomness once, for reproducible runs
    #[arg(long, value_name = "SEED")]
    pub seed: Option<u64>,

    /// directory in which the bound server address will be written
    #[arg(long, short = 'D')]
    pub data: Option<PathBuf>,

    /// debug logging as default instead of Info; use RUST_LOG env for more options
    #[arg(long, short = 'v', default_value_t = false)]
    pub verbose: bool,

    /// enable pretty logging (format for humans)
    #[arg(long, default_value_t = false)]
    pub pretty: bool,

    /// write the tracing output to the provided (log) file instead of stderr
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    #[arg(long, value_name = "SECONDS", default_value_t = 1.)]
    /// the graceful shutdown timeout (<= 0.0 = no timeout)
    pub graceful: f64,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    utils::telemetry::init_tracing(&args)?;

    let base_shutdown_signal = graceful::default_signal();
    if let Err(err) = run_with_args(base_shutdown_signal, args).await {
        eprintln!("🚩 exit with error: {err}");
        std::process::exit(1);
    }

    tracing::info!("exiting the application normally");
    Ok(())
}

/// Runs the ingest server and blocks until the (graceful) shutdown
/// has been initiated, failing early if the server cannot be started.
async fn run_with_args<F>(base_shutdown_signal: F, args: Args) -> Result<(), BoxError>
where
    F: Future<Output: Send + 'static> + Send + 'static,
{
    tracing::debug!(config = ?args.ingest_config(), "config parsed");

    let graceful_timeout = (args.graceful > 0.).then(|| Duration::from_secs_f64(args.graceful));

    let graceful = graceful::Shutdown::new(base_shutdown_signal);

    let span = tracing::debug_span!(
        "ingest server lifetime",
        server.service.name = utils::env::project_name(),
        otel.kind = "server",
        network.protocol.name = "http",
    );

    tracing::info!(port = args.port, "starting the ingest server...");
    let ingest_server = server::bind_ingest_server(args, graceful.guard())
        .instrument(span.clone())
        .await
        .inspect_err(|err| tracing::error!("failed to start the ingest server: {err}"))?;

    graceful.spawn_task_fn(move |_| ingest_server.instrument(span));

    let delay = match graceful_timeout {
        Some(duration) => graceful.shutdown_with_limit(duration).await?,
        None => graceful.shutdown().await,
    };

    tracing::info!("gracefully shutdown with a delay of: {delay:?}");
    Ok(())
}
