use std::{convert::Infallible, path::Path, sync::Arc, time::Duration};

use rama::{
    Layer as _, Service,
    error::{BoxError, ErrorContext as _},
    graceful::ShutdownGuard,
    http::{
        HeaderValue, Request, Response,
        layer::{required_header::AddRequiredResponseHeadersLayer, trace::TraceLayer},
        server::HttpServer,
        service::web::Router,
    },
    net::{address::SocketAddress, stream::layer::http::BodyLimitLayer},
    rt::Executor,
    tcp::server::TcpListener,
    telemetry::tracing,
};

use crate::{Args, utils::env::network_service_identifier};

pub mod deadline;
pub mod fault;
pub mod ingest;

use self::{
    deadline::{ConnectionAbortLayer, RequestDeadlineLayer},
    fault::FaultInjectionLayer,
    ingest::{IngestService, StdoutSink},
};

/// Requests (stalled ones included) unanswered after this long
/// have their connection dropped.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Limit of the (compressed) request body,
/// the decompressed payload has its own, lower, limit.
const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Paths at which log batches are accepted.
pub const INGEST_PATHS: [&str; 3] = ["/", "/api/v2/logs", "/api/v2/logs/"];

/// Binds the ingest server, returning the future that serves it.
///
/// Binding happens up front so that startup failures are returned
/// to the caller instead of surfacing from within a spawned task.
pub async fn bind_ingest_server(
    args: Args,
    guard: ShutdownGuard,
) -> Result<impl Future<Output = ()> + Send + 'static, BoxError> {
    let config = args.ingest_config();
    let interface = args.interface()?;

    let fault_layer = FaultInjectionLayer::new(config.fault_plan(), args.chance_source());
    let in_flight = fault_layer.in_flight();

    let ingest = IngestService::new(config.payload_options(), Arc::new(StdoutSink::new()));

    let http_svc = (
        TraceLayer::new_for_http(),
        AddRequiredResponseHeadersLayer::new()
            .with_server_header_value(HeaderValue::from_static(network_service_identifier())),
        RequestDeadlineLayer::new(REQUEST_TIMEOUT),
        fault_layer,
    )
        .into_layer(new_ingest_router(ingest));

    let exec = Executor::graceful(guard);
    let http_server = HttpServer::auto(exec.clone()).service(Arc::new(http_svc));

    let tcp_svc = (
        ConnectionAbortLayer::new(),
        BodyLimitLayer::symmetric(MAX_BODY_SIZE),
    )
        .into_layer(http_server);

    let tcp_listener = TcpListener::bind(interface, exec)
        .await
        .context("bind ingest http server")?;

    let ingest_addr = tcp_listener
        .local_addr()
        .context("get bound address for ingest http server")?;

    tracing::info!(
        server.address = %ingest_addr,
        "listening for gzip compressed logs at {}",
        INGEST_PATHS.join(", "),
    );
    if let Some(dir) = args.data.as_deref() {
        write_server_socket_address_as_file(dir, "ingest", ingest_addr.into()).await?;
    }

    Ok(async move {
        tcp_listener.serve(tcp_svc).await;

        tracing::info!(
            in_flight = in_flight.current(),
            "ingest server stopped accepting requests"
        );
    })
}

/// Routes every ingest path to the given service, anything else is a 404.
pub fn new_ingest_router(
    ingest: IngestService,
) -> impl Service<Request, Output = Response, Error = Infallible> {
    let handler = move |req: Request| {
        let ingest = ingest.clone();
        async move { ingest.ingest(req).await }
    };

    INGEST_PATHS
        .into_iter()
        .fold(Router::new(), |router, path| {
            router.with_post(path, handler.clone())
        })
}

async fn write_server_socket_address_as_file(
    dir: &Path,
    name: &str,
    addr: SocketAddress,
) -> Result<(), BoxError> {
    tokio::fs::create_dir_all(dir)
        .await
        .context("create data directory")
        .with_context_debug_field("path", || dir.to_owned())?;

    let path = dir.join(format!("{name}.addr.txt"));
    tokio::fs::write(&path, addr.to_string())
        .await
        .context("write server's socket address to file")
        .context_field("address", addr)
        .with_context_debug_field("path", || path.to_owned())
}
