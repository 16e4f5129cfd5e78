//! Decoding of the gzip compressed log batches posted by log shippers.
//!
//! Payloads are either emitted as-is (raw mode) or decoded as a JSON
//! array of records, of which each record is emitted as a single line.

use std::{convert::Infallible, fmt, io, sync::Arc, time::SystemTime};

use rama::{
    Service,
    bytes::BytesMut,
    error::BoxError,
    http::{
        Body, Request, Response, StatusCode,
        body::util::{BodyExt as _, LengthLimitError},
        service::web::response::IntoResponse,
    },
    telemetry::tracing,
};

mod gzip;
mod sink;


pub use self::{
    gzip::{Decompressed, GzipHeaderError, GzipPayload, check_header},
    sink::{LogSink, StdoutSink},
};

#[cfg(test)]
pub(crate) use self::{gzip::compress, sink::MemorySink};

/// Maximum size of a decompressed payload.
pub const MAX_PAYLOAD_SIZE: usize = 5 * 1024 * 1024; // 5 MiB

/// A single structured log entry.
pub type Record = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayloadOptions {
    /// Emit the decompressed payload as-is instead of decoding records.
    pub raw: bool,
    /// Prefix every emitted line with the time of ingestion.
    pub show_timestamp: bool,
}

#[derive(Debug)]
/// Terminal failure of a single ingest request.
pub enum IngestError {
    ReadBody(BoxError),
    /// The compressed body hit the server's body limit.
    BodyTooLarge(BoxError),
    OpenGzip(GzipHeaderError),
    Decompress(io::Error),
    TooLarge,
    DecodeRecords {
        err: serde_json::Error,
        body: Vec<u8>,
    },
    RenderRecord(serde_json::Error),
    Blocking(tokio::task::JoinError),
}

impl IngestError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::OpenGzip(_) | Self::DecodeRecords { .. } => StatusCode::BAD_REQUEST,
            Self::TooLarge | Self::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ReadBody(_) | Self::Decompress(_) | Self::RenderRecord(_) | Self::Blocking(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn trace(&self) {
        match self {
            Self::OpenGzip(err) => tracing::warn!("failed to create gzip reader: {err}"),
            Self::ReadBody(err) => tracing::warn!("failed to read request body: {err}"),
            Self::BodyTooLarge(err) => {
                tracing::error!("compressed request body exceeds the body limit: {err}")
            }
            Self::Decompress(err) => tracing::warn!("failed to read gzip request: {err}"),
            Self::TooLarge => tracing::error!(
                "payload size exceeds the maximum allowed size of {MAX_PAYLOAD_SIZE}"
            ),
            Self::DecodeRecords { err, body } => tracing::error!(
                body = %String::from_utf8_lossy(body),
                "failed to decode JSON request body: {err}",
            ),
            Self::RenderRecord(err) => tracing::error!("failed to render decoded record: {err}"),
            Self::Blocking(err) => tracing::error!("payload processing task failed: {err}"),
        }
    }
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadBody(err) => write!(f, "read request body: {err}"),
            Self::BodyTooLarge(err) => write!(f, "request body too large: {err}"),
            Self::OpenGzip(err) => write!(f, "open gzip payload: {err}"),
            Self::Decompress(err) => write!(f, "decompress payload: {err}"),
            Self::TooLarge => write!(f, "payload exceeds {MAX_PAYLOAD_SIZE} bytes"),
            Self::DecodeRecords { err, .. } => write!(f, "decode records: {err}"),
            Self::RenderRecord(err) => write!(f, "render record: {err}"),
            Self::Blocking(err) => write!(f, "process payload: {err}"),
        }
    }
}

impl std::error::Error for IngestError {}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        self.status().into_response()
    }
}

#[derive(Debug, Clone)]
/// Endpoint accepting gzip compressed log batches.
pub struct IngestService {
    options: PayloadOptions,
    sink: Arc<dyn LogSink>,
}

impl IngestService {
    pub fn new(options: PayloadOptions, sink: Arc<dyn LogSink>) -> Self {
        Self { options, sink }
    }

    pub async fn ingest(&self, req: Request) -> Response {
        match self.try_ingest(req).await {
            Ok(emitted) => {
                tracing::debug!(emitted, "payload accepted");
                StatusCode::ACCEPTED.into_response()
            }
            Err(err) => {
                err.trace();
                err.into_response()
            }
        }
    }

    async fn try_ingest(&self, req: Request) -> Result<usize, IngestError> {
        let payload = read_gzip_payload(req.into_body()).await?;
        tracing::trace!(
            compressed.size = payload.compressed_len(),
            "gzip payload received"
        );

        let options = self.options;
        let sink = self.sink.clone();
        tokio::task::spawn_blocking(move || process_payload(&payload, options, sink.as_ref()))
            .await
            .map_err(IngestError::Blocking)?
    }
}

impl Service<Request> for IngestService {
    type Output = Response;
    type Error = Infallible;

    async fn serve(&self, req: Request) -> Result<Self::Output, Self::Error> {
        Ok(self.ingest(req).await)
    }
}

/// Collects the compressed body, bailing out as soon
/// as the gzip header is known to be invalid.
async fn read_gzip_payload(mut body: Body) -> Result<GzipPayload, IngestError> {
    let mut buffer = BytesMut::new();
    let mut header_checked = false;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|err| {
            let err: BoxError = err.into();
            if is_length_limit_error(&*err) {
                IngestError::BodyTooLarge(err)
            } else {
                IngestError::ReadBody(err)
            }
        })?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        buffer.extend_from_slice(&data);

        if !header_checked {
            match check_header(&buffer) {
                Ok(_) => header_checked = true,
                Err(GzipHeaderError::Truncated { .. }) => (),
                Err(err) => return Err(IngestError::OpenGzip(err)),
            }
        }
    }

    GzipPayload::open(buffer.freeze()).map_err(IngestError::OpenGzip)
}

fn is_length_limit_error(err: &(dyn std::error::Error + 'static)) -> bool {
    std::iter::successors(Some(err), |err| err.source()).any(|err| err.is::<LengthLimitError>())
}

/// Decompresses, decodes and emits a payload, returning the number of emitted lines.
///
/// Nothing is emitted unless the full payload is valid.
pub fn process_payload(
    payload: &GzipPayload,
    options: PayloadOptions,
    sink: &dyn LogSink,
) -> Result<usize, IngestError> {
    let data = match payload
        .read_limited(MAX_PAYLOAD_SIZE)
        .map_err(IngestError::Decompress)?
    {
        Decompressed::Complete(data) => data,
        Decompressed::TooLarge => return Err(IngestError::TooLarge),
    };

    let prefix = options.show_timestamp.then(timestamp_prefix);

    if options.raw {
        emit(sink, &render_raw(prefix.as_deref(), &data));
        return Ok(1);
    }

    let records = match decode_records(&data) {
        Ok(records) => records,
        Err(err) => return Err(IngestError::DecodeRecords { err, body: data }),
    };

    let lines = records
        .iter()
        .map(|record| render_record(prefix.as_deref(), record))
        .collect::<Result<Vec<_>, _>>()
        .map_err(IngestError::RenderRecord)?;

    for line in &lines {
        emit(sink, line);
    }
    Ok(lines.len())
}

/// Decodes a JSON array of records; a `null` document is an empty batch.
pub fn decode_records(data: &[u8]) -> Result<Vec<Record>, serde_json::Error> {
    let records: Option<Vec<Record>> = serde_json::from_slice(data)?;
    Ok(records.unwrap_or_default())
}

fn timestamp_prefix() -> String {
    format!("{}: ", humantime::format_rfc3339_nanos(SystemTime::now()))
}

fn render_raw(prefix: Option<&str>, data: &[u8]) -> Vec<u8> {
    let prefix = prefix.unwrap_or_default();

    let mut line = Vec::with_capacity(prefix.len() + data.len() + 1);
    line.extend_from_slice(prefix.as_bytes());
    line.extend_from_slice(data);
    line.push(b'\n');
    line
}

fn render_record(prefix: Option<&str>, record: &Record) -> serde_json::Result<Vec<u8>> {
    let mut line = Vec::with_capacity(128);
    if let Some(prefix) = prefix {
        line.extend_from_slice(prefix.as_bytes());
    }
    serde_json::to_writer(&mut line, record)?;
    line.push(b'\n');
    Ok(line)
}

fn emit(sink: &dyn LogSink, line: &[u8]) {
    if let Err(err) = sink.emit(line) {
        tracing::warn!("failed to write payload to output: {err}");
    }
}
