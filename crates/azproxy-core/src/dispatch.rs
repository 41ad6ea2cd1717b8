use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::converter::ConvertError;
use crate::director::{DirectorError, OutboundRequest};
use crate::error::ProxyError;
use crate::headers::strip_hop_by_hop_and_framing;
use crate::upstream_client::{BodyStream, UpstreamClient};

const RELAY_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RouteMismatch,
    UnresolvedPlaceholder,
    UnknownModel,
    MissingCredential,
    Upstream,
}

impl From<&DirectorError> for FailureKind {
    fn from(err: &DirectorError) -> Self {
        match err {
            DirectorError::Convert(ConvertError::RouteMismatch { .. }) => FailureKind::RouteMismatch,
            DirectorError::Convert(ConvertError::UnresolvedPlaceholder(_))
            | DirectorError::Query(_) => FailureKind::UnresolvedPlaceholder,
            DirectorError::Convert(ConvertError::UnknownModel(_)) => FailureKind::UnknownModel,
            DirectorError::MissingCredential | DirectorError::InvalidCredential => {
                FailureKind::MissingCredential
            }
        }
    }
}

/// Where one request is in its life; `Complete` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Received,
    Converting,
    Forwarding,
    Streaming,
    Complete,
    Failed(FailureKind),
}

impl fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestPhase::Received => f.write_str("received"),
            RequestPhase::Converting => f.write_str("converting"),
            RequestPhase::Forwarding => f.write_str("forwarding"),
            RequestPhase::Streaming => f.write_str("streaming"),
            RequestPhase::Complete => f.write_str("complete"),
            RequestPhase::Failed(kind) => write!(f, "failed({kind:?})"),
        }
    }
}

/// Per-request identity carried into logs, including the relay task's.
#[derive(Debug, Clone)]
pub struct RequestTrace {
    pub trace_id: String,
    pub route: String,
    pub started_at: Instant,
}

impl RequestTrace {
    pub fn new(route: impl Into<String>) -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().to_string(),
            route: route.into(),
            started_at: Instant::now(),
        }
    }
}

/// Sends one outbound request and relays the answer. Never retries.
#[derive(Clone)]
pub struct Dispatcher {
    client: Arc<dyn UpstreamClient>,
}

impl Dispatcher {
    pub fn new(client: Arc<dyn UpstreamClient>) -> Self {
        Self { client }
    }

    pub async fn dispatch(
        &self,
        outbound: OutboundRequest,
        trace: &RequestTrace,
    ) -> Result<Response, ProxyError> {
        let upstream = match self.client.send(outbound).await {
            Ok(upstream) => upstream,
            Err(failure) => {
                warn!(
                    event = "upstream_failed",
                    trace_id = %trace.trace_id,
                    route = %trace.route,
                    phase = %RequestPhase::Failed(FailureKind::Upstream),
                    kind = ?failure.kind,
                    error = %failure.message,
                    elapsed_ms = trace.started_at.elapsed().as_millis()
                );
                return Err(failure.into());
            }
        };

        let status = upstream.status;
        if status.is_success() {
            info!(
                event = "upstream_responded",
                trace_id = %trace.trace_id,
                route = %trace.route,
                phase = %RequestPhase::Streaming,
                status = status.as_u16(),
                elapsed_ms = trace.started_at.elapsed().as_millis()
            );
        } else {
            // Relayed verbatim; the caller sees upstream's own error body.
            warn!(
                event = "upstream_responded",
                trace_id = %trace.trace_id,
                route = %trace.route,
                phase = %RequestPhase::Streaming,
                status = status.as_u16(),
                elapsed_ms = trace.started_at.elapsed().as_millis()
            );
        }

        let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(RELAY_CHANNEL_CAPACITY);
        tokio::spawn(relay_body(upstream.body, tx, trace.clone()));

        let mut headers = upstream.headers;
        strip_hop_by_hop_and_framing(&mut headers);
        let mut resp = Response::new(Body::from_stream(ReceiverStream::new(rx)));
        *resp.status_mut() = status;
        *resp.headers_mut() = headers;
        Ok(resp)
    }
}

/// Moves upstream chunks to the caller one at a time, in order.
///
/// An upstream read error is passed on as an error item so the server aborts
/// the connection instead of ending the body cleanly. When the caller goes
/// away the upstream body is dropped, which releases its connection.
async fn relay_body(
    mut body: BodyStream,
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
    trace: RequestTrace,
) {
    let mut chunks: u64 = 0;
    let mut bytes: u64 = 0;
    loop {
        let next = tokio::select! {
            next = body.next() => next,
            () = tx.closed() => {
                info!(
                    event = "downstream_cancelled",
                    trace_id = %trace.trace_id,
                    route = %trace.route,
                    chunks,
                    bytes,
                    elapsed_ms = trace.started_at.elapsed().as_millis()
                );
                return;
            }
        };
        match next {
            Some(Ok(chunk)) => {
                chunks += 1;
                bytes += chunk.len() as u64;
                if tx.send(Ok(chunk)).await.is_err() {
                    info!(
                        event = "downstream_cancelled",
                        trace_id = %trace.trace_id,
                        route = %trace.route,
                        chunks,
                        bytes,
                        elapsed_ms = trace.started_at.elapsed().as_millis()
                    );
                    return;
                }
            }
            Some(Err(err)) => {
                warn!(
                    event = "downstream_aborted",
                    trace_id = %trace.trace_id,
                    route = %trace.route,
                    phase = %RequestPhase::Failed(FailureKind::Upstream),
                    error = %err,
                    chunks,
                    bytes,
                    elapsed_ms = trace.started_at.elapsed().as_millis()
                );
                let _ = tx.send(Err(err)).await;
                return;
            }
            None => {
                info!(
                    event = "downstream_responded",
                    trace_id = %trace.trace_id,
                    route = %trace.route,
                    phase = %RequestPhase::Complete,
                    chunks,
                    bytes,
                    elapsed_ms = trace.started_at.elapsed().as_millis()
                );
                return;
            }
        }
    }
}
