use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, Method, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::core::CoreState;
use crate::director::InboundRequest;
use crate::dispatch::{FailureKind, RequestPhase, RequestTrace};
use crate::error::ProxyError;

pub async fn proxy_handler(
    State(state): State<Arc<CoreState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let matched = match state.routes.match_request(&method, uri.path()) {
        Ok(matched) => matched,
        Err(err) => {
            info!(
                event = "downstream_rejected",
                method = %method,
                path = %uri.path(),
                error = %err
            );
            return error_response(err.into());
        }
    };

    let trace = RequestTrace::new(matched.route.name());
    info!(
        event = "downstream_received",
        trace_id = %trace.trace_id,
        route = %trace.route,
        phase = %RequestPhase::Received,
        method = %method,
        path = %uri.path(),
        body_bytes = body.len()
    );

    let inbound = InboundRequest {
        method,
        uri,
        headers,
        body,
    };
    debug!(
        event = "request_converting",
        trace_id = %trace.trace_id,
        route = %trace.route,
        phase = %RequestPhase::Converting,
        converter = matched.route.converter().kind()
    );
    let outbound = match state.director.build_outbound(&inbound, &matched) {
        Ok(outbound) => outbound,
        Err(err) => {
            warn!(
                event = "conversion_failed",
                trace_id = %trace.trace_id,
                route = %trace.route,
                phase = %RequestPhase::Failed(FailureKind::from(&err)),
                error = %err
            );
            return error_response(err.into());
        }
    };

    info!(
        event = "upstream_forwarding",
        trace_id = %trace.trace_id,
        route = %trace.route,
        phase = %RequestPhase::Forwarding,
        method = %outbound.method,
        target = %outbound.path_and_query()
    );

    match state.dispatcher.dispatch(outbound, &trace).await {
        Ok(resp) => resp,
        Err(err) => error_response(err),
    }
}

fn error_response(err: ProxyError) -> Response {
    err.into_response()
}
