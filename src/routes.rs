use std::{panic::AssertUnwindSafe, sync::Arc};

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Method, Uri},
    response::{IntoResponse, Response},
    Router,
};
use futures::FutureExt;
use gateway_metrics::gateway_stats;
use gateway_utils::GuardStreamExt;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::{
    background::BackgroundTasks,
    context::RequestContext,
    dispatcher::Dispatcher,
    error::GatewayError,
    middleware::GatewayRequestSpan,
    origin::{outbound_headers, Origin},
};

#[derive(Clone)]
pub struct RouteState {
    pub dispatcher: Dispatcher,
    pub origin: Arc<dyn Origin>,
    pub background: BackgroundTasks,
    pub index_object: Option<String>,
    pub metrics: Arc<gateway_stats::Metrics>,
}

/// Every path lands on one handler; the method decides the flow.
pub fn create_routes(route_state: RouteState, env: &str, instance_id: &str) -> Router {
    Router::new()
        .fallback(serve_object)
        .layer(
            TraceLayer::new_for_http().make_span_with(GatewayRequestSpan::new(env, instance_id)),
        )
        .with_state(route_state)
}

async fn serve_object(
    State(state): State<RouteState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let ctx = RequestContext::new(
        method,
        &uri,
        headers,
        state.background.clone(),
        state.index_object.as_deref(),
    );
    let outcome = AssertUnwindSafe(state.dispatcher.dispatch(&ctx))
        .catch_unwind()
        .await;
    let response = match outcome {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => err.into_response(),
        Err(_) => {
            error!(key = %ctx.key, "dispatch panicked, passing request to origin");
            passthrough(&state, &ctx).await
        }
    };
    track_stream(response, state.metrics.clone())
}

/// Last resort: the request goes to the origin as if the gateway were not
/// there.
async fn passthrough(state: &RouteState, ctx: &RequestContext) -> Response {
    match state
        .origin
        .send(ctx.method.clone(), &ctx.key, outbound_headers(&ctx.headers))
        .await
    {
        Ok(response) => response.into_response(),
        Err(err) => GatewayError::origin(err).into_response(),
    }
}

fn track_stream(response: Response, metrics: Arc<gateway_stats::Metrics>) -> Response {
    let (parts, body) = response.into_parts();
    metrics.active_streams.add(1, &[]);
    let body = body
        .into_data_stream()
        .guard(move || metrics.active_streams.add(-1, &[]));
    Response::from_parts(parts, Body::from_stream(body))
}
