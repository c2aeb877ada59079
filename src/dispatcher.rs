use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use blob_store::{Precondition, PrimaryStore, RangeSpec, StoreRead};
use gateway_metrics::gateway_stats;
use opentelemetry::KeyValue;
use tracing::{info, warn};

use crate::{
    codec::{build_response, precondition_failed, ClientRange, Payload},
    context::RequestContext,
    edge_cache::EdgeCacheController,
    error::GatewayError,
    mirror::CopyOnRead,
    origin::Origin,
};

pub const ALLOWED_METHODS: &str = "GET, HEAD, OPTIONS";

/// What a request turns into, decided by its method alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    OptionsReply,
    HeadFlow,
    GetFlow,
    MethodNotAllowed,
}

impl Flow {
    pub fn for_method(method: &Method) -> Flow {
        match *method {
            Method::OPTIONS => Flow::OptionsReply,
            Method::HEAD => Flow::HeadFlow,
            Method::GET => Flow::GetFlow,
            _ => Flow::MethodNotAllowed,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    origin: Arc<dyn Origin>,
    store: Arc<dyn PrimaryStore>,
    engine: CopyOnRead,
    cache: EdgeCacheController,
    metrics: Arc<gateway_stats::Metrics>,
}

impl Dispatcher {
    pub fn new(
        origin: Arc<dyn Origin>,
        store: Arc<dyn PrimaryStore>,
        engine: CopyOnRead,
        cache: EdgeCacheController,
        metrics: Arc<gateway_stats::Metrics>,
    ) -> Self {
        Dispatcher {
            origin,
            store,
            engine,
            cache,
            metrics,
        }
    }

    /// Produces the response for one request. Mirroring and cache writes
    /// are left running on `ctx.background`.
    pub async fn dispatch(&self, ctx: &RequestContext) -> Result<Response, GatewayError> {
        match Flow::for_method(&ctx.method) {
            Flow::OptionsReply => Ok(allow_response(StatusCode::OK)),
            Flow::MethodNotAllowed => {
                info!(method = %ctx.method, "method not allowed");
                Ok(allow_response(StatusCode::METHOD_NOT_ALLOWED))
            }
            Flow::HeadFlow | Flow::GetFlow if ctx.key.is_empty() => {
                Ok(StatusCode::NOT_FOUND.into_response())
            }
            Flow::HeadFlow => self.head(ctx).await,
            Flow::GetFlow => self.get(ctx).await,
        }
    }

    async fn head(&self, ctx: &RequestContext) -> Result<Response, GatewayError> {
        match self.store.head(ctx.key.as_str()).await {
            Ok(Some(metadata)) => {
                info!(key = %ctx.key, "HEAD served from primary store");
                self.record(ctx, "store");
                // A plain HEAD answers 200 with the stored headers, not 304;
                // only a matching validator turns it into 304.
                let payload = match ctx
                    .conditions
                    .evaluate(metadata.etag.as_deref(), metadata.last_modified)
                {
                    Precondition::Proceed => Payload::HeadOnly,
                    Precondition::NotModified => Payload::NotModified,
                    Precondition::Failed => return Ok(precondition_failed(&metadata)),
                };
                Ok(build_response(&metadata, payload, &RangeSpec::Whole))
            }
            Ok(None) => self.head_from_origin(ctx).await,
            Err(err) => {
                warn!(key = %ctx.key, "primary store HEAD failed: {:#}", err);
                self.head_from_origin(ctx).await
            }
        }
    }

    async fn head_from_origin(&self, ctx: &RequestContext) -> Result<Response, GatewayError> {
        info!(key = %ctx.key, "HEAD passed through to origin");
        self.record(ctx, "origin");
        let response = self
            .origin
            .head(&ctx.key, &ctx.headers)
            .await
            .map_err(GatewayError::origin)?;
        Ok(response.into_response())
    }

    async fn get(&self, ctx: &RequestContext) -> Result<Response, GatewayError> {
        let range = match &ctx.range {
            ClientRange::Parsed(range) => *range,
            ClientRange::Malformed(header) => {
                info!(key = %ctx.key, range = %header, "unparseable range, passing through to origin");
                self.record(ctx, "origin");
                let response = self
                    .origin
                    .fetch(&ctx.key, &ctx.headers)
                    .await
                    .map_err(|source| {
                        warn!(key = %ctx.key, "origin unreachable: {:#}", source);
                        GatewayError::MalformedRange {
                            header: header.clone(),
                        }
                    })?;
                return Ok(response.into_response());
            }
        };

        if let Some(entry) = self.cache.lookup(ctx).await {
            self.record(ctx, "cache");
            return Ok(self.cache.entry_response(entry, ctx));
        }

        let read = match self
            .store
            .get(ctx.key.as_str(), &range, &ctx.conditions)
            .await
        {
            Ok(read) => read,
            Err(err) => {
                warn!(key = %ctx.key, %range, "primary store read failed: {:#}", err);
                StoreRead::Missing
            }
        };
        match read {
            StoreRead::Found(object) => {
                info!(key = %ctx.key, %range, "served from primary store");
                self.record(ctx, "store");
                let response = build_response(&object.metadata, Payload::Body(object.body), &range);
                Ok(self.cache.maybe_store(ctx, response))
            }
            StoreRead::NotModified(metadata) => {
                self.record(ctx, "store");
                Ok(build_response(&metadata, Payload::NotModified, &range))
            }
            StoreRead::PreconditionFailed(metadata) => {
                self.record(ctx, "store");
                Ok(precondition_failed(&metadata))
            }
            StoreRead::Missing => {
                info!(key = %ctx.key, %range, "not in primary store, reading through from origin");
                self.record(ctx, "origin");
                let response = self.engine.serve(ctx).await?;
                Ok(self.cache.maybe_store(ctx, response))
            }
        }
    }

    fn record(&self, ctx: &RequestContext, source: &'static str) {
        self.metrics.requests.add(
            1,
            &[
                KeyValue::new("method", ctx.method.to_string()),
                KeyValue::new("source", source),
            ],
        );
    }
}

fn allow_response(status: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::ALLOW, HeaderValue::from_static(ALLOWED_METHODS));
    response
}
