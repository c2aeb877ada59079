//! Response cache in front of the primary store.
//!
//! Entries are whole-object 200 responses keyed by full request URL. An
//! entry is only served while its etag still matches the primary store's
//! copy of the object.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::Response,
};
use blob_store::{Precondition, PrimaryStore};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use gateway_metrics::gateway_stats;
use gateway_utils::{collect_bytes, tee, ByteStream};
use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use crate::{
    codec::{content_range, header_date},
    config::EdgeCacheConfig,
    context::RequestContext,
};

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub etag: Option<String>,
}

#[async_trait]
pub trait EdgeCache: Send + Sync {
    async fn match_entry(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Replaces any entry stored under `entry.key`.
    async fn put(&self, entry: CacheEntry) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryEdgeCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryEdgeCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl MemoryEdgeCache {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl EdgeCache for MemoryEdgeCache {
    async fn match_entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        self.entries.insert(entry.key.clone(), entry);
        Ok(())
    }
}

#[derive(Clone)]
pub struct EdgeCacheController {
    cache: Arc<dyn EdgeCache>,
    store: Arc<dyn PrimaryStore>,
    enabled: bool,
    max_entry_bytes: u64,
    cache_control: HeaderValue,
    metrics: Arc<gateway_stats::Metrics>,
}

impl EdgeCacheController {
    pub fn new(
        cache: Arc<dyn EdgeCache>,
        store: Arc<dyn PrimaryStore>,
        config: &EdgeCacheConfig,
        metrics: Arc<gateway_stats::Metrics>,
    ) -> Result<Self> {
        let cache_control = HeaderValue::from_str(&config.cache_control)
            .map_err(|e| anyhow!("invalid edge_cache.cache_control: {}", e))?;
        Ok(EdgeCacheController {
            cache,
            store,
            enabled: config.enabled,
            max_entry_bytes: config.max_entry_bytes,
            cache_control,
            metrics,
        })
    }

    /// Returns a cached entry for the request URL if the primary store still
    /// holds the same version of the object.
    pub async fn lookup(&self, ctx: &RequestContext) -> Option<CacheEntry> {
        if !self.enabled {
            return None;
        }
        let entry = match self.cache.match_entry(&ctx.url).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                info!(url = %ctx.url, "cache miss");
                self.record_lookup("miss");
                return None;
            }
            Err(err) => {
                warn!(url = %ctx.url, "cache lookup failed: {:#}", err);
                self.record_lookup("miss");
                return None;
            }
        };

        let current = match self.store.head(ctx.key.as_str()).await {
            Ok(metadata) => metadata.and_then(|m| m.etag),
            Err(err) => {
                warn!(key = %ctx.key, "primary store HEAD failed during cache validation: {:#}", err);
                None
            }
        };
        match (&entry.etag, &current) {
            (Some(cached), Some(current)) if cached == current => {
                info!(url = %ctx.url, etag = %cached, "cache hit");
                self.record_lookup("hit");
                Some(entry)
            }
            _ => {
                info!(
                    url = %ctx.url,
                    cached = ?entry.etag,
                    current = ?current,
                    "cache stale"
                );
                self.record_lookup("stale");
                None
            }
        }
    }

    /// Serves a fresh entry, honoring the request's range and conditional
    /// headers.
    pub fn entry_response(&self, entry: CacheEntry, ctx: &RequestContext) -> Response {
        let last_modified = header_date(&entry.headers, header::LAST_MODIFIED);
        match ctx.conditions.evaluate(entry.etag.as_deref(), last_modified) {
            Precondition::Proceed => {}
            Precondition::NotModified => {
                let mut headers = entry.headers;
                headers.remove(header::CONTENT_LENGTH);
                return respond(StatusCode::NOT_MODIFIED, headers, Body::empty());
            }
            Precondition::Failed => {
                let mut headers = HeaderMap::new();
                if let Some(etag) = entry.headers.get(header::ETAG) {
                    headers.insert(header::ETAG, etag.clone());
                }
                return respond(StatusCode::PRECONDITION_FAILED, headers, Body::empty());
            }
        }

        let range = ctx.range.spec();
        if !range.is_ranged() {
            return respond(StatusCode::OK, entry.headers, Body::from(entry.body));
        }
        let size = entry.body.len() as u64;
        let mut headers = entry.headers;
        match (range.bounds(size), content_range(&range, size)) {
            (Some((first, last)), Some(value)) => {
                let body = entry.body.slice(first as usize..=last as usize);
                if let Ok(value) = HeaderValue::from_str(&value) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
                respond(StatusCode::PARTIAL_CONTENT, headers, Body::from(body))
            }
            _ => {
                let value = format!("bytes */{}", size);
                if let Ok(value) = HeaderValue::from_str(&value) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(0));
                respond(StatusCode::RANGE_NOT_SATISFIABLE, headers, Body::empty())
            }
        }
    }

    /// Caches a whole-object 200 response in the background while it
    /// streams to the caller. Everything else is returned untouched.
    pub fn maybe_store(&self, ctx: &RequestContext, response: Response) -> Response {
        if !self.enabled || response.status() != StatusCode::OK {
            return response;
        }
        let length = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let Some(length) = length.filter(|length| *length <= self.max_entry_bytes) else {
            debug!(url = %ctx.url, ?length, "response not cacheable by size");
            return response;
        };

        let (mut parts, body) = response.into_parts();
        parts
            .headers
            .insert(header::CACHE_CONTROL, self.cache_control.clone());
        let etag = parts
            .headers
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let stream: ByteStream = body.into_data_stream().map_err(anyhow::Error::from).boxed();
        let (client, copy) = tee(stream);

        let cache = self.cache.clone();
        let metrics = self.metrics.clone();
        let entry_headers = parts.headers.clone();
        let url = ctx.url.clone();
        ctx.background
            .spawn("cache-write", ctx.key.as_str(), async move {
                let body = collect_bytes(copy).await?;
                if body.len() as u64 != length {
                    return Err(anyhow!(
                        "response for {} was {} bytes, expected {}",
                        url,
                        body.len(),
                        length
                    ));
                }
                cache
                    .put(CacheEntry {
                        key: url.clone(),
                        headers: entry_headers,
                        body,
                        etag,
                    })
                    .await?;
                metrics.cache_writes.add(1, &[]);
                debug!(url = %url, "cached response");
                Ok(())
            });

        Response::from_parts(parts, Body::from_stream(client))
    }

    fn record_lookup(&self, outcome: &'static str) {
        self.metrics
            .cache_lookups
            .add(1, &[KeyValue::new("outcome", outcome)]);
    }
}

fn respond(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
