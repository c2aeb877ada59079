//! Copy-on-read: answers a primary-store miss from the origin and copies the
//! object into the primary store without making the caller wait for it.

use std::{panic::AssertUnwindSafe, sync::Arc};

use anyhow::anyhow;
use axum::{
    http::{HeaderMap, StatusCode},
    response::Response,
};
use blob_store::{MultipartSession, PartResult, PrimaryStore, RangeSpec, StoredObjectMetadata};
use futures::FutureExt;
use gateway_metrics::{gateway_stats, Timer};
use gateway_utils::{collect_bytes, run_bounded, tee, ByteStream};
use opentelemetry::KeyValue;
use tracing::{debug, error, info, warn};

use crate::{
    config::MirrorConfig,
    context::{ObjectKey, RequestContext},
    error::GatewayError,
    origin::{Origin, OriginResponse},
};

/// One part of a multipart mirror. Part numbers start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartSpec {
    pub part_number: u32,
    pub offset: u64,
    pub length: u64,
}

impl PartSpec {
    pub fn range(&self) -> RangeSpec {
        RangeSpec::OffsetLength {
            offset: self.offset,
            length: Some(self.length),
        }
    }
}

/// How an object of `size` bytes is split into parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    pub size: u64,
    pub part_size: u64,
    pub part_count: u32,
}

impl PartPlan {
    /// Picks the smallest chunk-aligned part size that keeps the part count
    /// within `max_parts`, clamped to the store's part size limits.
    pub fn compute(size: u64, config: &MirrorConfig) -> Self {
        let alignment = config.chunk_alignment.max(1);
        let chunks = size.div_ceil(alignment);
        let candidate = chunks.div_ceil(config.max_parts.max(1)) * alignment;
        let part_size = candidate
            .max(config.min_chunk_size)
            .min(config.max_chunk_size)
            .max(1);
        PartPlan {
            size,
            part_size,
            part_count: size.div_ceil(part_size) as u32,
        }
    }

    pub fn parts(&self) -> impl Iterator<Item = PartSpec> + '_ {
        (0..self.part_count).map(move |index| {
            let offset = index as u64 * self.part_size;
            PartSpec {
                part_number: index + 1,
                offset,
                length: self.part_size.min(self.size - offset),
            }
        })
    }
}

/// Orders uploaded parts for completion. Fails unless they are exactly
/// parts `1..=part_count`, each once.
pub fn ordered_parts(
    mut parts: Vec<PartResult>,
    part_count: u32,
) -> anyhow::Result<Vec<PartResult>> {
    parts.sort_by_key(|part| part.part_number);
    if parts.len() != part_count as usize {
        return Err(anyhow!("expected {} parts, got {}", part_count, parts.len()));
    }
    for (index, part) in parts.iter().enumerate() {
        if part.part_number != index as u32 + 1 {
            return Err(anyhow!(
                "part sequence broken at position {}: found part {}",
                index + 1,
                part.part_number
            ));
        }
    }
    Ok(parts)
}

#[derive(Clone)]
pub struct CopyOnRead {
    origin: Arc<dyn Origin>,
    store: Arc<dyn PrimaryStore>,
    config: Arc<MirrorConfig>,
    metrics: Arc<gateway_stats::Metrics>,
}

impl CopyOnRead {
    pub fn new(
        origin: Arc<dyn Origin>,
        store: Arc<dyn PrimaryStore>,
        config: MirrorConfig,
        metrics: Arc<gateway_stats::Metrics>,
    ) -> Self {
        CopyOnRead {
            origin,
            store,
            config: Arc::new(config),
            metrics,
        }
    }

    /// Answers a GET the primary store could not serve. Mirroring runs on
    /// `ctx.background`; its outcome never changes the response.
    pub async fn serve(&self, ctx: &RequestContext) -> Result<Response, GatewayError> {
        let range = ctx.range.spec();
        if range.is_ranged() {
            let response = self.fetch(ctx).await?;
            if range.starts_at_zero() && response.status.is_success() {
                info!(key = %ctx.key, %range, "ranged read at offset 0, mirroring in the background");
                let engine = self.clone();
                let key = ctx.key.clone();
                ctx.background.spawn("mirror", ctx.key.as_str(), async move {
                    engine.mirror_object(&key).await
                });
            } else {
                debug!(key = %ctx.key, %range, "ranged read, not mirroring");
            }
            return Ok(response.into_response());
        }

        let head = self
            .origin
            .head(&ctx.key, &HeaderMap::new())
            .await
            .map_err(GatewayError::origin)?;
        let size = match head.content_length() {
            Some(size) if head.status == StatusCode::OK => size,
            _ => {
                debug!(key = %ctx.key, status = %head.status, "nothing to mirror");
                return self.passthrough(ctx).await;
            }
        };
        if size == 0 {
            info!(key = %ctx.key, "empty object, serving from origin without mirroring");
            self.record("none", "skipped");
            return self.passthrough(ctx).await;
        }
        if size < self.config.single_shot_threshold() {
            return self.single_shot(ctx, size).await;
        }

        let metadata = head.metadata();
        let engine = self.clone();
        let key = ctx.key.clone();
        ctx.background.spawn("mirror", ctx.key.as_str(), async move {
            engine.mirror_multipart(&key, metadata).await
        });
        self.passthrough(ctx).await
    }

    async fn fetch(&self, ctx: &RequestContext) -> Result<OriginResponse, GatewayError> {
        self.origin
            .fetch(&ctx.key, &ctx.headers)
            .await
            .map_err(GatewayError::origin)
    }

    async fn passthrough(&self, ctx: &RequestContext) -> Result<Response, GatewayError> {
        Ok(self.fetch(ctx).await?.into_response())
    }

    /// Streams the origin body to the caller and, through a tee, into a
    /// single primary-store write.
    async fn single_shot(&self, ctx: &RequestContext, size: u64) -> Result<Response, GatewayError> {
        let response = self.fetch(ctx).await?;
        if response.status != StatusCode::OK {
            return Ok(response.into_response());
        }
        let mut metadata = response.metadata();
        if metadata.size == 0 {
            metadata.size = size;
        }
        let OriginResponse {
            status,
            headers,
            body,
        } = response;
        let (client, copy) = tee(body);

        let engine = self.clone();
        let key = ctx.key.clone();
        ctx.background.spawn("mirror", ctx.key.as_str(), async move {
            engine.write_single(&key, copy, metadata).await
        });
        Ok(OriginResponse {
            status,
            headers,
            body: client,
        }
        .into_response())
    }

    /// Mirrors `key` in full, independent of any client request.
    pub async fn mirror_object(&self, key: &ObjectKey) -> anyhow::Result<()> {
        let head = self
            .origin
            .head(key, &HeaderMap::new())
            .await
            .map_err(GatewayError::origin)?;
        let size = match head.content_length() {
            Some(size) if head.status == StatusCode::OK => size,
            _ => {
                return Err(GatewayError::OriginUnavailable {
                    status: Some(head.status),
                    source: anyhow!("origin HEAD for {} answered {}", key, head.status),
                }
                .into())
            }
        };
        if size == 0 {
            self.record("none", "skipped");
            return Ok(());
        }
        let metadata = head.metadata();
        if size >= self.config.single_shot_threshold() {
            return self.mirror_multipart(key, metadata).await;
        }

        let response = self
            .origin
            .fetch(key, &HeaderMap::new())
            .await
            .map_err(GatewayError::origin)?;
        if response.status != StatusCode::OK {
            return Err(GatewayError::OriginUnavailable {
                status: Some(response.status),
                source: anyhow!("origin GET for {} answered {}", key, response.status),
            }
            .into());
        }
        self.write_single(key, response.body, metadata).await
    }

    async fn write_single(
        &self,
        key: &ObjectKey,
        body: ByteStream,
        metadata: StoredObjectMetadata,
    ) -> anyhow::Result<()> {
        let _timer = Timer::start_with_labels(
            &self.metrics.mirror_duration,
            &[KeyValue::new("strategy", "single")],
        );
        let result: Result<(), GatewayError> = async {
            let bytes = collect_bytes(body).await.map_err(GatewayError::origin)?;
            if bytes.len() as u64 != metadata.size {
                return Err(GatewayError::origin(anyhow!(
                    "origin sent {} bytes for {}, expected {}",
                    bytes.len(),
                    key,
                    metadata.size
                )));
            }
            self.store
                .put(key.as_str(), bytes, &metadata)
                .await
                .map_err(|e| GatewayError::store_write(key.as_str(), e))
        }
        .await;

        match result {
            Ok(()) => {
                info!(key = %key, size = metadata.size, "mirrored object");
                self.record("single", "completed");
                self.metrics.mirrored_bytes.add(metadata.size, &[]);
                Ok(())
            }
            Err(err) => {
                self.record("single", "failed");
                Err(err.into())
            }
        }
    }

    async fn mirror_multipart(
        &self,
        key: &ObjectKey,
        metadata: StoredObjectMetadata,
    ) -> anyhow::Result<()> {
        let _timer = Timer::start_with_labels(
            &self.metrics.mirror_duration,
            &[KeyValue::new("strategy", "multipart")],
        );
        let plan = PartPlan::compute(metadata.size, &self.config);
        let session = self
            .store
            .create_multipart_upload(key.as_str(), &metadata)
            .await
            .map_err(|e| GatewayError::store_write(key.as_str(), e))?;
        info!(
            key = %key,
            size = plan.size,
            part_size = plan.part_size,
            part_count = plan.part_count,
            "starting multipart mirror"
        );

        let transfer = self.transfer_parts(key, session.as_ref(), &plan);
        let result = AssertUnwindSafe(transfer)
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow!("multipart transfer panicked").into()));

        match result {
            Ok(()) => {
                info!(key = %key, "multipart mirror completed");
                self.record("multipart", "completed");
                self.metrics.mirrored_bytes.add(plan.size, &[]);
                Ok(())
            }
            Err(err) => {
                warn!(key = %key, "multipart mirror failed, aborting: {}", err);
                if let Err(abort_err) = session.abort().await {
                    let abort_err = GatewayError::store_write(key.as_str(), abort_err);
                    error!(key = %key, "abort failed: {}", abort_err);
                }
                self.record("multipart", "aborted");
                Err(err.into())
            }
        }
    }

    async fn transfer_parts(
        &self,
        key: &ObjectKey,
        session: &dyn MultipartSession,
        plan: &PartPlan,
    ) -> Result<(), GatewayError> {
        let transfers = plan
            .parts()
            .map(|part| self.transfer_part(key, session, part));
        let parts = run_bounded(self.config.part_concurrency, transfers).await?;
        let parts = ordered_parts(parts, plan.part_count)?;
        session
            .complete(parts)
            .await
            .map_err(|e| GatewayError::store_write(key.as_str(), e))
    }

    async fn transfer_part(
        &self,
        key: &ObjectKey,
        session: &dyn MultipartSession,
        part: PartSpec,
    ) -> Result<PartResult, GatewayError> {
        let failed = |source: anyhow::Error| GatewayError::PartTransferFailed {
            part_number: part.part_number,
            source,
        };
        let range = part.range();
        let response = self.origin.fetch_range(key, &range).await.map_err(failed)?;
        if response.status != StatusCode::PARTIAL_CONTENT {
            return Err(failed(anyhow!(
                "origin answered {} for {}",
                response.status,
                range
            )));
        }
        let body = collect_bytes(response.body).await.map_err(failed)?;
        if body.len() as u64 != part.length {
            return Err(failed(anyhow!(
                "origin sent {} bytes for {}, expected {}",
                body.len(),
                range,
                part.length
            )));
        }
        debug!(key = %key, part_number = part.part_number, %range, "uploading part");
        session
            .upload_part(part.part_number, body)
            .await
            .map_err(failed)
    }

    fn record(&self, strategy: &'static str, outcome: &'static str) {
        self.metrics.mirrors.add(
            1,
            &[
                KeyValue::new("strategy", strategy),
                KeyValue::new("outcome", outcome),
            ],
        );
    }
}
