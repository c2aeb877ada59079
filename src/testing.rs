//! In-process collaborators for exercising the gateway without a network.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::{
    body::to_bytes,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::Response,
};
use blob_store::{
    etag_listed, Conditions, MultipartSession, ObjectStorePrimary, PartResult, PrimaryStore,
    RangeSpec, StoreRead, StoredObjectMetadata,
};
use bytes::Bytes;
use futures::{stream, StreamExt};
use object_store::{memory::InMemory, path::Path};

use crate::{
    codec::parse_range,
    context::ObjectKey,
    origin::{Origin, OriginResponse},
};

pub async fn read_body(response: Response) -> Result<Bytes> {
    Ok(to_bytes(response.into_body(), usize::MAX).await?)
}

/// Deterministic, non-repeating-per-offset bytes so misplaced ranges show up.
pub fn pattern(size: usize) -> Bytes {
    (0..size)
        .map(|i| ((i * 31 + i / 251) % 251) as u8)
        .collect::<Vec<_>>()
        .into()
}

pub fn fake_etag(body: &Bytes) -> String {
    format!("\"origin-{}\"", body.len())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginRequest {
    pub method: Method,
    pub key: String,
    pub range: Option<String>,
}

/// Origin that serves byte ranges out of memory and records every request.
#[derive(Default)]
pub struct FakeOrigin {
    objects: Mutex<HashMap<String, Bytes>>,
    requests: Mutex<Vec<OriginRequest>>,
    failing_offsets: Mutex<HashSet<u64>>,
}

impl FakeOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, body: Bytes) {
        self.objects.lock().unwrap().insert(key.to_string(), body);
    }

    /// Ranged GETs starting at `offset` answer 500.
    pub fn fail_range_at(&self, offset: u64) {
        self.failing_offsets.lock().unwrap().insert(offset);
    }

    pub fn requests(&self) -> Vec<OriginRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, method: Method) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method)
            .count()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().unwrap().clear();
    }

    fn respond(status: StatusCode, headers: HeaderMap, body: Bytes) -> OriginResponse {
        OriginResponse {
            status,
            headers,
            body: stream::iter(vec![Ok::<_, anyhow::Error>(body)]).boxed(),
        }
    }
}

#[async_trait]
impl Origin for FakeOrigin {
    async fn send(
        &self,
        method: Method,
        key: &ObjectKey,
        headers: HeaderMap,
    ) -> Result<OriginResponse> {
        let range = headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.requests.lock().unwrap().push(OriginRequest {
            method: method.clone(),
            key: key.to_string(),
            range: range.clone(),
        });

        let Some(object) = self.objects.lock().unwrap().get(key.as_str()).cloned() else {
            return Ok(Self::respond(
                StatusCode::NOT_FOUND,
                HeaderMap::new(),
                Bytes::new(),
            ));
        };
        let size = object.len() as u64;
        let etag = fake_etag(&object);

        let mut response_headers = HeaderMap::new();
        response_headers.insert(header::ETAG, HeaderValue::from_str(&etag)?);
        response_headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        response_headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );

        if let Some(candidates) = headers.get(header::IF_NONE_MATCH) {
            if etag_listed(candidates.to_str()?, &etag, false) {
                return Ok(Self::respond(
                    StatusCode::NOT_MODIFIED,
                    response_headers,
                    Bytes::new(),
                ));
            }
        }

        let (status, body) = match range {
            None => (StatusCode::OK, object),
            Some(value) => {
                let bounds = parse_range(&value)
                    .unwrap_or(RangeSpec::Whole)
                    .bounds(size);
                let Some((first, last)) = bounds else {
                    response_headers.insert(
                        header::CONTENT_RANGE,
                        HeaderValue::from_str(&format!("bytes */{}", size))?,
                    );
                    return Ok(Self::respond(
                        StatusCode::RANGE_NOT_SATISFIABLE,
                        response_headers,
                        Bytes::new(),
                    ));
                };
                if self.failing_offsets.lock().unwrap().contains(&first) {
                    return Ok(Self::respond(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        HeaderMap::new(),
                        Bytes::new(),
                    ));
                }
                response_headers.insert(
                    header::CONTENT_RANGE,
                    HeaderValue::from_str(&format!("bytes {}-{}/{}", first, last, size))?,
                );
                (
                    StatusCode::PARTIAL_CONTENT,
                    object.slice(first as usize..=last as usize),
                )
            }
        };
        response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        let body = if method == Method::HEAD {
            Bytes::new()
        } else {
            body
        };
        Ok(Self::respond(status, response_headers, body))
    }
}

#[derive(Default)]
struct StoreCalls {
    puts: AtomicUsize,
    creates: AtomicUsize,
    parts: AtomicUsize,
    completes: AtomicUsize,
    aborts: AtomicUsize,
    in_flight_parts: AtomicUsize,
    peak_parts: AtomicUsize,
}

/// Primary store over `InMemory` that counts every write-side call.
pub struct RecordingStore {
    inner: ObjectStorePrimary,
    calls: Arc<StoreCalls>,
    fail_puts: bool,
    panic_on_parts: bool,
    panic_on_reads: bool,
}

impl RecordingStore {
    pub fn new() -> Self {
        RecordingStore {
            inner: ObjectStorePrimary::from_store(InMemory::new(), Path::default()),
            calls: Arc::default(),
            fail_puts: false,
            panic_on_parts: false,
            panic_on_reads: false,
        }
    }

    pub fn failing_puts() -> Self {
        RecordingStore {
            fail_puts: true,
            ..Self::new()
        }
    }

    /// Every `upload_part` panics.
    pub fn panicking_parts() -> Self {
        RecordingStore {
            panic_on_parts: true,
            ..Self::new()
        }
    }

    /// Every `get` panics.
    pub fn panicking_reads() -> Self {
        RecordingStore {
            panic_on_reads: true,
            ..Self::new()
        }
    }

    pub fn puts(&self) -> usize {
        self.calls.puts.load(Ordering::SeqCst)
    }

    pub fn creates(&self) -> usize {
        self.calls.creates.load(Ordering::SeqCst)
    }

    pub fn parts(&self) -> usize {
        self.calls.parts.load(Ordering::SeqCst)
    }

    pub fn completes(&self) -> usize {
        self.calls.completes.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> usize {
        self.calls.aborts.load(Ordering::SeqCst)
    }

    pub fn peak_parts(&self) -> usize {
        self.calls.peak_parts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PrimaryStore for RecordingStore {
    async fn head(&self, key: &str) -> Result<Option<StoredObjectMetadata>> {
        self.inner.head(key).await
    }

    async fn get(
        &self,
        key: &str,
        range: &RangeSpec,
        conditions: &Conditions,
    ) -> Result<StoreRead> {
        if self.panic_on_reads {
            panic!("primary store read of {} blew up", key);
        }
        self.inner.get(key, range, conditions).await
    }

    async fn put(&self, key: &str, body: Bytes, metadata: &StoredObjectMetadata) -> Result<()> {
        self.calls.puts.fetch_add(1, Ordering::SeqCst);
        if self.fail_puts {
            return Err(anyhow!("primary store rejected the write"));
        }
        self.inner.put(key, body, metadata).await
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        metadata: &StoredObjectMetadata,
    ) -> Result<Box<dyn MultipartSession>> {
        self.calls.creates.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.create_multipart_upload(key, metadata).await?;
        Ok(Box::new(RecordingSession {
            inner,
            calls: self.calls.clone(),
            panic_on_parts: self.panic_on_parts,
        }))
    }
}

struct RecordingSession {
    inner: Box<dyn MultipartSession>,
    calls: Arc<StoreCalls>,
    panic_on_parts: bool,
}

#[async_trait]
impl MultipartSession for RecordingSession {
    async fn upload_part(&self, part_number: u32, body: Bytes) -> Result<PartResult> {
        self.calls.parts.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_parts {
            panic!("part {} upload blew up", part_number);
        }
        let now = self.calls.in_flight_parts.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls.peak_parts.fetch_max(now, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let result = self.inner.upload_part(part_number, body).await;
        self.calls.in_flight_parts.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn complete(&self, parts: Vec<PartResult>) -> Result<()> {
        self.calls.completes.fetch_add(1, Ordering::SeqCst);
        self.inner.complete(parts).await
    }

    async fn abort(&self) -> Result<()> {
        self.calls.aborts.fetch_add(1, Ordering::SeqCst);
        self.inner.abort().await
    }
}
