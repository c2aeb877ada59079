//! HTTP client for the origin store.

use std::{collections::BTreeMap, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::Response,
};
use blob_store::{RangeSpec, StoredObjectMetadata};
use futures::{StreamExt, TryStreamExt};
use gateway_utils::ByteStream;
use tracing::debug;
use url::Url;

use crate::{codec::header_date, context::ObjectKey};

/// Request headers forwarded to the origin. Anything that could make the
/// origin transform the body, `accept-encoding` in particular, stays behind
/// so byte offsets line up with the stored object.
static FORWARDED_REQUEST_HEADERS: [HeaderName; 5] = [
    header::RANGE,
    header::IF_MATCH,
    header::IF_NONE_MATCH,
    header::IF_MODIFIED_SINCE,
    header::IF_UNMODIFIED_SINCE,
];

/// Origin response headers relayed to clients.
static RELAYED_RESPONSE_HEADERS: [HeaderName; 10] = [
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::CONTENT_RANGE,
    header::CONTENT_ENCODING,
    header::CONTENT_DISPOSITION,
    header::CONTENT_LANGUAGE,
    header::CACHE_CONTROL,
    header::ETAG,
    header::LAST_MODIFIED,
    header::EXPIRES,
];

/// Entity headers persisted alongside a mirrored object.
static PERSISTED_HEADERS: [HeaderName; 4] = [
    header::CONTENT_DISPOSITION,
    header::CONTENT_ENCODING,
    header::CONTENT_LANGUAGE,
    header::CACHE_CONTROL,
];

pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl OriginResponse {
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(header::CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .parse()
            .ok()
    }

    /// Size of the whole object, which for a partial response is the total
    /// after the `/` in `content-range`.
    pub fn object_size(&self) -> Option<u64> {
        if self.status == StatusCode::PARTIAL_CONTENT {
            let value = self.headers.get(header::CONTENT_RANGE)?.to_str().ok()?;
            return value.rsplit_once('/')?.1.parse().ok();
        }
        self.content_length()
    }

    pub fn metadata(&self) -> StoredObjectMetadata {
        let text = |name: HeaderName| {
            self.headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let custom_headers: BTreeMap<String, String> = PERSISTED_HEADERS
            .iter()
            .filter_map(|name| Some((name.as_str().to_string(), text(name.clone())?)))
            .collect();
        StoredObjectMetadata {
            etag: text(header::ETAG),
            size: self.object_size().unwrap_or_default(),
            content_type: text(header::CONTENT_TYPE),
            last_modified: header_date(&self.headers, header::LAST_MODIFIED),
            custom_headers,
        }
    }

    pub fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        for name in RELAYED_RESPONSE_HEADERS.iter() {
            if let Some(value) = self.headers.get(name) {
                headers.insert(name.clone(), value.clone());
            }
        }
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        let mut response = Response::new(Body::from_stream(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = headers;
        response
    }
}

#[async_trait]
pub trait Origin: Send + Sync {
    /// Sends one request for `key`. Callers go through [`Origin::fetch`],
    /// [`Origin::head`] or [`Origin::fetch_range`], which filter headers.
    async fn send(&self, method: Method, key: &ObjectKey, headers: HeaderMap)
        -> Result<OriginResponse>;

    async fn fetch(&self, key: &ObjectKey, headers: &HeaderMap) -> Result<OriginResponse> {
        self.send(Method::GET, key, outbound_headers(headers)).await
    }

    /// Learns status, size and metadata without transferring the body.
    async fn head(&self, key: &ObjectKey, headers: &HeaderMap) -> Result<OriginResponse> {
        self.send(Method::HEAD, key, outbound_headers(headers)).await
    }

    async fn fetch_range(&self, key: &ObjectKey, range: &RangeSpec) -> Result<OriginResponse> {
        let mut headers = HeaderMap::new();
        if range.is_ranged() {
            headers.insert(header::RANGE, HeaderValue::from_str(&range.to_string())?);
        }
        self.send(Method::GET, key, headers).await
    }
}

pub fn outbound_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for name in FORWARDED_REQUEST_HEADERS.iter() {
        if let Some(value) = incoming.get(name) {
            headers.insert(name.clone(), value.clone());
        }
    }
    headers
}

/// Resolves `key` against the origin base URL. Literal `+` in the path is
/// sent as `%2B` since the origin reads a bare `+` as a space.
pub fn origin_url(base: &Url, key: &ObjectKey) -> Result<Url> {
    let mut url = base.join(key.as_str())?;
    if !url.as_str().starts_with(base.as_str()) {
        return Err(anyhow!("key {} resolves outside the origin base url", key));
    }
    if url.path().contains('+') {
        let path = url.path().replace('+', "%2B");
        url.set_path(&path);
    }
    Ok(url)
}

pub struct HttpOrigin {
    client: reqwest::Client,
    base: Url,
}

impl HttpOrigin {
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .no_gzip()
            .build()?;
        Ok(HttpOrigin { client, base })
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn send(
        &self,
        method: Method,
        key: &ObjectKey,
        headers: HeaderMap,
    ) -> Result<OriginResponse> {
        let url = origin_url(&self.base, key)?;
        debug!(%method, %url, "origin request");
        let response = self
            .client
            .request(method, url)
            .headers(headers)
            .send()
            .await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes_stream().map_err(anyhow::Error::from).boxed();
        Ok(OriginResponse {
            status,
            headers,
            body,
        })
    }
}
