use std::fmt;

use axum::http::{header, HeaderMap, Method, Uri};
use blob_store::Conditions;

use crate::{
    background::BackgroundTasks,
    codec::{parse_conditions, ClientRange},
};

/// Path of an object, shared by the origin, the primary store and the edge
/// cache. Kept exactly as it appears in the request path, minus the leading
/// `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn from_path(path: &str) -> Self {
        ObjectKey(path.strip_prefix('/').unwrap_or(path).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a single request carries through the dispatcher.
pub struct RequestContext {
    pub method: Method,
    /// Full request URL; the edge cache key.
    pub url: String,
    pub key: ObjectKey,
    pub headers: HeaderMap,
    pub range: ClientRange,
    pub conditions: Conditions,
    pub background: BackgroundTasks,
}

impl RequestContext {
    pub fn new(
        method: Method,
        uri: &Uri,
        headers: HeaderMap,
        background: BackgroundTasks,
        index_object: Option<&str>,
    ) -> Self {
        let mut key = ObjectKey::from_path(uri.path());
        if key.is_empty() {
            if let Some(index) = index_object {
                key = ObjectKey::from_path(index);
            }
        }
        RequestContext {
            url: request_url(uri, &headers),
            range: ClientRange::from_headers(&headers),
            conditions: parse_conditions(&headers),
            method,
            key,
            headers,
            background,
        }
    }
}

fn request_url(uri: &Uri, headers: &HeaderMap) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .or(uri.scheme_str())
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or(uri.authority().map(|a| a.as_str()))
        .unwrap_or("localhost");
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    format!("{}://{}{}", scheme, host, path)
}
