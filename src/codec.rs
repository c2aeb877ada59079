//! Translation between stored-object metadata, client range/conditional
//! headers and HTTP response heads.

use std::time::SystemTime;

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use blob_store::{Conditions, RangeSpec, StoredObjectMetadata};
use chrono::{DateTime, Utc};
use gateway_utils::ByteStream;

pub enum Payload {
    Body(ByteStream),
    HeadOnly,
    NotModified,
}

/// The client's `range` header, parsed once at dispatch entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRange {
    Parsed(RangeSpec),
    Malformed(String),
}

impl ClientRange {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let Some(value) = headers.get(header::RANGE) else {
            return ClientRange::Parsed(RangeSpec::Whole);
        };
        match value.to_str().ok().and_then(parse_range) {
            Some(spec) => ClientRange::Parsed(spec),
            None => ClientRange::Malformed(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        }
    }

    pub fn spec(&self) -> RangeSpec {
        match self {
            ClientRange::Parsed(spec) => *spec,
            ClientRange::Malformed(_) => RangeSpec::Whole,
        }
    }
}

/// Parses a single `bytes=` range. Multi-range requests are not parsed.
pub fn parse_range(value: &str) -> Option<RangeSpec> {
    let spec = value.trim().strip_prefix("bytes=")?.trim();
    if spec.contains(',') {
        return None;
    }
    let (first, last) = spec.split_once('-')?;
    let (first, last) = (first.trim(), last.trim());
    if first.is_empty() {
        let n: u64 = last.parse().ok()?;
        return (n > 0).then_some(RangeSpec::Suffix { n });
    }
    let offset: u64 = first.parse().ok()?;
    if last.is_empty() {
        return Some(RangeSpec::OffsetLength {
            offset,
            length: None,
        });
    }
    let last: u64 = last.parse().ok()?;
    if last < offset {
        return None;
    }
    Some(RangeSpec::OffsetLength {
        offset,
        length: Some(last - offset + 1),
    })
}

pub fn parse_conditions(headers: &HeaderMap) -> Conditions {
    Conditions {
        if_match: header_string(headers, header::IF_MATCH),
        if_none_match: header_string(headers, header::IF_NONE_MATCH),
        if_modified_since: header_date(headers, header::IF_MODIFIED_SINCE),
        if_unmodified_since: header_date(headers, header::IF_UNMODIFIED_SINCE),
    }
}

fn header_string(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

pub fn header_date(headers: &HeaderMap, name: HeaderName) -> Option<DateTime<Utc>> {
    let value = headers.get(name)?.to_str().ok()?;
    httpdate::parse_http_date(value).ok().map(DateTime::<Utc>::from)
}

pub fn response_status(payload: &Payload, range: &RangeSpec) -> StatusCode {
    match payload {
        Payload::NotModified => StatusCode::NOT_MODIFIED,
        Payload::HeadOnly => StatusCode::OK,
        Payload::Body(_) if range.is_ranged() => StatusCode::PARTIAL_CONTENT,
        Payload::Body(_) => StatusCode::OK,
    }
}

pub fn content_range(range: &RangeSpec, size: u64) -> Option<String> {
    let (first, last) = range.bounds(size)?;
    Some(format!("bytes {}-{}/{}", first, last, size))
}

pub fn metadata_headers(
    metadata: &StoredObjectMetadata,
    range: &RangeSpec,
    status: StatusCode,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &metadata.custom_headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    insert_str(&mut headers, header::CONTENT_TYPE, metadata.content_type.as_deref());
    insert_str(&mut headers, header::ETAG, metadata.etag.as_deref());
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(last_modified) = metadata.last_modified {
        let value = httpdate::fmt_http_date(SystemTime::from(last_modified));
        insert_str(&mut headers, header::LAST_MODIFIED, Some(&value));
    }

    let mut content_length = metadata.size;
    if status == StatusCode::PARTIAL_CONTENT {
        if let Some((first, last)) = range.bounds(metadata.size) {
            let value = content_range(range, metadata.size);
            insert_str(&mut headers, header::CONTENT_RANGE, value.as_deref());
            content_length = last - first + 1;
        }
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(content_length));
    headers
}

fn insert_str(headers: &mut HeaderMap, name: HeaderName, value: Option<&str>) {
    if let Some(value) = value.and_then(|v| HeaderValue::from_str(v).ok()) {
        headers.insert(name, value);
    }
}

pub fn build_response(
    metadata: &StoredObjectMetadata,
    payload: Payload,
    range: &RangeSpec,
) -> Response {
    let status = response_status(&payload, range);
    let headers = metadata_headers(metadata, range, status);
    let body = match payload {
        Payload::Body(stream) => Body::from_stream(stream),
        Payload::HeadOnly | Payload::NotModified => Body::empty(),
    };
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

pub fn precondition_failed(metadata: &StoredObjectMetadata) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::PRECONDITION_FAILED;
    insert_str(response.headers_mut(), header::ETAG, metadata.etag.as_deref());
    response
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use anyhow::Result;
    use bytes::Bytes;
    use futures::stream;

    use super::*;
    use crate::testing::read_body;

    fn metadata(size: u64) -> StoredObjectMetadata {
        StoredObjectMetadata {
            etag: Some("\"abc123\"".to_string()),
            size,
            content_type: Some("application/gzip".to_string()),
            last_modified: DateTime::from_timestamp(1_445_412_480, 0),
            custom_headers: BTreeMap::from([(
                "content-disposition".to_string(),
                "attachment".to_string(),
            )]),
        }
    }

    fn body(bytes: &'static [u8]) -> Payload {
        Payload::Body(Box::pin(stream::iter(vec![Ok::<_, anyhow::Error>(
            Bytes::from_static(bytes),
        )])))
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(
            parse_range("bytes=0-1023"),
            Some(RangeSpec::OffsetLength {
                offset: 0,
                length: Some(1024)
            })
        );
        assert_eq!(
            parse_range("bytes=1024-"),
            Some(RangeSpec::OffsetLength {
                offset: 1024,
                length: None
            })
        );
        assert_eq!(parse_range("bytes=-500"), Some(RangeSpec::Suffix { n: 500 }));
        assert_eq!(parse_range("bytes=-0"), None);
        assert_eq!(parse_range("bytes=10-5"), None);
        assert_eq!(parse_range("bytes=0-1,5-9"), None);
        assert_eq!(parse_range("items=0-1"), None);
        assert_eq!(parse_range("bytes=a-b"), None);
    }

    #[test]
    fn test_client_range_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            ClientRange::from_headers(&headers),
            ClientRange::Parsed(RangeSpec::Whole)
        );
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=oops"));
        assert_eq!(
            ClientRange::from_headers(&headers),
            ClientRange::Malformed("bytes=oops".to_string())
        );
    }

    #[test]
    fn test_status_selection() {
        let ranged = RangeSpec::OffsetLength {
            offset: 0,
            length: Some(10),
        };
        assert_eq!(
            response_status(&Payload::NotModified, &ranged),
            StatusCode::NOT_MODIFIED
        );
        assert_eq!(
            response_status(&Payload::HeadOnly, &RangeSpec::Whole),
            StatusCode::OK
        );
        assert_eq!(
            response_status(&body(b"x"), &RangeSpec::Whole),
            StatusCode::OK
        );
        assert_eq!(
            response_status(&body(b"x"), &ranged),
            StatusCode::PARTIAL_CONTENT
        );
    }

    #[test]
    fn test_content_range() {
        assert_eq!(
            content_range(&RangeSpec::Suffix { n: 100 }, 1000),
            Some("bytes 900-999/1000".to_string())
        );
        assert_eq!(
            content_range(&RangeSpec::Suffix { n: 5000 }, 1000),
            Some("bytes 0-999/1000".to_string())
        );
        assert_eq!(
            content_range(
                &RangeSpec::OffsetLength {
                    offset: 900,
                    length: Some(500)
                },
                1000
            ),
            Some("bytes 900-999/1000".to_string())
        );
        assert_eq!(
            content_range(
                &RangeSpec::OffsetLength {
                    offset: 0,
                    length: None
                },
                1000
            ),
            Some("bytes 0-999/1000".to_string())
        );
    }

    #[test]
    fn test_metadata_headers_for_full_object() {
        let headers = metadata_headers(&metadata(2048), &RangeSpec::Whole, StatusCode::OK);

        assert_eq!(headers[header::ETAG], "\"abc123\"");
        assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
        assert_eq!(headers[header::CONTENT_LENGTH], "2048");
        assert_eq!(headers[header::CONTENT_TYPE], "application/gzip");
        assert_eq!(headers[header::CONTENT_DISPOSITION], "attachment");
        assert_eq!(
            headers[header::LAST_MODIFIED],
            "Wed, 21 Oct 2015 07:28:00 GMT"
        );
        assert!(headers.get(header::CONTENT_RANGE).is_none());
    }

    #[tokio::test]
    async fn test_build_partial_response() -> Result<()> {
        let range = RangeSpec::OffsetLength {
            offset: 2,
            length: Some(3),
        };

        let response = build_response(&metadata(10), body(b"234"), &range);

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 2-4/10");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "3");
        assert_eq!(read_body(response).await?, Bytes::from_static(b"234"));
        Ok(())
    }

    #[test]
    fn test_not_modified_has_no_range() {
        let response = build_response(
            &metadata(10),
            Payload::NotModified,
            &RangeSpec::Suffix { n: 2 },
        );
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert!(response.headers().get(header::CONTENT_RANGE).is_none());
        assert_eq!(response.headers()[header::ETAG], "\"abc123\"");
    }

    #[test]
    fn test_parse_conditions() {
        let mut headers = HeaderMap::new();
        headers.insert(header::IF_NONE_MATCH, HeaderValue::from_static("\"abc\""));
        headers.insert(
            header::IF_MODIFIED_SINCE,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );

        let conditions = parse_conditions(&headers);

        assert_eq!(conditions.if_none_match.as_deref(), Some("\"abc\""));
        assert_eq!(
            conditions.if_modified_since,
            DateTime::from_timestamp(1_445_412_480, 0)
        );
        assert!(conditions.if_match.is_none());
    }
}
