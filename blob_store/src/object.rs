use std::{
    collections::BTreeMap,
    env,
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{future::try_join_all, StreamExt, TryStreamExt};
use object_store::{
    aws::AmazonS3Builder,
    memory::InMemory,
    path::{Path, PathPart},
    Attribute,
    AttributeValue,
    Attributes,
    GetOptions,
    GetRange,
    MultipartUpload,
    ObjectMeta,
    ObjectStore,
    ObjectStoreScheme,
    PutMultipartOpts,
    PutOptions,
    PutPayload,
};
use tracing::{debug, info};
use url::Url;

use crate::{
    BlobStorageConfig,
    Conditions,
    MultipartSession,
    PartResult,
    Precondition,
    PrimaryStore,
    RangeSpec,
    StoreRead,
    StoredObject,
    StoredObjectMetadata,
};

/// User metadata keys carrying the origin's validators, so a stored object
/// answers with the same `etag` and `last-modified` the origin did.
const ORIGIN_ETAG: &str = "origin-etag";
const ORIGIN_LAST_MODIFIED: &str = "origin-last-modified";

/// [`PrimaryStore`] backed by any `object_store` backend.
#[derive(Clone)]
pub struct ObjectStorePrimary {
    store: Arc<dyn ObjectStore>,
    prefix: Path,
}

impl ObjectStorePrimary {
    pub fn new(config: &BlobStorageConfig) -> Result<Self> {
        let url = config
            .path
            .parse::<Url>()
            .with_context(|| format!("invalid primary store url: {}", config.path))?;
        let (scheme, prefix) = ObjectStoreScheme::parse(&url)?;
        match scheme {
            ObjectStoreScheme::Memory => {
                info!("using in-memory primary store");
                Ok(Self::from_store(InMemory::new(), prefix))
            }
            ObjectStoreScheme::AmazonS3 => {
                let mut builder = AmazonS3Builder::from_env().with_url(url.as_str());
                // For supporting localstack/minio for testing
                if let Ok(endpoint) = env::var("AWS_ENDPOINT_URL") {
                    if endpoint.starts_with("http://") {
                        builder = builder.with_allow_http(true);
                    }
                    builder = builder.with_endpoint(endpoint);
                }
                let s3 = builder
                    .build()
                    .context("failed to create s3 primary store")?;
                info!(url = %url, "using s3 primary store");
                Ok(Self::from_store(s3, prefix))
            }
            other => Err(anyhow!(
                "unsupported primary store scheme {:?}, expected s3:// or memory://",
                other
            )),
        }
    }

    pub fn from_store<T: ObjectStore>(store: T, prefix: Path) -> Self {
        Self {
            store: Arc::new(store),
            prefix,
        }
    }

    fn object_path(&self, key: &str) -> Path {
        self.prefix
            .parts()
            .chain(
                key.split('/')
                    .filter(|segment| !segment.is_empty())
                    .map(PathPart::from),
            )
            .collect()
    }
}

fn get_range(range: &RangeSpec) -> Option<GetRange> {
    match *range {
        RangeSpec::Whole => None,
        RangeSpec::Suffix { n } => Some(GetRange::Suffix(n)),
        RangeSpec::OffsetLength {
            offset,
            length: None,
        } => Some(GetRange::Offset(offset)),
        RangeSpec::OffsetLength {
            offset,
            length: Some(length),
        } => Some(GetRange::Bounded(offset..offset.saturating_add(length))),
    }
}

fn metadata_from(meta: &ObjectMeta, attributes: &Attributes) -> StoredObjectMetadata {
    let mut metadata = StoredObjectMetadata {
        etag: meta.e_tag.clone(),
        size: meta.size,
        last_modified: Some(meta.last_modified),
        ..Default::default()
    };
    for (attribute, value) in attributes.iter() {
        let value = value.as_ref().to_string();
        let header = match attribute {
            Attribute::ContentType => {
                metadata.content_type = Some(value);
                continue;
            }
            Attribute::Metadata(name) if name == ORIGIN_ETAG => {
                metadata.etag = Some(value);
                continue;
            }
            Attribute::Metadata(name) if name == ORIGIN_LAST_MODIFIED => {
                if let Ok(at) = DateTime::parse_from_rfc3339(&value) {
                    metadata.last_modified = Some(at.with_timezone(&Utc));
                }
                continue;
            }
            Attribute::ContentDisposition => "content-disposition",
            Attribute::ContentEncoding => "content-encoding",
            Attribute::ContentLanguage => "content-language",
            Attribute::CacheControl => "cache-control",
            _ => continue,
        };
        metadata.custom_headers.insert(header.to_string(), value);
    }
    metadata
}

fn attributes_from(metadata: &StoredObjectMetadata) -> Attributes {
    let mut attributes = Attributes::new();
    if let Some(content_type) = &metadata.content_type {
        attributes.insert(
            Attribute::ContentType,
            AttributeValue::from(content_type.clone()),
        );
    }
    if let Some(etag) = &metadata.etag {
        attributes.insert(
            Attribute::Metadata(ORIGIN_ETAG.into()),
            AttributeValue::from(etag.clone()),
        );
    }
    if let Some(last_modified) = metadata.last_modified {
        attributes.insert(
            Attribute::Metadata(ORIGIN_LAST_MODIFIED.into()),
            AttributeValue::from(last_modified.to_rfc3339()),
        );
    }
    for (name, value) in &metadata.custom_headers {
        let attribute = match name.as_str() {
            "content-disposition" => Attribute::ContentDisposition,
            "content-encoding" => Attribute::ContentEncoding,
            "content-language" => Attribute::ContentLanguage,
            "cache-control" => Attribute::CacheControl,
            _ => continue,
        };
        attributes.insert(attribute, AttributeValue::from(value.clone()));
    }
    attributes
}

#[async_trait]
impl PrimaryStore for ObjectStorePrimary {
    async fn head(&self, key: &str) -> Result<Option<StoredObjectMetadata>> {
        let options = GetOptions {
            head: true,
            ..Default::default()
        };
        match self.store.get_opts(&self.object_path(key), options).await {
            Ok(result) => Ok(Some(metadata_from(&result.meta, &result.attributes))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(anyhow!("can't head primary store object {:?}: {:?}", key, e)),
        }
    }

    /// Conditions are evaluated here against the reported validators, which
    /// may be the origin's rather than the backend's own.
    async fn get(
        &self,
        key: &str,
        range: &RangeSpec,
        conditions: &Conditions,
    ) -> Result<StoreRead> {
        let options = GetOptions {
            range: get_range(range),
            ..Default::default()
        };
        let result = match self.store.get_opts(&self.object_path(key), options).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(StoreRead::Missing),
            Err(e) => return Err(anyhow!("can't get primary store object {:?}: {:?}", key, e)),
        };
        let metadata = metadata_from(&result.meta, &result.attributes);
        match conditions.evaluate(metadata.etag.as_deref(), metadata.last_modified) {
            Precondition::NotModified => return Ok(StoreRead::NotModified(metadata)),
            Precondition::Failed => return Ok(StoreRead::PreconditionFailed(metadata)),
            Precondition::Proceed => {}
        }
        let returned = range.is_ranged().then(|| result.range.clone());
        let key = key.to_string();
        let body = result
            .into_stream()
            .map_err(move |e| anyhow!("error reading primary store object {:?}: {:?}", key, e))
            .boxed();
        Ok(StoreRead::Found(StoredObject {
            metadata,
            range: returned,
            body,
        }))
    }

    async fn put(&self, key: &str, body: Bytes, metadata: &StoredObjectMetadata) -> Result<()> {
        let options = PutOptions {
            attributes: attributes_from(metadata),
            ..Default::default()
        };
        let size = body.len();
        self.store
            .put_opts(&self.object_path(key), PutPayload::from(body), options)
            .await
            .map_err(|e| anyhow!("can't put primary store object {:?}: {:?}", key, e))?;
        debug!(key, size, "stored object");
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        metadata: &StoredObjectMetadata,
    ) -> Result<Box<dyn MultipartSession>> {
        let path = self.object_path(key);
        let options = PutMultipartOpts {
            attributes: attributes_from(metadata),
            ..Default::default()
        };
        let upload = self
            .store
            .put_multipart_opts(&path, options)
            .await
            .map_err(|e| anyhow!("can't create multipart upload for {:?}: {:?}", key, e))?;
        Ok(Box::new(ObjectStoreSession {
            path,
            state: Mutex::new(SessionState {
                upload: Some(upload),
                next_part: 1,
                staged: BTreeMap::new(),
                uploaded: BTreeMap::new(),
            }),
        }))
    }
}

/// The backend numbers parts in the order they are handed over, so parts
/// arriving early are staged until every lower-numbered part has been
/// passed on.
struct ObjectStoreSession {
    path: Path,
    state: Mutex<SessionState>,
}

struct SessionState {
    /// `None` once the upload has been completed or aborted.
    upload: Option<Box<dyn MultipartUpload>>,
    next_part: u32,
    staged: BTreeMap<u32, Bytes>,
    uploaded: BTreeMap<u32, String>,
}

impl ObjectStoreSession {
    fn state(&self) -> Result<MutexGuard<'_, SessionState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("multipart session for {} is poisoned", self.path))
    }

    fn finish(&self) -> Result<Box<dyn MultipartUpload>> {
        self.state()?
            .upload
            .take()
            .ok_or_else(|| anyhow!("multipart upload of {} already finished", self.path))
    }
}

#[async_trait]
impl MultipartSession for ObjectStoreSession {
    async fn upload_part(&self, part_number: u32, body: Bytes) -> Result<PartResult> {
        if part_number == 0 {
            return Err(anyhow!("part numbers start at 1"));
        }
        let part = PartResult {
            part_number,
            etag: format!("{}:{}", part_number, body.len()),
        };
        let handed_over = {
            let mut state = self.state()?;
            let SessionState {
                upload,
                next_part,
                staged,
                uploaded,
            } = &mut *state;
            let upload = upload
                .as_mut()
                .ok_or_else(|| anyhow!("multipart upload of {} already finished", self.path))?;
            if uploaded.contains_key(&part_number) {
                return Err(anyhow!("part {} of {} uploaded twice", part_number, self.path));
            }
            uploaded.insert(part_number, part.etag.clone());
            staged.insert(part_number, body);
            let mut handed_over = Vec::new();
            while let Some(data) = staged.remove(next_part) {
                handed_over.push(upload.put_part(PutPayload::from(data)));
                *next_part += 1;
            }
            handed_over
        };
        try_join_all(handed_over)
            .await
            .map_err(|e| anyhow!("can't upload part {} of {}: {:?}", part_number, self.path, e))?;
        Ok(part)
    }

    async fn complete(&self, parts: Vec<PartResult>) -> Result<()> {
        {
            let state = self.state()?;
            if !state.staged.is_empty() {
                return Err(anyhow!(
                    "can't complete {}: part {} was never uploaded",
                    self.path,
                    state.next_part
                ));
            }
            let matches = parts.len() == state.uploaded.len()
                && parts
                    .iter()
                    .all(|part| state.uploaded.get(&part.part_number) == Some(&part.etag));
            if !matches {
                return Err(anyhow!(
                    "can't complete {}: part list does not match the uploaded parts",
                    self.path
                ));
            }
        }
        let mut upload = self.finish()?;
        upload
            .complete()
            .await
            .map_err(|e| anyhow!("can't complete multipart upload of {}: {:?}", self.path, e))?;
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        let mut upload = self.finish()?;
        upload
            .abort()
            .await
            .map_err(|e| anyhow!("can't abort multipart upload of {}: {:?}", self.path, e))?;
        Ok(())
    }
}
