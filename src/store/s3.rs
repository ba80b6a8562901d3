use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{encode_key, MetadataStore, ObjectStore, ObjectSummary};
use crate::error::StoreError;
use crate::metadata::ImageMetadata;

// =============================================================================
// Error Classification
// =============================================================================

/// Map an SDK failure onto the store error taxonomy.
///
/// Not-found and precondition failures are recognised by status code first and
/// by service error code second, since S3-compatible services disagree on
/// which of the two they populate.
fn classify<E>(err: SdkError<E, HttpResponse>, location: &str) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let code = err.as_service_error().and_then(|e| e.code());

    if status == Some(404) || matches!(code, Some("NoSuchKey" | "NotFound")) {
        return StoreError::NotFound(location.to_string());
    }

    if status == Some(412) || code == Some("PreconditionFailed") {
        return StoreError::AlreadyExists(location.to_string());
    }

    let message = format!("{}: {}", location, DisplayErrorContext(&err));
    match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => StoreError::Connection(message),
        _ => StoreError::S3(message),
    }
}

/// List every key under `prefix`, following continuation tokens.
async fn list_all(
    client: &Client,
    bucket: &str,
    prefix: Option<&str>,
) -> Result<Vec<ObjectSummary>, StoreError> {
    let mut objects = Vec::new();
    let mut continuation_token: Option<String> = None;
    let location = format!("s3://{}", bucket);

    loop {
        let mut request = client.list_objects_v2().bucket(bucket).max_keys(1000);

        if let Some(prefix) = prefix {
            request = request.prefix(prefix);
        }
        if let Some(token) = continuation_token {
            request = request.continuation_token(token);
        }

        let result = request.send().await.map_err(|e| classify(e, &location))?;

        objects.extend(result.contents().iter().filter_map(|obj| {
            let key = obj.key()?.to_string();
            let last_modified = obj
                .last_modified()
                .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()));
            Some(ObjectSummary { key, last_modified })
        }));

        if result.is_truncated() == Some(true) {
            continuation_token = result.next_continuation_token().map(|s| s.to_string());
        } else {
            break;
        }
    }

    Ok(objects)
}

// =============================================================================
// S3 Object Store
// =============================================================================

/// Image blobs in an S3 (or S3-compatible) bucket.
///
/// Overwrite protection uses a conditional write (`If-None-Match: *`), so the
/// existence check and the write are a single atomic request.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    public_base_url: String,
    ignored_prefix: Option<String>,
    identifier: String,
}

impl S3ObjectStore {
    /// Create a store for `bucket` whose objects are served from
    /// `public_base_url`.
    pub fn new(client: Client, bucket: impl Into<String>, public_base_url: impl Into<String>) -> Self {
        let bucket = bucket.into();
        let identifier = format!("s3://{}", bucket);
        Self {
            client,
            bucket,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            ignored_prefix: None,
            identifier,
        }
    }

    /// Hide keys under `prefix` from [`ObjectStore::list_objects`].
    ///
    /// Used when metadata documents share the image bucket.
    pub fn with_ignored_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.ignored_prefix = (!prefix.is_empty()).then_some(prefix);
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn location(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        disallow_overwrite: bool,
    ) -> Result<String, StoreError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(data));

        if disallow_overwrite {
            request = request.if_none_match("*");
        }

        request
            .send()
            .await
            .map_err(|e| classify(e, &self.location(key)))?;

        debug!(bucket = %self.bucket, key = %key, "Stored object");
        Ok(self.public_url(key))
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, encode_key(key))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        // S3 answers 204 for absent keys; some compatible services answer 404
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => match classify(e, &self.location(key)) {
                StoreError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match classify(e, &self.location(key)) {
                StoreError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn list_objects(&self) -> Result<Vec<ObjectSummary>, StoreError> {
        let mut objects = list_all(&self.client, &self.bucket, None).await?;
        if let Some(prefix) = &self.ignored_prefix {
            objects.retain(|object| !object.key.starts_with(prefix.as_str()));
        }
        Ok(objects)
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

// =============================================================================
// S3 Metadata Store
// =============================================================================

/// Metadata documents stored as JSON objects at `{prefix}{id}.json`.
#[derive(Clone)]
pub struct S3MetadataStore {
    client: Client,
    bucket: String,
    prefix: String,
    identifier: String,
}

impl S3MetadataStore {
    pub fn new(client: Client, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        let bucket = bucket.into();
        let prefix = prefix.into();
        let identifier = format!("s3://{}/{}", bucket, prefix);
        Self {
            client,
            bucket,
            prefix,
            identifier,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn object_key(&self, id: &str) -> String {
        format!("{}{}.json", self.prefix, id)
    }

    fn location(&self, id: &str) -> String {
        format!("s3://{}/{}", self.bucket, self.object_key(id))
    }
}

#[async_trait]
impl MetadataStore for S3MetadataStore {
    async fn set(&self, id: &str, document: &ImageMetadata) -> Result<(), StoreError> {
        let body = serde_json::to_vec(document)
            .map_err(|e| StoreError::Serialization(format!("{}: {}", id, e)))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.object_key(id))
            .content_type("application/json")
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify(e, &self.location(id)))?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ImageMetadata>, StoreError> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(id))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return match classify(e, &self.location(id)) {
                    StoreError::NotFound(_) => Ok(None),
                    other => Err(other),
                }
            }
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .into_bytes();

        let document = serde_json::from_slice(&data)
            .map_err(|e| StoreError::Serialization(format!("{}: {}", id, e)))?;

        Ok(Some(document))
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.object_key(id))
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => match classify(e, &self.location(id)) {
                StoreError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn list_ids(&self) -> Result<Vec<String>, StoreError> {
        let objects = list_all(&self.client, &self.bucket, Some(&self.prefix)).await?;

        Ok(objects
            .iter()
            .filter_map(|object| object.key.strip_prefix(self.prefix.as_str()))
            .filter_map(|name| name.strip_suffix(".json"))
            .filter(|id| !id.is_empty() && !id.contains('/'))
            .map(str::to_string)
            .collect())
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

// =============================================================================
// Client Construction
// =============================================================================

/// Default public URL base for objects in `bucket`.
///
/// Custom endpoints (MinIO, LocalStack) use path-style URLs; AWS uses the
/// virtual-hosted form.
pub fn default_public_base_url(bucket: &str, region: &str, endpoint_url: Option<&str>) -> String {
    match endpoint_url {
        Some(endpoint) => format!("{}/{}", endpoint.trim_end_matches('/'), bucket),
        None => format!("https://{}.s3.{}.amazonaws.com", bucket, region),
    }
}

/// Create an S3 client with optional custom endpoint and region.
///
/// For S3-compatible services such as MinIO pass the endpoint:
/// ```ignore
/// let client = create_s3_client(Some("http://localhost:9000"), "us-east-1").await;
/// ```
pub async fn create_s3_client(endpoint_url: Option<&str>, region: &str) -> Client {
    let region = aws_config::Region::new(region.to_string());
    let mut config_loader =
        aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region);

    if let Some(endpoint) = endpoint_url {
        config_loader = config_loader.endpoint_url(endpoint);
    }

    let sdk_config = config_loader.load().await;

    let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
    if endpoint_url.is_some() {
        builder = builder.force_path_style(true);
    }

    Client::from_conf(builder.build())
}
