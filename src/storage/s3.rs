//! AWS S3 storage implementation.
//!
//! Each namespace is a key prefix inside one bucket:
//! `{prefix}/{namespace}/{key}`. The admin namespace lives directly under
//! `{prefix}/`.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Utc};

use crate::error::{AppError, Result};
use crate::storage::{BlobStore, Entry};

/// S3-backed byte store for one namespace.
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Storage {
    /// Create a new S3 storage instance.
    pub fn new(client: Client, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    /// Create S3 storage from the ambient AWS configuration.
    pub async fn from_env(bucket: &str, prefix: &str) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config), bucket, prefix)
    }

    /// Same bucket and client, one level deeper.
    pub fn with_namespace(&self, namespace: &str) -> Self {
        let prefix = if self.prefix.is_empty() {
            namespace.to_string()
        } else {
            format!("{}/{}", self.prefix, namespace)
        };
        Self {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            prefix,
        }
    }

    fn object_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    /// Strip the namespace prefix from a full object key.
    fn relative<'a>(&self, full: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            full
        } else {
            full.strip_prefix(&self.prefix)
                .map(|rest| rest.trim_start_matches('/'))
                .unwrap_or(full)
        }
    }
}

fn s3_error(op: &str, e: impl std::error::Error) -> AppError {
    AppError::storage(format!("S3 {op}: {}", DisplayErrorContext(e)))
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

#[async_trait]
impl BlobStore for S3Storage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await;

        match result {
            Ok(output) => {
                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| s3_error("read body", e))?;
                Ok(Some(bytes.into_bytes().to_vec()))
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(s3_error("get_object", service_err))
                }
            }
        }
    }

    async fn write(&self, key: &str, content_type: &str, bytes: &[u8]) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .body(ByteStream::from(bytes.to_vec()))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| s3_error("put_object", e))?;

        log::debug!("Wrote s3://{}/{}", self.bucket, self.object_key(key));
        Ok(())
    }

    async fn stat(&self, key: &str) -> Result<Option<Entry>> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await;

        match result {
            Ok(output) => Ok(Some(Entry {
                name: key.to_string(),
                length: output.content_length().and_then(|n| u64::try_from(n).ok()),
                modified_at: output.last_modified().and_then(to_chrono),
            })),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Ok(None)
                } else {
                    Err(s3_error("head_object", service_err))
                }
            }
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        // S3 deletes of missing keys succeed
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(|e| s3_error("delete_object", e))?;

        log::debug!("Deleted s3://{}/{}", self.bucket, self.object_key(key));
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Entry>> {
        let full_prefix = self.object_key(prefix);
        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| s3_error("list_objects_v2", e))?;

            for object in output.contents() {
                let Some(full) = object.key() else { continue };
                let name = self.relative(full);
                // Deeper namespaces share the prefix; only direct children count
                if name.is_empty() || name.contains('/') {
                    continue;
                }
                entries.push(Entry {
                    name: name.to_string(),
                    length: object.size().and_then(|n| u64::try_from(n).ok()),
                    modified_at: object.last_modified().and_then(to_chrono),
                });
            }

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }
}
