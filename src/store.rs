//! Where the bundles end up.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{
    Attribute, Attributes, GetOptions, ObjectStore, PutMultipartOpts, WriteMultipart,
};
use tokio::io::AsyncReadExt;

use crate::config::StorageConfig;
use crate::errors::BackupError;

/// The metadata key a backup's fingerprint is recorded under.
pub const FINGERPRINT_METADATA_KEY: &str = "githash";
pub const CONTENT_TYPE: &str = "application/octet-stream";

const CHUNK_SIZE: usize = 8 * 1024 * 1024;
const MAX_CONCURRENT_PARTS: usize = 4;
const MAX_CONCURRENT_HEADS: usize = 8;

/// User-defined metadata attached to an object.
pub type Metadata = HashMap<String, String>;

/// What the store knows about a previous backup.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBackup {
    pub backup_filename: String,
    /// The fingerprint recorded when the backup was uploaded, if any.
    pub fingerprint: Option<String>,
}

/// The handful of object storage operations a backup run needs.
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// The key of every object in the store.
    async fn list_objects(&self) -> Result<Vec<String>, BackupError>;

    /// The user-defined metadata attached to `key`.
    async fn head_object(&self, key: &str) -> Result<Metadata, BackupError>;

    /// Upload the file at `body` to `key`. Nothing becomes visible under
    /// `key` unless the whole upload succeeds.
    async fn put_object(&self, key: &str, body: &Path, metadata: &Metadata) -> Result<(), BackupError>;
}

/// Find every backup in the store and the fingerprint it was taken at.
///
/// Objects without fingerprint metadata are still reported, just without a
/// fingerprint, so they get backed up again rather than failing the run.
pub async fn inspect(store: &dyn BackupStore) -> Result<Vec<StoredBackup>, BackupError> {
    let keys = store.list_objects().await?;
    debug!("The store contains {} objects", keys.len());

    stream::iter(keys)
        .map(|key| async move {
            let mut metadata = store.head_object(&key).await?;
            let fingerprint = metadata.remove(FINGERPRINT_METADATA_KEY);

            if fingerprint.is_none() {
                warn!(
                    "\"{}\" has no \"{}\" metadata, it'll be treated as out of date",
                    key, FINGERPRINT_METADATA_KEY
                );
            }

            Ok::<_, BackupError>(StoredBackup {
                backup_filename: key,
                fingerprint,
            })
        })
        .buffered(MAX_CONCURRENT_HEADS)
        .try_collect()
        .await
}

/// A [`BackupStore`] backed by anything implementing [`ObjectStore`].
#[derive(Clone)]
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    name: String,
}

impl ObjectStoreBackend {
    pub fn new(store: Arc<dyn ObjectStore>, name: impl Into<String>) -> ObjectStoreBackend {
        ObjectStoreBackend {
            store,
            name: name.into(),
        }
    }

    /// Connect to the S3 bucket described by `cfg`.
    ///
    /// No ACL is sent with uploads, so objects get S3's default `private`
    /// canned ACL (or whatever the bucket's ownership settings enforce).
    pub fn from_config(cfg: &StorageConfig) -> Result<ObjectStoreBackend, BackupError> {
        let mut builder = AmazonS3Builder::new()
            .with_region(&cfg.region)
            .with_bucket_name(&cfg.bucket)
            .with_access_key_id(&cfg.access_key_id)
            .with_secret_access_key(cfg.secret_access_key.reveal());

        if let Some(endpoint) = cfg.endpoint.as_ref() {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let store = builder.build().map_err(|e| BackupError::InvalidConfig {
            key: "storage",
            reason: e.to_string(),
        })?;

        Ok(ObjectStoreBackend::new(
            Arc::new(store),
            format!("s3://{}", cfg.bucket),
        ))
    }
}

#[async_trait]
impl BackupStore for ObjectStoreBackend {
    async fn list_objects(&self) -> Result<Vec<String>, BackupError> {
        debug!("Listing the contents of {}", self.name);

        self.store
            .list(None)
            .map_ok(|meta| meta.location.to_string())
            .try_collect()
            .await
            .map_err(|e| BackupError::StoreList {
                reason: e.to_string(),
            })
    }

    async fn head_object(&self, key: &str) -> Result<Metadata, BackupError> {
        let options = GetOptions {
            head: true,
            ..Default::default()
        };

        let result = self
            .store
            .get_opts(&ObjectPath::from(key), options)
            .await
            .map_err(|e| BackupError::StoreMetadata {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        let metadata = result
            .attributes
            .iter()
            .filter_map(|(attribute, value)| match attribute {
                Attribute::Metadata(name) => {
                    let value: &str = value.as_ref();
                    Some((name.to_string(), value.to_string()))
                }
                _ => None,
            })
            .collect();

        Ok(metadata)
    }

    async fn put_object(&self, key: &str, body: &Path, metadata: &Metadata) -> Result<(), BackupError> {
        let upload_error = |reason: String| BackupError::Upload {
            key: key.to_string(),
            reason,
        };

        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, CONTENT_TYPE.into());
        for (name, value) in metadata {
            attributes.insert(Attribute::Metadata(name.clone().into()), value.clone().into());
        }
        let options = PutMultipartOpts {
            attributes,
            ..Default::default()
        };

        let upload = self
            .store
            .put_multipart_opts(&ObjectPath::from(key), options)
            .await
            .map_err(|e| upload_error(e.to_string()))?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, CHUNK_SIZE);

        match copy_into(&mut writer, body).await {
            Ok(bytes) => {
                writer
                    .finish()
                    .await
                    .map_err(|e| upload_error(e.to_string()))?;
                debug!("Uploaded {} bytes to {}/{}", bytes, self.name, key);
                Ok(())
            }
            Err(reason) => {
                if let Err(e) = writer.abort().await {
                    warn!("Unable to abort the upload of \"{}\": {}", key, e);
                }
                Err(upload_error(reason))
            }
        }
    }
}

async fn copy_into(writer: &mut WriteMultipart, path: &Path) -> Result<u64, String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| format!("unable to open {}: {}", path.display(), e))?;
    let mut buffer = vec![0; CHUNK_SIZE];
    let mut total = 0;

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .await
            .map_err(|e| format!("unable to read {}: {}", path.display(), e))?;
        if bytes_read == 0 {
            break;
        }

        writer
            .wait_for_capacity(MAX_CONCURRENT_PARTS)
            .await
            .map_err(|e| e.to_string())?;
        writer.write(&buffer[..bytes_read]);
        total += bytes_read as u64;
    }

    Ok(total)
}

impl Debug for ObjectStoreBackend {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("ObjectStoreBackend")
            .field("name", &self.name)
            .finish()
    }
}
