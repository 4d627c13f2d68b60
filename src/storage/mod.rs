//! Blob storage for downloaded story files
//! Uses Apache Arrow object_store crate (Azure in production, in-memory for tests)

use object_store::azure::{AzureConfigKey, MicrosoftAzureBuilder};
use object_store::buffered::BufWriter;
use object_store::{ObjectStore, path::Path as StoragePath};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::pool;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid storage connection string: {0}")]
    InvalidConnectionString(String),

    #[error("No remote path for {0}")]
    UnmappedPath(PathBuf),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Object store error: {0}")]
    ObjectStoreError(#[from] object_store::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;

/// Metadata returned after upload
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub key: String,
    pub etag: Option<String>,
    pub size: u64,
}

/// Parsed Azure storage connection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureConnection {
    pub account: String,
    pub access_key: String,
    pub blob_endpoint: Option<String>,
    pub use_emulator: bool,
}

impl AzureConnection {
    /// Parse `Key=Value;Key=Value` pairs
    ///
    /// Understands `AccountName`, `AccountKey`, `BlobEndpoint`,
    /// `DefaultEndpointsProtocol`, `EndpointSuffix` and `UseDevelopmentStorage`.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut account = None;
        let mut access_key = None;
        let mut blob_endpoint = None;
        let mut protocol = "https".to_string();
        let mut suffix = None;
        let mut use_emulator = false;

        for part in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            // Account keys are base64 and may end with '='
            let (key, value) = part.split_once('=').ok_or_else(|| {
                StorageError::InvalidConnectionString(format!("malformed segment '{part}'"))
            })?;
            match key.trim() {
                "AccountName" => account = Some(value.to_string()),
                "AccountKey" => access_key = Some(value.to_string()),
                "BlobEndpoint" => blob_endpoint = Some(value.trim_end_matches('/').to_string()),
                "DefaultEndpointsProtocol" => protocol = value.to_string(),
                "EndpointSuffix" => suffix = Some(value.to_string()),
                "UseDevelopmentStorage" => use_emulator = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }

        if use_emulator {
            return Ok(Self {
                account: account.unwrap_or_else(|| "devstoreaccount1".to_string()),
                access_key: access_key.unwrap_or_default(),
                blob_endpoint,
                use_emulator,
            });
        }

        let account = account
            .filter(|a| !a.is_empty())
            .ok_or_else(|| StorageError::InvalidConnectionString("missing AccountName".into()))?;
        let access_key = access_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| StorageError::InvalidConnectionString("missing AccountKey".into()))?;

        let blob_endpoint = blob_endpoint.or_else(|| {
            suffix
                .filter(|s| s != "core.windows.net")
                .map(|s| format!("{protocol}://{account}.blob.{s}"))
        });

        Ok(Self {
            account,
            access_key,
            blob_endpoint,
            use_emulator,
        })
    }
}

/// Storage client wrapping object_store
#[derive(Clone)]
pub struct StorageClient {
    store: Arc<dyn ObjectStore>,
    pub container: String,
}

impl StorageClient {
    /// Create new storage client with any object_store backend
    pub fn new(store: Arc<dyn ObjectStore>, container: impl Into<String>) -> Self {
        Self {
            store,
            container: container.into(),
        }
    }

    /// Create in-memory storage for testing/development
    pub fn in_memory(container: impl Into<String>) -> Self {
        Self::new(Arc::new(object_store::memory::InMemory::new()), container)
    }

    /// Azure Blob Storage container from a connection string
    pub fn from_connection_string(connection: &str, container: &str) -> Result<Self> {
        let parsed = AzureConnection::parse(connection)?;

        let mut builder = MicrosoftAzureBuilder::new()
            .with_account(&parsed.account)
            .with_container_name(container);
        if parsed.use_emulator {
            builder = builder.with_use_emulator(true);
        } else {
            builder = builder.with_access_key(&parsed.access_key);
        }
        if let Some(endpoint) = &parsed.blob_endpoint {
            builder = builder
                .with_config(AzureConfigKey::Endpoint, endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let store = builder.build()?;
        tracing::info!(account = %parsed.account, container, "Azure storage configured");
        Ok(Self::new(Arc::new(store), container))
    }

    /// Stream a local file into `key`, overwriting any existing object
    ///
    /// Small files go up in one request; larger ones as a multipart upload,
    /// so memory use stays bounded by the writer's buffer.
    pub async fn upload_file(&self, local: &Path, key: &str) -> Result<UploadReceipt> {
        let path = StoragePath::from(key);
        let mut file = tokio::fs::File::open(local).await?;
        let mut writer = BufWriter::new(self.store.clone(), path.clone());

        let size = match tokio::io::copy(&mut file, &mut writer).await {
            Ok(size) => size,
            Err(e) => {
                if let Err(abort) = writer.abort().await {
                    tracing::warn!(key, error = %abort, "Failed to abort partial upload");
                }
                return Err(storage_io_error(e));
            }
        };
        writer.shutdown().await.map_err(storage_io_error)?;

        let meta = self.store.head(&path).await?;
        tracing::info!(container = %self.container, key, size, "Uploaded to storage");

        Ok(UploadReceipt {
            key: key.to_string(),
            etag: meta.e_tag,
            size,
        })
    }

    /// Upload many files with at most `limit` in flight
    ///
    /// Every path is mapped first; a path the mapper rejects aborts the batch
    /// before anything is sent. The first failed upload stops new ones from
    /// starting.
    pub async fn upload_files<F>(&self, paths: Vec<PathBuf>, limit: usize, mapper: F) -> Result<Vec<UploadReceipt>>
    where
        F: Fn(&Path) -> Option<String>,
    {
        let targets = paths
            .into_iter()
            .map(|path| match mapper(&path) {
                Some(key) => Ok((path, key)),
                None => Err(StorageError::UnmappedPath(path)),
            })
            .collect::<Result<Vec<_>>>()?;

        pool::run(targets, limit, |(path, key)| {
            let client = self.clone();
            async move { client.upload_file(&path, &key).await }
        })
        .await
    }

    /// Download from storage
    pub async fn download(&self, key: &str) -> Result<Vec<u8>> {
        let path = StoragePath::from(key);

        let result = match self.store.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Err(StorageError::NotFound(key.to_string())),
            Err(e) => return Err(e.into()),
        };
        let bytes = result.bytes().await?;

        Ok(bytes.to_vec())
    }

    /// Object keys under `prefix`
    pub async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        use futures::TryStreamExt;

        let prefix = prefix.map(StoragePath::from);
        let objects: Vec<_> = self.store.list(prefix.as_ref()).try_collect().await?;
        let mut keys: Vec<String> = objects.into_iter().map(|meta| meta.location.to_string()).collect();
        keys.sort();
        Ok(keys)
    }

    /// Check if key exists
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let path = StoragePath::from(key);

        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Unwrap object store failures reported through the async writer
fn storage_io_error(e: std::io::Error) -> StorageError {
    if !e.get_ref().is_some_and(|inner| inner.is::<object_store::Error>()) {
        return StorageError::Io(e);
    }
    match e.into_inner().map(|inner| inner.downcast::<object_store::Error>()) {
        Some(Ok(err)) => StorageError::ObjectStoreError(*err),
        Some(Err(other)) => StorageError::Io(std::io::Error::other(other)),
        None => StorageError::Io(std::io::Error::other("upload failed")),
    }
}
