//! Blob service seam used by the metadata cache and the filesystem driver.
//!
//! `BlobBackend` is implemented by the signed HTTP client (`azure`) and by the
//! in-memory fake (`memory`). Every call returns a `StorageResult` whose error
//! side is the small taxonomy the driver maps onto POSIX errors.

use std::collections::BTreeMap;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Largest blob accepted by a single upload (64 MiB).
pub const MAX_BLOB_SIZE: usize = 64 * 1024 * 1024;

/// Largest block accepted by `put_block` (4 MiB).
pub const MAX_BLOCK_SIZE: usize = 4 * 1024 * 1024;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("resource not found")]
    NotFound,

    #[error("resource already exists")]
    AlreadyExists,

    #[error("access denied")]
    Denied,

    #[error("blob of {size} bytes exceeds the {limit} byte upload limit")]
    TooLarge { size: usize, limit: usize },

    #[error("transient storage failure: {0}")]
    Transient(String),
}

impl StorageError {
    /// Only transient failures are worth retrying; the backend itself never does.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }

    pub(crate) fn transient(msg: impl Into<String>) -> Self {
        StorageError::Transient(msg.into())
    }
}

/// One `<Container>` element of a container listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEntry {
    pub name: String,
    pub etag: Option<String>,
    pub last_modified: SystemTime,
}

/// One `<Blob>` element of a blob listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub name: String,
    pub etag: Option<String>,
    pub last_modified: SystemTime,
    pub size: u64,
}

/// A single page of a blob listing plus the continuation marker, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobPage {
    pub blobs: Vec<BlobEntry>,
    pub next_marker: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContainerAccess {
    #[default]
    Private,
    Public,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutBlobOptions {
    pub content_type: String,
    /// Sent as `x-ms-meta-<key>` headers.
    pub metadata: BTreeMap<String, String>,
}

impl Default for PutBlobOptions {
    fn default() -> Self {
        Self {
            content_type: "application/octet-stream".to_string(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Blob content plus its user metadata, keys without the `x-ms-meta-` prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobWithMetadata {
    pub data: Bytes,
    pub metadata: BTreeMap<String, String>,
}

#[async_trait]
pub trait BlobBackend: Send + Sync {
    async fn list_containers(&self) -> StorageResult<Vec<ContainerEntry>>;

    /// Fetch one listing page. Callers drive pagination through `BlobPager`.
    async fn list_blobs_page(
        &self,
        container: &str,
        prefix: Option<&str>,
        marker: Option<&str>,
    ) -> StorageResult<BlobPage>;

    async fn create_container(&self, name: &str, access: ContainerAccess) -> StorageResult<()>;

    async fn delete_container(&self, name: &str) -> StorageResult<()>;

    async fn get_blob(&self, container: &str, name: &str) -> StorageResult<Bytes>;

    async fn get_blob_with_metadata(
        &self,
        container: &str,
        name: &str,
    ) -> StorageResult<BlobWithMetadata>;

    async fn put_blob(
        &self,
        container: &str,
        name: &str,
        data: Bytes,
        options: &PutBlobOptions,
    ) -> StorageResult<()>;

    /// Stage one uncommitted block of a block blob. `block_id` is sent as
    /// given, so callers pass the base64 form the service expects.
    async fn put_block(
        &self,
        container: &str,
        name: &str,
        block_id: &str,
        data: Bytes,
    ) -> StorageResult<()>;

    async fn delete_blob(&self, container: &str, name: &str) -> StorageResult<()>;

    async fn blob_exists(&self, container: &str, name: &str) -> StorageResult<bool>;
}

/// Reject uploads above the ceiling before anything is dispatched.
pub(crate) fn check_upload_size(len: usize) -> StorageResult<()> {
    if len > MAX_BLOB_SIZE {
        return Err(StorageError::TooLarge {
            size: len,
            limit: MAX_BLOB_SIZE,
        });
    }
    Ok(())
}

pub(crate) fn check_block_size(len: usize) -> StorageResult<()> {
    if len > MAX_BLOCK_SIZE {
        return Err(StorageError::TooLarge {
            size: len,
            limit: MAX_BLOCK_SIZE,
        });
    }
    Ok(())
}
