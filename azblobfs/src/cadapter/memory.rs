//! In-process blob service.
//!
//! Used by the test suites and by `--backend memory`. Besides storing data it
//! counts calls per operation and can be told to fail the next call of a given
//! operation, which is how the driver's error paths are exercised.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use super::client::{
    BlobBackend, BlobEntry, BlobPage, BlobWithMetadata, ContainerAccess, ContainerEntry,
    PutBlobOptions, StorageError, StorageResult, check_block_size, check_upload_size,
};

/// Backend operations, for call accounting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    ListContainers,
    ListBlobs,
    CreateContainer,
    DeleteContainer,
    GetBlob,
    PutBlob,
    PutBlock,
    DeleteBlob,
    BlobExists,
}

const ALL_OPS: [Op; 9] = [
    Op::ListContainers,
    Op::ListBlobs,
    Op::CreateContainer,
    Op::DeleteContainer,
    Op::GetBlob,
    Op::PutBlob,
    Op::PutBlock,
    Op::DeleteBlob,
    Op::BlobExists,
];

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub data: Bytes,
    pub last_modified: SystemTime,
    pub options: PutBlobOptions,
}

#[derive(Debug, Clone)]
struct StoredContainer {
    last_modified: SystemTime,
    access: ContainerAccess,
    blobs: BTreeMap<String, StoredBlob>,
    /// Uncommitted blocks per blob name, keyed by block id.
    blocks: BTreeMap<String, BTreeMap<String, Bytes>>,
}

impl StoredContainer {
    fn new(access: ContainerAccess) -> Self {
        Self {
            last_modified: SystemTime::now(),
            access,
            blobs: BTreeMap::new(),
            blocks: BTreeMap::new(),
        }
    }
}

pub struct MemoryBackend {
    containers: RwLock<BTreeMap<String, StoredContainer>>,
    page_size: usize,
    calls: HashMap<Op, AtomicUsize>,
    failures: Mutex<HashMap<Op, StorageError>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            containers: RwLock::new(BTreeMap::new()),
            page_size: 5000,
            calls: ALL_OPS.iter().map(|op| (*op, AtomicUsize::new(0))).collect(),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Number of blobs returned per listing page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn insert_container(&self, name: &str) {
        self.containers
            .write()
            .entry(name.to_string())
            .or_insert_with(|| StoredContainer::new(ContainerAccess::Private));
    }

    pub fn insert_blob(&self, container: &str, name: &str, data: Bytes) {
        let mut containers = self.containers.write();
        let entry = containers
            .entry(container.to_string())
            .or_insert_with(|| StoredContainer::new(ContainerAccess::Private));
        entry.blobs.insert(
            name.to_string(),
            StoredBlob {
                data,
                last_modified: SystemTime::now(),
                options: PutBlobOptions::default(),
            },
        );
    }

    pub fn blob(&self, container: &str, name: &str) -> Option<StoredBlob> {
        self.containers
            .read()
            .get(container)
            .and_then(|c| c.blobs.get(name).cloned())
    }

    pub fn staged_block(&self, container: &str, name: &str, block_id: &str) -> Option<Bytes> {
        self.containers
            .read()
            .get(container)
            .and_then(|c| c.blocks.get(name))
            .and_then(|blocks| blocks.get(block_id).cloned())
    }

    pub fn container_access(&self, name: &str) -> Option<ContainerAccess> {
        self.containers.read().get(name).map(|c| c.access)
    }

    pub fn calls(&self, op: Op) -> usize {
        self.calls
            .get(&op)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        ALL_OPS.iter().map(|op| self.calls(*op)).sum()
    }

    /// Make the next call of `op` return `err` instead of touching state.
    pub fn fail_next(&self, op: Op, err: StorageError) {
        self.failures.lock().insert(op, err);
    }

    fn enter(&self, op: Op) -> StorageResult<()> {
        if let Some(counter) = self.calls.get(&op) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        match self.failures.lock().remove(&op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BlobBackend for MemoryBackend {
    async fn list_containers(&self) -> StorageResult<Vec<ContainerEntry>> {
        self.enter(Op::ListContainers)?;
        Ok(self
            .containers
            .read()
            .iter()
            .map(|(name, c)| ContainerEntry {
                name: name.clone(),
                etag: None,
                last_modified: c.last_modified,
            })
            .collect())
    }

    async fn list_blobs_page(
        &self,
        container: &str,
        prefix: Option<&str>,
        marker: Option<&str>,
    ) -> StorageResult<BlobPage> {
        self.enter(Op::ListBlobs)?;
        let containers = self.containers.read();
        let stored = containers.get(container).ok_or(StorageError::NotFound)?;
        let mut matching = stored
            .blobs
            .iter()
            .filter(|(name, _)| prefix.is_none_or(|p| name.starts_with(p)))
            .filter(|(name, _)| marker.is_none_or(|m| name.as_str() >= m));

        let blobs: Vec<BlobEntry> = matching
            .by_ref()
            .take(self.page_size)
            .map(|(name, blob)| BlobEntry {
                name: name.clone(),
                etag: None,
                last_modified: blob.last_modified,
                size: blob.data.len() as u64,
            })
            .collect();
        let next_marker = matching.next().map(|(name, _)| name.clone());
        Ok(BlobPage { blobs, next_marker })
    }

    async fn create_container(&self, name: &str, access: ContainerAccess) -> StorageResult<()> {
        self.enter(Op::CreateContainer)?;
        let mut containers = self.containers.write();
        if containers.contains_key(name) {
            return Err(StorageError::AlreadyExists);
        }
        containers.insert(name.to_string(), StoredContainer::new(access));
        Ok(())
    }

    async fn delete_container(&self, name: &str) -> StorageResult<()> {
        self.enter(Op::DeleteContainer)?;
        self.containers
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or(StorageError::NotFound)
    }

    async fn get_blob(&self, container: &str, name: &str) -> StorageResult<Bytes> {
        self.enter(Op::GetBlob)?;
        self.blob(container, name)
            .map(|b| b.data)
            .ok_or(StorageError::NotFound)
    }

    async fn get_blob_with_metadata(
        &self,
        container: &str,
        name: &str,
    ) -> StorageResult<BlobWithMetadata> {
        self.enter(Op::GetBlob)?;
        self.blob(container, name)
            .map(|b| BlobWithMetadata {
                data: b.data,
                metadata: b.options.metadata,
            })
            .ok_or(StorageError::NotFound)
    }

    async fn put_blob(
        &self,
        container: &str,
        name: &str,
        data: Bytes,
        options: &PutBlobOptions,
    ) -> StorageResult<()> {
        check_upload_size(data.len())?;
        self.enter(Op::PutBlob)?;
        let mut containers = self.containers.write();
        let stored = containers.get_mut(container).ok_or(StorageError::NotFound)?;
        stored.blobs.insert(
            name.to_string(),
            StoredBlob {
                data,
                last_modified: SystemTime::now(),
                options: options.clone(),
            },
        );
        Ok(())
    }

    async fn put_block(
        &self,
        container: &str,
        name: &str,
        block_id: &str,
        data: Bytes,
    ) -> StorageResult<()> {
        check_block_size(data.len())?;
        self.enter(Op::PutBlock)?;
        let mut containers = self.containers.write();
        let stored = containers.get_mut(container).ok_or(StorageError::NotFound)?;
        stored
            .blocks
            .entry(name.to_string())
            .or_default()
            .insert(block_id.to_string(), data);
        Ok(())
    }

    async fn delete_blob(&self, container: &str, name: &str) -> StorageResult<()> {
        self.enter(Op::DeleteBlob)?;
        self.containers
            .write()
            .get_mut(container)
            .and_then(|c| c.blobs.remove(name))
            .map(|_| ())
            .ok_or(StorageError::NotFound)
    }

    async fn blob_exists(&self, container: &str, name: &str) -> StorageResult<bool> {
        self.enter(Op::BlobExists)?;
        Ok(self.blob(container, name).is_some())
    }
}
