//! Path-based filesystem driver over a blob service.
//!
//! The account root holds one directory per container and every container
//! holds flat files, one per blob. File content lives in per-handle buffers
//! between `open` and `flush`; nothing reaches the service until a flush.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::config::FsConfig;
use super::error::{FsError, FsResult};
use super::handles::HandleTable;
use crate::cadapter::client::{BlobBackend, PutBlobOptions, StorageError};
use crate::meta::cache::{BlobStat, DIR_PERM, MetadataCache};
use crate::meta::path::{NodePath, container_key, is_valid_container_name, resolve_path};

pub const BLOCK_SIZE: u32 = 4096;
pub const MAX_NAME_LEN: u32 = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    File,
    Dir,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileAttr {
    pub kind: FileType,
    pub size: u64,
    pub mtime: SystemTime,
    /// File type bits plus permission bits.
    pub mode: u32,
    pub nlink: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatFs {
    pub block_size: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub namelen: u32,
}

impl StatFs {
    /// The service has no meaningful capacity, so report a huge empty disk.
    pub fn unbounded() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            blocks: u64::MAX / 2,
            bfree: u64::MAX / 2,
            bavail: u64::MAX / 2,
            files: u64::MAX / 2,
            ffree: u64::MAX / 2,
            namelen: MAX_NAME_LEN,
        }
    }
}

pub struct BlobFs<B: ?Sized> {
    backend: Arc<B>,
    cache: Arc<MetadataCache<B>>,
    handles: Arc<HandleTable>,
    config: FsConfig,
}

impl<B: BlobBackend + ?Sized> BlobFs<B> {
    /// Build the driver and load the container set.
    pub async fn mount(backend: Arc<B>, config: FsConfig) -> FsResult<Self> {
        let cache = Arc::new(MetadataCache::new(backend.clone()));
        cache
            .refresh_containers()
            .await
            .map_err(|e| FsError::from_storage(e, "/"))?;
        Ok(Self::from_parts(
            backend,
            cache,
            Arc::new(HandleTable::new()),
            config,
        ))
    }

    /// Assemble a driver from existing parts; the cache is used as-is.
    pub fn from_parts(
        backend: Arc<B>,
        cache: Arc<MetadataCache<B>>,
        handles: Arc<HandleTable>,
        config: FsConfig,
    ) -> Self {
        Self {
            backend,
            cache,
            handles,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<MetadataCache<B>> {
        &self.cache
    }

    pub fn handles(&self) -> &Arc<HandleTable> {
        &self.handles
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    fn dir_attr(mtime: SystemTime) -> FileAttr {
        FileAttr {
            kind: FileType::Dir,
            size: 0,
            mtime,
            mode: libc::S_IFDIR as u32 | DIR_PERM,
            nlink: 2,
        }
    }

    fn file_attr(stat: &BlobStat) -> FileAttr {
        FileAttr {
            kind: FileType::File,
            size: stat.size,
            mtime: stat.mtime,
            mode: stat.mode,
            nlink: 1,
        }
    }

    /// Container and blob name of a blob path.
    fn blob_target(path: &str) -> Option<(String, String)> {
        match resolve_path(path) {
            NodePath::Blob { container, name } => Some((container, name)),
            _ => None,
        }
    }

    pub async fn getattr(&self, path: &str) -> FsResult<FileAttr> {
        let node = resolve_path(path);
        match &node {
            NodePath::Root | NodePath::Container { .. } => self
                .cache
                .container(&node.container_key())
                .map(|c| Self::dir_attr(c.last_modified))
                .ok_or_else(|| FsError::not_found(path)),
            NodePath::Blob { name, .. } => {
                let stat = self
                    .cache
                    .blob(&node.container_key(), name)
                    .await
                    .map_err(|e| FsError::from_cache(e, path))?;
                stat.map(|s| Self::file_attr(&s))
                    .ok_or_else(|| FsError::not_found(path))
            }
        }
    }

    /// Create a container. Only top-level directories can exist.
    pub async fn mkdir(&self, path: &str, _mode: u32) -> FsResult<()> {
        let name = match resolve_path(path) {
            NodePath::Container { name } => name,
            NodePath::Root => {
                return Err(FsError::AlreadyExists {
                    path: path.into(),
                });
            }
            NodePath::Blob { .. } => {
                return Err(FsError::unsupported("directories inside a container"));
            }
        };
        if !is_valid_container_name(&name) {
            return Err(FsError::InvalidArgument(format!(
                "invalid container name {name:?}"
            )));
        }

        match self
            .backend
            .create_container(&name, self.config.container_access)
            .await
        {
            Ok(()) => {
                info!(container = %name, "container created");
                self.cache
                    .refresh_containers()
                    .await
                    .map_err(|e| FsError::Transient(e.to_string()))
            }
            Err(StorageError::AlreadyExists) => Err(FsError::AlreadyExists {
                path: path.into(),
            }),
            Err(e) => {
                warn!(container = %name, error = %e, "create container failed");
                Err(FsError::permission_denied(path))
            }
        }
    }

    pub async fn rmdir(&self, path: &str) -> FsResult<()> {
        let name = match resolve_path(path) {
            NodePath::Container { name } => name,
            _ => return Err(FsError::unsupported("rmdir outside the top level")),
        };
        let key = container_key(&name);
        match self.backend.delete_container(&name).await {
            Ok(()) => {
                info!(container = %name, "container deleted");
                self.cache.remove_container(&key);
                Ok(())
            }
            Err(StorageError::NotFound) => {
                self.cache.remove_container(&key);
                Err(FsError::not_found(path))
            }
            Err(e) => {
                warn!(container = %name, error = %e, "delete container failed");
                Err(FsError::permission_denied(path))
            }
        }
    }

    /// Register an empty file and open a dirty handle on it, so a flush
    /// without writes still stores an empty blob.
    pub async fn create(&self, path: &str, _mode: u32) -> FsResult<u64> {
        let Some((container, name)) = Self::blob_target(path) else {
            return Err(FsError::unsupported("files outside a container"));
        };
        let key = container_key(&container);
        self.cache
            .blobs_of(&key)
            .await
            .map_err(|e| FsError::from_cache(e, path))?;
        self.cache
            .upsert_blob(&key, &name, BlobStat::new(0, SystemTime::now()));
        let fh = self.handles.allocate(path, Vec::new(), true);
        debug!(path, fh, "created file");
        Ok(fh)
    }

    /// Download the whole blob into a fresh clean handle.
    pub async fn open(&self, path: &str) -> FsResult<u64> {
        let Some((container, name)) = Self::blob_target(path) else {
            return Err(FsError::is_a_directory(path));
        };
        let key = container_key(&container);
        self.cache
            .blobs_of(&key)
            .await
            .map_err(|e| FsError::from_cache(e, path))?;
        let data = self.fetch(&key, &container, &name, path).await?;
        let fh = self.handles.allocate(path, data.to_vec(), false);
        debug!(path, fh, size = data.len(), "opened file");
        Ok(fh)
    }

    async fn fetch(&self, key: &str, container: &str, name: &str, path: &str) -> FsResult<Bytes> {
        match self.backend.get_blob(container, name).await {
            Ok(data) => Ok(data),
            Err(StorageError::NotFound) => {
                self.cache.invalidate(key, Some(name));
                Err(FsError::not_found(path))
            }
            Err(StorageError::Denied) => Err(FsError::permission_denied(path)),
            Err(e) => {
                warn!(path, error = %e, "blob download failed");
                Err(FsError::Transient(e.to_string()))
            }
        }
    }

    /// A clean handle is re-read from the service on every call; a dirty one
    /// serves its own buffer.
    pub async fn read(&self, path: &str, size: u32, offset: u64, fh: u64) -> FsResult<Bytes> {
        let handle = self.handles.get(fh)?;
        let content = if handle.dirty {
            Bytes::from(handle.content)
        } else {
            let (container, name) = Self::blob_target(&handle.path)
                .ok_or_else(|| FsError::is_a_directory(handle.path.as_str()))?;
            let key = container_key(&container);
            let data = self.fetch(&key, &container, &name, path).await?;
            self.handles
                .refresh_if_clean(fh, handle.generation, data.to_vec());
            data
        };
        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(content.len());
        let end = start.saturating_add(size as usize).min(content.len());
        Ok(content.slice(start..end))
    }

    pub async fn write(&self, path: &str, data: &[u8], offset: u64, fh: u64) -> FsResult<usize> {
        let written = self.handles.write_at(fh, offset, data)?;
        debug!(path, fh, offset, len = written, "buffered write");
        Ok(written)
    }

    /// Upload a dirty handle. A failed upload leaves the handle dirty.
    pub async fn flush(&self, path: &str, fh: u64) -> FsResult<()> {
        let handle = self.handles.get(fh)?;
        if !handle.dirty {
            return Ok(());
        }
        let size = handle.content.len();
        if size > self.config.max_blob_size {
            return Err(FsError::FileTooLarge {
                size,
                limit: self.config.max_blob_size,
            });
        }
        let (container, name) = Self::blob_target(&handle.path)
            .ok_or_else(|| FsError::is_a_directory(handle.path.as_str()))?;

        let options = PutBlobOptions {
            content_type: self.config.content_type.clone(),
            ..Default::default()
        };
        match self
            .backend
            .put_blob(&container, &name, Bytes::from(handle.content), &options)
            .await
        {
            Ok(()) => {
                if !self.handles.mark_clean(fh, handle.generation) {
                    debug!(path, fh, "handle written during upload, staying dirty");
                }
                self.cache.upsert_blob(
                    &container_key(&container),
                    &name,
                    BlobStat::new(size as u64, SystemTime::now()),
                );
                debug!(path, fh, size, "flushed");
                Ok(())
            }
            Err(StorageError::TooLarge { size, limit }) => Err(FsError::FileTooLarge { size, limit }),
            Err(e) => {
                warn!(path, error = %e, "upload failed");
                Err(FsError::Transient(e.to_string()))
            }
        }
    }

    /// Drop the handle. Unflushed writes are discarded.
    pub fn release(&self, fh: u64) -> FsResult<()> {
        match self.handles.release(fh) {
            Some(handle) if handle.dirty => {
                debug!(path = %handle.path, fh, "released dirty handle, discarding writes");
            }
            _ => {}
        }
        Ok(())
    }

    pub async fn truncate(&self, path: &str, len: u64) -> FsResult<()> {
        debug!(path, len, "truncate ignored");
        Ok(())
    }

    pub async fn unlink(&self, path: &str) -> FsResult<()> {
        let Some((container, name)) = Self::blob_target(path) else {
            return Err(FsError::is_a_directory(path));
        };
        let key = container_key(&container);
        match self.backend.delete_blob(&container, &name).await {
            Ok(()) => {
                self.cache.invalidate(&key, Some(&name));
                debug!(path, "unlinked");
                Ok(())
            }
            Err(StorageError::NotFound) => {
                self.cache.invalidate(&key, Some(&name));
                Err(FsError::not_found(path))
            }
            Err(StorageError::Denied) => Err(FsError::permission_denied(path)),
            Err(e) => {
                warn!(path, error = %e, "delete blob failed");
                Err(FsError::Transient(e.to_string()))
            }
        }
    }

    pub async fn readdir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let node = resolve_path(path);
        match &node {
            NodePath::Root => Ok(self
                .cache
                .container_names()
                .into_iter()
                .map(|name| DirEntry {
                    name,
                    kind: FileType::Dir,
                })
                .collect()),
            NodePath::Container { .. } => {
                let blobs = self
                    .cache
                    .blobs_of(&node.container_key())
                    .await
                    .map_err(|e| FsError::from_cache(e, path))?;
                Ok(blobs
                    .keys()
                    .map(|name| DirEntry {
                        name: name.clone(),
                        kind: FileType::File,
                    })
                    .collect())
            }
            NodePath::Blob { .. } => Err(FsError::not_a_directory(path)),
        }
    }

    /// Copy-then-delete. Not atomic: when the copy lands but the source
    /// cannot be removed, `RenameIncomplete` is returned and both exist.
    pub async fn rename(&self, old: &str, new: &str) -> FsResult<()> {
        let (Some(_), Some((new_container, new_name))) =
            (Self::blob_target(old), Self::blob_target(new))
        else {
            return Err(FsError::unsupported("renaming directories"));
        };
        if resolve_path(old) == resolve_path(new) {
            return Ok(());
        }

        let src = self.open(old).await?;
        let content = self.handles.get(src).map(|h| h.content);
        self.handles.release(src);
        let content = content?;

        let new_key = container_key(&new_container);
        let previous = self
            .cache
            .blob(&new_key, &new_name)
            .await
            .map_err(|e| FsError::from_cache(e, new))?;

        let dst = self.create(new, 0o644).await?;
        let copied = match self.write(new, &content, 0, dst).await {
            Ok(_) => self.flush(new, dst).await,
            Err(e) => Err(e),
        };
        self.handles.release(dst);
        if let Err(e) = copied {
            // remote target unchanged; restore its entry
            match previous {
                Some(stat) => self.cache.upsert_blob(&new_key, &new_name, stat),
                None => self.cache.invalidate(&new_key, Some(&new_name)),
            }
            return Err(e);
        }

        self.unlink(old).await.map_err(|e| {
            warn!(old, new, error = %e, "rename left the source behind");
            FsError::RenameIncomplete {
                old: old.to_string(),
                new: new.to_string(),
                source: Box::new(e),
            }
        })
    }

    pub async fn symlink(&self, _target: &str, link: &str) -> FsResult<()> {
        Err(FsError::unsupported(format!("symlink {link}")))
    }

    pub async fn chmod(&self, _path: &str, _mode: u32) -> FsResult<()> {
        Ok(())
    }

    pub async fn chown(&self, _path: &str, _uid: Option<u32>, _gid: Option<u32>) -> FsResult<()> {
        Ok(())
    }

    /// Extended attributes are not stored; every name reads as empty.
    pub async fn getxattr(&self, _path: &str, _name: &str) -> FsResult<Vec<u8>> {
        Ok(Vec::new())
    }

    pub fn statfs(&self) -> StatFs {
        StatFs::unbounded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::memory::{MemoryBackend, Op};

    async fn mounted() -> (Arc<MemoryBackend>, BlobFs<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert_blob("docs", "readme.txt", Bytes::from_static(b"hello"));
        let fs = BlobFs::mount(backend.clone(), FsConfig::default())
            .await
            .unwrap();
        (backend, fs)
    }

    #[tokio::test]
    async fn getattr_covers_all_levels() {
        let (_backend, fs) = mounted().await;
        assert_eq!(fs.getattr("/").await.unwrap().kind, FileType::Dir);
        let dir = fs.getattr("/docs").await.unwrap();
        assert_eq!(dir.mode & libc::S_IFMT as u32, libc::S_IFDIR as u32);
        let file = fs.getattr("/docs/readme.txt").await.unwrap();
        assert_eq!((file.kind, file.size), (FileType::File, 5));
        assert!(matches!(
            fs.getattr("/nope").await,
            Err(FsError::NotFound { .. })
        ));
        assert!(matches!(
            fs.getattr("/nope/x").await,
            Err(FsError::NotFound { .. })
        ));
        assert!(matches!(
            fs.getattr("/docs/missing").await,
            Err(FsError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn create_then_flush_stores_empty_blob() {
        let (backend, fs) = mounted().await;
        let fh = fs.create("/docs/empty", 0o644).await.unwrap();
        assert_eq!(fs.getattr("/docs/empty").await.unwrap().size, 0);
        fs.flush("/docs/empty", fh).await.unwrap();
        fs.release(fh).unwrap();
        assert_eq!(backend.blob("docs", "empty").unwrap().data.len(), 0);
    }

    #[tokio::test]
    async fn dirty_handle_reads_its_own_buffer() {
        let (backend, fs) = mounted().await;
        let fh = fs.open("/docs/readme.txt").await.unwrap();
        fs.write("/docs/readme.txt", b"J", 0, fh).await.unwrap();
        let gets = backend.calls(Op::GetBlob);
        let data = fs.read("/docs/readme.txt", 10, 0, fh).await.unwrap();
        assert_eq!(&data[..], b"J");
        assert_eq!(backend.calls(Op::GetBlob), gets);
    }

    #[tokio::test]
    async fn clean_handle_rereads_remote() {
        let (backend, fs) = mounted().await;
        let fh = fs.open("/docs/readme.txt").await.unwrap();
        backend.insert_blob("docs", "readme.txt", Bytes::from_static(b"changed"));
        let data = fs.read("/docs/readme.txt", 100, 2, fh).await.unwrap();
        assert_eq!(&data[..], b"anged");
        assert_eq!(
            fs.handles().get(fh).unwrap().content,
            b"changed".to_vec()
        );
        assert!(fs.read("/docs/readme.txt", 4, 99, fh).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_upload_keeps_handle_dirty() {
        let (backend, fs) = mounted().await;
        let fh = fs.open("/docs/readme.txt").await.unwrap();
        fs.write("/docs/readme.txt", b"new", 0, fh).await.unwrap();
        backend.fail_next(Op::PutBlob, StorageError::Denied);
        assert!(matches!(
            fs.flush("/docs/readme.txt", fh).await,
            Err(FsError::Transient(_))
        ));
        assert!(fs.handles().get(fh).unwrap().dirty);
        fs.flush("/docs/readme.txt", fh).await.unwrap();
        assert!(!fs.handles().get(fh).unwrap().dirty);
        assert_eq!(&backend.blob("docs", "readme.txt").unwrap().data[..], b"new");
    }

    #[tokio::test]
    async fn open_missing_evicts_stale_entry() {
        let (backend, fs) = mounted().await;
        fs.getattr("/docs/readme.txt").await.unwrap();
        backend.delete_blob("docs", "readme.txt").await.unwrap();
        assert!(matches!(
            fs.open("/docs/readme.txt").await,
            Err(FsError::NotFound { .. })
        ));
        assert!(matches!(
            fs.getattr("/docs/readme.txt").await,
            Err(FsError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn directory_paths_are_rejected_by_file_ops() {
        let (_backend, fs) = mounted().await;
        assert!(matches!(fs.open("/docs").await, Err(FsError::IsADirectory { .. })));
        assert!(matches!(fs.unlink("/docs").await, Err(FsError::IsADirectory { .. })));
        assert!(matches!(
            fs.readdir("/docs/readme.txt").await,
            Err(FsError::NotADirectory { .. })
        ));
        assert!(matches!(fs.create("/docs", 0).await, Err(FsError::Unsupported(_))));
        assert!(matches!(fs.mkdir("/docs/sub", 0).await, Err(FsError::Unsupported(_))));
        assert!(matches!(fs.rmdir("/docs/sub").await, Err(FsError::Unsupported(_))));
        assert!(matches!(
            fs.rename("/docs", "/other").await,
            Err(FsError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn mkdir_and_rmdir_map_remote_results() {
        let (backend, fs) = mounted().await;
        fs.mkdir("/fresh", 0o755).await.unwrap();
        assert!(fs.getattr("/fresh").await.is_ok());
        assert!(matches!(
            fs.mkdir("/fresh", 0o755).await,
            Err(FsError::AlreadyExists { .. })
        ));

        backend.fail_next(Op::CreateContainer, StorageError::transient("boom"));
        assert!(matches!(
            fs.mkdir("/other", 0o755).await,
            Err(FsError::PermissionDenied { .. })
        ));

        fs.rmdir("/fresh").await.unwrap();
        assert!(fs.getattr("/fresh").await.is_err());
        assert!(matches!(fs.rmdir("/fresh").await, Err(FsError::NotFound { .. })));

        backend.fail_next(Op::DeleteContainer, StorageError::Denied);
        assert!(matches!(
            fs.rmdir("/docs").await,
            Err(FsError::PermissionDenied { .. })
        ));
    }

    #[tokio::test]
    async fn unlink_maps_remote_errors() {
        let (backend, fs) = mounted().await;
        backend.fail_next(Op::DeleteBlob, StorageError::Denied);
        assert!(matches!(
            fs.unlink("/docs/readme.txt").await,
            Err(FsError::PermissionDenied { .. })
        ));
        backend.fail_next(Op::DeleteBlob, StorageError::transient("503"));
        assert!(matches!(
            fs.unlink("/docs/readme.txt").await,
            Err(FsError::Transient(_))
        ));
        fs.unlink("/docs/readme.txt").await.unwrap();
        assert!(matches!(
            fs.unlink("/docs/readme.txt").await,
            Err(FsError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn stubs_and_statfs() {
        let (_backend, fs) = mounted().await;
        assert!(matches!(
            fs.symlink("/docs/readme.txt", "/docs/link").await,
            Err(FsError::Unsupported(_))
        ));
        fs.chmod("/docs/readme.txt", 0o600).await.unwrap();
        fs.chown("/docs/readme.txt", Some(1), None).await.unwrap();
        fs.truncate("/docs/readme.txt", 0).await.unwrap();
        assert!(fs.getxattr("/docs/readme.txt", "user.x").await.unwrap().is_empty());
        let st = fs.statfs();
        assert_eq!(st.block_size, BLOCK_SIZE);
        assert!(st.bavail > 0);
        fs.release(12345).unwrap();
    }
}
