//! FUSE adapter and request handling
//!
//! Exposes a `BlobFs` to the kernel through rfuse3's raw `Filesystem` trait.
//! Inode numbers are translated to paths through `InodeTable`, driver errors
//! become errnos through `FsError::errno`.
//!
//! Main components:
//! - `inode`: path ↔ inode numbering
//! - `mount`: mounting helpers
//! - `FuseFs`: the `Filesystem` implementation plus attribute conversion
pub mod inode;
pub mod mount;

use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use rfuse3::Errno;
use rfuse3::Result as FuseResult;
use rfuse3::raw::Filesystem;
use rfuse3::raw::Request;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, ReplyAttr, ReplyCreated, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite, ReplyXAttr,
};
use rfuse3::{FileType as FuseFileType, SetAttr, Timestamp};
use tracing::{debug, info};

use crate::cadapter::client::BlobBackend;
use crate::meta::path::join;
use crate::vfs::error::FsError;
use crate::vfs::fs::{BLOCK_SIZE, BlobFs, FileAttr as VfsFileAttr, FileType as VfsFileType};
use inode::{InodeTable, ROOT_INO, UNKNOWN_INO};

/// Largest single write the kernel may send.
pub const MAX_WRITE: u32 = 1024 * 1024;

const TTL: Duration = Duration::from_secs(1);

impl From<FsError> for Errno {
    fn from(err: FsError) -> Self {
        Errno::from(err.errno())
    }
}

pub struct FuseFs<B: ?Sized> {
    fs: Arc<BlobFs<B>>,
    inodes: InodeTable,
}

impl<B: BlobBackend + ?Sized> FuseFs<B> {
    pub fn new(fs: BlobFs<B>) -> Self {
        Self {
            fs: Arc::new(fs),
            inodes: InodeTable::new(),
        }
    }

    pub fn driver(&self) -> &Arc<BlobFs<B>> {
        &self.fs
    }

    fn path(&self, ino: u64) -> FuseResult<String> {
        self.inodes
            .path_of(ino)
            .ok_or_else(|| Errno::from(libc::ENOENT))
    }

    /// Path of a handle-based call: the inode's path, or the path the handle
    /// was opened on when the inode is already gone (unlinked while open).
    fn handle_path(&self, ino: u64, fh: u64) -> FuseResult<String> {
        match self.inodes.path_of(ino) {
            Some(path) => Ok(path),
            None => Ok(self.fs.handles().get(fh)?.path),
        }
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> FuseResult<String> {
        let name = name.to_string_lossy();
        if name.is_empty() || name.contains('/') {
            return Err(libc::EINVAL.into());
        }
        Ok(join(&self.path(parent)?, &name))
    }

    async fn entry(&self, path: &str, req: &Request) -> FuseResult<ReplyEntry> {
        let attr = self.fs.getattr(path).await?;
        let ino = self.inodes.lookup(path);
        Ok(ReplyEntry {
            ttl: TTL,
            attr: vfs_to_fuse_attr(ino, &attr, req),
            generation: 0,
        })
    }

    async fn attr(&self, ino: u64, req: &Request) -> FuseResult<ReplyAttr> {
        let path = self.path(ino)?;
        let attr = self.fs.getattr(&path).await?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: vfs_to_fuse_attr(ino, &attr, req),
        })
    }

    /// Directory listing with `.` and `..`; offsets are 1-based positions.
    /// Only the dot entries carry an inode number here.
    async fn listing(&self, ino: u64) -> FuseResult<Vec<Listed>> {
        let path = self.path(ino)?;
        let entries = self.fs.readdir(&path).await?;
        let mut all = Vec::with_capacity(entries.len() + 2);
        all.push(Listed {
            ino: Some(ino),
            kind: FuseFileType::Directory,
            name: ".".to_string(),
            path: path.clone(),
        });
        all.push(Listed {
            ino: Some(ROOT_INO),
            kind: FuseFileType::Directory,
            name: "..".to_string(),
            path: "/".to_string(),
        });
        for e in entries {
            all.push(Listed {
                ino: None,
                kind: vfs_kind_to_fuse(e.kind),
                path: join(&path, &e.name),
                name: e.name,
            });
        }
        Ok(all)
    }
}

struct Listed {
    ino: Option<u64>,
    kind: FuseFileType,
    name: String,
    path: String,
}

impl<B> Filesystem for FuseFs<B>
where
    B: BlobBackend + ?Sized + 'static,
{
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        let max_write = NonZeroU32::new(MAX_WRITE).unwrap_or(NonZeroU32::MIN);
        info!(max_write = MAX_WRITE, "fuse session initialised");
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {
        info!("fuse session destroyed");
    }

    async fn lookup(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name)?;
        self.entry(&path, &req).await
    }

    async fn getattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        self.attr(ino, &req).await
    }

    // size, mode and owner changes are accepted and ignored
    async fn setattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path(ino)?;
        if let Some(size) = set_attr.size {
            self.fs.truncate(&path, size).await?;
        }
        if let Some(mode) = set_attr.mode {
            self.fs.chmod(&path, mode).await?;
        }
        if set_attr.uid.is_some() || set_attr.gid.is_some() {
            self.fs.chown(&path, set_attr.uid, set_attr.gid).await?;
        }
        self.attr(ino, &req).await
    }

    async fn mkdir(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name)?;
        self.fs.mkdir(&path, mode).await?;
        self.entry(&path, &req).await
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.child_path(parent, name)?;
        self.fs.rmdir(&path).await?;
        self.inodes.forget(&path);
        Ok(())
    }

    async fn create(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let path = self.child_path(parent, name)?;
        let fh = self.fs.create(&path, mode).await?;
        let entry = self.entry(&path, &req).await?;
        Ok(ReplyCreated {
            ttl: entry.ttl,
            attr: entry.attr,
            generation: entry.generation,
            fh,
            flags: 0,
        })
    }

    async fn open(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path(ino)?;
        let fh = self.fs.open(&path).await?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let path = self.handle_path(ino, fh)?;
        let data = self.fs.read(&path, size, offset, fh).await?;
        Ok(ReplyData { data })
    }

    async fn write(
        &self,
        _req: Request,
        ino: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let path = self.handle_path(ino, fh)?;
        let written = self.fs.write(&path, data, offset, fh).await?;
        Ok(ReplyWrite {
            written: written as u32,
        })
    }

    async fn flush(&self, _req: Request, inode: u64, fh: u64, _lock_owner: u64) -> FuseResult<()> {
        let path = self.handle_path(inode, fh)?;
        self.fs.flush(&path, fh).await?;
        Ok(())
    }

    async fn fsync(&self, _req: Request, inode: u64, fh: u64, _datasync: bool) -> FuseResult<()> {
        let path = self.handle_path(inode, fh)?;
        self.fs.flush(&path, fh).await?;
        Ok(())
    }

    // never flushes, even when the kernel asks for it
    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        self.fs.release(fh)?;
        Ok(())
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.child_path(parent, name)?;
        self.fs.unlink(&path).await?;
        self.inodes.forget(&path);
        Ok(())
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        let old = self.child_path(parent, name)?;
        let new = self.child_path(new_parent, new_name)?;
        self.fs.rename(&old, &new).await?;
        self.inodes.rename(&old, &new);
        Ok(())
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path(ino)?;
        let attr = self.fs.getattr(&path).await?;
        if !matches!(attr.kind, VfsFileType::Dir) {
            return Err(libc::ENOTDIR.into());
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let all = self.listing(ino).await?;
        let start = usize::try_from(offset.max(0)).unwrap_or(usize::MAX);
        let entries: Vec<FuseResult<DirectoryEntry>> = all
            .into_iter()
            .enumerate()
            .skip(start)
            .map(|(i, entry)| {
                let inode = entry
                    .ino
                    .or_else(|| self.inodes.peek(&entry.path))
                    .unwrap_or(UNKNOWN_INO);
                Ok(DirectoryEntry {
                    inode,
                    kind: entry.kind,
                    name: OsString::from(entry.name),
                    offset: i as i64 + 1,
                })
            })
            .collect();
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream::iter(entries));
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let all = self.listing(ino).await?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let mut entries: Vec<FuseResult<DirectoryEntryPlus>> = Vec::new();
        for (i, entry) in all.into_iter().enumerate().skip(start) {
            // entries can vanish between listing and stat
            let Ok(attr) = self.fs.getattr(&entry.path).await else {
                continue;
            };
            // every non-dot entry returned here counts as a kernel lookup
            let inode = match entry.ino {
                Some(ino) => ino,
                None => self.inodes.lookup(&entry.path),
            };
            entries.push(Ok(DirectoryEntryPlus {
                inode,
                generation: 0,
                kind: entry.kind,
                name: OsString::from(entry.name),
                offset: i as i64 + 1,
                attr: vfs_to_fuse_attr(inode, &attr, &req),
                entry_ttl: TTL,
                attr_ttl: TTL,
            }));
        }
        let boxed: Self::DirEntryPlusStream<'a> = Box::pin(stream::iter(entries));
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        let st = self.fs.statfs();
        Ok(ReplyStatFs {
            blocks: st.blocks,
            bfree: st.bfree,
            bavail: st.bavail,
            files: st.files,
            ffree: st.ffree,
            bsize: st.block_size,
            namelen: st.namelen,
            frsize: st.block_size,
        })
    }

    async fn symlink(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        link: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name)?;
        self.fs.symlink(&link.to_string_lossy(), &path).await?;
        self.entry(&path, &req).await
    }

    async fn getxattr(
        &self,
        _req: Request,
        inode: u64,
        name: &OsStr,
        size: u32,
    ) -> FuseResult<ReplyXAttr> {
        let path = self.path(inode)?;
        let value = self.fs.getxattr(&path, &name.to_string_lossy()).await?;
        if size == 0 {
            return Ok(ReplyXAttr::Size(value.len() as u32));
        }
        if (size as usize) < value.len() {
            return Err(libc::ERANGE.into());
        }
        Ok(ReplyXAttr::Data(Bytes::from(value)))
    }

    async fn listxattr(&self, _req: Request, inode: u64, size: u32) -> FuseResult<ReplyXAttr> {
        self.path(inode)?;
        if size == 0 {
            return Ok(ReplyXAttr::Size(0));
        }
        Ok(ReplyXAttr::Data(Bytes::new()))
    }

    // permissions are not enforced; only existence is checked
    async fn access(&self, _req: Request, inode: u64, _mask: u32) -> FuseResult<()> {
        let path = self.path(inode)?;
        self.fs.getattr(&path).await?;
        Ok(())
    }

    async fn forget(&self, _req: Request, inode: u64, nlookup: u64) {
        self.inodes.forget_lookups(inode, nlookup);
    }

    async fn batch_forget(&self, _req: Request, inodes: &[(u64, u64)]) {
        for (inode, nlookup) in inodes {
            self.inodes.forget_lookups(*inode, *nlookup);
        }
    }

    async fn interrupt(&self, _req: Request, unique: u64) -> FuseResult<()> {
        debug!(unique, "interrupt ignored");
        Ok(())
    }
}

fn vfs_kind_to_fuse(k: VfsFileType) -> FuseFileType {
    match k {
        VfsFileType::Dir => FuseFileType::Directory,
        VfsFileType::File => FuseFileType::RegularFile,
    }
}

fn vfs_to_fuse_attr(ino: u64, v: &VfsFileAttr, req: &Request) -> rfuse3::raw::reply::FileAttr {
    let mtime = Timestamp::from(v.mtime);
    rfuse3::raw::reply::FileAttr {
        ino,
        size: v.size,
        blocks: v.size.div_ceil(512),
        atime: mtime,
        mtime,
        ctime: mtime,
        #[cfg(target_os = "macos")]
        crtime: mtime,
        kind: vfs_kind_to_fuse(v.kind),
        perm: (v.mode & 0o7777) as u16,
        nlink: v.nlink,
        uid: req.uid,
        gid: req.gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: BLOCK_SIZE,
    }
}
