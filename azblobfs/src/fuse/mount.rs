//! Mount helpers for starting/stopping FUSE
//!
//! Notes:
//! - Only supported on Unix-like systems. On Linux we support unprivileged mount via fusermount3.
//! - These helpers are thin wrappers over rfuse3 raw Session APIs.

use std::path::Path;

use rfuse3::MountOptions;

use crate::cadapter::client::BlobBackend;
use crate::vfs::fs::BlobFs;

#[cfg(target_os = "linux")]
use super::FuseFs;

/// Build default mount options for azblobfs.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn default_mount_options() -> MountOptions {
    let mut mo = MountOptions::default();
    mo.fs_name("azblobfs");
    // Keep defaults conservative: no allow_other, require empty mountpoint.
    mo
}

/// Mount a driver on the given empty directory using unprivileged mode.
#[cfg(target_os = "linux")]
pub async fn mount_unprivileged<B>(
    fs: BlobFs<B>,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle>
where
    B: BlobBackend + ?Sized + 'static,
{
    let opts = default_mount_options();
    let session = rfuse3::raw::Session::new(opts);
    // Prefer unprivileged mount on Linux (requires fusermount3 in PATH)
    session
        .mount_with_unprivileged(FuseFs::new(fs), mount_point)
        .await
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_unprivileged<B>(
    _fs: BlobFs<B>,
    _mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle>
where
    B: BlobBackend + ?Sized + 'static,
{
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
