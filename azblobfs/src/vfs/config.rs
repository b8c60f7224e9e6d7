use crate::cadapter::client::{ContainerAccess, MAX_BLOB_SIZE};

/// Driver tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsConfig {
    /// Largest buffer a flush will upload.
    pub max_blob_size: usize,
    /// Access level for containers created by `mkdir`.
    pub container_access: ContainerAccess,
    /// Content type sent with every upload.
    pub content_type: String,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            max_blob_size: MAX_BLOB_SIZE,
            container_access: ContainerAccess::Private,
            content_type: "application/octet-stream".to_string(),
        }
    }
}
