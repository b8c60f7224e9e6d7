//! Open-file handles
//!
//! Each handle owns a full in-memory copy of the blob. Writes only touch the
//! buffer; the driver uploads it on flush.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use super::error::{FsError, FsResult};

/// Snapshot of one handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenHandle {
    pub path: String,
    pub content: Vec<u8>,
    pub dirty: bool,
    /// Bumped on every mutation; a flush marks the handle clean only if the
    /// generation it uploaded is still current.
    pub generation: u64,
}

pub struct HandleTable {
    next_id: AtomicU64,
    handles: RwLock<HashMap<u64, OpenHandle>>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Ids start at 1 and are never reused.
    pub fn allocate(&self, path: impl Into<String>, content: Vec<u8>, dirty: bool) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handles.write().insert(
            id,
            OpenHandle {
                path: path.into(),
                content,
                dirty,
                generation: 0,
            },
        );
        id
    }

    pub fn get(&self, id: u64) -> FsResult<OpenHandle> {
        self.handles
            .read()
            .get(&id)
            .cloned()
            .ok_or(FsError::BadHandle(id))
    }

    pub fn set_content(&self, id: u64, content: Vec<u8>, dirty: bool) -> FsResult<()> {
        let mut handles = self.handles.write();
        let handle = handles.get_mut(&id).ok_or(FsError::BadHandle(id))?;
        handle.content = content;
        handle.dirty = dirty;
        handle.generation += 1;
        Ok(())
    }

    /// Refresh a clean handle's buffer unless it was written in the meantime.
    pub fn refresh_if_clean(&self, id: u64, generation: u64, content: Vec<u8>) {
        let mut handles = self.handles.write();
        match handles.get_mut(&id) {
            Some(handle) if !handle.dirty && handle.generation == generation => {
                handle.content = content;
            }
            _ => {}
        }
    }

    /// Replace everything from `offset` on with `data`. The buffer is cut at
    /// `offset` first (clamped to its length), so there are no holes and any
    /// old tail past the write is dropped.
    pub fn write_at(&self, id: u64, offset: u64, data: &[u8]) -> FsResult<usize> {
        let mut handles = self.handles.write();
        let handle = handles.get_mut(&id).ok_or(FsError::BadHandle(id))?;
        let keep = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(handle.content.len());
        handle.content.truncate(keep);
        handle.content.extend_from_slice(data);
        handle.dirty = true;
        handle.generation += 1;
        Ok(data.len())
    }

    /// Returns whether the handle was marked clean.
    pub fn mark_clean(&self, id: u64, generation: u64) -> bool {
        let mut handles = self.handles.write();
        match handles.get_mut(&id) {
            Some(handle) if handle.generation == generation => {
                handle.dirty = false;
                true
            }
            _ => false,
        }
    }

    /// Unknown ids are ignored.
    pub fn release(&self, id: u64) -> Option<OpenHandle> {
        self.handles.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
