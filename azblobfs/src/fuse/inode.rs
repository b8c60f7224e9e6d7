//! Path ↔ inode numbering for the FUSE boundary.
//!
//! The driver is path based; the kernel talks in inode numbers. Numbers are
//! handed out on first sight of a path and never reused. Every reply that
//! hands an entry to the kernel bumps that inode's lookup count, and the
//! entry is dropped once `forget` brings the count back to zero.

use std::collections::HashMap;

use parking_lot::RwLock;

pub const ROOT_INO: u64 = 1;

/// Reported in plain `readdir` for paths the kernel has not looked up yet.
pub const UNKNOWN_INO: u64 = 0xffff_ffff;

struct Inner {
    next: u64,
    by_path: HashMap<String, u64>,
    by_ino: HashMap<u64, String>,
    lookups: HashMap<u64, u64>,
}

impl Inner {
    fn remove_ino(&mut self, ino: u64) {
        if let Some(path) = self.by_ino.remove(&ino) {
            self.by_path.remove(&path);
        }
        self.lookups.remove(&ino);
    }
}

pub struct InodeTable {
    inner: RwLock<Inner>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut by_path = HashMap::new();
        let mut by_ino = HashMap::new();
        by_path.insert("/".to_string(), ROOT_INO);
        by_ino.insert(ROOT_INO, "/".to_string());
        Self {
            inner: RwLock::new(Inner {
                next: ROOT_INO + 1,
                by_path,
                by_ino,
                lookups: HashMap::new(),
            }),
        }
    }

    /// Number for `path` as handed to the kernel in an entry reply.
    pub fn lookup(&self, path: &str) -> u64 {
        let mut inner = self.inner.write();
        let ino = Self::assign(&mut inner, path);
        *inner.lookups.entry(ino).or_insert(0) += 1;
        ino
    }

    fn assign(inner: &mut Inner, path: &str) -> u64 {
        if let Some(ino) = inner.by_path.get(path) {
            return *ino;
        }
        let ino = inner.next;
        inner.next += 1;
        inner.by_path.insert(path.to_string(), ino);
        inner.by_ino.insert(ino, path.to_string());
        ino
    }

    pub fn peek(&self, path: &str) -> Option<u64> {
        self.inner.read().by_path.get(path).copied()
    }

    /// Kernel dropped `nlookup` references to `ino`.
    pub fn forget_lookups(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let mut inner = self.inner.write();
        let remaining = match inner.lookups.get_mut(&ino) {
            Some(count) => {
                *count = count.saturating_sub(nlookup);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            inner.remove_ino(ino);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path_of(&self, ino: u64) -> Option<String> {
        self.inner.read().by_ino.get(&ino).cloned()
    }

    /// Drop `path` and everything below it. The root is kept.
    pub fn forget(&self, path: &str) {
        if path == "/" {
            return;
        }
        let prefix = format!("{path}/");
        let mut inner = self.inner.write();
        let doomed: Vec<u64> = inner
            .by_path
            .iter()
            .filter(|(p, _)| p.as_str() == path || p.starts_with(&prefix))
            .map(|(_, ino)| *ino)
            .collect();
        for ino in doomed {
            inner.remove_ino(ino);
        }
    }

    /// Move the inode of `old` to `new`, replacing whatever `new` had.
    pub fn rename(&self, old: &str, new: &str) {
        if old == new {
            return;
        }
        let mut inner = self.inner.write();
        if let Some(stale) = inner.by_path.get(new).copied() {
            inner.remove_ino(stale);
        }
        if let Some(ino) = inner.by_path.remove(old) {
            inner.by_path.insert(new.to_string(), ino);
            inner.by_ino.insert(ino, new.to_string());
        }
    }
}
