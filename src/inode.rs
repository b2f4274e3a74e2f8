//! Inode table: FUSE-required `ino <-> path` mapping.
//!
//! The object store addresses everything by path; FUSE requires stable
//! 64-bit inode numbers distinct from them. A bidirectional `DashMap` pair
//! tracks both directions with `nlookup` refcounting and a fixed
//! `ROOT_INODE`. There is no `DirId`/generation bookkeeping here: the store
//! has no hard links and no directory-entry identity beyond its path.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// The root inode number (FUSE convention).
pub const ROOT_INODE: u64 = 1;

struct Entry {
    path: String,
    nlookup: AtomicU64,
}

/// Bidirectional `ino <-> path` table with FUSE `nlookup` refcounting.
pub struct InodeTable {
    by_ino: DashMap<u64, Entry>,
    by_path: DashMap<String, u64>,
    next_ino: AtomicU64,
}

impl InodeTable {
    pub fn new() -> Self {
        let table = Self {
            by_ino: DashMap::new(),
            by_path: DashMap::new(),
            next_ino: AtomicU64::new(2),
        };
        table.by_ino.insert(
            ROOT_INODE,
            Entry {
                path: String::new(),
                nlookup: AtomicU64::new(1),
            },
        );
        table.by_path.insert(String::new(), ROOT_INODE);
        table
    }

    /// Returns the inode for `path`, allocating one and incrementing
    /// `nlookup` if new; increments `nlookup` on an existing entry too
    /// (the `lookup`/`create`/`mkdir`/`symlink` path, per FUSE convention).
    pub fn get_or_insert(&self, path: &str) -> u64 {
        if let Some(ino) = self.by_path.get(path) {
            let ino = *ino;
            if let Some(entry) = self.by_ino.get(&ino) {
                entry.nlookup.fetch_add(1, Ordering::Relaxed);
            }
            return ino;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        self.by_ino.insert(
            ino,
            Entry {
                path: path.to_string(),
                nlookup: AtomicU64::new(1),
            },
        );
        self.by_path.insert(path.to_string(), ino);
        ino
    }

    /// Same as [`Self::get_or_insert`] but does not bump `nlookup` — used by
    /// `readdir`, which per the FUSE protocol must not affect lookup counts.
    pub fn get_or_insert_no_lookup(&self, path: &str) -> u64 {
        if let Some(ino) = self.by_path.get(path) {
            return *ino;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        self.by_ino.insert(
            ino,
            Entry {
                path: path.to_string(),
                nlookup: AtomicU64::new(0),
            },
        );
        self.by_path.insert(path.to_string(), ino);
        ino
    }

    pub fn path_of(&self, ino: u64) -> Option<String> {
        self.by_ino.get(&ino).map(|e| e.path.clone())
    }

    pub fn ino_of(&self, path: &str) -> Option<u64> {
        self.by_path.get(path).map(|r| *r)
    }

    /// Decrements `nlookup`; evicts the entry once it reaches zero. The root
    /// inode is never evicted.
    pub fn forget(&self, ino: u64, n: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let remaining = match self.by_ino.get(&ino) {
            Some(entry) => {
                let old = entry.nlookup.fetch_sub(n, Ordering::AcqRel);
                old.saturating_sub(n)
            }
            None => return,
        };
        if remaining == 0 {
            if let Some((_, entry)) = self.by_ino.remove(&ino) {
                self.by_path.remove(&entry.path);
            }
        }
    }

    /// Drops the path->ino mapping (used after unlink/rmdir/rename-source).
    /// The inode entry itself is kept until `forget()` zeroes its refcount,
    /// since the kernel may still hold a cached reference to it.
    pub fn invalidate_path(&self, path: &str) {
        self.by_path.remove(path);
    }

    /// Repoints an inode at a new path (used after a successful rename).
    pub fn rename(&self, ino: u64, old_path: &str, new_path: &str) {
        self.by_path.remove(old_path);
        self.by_path.insert(new_path.to_string(), ino);
        if let Some(mut entry) = self.by_ino.get_mut(&ino) {
            entry.path = new_path.to_string();
        }
    }

    pub fn len(&self) -> usize {
        self.by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ino.len() <= 1
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_inode_preexists() {
        let t = InodeTable::new();
        assert_eq!(t.path_of(ROOT_INODE), Some(String::new()));
    }

    #[test]
    fn get_or_insert_is_stable() {
        let t = InodeTable::new();
        let ino1 = t.get_or_insert("a/b.txt");
        let ino2 = t.get_or_insert("a/b.txt");
        assert_eq!(ino1, ino2);
        assert_ne!(ino1, ROOT_INODE);
    }

    #[test]
    fn forget_evicts_at_zero() {
        let t = InodeTable::new();
        let ino = t.get_or_insert("a");
        t.forget(ino, 1);
        assert!(t.path_of(ino).is_none());
        assert!(t.ino_of("a").is_none());
    }

    #[test]
    fn forget_never_evicts_root() {
        let t = InodeTable::new();
        t.forget(ROOT_INODE, 1);
        assert_eq!(t.path_of(ROOT_INODE), Some(String::new()));
    }

    #[test]
    fn no_lookup_variant_does_not_bump_refcount() {
        let t = InodeTable::new();
        let ino = t.get_or_insert_no_lookup("readdir-entry");
        // A second no_lookup call on the same path must not allocate a new
        // inode nor change the refcount.
        let ino2 = t.get_or_insert_no_lookup("readdir-entry");
        assert_eq!(ino, ino2);
        assert!(t.by_ino.get(&ino).is_some());
    }

    #[test]
    fn rename_repoints_path() {
        let t = InodeTable::new();
        let ino = t.get_or_insert("old");
        t.rename(ino, "old", "new");
        assert_eq!(t.ino_of("old"), None);
        assert_eq!(t.ino_of("new"), Some(ino));
        assert_eq!(t.path_of(ino), Some("new".to_string()));
    }

    #[test]
    fn invalidate_path_keeps_inode_until_forget() {
        let t = InodeTable::new();
        let ino = t.get_or_insert("gone");
        t.invalidate_path("gone");
        assert!(t.ino_of("gone").is_none());
        assert!(t.path_of(ino).is_some());
    }
}
