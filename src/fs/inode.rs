use std::collections::HashMap;
use std::sync::Mutex;

pub const ROOT_INO: u64 = fuser::FUSE_ROOT_ID;

struct Record {
    path: String,
    lookups: u64,
}

struct Inner {
    by_ino: HashMap<u64, Record>,
    by_path: HashMap<String, u64>,
}

/// Bidirectional inode/path table bridging `fuser`'s inode-addressed callbacks to the
/// path-string algorithms the rest of the crate is built around. Every successful
/// `lookup()` reply interns its child here and bumps its kernel lookup count; `forget`
/// decrements it and evicts the record once it reaches zero. The root is pre-registered
/// and is never evicted.
pub struct InodeTable {
    inner: Mutex<Inner>,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut by_ino = HashMap::new();
        by_ino.insert(
            ROOT_INO,
            Record {
                path: String::new(),
                lookups: 1,
            },
        );
        let mut by_path = HashMap::new();
        by_path.insert(String::new(), ROOT_INO);
        Self {
            inner: Mutex::new(Inner { by_ino, by_path }),
        }
    }

    pub fn path_of(&self, ino: u64) -> Option<String> {
        let inner = self.inner.lock().ok()?;
        inner.by_ino.get(&ino).map(|r| r.path.clone())
    }

    /// Registers `path` under `ino`, creating the reverse mapping if absent, and
    /// increments the entry's kernel-visible lookup count by one.
    pub fn intern(&self, ino: u64, path: &str) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.by_path.insert(path.to_string(), ino);
        match inner.by_ino.get_mut(&ino) {
            Some(record) => record.lookups += 1,
            None => {
                inner.by_ino.insert(
                    ino,
                    Record {
                        path: path.to_string(),
                        lookups: 1,
                    },
                );
            }
        }
    }

    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let evict = match inner.by_ino.get_mut(&ino) {
            Some(record) => {
                record.lookups = record.lookups.saturating_sub(nlookup);
                record.lookups == 0
            }
            None => false,
        };
        if evict {
            if let Some(record) = inner.by_ino.remove(&ino) {
                inner.by_path.remove(&record.path);
            }
        }
    }
}
