use std::collections::HashMap;
use std::fs::File;
use std::sync::Mutex;

use crate::archive::{ArchiveFile, ArchiveHandle};

/// Per-open-file state, mirroring the original's `peepfs_cookie_t`: a passthrough
/// descriptor for real files, or a live archive member reader for virtual ones.
pub enum Cookie {
    Real(File),
    Archive {
        handle: ArchiveHandle,
        file: ArchiveFile,
    },
}

struct Inner {
    next_fh: u64,
    cookies: HashMap<u64, Cookie>,
}

/// Issues file handles and owns every open cookie for one mount. Directory handles are
/// not tracked here: `readdir` recomputes everything from its inode on every call, so
/// `opendir`/`releasedir` hand out a bare, untracked handle (see `fs::mod`).
pub struct CookieTable {
    inner: Mutex<Inner>,
}

impl CookieTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_fh: 1,
                cookies: HashMap::new(),
            }),
        }
    }

    pub fn insert(&self, cookie: Cookie) -> Option<u64> {
        let mut inner = self.inner.lock().ok()?;
        let fh = inner.next_fh;
        inner.next_fh += 1;
        inner.cookies.insert(fh, cookie);
        Some(fh)
    }

    pub fn with<R>(&self, fh: u64, f: impl FnOnce(&mut Cookie) -> R) -> Option<R> {
        let mut inner = self.inner.lock().ok()?;
        inner.cookies.get_mut(&fh).map(f)
    }

    pub fn remove(&self, fh: u64) -> Option<Cookie> {
        let mut inner = self.inner.lock().ok()?;
        inner.cookies.remove(&fh)
    }
}
