mod stream_backend;
mod zip_backend;

use std::path::Path;

use stream_backend::{StreamArchive, StreamFile};
use zip_backend::{ZipArchiveBackend, ZipFile};

pub const FLAG_DIR: u64 = 0x01;
pub const FLAG_SEEKABLE: u64 = 0x02;

/// Recognised archive extensions, case-insensitive, in the order they are probed.
pub const RECOGNIZED_EXTENSIONS: &[&str] = &[
    ".zip", ".tar", ".tar.gz", ".tar.bz2", ".tar.xz", ".tgz", ".iso", ".rar", ".cab",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveEntry {
    pub index: i64,
    pub size: i64,
    pub flags: u64,
}

impl ArchiveEntry {
    pub fn is_dir(&self) -> bool {
        self.flags & FLAG_DIR != 0
    }

    pub fn is_seekable(&self) -> bool {
        self.flags & FLAG_SEEKABLE != 0
    }
}

/// A callback invoked once per enumerated member; returning `false` stops enumeration early.
pub type EnumCallback<'a> = dyn FnMut(&str, &ArchiveEntry) -> bool + 'a;

/// Tagged union over the two backend implementations. Kept as a concrete enum rather
/// than a trait object, matching the corpus's preference for enum dispatch over a
/// small, closed variant set (see `ArchiveKind` in the decompression module this is
/// grounded on).
pub enum ArchiveHandle {
    Zip(ZipArchiveBackend),
    Stream(StreamArchive),
}

pub enum ArchiveFile {
    Zip(ZipFile),
    Stream(StreamFile),
}

/// Returns whether `name`'s extension is one of [`RECOGNIZED_EXTENSIONS`], case-insensitive.
pub fn has_recognized_extension(name: &str) -> bool {
    let lower = name.to_lowercase();
    RECOGNIZED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Opens `path` with whichever backend its extension selects. Returns `None` on any
/// failure, matching the original design's "open never propagates a reason, only a
/// null" contract — callers translate a `None` into "not an archive view".
pub fn archive_open(path: &Path) -> Option<ArchiveHandle> {
    if is_zip_extension(path) {
        ZipArchiveBackend::open(path).map(ArchiveHandle::Zip)
    } else {
        StreamArchive::open(path).map(ArchiveHandle::Stream)
    }
}

/// Probes whether `path` is a recognised, openable archive: opens and immediately
/// closes it. Used by the path virtualiser to decide whether to inject a `<name><SUFFIX>`
/// pseudo-entry into a directory listing.
pub fn archive_ident(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return false,
    };
    if !has_recognized_extension(name) {
        return false;
    }
    archive_open(path).is_some()
}

fn is_zip_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}

impl ArchiveHandle {
    pub fn enumerate(&self, callback: &mut EnumCallback<'_>) -> bool {
        match self {
            ArchiveHandle::Zip(z) => z.enumerate(callback),
            ArchiveHandle::Stream(s) => s.enumerate(callback),
        }
    }

    pub fn entry_open(&self, name: &str) -> Option<ArchiveEntry> {
        match self {
            ArchiveHandle::Zip(z) => z.entry_open(name),
            ArchiveHandle::Stream(s) => s.entry_open(name),
        }
    }

    pub fn file_open(&self, entry: &ArchiveEntry) -> Option<ArchiveFile> {
        match self {
            ArchiveHandle::Zip(z) => z.file_open(entry).map(ArchiveFile::Zip),
            ArchiveHandle::Stream(s) => s.file_open(entry).map(ArchiveFile::Stream),
        }
    }

    pub fn file_read(&self, file: &mut ArchiveFile, buf: &mut [u8], offset: u64) -> i64 {
        match (self, file) {
            (ArchiveHandle::Zip(z), ArchiveFile::Zip(f)) => z.file_read(f, buf, offset),
            (ArchiveHandle::Stream(s), ArchiveFile::Stream(f)) => s.file_read(f, buf, offset),
            _ => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_all_documented_extensions() {
        for name in [
            "a.zip", "a.ZIP", "a.tar", "a.tar.gz", "a.tar.bz2", "a.tar.xz", "a.tgz", "a.iso",
            "a.rar", "a.cab",
        ] {
            assert!(has_recognized_extension(name), "{name} should be recognized");
        }
        assert!(!has_recognized_extension("a.txt"));
    }

    #[test]
    fn archive_ident_rejects_non_archive_extension() {
        assert!(!archive_ident(Path::new("/nonexistent/plain.txt")));
    }

    #[test]
    fn archive_ident_rejects_missing_file() {
        assert!(!archive_ident(Path::new(
            "/nonexistent/peepfs-test-archive.zip"
        )));
    }
}
