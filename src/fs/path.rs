use std::path::{Path, PathBuf};

/// Builds the backing-filesystem path for a mount-relative path (`""` for the root,
/// otherwise a leading-slash relative path such as `"/docs/readme.txt"`).
pub fn compose_path(backing_root: &Path, relpath: &str) -> PathBuf {
    if relpath.is_empty() {
        backing_root.to_path_buf()
    } else {
        PathBuf::from(format!("{}{relpath}", backing_root.display()))
    }
}

pub fn join_relpath(parent: &str, name: &str) -> String {
    format!("{parent}/{name}")
}

/// Scans `fullpath` for `magic_suffix`, validating each candidate split point against
/// the real filesystem. Returns `(archive_path, member_relpath)` on the first match whose
/// prefix is an existing regular file. A match whose prefix isn't a real file is not a
/// genuine split point (just a filename that happens to contain the suffix text), so the
/// scan resumes one character past that match's *start*, not past the whole match —
/// mirroring the original's `token++` retry before the next `strstr`.
pub fn split_archive_path(fullpath: &str, magic_suffix: &str) -> Option<(String, String)> {
    let mut search_from = 0usize;
    loop {
        let found = fullpath[search_from..].find(magic_suffix)?;
        let match_start = search_from + found;
        let candidate = &fullpath[..match_start];

        if !candidate.is_empty() && is_regular_file(candidate) {
            let mut rest = &fullpath[match_start + magic_suffix.len()..];
            while let Some(stripped) = rest.strip_prefix('/') {
                rest = stripped;
            }
            return Some((candidate.to_string(), rest.to_string()));
        }

        search_from = match_start + 1;
        if search_from >= fullpath.len() {
            return None;
        }
    }
}

fn is_regular_file(path: &str) -> bool {
    std::fs::symlink_metadata(path)
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// Composes a synthetic inode from a real inode number and a relative index: `1` for an
/// archive's root pseudo-directory, `index + 2` for a real member, matching the
/// original's `peepfs_compose_ino`.
pub fn compose_ino(base: u64, rel: u64) -> u64 {
    (rel & 0xffff_ffff) | (base << 32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir() -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "peepfs-path-test-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        fs::create_dir_all(&path).unwrap();
        path
    }

    #[test]
    fn splits_at_first_valid_archive_boundary() {
        let dir = temp_dir();
        let archive = dir.join("data.zip");
        fs::write(&archive, b"fake").unwrap();

        let fullpath = format!("{}.peep/inner/readme.txt", archive.display());
        let (archive_path, rel) = split_archive_path(&fullpath, ".peep").unwrap();
        assert_eq!(archive_path, archive.to_string_lossy());
        assert_eq!(rel, "inner/readme.txt");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn skips_suffix_occurrence_with_no_real_file_behind_it() {
        let dir = temp_dir();
        // "data.zip.peep" itself isn't a real file, but the text still contains the
        // magic suffix as a substring of a deeper, genuine archive name.
        let archive = dir.join("data.zip.peep.zip");
        fs::write(&archive, b"fake").unwrap();

        let fullpath = format!("{}.peep/readme.txt", archive.display());
        let (archive_path, rel) = split_archive_path(&fullpath, ".peep").unwrap();
        assert_eq!(archive_path, archive.to_string_lossy());
        assert_eq!(rel, "readme.txt");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn returns_none_when_no_boundary_is_a_real_file() {
        let fullpath = "/nonexistent/data.zip.peep/readme.txt";
        assert!(split_archive_path(fullpath, ".peep").is_none());
    }

    #[test]
    fn ino_composition_matches_documented_formula() {
        assert_eq!(compose_ino(7, 1), (1u64 | (7u64 << 32)));
        assert_eq!(compose_ino(7, 5), (5u64 | (7u64 << 32)));
    }
}
