use std::path::{Path, PathBuf};

use clap::Parser;

use crate::error::{classify_io_error, IoErrorHint, PeepfsError, PeepfsResult};

const DEFAULT_MAGIC_SUFFIX: &str = ".peep";
const DEFAULT_CACHE_GRACE_SECS: i64 = 10;
const DEFAULT_MAX_CACHE_ENTRIES: u64 = 1024 * 1024;

/// Transparent archive-browsing passthrough filesystem.
#[derive(Parser, Debug)]
#[command(name = "peepfs", version, about, long_about = None)]
pub struct Cli {
    /// Run in the foreground instead of daemonising.
    #[arg(short = 'f', long = "foreground")]
    pub foreground: bool,

    /// Enable debug logging (implies --foreground).
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// Cache entry grace period, in seconds.
    #[arg(short = 'g', long = "cache_grace", value_name = "SECS")]
    pub cache_grace: Option<i64>,

    /// Maximum number of cache entries.
    #[arg(short = 'n', long = "cache_size", value_name = "N")]
    pub cache_size: Option<u64>,

    /// Archive-view suffix, without its leading dot (e.g. "peep" for ".peep").
    #[arg(short = 'm', long = "magic_suffix", value_name = "NAME")]
    pub magic_suffix: Option<String>,

    /// Directory at which to mount the virtual filesystem.
    pub mountpoint: PathBuf,

    /// Existing directory whose contents are exposed through the mount.
    pub backing_directory: PathBuf,
}

/// Frozen, validated configuration shared by every request for the lifetime of the mount.
#[derive(Debug, Clone)]
pub struct Config {
    pub mountpoint: PathBuf,
    pub backing_root: PathBuf,
    pub magic_suffix: String,
    pub max_cache_entries: u64,
    pub cache_grace_secs: i64,
    pub foreground: bool,
    pub debug: bool,
}

impl Config {
    pub fn from_cli(cli: Cli) -> PeepfsResult<Self> {
        let magic_suffix = match cli.magic_suffix {
            Some(name) => format!(".{name}"),
            None => DEFAULT_MAGIC_SUFFIX.to_string(),
        };
        validate_magic_suffix(&magic_suffix)?;

        let cache_grace_secs = cli.cache_grace.unwrap_or(DEFAULT_CACHE_GRACE_SECS);
        if cache_grace_secs < 0 {
            return Err(PeepfsError::usage("cache_grace must be non-negative"));
        }

        let max_cache_entries = cli.cache_size.unwrap_or(DEFAULT_MAX_CACHE_ENTRIES);
        if max_cache_entries == 0 {
            return Err(PeepfsError::usage("cache_size must be greater than zero"));
        }

        let backing_root = strip_trailing_slashes(&cli.backing_directory);
        let meta = std::fs::symlink_metadata(&backing_root).map_err(|e| {
            let message = format!(
                "backing directory {} is not accessible: {e}",
                backing_root.display()
            );
            match classify_io_error(&e) {
                IoErrorHint::NotFound => PeepfsError::not_found(message),
                IoErrorHint::PermissionDenied => PeepfsError::not_permitted(message),
                _ => PeepfsError::system(message, e.raw_os_error().unwrap_or(libc::EIO)),
            }
        })?;
        if !meta.is_dir() {
            return Err(PeepfsError::not_found(format!(
                "backing directory {} is not a directory",
                backing_root.display()
            )));
        }

        if !cli.mountpoint.is_dir() {
            return Err(PeepfsError::not_found(format!(
                "mountpoint {} is not a directory",
                cli.mountpoint.display()
            )));
        }

        let debug = cli.debug;
        let foreground = cli.foreground || debug;

        Ok(Self {
            mountpoint: cli.mountpoint,
            backing_root,
            magic_suffix,
            max_cache_entries,
            cache_grace_secs,
            foreground,
            debug,
        })
    }
}

fn validate_magic_suffix(suffix: &str) -> PeepfsResult<()> {
    if !suffix.starts_with('.') || suffix.len() < 2 || suffix.contains('/') {
        return Err(PeepfsError::usage(format!(
            "magic suffix '{suffix}' must start with '.' and contain no '/'"
        )));
    }
    Ok(())
}

fn strip_trailing_slashes(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    let trimmed = s.trim_end_matches('/');
    if trimmed.is_empty() {
        PathBuf::from("/")
    } else {
        PathBuf::from(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(mountpoint: PathBuf, backing: PathBuf) -> Cli {
        Cli {
            foreground: false,
            debug: false,
            cache_grace: None,
            cache_size: None,
            magic_suffix: None,
            mountpoint,
            backing_directory: backing,
        }
    }

    #[test]
    fn debug_implies_foreground() {
        let mut args = cli(PathBuf::from("/tmp"), PathBuf::from("/tmp"));
        args.debug = true;
        let cfg = Config::from_cli(args).unwrap();
        assert!(cfg.foreground);
        assert!(cfg.debug);
    }

    #[test]
    fn custom_magic_suffix_gets_dot_prefixed() {
        let mut args = cli(PathBuf::from("/tmp"), PathBuf::from("/tmp"));
        args.magic_suffix = Some("archive".into());
        let cfg = Config::from_cli(args).unwrap();
        assert_eq!(cfg.magic_suffix, ".archive");
    }

    #[test]
    fn trailing_slash_is_stripped_from_backing_directory() {
        let args = cli(PathBuf::from("/tmp"), PathBuf::from("/tmp/"));
        let cfg = Config::from_cli(args).unwrap();
        assert_eq!(cfg.backing_root, PathBuf::from("/tmp"));
    }

    #[test]
    fn nonexistent_backing_directory_is_rejected() {
        let args = cli(
            PathBuf::from("/tmp"),
            PathBuf::from("/nonexistent-peepfs-backing-dir"),
        );
        assert!(Config::from_cli(args).is_err());
    }

    #[test]
    fn default_cache_settings_match_original() {
        let args = cli(PathBuf::from("/tmp"), PathBuf::from("/tmp"));
        let cfg = Config::from_cli(args).unwrap();
        assert_eq!(cfg.magic_suffix, ".peep");
        assert_eq!(cfg.cache_grace_secs, 10);
        assert_eq!(cfg.max_cache_entries, 1024 * 1024);
    }
}
