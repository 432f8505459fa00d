mod archive;
mod cache;
mod config;
mod error;
mod fs;

use std::io::Write;

use clap::Parser;
use config::{Cli, Config};
use error::DomainError;
use fs::PeepFs;

const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB

struct LocalTimestamp;

impl tracing_subscriber::fmt::time::FormatTime for LocalTimestamp {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f%:z")
        )
    }
}

struct SizeLimitedWriter {
    file: std::fs::File,
    path: std::path::PathBuf,
    max_bytes: u64,
}

impl SizeLimitedWriter {
    fn new(path: std::path::PathBuf, max_bytes: u64) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            file,
            path,
            max_bytes,
        })
    }

    fn rotate_if_needed(&mut self) {
        if let Ok(meta) = self.file.metadata() {
            if meta.len() < self.max_bytes {
                return;
            }
        }
        let _ = self.file.flush();
        let rotated = self.path.with_extension("log.1");
        let _ = std::fs::remove_file(&rotated);
        let _ = std::fs::rename(&self.path, &rotated);
        if let Ok(new_file) = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .open(&self.path)
        {
            self.file = new_file;
        }
    }
}

impl std::io::Write for SizeLimitedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.rotate_if_needed();
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

/// In the foreground, logs go to stderr so the operator sees them directly. Daemonised,
/// they go to a size-rotated file under the data directory, the same shape the original
/// tool's `-f`/syslog split served.
fn init_logging(foreground: bool, debug: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_filter = if debug { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    if foreground {
        tracing_subscriber::fmt()
            .with_timer(LocalTimestamp)
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
        return None;
    }

    let base = dirs_next::data_dir().unwrap_or_else(std::env::temp_dir);
    let log_dir = base.join("peepfs").join("logs");
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("failed to create log dir {log_dir:?}: {e}");
        return None;
    }
    let writer = match SizeLimitedWriter::new(log_dir.join("peepfs.log"), MAX_LOG_BYTES) {
        Ok(w) => w,
        Err(e) => {
            eprintln!("failed to open log file: {e}");
            return None;
        }
    };
    let (non_blocking, guard) =
        tracing_appender::non_blocking::NonBlockingBuilder::default().finish(writer);
    let subscriber = tracing_subscriber::fmt()
        .with_timer(LocalTimestamp)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_writer(non_blocking);
    if let Err(e) = subscriber.try_init() {
        eprintln!("failed to init tracing subscriber: {e}");
    }
    Some(guard)
}

fn main() {
    let cli = Cli::parse();
    let foreground = cli.foreground || cli.debug;
    let debug = cli.debug;
    let _guard = init_logging(foreground, debug);

    let config = match Config::from_cli(cli) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(code = e.code_str(), error = e.message(), "invalid configuration");
            eprintln!("peepfs: {}", e.message());
            std::process::exit(1);
        }
    };

    tracing::info!(
        mountpoint = %config.mountpoint.display(),
        backing = %config.backing_root.display(),
        magic_suffix = %config.magic_suffix,
        "mounting"
    );

    let filesystem = PeepFs::new(
        config.backing_root.clone(),
        config.magic_suffix.clone(),
        config.max_cache_entries,
        config.cache_grace_secs,
    );

    let mount_options = vec![
        fuser::MountOption::FSName("peepfs".to_string()),
        fuser::MountOption::DefaultPermissions,
    ];

    if let Err(e) = fuser::mount2(filesystem, &config.mountpoint, &mount_options) {
        tracing::error!(error = %e, "mount failed");
        eprintln!("peepfs: mount failed: {e}");
        std::process::exit(1);
    }
}
