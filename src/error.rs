use std::fmt;
use std::io;

/// Stable, machine-checkable error identity, independent of the human-readable message.
pub trait ErrorCode: Copy {
    fn as_code_str(&self) -> &'static str;
}

/// Shared accessor surface for this crate's typed errors, mirroring the project's
/// established `*Error` / `*ErrorCode` pairing.
pub trait DomainError {
    fn code_str(&self) -> &'static str;
    fn message(&self) -> &str;
}

/// The taxonomy a request ultimately collapses into before it crosses back to the
/// kernel transport as an errno (or, for `Fatal`, an abort).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeepfsErrorCode {
    NotFound,
    NotPermitted,
    NotSupported,
    Backend,
    System,
    Fatal,
    /// Malformed or out-of-range command-line/config input, rejected before a mount
    /// is ever attempted. Distinct from `NotPermitted`, which is specifically "write
    /// or metadata-change attempted against an archive view" (SPEC_FULL.md §7).
    Usage,
}

impl ErrorCode for PeepfsErrorCode {
    fn as_code_str(&self) -> &'static str {
        match self {
            PeepfsErrorCode::NotFound => "not_found",
            PeepfsErrorCode::NotPermitted => "not_permitted",
            PeepfsErrorCode::NotSupported => "not_supported",
            PeepfsErrorCode::Backend => "backend",
            PeepfsErrorCode::System => "system",
            PeepfsErrorCode::Fatal => "fatal",
            PeepfsErrorCode::Usage => "usage",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeepfsError {
    pub code: PeepfsErrorCode,
    pub message: String,
    /// Negated errno to hand back to the kernel transport, when known.
    pub errno: i32,
}

impl PeepfsError {
    pub fn new(code: PeepfsErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        let errno = errno_for_code(code);
        Self {
            code,
            message,
            errno,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(PeepfsErrorCode::NotFound, message)
    }

    pub fn not_permitted(message: impl Into<String>) -> Self {
        Self::new(PeepfsErrorCode::NotPermitted, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(PeepfsErrorCode::NotSupported, message)
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::new(PeepfsErrorCode::Usage, message)
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::new(PeepfsErrorCode::Backend, message)
    }

    pub fn system(message: impl Into<String>, errno: i32) -> Self {
        Self {
            code: PeepfsErrorCode::System,
            message: message.into(),
            errno,
        }
    }

    /// The errno value to hand the kernel transport, always positive (transport
    /// negates it itself where required).
    pub fn errno(&self) -> i32 {
        self.errno
    }
}

fn errno_for_code(code: PeepfsErrorCode) -> i32 {
    match code {
        PeepfsErrorCode::NotFound => libc::ENOENT,
        PeepfsErrorCode::NotPermitted => libc::EACCES,
        PeepfsErrorCode::NotSupported => libc::ENOTSUP,
        PeepfsErrorCode::Backend => libc::ENOENT,
        PeepfsErrorCode::System => libc::EIO,
        PeepfsErrorCode::Fatal => libc::EIO,
        PeepfsErrorCode::Usage => libc::EINVAL,
    }
}

impl fmt::Display for PeepfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for PeepfsError {}

impl DomainError for PeepfsError {
    fn code_str(&self) -> &'static str {
        self.code.as_code_str()
    }

    fn message(&self) -> &str {
        &self.message
    }
}

impl From<io::Error> for PeepfsError {
    fn from(err: io::Error) -> Self {
        let errno = err.raw_os_error().unwrap_or(libc::EIO);
        let code = match classify_raw_os_error(errno) {
            IoErrorHint::NotFound => PeepfsErrorCode::NotFound,
            IoErrorHint::PermissionDenied => PeepfsErrorCode::NotPermitted,
            _ => PeepfsErrorCode::System,
        };
        Self {
            code,
            message: err.to_string(),
            errno,
        }
    }
}

/// Coarse classification of an `io::Error`/raw errno, reused anywhere a backing
/// system call's failure needs to be routed rather than just displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoErrorHint {
    NotFound,
    PermissionDenied,
    AlreadyExists,
    InvalidInput,
    ReadOnlyFilesystem,
    Other,
}

pub fn classify_io_error(err: &io::Error) -> IoErrorHint {
    match err.raw_os_error() {
        Some(raw) => classify_raw_os_error(raw),
        None => match err.kind() {
            io::ErrorKind::NotFound => IoErrorHint::NotFound,
            io::ErrorKind::PermissionDenied => IoErrorHint::PermissionDenied,
            io::ErrorKind::AlreadyExists => IoErrorHint::AlreadyExists,
            io::ErrorKind::InvalidInput => IoErrorHint::InvalidInput,
            _ => IoErrorHint::Other,
        },
    }
}

pub fn classify_raw_os_error(raw: i32) -> IoErrorHint {
    match raw {
        libc::EPERM | libc::EACCES => IoErrorHint::PermissionDenied,
        libc::ENOENT => IoErrorHint::NotFound,
        libc::EEXIST => IoErrorHint::AlreadyExists,
        libc::EINVAL => IoErrorHint::InvalidInput,
        libc::EROFS => IoErrorHint::ReadOnlyFilesystem,
        _ => IoErrorHint::Other,
    }
}

/// Classifies a free-text message against an ordered table of (code, substrings),
/// first match wins; falls back when nothing matches. Used for archive-library
/// failures, which surface as opaque strings rather than typed errors.
pub fn classify_message_by_patterns<C: Copy>(
    message: &str,
    rules: &[(C, &[&str])],
    fallback: C,
) -> C {
    let lower = message.to_lowercase();
    for (code, patterns) in rules {
        if patterns.iter().any(|p| lower.contains(p)) {
            return *code;
        }
    }
    fallback
}

pub const BACKEND_CLASSIFICATION_RULES: &[(PeepfsErrorCode, &[&str])] = &[
    (
        PeepfsErrorCode::NotFound,
        &["no such file", "not found", "entry not found"],
    ),
    (
        PeepfsErrorCode::NotPermitted,
        &["permission denied", "access denied"],
    ),
];

pub fn classify_backend_message(message: &str) -> PeepfsErrorCode {
    classify_message_by_patterns(message, BACKEND_CLASSIFICATION_RULES, PeepfsErrorCode::Backend)
}

/// Classifies and logs an archive-library failure. The backend interface itself
/// stays a best-effort `Option`/`bool` contract (no errno propagates across it, per
/// SPEC_FULL.md §4.A), but every failure still gets classified and logged rather than
/// silently discarded, per §7's "never silently discard a failure" policy.
pub fn log_backend_failure(op: &str, err: &dyn fmt::Display) {
    let message = err.to_string();
    let code = classify_backend_message(&message);
    tracing::debug!(op, code = code.as_code_str(), error = %message, "archive backend failure");
}

pub type PeepfsResult<T> = Result<T, PeepfsError>;
