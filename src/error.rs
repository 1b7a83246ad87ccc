//! Error types for vshark-core.

use std::path::PathBuf;
use std::time::Duration;

use nom::error::{ErrorKind, ParseError};
use thiserror::Error;

/// Umbrella error for library callers that do not care which stage failed.
#[derive(Error, Debug)]
pub enum Error {
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("capture file error: {0}")]
    CaptureFile(#[from] CaptureFileError),

    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    #[error("dissector error: {0}")]
    Dissect(#[from] DissectError),

    #[error("tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("mapping error: {0}")]
    Map(#[from] MapError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while decoding a DNS message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    /// A field declared more bytes than the message holds.
    #[error("message truncated")]
    Truncated,

    /// A compression pointer that does not point strictly backwards.
    #[error("compression pointer at offset {at} targets offset {target}")]
    BadPointer { at: usize, target: usize },

    /// Too many labels or wire bytes in one name.
    #[error("domain name exceeds limits")]
    NameTooLong,

    #[error("label is not valid UTF-8")]
    InvalidLabel,

    #[error("parse error: {0:?}")]
    Nom(ErrorKind),
}

impl<I> ParseError<I> for DnsError {
    fn from_error_kind(_input: I, kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Eof | ErrorKind::Complete => DnsError::Truncated,
            kind => DnsError::Nom(kind),
        }
    }

    fn append(_input: I, _kind: ErrorKind, other: Self) -> Self {
        other
    }
}

/// Errors related to reading or writing capture files.
#[derive(Error, Debug)]
pub enum CaptureFileError {
    #[error("file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid capture format: {reason}")]
    InvalidFormat { reason: String },

    #[error("serialization failed: {reason}")]
    Serialize { reason: String },

    /// A value does not fit its on-disk field.
    #[error("cannot encode {field}: {value} is out of range")]
    OutOfRange { field: &'static str, value: i64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the live capture loop.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("a capture session is already running")]
    AlreadyRunning,

    #[error("capture tool `{tool}` not found")]
    ToolMissing { tool: String },

    #[error("failed to start capture: {0}")]
    Spawn(std::io::Error),

    #[error("capture file error: {0}")]
    File(#[from] CaptureFileError),

    #[error("capture thread panicked")]
    ThreadPanicked,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the external dissector bridge. Each abort path is its own
/// variant so callers can tell a shutdown cancellation from a real failure.
#[derive(Error, Debug)]
pub enum DissectError {
    #[error("`{tool}` not found (is Wireshark installed?)")]
    ToolMissing { tool: String },

    #[error("`{tool}` exited with {code:?}: {stderr}")]
    Exit {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("`{tool}` did not finish within {after:?}")]
    Timeout { tool: String, after: Duration },

    #[error("dissection cancelled")]
    Cancelled,

    #[error("capture file error: {0}")]
    CaptureFile(#[from] CaptureFileError),

    #[error("tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DissectError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DissectError::Cancelled)
    }
}

/// Errors from splitting or parsing dissector JSON.
#[derive(Error, Debug)]
pub enum TreeError {
    #[error("unbalanced JSON: {reason}")]
    Unbalanced { reason: &'static str },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from mapping a normalized tree onto typed records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MapError {
    /// A field declared as single-valued occurred more than once.
    #[error("{record}: field `{field}` occurs {count} times")]
    SchemaViolation {
        record: &'static str,
        field: String,
        count: usize,
    },

    #[error("field `{field}`: cannot read {value:?} as {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: &'static str,
    },

    #[error("field `{field}`: expected {expected}")]
    UnexpectedShape {
        field: String,
        expected: &'static str,
    },
}

/// Errors related to loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
