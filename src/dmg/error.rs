//! Error types for DMG build operations.
//!
//! Every failure a build can hit maps to exactly one variant so callers can
//! match on the kind instead of parsing messages.

use std::path::PathBuf;
use thiserror::Error;

use super::executor::ExecError;

/// Result type alias for DMG operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while validating a config or driving a build.
#[derive(Error, Debug)]
pub enum Error {
    /// A field contains a NUL byte or would be parsed as a command-line flag
    #[error("unsafe argument in {field}: {reason}")]
    UnsafeArgument {
        /// Config field that was rejected
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },

    #[error("invalid source directory")]
    InvalidSourceDir,

    #[error("volume size must be >= 0, got {0}")]
    InvalidVolumeSize(i64),

    #[error("output file must have a .dmg extension: {0:?}")]
    InvalidOutputExtension(String),

    #[error("invalid image format: {0:?}")]
    InvalidImageFormat(String),

    #[error("invalid image filesystem: {0:?}")]
    InvalidFilesystem(String),

    #[error("creating an APFS disk image that is sandbox safe is not supported")]
    SandboxApfsConflict,

    #[error("invalid checksum algorithm {0:?}, supported: SHA256, SHA512")]
    InvalidChecksumAlgorithm(String),

    /// The private working directory could not be created
    #[error("couldn't create directory: {0}")]
    CreateDir(#[source] std::io::Error),

    /// A lifecycle method was called before `setup()` or out of order
    #[error("runner not properly initialized, call setup() first")]
    NotInitialized,

    #[error("couldn't attach disk image: {0}")]
    Mount(String),

    #[error("chmod failed: {0}")]
    Chmod(#[source] ExecError),

    #[error("codesign failed: {0}")]
    Codesign(String),

    #[error("notarization failed: {0}")]
    Notarize(String),

    #[error("failed to generate checksum: {0}")]
    Checksum(String),

    #[error("failed to copy files with exclusions: {0}")]
    ExcludeCopy(String),

    /// Any other external tool failure (create, convert, detach, bless)
    #[error(transparent)]
    Command(#[from] ExecError),

    /// The config file could not be read
    #[error("couldn't read config {}: {source}", path.display())]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config could not be written out
    #[error("couldn't write config: {0}")]
    ConfigWrite(#[source] std::io::Error),

    /// The config file is not a valid JSON config document
    #[error("couldn't decode config: {0}")]
    ConfigDecode(#[from] serde_json::Error),
}

impl Error {
    /// Returns true for errors raised by config validation.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::UnsafeArgument { .. }
                | Error::InvalidSourceDir
                | Error::InvalidVolumeSize(_)
                | Error::InvalidOutputExtension(_)
                | Error::InvalidImageFormat(_)
                | Error::InvalidFilesystem(_)
                | Error::SandboxApfsConflict
                | Error::InvalidChecksumAlgorithm(_)
        )
    }
}
