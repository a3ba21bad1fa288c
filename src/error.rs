//! Top-level error types for the mkdmg binary.
//!
//! This module defines all error types with actionable error messages and recovery suggestions.

use thiserror::Error;

use crate::dmg;

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, MkdmgError>;

/// Main error type for all mkdmg operations
#[derive(Error, Debug)]
pub enum MkdmgError {
    /// CLI argument errors
    #[error("CLI error: {0}")]
    Cli(#[from] CliError),

    /// DMG build errors
    #[error("{0}")]
    Dmg(#[from] dmg::Error),
}

/// CLI-specific errors
#[derive(Error, Debug)]
pub enum CliError {
    /// Missing required argument
    #[error("Missing required argument: {argument}")]
    MissingArgument {
        /// Argument name
        argument: String,
    },

    /// A build stage failed
    #[error("{stage} failed: {source}")]
    StageFailed {
        /// Lifecycle stage that failed
        stage: &'static str,
        /// Underlying build error
        #[source]
        source: dmg::Error,
    },
}

impl MkdmgError {
    /// The underlying build error, if any.
    pub fn dmg_error(&self) -> Option<&dmg::Error> {
        match self {
            MkdmgError::Dmg(e) | MkdmgError::Cli(CliError::StageFailed { source: e, .. }) => Some(e),
            _ => None,
        }
    }

    /// Get actionable recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<String> {
        use dmg::Error as E;

        if let MkdmgError::Cli(CliError::MissingArgument { .. }) = self {
            return vec!["Pass SOURCE_DIR and OUTPUT, or provide them in a --config file".to_string()];
        }

        let tips: &[&str] = match self.dmg_error() {
            Some(E::InvalidOutputExtension(_)) => &["The output path must end in a lowercase .dmg extension"],
            Some(E::SandboxApfsConflict) => {
                &["Use --filesystem HFS+ with --sandbox-safe, or drop --sandbox-safe"]
            }
            Some(E::InvalidImageFormat(_)) => &["Supported formats: UDZO, UDBZ, ULFO, ULMO"],
            Some(E::InvalidFilesystem(_)) => &["Supported filesystems: HFS+, APFS"],
            Some(E::Mount(_)) => &[
                "Check that no other volume with the same name is mounted",
                "Run `hdiutil info` to list attached images",
            ],
            Some(E::Codesign(_)) => {
                &["Run `security find-identity -v -p codesigning` to list valid identities"]
            }
            Some(E::Notarize(_)) => &[
                "Verify the keychain profile with `xcrun notarytool history --keychain-profile <name>`",
            ],
            Some(E::Command(dmg::ExecError::NotFound { .. })) => {
                &["mkdmg needs the macOS command line tools; use --simulate elsewhere"]
            }
            Some(E::ConfigWrite(_)) => &["Check that standard output is writable"],
            Some(E::ConfigIo { .. } | E::ConfigDecode(_)) => {
                &["Check the --config path and that the file is a JSON object"]
            }
            _ => &["Check the error message above for specific details"],
        };
        tips.iter().map(|s| s.to_string()).collect()
    }

    /// Check if this error is recoverable by changing the configuration
    pub fn is_recoverable(&self) -> bool {
        match self {
            MkdmgError::Cli(CliError::MissingArgument { .. }) => true,
            _ => self.dmg_error().is_some_and(dmg::Error::is_validation),
        }
    }
}
