//! macOS DMG builder.
//!
//! Wraps the native `hdiutil`, `codesign` and `xcrun notarytool` toolchain
//! to produce compressed, optionally signed and notarized disk images from a
//! source directory.
//!
//! # Architecture
//!
//! This module is organized into logical submodules:
//! - `config` - User configuration, validation and hdiutil option derivation
//! - `executor` - The allow-listed external tools and how they are launched
//! - `runner` - Build lifecycle (create, mount, bless, convert, sign, notarize)
//! - `staging` - Filtered copy of the source tree for exclusion patterns
//! - `checksum` - SHA-256/SHA-512 sidecar files

mod checksum;
mod config;
mod error;
mod executor;
mod runner;
mod staging;

pub use checksum::ChecksumAlgorithm;
pub use config::{Config, Filesystem, ImageFormat, ValidatedConfig, Verbosity, clean_path};
pub use error::{Error, Result};
pub use executor::{CommandExecutor, ExecError, Invocation, RecordingExecutor, SystemExecutor, Tool};
pub use runner::{Runner, State};
