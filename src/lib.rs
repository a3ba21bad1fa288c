//! DMG builder library for macOS software distribution
//!
//! This library drives the native macOS toolchain to:
//! - Create a writable scratch image from a source directory
//! - Mount, fix permissions on and bless the volume
//! - Convert it to a compressed final format (UDZO, UDBZ, ULFO, ULMO)
//! - Sign, notarize and checksum the result
//!
//! It can be used both as a CLI tool and as a library dependency.

pub mod cli;
pub mod dmg;
pub mod error;

// Re-export commonly used types
pub use error::{CliError, MkdmgError, Result};
