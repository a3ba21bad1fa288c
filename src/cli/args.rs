//! Command line argument parsing.
//!
//! Flags map one-to-one onto [`Config`] fields and override whatever a
//! `--config` file provides.

use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::dmg::Config;

/// Build macOS DMG disk images
#[derive(Parser, Debug, Default)]
#[command(
    name = "mkdmg",
    version,
    about = "Build macOS DMG disk images",
    long_about = "Creates a compressed DMG from a source directory using hdiutil, then optionally
signs it with codesign, notarizes it with notarytool and writes a checksum file.

Usage:
  mkdmg build/MyApp dist/MyApp.dmg
  mkdmg --config dmg.json --sign \"Developer ID Application: Example (TEAMID)\"
  mkdmg --simulate -x .DS_Store -x '*.log' build/MyApp MyApp.dmg

Exit code 0 = image guaranteed to exist at the output path."
)]
pub struct Args {
    /// Directory whose contents become the volume contents
    #[arg(value_name = "SOURCE_DIR")]
    pub source_dir: Option<String>,

    /// Output image path (must end in .dmg)
    #[arg(value_name = "OUTPUT")]
    pub output_path: Option<String>,

    /// JSON config file; command line flags override its values
    #[arg(short, long, value_name = "FILE", env = "MKDMG_CONFIG")]
    pub config: Option<PathBuf>,

    /// Volume name (default: output file name without .dmg)
    #[arg(long, value_name = "NAME")]
    pub volume_name: Option<String>,

    /// Volume size in megabytes (default: computed by hdiutil)
    #[arg(long, value_name = "MB", allow_negative_numbers = true)]
    pub volume_size: Option<i64>,

    /// Final image format: UDZO, UDBZ, ULFO or ULMO
    #[arg(long, value_name = "FORMAT")]
    pub format: Option<String>,

    /// Volume filesystem: HFS+ or APFS
    #[arg(long, value_name = "FS")]
    pub filesystem: Option<String>,

    /// Build an image that sandboxed apps can open (HFS+ only)
    #[arg(long)]
    pub sandbox_safe: bool,

    /// Bless the volume
    #[arg(long)]
    pub bless: bool,

    /// Code signing identity
    #[arg(long, value_name = "IDENTITY")]
    pub sign: Option<String>,

    /// notarytool keychain profile used to notarize the image
    #[arg(long, value_name = "PROFILE")]
    pub notarize: Option<String>,

    /// Write a checksum file next to the image: SHA256 or SHA512
    #[arg(long, value_name = "ALGORITHM")]
    pub checksum: Option<String>,

    /// Leave out files and directories whose name matches PATTERN (repeatable)
    #[arg(short = 'x', long = "exclude", value_name = "PATTERN")]
    pub exclude: Vec<String>,

    /// Log the commands instead of running them
    #[arg(short = 'n', long)]
    pub simulate: bool,

    /// Increase hdiutil verbosity (-v quiet, -vv verbose, -vvv debug)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Kill any external command that runs longer than SECS
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Print the merged configuration as JSON and exit
    #[arg(long)]
    pub dump_config: bool,
}

impl Args {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Applies the flags on top of `base`.
    pub fn merge_into(&self, mut base: Config) -> Config {
        fn set(field: &mut String, value: &Option<String>) {
            if let Some(value) = value {
                field.clone_from(value);
            }
        }

        set(&mut base.source_dir, &self.source_dir);
        set(&mut base.output_path, &self.output_path);
        set(&mut base.volume_name, &self.volume_name);
        set(&mut base.image_format, &self.format);
        set(&mut base.filesystem, &self.filesystem);
        set(&mut base.signing_identity, &self.sign);
        set(&mut base.notarize_credentials, &self.notarize);
        set(&mut base.checksum, &self.checksum);

        if let Some(size) = self.volume_size {
            base.volume_size_mb = size;
        }
        if self.verbose > 0 {
            base.hdiutil_verbosity = i32::from(self.verbose);
        }
        base.sandbox_safe |= self.sandbox_safe;
        base.bless |= self.bless;
        base.simulate |= self.simulate;
        base.exclude_patterns.extend(self.exclude.iter().cloned());
        base
    }
}
