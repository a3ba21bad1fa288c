//! Build configuration and validation.
//!
//! [`Config`] is what the user writes, either as a struct literal or as a
//! JSON document. [`Config::validate`] checks it and produces a
//! [`ValidatedConfig`], the only type the runner accepts and the only place
//! the hdiutil option fragments can be derived from.

use std::fmt;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::checksum::ChecksumAlgorithm;
use super::error::{Error, Result};

/// User-supplied build parameters.
///
/// # Example
///
/// ```
/// use mkdmg::dmg::Config;
///
/// let config = Config {
///     source_dir: "build/MyApp".into(),
///     output_path: "dist/MyApp.dmg".into(),
///     ..Default::default()
/// };
/// let validated = config.validate().unwrap();
/// assert_eq!(validated.volume_name(), "MyApp");
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of the mounted volume. Defaults to the output file name without `.dmg`.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub volume_name: String,

    /// Volume size in megabytes. Zero lets hdiutil size the image.
    #[serde(skip_serializing_if = "is_zero_i64")]
    pub volume_size_mb: i64,

    /// Build via makehybrid so sandboxed apps can open the image. Not available with APFS.
    #[serde(skip_serializing_if = "is_false")]
    pub sandbox_safe: bool,

    /// Bless the mounted volume.
    #[serde(skip_serializing_if = "is_false")]
    pub bless: bool,

    /// "HFS+" (default) or "APFS".
    #[serde(skip_serializing_if = "String::is_empty")]
    pub filesystem: String,

    /// Code signing identity. Empty disables signing.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub signing_identity: String,

    /// notarytool keychain profile. Empty disables notarization.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub notarize_credentials: String,

    /// "UDZO" (default), "UDBZ", "ULFO" or "ULMO".
    #[serde(skip_serializing_if = "String::is_empty")]
    pub image_format: String,

    /// 1 = quiet, 2 = verbose, 3 and above = debug.
    #[serde(skip_serializing_if = "is_zero_i32")]
    pub hdiutil_verbosity: i32,

    /// Destination of the final image. Must end in `.dmg`.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output_path: String,

    /// Directory whose contents become the volume contents.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source_dir: String,

    /// Log every command instead of running it.
    #[serde(skip_serializing_if = "is_false")]
    pub simulate: bool,

    /// "SHA256" or "SHA512" to write a checksum file next to the image.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub checksum: String,

    /// Glob patterns matched against base names; matches are left out of the image.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exclude_patterns: Vec<String>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero_i64(n: &i64) -> bool {
    *n == 0
}

fn is_zero_i32(n: &i32) -> bool {
    *n == 0
}

impl Config {
    /// Decodes a config from a JSON document. Unknown fields are ignored.
    pub fn from_json<R: Read>(reader: R) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// Encodes the config as indented JSON followed by a newline.
    ///
    /// A failing writer is [`Error::ConfigWrite`].
    pub fn to_json<W: Write>(&self, mut writer: W) -> Result<()> {
        serde_json::to_writer_pretty(&mut writer, self).map_err(|e| {
            if e.is_io() {
                Error::ConfigWrite(e.into())
            } else {
                Error::ConfigDecode(e)
            }
        })?;
        writer.write_all(b"\n").map_err(Error::ConfigWrite)
    }

    /// Reads a config file.
    ///
    /// A missing or unreadable file is [`Error::ConfigIo`]. Empty or
    /// malformed JSON is [`Error::ConfigDecode`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = clean_path(&path.as_ref().to_string_lossy());
        let file = std::fs::File::open(&path).map_err(|source| Error::ConfigIo {
            path: path.clone(),
            source,
        })?;
        Self::from_json(std::io::BufReader::new(file))
    }

    /// Checks every field and resolves the derived hdiutil options.
    ///
    /// Checks run in a fixed order and the first failure is returned.
    /// Validation does not touch the filesystem, so a source directory that
    /// does not exist is only reported once hdiutil reads it.
    pub fn validate(&self) -> Result<ValidatedConfig> {
        for (field, value) in [
            ("source_dir", &self.source_dir),
            ("output_path", &self.output_path),
            ("volume_name", &self.volume_name),
            ("signing_identity", &self.signing_identity),
            ("notarize_credentials", &self.notarize_credentials),
            ("filesystem", &self.filesystem),
            ("image_format", &self.image_format),
        ] {
            if value.contains('\0') {
                return Err(Error::UnsafeArgument {
                    field,
                    reason: "contains a NUL byte".into(),
                });
            }
        }

        let source_dir = clean_path(&self.source_dir);
        let output_path = clean_path(&self.output_path);
        for (field, path) in [("source_dir", &source_dir), ("output_path", &output_path)] {
            if path.to_string_lossy().starts_with('-') {
                return Err(Error::UnsafeArgument {
                    field,
                    reason: format!("{} would be read as a command-line flag", path.display()),
                });
            }
        }

        if self.source_dir.is_empty() {
            return Err(Error::InvalidSourceDir);
        }

        if self.volume_size_mb < 0 {
            return Err(Error::InvalidVolumeSize(self.volume_size_mb));
        }

        let file_name = output_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !file_name.ends_with(".dmg") {
            return Err(Error::InvalidOutputExtension(self.output_path.clone()));
        }

        let image_format: ImageFormat = self.image_format.parse()?;
        let filesystem: Filesystem = self.filesystem.parse()?;

        if self.sandbox_safe && filesystem == Filesystem::Apfs {
            return Err(Error::SandboxApfsConflict);
        }

        let checksum = if self.checksum.is_empty() {
            None
        } else {
            Some(self.checksum.parse::<ChecksumAlgorithm>()?)
        };

        let volume_name = if self.volume_name.is_empty() {
            file_name.strip_suffix(".dmg").unwrap_or(&file_name).to_string()
        } else {
            self.volume_name.clone()
        };

        Ok(ValidatedConfig {
            source_dir,
            output_path,
            volume_name,
            volume_size_mb: self.volume_size_mb.unsigned_abs(),
            image_format,
            filesystem,
            sandbox_safe: self.sandbox_safe,
            bless: self.bless,
            simulate: self.simulate,
            verbosity: Verbosity::from_level(self.hdiutil_verbosity),
            signing_identity: non_empty(&self.signing_identity),
            notarize_profile: non_empty(&self.notarize_credentials),
            checksum,
            exclude_patterns: self.exclude_patterns.clone(),
        })
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

/// A config that passed [`Config::validate`].
///
/// Paths are lexically cleaned and every enumerated field is resolved, so
/// the option accessors cannot produce a wrong answer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedConfig {
    source_dir: PathBuf,
    output_path: PathBuf,
    volume_name: String,
    volume_size_mb: u64,
    image_format: ImageFormat,
    filesystem: Filesystem,
    sandbox_safe: bool,
    bless: bool,
    simulate: bool,
    verbosity: Verbosity,
    signing_identity: Option<String>,
    notarize_profile: Option<String>,
    checksum: Option<ChecksumAlgorithm>,
    exclude_patterns: Vec<String>,
}

impl ValidatedConfig {
    /// `-fs` options for `hdiutil create`.
    pub fn filesystem_opts(&self) -> Vec<String> {
        self.filesystem.opts()
    }

    /// `-format` options for the final `hdiutil convert`.
    pub fn image_format_opts(&self) -> Vec<String> {
        self.image_format.opts()
    }

    /// `-size` options, empty when hdiutil should size the image.
    pub fn volume_size_opts(&self) -> Vec<String> {
        if self.volume_size_mb > 0 {
            vec!["-size".to_string(), format!("{}m", self.volume_size_mb)]
        } else {
            Vec::new()
        }
    }

    /// Resolved volume name.
    pub fn volume_name(&self) -> &str {
        &self.volume_name
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn image_format(&self) -> ImageFormat {
        self.image_format
    }

    pub fn filesystem(&self) -> Filesystem {
        self.filesystem
    }

    pub fn sandbox_safe(&self) -> bool {
        self.sandbox_safe
    }

    pub fn bless(&self) -> bool {
        self.bless
    }

    pub fn simulate(&self) -> bool {
        self.simulate
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    pub fn signing_identity(&self) -> Option<&str> {
        self.signing_identity.as_deref()
    }

    pub fn notarize_profile(&self) -> Option<&str> {
        self.notarize_profile.as_deref()
    }

    pub fn checksum(&self) -> Option<ChecksumAlgorithm> {
        self.checksum
    }

    pub fn exclude_patterns(&self) -> &[String] {
        &self.exclude_patterns
    }
}

/// Final image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageFormat {
    /// zlib compressed
    #[default]
    Udzo,
    /// bzip2 compressed
    Udbz,
    /// lzfse compressed
    Ulfo,
    /// lzma compressed
    Ulmo,
}

impl ImageFormat {
    pub fn name(self) -> &'static str {
        match self {
            ImageFormat::Udzo => "UDZO",
            ImageFormat::Udbz => "UDBZ",
            ImageFormat::Ulfo => "ULFO",
            ImageFormat::Ulmo => "ULMO",
        }
    }

    fn opts(self) -> Vec<String> {
        let opts: &[&str] = match self {
            ImageFormat::Udzo => &["-format", "UDZO", "-imagekey", "zlib-level=9"],
            ImageFormat::Udbz => &["-format", "UDBZ", "-imagekey", "bzip2-level=9"],
            ImageFormat::Ulfo => &["-format", "ULFO"],
            ImageFormat::Ulmo => &["-format", "ULMO"],
        };
        opts.iter().map(|s| s.to_string()).collect()
    }
}

impl FromStr for ImageFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "" | "UDZO" => Ok(ImageFormat::Udzo),
            "UDBZ" => Ok(ImageFormat::Udbz),
            "ULFO" => Ok(ImageFormat::Ulfo),
            "ULMO" => Ok(ImageFormat::Ulmo),
            _ => Err(Error::InvalidImageFormat(s.to_string())),
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Filesystem of the volume inside the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Filesystem {
    #[default]
    HfsPlus,
    Apfs,
}

impl Filesystem {
    pub fn name(self) -> &'static str {
        match self {
            Filesystem::HfsPlus => "HFS+",
            Filesystem::Apfs => "APFS",
        }
    }

    fn opts(self) -> Vec<String> {
        let opts: &[&str] = match self {
            Filesystem::HfsPlus => &["-fs", "HFS+", "-fsargs", "-c c=64,a=16,e=16"],
            Filesystem::Apfs => &["-fs", "APFS"],
        };
        opts.iter().map(|s| s.to_string()).collect()
    }
}

impl FromStr for Filesystem {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "" | "HFS+" => Ok(Filesystem::HfsPlus),
            "APFS" => Ok(Filesystem::Apfs),
            _ => Err(Error::InvalidFilesystem(s.to_string())),
        }
    }
}

impl fmt::Display for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// hdiutil output level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    #[default]
    Default,
    Quiet,
    Verbose,
    Debug,
}

impl Verbosity {
    /// Maps the numeric config level: ≤0 default, 1 quiet, 2 verbose, ≥3 debug.
    pub fn from_level(level: i32) -> Self {
        match level {
            i32::MIN..=0 => Verbosity::Default,
            1 => Verbosity::Quiet,
            2 => Verbosity::Verbose,
            _ => Verbosity::Debug,
        }
    }

    pub fn flag(self) -> Option<&'static str> {
        match self {
            Verbosity::Default => None,
            Verbosity::Quiet => Some("-quiet"),
            Verbosity::Verbose => Some("-verbose"),
            Verbosity::Debug => Some("-debug"),
        }
    }

    /// Adds the flag to an hdiutil argument list.
    ///
    /// `create`, `makehybrid` and `convert` take the flag after the
    /// subcommand. Every other subcommand takes it before.
    pub fn apply(self, mut args: Vec<String>) -> Vec<String> {
        let Some(flag) = self.flag() else {
            return args;
        };
        let Some(verb) = args.first() else {
            return args;
        };
        let at = match verb.as_str() {
            "create" | "makehybrid" | "convert" => 1,
            _ => 0,
        };
        args.insert(at, flag.to_string());
        args
    }
}

/// Lexically normalizes a path: repeated separators and `.` elements are
/// dropped, `..` removes the preceding element where one exists, and an
/// empty result becomes `.`.
pub fn clean_path(path: &str) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }

    if out.is_empty() {
        return PathBuf::from(".");
    }
    out.iter().collect()
}
