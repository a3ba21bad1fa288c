//! Checksum sidecar generation for the final image.
//!
//! The sidecar holds one line in the `sha256sum`/`sha512sum` format,
//! `"<hex digest>  <file name>\n"`, written next to the DMG as
//! `<image>.sha256` or `<image>.sha512`.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use sha2::{Digest, Sha256, Sha512};
use tokio::io::AsyncReadExt;

use super::error::{Error, Result};

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    /// Sidecar extension, including the leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => ".sha256",
            ChecksumAlgorithm::Sha512 => ".sha512",
        }
    }

    /// Path of the sidecar written for `image`.
    pub fn sidecar_path(self, image: &Path) -> PathBuf {
        let mut path = OsString::from(image.as_os_str());
        path.push(self.extension());
        PathBuf::from(path)
    }

    /// Streams `path` through the digest and returns the lowercase hex string.
    pub async fn digest_file(self, path: &Path) -> Result<String> {
        match self {
            ChecksumAlgorithm::Sha256 => stream_digest::<Sha256>(path).await,
            ChecksumAlgorithm::Sha512 => stream_digest::<Sha512>(path).await,
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = Error;

    /// Case-insensitive; anything but SHA256/SHA512 is rejected.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SHA256" => Ok(ChecksumAlgorithm::Sha256),
            "SHA512" => Ok(ChecksumAlgorithm::Sha512),
            _ => Err(Error::InvalidChecksumAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumAlgorithm::Sha256 => f.write_str("SHA256"),
            ChecksumAlgorithm::Sha512 => f.write_str("SHA512"),
        }
    }
}

async fn stream_digest<D: Digest>(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::Checksum(format!("opening {}: {}", path.display(), e)))?;
    let mut hasher = D::new();
    let mut buffer = vec![0u8; 8192];

    loop {
        let n = file
            .read(&mut buffer)
            .await
            .map_err(|e| Error::Checksum(format!("reading {}: {}", path.display(), e)))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hashes `image` and writes its sidecar file, returning the sidecar path.
pub async fn write_sidecar(algorithm: ChecksumAlgorithm, image: &Path) -> Result<PathBuf> {
    let digest = algorithm.digest_file(image).await?;
    let basename = image
        .file_name()
        .ok_or_else(|| Error::Checksum(format!("{} has no file name", image.display())))?
        .to_string_lossy();
    let line = format!("{digest}  {basename}\n");

    let sidecar = algorithm.sidecar_path(image);
    tokio::fs::write(&sidecar, line)
        .await
        .map_err(|e| Error::Checksum(format!("writing {}: {}", sidecar.display(), e)))?;

    log::info!("✓ {} checksum written to {}", algorithm, sidecar.display());
    Ok(sidecar)
}
