//! Staging copy of the source tree with exclusion patterns applied.
//!
//! When exclusions are configured, hdiutil is pointed at a filtered copy of
//! the source directory instead of the original. Patterns are matched against
//! each entry's base name, and a matching directory prunes its whole subtree.

use std::io;
use std::path::{Component, Path, PathBuf};

use glob::Pattern;

use super::error::{Error, Result};

/// Makes a symbolic link to a directory.
#[cfg(unix)]
fn symlink_dir(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

/// Makes a symbolic link to a directory.
#[cfg(windows)]
fn symlink_dir(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(src, dst)
}

/// Makes a symbolic link to a file.
#[cfg(unix)]
fn symlink_file(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

/// Makes a symbolic link to a file.
#[cfg(windows)]
fn symlink_file(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(src, dst)
}

/// Compiles the exclusion globs, rejecting malformed ones up front.
pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|e| Error::ExcludeCopy(format!("bad exclude pattern {p:?}: {e}")))
        })
        .collect()
}

fn is_excluded(patterns: &[Pattern], name: &str) -> bool {
    patterns.iter().any(|p| p.matches(name))
}

/// Joins `rel` onto `root`, refusing anything that would land outside `root`.
fn contained_join(root: &Path, rel: &Path) -> Result<PathBuf> {
    let escapes = rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(Error::ExcludeCopy(format!(
            "path traversal detected: {} escapes destination {}",
            rel.display(),
            root.display()
        )));
    }
    Ok(root.join(rel))
}

/// Copies `from` into `to`, skipping every entry whose base name matches one
/// of `patterns`.
///
/// Symlinks are recreated rather than followed. The destination root is
/// always created, even when everything is excluded.
pub async fn copy_with_exclusions(from: &Path, to: &Path, patterns: &[String]) -> Result<()> {
    let patterns = compile_patterns(patterns)?;

    if !from.is_dir() {
        return Err(Error::ExcludeCopy(format!("{from:?} is not a directory")));
    }

    let from = from.to_path_buf();
    let to = to.to_path_buf();

    tokio::task::spawn_blocking(move || copy_tree(&from, &to, &patterns))
        .await
        .map_err(|e| Error::ExcludeCopy(format!("staging copy task panicked: {e}")))?
}

fn copy_tree(from: &Path, to: &Path, patterns: &[Pattern]) -> Result<()> {
    let io_err = |path: &Path, e: io::Error| Error::ExcludeCopy(format!("{}: {}", path.display(), e));

    std::fs::create_dir_all(to).map_err(|e| io_err(to, e))?;

    let walker = walkdir::WalkDir::new(from)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            let excluded = is_excluded(patterns, &entry.file_name().to_string_lossy());
            if excluded {
                log::debug!("Excluding {}", entry.path().display());
            }
            !excluded
        });

    for entry in walker {
        let entry = entry.map_err(|e| Error::ExcludeCopy(e.to_string()))?;
        let rel_path = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| Error::ExcludeCopy(e.to_string()))?;
        let dest_path = contained_join(to, rel_path)?;

        if entry.file_type().is_symlink() {
            let target = std::fs::read_link(entry.path()).map_err(|e| io_err(entry.path(), e))?;
            let linked = if entry.path().is_dir() {
                symlink_dir(&target, &dest_path)
            } else {
                symlink_file(&target, &dest_path)
            };
            linked.map_err(|e| io_err(&dest_path, e))?;
        } else if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest_path).map_err(|e| io_err(&dest_path, e))?;
        } else {
            std::fs::copy(entry.path(), &dest_path).map_err(|e| io_err(&dest_path, e))?;
        }
    }

    Ok(())
}
