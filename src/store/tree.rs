//! Whole-directory copy and swap.
//!
//! The host's state is opaque to us, so capture and restore are plain
//! recursive copies. Restore prefers copy-aside then rename so the live
//! directory is never half written; it only falls back to overwriting in
//! place when the rename is refused.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Recursively copy `src` into `dest`, creating `dest` if needed.
/// Symlinks are recreated, not followed.
pub fn copy_tree(src: &Path, dest: &Path) -> io::Result<u64> {
    let meta = fs::metadata(src)?;
    if !meta.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a directory", src.display()),
        ));
    }

    fs::create_dir_all(dest)?;
    let mut copied = 0u64;

    for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            copied = copied.saturating_add(fs::copy(entry.path(), &target)?);
        }
    }

    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(src: &Path, target: &Path) -> io::Result<()> {
    let link = fs::read_link(src)?;
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, target: &Path) -> io::Result<()> {
    // windows symlinks need privileges; copy what the link points at
    if fs::metadata(src)?.is_dir() {
        copy_tree(src, target).map(drop)
    } else {
        fs::copy(src, target).map(drop)
    }
}

/// Remove a directory tree, treating an already-missing one as removed.
pub fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Sibling path next to `path` with a suffix on its final component.
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.{suffix}"))
}

/// How a directory replacement was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceMode {
    /// copy beside, then rename over: the target was never partially written
    Swapped,
    /// rename refused, contents cleared and copied in place
    InPlace,
}

/// Make `dest` a copy of `src`.
///
/// A failure while copying into the staging sibling leaves `dest` untouched.
/// Only the in-place fallback can leave `dest` partially overwritten.
pub fn replace_with_copy(src: &Path, dest: &Path) -> io::Result<ReplaceMode> {
    let incoming = sibling(dest, "idswap-incoming");
    let outgoing = sibling(dest, "idswap-outgoing");
    remove_tree(&incoming)?;
    remove_tree(&outgoing)?;

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    if let Err(e) = copy_tree(src, &incoming) {
        let _ = remove_tree(&incoming);
        return Err(e);
    }

    if dest.exists() {
        if let Err(e) = fs::rename(dest, &outgoing) {
            tracing::warn!(
                dest = %dest.display(),
                error = %e,
                "rename swap unavailable, overwriting in place"
            );
            remove_tree(&incoming)?;
            overwrite_in_place(src, dest)?;
            return Ok(ReplaceMode::InPlace);
        }
    }

    if let Err(e) = fs::rename(&incoming, dest) {
        // put the original back where it was
        if outgoing.exists() {
            let _ = fs::rename(&outgoing, dest);
        }
        let _ = remove_tree(&incoming);
        return Err(e);
    }

    if let Err(e) = remove_tree(&outgoing) {
        tracing::warn!(path = %outgoing.display(), error = %e, "failed to remove replaced state");
    }

    Ok(ReplaceMode::Swapped)
}

fn overwrite_in_place(src: &Path, dest: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dest)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    copy_tree(src, dest).map(drop)
}

/// True when the directory exists and holds at least one entry.
pub fn has_content(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}
