//! Restoring files from verified tar parts.

use std::fs::File;
use std::path::{Component, Path, PathBuf};

use jdma_types::ArchivePart;
use tar::Archive;
use tracing::{debug, info, warn};

use crate::error::PackError;
use crate::verify_part;

/// Whether `path` is selected by a GET file subset.
///
/// An empty subset selects everything. A subset entry selects the file with
/// that exact relative path and everything below it when it names a directory.
pub fn selects(subset: &[String], path: &str) -> bool {
    subset.is_empty()
        || subset.iter().any(|s| {
            let s = s.trim_end_matches('/');
            path == s || path.strip_prefix(s).is_some_and(|rest| rest.starts_with('/'))
        })
}

/// Restores parts under a target directory.
pub struct Unpacker {
    verify_first: bool,
}

impl Unpacker {
    /// `verify_first` checks every part's checksum before any file is written.
    pub fn new(verify_first: bool) -> Self {
        Self { verify_first }
    }

    /// Hidden directory inside `target` used while a restore is in progress.
    pub fn scratch_dir(target: &Path, tag: &str) -> PathBuf {
        target.join(format!(".jdma-unpack-{tag}"))
    }

    /// Check every part against its recorded checksum.
    pub async fn verify_all(&self, parts: &[(ArchivePart, PathBuf)]) -> Result<(), PackError> {
        let parts = parts.to_vec();
        tokio::task::spawn_blocking(move || verify_all_blocking(&parts)).await?
    }

    /// Extract `parts` under `target`, restricted to `subset` (empty = all).
    ///
    /// Files are first extracted into [`Unpacker::scratch_dir`] and only moved
    /// into place after every part succeeded; on error the scratch directory is
    /// removed and `target` is left as it was. A file that already exists in
    /// `target` is never replaced: the restore fails with
    /// [`PackError::TargetConflict`] before anything is moved. Returns the
    /// restored relative paths in archive order.
    pub async fn unpack(
        &self,
        parts: &[(ArchivePart, PathBuf)],
        target: &Path,
        subset: &[String],
        tag: &str,
    ) -> Result<Vec<String>, PackError> {
        let parts = parts.to_vec();
        let target = target.to_path_buf();
        let subset = subset.to_vec();
        let scratch = Self::scratch_dir(&target, tag);
        let verify_first = self.verify_first;

        let result = tokio::task::spawn_blocking({
            let scratch = scratch.clone();
            move || {
                if verify_first {
                    verify_all_blocking(&parts)?;
                }
                unpack_blocking(&parts, &target, &scratch, &subset)
            }
        })
        .await;

        let result = match result {
            Ok(inner) => inner,
            Err(e) => Err(PackError::from(e)),
        };
        if let Err(e) = &result {
            warn!(scratch = %scratch.display(), error = %e, "unpack failed, discarding scratch");
            let _ = tokio::fs::remove_dir_all(&scratch).await;
        }
        result
    }
}

fn verify_all_blocking(parts: &[(ArchivePart, PathBuf)]) -> Result<(), PackError> {
    for (part, path) in parts {
        verify_part(path, part.index, part.checksum)?;
        debug!(index = part.index, "part checksum ok");
    }
    Ok(())
}

/// Convert an archive member path to a safe relative `/`-separated string.
fn safe_relative(path: &Path) -> Result<String, PackError> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(c) => parts.push(c.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => {
                return Err(PackError::UnsafePath {
                    path: path.display().to_string(),
                });
            }
        }
    }
    if parts.is_empty() {
        return Err(PackError::UnsafePath {
            path: path.display().to_string(),
        });
    }
    Ok(parts.join("/"))
}

fn unpack_blocking(
    parts: &[(ArchivePart, PathBuf)],
    target: &Path,
    scratch: &Path,
    subset: &[String],
) -> Result<Vec<String>, PackError> {
    if scratch.exists() {
        std::fs::remove_dir_all(scratch)?;
    }
    std::fs::create_dir_all(scratch)?;

    let mut restored = Vec::new();
    for (part, path) in parts {
        let mut archive = Archive::new(File::open(path)?);
        for entry in archive.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let rel = safe_relative(&entry.path()?)?;
            if !selects(subset, &rel) {
                continue;
            }
            let dest = scratch.join(&rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            entry.unpack(&dest)?;
            restored.push(rel);
        }
        debug!(index = part.index, "extracted part");
    }

    for rel in &restored {
        check_destination(target, rel)?;
    }
    let mut moved: Vec<&str> = Vec::with_capacity(restored.len());
    for rel in &restored {
        if let Err(e) = move_into_place(&scratch.join(rel), &target.join(rel)) {
            roll_back(target, scratch, &moved);
            return Err(e.into());
        }
        moved.push(rel);
    }
    std::fs::remove_dir_all(scratch)?;

    info!(target = %target.display(), files = restored.len(), "restored files");
    Ok(restored)
}

/// Fail if `rel` already exists under `target`, or if one of its parent
/// components exists as something other than a directory.
fn check_destination(target: &Path, rel: &str) -> Result<(), PackError> {
    let conflict = || PackError::TargetConflict {
        path: rel.to_string(),
    };
    let mut path = target.to_path_buf();
    let mut names = rel.split('/').peekable();
    while let Some(name) = names.next() {
        path.push(name);
        match std::fs::symlink_metadata(&path) {
            Ok(_) if names.peek().is_none() => return Err(conflict()),
            Ok(meta) if !meta.is_dir() => return Err(conflict()),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn move_into_place(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(from, to)
}

/// Move already-placed files back into scratch so the target keeps none of them.
fn roll_back(target: &Path, scratch: &Path, moved: &[&str]) {
    for rel in moved.iter().rev() {
        if let Err(e) = std::fs::rename(target.join(rel), scratch.join(rel)) {
            warn!(path = %target.join(rel).display(), error = %e, "could not roll back restored file");
        }
    }
}
