//! On-disk handling of PEM pairs.
//!
//! A certificate and its key are staged as temp files next to their final
//! locations and renamed into place together. If the second rename fails the
//! first one is undone, so a reader never sees a certificate without its key.

use std::fs::{self, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::unistd::{chown, Gid, Group};
use tempfile::NamedTempFile;

use crate::error::{CertError, Result};

/// Owner and group read/write, nothing for others.
pub const MATERIAL_FILE_MODE: u32 = 0o660;

/// Mode and group applied to every written material file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilePolicy {
    pub mode: u32,
    pub group: Option<Gid>,
}

impl FilePolicy {
    /// Look up `group_name` on the host. A missing group leaves files owned by
    /// the process's primary group.
    pub fn for_group(group_name: &str) -> Self {
        let group = match Group::from_name(group_name) {
            Ok(Some(group)) => Some(group.gid),
            Ok(None) => {
                tracing::warn!(group = %group_name, "TLS group does not exist, keeping default group");
                None
            }
            Err(e) => {
                tracing::warn!(group = %group_name, error = %e, "failed to look up TLS group");
                None
            }
        };
        Self {
            mode: MATERIAL_FILE_MODE,
            group,
        }
    }

    pub fn without_group() -> Self {
        Self {
            mode: MATERIAL_FILE_MODE,
            group: None,
        }
    }

    fn apply(&self, path: &Path) -> Result<()> {
        fs::set_permissions(path, Permissions::from_mode(self.mode))
            .map_err(|e| CertError::io(path, e))?;
        if let Some(gid) = self.group {
            chown(path, None, Some(gid)).map_err(|e| CertError::io(path, io::Error::from(e)))?;
        }
        Ok(())
    }
}

/// One half of a pair to be written.
#[derive(Debug, Clone, Copy)]
pub struct PemFile<'a> {
    pub path: &'a Path,
    pub contents: &'a [u8],
}

/// Write both files or neither.
pub fn write_pair(cert: PemFile<'_>, key: PemFile<'_>, policy: &FilePolicy) -> Result<()> {
    let staged_cert = stage(cert, policy)?;
    let staged_key = stage(key, policy)?;

    staged_cert
        .persist(cert.path)
        .map_err(|e| CertError::io(cert.path, e.error))?;

    if let Err(e) = staged_key.persist(key.path) {
        if let Err(rollback) = fs::remove_file(cert.path) {
            tracing::error!(
                path = %cert.path.display(),
                error = %rollback,
                "failed to roll back certificate after key write failure"
            );
        }
        return Err(CertError::io(key.path, e.error));
    }
    Ok(())
}

fn stage(file: PemFile<'_>, policy: &FilePolicy) -> Result<NamedTempFile> {
    let dir = file.path.parent().unwrap_or_else(|| Path::new("."));
    let mut staged = NamedTempFile::new_in(dir).map_err(|e| CertError::io(dir, e))?;
    staged
        .write_all(file.contents)
        .and_then(|_| staged.as_file().sync_all())
        .map_err(|e| CertError::io(staged.path(), e))?;
    policy.apply(staged.path())?;
    Ok(staged)
}

/// Delete both files of a pair. Files that are already gone are not an error.
pub fn remove_pair(cert_path: &Path, key_path: &Path) -> Result<()> {
    let cert_result = remove_if_present(cert_path);
    let key_result = remove_if_present(key_path);
    cert_result.and(key_result)
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CertError::io(path, e)),
    }
}

/// Files in `dir` ending in `.{extension}`, as `(stem, path)` sorted by stem.
/// A missing directory yields an empty list.
pub fn list_with_extension(dir: &Path, extension: &str) -> Result<Vec<(String, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CertError::io(dir, e)),
    };

    let mut found = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| CertError::io(dir, e))?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(extension) || !path.is_file() {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            found.push((stem.to_string(), path.clone()));
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}

pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| CertError::io(dir, e))
}

pub fn read(what: &'static str, name: &str, path: &Path) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CertError::not_found(what, name, path)),
        Err(e) => Err(CertError::io(path, e)),
    }
}
