//! Execution workspaces.
//!
//! Each script execution owns a freshly created temporary directory with
//! owner-only permissions. Declared input files are copied in, the script
//! is written as `temp.zsh`, and the whole directory is removed on every
//! exit path, including panics, via the drop guard.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::{ServiceError, ServiceResult};

/// Name of the script file written into the workspace.
pub const SCRIPT_FILE_NAME: &str = "temp.zsh";

/// Prefix of workspace directory names under the OS temp root.
pub const WORKSPACE_PREFIX: &str = "runbook-exec-";

/// An isolated temporary directory hosting one script execution.
///
/// Disposal is unconditional: dropping an undisposed workspace removes it.
#[derive(Debug)]
pub struct Workspace {
    dir: PathBuf,
    disposed: bool,
}

impl Workspace {
    /// Create a workspace with a high-entropy name and owner-only
    /// permissions under the OS temp root.
    pub fn create() -> ServiceResult<Self> {
        Self::create_in(&std::env::temp_dir())
    }

    /// Create a workspace under a specific root directory.
    pub fn create_in(root: &Path) -> ServiceResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(root)
            .map_err(|e| ServiceError::Internal(format!("failed to create workspace: {e}")))?
            .keep();

        restrict_to_owner(&dir, true)?;
        tracing::debug!(workspace = %dir.display(), "Created workspace");
        Ok(Self { dir, disposed: false })
    }

    /// Path of the workspace directory.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Copy declared input paths into the workspace.
    ///
    /// Each path is resolved against the runbook directory and rejected if
    /// it is missing, escapes that directory (including via symlinks), or
    /// collides with an already-copied basename. Returns the list of
    /// problems; an empty list means every input landed.
    pub fn populate(&self, runbook_dir: &Path, input_paths: &[String]) -> Vec<String> {
        let mut errors = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        let Ok(canonical_dir) = runbook_dir.canonicalize() else {
            return vec![format!(
                "Runbook directory is not accessible: {}",
                runbook_dir.display()
            )];
        };

        for declared in input_paths {
            let source = match runbook_dir.join(declared).canonicalize() {
                Ok(resolved) => resolved,
                Err(_) => {
                    errors.push(format!("Required input file does not exist: {declared}"));
                    continue;
                }
            };
            if !source.starts_with(&canonical_dir) {
                errors.push(format!("Input path escapes the runbook directory: {declared}"));
                continue;
            }

            let Some(basename) = source.file_name().and_then(|n| n.to_str()) else {
                errors.push(format!("Input path has no usable basename: {declared}"));
                continue;
            };
            if !seen.insert(basename.to_string()) {
                errors.push(format!("Input basename collides with an earlier input: {declared}"));
                continue;
            }

            let target = self.dir.join(basename);
            let result = if source.is_dir() {
                copy_dir(&source, &target)
            } else {
                copy_file(&source, &target)
            };
            if let Err(e) = result {
                errors.push(format!("Failed to copy input {declared}: {e}"));
            }
        }
        errors
    }

    /// Write the extracted script as `temp.zsh`, owner-only and executable.
    pub fn write_script(&self, script: &str) -> ServiceResult<PathBuf> {
        let path = self.dir.join(SCRIPT_FILE_NAME);
        fs::write(&path, script)
            .map_err(|e| ServiceError::Internal(format!("failed to write script: {e}")))?;
        restrict_to_owner(&path, true)?;
        Ok(path)
    }

    /// Remove the workspace directory and everything in it.
    ///
    /// Failures are logged but never raised; by this point the execution
    /// outcome is already decided.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => tracing::debug!(workspace = %self.dir.display(), "Disposed workspace"),
            Err(e) => {
                tracing::warn!(workspace = %self.dir.display(), error = %e, "Failed to dispose workspace");
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Copy a single file, clamping its mode to owner-only.
fn copy_file(source: &Path, target: &Path) -> std::io::Result<()> {
    fs::copy(source, target)?;
    clamp_mode(source, target)
}

/// Recursively copy a directory tree, clamping every entry to owner-only.
fn copy_dir(source: &Path, target: &Path) -> std::io::Result<()> {
    fs::create_dir(target)?;
    clamp_mode(source, target)?;

    for entry in walkdir::WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(std::io::Error::other)?;
        let dest = target.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir(&dest)?;
            clamp_mode(entry.path(), &dest)?;
        } else {
            fs::copy(entry.path(), &dest)?;
            clamp_mode(entry.path(), &dest)?;
        }
    }
    Ok(())
}

/// Preserve the source mode on the target, intersected with owner-only bits.
#[cfg(unix)]
fn clamp_mode(source: &Path, target: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mode = fs::metadata(source)?.permissions().mode() & 0o700;
    fs::set_permissions(target, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn clamp_mode(_source: &Path, _target: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Set owner-only permissions, with the execute bit when requested.
#[cfg(unix)]
fn restrict_to_owner(path: &Path, executable: bool) -> ServiceResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let mode = if executable { 0o700 } else { 0o600 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| ServiceError::Internal(format!("failed to set permissions: {e}")))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path, _executable: bool) -> ServiceResult<()> {
    Ok(())
}
