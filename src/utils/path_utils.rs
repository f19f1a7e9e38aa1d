use crate::error::AppError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Resolves `target` against the logical directory `current`, the way `cd` does.
///
/// Absolute targets replace `current`, `..` pops one segment (never above `/`),
/// `.` is ignored, and an empty target or `~` means `home`. Always returns an
/// absolute, `/`-separated path without a trailing slash.
pub fn resolve_logical_path(current: &str, target: &str, home: &str) -> String {
    let target = target.trim();
    let (base, rest) = if target.is_empty() || target == "~" {
        (home, "")
    } else if let Some(after_home) = target.strip_prefix("~/") {
        (home, after_home)
    } else if target.starts_with('/') {
        ("/", target)
    } else {
        (current, target)
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in base.split('/').chain(rest.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            normal => segments.push(normal),
        }
    }
    format!("/{}", segments.join("/"))
}

/// Maps a logical sandbox path onto the host directory backing the sandbox.
///
/// Relative paths are taken from `workdir`. The logical path is normalized
/// before joining, so `..` can never climb out of `root`.
pub fn sandbox_host_path(root: &Path, workdir: &str, logical: &str) -> Result<PathBuf, AppError> {
    if logical.contains('\0') {
        return Err(AppError::InvalidPath(format!(
            "Path contains a NUL byte: {:?}",
            logical
        )));
    }
    let resolved = resolve_logical_path(workdir, logical, workdir);
    let host_path = root.join(resolved.trim_start_matches('/'));
    debug!(logical = %logical, host_path = %host_path.display(), "Mapped sandbox path");
    Ok(host_path)
}

/// Canonicalizes the sandbox root, creating it first when missing.
pub fn prepare_root(root: &Path) -> Result<PathBuf, AppError> {
    std::fs::create_dir_all(root)?;
    // dunce keeps Windows paths free of the \\?\ prefix.
    Ok(dunce::canonicalize(root)?)
}
