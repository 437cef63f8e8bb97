//! Symlink-resolved path confinement.
//!
//! Tool arguments that name filesystem paths are confined to a configured
//! allowlist. Resolution is component-wise so that symlinks anywhere in the
//! path (including broken links, chains, and links to links) cannot escape:
//! every component that exists as a symlink is replaced by its target
//! before the prefix check, and non-existent tails are resolved relative to
//! their nearest existing ancestor.

use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Symlink hops tolerated before resolution gives up (loop protection).
const MAX_SYMLINK_HOPS: usize = 40;

/// Resolve every symlink in `path`, tolerating non-existent components.
///
/// Unlike `fs::canonicalize`, this succeeds for paths whose tail does not
/// exist yet (a file about to be written) and for broken symlinks, both of
/// which must still be confined.
///
/// # Errors
///
/// Returns [`Error::PolicyDenied`] when a symlink chain exceeds the hop cap
/// and [`Error::Internal`] when a link target cannot be read.
pub fn resolve_symlinks(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| Error::internal(format!("cannot resolve cwd: {e}")))?
            .join(path)
    };

    // Components pending resolution, in order. Symlink targets are spliced
    // back onto the front so chains resolve before later components.
    let mut pending: Vec<OsString> = Vec::new();
    push_components(&absolute, &mut pending);

    let mut resolved = PathBuf::from("/");
    let mut hops = 0usize;

    while !pending.is_empty() {
        let component = pending.remove(0);
        if component == OsString::from(".") {
            continue;
        }
        if component == OsString::from("..") {
            resolved.pop();
            continue;
        }

        let candidate = resolved.join(&component);
        match fs::symlink_metadata(&candidate) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(Error::policy_denied(
                        candidate.display().to_string(),
                        "symlink chain too deep",
                    ));
                }
                let target = fs::read_link(&candidate)
                    .map_err(|e| Error::internal(format!("cannot read symlink: {e}")))?;
                if target.is_absolute() {
                    resolved = PathBuf::from("/");
                }
                // Splice the target's components ahead of the remainder.
                let mut spliced = Vec::new();
                push_components(&target, &mut spliced);
                spliced.append(&mut pending);
                pending = spliced;
            }
            // Regular file/dir, or a component that does not exist yet:
            // either way it cannot redirect resolution.
            _ => resolved = candidate,
        }
    }

    Ok(resolved)
}

fn push_components(path: &Path, out: &mut Vec<OsString>) {
    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => {}
            Component::CurDir => out.push(OsString::from(".")),
            Component::ParentDir => out.push(OsString::from("..")),
            Component::Normal(name) => out.push(name.to_os_string()),
        }
    }
}

/// Whether `path`, after full symlink resolution, lives under one of the
/// `allowed` roots. Fails closed: any resolution error is a denial.
#[must_use]
pub fn is_path_allowed(path: &Path, allowed: &[PathBuf]) -> bool {
    let Ok(resolved) = resolve_symlinks(path) else {
        return false;
    };
    allowed.iter().any(|root| {
        let root = resolve_symlinks(root).unwrap_or_else(|_| root.clone());
        resolved.starts_with(&root)
    })
}
