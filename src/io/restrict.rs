//! Restricted path resolution
//!
//! Resolves a guest path one component at a time below a sandbox root,
//! refusing anything that would leave it. The walk keeps a queue of pending
//! components and the depth below the root:
//!
//! - `.` is skipped
//! - `..` pops one level, or fails with `Walkout` at the root
//! - a missing component is `NoEntry`, unless it is the last one and
//!   `CREATE` was requested
//! - a regular file before the last component is `NotDir`, as is any other
//!   non-directory
//! - a symlink is expanded in place: its target's components are pushed to
//!   the front of the queue. Absolute targets are `Walkout`, and more than
//!   [`MAX_LINK_EXPANSIONS`] expansions is `MaxLinks`
//!
//! Because every `..` is checked against the depth after link expansion,
//! relative links can move around inside the root but never above it.
//!
//! The walk checks the tree as it is at resolution time. The caller then
//! opens the returned path by name, refusing a link at the final component;
//! a host process that swaps a parent directory for a link in between can
//! still redirect the open. Guests cannot create links, so only the host
//! side can race it.

use super::abi::{IoErrorKind, OpenFlags};
use std::collections::VecDeque;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Maximum symlink expansions during one resolution
pub const MAX_LINK_EXPANSIONS: usize = 32;

fn io_error(err: io::Error) -> IoErrorKind {
    IoErrorKind::from(&err)
}

/// Resolve `path` below `root` without escaping it
///
/// Returns the host path to open. With `CREATE`, the last component may not
/// exist yet.
pub fn resolve_restricted(root: &Path, path: &str, flags: OpenFlags) -> Result<PathBuf, IoErrorKind> {
    let mut pending: VecDeque<OsString> = path
        .split('/')
        .filter(|name| !name.is_empty())
        .map(OsString::from)
        .collect();

    let mut current = root.to_path_buf();
    let mut depth = 0usize;
    let mut expansions = 0usize;

    while let Some(name) = pending.pop_front() {
        let last = pending.is_empty();

        if name == OsStr::new(".") {
            continue;
        }

        if name == OsStr::new("..") {
            if depth == 0 {
                return Err(IoErrorKind::Walkout);
            }
            current.pop();
            depth -= 1;
            continue;
        }

        let candidate = current.join(&name);
        let meta = match fs::symlink_metadata(&candidate) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if last && flags.contains(OpenFlags::CREATE) {
                    return Ok(candidate);
                }
                return Err(IoErrorKind::NoEntry);
            }
            Err(err) => return Err(io_error(err)),
        };

        let file_type = meta.file_type();
        if file_type.is_symlink() {
            let open_link = last && flags.contains(OpenFlags::SYMLINK);
            if !open_link {
                if last && flags.contains(OpenFlags::NO_FOLLOW) {
                    return Err(IoErrorKind::MaxLinks);
                }

                expansions += 1;
                if expansions > MAX_LINK_EXPANSIONS {
                    return Err(IoErrorKind::MaxLinks);
                }

                let target = fs::read_link(&candidate).map_err(io_error)?;
                splice_link_target(&mut pending, &target)?;
                continue;
            }
        } else if file_type.is_file() {
            if !last {
                return Err(IoErrorKind::NotDir);
            }
        } else if !file_type.is_dir() {
            return Err(IoErrorKind::NotDir);
        }

        current = candidate;
        depth += 1;
    }

    Ok(current)
}

/// Push the components of a relative link target to the front of the queue
///
/// An empty target behaves like `.`.
fn splice_link_target(pending: &mut VecDeque<OsString>, target: &Path) -> Result<(), IoErrorKind> {
    let mut components = Vec::new();
    for component in target.components() {
        match component {
            Component::Normal(name) => components.push(name.to_os_string()),
            Component::ParentDir => components.push(OsString::from("..")),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return Err(IoErrorKind::Walkout),
        }
    }

    for name in components.into_iter().rev() {
        pending.push_front(name);
    }
    Ok(())
}
