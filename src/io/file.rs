//! File capabilities
//!
//! Files and directories the guest can reach live in the capability table as
//! [`Capability::File`] entries. Acquisition never fails silently: unless the
//! table is full, `open_at` always hands back a handle, and a failed open
//! records its error in the slot and marks the slot fatal. The guest learns
//! what went wrong through the completion code or `last_error`, and every
//! later operation on that handle reports `Prev` until it is closed.

use super::abi::{FileAccess, FileStatus, FileType, IoErrorKind, OpenFlags, Whence};
use super::restrict::resolve_restricted;
use crate::sandbox::{Capability, CapabilitySlot, CapabilityTable, Handle, SlotRef};
use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;

/// An open file or directory
#[derive(Debug)]
pub struct FileCapability {
    file_type: FileType,
    rights: FileAccess,
    path: PathBuf,
    /// Open host file; directories and links are held by path only
    file: Option<File>,
}

impl FileCapability {
    /// Open the host object at `path`
    pub fn open(path: PathBuf, rights: FileAccess, flags: OpenFlags) -> Result<Self, IoErrorKind> {
        let no_follow = flags.contains(OpenFlags::SYMLINK) || flags.contains(OpenFlags::NO_FOLLOW);
        let existing = if no_follow {
            fs::symlink_metadata(&path)
        } else {
            fs::metadata(&path)
        };

        if let Ok(meta) = &existing {
            let file_type = FileType::from(meta.file_type());
            match file_type {
                FileType::Directory => {
                    return Ok(Self::by_path(FileType::Directory, rights, path));
                }
                FileType::Symlink if flags.contains(OpenFlags::SYMLINK) => {
                    return Ok(Self::by_path(FileType::Symlink, rights, path));
                }
                FileType::Symlink => return Err(IoErrorKind::MaxLinks),
                _ => {}
            }
        }

        let mut options = OpenOptions::new();
        options
            .read(rights.can_read() || !rights.can_write())
            .write(rights.can_write())
            .append(flags.contains(OpenFlags::APPEND))
            .truncate(flags.contains(OpenFlags::TRUNCATE))
            .create(flags.contains(OpenFlags::CREATE));

        let file = options.open(&path).map_err(|e| IoErrorKind::from(&e))?;
        let meta = file.metadata().map_err(|e| IoErrorKind::from(&e))?;

        Ok(Self {
            file_type: FileType::from(meta.file_type()),
            rights,
            path,
            file: Some(file),
        })
    }

    fn by_path(file_type: FileType, rights: FileAccess, path: PathBuf) -> Self {
        Self {
            file_type,
            rights,
            path,
            file: None,
        }
    }

    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    pub fn rights(&self) -> FileAccess {
        self.rights
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn regular_file(&mut self, needed: FileAccess) -> Result<&mut File, IoErrorKind> {
        if self.file_type != FileType::Regular || !self.rights.contains(needed) {
            return Err(IoErrorKind::Perm);
        }
        self.file.as_mut().ok_or(IoErrorKind::Handle)
    }

    fn metadata(&self) -> Result<Metadata, IoErrorKind> {
        let meta = match (&self.file, self.file_type) {
            (Some(file), _) => file.metadata(),
            (None, FileType::Symlink) => fs::symlink_metadata(&self.path),
            (None, _) => fs::metadata(&self.path),
        };
        meta.map_err(|e| IoErrorKind::from(&e))
    }

    /// Current metadata in wire form
    pub fn status(&self) -> Result<FileStatus, IoErrorKind> {
        let meta = self.metadata()?;

        let modified_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos().min(u64::MAX as u128) as u64)
            .unwrap_or(0);

        #[cfg(unix)]
        let (uid, perm) = {
            use std::os::unix::fs::MetadataExt;
            (meta.ino(), meta.mode() & 0o7777)
        };
        #[cfg(not(unix))]
        let (uid, perm) = (0, if meta.permissions().readonly() { 0o444 } else { 0o644 });

        Ok(FileStatus {
            uid,
            size: meta.len(),
            file_type: FileType::from(meta.file_type()) as u32,
            perm,
            modified_ns,
        })
    }
}

// ============================================================================
// Operations against a capability table
// ============================================================================

/// Store `result`'s error in the slot before handing it back
fn record<T>(slot: &mut CapabilitySlot, result: Result<T, IoErrorKind>) -> Result<T, IoErrorKind> {
    if let Err(error) = &result {
        slot.set_error(*error);
    }
    result
}

/// Resolve a handle to a slot that is still usable
fn usable(table: &CapabilityTable, handle: Handle) -> Result<SlotRef, IoErrorKind> {
    let slot = table.slot_from_handle(handle).map_err(|e| e.io_error())?;
    if table.get(slot).fatal {
        return Err(IoErrorKind::Prev);
    }
    Ok(slot)
}

/// Allocate a slot that only carries `error`
///
/// Used when a request is rejected before any path resolution happens.
pub fn open_error(table: &mut CapabilityTable, error: IoErrorKind) -> (Handle, IoErrorKind) {
    match table.allocate() {
        Ok(slot) => {
            table.get_mut(slot).set_fatal(error);
            (table.handle_from_slot(slot), error)
        }
        Err(err) => (Handle::NIL, err.io_error()),
    }
}

/// Open the sandbox root directory
///
/// The returned handle is the base of every restricted open.
pub fn open_root(table: &mut CapabilityTable, root: &Path, rights: FileAccess) -> (Handle, IoErrorKind) {
    let slot = match table.allocate() {
        Ok(slot) => slot,
        Err(err) => return (Handle::NIL, err.io_error()),
    };
    let handle = table.handle_from_slot(slot);

    let result = fs::metadata(root)
        .map_err(|e| IoErrorKind::from(&e))
        .and_then(|meta| {
            if meta.is_dir() {
                Ok(FileCapability::by_path(FileType::Directory, rights, root.to_path_buf()))
            } else {
                Err(IoErrorKind::NotDir)
            }
        });

    finish_open(table, slot, handle, result)
}

/// Open `path` relative to the directory `dir`
///
/// Always returns a handle unless the table is exhausted. On failure the
/// handle's slot holds the error and is fatal.
pub fn open_at(
    table: &mut CapabilityTable,
    dir: Handle,
    path: &str,
    rights: FileAccess,
    flags: OpenFlags,
) -> (Handle, IoErrorKind) {
    let at = if dir.is_nil() {
        None
    } else {
        match table.slot_from_handle(dir) {
            Ok(slot) if table.get(slot).fatal => return (Handle::NIL, IoErrorKind::Prev),
            Ok(slot) => Some(slot),
            Err(_) => None,
        }
    };

    let slot = match table.allocate() {
        Ok(slot) => slot,
        Err(err) => return (Handle::NIL, err.io_error()),
    };
    let handle = table.handle_from_slot(slot);

    let result = resolve_open(table, at, dir, path, rights, flags);
    finish_open(table, slot, handle, result)
}

fn finish_open(
    table: &mut CapabilityTable,
    slot: SlotRef,
    handle: Handle,
    result: Result<FileCapability, IoErrorKind>,
) -> (Handle, IoErrorKind) {
    let entry = table.get_mut(slot);
    match result {
        Ok(capability) => {
            debug!(?handle, path = %capability.path.display(), "opened file capability");
            entry.resource = Some(Capability::File(capability));
            (handle, IoErrorKind::Ok)
        }
        Err(error) => {
            debug!(?handle, %error, "open failed");
            entry.set_fatal(error);
            (handle, error)
        }
    }
}

fn resolve_open(
    table: &CapabilityTable,
    at: Option<SlotRef>,
    dir: Handle,
    path: &str,
    rights: FileAccess,
    flags: OpenFlags,
) -> Result<FileCapability, IoErrorKind> {
    if path.is_empty() {
        return Err(IoErrorKind::Arg);
    }

    let base = match at {
        Some(slot) => {
            let dir_cap = table.get(slot).file().ok_or(IoErrorKind::Handle)?;
            if dir_cap.file_type != FileType::Directory {
                return Err(IoErrorKind::NotDir);
            }
            Some(dir_cap)
        }
        None if !dir.is_nil() => return Err(IoErrorKind::Handle),
        None => None,
    };

    if let Some(dir_cap) = base {
        if rights.intersect(dir_cap.rights) != rights {
            return Err(IoErrorKind::Perm);
        }
    }

    // The walk already expanded every link, so a link found at the final
    // path now was placed there afterwards
    let (target, flags) = match base {
        Some(dir_cap) if flags.contains(OpenFlags::RESTRICT) => (
            resolve_restricted(&dir_cap.path, path, flags)?,
            flags.with(OpenFlags::NO_FOLLOW),
        ),
        Some(dir_cap) => (dir_cap.path.join(path.trim_start_matches('/')), flags),
        None if flags.contains(OpenFlags::RESTRICT) => return Err(IoErrorKind::Handle),
        None => (PathBuf::from(path), flags),
    };

    FileCapability::open(target, rights, flags)
}

/// Close a handle and release its slot
///
/// Allowed on fatal handles.
pub fn close(table: &mut CapabilityTable, handle: Handle) -> IoErrorKind {
    match table.slot_from_handle(handle) {
        Ok(slot) => {
            // Dropping the capability closes the host file
            drop(table.recycle(slot));
            IoErrorKind::Ok
        }
        Err(err) => err.io_error(),
    }
}

/// Last error recorded against a handle
pub fn last_error(table: &CapabilityTable, handle: Handle) -> Result<IoErrorKind, IoErrorKind> {
    table
        .lookup(handle)
        .map(|slot| slot.error)
        .map_err(|e| e.io_error())
}

pub fn read(table: &mut CapabilityTable, handle: Handle, buf: &mut [u8]) -> Result<usize, IoErrorKind> {
    let slot = table.get_mut(usable(table, handle)?);
    let result = match slot.file_mut() {
        Some(cap) => cap
            .regular_file(FileAccess::READ)
            .and_then(|file| file.read(buf).map_err(|e| IoErrorKind::from(&e))),
        None => Err(IoErrorKind::Handle),
    };
    record(slot, result)
}

pub fn write(table: &mut CapabilityTable, handle: Handle, buf: &[u8]) -> Result<usize, IoErrorKind> {
    let slot = table.get_mut(usable(table, handle)?);
    let result = match slot.file_mut() {
        Some(cap) => cap
            .regular_file(FileAccess::WRITE)
            .and_then(|file| file.write(buf).map_err(|e| IoErrorKind::from(&e))),
        None => Err(IoErrorKind::Handle),
    };
    record(slot, result)
}

/// Move the file position, returning the new offset
pub fn seek(
    table: &mut CapabilityTable,
    handle: Handle,
    offset: i64,
    whence: Whence,
) -> Result<u64, IoErrorKind> {
    let slot = table.get_mut(usable(table, handle)?);

    let target = match whence {
        Whence::Set => u64::try_from(offset)
            .map(SeekFrom::Start)
            .map_err(|_| IoErrorKind::Arg),
        Whence::End => Ok(SeekFrom::End(offset)),
        Whence::Current => Ok(SeekFrom::Current(offset)),
    };

    let result = match slot.file_mut() {
        Some(cap) => target.and_then(|target| {
            cap.regular_file(FileAccess::NONE)
                .and_then(|file| file.seek(target).map_err(|e| IoErrorKind::from(&e)))
        }),
        None => Err(IoErrorKind::Handle),
    };
    record(slot, result)
}

pub fn fstat(table: &mut CapabilityTable, handle: Handle) -> Result<FileStatus, IoErrorKind> {
    let slot = table.get_mut(usable(table, handle)?);
    let result = match slot.file() {
        Some(cap) => cap.status(),
        None => Err(IoErrorKind::Handle),
    };
    record(slot, result)
}
