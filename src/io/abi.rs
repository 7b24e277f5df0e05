//! File I/O wire ABI shared with guests
//!
//! Request and completion records cross the guest boundary as raw bytes, so
//! every wire struct here is `#[repr(C)]`, padding-free and `Pod`. Field
//! order and widths are part of the ABI and must not change.

use bytemuck::{Pod, Zeroable};
use std::fmt;
use std::io::ErrorKind;

/// Operation selector of an [`IoRequest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IoOp {
    OpenAt = 0,
    Close = 1,
    Fstat = 2,
    Seek = 3,
    Read = 4,
    Write = 5,
    Error = 6,
}

impl IoOp {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::OpenAt),
            1 => Some(Self::Close),
            2 => Some(Self::Fstat),
            3 => Some(Self::Seek),
            4 => Some(Self::Read),
            5 => Some(Self::Write),
            6 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Error codes reported to the guest
///
/// Codes are stable; `Ok` is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum IoErrorKind {
    #[default]
    Ok = 0,
    Unknown = 1,
    /// Unsupported operation
    Op = 2,
    /// Invalid or stale handle
    Handle = 3,
    /// A previous error left the handle unusable
    Prev = 4,
    Arg = 5,
    Perm = 6,
    Space = 7,
    NoEntry = 8,
    Exists = 9,
    NotDir = 10,
    Dir = 11,
    MaxFiles = 12,
    MaxLinks = 13,
    PathLength = 14,
    FileSize = 15,
    Overflow = 16,
    NotReady = 17,
    Mem = 18,
    Interrupt = 19,
    Physical = 20,
    NoDevice = 21,
    /// Path resolution escaped the sandbox root
    Walkout = 22,
}

impl IoErrorKind {
    pub fn code(&self) -> i32 {
        *self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        use IoErrorKind::*;
        const ALL: [IoErrorKind; 23] = [
            Ok, Unknown, Op, Handle, Prev, Arg, Perm, Space, NoEntry, Exists, NotDir, Dir,
            MaxFiles, MaxLinks, PathLength, FileSize, Overflow, NotReady, Mem, Interrupt,
            Physical, NoDevice, Walkout,
        ];
        usize::try_from(code).ok().and_then(|i| ALL.get(i).copied())
    }

    pub fn is_ok(&self) -> bool {
        *self == IoErrorKind::Ok
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Ok => "no error",
            Self::Unknown => "unknown error",
            Self::Op => "unsupported operation",
            Self::Handle => "invalid handle",
            Self::Prev => "handle unusable after a previous error",
            Self::Arg => "invalid argument",
            Self::Perm => "permission denied",
            Self::Space => "no space left",
            Self::NoEntry => "no such file or directory",
            Self::Exists => "already exists",
            Self::NotDir => "not a directory",
            Self::Dir => "is a directory",
            Self::MaxFiles => "too many open files",
            Self::MaxLinks => "too many symbolic links",
            Self::PathLength => "path too long",
            Self::FileSize => "file too large",
            Self::Overflow => "value overflow",
            Self::NotReady => "resource not ready",
            Self::Mem => "out of memory",
            Self::Interrupt => "interrupted",
            Self::Physical => "physical i/o error",
            Self::NoDevice => "no such device",
            Self::Walkout => "path escapes the sandbox root",
        }
    }
}

impl fmt::Display for IoErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl From<&std::io::Error> for IoErrorKind {
    fn from(err: &std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::NotFound => Self::NoEntry,
            ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem => Self::Perm,
            ErrorKind::AlreadyExists => Self::Exists,
            ErrorKind::NotADirectory => Self::NotDir,
            ErrorKind::IsADirectory => Self::Dir,
            ErrorKind::InvalidInput | ErrorKind::NotSeekable => Self::Arg,
            ErrorKind::StorageFull => Self::Space,
            ErrorKind::FileTooLarge => Self::FileSize,
            ErrorKind::TooManyLinks => Self::MaxLinks,
            ErrorKind::InvalidFilename => Self::PathLength,
            ErrorKind::Interrupted => Self::Interrupt,
            ErrorKind::OutOfMemory => Self::Mem,
            ErrorKind::WouldBlock => Self::NotReady,
            ErrorKind::Unsupported => Self::Op,
            ErrorKind::UnexpectedEof => Self::Physical,
            _ => Self::Unknown,
        }
    }
}

/// Access rights bitset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileAccess(pub u32);

impl FileAccess {
    pub const NONE: FileAccess = FileAccess(0);
    pub const READ: FileAccess = FileAccess(1);
    pub const WRITE: FileAccess = FileAccess(2);
    pub const READ_WRITE: FileAccess = FileAccess(3);

    pub fn contains(self, other: FileAccess) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersect(self, other: FileAccess) -> FileAccess {
        FileAccess(self.0 & other.0)
    }

    pub fn can_read(self) -> bool {
        self.contains(Self::READ)
    }

    pub fn can_write(self) -> bool {
        self.contains(Self::WRITE)
    }
}

/// Open flags bitset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const NONE: OpenFlags = OpenFlags(0);
    pub const APPEND: OpenFlags = OpenFlags(1 << 0);
    pub const TRUNCATE: OpenFlags = OpenFlags(1 << 1);
    pub const CREATE: OpenFlags = OpenFlags(1 << 2);
    pub const SYMLINK: OpenFlags = OpenFlags(1 << 3);
    pub const NO_FOLLOW: OpenFlags = OpenFlags(1 << 4);
    /// Resolve the path without escaping the directory it is opened from
    pub const RESTRICT: OpenFlags = OpenFlags(1 << 5);

    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | other.0)
    }
}

/// Seek origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Whence {
    Set = 0,
    End = 1,
    Current = 2,
}

impl Whence {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Set),
            1 => Some(Self::End),
            2 => Some(Self::Current),
            _ => None,
        }
    }
}

/// File type reported by `fstat`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum FileType {
    #[default]
    Unknown = 0,
    Regular = 1,
    Directory = 2,
    Symlink = 3,
    Block = 4,
    Character = 5,
    Fifo = 6,
    Socket = 7,
}

impl From<std::fs::FileType> for FileType {
    fn from(ft: std::fs::FileType) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            if ft.is_block_device() {
                return FileType::Block;
            }
            if ft.is_char_device() {
                return FileType::Character;
            }
            if ft.is_fifo() {
                return FileType::Fifo;
            }
            if ft.is_socket() {
                return FileType::Socket;
            }
        }

        if ft.is_dir() {
            FileType::Directory
        } else if ft.is_file() {
            FileType::Regular
        } else if ft.is_symlink() {
            FileType::Symlink
        } else {
            FileType::Unknown
        }
    }
}

/// One I/O request as laid out in guest memory (56 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct IoRequest {
    /// Echoed back in the completion
    pub id: u64,
    /// [`IoOp`] code
    pub op: u32,
    /// [`FileAccess`] bits for `OpenAt`
    pub open_rights: u32,
    /// Target handle, or the directory handle for `OpenAt`
    pub handle: u64,
    /// Seek offset
    pub offset: i64,
    /// Buffer length in bytes
    pub size: u64,
    /// Guest address of the buffer (path bytes for `OpenAt`)
    pub buffer: u64,
    /// [`OpenFlags`] bits for `OpenAt`
    pub open_flags: u32,
    /// [`Whence`] code for `Seek`
    pub whence: u32,
}

impl IoRequest {
    pub const SIZE: usize = 56;
}

/// Completion record written back to the guest (24 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct IoCompletion {
    pub id: u64,
    /// [`IoErrorKind`] code
    pub error: i32,
    pub _pad: u32,
    /// Byte count, new offset, or handle depending on the operation
    pub result: i64,
}

impl IoCompletion {
    pub const SIZE: usize = 24;

    pub fn new(id: u64, error: IoErrorKind, result: i64) -> Self {
        Self {
            id,
            error: error.code(),
            _pad: 0,
            result,
        }
    }

    pub fn error_kind(&self) -> IoErrorKind {
        IoErrorKind::from_code(self.error).unwrap_or(IoErrorKind::Unknown)
    }
}

/// File metadata written by `Fstat` (32 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct FileStatus {
    pub uid: u64,
    pub size: u64,
    /// [`FileType`] code
    pub file_type: u32,
    /// Unix permission bits
    pub perm: u32,
    /// Last modification time, nanoseconds since the unix epoch
    pub modified_ns: u64,
}

impl FileStatus {
    pub const SIZE: usize = 32;
}
