//! File I/O capabilities
//!
//! Guests reach the host filesystem only through handles in the capability
//! table, and only below the sandbox root. Requests arrive as fixed-layout
//! [`IoRequest`] records and complete synchronously.

pub mod abi;
pub mod dispatch;
pub mod file;
pub mod restrict;

pub use abi::{
    FileAccess, FileStatus, FileType, IoCompletion, IoErrorKind, IoOp, IoRequest, OpenFlags,
    Whence,
};
pub use dispatch::wait_single_req;
pub use file::FileCapability;
pub use restrict::resolve_restricted;
