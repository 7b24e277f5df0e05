//! Request dispatch
//!
//! Executes one [`IoRequest`] against a capability table. The caller has
//! already validated the request's buffer against guest memory and passes it
//! in as a host slice; nothing here touches guest addresses.

use super::abi::{FileAccess, FileStatus, IoCompletion, IoErrorKind, IoOp, IoRequest, OpenFlags, Whence};
use super::file;
use crate::sandbox::{CapabilityTable, Handle};

/// Execute a single request and produce its completion
pub fn wait_single_req(req: &IoRequest, buffer: &mut [u8], table: &mut CapabilityTable) -> IoCompletion {
    let handle = Handle::from_raw(req.handle);

    let Some(op) = IoOp::from_u32(req.op) else {
        if let Ok(slot) = table.lookup_mut(handle) {
            slot.set_error(IoErrorKind::Op);
        }
        return IoCompletion::new(req.id, IoErrorKind::Op, 0);
    };

    let result = match op {
        IoOp::OpenAt => {
            let (opened, error) = match std::str::from_utf8(buffer) {
                Ok(path) => file::open_at(
                    table,
                    handle,
                    path,
                    FileAccess(req.open_rights),
                    OpenFlags(req.open_flags),
                ),
                Err(_) => file::open_error(table, IoErrorKind::Arg),
            };
            return IoCompletion::new(req.id, error, opened.raw() as i64);
        }
        IoOp::Close => match file::close(table, handle) {
            IoErrorKind::Ok => Ok(0),
            error => Err(error),
        },
        IoOp::Fstat => match buffer.get_mut(..FileStatus::SIZE) {
            Some(out) => file::fstat(table, handle).map(|status| {
                out.copy_from_slice(bytemuck::bytes_of(&status));
                FileStatus::SIZE as i64
            }),
            None => Err(IoErrorKind::Arg),
        },
        IoOp::Seek => match Whence::from_u32(req.whence) {
            Some(whence) => file::seek(table, handle, req.offset, whence).map(|pos| pos as i64),
            None => Err(IoErrorKind::Arg),
        },
        IoOp::Read => file::read(table, handle, buffer).map(|n| n as i64),
        IoOp::Write => file::write(table, handle, buffer).map(|n| n as i64),
        IoOp::Error => file::last_error(table, handle).map(|error| error.code() as i64),
    };

    match result {
        Ok(value) => IoCompletion::new(req.id, IoErrorKind::Ok, value),
        Err(error) => IoCompletion::new(req.id, error, 0),
    }
}
