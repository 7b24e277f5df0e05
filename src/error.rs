//! Crate-wide error types
//!
//! Errors are grouped by who has to deal with them:
//! - [`HostTrap`]: a host call refuses to continue; the guest invocation is
//!   aborted
//! - [`RuntimeFault`]: the current guest run is over
//! - [`LoadError`] / [`ConfigError`]: a runtime could not be built
//!
//! Guest-recoverable conditions (bad handles, failed opens, full queues) are
//! not here; they travel back to the guest as [`IoErrorKind`] codes or are
//! logged and dropped.
//!
//! [`IoErrorKind`]: crate::io::IoErrorKind

use crate::events::EventError;
use crate::exec::interp::Trap;
use crate::sandbox::{BoundsError, MemoryError};
use std::path::PathBuf;
use thiserror::Error;

/// A host call aborted the guest invocation
#[derive(Debug, Error)]
pub enum HostTrap {
    #[error("{call}: argument `{param}` rejected: {source}")]
    OutOfBounds {
        call: &'static str,
        param: &'static str,
        source: BoundsError,
    },

    #[error("{call}: expected arguments ({expected})")]
    BadArguments {
        call: &'static str,
        expected: String,
    },

    #[error("guest aborted: {message}")]
    GuestAbort { message: String },

    #[error("{0}")]
    OutOfMemory(#[from] MemoryError),

    #[error("import {index} is not linked to a host function")]
    UnlinkedImport { index: u32 },
}

/// Fatal to the current guest run
#[derive(Debug, Error)]
pub enum RuntimeFault {
    #[error("`{entry}` trapped: {trap}")]
    Trap { entry: &'static str, trap: Trap },

    #[error("raw event slot rejected: {0}")]
    RawEventSlot(#[source] BoundsError),

    #[error("guest thread panicked")]
    Panicked,
}

/// A runtime could not be constructed from a module
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("invalid module: {reason}")]
    InvalidModule { reason: String },

    #[error("unresolved import {module}.{name}")]
    UnresolvedImport { module: String, name: String },

    #[error("import {module}.{name} has type {found}, host provides {expected}")]
    ImportSignatureMismatch {
        module: String,
        name: String,
        expected: String,
        found: String,
    },

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl LoadError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        LoadError::InvalidModule {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config field `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_bounds_message_names_call_and_param() {
        let trap = HostTrap::OutOfBounds {
            call: "log",
            param: "msg",
            source: BoundsError {
                offset: 65000,
                length: 1000,
                committed: 65536,
            },
        };
        let message = trap.to_string();
        assert!(message.starts_with("log: argument `msg` rejected"));
        assert!(message.contains("65000"));
        assert!(std::error::Error::source(&trap).is_some());
    }

    #[test]
    fn test_fault_display() {
        let fault = RuntimeFault::Trap {
            entry: "on_init",
            trap: Trap::Unreachable,
        };
        assert_eq!(fault.to_string(), "`on_init` trapped: unreachable executed");
    }
}
