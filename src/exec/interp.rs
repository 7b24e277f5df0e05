//! The interpreter collaborator
//!
//! Bytecode execution is not part of this crate. Whatever engine runs the
//! guest implements [`Interpreter`]; the runtime drives it through
//! `invoke`/`resume` and reacts to the [`Status`] it reports. Host imports
//! are reached through the [`HostEnv`] passed into every call.

use crate::error::HostTrap;
use crate::guest::abi::{FuncIndex, Value};
use crate::guest::host::HostEnv;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// How far a suspended interpreter should run when resumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Run until the next breakpoint, suspension request or return
    Continue,
    /// Execute one instruction, then trap with `StepCompleted`
    Instruction,
    /// Run to the next source line, then trap with `StepCompleted`
    Line,
}

/// Debugger traps; the only traps the runtime pauses on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    /// Execution stopped because a suspension was requested
    Suspended,
    Breakpoint,
    StepCompleted,
}

/// Why an invocation stopped without returning
#[derive(Debug)]
pub enum Trap {
    Debug(TrapKind),
    /// A host call refused to continue
    Host(HostTrap),
    Unreachable,
    Fault(String),
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trap::Debug(kind) => write!(f, "debug trap ({kind:?})"),
            Trap::Host(trap) => write!(f, "host trap: {trap}"),
            Trap::Unreachable => write!(f, "unreachable executed"),
            Trap::Fault(message) => write!(f, "fault: {message}"),
        }
    }
}

/// Outcome of `invoke` or `resume`
#[derive(Debug)]
pub enum Status {
    Returned(Vec<Value>),
    Trapped(Trap),
}

/// Lets another thread ask a running interpreter to stop at its next
/// safe point and trap with [`TrapKind::Suspended`]
pub trait SuspendSignal: Send + Sync {
    fn request_suspend(&self);
}

/// Atomic flag an interpreter polls between instructions
#[derive(Debug, Default)]
pub struct SuspendFlag {
    requested: AtomicBool,
}

impl SuspendFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a pending request
    pub fn take(&self) -> bool {
        self.requested.swap(false, Ordering::AcqRel)
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

impl SuspendSignal for SuspendFlag {
    fn request_suspend(&self) {
        self.requested.store(true, Ordering::Release);
    }
}

/// A bytecode engine executing one guest module
pub trait Interpreter: Send {
    /// Start executing `func` with `args`
    fn invoke(&mut self, env: &mut HostEnv<'_>, func: FuncIndex, args: &[Value]) -> Status;

    /// Continue the invocation that last trapped with a debug trap
    fn resume(&mut self, env: &mut HostEnv<'_>, mode: ResumeMode) -> Status;

    /// Signal used to interrupt a running invocation
    fn suspend_signal(&self) -> std::sync::Arc<dyn SuspendSignal>;
}
