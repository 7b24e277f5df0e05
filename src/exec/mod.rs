//! Guest execution control
//!
//! - [`interp`]: the interpreter collaborator and the traps it reports
//! - [`control`]: pause/resume handshake between the guest thread and a
//!   control thread
//! - [`invoke`]: runs one guest function under that handshake

pub mod control;
pub mod interp;
pub mod invoke;

pub use control::{ControlError, DebugCommand, ExecState, ExecutionControl};
pub use interp::{Interpreter, ResumeMode, Status, SuspendFlag, SuspendSignal, Trap, TrapKind};
pub use invoke::{Completion, invoke_controlled};
