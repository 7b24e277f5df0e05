//! warden - a sandboxed host runtime for untrusted wasm guests
//!
//! The guest sees the host only through a fixed set of imported functions.
//! Everything it passes across that boundary is checked:
//! - pointers are validated against committed guest memory before use
//! - files are reached through generation-checked capability handles, and
//!   only below the sandbox root
//! - events arrive through a lock-free ring from the OS thread
//! - a debugger can pause, step and quit the guest from another thread
//!
//! Bytecode execution and windowing are collaborators behind the
//! [`exec::Interpreter`] and [`guest::WindowBackend`] traits.

pub mod arena;
pub mod config;
pub mod console;
pub mod error;
pub mod events;
pub mod exec;
pub mod guest;
pub mod io;
pub mod runtime;
pub mod sandbox;

pub use config::RuntimeConfig;
pub use error::{ConfigError, HostTrap, LoadError, RuntimeFault};
pub use events::Event;
pub use runtime::{DebugController, GuestVm, OsPort, Runtime, RuntimeHandle, VmExit};
