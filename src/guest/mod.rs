//! The guest module and its boundary with the host
//!
//! - [`module`]: parses the imports, exports and globals of a module binary
//! - [`exports`]: binds the entry points the runtime calls
//! - [`host`]: the host functions the guest imports, and the linker
//! - [`abi`]: value types and entry point signatures shared by both sides

pub mod abi;
pub mod exports;
pub mod host;
pub mod module;

pub use abi::{EntryPoint, FuncIndex, FuncType, ValType, Value};
pub use exports::EntryPoints;
pub use host::{
    Clock, ClockKind, HOST_FUNCTIONS, HeadlessWindow, HostEnv, HostFunction, ImportMap, Linker,
    WindowBackend,
};
pub use module::ModuleInfo;
