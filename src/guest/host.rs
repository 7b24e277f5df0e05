//! Host functions exposed to the guest
//!
//! Every function the guest can import is listed in [`HOST_FUNCTIONS`] with
//! its exact signature. At load time the [`Linker`] maps each of the
//! module's function imports to one entry of that table; at run time the
//! interpreter calls back through [`HostEnv::call_import`].
//!
//! Pointer arguments are guest offsets. Each one goes through the boundary
//! validator before any byte behind it is read or written, and a rejected
//! range aborts the invocation with [`HostTrap::OutOfBounds`] naming the
//! call and the parameter. Output buffers are validated before any work is
//! done, so a bad output pointer never leaves half-applied side effects.
//!
//! ## Functions (module `env`)
//!
//! | name                 | params                                   | result |
//! |----------------------|------------------------------------------|--------|
//! | `io_wait_single_req` | req_ptr, cmp_ptr                         |        |
//! | `io_wait_reqs`       | reqs_ptr, count, cmps_ptr                |        |
//! | `file_open`          | path_ptr, path_len, rights, flags        | i64    |
//! | `file_close`         | handle: i64                              |        |
//! | `file_last_error`    | handle: i64                              | i32    |
//! | `clock_time`         | kind                                     | f64    |
//! | `log`                | level, msg_ptr, msg_len, file_cstr, line |        |
//! | `mem_grow`           | size: i64                                | i32    |
//! | `abort`              | msg_cstr                                 |        |
//! | `window_set_title`   | title_ptr, title_len                     |        |
//! | `window_get_size`    | out_ptr                                  |        |

use super::abi::{FuncType, IMPORT_MODULE, ValType, Value};
use super::module::{FunctionImport, ModuleInfo};
use crate::console::{Console, LogLevel};
use crate::error::{HostTrap, LoadError};
use crate::io::{FileAccess, IoCompletion, IoOp, IoRequest, OpenFlags, dispatch, file};
use crate::sandbox::{BoundsError, CapabilityTable, GuestMemory, Handle};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error};

pub type HostResult = Result<Vec<Value>, HostTrap>;

/// Host function implementation
pub type HostCall = fn(&mut HostEnv<'_>, &[Value]) -> HostResult;

/// One importable host function
#[derive(Debug)]
pub struct HostFunction {
    pub module: &'static str,
    pub name: &'static str,
    pub params: &'static [ValType],
    pub results: &'static [ValType],
    pub call: HostCall,
}

impl HostFunction {
    pub fn ty(&self) -> FuncType {
        FuncType::new(self.params, self.results)
    }
}

use ValType::{F64, I32, I64};

pub const HOST_FUNCTIONS: &[HostFunction] = &[
    HostFunction {
        module: IMPORT_MODULE,
        name: "io_wait_single_req",
        params: &[I32, I32],
        results: &[],
        call: io_wait_single_req,
    },
    HostFunction {
        module: IMPORT_MODULE,
        name: "io_wait_reqs",
        params: &[I32, I32, I32],
        results: &[],
        call: io_wait_reqs,
    },
    HostFunction {
        module: IMPORT_MODULE,
        name: "file_open",
        params: &[I32, I32, I32, I32],
        results: &[I64],
        call: file_open,
    },
    HostFunction {
        module: IMPORT_MODULE,
        name: "file_close",
        params: &[I64],
        results: &[],
        call: file_close,
    },
    HostFunction {
        module: IMPORT_MODULE,
        name: "file_last_error",
        params: &[I64],
        results: &[I32],
        call: file_last_error,
    },
    HostFunction {
        module: IMPORT_MODULE,
        name: "clock_time",
        params: &[I32],
        results: &[F64],
        call: clock_time,
    },
    HostFunction {
        module: IMPORT_MODULE,
        name: "log",
        params: &[I32, I32, I32, I32, I32],
        results: &[],
        call: log,
    },
    HostFunction {
        module: IMPORT_MODULE,
        name: "mem_grow",
        params: &[I64],
        results: &[I32],
        call: mem_grow,
    },
    HostFunction {
        module: IMPORT_MODULE,
        name: "abort",
        params: &[I32],
        results: &[],
        call: abort,
    },
    HostFunction {
        module: IMPORT_MODULE,
        name: "window_set_title",
        params: &[I32, I32],
        results: &[],
        call: window_set_title,
    },
    HostFunction {
        module: IMPORT_MODULE,
        name: "window_get_size",
        params: &[I32],
        results: &[],
        call: window_get_size,
    },
];

// ============================================================================
// Collaborators
// ============================================================================

/// The window the guest draws into
pub trait WindowBackend: Send {
    fn set_title(&mut self, title: &str);
    /// Content size in pixels
    fn size(&self) -> (u32, u32);
}

/// Window stand-in for runs without a display
#[derive(Debug, Clone, Default)]
pub struct HeadlessWindow {
    title: String,
    size: (u32, u32),
}

impl HeadlessWindow {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            title: String::new(),
            size: (width, height),
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.size = (width, height);
    }
}

impl WindowBackend for HeadlessWindow {
    fn set_title(&mut self, title: &str) {
        self.title = title.to_owned();
    }

    fn size(&self) -> (u32, u32) {
        self.size
    }
}

/// Clock selector for `clock_time`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ClockKind {
    /// Seconds on a steady clock
    Monotonic = 0,
    /// Seconds since the runtime started
    Uptime = 1,
    /// Seconds since the unix epoch
    Date = 2,
}

impl ClockKind {
    pub fn from_i32(kind: i32) -> Option<Self> {
        match kind {
            0 => Some(ClockKind::Monotonic),
            1 => Some(ClockKind::Uptime),
            2 => Some(ClockKind::Date),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Clock {
    start: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn time(&self, kind: ClockKind) -> f64 {
        match kind {
            ClockKind::Monotonic | ClockKind::Uptime => self.start.elapsed().as_secs_f64(),
            ClockKind::Date => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Linking
// ============================================================================

/// Host function for each of a module's function imports, in import order
#[derive(Debug, Clone, Default)]
pub struct ImportMap {
    targets: Vec<&'static HostFunction>,
}

impl ImportMap {
    pub fn resolve(&self, import: u32) -> Option<&'static HostFunction> {
        self.targets.get(import as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Every host function, imported in table order
    pub fn all() -> Self {
        Self {
            targets: HOST_FUNCTIONS.iter().collect(),
        }
    }
}

pub struct Linker;

impl Linker {
    /// Resolve every function import against the host table
    ///
    /// Each failure is logged; the first one is returned.
    pub fn link(module: &ModuleInfo) -> Result<ImportMap, LoadError> {
        let mut targets = Vec::with_capacity(module.function_imports().len());
        let mut first_error = None;

        for import in module.function_imports() {
            match Self::resolve(import) {
                Ok(function) => targets.push(function),
                Err(err) => {
                    error!(module = %import.module, name = %import.name, %err, "couldn't link host function");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                debug!(imports = targets.len(), "linked host imports");
                Ok(ImportMap { targets })
            }
        }
    }

    fn resolve(import: &FunctionImport) -> Result<&'static HostFunction, LoadError> {
        let function = HOST_FUNCTIONS
            .iter()
            .find(|f| f.module == import.module && f.name == import.name)
            .ok_or_else(|| LoadError::UnresolvedImport {
                module: import.module.clone(),
                name: import.name.clone(),
            })?;

        if !import.ty.matches(function.params, function.results) {
            return Err(LoadError::ImportSignatureMismatch {
                module: import.module.clone(),
                name: import.name.clone(),
                expected: function.ty().to_string(),
                found: import.ty.to_string(),
            });
        }

        Ok(function)
    }
}

// ============================================================================
// Host environment
// ============================================================================

/// Everything a host call may touch during one guest invocation
pub struct HostEnv<'a> {
    pub memory: &'a mut GuestMemory,
    pub capabilities: &'a mut CapabilityTable,
    pub console: &'a mut Console,
    pub window: &'a mut dyn WindowBackend,
    pub clock: &'a Clock,
    /// Sandbox root directory; base of every guest open
    pub root: Handle,
    imports: &'a ImportMap,
}

impl<'a> HostEnv<'a> {
    pub fn new(
        memory: &'a mut GuestMemory,
        capabilities: &'a mut CapabilityTable,
        console: &'a mut Console,
        window: &'a mut dyn WindowBackend,
        clock: &'a Clock,
        root: Handle,
        imports: &'a ImportMap,
    ) -> Self {
        Self {
            memory,
            capabilities,
            console,
            window,
            clock,
            root,
            imports,
        }
    }

    /// Call the host function linked to the module's import `import`
    pub fn call_import(&mut self, import: u32, args: &[Value]) -> HostResult {
        let function = self
            .imports
            .resolve(import)
            .ok_or(HostTrap::UnlinkedImport { index: import })?;

        let well_typed = args.len() == function.params.len()
            && args.iter().zip(function.params).all(|(arg, ty)| arg.ty() == *ty);
        if !well_typed {
            return Err(HostTrap::BadArguments {
                call: function.name,
                expected: function.ty().to_string(),
            });
        }

        (function.call)(self, args)
    }

    /// Validate an I/O request's buffer and execute it
    fn execute_request(&mut self, call: &'static str, mut req: IoRequest) -> Result<IoCompletion, HostTrap> {
        if req.op == IoOp::OpenAt as u32 {
            if Handle::from_raw(req.handle).is_nil() {
                req.handle = self.root.raw();
            }
            req.open_flags |= OpenFlags::RESTRICT.0;
        }

        let ptr = u32::try_from(req.buffer)
            .map_err(|_| BoundsError {
                offset: u32::MAX,
                length: req.size,
                committed: self.memory.committed_size(),
            })
            .in_param(call, "buffer")?;
        let buffer = self.memory.slice_mut(ptr, req.size).in_param(call, "buffer")?;

        Ok(dispatch::wait_single_req(&req, buffer, self.capabilities))
    }
}

/// Attach the host call and parameter name to a boundary violation
trait InParam<T> {
    fn in_param(self, call: &'static str, param: &'static str) -> Result<T, HostTrap>;
}

impl<T> InParam<T> for Result<T, BoundsError> {
    fn in_param(self, call: &'static str, param: &'static str) -> Result<T, HostTrap> {
        self.map_err(|source| HostTrap::OutOfBounds { call, param, source })
    }
}

// Argument types are checked in `call_import`

fn ptr(args: &[Value], i: usize) -> u32 {
    args.get(i).and_then(Value::as_i32).unwrap_or(0) as u32
}

fn int(args: &[Value], i: usize) -> i32 {
    args.get(i).and_then(Value::as_i32).unwrap_or(0)
}

fn long(args: &[Value], i: usize) -> i64 {
    args.get(i).and_then(Value::as_i64).unwrap_or(0)
}

// ============================================================================
// Host functions
// ============================================================================

fn io_wait_single_req(env: &mut HostEnv<'_>, args: &[Value]) -> HostResult {
    const CALL: &str = "io_wait_single_req";
    let (req_ptr, cmp_ptr) = (ptr(args, 0), ptr(args, 1));

    let req: IoRequest = env.memory.read_pod(req_ptr).in_param(CALL, "req")?;
    env.memory
        .validate(cmp_ptr, IoCompletion::SIZE as u64)
        .in_param(CALL, "cmp")?;

    let cmp = env.execute_request(CALL, req)?;
    env.memory.write_pod(cmp_ptr, &cmp).in_param(CALL, "cmp")?;
    Ok(Vec::new())
}

fn io_wait_reqs(env: &mut HostEnv<'_>, args: &[Value]) -> HostResult {
    const CALL: &str = "io_wait_reqs";
    let (reqs_ptr, count, cmps_ptr) = (ptr(args, 0), ptr(args, 1) as u64, ptr(args, 2));

    let reqs = env
        .memory
        .read_pod_array::<IoRequest>(reqs_ptr, count)
        .in_param(CALL, "reqs")?;
    env.memory
        .array_range::<IoCompletion>(cmps_ptr, count)
        .in_param(CALL, "cmps")?;

    for (i, req) in reqs.into_iter().enumerate() {
        let cmp = env.execute_request(CALL, req)?;
        let offset = cmps_ptr + (i * IoCompletion::SIZE) as u32;
        env.memory.write_pod(offset, &cmp).in_param(CALL, "cmps")?;
    }
    Ok(Vec::new())
}

fn file_open(env: &mut HostEnv<'_>, args: &[Value]) -> HostResult {
    const CALL: &str = "file_open";
    let path = env.memory.str8(ptr(args, 0), ptr(args, 1)).in_param(CALL, "path")?;
    let rights = FileAccess(int(args, 2) as u32);
    let flags = OpenFlags(int(args, 3) as u32).with(OpenFlags::RESTRICT);

    let (handle, _) = match std::str::from_utf8(path) {
        Ok(path) => file::open_at(env.capabilities, env.root, path, rights, flags),
        Err(_) => file::open_error(env.capabilities, crate::io::IoErrorKind::Arg),
    };
    Ok(vec![Value::I64(handle.raw() as i64)])
}

fn file_close(env: &mut HostEnv<'_>, args: &[Value]) -> HostResult {
    file::close(env.capabilities, Handle::from_raw(long(args, 0) as u64));
    Ok(Vec::new())
}

fn file_last_error(env: &mut HostEnv<'_>, args: &[Value]) -> HostResult {
    let error = match file::last_error(env.capabilities, Handle::from_raw(long(args, 0) as u64)) {
        Ok(error) | Err(error) => error,
    };
    Ok(vec![Value::I32(error.code())])
}

fn clock_time(env: &mut HostEnv<'_>, args: &[Value]) -> HostResult {
    let time = ClockKind::from_i32(int(args, 0))
        .map(|kind| env.clock.time(kind))
        .unwrap_or(0.0);
    Ok(vec![Value::F64(time)])
}

fn log(env: &mut HostEnv<'_>, args: &[Value]) -> HostResult {
    const CALL: &str = "log";
    let level = LogLevel::from_i32(int(args, 0));
    let message = env.memory.str8(ptr(args, 1), ptr(args, 2)).in_param(CALL, "msg")?;
    let file = env.memory.cstr(ptr(args, 3)).in_param(CALL, "file")?;

    env.console.push(level, file, int(args, 4), message);
    Ok(Vec::new())
}

fn mem_grow(env: &mut HostEnv<'_>, args: &[Value]) -> HostResult {
    let size = u64::try_from(long(args, 0)).map_err(|_| HostTrap::BadArguments {
        call: "mem_grow",
        expected: "non-negative size".to_owned(),
    })?;
    let previous = env.memory.grow(size)?;
    Ok(vec![Value::I32(previous as i32)])
}

fn abort(env: &mut HostEnv<'_>, args: &[Value]) -> HostResult {
    let message = env.memory.cstr(ptr(args, 0)).in_param("abort", "msg")?;
    Err(HostTrap::GuestAbort {
        message: String::from_utf8_lossy(message).into_owned(),
    })
}

fn window_set_title(env: &mut HostEnv<'_>, args: &[Value]) -> HostResult {
    let title = env
        .memory
        .str8(ptr(args, 0), ptr(args, 1))
        .in_param("window_set_title", "title")?;
    env.window.set_title(&String::from_utf8_lossy(title));
    Ok(Vec::new())
}

fn window_get_size(env: &mut HostEnv<'_>, args: &[Value]) -> HostResult {
    let (width, height) = env.window.size();
    env.memory
        .write_pod(ptr(args, 0), &[width, height])
        .in_param("window_get_size", "out")?;
    Ok(Vec::new())
}
