//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use warden::exec::{Interpreter, ResumeMode, Status, SuspendFlag, SuspendSignal, Trap, TrapKind};
use warden::guest::{FuncIndex, HostEnv, ValType, Value};

// ============================================================================
// Scripted interpreter
// ============================================================================

/// One step of a scripted guest function
#[derive(Debug, Clone)]
pub enum Op {
    /// Call imported function `import`
    Host { import: u32, args: Vec<Value> },
    /// Copy bytes into guest memory
    Store { offset: u32, bytes: Vec<u8> },
    /// Record guest memory contents in the trace
    Dump { offset: u32, len: u64 },
    Break,
    /// Busy-loop until suspended
    Spin,
}

pub type Trace = Arc<Mutex<Vec<String>>>;

/// Interpreter stand-in that runs a fixed list of ops per function
///
/// Checks for suspension before every op and honours step modes by
/// trapping after one op.
pub struct ScriptedInterpreter {
    scripts: HashMap<u32, Vec<Op>>,
    current: Option<(u32, usize)>,
    suspend: Arc<SuspendFlag>,
    trace: Trace,
}

impl ScriptedInterpreter {
    pub fn new() -> (Self, Trace) {
        let trace = Trace::default();
        let interp = Self {
            scripts: HashMap::new(),
            current: None,
            suspend: Arc::new(SuspendFlag::new()),
            trace: trace.clone(),
        };
        (interp, trace)
    }

    pub fn script(mut self, func: u32, ops: Vec<Op>) -> Self {
        self.scripts.insert(func, ops);
        self
    }

    fn log(&self, line: String) {
        self.trace.lock().unwrap().push(line);
    }

    fn execute(&mut self, env: &mut HostEnv<'_>, mode: ResumeMode) -> Status {
        let mut executed = 0;
        loop {
            let Some((func, pc)) = self.current else {
                return Status::Returned(Vec::new());
            };
            if self.suspend.take() {
                return Status::Trapped(Trap::Debug(TrapKind::Suspended));
            }
            if executed > 0 && mode != ResumeMode::Continue {
                return Status::Trapped(Trap::Debug(TrapKind::StepCompleted));
            }

            let Some(op) = self.scripts.get(&func).and_then(|ops| ops.get(pc)).cloned() else {
                self.current = None;
                self.log(format!("return {func}"));
                return Status::Returned(Vec::new());
            };

            match op {
                Op::Host { import, args } => {
                    self.current = Some((func, pc + 1));
                    executed += 1;
                    match env.call_import(import, &args) {
                        Ok(results) => self.log(format!("host {import} -> {results:?}")),
                        Err(trap) => {
                            self.current = None;
                            return Status::Trapped(Trap::Host(trap));
                        }
                    }
                }
                Op::Store { offset, bytes } => {
                    self.current = Some((func, pc + 1));
                    executed += 1;
                    env.memory
                        .slice_mut(offset, bytes.len() as u64)
                        .unwrap()
                        .copy_from_slice(&bytes);
                }
                Op::Dump { offset, len } => {
                    self.current = Some((func, pc + 1));
                    executed += 1;
                    let bytes = env.memory.slice(offset, len).unwrap().to_vec();
                    self.log(format!("dump {}", String::from_utf8_lossy(&bytes)));
                }
                Op::Break => {
                    self.current = Some((func, pc + 1));
                    self.log(format!("break {func}@{pc}"));
                    return Status::Trapped(Trap::Debug(TrapKind::Breakpoint));
                }
                Op::Spin => std::thread::yield_now(),
            }
        }
    }
}

impl Interpreter for ScriptedInterpreter {
    fn invoke(&mut self, env: &mut HostEnv<'_>, func: FuncIndex, args: &[Value]) -> Status {
        self.log(format!("call {} {args:?}", func.0));
        self.current = Some((func.0, 0));
        self.execute(env, ResumeMode::Continue)
    }

    fn resume(&mut self, env: &mut HostEnv<'_>, mode: ResumeMode) -> Status {
        self.log(format!("resume {mode:?}"));
        self.execute(env, mode)
    }

    fn suspend_signal(&self) -> Arc<dyn SuspendSignal> {
        self.suspend.clone()
    }
}

// ============================================================================
// Module builder
// ============================================================================

fn push_leb128(buf: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn push_name(buf: &mut Vec<u8>, name: &str) {
    push_leb128(buf, name.len() as u32);
    buf.extend_from_slice(name.as_bytes());
}

fn section(module: &mut Vec<u8>, id: u8, body: &[u8]) {
    module.push(id);
    push_leb128(module, body.len() as u32);
    module.extend_from_slice(body);
}

/// Builds guest modules from `env` imports and exported entry points
#[derive(Default)]
pub struct GuestModule {
    types: Vec<(Vec<ValType>, Vec<ValType>)>,
    imports: Vec<(String, u32)>,
    functions: Vec<(String, u32)>,
    raw_event_slot: Option<u32>,
}

impl GuestModule {
    pub fn new() -> Self {
        Self::default()
    }

    fn type_index(&mut self, params: &[ValType], results: &[ValType]) -> u32 {
        let ty = (params.to_vec(), results.to_vec());
        match self.types.iter().position(|t| *t == ty) {
            Some(i) => i as u32,
            None => {
                self.types.push(ty);
                (self.types.len() - 1) as u32
            }
        }
    }

    /// Import a host function by name with its host signature
    pub fn import(&mut self, name: &str) -> u32 {
        let host = warden::guest::HOST_FUNCTIONS
            .iter()
            .find(|f| f.name == name)
            .unwrap();
        let ty = self.type_index(host.params, host.results);
        self.imports.push((name.to_owned(), ty));
        (self.imports.len() - 1) as u32
    }

    /// Export an entry point; returns its function index
    pub fn entry(&mut self, name: &str, params: &[ValType]) -> u32 {
        let ty = self.type_index(params, &[]);
        self.functions.push((name.to_owned(), ty));
        (self.imports.len() + self.functions.len() - 1) as u32
    }

    pub fn raw_event_slot(&mut self, offset: u32) -> &mut Self {
        self.raw_event_slot = Some(offset);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut module = vec![0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00];

        let mut types = Vec::new();
        push_leb128(&mut types, self.types.len() as u32);
        for (params, results) in &self.types {
            types.push(0x60);
            push_leb128(&mut types, params.len() as u32);
            types.extend(params.iter().map(|t| t.to_byte()));
            push_leb128(&mut types, results.len() as u32);
            types.extend(results.iter().map(|t| t.to_byte()));
        }
        section(&mut module, 1, &types);

        let mut imports = Vec::new();
        push_leb128(&mut imports, self.imports.len() as u32);
        for (name, ty) in &self.imports {
            push_name(&mut imports, "env");
            push_name(&mut imports, name);
            imports.push(0);
            push_leb128(&mut imports, *ty);
        }
        section(&mut module, 2, &imports);

        let mut functions = Vec::new();
        push_leb128(&mut functions, self.functions.len() as u32);
        for (_, ty) in &self.functions {
            push_leb128(&mut functions, *ty);
        }
        section(&mut module, 3, &functions);

        if let Some(offset) = self.raw_event_slot {
            // One immutable i32 global: i32.const <offset> end
            let mut globals = vec![1, 0x7F, 0, 0x41];
            let mut value = offset as i64;
            loop {
                let byte = (value & 0x7F) as u8;
                value >>= 7;
                if (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0) {
                    globals.push(byte);
                    break;
                }
                globals.push(byte | 0x80);
            }
            globals.push(0x0B);
            section(&mut module, 6, &globals);
        }

        let mut exports = Vec::new();
        let count = self.functions.len() + usize::from(self.raw_event_slot.is_some());
        push_leb128(&mut exports, count as u32);
        for (i, (name, _)) in self.functions.iter().enumerate() {
            push_name(&mut exports, name);
            exports.push(0);
            push_leb128(&mut exports, (self.imports.len() + i) as u32);
        }
        if self.raw_event_slot.is_some() {
            push_name(&mut exports, "raw_event_slot");
            exports.push(3);
            push_leb128(&mut exports, 0);
        }
        section(&mut module, 7, &exports);

        module
    }
}

/// Sandbox root with a readable save file
pub fn sandbox_root() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("data")).unwrap();
    std::fs::write(dir.path().join("data/save.bin"), b"level=3").unwrap();
    dir
}
