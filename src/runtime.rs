//! Runtime assembly and the guest frame loop
//!
//! A [`Runtime`] owns one guest instance: its memory, capability table,
//! console, event channel and execution control. Nothing is global, so any
//! number of runtimes can coexist in one process.
//!
//! It splits into three parts, one per thread role:
//!
//! ```text
//!   OS thread                guest thread               control thread
//!  ┌──────────┐   events   ┌─────────────┐   pause    ┌─────────────────┐
//!  │  OsPort  │ ─────────► │   GuestVm   │ ◄────────► │ DebugController │
//!  └──────────┘  (ring)    └─────────────┘  (control) └─────────────────┘
//! ```
//!
//! The guest thread runs [`GuestVm::run`]: `on_init`, an initial
//! `on_resize`, then one frame per `frame_interval` until a quit.

use crate::config::RuntimeConfig;
use crate::console::Console;
use crate::error::{LoadError, RuntimeFault};
use crate::events::{Event, EventError, EventReceiver, EventSender, event_channel};
use crate::exec::{
    Completion, ControlError, DebugCommand, ExecState, ExecutionControl, Interpreter, TrapKind,
    invoke_controlled,
};
use crate::guest::abi::RAW_EVENT_SLOT_GLOBAL;
use crate::guest::{
    Clock, EntryPoint, EntryPoints, HostEnv, ImportMap, Linker, ModuleInfo, Value, WindowBackend,
};
use crate::io::{FileAccess, file};
use crate::sandbox::{CapabilityTable, GuestMemory, Handle};
use std::io;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How a guest run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmExit {
    /// A quit or window-close event was delivered and `on_terminate` ran
    Finished,
    /// The run was abandoned by a quit request
    Quit,
}

pub struct Runtime {
    vm: GuestVm,
    port: OsPort,
    controller: DebugController,
}

impl Runtime {
    pub fn new(
        config: RuntimeConfig,
        module_bytes: &[u8],
        interpreter: Box<dyn Interpreter>,
        window: Box<dyn WindowBackend>,
    ) -> Result<Self, LoadError> {
        config.validate()?;

        let module = ModuleInfo::parse(module_bytes)?;
        let imports = Linker::link(&module)?;
        let entry_points = EntryPoints::bind(&module);
        let raw_event_slot = module
            .exported_i32_global(RAW_EVENT_SLOT_GLOBAL)
            .map(|slot| slot as u32);

        let memory = GuestMemory::new(config.memory.initial_bytes, config.memory.reserved_bytes)?;

        let mut capabilities = CapabilityTable::with_capacity(config.max_capabilities);
        let (root, error) = file::open_root(&mut capabilities, &config.app_root, FileAccess::READ_WRITE);
        if !error.is_ok() {
            warn!(root = %config.app_root.display(), %error, "couldn't open sandbox root");
        }

        let (sender, receiver) = event_channel(config.event_ring_exp)?;
        let control = Arc::new(ExecutionControl::new(interpreter.suspend_signal()));

        info!(
            imports = imports.len(),
            entry_points = entry_points.bound_count(),
            raw_event_slot = raw_event_slot.is_some(),
            "guest module loaded"
        );

        Ok(Self {
            vm: GuestVm {
                interpreter,
                window,
                memory,
                capabilities,
                console: Console::new(config.console_capacity),
                clock: Clock::new(),
                imports,
                entry_points,
                raw_event_slot,
                root,
                events: receiver,
                control: Arc::clone(&control),
                frames: 0,
                config,
            },
            port: OsPort {
                sender,
                control: Arc::clone(&control),
            },
            controller: DebugController { control },
        })
    }

    pub fn into_parts(self) -> (GuestVm, OsPort, DebugController) {
        (self.vm, self.port, self.controller)
    }

    /// Run the guest on its own thread
    pub fn spawn(self) -> io::Result<RuntimeHandle> {
        let (mut vm, port, controller) = self.into_parts();
        let thread = thread::Builder::new()
            .name("guest-vm".to_owned())
            .spawn(move || vm.run())?;

        Ok(RuntimeHandle {
            port,
            controller,
            thread,
        })
    }
}

pub struct RuntimeHandle {
    pub port: OsPort,
    pub controller: DebugController,
    thread: JoinHandle<Result<VmExit, RuntimeFault>>,
}

impl RuntimeHandle {
    pub fn join(self) -> Result<VmExit, RuntimeFault> {
        self.thread.join().unwrap_or_else(|_| {
            error!("guest thread panicked");
            Err(RuntimeFault::Panicked)
        })
    }
}

// ============================================================================
// Guest thread
// ============================================================================

/// Marks the guest terminated on every exit path, including unwinding
struct TerminateOnDrop(Arc<ExecutionControl>);

impl Drop for TerminateOnDrop {
    fn drop(&mut self) {
        self.0.terminate();
    }
}

pub struct GuestVm {
    interpreter: Box<dyn Interpreter>,
    window: Box<dyn WindowBackend>,
    memory: GuestMemory,
    capabilities: CapabilityTable,
    console: Console,
    clock: Clock,
    imports: ImportMap,
    entry_points: EntryPoints,
    /// Guest offset receiving each event header before `on_raw_event`
    raw_event_slot: Option<u32>,
    root: Handle,
    events: EventReceiver,
    control: Arc<ExecutionControl>,
    frames: u64,
    config: RuntimeConfig,
}

impl GuestVm {
    pub fn run(&mut self) -> Result<VmExit, RuntimeFault> {
        let _terminate = TerminateOnDrop(Arc::clone(&self.control));

        let result = self.run_frames();
        match &result {
            Ok(exit) => info!(?exit, frames = self.frames, "guest stopped"),
            Err(fault) => error!(%fault, frames = self.frames, "guest run failed"),
        }
        result
    }

    fn run_frames(&mut self) -> Result<VmExit, RuntimeFault> {
        if self.config.break_on_start && self.control.pause(TrapKind::Breakpoint) == DebugCommand::Quit {
            return Ok(VmExit::Quit);
        }

        if self.call(EntryPoint::OnInit, &[])?.is_break() {
            return Ok(VmExit::Quit);
        }
        let size = self.config.window_size;
        let args = [Value::I32(size.width as i32), Value::I32(size.height as i32)];
        if self.call(EntryPoint::OnResize, &args)?.is_break() {
            return Ok(VmExit::Quit);
        }

        let frame_interval = self.config.frame_interval();
        loop {
            if self.control.quit_requested() {
                return Ok(VmExit::Quit);
            }
            if let ControlFlow::Break(exit) = self.drain_events()? {
                return Ok(exit);
            }
            if self.call(EntryPoint::OnFrameRefresh, &[])?.is_break() {
                return Ok(VmExit::Quit);
            }
            self.frames += 1;
            thread::sleep(frame_interval);
        }
    }

    fn drain_events(&mut self) -> Result<ControlFlow<VmExit>, RuntimeFault> {
        loop {
            let event = match self.events.next_event() {
                Ok(Some(event)) => event,
                Ok(None) => return Ok(ControlFlow::Continue(())),
                Err(err) => {
                    error!(%err, "discarding undecodable event");
                    return Ok(ControlFlow::Continue(()));
                }
            };

            if self.deliver(&event)?.is_break() {
                return Ok(ControlFlow::Break(VmExit::Quit));
            }
            if event.is_quit() {
                let exit = match self.call(EntryPoint::OnTerminate, &[])? {
                    ControlFlow::Continue(()) => VmExit::Finished,
                    ControlFlow::Break(()) => VmExit::Quit,
                };
                return Ok(ControlFlow::Break(exit));
            }
        }
    }

    /// Hand one event to the raw handler, then to its typed handler
    fn deliver(&mut self, event: &Event) -> Result<ControlFlow<()>, RuntimeFault> {
        if let Some(slot) = self.raw_event_slot {
            self.memory
                .write_pod(slot, &event.header())
                .map_err(RuntimeFault::RawEventSlot)?;
            if self.call(EntryPoint::OnRawEvent, &[Value::I32(slot as i32)])?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }

        let (entry, args) = match *event {
            Event::WindowResize { width, height } => (
                EntryPoint::OnResize,
                vec![Value::I32(width as i32), Value::I32(height as i32)],
            ),
            Event::MouseDown { button } => (EntryPoint::OnMouseDown, vec![Value::I32(button)]),
            Event::MouseUp { button } => (EntryPoint::OnMouseUp, vec![Value::I32(button)]),
            Event::MouseEnter => (EntryPoint::OnMouseEnter, Vec::new()),
            Event::MouseLeave => (EntryPoint::OnMouseLeave, Vec::new()),
            Event::MouseMove { x, y, dx, dy } => (
                EntryPoint::OnMouseMove,
                vec![Value::F32(x), Value::F32(y), Value::F32(dx), Value::F32(dy)],
            ),
            Event::MouseWheel { dx, dy } => (EntryPoint::OnMouseWheel, vec![Value::F32(dx), Value::F32(dy)]),
            Event::KeyDown { scan_code, key_code } => (
                EntryPoint::OnKeyDown,
                vec![Value::I32(scan_code as i32), Value::I32(key_code as i32)],
            ),
            Event::KeyUp { scan_code, key_code } => (
                EntryPoint::OnKeyUp,
                vec![Value::I32(scan_code as i32), Value::I32(key_code as i32)],
            ),
            // Frames are driven by the loop; the rest only reach `on_raw_event`
            Event::FrameRefresh | Event::PathDrop { .. } | Event::Quit | Event::WindowClose => {
                return Ok(ControlFlow::Continue(()));
            }
        };

        self.call(entry, &args)
    }

    /// Invoke an entry point if the guest exports it
    ///
    /// Breaks if a quit command abandoned the invocation.
    fn call(&mut self, entry: EntryPoint, args: &[Value]) -> Result<ControlFlow<()>, RuntimeFault> {
        let Some(func) = self.entry_points.get(entry) else {
            return Ok(ControlFlow::Continue(()));
        };

        let mut env = HostEnv::new(
            &mut self.memory,
            &mut self.capabilities,
            &mut self.console,
            self.window.as_mut(),
            &self.clock,
            self.root,
            &self.imports,
        );
        match invoke_controlled(&self.control, self.interpreter.as_mut(), &mut env, entry.name(), func, args)? {
            Completion::Returned(_) => Ok(ControlFlow::Continue(())),
            Completion::Quit => {
                debug!(entry = entry.name(), "invocation abandoned");
                Ok(ControlFlow::Break(()))
            }
        }
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    pub fn entry_points(&self) -> &EntryPoints {
        &self.entry_points
    }

    /// Frames completed so far
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

// ============================================================================
// OS thread
// ============================================================================

pub struct OsPort {
    sender: EventSender,
    control: Arc<ExecutionControl>,
}

impl OsPort {
    /// Forward a host event to the guest
    ///
    /// While the guest is paused, input is dropped and a quit releases it
    /// with a quit request instead of waiting in the queue.
    pub fn dispatch(&mut self, event: &Event) -> Result<(), EventError> {
        if self.control.is_paused() {
            if event.is_quit() {
                self.control.request_quit();
                return Ok(());
            }
            if event.is_input() {
                debug!(kind = ?event.kind(), "input dropped while paused");
                return Ok(());
            }
        }
        self.sender.send(event)
    }

    /// Events dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.sender.dropped()
    }
}

// ============================================================================
// Control thread
// ============================================================================

#[derive(Clone)]
pub struct DebugController {
    control: Arc<ExecutionControl>,
}

impl DebugController {
    pub fn command(&self, command: DebugCommand) -> Result<(), ControlError> {
        self.control.resume(command)
    }

    pub fn resume(&self) -> Result<(), ControlError> {
        self.command(DebugCommand::Continue)
    }

    pub fn step(&self) -> Result<(), ControlError> {
        self.command(DebugCommand::SingleStep)
    }

    pub fn step_line(&self) -> Result<(), ControlError> {
        self.command(DebugCommand::StepOverLine)
    }

    /// Stop the guest, whether paused or running
    pub fn quit(&self) {
        self.control.request_quit();
    }

    /// Ask the running guest to pause at its next safe point
    pub fn suspend(&self) -> bool {
        self.control.request_suspend()
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    pub fn state(&self) -> ExecState {
        self.control.state()
    }

    pub fn trap_reason(&self) -> Option<TrapKind> {
        self.control.trap_reason()
    }

    pub fn pause_count(&self) -> u64 {
        self.control.pause_count()
    }

    pub fn wait_for_pause(&self, timeout: Duration) -> bool {
        self.control.wait_for_pause(timeout)
    }

    pub fn wait_for_exit(&self, timeout: Duration) -> bool {
        self.control.wait_for_exit(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{ResumeMode, Status, SuspendFlag, SuspendSignal};
    use crate::guest::abi::{FuncIndex, ValType};
    use crate::guest::HeadlessWindow;
    use crate::guest::module::test_support::WasmBuilder;
    use std::sync::Mutex;

    /// Returns immediately from every call and records what was invoked
    struct Recorder {
        calls: Arc<Mutex<Vec<(u32, Vec<Value>)>>>,
        suspend: Arc<SuspendFlag>,
    }

    impl Interpreter for Recorder {
        fn invoke(&mut self, _env: &mut HostEnv<'_>, func: FuncIndex, args: &[Value]) -> Status {
            self.calls.lock().unwrap().push((func.0, args.to_vec()));
            Status::Returned(Vec::new())
        }

        fn resume(&mut self, _env: &mut HostEnv<'_>, _mode: ResumeMode) -> Status {
            Status::Returned(Vec::new())
        }

        fn suspend_signal(&self) -> Arc<dyn SuspendSignal> {
            self.suspend.clone()
        }
    }

    struct Guest {
        bytes: Vec<u8>,
        init: u32,
        resize: u32,
        key_down: u32,
        raw: u32,
        terminate: u32,
    }

    fn guest() -> Guest {
        let mut builder = WasmBuilder::new();
        let init = builder.entry("on_init", &[]);
        let resize = builder.entry("on_resize", &[ValType::I32, ValType::I32]);
        let key_down = builder.entry("on_key_down", &[ValType::I32, ValType::I32]);
        let raw = builder.entry("on_raw_event", &[ValType::I32]);
        let terminate = builder.entry("on_terminate", &[]);
        builder.export_i32_global(RAW_EVENT_SLOT_GLOBAL, 4096);
        Guest {
            bytes: builder.build(),
            init,
            resize,
            key_down,
            raw,
            terminate,
        }
    }

    fn runtime(bytes: &[u8], config: RuntimeConfig) -> (Runtime, Arc<Mutex<Vec<(u32, Vec<Value>)>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let interpreter = Recorder {
            calls: calls.clone(),
            suspend: Arc::new(SuspendFlag::new()),
        };
        let runtime = Runtime::new(
            config,
            bytes,
            Box::new(interpreter),
            Box::new(HeadlessWindow::new(640, 480)),
        )
        .unwrap();
        (runtime, calls)
    }

    fn test_config(root: &tempfile::TempDir) -> RuntimeConfig {
        RuntimeConfig {
            app_root: root.path().to_path_buf(),
            frame_interval_ms: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_event_sequence() {
        let root = tempfile::tempdir().unwrap();
        let guest = guest();
        let (runtime, calls) = runtime(&guest.bytes, test_config(&root));
        let (mut vm, mut port, controller) = runtime.into_parts();

        port.dispatch(&Event::KeyDown { scan_code: 30, key_code: 97 }).unwrap();
        port.dispatch(&Event::Quit).unwrap();
        assert_eq!(vm.run().unwrap(), VmExit::Finished);
        assert_eq!(controller.state(), ExecState::Terminated);

        let calls = calls.lock().unwrap();
        let funcs: Vec<u32> = calls.iter().map(|(f, _)| *f).collect();
        assert_eq!(
            funcs,
            vec![guest.init, guest.resize, guest.raw, guest.key_down, guest.raw, guest.terminate]
        );
        assert_eq!(calls[1].1, vec![Value::I32(1000), Value::I32(1000)]);
        assert_eq!(calls[3].1, vec![Value::I32(30), Value::I32(97)]);
        assert_eq!(calls[2].1, vec![Value::I32(4096)]);
    }

    #[test]
    fn test_raw_slot_holds_last_header() {
        let root = tempfile::tempdir().unwrap();
        let guest = guest();
        let (runtime, _) = runtime(&guest.bytes, test_config(&root));
        let (mut vm, mut port, _) = runtime.into_parts();

        port.dispatch(&Event::WindowClose).unwrap();
        vm.run().unwrap();

        let header: crate::events::EventHeader = vm.memory().read_pod(4096).unwrap();
        assert_eq!(header, Event::WindowClose.header());
    }

    #[test]
    fn test_raw_slot_outside_memory_faults() {
        let root = tempfile::tempdir().unwrap();
        let mut builder = WasmBuilder::new();
        builder.entry("on_raw_event", &[ValType::I32]);
        builder.export_i32_global(RAW_EVENT_SLOT_GLOBAL, -8);
        let (runtime, _) = runtime(&builder.build(), test_config(&root));
        let (mut vm, mut port, _) = runtime.into_parts();

        port.dispatch(&Event::MouseEnter).unwrap();
        assert!(matches!(vm.run(), Err(RuntimeFault::RawEventSlot(_))));
    }

    #[test]
    fn test_quit_request_stops_loop() {
        let root = tempfile::tempdir().unwrap();
        let guest = guest();
        let (runtime, calls) = runtime(&guest.bytes, test_config(&root));
        let (mut vm, _port, controller) = runtime.into_parts();

        controller.quit();
        assert_eq!(vm.run().unwrap(), VmExit::Quit);
        assert!(!calls.lock().unwrap().iter().any(|(f, _)| *f == guest.terminate));
    }

    #[test]
    fn test_unbound_entry_points_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        let (runtime, calls) = runtime(&WasmBuilder::new().build(), test_config(&root));
        let (mut vm, mut port, _) = runtime.into_parts();

        port.dispatch(&Event::MouseDown { button: 1 }).unwrap();
        port.dispatch(&Event::Quit).unwrap();
        assert_eq!(vm.run().unwrap(), VmExit::Finished);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unresolved_import_fails_load() {
        let root = tempfile::tempdir().unwrap();
        let mut builder = WasmBuilder::new();
        builder.import("env", "exec", &[], &[]);
        let result = Runtime::new(
            test_config(&root),
            &builder.build(),
            Box::new(Recorder {
                calls: Default::default(),
                suspend: Arc::new(SuspendFlag::new()),
            }),
            Box::new(HeadlessWindow::default()),
        );
        assert!(matches!(result, Err(LoadError::UnresolvedImport { .. })));
    }

    #[test]
    fn test_invalid_config_fails_load() {
        let root = tempfile::tempdir().unwrap();
        let config = RuntimeConfig {
            event_ring_exp: 2,
            ..test_config(&root)
        };
        let result = Runtime::new(
            config,
            &WasmBuilder::new().build(),
            Box::new(Recorder {
                calls: Default::default(),
                suspend: Arc::new(SuspendFlag::new()),
            }),
            Box::new(HeadlessWindow::default()),
        );
        assert!(matches!(result, Err(LoadError::Config(_))));
    }

    #[test]
    fn test_missing_root_still_loads() {
        let root = tempfile::tempdir().unwrap();
        let config = RuntimeConfig {
            app_root: "/nonexistent/warden/root".into(),
            ..test_config(&root)
        };
        let (runtime, _) = runtime(&WasmBuilder::new().build(), config);
        let (vm, _, _) = runtime.into_parts();
        assert_eq!(vm.capabilities().live_count(), 1);
    }
}
