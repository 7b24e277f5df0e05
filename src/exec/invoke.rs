//! Controlled invocation of guest functions

use super::control::{DebugCommand, ExecutionControl};
use super::interp::{Interpreter, Status, Trap};
use crate::error::RuntimeFault;
use crate::guest::abi::{FuncIndex, Value};
use crate::guest::host::HostEnv;
use tracing::error;

/// How a controlled invocation ended
#[derive(Debug, PartialEq)]
pub enum Completion {
    Returned(Vec<Value>),
    /// A `Quit` command abandoned the invocation
    Quit,
}

/// Invoke `func` and service debug traps until it returns
///
/// Each debug trap parks the calling thread in [`ExecutionControl::pause`];
/// the command it is released with decides how the interpreter resumes.
/// `Quit` abandons the invocation without resuming it. Any other trap is a
/// fault.
pub fn invoke_controlled(
    control: &ExecutionControl,
    interpreter: &mut dyn Interpreter,
    env: &mut HostEnv<'_>,
    entry: &'static str,
    func: FuncIndex,
    args: &[Value],
) -> Result<Completion, RuntimeFault> {
    let mut status = interpreter.invoke(env, func, args);

    loop {
        match status {
            Status::Returned(values) => return Ok(Completion::Returned(values)),
            Status::Trapped(Trap::Debug(kind)) => {
                let command = control.pause(kind);
                match command.resume_mode() {
                    Some(mode) => status = interpreter.resume(env, mode),
                    None => {
                        debug_assert_eq!(command, DebugCommand::Quit);
                        return Ok(Completion::Quit);
                    }
                }
            }
            Status::Trapped(trap) => {
                error!(entry, %trap, "guest invocation faulted");
                return Err(RuntimeFault::Trap { entry, trap });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::interp::{ResumeMode, SuspendFlag, SuspendSignal, TrapKind};
    use crate::exec::control::ExecState;
    use crate::guest::host::test_support::TestHost;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    /// Traps on each listed kind in turn, then returns `[42]`
    struct Trapper {
        traps: Vec<TrapKind>,
        resumes: Vec<ResumeMode>,
        suspend: Arc<SuspendFlag>,
    }

    impl Trapper {
        fn new(traps: &[TrapKind]) -> Self {
            Self {
                traps: traps.iter().rev().copied().collect(),
                resumes: Vec::new(),
                suspend: Arc::new(SuspendFlag::new()),
            }
        }

        fn next(&mut self) -> Status {
            match self.traps.pop() {
                Some(kind) => Status::Trapped(Trap::Debug(kind)),
                None => Status::Returned(vec![Value::I32(42)]),
            }
        }
    }

    impl Interpreter for Trapper {
        fn invoke(&mut self, _env: &mut HostEnv<'_>, _func: FuncIndex, _args: &[Value]) -> Status {
            self.next()
        }

        fn resume(&mut self, _env: &mut HostEnv<'_>, mode: ResumeMode) -> Status {
            self.resumes.push(mode);
            self.next()
        }

        fn suspend_signal(&self) -> Arc<dyn SuspendSignal> {
            self.suspend.clone()
        }
    }

    #[test]
    fn test_returns_without_pausing() {
        let mut host = TestHost::new();
        let mut interp = Trapper::new(&[]);
        let control = ExecutionControl::new(interp.suspend_signal());

        let done = invoke_controlled(&control, &mut interp, &mut host.env(), "on_init", FuncIndex(0), &[]);
        assert_eq!(done.unwrap(), Completion::Returned(vec![Value::I32(42)]));
        assert_eq!(control.pause_count(), 0);
    }

    #[test]
    fn test_debug_traps_resume_with_commands() {
        let mut interp = Trapper::new(&[TrapKind::Breakpoint, TrapKind::StepCompleted]);
        let control = Arc::new(ExecutionControl::new(interp.suspend_signal()));

        let driver = {
            let control = control.clone();
            thread::spawn(move || {
                assert!(control.wait_for_pause(Duration::from_secs(5)));
                assert_eq!(control.trap_reason(), Some(TrapKind::Breakpoint));
                control.resume(DebugCommand::SingleStep).unwrap();

                while control.pause_count() < 2 {
                    control.wait_for_pause(Duration::from_millis(10));
                }
                assert!(control.wait_for_pause(Duration::from_secs(5)));
                control.resume(DebugCommand::Continue).unwrap();
            })
        };

        let mut host = TestHost::new();
        let done = invoke_controlled(&control, &mut interp, &mut host.env(), "on_frame_refresh", FuncIndex(3), &[]);
        driver.join().unwrap();

        assert_eq!(done.unwrap(), Completion::Returned(vec![Value::I32(42)]));
        assert_eq!(interp.resumes, vec![ResumeMode::Instruction, ResumeMode::Continue]);
        assert_eq!(control.state(), ExecState::Running);
    }

    #[test]
    fn test_quit_abandons_invocation() {
        let mut interp = Trapper::new(&[TrapKind::Suspended]);
        let control = Arc::new(ExecutionControl::new(interp.suspend_signal()));

        let driver = {
            let control = control.clone();
            thread::spawn(move || {
                assert!(control.wait_for_pause(Duration::from_secs(5)));
                control.resume(DebugCommand::Quit).unwrap();
            })
        };

        let mut host = TestHost::new();
        let done = invoke_controlled(&control, &mut interp, &mut host.env(), "on_init", FuncIndex(0), &[]);
        driver.join().unwrap();

        assert_eq!(done.unwrap(), Completion::Quit);
        assert!(interp.resumes.is_empty());
    }

    #[test]
    fn test_other_traps_are_faults() {
        struct Faulty;
        impl Interpreter for Faulty {
            fn invoke(&mut self, _env: &mut HostEnv<'_>, _func: FuncIndex, _args: &[Value]) -> Status {
                Status::Trapped(Trap::Unreachable)
            }
            fn resume(&mut self, _env: &mut HostEnv<'_>, _mode: ResumeMode) -> Status {
                unreachable!()
            }
            fn suspend_signal(&self) -> Arc<dyn SuspendSignal> {
                Arc::new(SuspendFlag::new())
            }
        }

        let mut host = TestHost::new();
        let mut interp = Faulty;
        let control = ExecutionControl::new(interp.suspend_signal());
        match invoke_controlled(&control, &mut interp, &mut host.env(), "on_resize", FuncIndex(1), &[]) {
            Err(RuntimeFault::Trap { entry, trap }) => {
                assert_eq!(entry, "on_resize");
                assert!(matches!(trap, Trap::Unreachable));
            }
            other => panic!("expected fault, got {other:?}"),
        }
    }
}
