//! Execution control shared by the guest thread and a control thread
//!
//! The guest thread parks itself in [`ExecutionControl::pause`] whenever the
//! interpreter reports a debug trap. A control thread (debugger UI, OS
//! thread) watches the state and releases it with [`ExecutionControl::resume`].
//!
//! Protocol:
//! - `paused` is only written while holding the mutex, so a resume can never
//!   slip in between the guest setting it and starting to wait
//! - the guest waits in a loop on `paused`, so spurious wakeups and
//!   notifications meant for other waiters are harmless
//! - the command is written before `paused` is cleared, so the guest always
//!   reads the command that released it
//!
//! `is_paused` reads the flag without locking; the OS thread polls it on
//! every event to decide whether input should be dropped.

use super::interp::{ResumeMode, SuspendSignal, TrapKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// What a paused guest should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCommand {
    Continue,
    SingleStep,
    StepOverLine,
    /// Abandon the current invocation without resuming it
    Quit,
}

impl DebugCommand {
    /// The interpreter resume mode, or `None` for `Quit`
    pub fn resume_mode(self) -> Option<ResumeMode> {
        match self {
            DebugCommand::Continue => Some(ResumeMode::Continue),
            DebugCommand::SingleStep => Some(ResumeMode::Instruction),
            DebugCommand::StepOverLine => Some(ResumeMode::Line),
            DebugCommand::Quit => None,
        }
    }
}

/// Guest-thread execution state as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Running,
    Paused,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("guest is not paused (state: {state:?})")]
    NotPaused { state: ExecState },
}

struct ControlInner {
    command: DebugCommand,
    state: ExecState,
    trap: Option<TrapKind>,
    quit_requested: bool,
    pauses: u64,
}

pub struct ExecutionControl {
    paused: AtomicBool,
    inner: Mutex<ControlInner>,
    /// Signalled when `paused` is cleared
    resumed: Condvar,
    /// Signalled on every state transition
    changed: Condvar,
    suspend: Arc<dyn SuspendSignal>,
}

impl ExecutionControl {
    pub fn new(suspend: Arc<dyn SuspendSignal>) -> Self {
        Self {
            paused: AtomicBool::new(false),
            inner: Mutex::new(ControlInner {
                command: DebugCommand::Continue,
                state: ExecState::Running,
                trap: None,
                quit_requested: false,
                pauses: 0,
            }),
            resumed: Condvar::new(),
            changed: Condvar::new(),
            suspend,
        }
    }

    // A poisoned lock only means a waiter panicked; the state is still coherent
    fn lock(&self) -> MutexGuard<'_, ControlInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Guest thread
    // =========================================================================

    /// Park the guest thread until a control thread resumes it
    ///
    /// Returns immediately with `Quit` if a quit was already requested.
    pub fn pause(&self, reason: TrapKind) -> DebugCommand {
        let mut inner = self.lock();
        if inner.quit_requested {
            return DebugCommand::Quit;
        }

        inner.state = ExecState::Paused;
        inner.trap = Some(reason);
        inner.pauses += 1;
        self.paused.store(true, Ordering::SeqCst);
        self.changed.notify_all();
        debug!(?reason, "guest paused");

        while self.paused.load(Ordering::SeqCst) {
            inner = self
                .resumed
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }

        let command = inner.command;
        inner.trap = None;
        inner.state = ExecState::Running;
        self.changed.notify_all();
        debug!(?command, "guest resumed");
        command
    }

    /// Mark the guest as finished; later resumes fail
    pub fn terminate(&self) {
        let mut inner = self.lock();
        inner.state = ExecState::Terminated;
        inner.trap = None;
        self.changed.notify_all();
    }

    // =========================================================================
    // Control thread
    // =========================================================================

    /// Release a paused guest with `command`
    pub fn resume(&self, command: DebugCommand) -> Result<(), ControlError> {
        let mut inner = self.lock();
        if !self.paused.load(Ordering::SeqCst) {
            return Err(ControlError::NotPaused { state: inner.state });
        }

        inner.command = command;
        self.paused.store(false, Ordering::SeqCst);
        self.resumed.notify_all();
        Ok(())
    }

    /// Lock-free check of the paused flag
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ExecState {
        self.lock().state
    }

    /// The trap the guest is currently paused on
    pub fn trap_reason(&self) -> Option<TrapKind> {
        self.lock().trap
    }

    /// Number of times the guest has paused
    pub fn pause_count(&self) -> u64 {
        self.lock().pauses
    }

    pub fn quit_requested(&self) -> bool {
        self.lock().quit_requested
    }

    /// Ask the running guest to stop at its next safe point
    ///
    /// Returns false if the guest is not running.
    pub fn request_suspend(&self) -> bool {
        if self.lock().state != ExecState::Running {
            return false;
        }
        self.suspend.request_suspend();
        true
    }

    /// Cooperative shutdown
    ///
    /// A paused guest is released with `Quit`. A running guest is asked to
    /// suspend, and the pause it reaches returns `Quit` straight away.
    pub fn request_quit(&self) {
        let mut inner = self.lock();
        inner.quit_requested = true;
        if self.paused.load(Ordering::SeqCst) {
            inner.command = DebugCommand::Quit;
            self.paused.store(false, Ordering::SeqCst);
            self.resumed.notify_all();
        } else if inner.state == ExecState::Running {
            self.suspend.request_suspend();
        }
        debug!(state = ?inner.state, "quit requested");
    }

    /// Block until the guest pauses or terminates, up to `timeout`
    ///
    /// Returns whether the guest is paused.
    pub fn wait_for_pause(&self, timeout: Duration) -> bool {
        let inner = self.lock();
        let (_inner, _) = self
            .changed
            .wait_timeout_while(inner, timeout, |inner| {
                !self.paused.load(Ordering::SeqCst) && inner.state != ExecState::Terminated
            })
            .unwrap_or_else(PoisonError::into_inner);
        self.is_paused()
    }

    /// Block until the guest terminates, up to `timeout`
    pub fn wait_for_exit(&self, timeout: Duration) -> bool {
        let inner = self.lock();
        let (inner, _) = self
            .changed
            .wait_timeout_while(inner, timeout, |inner| inner.state != ExecState::Terminated)
            .unwrap_or_else(PoisonError::into_inner);
        inner.state == ExecState::Terminated
    }
}
