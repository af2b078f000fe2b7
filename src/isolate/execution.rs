//! Execution scopes, the execution state machine, and termination.
//!
//! Every script entry (execute, invoke, property access, module evaluation)
//! runs inside an execution scope. Scopes nest when host code calls back into
//! script. The outermost scope records the native stack base used by the
//! stack watcher and is the only place where a termination is cancelled, so a
//! termination unwinds through every nested frame first.
//!
//! ```text
//!            enter scope                  terminate_execution
//!   Idle ───────────────▶ Executing ───────────────────────▶ Terminating
//!    ▲                      │   ▲                                 │
//!    │  outermost exit      │   │ message loop exits              │ outermost exit
//!    └──────────────────────┘   │                                 ▼
//!                        AwaitingDebugger / PausedInDebugger     Idle
//!
//!   any state ── heap over budget ──▶ OutOfMemory (latched)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::IsolateInner;
use super::lock::PauseReason;
use crate::error::{Error, INTERRUPTED_MESSAGE, STACK_LIMIT_MESSAGE, ScriptError};
use crate::security::heap_watch::{stack_position, used_heap_size};
use crate::security::stack_limit::{self, DEFAULT_STACK_DEPTH, STACK_OVERFLOW_MESSAGE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecutionState {
    Idle = 0,
    Executing = 1,
    AwaitingDebugger = 2,
    PausedInDebugger = 3,
    Terminating = 4,
    OutOfMemory = 5,
}

impl ExecutionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Executing,
            2 => Self::AwaitingDebugger,
            3 => Self::PausedInDebugger,
            4 => Self::Terminating,
            5 => Self::OutOfMemory,
            _ => Self::Idle,
        }
    }
}

/// Why the current execution is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Termination {
    None,
    Interrupted,
    StackLimit,
}

#[derive(Default)]
pub(crate) struct ExecutionTracker {
    state: AtomicU8,
    /// Number of open execution scopes. Readable from any thread.
    active: AtomicUsize,
    /// Native stack position of the outermost scope; 0 when idle.
    stack_base: Mutex<usize>,
    terminating: AtomicBool,
    stack_violation: AtomicBool,
    /// V8's stack guard currently sits at `max_stack_usage` below a scope base.
    stack_limit_installed: AtomicBool,
}

impl ExecutionTracker {
    pub(crate) fn state(&self) -> ExecutionState {
        ExecutionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ExecutionState) {
        // the OOM latch never clears
        let _ = self.state.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            (current != ExecutionState::OutOfMemory as u8).then_some(state as u8)
        });
    }

    pub(crate) fn active_scopes(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn enter_pause(&self, reason: PauseReason) {
        self.set_state(match reason {
            PauseReason::AwaitingDebugger => ExecutionState::AwaitingDebugger,
            PauseReason::PausedInDebugger => ExecutionState::PausedInDebugger,
        });
    }

    pub(crate) fn leave_pause(&self, previous: Option<PauseReason>) {
        match previous {
            Some(reason) => self.enter_pause(reason),
            None if self.terminating.load(Ordering::SeqCst) => self.set_state(ExecutionState::Terminating),
            None if self.active_scopes() > 0 => self.set_state(ExecutionState::Executing),
            None => self.set_state(ExecutionState::Idle),
        }
    }

    fn termination(&self) -> Termination {
        if self.stack_violation.load(Ordering::SeqCst) {
            Termination::StackLimit
        } else if self.terminating.load(Ordering::SeqCst) {
            Termination::Interrupted
        } else {
            Termination::None
        }
    }
}

impl IsolateInner {
    /// Run `f` inside an execution scope. Requires the isolate lock.
    pub(crate) fn execution_scope<R>(&self, f: impl FnOnce() -> Result<R, Error>) -> Result<R, Error> {
        if self.out_of_memory() {
            return Err(Error::OutOfMemory);
        }

        let here = stack_position();
        let outermost = self.execution.active.fetch_add(1, Ordering::SeqCst) == 0;

        if outermost {
            *self.execution.stack_base.lock() = here;
            self.install_stack_limit(here);
            self.execution.set_state(ExecutionState::Executing);
        } else if let Err(error) = self.check_stack_usage() {
            self.execution.active.fetch_sub(1, Ordering::SeqCst);
            return Err(error);
        }

        let result = f();

        // V8's guard tripped at the configured depth
        if let Err(Error::General(error)) = &result {
            let max = self.max_stack_usage.load(Ordering::SeqCst);
            if max > 0 && error.message.contains(STACK_OVERFLOW_MESSAGE) {
                self.flag_stack_violation(max);
            }
        }

        let termination = self.execution.termination();
        self.execution.active.fetch_sub(1, Ordering::SeqCst);

        if outermost {
            *self.execution.stack_base.lock() = 0;
            self.reset_stack_limit(here);
            if termination != Termination::None && !self.out_of_memory() {
                self.handle.cancel_terminate_execution();
            }
            self.execution.terminating.store(false, Ordering::SeqCst);
            self.execution.stack_violation.store(false, Ordering::SeqCst);
            self.execution.set_state(ExecutionState::Idle);
        }

        self.classify(result, termination)
    }

    /// Map the raw outcome of a scope onto the public error kinds.
    fn classify<R>(&self, result: Result<R, Error>, termination: Termination) -> Result<R, Error> {
        if self.out_of_memory() {
            return match result {
                Err(_) => Err(Error::OutOfMemory),
                Ok(_) if termination != Termination::None => Err(Error::OutOfMemory),
                ok => ok,
            };
        }

        match (result, termination) {
            (Err(Error::ScriptInterrupted(_)) | Err(Error::General(_)), Termination::StackLimit) => {
                Err(Error::General(ScriptError::new(STACK_LIMIT_MESSAGE)))
            }
            (Err(Error::ScriptInterrupted(error)), _) if !self.options.enable_interrupt_propagation => {
                Err(Error::General(ScriptError {
                    message: INTERRUPTED_MESSAGE.to_string(),
                    ..error
                }))
            }
            (result, _) => result,
        }
    }

    /// Terminate script execution.
    ///
    /// Without `force` this only acts when script is running. A paused
    /// message loop is asked to exit with [`MessageLoopExit::Terminated`].
    ///
    /// [`MessageLoopExit::Terminated`]: super::lock::MessageLoopExit::Terminated
    pub(crate) fn terminate_execution(&self, force: bool) {
        let paused = self
            .queue
            .request_exit(super::lock::MessageLoopExit::Terminated);

        if force || paused || self.execution.active_scopes() > 0 {
            tracing::debug!("Terminating execution (isolate {}, force: {})", self.name, force);
            self.execution.terminating.store(true, Ordering::SeqCst);
            self.execution.set_state(ExecutionState::Terminating);
            self.handle.terminate_execution();
        }
    }

    pub(crate) fn cancel_terminate_execution(&self) {
        self.handle.cancel_terminate_execution();
        self.execution.terminating.store(false, Ordering::SeqCst);
        self.execution.stack_violation.store(false, Ordering::SeqCst);
        if self.execution.active_scopes() > 0 {
            self.execution.set_state(ExecutionState::Executing);
        } else {
            self.execution.set_state(ExecutionState::Idle);
        }
    }

    pub(crate) fn is_execution_terminating(&self) -> bool {
        self.handle.is_execution_terminating() || self.execution.terminating.load(Ordering::SeqCst)
    }

    /// Latch the isolate out of memory and stop whatever is running.
    pub(crate) fn latch_out_of_memory(&self) {
        if !self.out_of_memory.swap(true, Ordering::SeqCst) {
            tracing::error!("Isolate {} exceeded its heap budget", self.name);
        }
        self.execution
            .state
            .store(ExecutionState::OutOfMemory as u8, Ordering::SeqCst);
        self.handle.terminate_execution();
    }

    /// Heap and stack sample. Runs on the isolate thread from an interrupt.
    pub(crate) fn sample(&self, isolate: &mut v8::Isolate) {
        let max_heap = self.max_heap_size.load(Ordering::SeqCst);
        if max_heap > 0 && !self.options.disable_heap_size_violation_interrupt && !self.out_of_memory() {
            let used = used_heap_size(isolate);
            if used > max_heap {
                tracing::warn!("Heap usage {} exceeds limit {} ({})", used, max_heap, self.name);
                self.latch_out_of_memory();
            }
        }

        // Sync the heap-limit latch into the state machine.
        if self.out_of_memory() && self.execution.state() != ExecutionState::OutOfMemory {
            self.latch_out_of_memory();
        }

        let _ = self.check_stack_usage();
    }

    /// Terminate when the native stack has grown past `max_stack_usage`
    /// below the outermost execution scope.
    pub(crate) fn check_stack_usage(&self) -> Result<(), Error> {
        let max = self.max_stack_usage.load(Ordering::SeqCst);
        if max == 0 {
            return Ok(());
        }
        let base = *self.execution.stack_base.lock();
        if base == 0 {
            return Ok(());
        }

        let here = stack_position();
        if base.saturating_sub(here) > max {
            self.flag_stack_violation(max);
            return Err(Error::General(ScriptError::new(STACK_LIMIT_MESSAGE)));
        }
        Ok(())
    }

    fn flag_stack_violation(&self, max: usize) {
        if !self.execution.stack_violation.swap(true, Ordering::SeqCst) {
            tracing::warn!("Stack usage exceeds {} bytes ({})", max, self.name);
        }
        self.execution.terminating.store(true, Ordering::SeqCst);
        self.execution.set_state(ExecutionState::Terminating);
        self.handle.terminate_execution();
    }

    /// Point V8's stack guard at `max_stack_usage` below `base`, so script
    /// that recurses without leaving V8 stops at the same depth.
    fn install_stack_limit(&self, base: usize) {
        let max = self.max_stack_usage.load(Ordering::SeqCst);
        if max == 0 {
            return;
        }
        let Some(isolate) = self.entered_isolate() else {
            return;
        };
        if stack_limit::set_stack_limit(isolate, base.saturating_sub(max)) {
            self.execution.stack_limit_installed.store(true, Ordering::SeqCst);
        }
    }

    /// Put V8's guard back at its default depth below `base`.
    fn reset_stack_limit(&self, base: usize) {
        if !self.execution.stack_limit_installed.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(isolate) = self.entered_isolate() {
            stack_limit::set_stack_limit(isolate, base.saturating_sub(DEFAULT_STACK_DEPTH));
        }
    }

    fn entered_isolate(&self) -> Option<&v8::Isolate> {
        let isolate = self.entered.load(Ordering::SeqCst);
        // SAFETY: execution scopes run under the lock, inside the outermost
        // Locker that published this pointer.
        (!isolate.is_null()).then(|| unsafe { &*isolate })
    }
}
