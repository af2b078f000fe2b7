//! Debugger plumbing.
//!
//! The first context created with `enable_debugging` brings up the isolate's
//! inspector and asks the host for a [`DebugAgent`]. The agent owns the
//! transport (a websocket, a pipe, a test channel); it talks to the isolate
//! through a [`DebugConnector`] and receives inspector traffic through
//! [`DebugAgent::send_message`].
//!
//! ```text
//! agent thread                       isolate lock owner
//! ────────────                       ──────────────────
//! connector.send_command(text) ──►   queue (nesting allowed)
//!                                      └─► session.dispatch(text)
//! agent.send_message(reply)    ◄──       └─► Outbound channel
//! ```
//!
//! Commands queue as nesting-allowed lock entries, so they are dispatched
//! while script runs and while the thread is parked in a paused message loop.

mod inspector;

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Arc, Weak};

pub(crate) use inspector::{Inspector, Session, Sink};

use crate::context::ContextInner;
use crate::error::Error;
use crate::isolate::{IsolateInner, MessageLoopExit, PauseReason};
use crate::profiler::ActiveProfile;

/// The host's end of a debugger connection.
pub trait DebugAgent: Send + Sync {
    /// An inspector protocol message (response or notification) for the client.
    fn send_message(&self, message: &str);
}

/// Handed to the host when its debug agent is created.
///
/// Every call queues work for the isolate and returns at once; it is safe
/// from any thread, including from inside `send_message`.
#[derive(Clone)]
pub struct DebugConnector {
    isolate: Weak<IsolateInner>,
}

impl DebugConnector {
    /// Open an inspector session for a newly attached client. Replaces any
    /// existing session.
    pub fn connect_client(&self) {
        self.queue(false, |isolate| connect(&isolate));
    }

    /// Dispatch a protocol message from the client.
    pub fn send_command(&self, command: impl Into<String>) {
        let command = command.into();
        self.queue(true, move |isolate| dispatch(&isolate, &command));
    }

    pub fn disconnect_client(&self) {
        self.queue(false, |isolate| disconnect(&isolate));
    }

    fn queue(&self, allow_nesting: bool, f: impl FnOnce(Arc<IsolateInner>) + Send + 'static) {
        let Some(isolate) = self.isolate.upgrade() else {
            tracing::trace!("Debug connector used after its isolate was disposed");
            return;
        };
        let weak = self.isolate.clone();
        isolate.call_with_lock(
            allow_nesting,
            Box::new(move |_| {
                if let Some(isolate) = weak.upgrade() {
                    f(isolate);
                }
            }),
        );
    }
}

impl std::fmt::Debug for DebugConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugConnector").finish_non_exhaustive()
    }
}

/// Per-isolate inspector state. Lives in a `LockedCell`.
///
/// Sessions are reference counted: a dispatch can re-enter the isolate (a
/// breakpoint parks it in the message loop) and a disconnect queued there
/// must not free the session still on the stack.
#[derive(Default)]
pub(crate) struct DebugState {
    inspector: Option<Rc<Inspector>>,
    agent: Option<Arc<dyn DebugAgent>>,
    client: Option<Rc<Session>>,
    pub(crate) profiles: HashMap<String, ActiveProfile>,
}

// SAFETY: only reached through the isolate's LockedCell, under the isolate
// lock; the Rc handles never leave that thread while it holds the lock.
unsafe impl Send for DebugState {}

impl DebugState {
    pub(crate) fn profile_count(&self) -> usize {
        self.profiles.len()
    }

    /// Drop sessions before the inspector, and everything before the isolate.
    pub(crate) fn shutdown(&mut self) {
        if !self.profiles.is_empty() {
            tracing::debug!("Discarding {} unfinished CPU profiles", self.profiles.len());
        }
        self.profiles.clear();
        self.client = None;
        self.inspector = None;
        self.agent = None;
    }
}

fn state(isolate: &IsolateInner) -> &mut DebugState {
    // SAFETY: callers hold the isolate lock and release the reference before
    // calling into V8 or the host.
    unsafe { isolate.debug.get() }
}

/// The isolate's inspector, created on first use.
pub(crate) fn inspector(isolate: &Arc<IsolateInner>, v8_isolate: &mut v8::Isolate) -> Rc<Inspector> {
    let state = state(isolate);
    state
        .inspector
        .get_or_insert_with(|| Rc::new(Inspector::new(v8_isolate, isolate)))
        .clone()
}

pub(crate) fn context_created(
    isolate: &Arc<IsolateInner>,
    scope: &mut v8::PinScope<'_, '_>,
    context: v8::Local<'_, v8::Context>,
    cx: &ContextInner,
) -> Result<(), Error> {
    inspector(isolate, scope).context_created(context, &cx.name);

    if state(isolate).agent.is_some() {
        return Ok(());
    }
    let connector = DebugConnector {
        isolate: Arc::downgrade(isolate),
    };
    let agent = isolate.env.create_debug_agent(
        &isolate.name,
        v8::V8::get_version(),
        isolate.options.debug_port,
        cx.options.enable_remote_debugging,
        connector,
    );
    match agent {
        Some(agent) => {
            tracing::info!(
                "Debugging enabled for isolate {} on port {}",
                isolate.name,
                isolate.options.debug_port
            );
            state(isolate).agent = Some(Arc::from(agent));
        }
        None => tracing::warn!("Host provided no debug agent for isolate {}", isolate.name),
    }
    Ok(())
}

pub(crate) fn context_destroyed(
    isolate: &Arc<IsolateInner>,
    _scope: &mut v8::PinScope<'_, '_>,
    context: v8::Local<'_, v8::Context>,
) {
    if let Some(inspector) = state(isolate).inspector.clone() {
        inspector.context_destroyed(context);
    }
}

fn connect(isolate: &Arc<IsolateInner>) {
    let debug = state(isolate);
    let (Some(inspector), Some(agent)) = (debug.inspector.clone(), debug.agent.clone()) else {
        tracing::warn!("Debugger client connected to isolate {} without an inspector", isolate.name);
        return;
    };
    let previous = debug.client.take();
    drop(previous);

    let session = Rc::new(inspector.connect(Sink::Agent(agent)));
    state(isolate).client = Some(session);
    tracing::debug!("Debugger client connected to isolate {}", isolate.name);
}

fn dispatch(isolate: &Arc<IsolateInner>, command: &str) {
    let Some(session) = state(isolate).client.clone() else {
        tracing::trace!("Dropping debugger command with no client connected");
        return;
    };
    session.dispatch(command);
}

fn disconnect(isolate: &Arc<IsolateInner>) {
    let session = state(isolate).client.take();
    if session.is_none() {
        return;
    }
    drop(session);
    tracing::debug!("Debugger client disconnected from isolate {}", isolate.name);

    // a paused script has nobody left to resume it
    if isolate.queue.pause_reason() == Some(PauseReason::PausedInDebugger) {
        isolate.queue.request_exit(MessageLoopExit::Resumed);
    }
}

/// After `await_debugger_and_pause` resumes, stop at the first statement.
pub(crate) fn schedule_pause_on_next_statement(isolate: &IsolateInner) {
    if let Some(session) = state(isolate).client.clone() {
        session.schedule_pause_on_next_statement("debugCommand");
    }
}

pub(crate) fn run_message_loop_on_pause(isolate: &IsolateInner) {
    let exit = isolate.run_message_loop(PauseReason::PausedInDebugger);
    if exit == MessageLoopExit::Terminated {
        tracing::debug!("Paused script terminated by host");
    }
}

pub(crate) fn quit_message_loop_on_pause(isolate: &IsolateInner) {
    isolate.queue.request_exit(MessageLoopExit::Resumed);
}

pub(crate) fn run_if_waiting_for_debugger(isolate: &IsolateInner) {
    if isolate.queue.pause_reason() == Some(PauseReason::AwaitingDebugger) {
        isolate.queue.request_exit(MessageLoopExit::Resumed);
    }
}
