//! Re-entrant V8 isolate/context bridge.
//!
//! A host embeds V8 through [`V8Isolate`] (one heap, one recursive lock) and
//! [`V8Context`] (one global environment), exchanges [`Value`]s with script,
//! projects its own objects into JavaScript through [`HostObject`], and
//! supplies modules and a debugger transport through [`HostEnvironment`].

pub mod callbacks;
pub mod config;
pub mod context;
pub mod debug;
pub mod digest;
pub mod document;
pub mod error;
pub mod handles;
pub mod holder;
pub mod host;
pub mod isolate;
pub mod platform;
pub mod profiler;
pub mod value;
pub mod wire;

mod gc;
mod host_object;
mod marshal;
mod module_loader;
mod security;
mod shared;

// Core API
pub use context::{CacheKind, CacheResult, ContextStatistics, V8Context};
pub use isolate::{ExecutionState, IsolateStatistics, LockCallback, MessageLoopExit, PauseReason, V8Isolate};

pub use callbacks::{NativeCallback, NativeCallbackTimer};
pub use config::{ContextOptions, GlobalFlags, IsolateOptions};
pub use debug::{DebugAgent, DebugConnector};
pub use document::{DocumentInfo, DocumentKind};
pub use error::{Error, HostError, ScriptError};
pub use holder::{HostObjectHolder, ScriptHolder, SharedObjectInfo, V8Object};
pub use host::{
    DefaultHostEnvironment, HostAsyncEnumerator, HostEnumerator, HostEnvironment, HostObject, Invocability,
    LoadedModule, PropertyValue,
};
pub use profiler::{CpuProfile, CpuProfileHitLine, CpuProfileNode, CpuProfileSample, HeapStatistics};
pub use value::{BigIntValue, JsString, Value, ValueFlags, ValueSubtype, ValueType};
pub use wire::{WireTable, WireValue};
