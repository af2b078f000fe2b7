//! Error kinds surfaced by the bridge.
//!
//! Every public operation returns `Result<_, Error>`. Script failures are
//! captured by a `v8::TryCatch` and converted into one of the variants below
//! before control returns to the host; nothing is left pending on the isolate.

use std::fmt;
use std::sync::Arc;

use crate::value::Value;

/// Engine name reported in script errors.
pub const ENGINE_NAME: &str = "V8ScriptEngine";

pub(crate) const OUT_OF_MEMORY_MESSAGE: &str = "The V8 runtime has exceeded its memory limit";
pub(crate) const INTERRUPTED_MESSAGE: &str = "Script execution interrupted by host";
pub(crate) const STACK_LIMIT_MESSAGE: &str = "The V8 runtime has exceeded its stack usage limit";
pub(crate) const ENGINE_DESTROYED: &str = "The V8 script engine has been destroyed";

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Fatal: the heap governor latched the isolate. Every later call fails the same way.
    #[error("{OUT_OF_MEMORY_MESSAGE}")]
    OutOfMemory,

    /// Execution was terminated by `interrupt`, `terminate_execution` or a stack violation.
    #[error("{0}")]
    ScriptInterrupted(ScriptError),

    /// JavaScript compile or runtime error.
    #[error("{0}")]
    General(ScriptError),

    /// The isolate, context or holder has already been released.
    #[error("{0}")]
    EntityDisposed(&'static str),

    /// An error raised by host code, carried back across the boundary unchanged.
    #[error("{0}")]
    Host(HostError),

    /// The request cannot be forwarded (e.g. a script holder from another isolate).
    #[error("{0}")]
    ProxyFailure(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn general(message: impl Into<String>) -> Self {
        Error::General(ScriptError::new(message))
    }

    pub(crate) fn interrupted() -> Self {
        Error::ScriptInterrupted(ScriptError::new(INTERRUPTED_MESSAGE))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::OutOfMemory)
    }

    /// The script-side exception value, when one was thrown.
    pub fn exception(&self) -> Option<&Value> {
        match self {
            Error::General(e) | Error::ScriptInterrupted(e) => e.exception.as_ref(),
            _ => None,
        }
    }
}

/// Details of a JavaScript failure.
#[derive(Debug, Clone)]
pub struct ScriptError {
    pub engine_name: &'static str,
    pub message: String,
    pub stack_trace: Option<String>,
    pub exception: Option<Value>,
    pub inner: Option<HostError>,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            engine_name: ENGINE_NAME,
            message: message.into(),
            stack_trace: None,
            exception: None,
            inner: None,
        }
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// An error produced by host code.
///
/// Cloning shares the same allocation, so identity survives a trip through
/// JavaScript: a host error thrown into script, caught there and rethrown
/// comes back as the same `HostError` (see [`HostError::same_as`]).
#[derive(Clone)]
pub struct HostError(Arc<dyn std::error::Error + Send + Sync>);

impl HostError {
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(error))
    }

    pub fn msg(message: impl Into<String>) -> Self {
        Self(Arc::new(Message(message.into())))
    }

    pub fn same_as(&self, other: &HostError) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn get_ref(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        &*self.0
    }
}

impl fmt::Debug for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostError").field(&self.0.to_string()).finish()
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_error_identity_survives_clone() {
        let a = HostError::msg("boom");
        let b = a.clone();
        let c = HostError::msg("boom");

        assert!(a.same_as(&b));
        assert!(!a.same_as(&c));
        assert_eq!(b.to_string(), "boom");
    }

    #[test]
    fn out_of_memory_is_fatal() {
        assert!(Error::OutOfMemory.is_fatal());
        assert!(!Error::general("x").is_fatal());
        assert_eq!(Error::OutOfMemory.to_string(), OUT_OF_MEMORY_MESSAGE);
    }
}
