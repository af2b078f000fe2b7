//! The host side of the bridge.
//!
//! [`HostObject`] is implemented by anything the host wants to project into
//! JavaScript; every method is an upcall made from inside a V8 callback on the
//! isolate thread. [`HostEnvironment`] is the per-isolate table of upcalls for
//! module loading, debugging and scheduling.
//!
//! Upcalls may call back into the bridge (e.g. run more script on the same
//! context); the isolate lock is recursive.

use crate::callbacks::{self, NativeCallback};
use crate::config::GlobalFlags;
use crate::debug::{DebugAgent, DebugConnector};
use crate::document::DocumentInfo;
use crate::error::HostError;
use crate::value::{Value, ValueFlags, ValueSubtype};

/// How a host object behaves when JavaScript calls it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Invocability {
    /// Not callable; `obj()` throws a `TypeError`.
    #[default]
    None,
    /// A callable delegate; projected as a JS function.
    Delegate,
    /// Callable, decided per call by the host.
    Dynamic,
    /// Calling the object invokes its default property.
    DefaultProperty,
}

impl Invocability {
    pub fn is_callable(self) -> bool {
        !matches!(self, Invocability::None)
    }
}

/// Result of a named property lookup.
#[derive(Debug, Clone, Default)]
pub struct PropertyValue {
    pub value: Value,
    /// The name refers to a method; script receives a function that calls
    /// [`HostObject::invoke_method`].
    pub is_method: bool,
    /// The value never changes and may be cached on the script-side object.
    pub cacheable: bool,
}

impl PropertyValue {
    pub fn nonexistent() -> Self {
        Self::default()
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn cacheable(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            cacheable: true,
            ..Default::default()
        }
    }

    pub fn method() -> Self {
        Self {
            value: Value::Undefined,
            is_method: true,
            cacheable: true,
        }
    }
}

fn unsupported(what: &str) -> HostError {
    HostError::msg(format!("The object does not support {what}"))
}

/// An object owned by the host and exposed to JavaScript.
pub trait HostObject: Send + Sync + 'static {
    fn get_named_property(&self, _name: &str) -> Result<PropertyValue, HostError> {
        Ok(PropertyValue::nonexistent())
    }

    fn set_named_property(&self, _name: &str, _value: Value) -> Result<(), HostError> {
        Err(unsupported("property assignment"))
    }

    fn delete_named_property(&self, _name: &str) -> Result<bool, HostError> {
        Ok(false)
    }

    fn property_names(&self) -> Result<Vec<String>, HostError> {
        Ok(Vec::new())
    }

    fn get_indexed_property(&self, _index: i32) -> Result<Value, HostError> {
        Ok(Value::Nonexistent)
    }

    fn set_indexed_property(&self, _index: i32, _value: Value) -> Result<(), HostError> {
        Err(unsupported("indexed assignment"))
    }

    fn delete_indexed_property(&self, _index: i32) -> Result<bool, HostError> {
        Ok(false)
    }

    fn property_indices(&self) -> Result<Vec<i32>, HostError> {
        Ok(Vec::new())
    }

    fn invoke(&self, _as_constructor: bool, _args: Vec<Value>) -> Result<Value, HostError> {
        Err(unsupported("invocation"))
    }

    fn invoke_method(&self, name: &str, _args: Vec<Value>) -> Result<Value, HostError> {
        Err(HostError::msg(format!("The object has no method named '{name}'")))
    }

    fn invocability(&self) -> Invocability {
        Invocability::None
    }

    fn enumerator(&self) -> Result<Option<Box<dyn HostEnumerator>>, HostError> {
        Ok(None)
    }

    fn async_enumerator(&self) -> Result<Option<Box<dyn HostAsyncEnumerator>>, HostError> {
        Ok(None)
    }

    /// Host-chosen tag carried by the holder.
    fn subtype(&self) -> ValueSubtype {
        ValueSubtype::None
    }

    fn flags(&self) -> ValueFlags {
        ValueFlags::empty()
    }

    /// Called each time the bridge takes a reference.
    fn add_ref(&self) {}

    /// Called each time the bridge drops a reference.
    fn release(&self) {}
}

/// Synchronous iteration over a host collection (`for...of`).
pub trait HostEnumerator: Send {
    fn next(&mut self) -> Result<Option<Value>, HostError>;

    fn close(&mut self) {}
}

/// Iteration for `for await...of`; each step is delivered through a promise.
pub trait HostAsyncEnumerator: Send {
    fn next(&mut self) -> Result<Option<Value>, HostError>;

    fn close(&mut self) {}
}

/// A module returned by [`HostEnvironment::load_module`].
#[derive(Debug, Clone)]
pub struct LoadedModule {
    pub document: DocumentInfo,
    pub code: String,
    /// Exports supplied directly by the host; CommonJS and JSON modules only.
    pub exports: Option<Value>,
}

impl LoadedModule {
    pub fn new(document: DocumentInfo, code: impl Into<String>) -> Self {
        Self {
            document,
            code: code.into(),
            exports: None,
        }
    }
}

/// Per-isolate upcall table.
pub trait HostEnvironment: Send + Sync + 'static {
    fn global_flags(&self) -> GlobalFlags {
        GlobalFlags::empty()
    }

    fn max_script_cache_size(&self) -> usize {
        256
    }

    fn max_module_cache_size(&self) -> usize {
        1024
    }

    /// Resolve `specifier` relative to `parent` (`None` for top-level dynamic imports).
    fn load_module(&self, _parent: Option<&DocumentInfo>, specifier: &str) -> Result<LoadedModule, HostError> {
        Err(HostError::msg(format!("Cannot load module '{specifier}'")))
    }

    /// Extra bindings passed as parameters to a CommonJS module body.
    fn create_module_context(&self, _document: &DocumentInfo) -> Result<Vec<(String, Value)>, HostError> {
        Ok(Vec::new())
    }

    /// Properties installed on `import.meta` for a module.
    fn initialize_import_meta(&self, document: &DocumentInfo) -> Vec<(String, Value)> {
        vec![("url".to_string(), Value::string(&document.resource_name))]
    }

    fn create_debug_agent(
        &self,
        _name: &str,
        _version: &str,
        _port: u16,
        _remote: bool,
        _connector: DebugConnector,
    ) -> Option<Box<dyn DebugAgent>> {
        None
    }

    /// Run `callback` once on some other thread.
    fn queue_native_callback(&self, callback: NativeCallback) {
        callbacks::spawn_native(callback);
    }
}

/// Environment with all defaults: no module loader, no debugger.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHostEnvironment;

impl HostEnvironment for DefaultHostEnvironment {}
