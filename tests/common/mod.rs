#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use v8_host_bridge::{
    ContextOptions, DebugAgent, DebugConnector, DocumentInfo, DocumentKind, HostEnumerator, HostEnvironment,
    HostError, HostObject, Invocability, IsolateOptions, LoadedModule, PropertyValue, V8Context, V8Isolate, Value,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn isolate() -> V8Isolate {
    init_logging();
    V8Isolate::with_defaults().unwrap()
}

pub fn context() -> (V8Isolate, V8Context) {
    let isolate = isolate();
    let context = isolate.create_context(ContextOptions::default()).unwrap();
    (isolate, context)
}

pub fn eval(context: &V8Context, code: &str) -> Value {
    context.execute(&DocumentInfo::script("test.js"), code, true).unwrap()
}

/// Counts add-ref and release upcalls.
#[derive(Default)]
pub struct RefCounts {
    pub added: AtomicUsize,
    pub released: AtomicUsize,
}

impl RefCounts {
    pub fn added(&self) -> usize {
        self.added.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

/// `{ add(a, b) }` plus whatever named values the test stores.
pub struct Calculator {
    pub values: Mutex<HashMap<String, Value>>,
    pub refs: Arc<RefCounts>,
}

impl Calculator {
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            refs: Arc::new(RefCounts::default()),
        }
    }
}

impl HostObject for Calculator {
    fn get_named_property(&self, name: &str) -> Result<PropertyValue, HostError> {
        if name == "add" {
            return Ok(PropertyValue::method());
        }
        Ok(match self.values.lock().unwrap().get(name) {
            Some(value) => PropertyValue::value(value.clone()),
            None => PropertyValue::nonexistent(),
        })
    }

    fn set_named_property(&self, name: &str, value: Value) -> Result<(), HostError> {
        self.values.lock().unwrap().insert(name.to_string(), value);
        Ok(())
    }

    fn delete_named_property(&self, name: &str) -> Result<bool, HostError> {
        Ok(self.values.lock().unwrap().remove(name).is_some())
    }

    fn property_names(&self) -> Result<Vec<String>, HostError> {
        let mut names: Vec<String> = self.values.lock().unwrap().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn invoke_method(&self, name: &str, args: Vec<Value>) -> Result<Value, HostError> {
        match name {
            "add" => {
                let sum: f64 = args.iter().filter_map(Value::as_f64).sum();
                Ok(if sum.fract() == 0.0 && sum.abs() <= i32::MAX as f64 {
                    Value::Int32(sum as i32)
                } else {
                    Value::Number(sum)
                })
            }
            _ => Err(HostError::msg(format!("no method '{name}'"))),
        }
    }

    fn add_ref(&self) {
        self.refs.added.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.refs.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// A callable host object: `f(...args)` calls the closure.
pub struct HostFunction<F>(pub F);

impl<F> HostObject for HostFunction<F>
where
    F: Fn(Vec<Value>) -> Result<Value, HostError> + Send + Sync + 'static,
{
    fn invoke(&self, _as_constructor: bool, args: Vec<Value>) -> Result<Value, HostError> {
        (self.0)(args)
    }

    fn invocability(&self) -> Invocability {
        Invocability::Delegate
    }
}

/// Iterates over a fixed list of values.
pub struct ListEnumerator {
    pub items: std::vec::IntoIter<Value>,
}

impl HostEnumerator for ListEnumerator {
    fn next(&mut self) -> Result<Option<Value>, HostError> {
        Ok(self.items.next())
    }
}

/// Modules served from memory; records every load and import.meta request.
#[derive(Default)]
pub struct RecordingEnvironment {
    modules: Mutex<HashMap<String, (u64, DocumentKind, String)>>,
    pub loads: Mutex<Vec<(Option<String>, String)>>,
    pub agent: Mutex<Option<Arc<ChannelDebugAgent>>>,
    pub max_modules: Option<usize>,
}

impl RecordingEnvironment {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_max_modules(max: usize) -> Arc<Self> {
        Arc::new(Self {
            max_modules: Some(max),
            ..Self::default()
        })
    }

    /// Ids start far above those handed out by `DocumentInfo::next_unique_id`.
    pub fn add_module(&self, specifier: &str, kind: DocumentKind, code: &str) -> u64 {
        let mut modules = self.modules.lock().unwrap();
        let id = (1 << 40) + modules.len() as u64;
        modules.insert(specifier.to_string(), (id, kind, code.to_string()));
        id
    }

    pub fn load_count(&self, specifier: &str) -> usize {
        self.loads.lock().unwrap().iter().filter(|(_, s)| s == specifier).count()
    }

    pub fn isolate(self: &Arc<Self>, options: IsolateOptions) -> V8Isolate {
        init_logging();
        V8Isolate::new(options, self.clone()).unwrap()
    }

    /// The agent handed out for the most recent debugging context.
    pub fn debug_agent(&self) -> Option<Arc<ChannelDebugAgent>> {
        self.agent.lock().unwrap().clone()
    }
}

impl HostEnvironment for RecordingEnvironment {
    fn max_module_cache_size(&self) -> usize {
        self.max_modules.unwrap_or(1024)
    }

    fn load_module(&self, parent: Option<&DocumentInfo>, specifier: &str) -> Result<LoadedModule, HostError> {
        self.loads
            .lock()
            .unwrap()
            .push((parent.map(|p| p.resource_name.clone()), specifier.to_string()));
        let modules = self.modules.lock().unwrap();
        let (id, kind, code) = modules
            .get(specifier)
            .ok_or_else(|| HostError::msg(format!("Cannot find module '{specifier}'")))?;
        Ok(LoadedModule::new(DocumentInfo::with_id(specifier, *kind, *id), code.clone()))
    }

    fn create_debug_agent(
        &self,
        _name: &str,
        _version: &str,
        _port: u16,
        _remote: bool,
        connector: v8_host_bridge::DebugConnector,
    ) -> Option<Box<dyn DebugAgent>> {
        let agent = Arc::new(ChannelDebugAgent::new(connector));
        *self.agent.lock().unwrap() = Some(agent.clone());
        Some(Box::new(SharedAgent(agent)))
    }
}

struct SharedAgent(Arc<ChannelDebugAgent>);

impl DebugAgent for SharedAgent {
    fn send_message(&self, message: &str) {
        self.0.send_message(message);
    }
}

/// A debugger client over an in-process channel.
pub struct ChannelDebugAgent {
    pub connector: DebugConnector,
    outbox: Mutex<mpsc::Sender<String>>,
    inbox: Mutex<mpsc::Receiver<String>>,
    next_id: AtomicUsize,
}

impl ChannelDebugAgent {
    pub fn new(connector: DebugConnector) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            connector,
            outbox: Mutex::new(tx),
            inbox: Mutex::new(rx),
            next_id: AtomicUsize::new(1),
        }
    }

    /// Send a protocol command; returns its id.
    pub fn command(&self, method: &str, params: serde_json::Value) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as u64;
        let message = serde_json::json!({ "id": id, "method": method, "params": params });
        self.connector.send_command(message.to_string());
        id
    }

    /// Wait for a message matching `predicate`, skipping everything else.
    pub fn wait_for(
        &self,
        timeout: std::time::Duration,
        predicate: impl Fn(&serde_json::Value) -> bool,
    ) -> Option<serde_json::Value> {
        let deadline = std::time::Instant::now() + timeout;
        let inbox = self.inbox.lock().unwrap();
        loop {
            let left = deadline.checked_duration_since(std::time::Instant::now())?;
            let message = inbox.recv_timeout(left).ok()?;
            let parsed: serde_json::Value = serde_json::from_str(&message).ok()?;
            if predicate(&parsed) {
                return Some(parsed);
            }
        }
    }

    pub fn wait_for_event(&self, method: &str, timeout: std::time::Duration) -> Option<serde_json::Value> {
        self.wait_for(timeout, |m| m.get("method").and_then(|v| v.as_str()) == Some(method))
    }
}

impl DebugAgent for ChannelDebugAgent {
    fn send_message(&self, message: &str) {
        let _ = self.outbox.lock().unwrap().send(message.to_string());
    }
}
