//! ES modules, plus CommonJS and JSON as synthetic modules.
//!
//! Every module a context compiles is recorded in its [`ModuleMap`], keyed by
//! document unique id: a second document with the same id gets the first
//! one's module whatever its source. The map is how V8's module callbacks, which carry no
//! embedder data, find their way back to a document:
//!
//! - resolve: referrer module → referrer document → `load_module(parent, specifier)`;
//! - `import.meta`: module → document → `initialize_import_meta(document)`;
//! - synthetic evaluation: module → CommonJS/JSON source or host exports.
//!
//! Synthetic modules export a single `default`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::context::{ContextInner, ContextState, script_origin, origin_unique_id};
use crate::document::{DocumentInfo, DocumentKind};
use crate::error::{ENGINE_DESTROYED, Error, ScriptError};
use crate::holder::BoundGlobal;
use crate::host::LoadedModule;
use crate::host_object::{exception, guarded};
use crate::marshal;
use crate::value::Value;

const DEFAULT_EXPORT: &str = "default";

/// What a synthetic module evaluates to.
#[derive(Clone)]
enum Synthetic {
    CommonJs(String),
    Json(String),
    Exports(Value),
}

struct ModuleEntry {
    document: DocumentInfo,
    identity_hash: i32,
    module: v8::Global<v8::Module>,
    synthetic: Option<Synthetic>,
}

/// Modules compiled by one context, oldest first.
pub(crate) struct ModuleMap {
    entries: VecDeque<ModuleEntry>,
    capacity: usize,
    /// Eviction waits while a module graph is being linked or evaluated.
    in_flight: usize,
    module_count: usize,
}

impl ModuleMap {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            in_flight: 0,
            module_count: 0,
        }
    }

    /// Modules compiled over the context's lifetime, evicted ones included.
    pub(crate) fn module_count(&self) -> usize {
        self.module_count
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn get<'s>(&self, scope: &mut v8::PinScope<'s, '_>, unique_id: u64) -> Option<v8::Local<'s, v8::Module>> {
        self.entries
            .iter()
            .find(|entry| entry.document.unique_id == unique_id)
            .map(|entry| v8::Local::new(scope, &entry.module))
    }

    fn find(&self, scope: &mut v8::PinScope<'_, '_>, module: v8::Local<'_, v8::Module>) -> Option<&ModuleEntry> {
        let hash = module.get_identity_hash().get();
        self.entries
            .iter()
            .filter(|entry| entry.identity_hash == hash)
            .find(|entry| v8::Local::new(scope, &entry.module) == module)
    }

    fn document_of(&self, scope: &mut v8::PinScope<'_, '_>, module: v8::Local<'_, v8::Module>) -> Option<DocumentInfo> {
        self.find(scope, module).map(|entry| entry.document.clone())
    }

    fn document(&self, unique_id: u64) -> Option<DocumentInfo> {
        self.entries
            .iter()
            .find(|entry| entry.document.unique_id == unique_id)
            .map(|entry| entry.document.clone())
    }

    fn insert(&mut self, entry: ModuleEntry) {
        let unique_id = entry.document.unique_id;
        self.entries.retain(|e| e.document.unique_id != unique_id);
        self.entries.push_back(entry);
        self.module_count += 1;
        self.trim();
    }

    fn trim(&mut self) {
        if self.in_flight > 0 {
            return;
        }
        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                tracing::trace!("Module cache evicted {}", evicted.document.resource_name);
            }
        }
    }
}

fn register(
    scope: &mut v8::PinScope<'_, '_>,
    cx: &ContextInner,
    state: &ContextState,
    document: &DocumentInfo,
    module: v8::Local<'_, v8::Module>,
    synthetic: Option<Synthetic>,
) {
    cx.isolate.module_count.fetch_add(1, Ordering::SeqCst);
    state.modules.borrow_mut().insert(ModuleEntry {
        document: document.clone(),
        identity_hash: module.get_identity_hash().get(),
        module: v8::Global::new(scope, module),
        synthetic,
    });
}

/// The module for an ES module document, compiling it on first use.
fn es_module<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    cx: &ContextInner,
    state: &ContextState,
    document: &DocumentInfo,
    code: &str,
) -> Result<v8::Local<'s, v8::Module>, Error> {
    if let Some(module) = state.modules.borrow().get(scope, document.unique_id) {
        return Ok(module);
    }

    let module = marshal::try_catch(scope, cx, state, |tc| {
        let source = v8::String::new(tc, code)?;
        let origin = script_origin(tc, document, true)?;
        let mut source = v8::script_compiler::Source::new(source, Some(&origin));
        v8::script_compiler::compile_module(tc, &mut source)
    })?;
    tracing::trace!("Compiled module {}", document.resource_name);
    register(scope, cx, state, document, module, None);
    Ok(module)
}

fn synthetic_module<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    cx: &ContextInner,
    state: &ContextState,
    document: &DocumentInfo,
    synthetic: Synthetic,
) -> Result<v8::Local<'s, v8::Module>, Error> {
    if let Some(module) = state.modules.borrow().get(scope, document.unique_id) {
        return Ok(module);
    }

    let name = v8::String::new(scope, &document.resource_name)
        .ok_or_else(|| Error::general("Failed to allocate the module name"))?;
    let export = v8::String::new(scope, DEFAULT_EXPORT).ok_or_else(|| Error::general("Failed to allocate a string"))?;
    let module = v8::Module::create_synthetic_module(scope, name, &[export], evaluate_synthetic);
    register(scope, cx, state, document, module, Some(synthetic));
    Ok(module)
}

/// Register an ES module document; compile errors surface here.
pub(crate) fn compile_document(
    scope: &mut v8::PinScope<'_, '_>,
    cx: &ContextInner,
    state: &ContextState,
    document: &DocumentInfo,
    code: &str,
) -> Result<(), Error> {
    es_module(scope, cx, state, document, code).map(|_| ())
}

/// Link, evaluate and (with `evaluate`) return the namespace of an ES module
/// or the default export of a CommonJS module.
pub(crate) fn execute_module(
    scope: &mut v8::PinScope<'_, '_>,
    cx: &ContextInner,
    state: &ContextState,
    document: &DocumentInfo,
    code: &str,
    evaluate: bool,
) -> Result<Value, Error> {
    let module = match document.kind {
        DocumentKind::CommonJSModule => {
            synthetic_module(scope, cx, state, document, Synthetic::CommonJs(code.to_string()))?
        }
        _ => es_module(scope, cx, state, document, code)?,
    };
    link_and_evaluate(scope, cx, state, module)?;

    if !evaluate {
        return Ok(Value::Undefined);
    }
    let namespace = module.get_module_namespace();
    if document.kind != DocumentKind::CommonJSModule {
        return Ok(marshal::export_value(scope, cx, state, namespace));
    }
    marshal::try_catch(scope, cx, state, |tc| {
        let namespace = v8::Local::<v8::Object>::try_from(namespace).ok()?;
        let key = v8::String::new(tc, DEFAULT_EXPORT)?;
        let exports = namespace.get(tc, key.into())?;
        Some(marshal::export_value(tc, cx, state, exports))
    })
}

/// Link and evaluate `module`; the graph stays in the module map until both
/// are done, so synthetic evaluation and `import.meta` can find it.
fn link_and_evaluate<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    cx: &ContextInner,
    state: &ContextState,
    module: v8::Local<'s, v8::Module>,
) -> Result<v8::Local<'s, v8::Value>, Error> {
    state.modules.borrow_mut().in_flight += 1;
    let outcome = match instantiate(scope, cx, state, module) {
        Ok(()) => evaluate_module(scope, cx, state, module),
        Err(error) => Err(error),
    };
    {
        let mut modules = state.modules.borrow_mut();
        modules.in_flight -= 1;
        modules.trim();
    }
    outcome
}

fn instantiate(
    scope: &mut v8::PinScope<'_, '_>,
    cx: &ContextInner,
    state: &ContextState,
    module: v8::Local<'_, v8::Module>,
) -> Result<(), Error> {
    if module.get_status() != v8::ModuleStatus::Uninstantiated {
        return Ok(());
    }

    let linked = marshal::try_catch(scope, cx, state, |tc| module.instantiate_module(tc, resolve_callback));
    match linked? {
        true => Ok(()),
        false => Err(Error::general("Module instantiation failed")),
    }
}

/// Evaluate; an error thrown during evaluation (or a rejected top-level
/// await that settled before the microtask checkpoint) is returned.
fn evaluate_module<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    cx: &ContextInner,
    state: &ContextState,
    module: v8::Local<'s, v8::Module>,
) -> Result<v8::Local<'s, v8::Value>, Error> {
    let completion = marshal::try_catch(scope, cx, state, |tc| module.evaluate(tc))?;
    scope.perform_microtask_checkpoint();

    if module.get_status() == v8::ModuleStatus::Errored {
        let exception = module.get_exception();
        return Err(rethrown(scope, cx, state, exception));
    }
    if let Ok(promise) = v8::Local::<v8::Promise>::try_from(completion) {
        if promise.state() == v8::PromiseState::Rejected {
            let reason = promise.result(scope);
            return Err(rethrown(scope, cx, state, reason));
        }
    }
    Ok(completion)
}

/// The error `exception` would produce if it were thrown now.
fn rethrown(
    scope: &mut v8::PinScope<'_, '_>,
    cx: &ContextInner,
    state: &ContextState,
    exception: v8::Local<'_, v8::Value>,
) -> Error {
    let thrown = marshal::try_catch(scope, cx, state, |tc| {
        tc.throw_exception(exception);
        None::<()>
    });
    match thrown {
        Err(error) => error,
        Ok(()) => Error::general("Module evaluation failed"),
    }
}

/// A JS value standing for `error`, for a throw or a rejection.
fn error_value<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    cx: &ContextInner,
    state: &ContextState,
    error: Error,
) -> v8::Local<'s, v8::Value> {
    match error {
        Error::Host(host) => exception::host_error_value(scope, cx, state, host),
        Error::General(ScriptError {
            exception: Some(value), ..
        }) => match marshal::import_value(scope, cx, state, &value) {
            Ok(value) => value,
            Err(error) => plain_error(scope, &error.to_string()),
        },
        error => plain_error(scope, &error.to_string()),
    }
}

fn plain_error<'s>(scope: &mut v8::PinScope<'s, '_>, message: &str) -> v8::Local<'s, v8::Value> {
    let message = v8::String::new(scope, message).unwrap_or_else(|| v8::String::empty(scope));
    v8::Exception::error(scope, message)
}

/// Throw `error` from inside a V8 callback; a pending termination is left alone.
fn throw(scope: &mut v8::PinScope<'_, '_>, cx: &ContextInner, state: &ContextState, error: Error) {
    if matches!(error, Error::ScriptInterrupted(_) | Error::OutOfMemory) || cx.isolate.is_execution_terminating() {
        return;
    }
    let value = error_value(scope, cx, state, error);
    scope.throw_exception(value);
}

/// Ask the host for `specifier` and return its module, compiled or cached.
fn load_module<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    cx: &ContextInner,
    state: &ContextState,
    parent: Option<&DocumentInfo>,
    specifier: &str,
) -> Result<v8::Local<'s, v8::Module>, Error> {
    let loaded: LoadedModule = guarded(cx, || cx.isolate.env.load_module(parent, specifier))
        .ok_or_else(Error::interrupted)?
        .map_err(Error::Host)?;
    let document = &loaded.document;
    if let Some(module) = state.modules.borrow().get(scope, document.unique_id) {
        return Ok(module);
    }

    if let Some(exports) = loaded.exports {
        return synthetic_module(scope, cx, state, document, Synthetic::Exports(exports));
    }
    match document.kind {
        DocumentKind::CommonJSModule => {
            synthetic_module(scope, cx, state, document, Synthetic::CommonJs(loaded.code.clone()))
        }
        DocumentKind::Json => synthetic_module(scope, cx, state, document, Synthetic::Json(loaded.code.clone())),
        DocumentKind::JavaScriptModule | DocumentKind::Script => es_module(scope, cx, state, document, &loaded.code),
    }
}

fn resolve_callback<'s>(
    context: v8::Local<'s, v8::Context>,
    specifier: v8::Local<'s, v8::String>,
    _import_attributes: v8::Local<'s, v8::FixedArray>,
    referrer: v8::Local<'s, v8::Module>,
) -> Option<v8::Local<'s, v8::Module>> {
    v8::callback_scope!(unsafe scope, context);

    let Some(cx) = ContextInner::from_context(context) else {
        let error = plain_error(scope, ENGINE_DESTROYED);
        scope.throw_exception(error);
        return None;
    };
    let state = cx.state().ok()?;
    let parent = state.modules.borrow().document_of(scope, referrer);
    let specifier = specifier.to_rust_string_lossy(scope);

    match load_module(scope, &cx, state, parent.as_ref(), &specifier) {
        Ok(module) => Some(module),
        Err(error) => {
            tracing::debug!("Failed to resolve '{}': {}", specifier, error);
            throw(scope, &cx, state, error);
            None
        }
    }
}

fn evaluate_synthetic<'s>(
    context: v8::Local<'s, v8::Context>,
    module: v8::Local<'s, v8::Module>,
) -> Option<v8::Local<'s, v8::Value>> {
    v8::callback_scope!(unsafe scope, context);

    let Some(cx) = ContextInner::from_context(context) else {
        let error = plain_error(scope, ENGINE_DESTROYED);
        scope.throw_exception(error);
        return None;
    };
    let state = match cx.state() {
        Ok(state) => state,
        Err(error) => {
            let error = plain_error(scope, &error.to_string());
            scope.throw_exception(error);
            return None;
        }
    };
    let found = {
        let modules = state.modules.borrow();
        modules
            .find(scope, module)
            .and_then(|entry| Some((entry.document.clone(), entry.synthetic.clone()?)))
    };
    let Some((document, synthetic)) = found else {
        let error = plain_error(scope, "Synthetic module is no longer loaded");
        scope.throw_exception(error);
        return None;
    };

    let exports = match synthetic {
        Synthetic::CommonJs(code) => run_common_js(scope, &cx, state, &document, &code)?,
        Synthetic::Json(code) => {
            let text = v8::String::new(scope, &code)?;
            v8::json::parse(scope, text)?
        }
        Synthetic::Exports(value) => match marshal::import_value(scope, &cx, state, &value) {
            Ok(value) => value,
            Err(error) => {
                throw(scope, &cx, state, error);
                return None;
            }
        },
    };

    let name = v8::String::new(scope, DEFAULT_EXPORT)?;
    module.set_synthetic_module_export(scope, name, exports)?;

    let resolver = v8::PromiseResolver::new(scope)?;
    let undefined = v8::undefined(scope).into();
    resolver.resolve(scope, undefined);
    Some(resolver.get_promise(scope).into())
}

/// Run a CommonJS body and return `module.exports`.
fn run_common_js<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    cx: &ContextInner,
    state: &ContextState,
    document: &DocumentInfo,
    code: &str,
) -> Option<v8::Local<'s, v8::Value>> {
    let bindings = match guarded(cx, || cx.isolate.env.create_module_context(document))? {
        Ok(bindings) => bindings,
        Err(error) => {
            exception::throw_host_error(scope, cx, error);
            return None;
        }
    };

    let params: String = bindings.iter().map(|(name, _)| format!(", {name}")).collect();
    let wrapped = format!("(function (module, exports{params}) {{\n{code}\n}})");
    let source = v8::String::new(scope, &wrapped)?;
    let origin = script_origin(scope, document, false)?;
    let function = v8::Script::compile(scope, source, Some(&origin))?.run(scope)?;
    let function = v8::Local::<v8::Function>::try_from(function).ok()?;

    let exports = v8::Object::new(scope);
    let module = v8::Object::new(scope);
    let key = v8::String::new(scope, "exports")?;
    module.set(scope, key.into(), exports.into())?;

    let mut args: Vec<v8::Local<v8::Value>> = vec![module.into(), exports.into()];
    for (_, value) in &bindings {
        match marshal::import_value(scope, cx, state, value) {
            Ok(value) => args.push(value),
            Err(error) => {
                throw(scope, cx, state, error);
                return None;
            }
        }
    }
    function.call(scope, exports.into(), &args)?;
    module.get(scope, key.into())
}

pub(crate) unsafe extern "C" fn import_meta_callback(
    context: v8::Local<'_, v8::Context>,
    module: v8::Local<'_, v8::Module>,
    meta: v8::Local<'_, v8::Object>,
) {
    v8::callback_scope!(unsafe scope, context);

    let Some(cx) = ContextInner::from_context(context) else {
        return;
    };
    let Ok(state) = cx.state() else {
        return;
    };
    let Some(document) = state.modules.borrow().document_of(scope, module) else {
        return;
    };
    let Some(Ok(properties)) = guarded(&cx, || Ok(cx.isolate.env.initialize_import_meta(&document))) else {
        return;
    };
    for (name, value) in properties {
        let Some(key) = v8::String::new(scope, &name) else {
            continue;
        };
        match marshal::import_value(scope, &cx, state, &value) {
            Ok(value) => {
                meta.create_data_property(scope, key.into(), value);
            }
            Err(error) => tracing::warn!("Skipping import.meta.{}: {}", name, error),
        }
    }
}

pub(crate) fn dynamic_import_callback<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    host_defined_options: v8::Local<'s, v8::Data>,
    _resource_name: v8::Local<'s, v8::Value>,
    specifier: v8::Local<'s, v8::String>,
    _import_attributes: v8::Local<'s, v8::FixedArray>,
) -> Option<v8::Local<'s, v8::Promise>> {
    let resolver = v8::PromiseResolver::new(scope)?;
    let promise = resolver.get_promise(scope);

    let Some(cx) = ContextInner::from_scope(scope) else {
        let error = plain_error(scope, ENGINE_DESTROYED);
        resolver.reject(scope, error);
        return Some(promise);
    };
    if !cx.options.enable_dynamic_module_imports {
        let error = plain_error(scope, "Dynamic module imports are disabled in this context");
        resolver.reject(scope, error);
        return Some(promise);
    }

    let parent_id = origin_unique_id(scope, host_defined_options);
    let specifier = specifier.to_rust_string_lossy(scope);
    let resolver = BoundGlobal::new(&cx.isolate, v8::Global::new(scope, resolver));
    let context = cx.weak_self.clone();

    // Runs at the next queue drain, once the importing script has yielded.
    cx.isolate.queue.push(
        true,
        Box::new(move |_isolate| {
            let Some(cx) = context.upgrade() else {
                return;
            };
            let outcome = cx.with_scope(|scope, state| {
                import_dynamic(scope, &cx, state, parent_id, &specifier, resolver.get());
                Ok(())
            });
            if let Err(error) = outcome {
                tracing::debug!("Dynamic import of '{}' abandoned: {}", specifier, error);
            }
        }),
    );
    Some(promise)
}

fn import_dynamic(
    scope: &mut v8::PinScope<'_, '_>,
    cx: &Arc<ContextInner>,
    state: &ContextState,
    parent_id: Option<u64>,
    specifier: &str,
    resolver: &v8::Global<v8::PromiseResolver>,
) {
    let resolver = v8::Local::new(scope, resolver);
    let parent = parent_id.and_then(|id| state.modules.borrow().document(id));

    let outcome = (|| {
        let module = load_module(scope, cx, state, parent.as_ref(), specifier)?;
        let completion = link_and_evaluate(scope, cx, state, module)?;
        Ok::<_, Error>((module, completion))
    })();

    match outcome {
        Ok((module, completion)) => {
            let namespace = module.get_module_namespace();
            let pending = v8::Local::<v8::Promise>::try_from(completion)
                .ok()
                .filter(|promise| promise.state() == v8::PromiseState::Pending);
            match pending {
                // top-level await still running: settle with the module
                Some(promise) => {
                    let chained = v8::Function::builder(return_data)
                        .data(namespace)
                        .build(scope)
                        .and_then(|fulfilled| promise.then(scope, fulfilled));
                    if let Some(chained) = chained {
                        resolver.resolve(scope, chained.into());
                    }
                }
                None => {
                    resolver.resolve(scope, namespace);
                }
            }
        }
        Err(error) => {
            tracing::debug!("Dynamic import of '{}' failed: {}", specifier, error);
            let reason = error_value(scope, cx, state, error);
            resolver.reject(scope, reason);
        }
    }
}

fn return_data(_scope: &mut v8::PinScope<'_, '_>, args: v8::FunctionCallbackArguments<'_>, mut rv: v8::ReturnValue<v8::Value>) {
    rv.set(args.data());
}
