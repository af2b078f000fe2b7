//! Compile and execute: scripts, modules and JSON documents.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde::Deserialize;

use super::code_cache;
use super::{ContextInner, ContextState, V8Context};
use crate::digest::code_digest;
use crate::document::{DocumentInfo, DocumentKind};
use crate::error::Error;
use crate::holder::{BoundGlobal, ScriptHolder, ScriptInner};
use crate::isolate::CachedScript;
use crate::marshal;
use crate::module_loader;
use crate::value::Value;

/// Which cache V8 should produce or consume.
///
/// V8 no longer has a separate parser cache; `Parser` behaves like `Code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum CacheKind {
    #[default]
    None,
    Parser,
    Code,
}

/// Outcome of [`V8Context::compile_update_cache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheResult {
    /// Caching was not requested, or the document kind has no code cache.
    Disabled,
    /// The supplied bytes were used as they are.
    Accepted,
    /// The supplied bytes were rejected and replaced.
    Updated,
    /// The supplied bytes were rejected and no new cache could be produced.
    UpdateFailed,
}

#[derive(Clone, Copy)]
enum CacheRequest<'a> {
    None,
    Produce,
    Consume(&'a [u8]),
    /// Consume, and produce fresh bytes if the old ones are rejected.
    Update(&'a [u8]),
}

impl<'a> CacheRequest<'a> {
    fn new(kind: CacheKind, request: CacheRequest<'a>) -> Self {
        match kind {
            CacheKind::None => CacheRequest::None,
            CacheKind::Parser | CacheKind::Code => request,
        }
    }

    fn supplied(self) -> Option<&'a [u8]> {
        match self {
            CacheRequest::Consume(bytes) | CacheRequest::Update(bytes) => Some(bytes),
            _ => None,
        }
    }
}

struct Compiled {
    holder: ScriptHolder,
    accepted: bool,
    produced: Option<Vec<u8>>,
}

/// Origin for a document; its unique id rides along as host-defined options
/// so dynamic imports can name their parent.
pub(crate) fn script_origin<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    document: &DocumentInfo,
    is_module: bool,
) -> Option<v8::ScriptOrigin<'s>> {
    let name = v8::String::new(scope, &document.resource_name)?;
    let source_map = match &document.source_map_url {
        Some(url) => Some(v8::String::new(scope, url)?.into()),
        None => None,
    };
    let options = v8::PrimitiveArray::new(scope, 1);
    let id = v8::Number::new(scope, document.unique_id as f64);
    options.set(scope, 0, id.into());

    Some(v8::ScriptOrigin::new(
        scope,
        name.into(),
        0,
        0,
        false,
        0,
        source_map,
        false,
        false,
        is_module,
        Some(options.into()),
    ))
}

/// Unique id stored by [`script_origin`].
pub(crate) fn origin_unique_id(scope: &mut v8::PinScope<'_, '_>, options: v8::Local<'_, v8::Data>) -> Option<u64> {
    let options = v8::Local::<v8::PrimitiveArray>::try_from(options).ok()?;
    if options.length() < 1 {
        return None;
    }
    let id: v8::Local<v8::Value> = options.get(scope, 0).into();
    id.is_number().then(|| id.number_value(scope)).flatten().map(|id| id as u64)
}

fn count_script(cx: &ContextInner) {
    cx.script_count.fetch_add(1, Ordering::SeqCst);
    cx.isolate.script_count.fetch_add(1, Ordering::SeqCst);
}

fn source_holder(cx: &ContextInner, document: &DocumentInfo, code: &str) -> ScriptHolder {
    ScriptHolder(Arc::new(ScriptInner {
        isolate_id: cx.isolate.id,
        document: document.clone(),
        digest: code_digest(code),
        code: code.to_string(),
        cache_bytes: None,
        unbound: None,
    }))
}

fn compile_document(
    scope: &mut v8::PinScope<'_, '_>,
    cx: &ContextInner,
    state: &ContextState,
    document: &DocumentInfo,
    code: &str,
    request: CacheRequest<'_>,
) -> Result<Compiled, Error> {
    match document.kind {
        DocumentKind::Script => compile_script(scope, cx, state, document, code, request),
        kind => {
            // Modules compile into the module map; syntax errors surface here.
            if kind == DocumentKind::JavaScriptModule {
                module_loader::compile_document(scope, cx, state, document, code)?;
            }
            Ok(Compiled {
                holder: source_holder(cx, document, code),
                accepted: false,
                produced: None,
            })
        }
    }
}

fn compile_script(
    scope: &mut v8::PinScope<'_, '_>,
    cx: &ContextInner,
    state: &ContextState,
    document: &DocumentInfo,
    code: &str,
    request: CacheRequest<'_>,
) -> Result<Compiled, Error> {
    let digest = code_digest(code);
    let unique_id = document.unique_id;
    count_script(cx);

    // SAFETY: lock held; the reference does not outlive this block
    let cached = unsafe { cx.isolate.script_cache.get_ref() }
        .get(unique_id, digest)
        .filter(|entry| match request.supplied() {
            Some(bytes) => entry.cache_bytes.as_deref() == Some(bytes),
            None => true,
        })
        .map(|entry| (entry.script.clone(), entry.cache_bytes.clone()));

    if let Some((script, cache_bytes)) = cached {
        tracing::trace!("Script cache hit for {} ({:#x})", document.resource_name, digest);
        let accepted = request.supplied().is_some();
        let produced = match request {
            CacheRequest::Produce => match cache_bytes.clone() {
                Some(bytes) => Some(bytes),
                None => {
                    let unbound = v8::Local::new(scope, &script);
                    let bytes = produce_cache(unbound, unique_id, digest);
                    if let Some(bytes) = &bytes {
                        // SAFETY: lock held
                        unsafe { cx.isolate.script_cache.get() }.set_cache_bytes(unique_id, digest, bytes.clone());
                    }
                    bytes
                }
            },
            _ => None,
        };
        let holder = script_holder(cx, document, code, digest, produced.clone().or(cache_bytes), script);
        return Ok(Compiled {
            holder,
            accepted,
            produced,
        });
    }

    let (global, accepted, cache_bytes, produced) = marshal::try_catch(scope, cx, state, |tc| {
        let source = v8::String::new(tc, code)?;
        let origin = script_origin(tc, document, false)?;

        let payload = request
            .supplied()
            .and_then(|bytes| match code_cache::unwrap(bytes, unique_id, digest) {
                Ok(payload) => Some(payload),
                Err(rejection) => {
                    tracing::debug!("Code cache for {} rejected: {:?}", document.resource_name, rejection);
                    None
                }
            });

        let (unbound, accepted) = match payload {
            Some(payload) => {
                let cached = v8::script_compiler::CachedData::new(payload);
                let mut source = v8::script_compiler::Source::new_with_cached_data(source, Some(&origin), cached);
                let unbound = v8::script_compiler::compile_unbound_script(
                    tc,
                    &mut source,
                    v8::script_compiler::CompileOptions::ConsumeCodeCache,
                    v8::script_compiler::NoCacheReason::NoReason,
                )?;
                let rejected = source.get_cached_data().is_some_and(|c| c.rejected());
                if rejected {
                    tracing::debug!("V8 rejected the code cache for {}", document.resource_name);
                }
                (unbound, !rejected)
            }
            None => {
                let mut source = v8::script_compiler::Source::new(source, Some(&origin));
                let unbound = v8::script_compiler::compile_unbound_script(
                    tc,
                    &mut source,
                    v8::script_compiler::CompileOptions::NoCompileOptions,
                    v8::script_compiler::NoCacheReason::NoReason,
                )?;
                (unbound, false)
            }
        };

        let produced = match request {
            CacheRequest::Produce => produce_cache(unbound, unique_id, digest),
            CacheRequest::Update(_) if !accepted => produce_cache(unbound, unique_id, digest),
            _ => None,
        };
        let cache_bytes = match (accepted, request.supplied()) {
            (true, Some(bytes)) => Some(bytes.to_vec()),
            _ => produced.clone(),
        };
        Some((v8::Global::new(tc, unbound), accepted, cache_bytes, produced))
    })?;

    // SAFETY: lock held
    unsafe { cx.isolate.script_cache.get() }.insert(
        unique_id,
        digest,
        CachedScript {
            script: global.clone(),
            cache_bytes: cache_bytes.clone(),
        },
    );

    Ok(Compiled {
        holder: script_holder(cx, document, code, digest, cache_bytes, global),
        accepted,
        produced,
    })
}

fn produce_cache(unbound: v8::Local<'_, v8::UnboundScript>, unique_id: u64, digest: u64) -> Option<Vec<u8>> {
    let cache = unbound.create_code_cache()?;
    Some(code_cache::wrap(unique_id, digest, &cache[..]))
}

fn script_holder(
    cx: &ContextInner,
    document: &DocumentInfo,
    code: &str,
    digest: u64,
    cache_bytes: Option<Vec<u8>>,
    script: v8::Global<v8::UnboundScript>,
) -> ScriptHolder {
    ScriptHolder(Arc::new(ScriptInner {
        isolate_id: cx.isolate.id,
        document: document.clone(),
        digest,
        code: code.to_string(),
        cache_bytes,
        unbound: Some(BoundGlobal::new(&cx.isolate, script)),
    }))
}

fn run_script(
    scope: &mut v8::PinScope<'_, '_>,
    cx: &ContextInner,
    state: &ContextState,
    unbound: &v8::Global<v8::UnboundScript>,
    evaluate: bool,
) -> Result<Value, Error> {
    let unbound = v8::Local::new(scope, unbound);
    marshal::try_catch(scope, cx, state, |tc| {
        let script = unbound.bind_to_current_context(tc);
        let result = script.run(tc)?;
        Some(if evaluate {
            marshal::export_value(tc, cx, state, result)
        } else {
            Value::Undefined
        })
    })
}

fn parse_json(
    scope: &mut v8::PinScope<'_, '_>,
    cx: &ContextInner,
    state: &ContextState,
    code: &str,
) -> Result<Value, Error> {
    marshal::try_catch(scope, cx, state, |tc| {
        let text = v8::String::new(tc, code)?;
        let value = v8::json::parse(tc, text)?;
        Some(marshal::export_value(tc, cx, state, value))
    })
}

fn execute_document(
    scope: &mut v8::PinScope<'_, '_>,
    cx: &ContextInner,
    state: &ContextState,
    document: &DocumentInfo,
    code: &str,
    evaluate: bool,
) -> Result<Value, Error> {
    match document.kind {
        DocumentKind::Script => {
            let compiled = compile_script(scope, cx, state, document, code, CacheRequest::None)?;
            match &compiled.holder.0.unbound {
                Some(unbound) => run_script(scope, cx, state, unbound.get(), evaluate),
                None => Err(Error::general("Script was not compiled")),
            }
        }
        DocumentKind::JavaScriptModule | DocumentKind::CommonJSModule => {
            module_loader::execute_module(scope, cx, state, document, code, evaluate)
        }
        DocumentKind::Json => parse_json(scope, cx, state, code),
    }
}

impl V8Context {
    pub fn compile(&self, document: &DocumentInfo, code: &str) -> Result<ScriptHolder, Error> {
        let cx = &self.inner;
        cx.with_scope(|scope, state| compile_document(scope, cx, state, document, code, CacheRequest::None))
            .map(|compiled| compiled.holder)
    }

    /// Compile and return wrapped cache bytes (empty if none were produced).
    pub fn compile_produce_cache(
        &self,
        document: &DocumentInfo,
        code: &str,
        kind: CacheKind,
    ) -> Result<(ScriptHolder, Vec<u8>), Error> {
        let cx = &self.inner;
        let request = CacheRequest::new(kind, CacheRequest::Produce);
        let compiled = cx.with_scope(|scope, state| compile_document(scope, cx, state, document, code, request))?;
        Ok((compiled.holder, compiled.produced.unwrap_or_default()))
    }

    /// Compile using `bytes`. Rejected bytes never fail the compile: the
    /// script is compiled from source and `false` is returned.
    pub fn compile_consume_cache(
        &self,
        document: &DocumentInfo,
        code: &str,
        kind: CacheKind,
        bytes: &[u8],
    ) -> Result<(ScriptHolder, bool), Error> {
        let cx = &self.inner;
        let request = CacheRequest::new(kind, CacheRequest::Consume(bytes));
        let compiled = cx.with_scope(|scope, state| compile_document(scope, cx, state, document, code, request))?;
        Ok((compiled.holder, compiled.accepted))
    }

    /// Compile using `bytes`, replacing them when they are rejected.
    pub fn compile_update_cache(
        &self,
        document: &DocumentInfo,
        code: &str,
        kind: CacheKind,
        bytes: &mut Vec<u8>,
    ) -> Result<(ScriptHolder, CacheResult), Error> {
        let cx = &self.inner;
        let caching = kind != CacheKind::None && document.kind == DocumentKind::Script;
        let compiled = {
            let request = CacheRequest::new(kind, CacheRequest::Update(bytes.as_slice()));
            cx.with_scope(|scope, state| compile_document(scope, cx, state, document, code, request))?
        };

        let result = if !caching {
            CacheResult::Disabled
        } else if compiled.accepted {
            CacheResult::Accepted
        } else if let Some(fresh) = compiled.produced {
            *bytes = fresh;
            CacheResult::Updated
        } else {
            CacheResult::UpdateFailed
        };
        Ok((compiled.holder, result))
    }

    /// Run `code`. With `evaluate`, return the completion value (scripts),
    /// the namespace (ES modules) or the default export (CommonJS, JSON).
    pub fn execute(&self, document: &DocumentInfo, code: &str, evaluate: bool) -> Result<Value, Error> {
        let cx = &self.inner;
        tracing::trace!("Executing {} in context {}", document.resource_name, cx.id);
        cx.with_scope(|scope, state| execute_document(scope, cx, state, document, code, evaluate))
    }

    pub fn execute_script(&self, script: &ScriptHolder, evaluate: bool) -> Result<Value, Error> {
        let cx = &self.inner;
        if script.isolate_id() != cx.isolate.id {
            return Err(Error::ProxyFailure(
                "The script was compiled in a different isolate".to_string(),
            ));
        }
        cx.with_scope(|scope, state| match &script.0.unbound {
            Some(unbound) => run_script(scope, cx, state, unbound.get(), evaluate),
            None => execute_document(scope, cx, state, script.document(), script.code(), evaluate),
        })
    }
}
