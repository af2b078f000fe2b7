mod common;

use common::RecordingEnvironment;
use v8_host_bridge::{ContextOptions, DocumentInfo, DocumentKind, IsolateOptions, Value};

#[test]
fn test_cyclic_imports_evaluate() {
    let env = RecordingEnvironment::new();
    env.add_module(
        "a",
        DocumentKind::JavaScriptModule,
        "import { b } from 'b'; export const a = 'A'; export function readB() { return b; }",
    );
    env.add_module(
        "b",
        DocumentKind::JavaScriptModule,
        "import { a, readB } from 'a'; export const b = 'B'; export function readA() { return a; }",
    );
    let isolate = env.isolate(IsolateOptions::default());
    let context = isolate.create_context(ContextOptions::default()).unwrap();

    context
        .execute(
            &DocumentInfo::module("main.mjs"),
            "import { readB } from 'a'; import { readA } from 'b'; globalThis.result = readB() + readA();",
            false,
        )
        .unwrap();
    assert_eq!(context.get_global_property("result").unwrap(), Value::string("BA"));
    assert_eq!(env.load_count("a"), 2);
    assert_eq!(context.statistics().unwrap().module_count, 3);
}

#[test]
fn test_imports_see_their_parent_document() {
    let env = RecordingEnvironment::new();
    env.add_module("lib", DocumentKind::JavaScriptModule, "import 'leaf'; export default 1;");
    env.add_module("leaf", DocumentKind::JavaScriptModule, "export {};");
    let isolate = env.isolate(IsolateOptions::default());
    let context = isolate.create_context(ContextOptions::default()).unwrap();

    context
        .execute(&DocumentInfo::module("entry.mjs"), "import 'lib';", false)
        .unwrap();
    let loads = env.loads.lock().unwrap().clone();
    assert_eq!(
        loads,
        vec![
            (Some("entry.mjs".to_string()), "lib".to_string()),
            (Some("lib".to_string()), "leaf".to_string()),
        ]
    );
}

#[test]
fn test_distinct_ids_make_distinct_modules() {
    let env = RecordingEnvironment::new();
    let isolate = env.isolate(IsolateOptions::default());
    let context = isolate.create_context(ContextOptions::default()).unwrap();
    let code = "export const token = {};";

    let first = context.execute(&DocumentInfo::module("x.mjs"), code, true).unwrap();
    let second = context.execute(&DocumentInfo::module("x.mjs"), code, true).unwrap();
    let first = first.as_v8_object().unwrap().get_property("token").unwrap();
    let second = second.as_v8_object().unwrap().get_property("token").unwrap();
    assert!(!first.as_v8_object().unwrap().same_object(second.as_v8_object().unwrap()));

    let id = DocumentInfo::next_unique_id();
    let one = DocumentInfo::with_id("y.mjs", DocumentKind::JavaScriptModule, id);
    let again = context.execute(&one, code, true).unwrap();
    let edited = context
        .execute(&one, "export const token = 'edited';", true)
        .unwrap();
    assert!(again.as_v8_object().unwrap().same_object(edited.as_v8_object().unwrap()));
}

#[test]
fn test_module_cache_evicts_the_oldest_modules() {
    let env = RecordingEnvironment::with_max_modules(2);
    for name in ["m1", "m2", "m3", "m4"] {
        env.add_module(name, DocumentKind::JavaScriptModule, &format!("export default '{name}';"));
    }
    let isolate = env.isolate(IsolateOptions::default());
    let context = isolate.create_context(ContextOptions::default()).unwrap();

    context
        .execute(
            &DocumentInfo::module("all.mjs"),
            "import a from 'm1'; import b from 'm2'; import c from 'm3'; import d from 'm4'; \
             globalThis.all = [a, b, c, d].join();",
            false,
        )
        .unwrap();
    assert_eq!(context.get_global_property("all").unwrap(), Value::string("m1,m2,m3,m4"));

    let stats = context.statistics().unwrap();
    assert!(stats.module_cache_size <= 2, "{stats:?}");
    assert_eq!(stats.module_count, 5);

    // m1 was evicted, so importing it again compiles a fresh copy
    context
        .execute(&DocumentInfo::module("again.mjs"), "import a from 'm1'; globalThis.again = a;", false)
        .unwrap();
    assert_eq!(context.get_global_property("again").unwrap(), Value::string("m1"));
    assert_eq!(context.statistics().unwrap().module_count, 7);
}

#[test]
fn test_synthetic_modules_survive_a_full_module_cache() {
    let env = RecordingEnvironment::with_max_modules(1);
    env.add_module("data.json", DocumentKind::Json, r#"{ "answer": 41 }"#);
    env.add_module("inc.cjs", DocumentKind::CommonJSModule, "module.exports = (n) => n + 1;");
    env.add_module(
        "meta",
        DocumentKind::JavaScriptModule,
        "import 'data.json'; export const url = import.meta.url;",
    );
    let isolate = env.isolate(IsolateOptions::default());
    let context = isolate.create_context(ContextOptions::default()).unwrap();

    context
        .execute(
            &DocumentInfo::module("main.mjs"),
            "import data from 'data.json'; import inc from 'inc.cjs'; import { url } from 'meta'; \
             globalThis.answer = inc(data.answer); globalThis.url = url;",
            false,
        )
        .unwrap();
    assert_eq!(context.get_global_property("answer").unwrap(), Value::Int32(42));
    assert_eq!(context.get_global_property("url").unwrap(), Value::string("meta"));

    let stats = context.statistics().unwrap();
    assert_eq!(stats.module_cache_size, 1);
    assert_eq!(stats.module_count, 4);
}

#[test]
fn test_common_js_modules_import_into_es_modules() {
    let env = RecordingEnvironment::new();
    env.add_module(
        "counter.cjs",
        DocumentKind::CommonJSModule,
        "let n = 0; exports.next = () => ++n; exports.self = this === exports;",
    );
    let isolate = env.isolate(IsolateOptions::default());
    let context = isolate.create_context(ContextOptions::default()).unwrap();

    context
        .execute(
            &DocumentInfo::module("use.mjs"),
            "import counter from 'counter.cjs'; counter.next(); globalThis.n = counter.next(); \
             globalThis.self = counter.self;",
            false,
        )
        .unwrap();
    assert_eq!(context.get_global_property("n").unwrap(), Value::Int32(2));
    assert_eq!(context.get_global_property("self").unwrap(), Value::Boolean(true));
}

#[test]
fn test_module_errors_surface_as_script_errors() {
    let env = RecordingEnvironment::new();
    env.add_module("broken", DocumentKind::JavaScriptModule, "export const = ;");
    env.add_module("throws", DocumentKind::JavaScriptModule, "throw new Error('boom');");
    let isolate = env.isolate(IsolateOptions::default());
    let context = isolate.create_context(ContextOptions::default()).unwrap();

    let err = context
        .execute(&DocumentInfo::module("a.mjs"), "import 'broken';", false)
        .unwrap_err();
    assert!(err.to_string().contains("SyntaxError"), "{err}");

    let err = context
        .execute(&DocumentInfo::module("b.mjs"), "import 'throws';", false)
        .unwrap_err();
    assert!(err.to_string().contains("boom"), "{err}");
    assert!(err.exception().is_some());
}

#[test]
fn test_top_level_await_on_dynamic_import() {
    let env = RecordingEnvironment::new();
    env.add_module("later", DocumentKind::JavaScriptModule, "export const value = 9;");
    let isolate = env.isolate(IsolateOptions::default());
    let context = isolate.create_context(ContextOptions::default()).unwrap();

    context
        .execute(
            &DocumentInfo::module("tla.mjs"),
            "const { value } = await import('later'); globalThis.value = value;",
            false,
        )
        .unwrap();
    assert_eq!(context.get_global_property("value").unwrap(), Value::Int32(9));
}
