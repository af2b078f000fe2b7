mod common;

use v8_host_bridge::{CacheKind, CacheResult, DocumentInfo, DocumentKind, Value};

const CODE: &str = "(function fib(n) { return n < 2 ? n : fib(n - 1) + fib(n - 2); })(20)";

fn produce(id: u64) -> Vec<u8> {
    let (_isolate, context) = common::context();
    let doc = DocumentInfo::with_id("fib.js", DocumentKind::Script, id);
    let (script, bytes) = context.compile_produce_cache(&doc, CODE, CacheKind::Code).unwrap();
    assert_eq!(context.execute_script(&script, true).unwrap(), Value::Int32(6765));
    assert!(!bytes.is_empty());
    bytes
}

#[test]
fn test_cache_is_accepted_for_the_same_document() {
    let id = DocumentInfo::next_unique_id();
    let bytes = produce(id);

    let (_isolate, context) = common::context();
    let doc = DocumentInfo::with_id("fib.js", DocumentKind::Script, id);
    let (script, accepted) = context.compile_consume_cache(&doc, CODE, CacheKind::Code, &bytes).unwrap();
    assert!(accepted);
    assert_eq!(script.cache_bytes(), Some(bytes.as_slice()));
    assert_eq!(context.execute_script(&script, true).unwrap(), Value::Int32(6765));
}

#[test]
fn test_corrupt_cache_is_rejected_but_the_script_runs() {
    let id = DocumentInfo::next_unique_id();
    let mut bytes = produce(id);
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;

    let (_isolate, context) = common::context();
    let doc = DocumentInfo::with_id("fib.js", DocumentKind::Script, id);
    let (script, accepted) = context.compile_consume_cache(&doc, CODE, CacheKind::Code, &bytes).unwrap();
    assert!(!accepted);
    assert_eq!(context.execute_script(&script, true).unwrap(), Value::Int32(6765));
}

#[test]
fn test_cache_is_keyed_by_unique_id_and_code() {
    let id = DocumentInfo::next_unique_id();
    let bytes = produce(id);
    let (_isolate, context) = common::context();

    let other_doc = DocumentInfo::with_id("fib.js", DocumentKind::Script, DocumentInfo::next_unique_id());
    let (_, accepted) = context
        .compile_consume_cache(&other_doc, CODE, CacheKind::Code, &bytes)
        .unwrap();
    assert!(!accepted, "a different unique id must not accept the cache");

    let doc = DocumentInfo::with_id("fib.js", DocumentKind::Script, id);
    let edited = CODE.replace("(20)", "(21)");
    let (script, accepted) = context
        .compile_consume_cache(&doc, &edited, CacheKind::Code, &bytes)
        .unwrap();
    assert!(!accepted, "different code must not accept the cache");
    assert_eq!(context.execute_script(&script, true).unwrap(), Value::Int32(10946));
}

#[test]
fn test_update_cache_replaces_rejected_bytes() {
    let id = DocumentInfo::next_unique_id();
    let (_isolate, context) = common::context();
    let doc = DocumentInfo::with_id("fib.js", DocumentKind::Script, id);

    let mut bytes = b"not a cache".to_vec();
    let (script, result) = context
        .compile_update_cache(&doc, CODE, CacheKind::Code, &mut bytes)
        .unwrap();
    assert_eq!(result, CacheResult::Updated);
    assert_eq!(context.execute_script(&script, true).unwrap(), Value::Int32(6765));

    let (_other_isolate, other) = common::context();
    let (_, result) = other
        .compile_update_cache(&doc, CODE, CacheKind::Code, &mut bytes)
        .unwrap();
    assert_eq!(result, CacheResult::Accepted);

    let mut untouched = Vec::new();
    let (_, result) = other
        .compile_update_cache(&doc, CODE, CacheKind::None, &mut untouched)
        .unwrap();
    assert_eq!(result, CacheResult::Disabled);
    assert!(untouched.is_empty());
}

#[test]
fn test_script_cache_reuses_compiled_scripts() {
    let isolate = common::isolate();
    let first = isolate.create_context(Default::default()).unwrap();
    let second = isolate.create_context(Default::default()).unwrap();
    let doc = DocumentInfo::script("shared.js");

    first.compile(&doc, CODE).unwrap();
    second.compile(&doc, CODE).unwrap();
    assert_eq!(isolate.statistics().script_cache_size, 1);

    // a script holder runs in any context of its isolate
    let script = first.compile(&doc, "typeof marker").unwrap();
    second.execute(&DocumentInfo::script("mark.js"), "globalThis.marker = 1", false).unwrap();
    assert_eq!(first.execute_script(&script, true).unwrap(), Value::string("undefined"));
    assert_eq!(second.execute_script(&script, true).unwrap(), Value::string("number"));
}
