mod common;

use std::sync::Arc;

use common::Calculator;
use v8_host_bridge::{HostObjectHolder, Value};

#[test]
fn test_host_objects_as_global_members() {
    let (_isolate, context) = common::context();
    let calc = Arc::new(Calculator::new());
    calc.values.lock().unwrap().insert("x".into(), Value::Int32(7));
    context
        .set_global_property("M", HostObjectHolder::new(calc.clone()).into(), true)
        .unwrap();

    // members expose both properties and methods as bare names
    assert_eq!(common::eval(&context, "x"), Value::Int32(7));
    assert_eq!(common::eval(&context, "add(x, 1)"), Value::Int32(8));

    // assignment to a name a member owns lands on the member
    common::eval(&context, "x = 12");
    assert_eq!(calc.values.lock().unwrap().get("x"), Some(&Value::Int32(12)));
    assert_eq!(common::eval(&context, "Object.prototype.hasOwnProperty.call(globalThis, 'x')"), Value::Boolean(false));
}

#[test]
fn test_later_members_shadow_earlier_ones() {
    let (_isolate, context) = common::context();

    let m = common::eval(&context, "({ x: 7 })");
    context.set_global_property("M", m, true).unwrap();
    let m2 = common::eval(&context, "({ y: 11 })");
    context.set_global_property("M2", m2, true).unwrap();
    assert_eq!(common::eval(&context, "x + y"), Value::Int32(18));

    let shadow = common::eval(&context, "({ x: 100 })");
    context.set_global_property("M3", shadow, true).unwrap();
    assert_eq!(common::eval(&context, "x + y"), Value::Int32(111));
    assert_eq!(context.get_global_members().unwrap(), vec!["M", "M2", "M3"]);

    let names = context.global_property_names(false).unwrap();
    for name in ["M", "M2", "M3", "x", "y"] {
        assert!(names.iter().any(|n| n == name), "{name} missing from {names:?}");
    }
}

#[test]
fn test_plain_globals_do_not_join_the_members_stack() {
    let (_isolate, context) = common::context();
    let m = common::eval(&context, "({ q: 1 })");
    context.set_global_property("M", m, false).unwrap();

    assert!(context.get_global_members().unwrap().is_empty());
    assert_eq!(common::eval(&context, "typeof q"), Value::string("undefined"));
    assert_eq!(common::eval(&context, "M.q"), Value::Int32(1));
}
