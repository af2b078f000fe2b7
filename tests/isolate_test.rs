mod common;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use common::{Calculator, HostFunction};
use v8_host_bridge::{
    ContextOptions, DocumentInfo, Error, ExecutionState, HostError, HostObjectHolder, IsolateOptions, V8Isolate, Value,
};

/// A late-bound reference a host callback can reach; cleared at the end of
/// the test so the callback does not keep the isolate alive.
struct Slot<T>(Arc<Mutex<Option<T>>>);

impl<T: Clone> Slot<T> {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }

    fn set(&self, value: T) {
        *self.0.lock().unwrap() = Some(value);
    }

    fn get(&self) -> T {
        self.0.lock().unwrap().clone().unwrap()
    }

    fn clear(&self) {
        self.0.lock().unwrap().take();
    }
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn test_host_callbacks_can_reenter_the_isolate() {
    let (isolate, context) = common::context();
    let slot = Slot::new();
    let depths = Arc::new(Mutex::new(Vec::new()));

    let inner = {
        let slot = slot.clone();
        let depths = depths.clone();
        HostFunction(move |args: Vec<Value>| {
            let (isolate, context): (V8Isolate, v8_host_bridge::V8Context) = slot.get();
            depths.lock().unwrap().push(isolate.lock_depth());
            assert_eq!(isolate.execution_state(), ExecutionState::Executing);
            let n = args.first().and_then(Value::as_i32).unwrap_or(0);
            context
                .execute(&DocumentInfo::script("inner.js"), &format!("{n} * 10"), true)
                .map_err(HostError::new)
        })
    };
    context
        .set_global_property("reenter", HostObjectHolder::from_object(inner).into(), false)
        .unwrap();
    slot.set((isolate.clone(), context.clone()));

    assert_eq!(common::eval(&context, "reenter(4) + 2"), Value::Int32(42));
    assert_eq!(isolate.lock_depth(), 0);
    assert_eq!(isolate.execution_state(), ExecutionState::Idle);
    assert!(depths.lock().unwrap()[0] >= 1);

    slot.clear();
}

#[test]
fn test_queued_callbacks_run_in_order_after_the_holder_leaves() {
    let (isolate, context) = common::context();
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen_during_script = Arc::new(Mutex::new(None));
    let slot = Slot::new();

    let queue_from_thread = {
        let slot = slot.clone();
        let order = order.clone();
        let seen = seen_during_script.clone();
        HostFunction(move |_| {
            let isolate: V8Isolate = slot.get();
            let other = isolate.clone();
            let order_for_thread = order.clone();
            thread::spawn(move || {
                for i in 0..10 {
                    let order = order_for_thread.clone();
                    other.call_with_lock(false, move |_| order.lock().unwrap().push(i));
                }
            })
            .join()
            .unwrap();
            *seen.lock().unwrap() = Some(order.lock().unwrap().len());
            Ok(Value::Undefined)
        })
    };
    context
        .set_global_property("queue", HostObjectHolder::from_object(queue_from_thread).into(), false)
        .unwrap();
    slot.set(isolate.clone());

    common::eval(&context, "queue()");

    // nothing ran while script held the lock
    assert_eq!(*seen_during_script.lock().unwrap(), Some(0));
    assert!(wait_until(Duration::from_secs(5), || order.lock().unwrap().len() == 10));
    assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());

    slot.clear();
}

#[test]
fn test_call_with_lock_sync_from_another_thread() {
    let isolate = common::isolate();
    let other = isolate.clone();
    let used = thread::spawn(move || {
        other
            .call_with_lock_sync(|isolate| {
                let mut stats = v8::HeapStatistics::default();
                isolate.get_heap_statistics(&mut stats);
                stats.used_heap_size()
            })
            .unwrap()
    })
    .join()
    .unwrap();
    assert!(used > 0);
}

#[test]
fn test_heap_governor_latches_out_of_memory() {
    common::init_logging();
    let isolate = V8Isolate::new(
        IsolateOptions::default().max_heap_size(8 * 1024 * 1024),
        Arc::new(v8_host_bridge::DefaultHostEnvironment),
    )
    .unwrap();
    let context = isolate.create_context(ContextOptions::default()).unwrap();

    let err = context
        .execute(
            &DocumentInfo::script("hog.js"),
            "let a = []; while (true) a.push(new Array(1e6));",
            true,
        )
        .unwrap_err();
    assert!(matches!(err, Error::OutOfMemory), "{err:?}");
    assert!(err.is_fatal());
    assert!(isolate.is_out_of_memory());
    assert_eq!(isolate.execution_state(), ExecutionState::OutOfMemory);

    // sticky
    let err = context.execute(&DocumentInfo::script("after.js"), "1", true).unwrap_err();
    assert!(matches!(err, Error::OutOfMemory), "{err:?}");
    assert!(matches!(
        isolate.create_context(ContextOptions::default()),
        Err(Error::OutOfMemory)
    ));
}

#[test]
fn test_stack_watcher_stops_runaway_reentry() {
    common::init_logging();
    let isolate = V8Isolate::new(
        IsolateOptions::default().max_stack_usage(256 * 1024),
        Arc::new(v8_host_bridge::DefaultHostEnvironment),
    )
    .unwrap();
    let context = isolate.create_context(ContextOptions::default()).unwrap();
    let slot = Slot::new();

    let recurse = {
        let slot = slot.clone();
        HostFunction(move |args: Vec<Value>| {
            let context: v8_host_bridge::V8Context = slot.get();
            let n = args.first().and_then(Value::as_i32).unwrap_or(0);
            context
                .execute(&DocumentInfo::script("deeper.js"), &format!("recurse({})", n + 1), true)
                .map_err(HostError::new)
        })
    };
    context
        .set_global_property("recurse", HostObjectHolder::from_object(recurse).into(), false)
        .unwrap();
    slot.set(context.clone());

    let err = context
        .execute(&DocumentInfo::script("deep.js"), "recurse(0)", true)
        .unwrap_err();
    assert!(err.to_string().contains("stack usage limit"), "{err}");

    // the isolate recovers once the stack unwinds
    assert_eq!(isolate.execution_state(), ExecutionState::Idle);
    assert_eq!(common::eval(&context, "1 + 1"), Value::Int32(2));

    slot.clear();
}

#[test]
fn test_stack_limit_stops_script_recursion() {
    common::init_logging();
    let isolate = V8Isolate::new(
        IsolateOptions::default().max_stack_usage(256 * 1024),
        Arc::new(v8_host_bridge::DefaultHostEnvironment),
    )
    .unwrap();
    let context = isolate.create_context(ContextOptions::default()).unwrap();

    let err = context
        .execute(
            &DocumentInfo::script("recurse.js"),
            "function f() { return f() + 1; } f()",
            true,
        )
        .unwrap_err();
    assert!(matches!(err, Error::General(_)), "{err:?}");
    assert!(err.to_string().contains("stack usage limit"), "{err}");

    assert_eq!(isolate.execution_state(), ExecutionState::Idle);
    assert_eq!(common::eval(&context, "[1, 2, 3].length"), Value::Int32(3));
}

#[test]
fn test_interrupt_from_another_thread() {
    let (isolate, context) = common::context();
    let other = isolate.clone();
    let interrupter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        other.interrupt();
    });

    let err = context
        .execute(&DocumentInfo::script("spin.js"), "while (true) {}", true)
        .unwrap_err();
    interrupter.join().unwrap();

    assert!(matches!(err, Error::General(_)), "{err:?}");
    assert!(err.to_string().contains("interrupted"), "{err}");
    assert!(!isolate.is_execution_terminating());
    assert_eq!(common::eval(&context, "'still usable'"), Value::string("still usable"));
}

#[test]
fn test_interrupts_propagate_when_enabled() {
    common::init_logging();
    let isolate = V8Isolate::new(
        IsolateOptions::default().enable_interrupt_propagation(true),
        Arc::new(v8_host_bridge::DefaultHostEnvironment),
    )
    .unwrap();
    let context = isolate.create_context(ContextOptions::default()).unwrap();
    let other = isolate.clone();
    let interrupter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        other.terminate_execution(false);
    });

    let err = context
        .execute(&DocumentInfo::script("spin.js"), "for (;;) {}", true)
        .unwrap_err();
    interrupter.join().unwrap();
    assert!(matches!(err, Error::ScriptInterrupted(_)), "{err:?}");
}

#[test]
fn test_request_interrupt_runs_on_the_script_thread() {
    let (isolate, context) = common::context();
    let calc = Arc::new(Calculator::new());
    context
        .set_global_property("calc", HostObjectHolder::new(calc.clone()).into(), false)
        .unwrap();

    let ran_on = Arc::new(Mutex::new(None));
    let other = isolate.clone();
    let ran = ran_on.clone();
    let requester = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        other.request_interrupt(move |_| {
            *ran.lock().unwrap() = Some(thread::current().id());
            calc.values.lock().unwrap().insert("stop".into(), Value::Boolean(true));
        })
    });

    common::eval(&context, "while (calc.stop !== true) {}");
    assert!(requester.join().unwrap());
    assert_eq!(*ran_on.lock().unwrap(), Some(thread::current().id()));
}

#[test]
fn test_statistics_track_contexts_and_scripts() {
    let isolate = common::isolate();
    let first = isolate.create_context(ContextOptions::default()).unwrap();
    let second = isolate.create_context(ContextOptions::default()).unwrap();

    common::eval(&first, "1");
    common::eval(&second, "2");

    let stats = isolate.statistics();
    assert_eq!(stats.context_count, 2);
    assert!(stats.script_count >= 2);

    drop(second);
    assert_eq!(isolate.statistics().context_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_call_with_lock_from_async_tasks() {
    let (isolate, context) = common::context();
    common::eval(&context, "globalThis.hits = 0");

    let mut waiters = Vec::new();
    for _ in 0..8 {
        let isolate = isolate.clone();
        let context = context.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            isolate.call_with_lock(false, move |_| {
                let hits = context
                    .execute(&DocumentInfo::script("hit.js"), "++hits", true)
                    .unwrap();
                let _ = tx.send(hits);
            });
        });
        waiters.push(rx);
    }

    let mut seen = Vec::new();
    for rx in waiters {
        let hits = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        seen.push(hits.as_i32().unwrap());
    }
    seen.sort();
    assert_eq!(seen, (1..=8).collect::<Vec<_>>());
}
