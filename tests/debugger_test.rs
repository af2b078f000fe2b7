mod common;

use std::thread;
use std::time::{Duration, Instant};

use common::RecordingEnvironment;
use serde_json::json;
use v8_host_bridge::{ContextOptions, DocumentInfo, ExecutionState, IsolateOptions, MessageLoopExit, V8Isolate, Value};

const TIMEOUT: Duration = Duration::from_secs(10);

fn wait_for_state(isolate: &V8Isolate, state: ExecutionState) {
    let deadline = Instant::now() + TIMEOUT;
    while isolate.execution_state() != state {
        assert!(Instant::now() < deadline, "isolate never reached {state:?}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn debugging() -> ContextOptions {
    ContextOptions::default().name("debuggee").enable_debugging(true)
}

#[test]
fn test_cancel_releases_the_waiting_thread() {
    let (isolate, context) = common::context();
    let watcher = {
        let isolate = isolate.clone();
        let context = context.clone();
        thread::spawn(move || {
            wait_for_state(&isolate, ExecutionState::AwaitingDebugger);
            assert!(context.cancel_await_debugger());
        })
    };

    assert_eq!(context.await_debugger_and_pause().unwrap(), MessageLoopExit::Canceled);
    watcher.join().unwrap();
    assert_eq!(isolate.execution_state(), ExecutionState::Idle);
    // nothing left to cancel
    assert!(!context.cancel_await_debugger());
}

#[test]
fn test_terminate_releases_the_waiting_thread() {
    let (isolate, context) = common::context();
    let watcher = {
        let isolate = isolate.clone();
        thread::spawn(move || {
            wait_for_state(&isolate, ExecutionState::AwaitingDebugger);
            isolate.terminate_execution(false);
        })
    };

    assert_eq!(context.await_debugger_and_pause().unwrap(), MessageLoopExit::Terminated);
    watcher.join().unwrap();
    assert_eq!(common::eval(&context, "6 * 7"), Value::Int32(42));
}

#[test]
fn test_debugger_client_resumes_the_waiting_thread() {
    let env = RecordingEnvironment::new();
    let isolate = env.isolate(IsolateOptions::default().name("debugged").debug_port(9333));
    let context = isolate.create_context(debugging()).unwrap();
    let agent = env.debug_agent().expect("a debug agent for the debugging context");

    agent.connector.connect_client();
    let enable = agent.command("Runtime.enable", json!({}));
    // the context announcement arrives ahead of the reply
    let created = agent
        .wait_for_event("Runtime.executionContextCreated", TIMEOUT)
        .expect("the context is announced");
    assert_eq!(created["params"]["context"]["name"], "debuggee");
    let reply = agent.wait_for(TIMEOUT, |m| m["id"] == enable).expect("Runtime.enable reply");
    assert!(reply.get("error").is_none(), "{reply}");

    let client = {
        let isolate = isolate.clone();
        let agent = agent.clone();
        thread::spawn(move || {
            wait_for_state(&isolate, ExecutionState::AwaitingDebugger);
            agent.command("Runtime.runIfWaitingForDebugger", json!({}));
        })
    };

    assert_eq!(context.await_debugger_and_pause().unwrap(), MessageLoopExit::Resumed);
    client.join().unwrap();
    agent.connector.disconnect_client();
}

#[test]
fn test_breakpoints_pause_until_the_client_resumes() {
    let env = RecordingEnvironment::new();
    let isolate = env.isolate(IsolateOptions::default());
    let context = isolate.create_context(debugging()).unwrap();
    let agent = env.debug_agent().unwrap();

    agent.connector.connect_client();
    let enable = agent.command("Debugger.enable", json!({}));
    agent.wait_for(TIMEOUT, |m| m["id"] == enable).expect("Debugger.enable reply");

    let client = {
        let isolate = isolate.clone();
        let agent = agent.clone();
        thread::spawn(move || {
            let paused = agent.wait_for_event("Debugger.paused", TIMEOUT).expect("a pause");
            assert_eq!(isolate.execution_state(), ExecutionState::PausedInDebugger);

            // evaluate while paused, then resume
            let frame = paused["params"]["callFrames"][0]["callFrameId"].clone();
            let eval = agent.command(
                "Debugger.evaluateOnCallFrame",
                json!({ "callFrameId": frame, "expression": "x * 2" }),
            );
            let reply = agent.wait_for(TIMEOUT, |m| m["id"] == eval).expect("an evaluation");
            assert_eq!(reply["result"]["result"]["value"], 42);
            agent.command("Debugger.resume", json!({}));
        })
    };

    let result = context
        .execute(&DocumentInfo::script("paused.js"), "let x = 21; debugger; x + 1", true)
        .unwrap();
    client.join().unwrap();
    assert_eq!(result, Value::Int32(22));
    assert_eq!(isolate.execution_state(), ExecutionState::Idle);
}

#[test]
fn test_contexts_without_debugging_get_no_agent() {
    let env = RecordingEnvironment::new();
    let isolate = env.isolate(IsolateOptions::default());
    let _context = isolate.create_context(ContextOptions::default()).unwrap();
    assert!(env.debug_agent().is_none());
}

#[test]
fn test_cpu_profile_covers_executed_functions() {
    let (isolate, context) = common::context();
    isolate.set_cpu_profile_sample_interval(100);
    assert!(isolate.begin_cpu_profile("busy", true).unwrap());

    common::eval(
        &context,
        "function spin() { let s = 0; const end = Date.now() + 50; while (Date.now() < end) s++; return s; } spin()",
    );

    let mut names = Vec::new();
    let mut sampled = false;
    assert!(isolate
        .end_cpu_profile("busy", |profile| {
            assert_eq!(profile.name, "busy");
            assert!(profile.end_timestamp >= profile.start_timestamp);
            if let Some(root) = &profile.root {
                names = root.walk().iter().map(|n| n.function_name.clone()).collect();
            }
            sampled = !profile.samples.is_empty();
        })
        .unwrap());
    assert!(names.iter().any(|n| n == "spin"), "{names:?}");
    assert!(sampled);
    assert_eq!(isolate.statistics().cpu_profile_count, 0);
}
