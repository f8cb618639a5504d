//! Suspendable execution: sleep semantics, the forced-suspension
//! equivalence property, async natives with closure arguments, and
//! handler-based runs.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use pretty_assertions::assert_eq;
use siesta::{
    decorate::sleep_wrap,
    default_env, eval, CollectPrint, Context, Globals, NativeCall, NativeFunction, NativeInput,
    NativeOutcome, NativeParam, RuntimeError, Script, Type, Value,
};

fn run(source: &str) -> Value {
    let mut context = Context::new();
    let mut bindings = Globals::new();
    eval(source, &mut bindings, &mut context).unwrap()
}

/// Compiles plainly and with every eligible subexpression wrapped in
/// `sleep(0, _)`, and requires identical results.
fn assert_async_equivalent(source: &str) {
    let plain = run(source);

    let mut context = Context::new();
    let mut rewrite = sleep_wrap;
    let script = Script::compile_transformed(source, "decorated", &mut context, &[], &mut rewrite)
        .unwrap_or_else(|e| panic!("decorated compile failed for {source:?}: {e}"));
    let mut bindings = Globals::new();
    let mut output = CollectPrint::new();
    let decorated = script
        .run_sync_with_output(&mut bindings, &context, &mut output)
        .unwrap_or_else(|e| panic!("decorated run failed for {source:?}: {e}"));

    assert!(
        plain.loose_eq(&decorated),
        "decorated run diverged for {source:?}: {plain} vs {decorated}"
    );
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock after epoch")
        .as_nanos() as i64
}

/// `measure(closure)`: wall-clock nanoseconds a closure takes, surviving
/// suspension of the closure. Async only when its argument is.
fn measure_native() -> NativeFunction {
    NativeFunction::new(
        "measure",
        vec![NativeParam::async_param("closure", Type::Function)],
        Type::Long,
        false,
        |call: NativeCall| match call.input {
            NativeInput::Args(mut args) => {
                let closure = args.remove(0);
                Ok(NativeOutcome::CallValue {
                    callee: closure,
                    args: Vec::new(),
                    state: vec![Value::Long(now_nanos())],
                    next_step: 1,
                })
            }
            NativeInput::Resumed(_) => {
                let Some(Value::Long(start)) = call.state.first() else {
                    return Err(RuntimeError::internal("measure state corrupted"));
                };
                Ok(NativeOutcome::Return(Value::Long(now_nanos() - start)))
            }
        },
    )
}

// ============================================================================
// sleep basics
// ============================================================================

#[test]
fn sleep_returns_its_result() {
    assert_eq!(run("sleep(0, 42)").display_string(), "42");
    assert!(run("sleep(0)").is_null());
}

#[test]
fn sleep_resumes_with_locals_intact() {
    let source = "def a = 3; def b = sleep(0, 4); a + b";
    assert_eq!(run(source).display_string(), "7");
}

#[test]
fn operands_survive_across_a_suspension() {
    // the left operand is live on the operand stack while sleep suspends
    assert_eq!(run("10 + sleep(0, 5)").display_string(), "15");
    assert_eq!(run("[1, sleep(0, 2), 3]").display_string(), "[1, 2, 3]");
}

#[test]
fn suspension_inside_nested_calls_unwinds_every_frame() {
    let source = "def inner() { sleep(0, 1) + 1 }\n\
                  def outer() { inner() + 10 }\n\
                  outer() + 100";
    assert_eq!(run(source).display_string(), "112");
}

#[test]
fn suspension_inside_closure_restores_captures() {
    let source = "def n = 5\n\
                  def f = { sleep(0, it) + n }\n\
                  f(2)";
    assert_eq!(run(source).display_string(), "7");
}

#[test]
fn side_effects_stay_in_program_order() {
    let mut context = Context::new();
    let mut bindings = Globals::new();
    let script = Script::compile(
        "print 'a'; sleep(0); print 'b'; sleep(0); print 'c'",
        "order",
        &mut context,
    )
    .unwrap();
    let mut output = CollectPrint::new();
    script
        .run_sync_with_output(&mut bindings, &context, &mut output)
        .unwrap();
    assert_eq!(output.output(), "abc");
}

#[test]
fn suspension_mid_switch_restores_pattern_state() {
    let source = "switch ([1,2]) { [x,y] if sleep(0, true) => x + y + sleep(0, 10); default => 0 }";
    assert_eq!(run(source).display_string(), "13");
}

// ============================================================================
// forced-suspension equivalence
// ============================================================================

#[test]
fn decorated_arithmetic_is_equivalent() {
    assert_async_equivalent("1 + 2 * 3");
    assert_async_equivalent("def x = 1; def y = x + 2; x + y");
    assert_async_equivalent("(1 + 2) * (3 + 4) % 5");
}

#[test]
fn decorated_control_flow_is_equivalent() {
    assert_async_equivalent("def n = 3; n > 2 ? 'big' : 'small'");
    assert_async_equivalent("def i = 0; def sum = 0; while (i < 5) { sum = sum + i; i = i + 1 }; sum");
    assert_async_equivalent("if (1 < 2) 'yes' else 'no'");
    assert_async_equivalent("true && false || true");
}

#[test]
fn decorated_functions_are_equivalent() {
    assert_async_equivalent("def f(int n) { n <= 1 ? 1 : n * f(n - 1) }; f(5)");
    assert_async_equivalent("def add = { x, y -> x + y }; add(3, 4)");
    assert_async_equivalent("def n = 10; def f = { n + it }; f(5)");
}

#[test]
fn decorated_switches_are_equivalent() {
    assert_async_equivalent("switch (1) { 1,2 => 2 }");
    assert_async_equivalent("switch ([1,2,3]) { [1,2],[1,2,4] => 1; [1,2,3] => 2 }");
    assert_async_equivalent(
        "switch ([a:1,b:[2,3],c:3]) { [a:1,b:[int x,y],*] => x+y; default => 2 }",
    );
    assert_async_equivalent("def a = [1,2,3,2]; switch(a) { [_,z,_,z] => z }");
    assert_async_equivalent(
        "def a = 7; switch (a) { 1 if it != 2, 2 if it == 2, 3 => it; 7 if it == 7 => 11; _ => 0 }",
    );
    assert_async_equivalent("switch('abc') { /a(.)c/r => $1; default => 2 }");
}

#[test]
fn method_suspension_restores_the_receiver() {
    let source = "class Acc { int total; def add(int n) { total = total + sleep(0, n); total } }\n\
                  def a = new Acc(0)\n\
                  a.add(3); a.add(4)";
    assert_eq!(run(source).display_string(), "7");
}

#[test]
fn decorated_class_methods_are_equivalent() {
    assert_async_equivalent("class C { int v; def d() { v * 2 } }\nnew C(21).d()");
}

#[test]
fn decorated_strings_and_collections_are_equivalent() {
    assert_async_equivalent("def n = 3; \"n=$n ${n * 2}\"");
    assert_async_equivalent("[1, 2, 3].sum()");
    assert_async_equivalent("def m = [a:1, b:2]; m.a + m.b");
    assert_async_equivalent("def s = 'abc'; s.size()");
}

// ============================================================================
// async natives and closure arguments
// ============================================================================

#[test]
fn measure_times_a_suspending_closure() {
    let mut context = Context::new();
    context.register_function(measure_native());
    let mut bindings = Globals::new();
    let value = eval("measure{ sleep(1000) }", &mut bindings, &mut context).unwrap();
    let Value::Long(nanos) = value else {
        panic!("expected long, got {value}");
    };
    assert!(nanos >= 1_000_000_000, "slept only {nanos}ns");
    assert!(nanos <= 1_100_000_000, "slept too long: {nanos}ns");
}

#[test]
fn measure_with_synchronous_closure_is_fast() {
    let mut context = Context::new();
    context.register_function(measure_native());
    let mut bindings = Globals::new();
    let value = eval("measure{ 1 + 2 }", &mut bindings, &mut context).unwrap();
    let Value::Long(nanos) = value else {
        panic!("expected long, got {value}");
    };
    assert!(nanos < 1_000_000_000);
}

// ============================================================================
// handler-based runs
// ============================================================================

#[test]
fn run_delivers_result_through_handler() {
    let mut context = Context::new();
    let script = Script::compile("sleep(0, 6) * 7", "handler", &mut context).unwrap();
    let result: Rc<RefCell<Option<Result<Value, RuntimeError>>>> = Rc::new(RefCell::new(None));
    let slot = result.clone();
    script.run(
        Globals::new(),
        Rc::new(context),
        default_env(),
        Box::new(move |r| {
            *slot.borrow_mut() = Some(r);
        }),
    );
    let value = result.borrow_mut().take().expect("handler invoked").unwrap();
    assert_eq!(value.display_string(), "42");
}

#[test]
fn runtime_errors_reach_the_handler() {
    let mut context = Context::new();
    let script = Script::compile("sleep(0); 1 / 0", "boom", &mut context).unwrap();
    let result: Rc<RefCell<Option<Result<Value, RuntimeError>>>> = Rc::new(RefCell::new(None));
    let slot = result.clone();
    script.run(
        Globals::new(),
        Rc::new(context),
        default_env(),
        Box::new(move |r| {
            *slot.borrow_mut() = Some(r);
        }),
    );
    let err = result.borrow_mut().take().expect("handler invoked").unwrap_err();
    assert!(err.message.contains("divide by zero"), "{err}");
}
