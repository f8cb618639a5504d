//! The host-facing surface: bindings, native registration, classes,
//! REPL-mode globals, output capture, and general language behaviour the
//! embedding relies on.

use pretty_assertions::assert_eq;
use siesta::{
    compile_class, eval, CollectPrint, Context, Globals, NativeFunction, NativeInput,
    NativeOutcome, NativeParam, RuntimeErrorKind, Script, ScriptError, Type, Value,
};

fn run(source: &str) -> Value {
    let mut context = Context::new();
    let mut bindings = Globals::new();
    eval(source, &mut bindings, &mut context).unwrap()
}

fn run_display(source: &str) -> String {
    run(source).display_string()
}

// ============================================================================
// eval and bindings
// ============================================================================

#[test]
fn bindings_are_visible_and_updated() {
    let mut context = Context::new();
    let mut bindings = Globals::new();
    bindings.insert("x".into(), Value::Int(41));
    let value = eval("x = x + 1; x", &mut bindings, &mut context).unwrap();
    assert_eq!(value.display_string(), "42");
    assert!(bindings.get("x").unwrap().loose_eq(&Value::Int(42)));
}

#[test]
fn undefined_variable_is_a_compile_error() {
    let mut context = Context::new();
    let mut bindings = Globals::new();
    let err = eval("y + 1", &mut bindings, &mut context).unwrap_err();
    let ScriptError::Compile(e) = err else {
        panic!("expected compile error");
    };
    assert!(e.message.contains("'y' is not defined"), "{}", e.message);
}

#[test]
fn repl_mode_defers_undefined_variables_to_run_time() {
    let mut context = Context::new().repl_mode(true);
    let mut bindings = Globals::new();
    let err = eval("y + 1", &mut bindings, &mut context).unwrap_err();
    assert!(matches!(err, ScriptError::Runtime(_)), "{err}");
}

#[test]
fn repl_mode_declarations_survive_across_scripts() {
    let mut context = Context::new().repl_mode(true);
    let mut bindings = Globals::new();
    eval("def counter = 10", &mut bindings, &mut context).unwrap();
    eval("counter = counter + 5", &mut bindings, &mut context).unwrap();
    let value = eval("counter", &mut bindings, &mut context).unwrap();
    assert_eq!(value.display_string(), "15");
}

// ============================================================================
// native function registration
// ============================================================================

fn twice_native() -> NativeFunction {
    NativeFunction::new(
        "twice",
        vec![NativeParam::new("x", Type::Def)],
        Type::Def,
        false,
        |call| {
            let NativeInput::Args(args) = call.input else {
                unreachable!("twice never re-enters");
            };
            Ok(NativeOutcome::Return(args[0].mul(&Value::Int(2))?))
        },
    )
}

#[test]
fn registered_native_is_callable() {
    let mut context = Context::new();
    context.register_function(twice_native());
    let mut bindings = Globals::new();
    let value = eval("twice(21)", &mut bindings, &mut context).unwrap();
    assert_eq!(value.display_string(), "42");
}

#[test]
fn deregistered_native_no_longer_resolves() {
    let mut context = Context::new();
    context.register_function(twice_native());
    context.deregister_function("twice");
    let mut bindings = Globals::new();
    let err = eval("twice(21)", &mut bindings, &mut context).unwrap_err();
    assert!(matches!(err, ScriptError::Compile(_)), "{err}");
}

#[test]
fn native_arity_is_checked_at_compile_time() {
    let mut context = Context::new();
    context.register_function(twice_native());
    let mut bindings = Globals::new();
    let err = eval("twice(1, 2)", &mut bindings, &mut context).unwrap_err();
    let ScriptError::Compile(e) = err else {
        panic!("expected compile error");
    };
    assert!(e.message.contains("too many arguments"), "{}", e.message);
}

// ============================================================================
// classes
// ============================================================================

#[test]
fn classes_with_fields_and_methods() {
    let source = "class Point { int x; int y; def mag() { x * x + y * y } }\n\
                  def p = new Point(3, 4)\n\
                  p.mag()";
    assert_eq!(run_display(source), "25");
}

#[test]
fn field_defaults_are_optional_constructor_args() {
    let source = "class Greeter { String greeting = 'hello' }\n\
                  new Greeter().greeting";
    assert_eq!(run_display(source), "hello");
}

#[test]
fn field_assignment_through_methods() {
    let source = "class Counter { int n; def bump() { n = n + 1 } }\n\
                  def c = new Counter(0)\n\
                  c.bump(); c.bump(); c.n";
    assert_eq!(run_display(source), "2");
}

#[test]
fn inheritance_dispatches_through_the_hierarchy() {
    let source = "class Base { def who() { 'base' } }\n\
                  class Sub extends Base { int v }\n\
                  new Sub(1).who()";
    assert_eq!(run_display(source), "base");
}

#[test]
fn registered_classes_are_usable_from_later_scripts() {
    let mut context = Context::new();
    compile_class(
        "class Vec { int x; int y; def dot(Vec o) { x * o.x + y * o.y } }",
        "vec.siesta",
        &mut context,
    )
    .unwrap();
    let mut bindings = Globals::new();
    let value = eval("new Vec(1, 2).dot(new Vec(3, 4))", &mut bindings, &mut context).unwrap();
    assert_eq!(value.display_string(), "11");
}

#[test]
fn package_names_qualify_classes() {
    let mut context = Context::new();
    compile_class("package geo\nclass P { int x }", "p.siesta", &mut context).unwrap();
    assert!(context.find_class("geo.P").is_some());
    let mut bindings = Globals::new();
    let value = eval(
        "import geo.P\nnew P(7).x",
        &mut bindings,
        &mut context,
    )
    .unwrap();
    assert_eq!(value.display_string(), "7");
}

#[test]
fn instanceof_respects_inheritance() {
    let source = "class A { int v }\n\
                  class B extends A { }\n\
                  def b = new B(1)\n\
                  (b instanceof A ? 'yes' : 'no') + (b !instanceof B ? '!' : '.')";
    assert_eq!(run_display(source), "yes.");
}

// ============================================================================
// output and errors
// ============================================================================

#[test]
fn print_output_is_captured() {
    let mut context = Context::new();
    let script = Script::compile("print 'a'; println 'b'; print 'c'", "out", &mut context).unwrap();
    let mut bindings = Globals::new();
    let mut output = CollectPrint::new();
    script.run_sync_with_output(&mut bindings, &context, &mut output).unwrap();
    assert_eq!(output.output(), "ab\nc");
}

#[test]
fn die_aborts_with_its_message() {
    let mut context = Context::new();
    let mut bindings = Globals::new();
    let err = eval("die 'went wrong'", &mut bindings, &mut context).unwrap_err();
    let ScriptError::Runtime(e) = err else {
        panic!("expected runtime error");
    };
    assert_eq!(e.kind, RuntimeErrorKind::Die);
    assert!(e.message.contains("went wrong"));
}

#[test]
fn null_dereference_is_a_distinct_error_kind() {
    let mut context = Context::new();
    let mut bindings = Globals::new();
    let err = eval("def m = null; m.x", &mut bindings, &mut context).unwrap_err();
    let ScriptError::Runtime(e) = err else {
        panic!("expected runtime error");
    };
    assert_eq!(e.kind, RuntimeErrorKind::Null);
}

#[test]
fn safe_navigation_short_circuits_null() {
    assert!(run("def m = null; m?.x").is_null());
    assert_eq!(run_display("def m = [x:1]; m?.x"), "1");
    assert!(run("def m = null; m?.size()").is_null());
}

#[test]
fn runtime_errors_carry_source_locations() {
    let mut context = Context::new();
    let mut bindings = Globals::new();
    let err = eval("def x = 1\ndef y = x / 0\ny", &mut bindings, &mut context).unwrap_err();
    let ScriptError::Runtime(e) = err else {
        panic!("expected runtime error");
    };
    assert_eq!(e.range.line, 2);
    assert!(e.to_string().contains("def y = x / 0"));
}

// ============================================================================
// general language surface
// ============================================================================

#[test]
fn elvis_falls_back_on_falsy() {
    assert_eq!(run_display("def x = null; x ?: 'fallback'"), "fallback");
    assert_eq!(run_display("def x = 'set'; x ?: 'fallback'"), "set");
}

#[test]
fn string_interpolation_inside_strings() {
    assert_eq!(run_display("def n = 6; \"${n * 7} is the answer\""), "42 is the answer");
}

#[test]
fn regex_match_and_captures() {
    assert_eq!(run_display("'2026-08-01' =~ /(\\d+)-(\\d+)/ ? $2 : 'no'"), "08");
    assert_eq!(run_display("'abc' !~ /z/ ? 'no z' : 'z'"), "no z");
}

#[test]
fn regex_substitution() {
    assert_eq!(run_display("def s = 'a-b-c'; s =~ s/-/./g"), "a.b.c");
    assert_eq!(run_display("def s = 'a-b-c'; s =~ s/-/./"), "a.b-c");
    assert_eq!(run_display("def s = 'ab'; s =~ s/(a)(b)/$2$1/"), "ba");
}

#[test]
fn casts_convert_numeric_widths() {
    assert_eq!(run_display("def x = 3.9D; x as int"), "3");
    assert_eq!(run_display("'17' as long"), "17");
    assert_eq!(run_display("1 as String"), "1");
}

#[test]
fn decimal_arithmetic_is_exact() {
    assert_eq!(run_display("0.1 + 0.2"), "0.3");
    assert_eq!(run_display("1.50 * 2"), "3.00");
}

#[test]
fn indexing_and_nested_updates() {
    assert_eq!(run_display("def a = [1,2,3]; a[1] = 9; a[1] + a[2]"), "12");
    assert_eq!(run_display("def m = [a:1]; m['b'] = 2; m.a + m.b"), "3");
    assert_eq!(run_display("def a = [1,2,3]; a[-1]"), "3");
}

#[test]
fn eval_runs_nested_source() {
    assert_eq!(run_display("eval('1 + 2') + 10"), "13");
    assert_eq!(run_display("eval('sleep(0, 5)') + 1"), "6");
}

#[test]
fn closures_capture_by_reference() {
    let source = "def n = 1\n\
                  def bump = { n = n + 1 }\n\
                  bump(); bump()\n\
                  n";
    assert_eq!(run_display(source), "3");
}

#[test]
fn method_handles_are_first_class() {
    let source = "class Greeter { String name; def hello() { 'hi ' + name } }\n\
                  def g = new Greeter('sam')\n\
                  def h = g.hello\n\
                  h()";
    assert_eq!(run_display(source), "hi sam");
}
