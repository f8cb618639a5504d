//! Compile-time diagnostics from the switch analyser: duplicate literals,
//! impossible patterns, unreachable cases, binding rules.

use siesta::{eval, Context, Globals, ScriptError};

fn compile_error(source: &str) -> String {
    let mut context = Context::new();
    let mut bindings = Globals::new();
    match eval(source, &mut bindings, &mut context) {
        Err(ScriptError::Compile(e)) => e.message,
        Err(ScriptError::Runtime(e)) => panic!("expected compile error, got runtime error: {e}"),
        Ok(v) => panic!("expected compile error, got value {v}"),
    }
}

fn compiles(source: &str) {
    let mut context = Context::new();
    let mut bindings = Globals::new();
    if let Err(ScriptError::Compile(e)) = eval(source, &mut bindings, &mut context) {
        panic!("expected successful compile, got: {e}");
    }
}

// ============================================================================
// duplicate literals
// ============================================================================

#[test]
fn duplicate_literal_rejected() {
    let msg = compile_error("switch (1) { 1 => 2; 1 => 3 }");
    assert!(msg.contains("literal match occurs multiple times"), "{msg}");
}

#[test]
fn duplicate_detection_crosses_numeric_widenings() {
    for source in [
        "def x = 1; switch (x) { 1 => 2; 1L => 3 }",
        "def x = 1; switch (x) { 1 => 2; 1.0 => 3 }",
        "def x = 1; switch (x) { 1.0 => 2; 1.00 => 3 }",
    ] {
        let msg = compile_error(source);
        assert!(msg.contains("literal match occurs multiple times"), "{source}: {msg}");
    }
}

#[test]
fn duplicate_within_one_alternation_rejected() {
    let msg = compile_error("switch (1) { 1,1 => 2 }");
    assert!(msg.contains("literal match occurs multiple times"), "{msg}");
}

#[test]
fn distinct_literals_accepted() {
    compiles("switch (1) { 1 => 2; 2 => 3; 1.5 => 4 }");
}

// ============================================================================
// type compatibility
// ============================================================================

#[test]
fn impossible_type_pattern_rejected() {
    let msg = compile_error("int x = 3; switch(x) { long => 4; default => 2 }");
    assert!(msg.contains("can never be long"), "{msg}");
}

#[test]
fn incompatible_literal_rejected() {
    let msg = compile_error("def s = 'a'; String t = s; switch(t) { 1 => 2; default => 3 }");
    assert!(msg.contains("cannot compare type int to String"), "{msg}");
}

#[test]
fn binding_variable_type_must_intersect() {
    let msg = compile_error("int x = 3; switch(x) { long y => y; default => 2 }");
    assert!(msg.contains("not compatible"), "{msg}");
}

#[test]
fn def_subject_accepts_any_type_pattern() {
    compiles("def x = 3; switch(x) { long => 4; String => 5; default => 2 }");
}

#[test]
fn list_pattern_on_int_subject_rejected() {
    let msg = compile_error("int x = 3; switch(x) { [1,2] => 4; default => 2 }");
    assert!(msg.contains("can never be List"), "{msg}");
}

#[test]
fn regex_pattern_on_int_subject_rejected() {
    let msg = compile_error("int x = 3; switch(x) { /ab/r => 4; default => 2 }");
    assert!(msg.contains("String"), "{msg}");
}

// ============================================================================
// reachability
// ============================================================================

#[test]
fn default_after_catch_all_never_applicable() {
    let msg = compile_error("switch ([1,2,3]) { _ => 1; default => 2 }");
    assert!(msg.contains("default case is never applicable"), "{msg}");
}

#[test]
fn default_before_catch_all_also_never_applicable() {
    // the default runs last wherever it is written, so a covering case
    // after it still starves it
    let msg = compile_error("switch (1) { default => 99; _ => 1 }");
    assert!(msg.contains("default case is never applicable"), "{msg}");
    let msg = compile_error("def a = 1; switch (a) { default => 99; x => x }");
    assert!(msg.contains("default case is never applicable"), "{msg}");
}

#[test]
fn default_before_non_covering_cases_is_fine() {
    compiles("switch (9) { default => 'dflt'; 1 => 'one' }");
}

#[test]
fn alternative_covered_by_previous_in_same_case() {
    let msg = compile_error("List a = [1,2]; switch(a) { [x,y],[_,x] => x }");
    assert!(msg.contains("covered by previous"), "{msg}");
}

#[test]
fn case_covered_by_earlier_case() {
    let msg = compile_error("def a = 1; switch(a) { _ => 1; 2 => 2 }");
    assert!(msg.contains("covered by previous"), "{msg}");
}

#[test]
fn type_pattern_absorbs_literal_for_typed_subject() {
    let msg = compile_error("int x = 3; switch(x) { int => 1; 2 => 2 }");
    assert!(msg.contains("covered by previous"), "{msg}");
}

#[test]
fn type_pattern_does_not_absorb_literal_for_def_subject() {
    // for a def subject the literal 2 also matches longs and decimals,
    // which `int` does not cover
    compiles("def x = 3; switch(x) { int => 1; 2 => 2 }");
}

#[test]
fn guarded_case_never_absorbs_later_cases() {
    compiles("def a = 1; switch(a) { _ if it > 0 => 1; 2 => 2; default => 3 }");
    let msg = compile_error("def a = 1; switch(a) { _ => 1; 2 => 2 }");
    assert!(msg.contains("covered by previous"), "{msg}");
}

#[test]
fn open_list_pattern_absorbs_longer_fixed_pattern() {
    let msg = compile_error("List a = [1,2]; switch(a) { [1,*] => 1; [1,2,3] => 2 }");
    assert!(msg.contains("covered by previous"), "{msg}");
}

#[test]
fn multiple_explicit_defaults_rejected() {
    let msg = compile_error("switch (1) { default => 1; default => 2 }");
    assert!(msg.contains("cannot have multiple 'default'"), "{msg}");
}

// ============================================================================
// binding rules
// ============================================================================

#[test]
fn binding_shadowing_enclosing_variable_rejected() {
    let msg = compile_error("def z = 1; def a = [1,2]; switch(a) { [z,y] => z }");
    assert!(msg.contains("binding variable 'z' shadows another variable"), "{msg}");
}

#[test]
fn bindings_do_not_leak_between_cases() {
    // each case has its own binding slots; reusing a name is fine
    compiles("def a = [1,2]; switch(a) { [x] => x; [x,y] => x + y }");
}

#[test]
fn interpolation_not_allowed_in_patterns() {
    let msg = compile_error("def n = 1; switch ('a') { \"x$n\" => 1; default => 2 }");
    assert!(msg.contains("interpolation not allowed"), "{msg}");
}
