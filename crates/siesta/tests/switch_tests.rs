//! Switch/pattern-matching semantics: literals, destructuring, bindings,
//! guards, regex patterns, and the implicit subject.

use pretty_assertions::assert_eq;
use siesta::{eval, Context, Globals, Value};

fn run(source: &str) -> Value {
    let mut context = Context::new();
    let mut bindings = Globals::new();
    eval(source, &mut bindings, &mut context).unwrap()
}

fn run_display(source: &str) -> String {
    run(source).display_string()
}

// ============================================================================
// literal cases
// ============================================================================

#[test]
fn literal_alternation_matches() {
    assert_eq!(run_display("switch (1) { 1,2 => 2 }"), "2");
}

#[test]
fn unmatched_switch_without_default_is_null() {
    assert!(run("switch (9) { 1,2 => 2 }").is_null());
}

#[test]
fn default_catches_the_rest() {
    assert_eq!(run_display("switch (9) { 1 => 1; default => 42 }"), "42");
}

#[test]
fn literals_match_across_numeric_widths() {
    assert_eq!(run_display("switch (1L) { 1 => 'yes'; default => 'no' }"), "yes");
    assert_eq!(run_display("def x = 1.0; switch (x) { 1 => 'yes'; default => 'no' }"), "yes");
}

#[test]
fn string_and_bool_literals() {
    assert_eq!(run_display("switch ('hi') { 'lo' => 1; 'hi' => 2 }"), "2");
    assert_eq!(run_display("switch (true) { false => 1; true => 2 }"), "2");
}

#[test]
fn null_literal_pattern() {
    assert_eq!(run_display("def x = null; switch (x) { null => 'none'; default => 'some' }"), "none");
}

#[test]
fn negative_literal_pattern() {
    assert_eq!(run_display("switch (0 - 3) { -3 => 'neg'; default => 'other' }"), "neg");
}

// ============================================================================
// list destructuring
// ============================================================================

#[test]
fn list_alternatives_fall_through_to_later_case() {
    assert_eq!(
        run_display("switch ([1,2,3]) { [1,2],[1,2,4] => 1; [1,2,3] => 2 }"),
        "2"
    );
}

#[test]
fn star_matches_any_run() {
    assert_eq!(run_display("switch ([1,2,3,4]) { [1,*] => 'head'; default => 'no' }"), "head");
    assert_eq!(run_display("switch ([1,2,3,4]) { [*,4] => 'tail'; default => 'no' }"), "tail");
    assert_eq!(run_display("switch ([1,2,3,4]) { [1,*,4] => 'both'; default => 'no' }"), "both");
    assert_eq!(run_display("switch ([1]) { [1,*,4] => 'both'; default => 'no' }"), "no");
}

#[test]
fn wildcard_elements_skip_positions() {
    assert_eq!(run_display("switch ([7,8]) { [_,8] => 'ok'; default => 'no' }"), "ok");
}

#[test]
fn nested_list_patterns() {
    assert_eq!(
        run_display("switch ([[1,2],3]) { [[1,x],y] => x + y; default => 0 }"),
        "5"
    );
}

// ============================================================================
// map destructuring
// ============================================================================

#[test]
fn map_pattern_with_residual_star() {
    assert_eq!(
        run_display("switch ([a:1,b:[2,3],c:3]) { [a:1,b:[int x,y],*] => x+y; default => 2 }"),
        "5"
    );
}

#[test]
fn closed_map_pattern_requires_exact_keys() {
    assert_eq!(
        run_display("switch ([a:1,b:2]) { [a:1] => 'open?'; default => 'exact' }"),
        "exact"
    );
    assert_eq!(
        run_display("switch ([a:1,b:2]) { [a:1,*] => 'open'; default => 'exact' }"),
        "open"
    );
}

#[test]
fn missing_key_fails_the_pattern() {
    assert_eq!(
        run_display("switch ([a:1]) { [b:_,*] => 'has b'; default => 'no b' }"),
        "no b"
    );
}

// ============================================================================
// binding variables
// ============================================================================

#[test]
fn repeated_binding_name_means_equality() {
    assert_eq!(run_display("def a = [1,2,3,2]; switch(a) { [_,z,_,z] => z }"), "2");
    assert!(run("def a = [1,2,3,4]; switch(a) { [_,z,_,z] => z }").is_null());
}

#[test]
fn renaming_a_duplicate_drops_the_equality_constraint() {
    assert_eq!(run_display("def a = [1,2,3,4]; switch(a) { [_,z,_,w] => z + w }"), "6");
}

#[test]
fn typed_binding_tests_then_binds() {
    assert_eq!(
        run_display("def x = 3; switch (x) { int n => n * 2; default => 0 }"),
        "6"
    );
    assert_eq!(
        run_display("def x = 3L; switch (x) { int n => n * 2; default => 0 }"),
        "0"
    );
}

#[test]
fn bindings_usable_in_guard_and_result() {
    assert_eq!(
        run_display("switch ([5,6]) { [x,y] if x < y => y - x; default => 0 }"),
        "1"
    );
}

// ============================================================================
// guards, alternation, implicit subject
// ============================================================================

#[test]
fn per_alternative_guards() {
    assert_eq!(
        run_display(
            "def a = 7; switch (a) { 1 if it != 2, 2 if it == 2, 3 => it; 7 if it == 7 => 11; _ => 0 }"
        ),
        "11"
    );
}

#[test]
fn failed_guard_falls_to_later_case() {
    assert_eq!(
        run_display("def a = 3; switch (a) { 3 if it > 10 => 'big'; 3 => 'small' }"),
        "small"
    );
}

#[test]
fn subjectless_switch_uses_it_in_closure() {
    assert_eq!(
        run_display("def f = { switch { 1 => 'one'; default => 'other' } }; f(1)"),
        "one"
    );
}

#[test]
fn type_patterns_over_def_subject() {
    let source = "def f = { switch { int => 'int'; String => 'string'; List => 'list'; default => '?' } }\n\
                  f(1) + ',' + f('x') + ',' + f([1])";
    assert_eq!(run_display(source), "int,string,list");
}

// ============================================================================
// regex patterns
// ============================================================================

#[test]
fn regex_pattern_binds_captures() {
    assert_eq!(run_display("switch('abc') { /a(.)c/r => $1; default => 2 }"), "b");
}

#[test]
fn regex_pattern_non_matching_falls_through() {
    assert_eq!(run_display("switch('xyz') { /a(.)c/r => $1; default => 2 }"), "2");
}

#[test]
fn regex_pattern_on_def_subject_requires_string_value() {
    // an int value simply fails the string-shaped test at run time
    assert_eq!(run_display("def x = 5; switch(x) { /5/r => 'match'; default => 'no' }"), "no");
}

// ============================================================================
// result typing and nesting
// ============================================================================

#[test]
fn switch_is_an_expression() {
    assert_eq!(run_display("1 + switch (2) { 2 => 10; default => 0 }"), "11");
}

#[test]
fn nested_switch_in_result() {
    let source = "switch ([1,2]) { [x,y] => switch (x + y) { 3 => 'three'; default => '?' } }";
    assert_eq!(run_display(source), "three");
}

#[test]
fn default_written_first_still_runs_last() {
    assert_eq!(run_display("switch (1) { default => 'dflt'; 1 => 'one' }"), "one");
    assert_eq!(run_display("switch (9) { default => 'dflt'; 1 => 'one' }"), "dflt");
}
