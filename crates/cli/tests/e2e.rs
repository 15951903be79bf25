//! End-to-end scenarios: source text in, stdout text out.

mod common;

use common::{eval, eval_stress, runtime_error};
use skiff_cli::RunError;

// ----------------------------------------------------------------------
// The canonical scenarios
// ----------------------------------------------------------------------

#[test]
fn test_arithmetic_precedence() {
    assert_eq!(eval("print(1 + 2 * 3);").unwrap(), "7\n");
}

#[test]
fn test_string_concatenation() {
    assert_eq!(
        eval("var a = \"hi\"; var b = \"!\"; print(a + b);").unwrap(),
        "hi!\n"
    );
}

#[test]
fn test_recursive_fibonacci() {
    assert_eq!(
        eval("fun f(n){ if(n<2) return n; return f(n-1)+f(n-2); } print(f(10));").unwrap(),
        "55\n"
    );
}

#[test]
fn test_closure_counter() {
    assert_eq!(
        eval(
            "fun mk(){ var x=0; fun i(){ x=x+1; return x; } return i; } \
             var g=mk(); print(g()); print(g()); print(g());"
        )
        .unwrap(),
        "1\n2\n3\n"
    );
}

#[test]
fn test_list_indexing() {
    assert_eq!(
        eval("var xs=[1,2,3]; xs[0]=9; print(xs[0]); print(xs[2]);").unwrap(),
        "9\n3\n"
    );
}

#[test]
fn test_dict_indexing() {
    assert_eq!(
        eval("var d={\"a\":1}; d[\"b\"]=2; print(d[\"a\"]+d[\"b\"]);").unwrap(),
        "3\n"
    );
}

// ----------------------------------------------------------------------
// Control flow and operators
// ----------------------------------------------------------------------

#[test]
fn test_if_else() {
    assert_eq!(
        eval("if (1 < 2) print(\"yes\"); else print(\"no\");").unwrap(),
        "yes\n"
    );
    assert_eq!(
        eval("if (nil) print(\"yes\"); else print(\"no\");").unwrap(),
        "no\n"
    );
}

#[test]
fn test_while_loop() {
    assert_eq!(
        eval("var i = 3; while (i > 0) { print(i); i = i - 1; }").unwrap(),
        "3\n2\n1\n"
    );
}

#[test]
fn test_for_loop_sums() {
    assert_eq!(
        eval("var sum = 0; for (var i = 0; i < 5; i = i + 1) { sum = sum + i; } print(sum);")
            .unwrap(),
        "10\n"
    );
}

#[test]
fn test_and_or_leave_operands() {
    assert_eq!(eval("print(false and 1);").unwrap(), "false\n");
    assert_eq!(eval("print(true and 1);").unwrap(), "1\n");
    assert_eq!(eval("print(false or \"x\");").unwrap(), "x\n");
    assert_eq!(eval("print(2 or 3);").unwrap(), "2\n");
}

#[test]
fn test_equality_and_truthiness() {
    assert_eq!(eval("print(0 and \"zero is truthy\");").unwrap(), "zero is truthy\n");
    assert_eq!(eval("print(\"\" and \"empty is truthy\");").unwrap(), "empty is truthy\n");
    assert_eq!(eval("print(1 == 1.0); print(1 != 2); print(!nil);").unwrap(), "true\ntrue\ntrue\n");
    assert_eq!(eval("print(\"a\" == \"a\"); print(\"a\" == \"b\");").unwrap(), "true\nfalse\n");
}

#[test]
fn test_compound_assignment() {
    assert_eq!(
        eval("var a = 10; a -= 4; a *= 2; print(a);").unwrap(),
        "12\n"
    );
}

#[test]
fn test_shadowing_in_nested_scope() {
    assert_eq!(
        eval("var a = 1; { var a = 2; print(a); } print(a);").unwrap(),
        "2\n1\n"
    );
}

#[test]
fn test_initializer_sees_outer_binding() {
    // The local being declared is skipped during resolution, so its
    // initializer reads the outer binding of the same name.
    assert_eq!(eval("var a = 1; { var a = a + 1; print(a); }").unwrap(), "2\n");
}

// ----------------------------------------------------------------------
// Functions and closures
// ----------------------------------------------------------------------

#[test]
fn test_anonymous_function_expression() {
    assert_eq!(
        eval("var f = fun(x) { return x + 1; }; print(f(2));").unwrap(),
        "3\n"
    );
}

#[test]
fn test_sibling_closures_share_one_cell() {
    // Two closures from the same activation share storage.
    assert_eq!(
        eval(
            "fun mk() { var x = 0; \
               fun a() { x = x + 1; return x; } \
               fun b() { x = x + 1; return x; } \
               return [a, b]; } \
             var fs = mk(); print(fs[0]()); print(fs[1]());"
        )
        .unwrap(),
        "1\n2\n"
    );
}

#[test]
fn test_separate_activations_get_fresh_cells() {
    assert_eq!(
        eval(
            "fun mk() { var x = 0; fun i() { x = x + 1; return x; } return i; } \
             var g1 = mk(); var g2 = mk(); print(g1()); print(g1()); print(g2());"
        )
        .unwrap(),
        "1\n2\n1\n"
    );
}

#[test]
fn test_upvalue_closed_after_scope_exit() {
    assert_eq!(
        eval(
            "var f; { var x = \"captured\"; fun g() { return x; } f = g; } print(f());"
        )
        .unwrap(),
        "captured\n"
    );
}

#[test]
fn test_arity_mismatch() {
    assert_eq!(
        runtime_error("fun f(a, b) { return a; } f(1);"),
        "Expected 2 arguments but got 1."
    );
}

#[test]
fn test_deep_recursion_overflows() {
    assert_eq!(runtime_error("fun f() { return f(); } f();"), "Stack overflow.");
}

// ----------------------------------------------------------------------
// Coroutines
// ----------------------------------------------------------------------

#[test]
fn test_coroutine_yields_in_sequence() {
    assert_eq!(
        eval(
            "fun gen(start) { var i = start; while (true) { yield i; i = i + 1; } } \
             var c = coroutine gen; print(c(10)); print(c()); print(c());"
        )
        .unwrap(),
        "10\n11\n12\n"
    );
}

#[test]
fn test_resume_value_becomes_yield_result() {
    assert_eq!(
        eval(
            "fun echo() { var got = yield 1; print(got); return 99; } \
             var c = coroutine echo; print(c()); print(c(\"hi\"));"
        )
        .unwrap(),
        "1\nhi\n99\n"
    );
}

#[test]
fn test_reset_rewinds_to_ready() {
    assert_eq!(
        eval(
            "fun one() { yield 1; yield 2; } var c = coroutine one; \
             print(c()); print(c()); reset(c); print(c());"
        )
        .unwrap(),
        "1\n2\n1\n"
    );
}

#[test]
fn test_completed_coroutine_cannot_resume() {
    assert_eq!(
        runtime_error("fun f() { return 1; } var c = coroutine f; print(c()); c();"),
        "Cannot resume a completed coroutine."
    );
}

#[test]
fn test_yield_from_main_is_an_error() {
    assert_eq!(runtime_error("yield 1;"), "Cannot yield from the main coroutine.");
}

#[test]
fn test_coroutine_of_non_function_is_an_error() {
    assert_eq!(
        runtime_error("var c = coroutine 3;"),
        "Operand of 'coroutine' must be a function."
    );
}

#[test]
fn test_await_is_reserved() {
    assert_eq!(runtime_error("await 1;"), "'await' is reserved.");
}

#[test]
fn test_nested_coroutines_return_to_direct_parent() {
    assert_eq!(
        eval(
            "fun inner() { yield \"a\"; yield \"b\"; } \
             fun outer() { var c = coroutine inner; yield c(); yield c(); } \
             var o = coroutine outer; print(o()); print(o());"
        )
        .unwrap(),
        "a\nb\n"
    );
}

// ----------------------------------------------------------------------
// Natives
// ----------------------------------------------------------------------

#[test]
fn test_type_and_is() {
    assert_eq!(
        eval(
            "print(type(1)); print(type(\"a\")); print(type(nil)); print(type(print)); \
             print(is([], \"list\")); print(is({}, \"dict\")); print(is(1, \"string\"));"
        )
        .unwrap(),
        "number\nstring\nnil\nnative\ntrue\ntrue\nfalse\n"
    );
}

#[test]
fn test_len_distributes_over_concatenation() {
    assert_eq!(
        eval("var a = \"foo\"; var b = \"barbaz\"; print(len(a + b) == len(a) + len(b));")
            .unwrap(),
        "true\n"
    );
    assert_eq!(eval("print(len([1,2,3])); print(len({\"a\":1}));").unwrap(), "3\n1\n");
}

#[test]
fn test_clock_is_monotone_nonnegative() {
    assert_eq!(eval("print(clock() >= 0);").unwrap(), "true\n");
}

// ----------------------------------------------------------------------
// Globals, containers, errors
// ----------------------------------------------------------------------

#[test]
fn test_undefined_global_reads_nil() {
    assert_eq!(eval("print(never_defined);").unwrap(), "nil\n");
}

#[test]
fn test_undefined_global_write_is_an_error() {
    assert_eq!(
        runtime_error("never_defined = 1;"),
        "Undefined variable 'never_defined'."
    );
}

#[test]
fn test_dict_dot_access_sugar() {
    assert_eq!(
        eval("var d = {\"a\": 1}; d.b = 2; print(d.a + d[\"b\"]);").unwrap(),
        "3\n"
    );
}

#[test]
fn test_dict_missing_key_reads_nil() {
    assert_eq!(eval("var d = {}; print(d[\"zzz\"]);").unwrap(), "nil\n");
}

#[test]
fn test_list_index_errors() {
    assert_eq!(
        runtime_error("var xs = [1]; xs[5];"),
        "List index out of range."
    );
    assert_eq!(
        runtime_error("var xs = [1]; xs[0.5];"),
        "List index must be an integer."
    );
    assert_eq!(
        runtime_error("var xs = [1]; xs[\"a\"];"),
        "List index must be a number."
    );
}

#[test]
fn test_add_type_error() {
    assert_eq!(
        runtime_error("1 + \"a\";"),
        "Operands must be two numbers or two strings."
    );
}

#[test]
fn test_runtime_error_carries_stack_trace() {
    let err = match eval("fun boom() { return -\"x\"; } fun go() { return boom(); } go();") {
        Err(RunError::Runtime(e)) => e,
        other => panic!("expected runtime error, got {other:?}"),
    };
    assert_eq!(err.message, "Operand must be a number.");
    assert_eq!(err.trace.len(), 3);
    assert!(err.trace[0].ends_with("in script"));
    assert!(err.trace[1].ends_with("in go()"));
    assert!(err.trace[2].ends_with("in boom()"));
}

#[test]
fn test_compile_error_is_reported_not_run() {
    match eval("var = 1;") {
        Err(RunError::Compile(e)) => {
            assert!(e.diagnostics[0].contains("Expect variable name."));
        }
        other => panic!("expected compile error, got {other:?}"),
    }
}

// ----------------------------------------------------------------------
// Stress-GC reruns: every allocation collects
// ----------------------------------------------------------------------

#[test]
fn test_stress_gc_scenarios_still_pass() {
    assert_eq!(eval_stress("print(1 + 2 * 3);").unwrap(), "7\n");
    assert_eq!(
        eval_stress("fun f(n){ if(n<2) return n; return f(n-1)+f(n-2); } print(f(10));").unwrap(),
        "55\n"
    );
    assert_eq!(
        eval_stress(
            "fun mk(){ var x=0; fun i(){ x=x+1; return x; } return i; } \
             var g=mk(); print(g()); print(g()); print(g());"
        )
        .unwrap(),
        "1\n2\n3\n"
    );
    assert_eq!(
        eval_stress("var xs=[1,2,3]; xs[0]=9; print(xs[0]); print(xs[2]);").unwrap(),
        "9\n3\n"
    );
}

#[test]
fn test_stress_gc_string_churn() {
    // Every iteration makes a garbage string; under stress GC each one is
    // collected while the accumulator survives.
    assert_eq!(
        eval_stress(
            "var acc = \"\"; for (var i = 0; i < 50; i = i + 1) { acc = acc + \"x\"; } \
             print(len(acc));"
        )
        .unwrap(),
        "50\n"
    );
}

#[test]
fn test_stress_gc_coroutines_and_dicts() {
    assert_eq!(
        eval_stress(
            "fun gen() { yield {\"k\": [1, 2]}; yield \"done\"; } \
             var c = coroutine gen; var d = c(); print(d[\"k\"][1]); print(c());"
        )
        .unwrap(),
        "2\ndone\n"
    );
}
