mod common;

use common::run_ok;

#[test]
fn counter_closure_keeps_private_state() {
    let out = run_ok(
        "function mk() local n = 0; return function() n = n + 1; return n end end\n\
         c = mk(); print(c(), c(), c())",
    );
    assert_eq!(out, "1 2 3\n");
}

#[test]
fn independent_closures_do_not_share_state() {
    let out = run_ok(
        "function mk() local n = 0; return function() n = n + 1; return n end end\n\
         a = mk(); b = mk(); print(a(), a(), b())",
    );
    assert_eq!(out, "1 2 1\n");
}

#[test]
fn nested_closures_capture_through_two_levels() {
    let out = run_ok(
        "function outer() local n = 10\n\
         function middle() function inner() return n end return inner() end\n\
         return middle() end\n\
         print(outer())",
    );
    assert_eq!(out, "10\n");
}

#[test]
fn calling_with_too_few_arguments_is_a_bad_argument_error() {
    let err = common::run("function greet(name) return name end\n greet()").unwrap_err();
    assert!(err.to_string().contains("argument"));
}
