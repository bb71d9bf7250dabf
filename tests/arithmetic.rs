mod common;

use common::run_ok;

#[test]
fn sums_one_to_ten() {
    let out = run_ok("x = 0; for i = 1, 10 do x = x + i end; print(x)");
    assert_eq!(out, "55\n");
}

#[test]
fn descending_for_loop() {
    let out = run_ok("x = 0; for i = 5, 1, -1 do x = x + i end; print(x)");
    assert_eq!(out, "15\n");
}

#[test]
fn integer_division_and_modulo_truncate_toward_euclid() {
    let out = run_ok("print(7 // 2); print(7 % 2); print(-7 % 2)");
    assert_eq!(out, "3\n1\n1\n");
}

#[test]
fn float_division_promotes() {
    let out = run_ok("print(7 / 2)");
    assert_eq!(out, "3.5\n");
}

#[test]
fn string_concatenation() {
    let out = run_ok(r#"print("foo" + "bar")"#);
    assert_eq!(out, "foobar\n");
}

#[test]
fn comparisons_and_boolean_logic() {
    let out = run_ok("print(1 < 2 and 2 < 3); print(1 > 2 or 3 > 2); print(not false)");
    assert_eq!(out, "true\ntrue\ntrue\n");
}

#[test]
fn while_loop_accumulates() {
    let out = run_ok("x = 1; n = 0; while x <= 100 do x = x * 2; n = n + 1 end; print(n)");
    assert_eq!(out, "7\n");
}
