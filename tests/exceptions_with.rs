mod common;

use common::run_ok;

#[test]
fn with_block_closes_on_exception_unwind() {
    let out = run_ok(
        "print(\"open\")\n\
         res = {close = function() print(\"close\") end}\n\
         try\n\
         with res do\n\
         raise(\"error\")\n\
         end\n\
         catch e\n\
         print(e.type)\n\
         end",
    );
    assert_eq!(out, "open\nclose\nerror\n");
}

#[test]
fn with_block_closes_on_normal_exit_too() {
    let out = run_ok(
        "res = {close = function() print(\"closed\") end}\n\
         with res do\n\
         print(\"inside\")\n\
         end",
    );
    assert_eq!(out, "inside\nclosed\n");
}

#[test]
fn uncaught_exception_outside_a_try_propagates_to_the_embedder() {
    let err = common::run("raise(\"boom\", \"kaboom\")").unwrap_err();
    assert!(err.to_string().contains("kaboom"));
}

#[test]
fn catch_sees_the_thrown_message() {
    let out = run_ok("try\n raise(\"oops\", \"bad thing\")\n catch e\n print(e.message)\n end");
    assert_eq!(out, "bad thing\n");
}
