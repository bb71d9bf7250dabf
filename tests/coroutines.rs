mod common;

use common::run_ok;

#[test]
fn producer_yields_then_returns() {
    let out = run_ok(
        "function producer()\n\
         yield(1)\n\
         yield(2)\n\
         yield(3)\n\
         end\n\
         co = spawn(producer)\n\
         v = resume(co)\n\
         print(v)\n\
         v = resume(co)\n\
         print(v)\n\
         v = resume(co)\n\
         print(v)\n\
         v = resume(co)\n\
         if v == null then print(\"done\") end",
    );
    assert_eq!(out, "1\n2\n3\ndone\n");
}

#[test]
fn resuming_a_done_coroutine_is_an_error() {
    let err = common::run(
        "function producer() yield(1) end\n\
         co = spawn(producer)\n\
         resume(co)\n\
         resume(co)\n\
         resume(co)",
    )
    .unwrap_err();
    assert!(err.to_string().contains("finished"));
}

#[test]
fn resume_passes_arguments_back_into_yield() {
    let out = run_ok(
        "function echoer()\n\
         first = yield(\"ready\")\n\
         print(first)\n\
         end\n\
         co = spawn(echoer)\n\
         resume(co)\n\
         resume(co, \"hello\")",
    );
    assert_eq!(out, "hello\n");
}
