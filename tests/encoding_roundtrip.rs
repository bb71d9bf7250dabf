//! Exercises the `serde` feature (§9A "Configuration" ambient stack): a
//! compiled [`uncil::program::Program`] must survive a JSON round trip byte
//! for byte, since an embedder that caches compiled programs across process
//! restarts needs exactly that guarantee.

use uncil::program::Program;

fn roundtrip(program: &Program) -> Program {
    let json = serde_json::to_string(program).expect("serialize program");
    serde_json::from_str(&json).expect("deserialize program")
}

#[test]
fn compiled_program_survives_a_json_round_trip() {
    let program =
        uncil::compile("function add(a, b) return a + b end\nprint(add(2, 3))").expect("compile");
    let decoded = roundtrip(&program);
    assert_eq!(program, decoded);
}

#[test]
fn round_tripped_program_still_runs_the_same_way() {
    use std::cell::RefCell;
    use std::io::{self, Write};
    use std::rc::Rc;
    use uncil::embedder;
    use uncil::world::{World, WorldConfig};

    #[derive(Clone, Default)]
    struct Capture(Rc<RefCell<Vec<u8>>>);
    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    let program = uncil::compile("for i = 1, 3 do print(i) end").expect("compile");
    let decoded = roundtrip(&program);

    let world = Rc::new(World::new(WorldConfig::default()));
    let capture = Capture::default();
    let mut view = uncil::view::View::new(world).with_stdout(Box::new(capture.clone()));
    embedder::register_builtins(&mut view);
    let entry = embedder::load_program(&mut view, Rc::new(decoded));
    embedder::call(&mut view, entry, &[]).expect("run");
    drop(view);

    let out = String::from_utf8_lossy(&capture.0.borrow()).into_owned();
    assert_eq!(out, "1\n2\n3\n");
}
