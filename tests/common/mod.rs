use std::cell::RefCell;
use std::io;
use std::io::Write;
use std::rc::Rc;

use uncil::embedder;
use uncil::error::UncilResult;
use uncil::value::Value;
use uncil::view::View;
use uncil::world::{World, WorldConfig};

/// A `Write` sink that hands its bytes back to the test after the view
/// dropped its `Box<dyn Write>`.
#[derive(Clone, Default)]
pub struct Capture(Rc<RefCell<Vec<u8>>>);

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Capture {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

/// Compile and run `source`'s main function with no arguments, returning the
/// captured stdout and the view it ran in (for follow-up calls, e.g.
/// resuming a coroutine the script created).
pub fn run(source: &str) -> UncilResult<(String, View)> {
    let world = Rc::new(World::new(WorldConfig::default()));
    let capture = Capture::default();
    let mut view = View::new(world).with_stdout(Box::new(capture.clone()));
    embedder::register_builtins(&mut view);
    let program = Rc::new(uncil::compile(source)?);
    let entry = embedder::load_program(&mut view, program);
    embedder::call(&mut view, entry, &[])?;
    Ok((capture.text(), view))
}

pub fn run_ok(source: &str) -> String {
    match run(source) {
        Ok((out, _)) => out,
        Err(e) => panic!("script failed: {e}"),
    }
}

#[allow(dead_code)]
pub fn as_int(v: Value) -> i64 {
    match v {
        Value::Int(i) => i,
        other => panic!("expected int, found {other:?}"),
    }
}
