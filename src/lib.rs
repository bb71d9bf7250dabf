//! Uncil execution core: a register-based bytecode virtual machine for a
//! dynamically-typed scripting language.
//!
//! Pipeline: source text → [`lexer`] token stream → [`compiler`] quad IR →
//! [`compiler::emitter`] packed [`program::Program`] → [`vm::dispatch_loop`].
//! [`world::World`] owns the shared entity arena and public-name table;
//! every [`view::View`] is one thread of execution over it. [`embedder`] is
//! the surface a host application uses to drive a view from the outside.
//!
//! Every stage emits `tracing` spans/events (`compile`, `run`,
//! `coro_resume`, `coro_yield`) at levels appropriate to its call frequency;
//! the core never prints directly and depends on no particular subscriber.

pub mod alloc;
pub mod compiler;
pub mod containers;
pub mod coroutine;
pub mod embedder;
pub mod entity;
pub mod error;
pub mod gc;
pub mod lexer;
pub mod opcode;
pub mod program;
pub mod value;
pub mod view;
pub mod vm;
pub mod world;

pub mod prelude {
    pub use crate::embedder;
    pub use crate::error::{UncilError, UncilResult};
    pub use crate::program::Program;
    pub use crate::value::Value;
    pub use crate::view::View;
    pub use crate::world::{World, WorldConfig};
}

use crate::error::UncilResult;
use crate::lexer::{Lexer, StrSource};
use crate::program::Program;

/// Lex and compile `source` into a ready-to-run [`Program`] (§4.4, §4.5).
#[tracing::instrument(level = "debug", skip(source), fields(source_len = source.len()))]
pub fn compile(source: &str) -> UncilResult<Program> {
    let lex = Lexer::new(StrSource::new(source)).tokenize()?;
    let output = compiler::compile(lex)?;
    Ok(compiler::emitter::emit_program(output))
}
