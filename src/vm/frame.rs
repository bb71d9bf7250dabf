//! Call-frame and try-frame bookkeeping for the iterative dispatch loop
//! (§4.7).
//!
//! Frames are never represented by native Rust call-stack recursion: a
//! normal `CALL` pushes a [`CallFrame`] and the dispatch loop simply keeps
//! iterating over the new function's code, so call depth costs a `Vec`
//! element rather than a stack frame. `TAILCALL` reuses the current
//! [`CallFrame`] outright, which is what gives tail recursion constant
//! native stack usage (§8 "tail-call depth of 1,000,000").

use crate::entity::Handle;
use crate::opcode::Reg;
use crate::program::Program;
use std::rc::Rc;

/// Saved caller context plus this activation's own capture-cell cache.
pub struct CallFrame {
    /// Index into `View::registers` where this activation's register window
    /// begins.
    pub base: usize,
    pub func_index: u32,
    /// Register in the *caller's* window that receives this call's result.
    pub return_reg: Reg,
    /// Number of consecutive registers starting at `return_reg` that the
    /// result spreads across. `1` for an ordinary `CALL`; greater than `1`
    /// for a `DESTRUCTURE_CALL` (§4.7 "function call, positional or
    /// destructuring").
    pub return_count: u16,
    /// Argument count as the caller passed it, before
    /// `vm::pad_args_for_script` filled in defaults/rest. Read by the
    /// callee's own `CheckArity` instruction (§4.7 "stack-arity checks").
    pub incoming_argc: u16,

    pub saved_pc: u32,
    pub saved_bound: Vec<Handle>,
    pub saved_jump_width: u8,
    pub saved_program: Option<Rc<Program>>,

    pub with_stack_base: usize,
    pub value_stack_base: usize,

    /// Lazily-created capture cell per exhale slot this function owns,
    /// shared by every closure this activation instantiates (§4.5, the
    /// "one closure instantiated, called repeatedly" capture pattern).
    pub exhale_cells: Vec<Option<Handle>>,
}

/// One active `try`/`catch` handler (§4.7 "Exception-push stack").
pub struct TryFrame {
    pub handler_pc: u32,
    /// Index into `View::frames` of the activation that pushed this handler;
    /// an exception unwinds frames deeper than this before jumping.
    pub frame_depth: usize,
    pub with_stack_base: usize,
    pub value_stack_base: usize,
}
