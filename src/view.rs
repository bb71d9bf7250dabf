//! `View`: one thread of VM execution (§3).

use crate::entity::{EntityKind, EntityPayload, Handle};
use crate::program::Program;
use crate::value::Value;
use crate::vm::frame::{CallFrame, TryFrame};
use crate::world::World;
use std::collections::VecDeque;
use std::io::Write;
use std::rc::Rc;

/// Cooperative suspension state, observed at every opcode boundary (§5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Run,
    Pause,
    Halt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    Normal,
    Sub,
    SubDaemon,
    Finalized,
}

/// Per-view cache of up to 8 recently hibernated entities, keyed by kind, so
/// a view that repeatedly allocates and discards small entities of the same
/// kind (a hot loop building short strings, say) doesn't pay for a fresh
/// arena slot and generation bump every time (§3 "Lifecycle", GLOSSARY
/// "Sleeper").
#[derive(Debug, Default)]
pub struct Sleeper {
    entries: VecDeque<(EntityKind, Handle)>,
}

const SLEEPER_CAPACITY: usize = 8;

impl Sleeper {
    pub fn take(&mut self, kind: EntityKind) -> Option<Handle> {
        let pos = self.entries.iter().position(|(k, _)| *k == kind)?;
        self.entries.remove(pos).map(|(_, h)| h)
    }

    /// Offer a freshly-hibernated handle for reuse. Returns `Some(evicted)`
    /// if the cache was full and the oldest entry had to make room.
    pub fn offer(&mut self, kind: EntityKind, handle: Handle) -> Option<Handle> {
        let evicted = if self.entries.len() >= SLEEPER_CAPACITY {
            self.entries.pop_front().map(|(_, h)| h)
        } else {
            None
        };
        self.entries.push_back((kind, handle));
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of walking up the try-frame stack after a thrown exception.
pub struct ExceptionInfo {
    pub value: Value,
    pub message: Option<String>,
}

/// One thread of VM execution. Owns its register file, stacks, program
/// pointer, and flow flag (§3).
pub struct View {
    pub world: Rc<World>,
    pub kind: ViewKind,

    /// Flat register stack; each [`CallFrame`] records the base index of its
    /// register window within this buffer.
    pub registers: Vec<Value>,
    pub value_stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    pub try_frames: Vec<TryFrame>,
    /// Values registered by `WPUSH`, closed in reverse on scope exit (§4.7
    /// "With-stack").
    pub with_stack: Vec<Value>,

    pub program: Option<Rc<Program>>,
    pub pc: u32,
    /// The currently executing function's capture cells (inhale list),
    /// addressed by `INHALE` operands.
    pub bound: Vec<Handle>,
    /// Jump-offset width of the function currently executing; cached here
    /// rather than re-read from the descriptor on every decode.
    pub cur_jump_width: u8,

    pub flow: Flow,
    pub exception: Option<Value>,
    pub last_error: Option<String>,
    pub cwd_hint: Option<String>,
    /// Set by the `yield` native immediately before it returns
    /// `UncilError::Trampoline`, so the resumer can recover the yielded
    /// value once the trampoline unwinds back to it (§4.9).
    pub yield_value: Option<Value>,
    /// The register a pending `yield(...)` call's result will land in once
    /// resumed; set by the `CALL` handler when a native call's result is a
    /// trampoline rather than a value (§4.9).
    pub resume_target: Option<u16>,

    pub sleeper: Sleeper,

    /// Set while this view is executing as a coroutine body; `resume`/`yield`
    /// consult it to find the paired resumer view (§4.9).
    pub coroutine_resumer: Option<usize>,
    /// Set by a tail call made from inside a coroutine so the yielding view
    /// knows to release resources eagerly (§4.7 "Trampoline").
    pub corotail: bool,

    pub stdout: Box<dyn Write>,
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("kind", &self.kind)
            .field("pc", &self.pc)
            .field("flow", &self.flow)
            .field("exception", &self.exception)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl View {
    pub fn new(world: Rc<World>) -> Self {
        View {
            world,
            kind: ViewKind::Normal,
            registers: Vec::new(),
            value_stack: Vec::new(),
            frames: Vec::new(),
            try_frames: Vec::new(),
            with_stack: Vec::new(),
            program: None,
            pc: 0,
            bound: Vec::new(),
            cur_jump_width: 1,
            flow: Flow::Run,
            exception: None,
            last_error: None,
            cwd_hint: None,
            yield_value: None,
            resume_target: None,
            sleeper: Sleeper::default(),
            coroutine_resumer: None,
            corotail: false,
            stdout: Box::new(std::io::stdout()),
        }
    }

    pub fn with_stdout(mut self, sink: Box<dyn Write>) -> Self {
        self.stdout = sink;
        self
    }

    pub fn wake(&mut self, payload: EntityPayload) -> Handle {
        let world = Rc::clone(&self.world);
        world.wake_for_view(payload, &mut self.sleeper)
    }

    pub fn release(&mut self, v: Value) {
        let world = Rc::clone(&self.world);
        world.release_for_view(v, &mut self.sleeper);
    }

    pub fn retain(&self, v: &Value) {
        self.world.retain(v);
    }

    pub fn push(&mut self, v: Value) {
        self.retain(&v);
        self.value_stack.push(v);
    }

    pub fn pop(&mut self) -> Option<Value> {
        self.value_stack.pop()
    }

    /// Discard `n` values from the top of the stack, releasing each one
    /// (used to implement `discard(pile)` of the embedder API, §6).
    pub fn discard(&mut self, n: usize) {
        for _ in 0..n {
            if let Some(v) = self.value_stack.pop() {
                self.release(v);
            }
        }
    }
}
