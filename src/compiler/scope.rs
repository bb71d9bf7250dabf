//! Lexical scope resolution: identifiers → tmp/local/exhale/inhale/public
//! (§4.5).

use crate::compiler::quad::{FunctionRecord, Operand};
use crate::program::InhaleSource;
use std::collections::HashMap;

/// Where a name resolved to.
#[derive(Debug, Clone, Copy)]
pub enum Resolved {
    Register(Operand),
    /// Index into the *current* function's inhale list; already set up by
    /// [`ScopeStack::resolve`] if this is the first use.
    Inhale(u32),
    Public,
}

struct FunctionScope {
    func_index: u32,
    blocks: Vec<HashMap<String, Operand>>,
    /// name -> exhale slot this function has allocated for that local.
    exhales: HashMap<String, u32>,
    /// name -> inhale slot this function has allocated to receive that name
    /// from an enclosing function.
    inhales: HashMap<String, u32>,
}

pub struct ScopeStack {
    functions: Vec<FunctionScope>,
}

impl ScopeStack {
    pub fn new() -> Self {
        ScopeStack { functions: Vec::new() }
    }

    pub fn push_function(&mut self, func_index: u32) {
        self.functions.push(FunctionScope {
            func_index,
            blocks: vec![HashMap::new()],
            exhales: HashMap::new(),
            inhales: HashMap::new(),
        });
    }

    pub fn pop_function(&mut self) {
        self.functions.pop();
    }

    pub fn push_block(&mut self) {
        self.functions.last_mut().expect("no active function").blocks.push(HashMap::new());
    }

    pub fn pop_block(&mut self) {
        self.functions.last_mut().expect("no active function").blocks.pop();
    }

    pub fn declare_local(&mut self, name: &str, operand: Operand) {
        self.functions
            .last_mut()
            .expect("no active function")
            .blocks
            .last_mut()
            .expect("no active block")
            .insert(name.to_string(), operand);
    }

    fn find_in_blocks(blocks: &[HashMap<String, Operand>], name: &str) -> Option<Operand> {
        for block in blocks.iter().rev() {
            if let Some(op) = block.get(name) {
                return Some(*op);
            }
        }
        None
    }

    /// Resolve `name` against the current (innermost) function first, then
    /// walk outward. `records` is indexed by `func_index` and is mutated to
    /// register any new exhale/inhale slots the resolution needs.
    pub fn resolve(&mut self, name: &str, records: &mut [FunctionRecord]) -> Resolved {
        let depth = self.functions.len();
        if let Some(op) = Self::find_in_blocks(&self.functions[depth - 1].blocks, name) {
            return Resolved::Register(op);
        }
        if let Some(&slot) = self.functions[depth - 1].inhales.get(name) {
            return Resolved::Inhale(slot);
        }
        for level in (0..depth - 1).rev() {
            let Some(owner_op) = Self::find_in_blocks(&self.functions[level].blocks, name) else {
                continue;
            };
            // Found as a local of an enclosing function: allocate (or reuse)
            // an exhale slot there, then chain an inhale slot through every
            // function strictly between `level` and `depth - 1`.
            let owner_func = self.functions[level].func_index as usize;
            let exhale_slot = if let Some(&slot) = self.functions[level].exhales.get(name) {
                slot
            } else {
                let slot = records[owner_func].exhale_count;
                records[owner_func].exhale_count += 1;
                records[owner_func].exhale_registers.push(owner_op);
                self.functions[level].exhales.insert(name.to_string(), slot);
                slot
            };
            let mut source = InhaleSource::Exhale(exhale_slot);
            let mut last_slot = None;
            for inner in level + 1..depth {
                let func_index = self.functions[inner].func_index as usize;
                let slot = if let Some(&existing) = self.functions[inner].inhales.get(name) {
                    existing
                } else {
                    let idx = records[func_index].inhale.len() as u32;
                    records[func_index].inhale.push(source);
                    self.functions[inner].inhales.insert(name.to_string(), idx);
                    idx
                };
                source = InhaleSource::Inhale(slot);
                last_slot = Some(slot);
            }
            return Resolved::Inhale(last_slot.expect("depth - 1 > level, loop ran at least once"));
        }
        Resolved::Public
    }
}
