//! Heap entity payloads.
//!
//! The reference implementation links entities into a manually managed
//! doubly-linked list with raw pointers. Per DESIGN.md (and the redesign
//! note in §9), this is re-expressed as an arena of [`Entity`] slots owned by
//! [`crate::world::World`], addressed by an opaque, generation-checked
//! [`Handle`] instead of a pointer. A `WeakRef` is simply a `Handle` whose
//! generation is checked against the slot's current generation before use —
//! if they differ, the entity has been freed and reused.

use crate::containers::hashtable::{HashKey, HashTable};
use crate::value::Value;
use std::rc::Rc;
use std::sync::Arc;

/// Opaque, generation-checked reference to an entity slot in the world
/// arena. `index` addresses the slot; `generation` must match the slot's
/// current generation for the handle to be considered live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    pub index: u32,
    pub generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    String,
    Blob,
    Array,
    Dict,
    Object,
    Opaque,
    Function,
    BoundFunction,
    Ref,
}

/// A dict/object key. Strings compare and hash by content (they are
/// immutable once created, so a snapshot copy is safe); every other compound
/// type compares by entity identity, matching §4.2's equality rule.
#[derive(Debug, Clone)]
pub enum ValueKey {
    Null,
    Bool(bool),
    Int(i64),
    /// Stored as bits so `Eq`/`Hash` are well defined; two NaNs with
    /// identical bit patterns are considered the same key (dict key
    /// equality is not the same relation as the `==` operator, which never
    /// considers NaN equal to anything).
    Float(u64),
    String(Vec<u8>),
    Handle(Handle),
}

impl PartialEq for ValueKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ValueKey::Null, ValueKey::Null) => true,
            (ValueKey::Bool(a), ValueKey::Bool(b)) => a == b,
            (ValueKey::Int(a), ValueKey::Int(b)) => a == b,
            (ValueKey::Float(a), ValueKey::Float(b)) => a == b,
            (ValueKey::String(a), ValueKey::String(b)) => a == b,
            (ValueKey::Handle(a), ValueKey::Handle(b)) => a == b,
            _ => false,
        }
    }
}
impl Eq for ValueKey {}

impl HashKey for ValueKey {
    fn hash_key(&self) -> u64 {
        match self {
            ValueKey::Null => 0,
            ValueKey::Bool(b) => Value::mix_int(*b as i64),
            ValueKey::Int(i) => Value::mix_int(*i),
            ValueKey::Float(bits) => crate::containers::hashtable::hash_bytes(&bits.to_le_bytes()),
            ValueKey::String(bytes) => crate::containers::hashtable::hash_bytes(bytes),
            ValueKey::Handle(h) => Value::mix_int(h.index as i64),
        }
    }
}

pub type DictTable = HashTable<ValueKey, Value>;
pub type AttrTable = HashTable<Vec<u8>, Value>;

#[derive(Debug, Clone)]
pub struct StringPayload {
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct BlobPayload {
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct ArrayPayload {
    pub items: Vec<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct DictPayload {
    pub table: DictTable,
}

#[derive(Debug, Clone)]
pub struct ObjectPayload {
    pub attrs: AttrTable,
    pub prototype: Value,
    pub frozen: bool,
}

impl Default for ObjectPayload {
    fn default() -> Self {
        ObjectPayload {
            attrs: AttrTable::new(),
            prototype: Value::Null,
            frozen: false,
        }
    }
}

/// Destructor callback for an opaque entity, invoked at most once.
pub type OpaqueDestructor = Arc<dyn Fn(&mut [u8]) + Send + Sync>;

#[derive(Clone)]
pub struct OpaquePayload {
    pub bytes: Vec<u8>,
    pub destructor: Option<OpaqueDestructor>,
    pub bound: Vec<Value>,
    pub prototype: Value,
    /// Cooperative lock flag (§5): exclusive, non-reentrant. Not an OS
    /// mutex — a single view's dispatch loop is never preempted mid
    /// instruction, so a plain flag suffices for the "at most one writer"
    /// discipline; cross-thread access is still serialized by the world's
    /// per-entity-kind locks at a coarser grain.
    pub locked: bool,
}

impl std::fmt::Debug for OpaquePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpaquePayload")
            .field("bytes_len", &self.bytes.len())
            .field("has_destructor", &self.destructor.is_some())
            .field("locked", &self.locked)
            .finish()
    }
}

impl Default for OpaquePayload {
    fn default() -> Self {
        OpaquePayload {
            bytes: Vec::new(),
            destructor: None,
            bound: Vec::new(),
            prototype: Value::Null,
            locked: false,
        }
    }
}

/// Signature for a native (Rust-implemented) function exposed to scripts.
pub type NativeFn =
    Arc<dyn Fn(&mut crate::view::View, &[Value]) -> crate::error::UncilResult<Vec<Value>> + Send + Sync>;

#[derive(Clone)]
pub struct NativeFunctionPayload {
    pub func: NativeFn,
    pub name: String,
    pub locked: bool,
}

impl std::fmt::Debug for NativeFunctionPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunctionPayload").field("name", &self.name).finish()
    }
}

#[derive(Debug, Clone)]
pub struct ScriptFunctionPayload {
    pub program: Rc<crate::program::Program>,
    pub func_index: u32,
    pub pc: u32,
    pub jump_width: u8,
    pub register_count: u32,
    pub first_local: u32,
    pub name_offset: u32,
    pub debug_offset: u32,
}

#[derive(Debug, Clone)]
pub enum FunctionBody {
    Native(NativeFunctionPayload),
    Script(ScriptFunctionPayload),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FunctionFlags {
    pub named: bool,
    pub ellipsis: bool,
    pub native: bool,
    pub main: bool,
}

#[derive(Debug, Clone)]
pub struct FunctionPayload {
    pub flags: FunctionFlags,
    pub required_args: u32,
    pub total_args: u32,
    pub defaults: Vec<Value>,
    /// Capture cells this closure closed over, in inhale order.
    pub refs: Vec<Handle>,
    pub body: FunctionBody,
}

#[derive(Debug, Clone)]
pub struct BoundFunctionPayload {
    pub callable: Value,
    pub receiver: Value,
}

#[derive(Debug, Clone)]
pub enum EntityPayload {
    String(StringPayload),
    Blob(BlobPayload),
    Array(ArrayPayload),
    Dict(DictPayload),
    Object(ObjectPayload),
    Opaque(OpaquePayload),
    Function(FunctionPayload),
    BoundFunction(BoundFunctionPayload),
    /// Single mutable value slot backing a capture cell.
    Ref(Value),
}

impl EntityPayload {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityPayload::String(_) => EntityKind::String,
            EntityPayload::Blob(_) => EntityKind::Blob,
            EntityPayload::Array(_) => EntityKind::Array,
            EntityPayload::Dict(_) => EntityKind::Dict,
            EntityPayload::Object(_) => EntityKind::Object,
            EntityPayload::Opaque(_) => EntityKind::Opaque,
            EntityPayload::Function(_) => EntityKind::Function,
            EntityPayload::BoundFunction(_) => EntityKind::BoundFunction,
            EntityPayload::Ref(_) => EntityKind::Ref,
        }
    }
}

/// A single heap record. Owned exclusively by [`crate::world::World`]'s
/// entity arena.
#[derive(Debug, Clone)]
pub struct Entity {
    pub refcount: usize,
    pub marked: bool,
    pub payload: EntityPayload,
}

impl Entity {
    pub fn new(payload: EntityPayload) -> Self {
        Entity {
            refcount: 0,
            marked: false,
            payload,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.payload.kind()
    }

    /// Every `Value` owned directly by this entity's payload, for the cycle
    /// collector's mark phase and for refcount bookkeeping on drop.
    pub fn children(&self) -> Vec<Value> {
        self.payload.children()
    }
}

impl EntityPayload {
    /// Every `Value` this payload owns directly. Shared by [`Entity::children`]
    /// and by code that only has a freed payload (no refcount/mark bits) on
    /// hand, such as `World::release` walking a just-hibernated entity.
    pub fn children(&self) -> Vec<Value> {
        match self {
            EntityPayload::String(_) | EntityPayload::Blob(_) => Vec::new(),
            EntityPayload::Array(a) => a.items.clone(),
            EntityPayload::Dict(d) => d.table.iter().map(|(_, v)| *v).collect(),
            EntityPayload::Object(o) => {
                let mut v: Vec<Value> = o.attrs.iter().map(|(_, v)| *v).collect();
                v.push(o.prototype);
                v
            }
            EntityPayload::Opaque(o) => {
                let mut v = o.bound.clone();
                v.push(o.prototype);
                v
            }
            EntityPayload::Function(f) => {
                let mut v = f.defaults.clone();
                v.extend(f.refs.iter().map(|h| Value::Ref(*h)));
                v
            }
            EntityPayload::BoundFunction(b) => vec![b.callable, b.receiver],
            EntityPayload::Ref(v) => vec![*v],
        }
    }
}
