//! `World`: process-wide (per-instance) state shared by every [`crate::view::View`].
//!
//! Holds the allocator, the entity arena, the public-name table, prototype
//! tables, and GC bookkeeping (§3). The reference implementation protects
//! these with three OS-level locks (view-list, public-name, entity-list);
//! this rendition targets the single-threaded build of §5 by default (the
//! `if multithreading` qualifier throughout §3/§5), so the locks are
//! expressed as cooperative [`Lock`] guards over `RefCell`-backed state
//! rather than OS mutexes — see DESIGN.md for the open-question resolution.
//! Swapping `RefCell`/`Lock` for `RwLock`/`Mutex` at these exact seams is the
//! documented path to the multithreaded build.

use crate::alloc::{Allocator, DefaultAllocator};
use crate::entity::{AttrTable, Entity, EntityKind, EntityPayload, Handle, ValueKey};
use crate::value::{Value, ValueTag};
use std::cell::RefCell;
use std::sync::Arc;

/// A cooperative, non-reentrant lock flag. `lock`/`unlock` must be paired by
/// the caller; `try_lock` never blocks. This models the discipline of §5
/// without requiring a real OS mutex in the single-threaded build.
#[derive(Debug, Default)]
pub struct Lock(RefCell<bool>);

impl Lock {
    pub fn try_lock(&self) -> bool {
        let mut held = self.0.borrow_mut();
        if *held {
            false
        } else {
            *held = true;
            true
        }
    }

    pub fn lock(&self) {
        assert!(self.try_lock(), "lock already held: re-entrant locking is not permitted");
    }

    pub fn unlock(&self) {
        let mut held = self.0.borrow_mut();
        assert!(*held, "unlock called without a matching lock");
        *held = false;
    }

    pub fn is_locked(&self) -> bool {
        *self.0.borrow()
    }
}

/// Tunables supplied at world construction (§9A.3).
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// Bitmask selecting which bundled library modules an embedder enables.
    /// The core never inspects individual bits; library code (out of scope)
    /// consults it during module registration.
    pub module_mask: u64,
    /// Entity-count heuristic that triggers an automatic cycle sweep.
    pub gc_entity_threshold: usize,
    /// Tail calls after which the traceback folds repeated frames into a
    /// single "... x N" entry instead of listing each one (§9 open question,
    /// resolved: fold rather than omit, so the total call count is always
    /// visible to the user).
    pub tailcall_fold_threshold: u32,
}

impl Default for WorldConfig {
    fn default() -> Self {
        WorldConfig {
            module_mask: u64::MAX,
            gc_entity_threshold: 4096,
            tailcall_fold_threshold: 64,
        }
    }
}

struct Slot {
    generation: u32,
    entity: Option<Entity>,
}

#[derive(Default)]
pub struct Prototypes {
    pub string_proto: Value,
    pub blob_proto: Value,
    pub array_proto: Value,
    pub dict_proto: Value,
    pub file_proto: Value,
}

/// One suspended or running coroutine (§4.9). Kept outside the entity arena
/// since a [`crate::view::View`] cannot be cloned or hibernated the way an
/// [`crate::entity::EntityPayload`] can; scripts hold a coroutine by an
/// opaque entity whose bytes encode the index into this table (see
/// `crate::coroutine`).
pub struct CoroutineSlot {
    pub view: Box<crate::view::View>,
    pub status: crate::coroutine::CoroutineStatus,
    pub body: crate::value::Value,
}

pub struct World {
    pub allocator: Arc<dyn Allocator>,
    pub config: WorldConfig,
    slots: RefCell<Vec<Slot>>,
    free_list: RefCell<Vec<u32>>,
    pub public_names: RefCell<AttrTable>,
    pub prototypes: RefCell<Prototypes>,
    pub entity_list_lock: Lock,
    pub public_lock: Lock,
    pub view_list_lock: Lock,
    live_entities: RefCell<usize>,
    pub coroutines: RefCell<Vec<CoroutineSlot>>,
}

impl World {
    pub fn new(config: WorldConfig) -> Self {
        World {
            allocator: Arc::new(DefaultAllocator),
            config,
            slots: RefCell::new(Vec::new()),
            free_list: RefCell::new(Vec::new()),
            public_names: RefCell::new(AttrTable::new()),
            prototypes: RefCell::new(Prototypes::default()),
            entity_list_lock: Lock::default(),
            public_lock: Lock::default(),
            view_list_lock: Lock::default(),
            live_entities: RefCell::new(0),
            coroutines: RefCell::new(Vec::new()),
        }
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn live_entity_count(&self) -> usize {
        *self.live_entities.borrow()
    }

    /// Allocate a fresh entity, bypassing any sleeper cache. `View::wake`
    /// tries the view-local sleeper first and falls back to this.
    pub fn wake_fresh(&self, payload: EntityPayload) -> Handle {
        self.entity_list_lock.lock();
        let mut slots = self.slots.borrow_mut();
        let handle = if let Some(index) = self.free_list.borrow_mut().pop() {
            let slot = &mut slots[index as usize];
            slot.entity = Some(Entity::new(payload));
            Handle { index, generation: slot.generation }
        } else {
            let index = slots.len() as u32;
            slots.push(Slot { generation: 0, entity: Some(Entity::new(payload)) });
            Handle { index, generation: 0 }
        };
        drop(slots);
        *self.live_entities.borrow_mut() += 1;
        self.entity_list_lock.unlock();
        handle
    }

    /// Recycle a sleeper-cached handle in place, replacing its payload
    /// without bumping the generation (the handle is about to be handed
    /// straight back out, so it must still resolve).
    pub(crate) fn recycle_slot(&self, handle: Handle, payload: EntityPayload) {
        let mut slots = self.slots.borrow_mut();
        let slot = &mut slots[handle.index as usize];
        debug_assert!(slot.generation == handle.generation);
        debug_assert!(slot.entity.is_none());
        slot.entity = Some(Entity::new(payload));
        drop(slots);
        *self.live_entities.borrow_mut() += 1;
    }

    /// Free an entity's payload and bump its slot's generation so any
    /// surviving `WeakRef` handles observe it as dead. Returns the payload
    /// so the caller (GC or `release`) can walk its children before they are
    /// dropped for real.
    pub fn hibernate(&self, handle: Handle) -> Option<EntityPayload> {
        let payload = self.hibernate_keep_slot(handle)?;
        self.free_slot(handle);
        Some(payload)
    }

    /// Clear a slot's payload without retiring the slot: the generation is
    /// left unchanged so a view's [`crate::view::Sleeper`] can hand the same
    /// handle straight back out via `recycle_slot`. Call [`World::free_slot`]
    /// if the slot is instead being retired for good (evicted from a
    /// sleeper, or not cached at all).
    pub(crate) fn hibernate_keep_slot(&self, handle: Handle) -> Option<EntityPayload> {
        self.entity_list_lock.lock();
        let mut slots = self.slots.borrow_mut();
        let result = slots.get_mut(handle.index as usize).and_then(|slot| {
            if slot.generation == handle.generation {
                slot.entity.take().map(|e| e.payload)
            } else {
                None
            }
        });
        drop(slots);
        self.entity_list_lock.unlock();
        if result.is_some() {
            *self.live_entities.borrow_mut() -= 1;
        }
        result
    }

    /// Retire a slot whose payload has already been cleared by
    /// [`World::hibernate_keep_slot`], bumping its generation and returning
    /// the index to the arena free list.
    pub(crate) fn free_slot(&self, handle: Handle) {
        self.entity_list_lock.lock();
        let mut slots = self.slots.borrow_mut();
        if let Some(slot) = slots.get_mut(handle.index as usize) {
            if slot.generation == handle.generation {
                slot.generation = slot.generation.wrapping_add(1);
                self.free_list.borrow_mut().push(handle.index);
            }
        }
        drop(slots);
        self.entity_list_lock.unlock();
    }

    /// Release a value, offering the freed entity to `sleeper` instead of
    /// immediately retiring its slot (§3 "Lifecycle"). Cascaded children are
    /// released through the plain, non-caching [`World::release`] — only the
    /// directly-released handle is eligible for reuse, which covers the
    /// common case of a view repeatedly allocating and discarding
    /// short-lived entities of one kind without adding unbounded sleeper
    /// bookkeeping for deep structures.
    pub fn release_for_view(&self, v: Value, sleeper: &mut crate::view::Sleeper) {
        if !v.is_strong_handle() {
            return;
        }
        let Some(h) = v.handle() else { return };
        let zero = self
            .with_entity_mut(h, |e| {
                e.refcount = e.refcount.saturating_sub(1);
                e.refcount == 0
            })
            .unwrap_or(false);
        if !zero {
            return;
        }
        let Some(kind) = self.kind_of(h) else { return };
        let Some(payload) = self.hibernate_keep_slot(h) else { return };
        for child in payload.children() {
            self.release(child);
        }
        if let Some(evicted) = sleeper.offer(kind, h) {
            self.free_slot(evicted);
        }
    }

    /// Allocate via `sleeper` first, falling back to a fresh slot.
    pub fn wake_for_view(&self, payload: EntityPayload, sleeper: &mut crate::view::Sleeper) -> Handle {
        let kind = payload.kind();
        if let Some(h) = sleeper.take(kind) {
            self.recycle_slot(h, payload);
            h
        } else {
            self.wake_fresh(payload)
        }
    }

    pub fn is_live(&self, handle: Handle) -> bool {
        let slots = self.slots.borrow();
        slots
            .get(handle.index as usize)
            .map(|s| s.generation == handle.generation && s.entity.is_some())
            .unwrap_or(false)
    }

    pub fn kind_of(&self, handle: Handle) -> Option<EntityKind> {
        let slots = self.slots.borrow();
        slots.get(handle.index as usize).and_then(|s| {
            if s.generation == handle.generation {
                s.entity.as_ref().map(|e| e.kind())
            } else {
                None
            }
        })
    }

    pub fn with_entity<R>(&self, handle: Handle, f: impl FnOnce(&Entity) -> R) -> Option<R> {
        let slots = self.slots.borrow();
        slots.get(handle.index as usize).and_then(|s| {
            if s.generation == handle.generation {
                s.entity.as_ref().map(f)
            } else {
                None
            }
        })
    }

    pub fn with_entity_mut<R>(&self, handle: Handle, f: impl FnOnce(&mut Entity) -> R) -> Option<R> {
        let mut slots = self.slots.borrow_mut();
        slots.get_mut(handle.index as usize).and_then(|s| {
            if s.generation == handle.generation {
                s.entity.as_mut().map(f)
            } else {
                None
            }
        })
    }

    /// Increment an entity's refcount. A no-op for scalar values.
    pub fn retain(&self, v: &Value) {
        if v.is_strong_handle() {
            if let Some(h) = v.handle() {
                self.with_entity_mut(h, |e| e.refcount += 1);
            }
        }
    }

    /// Decrement an entity's refcount, freeing it (and transitively
    /// releasing its children) when it reaches zero. Implemented with an
    /// explicit worklist rather than recursion so deeply nested structures
    /// (e.g. a long linked list built from arrays) don't blow the native
    /// stack (data-model invariant 1).
    pub fn release(&self, v: Value) {
        if !v.is_strong_handle() {
            return;
        }
        let Some(h) = v.handle() else { return };
        let mut worklist = vec![h];
        while let Some(handle) = worklist.pop() {
            let zero = self
                .with_entity_mut(handle, |e| {
                    e.refcount = e.refcount.saturating_sub(1);
                    e.refcount == 0
                })
                .unwrap_or(false);
            if zero {
                if let Some(payload) = self.hibernate(handle) {
                    for child in payload.children() {
                        if child.is_strong_handle() {
                            if let Some(ch) = child.handle() {
                                worklist.push(ch);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Structural/identity equality used for hashing and `==` (§4.2).
    pub fn values_equal(&self, a: &Value, b: &Value) -> bool {
        if let Some(eq) = a.scalar_eq(b) {
            return eq;
        }
        match (a, b) {
            (Value::String(ha), Value::String(hb)) => {
                if ha == hb {
                    return true;
                }
                let bytes_a = self.with_entity(*ha, |e| string_bytes(e).to_vec());
                let bytes_b = self.with_entity(*hb, |e| string_bytes(e).to_vec());
                bytes_a == bytes_b
            }
            _ => match (a.handle(), b.handle()) {
                (Some(ha), Some(hb)) => ha == hb && a.tag() == b.tag(),
                _ => false,
            },
        }
    }

    pub fn hash_value(&self, v: &Value) -> u64 {
        match v {
            Value::Null => 0,
            Value::Bool(b) => Value::mix_int(*b as i64),
            Value::Int(i) => Value::mix_int(*i),
            Value::Float(f) => crate::containers::hashtable::hash_bytes(&f.to_le_bytes()),
            Value::String(h) => {
                let bytes = self.with_entity(*h, |e| string_bytes(e).to_vec()).unwrap_or_default();
                crate::containers::hashtable::hash_bytes(&bytes)
            }
            _ => v.handle().map(|h| Value::mix_int(h.index as i64)).unwrap_or(0),
        }
    }

    pub fn value_key(&self, v: &Value) -> ValueKey {
        match v {
            Value::Null => ValueKey::Null,
            Value::Bool(b) => ValueKey::Bool(*b),
            Value::Int(i) => ValueKey::Int(*i),
            Value::Float(f) => ValueKey::Float(f.to_bits()),
            Value::String(h) => {
                ValueKey::String(self.with_entity(*h, |e| string_bytes(e).to_vec()).unwrap_or_default())
            }
            _ => ValueKey::Handle(v.handle().expect("non-scalar value without handle")),
        }
    }

    pub fn tag_name(&self, v: &Value) -> &'static str {
        v.tag().name()
    }

    /// Every live entity handle, regardless of reachability. Used only by
    /// [`crate::gc::collect`]'s mark-and-sweep pass; ordinary code should
    /// never need to enumerate the whole arena.
    pub(crate) fn all_live_handles(&self) -> Vec<Handle> {
        let slots = self.slots.borrow();
        slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.entity.as_ref().map(|_| Handle { index: index as u32, generation: slot.generation })
            })
            .collect()
    }

    pub fn check_acyclic_prototype(&self, candidate_proto: &Value, new_object: Handle) -> bool {
        let mut cursor = *candidate_proto;
        let mut steps = 0;
        loop {
            match cursor {
                Value::Null => return true,
                Value::Object(h) => {
                    if h == new_object {
                        return false;
                    }
                    steps += 1;
                    if steps > 10_000 {
                        return false;
                    }
                    cursor = self
                        .with_entity(h, |e| match &e.payload {
                            EntityPayload::Object(o) => o.prototype,
                            _ => Value::Null,
                        })
                        .unwrap_or(Value::Null);
                }
                _ => return true,
            }
        }
    }
}

fn string_bytes(e: &Entity) -> &[u8] {
    match &e.payload {
        EntityPayload::String(s) => &s.bytes,
        _ => &[],
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("live_entities", &self.live_entity_count())
            .finish()
    }
}

pub fn type_name_of(tag: ValueTag) -> &'static str {
    tag.name()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{ArrayPayload, StringPayload};

    #[test]
    fn wake_hibernate_recycles_generation() {
        let w = World::new(WorldConfig::default());
        let h1 = w.wake_fresh(EntityPayload::String(StringPayload { bytes: b"a".to_vec() }));
        w.hibernate(h1);
        let h2 = w.wake_fresh(EntityPayload::String(StringPayload { bytes: b"b".to_vec() }));
        assert_eq!(h1.index, h2.index);
        assert_ne!(h1.generation, h2.generation);
        assert!(!w.is_live(h1));
        assert!(w.is_live(h2));
    }

    #[test]
    fn release_frees_transitively() {
        let w = World::new(WorldConfig::default());
        let inner = w.wake_fresh(EntityPayload::String(StringPayload { bytes: b"x".to_vec() }));
        w.with_entity_mut(inner, |e| e.refcount = 1);
        let outer = w.wake_fresh(EntityPayload::Array(ArrayPayload { items: vec![Value::String(inner)] }));
        w.with_entity_mut(outer, |e| e.refcount = 1);
        assert!(w.is_live(inner));
        w.release(Value::Array(outer));
        assert!(!w.is_live(outer));
        assert!(!w.is_live(inner));
    }

    #[test]
    fn self_prototype_cycle_is_rejected() {
        let w = World::new(WorldConfig::default());
        let obj = w.wake_fresh(EntityPayload::Object(Default::default()));
        assert!(!w.check_acyclic_prototype(&Value::Object(obj), obj));
        assert!(w.check_acyclic_prototype(&Value::Null, obj));
    }
}
