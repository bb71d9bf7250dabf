//! Cycle collector (§4.3 "Trial deletion", data-model invariant 2).
//!
//! Reference counting alone cannot free a cycle (two objects whose only
//! remaining references are to each other). [`collect`] runs a classic
//! mark-and-sweep pass over a single [`View`]'s own root set — its
//! registers, value stack, with-stack, capture cells, and any still-open
//! try handlers' `try_frames` don't themselves hold values, so they are not
//! roots.
//!
//! Scope: `World` keeps no registry of every live `View`, so a root set
//! spanning multiple views (e.g. a value shared with a coroutine through
//! `World::coroutines`) is out of reach of a single [`collect`] call. See
//! DESIGN.md for the accepted limitation and how an embedder works around
//! it (call `collect` once per view it owns).

use crate::entity::{EntityKind, Handle};
use crate::value::Value;
use crate::view::View;
use crate::world::World;
use std::collections::HashSet;

fn mark(world: &World, root: Handle, marked: &mut HashSet<Handle>) {
    let mut worklist = vec![root];
    while let Some(h) = worklist.pop() {
        if !marked.insert(h) {
            continue;
        }
        let children = world.with_entity(h, |e| e.children());
        if let Some(children) = children {
            for child in children {
                if let Some(ch) = child.handle() {
                    if child.is_strong_handle() {
                        worklist.push(ch);
                    }
                }
            }
        }
    }
}

fn add_root(roots: &mut Vec<Handle>, v: &Value) {
    if v.is_strong_handle() {
        if let Some(h) = v.handle() {
            roots.push(h);
        }
    }
}

fn roots_of(view: &View) -> Vec<Handle> {
    let mut roots = Vec::new();
    for v in &view.registers {
        add_root(&mut roots, v);
    }
    for v in &view.value_stack {
        add_root(&mut roots, v);
    }
    for v in &view.with_stack {
        add_root(&mut roots, v);
    }
    for frame in &view.frames {
        for cell in frame.exhale_cells.iter().flatten() {
            roots.push(*cell);
        }
    }
    for h in &view.bound {
        roots.push(*h);
    }
    if let Some(v) = &view.exception {
        add_root(&mut roots, v);
    }
    roots
}

/// Candidate kinds for cycle collection: only compound payloads can
/// participate in a reference cycle in the first place.
fn is_cyclable(kind: EntityKind) -> bool {
    matches!(
        kind,
        EntityKind::Array | EntityKind::Dict | EntityKind::Object | EntityKind::Function | EntityKind::BoundFunction
    )
}

/// Mark every entity reachable from `view`'s own roots, then free any
/// cyclable entity that isn't reachable. Intended to run when
/// `World::live_entity_count()` crosses `WorldConfig::gc_entity_threshold`.
#[tracing::instrument(level = "debug", skip_all)]
pub fn collect(view: &mut View) -> usize {
    let world = view.world.clone();
    let mut marked = HashSet::new();
    for root in roots_of(view) {
        mark(&world, root, &mut marked);
    }

    let candidates = world.all_live_handles();
    let mut freed = 0;
    for h in candidates {
        if marked.contains(&h) {
            continue;
        }
        let Some(kind) = world.kind_of(h) else { continue };
        if !is_cyclable(kind) {
            continue;
        }
        // The entity is unreachable from any live root but its refcount may
        // still be nonzero (it's only referenced by other garbage). Force
        // it down to zero so `World::release`'s normal bookkeeping frees it
        // and walks its children.
        let rc = world.with_entity(h, |e| e.refcount).unwrap_or(0);
        for _ in 0..rc {
            world.release(kind_as_value(h, kind));
        }
        freed += 1;
    }
    tracing::debug!(freed, "cycle collection swept unreachable entities");
    freed
}

fn kind_as_value(h: Handle, kind: EntityKind) -> Value {
    match kind {
        EntityKind::String => Value::String(h),
        EntityKind::Blob => Value::Blob(h),
        EntityKind::Array => Value::Array(h),
        EntityKind::Dict => Value::Table(h),
        EntityKind::Object => Value::Object(h),
        EntityKind::Opaque => Value::Opaque(h),
        EntityKind::Function => Value::Function(h),
        EntityKind::BoundFunction => Value::BoundFunction(h),
        EntityKind::Ref => Value::Ref(h),
    }
}

