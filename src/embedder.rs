//! Embedder-facing API (§6): the surface a host application or a native
//! module uses to push/pull values on a [`View`]'s value stack, build
//! compound values, call back into scripts, and throw exceptions.
//!
//! This mirrors the reference implementation's `unc_*` C API one-for-one in
//! spirit (stack manipulation rather than passing `Value`s by Rust value
//! directly), since native functions registered through [`register_builtins`]
//! receive only a raw argument slice and must build their results the same
//! way script code does.

use crate::coroutine;
use crate::entity::{
    ArrayPayload, BlobPayload, DictPayload, DictTable, EntityPayload, FunctionBody, FunctionFlags,
    FunctionPayload, NativeFn, NativeFunctionPayload, ObjectPayload, OpaquePayload, ScriptFunctionPayload,
    StringPayload,
};
use crate::error::{UncilError, UncilResult};
use crate::program::Program;
use crate::value::Value;
use crate::view::View;
use crate::vm;
use std::io::Write;
use std::rc::Rc;
use std::sync::Arc;

/// Wrap a compiled [`Program`]'s entry function as a callable value (§4.6
/// "main_function"), so the embedder can hand it to [`call`] the same way
/// it would call any other function value.
pub fn load_program(view: &mut View, program: Rc<Program>) -> Value {
    let descriptor = &program.functions[program.main_function as usize];
    let optional = descriptor.optional_args as usize;
    let script = ScriptFunctionPayload {
        program: program.clone(),
        func_index: program.main_function,
        pc: descriptor.code_offset as u32,
        jump_width: descriptor.jump_width,
        register_count: descriptor.register_count,
        first_local: descriptor.first_local,
        name_offset: descriptor.name_offset.unwrap_or(0),
        debug_offset: descriptor.debug_offset as u32,
    };
    let payload = FunctionPayload {
        flags: descriptor.flags,
        required_args: descriptor.required_args,
        total_args: descriptor.required_args + descriptor.optional_args,
        defaults: vec![Value::Null; optional],
        refs: Vec::new(),
        body: FunctionBody::Script(script),
    };
    Value::Function(view.wake(EntityPayload::Function(payload)))
}

/// Push `v` onto the value stack, retaining it (§6 "push").
pub fn push(view: &mut View, v: Value) {
    view.push(v);
}

/// Pop the top value off the stack, handing ownership (the retain is not
/// undone) to the caller (§6 "pop").
pub fn pop(view: &mut View) -> Option<Value> {
    view.pop()
}

/// Insert `v` so that it ends up `depth` slots from the top (0 = push on
/// top), shifting existing entries up (§6 "shove").
pub fn shove(view: &mut View, v: Value, depth: usize) {
    view.retain(&v);
    let at = view.value_stack.len().saturating_sub(depth);
    view.value_stack.insert(at, v);
}

/// Remove and return the value `depth` slots from the top (0 = the top
/// itself), closing the gap (§6 "yank").
pub fn yank(view: &mut View, depth: usize) -> Option<Value> {
    let len = view.value_stack.len();
    if depth >= len {
        return None;
    }
    Some(view.value_stack.remove(len - 1 - depth))
}

/// Pop the top `count` values (in push order) into a fresh array.
pub fn new_array(view: &mut View, count: usize) -> Value {
    let items = view.value_stack.split_off(view.value_stack.len() - count);
    let h = view.wake(EntityPayload::Array(ArrayPayload { items }));
    Value::Array(h)
}

/// Pop the top `2 * count` values (key, value, key, value, ...) into a fresh
/// table.
pub fn new_table(view: &mut View, count: usize) -> Value {
    let flat = view.value_stack.split_off(view.value_stack.len() - 2 * count);
    let mut table = DictTable::new();
    for pair in flat.chunks_exact(2) {
        let key = view.world.value_key(&pair[0]);
        table.insert(key, pair[1]);
        view.release(pair[0]);
    }
    let h = view.wake(EntityPayload::Dict(DictPayload { table }));
    Value::Table(h)
}

pub fn new_object(view: &mut View, prototype: Value) -> UncilResult<Value> {
    let h = view.wake(EntityPayload::Object(ObjectPayload {
        attrs: Default::default(),
        prototype: Value::Null,
        frozen: false,
    }));
    if !view.world.check_acyclic_prototype(&prototype, h) {
        view.world.with_entity_mut(h, |e| e.refcount = 1);
        view.release(Value::Object(h));
        return Err(UncilError::Type("invalid-prototype".into()));
    }
    view.retain(&prototype);
    view.world.with_entity_mut(h, |e| {
        if let EntityPayload::Object(o) = &mut e.payload {
            o.prototype = prototype;
        }
    });
    Ok(Value::Object(h))
}

pub fn new_string(view: &mut View, bytes: Vec<u8>) -> Value {
    Value::String(view.wake(EntityPayload::String(StringPayload { bytes })))
}

pub fn new_blob(view: &mut View, bytes: Vec<u8>) -> Value {
    Value::Blob(view.wake(EntityPayload::Blob(BlobPayload { bytes })))
}

pub fn new_opaque(view: &mut View, bytes: Vec<u8>) -> Value {
    Value::Opaque(view.wake(EntityPayload::Opaque(OpaquePayload { bytes, ..Default::default() })))
}

/// Wrap a Rust closure as a callable script value and register it under
/// `name` in the world's public-name table (§6, §4.7 `GETPUBLIC`).
pub fn register_native(
    view: &mut View,
    name: &[u8],
    required_args: u32,
    total_args: u32,
    ellipsis: bool,
    func: NativeFn,
) {
    let payload = FunctionPayload {
        flags: FunctionFlags { native: true, ellipsis, ..Default::default() },
        required_args,
        total_args,
        defaults: Vec::new(),
        refs: Vec::new(),
        body: FunctionBody::Native(NativeFunctionPayload {
            func,
            name: String::from_utf8_lossy(name).into_owned(),
            locked: false,
        }),
    };
    let h = view.wake(EntityPayload::Function(payload));
    let v = Value::Function(h);
    view.retain(&v);
    let old = view.world.public_names.borrow_mut().insert(name.to_vec(), v);
    if let Some(old) = old {
        view.release(old);
    }
}

/// Look up an attribute by name on an object/opaque value, or by prototype
/// for strings/arrays/tables (§6 "get attribute").
pub fn get_attr(view: &View, container: Value, name: &[u8]) -> Option<Value> {
    vm::lookup_attr(view, container, name)
}

pub fn get_index(view: &View, container: Value, index: Value) -> UncilResult<Value> {
    vm::get_index(view, container, index)
}

pub fn set_index(view: &mut View, container: Value, index: Value, value: Value) -> UncilResult<()> {
    vm::set_index(view, container, index, value)
}

pub fn del_index(view: &mut View, container: Value, index: Value) -> UncilResult<()> {
    vm::del_index(view, container, index)
}

/// Call a value with the given arguments, blocking until it returns (§6
/// "call"). Reentrant: a native function may call this from inside its own
/// invocation.
pub fn call(view: &mut View, callee: Value, args: &[Value]) -> UncilResult<Value> {
    vm::call(view, callee, args)
}

/// Build and throw an exception with a `type` tag and a message (§6
/// "throw"). After calling this a native function must return the `Err`
/// immediately; no further embedder calls are valid until the stack has
/// unwound.
pub fn throw(view: &mut View, kind: &str, message: &str) -> UncilError {
    let mut attrs = crate::entity::AttrTable::new();
    let type_v = new_string(view, kind.as_bytes().to_vec());
    let message_v = new_string(view, message.as_bytes().to_vec());
    view.retain(&type_v);
    view.retain(&message_v);
    attrs.insert(b"type".to_vec(), type_v);
    attrs.insert(b"message".to_vec(), message_v);
    let obj = view.wake(EntityPayload::Object(ObjectPayload { attrs, prototype: Value::Null, frozen: false }));
    view.exception = Some(Value::Object(obj));
    UncilError::UserException(message.to_string())
}

/// Exclusive, non-reentrant lock on an array/blob/opaque entity (§5 "Array,
/// Dict, Opaque carry a lock discipline"). Returns `false` if already held.
pub fn try_lock(view: &View, v: Value) -> bool {
    match v {
        Value::Opaque(h) => view
            .world
            .with_entity_mut(h, |e| match &mut e.payload {
                EntityPayload::Opaque(o) if !o.locked => {
                    o.locked = true;
                    true
                }
                _ => false,
            })
            .unwrap_or(false),
        _ => true,
    }
}

pub fn unlock(view: &View, v: Value) {
    if let Value::Opaque(h) = v {
        view.world.with_entity_mut(h, |e| {
            if let EntityPayload::Opaque(o) = &mut e.payload {
                o.locked = false;
            }
        });
    }
}

fn check_argc(args: &[Value], min: usize) -> UncilResult<()> {
    if args.len() < min {
        Err(UncilError::BadArgument(format!("expected at least {min} argument(s), got {}", args.len())))
    } else {
        Ok(())
    }
}

fn tostring_bytes(view: &View, v: Value) -> Vec<u8> {
    match v {
        Value::Null => b"null".to_vec(),
        Value::Bool(b) => if b { b"true".to_vec() } else { b"false".to_vec() },
        Value::Int(i) => i.to_string().into_bytes(),
        Value::Float(f) => f.to_string().into_bytes(),
        Value::String(h) => view
            .world
            .with_entity(h, |e| match &e.payload {
                EntityPayload::String(s) => s.bytes.clone(),
                _ => Vec::new(),
            })
            .unwrap_or_default(),
        other => format!("<{}>", view.world.tag_name(&other)).into_bytes(),
    }
}

/// Register the core builtin natives (§6): `print`, `raise`, `object`,
/// `dict`, `tostring`, `spawn`, `resume`, `yield`. An embedder enabling
/// bundled library modules (§9A, `WorldConfig::module_mask`) layers further
/// natives on top of these; the core only ever assumes this minimal set.
pub fn register_builtins(view: &mut View) {
    register_native(view, b"print", 0, 0, true, Arc::new(|view: &mut View, args: &[Value]| {
        let mut line = Vec::new();
        for (i, a) in args.iter().enumerate() {
            if i > 0 {
                line.push(b' ');
            }
            line.extend(tostring_bytes(view, *a));
        }
        line.push(b'\n');
        view.stdout.write_all(&line).map_err(UncilError::Io)?;
        Ok(Vec::new())
    }) as NativeFn);

    register_native(view, b"raise", 1, 2, false, Arc::new(|view: &mut View, args: &[Value]| {
        check_argc(args, 1)?;
        let kind_bytes = tostring_bytes(view, args[0]);
        let kind = String::from_utf8_lossy(&kind_bytes).into_owned();
        let message = if args.len() > 1 { tostring_bytes(view, args[1]) } else { Vec::new() };
        let message = String::from_utf8_lossy(&message).into_owned();
        Err(throw(view, &kind, &message))
    }) as NativeFn);

    register_native(view, b"object", 0, 1, false, Arc::new(|view: &mut View, args: &[Value]| {
        let proto = args.first().copied().unwrap_or(Value::Null);
        Ok(vec![new_object(view, proto)?])
    }) as NativeFn);

    register_native(view, b"dict", 0, 0, false, Arc::new(|view: &mut View, _args: &[Value]| {
        Ok(vec![Value::Table(view.wake(EntityPayload::Dict(DictPayload::default())))])
    }) as NativeFn);

    register_native(view, b"tostring", 1, 1, false, Arc::new(|view: &mut View, args: &[Value]| {
        check_argc(args, 1)?;
        Ok(vec![new_string(view, tostring_bytes(view, args[0]))])
    }) as NativeFn);

    register_native(view, b"spawn", 1, 1, false, Arc::new(|view: &mut View, args: &[Value]| {
        check_argc(args, 1)?;
        Ok(vec![coroutine::create(view, args[0])?])
    }) as NativeFn);

    register_native(view, b"resume", 1, 1, true, Arc::new(|view: &mut View, args: &[Value]| {
        check_argc(args, 1)?;
        Ok(vec![coroutine::resume(view, args[0], &args[1..])?])
    }) as NativeFn);

    register_native(view, b"yield", 0, 1, false, Arc::new(|view: &mut View, args: &[Value]| {
        let v = args.first().copied().unwrap_or(Value::Null);
        Ok(vec![coroutine::yield_value(view, v)?])
    }) as NativeFn);
}
