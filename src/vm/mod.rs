//! The bytecode dispatch loop (§4.7) and the embedder-facing reentrant call
//! entry point.
//!
//! `CALL` never recurses the native Rust stack: [`dispatch_loop`] pushes a
//! [`frame::CallFrame`] and keeps iterating over the callee's code in the
//! same loop iteration, swapping `View::pc`/`program`/`bound`/`cur_jump_width`
//! as it goes. Only [`call`] itself recurses natively, and only when a
//! native function calls back into script code (e.g. a `with`-block's
//! `close` method, §4.7 "With-stack").

pub mod alu;
pub mod frame;

use crate::entity::{
    ArrayPayload, EntityPayload, FunctionBody, FunctionPayload, Handle, ObjectPayload, ScriptFunctionPayload,
    StringPayload,
};
use crate::error::{UncilError, UncilResult};
use crate::opcode::{Instruction, Reg};
use crate::value::Value;
use crate::view::{Flow, View};
use frame::{CallFrame, TryFrame};

fn current_base(view: &View) -> usize {
    view.frames.last().expect("register access outside a call frame").base
}

fn reg(view: &View, r: Reg) -> Value {
    view.registers[current_base(view) + r as usize]
}

/// Store into a register, retaining the new value and releasing whatever it
/// replaces (§4.2 `copy`/`clear`).
fn set_reg(view: &mut View, r: Reg, value: Value) {
    let idx = current_base(view) + r as usize;
    view.retain(&value);
    let old = view.registers[idx];
    view.registers[idx] = value;
    view.release(old);
}

/// Write into the current frame's register `r`, for use outside this module
/// (the coroutine resumer writing a resume argument into a pending `yield`
/// call's destination register, §4.9).
pub(crate) fn set_reg_pub(view: &mut View, r: Reg, value: Value) {
    set_reg(view, r, value);
}

fn name_bytes<'a>(program: &'a crate::program::Program, idx: u32) -> &'a [u8] {
    program.strings.get(idx as usize).map(|v| v.as_slice()).unwrap_or(&[])
}

pub(crate) fn lookup_attr(view: &View, container: Value, name: &[u8]) -> Option<Value> {
    match container {
        Value::Object(h) => {
            let mut cur = Some(h);
            let mut steps = 0;
            while let Some(handle) = cur {
                let found = view
                    .world
                    .with_entity(handle, |e| match &e.payload {
                        EntityPayload::Object(o) => o.attrs.get(&name.to_vec()).copied(),
                        _ => None,
                    })
                    .flatten();
                if found.is_some() {
                    return found;
                }
                let proto = view
                    .world
                    .with_entity(handle, |e| match &e.payload {
                        EntityPayload::Object(o) => o.prototype,
                        _ => Value::Null,
                    })
                    .unwrap_or(Value::Null);
                cur = match proto {
                    Value::Object(p) => Some(p),
                    _ => None,
                };
                steps += 1;
                if steps > 10_000 {
                    return None;
                }
            }
            None
        }
        Value::Opaque(h) => {
            let proto = view
                .world
                .with_entity(h, |e| match &e.payload {
                    EntityPayload::Opaque(o) => o.prototype,
                    _ => Value::Null,
                })
                .unwrap_or(Value::Null);
            lookup_attr(view, proto, name)
        }
        Value::String(_) => lookup_attr(view, view.world.prototypes.borrow().string_proto, name),
        Value::Array(_) => lookup_attr(view, view.world.prototypes.borrow().array_proto, name),
        Value::Table(_) => lookup_attr(view, view.world.prototypes.borrow().dict_proto, name),
        _ => None,
    }
}

/// Resolve a byte-sequence index per §8's negative-index rule: a negative
/// index counts from the end, and the valid range is `-len..len`. Returns
/// the resolved forward offset, or an `arg/index-out-of-bounds` error.
fn resolve_byte_index(i: i64, len: usize) -> UncilResult<usize> {
    let len = len as i64;
    let idx = if i < 0 { i + len } else { i };
    if idx < 0 || idx >= len {
        Err(UncilError::BadArgument("index-out-of-bounds".into()))
    } else {
        Ok(idx as usize)
    }
}

pub(crate) fn get_index(view: &View, obj: Value, index: Value) -> UncilResult<Value> {
    match obj {
        Value::String(h) => {
            let i = match index {
                Value::Int(i) => i,
                _ => return Err(UncilError::Type("string index must be an int".into())),
            };
            let byte = view
                .world
                .with_entity(h, |e| match &e.payload {
                    EntityPayload::String(s) => {
                        resolve_byte_index(i, s.bytes.len()).map(|idx| s.bytes[idx])
                    }
                    _ => Err(UncilError::Fatal("not a string".into())),
                })
                .ok_or_else(|| UncilError::Fatal("entity is gone".into()))??;
            let h = view.world.wake_fresh(EntityPayload::String(StringPayload { bytes: vec![byte] }));
            Ok(Value::String(h))
        }
        Value::Blob(h) => {
            let i = match index {
                Value::Int(i) => i,
                _ => return Err(UncilError::Type("blob index must be an int".into())),
            };
            let byte = view
                .world
                .with_entity(h, |e| match &e.payload {
                    EntityPayload::Blob(b) => resolve_byte_index(i, b.bytes.len()).map(|idx| b.bytes[idx]),
                    _ => Err(UncilError::Fatal("not a blob".into())),
                })
                .ok_or_else(|| UncilError::Fatal("entity is gone".into()))??;
            Ok(Value::Int(byte as i64))
        }
        Value::Array(h) => {
            let i = match index {
                Value::Int(i) => i,
                _ => return Err(UncilError::Type("array index must be an int".into())),
            };
            view.world
                .with_entity(h, |e| match &e.payload {
                    EntityPayload::Array(a) => {
                        let len = a.items.len() as i64;
                        let idx = if i < 0 { i + len } else { i };
                        if idx < 0 || idx >= len {
                            None
                        } else {
                            Some(a.items[idx as usize])
                        }
                    }
                    _ => None,
                })
                .flatten()
                .ok_or_else(|| UncilError::Logic("array index out of range".into()))
        }
        Value::Table(h) => {
            let key = view.world.value_key(&index);
            view.world
                .with_entity(h, |e| match &e.payload {
                    EntityPayload::Dict(d) => d.table.get(&key).copied(),
                    _ => None,
                })
                .flatten()
                .ok_or_else(|| UncilError::Logic("key not found".into()))
        }
        _ => Err(UncilError::Type(format!("{} is not indexable", view.world.tag_name(&obj)))),
    }
}

pub(crate) fn set_index(view: &mut View, obj: Value, index: Value, value: Value) -> UncilResult<()> {
    match obj {
        Value::String(_) => Err(UncilError::Type("string does not support index assignment".into())),
        Value::Blob(h) => {
            let i = match index {
                Value::Int(i) => i,
                _ => return Err(UncilError::Type("blob index must be an int".into())),
            };
            let byte = match value {
                Value::Int(b) if (0..=255).contains(&b) => b as u8,
                Value::Int(_) => return Err(UncilError::BadArgument("blob byte must be 0..255".into())),
                _ => return Err(UncilError::Type("blob byte must be an int".into())),
            };
            view.world
                .with_entity_mut(h, |e| match &mut e.payload {
                    EntityPayload::Blob(b) => {
                        let idx = resolve_byte_index(i, b.bytes.len())?;
                        b.bytes[idx] = byte;
                        Ok(())
                    }
                    _ => Err(UncilError::Fatal("not a blob".into())),
                })
                .ok_or_else(|| UncilError::Fatal("entity is gone".into()))??;
            Ok(())
        }
        Value::Array(h) => {
            let i = match index {
                Value::Int(i) => i,
                _ => return Err(UncilError::Type("array index must be an int".into())),
            };
            view.retain(&value);
            let old = view.world.with_entity_mut(h, |e| match &mut e.payload {
                EntityPayload::Array(a) => {
                    let len = a.items.len() as i64;
                    let idx = if i < 0 { i + len } else { i };
                    if idx >= 0 && idx < len {
                        let old = a.items[idx as usize];
                        a.items[idx as usize] = value;
                        Some(old)
                    } else if idx == len {
                        a.items.push(value);
                        Some(Value::Null)
                    } else {
                        None
                    }
                }
                _ => None,
            });
            match old.flatten() {
                Some(old) => {
                    view.release(old);
                    Ok(())
                }
                None => {
                    view.release(value);
                    Err(UncilError::Logic("array index out of range".into()))
                }
            }
        }
        Value::Table(h) => {
            let key = view.world.value_key(&index);
            view.retain(&value);
            let old =
                view.world.with_entity_mut(h, |e| match &mut e.payload {
                    EntityPayload::Dict(d) => d.table.insert(key, value),
                    _ => None,
                });
            if let Some(Some(old)) = old {
                view.release(old);
            }
            Ok(())
        }
        _ => Err(UncilError::Type(format!("{} does not support index assignment", view.world.tag_name(&obj)))),
    }
}

pub(crate) fn del_index(view: &mut View, obj: Value, index: Value) -> UncilResult<()> {
    match obj {
        Value::String(_) => Err(UncilError::Type("string does not support index deletion".into())),
        Value::Blob(h) => {
            let i = match index {
                Value::Int(i) => i,
                _ => return Err(UncilError::Type("blob index must be an int".into())),
            };
            view.world
                .with_entity_mut(h, |e| match &mut e.payload {
                    EntityPayload::Blob(b) => {
                        let idx = resolve_byte_index(i, b.bytes.len())?;
                        b.bytes.remove(idx);
                        Ok(())
                    }
                    _ => Err(UncilError::Fatal("not a blob".into())),
                })
                .ok_or_else(|| UncilError::Fatal("entity is gone".into()))??;
            Ok(())
        }
        Value::Array(h) => {
            let i = match index {
                Value::Int(i) => i,
                _ => return Err(UncilError::Type("array index must be an int".into())),
            };
            let removed = view.world.with_entity_mut(h, |e| match &mut e.payload {
                EntityPayload::Array(a) => {
                    let len = a.items.len() as i64;
                    let idx = if i < 0 { i + len } else { i };
                    if idx >= 0 && idx < len {
                        Some(a.items.remove(idx as usize))
                    } else {
                        None
                    }
                }
                _ => None,
            });
            match removed.flatten() {
                Some(v) => {
                    view.release(v);
                    Ok(())
                }
                None => Err(UncilError::Logic("array index out of range".into())),
            }
        }
        Value::Table(h) => {
            let key = view.world.value_key(&index);
            let removed = view.world.with_entity_mut(h, |e| match &mut e.payload {
                EntityPayload::Dict(d) => d.table.remove(&key),
                _ => None,
            });
            if let Some(Some(v)) = removed {
                view.release(v);
            }
            Ok(())
        }
        _ => Err(UncilError::Type(format!("{} does not support index deletion", view.world.tag_name(&obj)))),
    }
}

fn exhale_cell(view: &mut View, slot: u32) -> Handle {
    let frame_idx = view.frames.len() - 1;
    if let Some(h) = view.frames[frame_idx].exhale_cells[slot as usize] {
        return h;
    }
    let h = view.wake(EntityPayload::Ref(Value::Null));
    view.retain(&Value::Ref(h));
    view.frames[frame_idx].exhale_cells[slot as usize] = Some(h);
    h
}

fn read_cell(view: &View, handle: Handle) -> Value {
    view.world
        .with_entity(handle, |e| match &e.payload {
            EntityPayload::Ref(v) => *v,
            _ => Value::Null,
        })
        .unwrap_or(Value::Null)
}

fn write_cell(view: &mut View, handle: Handle, value: Value) {
    view.retain(&value);
    let old = view
        .world
        .with_entity_mut(handle, |e| match &mut e.payload {
            EntityPayload::Ref(slot) => std::mem::replace(slot, value),
            _ => Value::Null,
        })
        .unwrap_or(Value::Null);
    view.release(old);
}

/// Flatten a (possibly chained) `BoundFunction` into its underlying
/// [`FunctionPayload`] plus the receivers collected along the way, in call
/// order (§4.4 "method call sugar").
fn resolve_callable(view: &View, mut callee: Value) -> UncilResult<(FunctionPayload, Vec<Value>)> {
    let mut prefix = Vec::new();
    loop {
        match callee {
            Value::Function(h) => {
                let payload = view
                    .world
                    .with_entity(h, |e| match &e.payload {
                        EntityPayload::Function(f) => Some(f.clone()),
                        _ => None,
                    })
                    .flatten()
                    .ok_or_else(|| UncilError::Type("not callable".into()))?;
                return Ok((payload, prefix));
            }
            Value::BoundFunction(h) => {
                let (next, receiver) = view
                    .world
                    .with_entity(h, |e| match &e.payload {
                        EntityPayload::BoundFunction(b) => Some((b.callable, b.receiver)),
                        _ => None,
                    })
                    .flatten()
                    .ok_or_else(|| UncilError::Type("not callable".into()))?;
                view.retain(&receiver);
                prefix.push(receiver);
                callee = next;
            }
            other => return Err(UncilError::Type(format!("{} is not callable", view.world.tag_name(&other)))),
        }
    }
}

fn check_arity(target: &FunctionPayload, argc: usize) -> UncilResult<()> {
    if argc < target.required_args as usize {
        return Err(UncilError::BadArgument(format!(
            "expected at least {} arguments, got {argc}",
            target.required_args
        )));
    }
    if argc > target.total_args as usize && !target.flags.ellipsis {
        return Err(UncilError::BadArgument(format!(
            "expected at most {} arguments, got {argc}",
            target.total_args
        )));
    }
    Ok(())
}

/// Pad a call's argument list to a script function's full register window:
/// fill missing optional slots from `target.defaults`, pack surplus
/// arguments into a rest array when `...` is declared, and zero-fill the
/// remaining local/temp registers.
fn pad_args_for_script(
    view: &mut View,
    target: &FunctionPayload,
    script: &ScriptFunctionPayload,
    mut args: Vec<Value>,
) -> Vec<Value> {
    let required = target.required_args as usize;
    let total = target.total_args as usize;
    let mut rest = Vec::new();
    if args.len() > total {
        if target.flags.ellipsis {
            rest = args.split_off(total);
        } else {
            for extra in args.split_off(total) {
                view.release(extra);
            }
        }
    }
    while args.len() < total {
        let i = args.len() - required;
        let default = target.defaults.get(i).copied().unwrap_or(Value::Null);
        view.retain(&default);
        args.push(default);
    }
    if target.flags.ellipsis {
        let rest_array = view.wake(EntityPayload::Array(ArrayPayload { items: rest }));
        view.retain(&Value::Array(rest_array));
        args.push(Value::Array(rest_array));
    }
    while args.len() < script.register_count as usize {
        args.push(Value::Null);
    }
    args
}

fn push_call_frame(
    view: &mut View,
    return_reg: Reg,
    return_count: u16,
    func_index: u32,
    script: &ScriptFunctionPayload,
    args: Vec<Value>,
    bound_refs: Vec<Handle>,
    incoming_argc: u16,
) {
    let exhale_count = script.program.functions[func_index as usize].exhale_count as usize;
    let base = view.registers.len();
    let saved_pc = view.pc;
    let saved_bound = std::mem::replace(&mut view.bound, bound_refs);
    let saved_jump_width = view.cur_jump_width;
    let saved_program = view.program.replace(script.program.clone());
    let with_stack_base = view.with_stack.len();
    let value_stack_base = view.value_stack.len();
    view.registers.extend(args);
    view.pc = script.pc;
    view.cur_jump_width = script.jump_width;
    view.frames.push(CallFrame {
        base,
        func_index,
        return_reg,
        return_count,
        incoming_argc,
        saved_pc,
        saved_bound,
        saved_jump_width,
        saved_program,
        with_stack_base,
        value_stack_base,
        exhale_cells: vec![None; exhale_count],
    });
}

/// Reuse the current call frame in place for a tail call (§8 "tail-call
/// depth of 1,000,000"): the caller's saved context is untouched, only the
/// active function identity and register window change.
fn tail_call_into(
    view: &mut View,
    func_index: u32,
    script: &ScriptFunctionPayload,
    args: Vec<Value>,
    bound_refs: Vec<Handle>,
    incoming_argc: u16,
) {
    let (base, with_stack_base, value_stack_base) = {
        let f = view.frames.last().unwrap();
        (f.base, f.with_stack_base, f.value_stack_base)
    };
    close_with_stack(view, with_stack_base);
    truncate_value_stack(view, value_stack_base);
    for v in view.registers[base..].to_vec() {
        view.world.release(v);
    }
    view.registers.truncate(base);
    view.registers.extend(args);
    let exhale_count = script.program.functions[func_index as usize].exhale_count as usize;
    let old_cells = {
        let f = view.frames.last_mut().unwrap();
        f.func_index = func_index;
        f.incoming_argc = incoming_argc;
        std::mem::replace(&mut f.exhale_cells, vec![None; exhale_count])
    };
    for cell in old_cells.into_iter().flatten() {
        view.world.release(Value::Ref(cell));
    }
    view.bound = bound_refs;
    view.pc = script.pc;
    view.program = Some(script.program.clone());
    view.cur_jump_width = script.jump_width;
}

fn close_with_stack(view: &mut View, from: usize) {
    while view.with_stack.len() > from {
        let v = view.with_stack.pop().unwrap();
        invoke_close(view, v);
        view.release(v);
    }
}

fn truncate_value_stack(view: &mut View, from: usize) {
    while view.value_stack.len() > from {
        let v = view.value_stack.pop().unwrap();
        view.release(v);
    }
}

fn invoke_close(view: &mut View, v: Value) {
    if let Value::Object(h) = v {
        let close_fn = view
            .world
            .with_entity(h, |e| match &e.payload {
                EntityPayload::Object(o) => o.attrs.get(&b"close".to_vec()).copied(),
                _ => None,
            })
            .flatten();
        if let Some(f) = close_fn {
            let _ = call(view, f, &[v]);
        }
    }
}

fn do_return(view: &mut View, ret_val: Value, target_depth: usize) -> UncilResult<Option<Value>> {
    let frame = view.frames.pop().expect("return with no active call frame");
    view.retain(&ret_val);
    close_with_stack(view, frame.with_stack_base);
    truncate_value_stack(view, frame.value_stack_base);
    for cell in frame.exhale_cells.into_iter().flatten() {
        view.world.release(Value::Ref(cell));
    }
    for v in view.registers[frame.base..].to_vec() {
        view.world.release(v);
    }
    view.registers.truncate(frame.base);
    view.pc = frame.saved_pc;
    view.bound = frame.saved_bound;
    view.cur_jump_width = frame.saved_jump_width;
    view.program = frame.saved_program;
    if view.frames.len() < target_depth {
        return Err(UncilError::Fatal("call stack underflow".into()));
    }
    if view.frames.len() == target_depth {
        return Ok(Some(ret_val));
    }
    let base = view.frames.last().unwrap().base;
    spread_return(view, base, frame.return_reg, frame.return_count, ret_val);
    Ok(None)
}

/// Write a call's result into the `count` consecutive registers starting at
/// `base + dst_start`. `count == 1` is a plain single-register write; for
/// `count > 1` (a `DESTRUCTURE_CALL`), an `Array` result spreads its items
/// across the registers (short arrays null-fill, excess items are dropped
/// with the array), and any other value lands in the first register alone.
fn spread_return(view: &mut View, base: usize, dst_start: Reg, count: u16, ret_val: Value) {
    let idx = base + dst_start as usize;
    if count <= 1 {
        let old = view.registers[idx];
        view.registers[idx] = ret_val;
        view.world.release(old);
        return;
    }
    let items = match ret_val {
        Value::Array(h) => {
            let items = view
                .world
                .with_entity(h, |e| match &e.payload {
                    EntityPayload::Array(a) => Some(a.items.clone()),
                    _ => None,
                })
                .flatten()
                .unwrap_or_default();
            let take = items.len().min(count as usize);
            for it in &items[..take] {
                view.retain(it);
            }
            view.world.release(Value::Array(h));
            items
        }
        other => vec![other],
    };
    for i in 0..count as usize {
        let v = items.get(i).copied().unwrap_or(Value::Null);
        let slot = idx + i;
        let old = view.registers[slot];
        view.registers[slot] = v;
        view.world.release(old);
    }
}

/// Walk `view.try_frames` looking for a handler that can catch `err`. Fatal
/// and trampoline errors are never caught (§4.7, §4.9). A handler owned by
/// an activation shallower than `target_depth` belongs to an enclosing,
/// still-running [`dispatch_loop`] invocation and is re-thrown for it to
/// find instead.
fn handle_error(view: &mut View, err: UncilError, target_depth: usize) -> UncilResult<()> {
    if err.is_fatal() || err.is_trampoline() {
        return Err(err);
    }
    loop {
        let Some(last) = view.try_frames.last() else {
            return Err(err);
        };
        if last.frame_depth < target_depth {
            return Err(err);
        }
        let try_frame: TryFrame = view.try_frames.pop().unwrap();
        while view.frames.len() > try_frame.frame_depth {
            pop_frame_discard(view);
        }
        close_with_stack(view, try_frame.with_stack_base);
        truncate_value_stack(view, try_frame.value_stack_base);
        let value = exception_value(view, &err);
        view.push(value);
        view.pc = try_frame.handler_pc;
        return Ok(());
    }
}

fn pop_frame_discard(view: &mut View) {
    let frame = view.frames.pop().expect("unwind past the bottom of the call stack");
    for v in view.registers[frame.base..].to_vec() {
        view.world.release(v);
    }
    view.registers.truncate(frame.base);
    for cell in frame.exhale_cells.into_iter().flatten() {
        view.world.release(Value::Ref(cell));
    }
    view.pc = frame.saved_pc;
    view.bound = frame.saved_bound;
    view.cur_jump_width = frame.saved_jump_width;
    view.program = frame.saved_program;
}

/// Build the value a `try`/`catch` handler sees for a thrown error (§7
/// "Propagation"): a value already sitting in the exception slot (raised
/// explicitly via `throw`/`raise`) is rethrown as-is; anything else is
/// wrapped in a fresh object with `type` and `message` fields.
fn exception_value(view: &mut View, err: &UncilError) -> Value {
    if let Some(v) = view.exception.take() {
        return v;
    }
    let mut attrs = crate::entity::AttrTable::new();
    let type_str = Value::String(view.wake(EntityPayload::String(StringPayload { bytes: err.type_name().as_bytes().to_vec() })));
    let message_str = Value::String(view.wake(EntityPayload::String(StringPayload { bytes: err.to_string().into_bytes() })));
    view.retain(&type_str);
    view.retain(&message_str);
    attrs.insert(b"type".to_vec(), type_str);
    attrs.insert(b"message".to_vec(), message_str);
    Value::Object(view.wake(EntityPayload::Object(ObjectPayload { attrs, prototype: Value::Null, frozen: false })))
}

fn execute_one(view: &mut View, instr: Instruction, next_pc: u32, target_depth: usize) -> UncilResult<Option<Value>> {
    let target = |offset: i32| (next_pc as i64 + offset as i64) as u32;

    match instr {
        Instruction::LoadInt { dst, value } => set_reg(view, dst, Value::Int(value)),
        Instruction::LoadFloat { dst, value } => set_reg(view, dst, Value::Float(value)),
        Instruction::LoadNull { dst } => set_reg(view, dst, Value::Null),
        Instruction::LoadBool { dst, value } => set_reg(view, dst, Value::Bool(value)),
        Instruction::LoadStr { dst, str_index } => {
            let program = view.program.clone().unwrap();
            let bytes = name_bytes(&program, str_index).to_vec();
            let h = view.wake(EntityPayload::String(crate::entity::StringPayload { bytes }));
            set_reg(view, dst, Value::String(h));
        }
        Instruction::LoadStack { dst, offset } => {
            let len = view.value_stack.len() as i64;
            let idx = (len + offset as i64) as usize;
            let v = view.value_stack[idx];
            set_reg(view, dst, v);
        }
        Instruction::Move { dst, src } => {
            let v = reg(view, src);
            set_reg(view, dst, v);
        }
        Instruction::BinReg { op, dst, a, b } => {
            let (va, vb) = (reg(view, a), reg(view, b));
            let result = alu::binary(view, op, va, vb)?;
            set_reg(view, dst, result);
        }
        Instruction::BinImm { op, dst, a, imm } => {
            let va = reg(view, a);
            let result = alu::binary(view, op, va, Value::Int(imm))?;
            set_reg(view, dst, result);
        }
        Instruction::UnOp { op, dst, a } => {
            let va = reg(view, a);
            let result = alu::unary(view, op, va)?;
            set_reg(view, dst, result);
        }
        Instruction::Cmp { op, dst, a, b } => {
            let (va, vb) = (reg(view, a), reg(view, b));
            let result = alu::compare(view, op, va, vb)?;
            set_reg(view, dst, result);
        }
        Instruction::GetAttr { dst, obj, name } => {
            let program = view.program.clone().unwrap();
            let obj_val = reg(view, obj);
            let n = name_bytes(&program, name).to_vec();
            let v = lookup_attr(view, obj_val, &n).unwrap_or(Value::Null);
            set_reg(view, dst, v);
        }
        Instruction::SetAttr { obj, name, value } => {
            let program = view.program.clone().unwrap();
            let n = name_bytes(&program, name).to_vec();
            let obj_val = reg(view, obj);
            let v = reg(view, value);
            let Value::Object(h) = obj_val else {
                return Err(UncilError::Type(format!("{} has no settable attributes", view.world.tag_name(&obj_val))));
            };
            view.retain(&v);
            let (frozen, old) = view
                .world
                .with_entity_mut(h, |e| match &mut e.payload {
                    EntityPayload::Object(o) => (o.frozen, if o.frozen { None } else { o.attrs.insert(n, v) }),
                    _ => (true, None),
                })
                .unwrap_or((true, None));
            if frozen {
                view.release(v);
                return Err(UncilError::Logic("cannot set attribute on a frozen object".into()));
            }
            if let Some(old) = old {
                view.release(old);
            }
        }
        Instruction::DelAttr { obj, name } => {
            let program = view.program.clone().unwrap();
            let n = name_bytes(&program, name).to_vec();
            let obj_val = reg(view, obj);
            if let Value::Object(h) = obj_val {
                let removed = view.world.with_entity_mut(h, |e| match &mut e.payload {
                    EntityPayload::Object(o) => o.attrs.remove(&n),
                    _ => None,
                });
                if let Some(Some(v)) = removed {
                    view.release(v);
                }
            }
        }
        Instruction::GetIndex { dst, obj, index } => {
            let (obj_val, idx_val) = (reg(view, obj), reg(view, index));
            let v = get_index(view, obj_val, idx_val)?;
            set_reg(view, dst, v);
        }
        Instruction::SetIndex { obj, index, value } => {
            let (obj_val, idx_val, v) = (reg(view, obj), reg(view, index), reg(view, value));
            set_index(view, obj_val, idx_val, v)?;
        }
        Instruction::DelIndex { obj, index } => {
            let (obj_val, idx_val) = (reg(view, obj), reg(view, index));
            del_index(view, obj_val, idx_val)?;
        }
        Instruction::GetPublic { dst, name } => {
            let program = view.program.clone().unwrap();
            let n = name_bytes(&program, name).to_vec();
            let v = view.world.public_names.borrow().get(&n).copied();
            match v {
                Some(v) => set_reg(view, dst, v),
                None => return Err(UncilError::Logic(format!("'{}' is not defined", String::from_utf8_lossy(&n)))),
            }
        }
        Instruction::SetPublic { name, value } => {
            let program = view.program.clone().unwrap();
            let n = name_bytes(&program, name).to_vec();
            let v = reg(view, value);
            view.retain(&v);
            let old = view.world.public_names.borrow_mut().insert(n, v);
            if let Some(old) = old {
                view.release(old);
            }
        }
        Instruction::DelPublic { name } => {
            let program = view.program.clone().unwrap();
            let n = name_bytes(&program, name).to_vec();
            let old = view.world.public_names.borrow_mut().remove(&n);
            if let Some(old) = old {
                view.release(old);
            }
        }
        Instruction::GetCapture { dst, slot, own } => {
            let handle = if own { exhale_cell(view, slot) } else { view.bound[slot as usize] };
            let v = read_cell(view, handle);
            set_reg(view, dst, v);
        }
        Instruction::SetCapture { slot, value, own } => {
            let handle = if own { exhale_cell(view, slot) } else { view.bound[slot as usize] };
            let v = reg(view, value);
            write_cell(view, handle, v);
        }
        Instruction::MakeFunction { dst, func_index } => {
            let program = view.program.clone().unwrap();
            let descriptor = &program.functions[func_index as usize];
            let mut refs = Vec::with_capacity(descriptor.inhale.len());
            for source in descriptor.inhale.clone() {
                let h = match source {
                    crate::program::InhaleSource::Exhale(slot) => exhale_cell(view, slot),
                    crate::program::InhaleSource::Inhale(slot) => view.bound[slot as usize],
                };
                view.retain(&Value::Ref(h));
                refs.push(h);
            }
            let script = ScriptFunctionPayload {
                program: program.clone(),
                func_index,
                pc: descriptor.code_offset as u32,
                jump_width: descriptor.jump_width,
                register_count: descriptor.register_count,
                first_local: descriptor.first_local,
                name_offset: descriptor.name_offset.unwrap_or(0),
                debug_offset: descriptor.debug_offset as u32,
            };
            let optional = descriptor.optional_args as usize;
            let payload = FunctionPayload {
                flags: descriptor.flags,
                required_args: descriptor.required_args,
                total_args: descriptor.required_args + descriptor.optional_args,
                defaults: vec![Value::Null; optional],
                refs,
                body: FunctionBody::Script(script),
            };
            let h = view.wake(EntityPayload::Function(payload));
            set_reg(view, dst, Value::Function(h));
        }
        Instruction::Call { dst, func, argc } => {
            let callee = reg(view, func);
            let mut args = view.value_stack.split_off(view.value_stack.len() - argc as usize);
            let (target, prefix) = resolve_callable(view, callee)?;
            if !prefix.is_empty() {
                let mut full = prefix;
                full.extend(args);
                args = full;
            }
            check_arity(&target, args.len())?;
            match &target.body {
                FunctionBody::Native(native) => {
                    let result = (native.func)(view, &args);
                    for a in &args {
                        view.release(*a);
                    }
                    match result {
                        Ok(values) => {
                            let ret = values.into_iter().next().unwrap_or(Value::Null);
                            set_reg(view, dst, ret);
                        }
                        Err(e) => {
                            if e.is_trampoline() {
                                view.resume_target = Some(dst);
                            }
                            return Err(e);
                        }
                    }
                }
                FunctionBody::Script(script) => {
                    let script = script.clone();
                    let bound_refs = target.refs.clone();
                    let incoming_argc = args.len() as u16;
                    let args = pad_args_for_script(view, &target, &script, args);
                    push_call_frame(view, dst, 1, script.func_index, &script, args, bound_refs, incoming_argc);
                }
            }
        }
        Instruction::TailCall { func, argc } => {
            let callee = reg(view, func);
            let mut args = view.value_stack.split_off(view.value_stack.len() - argc as usize);
            let (target, prefix) = resolve_callable(view, callee)?;
            if !prefix.is_empty() {
                let mut full = prefix;
                full.extend(args);
                args = full;
            }
            check_arity(&target, args.len())?;
            match &target.body {
                FunctionBody::Native(native) => {
                    let result = (native.func)(view, &args);
                    for a in &args {
                        view.release(*a);
                    }
                    let ret = result?.into_iter().next().unwrap_or(Value::Null);
                    return do_return(view, ret, target_depth);
                }
                FunctionBody::Script(script) => {
                    let script = script.clone();
                    let bound_refs = target.refs.clone();
                    let incoming_argc = args.len() as u16;
                    let args = pad_args_for_script(view, &target, &script, args);
                    tail_call_into(view, script.func_index, &script, args, bound_refs, incoming_argc);
                }
            }
        }
        Instruction::DestructureCall { dst_start, count, func, argc } => {
            let callee = reg(view, func);
            let mut args = view.value_stack.split_off(view.value_stack.len() - argc as usize);
            let (target, prefix) = resolve_callable(view, callee)?;
            if !prefix.is_empty() {
                let mut full = prefix;
                full.extend(args);
                args = full;
            }
            check_arity(&target, args.len())?;
            match &target.body {
                FunctionBody::Native(native) => {
                    let result = (native.func)(view, &args);
                    for a in &args {
                        view.release(*a);
                    }
                    match result {
                        Ok(values) => {
                            let ret = values.into_iter().next().unwrap_or(Value::Null);
                            view.retain(&ret);
                            spread_return(view, current_base(view), dst_start, count, ret);
                        }
                        Err(e) => {
                            if e.is_trampoline() {
                                view.resume_target = Some(dst_start);
                            }
                            return Err(e);
                        }
                    }
                }
                FunctionBody::Script(script) => {
                    let script = script.clone();
                    let bound_refs = target.refs.clone();
                    let incoming_argc = args.len() as u16;
                    let args = pad_args_for_script(view, &target, &script, args);
                    push_call_frame(view, dst_start, count, script.func_index, &script, args, bound_refs, incoming_argc);
                }
            }
        }
        Instruction::CheckArity { min, max, ellipsis } => {
            let argc = view.frames.last().map(|f| f.incoming_argc).unwrap_or(0);
            if argc < min {
                return Err(UncilError::BadArgument(format!("expected at least {min} arguments, got {argc}")));
            }
            if argc > max && !ellipsis {
                return Err(UncilError::BadArgument(format!("expected at most {max} arguments, got {argc}")));
            }
        }
        Instruction::Push { value } => {
            let v = reg(view, value);
            view.push(v);
        }
        Instruction::IterNew { dst, src } => {
            let src_val = reg(view, src);
            view.retain(&src_val);
            let h = view.wake(EntityPayload::Opaque(crate::entity::OpaquePayload {
                bytes: 0u64.to_le_bytes().to_vec(),
                bound: vec![src_val],
                ..Default::default()
            }));
            set_reg(view, dst, Value::Opaque(h));
        }
        Instruction::IterNext { dst, iter, offset } => {
            let iter_val = reg(view, iter);
            let Value::Opaque(h) = iter_val else {
                return Err(UncilError::Type("not an iterator".into()));
            };
            let (index, container) = view
                .world
                .with_entity(h, |e| match &e.payload {
                    EntityPayload::Opaque(o) => {
                        let idx = u64::from_le_bytes(o.bytes[..8].try_into().unwrap());
                        (idx, o.bound.first().copied().unwrap_or(Value::Null))
                    }
                    _ => (0, Value::Null),
                })
                .unwrap_or((0, Value::Null));
            let next_item = match container {
                Value::Array(ah) => view
                    .world
                    .with_entity(ah, |e| match &e.payload {
                        EntityPayload::Array(a) => a.items.get(index as usize).copied(),
                        _ => None,
                    })
                    .flatten(),
                Value::Table(th) => view
                    .world
                    .with_entity(th, |e| match &e.payload {
                        EntityPayload::Dict(d) => d.table.iter().nth(index as usize).map(|(_, v)| *v),
                        _ => None,
                    })
                    .flatten(),
                _ => return Err(UncilError::Type("not iterable".into())),
            };
            match next_item {
                Some(v) => {
                    view.world.with_entity_mut(h, |e| {
                        if let EntityPayload::Opaque(o) = &mut e.payload {
                            o.bytes[..8].copy_from_slice(&(index + 1).to_le_bytes());
                        }
                    });
                    set_reg(view, dst, v);
                }
                None => view.pc = target(offset),
            }
        }
        Instruction::Jump { offset } => view.pc = target(offset),
        Instruction::JumpIfFalse { cond, offset } => {
            if !reg(view, cond).truthy() {
                view.pc = target(offset);
            }
        }
        Instruction::ExPush { offset } => {
            view.try_frames.push(TryFrame {
                handler_pc: target(offset),
                frame_depth: view.frames.len(),
                with_stack_base: view.with_stack.len(),
                value_stack_base: view.value_stack.len(),
            });
        }
        Instruction::ExPop => {
            view.try_frames.pop();
        }
        Instruction::WPush { value } => {
            let v = reg(view, value);
            view.retain(&v);
            view.with_stack.push(v);
        }
        Instruction::WPop => {
            if let Some(v) = view.with_stack.pop() {
                invoke_close(view, v);
                view.release(v);
            }
        }
        Instruction::MakeArray { dst, count } => {
            let items = view.value_stack.split_off(view.value_stack.len() - count as usize);
            let h = view.wake(EntityPayload::Array(ArrayPayload { items }));
            set_reg(view, dst, Value::Array(h));
        }
        Instruction::MakeDict { dst, count } => {
            let flat = view.value_stack.split_off(view.value_stack.len() - 2 * count as usize);
            let mut table = crate::entity::DictTable::new();
            for pair in flat.chunks_exact(2) {
                let key = view.world.value_key(&pair[0]);
                table.insert(key, pair[1]);
                view.release(pair[0]);
            }
            let h = view.wake(EntityPayload::Dict(crate::entity::DictPayload { table }));
            set_reg(view, dst, Value::Table(h));
        }
        Instruction::Return { value } => {
            let v = reg(view, value);
            return do_return(view, v, target_depth);
        }
        Instruction::Exit => {
            view.flow = Flow::Halt;
            return do_return(view, Value::Null, target_depth);
        }
    }
    Ok(None)
}

pub fn dispatch_loop(view: &mut View, target_depth: usize) -> UncilResult<Value> {
    loop {
        let program = view.program.clone().ok_or_else(|| UncilError::Fatal("no active program".into()))?;
        let mut pos = view.pc as usize;
        let instr = Instruction::decode(&program.code, &mut pos, view.cur_jump_width);
        let next_pc = pos as u32;
        view.pc = next_pc;
        #[cfg(feature = "vm-trace")]
        tracing::trace!(pc = view.pc, instr = ?instr, "exec");
        match execute_one(view, instr, next_pc, target_depth) {
            Ok(Some(v)) => return Ok(v),
            Ok(None) => {}
            Err(e) => handle_error(view, e, target_depth)?,
        }
    }
}

/// Call a script or native value from outside the dispatch loop (the
/// embedder API, a `with`-block's `close`, or a coroutine's `resume`).
/// Blocks until the call returns; for a script callee this recurses one
/// level of native Rust call stack (§4.7 "reentrant native call").
#[tracing::instrument(level = "debug", name = "run", skip(view, callee, args), fields(argc = args.len()))]
pub fn call(view: &mut View, callee: Value, args: &[Value]) -> UncilResult<Value> {
    for a in args {
        view.retain(a);
    }
    let (target, prefix) = resolve_callable(view, callee)?;
    let mut full = prefix;
    full.extend_from_slice(args);
    check_arity(&target, full.len())?;
    let result = match &target.body {
        FunctionBody::Native(native) => {
            let result = (native.func)(view, &full);
            for a in &full {
                view.release(*a);
            }
            result.map(|v| v.into_iter().next().unwrap_or(Value::Null))
        }
        FunctionBody::Script(script) => {
            let script = script.clone();
            let bound_refs = target.refs.clone();
            let target_depth = view.frames.len();
            let incoming_argc = full.len() as u16;
            let bound_args = pad_args_for_script(view, &target, &script, full);
            push_call_frame(view, 0, 1, script.func_index, &script, bound_args, bound_refs, incoming_argc);
            dispatch_loop(view, target_depth)
        }
    };
    maybe_collect(view);
    result
}

/// Trigger a mark-and-sweep cycle collection when the live entity count
/// crosses the configured threshold (§3 "Lifecycle", §9A.3). Checked once
/// per top-level `call`, not per opcode, since a full sweep walks every live
/// handle in the world.
fn maybe_collect(view: &mut View) {
    if view.world.live_entity_count() >= view.world.config.gc_entity_threshold {
        crate::gc::collect(view);
    }
}

