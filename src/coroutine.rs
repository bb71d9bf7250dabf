//! Coroutines (§4.9): an `unc_yield`/`unc_resume` pair built on the VM's
//! [`crate::error::UncilError::Trampoline`] unwind signal rather than a
//! second native call stack.
//!
//! A coroutine's [`crate::view::View`] cannot live inside the entity arena
//! (`EntityPayload` derives `Clone`, and `View` owns a `Box<dyn Write>`), so
//! it is parked in `World::coroutines` instead and handed to scripts as an
//! [`crate::value::Value::Opaque`] entity whose bytes encode the table
//! index (see [`crate::world::CoroutineSlot`]).

use crate::entity::{EntityPayload, OpaquePayload};
use crate::error::{UncilError, UncilResult};
use crate::value::Value;
use crate::view::View;
use crate::vm;
use crate::world::CoroutineSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineStatus {
    Init,
    Run,
    Yield,
    Done,
    Error,
}

fn coroutine_index_of(view: &View, opaque: Value) -> UncilResult<usize> {
    let Value::Opaque(h) = opaque else {
        return Err(UncilError::Type("not a coroutine".into()));
    };
    view.world
        .with_entity(h, |e| match &e.payload {
            EntityPayload::Opaque(o) if o.bytes.len() == 8 => {
                Some(u64::from_le_bytes(o.bytes[..8].try_into().unwrap()) as usize)
            }
            _ => None,
        })
        .flatten()
        .ok_or_else(|| UncilError::Type("not a coroutine".into()))
}

/// Create a suspended coroutine wrapping `body` (a callable). Its own
/// register/frame/stack state lives in a fresh [`View`] parked in
/// `World::coroutines` until the first `resume`.
pub fn create(view: &mut View, body: Value) -> UncilResult<Value> {
    view.retain(&body);
    let coro_view = View::new(view.world.clone());
    let index = {
        let mut table = view.world.coroutines.borrow_mut();
        table.push(CoroutineSlot { view: Box::new(coro_view), status: CoroutineStatus::Init, body });
        table.len() - 1
    };
    let h = view.wake(EntityPayload::Opaque(OpaquePayload {
        bytes: (index as u64).to_le_bytes().to_vec(),
        ..Default::default()
    }));
    Ok(Value::Opaque(h))
}

/// Resume a suspended coroutine with `args`, running it until it either
/// yields, returns, or raises. Returns the yielded or returned value; a
/// raised exception propagates to the resumer the same way a direct call's
/// would.
#[tracing::instrument(level = "debug", skip(view, args), fields(argc = args.len()))]
pub fn resume(view: &mut View, coro: Value, args: &[Value]) -> UncilResult<Value> {
    let index = coroutine_index_of(view, coro)?;

    let (status, body) = {
        let table = view.world.coroutines.borrow();
        let slot = table.get(index).ok_or_else(|| UncilError::Logic("coroutine slot is gone".into()))?;
        (slot.status, slot.body)
    };

    if status == CoroutineStatus::Done {
        return Err(UncilError::Logic("cannot resume a finished coroutine".into()));
    }
    if status == CoroutineStatus::Run {
        return Err(UncilError::Logic("coroutine is already running".into()));
    }

    view.world.coroutines.borrow_mut()[index].status = CoroutineStatus::Run;

    let mut coro_view = {
        let mut table = view.world.coroutines.borrow_mut();
        std::mem::replace(&mut table[index].view, Box::new(View::new(view.world.clone())))
    };
    coro_view.coroutine_resumer = Some(index);

    let outcome = if status == CoroutineStatus::Init {
        vm::call(&mut coro_view, body, args)
    } else {
        coro_view.yield_value = None;
        // The pending `yield(...)` call's result register, captured by the
        // `CALL` handler when the native call trampolined out (§4.9). The
        // first resume argument becomes that call's return value; extra
        // arguments are discarded, matching `yield`'s single-value result.
        if let Some(dst) = coro_view.resume_target.take() {
            let v = args.first().copied().unwrap_or(Value::Null);
            coro_view.retain(&v);
            vm::set_reg_pub(&mut coro_view, dst, v);
        }
        vm::dispatch_loop(&mut coro_view, 0)
    };

    let result = match outcome {
        Ok(v) => {
            view.world.coroutines.borrow_mut()[index].status = CoroutineStatus::Done;
            Ok(v)
        }
        Err(UncilError::Trampoline(_)) => {
            let v = coro_view.yield_value.take().unwrap_or(Value::Null);
            view.world.coroutines.borrow_mut()[index].status = CoroutineStatus::Yield;
            Ok(v)
        }
        Err(e) => {
            view.world.coroutines.borrow_mut()[index].status = CoroutineStatus::Error;
            Err(e)
        }
    };

    view.world.coroutines.borrow_mut()[index].view = coro_view;
    result
}

/// The `yield` native: suspend the currently-running coroutine, handing
/// `value` back to its resumer. Implemented as a trampoline error so the
/// dispatch loop unwinds to [`resume`] without touching the coroutine's own
/// register/frame state (§4.7 "Trampoline").
#[tracing::instrument(level = "debug", skip(view))]
pub fn yield_value(view: &mut View, value: Value) -> UncilResult<Value> {
    if view.coroutine_resumer.is_none() {
        return Err(UncilError::Logic("yield outside a coroutine".into()));
    }
    view.retain(&value);
    tracing::debug!("coroutine yielding");
    view.yield_value = Some(value);
    Err(UncilError::Trampoline(0))
}

