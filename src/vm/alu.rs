//! Arithmetic and comparison over [`Value`] (§4.2, §4.7 `BINREG`/`BINIMM`/`CMP`/`UNOP`).
//!
//! Only the numeric and string-concatenation overloads named by the
//! specification are implemented; any other operand pairing is a
//! [`UncilError::Type`].

use crate::entity::{EntityPayload, StringPayload};
use crate::error::{UncilError, UncilResult};
use crate::opcode::{BinOp, CmpOp, UnOp};
use crate::value::Value;
use crate::view::View;

fn type_err(op: &str, a: &Value, b: &Value, view: &View) -> UncilError {
    UncilError::Type(format!(
        "unsupported operand types for {op}: {} and {}",
        view.world.tag_name(a),
        view.world.tag_name(b)
    ))
}

pub fn binary(view: &mut View, op: BinOp, a: Value, b: Value) -> UncilResult<Value> {
    use BinOp::*;
    match (op, a, b) {
        (Add, Value::Int(x), Value::Int(y)) => {
            x.checked_add(y).map(Value::Int).ok_or_else(|| UncilError::Convert("int addition overflowed".into()))
        }
        (Add, Value::String(_), Value::String(_)) => concat_strings(view, a, b),
        (Sub, Value::Int(x), Value::Int(y)) => {
            x.checked_sub(y).map(Value::Int).ok_or_else(|| UncilError::Convert("int subtraction overflowed".into()))
        }
        (Mul, Value::Int(x), Value::Int(y)) => {
            x.checked_mul(y).map(Value::Int).ok_or_else(|| UncilError::Convert("int multiplication overflowed".into()))
        }
        (IDiv, Value::Int(x), Value::Int(y)) => {
            if y == 0 {
                Err(UncilError::Logic("integer division by zero".into()))
            } else {
                Ok(Value::Int(x.div_euclid(y)))
            }
        }
        (Mod, Value::Int(x), Value::Int(y)) => {
            if y == 0 {
                Err(UncilError::Logic("modulo by zero".into()))
            } else {
                Ok(Value::Int(x.rem_euclid(y)))
            }
        }
        (Div, _, _) => Ok(Value::Float(as_f64(&a)? / as_f64(&b)?)),
        (Add, _, _) => Ok(Value::Float(as_f64(&a)? + as_f64(&b)?)),
        (Sub, _, _) => Ok(Value::Float(as_f64(&a)? - as_f64(&b)?)),
        (Mul, _, _) => Ok(Value::Float(as_f64(&a)? * as_f64(&b)?)),
        (IDiv, _, _) => Ok(Value::Float((as_f64(&a)? / as_f64(&b)?).floor())),
        (Mod, _, _) => Ok(Value::Float(as_f64(&a)?.rem_euclid(as_f64(&b)?))),
    }
}

fn as_f64(v: &Value) -> UncilResult<f64> {
    match v {
        Value::Int(i) => Ok(*i as f64),
        Value::Float(f) => Ok(*f),
        other => Err(UncilError::Type(format!("expected a number, found {}", other.tag().name()))),
    }
}

fn concat_strings(view: &mut View, a: Value, b: Value) -> UncilResult<Value> {
    let (Value::String(ha), Value::String(hb)) = (a, b) else {
        return Err(type_err("+", &a, &b, view));
    };
    let mut bytes = view.world.with_entity(ha, |e| string_bytes(e).to_vec()).unwrap_or_default();
    bytes.extend(view.world.with_entity(hb, |e| string_bytes(e).to_vec()).unwrap_or_default());
    Ok(Value::String(view.wake(EntityPayload::String(StringPayload { bytes }))))
}

fn string_bytes(e: &crate::entity::Entity) -> &[u8] {
    match &e.payload {
        EntityPayload::String(s) => &s.bytes,
        _ => &[],
    }
}

pub fn unary(view: &View, op: UnOp, a: Value) -> UncilResult<Value> {
    match (op, a) {
        (UnOp::Neg, Value::Int(i)) => Ok(Value::Int(i.wrapping_neg())),
        (UnOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnOp::Not, v) => Ok(Value::Bool(!v.truthy())),
        (UnOp::Neg, other) => {
            Err(UncilError::Type(format!("cannot negate {}", view.world.tag_name(&other))))
        }
    }
}

pub fn compare(view: &View, op: CmpOp, a: Value, b: Value) -> UncilResult<Value> {
    use CmpOp::*;
    if matches!(op, Eq | Ne) {
        let eq = view.world.values_equal(&a, &b);
        return Ok(Value::Bool(if op == Eq { eq } else { !eq }));
    }
    let ord = a.partial_cmp_numeric(&b).ok_or_else(|| type_err("comparison", &a, &b, view))?;
    use std::cmp::Ordering::*;
    let result = match (op, ord) {
        (Lt, Less) | (Le, Less) | (Le, Equal) | (Gt, Greater) | (Ge, Greater) | (Ge, Equal) => true,
        _ => false,
    };
    Ok(Value::Bool(result))
}
