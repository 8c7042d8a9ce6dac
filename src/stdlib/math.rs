//! `math` library (SPEC_FULL §4.8).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;

use super::args::*;
use crate::error::Result;
use crate::executor::Executor;
use crate::heap::State;
use crate::value::Value;

thread_local! {
    static RNG: RefCell<Option<StdRng>> = RefCell::new(None);
}

/// Fixed seed used when `VMConfig.deterministic` is set, so a host asking for
/// reproducible runs gets the same `math.random` sequence every time absent
/// an explicit `math.randomseed` call.
const DETERMINISTIC_SEED: u64 = 0;

fn with_rng<T>(deterministic: bool, f: impl FnOnce(&mut StdRng) -> T) -> T {
    RNG.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            *slot = Some(if deterministic {
                StdRng::seed_from_u64(DETERMINISTIC_SEED)
            } else {
                StdRng::from_entropy()
            });
        }
        f(slot.as_mut().unwrap())
    })
}

pub fn install(state: &mut State) {
    let math = state.alloc_table();
    {
        let table = state.get_table_mut(math).unwrap();
        table.set(Value::str("huge"), Value::Float(f64::INFINITY));
        table.set(Value::str("pi"), Value::Float(std::f64::consts::PI));
        table.set(Value::str("maxinteger"), Value::Integer(i64::MAX));
        table.set(Value::str("mininteger"), Value::Integer(i64::MIN));
        table.set(Value::str("floor"), Value::native("floor", floor));
        table.set(Value::str("ceil"), Value::native("ceil", ceil));
        table.set(Value::str("abs"), Value::native("abs", abs));
        table.set(Value::str("sqrt"), Value::native("sqrt", sqrt));
        table.set(Value::str("min"), Value::native("min", min));
        table.set(Value::str("max"), Value::native("max", max));
        table.set(Value::str("random"), Value::native("random", random));
        table.set(Value::str("randomseed"), Value::native("randomseed", randomseed));
        table.set(Value::str("type"), Value::native("type", math_type));
        table.set(Value::str("tointeger"), Value::native("tointeger", tointeger));
    }
    state.set_global("math", Value::Table(math));
}

fn floor(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let n = check_number(args, 0, "floor")?;
    Ok(vec![Value::Integer(n.floor() as i64)])
}

fn ceil(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let n = check_number(args, 0, "ceil")?;
    Ok(vec![Value::Integer(n.ceil() as i64)])
}

fn abs(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    match arg(args, 0).coerce_to_number() {
        Some(Value::Integer(n)) => Ok(vec![Value::Integer(n.wrapping_abs())]),
        Some(Value::Float(n)) => Ok(vec![Value::Float(n.abs())]),
        _ => Err(arg_error("abs", 0, "number", &arg(args, 0))),
    }
}

fn sqrt(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let n = check_number(args, 0, "sqrt")?;
    Ok(vec![Value::Float(n.sqrt())])
}

fn min(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    reduce(args, "min", |a, b| if b < a { b } else { a })
}

fn max(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    reduce(args, "max", |a, b| if b > a { b } else { a })
}

fn reduce(args: &[Value], func: &str, pick: impl Fn(f64, f64) -> f64) -> Result<Vec<Value>> {
    if args.is_empty() {
        return Err(arg_error(func, 0, "number", &Value::Nil));
    }
    let mut best = check_number(args, 0, func)?;
    let mut best_is_int = matches!(arg(args, 0), Value::Integer(_));
    for i in 1..args.len() {
        let v = check_number(args, i, func)?;
        if pick(best, v) == v && v != best {
            best = v;
            best_is_int = matches!(arg(args, i), Value::Integer(_));
        }
    }
    Ok(vec![if best_is_int { Value::Integer(best as i64) } else { Value::Float(best) }])
}

fn random(ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let deterministic = ex.state.config.deterministic;
    match args.len() {
        0 => Ok(vec![Value::Float(with_rng(deterministic, |r| r.gen::<f64>()))]),
        1 => {
            let m = check_int(args, 0, "random")?;
            Ok(vec![Value::Integer(with_rng(deterministic, |r| r.gen_range(1..=m)))])
        }
        _ => {
            let lo = check_int(args, 0, "random")?;
            let hi = check_int(args, 1, "random")?;
            Ok(vec![Value::Integer(with_rng(deterministic, |r| r.gen_range(lo..=hi)))])
        }
    }
}

fn randomseed(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let seed = opt_int(args, 0, 0) as u64;
    RNG.with(|cell| *cell.borrow_mut() = Some(StdRng::seed_from_u64(seed)));
    Ok(Vec::new())
}

fn math_type(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    Ok(vec![arg(args, 0).numeric_subtype().map(Value::str).unwrap_or(Value::Nil)])
}

fn tointeger(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    Ok(vec![arg(args, 0).as_i64().map(Value::Integer).unwrap_or(Value::Nil)])
}
