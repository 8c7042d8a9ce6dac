//! `table` library (SPEC_FULL §4.8).

use super::args::*;
use crate::error::{LuaError, Result, RuntimeError};
use crate::executor::Executor;
use crate::heap::State;
use crate::value::Value;

pub fn install(state: &mut State) {
    let table_lib = state.alloc_table();
    {
        let t = state.get_table_mut(table_lib).unwrap();
        t.set(Value::str("insert"), Value::native("insert", insert));
        t.set(Value::str("remove"), Value::native("remove", remove));
        t.set(Value::str("concat"), Value::native("concat", concat));
        t.set(Value::str("sort"), Value::native("sort", sort));
        t.set(Value::str("unpack"), Value::native("unpack", unpack));
    }
    state.set_global("table", Value::Table(table_lib));
}

fn insert(ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let t = check_table(args, 0, "insert")?;
    let len = ex.state.get_table(t).map(|tb| tb.length()).unwrap_or(0);
    if args.len() <= 2 {
        let v = arg(args, 1);
        ex.state.get_table_mut(t).unwrap().set(Value::Integer(len + 1), v);
    } else {
        let pos = check_int(args, 1, "insert")?;
        if pos < 1 || pos > len + 1 {
            return Err(LuaError::Runtime(RuntimeError::ArgumentError {
                function: "insert".to_string(),
                arg_num: 2,
                expected: "position in bounds".to_string(),
                got: None,
                details: None,
            }));
        }
        let v = arg(args, 2);
        let mut i = len + 1;
        while i > pos {
            let prev = ex.state.get_table(t).unwrap().get(&Value::Integer(i - 1));
            ex.state.get_table_mut(t).unwrap().set(Value::Integer(i), prev);
            i -= 1;
        }
        ex.state.get_table_mut(t).unwrap().set(Value::Integer(pos), v);
    }
    Ok(Vec::new())
}

fn remove(ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let t = check_table(args, 0, "remove")?;
    let len = ex.state.get_table(t).map(|tb| tb.length()).unwrap_or(0);
    if len == 0 {
        return Ok(vec![Value::Nil]);
    }
    let pos = opt_int(args, 1, len);
    let removed = ex.state.get_table(t).unwrap().get(&Value::Integer(pos));
    let mut i = pos;
    while i < len {
        let next = ex.state.get_table(t).unwrap().get(&Value::Integer(i + 1));
        ex.state.get_table_mut(t).unwrap().set(Value::Integer(i), next);
        i += 1;
    }
    ex.state.get_table_mut(t).unwrap().set(Value::Integer(len), Value::Nil);
    Ok(vec![removed])
}

fn concat(ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let t = check_table(args, 0, "concat")?;
    let sep = if args.len() >= 2 { String::from_utf8_lossy(&check_string(args, 1, "concat")?).to_string() } else { String::new() };
    let len = ex.state.get_table(t).map(|tb| tb.length()).unwrap_or(0);
    let i = opt_int(args, 2, 1);
    let j = if args.len() >= 4 { check_int(args, 3, "concat")? } else { len };
    let mut parts = Vec::new();
    let mut k = i;
    while k <= j {
        let v = ex.state.get_table(t).unwrap().get(&Value::Integer(k));
        parts.push(v.to_string());
        k += 1;
    }
    Ok(vec![Value::str(parts.join(&sep))])
}

fn sort(ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let t = check_table(args, 0, "sort")?;
    let len = ex.state.get_table(t).map(|tb| tb.length()).unwrap_or(0) as usize;
    let mut items: Vec<Value> = (1..=len as i64).map(|i| ex.state.get_table(t).unwrap().get(&Value::Integer(i))).collect();
    let comparator = arg(args, 1);
    let mut sort_error = None;
    if comparator.is_nil() {
        items.sort_by(|a, b| {
            if sort_error.is_some() {
                return std::cmp::Ordering::Equal;
            }
            match default_lt(a, b) {
                Ok(true) => std::cmp::Ordering::Less,
                Ok(false) => std::cmp::Ordering::Greater,
                Err(e) => {
                    sort_error = Some(e);
                    std::cmp::Ordering::Equal
                }
            }
        });
    } else {
        items.sort_by(|a, b| {
            if sort_error.is_some() {
                return std::cmp::Ordering::Equal;
            }
            match ex.call_function(comparator.clone(), &[a.clone(), b.clone()]) {
                Ok(r) => {
                    if r.first().map(|v| v.truthy()).unwrap_or(false) {
                        std::cmp::Ordering::Less
                    } else {
                        std::cmp::Ordering::Greater
                    }
                }
                Err(e) => {
                    sort_error = Some(e);
                    std::cmp::Ordering::Equal
                }
            }
        });
    }
    if let Some(e) = sort_error {
        return Err(e);
    }
    for (idx, v) in items.into_iter().enumerate() {
        ex.state.get_table_mut(t).unwrap().set(Value::Integer(idx as i64 + 1), v);
    }
    Ok(Vec::new())
}

/// Default `<` used by `sort` when no comparator is given: numbers compare
/// numerically, strings compare lexicographically by byte, mixing the two
/// (or anything else) is an error, matching `executor.rs`'s `values_lt`.
fn default_lt(a: &Value, b: &Value) -> Result<bool> {
    match (a, b) {
        (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
            Ok(a.as_f64().unwrap() < b.as_f64().unwrap())
        }
        (Value::Str(x), Value::Str(y)) => Ok(x < y),
        _ => Err(LuaError::Runtime(RuntimeError::ArithError {
            op: "compare".to_string(),
            values: (a.type_name().to_string(), b.type_name().to_string()),
        })),
    }
}

fn unpack(ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let t = check_table(args, 0, "unpack")?;
    let i = opt_int(args, 1, 1);
    let j = if args.len() >= 3 { check_int(args, 2, "unpack")? } else { ex.state.get_table(t).map(|tb| tb.length()).unwrap_or(0) };
    let mut out = Vec::new();
    let mut k = i;
    while k <= j {
        out.push(ex.state.get_table(t).map(|tb| tb.get(&Value::Integer(k))).unwrap_or(Value::Nil));
        k += 1;
    }
    Ok(out)
}
