//! Base library: top-level globals (SPEC_FULL §4.8).

use super::args::*;
use crate::error::{LuaError, Result, RuntimeError};
use crate::executor::Executor;
use crate::heap::State;
use crate::value::Value;

pub fn install(state: &mut State) {
    state.register_function("type", lua_type);
    state.register_function("tostring", lua_tostring);
    state.register_function("tonumber", lua_tonumber);
    state.register_function("print", lua_print);
    state.register_function("error", lua_error);
    state.register_function("assert", lua_assert);
    state.register_function("pcall", lua_pcall);
    state.register_function("xpcall", lua_xpcall);
    state.register_function("pairs", lua_pairs);
    state.register_function("ipairs", lua_ipairs);
    state.register_function("next", lua_next);
    state.register_function("select", lua_select);
    state.register_function("unpack", lua_unpack);
    state.register_function("setmetatable", lua_setmetatable);
    state.register_function("getmetatable", lua_getmetatable);
    state.register_function("rawget", lua_rawget);
    state.register_function("rawset", lua_rawset);
    state.register_function("rawlen", lua_rawlen);
    state.register_function("rawequal", lua_rawequal);
}

fn lua_type(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    Ok(vec![Value::str(arg(args, 0).type_name())])
}

fn lua_tostring(ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    Ok(vec![Value::str(ex.tostring(&arg(args, 0))?)])
}

fn lua_tonumber(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let v = arg(args, 0);
    if args.len() >= 2 {
        let base = check_int(args, 1, "tonumber")?;
        let s = v.as_str().unwrap_or_default().trim().to_string();
        return Ok(vec![i64::from_str_radix(&s, base as u32).map(Value::Integer).unwrap_or(Value::Nil)]);
    }
    Ok(vec![v.coerce_to_number().unwrap_or(Value::Nil)])
}

fn lua_print(ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let mut parts = Vec::with_capacity(args.len());
    for a in args {
        parts.push(ex.tostring(a)?);
    }
    println!("{}", parts.join("\t"));
    Ok(Vec::new())
}

fn lua_error(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let v = arg(args, 0);
    let level = opt_int(args, 1, 1);
    let value = match v {
        Value::Str(s) if level != 0 => Value::str(String::from_utf8_lossy(&s).to_string()),
        other => other,
    };
    Err(LuaError::Runtime(RuntimeError::GenericError(value)))
}

fn lua_assert(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    if arg(args, 0).truthy() {
        return Ok(args.to_vec());
    }
    let message = match arg(args, 1) {
        Value::Nil => None,
        other => Some(other.to_string()),
    };
    Err(LuaError::Runtime(RuntimeError::AssertionError { message }))
}

fn lua_pcall(ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    if args.is_empty() {
        return Err(arg_error("pcall", 0, "value", &Value::Nil));
    }
    match ex.call_function(args[0].clone(), &args[1..]) {
        Ok(mut results) => {
            let mut out = vec![Value::Bool(true)];
            out.append(&mut results);
            Ok(out)
        }
        Err(e) => Ok(vec![Value::Bool(false), e.into_value()]),
    }
}

fn lua_xpcall(ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    if args.len() < 2 {
        return Err(arg_error("xpcall", 1, "function", &Value::Nil));
    }
    let handler = args[1].clone();
    match ex.call_function(args[0].clone(), &args[2..]) {
        Ok(mut results) => {
            let mut out = vec![Value::Bool(true)];
            out.append(&mut results);
            Ok(out)
        }
        Err(e) => {
            let handled = ex.call_function(handler, &[e.into_value()])?;
            let mut out = vec![Value::Bool(false)];
            out.extend(handled);
            Ok(out)
        }
    }
}

fn lua_pairs(ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let t = check_table(args, 0, "pairs")?;
    if let Some(mm) = ex.state.get_table(t).and_then(|tb| tb.metatable).and_then(|mt| ex.state.get_table(mt).map(|m| m.get(&Value::str("__pairs")))) {
        if !mm.is_nil() {
            return ex.call_function(mm, &[arg(args, 0)]);
        }
    }
    Ok(vec![Value::native("next", lua_next), arg(args, 0), Value::Nil])
}

fn lua_ipairs(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    Ok(vec![Value::native("ipairs_iterator", ipairs_iterator), arg(args, 0), Value::Integer(0)])
}

fn ipairs_iterator(ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let t = check_table(args, 0, "ipairs")?;
    let i = check_int(args, 1, "ipairs")? + 1;
    let v = ex.state.get_table(t).map(|tb| tb.get(&Value::Integer(i))).unwrap_or(Value::Nil);
    if v.is_nil() {
        Ok(vec![Value::Nil])
    } else {
        Ok(vec![Value::Integer(i), v])
    }
}

fn lua_next(ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let t = check_table(args, 0, "next")?;
    let table = ex.state.get_table(t).cloned().unwrap_or_default();
    let entries = table.entries();
    let key = arg(args, 1);
    if key.is_nil() {
        return Ok(match entries.first() {
            Some((k, v)) => vec![k.clone(), v.clone()],
            None => vec![Value::Nil],
        });
    }
    let pos = entries.iter().position(|(k, _)| *k == key);
    match pos {
        Some(i) if i + 1 < entries.len() => {
            let (k, v) = &entries[i + 1];
            Ok(vec![k.clone(), v.clone()])
        }
        _ => Ok(vec![Value::Nil]),
    }
}

fn lua_select(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    match arg(args, 0) {
        Value::Str(s) if &*s == b"#" => Ok(vec![Value::Integer(args.len() as i64 - 1)]),
        other => {
            let n = other.as_i64().ok_or_else(|| arg_error("select", 0, "number", &other))?;
            if n < 1 {
                return Err(arg_error("select", 0, "index out of range", &other));
            }
            Ok(args.iter().skip(n as usize).cloned().collect())
        }
    }
}

fn lua_unpack(ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
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

fn lua_setmetatable(ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let t = check_table(args, 0, "setmetatable")?;
    if let Some(mt) = ex.state.get_table(t).and_then(|tb| tb.metatable) {
        let protected = ex.state.get_table(mt).map(|m| m.get(&Value::str("__metatable")).truthy()).unwrap_or(false);
        if protected {
            return Err(LuaError::Runtime(RuntimeError::ProtectedMetatable));
        }
    }
    let new_mt = match arg(args, 1) {
        Value::Table(mt) => Some(mt),
        Value::Nil => None,
        other => return Err(arg_error("setmetatable", 1, "nil or table", &other)),
    };
    ex.state.get_table_mut(t).unwrap().metatable = new_mt;
    Ok(vec![arg(args, 0)])
}

fn lua_getmetatable(ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let t = check_table(args, 0, "getmetatable")?;
    match ex.state.get_table(t).and_then(|tb| tb.metatable) {
        Some(mt) => {
            let protected_field = ex.state.get_table(mt).map(|m| m.get(&Value::str("__metatable"))).unwrap_or(Value::Nil);
            if !protected_field.is_nil() {
                Ok(vec![protected_field])
            } else {
                Ok(vec![Value::Table(mt)])
            }
        }
        None => Ok(vec![Value::Nil]),
    }
}

fn lua_rawget(ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let t = check_table(args, 0, "rawget")?;
    Ok(vec![ex.state.get_table(t).map(|tb| tb.get(&arg(args, 1))).unwrap_or(Value::Nil)])
}

fn lua_rawset(ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let t = check_table(args, 0, "rawset")?;
    ex.state.get_table_mut(t).unwrap().set(arg(args, 1), arg(args, 2));
    Ok(vec![arg(args, 0)])
}

fn lua_rawlen(ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    match arg(args, 0) {
        Value::Table(t) => Ok(vec![Value::Integer(ex.state.get_table(t).map(|tb| tb.length()).unwrap_or(0))]),
        Value::Str(s) => Ok(vec![Value::Integer(s.len() as i64)]),
        other => Err(arg_error("rawlen", 0, "table or string", &other)),
    }
}

fn lua_rawequal(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    Ok(vec![Value::Bool(arg(args, 0) == arg(args, 1))])
}
