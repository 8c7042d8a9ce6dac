//! `string` library (SPEC_FULL §4.8). `find`/`match`/`gmatch`/`gsub` are
//! backed by the pattern engine in `crate::pattern`; the rest are direct
//! byte-slice operations.

use std::cell::RefCell;
use std::rc::Rc;

use super::args::*;
use crate::error::{LuaError, Result, RuntimeError};
use crate::executor::Executor;
use crate::heap::State;
use crate::pattern::{self, GMatchState};
use crate::value::Value;

pub fn install(state: &mut State) {
    let string_lib = state.alloc_table();
    {
        let t = state.get_table_mut(string_lib).unwrap();
        t.set(Value::str("len"), Value::native("len", len));
        t.set(Value::str("sub"), Value::native("sub", sub));
        t.set(Value::str("upper"), Value::native("upper", upper));
        t.set(Value::str("lower"), Value::native("lower", lower));
        t.set(Value::str("rep"), Value::native("rep", rep));
        t.set(Value::str("reverse"), Value::native("reverse", reverse));
        t.set(Value::str("byte"), Value::native("byte", byte));
        t.set(Value::str("char"), Value::native("char", char_fn));
        t.set(Value::str("format"), Value::native("format", format));
        t.set(Value::str("find"), Value::native("find", find));
        t.set(Value::str("match"), Value::native("match", match_fn));
        t.set(Value::str("gmatch"), Value::native("gmatch", gmatch));
        t.set(Value::str("gsub"), Value::native("gsub", gsub));
    }
    // `("x"):upper()` resolves through the string-type metatable's __index.
    let metatable = state.alloc_table();
    state.get_table_mut(metatable).unwrap().set(Value::str("__index"), Value::Table(string_lib));
    state.set_string_metatable(metatable);
    state.set_global("string", Value::Table(string_lib));
}

/// Lua's 1-based, negative-from-end index convention, clamped into `[1, len]`
/// (or `[1, len+1]` when `allow_past_end` for `sub`'s end argument).
fn normalize_index(i: i64, len: usize) -> i64 {
    if i >= 0 {
        i
    } else {
        (len as i64 + i + 1).max(0)
    }
}

fn len(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let s = check_string(args, 0, "len")?;
    Ok(vec![Value::Integer(s.len() as i64)])
}

fn sub(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let s = check_string(args, 0, "sub")?;
    let len = s.len();
    let i = normalize_index(opt_int(args, 1, 1), len).max(1);
    let j = normalize_index(if args.len() >= 3 { check_int(args, 2, "sub")? } else { -1 }, len).min(len as i64);
    if i > j {
        return Ok(vec![Value::str(Vec::new())]);
    }
    Ok(vec![Value::str(s[(i - 1) as usize..j as usize].to_vec())])
}

fn upper(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let s = check_string(args, 0, "upper")?;
    Ok(vec![Value::str(s.to_ascii_uppercase())])
}

fn lower(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let s = check_string(args, 0, "lower")?;
    Ok(vec![Value::str(s.to_ascii_lowercase())])
}

fn rep(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let s = check_string(args, 0, "rep")?;
    let n = check_int(args, 1, "rep")?.max(0) as usize;
    let sep = if args.len() >= 3 { check_string(args, 2, "rep")? } else { Vec::new() };
    if n == 0 {
        return Ok(vec![Value::str(Vec::new())]);
    }
    let mut out = Vec::with_capacity(s.len() * n);
    for i in 0..n {
        if i > 0 {
            out.extend_from_slice(&sep);
        }
        out.extend_from_slice(&s);
    }
    Ok(vec![Value::str(out)])
}

fn reverse(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let mut s = check_string(args, 0, "reverse")?;
    s.reverse();
    Ok(vec![Value::str(s)])
}

fn byte(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let s = check_string(args, 0, "byte")?;
    let len = s.len();
    let i = normalize_index(opt_int(args, 1, 1), len).max(1);
    let j = normalize_index(if args.len() >= 3 { check_int(args, 2, "byte")? } else { i }, len).min(len as i64);
    let mut out = Vec::new();
    let mut k = i;
    while k <= j {
        if k >= 1 && (k as usize) <= len {
            out.push(Value::Integer(s[(k - 1) as usize] as i64));
        }
        k += 1;
    }
    Ok(out)
}

fn char_fn(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(args.len());
    for i in 0..args.len() {
        let code = check_int(args, i, "char")?;
        out.push(code as u8);
    }
    Ok(vec![Value::str(out)])
}

fn format(ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let fmt = check_string(args, 0, "format")?;
    let mut out = Vec::new();
    let mut arg_idx = 1usize;
    let mut chars = fmt.iter().peekable();
    while let Some(&c) = chars.next() {
        if c != b'%' {
            out.push(c);
            continue;
        }
        let mut spec = vec![b'%'];
        while let Some(&&next) = chars.peek() {
            spec.push(next);
            chars.next();
            if next.is_ascii_alphabetic() || next == b'%' {
                break;
            }
        }
        let conv = *spec.last().unwrap();
        match conv {
            b'%' => out.push(b'%'),
            b'd' | b'i' => {
                let n = check_int(args, arg_idx, "format")?;
                arg_idx += 1;
                out.extend_from_slice(n.to_string().as_bytes());
            }
            b'x' => {
                let n = check_int(args, arg_idx, "format")?;
                arg_idx += 1;
                out.extend_from_slice(format!("{n:x}").as_bytes());
            }
            b'X' => {
                let n = check_int(args, arg_idx, "format")?;
                arg_idx += 1;
                out.extend_from_slice(format!("{n:X}").as_bytes());
            }
            b'f' | b'g' => {
                let n = check_number(args, arg_idx, "format")?;
                arg_idx += 1;
                out.extend_from_slice(format!("{n:.6}").as_bytes());
            }
            b's' => {
                let v = arg(args, arg_idx);
                arg_idx += 1;
                out.extend_from_slice(ex.tostring(&v)?.as_bytes());
            }
            b'q' => {
                let s = check_string(args, arg_idx, "format")?;
                arg_idx += 1;
                out.push(b'"');
                for b in s {
                    if b == b'"' || b == b'\\' {
                        out.push(b'\\');
                    }
                    out.push(b);
                }
                out.push(b'"');
            }
            b'c' => {
                let n = check_int(args, arg_idx, "format")?;
                arg_idx += 1;
                out.push(n as u8);
            }
            other => {
                return Err(LuaError::Runtime(RuntimeError::GenericError(Value::str(format!(
                    "invalid conversion '%{}' to 'format'",
                    other as char
                )))))
            }
        }
    }
    Ok(vec![Value::str(out)])
}

fn clamp_init(args: &[Value], idx: usize, len: usize) -> i64 {
    let init = opt_int(args, idx, 1);
    let normalized = normalize_index(init, len);
    (normalized.max(1) - 1).min(len as i64)
}

fn find(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let s = check_string(args, 0, "find")?;
    let p = check_string(args, 1, "find")?;
    let plain = arg(args, 3).truthy();
    let init = clamp_init(args, 2, s.len()) as usize;
    if plain || !p.iter().any(|b| b"^$*+?.([%-".contains(b)) {
        return Ok(match find_plain(&s, &p, init) {
            Some(pos) => vec![Value::Integer(pos as i64 + 1), Value::Integer((pos + p.len()) as i64)],
            None => vec![Value::Nil],
        });
    }
    match pattern::find(&s, &p, init)? {
        Some(m) => {
            let mut out = vec![Value::Integer(m.start as i64 + 1), Value::Integer(m.end as i64)];
            if !p.contains(&b'(') {
                return Ok(out);
            }
            out.extend(m.captures);
            Ok(out)
        }
        None => Ok(vec![Value::Nil]),
    }
}

fn find_plain(s: &[u8], needle: &[u8], init: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(init.min(s.len()));
    }
    s.get(init..)?.windows(needle.len()).position(|w| w == needle).map(|p| p + init)
}

fn match_fn(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let s = check_string(args, 0, "match")?;
    let p = check_string(args, 1, "match")?;
    let init = clamp_init(args, 2, s.len()) as usize;
    match pattern::find(&s, &p, init)? {
        Some(m) => Ok(m.captures),
        None => Ok(vec![Value::Nil]),
    }
}

fn gmatch(_ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let s = check_string(args, 0, "gmatch")?;
    let p = check_string(args, 1, "gmatch")?;
    let state = Rc::new(RefCell::new((s, p, GMatchState::new())));
    let iterator = move |_ex: &mut Executor, _args: &[Value]| -> Result<Vec<Value>> {
        let mut guard = state.borrow_mut();
        let (s, p, gm) = &mut *guard;
        match gm.next(s, p)? {
            Some(m) => Ok(m.captures),
            None => Ok(vec![Value::Nil]),
        }
    };
    Ok(vec![Value::native("gmatch_iterator", iterator)])
}

fn gsub(ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let s = check_string(args, 0, "gsub")?;
    let p = check_string(args, 1, "gsub")?;
    let repl = arg(args, 2);
    let max_n = if args.len() >= 4 { check_int(args, 3, "gsub")? } else { i64::MAX };

    let mut out = Vec::new();
    let mut pos = 0usize;
    let mut count = 0i64;
    while pos <= s.len() && count < max_n {
        match pattern::find(&s, &p, pos)? {
            Some(m) => {
                out.extend_from_slice(&s[pos..m.start]);
                let whole = &s[m.start..m.end];
                let replacement = build_replacement(ex, &repl, whole, &m.captures)?;
                out.extend_from_slice(&replacement);
                count += 1;
                pos = if m.end > m.start {
                    m.end
                } else {
                    if m.end < s.len() {
                        out.push(s[m.end]);
                    }
                    m.end + 1
                };
            }
            None => break,
        }
    }
    if pos <= s.len() {
        out.extend_from_slice(&s[pos.min(s.len())..]);
    }
    Ok(vec![Value::str(out), Value::Integer(count)])
}

fn build_replacement(ex: &mut Executor, repl: &Value, whole: &[u8], captures: &[Value]) -> Result<Vec<u8>> {
    match repl {
        Value::Str(template) => {
            let mut out = Vec::new();
            let mut chars = template.iter().peekable();
            while let Some(&c) = chars.next() {
                if c == b'%' {
                    if let Some(&&d) = chars.peek() {
                        chars.next();
                        if d == b'%' {
                            out.push(b'%');
                        } else if d == b'0' {
                            out.extend_from_slice(whole);
                        } else if d.is_ascii_digit() {
                            let idx = (d - b'0') as usize;
                            if let Some(v) = captures.get(idx - 1) {
                                out.extend_from_slice(v.to_string().as_bytes());
                            }
                        } else {
                            out.push(d);
                        }
                        continue;
                    }
                }
                out.push(c);
            }
            Ok(out)
        }
        Value::Table(t) => {
            let key = captures.first().cloned().unwrap_or(Value::str(whole.to_vec()));
            let v = ex.state.get_table(*t).map(|tb| tb.get(&key)).unwrap_or(Value::Nil);
            Ok(replacement_value_to_bytes(&v, whole))
        }
        f if f.is_function() => {
            let call_args = if captures.is_empty() { vec![Value::str(whole.to_vec())] } else { captures.to_vec() };
            let result = ex.call_function(f.clone(), &call_args)?;
            Ok(replacement_value_to_bytes(result.first().unwrap_or(&Value::Nil), whole))
        }
        _ => Ok(whole.to_vec()),
    }
}

fn replacement_value_to_bytes(v: &Value, fallback: &[u8]) -> Vec<u8> {
    match v {
        Value::Nil | Value::Bool(false) => fallback.to_vec(),
        other => other.to_string().into_bytes(),
    }
}
