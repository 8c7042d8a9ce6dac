//! Standard library install orchestration (SPEC_FULL §4.8, §4.12).
//!
//! Each sub-module registers one namespace table (or, for `base`, a set of
//! top-level globals) the way the grounding codebase wires its command
//! tables into a single dispatch surface at startup.

mod base;
mod debug;
mod math;
mod os;
mod string;
mod table;

use crate::heap::{State, VMConfig};
use crate::value::Value;

/// Construction-time choices for `new_state` beyond the bare `VMConfig`
/// (SPEC_FULL §4.12).
#[derive(Debug, Clone, Default)]
pub struct NewStateOptions {
    pub vm: VMConfig,
    pub sandboxed: bool,
    pub exclude_paths: Vec<Vec<String>>,
}

pub fn new_state(options: NewStateOptions) -> State {
    let mut state = State::new(options.vm);
    if options.sandboxed {
        install_all(&mut state);
    }
    for path in &options.exclude_paths {
        remove_path(&mut state, path);
    }
    state
}

/// Installs every namespace in the SPEC_FULL §4.8 slice. Exposed separately
/// from `new_state` so a host can opt into the full library without also
/// wanting the sandboxed convenience constructor.
pub fn install_all(state: &mut State) {
    base::install(state);
    string::install(state);
    math::install(state);
    table::install(state);
    os::install(state);
    debug::install(state);
}

fn remove_path(state: &mut State, path: &[String]) {
    if path.is_empty() {
        return;
    }
    if path.len() == 1 {
        state.globals.remove(&path[0]);
        return;
    }
    let mut current = state.get_global(&path[0]);
    for segment in &path[1..path.len() - 1] {
        current = match current {
            Value::Table(t) => state.get_table(t).map(|tb| tb.get(&Value::str(segment.clone()))).unwrap_or(Value::Nil),
            _ => return,
        };
    }
    if let Value::Table(t) = current {
        if let Some(tb) = state.get_table_mut(t) {
            tb.set(Value::str(path.last().unwrap().clone()), Value::Nil);
        }
    }
}

/// Shared argument-checking helpers used by every namespace module.
pub(crate) mod args {
    use crate::error::{LuaError, Result, RuntimeError};
    use crate::value::Value;

    pub fn arg(args: &[Value], i: usize) -> Value {
        args.get(i).cloned().unwrap_or(Value::Nil)
    }

    pub fn check_string(args: &[Value], i: usize, func: &str) -> Result<Vec<u8>> {
        match arg(args, i) {
            Value::Str(s) => Ok(s.to_vec()),
            Value::Integer(n) => Ok(n.to_string().into_bytes()),
            Value::Float(n) => Ok(n.to_string().into_bytes()),
            other => Err(arg_error(func, i, "string", &other)),
        }
    }

    pub fn check_number(args: &[Value], i: usize, func: &str) -> Result<f64> {
        arg(args, i).coerce_to_number().and_then(|v| v.as_f64()).ok_or_else(|| arg_error(func, i, "number", &arg(args, i)))
    }

    pub fn check_int(args: &[Value], i: usize, func: &str) -> Result<i64> {
        arg(args, i).coerce_to_number().and_then(|v| v.as_i64()).ok_or_else(|| arg_error(func, i, "number", &arg(args, i)))
    }

    pub fn opt_int(args: &[Value], i: usize, default: i64) -> i64 {
        arg(args, i).as_i64().unwrap_or(default)
    }

    pub fn check_table(args: &[Value], i: usize, func: &str) -> Result<crate::value::TableRef> {
        match arg(args, i) {
            Value::Table(t) => Ok(t),
            other => Err(arg_error(func, i, "table", &other)),
        }
    }

    pub fn arg_error(func: &str, i: usize, expected: &str, got: &Value) -> LuaError {
        LuaError::Runtime(RuntimeError::ArgumentError {
            function: func.to_string(),
            arg_num: i + 1,
            expected: expected.to_string(),
            got: Some(got.type_name().to_string()),
            details: None,
        })
    }
}
