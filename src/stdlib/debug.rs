//! `debug` library: `traceback` only, built from the executor's call stack
//! (SPEC_FULL §4.8, §4.11).

use super::args::*;
use crate::error::Result;
use crate::executor::Executor;
use crate::heap::State;
use crate::value::Value;

pub fn install(state: &mut State) {
    let debug_lib = state.alloc_table();
    state.get_table_mut(debug_lib).unwrap().set(Value::str("traceback"), Value::native("traceback", traceback));
    state.set_global("debug", Value::Table(debug_lib));
}

fn traceback(ex: &mut Executor, args: &[Value]) -> Result<Vec<Value>> {
    let message = match arg(args, 0) {
        Value::Nil => String::new(),
        other => format!("{other}\n"),
    };
    let mut out = String::from("stack traceback:");
    for frame in ex.state.call_stack.iter().rev() {
        out.push_str(&format!(
            "\n\t{}:{}: in {}",
            frame.source,
            frame.line,
            frame.name.as_deref().unwrap_or("?")
        ));
    }
    Ok(vec![Value::str(format!("{message}{out}"))])
}
