//! `os` library: `time`/`clock` only, per the Non-goals boundary excluding
//! filesystem and environment access (SPEC_FULL §4.8).

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::executor::Executor;
use crate::heap::State;
use crate::value::Value;

pub fn install(state: &mut State) {
    let os_lib = state.alloc_table();
    {
        let t = state.get_table_mut(os_lib).unwrap();
        t.set(Value::str("time"), Value::native("time", time));
        t.set(Value::str("clock"), Value::native("clock", clock));
    }
    state.set_global("os", Value::Table(os_lib));
}

fn time(_ex: &mut Executor, _args: &[Value]) -> Result<Vec<Value>> {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0);
    Ok(vec![Value::Integer(secs)])
}

fn clock(_ex: &mut Executor, _args: &[Value]) -> Result<Vec<Value>> {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0);
    Ok(vec![Value::Float(secs)])
}
