//! luacore
//!
//! A from-scratch Lua 5.3 language core: lexer, Pratt parser, scope
//! resolver, register-based bytecode compiler, and a tree-walking executor,
//! embeddable as a library inside a host runtime (SPEC_FULL §1-§2).

pub mod arena;
pub mod ast;
pub mod compiler;
pub mod error;
pub mod executor;
pub mod heap;
pub mod lexer;
pub mod parser;
pub mod pattern;
pub mod reporter;
pub mod resolver;
pub mod stdlib;
pub mod value;

use std::rc::Rc;

pub use compiler::Prototype;
pub use error::{LuaError, Result};
pub use executor::Executor;
pub use heap::{CallFrameInfo, LuaLimits, State, VMConfig};
pub use stdlib::NewStateOptions;
pub use value::{TableRef, Value};

/// Strips a leading shebang line (`#!…\n`), per SPEC_FULL §6's source-input
/// contract.
fn strip_shebang(source: &str) -> &str {
    if let Some(rest) = source.strip_prefix("#!") {
        match rest.find('\n') {
            Some(idx) => &rest[idx + 1..],
            None => "",
        }
    } else {
        source
    }
}

/// `parse(source) -> Chunk | ParseError` (SPEC_FULL §6).
pub fn parse(source: &str) -> std::result::Result<ast::Block, error::ParseError> {
    parser::Parser::parse(strip_shebang(source))
}

/// `compile(chunk, options{source_name}) -> Prototype` (SPEC_FULL §6).
pub fn compile(chunk: &ast::Block, source_name: &str) -> std::result::Result<Prototype, error::CompileError> {
    compiler::Compiler::compile_chunk(chunk, source_name)
}

/// `execute(prototype, state) -> (results, state)` (SPEC_FULL §6). The
/// executor owns `state` for the call's duration and hands it back embedded
/// in the returned value.
pub fn execute(prototype: Rc<Prototype>, state: State, args: &[Value]) -> (Result<Vec<Value>>, State) {
    let mut exec = Executor::new(state);
    let result = exec.run_chunk(prototype, args);
    (result, exec.state)
}

/// `new_state(options) -> State` (SPEC_FULL §6, §4.12).
pub fn new_state(options: NewStateOptions) -> State {
    stdlib::new_state(options)
}

/// `register_function(state, name, callable)` (SPEC_FULL §6).
pub fn register_function(
    state: &mut State,
    name: impl Into<String>,
    f: impl Fn(&mut Executor, &[Value]) -> Result<Vec<Value>> + 'static,
) {
    state.register_function(name, f);
}

/// A path segment into nested tables/globals for `get`/`set` (SPEC_FULL §6).
#[derive(Debug, Clone)]
pub enum PathKey {
    Name(String),
    Index(i64),
}

fn key_value(key: &PathKey) -> Value {
    match key {
        PathKey::Name(s) => Value::str(s.clone()),
        PathKey::Index(i) => Value::Integer(*i),
    }
}

/// `get(state, path)`: walks dotted/indexed global path segments, returning
/// `Nil` as soon as a non-table is encountered before the path ends.
pub fn get(state: &State, path: &[PathKey]) -> Value {
    if path.is_empty() {
        return Value::Nil;
    }
    let PathKey::Name(root) = &path[0] else {
        return Value::Nil;
    };
    let mut current = state.get_global(root);
    for key in &path[1..] {
        current = match current {
            Value::Table(t) => state.get_table(t).map(|tb| tb.get(&key_value(key))).unwrap_or(Value::Nil),
            _ => return Value::Nil,
        };
    }
    current
}

/// `set(state, path, value)`: like `get`, but the final segment is stored.
/// Intermediate tables are not auto-created; setting through a missing
/// intermediate path is a no-op.
pub fn set(state: &mut State, path: &[PathKey], value: Value) {
    if path.is_empty() {
        return;
    }
    let PathKey::Name(root) = &path[0] else { return };
    if path.len() == 1 {
        state.set_global(root.clone(), value);
        return;
    }
    let mut current = state.get_global(root);
    for key in &path[1..path.len() - 1] {
        current = match current {
            Value::Table(t) => state.get_table(t).map(|tb| tb.get(&key_value(key))).unwrap_or(Value::Nil),
            _ => return,
        };
    }
    if let Value::Table(t) = current {
        if let Some(tb) = state.get_table_mut(t) {
            tb.set(key_value(path.last().unwrap()), value);
        }
    }
}

/// `run(source, state) -> (results, state)`: the parse+compile+execute
/// composition for the common "just run this script" case (SPEC_FULL §6).
pub fn run(source: &str, state: State, args: &[Value]) -> (Result<Vec<Value>>, State) {
    let chunk = match parse(source) {
        Ok(c) => c,
        Err(e) => return (Err(LuaError::Parse(e)), state),
    };
    let prototype = match compile(&chunk, "chunk") {
        Ok(p) => Rc::new(p),
        Err(e) => return (Err(LuaError::Compile(e)), state),
    };
    execute(prototype, state, args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ok(src: &str) -> Vec<Value> {
        let options = NewStateOptions { sandboxed: true, ..Default::default() };
        let state = new_state(options);
        let (result, _state) = run(src, state, &[]);
        result.unwrap()
    }

    #[test]
    fn runs_arithmetic_end_to_end() {
        assert_eq!(run_ok("return 1 + 2 * 3"), vec![Value::Integer(7)]);
    }

    #[test]
    fn string_metatable_is_wired() {
        assert_eq!(run_ok(r#"return ("abc"):upper()"#), vec![Value::str("ABC")]);
    }

    #[test]
    fn pcall_catches_runtime_errors() {
        let results = run_ok(r#"local ok, err = pcall(function() error("boom") end); return ok, err"#);
        assert_eq!(results, vec![Value::Bool(false), Value::str("boom")]);
    }

    #[test]
    fn pattern_gsub_end_to_end() {
        let results = run_ok(r#"return string.gsub("hello world", "(%w+)", "<%1>")"#);
        assert_eq!(results, vec![Value::str("<hello> <world>"), Value::Integer(2)]);
    }

    #[test]
    fn shebang_is_stripped() {
        assert_eq!(run_ok("#!/usr/bin/env lua\nreturn 1"), vec![Value::Integer(1)]);
    }
}
