//! End-to-end script-execution tests: parse + compile + execute a literal
//! script and assert on the returned values, covering the scenarios listed
//! in SPEC_FULL §8.

use luacore::stdlib::NewStateOptions;
use luacore::Value;

fn run(src: &str) -> Vec<Value> {
    let state = luacore::new_state(NewStateOptions { sandboxed: true, ..Default::default() });
    let (result, _state) = luacore::run(src, state, &[]);
    result.expect("script should execute without error")
}

#[test]
fn arithmetic_precedence() {
    assert_eq!(run("return 1 + 2 * 3"), vec![Value::Integer(7)]);
}

#[test]
fn table_length_and_indexing() {
    assert_eq!(run("local t={1,2,3}; return #t + t[2]"), vec![Value::Integer(5)]);
}

#[test]
fn upvalue_mutation_through_open_cells() {
    let src = "local function mk(n) return function() n=n+1; return n end end\nlocal c=mk(10); c(); c(); return c()";
    assert_eq!(run(src), vec![Value::Integer(13)]);
}

#[test]
fn numeric_for_loop_accumulation() {
    assert_eq!(run("local s=0; for i=1,10 do s=s+i end; return s"), vec![Value::Integer(55)]);
}

#[test]
fn gsub_with_capture_template() {
    let results = run(r#"return string.gsub("hello world", "(%w+)", "<%1>")"#);
    assert_eq!(results, vec![Value::str("<hello> <world>"), Value::Integer(2)]);
}

#[test]
fn global_recursion() {
    let src = "factorial = function(n) if n<=1 then return 1 end; return n*factorial(n-1) end; return factorial(5)";
    assert_eq!(run(src), vec![Value::Integer(120)]);
}

#[test]
fn string_type_metatable_method_call() {
    assert_eq!(run(r#"return ("abc"):upper()"#), vec![Value::str("ABC")]);
}

#[test]
fn pcall_catches_runtime_error() {
    let src = r#"local ok, err = pcall(function() error("boom") end); return ok, err"#;
    assert_eq!(run(src), vec![Value::Bool(false), Value::str("boom")]);
}

#[test]
fn short_circuit_and_skips_right_side_effect() {
    let src = "local hit=false; local function f() hit=true; return true end\nlocal x = false and f(); return hit";
    assert_eq!(run(src), vec![Value::Bool(false)]);
}

#[test]
fn short_circuit_or_skips_right_side_effect() {
    let src = "local hit=false; local function f() hit=true; return true end\nlocal x = true or f(); return hit";
    assert_eq!(run(src), vec![Value::Bool(false)]);
}

#[test]
fn integer_float_subtype_preservation() {
    let src = "return math.type(1+2), math.type(1/2), math.type(2^2)";
    assert_eq!(run(src), vec![Value::str("integer"), Value::str("float"), Value::str("float")]);
}

#[test]
fn closures_from_same_literal_share_upvalue_cell() {
    let src = r#"
        local function counter()
            local n = 0
            local function inc() n = n + 1; return n end
            local function peek() return n end
            return inc, peek
        end
        local inc, peek = counter()
        inc(); inc()
        return peek()
    "#;
    assert_eq!(run(src), vec![Value::Integer(2)]);
}

#[test]
fn tables_are_reference_shared() {
    assert_eq!(run("local a={}; local b=a; b.x=1; return a.x"), vec![Value::Integer(1)]);
}

#[test]
fn metatable_index_function_fallback() {
    let src = r#"
        local defaults = setmetatable({}, { __index = function(_, k) return "missing:" .. k end })
        return defaults.anything
    "#;
    assert_eq!(run(src), vec![Value::str("missing:anything")]);
}

#[test]
fn generic_for_over_ipairs() {
    let src = "local sum=0; for i,v in ipairs({10,20,30}) do sum = sum + v end; return sum";
    assert_eq!(run(src), vec![Value::Integer(60)]);
}

#[test]
fn string_find_and_match() {
    let src = r#"
        local s, e = string.find("hello world", "wor")
        local word = string.match("age: 42", "%d+")
        return s, e, word
    "#;
    assert_eq!(run(src), vec![Value::Integer(7), Value::Integer(9), Value::str("42")]);
}

#[test]
fn varargs_forward_through_call() {
    let src = "local function sum(...) local s=0; for _,v in ipairs({...}) do s=s+v end; return s end\nreturn sum(1,2,3,4)";
    assert_eq!(run(src), vec![Value::Integer(10)]);
}
