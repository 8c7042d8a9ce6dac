//! Error taxonomy for the Lua core.
//!
//! Lex/parse/compile errors are returned by value from their producing stage.
//! Runtime errors unwind the executor's call stack until a host boundary or a
//! `pcall` frame catches them.

use crate::value::Value;
use thiserror::Error;

/// A source position, 1-based line/column plus a byte offset into the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub line: u32,
    pub column: u32,
    pub byte_offset: u32,
}

impl Position {
    pub fn new(line: u32, column: u32, byte_offset: u32) -> Self {
        Position { line, column, byte_offset }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Errors raised while turning source bytes into a token stream.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LexError {
    #[error("unexpected character '{ch}' at {pos}")]
    UnexpectedCharacter { ch: char, pos: Position },

    #[error("unclosed string starting at {pos}")]
    UnclosedString { pos: Position },

    #[error("unclosed long string starting at {pos}")]
    UnclosedLongString { pos: Position },

    #[error("unclosed long comment starting at {pos}")]
    UnclosedComment { pos: Position },

    #[error("invalid hex number at {pos}")]
    InvalidHexNumber { pos: Position },

    #[error("invalid number at {pos}")]
    InvalidNumber { pos: Position },
}

impl LexError {
    pub fn position(&self) -> Position {
        match self {
            LexError::UnexpectedCharacter { pos, .. }
            | LexError::UnclosedString { pos }
            | LexError::UnclosedLongString { pos }
            | LexError::UnclosedComment { pos }
            | LexError::InvalidHexNumber { pos }
            | LexError::InvalidNumber { pos } => *pos,
        }
    }
}

/// Errors raised while building the AST from a token stream.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error("unexpected token '{got}' at {position}{}", expected.as_ref().map(|e| format!(", expected {e}")).unwrap_or_default())]
    UnexpectedToken {
        got: String,
        expected: Option<String>,
        position: Position,
        suggestion: Option<String>,
    },

    #[error("unexpected end of input while parsing {context} at {position}")]
    UnexpectedEnd { context: String, position: Position },

    #[error("unclosed '{kind}' opened at {open_pos}")]
    UnclosedDelimiter {
        kind: String,
        open_pos: Position,
        close_pos: Option<Position>,
    },

    #[error("invalid syntax at {position}: {message}")]
    InvalidSyntax { message: String, position: Position },

    #[error(transparent)]
    Lex(#[from] LexError),
}

impl ParseError {
    pub fn position(&self) -> Position {
        match self {
            ParseError::UnexpectedToken { position, .. } => *position,
            ParseError::UnexpectedEnd { position, .. } => *position,
            ParseError::UnclosedDelimiter { open_pos, .. } => *open_pos,
            ParseError::InvalidSyntax { position, .. } => *position,
            ParseError::Lex(e) => e.position(),
        }
    }

    pub fn suggestion(&self) -> Option<&str> {
        match self {
            ParseError::UnexpectedToken { suggestion, .. } => suggestion.as_deref(),
            _ => None,
        }
    }
}

/// Rare errors raised while lowering an AST to a `Prototype`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CompileError {
    #[error("invalid prototype: {0}")]
    MalformedPrototype(String),

    #[error("goto '{label}' has no visible target")]
    UnresolvedLabel { label: String },

    #[error("'break' outside a loop")]
    BreakOutsideLoop,

    #[error("cannot jump into the scope of local '{0}'")]
    JumpIntoLocalScope(String),
}

/// Runtime errors, raised while the executor is running a `Prototype`.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("attempt to perform arithmetic on a {got_type} value ({operation})")]
    TypeError { operation: String, got_type: String },

    #[error("attempt to {op} a '{}' with a '{}'", values.0, values.1)]
    ArithError { op: String, values: (String, String) },

    #[error("attempt to index a nil value")]
    IndexError { value: Value },

    #[error("bad argument #{arg_num} to '{function}' ({expected} expected{})", got.as_ref().map(|g| format!(", got {g}")).unwrap_or_default())]
    ArgumentError {
        function: String,
        arg_num: usize,
        expected: String,
        got: Option<String>,
        details: Option<String>,
    },

    #[error("assertion failed!{}", message.as_ref().map(|m| format!(" {m}")).unwrap_or_default())]
    AssertionError { message: Option<String> },

    #[error("{0}")]
    GenericError(Value),

    #[error("stack overflow")]
    StackOverflow,

    #[error("{0} instructions executed, instruction limit exceeded")]
    InstructionLimit(u64),

    #[error("memory limit exceeded")]
    MemoryLimit,

    #[error("attempt to call a non-function value")]
    NotCallable,

    #[error("cannot change a protected metatable")]
    ProtectedMetatable,
}

impl PartialEq for RuntimeError {
    fn eq(&self, other: &Self) -> bool {
        format!("{self}") == format!("{other}")
    }
}

/// Top level error type threaded through every entry point in `lib.rs`.
#[derive(Debug, Clone, Error)]
pub enum LuaError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

pub type Result<T> = std::result::Result<T, LuaError>;

impl LuaError {
    /// The value a `pcall` should see: a string for most error kinds, or the
    /// original value for `error(v)` with a non-string `v`.
    pub fn into_value(self) -> Value {
        match self {
            LuaError::Runtime(RuntimeError::GenericError(v)) => v,
            other => Value::str(other.to_string()),
        }
    }
}
