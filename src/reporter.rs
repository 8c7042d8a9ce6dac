//! Human-facing error report formatting (C10): turns a `Position` plus a
//! message into a multi-line report with a source context window and a caret,
//! the way a CLI frontend over this crate would print a parse failure.

use crate::error::{LuaError, ParseError, Position};

#[derive(Debug, Clone, Copy)]
pub struct ReportStyle {
    pub color: bool,
    pub context_lines: u32,
}

impl Default for ReportStyle {
    fn default() -> Self {
        ReportStyle { color: true, context_lines: 2 }
    }
}

const RED: &str = "\x1b[31m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// Renders `err` against `source`/`chunk_name` as a multi-line diagnostic:
/// a header, a `context_lines`-line window around the failing position, a
/// caret under the offending column, and an optional suggestion line.
pub fn report(err: &LuaError, source: &str, chunk_name: &str, style: ReportStyle) -> String {
    match err {
        LuaError::Lex(e) => render(chunk_name, source, e.position(), &e.to_string(), None, style),
        LuaError::Parse(e) => {
            let suggestion = e.suggestion().map(str::to_string).or_else(|| suggest_for(e));
            render(chunk_name, source, e.position(), &e.to_string(), suggestion.as_deref(), style)
        }
        LuaError::Compile(e) => render(chunk_name, source, Position::default(), &e.to_string(), None, style),
        LuaError::Runtime(e) => format!("runtime error: {e}"),
    }
}

fn render(chunk: &str, source: &str, pos: Position, message: &str, suggestion: Option<&str>, style: ReportStyle) -> String {
    let lines: Vec<&str> = source.lines().collect();
    let mut out = String::new();

    if style.color {
        out.push_str(&format!("{BOLD}{RED}error:{RESET} {message}\n"));
    } else {
        out.push_str(&format!("error: {message}\n"));
    }
    out.push_str(&format!("  --> {chunk}:{}:{}\n", pos.line, pos.column));

    if pos.line >= 1 {
        let target = pos.line as usize;
        let lo = target.saturating_sub(style.context_lines as usize).max(1);
        let hi = (target + style.context_lines as usize).min(lines.len());
        let gutter_width = hi.to_string().len();
        for n in lo..=hi {
            if let Some(text) = lines.get(n - 1) {
                out.push_str(&format!("{:>width$} | {}\n", n, text, width = gutter_width));
                if n == target {
                    let col = pos.column.saturating_sub(1) as usize;
                    let caret_line = format!("{:>width$} | {}^", "", " ".repeat(col), width = gutter_width);
                    if style.color {
                        out.push_str(&format!("{RED}{BOLD}{caret_line}{RESET}\n"));
                    } else {
                        out.push_str(&caret_line);
                        out.push('\n');
                    }
                }
            }
        }
    }

    if let Some(s) = suggestion {
        out.push_str(&format!("  = help: {s}\n"));
    }
    out
}

/// Produces a short `suggestion` string for the common "missing `end`" class
/// of `ParseError::UnclosedDelimiter`, surfaced through `report`.
pub fn suggest_for(err: &ParseError) -> Option<String> {
    match err {
        ParseError::UnclosedDelimiter { kind, open_pos, .. } => {
            Some(format!("'{kind}' opened at line {} is never closed", open_pos.line))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompileError;

    #[test]
    fn renders_header_and_location() {
        let err = LuaError::Compile(CompileError::BreakOutsideLoop);
        let text = report(&err, "break\n", "chunk", ReportStyle { color: false, context_lines: 1 });
        assert!(text.contains("error:"));
        assert!(text.contains("chunk:0:0"));
    }

    #[test]
    fn context_window_includes_surrounding_lines() {
        let err = LuaError::Parse(ParseError::InvalidSyntax {
            message: "bad thing".to_string(),
            position: Position::new(2, 3, 0),
        });
        let source = "local a = 1\nlocal b = \nlocal c = 3\n";
        let text = report(&err, source, "chunk", ReportStyle { color: false, context_lines: 1 });
        assert!(text.contains("local a = 1"));
        assert!(text.contains("local c = 3"));
        assert!(text.contains('^'));
    }
}
