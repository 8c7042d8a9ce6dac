//! Lua pattern matching (C8): a recursive-backtracking matcher over the
//! pattern mini-language used by `string.find`/`match`/`gmatch`/`gsub`.
//!
//! There is no teacher module for this: Lua patterns have no counterpart in
//! the grounding codebase's command dispatch, so the matcher below is new
//! code written in the crate's established style (byte-oriented, small
//! recursive functions, no external regex dependency, matching Lua 5.3's
//! reference implementation behavior).

use crate::error::{LuaError, Result, RuntimeError};
use crate::value::Value;

const MAX_CAPTURES: usize = 32;
/// Sentinel capture length meaning "position capture" (`()`), matching the
/// reference implementation's use of a distinguished marker value.
const CAP_POSITION: isize = -2;
const CAP_UNFINISHED: isize = -1;

#[derive(Clone, Copy)]
struct Capture {
    start: usize,
    len: isize,
}

struct MatchState<'a> {
    src: &'a [u8],
    pat: &'a [u8],
    captures: Vec<Capture>,
}

impl<'a> MatchState<'a> {
    fn new(src: &'a [u8], pat: &'a [u8]) -> Self {
        MatchState { src, pat, captures: Vec::new() }
    }

    fn do_match(&mut self, mut s: usize, mut p: usize) -> Result<Option<usize>> {
        loop {
            if p >= self.pat.len() {
                return Ok(Some(s));
            }
            match self.pat[p] {
                b'(' => {
                    return if self.pat.get(p + 1) == Some(&b')') {
                        self.start_capture(s, p + 2, CAP_POSITION)
                    } else {
                        self.start_capture(s, p + 1, CAP_UNFINISHED)
                    };
                }
                b')' => return self.end_capture(s, p + 1),
                b'$' if p + 1 == self.pat.len() => {
                    return Ok(if s == self.src.len() { Some(s) } else { None });
                }
                b'%' if self.pat.get(p + 1) == Some(&b'b') => {
                    return match self.match_balance(s, p + 2)? {
                        Some(ns) => {
                            s = ns;
                            p += 4;
                            continue;
                        }
                        None => Ok(None),
                    };
                }
                b'%' if self.pat.get(p + 1) == Some(&b'f') => {
                    let (set_end,) = (self.class_end(p + 2)?,);
                    let prev = if s == 0 { 0u8 } else { self.src[s - 1] };
                    let cur = if s < self.src.len() { self.src[s] } else { 0u8 };
                    if !self.match_class_set(prev, p + 2, set_end) && self.match_class_set(cur, p + 2, set_end) {
                        p = set_end;
                        continue;
                    }
                    return Ok(None);
                }
                b'%' if self.pat.get(p + 1).map(|c| c.is_ascii_digit()).unwrap_or(false) => {
                    let idx = (self.pat[p + 1] - b'0') as usize;
                    return match self.match_capture_back(s, idx)? {
                        Some(ns) => {
                            s = ns;
                            p += 2;
                            continue;
                        }
                        None => Ok(None),
                    };
                }
                _ => {}
            }

            let ep = self.class_end(p)?;
            let matches_here = s < self.src.len() && self.single_match(self.src[s], p, ep);
            match self.pat.get(ep) {
                Some(b'?') => {
                    if matches_here {
                        if let Some(r) = self.do_match(s + 1, ep + 1)? {
                            return Ok(Some(r));
                        }
                    }
                    p = ep + 1;
                    continue;
                }
                Some(b'*') => return self.max_expand(s, p, ep),
                Some(b'+') => {
                    return if matches_here { self.max_expand(s + 1, p, ep) } else { Ok(None) };
                }
                Some(b'-') => return self.min_expand(s, p, ep),
                _ => {
                    if !matches_here {
                        return Ok(None);
                    }
                    s += 1;
                    p = ep;
                    continue;
                }
            }
        }
    }

    fn start_capture(&mut self, s: usize, p: usize, what: isize) -> Result<Option<usize>> {
        if self.captures.len() >= MAX_CAPTURES {
            return Err(too_many_captures());
        }
        self.captures.push(Capture { start: s, len: what });
        let result = self.do_match(s, p)?;
        if result.is_none() {
            self.captures.pop();
        }
        Ok(result)
    }

    fn end_capture(&mut self, s: usize, p: usize) -> Result<Option<usize>> {
        let idx = self
            .captures
            .iter()
            .rposition(|c| c.len == CAP_UNFINISHED)
            .ok_or_else(invalid_pattern_capture)?;
        self.captures[idx].len = (s - self.captures[idx].start) as isize;
        let result = self.do_match(s, p)?;
        if result.is_none() {
            self.captures[idx].len = CAP_UNFINISHED;
        }
        Ok(result)
    }

    fn match_capture_back(&mut self, s: usize, idx: usize) -> Result<Option<usize>> {
        if idx == 0 || idx > self.captures.len() {
            return Err(invalid_pattern_capture());
        }
        let cap = self.captures[idx - 1];
        if cap.len < 0 {
            return Err(invalid_pattern_capture());
        }
        let captured = &self.src[cap.start..cap.start + cap.len as usize];
        if self.src[s..].starts_with(captured) {
            Ok(Some(s + captured.len()))
        } else {
            Ok(None)
        }
    }

    fn match_balance(&mut self, s: usize, p: usize) -> Result<Option<usize>> {
        if p + 1 >= self.pat.len() {
            return Err(malformed_pattern("missing arguments to '%b'"));
        }
        if s >= self.src.len() || self.src[s] != self.pat[p] {
            return Ok(None);
        }
        let (open, close) = (self.pat[p], self.pat[p + 1]);
        let mut depth = 1i32;
        let mut i = s + 1;
        while i < self.src.len() {
            if self.src[i] == close {
                depth -= 1;
                if depth == 0 {
                    return Ok(Some(i + 1));
                }
            } else if self.src[i] == open {
                depth += 1;
            }
            i += 1;
        }
        Ok(None)
    }

    fn max_expand(&mut self, s: usize, p: usize, ep: usize) -> Result<Option<usize>> {
        let mut count = 0usize;
        while s + count < self.src.len() && self.single_match(self.src[s + count], p, ep) {
            count += 1;
        }
        loop {
            if let Some(r) = self.do_match(s + count, ep + 1)? {
                return Ok(Some(r));
            }
            if count == 0 {
                return Ok(None);
            }
            count -= 1;
        }
    }

    fn min_expand(&mut self, mut s: usize, p: usize, ep: usize) -> Result<Option<usize>> {
        loop {
            if let Some(r) = self.do_match(s, ep + 1)? {
                return Ok(Some(r));
            }
            if s < self.src.len() && self.single_match(self.src[s], p, ep) {
                s += 1;
            } else {
                return Ok(None);
            }
        }
    }

    /// Returns the index just past the single pattern item starting at `p`
    /// (a literal byte, `%x` class escape, or a `[...]` set).
    fn class_end(&self, p: usize) -> Result<usize> {
        let mut p = p;
        match self.pat.get(p) {
            None => Err(malformed_pattern("malformed pattern (ends with '%')")),
            Some(b'%') => {
                if p + 1 >= self.pat.len() {
                    Err(malformed_pattern("malformed pattern (ends with '%')"))
                } else {
                    Ok(p + 2)
                }
            }
            Some(b'[') => {
                p += 1;
                if self.pat.get(p) == Some(&b'^') {
                    p += 1;
                }
                // The first byte of the set may be a literal ']'; the set only
                // closes on a later, unescaped ']'.
                loop {
                    if p >= self.pat.len() {
                        return Err(malformed_pattern("malformed pattern (missing ']')"));
                    }
                    let c = self.pat[p];
                    p += 1;
                    if c == b'%' {
                        if p >= self.pat.len() {
                            return Err(malformed_pattern("malformed pattern (ends with '%')"));
                        }
                        p += 1;
                    }
                    if self.pat.get(p) == Some(&b']') {
                        break;
                    }
                }
                Ok(p + 1)
            }
            Some(_) => Ok(p + 1),
        }
    }

    fn single_match(&self, c: u8, p: usize, ep: usize) -> bool {
        match self.pat[p] {
            b'.' => true,
            b'%' => match_class(c, self.pat[p + 1]),
            b'[' => self.match_class_set(c, p, ep),
            pc => pc == c,
        }
    }

    /// Matches `c` against a `[...]` set spanning `pat[start..end)`, where
    /// `start` points at `[` and `end` is one past the closing `]`.
    fn match_class_set(&self, c: u8, start: usize, end: usize) -> bool {
        let mut p = start + 1;
        let negate = self.pat.get(p) == Some(&b'^');
        if negate {
            p += 1;
        }
        let mut found = false;
        while p < end - 1 {
            if self.pat[p] == b'%' {
                p += 1;
                if match_class(c, self.pat[p]) {
                    found = true;
                }
                p += 1;
            } else if p + 2 < end - 1 && self.pat[p + 1] == b'-' {
                if self.pat[p] <= c && c <= self.pat[p + 2] {
                    found = true;
                }
                p += 3;
            } else {
                if self.pat[p] == c {
                    found = true;
                }
                p += 1;
            }
        }
        found != negate
    }
}

fn match_class(c: u8, class: u8) -> bool {
    let result = match class.to_ascii_lowercase() {
        b'a' => c.is_ascii_alphabetic(),
        b'd' => c.is_ascii_digit(),
        b'l' => c.is_ascii_lowercase(),
        b'u' => c.is_ascii_uppercase(),
        b's' => c.is_ascii_whitespace(),
        b'w' => c.is_ascii_alphanumeric(),
        b'c' => c.is_ascii_control(),
        b'p' => c.is_ascii_punctuation(),
        b'x' => c.is_ascii_hexdigit(),
        b'g' => c.is_ascii_graphic(),
        other => return c == other,
    };
    if class.is_ascii_uppercase() {
        !result
    } else {
        result
    }
}

/// One successful match: the overall `[start, end)` span plus any explicit
/// captures (or, with no explicit captures, the whole span as capture 0).
pub struct MatchResult {
    pub start: usize,
    pub end: usize,
    pub captures: Vec<Value>,
}

fn captures_to_values(ms: &MatchState, whole_start: usize, whole_end: usize) -> Vec<Value> {
    if ms.captures.is_empty() {
        return vec![Value::str(ms.src[whole_start..whole_end].to_vec())];
    }
    ms.captures
        .iter()
        .map(|c| {
            if c.len == CAP_POSITION {
                Value::Integer(c.start as i64 + 1)
            } else {
                Value::str(ms.src[c.start..c.start + c.len.max(0) as usize].to_vec())
            }
        })
        .collect()
}

/// Runs `pattern` against `src` starting the search no earlier than `init`
/// (both already clamped into range by the caller), returning the first match.
pub fn find(src: &[u8], pattern: &[u8], init: usize) -> Result<Option<MatchResult>> {
    let anchored = pattern.first() == Some(&b'^');
    let pat = if anchored { &pattern[1..] } else { pattern };
    let mut s = init;
    loop {
        let mut ms = MatchState::new(src, pat);
        if let Some(end) = ms.do_match(s, 0)? {
            let captures = captures_to_values(&ms, s, end);
            return Ok(Some(MatchResult { start: s, end, captures }));
        }
        if anchored || s >= src.len() {
            return Ok(None);
        }
        s += 1;
    }
}

/// Iterative `gmatch` cursor: repeated calls advance past the previous match,
/// guaranteeing forward progress on an empty match (Lua 5.3 semantics).
pub struct GMatchState {
    pos: usize,
}

impl GMatchState {
    pub fn new() -> Self {
        GMatchState { pos: 0 }
    }

    pub fn next(&mut self, src: &[u8], pattern: &[u8]) -> Result<Option<MatchResult>> {
        if self.pos > src.len() {
            return Ok(None);
        }
        match find(src, pattern, self.pos)? {
            Some(m) => {
                self.pos = if m.end > m.start { m.end } else { m.end + 1 };
                Ok(Some(m))
            }
            None => {
                self.pos = src.len() + 1;
                Ok(None)
            }
        }
    }
}

fn too_many_captures() -> LuaError {
    LuaError::Runtime(RuntimeError::GenericError(Value::str("too many captures")))
}

fn invalid_pattern_capture() -> LuaError {
    LuaError::Runtime(RuntimeError::GenericError(Value::str("invalid pattern capture")))
}

fn malformed_pattern(msg: &str) -> LuaError {
    LuaError::Runtime(RuntimeError::GenericError(Value::str(msg)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find_str(src: &str, pat: &str) -> Option<(usize, usize, Vec<String>)> {
        find(src.as_bytes(), pat.as_bytes(), 0).unwrap().map(|m| {
            let caps = m
                .captures
                .iter()
                .map(|v| match v {
                    Value::Str(s) => String::from_utf8_lossy(s).to_string(),
                    other => other.to_string(),
                })
                .collect();
            (m.start, m.end, caps)
        })
    }

    #[test]
    fn literal_match() {
        assert_eq!(find_str("hello world", "world"), Some((6, 11, vec!["world".to_string()])));
    }

    #[test]
    fn character_class_and_quantifier() {
        assert_eq!(find_str("  42 apples", "%d+"), Some((2, 4, vec!["42".to_string()])));
    }

    #[test]
    fn capture_groups() {
        assert_eq!(
            find_str("key=value", "(%a+)=(%a+)"),
            Some((0, 9, vec!["key".to_string(), "value".to_string()]))
        );
    }

    #[test]
    fn anchored_pattern_only_matches_at_start() {
        assert_eq!(find_str("abc", "^bc"), None);
        assert_eq!(find_str("abc", "^ab"), Some((0, 2, vec!["ab".to_string()])));
    }

    #[test]
    fn balanced_match() {
        assert_eq!(find_str("(a(b)c)d", "%b()"), Some((0, 7, vec!["(a(b)c)".to_string()])));
    }

    #[test]
    fn gmatch_advances_past_empty_matches() {
        let mut state = GMatchState::new();
        let mut results = Vec::new();
        while let Some(m) = state.next(b"abc", b"a*").unwrap() {
            results.push((m.start, m.end));
        }
        assert!(results.len() > 1);
    }

    #[test]
    fn character_set_with_range_and_negation() {
        assert_eq!(find_str("hello123", "[^%d]+"), Some((0, 5, vec!["hello".to_string()])));
    }
}
