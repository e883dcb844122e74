//! String-aware structural scanning
//!
//! Characters inside JSON string literals never count toward nesting depth.
//! Everything here works on byte offsets into the original text so that
//! spans can be sliced back out for parsing.

use std::ops::Range;
use std::str::CharIndices;

/// Iterator over characters that sit outside string literals.
/// Quote characters themselves are not yielded.
pub struct Structural<'a> {
    chars: CharIndices<'a>,
    in_string: bool,
    escaped: bool,
}

pub fn structural(text: &str) -> Structural<'_> {
    Structural {
        chars: text.char_indices(),
        in_string: false,
        escaped: false,
    }
}

impl<'a> Iterator for Structural<'a> {
    type Item = (usize, char);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (i, c) = self.chars.next()?;
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if c == '\\' {
                    self.escaped = true;
                } else if c == '"' {
                    self.in_string = false;
                }
                continue;
            }
            if c == '"' {
                self.in_string = true;
                continue;
            }
            return Some((i, c));
        }
    }
}

/// Array spans found by [`scan_arrays`]
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ArrayScan {
    /// Outermost arrays that closed, in order of appearance
    pub complete: Vec<Range<usize>>,
    /// Offset of the outermost `[` that never closed
    pub unclosed: Option<usize>,
}

/// Track `[]`/`{}` nesting across the whole text.
///
/// A closer pops back to its nearest matching opener, so stray closers in
/// surrounding prose are ignored instead of corrupting the depth.
pub fn scan_arrays(text: &str) -> ArrayScan {
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut scan = ArrayScan::default();

    for (i, c) in structural(text) {
        match c {
            '[' | '{' => stack.push((c, i)),
            ']' | '}' => {
                let opener = if c == ']' { '[' } else { '{' };
                if let Some(pos) = stack.iter().rposition(|(o, _)| *o == opener) {
                    let start = stack[pos].1;
                    stack.truncate(pos);
                    if stack.is_empty() && opener == '[' {
                        scan.complete.push(start..i + 1);
                    }
                }
            }
            _ => {}
        }
    }

    scan.unclosed = stack.iter().find(|(o, _)| *o == '[').map(|(_, i)| *i);
    scan
}

/// Spans of every `{...}` that closes at depth zero, scanning from `start`.
/// Stops at a `]` seen outside any object. A trailing unterminated object is
/// not returned.
pub fn top_level_objects(text: &str, start: usize) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut obj_start = 0usize;

    for (i, c) in structural(&text[start..]) {
        match c {
            '{' => {
                if depth == 0 {
                    obj_start = start + i;
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    spans.push(obj_start..start + i + 1);
                }
            }
            ']' if depth == 0 => break,
            _ => {}
        }
    }
    spans
}

/// End offset (exclusive) of the object opening at `start`, if it closes.
pub fn object_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in structural(&text[start..]) {
        match c {
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(start + i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Remove `//` comments that start outside string literals.
pub fn strip_line_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            out.push(c);
            continue;
        }
        if c == '/' && chars.peek() == Some(&'/') {
            for skipped in chars.by_ref() {
                if skipped == '\n' {
                    out.push('\n');
                    break;
                }
            }
            continue;
        }
        if c == '"' {
            in_string = true;
        }
        out.push(c);
    }
    out
}

/// Remove commas that directly precede `]` or `}` (whitespace allowed).
pub fn strip_trailing_commas(text: &str) -> String {
    let mut drop = Vec::new();
    let mut pending_comma: Option<usize> = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                pending_comma = None;
            }
            ',' => pending_comma = Some(i),
            ']' | '}' => {
                if let Some(comma) = pending_comma.take() {
                    drop.push(comma);
                }
            }
            c if c.is_whitespace() => {}
            _ => pending_comma = None,
        }
    }

    if drop.is_empty() {
        return text.to_string();
    }
    text.char_indices()
        .filter(|(i, _)| !drop.contains(i))
        .map(|(_, c)| c)
        .collect()
}
