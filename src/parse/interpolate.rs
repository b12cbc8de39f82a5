//! Interpolation scanning: split a text run into literal chunks and
//! `{expression}` chunks.
//!
//! The scanner is quote-aware (braces inside string literals are inert) and
//! conservative: anything that does not parse as an expression of the code
//! dialect stays literal, so CSS blocks and stray braces pass through
//! untouched. A trailing `:format-spec` is recognized and split off before
//! giving up.

use crate::code::{self, Expr};

#[derive(Debug)]
pub enum Chunk {
    Literal(String),
    Expr(ExprChunk),
}

#[derive(Debug)]
pub struct ExprChunk {
    /// The text between the braces, verbatim (including any format spec).
    pub raw: String,
    pub expr: Expr,
    pub format_spec: Option<String>,
    pub line: u32,
    pub column: u32,
}

/// Scan `text`, reporting positions relative to `(line, column)` at offset 0.
pub fn scan(text: &str, line: u32, column: u32) -> Vec<Chunk> {
    let bytes = text.as_bytes();
    let mut chunks = Vec::new();
    let mut i = 0;
    let mut last_end = 0;
    let mut cur_line = line;
    let mut cur_col = column;

    let mut flush = |chunks: &mut Vec<Chunk>, from: usize, to: usize| {
        if to > from {
            chunks.push(Chunk::Literal(text[from..to].to_string()));
        }
    };

    while i < bytes.len() {
        if bytes[i] == b'{' {
            match find_matching_brace(bytes, i) {
                Some(close) => {
                    let inner = &text[i + 1..close];
                    match classify(inner) {
                        Some((expr, format_spec)) => {
                            flush(&mut chunks, last_end, i);
                            chunks.push(Chunk::Expr(ExprChunk {
                                raw: inner.to_string(),
                                expr,
                                format_spec,
                                line: cur_line,
                                column: cur_col,
                            }));
                        }
                        None => {
                            // Not an expression (CSS or similar): keep the
                            // braces as literal text.
                            flush(&mut chunks, last_end, i);
                            chunks.push(Chunk::Literal(text[i..=close].to_string()));
                        }
                    }
                    for b in &bytes[i..=close] {
                        advance(&mut cur_line, &mut cur_col, *b);
                    }
                    i = close + 1;
                    last_end = i;
                    continue;
                }
                // Unmatched brace: literal to end of text.
                None => {
                    advance(&mut cur_line, &mut cur_col, bytes[i]);
                    i += 1;
                }
            }
        } else {
            advance(&mut cur_line, &mut cur_col, bytes[i]);
            i += 1;
        }
    }

    flush(&mut chunks, last_end, bytes.len());
    chunks
}

fn advance(line: &mut u32, col: &mut u32, byte: u8) {
    if byte == b'\n' {
        *line += 1;
        *col = 0;
    } else {
        *col += 1;
    }
}

/// Find the `}` matching the `{` at `open`, honouring nesting and quotes.
fn find_matching_brace(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut i = open;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == q && (i == 0 || bytes[i - 1] != b'\\') {
                    quote = None;
                }
            }
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            },
        }
        i += 1;
    }

    None
}

/// Decide whether captured brace content is an expression, possibly with a
/// trailing format spec. `None` means "keep literal".
fn classify(inner: &str) -> Option<(Expr, Option<String>)> {
    let stripped = inner.trim();
    if stripped.is_empty() {
        return None;
    }

    if let Ok(expr) = code::parse_expression(stripped) {
        return Some((expr, None));
    }

    // Unparseable with a semicolon present: almost certainly CSS.
    if inner.contains(';') {
        return None;
    }

    // Retry after splitting a top-level `:format-spec`.
    let split = top_level_colon(inner)?;
    let (expr_part, spec) = inner.split_at(split);
    let spec = &spec[1..];
    let expr = code::parse_expression(expr_part.trim()).ok()?;
    Some((expr, Some(spec.trim().to_string())))
}

/// Index of the first top-level `:` (outside quotes and brackets), if any.
fn top_level_colon(text: &str) -> Option<usize> {
    let mut balance = 0i32;
    let mut quote: Option<char> = None;
    let mut prev = '\0';

    for (i, c) in text.char_indices() {
        match quote {
            Some(q) => {
                if c == q && prev != '\\' {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' => quote = Some(c),
                '{' | '[' | '(' => balance += 1,
                '}' | ']' | ')' => balance -= 1,
                ':' if balance == 0 => return Some(i),
                _ => {}
            },
        }
        prev = c;
    }

    None
}

/// Reassemble the original text from a chunk sequence. The scanner
/// guarantees this reconstructs its input exactly.
#[cfg(test)]
pub fn reconstruct(chunks: &[Chunk]) -> String {
    let mut out = String::new();
    for chunk in chunks {
        match chunk {
            Chunk::Literal(text) => out.push_str(text),
            Chunk::Expr(e) => {
                out.push('{');
                out.push_str(&e.raw);
                out.push('}');
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exprs(text: &str) -> Vec<String> {
        scan(text, 0, 0)
            .into_iter()
            .filter_map(|c| match c {
                Chunk::Expr(e) => Some(e.raw),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn plain_text_is_one_literal() {
        let chunks = scan("Hello world", 0, 0);
        assert_eq!(chunks.len(), 1);
        assert!(matches!(&chunks[0], Chunk::Literal(t) if t == "Hello world"));
    }

    #[test]
    fn splits_expression_chunks() {
        assert_eq!(exprs("Hi {name}!"), vec!["name"]);
        assert_eq!(exprs("{a} and {b}"), vec!["a", "b"]);
    }

    #[test]
    fn complex_expressions() {
        assert_eq!(
            exprs("{'yes' if flag else 'no'}"),
            vec!["'yes' if flag else 'no'"]
        );
        assert_eq!(exprs("{items[0].name}"), vec!["items[0].name"]);
    }

    #[test]
    fn css_stays_literal() {
        let text = "body { color: red; }";
        let chunks = scan(text, 0, 0);
        assert!(chunks.iter().all(|c| matches!(c, Chunk::Literal(_))));
        assert_eq!(reconstruct(&chunks), text);
    }

    #[test]
    fn braces_in_quotes_are_inert() {
        assert_eq!(exprs("{'{'}"), vec!["'{'"]);
        let chunks = scan("{\"}\"}", 0, 0);
        assert_eq!(chunks.len(), 1);
        assert!(matches!(&chunks[0], Chunk::Expr(e) if e.raw == "\"}\""));
    }

    #[test]
    fn trailing_unmatched_brace_is_literal() {
        let text = "oops {";
        let chunks = scan(text, 0, 0);
        assert_eq!(reconstruct(&chunks), text);
        assert!(chunks.iter().all(|c| matches!(c, Chunk::Literal(_))));
    }

    #[test]
    fn format_spec_is_recognized() {
        let chunks = scan("{price:.2f}", 0, 0);
        let Chunk::Expr(e) = &chunks[0] else { panic!() };
        assert_eq!(e.format_spec.as_deref(), Some(".2f"));
        assert_eq!(reconstruct(&chunks), "{price:.2f}");
    }

    #[test]
    fn reconstruction_property() {
        let samples = [
            "Hi {name}!",
            "{a}{b}{c}",
            "text only",
            "a { b; c; } d {x}",
            "{x:>8}",
            "{ 'quoted }' }",
            "trailing {",
            "nested {d['k']}",
        ];
        for sample in samples {
            assert_eq!(reconstruct(&scan(sample, 0, 0)), sample, "{sample}");
        }
    }

    #[test]
    fn positions_track_lines() {
        let chunks = scan("line one\n{x}", 1, 0);
        let Chunk::Expr(e) = &chunks[1] else { panic!() };
        assert_eq!(e.line, 2);
        assert_eq!(e.column, 0);
    }
}
