//! Template parsing: permissive HTML fragments into [`TemplateNode`] trees.
//!
//! The tokenizer is deliberately forgiving (stray close tags are dropped,
//! unclosed elements close implicitly at EOF) and tracks source lines
//! throughout. It internalizes the normalization pre-passes: `<head>` is
//! renamed to the reserved pseudo-tag, unquoted `attr={expr}` values are
//! accepted directly, and a bare `{**expr}` in attribute position becomes
//! the reserved spread attribute. Text inside `<script>`/`<style>` is kept
//! raw and never scanned for interpolations.

use indexmap::IndexMap;
use once_cell::sync::Lazy;

use super::attribute::{classify_attributes, EventModifiers};
use super::error::Diagnostic;
use super::interpolate::{self, Chunk};
use super::{EventAttr, FieldRules, FormSchema, SpecialAttr, TemplateNode};
use crate::prelude::*;

/// HTML void elements: no closing tag, no children.
pub static VOID_ELEMENTS: Lazy<ahash::AHashSet<&'static str>> = Lazy::new(|| {
    [
        "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
        "source", "track", "wbr",
    ]
    .into_iter()
    .collect()
});

pub fn is_void_element(tag: &str) -> bool {
    VOID_ELEMENTS.contains(tag.to_ascii_lowercase().as_str())
}

/// Parse template text into a node forest. `start_line` is the source line
/// of the first text line (1-based).
pub fn parse_template(
    text: &str,
    start_line: u32,
    modifiers: &EventModifiers,
    diagnostics: &mut Vec<Diagnostic>,
) -> Vec<TemplateNode> {
    Tokenizer {
        bytes: text.as_bytes(),
        text,
        pos: 0,
        line: start_line,
        column: 0,
        modifiers,
        diagnostics,
    }
    .run()
}

struct Tokenizer<'a> {
    bytes: &'a [u8],
    text: &'a str,
    pos: usize,
    line: u32,
    column: u32,
    modifiers: &'a EventModifiers,
    diagnostics: &'a mut Vec<Diagnostic>,
}

impl<'a> Tokenizer<'a> {
    fn run(mut self) -> Vec<TemplateNode> {
        let mut roots = Vec::new();
        let mut stack: Vec<TemplateNode> = Vec::new();
        let mut text_start = self.pos;
        let mut text_line = self.line;
        let mut text_col = self.column;

        macro_rules! flush_text {
            () => {
                if self.pos > text_start {
                    let run = &self.text[text_start..self.pos];
                    append_text(run, text_line, text_col, &mut stack, &mut roots);
                }
            };
        }

        while self.pos < self.bytes.len() {
            if self.peek() != Some(b'<') {
                self.bump();
                continue;
            }

            match self.peek_at(1) {
                // Comment or doctype.
                Some(b'!') => {
                    flush_text!();
                    if self.text[self.pos..].starts_with("<!--") {
                        self.skip_comment();
                    } else {
                        // Doctype and other declarations pass through as text.
                        let decl = self.take_through(b'>');
                        append_text(&decl, self.line, self.column, &mut stack, &mut roots);
                    }
                }
                // Close tag.
                Some(b'/') => {
                    flush_text!();
                    self.close_tag(&mut stack, &mut roots);
                }
                // Open tag.
                Some(b) if b.is_ascii_alphabetic() => {
                    flush_text!();
                    self.open_tag(&mut stack, &mut roots);
                }
                // Literal '<'.
                _ => {
                    self.bump();
                    continue;
                }
            }

            text_start = self.pos;
            text_line = self.line;
            text_col = self.column;
        }

        flush_text!();

        // Implicitly close anything left open.
        while let Some(node) = stack.pop() {
            let node = finalize(node);
            match stack.last_mut() {
                Some(parent) => parent.children.push(node),
                None => roots.push(node),
            }
        }

        roots
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        if byte == b'\n' {
            self.line += 1;
            self.column = 0;
        } else {
            self.column += 1;
        }
        Some(byte)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.bump();
        }
    }

    fn take_through(&mut self, delim: u8) -> String {
        let start = self.pos;
        while let Some(b) = self.bump() {
            if b == delim {
                break;
            }
        }
        self.text[start..self.pos].to_string()
    }

    fn skip_comment(&mut self) {
        // Past "<!--".
        for _ in 0..4 {
            self.bump();
        }
        while self.pos < self.bytes.len() {
            if self.text[self.pos..].starts_with("-->") {
                for _ in 0..3 {
                    self.bump();
                }
                return;
            }
            self.bump();
        }
    }

    fn read_tag_name(&mut self) -> String {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
                self.bump();
            } else {
                break;
            }
        }
        self.text[start..self.pos].to_ascii_lowercase()
    }

    fn close_tag(&mut self, stack: &mut Vec<TemplateNode>, roots: &mut Vec<TemplateNode>) {
        // Past "</".
        self.bump();
        self.bump();
        let mut name = self.read_tag_name();
        self.take_through(b'>');

        if name == "head" {
            name = RESERVED_HEAD_TAG.to_string();
        }

        // Permissive recovery: drop a close tag with no matching open.
        let Some(depth) = stack
            .iter()
            .rposition(|n| n.tag.as_deref() == Some(name.as_str()))
        else {
            return;
        };

        while stack.len() > depth {
            let node = finalize(stack.pop().expect("stack is non-empty"));
            match stack.last_mut() {
                Some(parent) => parent.children.push(node),
                None => roots.push(node),
            }
        }
    }

    fn open_tag(&mut self, stack: &mut Vec<TemplateNode>, roots: &mut Vec<TemplateNode>) {
        let line = self.line;
        let column = self.column;

        // Past "<".
        self.bump();
        let mut name = self.read_tag_name();
        if name == "head" {
            name = RESERVED_HEAD_TAG.to_string();
        }

        let mut raw_attrs: IndexMap<String, String> = IndexMap::new();
        let mut self_closing = false;

        loop {
            self.skip_whitespace();
            match self.peek() {
                None => break,
                Some(b'>') => {
                    self.bump();
                    break;
                }
                Some(b'/') => {
                    self.bump();
                    if self.peek() == Some(b'>') {
                        self.bump();
                        self_closing = true;
                        break;
                    }
                }
                // Bare spread in attribute position: {**expr}.
                Some(b'{') => {
                    let value = self.read_brace_group();
                    raw_attrs.insert(RESERVED_SPREAD_ATTR.to_string(), value);
                }
                Some(_) => {
                    let attr_name = self.read_attr_name();
                    if attr_name.is_empty() {
                        self.bump();
                        continue;
                    }
                    self.skip_whitespace();
                    let value = if self.peek() == Some(b'=') {
                        self.bump();
                        self.skip_whitespace();
                        self.read_attr_value()
                    } else {
                        String::new()
                    };
                    raw_attrs.insert(attr_name, value);
                }
            }
        }

        let (attributes, special) = classify_attributes(
            &raw_attrs,
            &name,
            self.modifiers,
            line,
            column,
            self.diagnostics,
        );

        let mut node = TemplateNode {
            tag: Some(name.clone()),
            attributes,
            special,
            children: Vec::new(),
            text: None,
            is_raw: false,
            line,
            column,
        };

        // Raw-text elements swallow their content verbatim.
        if name == "script" || name == "style" {
            let raw = self.read_raw_content(&name);
            if !raw.is_empty() {
                node.children.push(TemplateNode {
                    tag: None,
                    attributes: IndexMap::new(),
                    special: Vec::new(),
                    children: Vec::new(),
                    text: Some(raw),
                    is_raw: true,
                    line,
                    column,
                });
            }
            let node = finalize(node);
            match stack.last_mut() {
                Some(parent) => parent.children.push(node),
                None => roots.push(node),
            }
            return;
        }

        if self_closing || is_void_element(&name) {
            let node = finalize(node);
            match stack.last_mut() {
                Some(parent) => parent.children.push(node),
                None => roots.push(node),
            }
            return;
        }

        stack.push(node);
    }

    fn read_attr_name(&mut self) -> String {
        let start = self.pos;
        while let Some(b) = self.peek() {
            match b {
                b' ' | b'\t' | b'\n' | b'\r' | b'=' | b'>' | b'/' => break,
                _ => {
                    self.bump();
                }
            }
        }
        self.text[start..self.pos].to_string()
    }

    fn read_attr_value(&mut self) -> String {
        match self.peek() {
            Some(quote @ (b'"' | b'\'')) => {
                self.bump();
                let start = self.pos;
                while let Some(b) = self.peek() {
                    if b == quote {
                        break;
                    }
                    self.bump();
                }
                let value = self.text[start..self.pos].to_string();
                self.bump();
                value
            }
            // Unquoted brace value: attr={expr}, kept brace-wrapped.
            Some(b'{') => self.read_brace_group(),
            _ => {
                let start = self.pos;
                while let Some(b) = self.peek() {
                    match b {
                        b' ' | b'\t' | b'\n' | b'\r' | b'>' => break,
                        b'/' if self.peek_at(1) == Some(b'>') => break,
                        _ => {
                            self.bump();
                        }
                    }
                }
                self.text[start..self.pos].to_string()
            }
        }
    }

    /// Consume `{...}` (depth- and quote-aware), returning it braces included.
    fn read_brace_group(&mut self) -> String {
        let start = self.pos;
        let mut depth = 0usize;
        let mut quote: Option<u8> = None;

        while let Some(b) = self.peek() {
            match quote {
                Some(q) => {
                    if b == q {
                        quote = None;
                    }
                }
                None => match b {
                    b'"' | b'\'' => quote = Some(b),
                    b'{' => depth += 1,
                    b'}' => {
                        depth -= 1;
                        if depth == 0 {
                            self.bump();
                            return self.text[start..self.pos].to_string();
                        }
                    }
                    _ => {}
                },
            }
            self.bump();
        }

        self.text[start..self.pos].to_string()
    }

    fn read_raw_content(&mut self, tag: &str) -> String {
        let close = format!("</{tag}");
        let start = self.pos;

        while self.pos < self.bytes.len() {
            let rest = &self.text[self.pos..];
            if rest.len() >= close.len() && rest[..close.len()].eq_ignore_ascii_case(&close) {
                let raw = self.text[start..self.pos].to_string();
                self.take_through(b'>');
                return raw;
            }
            self.bump();
        }

        self.text[start..self.pos].to_string()
    }
}

/// Convert a text run into literal and interpolation-carrier nodes, then
/// append them to the current insertion point.
fn append_text(
    run: &str,
    line: u32,
    column: u32,
    stack: &mut [TemplateNode],
    roots: &mut Vec<TemplateNode>,
) {
    if run.is_empty() {
        return;
    }

    let target = match stack.last_mut() {
        Some(parent) => &mut parent.children,
        None => roots,
    };

    for chunk in interpolate::scan(run, line, column) {
        match chunk {
            Chunk::Literal(text) => target.push(TemplateNode {
                tag: None,
                attributes: IndexMap::new(),
                special: Vec::new(),
                children: Vec::new(),
                text: Some(text),
                is_raw: false,
                line,
                column,
            }),
            Chunk::Expr(e) => target.push(TemplateNode {
                tag: None,
                attributes: IndexMap::new(),
                special: vec![SpecialAttr::Interpolation {
                    raw: e.raw,
                    expr: e.expr,
                    format_spec: e.format_spec,
                    line: e.line,
                    column: e.column,
                }],
                children: Vec::new(),
                text: None,
                is_raw: false,
                line: e.line,
                column: e.column,
            }),
        }
    }
}

/// Post-processing once an element's subtree is complete. Forms with an
/// `@submit` event harvest a validation schema from their named inputs.
fn finalize(mut node: TemplateNode) -> TemplateNode {
    if node.tag.as_deref() == Some("form") {
        let model_name = node.special.iter().find_map(|a| match a {
            SpecialAttr::Model { name } => Some(name.clone()),
            _ => None,
        });

        let needs_schema = node
            .special
            .iter()
            .any(|a| matches!(a, SpecialAttr::Event(e) if e.event_type == "submit"));

        if needs_schema {
            let mut schema = FormSchema {
                fields: IndexMap::new(),
                model_name,
            };
            for child in &node.children {
                harvest_fields(child, &mut schema);
            }

            for attr in &mut node.special {
                if let SpecialAttr::Event(event) = attr {
                    if event.event_type == "submit" {
                        event.schema = Some(schema);
                        break;
                    }
                }
            }
        }
    }

    node
}

fn harvest_fields(node: &TemplateNode, schema: &mut FormSchema) {
    if let Some(tag) = node.tag.as_deref() {
        if matches!(tag, "input" | "textarea" | "select") {
            if let Some(name) = node.attributes.get("name") {
                schema
                    .fields
                    .insert(name.clone(), extract_field_rules(node, name, tag));
            }
        }
    }

    for child in &node.children {
        harvest_fields(child, schema);
    }
}

fn extract_field_rules(node: &TemplateNode, name: &str, tag: &str) -> FieldRules {
    let attrs = &node.attributes;
    let mut rules = FieldRules::new(name);

    rules.required = attrs.contains_key("required");
    rules.pattern = attrs.get("pattern").cloned();
    rules.minlength = attrs.get("minlength").and_then(|v| v.parse().ok());
    rules.maxlength = attrs.get("maxlength").and_then(|v| v.parse().ok());
    rules.min_value = attrs.get("min").cloned();
    rules.max_value = attrs.get("max").cloned();
    rules.step = attrs.get("step").cloned();
    rules.title = attrs.get("title").cloned();

    rules.input_type = match attrs.get("type") {
        Some(t) => t.to_ascii_lowercase(),
        None if tag == "textarea" => "textarea".to_string(),
        None if tag == "select" => "select".to_string(),
        None => "text".to_string(),
    };

    if let Some(accept) = attrs.get("accept") {
        rules.allowed_types = Some(accept.split(',').map(|t| t.trim().to_string()).collect());
    }

    if let Some(value) = attrs.get("max-size") {
        rules.max_size = parse_max_size(value);
    }

    // Reactive rules evaluate against page state at submit time.
    for attr in &node.special {
        if let SpecialAttr::Reactive { name, expr } = attr {
            match name.as_str() {
                "required" => rules.required_expr = Some(expr.clone()),
                "min" => rules.min_expr = Some(expr.clone()),
                "max" => rules.max_expr = Some(expr.clone()),
                _ => {}
            }
        }
    }

    rules
}

/// `"1.5mb"` → 1 572 864. Suffixes: k/kb, m/mb, g/gb (binary multiples).
pub fn parse_max_size(value: &str) -> Option<u64> {
    let value = value.trim().to_ascii_lowercase();

    let (number, multiplier) = if let Some(n) = value.strip_suffix("kb") {
        (n, 1024u64)
    } else if let Some(n) = value.strip_suffix("mb") {
        (n, 1024 * 1024)
    } else if let Some(n) = value.strip_suffix("gb") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = value.strip_suffix('k') {
        (n, 1024)
    } else if let Some(n) = value.strip_suffix('m') {
        (n, 1024 * 1024)
    } else if let Some(n) = value.strip_suffix('g') {
        (n, 1024 * 1024 * 1024)
    } else {
        (value.as_str(), 1)
    };

    let number: f64 = number.trim().parse().ok()?;
    Some((number * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Vec<TemplateNode> {
        let mut diagnostics = Vec::new();
        parse_template(text, 1, &EventModifiers::default(), &mut diagnostics)
    }

    fn elements(nodes: &[TemplateNode]) -> Vec<&TemplateNode> {
        nodes.iter().filter(|n| n.tag.is_some()).collect()
    }

    #[test]
    fn simple_tree() {
        let nodes = parse("<div class=\"box\"><p>Hi</p></div>");
        let div = &elements(&nodes)[0];
        assert_eq!(div.tag.as_deref(), Some("div"));
        assert_eq!(div.attributes["class"], "box");
        let p = &elements(&div.children)[0];
        assert_eq!(p.children[0].text.as_deref(), Some("Hi"));
    }

    #[test]
    fn interpolation_carriers_in_text() {
        let nodes = parse("<p>Hi {name}!</p>");
        let p = &elements(&nodes)[0];
        assert_eq!(p.children.len(), 3);
        assert!(matches!(
            &p.children[1].special[0],
            SpecialAttr::Interpolation { raw, .. } if raw == "name"
        ));
    }

    #[test]
    fn unquoted_brace_values() {
        let nodes = parse("<input disabled={off} $if={visible}>");
        let input = &elements(&nodes)[0];
        assert!(input
            .special
            .iter()
            .any(|a| matches!(a, SpecialAttr::Reactive { name, expr } if name == "disabled" && expr == "off")));
        assert!(input
            .special
            .iter()
            .any(|a| matches!(a, SpecialAttr::If { condition } if condition == "visible")));
    }

    #[test]
    fn brace_value_with_comparison() {
        let nodes = parse("<p $if={count > 0}>yes</p>");
        let p = &elements(&nodes)[0];
        assert!(matches!(
            &p.special[0],
            SpecialAttr::If { condition } if condition == "count > 0"
        ));
    }

    #[test]
    fn bare_spread_attribute() {
        let nodes = parse("<div {**extra}></div>");
        let div = &elements(&nodes)[0];
        assert!(matches!(&div.special[0], SpecialAttr::Spread { expr } if expr == "extra"));
    }

    #[test]
    fn void_elements_do_not_nest() {
        let nodes = parse("<div><br><img src=\"x.png\"><p>t</p></div>");
        let div = &elements(&nodes)[0];
        let kids = elements(&div.children);
        assert_eq!(kids.len(), 3);
        assert!(kids[0].children.is_empty());
    }

    #[test]
    fn head_is_renamed() {
        let nodes = parse("<head><title>T</title></head>");
        let head = &elements(&nodes)[0];
        assert_eq!(head.tag.as_deref(), Some(RESERVED_HEAD_TAG));
        assert_eq!(elements(&head.children)[0].tag.as_deref(), Some("title"));
    }

    #[test]
    fn raw_text_in_script_and_style() {
        let nodes = parse("<script>if (a < b) { go(); }</script><style>p { color: red; }</style>");
        let script = &elements(&nodes)[0];
        let raw = &script.children[0];
        assert!(raw.is_raw);
        assert_eq!(raw.text.as_deref(), Some("if (a < b) { go(); }"));

        let style = &elements(&nodes)[1];
        assert!(style.children[0].is_raw);
    }

    #[test]
    fn unclosed_elements_close_at_eof() {
        let nodes = parse("<div><p>text");
        let div = &elements(&nodes)[0];
        assert_eq!(elements(&div.children).len(), 1);
    }

    #[test]
    fn stray_close_tag_is_dropped() {
        let nodes = parse("<div></span>ok</div>");
        let div = &elements(&nodes)[0];
        assert_eq!(div.children.len(), 1);
        assert_eq!(div.children[0].text.as_deref(), Some("ok"));
    }

    #[test]
    fn line_numbers_are_tracked() {
        let nodes = parse("<div>\n  <p>x</p>\n</div>");
        let div = &elements(&nodes)[0];
        assert_eq!(div.line, 1);
        let p = elements(&div.children)[0];
        assert_eq!(p.line, 2);
    }

    #[test]
    fn form_schema_is_harvested() {
        let nodes = parse(concat!(
            "<form @submit={save}>",
            "<input name=\"email\" type=\"email\" required>",
            "<textarea name=\"bio\" maxlength=\"200\"></textarea>",
            "<button type=\"submit\">Go</button>",
            "</form>"
        ));
        let form = &elements(&nodes)[0];
        let SpecialAttr::Event(event) = &form.special[0] else { panic!() };
        let schema = event.schema.as_ref().unwrap();

        let email = &schema.fields["email"];
        assert!(email.required);
        assert_eq!(email.input_type, "email");

        let bio = &schema.fields["bio"];
        assert_eq!(bio.input_type, "textarea");
        assert_eq!(bio.maxlength, Some(200));
    }

    #[test]
    fn max_size_suffixes() {
        assert_eq!(parse_max_size("1.5mb"), Some(1_572_864));
        assert_eq!(parse_max_size("2kb"), Some(2048));
        assert_eq!(parse_max_size("512"), Some(512));
        assert_eq!(parse_max_size("1g"), Some(1_073_741_824));
        assert_eq!(parse_max_size("oops"), None);
    }

    #[test]
    fn doctype_passes_through() {
        let nodes = parse("<!DOCTYPE html><html><body></body></html>");
        assert_eq!(nodes[0].text.as_deref(), Some("<!DOCTYPE html>"));
        assert_eq!(elements(&nodes)[0].tag.as_deref(), Some("html"));
    }
}
