//! Page-source parsing: sections, directives, template, and code, assembled
//! into a [`ParsedPage`] IR for the code generator.

pub mod attribute;
pub mod directive;
mod error;
pub mod interpolate;
pub mod template;

use std::path::{Path, PathBuf};

pub use attribute::EventModifiers;
pub use error::{Diagnostic, SourceError};
use indexmap::IndexMap;
pub use template::{is_void_element, parse_max_size};

use crate::code::{self, Expr, Stmt};
use crate::prelude::*;

/// The section separator: a line containing exactly `---`.
const SEPARATOR: &str = "---";

// ---------------------------------------------------------------------------
// IR types
// ---------------------------------------------------------------------------

/// One node of the template tree. Exactly one of these shapes holds:
/// an element (`tag` present), a text run (`text` present), or an
/// interpolation carrier (single [`SpecialAttr::Interpolation`]).
#[derive(Debug, Clone)]
pub struct TemplateNode {
    pub tag: Option<String>,
    pub attributes: IndexMap<String, String>,
    pub special: Vec<SpecialAttr>,
    pub children: Vec<TemplateNode>,
    pub text: Option<String>,
    /// Raw text (inside `<script>`/`<style>`) is never interpolated.
    pub is_raw: bool,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone)]
pub struct EventAttr {
    pub event_type: String,
    /// Either a bare handler name or an inline code fragment.
    pub handler: String,
    pub modifiers: Vec<String>,
    /// Harvested from named inputs when this is a form's `@submit`.
    pub schema: Option<FormSchema>,
}

#[derive(Debug, Clone)]
pub enum SpecialAttr {
    Event(EventAttr),
    If {
        condition: String,
    },
    Show {
        condition: String,
    },
    For {
        loop_vars: String,
        iterable: String,
        is_template_tag: bool,
    },
    Key {
        expr: String,
    },
    Bind {
        variable: String,
        progress: bool,
    },
    Reactive {
        name: String,
        expr: String,
    },
    Spread {
        expr: String,
    },
    Model {
        name: String,
    },
    Interpolation {
        raw: String,
        expr: Expr,
        format_spec: Option<String>,
        line: u32,
        column: u32,
    },
}

#[derive(Debug, Clone, Default)]
pub struct FieldRules {
    pub name: String,
    pub required: bool,
    pub required_expr: Option<String>,
    pub pattern: Option<String>,
    pub minlength: Option<usize>,
    pub maxlength: Option<usize>,
    pub min_value: Option<String>,
    pub max_value: Option<String>,
    pub min_expr: Option<String>,
    pub max_expr: Option<String>,
    pub step: Option<String>,
    pub input_type: String,
    pub title: Option<String>,
    pub max_size: Option<u64>,
    pub allowed_types: Option<Vec<String>>,
}

impl FieldRules {
    pub fn new(name: &str) -> Self {
        FieldRules {
            name: name.to_string(),
            input_type: "text".to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FormSchema {
    pub fields: IndexMap<String, FieldRules>,
    pub model_name: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Directive {
    Path {
        routes: IndexMap<String, String>,
        is_simple: bool,
        line: u32,
    },
    NoSpa {
        line: u32,
    },
    Layout {
        path: String,
        line: u32,
    },
    Component {
        name: String,
        path: String,
        line: u32,
    },
    Props {
        /// `(name, type hint, default expression source)`
        args: Vec<(String, String, Option<String>)>,
        line: u32,
    },
    Provide {
        mapping: Vec<(String, Expr)>,
        line: u32,
    },
    Inject {
        mapping: IndexMap<String, String>,
        line: u32,
    },
}

/// The parsed IR of one page source.
#[derive(Debug)]
pub struct ParsedPage {
    pub directives: Vec<Directive>,
    pub template: Vec<TemplateNode>,
    pub code_text: String,
    pub code: Vec<Stmt>,
    pub file_path: PathBuf,
    pub diagnostics: Vec<Diagnostic>,
}

impl ParsedPage {
    pub fn path_directive(&self) -> Option<(&IndexMap<String, String>, bool)> {
        self.directives.iter().find_map(|d| match d {
            Directive::Path {
                routes, is_simple, ..
            } => Some((routes, *is_simple)),
            _ => None,
        })
    }

    pub fn layout_directive(&self) -> Option<&str> {
        self.directives.iter().find_map(|d| match d {
            Directive::Layout { path, .. } => Some(path.as_str()),
            _ => None,
        })
    }

    pub fn no_spa(&self) -> bool {
        self.directives
            .iter()
            .any(|d| matches!(d, Directive::NoSpa { .. }))
    }

    pub fn components(&self) -> impl Iterator<Item = (&str, &str)> {
        self.directives.iter().filter_map(|d| match d {
            Directive::Component { name, path, .. } => Some((name.as_str(), path.as_str())),
            _ => None,
        })
    }

    pub fn props(&self) -> Option<&[(String, String, Option<String>)]> {
        self.directives.iter().find_map(|d| match d {
            Directive::Props { args, .. } => Some(args.as_slice()),
            _ => None,
        })
    }

    pub fn provides(&self) -> impl Iterator<Item = &(String, Expr)> {
        self.directives
            .iter()
            .filter_map(|d| match d {
                Directive::Provide { mapping, .. } => Some(mapping.iter()),
                _ => None,
            })
            .flatten()
    }

    pub fn injects(&self) -> impl Iterator<Item = (&str, &str)> {
        self.directives
            .iter()
            .filter_map(|d| match d {
                Directive::Inject { mapping, .. } => Some(mapping.iter()),
                _ => None,
            })
            .flatten()
            .map(|(local, key)| (local.as_str(), key.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Page parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct PageParser {
    pub modifiers: EventModifiers,
}

impl PageParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_file(&self, path: &Path) -> Result<ParsedPage> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Could not read page source {path:?}"))?;

        self.parse(&content, path)
            .map_err(|e| eyre!("{} (in {:?}, line {})", e, path, e.line()))
    }

    /// Parse page-source text. Line numbers in the result are 1-based and
    /// reference `content` directly.
    pub fn parse(&self, content: &str, file_path: &Path) -> Result<ParsedPage, SourceError> {
        let lines: Vec<&str> = content.split('\n').collect();

        // Locate the code block: the first two lines that are exactly `---`.
        let mut code_start = None;
        let mut code_end = None;
        for (i, line) in lines.iter().enumerate() {
            if line.trim() == SEPARATOR {
                if code_start.is_none() {
                    code_start = Some(i);
                } else {
                    code_end = Some(i);
                    break;
                }
            }
        }

        let (directive_lines, code_text, code_offset, template_tail) = match (code_start, code_end)
        {
            (Some(start), Some(end)) => (
                &lines[..start],
                lines[start + 1..end].join("\n"),
                start as u32 + 1,
                &lines[end + 1..],
            ),
            // Unclosed block: everything after the separator is code.
            (Some(start), None) => (
                &lines[..start],
                lines[start + 1..].join("\n"),
                start as u32 + 1,
                &[][..],
            ),
            (None, _) => {
                validate_no_orphaned_code(&lines)?;
                (&lines[..], String::new(), 0, &[][..])
            }
        };

        let mut diagnostics = Vec::new();
        let (directives, mut template_lines) =
            self.parse_directives(directive_lines, &mut diagnostics);

        for tail_line in template_tail {
            template_lines.push(tail_line.to_string());
        }

        let template_text = template_lines.join("\n");
        let template = if template_text.trim().is_empty() {
            Vec::new()
        } else {
            template::parse_template(&template_text, 1, &self.modifiers, &mut diagnostics)
        };

        let code = if code_text.trim().is_empty() {
            Vec::new()
        } else {
            code::parse_module(&code_text, code_offset)?
        };

        Ok(ParsedPage {
            directives,
            template,
            code_text,
            code,
            file_path: file_path.to_path_buf(),
            diagnostics,
        })
    }

    /// Walk the directive section. Directive lines are replaced by blanks in
    /// the returned template lines, preserving line numbers.
    fn parse_directives(
        &self,
        lines: &[&str],
        diagnostics: &mut Vec<Diagnostic>,
    ) -> (Vec<Directive>, Vec<String>) {
        let mut directives = Vec::new();
        let mut template_lines: Vec<String> = Vec::new();
        let mut template_started = false;
        let mut i = 0;

        while i < lines.len() {
            let line = lines[i];
            let stripped = line.trim();
            let line_num = i as u32 + 1;

            if stripped.is_empty() {
                template_lines.push(String::new());
                i += 1;
                continue;
            }

            if !directive::is_directive_line(stripped) {
                if stripped.starts_with('!') {
                    diagnostics.push(Diagnostic::new(
                        format!("unknown directive '{}'", stripped.split_whitespace().next().unwrap_or(stripped)),
                        line_num,
                        0,
                    ));
                }
                template_lines.push(line.to_string());
                template_started = true;
                i += 1;
                continue;
            }

            if template_started {
                diagnostics.push(Diagnostic::new(
                    "directives must precede the template",
                    line_num,
                    0,
                ));
                template_lines.push(String::new());
                i += 1;
                continue;
            }

            // Single line first.
            if let Some(directive) = directive::parse_directive(stripped, line_num) {
                directives.push(directive);
                template_lines.push(String::new());
                i += 1;
                continue;
            }

            // Accumulate while brackets are open, then retry.
            let mut accumulated = stripped.to_string();
            let mut balance = bracket_balance(stripped);
            let mut j = i + 1;
            while balance > 0 && j < lines.len() {
                let next = lines[j].trim();
                accumulated.push('\n');
                accumulated.push_str(next);
                balance += bracket_balance(next);
                j += 1;
            }

            match directive::parse_directive(&accumulated, line_num) {
                Some(directive) => {
                    directives.push(directive);
                    for _ in i..j {
                        template_lines.push(String::new());
                    }
                    i = j;
                }
                None => {
                    diagnostics.push(Diagnostic::new(
                        format!(
                            "malformed directive '{}'",
                            stripped.split_whitespace().next().unwrap_or(stripped)
                        ),
                        line_num,
                        0,
                    ));
                    template_lines.push(String::new());
                    i += 1;
                }
            }
        }

        (directives, template_lines)
    }
}

fn bracket_balance(line: &str) -> i32 {
    let mut balance = 0;
    for c in line.chars() {
        match c {
            '{' | '[' | '(' => balance += 1,
            '}' | ']' | ')' => balance -= 1,
            _ => {}
        }
    }
    balance
}

/// With no code block present, reject dash-run pseudo-separators and lines
/// that look like orphaned code.
fn validate_no_orphaned_code(lines: &[&str]) -> Result<(), SourceError> {
    for (i, line) in lines.iter().enumerate() {
        let stripped = line.trim();

        if !stripped.is_empty() && stripped.chars().all(|c| c == '-') && stripped != SEPARATOR {
            return Err(SourceError::syntax(
                format!(
                    "malformed separator: found '{stripped}' but expected '---'. \
                     Page code must be enclosed between two '---' lines."
                ),
                i as u32 + 1,
            ));
        }

        // Allow directives and early lines; catch obvious code below them.
        if i > 5 && looks_like_code(stripped) {
            return Err(SourceError::syntax(
                "code detected without a '---' separator. \
                 Page code must be enclosed between two '---' lines.",
                i as u32 + 1,
            ));
        }
    }
    Ok(())
}

fn looks_like_code(line: &str) -> bool {
    if line.is_empty() || line.starts_with('<') || line.ends_with('>') || line.starts_with('!') {
        return false;
    }

    if line.starts_with("def ") || line.starts_with("return ") || line.starts_with('@') {
        return true;
    }

    // Assignment heuristic: `name = value` with no colon before the `=`.
    match line.find('=') {
        Some(pos) => !line[..pos].contains(':') && code::parse_module(line, 0).is_ok(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> ParsedPage {
        PageParser::new()
            .parse(content, Path::new("/pages/test.pw"))
            .unwrap()
    }

    #[test]
    fn splits_sections() {
        let page = parse(indoc! {"
            !path '/hello'
            <p>Hi {name}!</p>
            ---
            name = 'Ada'

            def rename():
                name = 'Grace'
            ---
        "});

        assert_eq!(page.directives.len(), 1);
        assert!(!page.template.is_empty());
        assert_eq!(page.code.len(), 2);
    }

    #[test]
    fn code_lines_reference_the_source_file() {
        let content = "<p>x</p>\n---\nok = 1\nbad = = 2\n---\n";
        let err = PageParser::new()
            .parse(content, Path::new("/pages/test.pw"))
            .unwrap_err();
        // `bad = = 2` is on line 4 of the file.
        assert_eq!(err.line(), 4);
    }

    #[test]
    fn template_after_code_block_is_kept() {
        let page = parse("<p>a</p>\n---\nx = 1\n---\n<p>b</p>\n");
        let elements: Vec<_> = page.template.iter().filter(|n| n.tag.is_some()).collect();
        assert_eq!(elements.len(), 2);
    }

    #[test]
    fn multiline_directive() {
        let page = parse(indoc! {"
            !path {
                home: '/',
                about: '/about',
            }
            <p>x</p>
        "});

        let (routes, is_simple) = page.path_directive().unwrap();
        assert!(!is_simple);
        assert_eq!(routes.len(), 2);
        // The template still sees the right line for <p>.
        let p = page.template.iter().find(|n| n.tag.is_some()).unwrap();
        assert_eq!(p.line, 5);
    }

    #[test]
    fn directive_after_template_is_diagnosed() {
        let page = parse("<p>x</p>\n!no_spa\n");
        assert!(page
            .diagnostics
            .iter()
            .any(|d| d.message.contains("precede")));
    }

    #[test]
    fn malformed_separator_is_rejected() {
        let err = PageParser::new()
            .parse("<p>x</p>\n----\n", Path::new("/t.pw"))
            .unwrap_err();
        assert!(err.message().contains("expected '---'"));
        assert_eq!(err.line(), 2);
    }

    #[test]
    fn orphaned_code_is_rejected() {
        let content = "<div>\n<p>a</p>\n<p>b</p>\n<p>c</p>\n<p>d</p>\n</div>\n\ncount = 1\n";
        let err = PageParser::new()
            .parse(content, Path::new("/t.pw"))
            .unwrap_err();
        assert!(err.message().contains("separator"));
    }

    #[test]
    fn empty_template_with_code_is_fine() {
        let page = parse("---\ncount = 0\n---\n");
        assert!(page.template.is_empty());
        assert_eq!(page.code.len(), 1);
    }

    #[test]
    fn unclosed_code_block_swallows_the_rest() {
        let page = parse("<p>x</p>\n---\ncount = 0\ncount += 1\n");
        assert_eq!(page.code.len(), 2);
    }
}
