//! Top-of-file directive parsing: `!path`, `!layout`, `!no_spa`,
//! `!component`, `!props`, `!provide`, `!inject`.
//!
//! Each directive occupies one logical line; the section parser accumulates
//! physical lines while `{`, `[` or `(` counters are open before retrying.

use indexmap::IndexMap;

use super::Directive;
use crate::code::{self, Expr, ExprKind, Literal};

const DIRECTIVE_NAMES: &[&str] = &[
    "!path",
    "!no_spa",
    "!layout",
    "!component",
    "!props",
    "!provide",
    "!inject",
];

/// Does this line open a directive we recognize?
pub fn is_directive_line(line: &str) -> bool {
    DIRECTIVE_NAMES.iter().any(|name| {
        line.strip_prefix(name).is_some_and(|rest| {
            rest.is_empty() || rest.starts_with([' ', '\t', '(', '{'])
        })
    })
}

/// Try to parse one (possibly accumulated) directive. `None` means the text
/// is not yet complete or well-formed; the caller may accumulate more lines
/// and retry.
pub fn parse_directive(text: &str, line: u32) -> Option<Directive> {
    let text = text.trim();

    if let Some(rest) = text.strip_prefix("!path") {
        return parse_path(rest.trim(), line);
    }
    if text == "!no_spa" {
        return Some(Directive::NoSpa { line });
    }
    if let Some(rest) = text.strip_prefix("!layout") {
        let path = unquote(rest.trim());
        if path.is_empty() {
            return None;
        }
        return Some(Directive::Layout {
            path: path.to_string(),
            line,
        });
    }
    if let Some(rest) = text.strip_prefix("!component") {
        return parse_component(rest.trim(), line);
    }
    if let Some(rest) = text.strip_prefix("!props") {
        return parse_props(rest.trim(), line);
    }
    if let Some(rest) = text.strip_prefix("!provide") {
        return parse_provide(rest.trim(), line);
    }
    if let Some(rest) = text.strip_prefix("!inject") {
        return parse_inject(rest.trim(), line);
    }

    None
}

/// `!path '/route'` or `!path {name: '/route', other: '/other/{id:int}'}`.
fn parse_path(content: &str, line: u32) -> Option<Directive> {
    let expr = code::parse_expression(content).ok()?;

    match &expr.kind {
        ExprKind::Literal(Literal::Str(pattern)) => {
            let mut routes = IndexMap::new();
            routes.insert("main".to_string(), pattern.clone());
            Some(Directive::Path {
                routes,
                is_simple: true,
                line,
            })
        }
        ExprKind::Dict(pairs) => {
            let mut routes = IndexMap::new();
            for (key, value) in pairs {
                let name = dict_key(key)?;
                let ExprKind::Literal(Literal::Str(pattern)) = &value.kind else {
                    return None;
                };
                routes.insert(name, pattern.clone());
            }
            if routes.is_empty() {
                return None;
            }
            Some(Directive::Path {
                routes,
                is_simple: false,
                line,
            })
        }
        _ => None,
    }
}

/// `!component Card './card.pw'`
fn parse_component(content: &str, line: u32) -> Option<Directive> {
    let (name, rest) = content.split_once(char::is_whitespace)?;
    if name.is_empty() || !name.chars().next()?.is_ascii_uppercase() {
        return None;
    }

    let path = unquote(rest.trim());
    if path.is_empty() {
        return None;
    }

    Some(Directive::Component {
        name: name.to_string(),
        path: path.to_string(),
        line,
    })
}

/// `!props(name: str, count: int = 0)`
fn parse_props(content: &str, line: u32) -> Option<Directive> {
    let inner = content.strip_prefix('(')?.strip_suffix(')')?;
    let mut args = Vec::new();

    for part in split_top_level(inner, ',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        let (head, default) = match split_once_top_level(part, '=') {
            Some((head, default)) => (head.trim(), Some(default.trim().to_string())),
            None => (part, None),
        };

        let (name, type_hint) = match head.split_once(':') {
            Some((name, hint)) => (name.trim(), hint.trim().to_string()),
            None => (head, "Any".to_string()),
        };

        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return None;
        }

        // Defaults must be valid expressions of the dialect.
        if let Some(default) = &default {
            code::parse_expression(default).ok()?;
        }

        args.push((name.to_string(), type_hint, default));
    }

    Some(Directive::Props { args, line })
}

/// `!provide {'THEME': current_theme}`
fn parse_provide(content: &str, line: u32) -> Option<Directive> {
    let expr = code::parse_expression(content).ok()?;
    let ExprKind::Dict(pairs) = expr.kind else {
        return None;
    };

    let mut mapping = Vec::new();
    for (key, value) in pairs {
        mapping.push((dict_key(&key)?, value));
    }

    Some(Directive::Provide { mapping, line })
}

/// `!inject {theme: 'THEME'}`
fn parse_inject(content: &str, line: u32) -> Option<Directive> {
    let expr = code::parse_expression(content).ok()?;
    let ExprKind::Dict(pairs) = expr.kind else {
        return None;
    };

    let mut mapping = IndexMap::new();
    for (key, value) in pairs {
        let local = dict_key(&key)?;
        let ExprKind::Literal(Literal::Str(global)) = value.kind else {
            return None;
        };
        mapping.insert(local, global);
    }

    Some(Directive::Inject { mapping, line })
}

/// Dict keys may be written bare (`home`) or quoted (`'home'`).
fn dict_key(key: &Expr) -> Option<String> {
    match &key.kind {
        ExprKind::Name(name) => Some(name.clone()),
        ExprKind::Literal(Literal::Str(s)) => Some(s.clone()),
        _ => None,
    }
}

fn unquote(text: &str) -> &str {
    let text = text.trim();
    for quote in ['\'', '"'] {
        if let Some(stripped) = text
            .strip_prefix(quote)
            .and_then(|t| t.strip_suffix(quote))
        {
            return stripped;
        }
    }
    text
}

fn split_top_level(text: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (i, c) in text.char_indices() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth -= 1,
                c if c == sep && depth == 0 => {
                    parts.push(&text[start..i]);
                    start = i + 1;
                }
                _ => {}
            },
        }
    }
    parts.push(&text[start..]);
    parts
}

fn split_once_top_level(text: &str, sep: char) -> Option<(&str, &str)> {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;

    for (i, c) in text.char_indices() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth -= 1,
                c if c == sep && depth == 0 => {
                    return Some((&text[..i], &text[i + 1..]));
                }
                _ => {}
            },
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_path_gets_main_variant() {
        let Directive::Path {
            routes, is_simple, ..
        } = parse_directive("!path '/x'", 1).unwrap()
        else {
            panic!()
        };
        assert!(is_simple);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes["main"], "/x");
    }

    #[test]
    fn multi_variant_path() {
        let Directive::Path {
            routes, is_simple, ..
        } = parse_directive("!path {a: '/a', b: '/b/{id:int}'}", 1).unwrap()
        else {
            panic!()
        };
        assert!(!is_simple);
        assert_eq!(routes["a"], "/a");
        assert_eq!(routes["b"], "/b/{id:int}");
    }

    #[test]
    fn multiline_path_accumulates() {
        // The section parser feeds the accumulated text once brackets close.
        let text = "!path {\n    home: '/',\n    detail: '/items/{id}',\n}";
        let Directive::Path { routes, .. } = parse_directive(text, 1).unwrap() else {
            panic!()
        };
        assert_eq!(routes.len(), 2);
    }

    #[test]
    fn layout_accepts_quotes_and_bare_paths() {
        for src in ["!layout './__layout__.pw'", "!layout ./__layout__.pw"] {
            let Directive::Layout { path, .. } = parse_directive(src, 1).unwrap() else {
                panic!()
            };
            assert_eq!(path, "./__layout__.pw");
        }
    }

    #[test]
    fn component_needs_capitalized_name() {
        assert!(parse_directive("!component Card './card.pw'", 1).is_some());
        assert!(parse_directive("!component card './card.pw'", 1).is_none());
    }

    #[test]
    fn props_with_types_and_defaults() {
        let Directive::Props { args, .. } =
            parse_directive("!props(title: str, count: int = 0, extra)", 1).unwrap()
        else {
            panic!()
        };
        assert_eq!(args[0], ("title".into(), "str".into(), None));
        assert_eq!(args[1], ("count".into(), "int".into(), Some("0".into())));
        assert_eq!(args[2], ("extra".into(), "Any".into(), None));
    }

    #[test]
    fn provide_and_inject() {
        assert!(matches!(
            parse_directive("!provide {'THEME': theme}", 1),
            Some(Directive::Provide { .. })
        ));

        let Directive::Inject { mapping, .. } =
            parse_directive("!inject {theme: 'THEME'}", 1).unwrap()
        else {
            panic!()
        };
        assert_eq!(mapping["theme"], "THEME");
    }

    #[test]
    fn directive_line_detection() {
        assert!(is_directive_line("!path '/x'"));
        assert!(is_directive_line("!no_spa"));
        assert!(is_directive_line("!props(a: int)"));
        assert!(!is_directive_line("!unknown thing"));
        assert!(!is_directive_line("<div>"));
        assert!(!is_directive_line("!pathological"));
    }
}
