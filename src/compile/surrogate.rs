//! Stand-in pages for sources that failed to compile.
//!
//! A failed source still owns its routes: we recover them with a
//! best-effort regex over the raw text (or derive them from the file
//! location) and register a [`CompileFailure`] there. At request time the
//! server decides what to do with it: a detailed error page in development,
//! the 500 path in production.

use std::fmt::Display;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::parse::SourceError;
use crate::prelude::*;

/// A structured compile failure, kept alongside the routes the source
/// would have owned.
#[derive(Debug, Clone)]
pub struct CompileFailure {
    pub file_path: PathBuf,
    pub message: String,
    pub line: Option<u32>,
}

impl CompileFailure {
    pub fn new(path: &Path, message: impl Into<String>, line: Option<u32>) -> Self {
        CompileFailure {
            file_path: path.to_path_buf(),
            message: message.into(),
            line,
        }
    }

    pub fn from_source(path: &Path, error: &SourceError) -> Self {
        CompileFailure {
            file_path: path.to_path_buf(),
            message: error.to_string(),
            line: Some(error.line()),
        }
    }
}

impl Display for CompileFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "{:?}:{line}: {}", self.file_path, self.message),
            None => write!(f, "{:?}: {}", self.file_path, self.message),
        }
    }
}

static PATH_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"!path\s+['"]([^'"]+)['"]|['"]([^'"]*/[^'"]*)['"]\s*,?"#).unwrap());

static PATH_DIRECTIVE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^!path\b").unwrap());

/// Best-effort route recovery from raw (uncompilable) source text: string
/// literals near a `!path` directive, else a route derived from the file's
/// location under the pages root.
pub fn recover_routes(
    source: &str,
    file_path: &Path,
    pages_root: &Path,
    extension: &str,
) -> Vec<String> {
    let mut routes = Vec::new();

    if PATH_DIRECTIVE.is_match(source) {
        for capture in PATH_LITERAL.captures_iter(source) {
            let literal = capture
                .get(1)
                .or_else(|| capture.get(2))
                .map(|m| m.as_str());
            if let Some(literal) = literal {
                if literal.starts_with('/') && !routes.iter().any(|r| r == literal) {
                    routes.push(literal.to_string());
                }
            }
        }
    }

    if routes.is_empty() {
        if let Some(derived) = derive_file_route(file_path, pages_root, extension) {
            routes.push(derived);
        }
    }

    routes
}

/// `pages/blog/[id].pw` → `/blog/{id}`; `pages/index.pw` → `/`.
pub fn derive_file_route(file_path: &Path, pages_root: &Path, extension: &str) -> Option<String> {
    let rel = file_path.strip_prefix(pages_root).ok()?;
    let mut segments = Vec::new();

    for component in rel.components() {
        let mut name = component.as_os_str().to_string_lossy().to_string();
        if let Some(stripped) = name.strip_suffix(&format!(".{extension}")) {
            name = stripped.to_string();
        }
        if name == "index" {
            continue;
        }
        if let Some(param) = name.strip_prefix('[').and_then(|n| n.strip_suffix(']')) {
            name = format!("{{{param}}}");
        }
        segments.push(name);
    }

    Some(format!("/{}", segments.join("/")))
}

/// Render the development error page: file, line, surrounding context, and
/// the failure message, in the framework's dark diagnostic style.
pub fn render_error_page(failure: &CompileFailure) -> String {
    let mut context_html = String::new();

    if let (Some(line), Ok(content)) = (failure.line, std::fs::read_to_string(&failure.file_path))
    {
        let lines: Vec<&str> = content.lines().collect();
        let line = line as usize;
        let start = line.saturating_sub(5).max(1);
        let end = (line + 5).min(lines.len());

        for num in start..=end {
            let Some(text) = lines.get(num - 1) else { continue };
            let class = if num == line { "line-current" } else { "line" };
            context_html.push_str(&format!(
                "<div class='{class}'><span class='line-num'>{num}</span> <span class='code'>{}</span></div>",
                html_escape::encode_text(text)
            ));
        }
    }

    let file_display = failure.file_path.to_string_lossy();
    let location = match failure.line {
        Some(line) => format!("{file_display}:{line}"),
        None => file_display.to_string(),
    };

    indoc::formatdoc! {r#"
            <!DOCTYPE html>
            <html>
            <head>
            <title>Compile Error</title>
            <style>
                body {{ font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, sans-serif;
                       background: #1a1a1a; color: #e0e0e0; margin: 0; padding: 20px; }}
                h1 {{ color: #ff6b6b; font-size: 24px; margin-bottom: 5px; }}
                .container {{ max-width: 1000px; margin: 0 auto; }}
                .error-location {{ background: #2d2d2d; border-radius: 8px; padding: 15px;
                                 margin-bottom: 20px; border-left: 4px solid #ff6b6b; }}
                .file-info {{ color: #ffd43b; font-family: monospace; font-size: 14px; margin-bottom: 10px; }}
                .exc-msg {{ font-size: 16px; color: #fff; white-space: pre-wrap;
                           font-family: monospace; line-height: 1.6; }}
                .code-context {{ padding: 10px 0; background: #222; font-family: monospace;
                               font-size: 13px; overflow-x: auto; border-radius: 4px; }}
                .line {{ padding: 2px 15px; color: #888; display: flex; }}
                .line-current {{ padding: 2px 15px; background: #3c1e1e; color: #ffcccc;
                               display: flex; border-left: 3px solid #ff6b6b; }}
                .line-num {{ width: 40px; text-align: right; margin-right: 15px; opacity: 0.5;
                           user-select: none; }}
                .code {{ white-space: pre; }}
            </style>
            </head>
            <body>
            <div class="container">
                <h1>Compile Error</h1>
                <div class="error-location">
                    <div class="file-info">{location}</div>
                    <div class="exc-msg">{message}</div>
                </div>
                {context}
            </div>
            <script src="{client_script}"></script>
            </body>
            </html>
        "#,
        location = html_escape::encode_text(&location),
        message = html_escape::encode_text(&failure.message),
        context = if context_html.is_empty() {
            String::new()
        } else {
            format!("<div class=\"code-context\">{context_html}</div>")
        },
        client_script = CLIENT_SCRIPT_SRC,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_simple_path_literal() {
        let source = "!path '/dashboard'\n<p>{broken</p>\n";
        let routes = recover_routes(source, Path::new("/p/x.pw"), Path::new("/p"), "pw");
        assert_eq!(routes, vec!["/dashboard"]);
    }

    #[test]
    fn recovers_multi_variant_literals() {
        let source = "!path {\n  a: '/alpha',\n  b: '/beta',\n}\nbroken\n";
        let routes = recover_routes(source, Path::new("/p/x.pw"), Path::new("/p"), "pw");
        assert!(routes.contains(&"/alpha".to_string()));
        assert!(routes.contains(&"/beta".to_string()));
    }

    #[test]
    fn falls_back_to_file_route() {
        let routes = recover_routes("<p>broken", Path::new("/p/blog/post.pw"), Path::new("/p"), "pw");
        assert_eq!(routes, vec!["/blog/post"]);
    }

    #[test]
    fn file_route_derivation() {
        let root = Path::new("/pages");
        assert_eq!(
            derive_file_route(Path::new("/pages/index.pw"), root, "pw").unwrap(),
            "/"
        );
        assert_eq!(
            derive_file_route(Path::new("/pages/blog/[id].pw"), root, "pw").unwrap(),
            "/blog/{id}"
        );
        assert_eq!(
            derive_file_route(Path::new("/pages/docs/index.pw"), root, "pw").unwrap(),
            "/docs"
        );
    }

    #[test]
    fn error_page_includes_location_and_message() {
        let failure = CompileFailure::new(Path::new("/p/x.pw"), "something broke", Some(3));
        let html = render_error_page(&failure);
        assert!(html.contains("something broke"));
        assert!(html.contains("/p/x.pw:3"));
        assert!(html.contains(CLIENT_SCRIPT_SRC));
    }
}
