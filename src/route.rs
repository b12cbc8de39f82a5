//! The route registry: URL patterns with typed parameters, mapped to
//! compiled pages (or compile-error stand-ins).
//!
//! Patterns accept `:name`, `:name:int`, `:name:str`, `{name}`, `{name:int}`
//! and `{name:str}`; `int` matches `\d+`, `str` (the default) matches
//! `[^/]+`. Matching is strict and end-anchored.
//!
//! The route table lives behind an `ArcSwap`: request tasks read a
//! consistent snapshot per `match_path` call, while the hot-reload watcher
//! swaps in updated tables.

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use indexmap::IndexMap;
use regex::Regex;

use crate::compile::{CompileFailure, LoadedPage};
use crate::prelude::*;

/// What a route points at: a healthy page, or the failure that took its
/// source down.
#[derive(Debug, Clone)]
pub enum PageTarget {
    Page(Arc<LoadedPage>),
    CompileError(Arc<CompileFailure>),
}

impl PageTarget {
    pub fn file_path(&self) -> &Path {
        match self {
            PageTarget::Page(page) => &page.program.file_path,
            PageTarget::CompileError(failure) => &failure.file_path,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Route {
    pub pattern: String,
    pub name: Option<String>,
    pub target: PageTarget,
    regex: Arc<Regex>,
}

impl Route {
    pub fn new(pattern: &str, target: PageTarget, name: Option<String>) -> Result<Self> {
        Ok(Route {
            pattern: pattern.to_string(),
            name,
            target,
            regex: Arc::new(compile_pattern(pattern)?),
        })
    }

    pub fn matches(&self, path: &str) -> Option<IndexMap<String, String>> {
        let captures = self.regex.captures(path)?;
        let mut params = IndexMap::new();
        for name in self.regex.capture_names().flatten() {
            if let Some(value) = captures.name(name) {
                params.insert(name.to_string(), value.as_str().to_string());
            }
        }
        Some(params)
    }
}

/// A successful match: the target, extracted params, and the `!path`
/// variant name (if any).
pub type RouteMatch = (PageTarget, IndexMap<String, String>, Option<String>);

#[derive(Default)]
pub struct Registry {
    routes: ArcSwap<Vec<Route>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every `!path` entry of a compiled page. Pages without an
    /// explicit `!path` are registered by the caller via [`add_route`]
    /// (file-based routing).
    ///
    /// [`add_route`]: Registry::add_route
    pub fn add_page(&self, page: &Arc<LoadedPage>) -> Result<()> {
        let Some(routes) = &page.program.routes else {
            return Ok(());
        };

        for (name, pattern) in routes {
            self.add_route(pattern, PageTarget::Page(page.clone()), Some(name.clone()))?;
        }
        Ok(())
    }

    pub fn add_route(&self, pattern: &str, target: PageTarget, name: Option<String>) -> Result<()> {
        let route = Route::new(pattern, target, name)?;
        self.routes.rcu(|routes| {
            let mut routes = (**routes).clone();
            routes.push(route.clone());
            routes
        });
        Ok(())
    }

    /// Match a request path. First registered route wins.
    pub fn match_path(&self, path: &str) -> Option<RouteMatch> {
        let routes = self.routes.load();
        for route in routes.iter() {
            if let Some(params) = route.matches(path) {
                return Some((route.target.clone(), params, route.name.clone()));
            }
        }
        None
    }

    /// Remove every route whose page came from `file_path`.
    pub fn remove_routes_for_file(&self, file_path: &Path) {
        self.routes.rcu(|routes| {
            routes
                .iter()
                .filter(|r| r.target.file_path() != file_path)
                .cloned()
                .collect::<Vec<_>>()
        });
    }

    pub fn route_count(&self) -> usize {
        self.routes.load().len()
    }
}

/// Compile a route pattern into an anchored regex with named groups.
pub fn compile_pattern(pattern: &str) -> Result<Regex> {
    if pattern == "/" {
        return Ok(Regex::new("^/$").expect("static regex"));
    }

    let mut regex_parts = Vec::new();
    for part in pattern.split('/') {
        if part.is_empty() {
            continue;
        }

        let param = if let Some(content) = part.strip_prefix(':') {
            Some(content.split_once(':').unwrap_or((content, "str")))
        } else if let Some(content) = part
            .strip_prefix('{')
            .and_then(|p| p.strip_suffix('}'))
        {
            Some(content.split_once(':').unwrap_or((content, "str")))
        } else {
            None
        };

        match param {
            Some((name, type_name)) => {
                ensure!(
                    name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'),
                    "invalid parameter name '{name}' in route pattern '{pattern}'"
                );
                let matcher = type_regex(type_name);
                regex_parts.push(format!("(?P<{name}>{matcher})"));
            }
            None => regex_parts.push(regex::escape(part)),
        }
    }

    let regex_str = format!("^/{}$", regex_parts.join("/"));
    Regex::new(&regex_str).wrap_err_with(|| format!("could not compile route pattern '{pattern}'"))
}

fn type_regex(type_name: &str) -> &'static str {
    match type_name {
        "int" => r"\d+",
        _ => r"[^/]+",
    }
}

/// Normalize a pattern to `{name}` placeholder form and substitute params.
/// Exposed to page code as `url[variant].format(...)`.
pub fn format_pattern(pattern: &str, params: &IndexMap<String, String>) -> String {
    let mut out = String::new();
    for (i, part) in pattern.split('/').enumerate() {
        if i > 0 {
            out.push('/');
        }

        let name = if let Some(content) = part.strip_prefix(':') {
            Some(content.split_once(':').map(|(n, _)| n).unwrap_or(content))
        } else {
            part.strip_prefix('{')
                .and_then(|p| p.strip_suffix('}'))
                .map(|content| content.split_once(':').map(|(n, _)| n).unwrap_or(content))
        };

        match name {
            Some(name) => match params.get(name) {
                Some(value) => out.push_str(value),
                None => {
                    out.push('{');
                    out.push_str(name);
                    out.push('}');
                }
            },
            None => out.push_str(part),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_match(pattern: &str, path: &str, expected: &[(&str, &str)]) {
        let regex = compile_pattern(pattern).unwrap();
        let captures = regex.captures(path).unwrap_or_else(|| {
            panic!("pattern {pattern} should match {path}");
        });
        for (name, value) in expected {
            assert_eq!(&captures.name(name).unwrap().as_str(), value);
        }
    }

    #[test]
    fn literal_patterns() {
        assert_match("/", "/", &[]);
        assert_match("/about", "/about", &[]);
        assert!(compile_pattern("/about").unwrap().captures("/about/x").is_none());
    }

    #[test]
    fn colon_params() {
        assert_match("/users/:id", "/users/42", &[("id", "42")]);
        assert_match("/users/:id:int", "/users/42", &[("id", "42")]);
        assert!(compile_pattern("/users/:id:int")
            .unwrap()
            .captures("/users/abc")
            .is_none());
    }

    #[test]
    fn brace_params() {
        assert_match("/posts/{slug}", "/posts/hello-world", &[("slug", "hello-world")]);
        assert_match("/posts/{id:int}", "/posts/7", &[("id", "7")]);
        assert!(compile_pattern("/posts/{id:int}")
            .unwrap()
            .captures("/posts/x7")
            .is_none());
    }

    #[test]
    fn int_params_match_only_digits() {
        let regex = compile_pattern("/n/{id:int}").unwrap();
        for path in ["/n/0", "/n/123456"] {
            let captures = regex.captures(path).unwrap();
            assert!(captures
                .name("id")
                .unwrap()
                .as_str()
                .chars()
                .all(|c| c.is_ascii_digit()));
        }
        assert!(regex.captures("/n/12a").is_none());
    }

    #[test]
    fn str_params_stop_at_slashes() {
        let regex = compile_pattern("/a/{x}/b").unwrap();
        assert!(regex.captures("/a/one/b").is_some());
        assert!(regex.captures("/a/one/two/b").is_none());
    }

    #[test]
    fn format_pattern_substitutes() {
        let mut params = IndexMap::new();
        params.insert("id".to_string(), "9".to_string());
        assert_eq!(format_pattern("/posts/{id:int}", &params), "/posts/9");
        assert_eq!(format_pattern("/posts/:id", &params), "/posts/9");
        assert_eq!(
            format_pattern("/posts/{slug}", &IndexMap::new()),
            "/posts/{slug}"
        );
    }
}
