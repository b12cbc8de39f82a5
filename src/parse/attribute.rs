//! Attribute classification: decide, by name shape, whether an attribute is
//! an event binding, a directive (`$if`, `$for`, ...), a two-way bind, a
//! reactive value, a spread, or a plain literal.

use ahash::AHashSet;
use indexmap::IndexMap;
use once_cell::sync::Lazy;

use super::error::Diagnostic;
use super::{EventAttr, SpecialAttr};
use crate::prelude::*;

static DEFAULT_MODIFIERS: Lazy<AHashSet<&'static str>> = Lazy::new(|| {
    [
        "prevent", "stop", "self", "once", "capture", "passive", "enter", "escape", "debounce",
        "throttle",
    ]
    .into_iter()
    .collect()
});

/// Registry of recognized event modifiers. Extensions may register more
/// without recompiling the core.
#[derive(Debug, Clone, Default)]
pub struct EventModifiers {
    extra: AHashSet<String>,
}

impl EventModifiers {
    pub fn register(&mut self, name: impl Into<String>) {
        self.extra.insert(name.into());
    }

    pub fn is_known(&self, name: &str) -> bool {
        DEFAULT_MODIFIERS.contains(name) || self.extra.contains(name)
    }
}

/// Split raw attributes into plain literals and classified specials.
pub fn classify_attributes(
    attrs: &IndexMap<String, String>,
    tag: &str,
    modifiers: &EventModifiers,
    line: u32,
    column: u32,
    diagnostics: &mut Vec<Diagnostic>,
) -> (IndexMap<String, String>, Vec<SpecialAttr>) {
    let mut plain = IndexMap::new();
    let mut special = Vec::new();

    for (name, value) in attrs {
        match classify_one(name, value, tag, modifiers, line, column, diagnostics) {
            Classified::Special(attr) => special.push(attr),
            Classified::Plain => {
                plain.insert(name.clone(), value.clone());
            }
            Classified::Dropped => {}
        }
    }

    (plain, special)
}

enum Classified {
    Special(SpecialAttr),
    Plain,
    Dropped,
}

fn classify_one(
    name: &str,
    value: &str,
    tag: &str,
    modifiers: &EventModifiers,
    line: u32,
    column: u32,
    diagnostics: &mut Vec<Diagnostic>,
) -> Classified {
    // Event bindings: @click, @submit.prevent, ...
    if let Some(rest) = name.strip_prefix('@') {
        let mut parts = rest.split('.');
        let event_type = parts.next().unwrap_or_default().to_string();

        if event_type.is_empty() {
            diagnostics.push(Diagnostic::new("event attribute is missing a name", line, column));
            return Classified::Dropped;
        }

        let mut mods = Vec::new();
        for modifier in parts {
            if modifiers.is_known(modifier) {
                mods.push(modifier.to_string());
            } else {
                diagnostics.push(Diagnostic::new(
                    format!("unknown event modifier '.{modifier}' on @{event_type}"),
                    line,
                    column,
                ));
            }
        }

        let Some(handler) = strip_braces(value) else {
            diagnostics.push(Diagnostic::new(
                format!("@{event_type} value must be wrapped in braces, e.g. @{event_type}={{handler}}"),
                line,
                column,
            ));
            return Classified::Dropped;
        };

        return Classified::Special(SpecialAttr::Event(EventAttr {
            event_type,
            handler: handler.to_string(),
            modifiers: mods,
            schema: None,
        }));
    }

    // Spread, rewritten to a reserved attribute by the template tokenizer.
    if name == RESERVED_SPREAD_ATTR {
        let inner = strip_braces(value).unwrap_or(value);
        let expr = inner.trim_start_matches("**").trim();
        return Classified::Special(SpecialAttr::Spread {
            expr: expr.to_string(),
        });
    }

    // `$head` on a `<slot>` marks the appending head slot; it stays a plain
    // marker attribute.
    if name == "$head" && value.is_empty() {
        return Classified::Plain;
    }

    // `$`-directives.
    if let Some(directive) = name.strip_prefix('$') {
        let Some(inner) = strip_braces(value) else {
            diagnostics.push(Diagnostic::new(
                format!("${directive} value must be wrapped in braces"),
                line,
                column,
            ));
            return Classified::Dropped;
        };
        let inner = inner.trim();

        return match directive {
            "if" => Classified::Special(SpecialAttr::If {
                condition: inner.to_string(),
            }),
            "show" => Classified::Special(SpecialAttr::Show {
                condition: inner.to_string(),
            }),
            "for" => match split_for(inner) {
                Some((loop_vars, iterable)) => Classified::Special(SpecialAttr::For {
                    loop_vars: loop_vars.to_string(),
                    iterable: iterable.to_string(),
                    is_template_tag: tag.eq_ignore_ascii_case("template"),
                }),
                None => {
                    diagnostics.push(Diagnostic::new(
                        "$for expects the form $for={var in iterable}",
                        line,
                        column,
                    ));
                    Classified::Dropped
                }
            },
            "key" => Classified::Special(SpecialAttr::Key {
                expr: inner.to_string(),
            }),
            "bind" => Classified::Special(SpecialAttr::Bind {
                variable: inner.to_string(),
                progress: false,
            }),
            "bind:progress" => Classified::Special(SpecialAttr::Bind {
                variable: inner.to_string(),
                progress: true,
            }),
            "model" => Classified::Special(SpecialAttr::Model {
                name: inner.to_string(),
            }),
            other => {
                diagnostics.push(Diagnostic::new(
                    format!("unknown template directive '${other}'"),
                    line,
                    column,
                ));
                Classified::Dropped
            }
        };
    }

    // Reactive attribute: the whole value is a single brace group.
    if let Some(expr) = reactive_value(value) {
        return Classified::Special(SpecialAttr::Reactive {
            name: name.to_string(),
            expr: expr.to_string(),
        });
    }

    Classified::Plain
}

/// `{expr}` → `expr`; anything else is `None`.
fn strip_braces(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('{') && trimmed.ends_with('}') {
        Some(trimmed[1..trimmed.len() - 1].trim())
    } else {
        None
    }
}

/// A value is reactive when it is exactly one top-level brace group.
fn reactive_value(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if !(trimmed.starts_with('{') && trimmed.ends_with('}')) {
        return None;
    }
    // Reject `{a} and {b}` style values; those interpolate instead.
    if trimmed.matches('{').count() != 1 {
        return None;
    }
    Some(trimmed[1..trimmed.len() - 1].trim())
}

/// Split `item in items` / `k, v in d.items()` at the first top-level ` in `.
fn split_for(inner: &str) -> Option<(&str, &str)> {
    let bytes = inner.as_bytes();
    let mut depth = 0i32;
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i + 4 <= bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'(' | b'[' | b'{' => depth += 1,
                b')' | b']' | b'}' => depth -= 1,
                b' ' if depth == 0 && inner[i..].starts_with(" in ") => {
                    let vars = inner[..i].trim();
                    let iterable = inner[i + 4..].trim();
                    if vars.is_empty() || iterable.is_empty() {
                        return None;
                    }
                    return Some((vars, iterable));
                }
                _ => {}
            },
        }
        i += 1;
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(name: &str, value: &str) -> (IndexMap<String, String>, Vec<SpecialAttr>) {
        let mut attrs = IndexMap::new();
        attrs.insert(name.to_string(), value.to_string());
        let mut diagnostics = Vec::new();
        classify_attributes(
            &attrs,
            "div",
            &EventModifiers::default(),
            1,
            0,
            &mut diagnostics,
        )
    }

    #[test]
    fn event_with_modifiers() {
        let (_, special) = classify("@submit.prevent.once", "{save}");
        let SpecialAttr::Event(event) = &special[0] else { panic!() };
        assert_eq!(event.event_type, "submit");
        assert_eq!(event.handler, "save");
        assert_eq!(event.modifiers, vec!["prevent", "once"]);
    }

    #[test]
    fn unknown_modifier_is_diagnosed() {
        let mut attrs = IndexMap::new();
        attrs.insert("@click.bogus".to_string(), "{go}".to_string());
        let mut diagnostics = Vec::new();
        let (_, special) = classify_attributes(
            &attrs,
            "button",
            &EventModifiers::default(),
            3,
            0,
            &mut diagnostics,
        );
        assert_eq!(special.len(), 1);
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].message.contains("bogus"));
    }

    #[test]
    fn registered_modifier_is_accepted() {
        let mut modifiers = EventModifiers::default();
        modifiers.register("longpress");
        let mut attrs = IndexMap::new();
        attrs.insert("@click.longpress".to_string(), "{go}".to_string());
        let mut diagnostics = Vec::new();
        classify_attributes(&attrs, "button", &modifiers, 1, 0, &mut diagnostics);
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn event_without_braces_is_an_error() {
        let (plain, special) = classify("@click", "handler");
        assert!(plain.is_empty());
        assert!(special.is_empty());
    }

    #[test]
    fn dollar_directives() {
        let (_, special) = classify("$if", "{count > 0}");
        assert!(matches!(&special[0], SpecialAttr::If { condition } if condition == "count > 0"));

        let (_, special) = classify("$for", "{i in items}");
        let SpecialAttr::For { loop_vars, iterable, .. } = &special[0] else { panic!() };
        assert_eq!(loop_vars, "i");
        assert_eq!(iterable, "items");

        let (_, special) = classify("$bind:progress", "{pct}");
        assert!(matches!(&special[0], SpecialAttr::Bind { progress: true, .. }));
    }

    #[test]
    fn tuple_loop_vars() {
        let (_, special) = classify("$for", "{k, v in d.items()}");
        let SpecialAttr::For { loop_vars, iterable, .. } = &special[0] else { panic!() };
        assert_eq!(loop_vars, "k, v");
        assert_eq!(iterable, "d.items()");
    }

    #[test]
    fn reactive_versus_interpolated() {
        let (plain, special) = classify("disabled", "{off}");
        assert!(plain.is_empty());
        assert!(matches!(&special[0], SpecialAttr::Reactive { name, expr } if name == "disabled" && expr == "off"));

        // Mixed text interpolates; it is not a reactive attribute.
        let (plain, special) = classify("class", "btn {kind}");
        assert!(special.is_empty());
        assert_eq!(plain["class"], "btn {kind}");
    }

    #[test]
    fn plain_attribute_passes_through() {
        let (plain, special) = classify("href", "/about");
        assert!(special.is_empty());
        assert_eq!(plain["href"], "/about");
    }

    #[test]
    fn spread_attribute() {
        let (_, special) = classify(crate::common::RESERVED_SPREAD_ATTR, "{**extra}");
        assert!(matches!(&special[0], SpecialAttr::Spread { expr } if expr == "extra"));
    }
}
