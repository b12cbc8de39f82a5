//! Attribute rendering: the canonical `name="value"` series with HTML
//! entity escaping, plus spread-dict merging.

use indexmap::IndexMap;

use super::value::Value;

/// Escape an attribute value; the output never contains a raw `<`, `>`,
/// `"` or `&`.
pub fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Render the attribute mapping (plus an optional spread dict) as
/// ` name="value"` pairs, insertion-ordered. Spread entries follow the
/// truthiness rules of reactive attributes: `True` emits `name=""`,
/// `False`/`None` omit, anything else stringifies.
pub fn render_attrs(attrs: &IndexMap<String, String>, spread: Option<&Value>) -> String {
    let mut out = String::new();

    for (name, value) in attrs {
        push_attr(&mut out, name, value);
    }

    if let Some(Value::Dict(extra)) = spread {
        for (name, value) in extra {
            if attrs.contains_key(name) {
                continue;
            }
            match value {
                Value::Bool(true) => push_attr(&mut out, name, ""),
                Value::Bool(false) | Value::None => {}
                other => push_attr(&mut out, name, &other.to_display()),
            }
        }
    }

    out
}

fn push_attr(out: &mut String, name: &str, value: &str) {
    out.push(' ');
    out.push_str(name);
    out.push_str("=\"");
    out.push_str(&escape_attr(value));
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaping_covers_entities() {
        assert_eq!(escape_attr(r#"a<b>"c"&d"#), "a&lt;b&gt;&quot;c&quot;&amp;d");
    }

    #[test]
    fn renders_in_insertion_order() {
        let mut attrs = IndexMap::new();
        attrs.insert("b".to_string(), "2".to_string());
        attrs.insert("a".to_string(), "1".to_string());
        assert_eq!(render_attrs(&attrs, None), r#" b="2" a="1""#);
    }

    #[test]
    fn spread_truthiness() {
        let mut extra = IndexMap::new();
        extra.insert("disabled".to_string(), Value::Bool(true));
        extra.insert("hidden".to_string(), Value::Bool(false));
        extra.insert("title".to_string(), Value::Str("hi".into()));
        extra.insert("nothing".to_string(), Value::None);
        let spread = Value::Dict(extra);

        let rendered = render_attrs(&IndexMap::new(), Some(&spread));
        assert_eq!(rendered, r#" disabled="" title="hi""#);
    }

    #[test]
    fn static_attrs_win_over_spread() {
        let mut attrs = IndexMap::new();
        attrs.insert("class".to_string(), "fixed".to_string());
        let mut extra = IndexMap::new();
        extra.insert("class".to_string(), Value::Str("spread".into()));
        let rendered = render_attrs(&attrs, Some(&Value::Dict(extra)));
        assert_eq!(rendered, r#" class="fixed""#);
    }
}
