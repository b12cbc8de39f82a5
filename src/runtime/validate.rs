//! Server-side form validation.
//!
//! The validator never raises: it returns `(cleaned, errors)` and the
//! generated submit wrapper binds `errors` onto the page and skips the
//! user's handler when any error exists.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

use super::value::Value;
use crate::parse::{FieldRules, FormSchema};

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^https?://\S+$").unwrap());

/// Resolved reactive rule values, evaluated against page state by the
/// dispatcher before validation runs.
#[derive(Debug, Default)]
pub struct ResolvedRules {
    pub required: Option<bool>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// Validate one field. `None` means the value passed.
pub fn validate_field(
    value: &Value,
    rules: &FieldRules,
    resolved: &ResolvedRules,
) -> Option<String> {
    let required = resolved.required.unwrap_or(rules.required);
    let is_empty = match value {
        Value::None => true,
        Value::Str(s) => s.is_empty(),
        _ => false,
    };

    if is_empty {
        if required {
            return Some(
                rules
                    .title
                    .clone()
                    .unwrap_or_else(|| "This field is required".to_string()),
            );
        }
        return None;
    }

    if rules.input_type == "file" {
        return validate_file(value, rules);
    }

    let text = value.to_display();

    if let Some(pattern) = &rules.pattern {
        let anchored = format!("^(?:{pattern})$");
        match Regex::new(&anchored) {
            Ok(re) if !re.is_match(&text) => {
                return Some(
                    rules
                        .title
                        .clone()
                        .unwrap_or_else(|| "Value does not match the required format".to_string()),
                );
            }
            _ => {}
        }
    }

    if let Some(minlength) = rules.minlength {
        if text.chars().count() < minlength {
            return Some(format!("Must be at least {minlength} characters"));
        }
    }
    if let Some(maxlength) = rules.maxlength {
        if text.chars().count() > maxlength {
            return Some(format!("Must be at most {maxlength} characters"));
        }
    }

    match rules.input_type.as_str() {
        "email" => {
            if !EMAIL_RE.is_match(&text) {
                return Some("Enter a valid email address".to_string());
            }
        }
        "url" => {
            if !URL_RE.is_match(&text) {
                return Some("Enter a valid URL".to_string());
            }
        }
        "number" | "range" => {
            let Ok(number) = text.trim().parse::<f64>() else {
                return Some("Enter a number".to_string());
            };

            let min = resolved
                .min
                .or_else(|| rules.min_value.as_deref().and_then(|m| m.parse().ok()));
            let max = resolved
                .max
                .or_else(|| rules.max_value.as_deref().and_then(|m| m.parse().ok()));

            if let Some(min) = min {
                if number < min {
                    return Some(format!("Must be at least {min}"));
                }
            }
            if let Some(max) = max {
                if number > max {
                    return Some(format!("Must be at most {max}"));
                }
            }
            if let Some(step) = rules.step.as_deref().and_then(|s| s.parse::<f64>().ok()) {
                if step > 0.0 {
                    let base = min.unwrap_or(0.0);
                    let remainder = ((number - base) / step).fract().abs();
                    if remainder > 1e-9 && (1.0 - remainder) > 1e-9 {
                        return Some(format!("Must be a multiple of {step}"));
                    }
                }
            }
        }
        _ => {}
    }

    None
}

/// File records arrive as dicts: `{upload_id, filename, size, content_type}`.
fn validate_file(value: &Value, rules: &FieldRules) -> Option<String> {
    let Value::Dict(record) = value else {
        return Some("Invalid file upload".to_string());
    };

    if let Some(max_size) = rules.max_size {
        let size = record.get("size").and_then(Value::as_int).unwrap_or(0);
        if size as u64 > max_size {
            return Some("File is too large".to_string());
        }
    }

    if let Some(allowed) = &rules.allowed_types {
        let content_type = record
            .get("content_type")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let filename = record
            .get("filename")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();

        let ok = allowed.iter().any(|accept| {
            if let Some(prefix) = accept.strip_suffix("/*") {
                content_type.starts_with(prefix)
            } else if accept.starts_with('.') {
                filename.to_ascii_lowercase().ends_with(&accept.to_ascii_lowercase())
            } else {
                content_type == *accept
            }
        });

        if !ok {
            return Some("File type is not allowed".to_string());
        }
    }

    None
}

/// Validate a whole form. `resolve` evaluates reactive rule expressions
/// against page state. Returns `(cleaned, errors)`; on success `errors` is
/// empty and `cleaned` carries typed values (numbers parsed, checkboxes as
/// booleans).
pub fn validate_form(
    schema: &FormSchema,
    data: &IndexMap<String, Value>,
    mut resolve: impl FnMut(&FieldRules) -> ResolvedRules,
) -> (IndexMap<String, Value>, IndexMap<String, String>) {
    let mut cleaned = IndexMap::new();
    let mut errors = IndexMap::new();

    for (name, rules) in &schema.fields {
        let value = data.get(name).cloned().unwrap_or(Value::None);
        let resolved = resolve(rules);

        if let Some(error) = validate_field(&value, rules, &resolved) {
            errors.insert(name.clone(), error);
            continue;
        }

        cleaned.insert(name.clone(), clean_value(&value, rules));
    }

    (cleaned, errors)
}

fn clean_value(value: &Value, rules: &FieldRules) -> Value {
    match rules.input_type.as_str() {
        "number" | "range" => {
            let text = value.to_display();
            let trimmed = text.trim();
            if let Ok(int) = trimmed.parse::<i64>() {
                Value::Int(int)
            } else if let Ok(float) = trimmed.parse::<f64>() {
                Value::Float(float)
            } else {
                value.clone()
            }
        }
        "checkbox" => Value::Bool(value.truthy() && value.as_str() != Some("off")),
        _ => value.clone(),
    }
}

/// Expand dotted field names into nested dicts:
/// `{"customer.name": x}` → `{"customer": {"name": x}}`.
pub fn parse_nested_data(flat: &IndexMap<String, Value>) -> IndexMap<String, Value> {
    let mut out: IndexMap<String, Value> = IndexMap::new();

    for (key, value) in flat {
        let mut parts = key.split('.').peekable();
        let Some(first) = parts.next() else { continue };

        if parts.peek().is_none() {
            out.insert(first.to_string(), value.clone());
            continue;
        }

        let slot = out
            .entry(first.to_string())
            .or_insert_with(|| Value::Dict(IndexMap::new()));
        let mut current = slot;
        loop {
            let part = parts.next().expect("peeked non-empty");
            let Value::Dict(map) = current else { break };
            if parts.peek().is_none() {
                map.insert(part.to_string(), value.clone());
                break;
            }
            current = map
                .entry(part.to_string())
                .or_insert_with(|| Value::Dict(IndexMap::new()));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_reactive(_: &FieldRules) -> ResolvedRules {
        ResolvedRules::default()
    }

    fn rules(setup: impl FnOnce(&mut FieldRules)) -> FieldRules {
        let mut rules = FieldRules::new("field");
        setup(&mut rules);
        rules
    }

    #[test]
    fn required_rejects_empty() {
        let rules = rules(|r| r.required = true);
        let error = validate_field(&Value::Str(String::new()), &rules, &ResolvedRules::default());
        assert_eq!(error.as_deref(), Some("This field is required"));

        assert!(validate_field(&Value::Str("john".into()), &rules, &ResolvedRules::default()).is_none());
    }

    #[test]
    fn optional_empty_passes() {
        let rules = rules(|r| r.minlength = Some(3));
        assert!(validate_field(&Value::Str(String::new()), &rules, &ResolvedRules::default()).is_none());
    }

    #[test]
    fn pattern_is_anchored() {
        let rules = rules(|r| r.pattern = Some("[A-Z]{3}[0-9]{3}".into()));
        assert!(validate_field(&Value::Str("abc123".into()), &rules, &ResolvedRules::default()).is_some());
        assert!(validate_field(&Value::Str("ABC123".into()), &rules, &ResolvedRules::default()).is_none());
    }

    #[test]
    fn length_bounds() {
        let rules = rules(|r| {
            r.minlength = Some(3);
            r.maxlength = Some(10);
        });
        assert!(validate_field(&Value::Str("ab".into()), &rules, &ResolvedRules::default()).is_some());
        assert!(validate_field(&Value::Str("a".repeat(11).into()), &rules, &ResolvedRules::default()).is_some());
        assert!(validate_field(&Value::Str("hello".into()), &rules, &ResolvedRules::default()).is_none());
    }

    #[test]
    fn email_type() {
        let rules = rules(|r| r.input_type = "email".into());
        assert!(validate_field(&Value::Str("notanemail".into()), &rules, &ResolvedRules::default()).is_some());
        assert!(validate_field(&Value::Str("test@example.com".into()), &rules, &ResolvedRules::default()).is_none());
    }

    #[test]
    fn number_range() {
        let rules = rules(|r| {
            r.input_type = "number".into();
            r.min_value = Some("10".into());
            r.max_value = Some("100".into());
        });
        assert!(validate_field(&Value::Str("5".into()), &rules, &ResolvedRules::default()).is_some());
        assert!(validate_field(&Value::Str("150".into()), &rules, &ResolvedRules::default()).is_some());
        assert!(validate_field(&Value::Str("50".into()), &rules, &ResolvedRules::default()).is_none());
    }

    #[test]
    fn whole_form_validation() {
        let mut schema = FormSchema::default();
        schema.fields.insert(
            "username".into(),
            rules(|r| {
                r.required = true;
                r.minlength = Some(3);
            }),
        );
        schema.fields.insert(
            "email".into(),
            rules(|r| {
                r.required = true;
                r.input_type = "email".into();
            }),
        );

        let mut data = IndexMap::new();
        data.insert("username".to_string(), Value::Str("ab".into()));
        data.insert("email".to_string(), Value::Str("invalid".into()));
        let (_, errors) = validate_form(&schema, &data, no_reactive);
        assert!(errors.contains_key("username"));
        assert!(errors.contains_key("email"));

        let mut data = IndexMap::new();
        data.insert("username".to_string(), Value::Str("john".into()));
        data.insert("email".to_string(), Value::Str("john@example.com".into()));
        let (cleaned, errors) = validate_form(&schema, &data, no_reactive);
        assert!(errors.is_empty());
        assert_eq!(cleaned["username"], Value::Str("john".into()));
    }

    #[test]
    fn numbers_are_cleaned_to_typed_values() {
        let mut schema = FormSchema::default();
        schema.fields.insert(
            "age".into(),
            rules(|r| r.input_type = "number".into()),
        );
        let mut data = IndexMap::new();
        data.insert("age".to_string(), Value::Str("42".into()));
        let (cleaned, errors) = validate_form(&schema, &data, no_reactive);
        assert!(errors.is_empty());
        assert_eq!(cleaned["age"], Value::Int(42));
    }

    #[test]
    fn file_size_limit() {
        let rules = rules(|r| {
            r.input_type = "file".into();
            r.max_size = Some(1_572_864);
        });

        let mut record = IndexMap::new();
        record.insert("filename".to_string(), Value::Str("big.png".into()));
        record.insert("size".to_string(), Value::Int(2_000_000));
        assert!(validate_field(&Value::Dict(record.clone()), &rules, &ResolvedRules::default()).is_some());

        record.insert("size".to_string(), Value::Int(1_000_000));
        assert!(validate_field(&Value::Dict(record), &rules, &ResolvedRules::default()).is_none());
    }

    #[test]
    fn file_type_allow_list() {
        let rules = rules(|r| {
            r.input_type = "file".into();
            r.allowed_types = Some(vec!["image/*".into(), ".pdf".into()]);
        });

        let mut record = IndexMap::new();
        record.insert("filename".to_string(), Value::Str("x.png".into()));
        record.insert("content_type".to_string(), Value::Str("image/png".into()));
        record.insert("size".to_string(), Value::Int(10));
        assert!(validate_field(&Value::Dict(record.clone()), &rules, &ResolvedRules::default()).is_none());

        record.insert("filename".to_string(), Value::Str("x.exe".into()));
        record.insert("content_type".to_string(), Value::Str("application/x-dosexec".into()));
        assert!(validate_field(&Value::Dict(record), &rules, &ResolvedRules::default()).is_some());
    }

    #[test]
    fn nested_data_parsing() {
        let mut flat = IndexMap::new();
        flat.insert("customer.name".to_string(), Value::Str("John".into()));
        flat.insert("customer.email".to_string(), Value::Str("j@e.com".into()));
        flat.insert("shipping.street".to_string(), Value::Str("123 Main St".into()));

        let nested = parse_nested_data(&flat);
        let Value::Dict(customer) = &nested["customer"] else { panic!() };
        assert_eq!(customer["name"], Value::Str("John".into()));
        assert_eq!(customer["email"], Value::Str("j@e.com".into()));
        let Value::Dict(shipping) = &nested["shipping"] else { panic!() };
        assert_eq!(shipping["street"], Value::Str("123 Main St".into()));
    }

    #[test]
    fn reactive_required_overrides_static() {
        let rules = rules(|r| r.required = false);
        let resolved = ResolvedRules {
            required: Some(true),
            ..Default::default()
        };
        assert!(validate_field(&Value::Str(String::new()), &rules, &resolved).is_some());
    }
}
