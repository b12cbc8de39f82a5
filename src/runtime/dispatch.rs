//! Event dispatch: invoke a handler by name with a validated payload, then
//! re-render.
//!
//! Payload keys coming from DOM datasets are normalized (`arg-0` → `arg0`).
//! Handlers declaring `**kwargs` receive the whole payload; otherwise only
//! keys matching parameter names bind. Bind handlers (`_handle_bind_*`)
//! receive the raw payload; form wrappers (`_form_submit_*`) validate
//! first and bind `errors` onto the page.

use indexmap::IndexMap;

use super::eval::{EvalError, Locals, Machine};
use super::validate::{self, ResolvedRules};
use super::value::Value;
use super::Page;
use crate::code::ast::Span;
use crate::compile::Method;
use crate::parse::FieldRules;

/// Resolves upload ids (arriving in form payloads) into file records.
/// Implemented by the upload store; a field's resolved value reaches the
/// validator as a dict record.
pub trait UploadResolver {
    fn take(&self, id: &str) -> Option<Value>;
}

pub fn dispatch(
    page: &mut Page,
    name: &str,
    payload: &serde_json::Value,
    uploads: Option<&dyn UploadResolver>,
) -> Result<String, EvalError> {
    let method = page.methods.get(name).cloned().ok_or_else(|| EvalError {
        message: format!("handler '{name}' not found"),
        line: 0,
        trace: Vec::new(),
    })?;

    let data = match Value::from_json(payload) {
        Value::Dict(map) => map,
        _ => IndexMap::new(),
    };

    match method {
        Method::Bind { target, use_checked } => {
            let key = if use_checked { "checked" } else { "value" };
            let value = data.get(key).cloned().unwrap_or(Value::None);
            if !value.is_none() {
                let Page {
                    methods,
                    state_names,
                    state,
                    ..
                } = page;
                let mut machine = Machine::new(methods, state_names);
                let mut locals = Locals::new();
                machine.assign(&target, value, state, &mut locals, Span::default())?;
                let console = machine.take_console();
                page.push_console(console);
            }
        }
        Method::FormWrapper { schema, inner } => {
            // Resolve upload ids into file records before validating.
            let mut data = data;
            if let Some(uploads) = uploads {
                for (field, rules) in &schema.fields {
                    if rules.input_type != "file" {
                        continue;
                    }
                    if let Some(Value::Str(id)) = data.get(field) {
                        if let Some(record) = uploads.take(id) {
                            data.insert(field.clone(), record);
                        }
                    }
                }
            }

            let (cleaned, errors) = {
                let Page {
                    methods,
                    state_names,
                    state,
                    ..
                } = page;
                let mut machine = Machine::new(methods, state_names);
                let mut resolve = |rules: &FieldRules| {
                    resolve_rules(rules, &mut machine, state)
                };
                validate::validate_form(&schema, &data, &mut resolve)
            };

            let has_errors = !errors.is_empty();
            page.state.insert(
                "errors".to_string(),
                Value::Dict(
                    errors
                        .into_iter()
                        .map(|(k, v)| (k, Value::Str(v)))
                        .collect(),
                ),
            );

            if !has_errors {
                // `$model` binds cleaned values onto the named state dict.
                if let Some(model) = &schema.model_name {
                    let nested = validate::parse_nested_data(&cleaned);
                    match page.state.get_mut(model) {
                        Some(Value::Dict(existing)) => {
                            for (k, v) in nested {
                                existing.insert(k, v);
                            }
                        }
                        _ => {
                            page.state.insert(model.clone(), Value::Dict(nested));
                        }
                    }
                }

                page.call_method(&inner, vec![Value::Dict(cleaned)], IndexMap::new())?;
            }
        }
        Method::User(func) => {
            // Normalize dataset arg keys, then merge with the payload body.
            let mut call_kwargs: IndexMap<String, Value> = IndexMap::new();
            for (key, value) in &data {
                if key == "args" {
                    continue;
                }
                call_kwargs.insert(key.clone(), value.clone());
            }
            if let Some(Value::Dict(args)) = data.get("args") {
                for (key, value) in args {
                    let normalized = if key.starts_with("arg") {
                        key.replace('-', "")
                    } else {
                        key.clone()
                    };
                    call_kwargs.insert(normalized, value.clone());
                }
            }

            let bound = if func.has_var_kw() {
                call_kwargs
            } else {
                let param_names: Vec<&str> =
                    func.params.iter().map(|p| p.name.as_str()).collect();
                call_kwargs
                    .into_iter()
                    .filter(|(k, _)| param_names.contains(&k.as_str()))
                    .collect()
            };

            page.call_method(name, Vec::new(), bound)?;
        }
    }

    page.render(false)
}

fn resolve_rules(
    rules: &FieldRules,
    machine: &mut Machine,
    state: &mut IndexMap<String, Value>,
) -> ResolvedRules {
    let mut resolved = ResolvedRules::default();
    let mut locals = Locals::new();

    let mut eval_src = |src: &str| -> Option<Value> {
        let expr = crate::code::parse_expression(src).ok()?;
        machine.eval(&expr, state, &mut locals).ok()
    };

    if let Some(src) = &rules.required_expr {
        resolved.required = eval_src(src).map(|v| v.truthy());
    }
    if let Some(src) = &rules.min_expr {
        resolved.min = eval_src(src).and_then(|v| v.as_float());
    }
    if let Some(src) = &rules.max_expr {
        resolved.max = eval_src(src).and_then(|v| v.as_float());
    }

    resolved
}

#[cfg(test)]
mod tests {
    use super::super::testutil::make_page;
    use super::*;

    #[test]
    fn dispatch_invokes_handler_and_rerenders() {
        let mut page = make_page(indoc::indoc! {"
            <p>{count}</p>
            ---
            count = 0

            def increment():
                count += 1
            ---
        "});

        let html = page
            .handle_event("increment", &serde_json::json!({}), None)
            .unwrap();
        assert_eq!(page.state["count"], Value::Int(1));
        assert!(html.contains("<p>1</p>"));
    }

    #[test]
    fn arg_keys_are_normalized() {
        let mut page = make_page(indoc::indoc! {"
            <p>{last}</p>
            ---
            last = 0

            def pick(arg0):
                last = arg0
            ---
        "});

        page.handle_event("pick", &serde_json::json!({"args": {"arg-0": 7}}), None)
            .unwrap();
        assert_eq!(page.state["last"], Value::Int(7));
    }

    #[test]
    fn lifted_handler_round_trip() {
        // The full scenario: template lifts delete(item.id), dispatch
        // passes the serialized argument back in.
        let mut page = make_page(indoc::indoc! {"
            <ul><li $for={item in items}>
                <button @click={remove(item.id)}>X</button>
            </li></ul>
            ---
            items = [{'id': 7, 'name': 'a'}]
            removed = None

            def remove(id):
                removed = id
            ---
        "});

        let html = page.render(true).unwrap();
        assert!(html.contains(r#"data-on-click="_handler_0""#));
        assert!(html.contains(r#"data-arg-0="7""#));

        page.handle_event("_handler_0", &serde_json::json!({"args": {"arg-0": 7}}), None)
            .unwrap();
        assert_eq!(page.state["removed"], Value::Int(7));
    }

    #[test]
    fn kwargs_handler_receives_everything() {
        let mut page = make_page(indoc::indoc! {"
            <p>x</p>
            ---
            seen = None

            def grab(**data):
                seen = data
            ---
        "});

        page.handle_event("grab", &serde_json::json!({"a": 1, "b": 2}), None)
            .unwrap();
        let Value::Dict(seen) = &page.state["seen"] else { panic!() };
        assert_eq!(seen["a"], Value::Int(1));
        assert_eq!(seen["b"], Value::Int(2));
    }

    #[test]
    fn non_matching_keys_are_dropped() {
        let mut page = make_page(indoc::indoc! {"
            <p>x</p>
            ---
            got = None

            def narrow(value):
                got = value
            ---
        "});

        page.handle_event(
            "narrow",
            &serde_json::json!({"value": "yes", "extra": "ignored"}),
            None,
        )
        .unwrap();
        assert_eq!(page.state["got"], Value::Str("yes".into()));
    }

    #[test]
    fn bind_handler_assigns_value() {
        let mut page = make_page("<input $bind={name}>\n---\nname = ''\n---\n");

        page.handle_event("_handle_bind_1", &serde_json::json!({"value": "Ada"}), None)
            .unwrap();
        assert_eq!(page.state["name"], Value::Str("Ada".into()));
    }

    #[test]
    fn checkbox_bind_assigns_checked() {
        let mut page =
            make_page("<input type=\"checkbox\" $bind={agree}>\n---\nagree = False\n---\n");

        page.handle_event("_handle_bind_1", &serde_json::json!({"checked": true}), None)
            .unwrap();
        assert_eq!(page.state["agree"], Value::Bool(true));
    }

    #[test]
    fn form_validation_blocks_and_binds_errors() {
        let src = indoc::indoc! {"
            <form @submit={save}><input name=\"email\" type=\"email\" required></form>
            ---
            saved = None

            def save(cleaned_data):
                saved = cleaned_data
            ---
        "};

        // Empty email: no call, error bound.
        let mut page = make_page(src);
        page.handle_event("_form_submit_0", &serde_json::json!({"email": ""}), None)
            .unwrap();
        assert_eq!(page.state["saved"], Value::None);
        let Value::Dict(errors) = &page.state["errors"] else { panic!() };
        assert_eq!(errors["email"], Value::Str("This field is required".into()));

        // Valid email: handler called with cleaned data, errors cleared.
        let mut page = make_page(src);
        page.handle_event(
            "_form_submit_0",
            &serde_json::json!({"email": "x@y.zz"}),
            None,
        )
        .unwrap();
        let Value::Dict(saved) = &page.state["saved"] else { panic!() };
        assert_eq!(saved["email"], Value::Str("x@y.zz".into()));
        let Value::Dict(errors) = &page.state["errors"] else { panic!() };
        assert!(errors.is_empty());
    }

    #[test]
    fn unknown_handler_errors() {
        let mut page = make_page("<p>x</p>\n");
        let err = page
            .handle_event("nope", &serde_json::json!({}), None)
            .unwrap_err();
        assert!(err.message.contains("nope"));
    }

    #[test]
    fn handler_errors_carry_trace_lines() {
        let mut page = make_page(indoc::indoc! {"
            <p>x</p>
            ---
            def boom():
                missing_name
            ---
        "});

        let err = page
            .handle_event("boom", &serde_json::json!({}), None)
            .unwrap_err();
        assert!(err.message.contains("missing_name"));
        assert_eq!(err.line, 4);
        assert_eq!(err.trace.len(), 1);
        assert_eq!(err.trace[0].name, "boom");
    }
}
