//! The render pass: a single walk over a page's render plan, appending
//! string fragments to an output buffer.
//!
//! Text interpolations stringify without escaping (template text is source
//! HTML); attribute values are entity-escaped by [`attrs::render_attrs`].
//! A `<select>` with `$bind` propagates its bound value down so the right
//! `<option>` gains `selected`.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use super::attrs;
use super::eval::{self, EvalError, Locals, Machine};
use super::styles::StyleCollector;
use super::value::Value;
use super::{Page, PageOptions, RequestCtx, SlotEntry};
use crate::code::ast::Span;
use crate::compile::{
    AttrPart, AttrValue, BindProp, ElementOp, EventOp, LoadedPage, RenderOp,
};

pub(crate) struct RenderEnv<'a> {
    pub slots: &'a HashMap<String, IndexMap<String, Vec<SlotEntry>>>,
    pub passed_slots: &'a IndexMap<String, String>,
    pub styles: &'a StyleCollector,
    pub request: &'a RequestCtx,
    pub context: &'a IndexMap<String, Value>,
}

pub(crate) struct Renderer<'a, 'm> {
    env: &'a RenderEnv<'a>,
    machine: &'a mut Machine<'m>,
}

impl<'a, 'm> Renderer<'a, 'm> {
    pub fn new(env: &'a RenderEnv<'a>, machine: &'a mut Machine<'m>) -> Self {
        Renderer { env, machine }
    }

    pub fn render_plan(
        &mut self,
        state: &mut IndexMap<String, Value>,
        owner: &Arc<LoadedPage>,
        ops: &[RenderOp],
    ) -> Result<String, EvalError> {
        let mut out = String::new();
        let mut locals = Locals::new();
        self.render_ops(ops, &mut out, state, &mut locals, owner, None)?;
        Ok(out)
    }

    fn render_ops(
        &mut self,
        ops: &[RenderOp],
        out: &mut String,
        state: &mut IndexMap<String, Value>,
        locals: &mut Locals,
        owner: &Arc<LoadedPage>,
        bound: Option<&Value>,
    ) -> Result<(), EvalError> {
        for op in ops {
            match op {
                RenderOp::Text(text) => out.push_str(text),
                RenderOp::Interp {
                    expr,
                    format_spec,
                    line: _,
                } => {
                    let value = self.machine.eval(expr, state, locals)?;
                    match format_spec {
                        Some(spec) => out.push_str(&apply_format(&value, spec)),
                        None => out.push_str(&value.to_display()),
                    }
                }
                RenderOp::If { cond, body } => {
                    if self.machine.eval(cond, state, locals)?.truthy() {
                        self.render_ops(body, out, state, locals, owner, bound)?;
                    }
                }
                RenderOp::For {
                    targets,
                    iter,
                    body,
                    line,
                } => {
                    let iterable = self.machine.eval(iter, state, locals)?;
                    let span = Span::new(*line, 0);
                    let items = iterable.iterate().ok_or_else(|| {
                        self.machine.fail_at(
                            span,
                            format!("'{}' object is not iterable", iterable.type_name()),
                        )
                    })?;

                    locals.push();
                    for item in items {
                        eval::bind_loop_targets(targets, item, locals, span, self.machine.trace())?;
                        self.render_ops(body, out, state, locals, owner, bound)?;
                    }
                    locals.pop();
                }
                RenderOp::RegisterStyle { css } => {
                    if let Some(scope_id) = &owner.program.scope_id {
                        self.env
                            .styles
                            .lock()
                            .expect("style collector poisoned")
                            .add(scope_id, css);
                    }
                }
                RenderOp::Slot {
                    name,
                    layout_id,
                    append,
                    default,
                } => {
                    self.render_slot(
                        name, layout_id.as_deref(), *append, default, out, state, locals, owner,
                    )?;
                }
                RenderOp::Element(element) => {
                    self.render_element(element, out, state, locals, owner, bound)?;
                }
                RenderOp::Component {
                    tag,
                    props,
                    reactive,
                    events,
                    slots,
                    line,
                } => {
                    self.render_component(
                        tag, props, reactive, events, slots, *line, out, state, locals, owner,
                    )?;
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn render_slot(
        &mut self,
        name: &str,
        _layout_id: Option<&str>,
        append: bool,
        default: &[RenderOp],
        out: &mut String,
        state: &mut IndexMap<String, Value>,
        locals: &mut Locals,
        owner: &Arc<LoadedPage>,
    ) -> Result<(), EvalError> {
        // Component slots are pre-rendered by the parent.
        if let Some(pre_rendered) = self.env.passed_slots.get(name) {
            out.push_str(pre_rendered);
            return Ok(());
        }

        let own_id = owner.program.layout_id.clone().unwrap_or_default();
        let entries = self
            .env
            .slots
            .get(&own_id)
            .and_then(|by_name| by_name.get(name));

        match entries {
            Some(entries) if !entries.is_empty() => {
                if append {
                    for entry in entries {
                        self.render_fill(entry, out, state, locals)?;
                    }
                } else {
                    let entry = entries.last().expect("checked non-empty");
                    self.render_fill(entry, out, state, locals)?;
                }
            }
            _ => self.render_ops(default, out, state, locals, owner, None)?,
        }
        Ok(())
    }

    fn render_fill(
        &mut self,
        entry: &SlotEntry,
        out: &mut String,
        state: &mut IndexMap<String, Value>,
        locals: &mut Locals,
    ) -> Result<(), EvalError> {
        let fill = &entry.owner.program.slot_fills[entry.fill_index];
        // The fill renders with the filler's own scope and component table.
        self.render_ops(&fill.body, out, state, locals, &entry.owner, None)
    }

    #[allow(clippy::too_many_arguments)]
    fn render_element(
        &mut self,
        element: &ElementOp,
        out: &mut String,
        state: &mut IndexMap<String, Value>,
        locals: &mut Locals,
        owner: &Arc<LoadedPage>,
        bound: Option<&Value>,
    ) -> Result<(), EvalError> {
        let mut attrs: IndexMap<String, String> = IndexMap::new();
        let mut child_bound: Option<Value> = None;

        if element.scoped {
            if let Some(scope_id) = &owner.program.scope_id {
                attrs.insert(format!("data-ph-{scope_id}"), String::new());
            }
        }

        for (name, value) in &element.attrs {
            attrs.insert(name.clone(), self.eval_attr_value(value, state, locals)?);
        }

        if let Some(bind) = &element.bind {
            match &bind.prop {
                BindProp::Value(expr) => {
                    let value = self.machine.eval(expr, state, locals)?;
                    if element.tag == "select" {
                        child_bound = Some(value.clone());
                    }
                    attrs.insert("value".to_string(), value.to_display());
                    attrs.insert("data-on-input".to_string(), bind.handler.clone());
                }
                BindProp::Checked(expr) => {
                    let value = self.machine.eval(expr, state, locals)?;
                    if value.truthy() {
                        attrs.insert("checked".to_string(), String::new());
                    }
                    attrs.insert("data-on-change".to_string(), bind.handler.clone());
                }
                BindProp::Progress => {
                    attrs.insert("data-on-upload-progress".to_string(), bind.handler.clone());
                }
            }
        }

        if let Some(key) = &element.key {
            let value = self.machine.eval(key, state, locals)?;
            attrs.insert("id".to_string(), value.to_display());
        }

        for event in &element.events {
            self.event_attrs(event, &mut attrs, state, locals)?;
        }

        for (name, expr) in &element.reactive {
            let value = self.machine.eval(expr, state, locals)?;
            apply_reactive(&mut attrs, name, &value);
        }

        if let Some(show) = &element.show {
            if !self.machine.eval(show, state, locals)?.truthy() {
                let style = attrs.get("style").cloned().unwrap_or_default();
                attrs.insert("style".to_string(), format!("{style}; display: none"));
            }
        }

        if element.tag == "option" {
            if let (Some(bound), Some(value)) = (bound, attrs.get("value")) {
                if *value == bound.to_display() {
                    attrs.insert("selected".to_string(), String::new());
                }
            }
        }

        let spread_value = match (&element.spread, element.implicit_spread) {
            (Some(expr), _) => Some(self.machine.eval(expr, state, locals)?),
            (None, true) => state.get("attrs").cloned(),
            _ => None,
        };

        out.push('<');
        out.push_str(&element.tag);
        out.push_str(&attrs::render_attrs(&attrs, spread_value.as_ref()));
        out.push('>');

        let next_bound = child_bound.as_ref().or(bound);
        self.render_ops(&element.children, out, state, locals, owner, next_bound)?;

        if !element.is_void {
            out.push_str("</");
            out.push_str(&element.tag);
            out.push('>');
        }

        Ok(())
    }

    fn event_attrs(
        &mut self,
        event: &EventOp,
        attrs: &mut IndexMap<String, String>,
        state: &mut IndexMap<String, Value>,
        locals: &mut Locals,
    ) -> Result<(), EvalError> {
        let event_type = &event.event_type;

        if let [handler] = event.handlers.as_slice() {
            attrs.insert(format!("data-on-{event_type}"), handler.name.clone());

            if !handler.modifiers.is_empty() {
                attrs.insert(
                    format!("data-modifiers-{event_type}"),
                    handler.modifiers.join(" "),
                );
            }

            for (i, arg) in handler.args.iter().enumerate() {
                let value = self.machine.eval(arg, state, locals)?;
                let json = serde_json::to_string(&value.to_json()).unwrap_or_default();
                attrs.insert(format!("data-arg-{i}"), json);
            }
            return Ok(());
        }

        // Multiple handlers on one event: a JSON array payload.
        let mut handler_list = Vec::new();
        let mut all_modifiers: Vec<String> = Vec::new();
        for handler in &event.handlers {
            let mut entry = serde_json::json!({
                "handler": handler.name,
                "modifiers": handler.modifiers,
            });
            if !handler.args.is_empty() {
                let mut args = Vec::new();
                for arg in &handler.args {
                    args.push(self.machine.eval(arg, state, locals)?.to_json());
                }
                entry["args"] = serde_json::Value::Array(args);
            }
            handler_list.push(entry);

            for modifier in &handler.modifiers {
                if !all_modifiers.contains(modifier) {
                    all_modifiers.push(modifier.clone());
                }
            }
        }

        attrs.insert(
            format!("data-on-{event_type}"),
            serde_json::to_string(&handler_list).unwrap_or_default(),
        );
        if !all_modifiers.is_empty() {
            attrs.insert(
                format!("data-modifiers-{event_type}"),
                all_modifiers.join(" "),
            );
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn render_component(
        &mut self,
        tag: &str,
        props: &[(String, AttrValue)],
        reactive: &[(String, crate::code::Expr)],
        events: &[EventOp],
        slots: &[(String, Vec<RenderOp>)],
        line: u32,
        out: &mut String,
        state: &mut IndexMap<String, Value>,
        locals: &mut Locals,
        owner: &Arc<LoadedPage>,
    ) -> Result<(), EvalError> {
        let component = owner.components.get(tag).ok_or_else(|| {
            self.machine
                .fail_at(Span::new(line, 0), format!("unknown component '<{tag}>'"))
        })?;

        let mut prop_values = IndexMap::new();
        for (name, value) in props {
            prop_values.insert(
                name.clone(),
                Value::Str(self.eval_attr_value(value, state, locals)?),
            );
        }
        // Reactive props keep their evaluated type.
        for (name, expr) in reactive {
            prop_values.insert(name.clone(), self.machine.eval(expr, state, locals)?);
        }

        // Event wiring passes through as data-on-* props, landing on the
        // component's root element via the implicit spread.
        let mut event_attrs = IndexMap::new();
        for event in events {
            self.event_attrs(event, &mut event_attrs, state, locals)?;
        }
        for (name, value) in event_attrs {
            prop_values.insert(name, Value::Str(value));
        }

        // Slot content renders in the parent's scope, then passes down as
        // finished HTML.
        let mut passed_slots = IndexMap::new();
        for (name, body) in slots {
            let mut rendered = String::new();
            self.render_ops(body, &mut rendered, state, locals, owner, None)?;
            passed_slots.insert(name.clone(), rendered);
        }

        let options = PageOptions {
            props: prop_values,
            passed_slots,
            styles: Some(self.env.styles.clone()),
            context: self.env.context.clone(),
            is_component: true,
        };

        let mut child = Page::new(component, self.env.request.clone(), options)?;
        let html = child.render_body()?;
        self.machine.console.extend(child.take_console());
        out.push_str(&html);
        Ok(())
    }

    fn eval_attr_value(
        &mut self,
        value: &AttrValue,
        state: &mut IndexMap<String, Value>,
        locals: &mut Locals,
    ) -> Result<String, EvalError> {
        match value {
            AttrValue::Static(text) => Ok(text.clone()),
            AttrValue::Concat(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        AttrPart::Literal(text) => out.push_str(text),
                        AttrPart::Expr { expr, format_spec } => {
                            let value = self.machine.eval(expr, state, locals)?;
                            match format_spec {
                                Some(spec) => out.push_str(&apply_format(&value, spec)),
                                None => out.push_str(&value.to_display()),
                            }
                        }
                    }
                }
                Ok(out)
            }
        }
    }
}

/// Reactive attribute lowering: `True` emits `name=""`, `False`/`None`
/// omit, other values stringify; `aria-*` emits literal `"true"`/`"false"`.
fn apply_reactive(attrs: &mut IndexMap<String, String>, name: &str, value: &Value) {
    let is_aria = name.to_ascii_lowercase().starts_with("aria-");

    if is_aria {
        match value {
            Value::Bool(true) => attrs.insert(name.to_string(), "true".to_string()),
            Value::Bool(false) => attrs.insert(name.to_string(), "false".to_string()),
            Value::None => None,
            other => attrs.insert(name.to_string(), other.to_display()),
        };
        return;
    }

    match value {
        Value::Bool(true) => {
            attrs.insert(name.to_string(), String::new());
        }
        Value::Bool(false) | Value::None => {}
        other => {
            attrs.insert(name.to_string(), other.to_display());
        }
    }
}

/// Apply a `{value:spec}` format specifier. Supports precision (`.2f`),
/// integer (`d`), percent (`%`), width with fill/alignment, and thousands
/// separators; anything unrecognized falls back to the plain string form.
pub fn apply_format(value: &Value, spec: &str) -> String {
    let mut chars: Vec<char> = spec.chars().collect();
    let mut fill = ' ';
    let mut align: Option<char> = None;

    if chars.len() >= 2 && matches!(chars[1], '<' | '>' | '^') {
        fill = chars[0];
        align = Some(chars[1]);
        chars.drain(..2);
    } else if !chars.is_empty() && matches!(chars[0], '<' | '>' | '^') {
        align = Some(chars[0]);
        chars.remove(0);
    }

    let mut zero_pad = false;
    if chars.first() == Some(&'0') {
        zero_pad = true;
        chars.remove(0);
    }

    let mut width = 0usize;
    while let Some(c) = chars.first() {
        if c.is_ascii_digit() {
            width = width * 10 + (*c as usize - '0' as usize);
            chars.remove(0);
        } else {
            break;
        }
    }

    let mut thousands = false;
    if chars.first() == Some(&',') {
        thousands = true;
        chars.remove(0);
    }

    let mut precision: Option<usize> = None;
    if chars.first() == Some(&'.') {
        chars.remove(0);
        let mut p = 0usize;
        let mut saw_digit = false;
        while let Some(c) = chars.first() {
            if c.is_ascii_digit() {
                saw_digit = true;
                p = p * 10 + (*c as usize - '0' as usize);
                chars.remove(0);
            } else {
                break;
            }
        }
        if saw_digit {
            precision = Some(p);
        }
    }

    let type_char = chars.first().copied();

    let mut body = match (type_char, value) {
        (Some('f'), _) => match value.as_float() {
            Some(f) => format!("{f:.*}", precision.unwrap_or(6)),
            None => value.to_display(),
        },
        (Some('d'), _) => match value.as_int() {
            Some(i) => i.to_string(),
            None => value.to_display(),
        },
        (Some('%'), _) => match value.as_float() {
            Some(f) => format!("{:.*}%", precision.unwrap_or(6), f * 100.0),
            None => value.to_display(),
        },
        (_, Value::Float(f)) if precision.is_some() => {
            format!("{f:.*}", precision.unwrap())
        }
        _ => value.to_display(),
    };

    if thousands {
        body = add_thousands_separators(&body);
    }

    if body.chars().count() < width {
        let pad = width - body.chars().count();
        let fill = if zero_pad { '0' } else { fill };
        let is_numeric = matches!(value, Value::Int(_) | Value::Float(_));
        body = match align.unwrap_or(if is_numeric { '>' } else { '<' }) {
            '>' => format!("{}{}", fill.to_string().repeat(pad), body),
            '^' => {
                let left = pad / 2;
                let right = pad - left;
                format!(
                    "{}{}{}",
                    fill.to_string().repeat(left),
                    body,
                    fill.to_string().repeat(right)
                )
            }
            _ => format!("{}{}", body, fill.to_string().repeat(pad)),
        };
    }

    body
}

fn add_thousands_separators(body: &str) -> String {
    let (int_part, rest) = match body.find('.') {
        Some(pos) => (&body[..pos], &body[pos..]),
        None => (body, ""),
    };
    let negative = int_part.starts_with('-');
    let digits: Vec<char> = int_part.trim_start_matches('-').chars().collect();

    let mut grouped = String::new();
    for (i, c) in digits.iter().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(*c);
    }

    format!("{}{grouped}{rest}", if negative { "-" } else { "" })
}

#[cfg(test)]
mod tests {
    use super::super::testutil::make_page;
    use super::*;

    fn render(src: &str) -> String {
        make_page(src).render(true).unwrap()
    }

    fn body_of(html: &str) -> &str {
        // Strip the injected client script (and SPA metadata) suffix.
        match html.find("<script") {
            Some(pos) => &html[..pos],
            None => html,
        }
    }

    #[test]
    fn static_text_with_interpolation() {
        let html = render("<p>Hi {name}!</p>\n---\nname = 'Ada'\n---\n");
        assert!(html.starts_with("<p>Hi Ada!</p>"));
        assert!(html.contains(crate::common::CLIENT_SCRIPT_SRC));
    }

    #[test]
    fn render_is_deterministic() {
        let src = "<ul><li $for={i in items}>{i}</li></ul>\n---\nitems = [1, 2, 3]\n---\n";
        let a = render(src);
        let b = render(src);
        assert_eq!(a, b);
    }

    #[test]
    fn reactive_boolean_attribute() {
        let html = render("<input disabled={off}>\n---\noff = False\n---\n");
        assert!(body_of(&html).trim_end().ends_with("<input>"));

        let html = render("<input disabled={off}>\n---\noff = True\n---\n");
        assert!(html.contains(r#"<input disabled="">"#));
    }

    #[test]
    fn reactive_aria_attribute() {
        let html = render("<div aria-expanded={open}></div>\n---\nopen = False\n---\n");
        assert!(html.contains(r#"aria-expanded="false""#));
    }

    #[test]
    fn reactive_value_attribute() {
        let html = render("<a href={link}>x</a>\n---\nlink = '/next'\n---\n");
        assert!(html.contains(r#"<a href="/next">x</a>"#));
    }

    #[test]
    fn loop_with_key_emits_ids() {
        let html = render(concat!(
            "<ul><li $for={i in items} $key={i.id}>{i.name}</li></ul>\n",
            "---\n",
            "items = [{'id': 1, 'name': 'A'}, {'id': 2, 'name': 'B'}]\n",
            "---\n",
        ));
        assert!(html.contains(r#"<ul><li id="1">A</li><li id="2">B</li></ul>"#));
    }

    #[test]
    fn empty_iterable_emits_nothing() {
        let html = render("<ul><li $for={i in items}>{i}</li></ul>\n---\nitems = []\n---\n");
        assert!(html.contains("<ul></ul>"));
    }

    #[test]
    fn if_gates_show_hides() {
        let html = render("<p $if={flag}>shown</p>\n---\nflag = False\n---\n");
        assert!(!html.contains("<p"));

        let html = render("<p $show={flag}>here</p>\n---\nflag = False\n---\n");
        assert!(html.contains(r#"style="; display: none""#));
        assert!(html.contains("here"));
    }

    #[test]
    fn show_appends_to_existing_style() {
        let html =
            render("<p style=\"color: red\" $show={flag}>x</p>\n---\nflag = False\n---\n");
        assert!(html.contains(r#"style="color: red; display: none""#));
    }

    #[test]
    fn void_elements_have_no_closing_tag() {
        let html = render("<div><br><img src=\"x.png\"></div>\n");
        assert!(!html.contains("</br>"));
        assert!(!html.contains("</img>"));
        assert!(html.contains("</div>"));
    }

    #[test]
    fn event_attributes_and_lifted_args() {
        let html = render(concat!(
            "<ul><li $for={item in items}>",
            "<button @click={remove(item.id)}>X</button>",
            "</li></ul>\n",
            "---\n",
            "items = [{'id': 7}]\n",
            "\n",
            "def remove(id):\n",
            "    pass\n",
            "---\n",
        ));
        assert!(html.contains(r#"data-on-click="_handler_0""#));
        assert!(html.contains(r#"data-arg-0="7""#));
    }

    #[test]
    fn event_modifiers_render() {
        let html = render(concat!(
            "<form @submit.prevent={save}></form>\n",
            "---\n",
            "def save(**data):\n",
            "    pass\n",
            "---\n",
        ));
        assert!(html.contains(r#"data-modifiers-submit="prevent""#));
    }

    #[test]
    fn multiple_handlers_become_json() {
        // Distinct attribute names, same event type.
        let html = render(concat!(
            "<button @click.once={first} @click={second}>x</button>\n",
            "---\n",
            "def first():\n",
            "    pass\n",
            "\n",
            "def second():\n",
            "    pass\n",
            "---\n",
        ));
        assert!(html.contains("data-on-click=\"[{"));
        assert!(html.contains("first"));
        assert!(html.contains("second"));
    }

    #[test]
    fn bind_injects_value_and_listener() {
        let html = render("<input $bind={name}>\n---\nname = 'Ada'\n---\n");
        assert!(html.contains(r#"value="Ada""#));
        assert!(html.contains(r#"data-on-input="_handle_bind_1""#));
    }

    #[test]
    fn checkbox_bind_uses_checked_presence() {
        let html =
            render("<input type=\"checkbox\" $bind={agree}>\n---\nagree = True\n---\n");
        assert!(html.contains(r#"checked="""#));
        assert!(html.contains(r#"data-on-change="_handle_bind_1""#));

        let html =
            render("<input type=\"checkbox\" $bind={agree}>\n---\nagree = False\n---\n");
        assert!(!html.contains("checked"));
    }

    #[test]
    fn select_bind_marks_selected_option() {
        let html = render(concat!(
            "<select $bind={color}>",
            "<option value=\"red\">Red</option>",
            "<option value=\"blue\">Blue</option>",
            "</select>\n",
            "---\n",
            "color = 'blue'\n",
            "---\n",
        ));
        assert!(html.contains(r#"<option value="blue" selected="">Blue</option>"#));
        assert!(html.contains(r#"<option value="red">Red</option>"#));
    }

    #[test]
    fn attribute_values_are_escaped() {
        let html = render("<p title={evil}>x</p>\n---\nevil = '\"><script>'\n---\n");
        assert!(html.contains(r#"title="&quot;&gt;&lt;script&gt;""#));
    }

    #[test]
    fn interpolated_attribute_concat() {
        let html = render("<div class=\"btn {kind}\">x</div>\n---\nkind = 'primary'\n---\n");
        assert!(html.contains(r#"class="btn primary""#));
    }

    #[test]
    fn format_specs() {
        assert_eq!(apply_format(&Value::Float(3.14159), ".2f"), "3.14");
        assert_eq!(apply_format(&Value::Int(42), "d"), "42");
        assert_eq!(apply_format(&Value::Int(5), ">4"), "   5");
        assert_eq!(apply_format(&Value::Str("ab".into()), "<4"), "ab  ");
        assert_eq!(apply_format(&Value::Int(1234567), ","), "1,234,567");
        assert_eq!(apply_format(&Value::Float(0.25), ".0%"), "25%");
        assert_eq!(apply_format(&Value::Int(7), "05"), "00007");
    }

    #[test]
    fn interpolation_with_format_spec() {
        let html = render("<p>{price:.2f}</p>\n---\nprice = 12.5\n---\n");
        assert!(html.contains("<p>12.50</p>"));
    }

    #[test]
    fn empty_template_renders_script_only() {
        let html = render("---\ncount = 0\n---\n");
        assert!(html.starts_with("<script"));
        assert!(html.contains(crate::common::CLIENT_SCRIPT_SRC));
    }

    #[test]
    fn spa_meta_for_multi_variant_pages() {
        let html = render("!path {a: '/a', b: '/b'}\n<p>x</p>\n");
        assert!(html.contains(crate::common::SPA_META_ID));
        assert!(html.contains("sibling_paths"));
        assert!(html.contains("/a"));
    }

    #[test]
    fn scoped_styles_collect_into_head() {
        let html = render(concat!(
            "<head><title>t</title></head>\n",
            "<style scoped>p { color: red; }</style>\n",
            "<p>x</p>\n",
        ));
        // No literal style element from the template...
        assert!(!html.contains("<style scoped>"));
        // ...but the scoped CSS lands once in the head.
        assert_eq!(html.matches("color: red").count(), 1);
        assert!(html.contains("data-ph-"));
        let style_pos = html.find("<style>").unwrap();
        let head_close = html.find("</head>").unwrap();
        assert!(style_pos < head_close);
    }

    #[test]
    fn scoped_style_alone_still_reaches_head() {
        let html = render("<style scoped>p { margin: 0; }</style>\n");
        assert!(html.contains("margin: 0"));
        assert!(html.starts_with("<head><style>"));
    }
}
