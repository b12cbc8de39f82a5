//! The code generator: lower a [`ParsedPage`] into a [`PageProgram`].
//!
//! Responsibilities, mirroring the class shape of the framework contract:
//! routes and SPA metadata, state initializers lifted from module-level
//! assignments, user methods, inline-handler lifting (`_handler_N` with
//! `argN` placeholders), two-way-bind handlers (`_handle_bind_N`),
//! form-validation wrappers (`_form_submit_N`), and the render plan.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use super::program::*;
use crate::code::ast::*;
use crate::code::{self, CodeError};
use crate::parse::{
    interpolate, is_void_element, Diagnostic, EventAttr, ParsedPage, SourceError, SpecialAttr,
    TemplateNode,
};
use crate::prelude::*;

/// Lower a parsed page. `layout_path` is the already-resolved layout this
/// page (or intermediate layout) nests inside, if any; the loader decides
/// this from the `!layout` directive or the directory walk.
pub fn generate(parsed: &ParsedPage, layout_path: Option<PathBuf>) -> Result<PageProgram, SourceError> {
    let mut diagnostics = parsed.diagnostics.clone();

    // --- Code section: state fields and methods -----------------------
    let mut state_init = Vec::new();
    let mut state_names = HashSet::new();
    let mut methods: IndexMap<String, Method> = IndexMap::new();
    let mut mount_methods = Vec::new();

    for stmt in &parsed.code {
        match &stmt.kind {
            StmtKind::FuncDef(func) => {
                if func.decorators.iter().any(|d| d == "mount") {
                    mount_methods.push(func.name.clone());
                }
                methods.insert(func.name.clone(), Method::User(func.clone()));
            }
            StmtKind::Assign {
                target: Target::Name(name),
                ..
            } => {
                state_names.insert(name.clone());
                state_init.push(stmt.clone());
            }
            _ => state_init.push(stmt.clone()),
        }
    }

    // Props are state fields too; defaults apply when the caller omits them.
    let mut props = Vec::new();
    if let Some(prop_args) = parsed.props() {
        for (name, type_hint, default) in prop_args {
            let default = match default {
                Some(src) => Some(code::parse_expression(src)?),
                None => None,
            };
            state_names.insert(name.clone());
            props.push(PropSpec {
                name: name.clone(),
                type_hint: type_hint.clone(),
                default,
            });
        }
    }

    // --- Routing and SPA metadata --------------------------------------
    let (routes, routes_simple) = match parsed.path_directive() {
        Some((routes, is_simple)) => (Some(routes.clone()), is_simple),
        None => (None, true),
    };

    let spa_enabled = !routes_simple && !parsed.no_spa();
    let sibling_paths = match (&routes, routes_simple) {
        (Some(routes), false) => routes.values().cloned().collect(),
        _ => Vec::new(),
    };

    // --- Template lowering ---------------------------------------------
    let has_scoped_styles = tree_has_scoped_style(&parsed.template);
    let scope_id = has_scoped_styles.then(|| stable_id(&parsed.file_path));
    let layout_id = stable_id(&parsed.file_path);

    let known_methods: HashSet<String> = methods.keys().cloned().collect();
    let component_tags: HashSet<String> = parsed
        .components()
        .map(|(name, _)| name.to_ascii_lowercase())
        .collect();

    let mut builder = PlanBuilder {
        known_methods: &known_methods,
        component_tags: &component_tags,
        scope_id: scope_id.as_deref(),
        own_layout_id: &layout_id,
        handler_counter: 0,
        bind_counter: 0,
        form_counter: 0,
        synthesized: IndexMap::new(),
        has_file_inputs: false,
        diagnostics: &mut diagnostics,
    };

    let has_layout = layout_path.is_some();
    let mut render = Vec::new();
    let mut slot_fills: Vec<SlotFill> = Vec::new();

    if has_layout {
        // Bucket top-level nodes into slot fillers for the parent layout.
        let mut default_body = Vec::new();
        for node in &parsed.template {
            match node.tag.as_deref() {
                Some("slot") if node.attributes.contains_key("name") => {
                    let name = node.attributes["name"].clone();
                    let body = builder.compile_nodes(&node.children)?;
                    slot_fills.push(SlotFill {
                        append: name == "$head",
                        slot: name,
                        body,
                    });
                }
                Some(tag) if tag == RESERVED_HEAD_TAG => {
                    let body = builder.compile_nodes(&node.children)?;
                    slot_fills.push(SlotFill {
                        slot: "$head".to_string(),
                        append: true,
                        body,
                    });
                }
                _ => default_body.extend(builder.compile_node(node)?),
            }
        }
        slot_fills.push(SlotFill {
            slot: "default".to_string(),
            append: false,
            body: default_body,
        });
    } else {
        render = builder.compile_nodes(&parsed.template)?;
    }

    // Components with props receive unmatched props in `attrs`; spread them
    // onto the root element unless the template spreads explicitly.
    if !props.is_empty() && !plan_has_spread(&render) {
        mark_implicit_spread(&mut render);
    }

    let mut has_file_inputs = builder.has_file_inputs;
    if tree_has_file_input(&parsed.template) {
        has_file_inputs = true;
    }

    let synthesized = builder.synthesized;
    for (name, method) in synthesized {
        methods.insert(name, method);
    }

    // --- Dependencies ---------------------------------------------------
    let mut components = IndexMap::new();
    let source_dir = parsed.file_path.parent().map(Path::to_path_buf);
    for (name, rel_path) in parsed.components() {
        let resolved = resolve_relative(source_dir.as_deref(), rel_path);
        components.insert(name.to_ascii_lowercase(), resolved);
    }

    let mut dependencies: HashSet<PathBuf> = components.values().cloned().collect();
    if let Some(layout) = &layout_path {
        dependencies.insert(layout.clone());
    }

    let has_on_load = methods.contains_key("on_load");

    Ok(PageProgram {
        class_name: class_name_for(&parsed.file_path),
        file_path: parsed.file_path.clone(),
        routes,
        routes_simple,
        spa_enabled,
        sibling_paths,
        state_init,
        state_names,
        methods,
        has_on_load,
        mount_methods,
        render,
        slot_fills,
        layout_path,
        layout_id: Some(layout_id),
        scope_id,
        provides: parsed.provides().cloned().collect(),
        injects: parsed
            .injects()
            .map(|(l, k)| (l.to_string(), k.to_string()))
            .collect(),
        props,
        components,
        has_file_inputs,
        dependencies,
        diagnostics,
    })
}

/// `pages/blog_post.pw` → `BlogPostPage`.
pub fn class_name_for(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    if stem.is_empty() {
        return "Page".to_string();
    }

    let mut name: String = stem
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect();
    name.push_str("Page");
    name
}

fn resolve_relative(source_dir: Option<&Path>, rel: &str) -> PathBuf {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return rel_path.to_path_buf();
    }
    match source_dir {
        Some(dir) => normalize_path(&dir.join(rel_path)),
        None => rel_path.to_path_buf(),
    }
}

/// Lexically resolve `.` and `..` components; the file need not exist yet.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn tree_has_scoped_style(nodes: &[TemplateNode]) -> bool {
    nodes.iter().any(|node| {
        (node.tag.as_deref() == Some("style") && node.attributes.contains_key("scoped"))
            || tree_has_scoped_style(&node.children)
    })
}

fn tree_has_file_input(nodes: &[TemplateNode]) -> bool {
    nodes.iter().any(|node| {
        (node.tag.as_deref() == Some("input")
            && node.attributes.get("type").map(String::as_str) == Some("file"))
            || tree_has_file_input(&node.children)
    })
}

fn plan_has_spread(ops: &[RenderOp]) -> bool {
    ops.iter().any(|op| match op {
        RenderOp::Element(e) => e.spread.is_some() || plan_has_spread(&e.children),
        RenderOp::If { body, .. } | RenderOp::For { body, .. } => plan_has_spread(body),
        _ => false,
    })
}

/// Tag the single root element (ignoring text and style/script) with the
/// implicit `attrs` spread.
fn mark_implicit_spread(ops: &mut [RenderOp]) {
    let mut roots = ops
        .iter_mut()
        .filter_map(|op| match op {
            RenderOp::Element(e) if !matches!(e.tag.as_str(), "style" | "script") => Some(e),
            _ => None,
        })
        .collect::<Vec<_>>();

    if roots.len() == 1 {
        roots[0].implicit_spread = true;
    }
}

// ---------------------------------------------------------------------------
// Render-plan builder
// ---------------------------------------------------------------------------

struct PlanBuilder<'a> {
    known_methods: &'a HashSet<String>,
    component_tags: &'a HashSet<String>,
    scope_id: Option<&'a str>,
    own_layout_id: &'a str,
    handler_counter: usize,
    bind_counter: usize,
    form_counter: usize,
    synthesized: IndexMap<String, Method>,
    has_file_inputs: bool,
    diagnostics: &'a mut Vec<Diagnostic>,
}

impl<'a> PlanBuilder<'a> {
    fn compile_nodes(&mut self, nodes: &[TemplateNode]) -> Result<Vec<RenderOp>, SourceError> {
        let mut ops = Vec::new();
        for node in nodes {
            ops.extend(self.compile_node(node)?);
        }
        Ok(ops)
    }

    fn compile_node(&mut self, node: &TemplateNode) -> Result<Vec<RenderOp>, SourceError> {
        // `$for` wraps everything else on the element.
        if let Some(SpecialAttr::For {
            loop_vars,
            iterable,
            is_template_tag,
        }) = node
            .special
            .iter()
            .find(|a| matches!(a, SpecialAttr::For { .. }))
        {
            let targets = code::parse_loop_targets(loop_vars).map_err(at_line(node.line))?;
            let iter = parse_expr_at(iterable, node.line)?;

            let body = if *is_template_tag {
                self.compile_nodes(&node.children)?
            } else {
                let inner = strip_special(node, |a| matches!(a, SpecialAttr::For { .. }));
                self.compile_node(&inner)?
            };

            return Ok(vec![RenderOp::For {
                targets,
                iter,
                body,
                line: node.line,
            }]);
        }

        // `$if` gates the element entirely.
        if let Some(SpecialAttr::If { condition }) = node
            .special
            .iter()
            .find(|a| matches!(a, SpecialAttr::If { .. }))
        {
            let cond = parse_expr_at(condition, node.line)?;
            let inner = strip_special(node, |a| matches!(a, SpecialAttr::If { .. }));
            let body = self.compile_node(&inner)?;
            return Ok(vec![RenderOp::If { cond, body }]);
        }

        let Some(tag) = node.tag.as_deref() else {
            return self.compile_text(node);
        };

        // <slot> resolves registered fillers (or passed component slots).
        if tag == "slot" {
            let is_head = node.attributes.contains_key("$head");
            let name = if is_head {
                "$head".to_string()
            } else {
                node.attributes
                    .get("name")
                    .cloned()
                    .unwrap_or_else(|| "default".to_string())
            };
            let default = self.compile_nodes(&node.children)?;
            return Ok(vec![RenderOp::Slot {
                append: is_head || name == "$head",
                name,
                layout_id: Some(self.own_layout_id.to_string()),
                default,
            }]);
        }

        // Component instantiation.
        if self.component_tags.contains(tag) {
            return self.compile_component(node, tag);
        }

        // <style scoped> registers CSS and emits nothing.
        if tag == "style" && node.attributes.contains_key("scoped") {
            if let Some(scope_id) = self.scope_id {
                let css = node
                    .children
                    .first()
                    .and_then(|c| c.text.clone())
                    .unwrap_or_default();
                return Ok(vec![RenderOp::RegisterStyle {
                    css: rewrite_scoped_css(&css, scope_id),
                }]);
            }
        }

        self.compile_element(node, tag)
    }

    fn compile_text(&mut self, node: &TemplateNode) -> Result<Vec<RenderOp>, SourceError> {
        if let Some(text) = &node.text {
            return Ok(vec![RenderOp::Text(text.clone())]);
        }

        if let Some(SpecialAttr::Interpolation {
            expr,
            format_spec,
            line,
            ..
        }) = node.special.first()
        {
            return Ok(vec![RenderOp::Interp {
                expr: expr.clone(),
                format_spec: format_spec.clone(),
                line: *line,
            }]);
        }

        Ok(Vec::new())
    }

    fn compile_element(&mut self, node: &TemplateNode, tag: &str) -> Result<Vec<RenderOp>, SourceError> {
        let real_tag = if tag == RESERVED_HEAD_TAG { "head" } else { tag };

        let mut attrs = Vec::new();
        for (name, value) in &node.attributes {
            if name == "$head" {
                continue;
            }
            attrs.push((name.clone(), self.compile_attr_value(value, node.line)?));
        }

        let mut reactive = Vec::new();
        let mut events: Vec<EventOp> = Vec::new();
        let mut bind = None;
        let mut key = None;
        let mut show = None;
        let mut spread = None;

        for special in &node.special {
            match special {
                SpecialAttr::Reactive { name, expr } => {
                    let mut expr = parse_expr_at(expr, node.line)?;
                    // A bare method name auto-calls.
                    if let ExprKind::Name(n) = &expr.kind {
                        if self.known_methods.contains(n) {
                            let span = expr.span;
                            expr = Expr {
                                kind: ExprKind::Call {
                                    func: Box::new(expr),
                                    args: Vec::new(),
                                    kwargs: Vec::new(),
                                },
                                span,
                            };
                        }
                    }
                    reactive.push((name.clone(), expr));
                }
                SpecialAttr::Event(event) => {
                    let handler = self.compile_event_handler(event, node.line)?;
                    match events.iter_mut().find(|e| e.event_type == event.event_type) {
                        Some(op) => op.handlers.push(handler),
                        None => events.push(EventOp {
                            event_type: event.event_type.clone(),
                            handlers: vec![handler],
                        }),
                    }
                }
                SpecialAttr::Bind { variable, progress } => {
                    bind = Some(self.compile_bind(node, tag, variable, *progress)?);
                }
                SpecialAttr::Key { expr } => {
                    key = Some(parse_expr_at(expr, node.line)?);
                }
                SpecialAttr::Show { condition } => {
                    show = Some(parse_expr_at(condition, node.line)?);
                }
                SpecialAttr::Spread { expr } => {
                    spread = Some(parse_expr_at(expr, node.line)?);
                }
                _ => {}
            }
        }

        let scoped = self.scope_id.is_some()
            && !matches!(real_tag, "style" | "script" | "slot" | "template");

        let children = self.compile_nodes(&node.children)?;

        Ok(vec![RenderOp::Element(Box::new(ElementOp {
            tag: real_tag.to_string(),
            is_void: is_void_element(real_tag),
            attrs,
            reactive,
            events,
            bind,
            key,
            show,
            spread,
            scoped,
            implicit_spread: false,
            children,
        }))])
    }

    fn compile_component(&mut self, node: &TemplateNode, tag: &str) -> Result<Vec<RenderOp>, SourceError> {
        let mut props = Vec::new();
        for (name, value) in &node.attributes {
            if name == "slot" {
                continue;
            }
            props.push((name.clone(), self.compile_attr_value(value, node.line)?));
        }

        let mut reactive = Vec::new();
        let mut events: Vec<EventOp> = Vec::new();
        for special in &node.special {
            match special {
                SpecialAttr::Reactive { name, expr } => {
                    reactive.push((name.clone(), parse_expr_at(expr, node.line)?));
                }
                SpecialAttr::Event(event) => {
                    let handler = self.compile_event_handler(event, node.line)?;
                    match events.iter_mut().find(|e| e.event_type == event.event_type) {
                        Some(op) => op.handlers.push(handler),
                        None => events.push(EventOp {
                            event_type: event.event_type.clone(),
                            handlers: vec![handler],
                        }),
                    }
                }
                _ => {}
            }
        }

        // Bucket children into slots by their `slot="name"` attribute.
        let mut slots: Vec<(String, Vec<RenderOp>)> = Vec::new();
        let mut default_nodes = Vec::new();
        for child in &node.children {
            let slot_name = child
                .tag
                .as_ref()
                .and_then(|_| child.attributes.get("slot"))
                .cloned();
            match slot_name {
                Some(name) => {
                    let mut stripped = child.clone();
                    stripped.attributes.shift_remove("slot");
                    let ops = self.compile_node(&stripped)?;
                    match slots.iter_mut().find(|(n, _)| *n == name) {
                        Some((_, body)) => body.extend(ops),
                        None => slots.push((name, ops)),
                    }
                }
                None => default_nodes.push(child.clone()),
            }
        }
        if !default_nodes.is_empty() {
            let ops = self.compile_nodes(&default_nodes)?;
            slots.push(("default".to_string(), ops));
        }

        Ok(vec![RenderOp::Component {
            tag: tag.to_string(),
            props,
            reactive,
            events,
            slots,
            line: node.line,
        }])
    }

    fn compile_attr_value(&mut self, value: &str, line: u32) -> Result<AttrValue, SourceError> {
        if !(value.contains('{') && value.contains('}')) {
            return Ok(AttrValue::Static(value.to_string()));
        }

        let chunks = interpolate::scan(value, line, 0);
        if chunks
            .iter()
            .all(|c| matches!(c, interpolate::Chunk::Literal(_)))
        {
            return Ok(AttrValue::Static(value.to_string()));
        }

        let parts = chunks
            .into_iter()
            .map(|chunk| match chunk {
                interpolate::Chunk::Literal(text) => AttrPart::Literal(text),
                interpolate::Chunk::Expr(e) => AttrPart::Expr {
                    expr: e.expr,
                    format_spec: e.format_spec,
                },
            })
            .collect();

        Ok(AttrValue::Concat(parts))
    }

    fn compile_event_handler(
        &mut self,
        event: &EventAttr,
        line: u32,
    ) -> Result<HandlerRef, SourceError> {
        let handler = event.handler.trim();

        let (name, args) = if is_identifier(handler) {
            (handler.to_string(), Vec::new())
        } else {
            self.lift_inline_handler(handler, line)?
        };

        // Form submission with a harvested schema goes through a validating
        // wrapper.
        let name = match (&event.schema, event.event_type.as_str()) {
            (Some(schema), "submit") => {
                let wrapper = format!("_form_submit_{}", self.form_counter);
                self.form_counter += 1;
                self.synthesized.insert(
                    wrapper.clone(),
                    Method::FormWrapper {
                        schema: schema.clone(),
                        inner: name,
                    },
                );
                wrapper
            }
            _ => name,
        };

        Ok(HandlerRef {
            name,
            modifiers: event.modifiers.clone(),
            args,
        })
    }

    /// Lift an inline code fragment into a synthesized `_handler_N` method.
    /// Call arguments referencing unbound names (loop variables, state)
    /// become `argN` placeholders evaluated at render time.
    fn lift_inline_handler(
        &mut self,
        source: &str,
        line: u32,
    ) -> Result<(String, Vec<Expr>), SourceError> {
        let mut body =
            code::parse_module(source, line.saturating_sub(1)).map_err(SourceError::Code)?;

        let mut lifted = Vec::new();
        for stmt in &mut body {
            self.lift_in_stmt(stmt, &mut lifted);
        }

        let name = format!("_handler_{}", self.handler_counter);
        self.handler_counter += 1;

        let params = (0..lifted.len())
            .map(|i| Param {
                name: format!("arg{i}"),
                default: None,
                var_kw: false,
            })
            .collect();

        self.synthesized.insert(
            name.clone(),
            Method::User(FuncDef {
                name: name.clone(),
                params,
                body,
                decorators: Vec::new(),
                span: Span::new(line, 0),
            }),
        );

        Ok((name, lifted))
    }

    fn is_bound(&self, name: &str) -> bool {
        self.known_methods.contains(name) || crate::runtime::builtins::is_builtin(name)
    }

    fn lift_in_stmt(&mut self, stmt: &mut Stmt, lifted: &mut Vec<Expr>) {
        match &mut stmt.kind {
            StmtKind::Assign { value, .. } => self.lift_in_expr(value, lifted),
            StmtKind::AugAssign { value, .. } => self.lift_in_expr(value, lifted),
            StmtKind::Expr(expr) => self.lift_in_expr(expr, lifted),
            StmtKind::If { branches, orelse } => {
                for (cond, body) in branches {
                    self.lift_in_expr(cond, lifted);
                    for stmt in body {
                        self.lift_in_stmt(stmt, lifted);
                    }
                }
                for stmt in orelse {
                    self.lift_in_stmt(stmt, lifted);
                }
            }
            StmtKind::For { iter, body, .. } => {
                self.lift_in_expr(iter, lifted);
                for stmt in body {
                    self.lift_in_stmt(stmt, lifted);
                }
            }
            StmtKind::While { cond, body } => {
                self.lift_in_expr(cond, lifted);
                for stmt in body {
                    self.lift_in_stmt(stmt, lifted);
                }
            }
            StmtKind::Return(Some(expr)) => self.lift_in_expr(expr, lifted),
            _ => {}
        }
    }

    fn lift_in_expr(&mut self, expr: &mut Expr, lifted: &mut Vec<Expr>) {
        if let ExprKind::Call { func, args, kwargs } = &mut expr.kind {
            self.lift_in_expr(func, lifted);
            for arg in args.iter_mut() {
                let mut names = Vec::new();
                collect_names(arg, &mut names);
                let unbound = names.iter().any(|n| !self.is_bound(n));

                if unbound {
                    let placeholder = Expr {
                        kind: ExprKind::Name(format!("arg{}", lifted.len())),
                        span: arg.span,
                    };
                    lifted.push(std::mem::replace(arg, placeholder));
                } else {
                    self.lift_in_expr(arg, lifted);
                }
            }
            for (_, arg) in kwargs.iter_mut() {
                self.lift_in_expr(arg, lifted);
            }
            return;
        }

        match &mut expr.kind {
            ExprKind::Attr { value, .. } => self.lift_in_expr(value, lifted),
            ExprKind::Index { value, index } => {
                self.lift_in_expr(value, lifted);
                self.lift_in_expr(index, lifted);
            }
            ExprKind::Unary { operand, .. } => self.lift_in_expr(operand, lifted),
            ExprKind::Binary { left, right, .. } => {
                self.lift_in_expr(left, lifted);
                self.lift_in_expr(right, lifted);
            }
            ExprKind::Bool { values, .. } => {
                for value in values {
                    self.lift_in_expr(value, lifted);
                }
            }
            ExprKind::Compare { left, ops } => {
                self.lift_in_expr(left, lifted);
                for (_, right) in ops {
                    self.lift_in_expr(right, lifted);
                }
            }
            ExprKind::Ternary { cond, then, other } => {
                self.lift_in_expr(cond, lifted);
                self.lift_in_expr(then, lifted);
                self.lift_in_expr(other, lifted);
            }
            ExprKind::List(items) | ExprKind::Tuple(items) => {
                for item in items {
                    self.lift_in_expr(item, lifted);
                }
            }
            ExprKind::Dict(pairs) => {
                for (key, value) in pairs {
                    self.lift_in_expr(key, lifted);
                    self.lift_in_expr(value, lifted);
                }
            }
            _ => {}
        }
    }

    fn compile_bind(
        &mut self,
        node: &TemplateNode,
        tag: &str,
        variable: &str,
        progress: bool,
    ) -> Result<BindOp, SourceError> {
        self.bind_counter += 1;
        let handler = format!("_handle_bind_{}", self.bind_counter);

        let target_expr = parse_expr_at(variable, node.line)?;
        let target = expr_to_target(&target_expr).ok_or_else(|| {
            SourceError::syntax(
                format!("$bind target '{variable}' is not assignable"),
                node.line,
            )
        })?;

        let input_type = node
            .attributes
            .get("type")
            .map(|t| t.to_ascii_lowercase())
            .unwrap_or_else(|| "text".to_string());

        if tag == "input" && input_type == "file" {
            self.has_file_inputs = true;
        }

        let (prop, use_checked) = if progress {
            (BindProp::Progress, false)
        } else if tag == "input" && matches!(input_type.as_str(), "checkbox" | "radio") {
            (BindProp::Checked(target_expr), true)
        } else {
            (BindProp::Value(target_expr), false)
        };

        self.synthesized
            .insert(handler.clone(), Method::Bind { target, use_checked });

        Ok(BindOp { handler, prop })
    }
}

fn parse_expr_at(src: &str, line: u32) -> Result<Expr, SourceError> {
    code::parse_expression_at(src, line.saturating_sub(1)).map_err(SourceError::Code)
}

fn at_line(line: u32) -> impl Fn(CodeError) -> SourceError {
    move |mut e| {
        e.line = line;
        SourceError::Code(e)
    }
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn expr_to_target(expr: &Expr) -> Option<Target> {
    match &expr.kind {
        ExprKind::Name(name) => Some(Target::Name(name.clone())),
        ExprKind::Attr { value, attr } => Some(Target::Attr {
            value: (**value).clone(),
            attr: attr.clone(),
        }),
        ExprKind::Index { value, index } => Some(Target::Index {
            value: (**value).clone(),
            index: (**index).clone(),
        }),
        _ => None,
    }
}

/// Drop the first special attribute matching `predicate` from a node clone.
fn strip_special(node: &TemplateNode, predicate: impl Fn(&SpecialAttr) -> bool) -> TemplateNode {
    let mut clone = node.clone();
    if let Some(pos) = clone.special.iter().position(&predicate) {
        clone.special.remove(pos);
    }
    clone
}

/// Rewrite each selector of a scoped style block to
/// `selector[data-ph-<scope-id>]`, leaving declarations untouched.
pub fn rewrite_scoped_css(css: &str, scope_id: &str) -> String {
    let mut out = String::with_capacity(css.len());
    let mut last = 0;
    let mut in_block = false;

    for (i, c) in css.char_indices() {
        match c {
            '{' if !in_block => {
                let selectors = &css[last..i];
                let rewritten = selectors
                    .split(',')
                    .filter(|s| !s.trim().is_empty())
                    .map(|s| format!("{}[data-ph-{}]", s.trim(), scope_id))
                    .collect::<Vec<_>>()
                    .join(",");
                out.push_str(&rewritten);
                in_block = true;
                last = i;
            }
            '}' if in_block => {
                out.push_str(&css[last..=i]);
                in_block = false;
                last = i + 1;
            }
            _ => {}
        }
    }
    out.push_str(&css[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::PageParser;

    fn compile(src: &str) -> PageProgram {
        let parsed = PageParser::new()
            .parse(src, Path::new("/pages/sample_page.pw"))
            .unwrap();
        generate(&parsed, None).unwrap()
    }

    fn compile_with_layout(src: &str) -> PageProgram {
        let parsed = PageParser::new()
            .parse(src, Path::new("/pages/sample_page.pw"))
            .unwrap();
        generate(&parsed, Some(PathBuf::from("/pages/__layout__.pw"))).unwrap()
    }

    #[test]
    fn class_names_derive_from_stems() {
        assert_eq!(class_name_for(Path::new("/p/index.pw")), "IndexPage");
        assert_eq!(class_name_for(Path::new("/p/blog_post.pw")), "BlogPostPage");
    }

    #[test]
    fn state_and_methods_split() {
        let program = compile(indoc! {"
            <p>{count}</p>
            ---
            count = 0

            def increment():
                count += 1
            ---
        "});

        assert_eq!(program.state_init.len(), 1);
        assert!(program.state_names.contains("count"));
        assert!(matches!(program.methods["increment"], Method::User(_)));
    }

    #[test]
    fn simple_path_is_not_spa() {
        let program = compile("!path '/x'\n<p>t</p>\n");
        assert!(!program.spa_enabled);
        assert!(program.sibling_paths.is_empty());
        assert_eq!(program.routes.as_ref().unwrap()["main"], "/x");
    }

    #[test]
    fn multi_path_enables_spa() {
        let program = compile("!path {a: '/a', b: '/b'}\n<p>t</p>\n");
        assert!(program.spa_enabled);
        assert_eq!(program.sibling_paths, vec!["/a", "/b"]);
    }

    #[test]
    fn no_spa_directive_wins() {
        let program = compile("!path {a: '/a', b: '/b'}\n!no_spa\n<p>t</p>\n");
        assert!(!program.spa_enabled);
    }

    #[test]
    fn inline_handler_is_lifted() {
        let program = compile(indoc! {"
            <ul><li $for={item in items}>
                <button @click={delete_item(item.id)}>X</button>
            </li></ul>
            ---
            items = []

            def delete_item(id):
                pass
            ---
        "});

        let Method::User(handler) = &program.methods["_handler_0"] else {
            panic!("lifted handler missing")
        };
        assert_eq!(handler.params.len(), 1);
        assert_eq!(handler.params[0].name, "arg0");

        // The button's handler reference carries the lifted expression.
        fn find_event(ops: &[RenderOp]) -> Option<&HandlerRef> {
            for op in ops {
                match op {
                    RenderOp::Element(e) => {
                        if let Some(event) = e.events.first() {
                            return event.handlers.first();
                        }
                        if let Some(found) = find_event(&e.children) {
                            return Some(found);
                        }
                    }
                    RenderOp::For { body, .. } | RenderOp::If { body, .. } => {
                        if let Some(found) = find_event(body) {
                            return Some(found);
                        }
                    }
                    _ => {}
                }
            }
            None
        }

        let handler_ref = find_event(&program.render).unwrap();
        assert_eq!(handler_ref.name, "_handler_0");
        assert_eq!(handler_ref.args.len(), 1);
    }

    #[test]
    fn bind_synthesizes_handler_and_prop() {
        let program = compile("<input $bind={name}>\n---\nname = ''\n---\n");
        let Method::Bind { use_checked, .. } = &program.methods["_handle_bind_1"] else {
            panic!()
        };
        assert!(!use_checked);

        let RenderOp::Element(input) = &program.render[0] else { panic!() };
        let bind = input.bind.as_ref().unwrap();
        assert_eq!(bind.handler, "_handle_bind_1");
        assert!(matches!(bind.prop, BindProp::Value(_)));
    }

    #[test]
    fn checkbox_bind_uses_checked() {
        let program = compile("<input type=\"checkbox\" $bind={agreed}>\n---\nagreed = False\n---\n");
        let Method::Bind { use_checked, .. } = &program.methods["_handle_bind_1"] else {
            panic!()
        };
        assert!(use_checked);
    }

    #[test]
    fn form_submit_gets_wrapper() {
        let program = compile(indoc! {"
            <form @submit={save}><input name=\"email\" type=\"email\" required></form>
            ---
            def save(cleaned_data):
                pass
            ---
        "});

        let Method::FormWrapper { schema, inner } = &program.methods["_form_submit_0"] else {
            panic!()
        };
        assert_eq!(inner, "save");
        assert!(schema.fields.contains_key("email"));
    }

    #[test]
    fn layout_bucketing_builds_slot_fills() {
        let program = compile_with_layout(indoc! {"
            <head><title>My Page</title></head>
            <h1>Body content</h1>
            <slot name=\"sidebar\"><p>side</p></slot>
        "});

        assert!(program.render.is_empty());
        let names: Vec<_> = program.slot_fills.iter().map(|f| f.slot.as_str()).collect();
        assert!(names.contains(&"$head"));
        assert!(names.contains(&"sidebar"));
        assert!(names.contains(&"default"));

        let head = program.slot_fills.iter().find(|f| f.slot == "$head").unwrap();
        assert!(head.append);
    }

    #[test]
    fn scoped_style_registers_css() {
        let program = compile("<style scoped>p { color: red; }</style>\n<p>x</p>\n");
        let scope = program.scope_id.as_deref().unwrap();

        let RenderOp::RegisterStyle { css } = &program.render[0] else { panic!() };
        assert!(css.contains(&format!("p[data-ph-{scope}]")));

        // Every other element is tagged.
        let RenderOp::Element(p) = &program.render[2] else { panic!() };
        assert!(p.scoped);
    }

    #[test]
    fn scoped_css_rewrite_shapes() {
        let css = rewrite_scoped_css(".a, .b { x: 1; } p { y: 2; }", "abc");
        assert!(css.contains(".a[data-ph-abc],.b[data-ph-abc]"));
        assert!(css.contains("p[data-ph-abc]"));
    }

    #[test]
    fn mount_methods_are_recognized() {
        let program = compile(indoc! {"
            <p>x</p>
            ---
            @mount
            def setup():
                pass

            def on_load():
                pass
            ---
        "});
        assert_eq!(program.mount_methods, vec!["setup"]);
        assert!(program.has_on_load);
    }

    #[test]
    fn components_resolve_relative_paths() {
        let program = compile("!component Card './widgets/card.pw'\n<Card title=\"hi\"></Card>\n");
        assert_eq!(
            program.components["card"],
            PathBuf::from("/pages/widgets/card.pw")
        );
        assert!(matches!(&program.render[0], RenderOp::Component { tag, .. } if tag == "card"));
    }

    #[test]
    fn dependencies_cover_layout_and_components() {
        let parsed = PageParser::new()
            .parse(
                "!component Card './card.pw'\n<Card></Card>\n",
                Path::new("/pages/a.pw"),
            )
            .unwrap();
        let program = generate(&parsed, Some(PathBuf::from("/pages/__layout__.pw"))).unwrap();
        assert!(program.dependencies.contains(Path::new("/pages/card.pw")));
        assert!(program
            .dependencies
            .contains(Path::new("/pages/__layout__.pw")));
    }
}
