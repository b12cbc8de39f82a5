//! Compiled page artifacts: the executable form a page source lowers into.
//!
//! A [`PageProgram`] is the "page class" of the framework: state
//! initializers, methods (user-written and synthesized), a render plan, and
//! routing/layout/component metadata. Programs are immutable once built and
//! shared behind `Arc` by the loader cache.

use std::collections::HashSet;
use std::path::PathBuf;

use indexmap::IndexMap;

use crate::code::ast::{Expr, FuncDef, Target};
use crate::parse::{Diagnostic, FormSchema};

/// A statically-known attribute value: either a literal, or a
/// literal/expression alternation produced by interpolation scanning.
#[derive(Debug, Clone)]
pub enum AttrValue {
    Static(String),
    Concat(Vec<AttrPart>),
}

#[derive(Debug, Clone)]
pub enum AttrPart {
    Literal(String),
    Expr {
        expr: Expr,
        format_spec: Option<String>,
    },
}

/// One handler wired to an event, after inline lifting.
#[derive(Debug, Clone)]
pub struct HandlerRef {
    pub name: String,
    pub modifiers: Vec<String>,
    /// Lifted argument expressions, evaluated in the render scope and
    /// serialized as `data-arg-i` JSON.
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone)]
pub struct EventOp {
    pub event_type: String,
    pub handlers: Vec<HandlerRef>,
}

#[derive(Debug, Clone)]
pub enum BindProp {
    /// `value="..."` injected; `data-on-input`.
    Value(Expr),
    /// `checked` presence injected; `data-on-change`.
    Checked(Expr),
    /// Upload progress; `data-on-upload-progress`, no injected property.
    Progress,
}

#[derive(Debug, Clone)]
pub struct BindOp {
    pub handler: String,
    pub prop: BindProp,
}

#[derive(Debug, Clone)]
pub struct ElementOp {
    pub tag: String,
    pub is_void: bool,
    pub attrs: Vec<(String, AttrValue)>,
    pub reactive: Vec<(String, Expr)>,
    pub events: Vec<EventOp>,
    pub bind: Option<BindOp>,
    pub key: Option<Expr>,
    pub show: Option<Expr>,
    pub spread: Option<Expr>,
    /// Tagged with `data-ph-<scope-id>` when the page has scoped styles.
    pub scoped: bool,
    /// Root element of a component instance: spread the `attrs` prop dict.
    pub implicit_spread: bool,
    pub children: Vec<RenderOp>,
}

#[derive(Debug, Clone)]
pub enum RenderOp {
    Text(String),
    Interp {
        expr: Expr,
        format_spec: Option<String>,
        line: u32,
    },
    Element(Box<ElementOp>),
    If {
        cond: Expr,
        body: Vec<RenderOp>,
    },
    For {
        targets: Vec<String>,
        iter: Expr,
        body: Vec<RenderOp>,
        line: u32,
    },
    Slot {
        name: String,
        /// The layout whose slot this resolves against; `None` inside
        /// component templates (resolved against passed slots).
        layout_id: Option<String>,
        append: bool,
        default: Vec<RenderOp>,
    },
    Component {
        /// Lowercased tag, key into [`PageProgram::components`].
        tag: String,
        props: Vec<(String, AttrValue)>,
        reactive: Vec<(String, Expr)>,
        events: Vec<EventOp>,
        slots: Vec<(String, Vec<RenderOp>)>,
        line: u32,
    },
    /// Register pre-scoped CSS with the style collector; emits nothing.
    RegisterStyle {
        css: String,
    },
}

/// A slot filler contributed by a page (or intermediate layout) to its
/// parent layout.
#[derive(Debug, Clone)]
pub struct SlotFill {
    pub slot: String,
    pub append: bool,
    pub body: Vec<RenderOp>,
}

/// A page method. User methods interpret their body; the synthesized kinds
/// are executed directly by the dispatcher.
#[derive(Debug, Clone)]
pub enum Method {
    User(FuncDef),
    /// `_handle_bind_N`: assign the incoming `value`/`checked` to a state
    /// target.
    Bind { target: Target, use_checked: bool },
    /// `_form_submit_N`: validate against the schema, bind `errors`, and
    /// invoke the wrapped handler with cleaned data.
    FormWrapper {
        schema: FormSchema,
        inner: String,
    },
}

#[derive(Debug, Clone)]
pub struct PropSpec {
    pub name: String,
    pub type_hint: String,
    pub default: Option<Expr>,
}

#[derive(Debug)]
pub struct PageProgram {
    pub class_name: String,
    pub file_path: PathBuf,
    /// Explicit `!path` routes: variant name → pattern.
    pub routes: Option<IndexMap<String, String>>,
    pub routes_simple: bool,
    pub spa_enabled: bool,
    pub sibling_paths: Vec<String>,
    /// Module-level statements other than `def`s; run during construction.
    pub state_init: Vec<crate::code::ast::Stmt>,
    /// Names assigned at module level; bare-name writes in handlers target
    /// these.
    pub state_names: HashSet<String>,
    pub methods: IndexMap<String, Method>,
    pub has_on_load: bool,
    /// `@mount`-decorated methods, run on initial render only.
    pub mount_methods: Vec<String>,
    pub render: Vec<RenderOp>,
    pub slot_fills: Vec<SlotFill>,
    /// Declared `!layout`, resolved to an absolute path by the loader.
    pub layout_path: Option<PathBuf>,
    /// Set when this file *is* a layout: the id children register against.
    pub layout_id: Option<String>,
    /// Set when the template contains `<style scoped>`.
    pub scope_id: Option<String>,
    pub provides: Vec<(String, Expr)>,
    pub injects: Vec<(String, String)>,
    pub props: Vec<PropSpec>,
    /// Lowercased component tag → source path.
    pub components: IndexMap<String, PathBuf>,
    pub has_file_inputs: bool,
    /// Files this program depends on (layout, components); drives cache
    /// invalidation.
    pub dependencies: HashSet<PathBuf>,
    pub diagnostics: Vec<Diagnostic>,
}

impl PageProgram {
    /// Does this layout's template declare a `$head` slot?
    pub fn declares_head_slot(&self) -> bool {
        fn walk(ops: &[RenderOp]) -> bool {
            ops.iter().any(|op| match op {
                RenderOp::Slot { name, .. } => name == "$head",
                RenderOp::Element(e) => walk(&e.children),
                RenderOp::If { body, .. } | RenderOp::For { body, .. } => walk(body),
                _ => false,
            })
        }
        walk(&self.render)
    }
}
