//! The page runtime: state storage, lifecycle, slot/layout composition,
//! style collection, rendering, and event dispatch.
//!
//! A [`Page`] is one live instance of a compiled page: per HTTP request for
//! stateless renders, or owned by a live session for its whole lifetime.
//! The layout chain of the underlying program is flattened at construction:
//! state initializers run outermost-first, methods merge with the page
//! winning, and slot fillers register against their target layout's id.

pub mod attrs;
pub mod builtins;
pub mod dispatch;
pub mod eval;
pub mod render;
pub mod styles;
pub mod validate;
pub mod value;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;

pub use eval::{EvalError, Locals, Machine, TraceFrame};
pub use value::Value;

use crate::code::ast::Span;
use crate::compile::{LoadedPage, Method};
use crate::prelude::*;
use crate::route::format_pattern;
use styles::StyleCollector;

/// The request context a page is constructed with. Live sessions keep this
/// across events; relocation replaces it.
#[derive(Debug, Clone, Default)]
pub struct RequestCtx {
    pub path: String,
    pub method: String,
    pub params: IndexMap<String, String>,
    pub query: IndexMap<String, String>,
    /// The matched `!path` variant, if the route had one.
    pub variant: Option<String>,
}

impl RequestCtx {
    pub fn for_path(path: &str) -> Self {
        RequestCtx {
            path: path.to_string(),
            method: "GET".to_string(),
            ..Default::default()
        }
    }
}

/// Extra construction inputs for component instances.
#[derive(Debug, Default)]
pub struct PageOptions {
    pub props: IndexMap<String, Value>,
    pub passed_slots: IndexMap<String, String>,
    pub styles: Option<StyleCollector>,
    pub context: IndexMap<String, Value>,
    pub is_component: bool,
}

/// A slot filler registered against a layout id: the owning page (for its
/// scope id and component table) plus an index into its `slot_fills`.
#[derive(Debug, Clone)]
pub struct SlotEntry {
    pub owner: Arc<LoadedPage>,
    pub fill_index: usize,
}

pub struct Page {
    /// Leaf-first layout chain; the last entry renders the document.
    chain: Vec<Arc<LoadedPage>>,
    pub methods: IndexMap<String, Method>,
    pub state_names: HashSet<String>,
    pub state: IndexMap<String, Value>,
    /// `!provide` context, inherited through component composition.
    pub context: IndexMap<String, Value>,
    /// layout id → slot name → registered fillers, in registration order.
    pub slots: HashMap<String, IndexMap<String, Vec<SlotEntry>>>,
    /// Pre-rendered slot content passed into a component instance.
    pub passed_slots: IndexMap<String, String>,
    pub styles: StyleCollector,
    pub request: RequestCtx,
    is_component: bool,
    lifecycle_ran: bool,
    console: Vec<String>,
}

impl Page {
    pub fn new(
        loaded: &Arc<LoadedPage>,
        request: RequestCtx,
        options: PageOptions,
    ) -> Result<Page, EvalError> {
        let mut chain = vec![loaded.clone()];
        chain.extend(loaded.layout_chain());

        // Merge methods and state names, page overriding layouts.
        let mut methods = IndexMap::new();
        let mut state_names = HashSet::new();
        for member in chain.iter().rev() {
            for (name, method) in &member.program.methods {
                methods.insert(name.clone(), method.clone());
            }
            state_names.extend(member.program.state_names.iter().cloned());
        }

        // Register slot fillers against their target layout.
        let mut slots: HashMap<String, IndexMap<String, Vec<SlotEntry>>> = HashMap::new();
        for (i, member) in chain.iter().enumerate() {
            let Some(parent) = chain.get(i + 1) else { break };

            for (fill_index, fill) in member.program.slot_fills.iter().enumerate() {
                let target = if fill.slot == "$head" {
                    chain[i + 1..]
                        .iter()
                        .find(|l| l.program.declares_head_slot())
                        .unwrap_or(parent)
                } else {
                    parent
                };

                let layout_id = target.program.layout_id.clone().unwrap_or_default();
                slots
                    .entry(layout_id)
                    .or_default()
                    .entry(fill.slot.clone())
                    .or_default()
                    .push(SlotEntry {
                        owner: member.clone(),
                        fill_index,
                    });
            }
        }

        let styles = options.styles.unwrap_or_else(styles::new_collector);

        let mut page = Page {
            chain,
            methods,
            state_names,
            state: IndexMap::new(),
            context: options.context,
            slots,
            passed_slots: options.passed_slots,
            styles,
            request,
            is_component: options.is_component,
            lifecycle_ran: false,
            console: Vec::new(),
        };

        page.init_state(options.props)?;
        Ok(page)
    }

    pub fn leaf(&self) -> &Arc<LoadedPage> {
        &self.chain[0]
    }

    pub fn root(&self) -> &Arc<LoadedPage> {
        self.chain.last().expect("chain is never empty")
    }

    pub fn file_path(&self) -> &std::path::Path {
        &self.leaf().program.file_path
    }

    pub fn has_file_inputs(&self) -> bool {
        self.chain.iter().any(|m| m.program.has_file_inputs)
    }

    fn init_state(&mut self, props: IndexMap<String, Value>) -> Result<(), EvalError> {
        // Framework fields first; params are also exposed directly.
        let request_info: IndexMap<String, Value> = [
            ("path".to_string(), Value::Str(self.request.path.clone())),
            ("method".to_string(), Value::Str(self.request.method.clone())),
        ]
        .into_iter()
        .collect();
        self.state
            .insert("request".to_string(), Value::Dict(request_info));

        let params: IndexMap<String, Value> = self
            .request
            .params
            .iter()
            .map(|(k, v)| (k.clone(), Value::Str(v.clone())))
            .collect();
        for (name, value) in &params {
            self.state.insert(name.clone(), value.clone());
        }
        self.state.insert("params".to_string(), Value::Dict(params));

        let query: IndexMap<String, Value> = self
            .request
            .query
            .iter()
            .map(|(k, v)| (k.clone(), Value::Str(v.clone())))
            .collect();
        self.state.insert("query".to_string(), Value::Dict(query));

        // `path` maps each variant to whether it matched; `url` exposes the
        // normalized pattern per variant for link generation.
        let mut path_info = IndexMap::new();
        let mut url_info = IndexMap::new();
        if let Some(routes) = &self.leaf().program.routes {
            for (name, pattern) in routes {
                path_info.insert(
                    name.clone(),
                    Value::Bool(self.request.variant.as_deref() == Some(name.as_str())),
                );
                url_info.insert(
                    name.clone(),
                    Value::Str(format_pattern(pattern, &IndexMap::new())),
                );
            }
        } else {
            path_info.insert("main".to_string(), Value::Bool(true));
        }
        self.state.insert("path".to_string(), Value::Dict(path_info));
        self.state.insert("url".to_string(), Value::Dict(url_info));

        self.state.insert("errors".to_string(), Value::Dict(IndexMap::new()));
        self.state.insert("loading".to_string(), Value::Bool(false));
        self.state.insert("user".to_string(), Value::None);

        // Declared props: provided value, else default, else None. Anything
        // the caller passed beyond the declared set lands in `attrs`.
        let mut extra = props;
        for member in self.chain.clone().iter().rev() {
            for spec in &member.program.props {
                let value = match extra.shift_remove(&spec.name) {
                    Some(value) => value,
                    None => match &spec.default {
                        Some(default) => self.eval_detached(default)?,
                        None => Value::None,
                    },
                };
                self.state.insert(spec.name.clone(), value);
            }
        }
        if self.is_component {
            self.state.insert("attrs".to_string(), Value::Dict(extra));
        }

        // Module-level statements, outermost layout first so pages override.
        let chain = self.chain.clone();
        for member in chain.iter().rev() {
            let Page {
                methods,
                state_names,
                state,
                ..
            } = self;
            let mut machine = Machine::new(methods, state_names);
            let mut locals = Locals::new();
            machine.exec_block(&member.program.state_init, state, &mut locals)?;
            let lines = machine.take_console();
            self.console.extend(lines);
        }

        // Context: outer provides become visible to inner injects.
        for member in chain.iter().rev() {
            for (key, expr) in &member.program.provides {
                let value = self.eval_detached(expr)?;
                self.context.insert(key.clone(), value);
            }
            for (local, key) in &member.program.injects {
                let value = self.context.get(key).cloned().unwrap_or(Value::None);
                self.state.insert(local.clone(), value);
            }
        }

        Ok(())
    }

    /// Evaluate an expression against current state with no locals.
    fn eval_detached(&mut self, expr: &crate::code::Expr) -> Result<Value, EvalError> {
        let Page {
            methods,
            state_names,
            state,
            ..
        } = self;
        let mut machine = Machine::new(methods, state_names);
        let mut locals = Locals::new();
        let value = machine.eval(expr, state, &mut locals)?;
        let lines = machine.take_console();
        self.console.extend(lines);
        Ok(value)
    }

    /// Mark lifecycle hooks as already run. Hot-reload migration uses this:
    /// a migrated instance keeps its state and must not re-run `on_load`.
    pub fn skip_lifecycle(&mut self) {
        self.lifecycle_ran = true;
    }

    /// Run `on_load` and any `@mount` methods, once per instance.
    pub fn ensure_lifecycle(&mut self) -> Result<(), EvalError> {
        if self.lifecycle_ran || self.is_component {
            return Ok(());
        }
        self.lifecycle_ran = true;

        let mut to_run = Vec::new();
        if self.leaf().program.has_on_load || self.methods.contains_key("on_load") {
            to_run.push("on_load".to_string());
        }
        for member in &self.chain {
            for mount in &member.program.mount_methods {
                if !to_run.contains(mount) {
                    to_run.push(mount.clone());
                }
            }
        }

        for name in to_run {
            self.call_method(&name, Vec::new(), IndexMap::new())?;
        }
        Ok(())
    }

    pub fn call_method(
        &mut self,
        name: &str,
        args: Vec<Value>,
        kwargs: IndexMap<String, Value>,
    ) -> Result<Value, EvalError> {
        let Page {
            methods,
            state_names,
            state,
            ..
        } = self;
        let mut machine = Machine::new(methods, state_names);
        let result = machine.call_method(name, args, kwargs, state, Span::default());
        let lines = machine.take_console();
        self.console.extend(lines);
        result
    }

    /// Render the page body only (no script/meta/style injection). Used for
    /// component composition.
    pub fn render_body(&mut self) -> Result<String, EvalError> {
        let owner = self.root().clone();

        let Page {
            methods,
            state_names,
            state,
            slots,
            passed_slots,
            styles,
            request,
            context,
            console,
            ..
        } = self;

        let mut machine = Machine::new(methods, state_names);
        let env = render::RenderEnv {
            slots,
            passed_slots,
            styles,
            request,
            context,
        };

        let mut renderer = render::Renderer::new(&env, &mut machine);
        let html = renderer.render_plan(state, &owner, &owner.program.render);
        console.extend(machine.take_console());
        html
    }

    /// Full render. `init` runs lifecycle hooks; a live update
    /// (`init=false`) still includes the client script and SPA metadata.
    pub fn render(&mut self, init: bool) -> Result<String, EvalError> {
        if init {
            self.ensure_lifecycle()?;
        }

        let mut html = self.render_body()?;

        if self.is_component {
            return Ok(html);
        }

        // SPA metadata, then the client library.
        let leaf = self.leaf().program.clone();
        if leaf.spa_enabled {
            let meta = serde_json::json!({ "sibling_paths": leaf.sibling_paths });
            html.push_str(&format!(
                "<script id=\"{SPA_META_ID}\" type=\"application/json\">{meta}</script>"
            ));
        }
        html.push_str(&format!("<script src=\"{CLIENT_SCRIPT_SRC}\"></script>"));

        let styles = self.styles.lock().expect("style collector poisoned");
        Ok(styles::inject_styles(html, &styles))
    }

    /// Dispatch an event by handler name; re-renders and returns the HTML.
    pub fn handle_event(
        &mut self,
        name: &str,
        payload: &serde_json::Value,
        uploads: Option<&dyn dispatch::UploadResolver>,
    ) -> Result<String, EvalError> {
        dispatch::dispatch(self, name, payload, uploads)
    }

    pub fn take_console(&mut self) -> Vec<String> {
        std::mem::take(&mut self.console)
    }

    pub(crate) fn push_console(&mut self, lines: Vec<String>) {
        self.console.extend(lines);
    }
}

/// Copy every non-framework state field from `old` onto `new`, preserving
/// the user identity explicitly. Used by hot-reload migration.
pub fn migrate_state(old: &Page, new: &mut Page) {
    for (name, value) in &old.state {
        if RESERVED_FIELDS.contains(&name.as_str()) || name.starts_with('_') {
            continue;
        }
        new.state.insert(name.clone(), value.clone());
    }

    if let Some(user) = old.state.get("user") {
        new.state.insert("user".to_string(), user.clone());
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::compile::generate;
    use crate::parse::PageParser;
    use std::path::Path;

    /// Compile source text into a loaded page with no layout or components.
    pub fn load_source(src: &str) -> Arc<LoadedPage> {
        load_source_at(src, "/pages/test_page.pw")
    }

    pub fn load_source_at(src: &str, path: &str) -> Arc<LoadedPage> {
        let parsed = PageParser::new().parse(src, Path::new(path)).unwrap();
        let program = generate::generate(&parsed, None).unwrap();
        Arc::new(LoadedPage {
            program: Arc::new(program),
            layout: None,
            components: IndexMap::new(),
        })
    }

    pub fn make_page(src: &str) -> Page {
        let loaded = load_source(src);
        Page::new(&loaded, RequestCtx::for_path("/"), PageOptions::default()).unwrap()
    }
}
