//! Scoped-style collection.
//!
//! Each `<style scoped>` block registers its rewritten CSS under the page's
//! scope id. The set is owned by the root page of a render and shared by
//! reference down into component renders, so a component instantiated many
//! times contributes its CSS exactly once.

use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use itertools::Itertools;

#[derive(Debug, Default)]
pub struct StyleSet {
    entries: IndexMap<String, String>,
}

impl StyleSet {
    pub fn add(&mut self, scope_id: &str, css: &str) {
        self.entries
            .entry(scope_id.to_string())
            .or_insert_with(|| css.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn combined(&self) -> String {
        self.entries.values().join("\n")
    }
}

pub type StyleCollector = Arc<Mutex<StyleSet>>;

pub fn new_collector() -> StyleCollector {
    Arc::new(Mutex::new(StyleSet::default()))
}

/// Place collected styles into the document `<head>`: before `</head>` when
/// one exists, else as a synthesized head prefix.
pub fn inject_styles(html: String, styles: &StyleSet) -> String {
    if styles.is_empty() {
        return html;
    }

    let block = format!("<style>{}</style>", styles.combined());

    match html.find("</head>") {
        Some(pos) => {
            let mut out = String::with_capacity(html.len() + block.len());
            out.push_str(&html[..pos]);
            out.push_str(&block);
            out.push_str(&html[pos..]);
            out
        }
        None => format!("<head>{block}</head>{html}"),
    }
}
