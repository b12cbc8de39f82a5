//! Types, functions, constants and other items that are globally relevant throughout the PyWire codebase.

mod args;
mod config;
mod context;

pub use args::*;
pub use config::*;
pub use context::*;

pub const CONFIG_FILENAME: &str = "pywire.toml";

/// URL prefix reserved for framework endpoints.
pub const RESERVED_PREFIX: &str = "/_pywire";

/// Path of the browser client bundle, served under [`RESERVED_PREFIX`].
pub const CLIENT_SCRIPT_SRC: &str = "/_pywire/static/pywire.min.js";

/// Element id of the SPA navigation metadata script.
pub const SPA_META_ID: &str = "_pywire_spa_meta";

/// Stand-in tag for `<head>`, so fragment parsing preserves it.
pub const RESERVED_HEAD_TAG: &str = "pywire-head";

/// Stand-in attribute for bare `{**expr}` spreads.
pub const RESERVED_SPREAD_ATTR: &str = "__spread__";

/// Header carrying an event payload on plain HTTP requests.
pub const EVENT_HEADER: &str = "X-PyWire-Event";

/// Header identifying a long-poll session.
pub const SESSION_HEADER: &str = "X-PyWire-Session";

/// Header carrying the one-shot upload token.
pub const UPLOAD_TOKEN_HEADER: &str = "X-Upload-Token";

/// Sessions with no activity for this long are swept.
pub const SESSION_EXPIRY_SECS: u64 = 300;

/// Maximum time a poll request is held open before returning empty.
pub const POLL_TIMEOUT_SECS: u64 = 30;

/// Layout file stem; these compile as layouts, never as routes.
pub const LAYOUT_STEM: &str = "__layout__";

/// Custom error page stem, registered at `/__error__`.
pub const ERROR_STEM: &str = "__error__";

/// State fields owned by the framework; skipped during hot-reload migration.
pub const RESERVED_FIELDS: &[&str] = &[
    "request", "params", "query", "path", "url", "user", "errors", "loading",
];

/// Derive a short stable identifier from a file path.
///
/// Used for layout ids (slot registration) and style scope ids; must be
/// identical across processes and recompiles of the same file.
pub fn stable_id(path: &std::path::Path) -> String {
    let hash = seahash::hash(path.to_string_lossy().as_bytes());
    format!("{hash:012x}")[..12].to_string()
}
