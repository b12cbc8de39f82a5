//! The HTTP surface: page serving, the reserved `_pywire/` endpoints, the
//! pages scan, and hot-reload plumbing.

pub mod message;
pub mod poll;
pub mod session;
pub mod upload;
pub mod ws;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use indexmap::IndexMap;
use walkdir::WalkDir;

use crate::compile::{surrogate, CompileFailure, Loader};
use crate::prelude::*;
use crate::route::{PageTarget, Registry};
use crate::runtime::{EvalError, Page, PageOptions, RequestCtx, Value};
use session::SessionManager;
use upload::UploadStore;

pub struct ServerApp {
    pub ctx: Context,
    pub loader: Loader,
    pub registry: Registry,
    pub sessions: SessionManager,
    pub uploads: Arc<UploadStore>,
}

pub type SharedApp = Arc<ServerApp>;

pub struct Server {
    app: SharedApp,
}

impl Server {
    pub fn new(ctx: &Context) -> Result<Self> {
        let app = Arc::new(ServerApp {
            ctx: ctx.clone(),
            loader: Loader::new(ctx),
            registry: Registry::new(),
            sessions: SessionManager::new(),
            uploads: Arc::new(UploadStore::new()),
        });

        load_pages(&app)?;
        info!("Registered {} route(s).", app.registry.route_count());

        Ok(Server { app })
    }

    /// Bootstraps the Tokio runtime and starts the internal `async` serving code.
    pub fn serve(self) -> Result<()> {
        info!("Starting Tokio runtime.");

        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("Failed to start Tokio runtime.")
            .block_on(self._serve())
    }

    async fn _serve(self) -> Result<()> {
        let app = self.app.clone();

        // Session expiry sweep.
        let sweep_app = app.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let swept = sweep_app
                    .sessions
                    .sweep(Duration::from_secs(SESSION_EXPIRY_SECS));
                if swept > 0 {
                    info!("Swept {swept} expired session(s).");
                }
            }
        });

        // Hot-reload watcher (development mode only). The debouncer must
        // stay alive for the watch to keep firing.
        let _debouncer = if app.ctx.devel_mode() {
            let (debouncer, mut rx) = crate::watch::init_watcher(&app.ctx)?;
            let watch_app = app.clone();
            tokio::spawn(async move {
                while let Ok(changed) = rx.recv().await {
                    reload_changed(&watch_app, changed).await;
                }
            });
            Some(debouncer)
        } else {
            None
        };

        let max_upload = app.ctx.config.uploads.max_body_bytes as usize;

        let router = Router::new()
            .route("/_pywire/capabilities", get(handle_capabilities))
            .route("/_pywire/ws", get(ws::upgrade))
            .route("/_pywire/session", post(poll::create_session))
            .route("/_pywire/poll", get(poll::poll))
            .route("/_pywire/event", post(poll::event))
            .route(
                "/_pywire/upload",
                post(handle_upload).layer(DefaultBodyLimit::max(max_upload)),
            );

        let router = match &app.ctx.config.serve.static_dir {
            Some(static_dir) if static_dir.is_dir() => router.nest_service(
                &app.ctx.config.serve.static_prefix,
                tower_http::services::ServeDir::new(static_dir),
            ),
            Some(static_dir) => {
                warn!("Configured static directory {static_dir:?} does not exist.");
                router
            }
            None => router,
        };

        let router = router.fallback(handle_page).with_state(app.clone());

        info!("Starting webserver.");

        let ip = app.ctx.config.serve.address.parse()?;
        let port = app.ctx.config.serve.port;
        let addr = SocketAddr::new(ip, port);

        axum::Server::bind(&addr)
            .serve(router.into_make_service())
            .await?;

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pages scan and (re)registration
// ---------------------------------------------------------------------------

/// Discover and compile every page source under the pages root.
pub fn load_pages(app: &ServerApp) -> Result<()> {
    let root = app.loader.pages_root().to_path_buf();
    let extension = app.loader.extension().to_string();

    let walker = WalkDir::new(&root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(name.starts_with('_') || name.starts_with('.')) || entry.depth() == 0
        });

    for entry in walker {
        let entry = entry.wrap_err("Failed to walk the pages directory.")?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(extension.as_str()) {
            continue;
        }

        register_page_file(app, path);
    }

    // The custom error page starts with `_` and is skipped by the walk.
    let error_page = root.join(format!("{ERROR_STEM}.{extension}"));
    if error_page.is_file() {
        register_page_file(app, &error_page);
    }

    Ok(())
}

/// Compile one source file and (re)register its routes. Compile failures
/// register the surrogate at the routes the source would have owned.
pub fn register_page_file(app: &ServerApp, path: &Path) {
    let path = crate::compile::normalize_path(path);
    app.registry.remove_routes_for_file(&path);

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    // Layouts compile on demand from their dependents and own no routes.
    if stem == LAYOUT_STEM {
        return;
    }

    match app.loader.load(&path) {
        Ok(page) => {
            if stem == ERROR_STEM {
                let _ = app
                    .registry
                    .add_route("/__error__", PageTarget::Page(page), None);
                return;
            }

            // Explicit `!path` beats the implicit file-based route.
            if page.program.routes.is_some() {
                if let Err(e) = app.registry.add_page(&page) {
                    error!("Failed to register routes for {path:?}: {e}");
                }
            } else if let Some(route) =
                surrogate::derive_file_route(&path, app.loader.pages_root(), app.loader.extension())
            {
                if let Err(e) = app
                    .registry
                    .add_route(&route, PageTarget::Page(page), None)
                {
                    error!("Failed to register route for {path:?}: {e}");
                }
            }
        }
        Err(failure) => {
            error!("Failed to compile {path:?}: {failure}");
            register_surrogate(app, &path, failure);
        }
    }
}

fn register_surrogate(app: &ServerApp, path: &Path, failure: CompileFailure) {
    let source = std::fs::read_to_string(path).unwrap_or_default();
    let routes = surrogate::recover_routes(
        &source,
        path,
        app.loader.pages_root(),
        app.loader.extension(),
    );

    let failure = Arc::new(failure);
    for route in routes {
        let _ = app
            .registry
            .add_route(&route, PageTarget::CompileError(failure.clone()), None);
    }
}

/// React to a batch of changed files from the watcher.
pub async fn reload_changed(app: &SharedApp, changed: Vec<PathBuf>) {
    let extension = app.loader.extension().to_string();
    let mut any_sources = false;
    let mut any_other = false;

    for path in changed {
        if path.extension().and_then(|e| e.to_str()) != Some(extension.as_str()) {
            any_other = true;
            continue;
        }
        any_sources = true;

        let invalidated = app.loader.invalidate(&path);
        for page_path in invalidated {
            app.registry.remove_routes_for_file(&page_path);

            if !page_path.exists() {
                continue;
            }

            let stem = page_path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            if stem.starts_with('_') && stem != ERROR_STEM {
                continue;
            }

            register_page_file(app, &page_path);
            info!("Reloaded page: {page_path:?}");
        }
    }

    if any_sources {
        session::broadcast_migrate(app).await;
    } else if any_other {
        session::broadcast_console(
            app,
            "A non-page file changed under the pages root; restart the server to pick it up.",
        );
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle_capabilities() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "transports": ["websocket", "http"],
        // WebTransport needs externally-provisioned QUIC/TLS.
        "webtransport": false,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_upload(
    State(app): State<SharedApp>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let token = headers
        .get(UPLOAD_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !app.uploads.token_valid(token) {
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({"error": "Invalid or expired upload token"})),
        )
            .into_response();
    }

    if let Some(length) = headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        if length > app.ctx.config.uploads.max_body_bytes {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(serde_json::json!({"error": "Payload Too Large"})),
            )
                .into_response();
        }
    }

    let mut response = serde_json::Map::new();
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                let Some(name) = field.name().map(str::to_string) else {
                    continue;
                };
                let Some(filename) = field.file_name().map(str::to_string) else {
                    continue;
                };
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();

                match field.bytes().await {
                    Ok(data) => {
                        let id = app.uploads.save(&filename, &content_type, data.to_vec());
                        response.insert(name, serde_json::Value::String(id));
                    }
                    Err(e) => {
                        return (
                            StatusCode::PAYLOAD_TOO_LARGE,
                            Json(serde_json::json!({"error": e.to_string()})),
                        )
                            .into_response()
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"error": e.to_string()})),
                )
                    .into_response()
            }
        }
    }

    Json(serde_json::Value::Object(response)).into_response()
}

/// The catch-all page handler: `GET` renders, `POST` with the event header
/// dispatches a single event and returns JSON.
async fn handle_page(
    State(app): State<SharedApp>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    debug!("{method} request for path {path}");

    let Some((target, params, variant)) = app.registry.match_path(&path) else {
        return not_found(&app, &path).await;
    };

    let loaded = match target {
        PageTarget::Page(loaded) => loaded,
        PageTarget::CompileError(failure) => {
            // Mode decided at render time: detail page in dev, 500 in prod.
            if app.ctx.debug_enabled() {
                return Html(surrogate::render_error_page(&failure)).into_response();
            }
            return server_error(&app, &failure.to_string()).await;
        }
    };

    let request = RequestCtx {
        path: path.clone(),
        method: method.to_string(),
        params,
        query: uri.query().map(parse_query).unwrap_or_default(),
        variant,
    };

    let mut page = match Page::new(&loaded, request, PageOptions::default()) {
        Ok(page) => page,
        Err(e) => return eval_error_response(&app, &loaded.program.file_path, &e).await,
    };

    // Event dispatch over plain HTTP.
    if method == Method::POST && headers.contains_key(EVENT_HEADER) {
        let payload: serde_json::Value = match serde_json::from_slice(&body) {
            Ok(payload) => payload,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"error": e.to_string()})),
                )
                    .into_response()
            }
        };

        let handler = payload
            .get("handler")
            .and_then(|h| h.as_str())
            .unwrap_or_default()
            .to_string();

        return match page.handle_event(&handler, &payload, Some(app.uploads.as_ref())) {
            Ok(html) => Json(serde_json::json!({"type": "update", "html": html})).into_response(),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response(),
        };
    }

    match page.render(true) {
        Ok(mut html) => {
            if page.has_file_inputs() {
                let token = app.uploads.mint_token();
                let meta = format!("<meta name=\"pywire-upload-token\" content=\"{token}\">");
                match html.find("</body>") {
                    Some(pos) => html.insert_str(pos, &meta),
                    None => html.push_str(&meta),
                }
            }
            Html(html).into_response()
        }
        Err(e) => eval_error_response(&app, &loaded.program.file_path, &e).await,
    }
}

async fn eval_error_response(app: &SharedApp, file: &Path, error: &EvalError) -> Response {
    error!("Page error in {file:?}: {error}");

    if app.ctx.debug_enabled() {
        let failure = CompileFailure::new(file, error.message.clone(), Some(error.line));
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Html(surrogate::render_error_page(&failure)),
        )
            .into_response();
    }

    server_error(app, &error.to_string()).await
}

/// RouteMiss: serve the custom error page if registered, else a built-in 404.
async fn not_found(app: &SharedApp, path: &str) -> Response {
    if let Some(response) = try_error_page(app, path, 404).await {
        return response;
    }

    let body = format!(
        "<!DOCTYPE html><html><head><title>404 Not Found</title></head>\
         <body><h1>404 Not Found</h1><p>The path '{}' could not be found.</p>\
         <script src=\"{CLIENT_SCRIPT_SRC}\"></script></body></html>",
        html_escape::encode_text(path)
    );
    (StatusCode::NOT_FOUND, Html(body)).into_response()
}

async fn server_error(app: &SharedApp, detail: &str) -> Response {
    if let Some(response) = try_error_page(app, "/", 500).await {
        return response;
    }

    if app.ctx.debug_enabled() {
        // Reports may carry ANSI colour from the eyre hooks.
        let detail = ansi_to_html::convert_escaped(detail)
            .unwrap_or_else(|_| html_escape::encode_text(detail).into_owned());
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Html(format!("<h1>Internal Server Error</h1><pre>{detail}</pre>")),
        )
            .into_response();
    }

    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}

/// Render the `__error__` page with `error_code` injected, if one exists.
async fn try_error_page(app: &SharedApp, path: &str, code: u16) -> Option<Response> {
    let (target, params, variant) = app.registry.match_path("/__error__")?;
    let PageTarget::Page(loaded) = target else {
        return None;
    };

    let request = RequestCtx {
        path: path.to_string(),
        method: "GET".to_string(),
        params,
        query: IndexMap::new(),
        variant,
    };

    let mut page = Page::new(&loaded, request, PageOptions::default()).ok()?;
    page.state
        .insert("error_code".to_string(), Value::Int(code as i64));

    match page.render(true) {
        Ok(html) => {
            let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            Some((status, Html(html)).into_response())
        }
        Err(e) => {
            error!("Failed to render custom error page: {e}");
            None
        }
    }
}

/// Decode an `application/x-www-form-urlencoded` query string.
pub fn parse_query(query: &str) -> IndexMap<String, String> {
    let mut out = IndexMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = urlencoding::decode(key).map(|k| k.into_owned());
        let value = urlencoding::decode(value).map(|v| v.into_owned());
        if let (Ok(key), Ok(value)) = (key, value) {
            out.insert(key.replace('+', " "), value.replace('+', " "));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::message::{ClientMessage, ServerMessage};
    use super::*;
    use crate::common::{Arguments, Command, Config, InnerContext};

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn temp_pages(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("pywire-serve-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn build_app(pages_dir: &Path) -> SharedApp {
        let mut config = Config::default();
        config.pages_dir = pages_dir.to_path_buf();
        config.serve.debug = true;
        let ctx = InnerContext::from_config(
            Arguments {
                command: Command::Dev { pages: None },
                quiet: true,
                verbose: 0,
            },
            config,
        );

        let app = Arc::new(ServerApp {
            ctx: ctx.clone(),
            loader: Loader::new(&ctx),
            registry: Registry::new(),
            sessions: SessionManager::new(),
            uploads: Arc::new(UploadStore::new()),
        });
        load_pages(&app).unwrap();
        app
    }

    #[test]
    fn scans_file_based_routes() {
        let root = temp_pages("scan");
        write(&root.join("index.pw"), "<p>home</p>\n");
        write(&root.join("about.pw"), "<p>about</p>\n");
        write(&root.join("blog/[id].pw"), "<p>{id}</p>\n");

        let app = build_app(&root);

        assert!(app.registry.match_path("/").is_some());
        assert!(app.registry.match_path("/about").is_some());
        let (_, params, _) = app.registry.match_path("/blog/7").unwrap();
        assert_eq!(params["id"], "7");
        assert!(app.registry.match_path("/missing").is_none());
    }

    #[test]
    fn explicit_path_beats_file_route() {
        let root = temp_pages("explicit");
        write(&root.join("special.pw"), "!path '/custom'\n<p>x</p>\n");

        let app = build_app(&root);
        assert!(app.registry.match_path("/custom").is_some());
        assert!(app.registry.match_path("/special").is_none());
    }

    #[test]
    fn multi_variant_paths_register_independently() {
        let root = temp_pages("variants");
        write(&root.join("tabs.pw"), "!path {a: '/a', b: '/b'}\n<p>x</p>\n");

        let app = build_app(&root);
        let (_, _, variant) = app.registry.match_path("/a").unwrap();
        assert_eq!(variant.as_deref(), Some("a"));
        let (_, _, variant) = app.registry.match_path("/b").unwrap();
        assert_eq!(variant.as_deref(), Some("b"));
    }

    #[test]
    fn broken_page_registers_surrogate() {
        let root = temp_pages("broken");
        write(
            &root.join("bad.pw"),
            "!path '/bad'\n<p>x</p>\n---\ndef broken(:\n---\n",
        );

        let app = build_app(&root);
        let (target, _, _) = app.registry.match_path("/bad").unwrap();
        assert!(matches!(target, PageTarget::CompileError(_)));
    }

    #[test]
    fn query_parsing() {
        let query = parse_query("a=1&b=hello+world&c=%2Fx");
        assert_eq!(query["a"], "1");
        assert_eq!(query["b"], "hello world");
        assert_eq!(query["c"], "/x");
    }

    #[tokio::test]
    async fn session_events_are_ordered() {
        let root = temp_pages("ordering");
        write(
            &root.join("counter.pw"),
            indoc! {"
                <p>{count}</p>
                ---
                count = 0

                def increment():
                    count += 1
                ---
            "},
        );

        let app = build_app(&root);
        let session = app
            .sessions
            .create(session::TransportKind::Websocket, "/counter");

        for _ in 0..3 {
            session::handle_client_message(
                &app,
                &session,
                ClientMessage::Event {
                    handler: "increment".into(),
                    data: serde_json::json!({}),
                    path: Some("/counter".into()),
                },
            )
            .await;
        }

        let updates: Vec<String> = session
            .drain()
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::Update { html } => Some(html),
                _ => None,
            })
            .collect();

        assert_eq!(updates.len(), 3);
        assert!(updates[0].contains("<p>1</p>"));
        assert!(updates[1].contains("<p>2</p>"));
        assert!(updates[2].contains("<p>3</p>"));
    }

    #[tokio::test]
    async fn handler_errors_become_error_trace() {
        let root = temp_pages("trace");
        write(
            &root.join("boom.pw"),
            "<p>x</p>\n---\ndef boom():\n    missing\n---\n",
        );

        let app = build_app(&root);
        let session = app
            .sessions
            .create(session::TransportKind::Websocket, "/boom");

        session::handle_client_message(
            &app,
            &session,
            ClientMessage::Event {
                handler: "boom".into(),
                data: serde_json::json!({}),
                path: Some("/boom".into()),
            },
        )
        .await;

        let messages = session.drain();
        assert!(messages
            .iter()
            .any(|m| matches!(m, ServerMessage::ErrorTrace { error, .. } if error.contains("missing"))));
    }

    #[tokio::test]
    async fn relocate_to_unknown_path_forces_reload() {
        let root = temp_pages("relocate");
        write(&root.join("index.pw"), "<p>home</p>\n");

        let app = build_app(&root);
        let session = app.sessions.create(session::TransportKind::Websocket, "/");

        session::handle_client_message(
            &app,
            &session,
            ClientMessage::Relocate {
                path: "/nowhere".into(),
            },
        )
        .await;

        let messages = session.drain();
        assert!(matches!(messages.last(), Some(ServerMessage::Reload)));
    }

    #[tokio::test]
    async fn hot_reload_migrates_session_state() {
        let root = temp_pages("hotreload");
        let source = indoc! {"
            <p>{count}</p>
            ---
            count = 0

            def increment():
                count += 1
            ---
        "};
        write(&root.join("counter.pw"), source);

        let app = build_app(&root);
        let session = app
            .sessions
            .create(session::TransportKind::Websocket, "/counter");

        // Establish state: count becomes 5.
        for _ in 0..5 {
            session::handle_client_message(
                &app,
                &session,
                ClientMessage::Event {
                    handler: "increment".into(),
                    data: serde_json::json!({}),
                    path: Some("/counter".into()),
                },
            )
            .await;
        }
        session.drain();

        // Edit the source (add a method) and reload.
        let edited = source.replace(
            "def increment():",
            "def reset():\n    count = 0\n\ndef increment():",
        );
        write(&root.join("counter.pw"), edited.as_str());
        reload_changed(&app, vec![root.join("counter.pw")]).await;

        let messages = session.drain();
        let update = messages.iter().find_map(|m| match m {
            ServerMessage::Update { html } => Some(html),
            _ => None,
        });
        assert!(
            update.unwrap().contains("<p>5</p>"),
            "state should survive migration"
        );

        // And the new class is the one matched by the registry.
        let (target, _, _) = app.registry.match_path("/counter").unwrap();
        let PageTarget::Page(page) = target else { panic!() };
        assert!(page.program.methods.contains_key("reset"));
    }

    #[tokio::test]
    async fn hot_reload_falls_back_to_reload_on_broken_source() {
        let root = temp_pages("hotreload-broken");
        write(
            &root.join("counter.pw"),
            "<p>{count}</p>\n---\ncount = 0\n---\n",
        );

        let app = build_app(&root);
        let session = app
            .sessions
            .create(session::TransportKind::Websocket, "/counter");
        session::handle_client_message(
            &app,
            &session,
            ClientMessage::Init {
                path: "/counter".into(),
            },
        )
        .await;
        session.drain();

        write(&root.join("counter.pw"), "<p>{count}</p>\n---\ncount = = 0\n---\n");
        reload_changed(&app, vec![root.join("counter.pw")]).await;

        let messages = session.drain();
        assert!(messages
            .iter()
            .any(|m| matches!(m, ServerMessage::Reload)));
    }

    #[tokio::test]
    async fn stale_routes_are_unreachable_after_reload() {
        let root = temp_pages("stale");
        write(&root.join("page.pw"), "!path '/old'\n<p>x</p>\n");

        let app = build_app(&root);
        assert!(app.registry.match_path("/old").is_some());

        write(&root.join("page.pw"), "!path '/new'\n<p>x</p>\n");
        reload_changed(&app, vec![root.join("page.pw")]).await;

        assert!(app.registry.match_path("/old").is_none());
        assert!(app.registry.match_path("/new").is_some());
    }
}
