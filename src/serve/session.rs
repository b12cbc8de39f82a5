//! Live sessions: per-connection state, serialized event processing, and
//! hot-reload broadcast with state migration.
//!
//! A session exclusively owns one page instance for its lifetime. Inbound
//! messages are processed under the session's async mutex, so the reply for
//! message *k* is enqueued before message *k+1* is examined; the outbound
//! queue drains FIFO. Sessions idle past the expiry window are swept.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use super::message::{self, ClientMessage, ServerMessage};
use super::ServerApp;
use crate::compile::CompileFailure;
use crate::prelude::*;
use crate::route::PageTarget;
use crate::runtime::{migrate_state, EvalError, Page, PageOptions, RequestCtx};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Websocket,
    HttpPoll,
    WebTransport,
}

pub struct SessionInner {
    pub page: Option<Page>,
    pub path: String,
}

pub struct Session {
    pub id: String,
    pub kind: TransportKind,
    inner: tokio::sync::Mutex<SessionInner>,
    queue: Mutex<VecDeque<ServerMessage>>,
    notify: tokio::sync::Notify,
    last_activity: Mutex<Instant>,
}

impl Session {
    fn new(id: String, kind: TransportKind, path: String) -> Self {
        Session {
            id,
            kind,
            inner: tokio::sync::Mutex::new(SessionInner { page: None, path }),
            queue: Mutex::new(VecDeque::new()),
            notify: tokio::sync::Notify::new(),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn push(&self, message: ServerMessage) {
        self.queue.lock().unwrap().push_back(message);
        self.notify.notify_waiters();
    }

    pub fn drain(&self) -> Vec<ServerMessage> {
        self.queue.lock().unwrap().drain(..).collect()
    }

    /// Wait up to `timeout` for queued messages; returns empty on timeout.
    pub async fn drain_wait(&self, timeout: Duration) -> Vec<ServerMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let drained = self.drain();
            if !drained.is_empty() {
                return drained;
            }
            let notified = self.notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.drain();
            }
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn expired(&self, max_idle: Duration) -> bool {
        self.last_activity.lock().unwrap().elapsed() > max_idle
    }
}

#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    counter: AtomicU64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, kind: TransportKind, path: &str) -> Arc<Session> {
        let serial = self.counter.fetch_add(1, Ordering::Relaxed);
        let noise: u64 = rand::thread_rng().gen();
        let id = format!("{serial:x}-{noise:016x}");

        let session = Arc::new(Session::new(id.clone(), kind, path.to_string()));
        debug!("created {} session {}", kind.as_str(), session.id);
        self.sessions.lock().unwrap().insert(id, session.clone());
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    pub fn remove(&self, id: &str) {
        self.sessions.lock().unwrap().remove(id);
    }

    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().unwrap().values().cloned().collect()
    }

    /// Drop sessions idle past the expiry window; returns how many.
    pub fn sweep(&self, max_idle: Duration) -> usize {
        let mut sessions = self.sessions.lock().unwrap();
        let before = sessions.len();
        sessions.retain(|_, s| !s.expired(max_idle));
        before - sessions.len()
    }
}

enum PageBuildError {
    NotFound,
    Compile(Arc<CompileFailure>),
    Eval(EvalError, std::path::PathBuf),
}

/// Construct (but do not run lifecycle on) a page for a request path.
fn build_page(app: &ServerApp, raw_path: &str) -> Result<Page, PageBuildError> {
    let (pathname, query_string) = match raw_path.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (raw_path, None),
    };

    let (target, params, variant) = app
        .registry
        .match_path(pathname)
        .ok_or(PageBuildError::NotFound)?;

    let loaded = match target {
        PageTarget::Page(loaded) => loaded,
        PageTarget::CompileError(failure) => return Err(PageBuildError::Compile(failure)),
    };

    let mut request = RequestCtx {
        path: pathname.to_string(),
        method: "GET".to_string(),
        params,
        query: Default::default(),
        variant,
    };
    if let Some(query_string) = query_string {
        request.query = super::parse_query(query_string);
    }

    let file_path = loaded.program.file_path.clone();
    Page::new(&loaded, request, PageOptions::default())
        .map_err(|e| PageBuildError::Eval(e, file_path))
}

fn flush_console(session: &Session, page: &mut Page) {
    let lines = page.take_console();
    if !lines.is_empty() {
        session.push(ServerMessage::console(lines));
    }
}

/// Process one inbound frame. Replies and side-channel frames are enqueued
/// in order on the session's outbound queue.
pub async fn handle_client_message(app: &Arc<ServerApp>, session: &Arc<Session>, msg: ClientMessage) {
    session.touch();
    let mut inner = session.inner.lock().await;

    match msg {
        ClientMessage::Init { path } => {
            inner.path = path.clone();
            match build_page(app, &path) {
                Ok(mut page) => {
                    if let Err(e) = page.ensure_lifecycle() {
                        flush_console(session, &mut page);
                        session.push(message::error_trace(&e, page.file_path()));
                    }
                    inner.page = Some(page);
                }
                Err(PageBuildError::Compile(failure)) => {
                    session.push(compile_error_frame(&failure));
                }
                Err(PageBuildError::Eval(e, file)) => {
                    session.push(message::error_trace(&e, &file));
                }
                Err(PageBuildError::NotFound) => {
                    warn!("init: no route found for path {path}");
                }
            }
        }

        ClientMessage::Event {
            handler,
            data,
            path,
        } => {
            if inner.page.is_none() {
                let path = path.unwrap_or_else(|| inner.path.clone());
                match build_page(app, &path) {
                    Ok(mut page) => match page.ensure_lifecycle() {
                        Ok(()) => {
                            inner.path = path;
                            inner.page = Some(page);
                        }
                        Err(e) => {
                            flush_console(session, &mut page);
                            session.push(message::error_trace(&e, page.file_path()));
                            return;
                        }
                    },
                    Err(PageBuildError::Compile(failure)) => {
                        session.push(compile_error_frame(&failure));
                        return;
                    }
                    Err(PageBuildError::Eval(e, file)) => {
                        session.push(message::error_trace(&e, &file));
                        return;
                    }
                    Err(PageBuildError::NotFound) => {
                        warn!("event: no route found for path {path}");
                        return;
                    }
                }
            }

            let page = inner.page.as_mut().expect("page bound above");
            match page.handle_event(&handler, &data, Some(app.uploads.as_ref())) {
                Ok(html) => {
                    flush_console(session, page);
                    session.push(ServerMessage::Update { html });
                }
                Err(e) => {
                    flush_console(session, page);
                    session.push(message::error_trace(&e, page.file_path()));
                }
            }
        }

        ClientMessage::Relocate { path } => {
            match build_page(app, &path) {
                Ok(mut page) => {
                    // Identity survives relocation.
                    if let Some(old) = &inner.page {
                        if let Some(user) = old.state.get("user") {
                            page.state.insert("user".to_string(), user.clone());
                        }
                    }

                    let result = page
                        .ensure_lifecycle()
                        .and_then(|_| page.render(true));

                    match result {
                        Ok(html) => {
                            flush_console(session, &mut page);
                            session.push(ServerMessage::Update { html });
                            inner.path = path;
                            inner.page = Some(page);
                        }
                        Err(e) => {
                            flush_console(session, &mut page);
                            session.push(message::error_trace(&e, page.file_path()));
                        }
                    }
                }
                // Routing or construction failed hard: force a full reload.
                Err(PageBuildError::NotFound) | Err(PageBuildError::Compile(_)) => {
                    session.push(ServerMessage::Reload);
                }
                Err(PageBuildError::Eval(e, file)) => {
                    session.push(message::error_trace(&e, &file));
                }
            }
        }
    }
}

/// Event handling for the request-response transports (HTTP long-poll):
/// the `update`/`error_trace` reply returns directly, while console frames
/// queue for the next poll.
pub async fn handle_event_direct(
    app: &Arc<ServerApp>,
    session: &Arc<Session>,
    handler: &str,
    data: &serde_json::Value,
) -> ServerMessage {
    session.touch();
    let mut inner = session.inner.lock().await;

    if inner.page.is_none() {
        let path = inner.path.clone();
        match build_page(app, &path) {
            Ok(mut page) => match page.ensure_lifecycle() {
                Ok(()) => inner.page = Some(page),
                Err(e) => {
                    flush_console(session, &mut page);
                    return message::error_trace(&e, page.file_path());
                }
            },
            Err(PageBuildError::Compile(failure)) => return compile_error_frame(&failure),
            Err(PageBuildError::Eval(e, file)) => return message::error_trace(&e, &file),
            Err(PageBuildError::NotFound) => return ServerMessage::Reload,
        }
    }

    let page = inner.page.as_mut().expect("page bound above");
    match page.handle_event(handler, data, Some(app.uploads.as_ref())) {
        Ok(html) => {
            flush_console(session, page);
            ServerMessage::Update { html }
        }
        Err(e) => {
            flush_console(session, page);
            message::error_trace(&e, page.file_path())
        }
    }
}

fn compile_error_frame(failure: &CompileFailure) -> ServerMessage {
    ServerMessage::ErrorTrace {
        error: failure.message.clone(),
        trace: vec![message::TraceEntry {
            filename: failure.file_path.to_string_lossy().to_string(),
            lineno: failure.line.unwrap_or(0),
            name: "<compile>".to_string(),
            line: String::new(),
            colno: None,
            end_colno: None,
        }],
    }
}

/// Hot reload: for each open session whose page class was superseded,
/// attempt state-preserving migration; fall back to `reload`.
pub async fn broadcast_migrate(app: &Arc<ServerApp>) {
    for session in app.sessions.all() {
        let mut inner = session.inner.lock().await;

        let Some(old_page) = &inner.page else {
            session.push(ServerMessage::Reload);
            continue;
        };
        let path = old_page.request.path.clone();

        match build_page(app, &path) {
            Ok(mut new_page) => {
                migrate_state(old_page, &mut new_page);
                // Migration preserves state; lifecycle hooks do not re-run.
                new_page.skip_lifecycle();

                match new_page.render(true) {
                    Ok(html) => {
                        info!("hot reload (state preserved) for {:?}", new_page.file_path());
                        inner.page = Some(new_page);
                        session.push(ServerMessage::Update { html });
                    }
                    Err(e) => {
                        warn!("hot reload render failed, falling back to reload: {e}");
                        session.push(ServerMessage::Reload);
                    }
                }
            }
            Err(_) => {
                warn!("hot reload could not rebuild page for {path}, forcing reload");
                session.push(ServerMessage::Reload);
            }
        }
    }
}

/// Tell every session (all transports) something via the console channel.
pub fn broadcast_console(app: &ServerApp, text: &str) {
    for session in app.sessions.all() {
        session.push(ServerMessage::Console {
            lines: vec![text.to_string()],
            level: "warn".to_string(),
        });
    }
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Websocket => "websocket",
            TransportKind::HttpPoll => "http",
            TransportKind::WebTransport => "webtransport",
        }
    }
}
