//! `sluice dev` command implementation.
//!
//! Serves an in-memory build and pushes hot updates:
//!
//! ```text
//! notify events -> debounce -> DevSession::file_changed (blocking pool)
//!                                   -> HmrMessage -> broadcast -> /__hmr sockets
//! GET /            HTML document with the client script
//! GET /__sluice/*  client script, chunks by name
//! GET /*path       emitted artifacts
//! ```

use super::{config_failure, ProjectArgs};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path as AxumPath, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use miette::{miette, IntoDiagnostic, Result};
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use sluice_core::dev::{client_script, content_type, CHUNK_PREFIX, CLIENT_PATH};
use sluice_core::dev::ContextLoader;
use sluice_core::{DevSession, PipelineConfig};
use sluice_proto::{HmrMessage, HMR_ENDPOINT};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Dev server action.
#[derive(Debug, Clone)]
pub struct DevAction {
    pub project: ProjectArgs,
    /// Port override.
    pub port: Option<u16>,
    /// Host override.
    pub host: Option<String>,
}

struct DevState {
    session: DevSession,
    hmr_tx: broadcast::Sender<HmrMessage>,
}

type AppState = Arc<DevState>;

/// Start the dev server and run until interrupted.
pub async fn run(action: DevAction, json: bool) -> Result<()> {
    let (port, host) = (action.port, action.host.clone());
    let overrides = move |config: PipelineConfig| {
        let mut config = match port {
            Some(port) => config.with_port(port),
            None => config,
        };
        if let Some(host) = &host {
            config.dev_server.host.clone_from(host);
        }
        config
    };
    let ctx = match action.project.context(overrides.clone()) {
        Ok(ctx) => ctx,
        Err(err) => config_failure(&err, json),
    };

    let settings = ctx.config().dev_server.clone();
    let root = ctx.root().to_path_buf();
    let out_dir = ctx.output_dir();
    let config_file = action.project.config_path();

    let project = action.project.clone();
    let loader: ContextLoader = Box::new(move || project.context(overrides.clone()));
    let reload_path = config_file.clone();
    let session = tokio::task::spawn_blocking(move || {
        DevSession::new(ctx).map(|session| session.with_config_reload(reload_path, loader))
    })
    .await
    .into_diagnostic()?
    .map_err(|err| miette!(code = err.code(), "{err}"))?;

    let (hmr_tx, _) = broadcast::channel::<HmrMessage>(16);
    let state = Arc::new(DevState { session, hmr_tx });

    let (change_tx, change_rx) = mpsc::channel::<Vec<PathBuf>>(16);
    let debounce = Duration::from_millis(settings.debounce_ms);
    let watch_root = root.clone();
    std::thread::spawn(move || {
        if let Err(err) = watch_files(&watch_root, &config_file, &out_dir, debounce, &change_tx) {
            warn!(error = %err, "file watcher stopped");
        }
    });
    tokio::spawn(handle_changes(Arc::clone(&state), change_rx, settings.hot));

    let app = Router::new()
        .route("/", get(serve_index))
        .route(HMR_ENDPOINT, get(hmr_websocket))
        .route(CLIENT_PATH, get(serve_client))
        .route(&format!("{CHUNK_PREFIX}:file"), get(serve_chunk))
        .route("/*path", get(serve_artifact))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let host_ip = if settings.host == "localhost" {
        "127.0.0.1"
    } else {
        settings.host.as_str()
    };
    let addr: SocketAddr = format!("{host_ip}:{}", settings.port)
        .parse()
        .into_diagnostic()?;

    println!();
    println!("  Dev server running at http://{}:{}", settings.host, settings.port);
    if settings.hot {
        println!("  Hot updates enabled ({HMR_ENDPOINT})");
    }
    println!();
    println!("  Press Ctrl+C to stop");
    println!();

    let listener = tokio::net::TcpListener::bind(addr).await.into_diagnostic()?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .into_diagnostic()?;

    Ok(())
}

/// Rebuild for each batch of changes. Batches run concurrently on the
/// blocking pool; the session discards superseded ones.
async fn handle_changes(state: AppState, mut change_rx: mpsc::Receiver<Vec<PathBuf>>, hot: bool) {
    while let Some(paths) = change_rx.recv().await {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let files = paths.len();
            let session_state = Arc::clone(&state);
            let message =
                tokio::task::spawn_blocking(move || session_state.session.file_changed(&paths)).await;
            match message {
                Ok(Some(message)) => {
                    info!(files, kind = message_kind(&message), "rebuilt");
                    if hot {
                        // No receivers is fine: nobody is connected
                        let _ = state.hmr_tx.send(message);
                    }
                }
                Ok(None) => debug!(files, "no update to push"),
                Err(err) => warn!(error = %err, "rebuild task failed"),
            }
        });
    }
}

fn message_kind(message: &HmrMessage) -> &'static str {
    match message {
        HmrMessage::Connected { .. } => "connected",
        HmrMessage::Update { .. } => "update",
        HmrMessage::Reload => "reload",
        HmrMessage::Error { .. } => "error",
    }
}

// ============================================================================
// Route Handlers
// ============================================================================

async fn serve_index(State(state): State<AppState>) -> Response {
    file_response(&state, "")
}

async fn serve_artifact(State(state): State<AppState>, AxumPath(path): AxumPath<String>) -> Response {
    file_response(&state, &path)
}

fn file_response(state: &DevState, path: &str) -> Response {
    match state.session.artifact(path) {
        Some(artifact) => (
            [
                (header::CONTENT_TYPE, content_type(&artifact.path)),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            artifact.bytes,
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, format!("Not found: /{path}")).into_response(),
    }
}

async fn serve_client() -> Response {
    (
        [(header::CONTENT_TYPE, content_type("hmr.js"))],
        client_script(),
    )
        .into_response()
}

/// `/__sluice/chunk/<name>.js` or `.css`: current content of a chunk.
async fn serve_chunk(State(state): State<AppState>, AxumPath(file): AxumPath<String>) -> Response {
    let source = file
        .rsplit_once('.')
        .and_then(|(name, ext)| state.session.chunk_source(name, ext));
    match source {
        Some(bytes) => (
            [
                (header::CONTENT_TYPE, content_type(&file)),
                (header::CACHE_CONTROL, "no-store"),
            ],
            bytes,
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, format!("Unknown chunk: {file}")).into_response(),
    }
}

// ============================================================================
// WebSocket
// ============================================================================

async fn hmr_websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_hmr_socket(socket, state))
}

async fn handle_hmr_socket(mut socket: WebSocket, state: AppState) {
    let mut rx = state.hmr_tx.subscribe();
    if send(&mut socket, &HmrMessage::connected()).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(message) => {
                    if send(&mut socket, &message).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "client lagged, requesting reload");
                    if send(&mut socket, &HmrMessage::Reload).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn send(socket: &mut WebSocket, message: &HmrMessage) -> std::result::Result<(), ()> {
    let text = message.to_json().map_err(|_| ())?;
    socket.send(Message::Text(text)).await.map_err(|_| ())
}

// ============================================================================
// File Watching
// ============================================================================

/// Paths the watcher never reports.
fn should_ignore(path: &Path, out_dir: &Path) -> bool {
    if path.starts_with(out_dir) {
        return true;
    }
    let path_str = path.to_string_lossy().replace('\\', "/");
    if ["/node_modules/", "/.git/", "/target/"]
        .iter()
        .any(|dir| path_str.contains(dir))
    {
        return true;
    }
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with('.'))
}

/// Watch `root` and the config file, sending each burst of changes once it
/// has been quiet for `debounce`.
fn watch_files(
    root: &Path,
    config_file: &Path,
    out_dir: &Path,
    debounce: Duration,
    change_tx: &mpsc::Sender<Vec<PathBuf>>,
) -> Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher = RecommendedWatcher::new(tx, Config::default()).into_diagnostic()?;
    watcher.watch(root, RecursiveMode::Recursive).into_diagnostic()?;
    if !config_file.starts_with(root) && config_file.is_file() {
        watcher
            .watch(config_file, RecursiveMode::NonRecursive)
            .into_diagnostic()?;
    }

    let mut pending: BTreeSet<PathBuf> = BTreeSet::new();
    loop {
        let event = if pending.is_empty() {
            rx.recv().map_err(|_| std::sync::mpsc::RecvTimeoutError::Disconnected)
        } else {
            rx.recv_timeout(debounce)
        };
        match event {
            Ok(Ok(event)) => {
                if event.kind.is_access() {
                    continue;
                }
                pending.extend(event.paths.into_iter().filter(|p| !should_ignore(p, out_dir)));
            }
            Ok(Err(err)) => warn!(error = %err, "watch error"),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                let batch: Vec<PathBuf> = std::mem::take(&mut pending).into_iter().collect();
                debug!(files = batch.len(), "changes settled");
                if change_tx.blocking_send(batch).is_err() {
                    break;
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}
