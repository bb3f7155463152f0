use super::inject_client;
use crate::builder::{BuildMode, GraphBuilder};
use crate::config::{PipelineConfig, CONFIG_FILE_NAME};
use crate::context::PipelineContext;
use crate::emit::{Artifact, ArtifactKind};
use crate::error::{Error, PipelineError};
use crate::graph::{ModuleGraph, ModuleId, ModuleKey};
use crate::pipeline::{emit_graph, Emission};
use crate::plugin::{HotUpdate, PipelineStart};
use rustc_hash::FxHashMap as HashMap;
use sluice_proto::HmrMessage;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct ChunkFiles {
    js: String,
    css: Option<String>,
}

/// The last committed build.
struct Snapshot {
    graph: ModuleGraph,
    chunks: BTreeMap<String, ChunkFiles>,
    /// Chunk name to hash; extracted stylesheets as `<name>.css`.
    hashes: BTreeMap<String, String>,
    artifacts: HashMap<String, Artifact>,
}

impl Snapshot {
    fn new(graph: ModuleGraph, emission: Emission, hot: bool) -> Self {
        let mut chunks = BTreeMap::new();
        let mut hashes = BTreeMap::new();
        for chunk in &emission.chunks {
            chunks.insert(
                chunk.name.clone(),
                ChunkFiles {
                    js: chunk.file.clone(),
                    css: chunk.css_file.clone(),
                },
            );
            hashes.insert(chunk.name.clone(), chunk.hash.clone());
            if let Some(css_hash) = &chunk.css_hash {
                hashes.insert(format!("{}.css", chunk.name), css_hash.clone());
            }
        }

        let artifacts = emission
            .artifacts
            .into_iter()
            .map(|mut artifact| {
                if hot && artifact.kind == ArtifactKind::Html {
                    let html = String::from_utf8_lossy(&artifact.bytes);
                    artifact.bytes = inject_client(&html).into_bytes();
                }
                (artifact.path.clone(), artifact)
            })
            .collect();

        Self {
            graph,
            chunks,
            hashes,
            artifacts,
        }
    }
}

/// Creates a fresh pipeline context after the config file changed.
pub type ContextLoader = Box<dyn Fn() -> Result<PipelineContext, Error> + Send + Sync>;

/// A context and what the session took from it when it started.
struct Pipeline {
    ctx: Arc<PipelineContext>,
    entries: BTreeMap<String, String>,
    virtual_modules: BTreeMap<String, String>,
    inject_styles: bool,
    hot: bool,
}

impl Pipeline {
    /// Run the `pipeline_start` hook and a full tolerant build.
    fn start(ctx: PipelineContext) -> Result<(Self, Snapshot), PipelineError> {
        let inject_styles = ctx.config().dev_server.inject_styles;
        let hot = ctx.config().dev_server.hot;

        let mut start = PipelineStart {
            entries: ctx.config().entry.clone(),
            virtual_modules: BTreeMap::new(),
        };
        ctx.hooks().pipeline_start.call(&mut start)?;

        let graph = GraphBuilder::new(&ctx, BuildMode::Tolerant)
            .with_virtual_modules(start.virtual_modules.clone())
            .build(&start.entries)?;
        let emission = emit_graph(&ctx, &graph, inject_styles, None)?;
        info!(
            modules = graph.len(),
            chunks = emission.chunks.len(),
            "dev session ready"
        );

        let pipeline = Self {
            ctx: Arc::new(ctx),
            entries: start.entries,
            virtual_modules: start.virtual_modules,
            inject_styles,
            hot,
        };
        Ok((pipeline, Snapshot::new(graph, emission, hot)))
    }
}

/// In-memory build that follows file changes.
///
/// Rebuilds are serialized. Every change bumps a generation counter; a
/// rebuild that finishes after a newer change arrived is discarded and its
/// paths are handed to the newer one, so clients only ever see the newest
/// consistent set of chunks.
///
/// A change to the config file recreates the context and rebuilds the whole
/// graph, then asks clients to reload.
pub struct DevSession {
    pipeline: RwLock<Arc<Pipeline>>,
    config_path: PathBuf,
    loader: ContextLoader,
    state: RwLock<Snapshot>,
    pending: Mutex<BTreeSet<PathBuf>>,
    rebuild_lock: Mutex<()>,
    generation: AtomicU64,
}

impl DevSession {
    /// Run the initial tolerant build into memory.
    ///
    /// Edits to `sluice.config.json` at the root reload the configuration
    /// with defaults for everything the file leaves out. Use
    /// [`with_config_reload`](Self::with_config_reload) to follow another
    /// file or keep overrides.
    pub fn new(ctx: PipelineContext) -> Result<Self, PipelineError> {
        let root = ctx.root().to_path_buf();
        let config_path = root.join(CONFIG_FILE_NAME);
        let (pipeline, snapshot) = Pipeline::start(ctx)?;

        Ok(Self {
            pipeline: RwLock::new(Arc::new(pipeline)),
            config_path,
            loader: Box::new(move || {
                PipelineContext::new(&root, PipelineConfig::load(&root, None)?)
            }),
            state: RwLock::new(snapshot),
            pending: Mutex::new(BTreeSet::new()),
            rebuild_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        })
    }

    /// Follow `path` as the config file and recreate the context with `loader`
    /// when it changes.
    #[must_use]
    pub fn with_config_reload(mut self, path: impl Into<PathBuf>, loader: ContextLoader) -> Self {
        let path = path.into();
        self.config_path = dunce::canonicalize(&path).unwrap_or(path);
        self.loader = loader;
        self
    }

    /// The context of the current configuration.
    #[must_use]
    pub fn context(&self) -> Arc<PipelineContext> {
        Arc::clone(&self.pipeline().ctx)
    }

    /// The config file whose changes reload the session.
    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Number of changes seen so far.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// An emitted file by its output path. `/` and the empty path map to
    /// the HTML document.
    #[must_use]
    pub fn artifact(&self, path: &str) -> Option<Artifact> {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            let ctx = self.context();
            let index = ctx.config().html.as_ref()?.filename.as_str();
            return self.read().artifacts.get(index).cloned();
        }
        self.read().artifacts.get(path).cloned()
    }

    /// Current script (`ext = "js"`) or stylesheet (`ext = "css"`) of a chunk.
    #[must_use]
    pub fn chunk_source(&self, name: &str, ext: &str) -> Option<Vec<u8>> {
        let state = self.read();
        let files = state.chunks.get(name)?;
        let file = match ext {
            "js" => &files.js,
            "css" => files.css.as_ref()?,
            _ => return None,
        };
        state.artifacts.get(file).map(|a| a.bytes.clone())
    }

    /// Current chunk hashes.
    #[must_use]
    pub fn chunk_hashes(&self) -> BTreeMap<String, String> {
        self.read().hashes.clone()
    }

    /// Emitted id of the module built from `path`, as sent in updates.
    #[must_use]
    pub fn module_id(&self, path: &Path) -> Option<ModuleKey> {
        let canonical = dunce::canonicalize(path).ok()?;
        let state = self.read();
        state.graph.id_of(&canonical).and_then(|id| state.graph.key_of(id))
    }

    /// React to changed files. Returns the message for clients, or `None`
    /// when nothing observable changed or the rebuild was superseded.
    pub fn file_changed(&self, paths: &[PathBuf]) -> Option<HmrMessage> {
        let generation = self.begin(paths);
        if paths.iter().any(|path| self.is_config_file(path)) {
            return Some(self.reload_config());
        }
        self.rebuild(generation)
    }

    fn is_config_file(&self, path: &Path) -> bool {
        path == self.config_path
            || dunce::canonicalize(path).is_ok_and(|path| path == self.config_path)
    }

    /// Recreate the context from the config file and rebuild everything.
    fn reload_config(&self) -> HmrMessage {
        let _guard = self.rebuild_lock.lock().unwrap_or_else(PoisonError::into_inner);
        // The full build reads every file, pending ones included
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let file = self.context().rel_path(&self.config_path);
        let ctx = match (self.loader)() {
            Ok(ctx) => ctx,
            Err(err) => {
                warn!(file = %file, error = %err, "config reload failed");
                return HmrMessage::error(err.to_string(), Some(file));
            }
        };
        let (pipeline, snapshot) = match Pipeline::start(ctx) {
            Ok(started) => started,
            Err(err) => return self.failure_message(&err),
        };

        *self.pipeline.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(pipeline);
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
        info!(file = %file, "config reloaded, requesting reload");
        HmrMessage::Reload
    }

    fn begin(&self, paths: &[PathBuf]) -> u64 {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(paths.iter().cloned());
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn rebuild(&self, generation: u64) -> Option<HmrMessage> {
        let _guard = self.rebuild_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let paths: Vec<PathBuf> = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *pending).into_iter().collect()
        };
        if paths.is_empty() {
            return None;
        }

        let (mut graph, old_hashes) = {
            let state = self.read();
            let hashes: HashMap<PathBuf, String> = state
                .graph
                .iter()
                .map(|m| (m.path.clone(), m.hash.clone()))
                .collect();
            (state.graph.clone(), hashes)
        };

        let pipeline = self.pipeline();
        let builder = GraphBuilder::new(&pipeline.ctx, BuildMode::Tolerant)
            .with_virtual_modules(pipeline.virtual_modules.clone());
        let affected = match builder.rebuild(&mut graph, &paths) {
            Ok(affected) => affected,
            Err(err) => return Some(self.failure_message(&err)),
        };
        if affected.is_empty() {
            debug!(files = paths.len(), "change outside the module graph");
            return None;
        }

        // Modules whose output changed, plus their static importers
        let modified: Vec<ModuleId> = affected
            .iter()
            .copied()
            .filter(|&id| {
                graph
                    .get(id)
                    .is_some_and(|m| old_hashes.get(&m.path) != Some(&m.hash))
            })
            .collect();
        let changed = graph.invalidated_by(&modified);

        let mut hot = HotUpdate {
            changed: changed.iter().copied().collect(),
        };
        if let Err(err) = pipeline.ctx.hooks().hot_update.call(&mut hot) {
            return Some(self.failure_message(&PipelineError::from(err)));
        }
        hot.changed.retain(|id| changed.contains(id));

        let emission = match emit_graph(&pipeline.ctx, &graph, pipeline.inject_styles, None) {
            Ok(emission) => emission,
            Err(err) => return Some(self.failure_message(&err)),
        };
        let failure = graph.failures().first().map(|&(id, message)| {
            let file = graph.get(id).map(|m| m.rel_path.clone());
            (message.to_string(), file)
        });
        let mut changed_keys: Vec<ModuleKey> = hot.changed.iter().filter_map(|&id| graph.key_of(id)).collect();
        changed_keys.sort_unstable();
        changed_keys.dedup();
        let next = Snapshot::new(graph, emission, pipeline.hot);

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(generation, "discarding superseded rebuild");
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(paths);
            return None;
        }

        let reshaped = !state.chunks.keys().eq(next.chunks.keys());
        let chunk_hashes: BTreeMap<String, String> = next
            .hashes
            .iter()
            .filter(|(name, hash)| state.hashes.get(*name) != Some(*hash))
            .map(|(name, hash)| (name.clone(), hash.clone()))
            .collect();
        *state = next;
        drop(state);

        if let Some((message, file)) = failure {
            warn!(file = file.as_deref().unwrap_or("?"), "rebuild failed");
            return Some(HmrMessage::error(message, file));
        }
        if reshaped {
            info!("chunk layout changed, requesting reload");
            return Some(HmrMessage::Reload);
        }

        let message = HmrMessage::Update {
            changed_module_ids: changed_keys,
            chunk_hashes,
        };
        if message.is_empty_update() {
            return None;
        }
        info!(generation, "hot update ready");
        Some(message)
    }

    fn failure_message(&self, err: &PipelineError) -> HmrMessage {
        warn!(error = %err, "rebuild failed");
        let ctx = self.context();
        HmrMessage::error(err.to_string(), err.file().map(|path| ctx.rel_path(&path)))
    }

    fn pipeline(&self) -> Arc<Pipeline> {
        Arc::clone(&self.pipeline.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Snapshot> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for DevSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pipeline = self.pipeline();
        f.debug_struct("DevSession")
            .field("root", &pipeline.ctx.root())
            .field("config", &self.config_path)
            .field("entries", &pipeline.entries)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::plugin::{Hooks, Plugin};
    use std::fs;
    use tempfile::{tempdir, TempDir};

    fn project() -> TempDir {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(
            dir.path().join("src/main.js"),
            "import { msg } from './msg';\nimport('./lazy').then(m => m.run());\nconsole.log(msg);\n",
        )
        .unwrap();
        fs::write(dir.path().join("src/msg.js"), "export const msg = 'hi';\n").unwrap();
        fs::write(dir.path().join("src/lazy.js"), "export function run() {}\n").unwrap();
        dir
    }

    fn session(root: &Path) -> DevSession {
        DevSession::new(PipelineContext::new(root, PipelineConfig::default()).unwrap()).unwrap()
    }

    #[test]
    fn test_initial_build_served_from_memory() {
        let dir = project();
        let session = session(dir.path());

        let html = session.artifact("/").unwrap();
        let html = String::from_utf8(html.bytes).unwrap();
        assert!(html.contains("<script src=\"/__sluice/hmr.js\"></script>"));
        assert!(session.chunk_source("main", "js").is_some());
        assert!(session.chunk_source("lazy", "js").is_some());
        assert!(session.chunk_source("main", "css").is_none());
        assert!(!dir.path().join("dist").exists());
    }

    #[test]
    fn test_leaf_change_updates_only_its_chunk() {
        let dir = project();
        let session = session(dir.path());
        let before = session.chunk_hashes();

        let msg_path = dir.path().join("src/msg.js");
        fs::write(&msg_path, "export const msg = 'hello';\n").unwrap();
        let message = session.file_changed(&[msg_path.clone()]).unwrap();

        let main = session.module_id(&dir.path().join("src/main.js")).unwrap();
        let msg = session.module_id(&msg_path).unwrap();
        let HmrMessage::Update {
            changed_module_ids,
            chunk_hashes,
        } = message
        else {
            panic!("expected an update, got {message:?}");
        };
        assert_eq!(changed_module_ids, vec![main.min(msg), main.max(msg)]);
        assert_eq!(chunk_hashes.keys().collect::<Vec<_>>(), vec!["main"]);
        assert_ne!(chunk_hashes["main"], before["main"]);
        assert_eq!(session.chunk_hashes()["lazy"], before["lazy"]);
    }

    #[test]
    fn test_untouched_content_sends_nothing() {
        let dir = project();
        let session = session(dir.path());
        let msg_path = dir.path().join("src/msg.js");
        assert!(session.file_changed(&[msg_path]).is_none());
        assert!(session.file_changed(&[dir.path().join("README.md")]).is_none());
        assert_eq!(session.generation(), 2);
    }

    #[test]
    fn test_error_then_recovery() {
        let dir = project();
        let session = session(dir.path());
        let msg_path = dir.path().join("src/msg.js");

        fs::write(&msg_path, "import './gone';\nexport const msg = 1;\n").unwrap();
        let message = session.file_changed(&[msg_path.clone()]).unwrap();
        assert!(
            matches!(&message, HmrMessage::Error { file: Some(file), .. } if file == "src/msg.js"),
            "{message:?}"
        );

        fs::write(&msg_path, "export const msg = 2;\n").unwrap();
        let message = session.file_changed(&[msg_path]).unwrap();
        assert!(matches!(message, HmrMessage::Update { .. }), "{message:?}");
    }

    #[test]
    fn test_superseded_rebuild_is_discarded() {
        let dir = project();
        let session = session(dir.path());
        let msg_path = dir.path().join("src/msg.js");
        let lazy_path = dir.path().join("src/lazy.js");

        fs::write(&msg_path, "export const msg = 'a';\n").unwrap();
        let first = session.begin(&[msg_path]);
        fs::write(&lazy_path, "export function run() { return 1; }\n").unwrap();
        let second = session.begin(&[lazy_path]);

        assert!(session.rebuild(first).is_none());
        let Some(HmrMessage::Update { chunk_hashes, .. }) = session.rebuild(second) else {
            panic!("expected an update");
        };
        assert_eq!(chunk_hashes.keys().collect::<Vec<_>>(), vec!["lazy", "main"]);
    }

    #[test]
    fn test_config_edit_reloads_session() {
        let dir = project();
        let session = session(dir.path());
        let config_path = dir.path().join(CONFIG_FILE_NAME);

        fs::write(&config_path, r#"{ "banner": "/*! v2 */" }"#).unwrap();
        let message = session.file_changed(&[config_path.clone()]).unwrap();
        assert!(matches!(message, HmrMessage::Reload), "{message:?}");
        assert_eq!(session.context().config().banner.as_deref(), Some("/*! v2 */"));
        let main = String::from_utf8(session.chunk_source("main", "js").unwrap()).unwrap();
        assert!(main.starts_with("/*! v2 */\n"), "{main}");

        // A broken file keeps the last good build
        fs::write(&config_path, "{ nope").unwrap();
        let message = session.file_changed(&[config_path]).unwrap();
        assert!(
            matches!(&message, HmrMessage::Error { file: Some(file), .. } if file == CONFIG_FILE_NAME),
            "{message:?}"
        );
        assert_eq!(session.context().config().banner.as_deref(), Some("/*! v2 */"));

        let msg_path = dir.path().join("src/msg.js");
        fs::write(&msg_path, "export const msg = 'after';\n").unwrap();
        let message = session.file_changed(&[msg_path]).unwrap();
        assert!(matches!(message, HmrMessage::Update { .. }), "{message:?}");
    }

    #[test]
    fn test_config_reload_uses_custom_loader() {
        let dir = project();
        let config_path = dir.path().join("conf/dev.json");
        fs::create_dir_all(config_path.parent().unwrap()).unwrap();
        fs::write(&config_path, "{}").unwrap();

        let root = dir.path().to_path_buf();
        let explicit = config_path.clone();
        let session = session(dir.path()).with_config_reload(
            &config_path,
            Box::new(move || {
                let config = PipelineConfig::load(&root, Some(&explicit))?.with_port(4000);
                PipelineContext::new(&root, config)
            }),
        );

        // The root file is no longer followed
        let root_file = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&root_file, r#"{ "banner": "/*! ignored */" }"#).unwrap();
        assert!(session.file_changed(&[root_file]).is_none());

        fs::write(&config_path, r#"{ "entry": { "app": "src/msg.js" } }"#).unwrap();
        let message = session.file_changed(&[config_path]).unwrap();
        assert!(matches!(message, HmrMessage::Reload), "{message:?}");
        assert_eq!(session.context().config().dev_server.port, 4000);
        assert!(session.chunk_source("app", "js").is_some());
        assert!(session.chunk_source("main", "js").is_none());
    }

    struct OnlyEntries;

    impl Plugin for OnlyEntries {
        fn name(&self) -> &str {
            "only-entries"
        }

        fn apply(&self, hooks: &mut Hooks) {
            hooks.hot_update.tap(self.name(), |update| {
                update.changed.retain(|&id| id == 0);
                update.changed.push(999);
                Ok(())
            });
        }
    }

    #[test]
    fn test_hot_update_hook_can_only_narrow() {
        let dir = project();
        let mut ctx = PipelineContext::new(dir.path(), PipelineConfig::default()).unwrap();
        ctx.register(&OnlyEntries);
        let session = DevSession::new(ctx).unwrap();

        let msg_path = dir.path().join("src/msg.js");
        fs::write(&msg_path, "export const msg = 'x';\n").unwrap();
        let Some(HmrMessage::Update { changed_module_ids, .. }) = session.file_changed(&[msg_path]) else {
            panic!("expected an update");
        };
        let main = session.module_id(&dir.path().join("src/main.js")).unwrap();
        assert_eq!(changed_module_ids, vec![main]);
    }
}
