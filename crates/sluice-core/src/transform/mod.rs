//! Transform chain execution.
//!
//! A module's content is piped through the transforms its matching rules
//! name, in order. The first failing step stops the chain and is reported
//! with its position. Outputs are cached by content, path and chain.

mod builtin;
mod css;
mod sfc;

pub use builtin::{CommandTransform, DefineTransform, JsonTransform, TextTransform};
pub use css::{injection_script, minify_css, CssTransform, StyleInjectTransform};
pub use sfc::SfcTransform;

use crate::rules::TransformChain;
use rustc_hash::FxHashMap as HashMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::debug;

/// Broad category of a module's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// Executable module code.
    Script,
    /// A stylesheet, extracted or injected at emit time.
    Style,
    /// Opaque bytes referenced by URL or inlined as a data URI.
    Asset,
}

impl ContentKind {
    /// Initial kind of a file, from its extension.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "js" | "mjs" | "cjs" | "jsx" | "ts" | "tsx" | "vue" | "json" => Self::Script,
            "css" | "less" | "scss" | "sass" | "styl" => Self::Style,
            _ => Self::Asset,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Style => "style",
            Self::Asset => "asset",
        }
    }

    /// Parse the names used in transform options.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "script" => Some(Self::Script),
            "style" => Some(Self::Style),
            "asset" => Some(Self::Asset),
            _ => None,
        }
    }
}

/// A secondary file produced while transforming a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auxiliary {
    /// File name hint (no directory).
    pub name: String,
    pub kind: ContentKind,
    pub content: String,
}

/// Per-invocation context handed to a transform.
#[derive(Debug)]
pub struct SourceContext<'a> {
    path: &'a Path,
    rel_path: &'a str,
    auxiliary: Vec<Auxiliary>,
}

impl<'a> SourceContext<'a> {
    #[must_use]
    pub fn new(path: &'a Path, rel_path: &'a str) -> Self {
        Self {
            path,
            rel_path,
            auxiliary: Vec::new(),
        }
    }

    /// Absolute path of the module being transformed.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.path
    }

    /// Root-relative path with forward slashes.
    #[must_use]
    pub fn rel_path(&self) -> &str {
        self.rel_path
    }

    /// Record an auxiliary file. It is attached to the module, not returned inline.
    pub fn emit_auxiliary(&mut self, name: impl Into<String>, kind: ContentKind, content: String) {
        self.auxiliary.push(Auxiliary {
            name: name.into(),
            kind,
            content,
        });
    }

    fn into_auxiliary(self) -> Vec<Auxiliary> {
        self.auxiliary
    }
}

/// A content transform.
///
/// Implementations must be pure with respect to `content` and `options`:
/// equal inputs produce equal outputs, which is what makes caching sound.
pub trait Transform: Send + Sync {
    /// Identifier used in rule `use` lists.
    fn id(&self) -> &str;

    /// Kind of the output given the input kind.
    fn output_kind(&self, input: ContentKind, _options: &serde_json::Value) -> ContentKind {
        input
    }

    /// Transform `content`. The error string becomes the chain failure message.
    fn apply(
        &self,
        content: &str,
        options: &serde_json::Value,
        ctx: &mut SourceContext<'_>,
    ) -> Result<String, String>;
}

/// Result of running a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOutput {
    pub content: String,
    pub kind: ContentKind,
    pub auxiliary: Vec<Auxiliary>,
}

/// A chain step failed.
#[derive(Error, Debug, Clone)]
#[error("Transform '{transform}' (step {index}) failed for {}: {message}", .path.display())]
pub struct TransformError {
    pub path: PathBuf,
    /// Zero-based position of the failing step in the chain.
    pub index: usize,
    pub transform: String,
    pub message: String,
}

/// Identifier to transform lookup.
#[derive(Clone, Default)]
pub struct TransformRegistry {
    transforms: HashMap<String, Arc<dyn Transform>>,
}

impl std::fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<&String> = self.transforms.keys().collect();
        ids.sort();
        f.debug_struct("TransformRegistry").field("ids", &ids).finish()
    }
}

impl TransformRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in transform.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(JsonTransform));
        registry.register(Arc::new(TextTransform));
        registry.register(Arc::new(CssTransform));
        registry.register(Arc::new(StyleInjectTransform));
        registry.register(Arc::new(SfcTransform));
        registry.register(Arc::new(DefineTransform));
        registry.register(Arc::new(CommandTransform));
        registry
    }

    /// Register a transform, replacing any with the same id.
    pub fn register(&mut self, transform: Arc<dyn Transform>) {
        self.transforms.insert(transform.id().to_string(), transform);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<dyn Transform>> {
        self.transforms.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.transforms.contains_key(id)
    }
}

/// In-memory transform output cache.
///
/// Holds at most one output per module path and chain: storing a new
/// output evicts the previous one for the same slot.
#[derive(Debug, Default)]
pub struct TransformCache {
    state: RwLock<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, TransformOutput>,
    /// Slot (path, kind, chain) to the key stored for it.
    slots: HashMap<String, String>,
}

impl TransformCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache key for one chain invocation.
    #[must_use]
    pub fn key(rel_path: &str, content: &str, kind: ContentKind, chain: &TransformChain) -> String {
        let identity = chain.identity();
        sluice_util::hash::blake3_parts([
            rel_path.as_bytes(),
            kind.as_str().as_bytes(),
            identity.as_bytes(),
            content.as_bytes(),
        ])
    }

    /// Slot for one module and chain, whatever the content.
    #[must_use]
    pub fn slot(rel_path: &str, kind: ContentKind, chain: &TransformChain) -> String {
        let identity = chain.identity();
        sluice_util::hash::blake3_parts([
            rel_path.as_bytes(),
            kind.as_str().as_bytes(),
            identity.as_bytes(),
        ])
    }

    fn get(&self, key: &str) -> Option<TransformOutput> {
        let found = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(key)
            .cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    fn insert(&self, slot: String, key: String, output: TransformOutput) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = state.slots.insert(slot, key.clone()) {
            if previous != key {
                state.entries.remove(&previous);
            }
        }
        state.entries.insert(key, output);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.entries.clear();
        state.slots.clear();
    }
}

/// Runs transform chains against a registry, with optional caching.
#[derive(Debug)]
pub struct TransformExecutor {
    registry: TransformRegistry,
    cache: Option<TransformCache>,
    force: bool,
}

impl TransformExecutor {
    #[must_use]
    pub fn new(registry: TransformRegistry) -> Self {
        Self {
            registry,
            cache: None,
            force: false,
        }
    }

    /// Enable the output cache.
    #[must_use]
    pub fn with_cache(mut self) -> Self {
        self.cache = Some(TransformCache::new());
        self
    }

    /// Skip cache reads (results are still stored).
    #[must_use]
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn set_force(&mut self, force: bool) {
        self.force = force;
    }

    #[must_use]
    pub fn registry(&self) -> &TransformRegistry {
        &self.registry
    }

    /// Register additional transforms.
    pub fn registry_mut(&mut self) -> &mut TransformRegistry {
        &mut self.registry
    }

    #[must_use]
    pub fn cache(&self) -> Option<&TransformCache> {
        self.cache.as_ref()
    }

    /// Pipe `content` through `chain`.
    pub fn run(
        &self,
        path: &Path,
        rel_path: &str,
        content: &str,
        kind: ContentKind,
        chain: &TransformChain,
    ) -> Result<TransformOutput, TransformError> {
        if chain.is_empty() {
            return Ok(TransformOutput {
                content: content.to_string(),
                kind,
                auxiliary: Vec::new(),
            });
        }

        let keys = self
            .cache
            .as_ref()
            .map(|_| {
                (
                    TransformCache::key(rel_path, content, kind, chain),
                    TransformCache::slot(rel_path, kind, chain),
                )
            });

        if let (Some(cache), Some((key, _)), false) = (&self.cache, &keys, self.force) {
            if let Some(hit) = cache.get(key) {
                debug!(path = %rel_path, chain = %chain.describe(), "transform cache hit");
                return Ok(hit);
            }
        }

        let mut ctx = SourceContext::new(path, rel_path);
        let (content, kind) = chain.steps().iter().enumerate().try_fold(
            (content.to_string(), kind),
            |(current, kind), (index, step)| {
                let fail = |message: String| TransformError {
                    path: path.to_path_buf(),
                    index,
                    transform: step.transform.clone(),
                    message,
                };
                let transform = self
                    .registry
                    .get(&step.transform)
                    .ok_or_else(|| fail(format!("unknown transform '{}'", step.transform)))?;
                let next_kind = transform.output_kind(kind, &step.options);
                let out = transform
                    .apply(&current, &step.options, &mut ctx)
                    .map_err(fail)?;
                Ok::<_, TransformError>((out, next_kind))
            },
        )?;

        let output = TransformOutput {
            content,
            kind,
            auxiliary: ctx.into_auxiliary(),
        };
        debug!(path = %rel_path, chain = %chain.describe(), "transformed");

        if let (Some(cache), Some((key, slot))) = (&self.cache, keys) {
            cache.insert(slot, key, output.clone());
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::TransformStep;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;

    struct Upper;
    impl Transform for Upper {
        fn id(&self) -> &str {
            "upper"
        }
        fn apply(&self, content: &str, _: &Value, _: &mut SourceContext<'_>) -> Result<String, String> {
            Ok(content.to_uppercase())
        }
    }

    struct Fail;
    impl Transform for Fail {
        fn id(&self) -> &str {
            "fail"
        }
        fn apply(&self, _: &str, _: &Value, _: &mut SourceContext<'_>) -> Result<String, String> {
            Err("nope".to_string())
        }
    }

    struct Counting(Arc<AtomicUsize>);
    impl Transform for Counting {
        fn id(&self) -> &str {
            "counting"
        }
        fn apply(&self, content: &str, _: &Value, ctx: &mut SourceContext<'_>) -> Result<String, String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            ctx.emit_auxiliary("extra.css", ContentKind::Style, "a{}".into());
            Ok(format!("{content}!"))
        }
    }

    fn chain(ids: &[&str]) -> TransformChain {
        TransformChain::new(
            ids.iter()
                .map(|id| TransformStep {
                    transform: (*id).to_string(),
                    options: Value::Null,
                })
                .collect(),
        )
    }

    fn executor() -> TransformExecutor {
        let mut registry = TransformRegistry::with_builtins();
        registry.register(Arc::new(Upper));
        registry.register(Arc::new(Fail));
        TransformExecutor::new(registry)
    }

    #[test]
    fn test_content_kind_from_path() {
        assert_eq!(ContentKind::from_path(Path::new("a/b.js")), ContentKind::Script);
        assert_eq!(ContentKind::from_path(Path::new("App.vue")), ContentKind::Script);
        assert_eq!(ContentKind::from_path(Path::new("s.SCSS")), ContentKind::Style);
        assert_eq!(ContentKind::from_path(Path::new("logo.png")), ContentKind::Asset);
        assert_eq!(ContentKind::from_path(Path::new("LICENSE")), ContentKind::Asset);
    }

    #[test]
    fn test_empty_chain_is_identity() {
        let out = executor()
            .run(Path::new("/p/a.js"), "a.js", "x", ContentKind::Script, &chain(&[]))
            .unwrap();
        assert_eq!(out.content, "x");
        assert_eq!(out.kind, ContentKind::Script);
    }

    #[test]
    fn test_steps_apply_in_order_and_track_kind() {
        let out = executor()
            .run(
                Path::new("/p/a.css"),
                "a.css",
                "a { color: red }",
                ContentKind::Style,
                &chain(&["upper", "style-inject"]),
            )
            .unwrap();
        assert_eq!(out.kind, ContentKind::Script);
        assert!(out.content.contains("COLOR: RED"));
    }

    #[test]
    fn test_failure_reports_step_index() {
        let err = executor()
            .run(
                Path::new("/p/a.js"),
                "a.js",
                "x",
                ContentKind::Script,
                &chain(&["upper", "fail", "upper"]),
            )
            .unwrap_err();
        assert_eq!(err.index, 1);
        assert_eq!(err.transform, "fail");
        assert_eq!(err.message, "nope");
        assert_eq!(err.path, PathBuf::from("/p/a.js"));
    }

    #[test]
    fn test_unknown_transform_fails_at_its_index() {
        let err = executor()
            .run(
                Path::new("/p/a.js"),
                "a.js",
                "x",
                ContentKind::Script,
                &chain(&["upper", "missing"]),
            )
            .unwrap_err();
        assert_eq!(err.index, 1);
        assert!(err.message.contains("unknown transform"));
    }

    #[test]
    fn test_cache_returns_identical_output() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = TransformRegistry::new();
        registry.register(Arc::new(Counting(calls.clone())));
        let exec = TransformExecutor::new(registry).with_cache();
        let c = chain(&["counting"]);

        let first = exec
            .run(Path::new("/p/a.js"), "a.js", "x", ContentKind::Script, &c)
            .unwrap();
        let second = exec
            .run(Path::new("/p/a.js"), "a.js", "x", ContentKind::Script, &c)
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first.auxiliary.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(exec.cache().unwrap().hits(), 1);

        // Different content misses
        exec.run(Path::new("/p/a.js"), "a.js", "y", ContentKind::Script, &c)
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_force_bypasses_reads_but_writes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = TransformRegistry::new();
        registry.register(Arc::new(Counting(calls.clone())));
        let exec = TransformExecutor::new(registry).with_cache().with_force(true);
        let c = chain(&["counting"]);

        exec.run(Path::new("/p/a.js"), "a.js", "x", ContentKind::Script, &c)
            .unwrap();
        exec.run(Path::new("/p/a.js"), "a.js", "x", ContentKind::Script, &c)
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(exec.cache().unwrap().len(), 1);
    }

    #[test]
    fn test_cache_keeps_latest_output_per_module() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = TransformRegistry::new();
        registry.register(Arc::new(Counting(calls.clone())));
        let exec = TransformExecutor::new(registry).with_cache();
        let c = chain(&["counting"]);

        for content in ["v1", "v2", "v3", "v4"] {
            exec.run(Path::new("/p/a.js"), "a.js", content, ContentKind::Script, &c)
                .unwrap();
        }
        exec.run(Path::new("/p/b.js"), "b.js", "v1", ContentKind::Script, &c)
            .unwrap();
        assert_eq!(exec.cache().unwrap().len(), 2);

        // The newest content still hits; an evicted version runs again
        exec.run(Path::new("/p/a.js"), "a.js", "v4", ContentKind::Script, &c)
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        exec.run(Path::new("/p/a.js"), "a.js", "v1", ContentKind::Script, &c)
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_cache_key_depends_on_options() {
        let a = TransformChain::new(vec![TransformStep {
            transform: "define".into(),
            options: json!({"X": "1"}),
        }]);
        let b = TransformChain::new(vec![TransformStep {
            transform: "define".into(),
            options: json!({"X": "2"}),
        }]);
        assert_ne!(
            TransformCache::key("a.js", "X", ContentKind::Script, &a),
            TransformCache::key("a.js", "X", ContentKind::Script, &b)
        );
    }
}
