//! Plugin hook runtime.
//!
//! A plugin registers callbacks ("taps") on named hooks. Each hook hands its
//! callbacks a capability object that owns only the data that hook may touch,
//! so a plugin cannot reach pipeline state outside the hook window.
//!
//! ## Example
//!
//! ```ignore
//! use sluice_core::plugin::{Hooks, Plugin};
//!
//! struct Footer;
//!
//! impl Plugin for Footer {
//!     fn name(&self) -> &str { "footer" }
//!
//!     fn apply(&self, hooks: &mut Hooks) {
//!         hooks.before_chunk_emit.tap(self.name(), |chunk| {
//!             chunk.content.push_str("\n// built by sluice\n");
//!             Ok(())
//!         });
//!     }
//! }
//! ```

#![allow(clippy::type_complexity)]

mod builtin;

pub use builtin::{BannerPlugin, CleanPlugin, CopyPlugin, HtmlPlugin};

use crate::chunks::ChunkKind;
use crate::emit::Artifact;
use crate::graph::ModuleId;
use crate::pipeline::BuildSummary;
use crate::transform::ContentKind;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type for plugin hooks.
pub type HookResult<T> = Result<T, PluginError>;

/// Error from a plugin callback.
#[derive(Error, Debug, Clone)]
#[error("[{plugin}] {hook}: {message}")]
pub struct PluginError {
    /// Plugin name that caused the error.
    pub plugin: String,
    /// Hook that failed.
    pub hook: &'static str,
    pub message: String,
}

type SyncCallback<C> = Box<dyn Fn(&mut C) -> Result<(), String> + Send + Sync>;
type AsyncCallback<C> =
    Box<dyn for<'a> Fn(&'a mut C) -> BoxFuture<'a, Result<(), String>> + Send + Sync>;

enum Callback<C> {
    Sync(SyncCallback<C>),
    Async(AsyncCallback<C>),
}

struct Tap<C> {
    plugin: String,
    callback: Callback<C>,
}

/// A named hook point holding callbacks in registration order.
pub struct Hook<C> {
    name: &'static str,
    taps: Vec<Tap<C>>,
}

impl<C: Send> Hook<C> {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            taps: Vec::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register a synchronous callback.
    pub fn tap<F>(&mut self, plugin: &str, f: F)
    where
        F: Fn(&mut C) -> Result<(), String> + Send + Sync + 'static,
    {
        self.taps.push(Tap {
            plugin: plugin.to_string(),
            callback: Callback::Sync(Box::new(f)),
        });
    }

    /// Register a callback returning a future. It completes before the next
    /// callback runs.
    pub fn tap_async<F>(&mut self, plugin: &str, f: F)
    where
        F: for<'a> Fn(&'a mut C) -> BoxFuture<'a, Result<(), String>> + Send + Sync + 'static,
    {
        self.taps.push(Tap {
            plugin: plugin.to_string(),
            callback: Callback::Async(Box::new(f)),
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.taps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.taps.is_empty()
    }

    /// Run every callback in order, stopping at the first failure.
    pub async fn dispatch(&self, ctx: &mut C) -> HookResult<()> {
        for tap in &self.taps {
            let result = match &tap.callback {
                Callback::Sync(f) => f(ctx),
                Callback::Async(f) => f(ctx).await,
            };
            result.map_err(|message| PluginError {
                plugin: tap.plugin.clone(),
                hook: self.name,
                message,
            })?;
        }
        Ok(())
    }

    /// Blocking dispatch: drives async callbacks on the calling thread.
    pub fn call(&self, ctx: &mut C) -> HookResult<()> {
        if self.taps.is_empty() {
            return Ok(());
        }
        futures::executor::block_on(self.dispatch(ctx))
    }
}

impl<C> std::fmt::Debug for Hook<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let plugins: Vec<&str> = self.taps.iter().map(|t| t.plugin.as_str()).collect();
        f.debug_struct("Hook")
            .field("name", &self.name)
            .field("plugins", &plugins)
            .finish()
    }
}

/// Capability for `pipeline_start`: entries and virtual modules.
#[derive(Debug, Clone, Default)]
pub struct PipelineStart {
    /// Entry name to root-relative path.
    pub entries: BTreeMap<String, String>,
    /// Virtual module specifier to source. Importable by its exact specifier.
    pub virtual_modules: BTreeMap<String, String>,
}

/// Capability for `before_resolve`: rewrite a specifier or mark it external.
#[derive(Debug, Clone)]
pub struct BeforeResolve {
    pub specifier: String,
    importer: PathBuf,
    external: Option<String>,
}

impl BeforeResolve {
    #[must_use]
    pub fn new(specifier: impl Into<String>, importer: &Path) -> Self {
        Self {
            specifier: specifier.into(),
            importer: importer.to_path_buf(),
            external: None,
        }
    }

    #[must_use]
    pub fn importer(&self) -> &Path {
        &self.importer
    }

    /// Treat the specifier as provided by `global` at runtime.
    pub fn mark_external(&mut self, global: impl Into<String>) {
        self.external = Some(global.into());
    }

    #[must_use]
    pub fn external(&self) -> Option<&str> {
        self.external.as_deref()
    }
}

/// Capability for `after_module_build`: one module's transformed content.
#[derive(Debug, Clone)]
pub struct ModuleBuilt {
    path: PathBuf,
    kind: ContentKind,
    pub content: String,
}

impl ModuleBuilt {
    #[must_use]
    pub fn new(path: &Path, kind: ContentKind, content: String) -> Self {
        Self {
            path: path.to_path_buf(),
            kind,
            content,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn kind(&self) -> ContentKind {
        self.kind
    }
}

/// Capability for `before_chunk_emit`: rendered chunk content and filename template.
#[derive(Debug, Clone)]
pub struct BeforeChunkEmit {
    name: String,
    kind: ChunkKind,
    pub content: String,
    pub filename_template: String,
}

impl BeforeChunkEmit {
    #[must_use]
    pub fn new(name: &str, kind: ChunkKind, content: String, filename_template: String) -> Self {
        Self {
            name: name.to_string(),
            kind,
            content,
            filename_template,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> ChunkKind {
        self.kind
    }
}

/// Capability for `after_emit`: read-only artifacts, plus extra files to add.
#[derive(Debug, Clone, Default)]
pub struct AfterEmit {
    artifacts: Vec<Artifact>,
    output_dir: Option<PathBuf>,
    added: Vec<(String, Vec<u8>)>,
}

impl AfterEmit {
    #[must_use]
    pub fn new(artifacts: Vec<Artifact>, output_dir: Option<PathBuf>) -> Self {
        Self {
            artifacts,
            output_dir,
            added: Vec::new(),
        }
    }

    #[must_use]
    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    /// Output directory, `None` for in-memory builds.
    #[must_use]
    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    /// Add a file (path relative to the output directory).
    pub fn add_file(&mut self, path: impl Into<String>, bytes: Vec<u8>) {
        self.added.push((path.into(), bytes));
    }

    /// Split back into the artifacts and the files added by plugins.
    #[must_use]
    pub fn into_parts(self) -> (Vec<Artifact>, Vec<(String, Vec<u8>)>) {
        (self.artifacts, self.added)
    }
}

/// Capability for `pipeline_complete`: the run's summary.
#[derive(Debug, Clone)]
pub struct PipelineComplete {
    summary: BuildSummary,
    output_dir: Option<PathBuf>,
}

impl PipelineComplete {
    #[must_use]
    pub fn new(summary: BuildSummary, output_dir: Option<PathBuf>) -> Self {
        Self {
            summary,
            output_dir,
        }
    }

    #[must_use]
    pub fn summary(&self) -> &BuildSummary {
        &self.summary
    }

    #[must_use]
    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    #[must_use]
    pub fn into_summary(self) -> BuildSummary {
        self.summary
    }
}

/// Capability for `hot_update`: the changed module ids. Plugins may narrow
/// the set; ids not in the original set are ignored.
#[derive(Debug, Clone, Default)]
pub struct HotUpdate {
    pub changed: Vec<ModuleId>,
}

/// All hook points of one pipeline.
#[derive(Debug)]
pub struct Hooks {
    pub pipeline_start: Hook<PipelineStart>,
    pub before_resolve: Hook<BeforeResolve>,
    pub after_module_build: Hook<ModuleBuilt>,
    pub before_chunk_emit: Hook<BeforeChunkEmit>,
    pub after_emit: Hook<AfterEmit>,
    pub pipeline_complete: Hook<PipelineComplete>,
    pub hot_update: Hook<HotUpdate>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            pipeline_start: Hook::new("pipeline_start"),
            before_resolve: Hook::new("before_resolve"),
            after_module_build: Hook::new("after_module_build"),
            before_chunk_emit: Hook::new("before_chunk_emit"),
            after_emit: Hook::new("after_emit"),
            pipeline_complete: Hook::new("pipeline_complete"),
            hot_update: Hook::new("hot_update"),
        }
    }
}

impl Hooks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// A plugin registers callbacks on [`Hooks`].
///
/// Plugins hold no pipeline state of their own; anything a callback needs
/// is captured when it is registered.
pub trait Plugin: Send + Sync {
    /// Plugin name for debugging and error messages.
    fn name(&self) -> &str;

    /// Register callbacks.
    fn apply(&self, hooks: &mut Hooks);
}
