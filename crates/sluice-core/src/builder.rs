//! Module graph construction.
//!
//! Level-synchronous breadth-first build: every module of the current
//! frontier is loaded and transformed in parallel on the context's pool,
//! then a single writer merges the results into the graph in frontier
//! order, resolving dependencies and reserving ids for new files. The
//! resulting ids and edges only depend on the sources, never on timing.

use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::graph::{Dependency, DependencyTarget, EmittedAsset, ModuleGraph, ModuleId, ModuleState};
use crate::plugin::{BeforeResolve, ModuleBuilt};
use crate::resolve::{Resolution, ResolveError};
use crate::rules::{AssetDisposition, AssetPolicy};
use crate::scan::scan;
use crate::template::{self, TemplateVars};
use crate::transform::{Auxiliary, ContentKind, TransformError};
use base64::Engine;
use rayon::prelude::*;
use sluice_util::hash::blake3_bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Path prefix of virtual modules registered by plugins.
pub const VIRTUAL_PREFIX: &str = "\0virtual:";

/// Name template for assets no rule gives a policy to.
const DEFAULT_ASSET_NAME: &str = "[name].[hash:8].[ext]";

/// How failures are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildMode {
    /// Abort on the first resolution or transform failure (one-shot builds).
    #[default]
    Strict,
    /// Record failures on the module and keep building (watch mode).
    Tolerant,
}

/// A dependency cycle found after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleWarning {
    /// Root-relative paths of the modules in the cycle, sorted by id.
    pub modules: Vec<String>,
}

impl fmt::Display for CycleWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "circular dependency: {}", self.modules.join(" -> "))?;
        if let Some(first) = self.modules.first() {
            write!(f, " -> {first}")?;
        }
        Ok(())
    }
}

/// A module after loading and transforming, before linking.
struct Loaded {
    kind: ContentKind,
    content: String,
    auxiliary: Vec<Auxiliary>,
    asset: Option<EmittedAsset>,
}

struct Job {
    id: ModuleId,
    path: PathBuf,
    rel_path: String,
}

/// Builds and incrementally rebuilds a [`ModuleGraph`].
pub struct GraphBuilder<'a> {
    ctx: &'a PipelineContext,
    mode: BuildMode,
    virtual_modules: BTreeMap<String, String>,
}

impl<'a> GraphBuilder<'a> {
    #[must_use]
    pub fn new(ctx: &'a PipelineContext, mode: BuildMode) -> Self {
        Self {
            ctx,
            mode,
            virtual_modules: BTreeMap::new(),
        }
    }

    /// Modules importable by their exact specifier, with the given source.
    #[must_use]
    pub fn with_virtual_modules(mut self, modules: BTreeMap<String, String>) -> Self {
        self.virtual_modules = modules;
        self
    }

    #[must_use]
    pub fn mode(&self) -> BuildMode {
        self.mode
    }

    /// Build the graph reachable from `entries` (name to root-relative path).
    pub fn build(&self, entries: &BTreeMap<String, String>) -> Result<ModuleGraph, PipelineError> {
        let mut graph = ModuleGraph::new();
        let mut frontier = Vec::new();

        for (name, spec) in entries {
            let (path, rel_path) = if self.virtual_modules.contains_key(spec) {
                (virtual_path(spec), format!("virtual:{spec}"))
            } else {
                let joined = self.ctx.root().join(spec);
                let path = dunce::canonicalize(&joined).map_err(|_| PipelineError::EntryNotFound {
                    name: name.clone(),
                    path: joined.clone(),
                })?;
                if !path.is_file() {
                    return Err(PipelineError::EntryNotFound {
                        name: name.clone(),
                        path: joined,
                    });
                }
                let rel = self.ctx.rel_path(&path);
                (path, rel)
            };
            let (id, new) = graph.reserve(&path, &rel_path);
            graph.set_entry(name, id);
            if new {
                frontier.push(id);
            }
        }

        self.process(&mut graph, frontier)?;
        graph.prune();
        self.report_cycles(&graph);
        info!(modules = graph.len(), failures = graph.failures().len(), "module graph built");
        Ok(graph)
    }

    /// Re-run `changed` files (and any module that failed before), recursing
    /// only into newly referenced files, then prune. Returns the affected
    /// set: rebuilt modules plus all their transitive importers.
    pub fn rebuild(
        &self,
        graph: &mut ModuleGraph,
        changed: &[PathBuf],
    ) -> Result<BTreeSet<ModuleId>, PipelineError> {
        self.ctx.resolver().clear_cache();

        let mut ids: BTreeSet<ModuleId> = changed
            .iter()
            .filter_map(|p| {
                let canonical = dunce::canonicalize(p).unwrap_or_else(|_| p.clone());
                graph.id_of(&canonical).or_else(|| graph.id_of(p))
            })
            .collect();
        ids.extend(graph.failures().into_iter().map(|(id, _)| id));

        let frontier: Vec<ModuleId> = ids.iter().copied().collect();
        for &id in &frontier {
            if let Some(module) = graph.get_mut(id) {
                module.state = ModuleState::Pending;
            }
        }

        self.process(graph, frontier.clone())?;
        let removed = graph.prune();
        let affected = graph.affected_by(&frontier);
        self.report_cycles(graph);
        info!(
            rebuilt = frontier.len(),
            affected = affected.len(),
            removed = removed.len(),
            "module graph updated"
        );
        Ok(affected)
    }

    /// Cycles in `graph` as warnings.
    #[must_use]
    pub fn cycle_warnings(graph: &ModuleGraph) -> Vec<CycleWarning> {
        graph
            .cycles()
            .into_iter()
            .map(|ids| CycleWarning {
                modules: ids
                    .iter()
                    .filter_map(|&id| graph.get(id))
                    .map(|m| m.rel_path.clone())
                    .collect(),
            })
            .collect()
    }

    fn report_cycles(&self, graph: &ModuleGraph) {
        for warning in Self::cycle_warnings(graph) {
            warn!("{warning}");
        }
    }

    fn process(&self, graph: &mut ModuleGraph, mut frontier: Vec<ModuleId>) -> Result<(), PipelineError> {
        while !frontier.is_empty() {
            let jobs: Vec<Job> = frontier
                .iter()
                .filter_map(|&id| graph.get(id))
                .map(|m| Job {
                    id: m.id,
                    path: m.path.clone(),
                    rel_path: m.rel_path.clone(),
                })
                .collect();

            let loaded: Vec<(ModuleId, Result<Loaded, PipelineError>)> = self
                .ctx
                .pool()
                .install(|| jobs.par_iter().map(|job| (job.id, self.load(job))).collect());

            let mut next = Vec::new();
            for (id, result) in loaded {
                let linked = result.and_then(|loaded| self.link(graph, id, loaded, &mut next));
                if let Err(err) = linked {
                    match self.mode {
                        BuildMode::Strict => return Err(err),
                        BuildMode::Tolerant => {
                            warn!(module = id, error = %err, "module failed");
                            if let Some(module) = graph.get_mut(id) {
                                module.state = ModuleState::Failed(err.to_string());
                                module.dependencies.clear();
                            }
                        }
                    }
                }
            }
            frontier = next;
        }
        Ok(())
    }

    /// Read and transform one module. Runs on the pool.
    fn load(&self, job: &Job) -> Result<Loaded, PipelineError> {
        let rule_path = job.rel_path.as_str();
        let chain = self.ctx.matcher().chain_for(rule_path);

        let (bytes, kind) = match virtual_name(&job.path) {
            Some(name) => {
                let source = self.virtual_modules.get(&name).cloned().unwrap_or_default();
                (source.into_bytes(), ContentKind::Script)
            }
            None => {
                let bytes = std::fs::read(&job.path).map_err(|source| PipelineError::Read {
                    path: job.path.clone(),
                    source,
                })?;
                (bytes, ContentKind::from_path(&job.path))
            }
        };

        if kind == ContentKind::Asset && chain.is_empty() {
            return Ok(self.load_asset(job, bytes));
        }

        let content = String::from_utf8(bytes).map_err(|_| TransformError {
            path: job.path.clone(),
            index: 0,
            transform: chain.steps().first().map_or_else(|| "read".to_string(), |s| s.transform.clone()),
            message: "content is not valid UTF-8".to_string(),
        })?;

        let output = self
            .ctx
            .executor()
            .run(&job.path, &job.rel_path, &content, kind, &chain)?;

        if output.kind == ContentKind::Asset {
            return Ok(self.load_asset(job, output.content.into_bytes()));
        }

        debug!(path = %job.rel_path, kind = output.kind.as_str(), "loaded module");
        Ok(Loaded {
            kind: output.kind,
            content: output.content,
            auxiliary: output.auxiliary,
            asset: None,
        })
    }

    /// Inline as a data URI or emit under the policy's name template.
    fn load_asset(&self, job: &Job, bytes: Vec<u8>) -> Loaded {
        let fallback = AssetPolicy::emit_only(DEFAULT_ASSET_NAME);
        let policy = self.ctx.matcher().asset_policy(&job.rel_path).unwrap_or(&fallback);
        let ext = job
            .path
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();

        match policy.disposition(bytes.len() as u64) {
            AssetDisposition::Inline => {
                let encoded = base64::prelude::BASE64_STANDARD.encode(&bytes);
                Loaded {
                    kind: ContentKind::Asset,
                    content: format!("data:{};base64,{encoded}", mime_for(&ext)),
                    auxiliary: Vec::new(),
                    asset: None,
                }
            }
            AssetDisposition::Emit => {
                let hash = blake3_bytes(&bytes);
                let stem = job
                    .path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                let file = template::render(
                    &policy.name,
                    &TemplateVars {
                        name: &stem,
                        id: "",
                        ext: &ext,
                        hash: &hash,
                        content_hash: &hash,
                    },
                );
                let url = template::public_url(&self.ctx.config().output.public_path, &file);
                debug!(path = %job.rel_path, file = %file, "emitting asset");
                Loaded {
                    kind: ContentKind::Asset,
                    content: url,
                    auxiliary: Vec::new(),
                    asset: Some(EmittedAsset { file, bytes }),
                }
            }
        }
    }

    /// Merge a loaded module into the graph. Single writer.
    fn link(
        &self,
        graph: &mut ModuleGraph,
        id: ModuleId,
        loaded: Loaded,
        next: &mut Vec<ModuleId>,
    ) -> Result<(), PipelineError> {
        let path = graph.get(id).map(|m| m.path.clone()).unwrap_or_default();

        let mut built = ModuleBuilt::new(&path, loaded.kind, loaded.content);
        self.ctx.hooks().after_module_build.call(&mut built)?;
        let content = built.content;

        let mut dependencies = Vec::new();
        let mut new_ids = Vec::new();
        for import in scan(&content, loaded.kind) {
            let mut request = BeforeResolve::new(import.request.clone(), &path);
            self.ctx.hooks().before_resolve.call(&mut request)?;

            let target = if let Some(global) = request.external() {
                DependencyTarget::External {
                    name: request.specifier.clone(),
                    global: global.to_string(),
                }
            } else if self.virtual_modules.contains_key(&request.specifier) {
                let (dep, new) = graph.reserve(
                    &virtual_path(&request.specifier),
                    &format!("virtual:{}", request.specifier),
                );
                if new {
                    new_ids.push(dep);
                }
                DependencyTarget::Module(dep)
            } else {
                match self.resolve(&request.specifier, &path)? {
                    Resolution::File { path: dep_path, query } => {
                        let mut rel = self.ctx.rel_path(&dep_path);
                        if let Some(query) = query {
                            rel.push('?');
                            rel.push_str(&query);
                        }
                        let (dep, new) = graph.reserve(&dep_path, &rel);
                        if new {
                            new_ids.push(dep);
                        }
                        DependencyTarget::Module(dep)
                    }
                    Resolution::External { name, global } => DependencyTarget::External { name, global },
                }
            };

            dependencies.push(Dependency {
                specifier: import.specifier,
                target,
                dynamic: import.dynamic,
            });
        }

        if let Some(module) = graph.get_mut(id) {
            module.kind = loaded.kind;
            module.hash = blake3_bytes(content.as_bytes());
            module.content = content;
            module.dependencies = dependencies;
            module.auxiliary = loaded.auxiliary;
            module.asset = loaded.asset;
            module.state = ModuleState::Built;
        }
        next.extend(new_ids);
        Ok(())
    }

    fn resolve(&self, specifier: &str, importer: &Path) -> Result<Resolution, ResolveError> {
        if virtual_name(importer).is_some() {
            // Virtual modules resolve relative imports from the root
            return self.ctx.resolver().resolve(specifier, &self.ctx.root().join("index"));
        }
        self.ctx.resolver().resolve(specifier, importer)
    }
}

fn virtual_path(name: &str) -> PathBuf {
    PathBuf::from(format!("{VIRTUAL_PREFIX}{name}"))
}

fn virtual_name(path: &Path) -> Option<String> {
    path.to_str()
        .and_then(|p| p.strip_prefix(VIRTUAL_PREFIX))
        .map(str::to_string)
}

/// MIME type for a data URI, by file extension.
pub(crate) fn mime_for(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "eot" => "application/vnd.ms-fontobject",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "ogg" => "audio/ogg",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "aac" => "audio/aac",
        _ => "application/octet-stream",
    }
}
