//! One-shot pipeline runs: graph, chunks, artifacts, output.
//!
//! ```ignore
//! let ctx = PipelineContext::new(root, PipelineConfig::load(root, None)?)?;
//! let output = run_build(&ctx, &BuildOptions::default())?;
//! println!("{} files", output.summary.files.len());
//! ```

use crate::builder::{BuildMode, GraphBuilder};
use crate::chunks::{ChunkKind, ChunkPartition};
use crate::context::PipelineContext;
use crate::emit::{
    collect_artifacts, render_chunks, write_artifacts, Artifact, ArtifactKind, ArtifactSet,
    EmitOptions, RenderedChunk,
};
use crate::error::PipelineError;
use crate::graph::ModuleGraph;
use crate::plugin::{AfterEmit, PipelineComplete, PipelineStart};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

/// Where artifacts go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputTarget {
    /// Write to the configured output directory.
    #[default]
    Disk,
    /// Keep artifacts in memory only (dev server, tests).
    Memory,
}

/// Options for [`run_build`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    pub mode: BuildMode,
    pub target: OutputTarget,
    /// Inject styles from script instead of extracting stylesheets.
    pub inject_styles: bool,
}

impl BuildOptions {
    #[must_use]
    pub fn with_mode(mut self, mode: BuildMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_target(mut self, target: OutputTarget) -> Self {
        self.target = target;
        self
    }

    #[must_use]
    pub fn with_inject_styles(mut self, inject: bool) -> Self {
        self.inject_styles = inject;
        self
    }
}

/// One chunk in a [`BuildSummary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkSummary {
    pub name: String,
    pub kind: ChunkKind,
    pub file: String,
    pub css: Option<String>,
    pub hash: String,
    pub modules: usize,
}

/// What a run produced. Serialized for `sluice build --json`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildSummary {
    pub chunks: Vec<ChunkSummary>,
    pub assets: Vec<String>,
    /// Every artifact path, relative to the output directory.
    pub files: Vec<String>,
    pub written: Vec<String>,
    pub unchanged: Vec<String>,
    /// Cycle warnings.
    pub warnings: Vec<String>,
    /// Modules that failed in tolerant mode, as `path: message`.
    pub errors: Vec<String>,
    pub module_count: usize,
    pub duration_ms: u64,
}

/// Result of [`emit_graph`].
#[derive(Debug)]
pub struct Emission {
    pub partition: ChunkPartition,
    pub chunks: Vec<RenderedChunk>,
    /// Emitted and plugin-added files, unique by path.
    pub artifacts: Vec<Artifact>,
}

/// Everything a run produced.
#[derive(Debug)]
pub struct BuildOutput {
    pub graph: ModuleGraph,
    pub partition: ChunkPartition,
    pub chunks: Vec<RenderedChunk>,
    pub artifacts: Vec<Artifact>,
    pub summary: BuildSummary,
}

/// Run the whole pipeline once.
pub fn run_build(ctx: &PipelineContext, options: &BuildOptions) -> Result<BuildOutput, PipelineError> {
    let start = Instant::now();

    let mut begin = PipelineStart {
        entries: ctx.config().entry.clone(),
        virtual_modules: BTreeMap::new(),
    };
    ctx.hooks().pipeline_start.call(&mut begin)?;

    let builder = GraphBuilder::new(ctx, options.mode).with_virtual_modules(begin.virtual_modules);
    let graph = builder.build(&begin.entries)?;

    let output_dir = match options.target {
        OutputTarget::Disk => Some(ctx.output_dir()),
        OutputTarget::Memory => None,
    };
    let emission = emit_graph(ctx, &graph, options.inject_styles, output_dir.clone())?;

    let mut summary = summarize(&graph, &emission);
    if let Some(dir) = &output_dir {
        let report = write_artifacts(dir, &emission.artifacts)?;
        summary.written = report.written;
        summary.unchanged = report.unchanged;
    }
    summary.duration_ms = start.elapsed().as_millis() as u64;

    let mut done = PipelineComplete::new(summary, output_dir);
    ctx.hooks().pipeline_complete.call(&mut done)?;
    let summary = done.into_summary();

    info!(
        chunks = summary.chunks.len(),
        files = summary.files.len(),
        modules = summary.module_count,
        duration_ms = summary.duration_ms,
        "build finished"
    );

    Ok(BuildOutput {
        graph,
        partition: emission.partition,
        chunks: emission.chunks,
        artifacts: emission.artifacts,
        summary,
    })
}

/// Partition, render and collect the artifacts of a built graph, then let
/// `after_emit` plugins add files.
pub fn emit_graph(
    ctx: &PipelineContext,
    graph: &ModuleGraph,
    inject_styles: bool,
    output_dir: Option<PathBuf>,
) -> Result<Emission, PipelineError> {
    let partition = ChunkPartition::partition(graph, ctx.config().split_shared);
    let options = EmitOptions::from_config(ctx.config()).with_inject_styles(inject_styles);
    let chunks = ctx
        .pool()
        .install(|| render_chunks(graph, &partition, &options, ctx.hooks()))?;
    let set = collect_artifacts(graph, &chunks)?;

    let mut emit = AfterEmit::new(set.into_vec(), output_dir);
    ctx.hooks().after_emit.call(&mut emit)?;
    let (artifacts, added) = emit.into_parts();

    let mut set = ArtifactSet::new();
    for artifact in artifacts {
        set.push(artifact, "pipeline")?;
    }
    for (path, bytes) in added {
        let kind = ArtifactKind::from_path(&path);
        set.push(Artifact { path, kind, bytes }, "plugin")?;
    }

    Ok(Emission {
        partition,
        chunks,
        artifacts: set.into_vec(),
    })
}

fn summarize(graph: &ModuleGraph, emission: &Emission) -> BuildSummary {
    let warnings: Vec<String> = GraphBuilder::cycle_warnings(graph)
        .iter()
        .map(ToString::to_string)
        .collect();
    let errors: Vec<String> = graph
        .failures()
        .into_iter()
        .map(|(id, message)| {
            let path = graph.get(id).map_or("?", |m| m.rel_path.as_str());
            format!("{path}: {message}")
        })
        .collect();
    for error in &errors {
        warn!("{error}");
    }

    BuildSummary {
        chunks: emission
            .chunks
            .iter()
            .map(|c| ChunkSummary {
                name: c.name.clone(),
                kind: c.kind,
                file: c.file.clone(),
                css: c.css_file.clone(),
                hash: c.hash.clone(),
                modules: c.modules.len(),
            })
            .collect(),
        assets: emission
            .artifacts
            .iter()
            .filter(|a| a.kind == ArtifactKind::Asset)
            .map(|a| a.path.clone())
            .collect(),
        files: emission.artifacts.iter().map(|a| a.path.clone()).collect(),
        written: Vec::new(),
        unchanged: Vec::new(),
        warnings,
        errors,
        module_count: graph.len(),
        duration_ms: 0,
    }
}
