//! Chunk rendering and output emission.
//!
//! Each chunk is a script that registers its modules with a small runtime
//! (`self.__sluice__`). Script modules are wrapped as
//! `function (module, exports, require)` with their `import`/`export`
//! statements lowered to CommonJS; asset modules export their URL; style
//! modules are extracted into the chunk's CSS file (or injected, in dev).
//!
//! Modules are registered under their [`ModuleKey`], and chunk content
//! refers to other chunks by name only, so a chunk's hash depends on
//! nothing but its own modules.

#![allow(clippy::format_push_string)]

use crate::chunks::{Chunk, ChunkKind, ChunkPartition};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::graph::{DependencyTarget, Module, ModuleGraph, ModuleId, ModuleKey, ModuleState};
use crate::plugin::{BeforeChunkEmit, Hooks};
use crate::scan::{css_urls, strip_css_imports};
use crate::template::{self, TemplateVars};
use crate::transform::{injection_script, ContentKind};
use rayon::prelude::*;
use regex_lite::{Captures, Regex};
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use sluice_util::fs::{write_if_changed, WriteOutcome};
use sluice_util::hash::blake3_bytes;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

/// File name of the build manifest.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Installs `self.__sluice__` once; every chunk starts with it.
const RUNTIME: &str = r#"(function (g) {
  if (g.__sluice__) return;
  var modules = {};
  var cache = {};
  var loading = {};
  var entries = [];
  function require(id) {
    var cached = cache[id];
    if (cached) return cached.exports;
    var factory = modules[id];
    if (!factory) throw new Error("Module " + id + " is not loaded");
    var module = (cache[id] = { id: id, exports: {} });
    factory.call(module.exports, module, module.exports, require);
    return module.exports;
  }
  require.interop = function (m) {
    return m && m.__esModule ? m : { default: m };
  };
  require.load = function (names, id) {
    var map = g.__sluice_chunks__ || {};
    return Promise.all(names.map(function (name) {
      if (!loading[name]) {
        loading[name] = new Promise(function (resolve, reject) {
          var entry = map[name];
          if (!entry) return reject(new Error("Unknown chunk " + name));
          if (entry.css) {
            var link = document.createElement("link");
            link.rel = "stylesheet";
            link.href = entry.css;
            document.head.appendChild(link);
          }
          var script = document.createElement("script");
          script.src = entry.js;
          script.onload = resolve;
          script.onerror = function () {
            delete loading[name];
            reject(new Error("Failed to load chunk " + name));
          };
          document.head.appendChild(script);
        });
      }
      return loading[name];
    })).then(function () {
      return require(id);
    });
  };
  g.__sluice__ = {
    define: function (name, defs) {
      for (var id in defs) modules[id] = defs[id];
      if (!loading[name]) loading[name] = Promise.resolve();
    },
    start: function (id) {
      if (entries.indexOf(id) < 0) entries.push(id);
      return require(id);
    },
    invalidate: function (ids) {
      for (var i = 0; i < ids.length; i++) delete cache[ids[i]];
    },
    restart: function () {
      for (var i = 0; i < entries.length; i++) require(entries[i]);
    },
    require: require
  };
})(typeof self !== "undefined" ? self : this);
"#;

const REQUIRE_CALL: &str = r#"\brequire\s*\(\s*["']([^"'\n]+)["']\s*\)"#;
const DYNAMIC_IMPORT: &str = r#"\bimport\s*\(\s*["']([^"'\n]+)["']\s*\)"#;

fn require_re() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    CELL.get_or_init(|| Regex::new(REQUIRE_CALL).ok()).as_ref()
}

fn dynamic_import_re() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    CELL.get_or_init(|| Regex::new(DYNAMIC_IMPORT).ok()).as_ref()
}

/// JSON-encode a string value (with escaping). Valid as a JavaScript string literal.
#[must_use]
pub fn js_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Filename templates and style handling for rendering.
#[derive(Debug, Clone)]
pub struct EmitOptions {
    pub filename: String,
    pub chunk_filename: String,
    pub css_filename: String,
    pub public_path: String,
    /// Inject styles with `<style>` elements instead of extracting CSS files.
    pub inject_styles: bool,
}

impl EmitOptions {
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            filename: config.output.filename.clone(),
            chunk_filename: config.output.chunk_filename.clone(),
            css_filename: config.output.css_filename.clone(),
            public_path: config.output.public_path.clone(),
            inject_styles: false,
        }
    }

    #[must_use]
    pub fn with_inject_styles(mut self, inject: bool) -> Self {
        self.inject_styles = inject;
        self
    }
}

/// A chunk after rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedChunk {
    pub name: String,
    pub kind: ChunkKind,
    pub root: Option<ModuleId>,
    pub modules: Vec<ModuleId>,
    pub requires: Vec<String>,
    pub js: String,
    /// BLAKE3 of `js`.
    pub hash: String,
    /// Output path of the script, relative to the output directory.
    pub file: String,
    pub css: Option<String>,
    pub css_hash: Option<String>,
    pub css_file: Option<String>,
}

/// What an output file is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Script,
    Style,
    Asset,
    Html,
    Manifest,
    Other,
}

impl ArtifactKind {
    /// Kind of a plugin-added file, by extension.
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        match path.rsplit_once('.').map(|(_, ext)| ext) {
            Some("js" | "mjs") => Self::Script,
            Some("css") => Self::Style,
            Some("html" | "htm") => Self::Html,
            _ => Self::Other,
        }
    }
}

/// An output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Path relative to the output directory, forward slashes.
    pub path: String,
    pub kind: ArtifactKind,
    pub bytes: Vec<u8>,
}

/// Output files of one emission, unique by path.
#[derive(Debug, Default)]
pub struct ArtifactSet {
    artifacts: Vec<Artifact>,
    owners: HashMap<String, (usize, String)>,
}

impl ArtifactSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an artifact. A second artifact with identical bytes at the same
    /// path is dropped; different bytes are an [`PipelineError::EmitConflict`].
    pub fn push(&mut self, artifact: Artifact, owner: &str) -> Result<(), PipelineError> {
        if let Some((index, first)) = self.owners.get(&artifact.path) {
            if self.artifacts[*index].bytes == artifact.bytes {
                return Ok(());
            }
            return Err(PipelineError::EmitConflict {
                path: artifact.path,
                first: first.clone(),
                second: owner.to_string(),
            });
        }
        self.owners
            .insert(artifact.path.clone(), (self.artifacts.len(), owner.to_string()));
        self.artifacts.push(artifact);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<Artifact> {
        self.artifacts
    }
}

/// `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub chunks: Vec<ManifestChunk>,
    pub assets: Vec<String>,
    /// Async chunk name to script file.
    pub async_chunks: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestChunk {
    pub name: String,
    pub kind: ChunkKind,
    pub file: String,
    pub css: Option<String>,
    pub hash: String,
    /// Script size in bytes, plus the stylesheet when extracted.
    #[serde(default)]
    pub size: usize,
    /// Root-relative module paths.
    pub modules: Vec<String>,
    pub requires: Vec<String>,
}

impl Manifest {
    /// Parse the manifest out of an artifact list.
    #[must_use]
    pub fn from_artifacts(artifacts: &[Artifact]) -> Option<Self> {
        artifacts
            .iter()
            .find(|a| a.kind == ArtifactKind::Manifest)
            .and_then(|a| serde_json::from_slice(&a.bytes).ok())
    }
}

struct ModulePiece {
    key: ModuleKey,
    rel_path: String,
    js: String,
    css: String,
}

/// Render every chunk of `partition`, running `before_chunk_emit` on each.
pub fn render_chunks(
    graph: &ModuleGraph,
    partition: &ChunkPartition,
    options: &EmitOptions,
    hooks: &Hooks,
) -> Result<Vec<RenderedChunk>, PipelineError> {
    let mut rendered = Vec::with_capacity(partition.len());

    for (index, chunk) in partition.chunks().iter().enumerate() {
        let pieces: Vec<ModulePiece> = chunk
            .modules
            .par_iter()
            .filter_map(|&id| graph.get(id))
            .map(|module| render_module(module, graph, partition, chunk, options))
            .collect();

        let mut js = String::with_capacity(RUNTIME.len() + pieces.iter().map(|p| p.js.len() + 64).sum::<usize>());
        js.push_str(RUNTIME);
        js.push_str(&format!("self.__sluice__.define({}, {{\n", js_string(&chunk.name)));
        for piece in &pieces {
            js.push_str(&format!("/* {} */\n", piece.rel_path.replace("*/", "* /")));
            js.push_str(&format!("{}: function (module, exports, require) {{\n", piece.key));
            for line in piece.js.lines() {
                if !line.is_empty() {
                    js.push_str("  ");
                    js.push_str(line);
                }
                js.push('\n');
            }
            js.push_str("},\n");
        }
        js.push_str("});\n");
        if let (ChunkKind::Entry, Some(root)) = (chunk.kind, chunk.root.and_then(|id| graph.key_of(id))) {
            js.push_str(&format!("self.__sluice__.start({root});\n"));
        }

        let css: String = pieces
            .iter()
            .map(|p| p.css.trim())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        let filename = match chunk.kind {
            ChunkKind::Entry => options.filename.clone(),
            ChunkKind::Async | ChunkKind::Shared => options.chunk_filename.clone(),
        };
        let mut cap = BeforeChunkEmit::new(&chunk.name, chunk.kind, js, filename);
        hooks.before_chunk_emit.call(&mut cap)?;

        let id = index.to_string();
        let hash = blake3_bytes(cap.content.as_bytes());
        let file = template::render(
            &cap.filename_template,
            &TemplateVars {
                name: &chunk.name,
                id: &id,
                ext: "js",
                hash: &hash,
                content_hash: &hash,
            },
        );

        let (css, css_hash, css_file) = if css.is_empty() {
            (None, None, None)
        } else {
            let css_hash = blake3_bytes(css.as_bytes());
            let css_file = template::render(
                &options.css_filename,
                &TemplateVars {
                    name: &chunk.name,
                    id: &id,
                    ext: "css",
                    hash: &css_hash,
                    content_hash: &css_hash,
                },
            );
            (Some(css), Some(css_hash), Some(css_file))
        };

        debug!(chunk = %chunk.name, modules = chunk.modules.len(), file = %file, "rendered chunk");
        rendered.push(RenderedChunk {
            name: chunk.name.clone(),
            kind: chunk.kind,
            root: chunk.root,
            modules: chunk.modules.clone(),
            requires: chunk.requires.clone(),
            js: cap.content,
            hash,
            file,
            css,
            css_hash,
            css_file,
        });
    }

    Ok(rendered)
}

fn render_module(
    module: &Module,
    graph: &ModuleGraph,
    partition: &ChunkPartition,
    chunk: &Chunk,
    options: &EmitOptions,
) -> ModulePiece {
    let mut piece = ModulePiece {
        key: module.key,
        rel_path: module.rel_path.clone(),
        js: String::new(),
        css: String::new(),
    };

    if let ModuleState::Failed(message) = &module.state {
        piece.js = format!("throw new Error({});\n", js_string(message));
        return piece;
    }

    match module.kind {
        ContentKind::Asset => {
            piece.js = format!("module.exports = {};\n", js_string(&module.content));
        }
        ContentKind::Style => {
            for dep in module.static_deps().filter_map(|id| graph.get(id)) {
                if dep.kind != ContentKind::Asset {
                    piece.js.push_str(&format!("require({});\n", dep.key));
                }
            }
            let css = rewrite_css_urls(&strip_css_imports(&module.content), module, graph);
            if options.inject_styles {
                piece.js.push_str(&injection_script(&js_string(&css), &module.rel_path));
            } else {
                piece.css = css;
            }
        }
        ContentKind::Script => {
            piece.js = lower_script(&module.content, module, graph, partition, chunk);
        }
    }

    for aux in module.auxiliary.iter().filter(|a| a.kind == ContentKind::Style) {
        if options.inject_styles {
            let id = format!("{}#{}", module.rel_path, aux.name);
            piece.js.push_str(&injection_script(&js_string(&aux.content), &id));
        } else {
            if !piece.css.is_empty() {
                piece.css.push('\n');
            }
            piece.css.push_str(aux.content.trim());
        }
    }

    piece
}

/// Point `url(...)` references at the referenced module's URL or data URI.
fn rewrite_css_urls(css: &str, module: &Module, graph: &ModuleGraph) -> String {
    let mut out = String::with_capacity(css.len());
    let mut last = 0;
    for url in css_urls(css) {
        let target = module
            .dependency(&url.specifier)
            .and_then(|d| d.module())
            .and_then(|id| graph.get(id));
        if let Some(target) = target {
            out.push_str(&css[last..url.range.start]);
            out.push_str(&format!("url({})", js_string(&target.content)));
            last = url.range.end;
        }
    }
    out.push_str(&css[last..]);
    out
}

/// Lower `import`/`export` statements to the registry's CommonJS shape.
fn lower_script(
    content: &str,
    module: &Module,
    graph: &ModuleGraph,
    partition: &ChunkPartition,
    chunk: &Chunk,
) -> String {
    let dep_expr = |spec: &str| -> String {
        match module.dependency(spec).map(|d| &d.target) {
            Some(DependencyTarget::Module(id)) => match graph.key_of(*id) {
                Some(key) => format!("require({key})"),
                None => format!("require({})", js_string(spec)),
            },
            Some(DependencyTarget::External { global, .. }) => format!("self[{}]", js_string(global)),
            None => format!("require({})", js_string(spec)),
        }
    };

    let mut result = String::with_capacity(content.len() + 100);
    let mut pending_exports: Vec<String> = Vec::new();
    let mut has_exports = false;

    let mut lines = content.lines();
    while let Some(line) = lines.next() {
        let trimmed = line.trim_start();
        let is_import = trimmed.starts_with("import ") || trimmed.starts_with("import{");
        let is_export = trimmed.starts_with("export ") || trimmed.starts_with("export{");
        if !is_import && !is_export {
            result.push_str(line);
            result.push('\n');
            continue;
        }

        // Join multi-line `{ ... }` clauses into one statement
        let mut stmt = line.to_string();
        if stmt.contains('{') && !stmt.contains('}') && (is_import || is_clause_export(trimmed)) {
            for next in lines.by_ref() {
                stmt.push(' ');
                stmt.push_str(next.trim());
                if next.contains('}') {
                    break;
                }
            }
        }

        if is_import {
            match lower_import(&stmt, &dep_expr) {
                Some(lowered) => result.push_str(&lowered),
                None => result.push_str(&stmt),
            }
        } else {
            has_exports = true;
            let (lowered, pending) = lower_export(&stmt, &dep_expr);
            result.push_str(&lowered);
            pending_exports.extend(pending);
        }
        result.push('\n');
    }

    for export_stmt in pending_exports {
        result.push_str(&export_stmt);
        result.push('\n');
    }

    let result = lower_calls(&result, module, graph, partition, chunk);
    if has_exports {
        format!("Object.defineProperty(exports, \"__esModule\", {{ value: true }});\n{result}")
    } else {
        result
    }
}

fn is_clause_export(trimmed: &str) -> bool {
    let rest = trimmed.trim_start_matches("export").trim_start();
    rest.starts_with('{')
}

/// Rewrite `require("x")` and `import("x")` calls.
fn lower_calls(
    content: &str,
    module: &Module,
    graph: &ModuleGraph,
    partition: &ChunkPartition,
    chunk: &Chunk,
) -> String {
    let content = match require_re() {
        Some(re) => re
            .replace_all(content, |caps: &Captures<'_>| {
                let spec = &caps[1];
                match module.dependency(spec).map(|d| &d.target) {
                    Some(DependencyTarget::Module(id)) => match graph.key_of(*id) {
                        Some(key) => format!("require({key})"),
                        None => caps[0].to_string(),
                    },
                    Some(DependencyTarget::External { global, .. }) => format!("self[{}]", js_string(global)),
                    None => caps[0].to_string(),
                }
            })
            .into_owned(),
        None => content.to_string(),
    };

    match dynamic_import_re() {
        Some(re) => re
            .replace_all(&content, |caps: &Captures<'_>| {
                let spec = &caps[1];
                match module.dependency(spec).map(|d| &d.target) {
                    Some(DependencyTarget::Module(id)) => {
                        let names: Vec<String> = partition
                            .load_set(*id)
                            .into_iter()
                            .filter(|n| *n != chunk.name)
                            .map(|n| js_string(&n))
                            .collect();
                        let key = graph.key_of(*id).unwrap_or_default();
                        format!("require.load([{}], {key})", names.join(", "))
                    }
                    Some(DependencyTarget::External { global, .. }) => {
                        format!("Promise.resolve(self[{}])", js_string(global))
                    }
                    None => format!(
                        "Promise.reject(new Error({}))",
                        js_string(&format!("Cannot find module '{spec}'"))
                    ),
                }
            })
            .into_owned(),
        None => content,
    }
}

fn unquote(s: &str) -> &str {
    s.trim()
        .trim_end_matches(';')
        .trim()
        .trim_matches(|c| c == '\'' || c == '"' || c == '`')
}

/// `{ a, b as c }` -> `{ a, b: c }`
fn destructure(clause: &str) -> String {
    clause.replace(" as ", ": ")
}

fn lower_import(stmt: &str, dep_expr: &dyn Fn(&str) -> String) -> Option<String> {
    let trimmed = stmt.trim().trim_end_matches(';').trim_end();
    let rest = trimmed.strip_prefix("import")?.trim_start();
    if rest.starts_with('(') {
        return None;
    }

    // Side-effect import: import './foo'
    if rest.starts_with('\'') || rest.starts_with('"') {
        return Some(format!("{};", dep_expr(unquote(rest))));
    }

    let from_idx = rest.rfind(" from ")?;
    let clause = rest[..from_idx].trim();
    let dep = dep_expr(unquote(&rest[from_idx + 6..]));

    let mut out: Vec<String> = Vec::new();
    let mut clause = clause;

    // Default binding first: `foo`, `foo, { a }`, `foo, * as ns`
    if !clause.starts_with('{') && !clause.starts_with('*') {
        let (name, remainder) = match clause.split_once(',') {
            Some((name, remainder)) => (name.trim(), remainder.trim()),
            None => (clause, ""),
        };
        out.push(format!("const {name} = require.interop({dep}).default;"));
        clause = remainder;
    }

    if let Some(ns) = clause.strip_prefix("* as ") {
        out.push(format!("const {} = {dep};", ns.trim()));
    } else if clause.starts_with('{') {
        out.push(format!("const {} = {dep};", destructure(clause)));
    }

    Some(out.join(" "))
}

fn lower_export(stmt: &str, dep_expr: &dyn Fn(&str) -> String) -> (String, Vec<String>) {
    let indent = &stmt[..stmt.len() - stmt.trim_start().len()];
    let trimmed = stmt.trim();
    let rest = trimmed.trim_start_matches("export").trim_start();

    if let Some(value) = rest.strip_prefix("default ") {
        return (format!("{indent}exports.default = {value}"), Vec::new());
    }

    // Re-exports
    if let Some(from_idx) = rest.rfind(" from ") {
        let clause = rest[..from_idx].trim();
        let dep = dep_expr(unquote(&rest[from_idx + 6..]));
        if clause == "*" {
            return (
                format!(
                    "{indent}(function (m) {{ for (var k in m) if (k !== \"default\" && k !== \"__esModule\") exports[k] = m[k]; }})({dep});"
                ),
                Vec::new(),
            );
        }
        if let Some(ns) = clause.strip_prefix("* as ") {
            return (format!("{indent}exports.{} = {dep};", ns.trim()), Vec::new());
        }
        if clause.starts_with('{') {
            let assignments: Vec<String> = export_names(clause)
                .into_iter()
                .map(|(local, exported)| format!("exports.{exported} = m.{local};"))
                .collect();
            return (
                format!("{indent}(function (m) {{ {} }})({dep});", assignments.join(" ")),
                Vec::new(),
            );
        }
    }

    // export { foo, bar as baz }
    if rest.starts_with('{') {
        let pending = export_names(rest)
            .into_iter()
            .map(|(local, exported)| format!("exports.{exported} = {local};"))
            .collect();
        return (String::new(), pending);
    }

    // Declarations
    let decl = rest;
    let name = ["const ", "let ", "var ", "async function* ", "async function ", "function* ", "function ", "class "]
        .iter()
        .find_map(|kw| decl.strip_prefix(kw))
        .map(|after| {
            after
                .trim_start()
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '$')
                .collect::<String>()
        })
        .filter(|n| !n.is_empty());

    match name {
        Some(name) => (format!("{indent}{decl}"), vec![format!("exports.{name} = {name};")]),
        None => (format!("{indent}{decl}"), Vec::new()),
    }
}

/// `{ a, b as c }` -> `[(a, a), (b, c)]`
fn export_names(clause: &str) -> Vec<(String, String)> {
    let inner = clause
        .trim()
        .trim_start_matches('{')
        .split('}')
        .next()
        .unwrap_or("");
    inner
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|name| match name.split_once(" as ") {
            Some((local, exported)) => (local.trim().to_string(), exported.trim().to_string()),
            None => (name.to_string(), name.to_string()),
        })
        .collect()
}

/// Turn rendered chunks, assets and the manifest into output files.
pub fn collect_artifacts(
    graph: &ModuleGraph,
    rendered: &[RenderedChunk],
) -> Result<ArtifactSet, PipelineError> {
    let mut set = ArtifactSet::new();
    let mut assets = Vec::new();

    for chunk in rendered {
        set.push(
            Artifact {
                path: chunk.file.clone(),
                kind: ArtifactKind::Script,
                bytes: chunk.js.clone().into_bytes(),
            },
            &format!("chunk '{}'", chunk.name),
        )?;
        if let (Some(css), Some(css_file)) = (&chunk.css, &chunk.css_file) {
            set.push(
                Artifact {
                    path: css_file.clone(),
                    kind: ArtifactKind::Style,
                    bytes: css.clone().into_bytes(),
                },
                &format!("styles of chunk '{}'", chunk.name),
            )?;
        }
    }

    let mut asset_ids: Vec<ModuleId> = rendered.iter().flat_map(|c| c.modules.iter().copied()).collect();
    asset_ids.sort_unstable();
    for id in asset_ids {
        let Some(module) = graph.get(id) else { continue };
        let Some(asset) = &module.asset else { continue };
        set.push(
            Artifact {
                path: asset.file.clone(),
                kind: ArtifactKind::Asset,
                bytes: asset.bytes.clone(),
            },
            &module.rel_path,
        )?;
        if !assets.contains(&asset.file) {
            assets.push(asset.file.clone());
        }
    }

    let manifest = build_manifest(graph, rendered, assets);
    let bytes = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| PipelineError::Config(crate::error::Error::other(e.to_string())))?;
    set.push(
        Artifact {
            path: MANIFEST_FILE.to_string(),
            kind: ArtifactKind::Manifest,
            bytes,
        },
        "manifest",
    )?;

    Ok(set)
}

fn build_manifest(graph: &ModuleGraph, rendered: &[RenderedChunk], assets: Vec<String>) -> Manifest {
    let chunks = rendered
        .iter()
        .map(|c| ManifestChunk {
            name: c.name.clone(),
            kind: c.kind,
            file: c.file.clone(),
            css: c.css_file.clone(),
            hash: c.hash.clone(),
            size: c.js.len() + c.css.as_ref().map_or(0, String::len),
            modules: c
                .modules
                .iter()
                .filter_map(|&id| graph.get(id))
                .map(|m| m.rel_path.clone())
                .collect(),
            requires: c.requires.clone(),
        })
        .collect();
    let async_chunks = rendered
        .iter()
        .filter(|c| c.kind == ChunkKind::Async)
        .map(|c| (c.name.clone(), c.file.clone()))
        .collect();
    Manifest {
        chunks,
        assets,
        async_chunks,
    }
}

/// Files written and left untouched by [`write_artifacts`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    pub written: Vec<String>,
    pub unchanged: Vec<String>,
}

/// Write artifacts under `out_dir`. Files whose bytes already match are left alone.
pub fn write_artifacts(out_dir: &Path, artifacts: &[Artifact]) -> Result<WriteReport, PipelineError> {
    let mut report = WriteReport::default();
    for artifact in artifacts {
        let path = out_dir.join(&artifact.path);
        let outcome = write_if_changed(&path, &artifact.bytes).map_err(|source| PipelineError::Write {
            path: path.clone(),
            source,
        })?;
        match outcome {
            WriteOutcome::Written => report.written.push(artifact.path.clone()),
            WriteOutcome::Unchanged => report.unchanged.push(artifact.path.clone()),
        }
    }
    debug!(
        written = report.written.len(),
        unchanged = report.unchanged.len(),
        "wrote artifacts"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Dependency, EmittedAsset};
    use tempfile::tempdir;

    fn options() -> EmitOptions {
        EmitOptions::from_config(&PipelineConfig::default())
    }

    fn add(graph: &mut ModuleGraph, rel: &str, content: &str) -> ModuleId {
        let (id, _) = graph.reserve(Path::new(&format!("/p/{rel}")), rel);
        let module = graph.get_mut(id).unwrap();
        module.content = content.to_string();
        module.state = ModuleState::Built;
        id
    }

    fn link(graph: &mut ModuleGraph, from: ModuleId, spec: &str, to: ModuleId, dynamic: bool) {
        graph.get_mut(from).unwrap().dependencies.push(Dependency {
            specifier: spec.to_string(),
            target: DependencyTarget::Module(to),
            dynamic,
        });
    }

    fn render(graph: &ModuleGraph, options: &EmitOptions) -> Vec<RenderedChunk> {
        let partition = ChunkPartition::partition(graph, true);
        render_chunks(graph, &partition, options, &Hooks::new()).unwrap()
    }

    #[test]
    fn test_js_string() {
        assert_eq!(js_string("a\"b\\c\nd"), r#""a\"b\\c\nd""#);
        assert_eq!(js_string("\u{1}"), r#""\u0001""#);
    }

    #[test]
    fn test_lower_imports() {
        let dep = |spec: &str| format!("require({})", spec.len());
        assert_eq!(lower_import("import './a';", &dep).unwrap(), "require(3);");
        assert_eq!(
            lower_import("import { a, b as c } from \"./x\";", &dep).unwrap(),
            "const { a, b: c } = require(3);"
        );
        assert_eq!(
            lower_import("import foo from './x'", &dep).unwrap(),
            "const foo = require.interop(require(3)).default;"
        );
        assert_eq!(
            lower_import("import * as ns from './xy';", &dep).unwrap(),
            "const ns = require(4);"
        );
        assert_eq!(
            lower_import("import foo, { bar } from './x';", &dep).unwrap(),
            "const foo = require.interop(require(3)).default; const { bar } = require(3);"
        );
        assert!(lower_import("import('./x').then(f)", &dep).is_none());
    }

    #[test]
    fn test_lower_exports() {
        let dep = |_: &str| "require(7)".to_string();

        let (line, pending) = lower_export("export default {", &dep);
        assert_eq!(line, "exports.default = {");
        assert!(pending.is_empty());

        let (line, pending) = lower_export("  export const answer = 42;", &dep);
        assert_eq!(line, "  const answer = 42;");
        assert_eq!(pending, vec!["exports.answer = answer;"]);

        let (line, pending) = lower_export("export async function load() {", &dep);
        assert_eq!(line, "async function load() {");
        assert_eq!(pending, vec!["exports.load = load;"]);

        let (line, pending) = lower_export("export { a, b as c };", &dep);
        assert_eq!(line, "");
        assert_eq!(pending, vec!["exports.a = a;", "exports.c = b;"]);

        let (line, _) = lower_export("export { x as y } from './m';", &dep);
        assert_eq!(line, "(function (m) { exports.y = m.x; })(require(7));");

        let (line, _) = lower_export("export * from './m';", &dep);
        assert!(line.contains("exports[k] = m[k]"));
        assert!(line.ends_with("(require(7));"));
    }

    #[test]
    fn test_render_registry_chunk() {
        let mut graph = ModuleGraph::new();
        let main = add(&mut graph, "src/main.js", "import { twice } from './util';\nconsole.log(twice(2));\n");
        let util = add(&mut graph, "src/util.js", "export function twice(x) {\n  return x * 2;\n}\n");
        link(&mut graph, main, "./util", util, false);
        graph.set_entry("main", main);

        let (main_key, util_key) = (graph.key_of(main).unwrap(), graph.key_of(util).unwrap());

        let chunks = render(&graph, &options());
        assert_eq!(chunks.len(), 1);
        let js = &chunks[0].js;
        assert!(js.starts_with("(function (g) {"));
        assert!(js.contains(&format!("{util_key}: function (module, exports, require) {{")));
        assert!(js.contains(&format!("const {{ twice }} = require({util_key});")));
        assert!(js.contains("exports.twice = twice;"));
        assert!(js.contains(&format!("self.__sluice__.start({main_key});")));
        // dependencies are registered before their importers
        assert!(js.find("/* src/util.js */").unwrap() < js.find("/* src/main.js */").unwrap());
        assert_eq!(chunks[0].file, format!("js/main.{}.js", &chunks[0].hash[..8]));
        assert!(chunks[0].css.is_none());
    }

    #[test]
    fn test_dynamic_import_references_chunk_by_name() {
        let mut graph = ModuleGraph::new();
        let main = add(&mut graph, "src/main.js", "import('./About.js').then(m => m.default);\n");
        let about = add(&mut graph, "src/About.js", "export default 1;\n");
        link(&mut graph, main, "./About.js", about, true);
        graph.set_entry("main", main);

        let chunks = render(&graph, &options());
        assert_eq!(chunks.len(), 2);
        let about_key = graph.key_of(about).unwrap();
        assert!(chunks[0].js.contains(&format!("require.load([\"About\"], {about_key})")));
        assert_eq!(chunks[1].kind, ChunkKind::Async);
        assert!(!chunks[1].js.contains("self.__sluice__.start("));
    }

    #[test]
    fn test_styles_extracted_with_urls_rewritten() {
        let mut graph = ModuleGraph::new();
        let main = add(&mut graph, "src/main.js", "import './style.css';\n");
        let style = add(&mut graph, "src/style.css", "body { background: url(bg.png); }\n");
        let bg = add(&mut graph, "src/bg.png", "data:image/png;base64,AAAA");
        graph.get_mut(style).unwrap().kind = ContentKind::Style;
        graph.get_mut(bg).unwrap().kind = ContentKind::Asset;
        link(&mut graph, main, "./style.css", style, false);
        link(&mut graph, style, "bg.png", bg, false);
        graph.set_entry("main", main);

        let chunks = render(&graph, &options());
        let css = chunks[0].css.as_deref().unwrap();
        assert_eq!(css, "body { background: url(\"data:image/png;base64,AAAA\"); }");
        assert!(chunks[0].css_file.as_deref().unwrap().starts_with("css/main."));

        let injected = render(&graph, &options().with_inject_styles(true));
        assert!(injected[0].css.is_none());
        assert!(injected[0].js.contains("data-sluice-id"));
    }

    #[test]
    fn test_failed_module_renders_throw() {
        let mut graph = ModuleGraph::new();
        let main = add(&mut graph, "src/main.js", "");
        graph.get_mut(main).unwrap().state = ModuleState::Failed("bad syntax".into());
        graph.set_entry("main", main);

        let chunks = render(&graph, &options());
        assert!(chunks[0].js.contains("throw new Error(\"bad syntax\");"));
    }

    #[test]
    fn test_before_chunk_emit_hook() {
        let mut graph = ModuleGraph::new();
        let main = add(&mut graph, "src/main.js", "1;\n");
        graph.set_entry("main", main);

        let mut hooks = Hooks::new();
        hooks.before_chunk_emit.tap("banner", |chunk| {
            chunk.content.insert_str(0, "/* hi */\n");
            chunk.filename_template = "[name].js".to_string();
            Ok(())
        });
        let partition = ChunkPartition::partition(&graph, true);
        let chunks = render_chunks(&graph, &partition, &options(), &hooks).unwrap();
        assert!(chunks[0].js.starts_with("/* hi */\n"));
        assert_eq!(chunks[0].file, "main.js");
        assert_eq!(chunks[0].hash, blake3_bytes(chunks[0].js.as_bytes()));
    }

    #[test]
    fn test_chunk_hash_ignores_other_chunks() {
        let build = |about: &str| {
            let mut graph = ModuleGraph::new();
            let main = add(&mut graph, "src/main.js", "import('./About.js');\n");
            let about_id = add(&mut graph, "src/About.js", about);
            link(&mut graph, main, "./About.js", about_id, true);
            graph.set_entry("main", main);
            render(&graph, &options())
        };
        let a = build("export default 1;\n");
        let b = build("export default 2;\n");
        assert_eq!(a[0].hash, b[0].hash);
        assert_ne!(a[1].hash, b[1].hash);
    }

    #[test]
    fn test_chunk_hash_ignores_discovery_order() {
        let build = |a_imports_z: bool| {
            let mut graph = ModuleGraph::new();
            let a = add(&mut graph, "src/a.js", "import './x';\n");
            let x = add(&mut graph, "src/x.js", "1;\n");
            link(&mut graph, a, "./x", x, false);
            if a_imports_z {
                let z = add(&mut graph, "src/z.js", "2;\n");
                link(&mut graph, a, "./z", z, false);
            }
            let b = add(&mut graph, "src/b.js", "import './y';\n");
            let y = add(&mut graph, "src/y.js", "3;\n");
            link(&mut graph, b, "./y", y, false);
            graph.set_entry("a", a);
            graph.set_entry("b", b);
            render(&graph, &options())
        };
        let before = build(false);
        let after = build(true);
        assert_eq!(before[1].name, "b");
        assert_eq!(before[1].js, after[1].js);
        assert_eq!(before[1].hash, after[1].hash);
        assert_ne!(before[0].hash, after[0].hash);
    }

    #[test]
    fn test_runtime_starts_each_entry_once() {
        assert!(RUNTIME.contains("if (entries.indexOf(id) < 0) entries.push(id);"));
    }

    #[test]
    fn test_artifact_set_conflicts() {
        let mut set = ArtifactSet::new();
        let artifact = |bytes: &[u8]| Artifact {
            path: "img/a.png".into(),
            kind: ArtifactKind::Asset,
            bytes: bytes.to_vec(),
        };
        set.push(artifact(b"x"), "src/a.png").unwrap();
        set.push(artifact(b"x"), "lib/a.png").unwrap();
        assert_eq!(set.len(), 1);

        let err = set.push(artifact(b"y"), "other/a.png").unwrap_err();
        match err {
            PipelineError::EmitConflict { path, first, second } => {
                assert_eq!(path, "img/a.png");
                assert_eq!(first, "src/a.png");
                assert_eq!(second, "other/a.png");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_collect_and_write() {
        let mut graph = ModuleGraph::new();
        let main = add(&mut graph, "src/main.js", "import logo from './logo.png';\n");
        let logo = add(&mut graph, "src/logo.png", "/img/logo.abcd1234.png");
        {
            let m = graph.get_mut(logo).unwrap();
            m.kind = ContentKind::Asset;
            m.asset = Some(EmittedAsset {
                file: "img/logo.abcd1234.png".into(),
                bytes: vec![1, 2, 3],
            });
        }
        link(&mut graph, main, "./logo.png", logo, false);
        graph.set_entry("main", main);

        let chunks = render(&graph, &options());
        let artifacts = collect_artifacts(&graph, &chunks).unwrap().into_vec();
        let paths: Vec<&str> = artifacts.iter().map(|a| a.path.as_str()).collect();
        assert_eq!(paths.len(), 3);
        assert!(paths.contains(&"img/logo.abcd1234.png"));
        assert!(paths.contains(&MANIFEST_FILE));

        let manifest = Manifest::from_artifacts(&artifacts).unwrap();
        assert_eq!(manifest.chunks[0].modules, vec!["src/logo.png", "src/main.js"]);
        assert_eq!(manifest.assets, vec!["img/logo.abcd1234.png"]);
        assert_eq!(manifest.chunks[0].size, chunks[0].js.len());

        let dir = tempdir().unwrap();
        let first = write_artifacts(dir.path(), &artifacts).unwrap();
        assert_eq!(first.written.len(), 3);
        let second = write_artifacts(dir.path(), &artifacts).unwrap();
        assert!(second.written.is_empty());
        assert_eq!(second.unchanged.len(), 3);
    }

    #[test]
    fn test_artifact_kind_from_path() {
        assert_eq!(ArtifactKind::from_path("index.html"), ArtifactKind::Html);
        assert_eq!(ArtifactKind::from_path("js/extra.js"), ArtifactKind::Script);
        assert_eq!(ArtifactKind::from_path("static/site.css"), ArtifactKind::Style);
        assert_eq!(ArtifactKind::from_path("static/robots.txt"), ArtifactKind::Other);
        assert_eq!(ArtifactKind::from_path("LICENSE"), ArtifactKind::Other);
    }
}
