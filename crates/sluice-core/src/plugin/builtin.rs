//! Built-in plugins: HTML document, output cleaning, static copy, banner.

use super::{Hooks, Plugin};
use crate::chunks::ChunkKind;
use crate::config::{CopyConfig, HtmlConfig};
use crate::emit::{Manifest, ManifestChunk};
use crate::template::public_url;
use sluice_util::fs::{contains_or_equals, list_files, normalize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const DEFAULT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
  <head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width,initial-scale=1.0">
    <title>{title}</title>
  </head>
  <body>
    <div id="app"></div>
  </body>
</html>
"#;

/// Generates the HTML entry document from the build manifest.
///
/// Entry chunks (and the chunks they require) get `<script>` and
/// `<link rel="stylesheet">` tags; a chunk map for on-demand loading is
/// injected before them.
#[derive(Debug, Clone)]
pub struct HtmlPlugin {
    template: Option<PathBuf>,
    filename: String,
    title: String,
    public_path: String,
}

impl HtmlPlugin {
    #[must_use]
    pub fn new(root: &Path, config: &HtmlConfig, public_path: &str) -> Self {
        Self {
            template: config.template.as_ref().map(|t| root.join(t)),
            filename: config.filename.clone(),
            title: config.title.clone(),
            public_path: public_path.to_string(),
        }
    }

    fn render(&self, template: &str, manifest: &Manifest) -> String {
        let url = |file: &str| public_url(&self.public_path, file);
        let by_name: BTreeMap<&str, &ManifestChunk> =
            manifest.chunks.iter().map(|c| (c.name.as_str(), c)).collect();

        // Entry chunks, each preceded by what it requires
        let mut initial: Vec<&ManifestChunk> = Vec::new();
        for entry in manifest.chunks.iter().filter(|c| c.kind == ChunkKind::Entry) {
            for required in &entry.requires {
                if let Some(chunk) = by_name.get(required.as_str()) {
                    if !initial.iter().any(|c| c.name == chunk.name) {
                        initial.push(chunk);
                    }
                }
            }
            if !initial.iter().any(|c| c.name == entry.name) {
                initial.push(entry);
            }
        }

        let chunk_map: BTreeMap<&str, serde_json::Value> = manifest
            .chunks
            .iter()
            .map(|c| {
                (
                    c.name.as_str(),
                    serde_json::json!({
                        "js": url(&c.file),
                        "css": c.css.as_deref().map(url),
                    }),
                )
            })
            .collect();
        let chunk_map = serde_json::to_string(&chunk_map)
            .unwrap_or_else(|_| "{}".to_string())
            .replace("</", "<\\/");

        let links: String = initial
            .iter()
            .filter_map(|c| c.css.as_deref())
            .map(|css| format!("    <link rel=\"stylesheet\" href=\"{}\">\n", url(css)))
            .collect();
        let mut scripts = format!("    <script>self.__sluice_chunks__ = {chunk_map};</script>\n");
        for chunk in &initial {
            scripts.push_str(&format!("    <script src=\"{}\"></script>\n", url(&chunk.file)));
        }

        let html = template.replace("{title}", &self.title);
        let html = insert_before(&html, "</head>", &links);
        insert_before(&html, "</body>", &scripts)
    }
}

/// Insert `snippet` before the last `marker`, or append when it is missing.
/// When the marker starts an indented line, the snippet goes before the indent.
fn insert_before(html: &str, marker: &str, snippet: &str) -> String {
    let Some(mut pos) = html.rfind(marker) else {
        return format!("{html}{snippet}");
    };
    let line_start = html[..pos].rfind('\n').map_or(0, |n| n + 1);
    if html[line_start..pos].trim().is_empty() {
        pos = line_start;
    }
    format!("{}{snippet}{}", &html[..pos], &html[pos..])
}

impl Plugin for HtmlPlugin {
    fn name(&self) -> &str {
        "html"
    }

    fn apply(&self, hooks: &mut Hooks) {
        let plugin = self.clone();
        hooks.after_emit.tap(self.name(), move |emit| {
            let manifest = Manifest::from_artifacts(emit.artifacts())
                .ok_or_else(|| "build manifest is missing".to_string())?;
            let template = match &plugin.template {
                Some(path) if path.is_file() => std::fs::read_to_string(path)
                    .map_err(|e| format!("cannot read template {}: {e}", path.display()))?,
                _ => DEFAULT_TEMPLATE.to_string(),
            };
            let html = plugin.render(&template, &manifest);
            emit.add_file(plugin.filename.clone(), html.into_bytes());
            Ok(())
        });
    }
}

/// Removes files from the output directory that the last build did not produce.
///
/// Refuses to run when the output directory is the project root or contains it.
#[derive(Debug, Clone)]
pub struct CleanPlugin {
    root: PathBuf,
}

impl CleanPlugin {
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

impl Plugin for CleanPlugin {
    fn name(&self) -> &str {
        "clean"
    }

    fn apply(&self, hooks: &mut Hooks) {
        let root = self.root.clone();
        hooks.pipeline_complete.tap(self.name(), move |done| {
            let Some(dir) = done.output_dir() else {
                return Ok(());
            };
            if contains_or_equals(dir, &root) {
                return Err(format!(
                    "refusing to clean {}: it contains the project root",
                    dir.display()
                ));
            }
            let dir = normalize(dir);
            let keep: BTreeSet<&str> = done.summary().files.iter().map(String::as_str).collect();
            let mut removed = 0usize;
            for file in list_files(&dir) {
                let Ok(rel) = file.strip_prefix(&dir) else {
                    continue;
                };
                if rel.as_os_str().is_empty() {
                    continue;
                }
                let rel = rel.to_string_lossy().replace('\\', "/");
                if !keep.contains(rel.as_str()) {
                    std::fs::remove_file(&file)
                        .map_err(|e| format!("cannot remove {}: {e}", file.display()))?;
                    debug!(file = %rel, "removed stale output");
                    removed += 1;
                }
            }
            if removed > 0 {
                info!(removed, "cleaned output directory");
            }
            Ok(())
        });
    }
}

/// Copies static directories into the output.
#[derive(Debug, Clone)]
pub struct CopyPlugin {
    sources: Vec<(PathBuf, String)>,
}

impl CopyPlugin {
    #[must_use]
    pub fn new(root: &Path, copies: &[CopyConfig]) -> Self {
        Self {
            sources: copies
                .iter()
                .map(|c| (root.join(&c.from), c.to.trim_matches('/').to_string()))
                .collect(),
        }
    }
}

impl Plugin for CopyPlugin {
    fn name(&self) -> &str {
        "copy"
    }

    fn apply(&self, hooks: &mut Hooks) {
        let sources = self.sources.clone();
        hooks.after_emit.tap(self.name(), move |emit| {
            for (from, to) in &sources {
                for file in list_files(from) {
                    let Ok(rel) = file.strip_prefix(from) else {
                        continue;
                    };
                    let rel = rel.to_string_lossy().replace('\\', "/");
                    let target = if to.is_empty() { rel } else { format!("{to}/{rel}") };
                    let bytes = std::fs::read(&file)
                        .map_err(|e| format!("cannot read {}: {e}", file.display()))?;
                    emit.add_file(target, bytes);
                }
            }
            Ok(())
        });
    }
}

/// Prefixes every chunk script with a banner comment.
#[derive(Debug, Clone)]
pub struct BannerPlugin {
    banner: String,
}

impl BannerPlugin {
    #[must_use]
    pub fn new(banner: impl Into<String>) -> Self {
        Self {
            banner: banner.into(),
        }
    }
}

impl Plugin for BannerPlugin {
    fn name(&self) -> &str {
        "banner"
    }

    fn apply(&self, hooks: &mut Hooks) {
        let banner = self.banner.clone();
        hooks.before_chunk_emit.tap(self.name(), move |chunk| {
            chunk.content = format!("{banner}\n{}", chunk.content);
            Ok(())
        });
    }
}
