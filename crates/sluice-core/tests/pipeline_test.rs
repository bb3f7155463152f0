//! End-to-end builds over small fixture projects.

mod common;

use common::{config, context, png, project, write};
use futures::FutureExt;
use sluice_core::graph::ModuleState;
use sluice_core::plugin::{Hooks, Plugin};
use sluice_core::{run_build, Artifact, ArtifactKind, BuildOptions, ChunkKind, Manifest, OutputTarget};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn memory() -> BuildOptions {
    BuildOptions::default().with_target(OutputTarget::Memory)
}

fn text(artifact: &Artifact) -> String {
    String::from_utf8(artifact.bytes.clone()).unwrap()
}

#[test]
fn test_small_asset_inlined_into_extracted_css() {
    let dir = project(&[
        (
            "src/main.js",
            b"import { greet } from './util';\nimport './style.css';\ngreet();\n",
        ),
        ("src/util.js", b"export function greet() { return 'hi'; }\n"),
        ("src/style.css", b"body { background: url(./background.png) no-repeat; }\n"),
        ("src/background.png", &png(5 * 1024)),
    ]);
    let ctx = context(dir.path(), config(&[("main", "src/main.js")]));
    let output = run_build(&ctx, &memory()).unwrap();

    let scripts: Vec<&Artifact> = output
        .artifacts
        .iter()
        .filter(|a| a.kind == ArtifactKind::Script)
        .collect();
    assert_eq!(scripts.len(), 1);
    assert!(text(scripts[0]).contains("function greet()"));

    let styles: Vec<&Artifact> = output
        .artifacts
        .iter()
        .filter(|a| a.kind == ArtifactKind::Style)
        .collect();
    assert_eq!(styles.len(), 1);
    assert!(text(styles[0]).contains("url(\"data:image/png;base64,"));

    assert!(output.artifacts.iter().all(|a| a.kind != ArtifactKind::Asset));
    assert!(output.summary.assets.is_empty());
}

#[test]
fn test_large_asset_emitted_with_hashed_name() {
    let dir = project(&[
        ("src/main.js", b"import logo from './logo.png';\nconsole.log(logo);\n"),
        ("src/logo.png", &png(20 * 1024)),
    ]);
    let ctx = context(dir.path(), config(&[("main", "src/main.js")]));
    let output = run_build(&ctx, &memory()).unwrap();

    assert_eq!(output.summary.assets.len(), 1);
    let asset = &output.summary.assets[0];
    assert!(asset.starts_with("img/logo."), "{asset}");
    assert!(asset.ends_with(".png"));
    let hash = &asset["img/logo.".len()..asset.len() - ".png".len()];
    assert_eq!(hash.len(), 8);
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));

    let main = output.chunks.iter().find(|c| c.name == "main").unwrap();
    assert!(main.js.contains(&format!("\"/{asset}\"")));
}

#[test]
fn test_each_file_visited_once() {
    // main -> a, b; a -> c; b -> c; c -> ./c.js again through another specifier
    let dir = project(&[
        ("src/main.js", b"import './a';\nimport './b.js';\n"),
        ("src/a.js", b"import './c';\n"),
        ("src/b.js", b"import '../src/c.js';\n"),
        ("src/c.js", b"export const c = 1;\n"),
    ]);
    let ctx = context(dir.path(), config(&[("main", "src/main.js")]));
    let output = run_build(&ctx, &memory()).unwrap();

    assert_eq!(output.graph.len(), 4);
    let paths: BTreeSet<&str> = output.graph.iter().map(|m| m.rel_path.as_str()).collect();
    assert_eq!(paths.len(), 4);
    assert!(output.graph.iter().all(|m| m.state == ModuleState::Built));
}

#[test]
fn test_cycle_terminates_with_populated_modules() {
    let dir = project(&[
        ("src/main.js", b"import { b } from './b';\nexport const a = 'a';\nconsole.log(b);\n"),
        ("src/b.js", b"import { a } from './main';\nexport const b = () => a;\n"),
    ]);
    let ctx = context(dir.path(), config(&[("main", "src/main.js")]));
    let output = run_build(&ctx, &memory()).unwrap();

    assert_eq!(output.graph.len(), 2);
    for module in output.graph.iter() {
        assert_eq!(module.state, ModuleState::Built);
        assert!(!module.content.is_empty());
        assert!(!module.hash.is_empty());
        assert_eq!(module.dependencies.len(), 1);
    }
    assert_eq!(output.summary.warnings.len(), 1);
    assert!(output.summary.warnings[0].starts_with("circular dependency: src/main.js -> src/b.js"));
}

#[test]
fn test_cached_and_forced_builds_are_identical() {
    let files: &[(&str, &[u8])] = &[
        ("src/main.js", b"import data from './data.json';\nimport './app.vue';\nconsole.log(data);\n"),
        ("src/data.json", b"{ \"answer\": 42 }\n"),
        (
            "src/app.vue",
            b"<template><p>hi</p></template>\n<script>\nexport default { name: 'app' };\n</script>\n<style>\np { color: red; }\n</style>\n",
        ),
    ];
    let dir = project(files);
    let mut ctx = context(dir.path(), config(&[("main", "src/main.js")]));

    let first = run_build(&ctx, &memory()).unwrap();
    let cached = run_build(&ctx, &memory()).unwrap();
    ctx.set_force(true);
    let forced = run_build(&ctx, &memory()).unwrap();

    assert_eq!(first.artifacts, cached.artifacts);
    assert_eq!(cached.artifacts, forced.artifacts);

    let fresh = context(dir.path(), config(&[("main", "src/main.js")]));
    let other = run_build(&fresh, &memory()).unwrap();
    assert_eq!(first.artifacts, other.artifacts);
}

#[test]
fn test_chunk_hash_changes_only_with_its_modules() {
    let dir = project(&[
        ("src/main.js", b"import './shared';\nconsole.log('main');\n"),
        ("src/admin.js", b"console.log('admin');\n"),
        ("src/shared.js", b"export const s = 1;\n"),
    ]);
    let entries = [("main", "src/main.js"), ("admin", "src/admin.js")];
    let ctx = context(dir.path(), config(&entries));
    let before = run_build(&ctx, &memory()).unwrap();

    write(dir.path(), "src/admin.js", b"console.log('admin v2');\n");
    let ctx = context(dir.path(), config(&entries));
    let after = run_build(&ctx, &memory()).unwrap();

    let hash = |output: &sluice_core::BuildOutput, name: &str| {
        output.chunks.iter().find(|c| c.name == name).unwrap().hash.clone()
    };
    assert_eq!(hash(&before, "main"), hash(&after, "main"));
    assert_ne!(hash(&before, "admin"), hash(&after, "admin"));
}

#[test]
fn test_dependency_edit_leaves_other_chunks_identical() {
    let dir = project(&[
        ("src/alpha.js", b"import './x';\nconsole.log('alpha');\n"),
        ("src/beta.js", b"import './y';\nconsole.log('beta');\n"),
        ("src/x.js", b"export const x = 1;\n"),
        ("src/y.js", b"export const y = 2;\n"),
        ("src/z.js", b"export const z = 3;\n"),
    ]);
    let entries = [("alpha", "src/alpha.js"), ("beta", "src/beta.js")];
    let build = || run_build(&context(dir.path(), config(&entries)), &memory()).unwrap();
    let chunk = |output: &sluice_core::BuildOutput, name: &str| {
        let chunk = output.chunks.iter().find(|c| c.name == name).unwrap();
        let artifact = output.artifacts.iter().find(|a| a.path == chunk.file).unwrap();
        (chunk.hash.clone(), chunk.file.clone(), artifact.bytes.clone())
    };
    let before = build();

    // alpha gains a dependency discovered ahead of beta's modules
    write(dir.path(), "src/alpha.js", b"import './z';\nimport './x';\nconsole.log('alpha');\n");
    let gained = build();
    assert_eq!(chunk(&before, "beta"), chunk(&gained, "beta"));
    assert_ne!(chunk(&before, "alpha").0, chunk(&gained, "alpha").0);

    // and loses both of them again
    write(dir.path(), "src/alpha.js", b"console.log('alpha');\n");
    let lost = build();
    assert_eq!(chunk(&before, "beta"), chunk(&lost, "beta"));
    assert_ne!(chunk(&gained, "alpha").0, chunk(&lost, "alpha").0);
    assert!(lost.graph.iter().all(|m| m.rel_path != "src/x.js"));
}

#[test]
fn test_output_dir_over_root_never_cleans_sources() {
    let dir = project(&[("src/main.js", b"console.log(1);\n")]);
    for path in [".", "./", ".."] {
        let config = config(&[("main", "src/main.js")]).with_output_path(path);
        let err = sluice_core::PipelineContext::new(dir.path(), config).err();
        assert!(matches!(err, Some(sluice_core::Error::InvalidConfig(_))), "{path:?} accepted");
    }
    assert!(dir.path().join("src/main.js").is_file());
}

#[test]
fn test_dynamic_import_splits_async_chunk() {
    let dir = project(&[
        (
            "src/main.js",
            b"import Vue from 'vue';\nimport('./pages/About').then(m => m.default(Vue));\n",
        ),
        ("src/pages/About.js", b"export default function about() {}\n"),
    ]);
    let ctx = context(dir.path(), config(&[("main", "src/main.js")]));
    let output = run_build(&ctx, &memory()).unwrap();

    let manifest = Manifest::from_artifacts(&output.artifacts).unwrap();
    let about = manifest.chunks.iter().find(|c| c.name == "About").unwrap();
    assert_eq!(about.kind, ChunkKind::Async);
    assert_eq!(manifest.async_chunks.get("About"), Some(&about.file));

    let main = output.chunks.iter().find(|c| c.name == "main").unwrap();
    assert!(main.js.contains("require.load([\"About\"]"));
    assert!(main.js.contains("self[\"Vue\"]"));

    let html = output.artifacts.iter().find(|a| a.path == "index.html").unwrap();
    let html = text(html);
    assert!(html.contains(&format!("<script src=\"/{}\"></script>", main.file)));
    assert!(!html.contains(&format!("<script src=\"/{}\"></script>", about.file)));
}

struct Recorder {
    name: &'static str,
    slow: bool,
    log: Arc<Mutex<Vec<String>>>,
}

impl Plugin for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    fn apply(&self, hooks: &mut Hooks) {
        let log = Arc::clone(&self.log);
        let name = self.name;
        if self.slow {
            hooks.after_module_build.tap_async(name, move |module| {
                let log = Arc::clone(&log);
                let file = module.path().file_name().unwrap().to_string_lossy().into_owned();
                async move {
                    let (tx, rx) = futures::channel::oneshot::channel();
                    std::thread::spawn(move || {
                        std::thread::sleep(Duration::from_millis(5));
                        let _ = tx.send(());
                    });
                    if rx.await.is_err() {
                        return Err("timer dropped".to_string());
                    }
                    log.lock().unwrap().push(format!("{name}:{file}"));
                    Ok(())
                }
                .boxed()
            });
        } else {
            hooks.after_module_build.tap(name, move |module| {
                let file = module.path().file_name().unwrap().to_string_lossy().into_owned();
                log.lock().unwrap().push(format!("{name}:{file}"));
                Ok(())
            });
        }
    }
}

#[test]
fn test_after_module_build_order_with_async_callback() {
    let dir = project(&[
        ("src/main.js", b"import './a';\nimport './b';\n"),
        ("src/a.js", b"export const a = 1;\n"),
        ("src/b.js", b"export const b = 2;\n"),
    ]);
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut ctx = context(dir.path(), config(&[("main", "src/main.js")]));
    for (name, slow) in [("A", false), ("B", true), ("C", false)] {
        ctx.register(&Recorder {
            name,
            slow,
            log: Arc::clone(&log),
        });
    }
    run_build(&ctx, &memory()).unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 9);
    for calls in log.chunks(3) {
        let file = calls[0].split_once(':').unwrap().1;
        assert_eq!(
            calls,
            [format!("A:{file}"), format!("B:{file}"), format!("C:{file}")]
        );
    }
}
