#![deny(clippy::all)]
#![warn(clippy::pedantic)]

//! Benchmark fixtures for sluice.
//!
//! Run benchmarks with: `cargo bench -p sluice-bench`

use std::path::Path;
use tempfile::TempDir;

/// Shape of a generated project.
#[derive(Debug, Clone, Copy)]
pub struct FixtureShape {
    /// Number of script modules besides the entry.
    pub modules: usize,
    /// Imports per module, pointing at later modules.
    pub fan_out: usize,
    /// Give every tenth module a stylesheet.
    pub styles: bool,
}

impl Default for FixtureShape {
    fn default() -> Self {
        Self {
            modules: 200,
            fan_out: 3,
            styles: true,
        }
    }
}

/// Write a project with entry `src/main.js` importing a layered module tree.
///
/// # Panics
/// Panics if the temporary directory cannot be written.
#[must_use]
pub fn fixture_project(shape: FixtureShape) -> TempDir {
    let dir = TempDir::new().expect("create fixture dir");
    let root = dir.path();

    let first: Vec<String> = (0..shape.fan_out.min(shape.modules))
        .map(|i| format!("import {{ m{i} }} from './lib/m{i}';\n"))
        .collect();
    write(root, "src/main.js", &format!("{}console.log('main');\n", first.concat()));

    for i in 0..shape.modules {
        let mut source = String::new();
        for k in 1..=shape.fan_out {
            let dep = i * shape.fan_out + k;
            if dep < shape.modules {
                source.push_str(&format!("import {{ m{dep} }} from './m{dep}';\n"));
            }
        }
        if shape.styles && i % 10 == 0 {
            source.push_str(&format!("import './m{i}.css';\n"));
            write(
                root,
                &format!("src/lib/m{i}.css"),
                &format!(".m{i} {{ color: #{:06x}; }}\n", i * 4099),
            );
        }
        source.push_str(&format!("export function m{i}() {{ return {i}; }}\n"));
        write(root, &format!("src/lib/m{i}.js"), &source);
    }
    dir
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create fixture parent");
    }
    std::fs::write(path, content).expect("write fixture file");
}
