//! Shared fixtures for integration tests.

#![allow(dead_code)]

use sluice_core::{PipelineConfig, PipelineContext};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// A project directory populated with `files` (path, content).
pub fn project(files: &[(&str, &[u8])]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (path, content) in files {
        write(dir.path(), path, content);
    }
    dir
}

pub fn write(root: &Path, path: &str, content: &[u8]) {
    let full = root.join(path);
    fs::create_dir_all(full.parent().unwrap()).unwrap();
    fs::write(full, content).unwrap();
}

/// Config with only the given entries.
pub fn config(entries: &[(&str, &str)]) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.entry.clear();
    for (name, path) in entries {
        config.entry.insert((*name).to_string(), (*path).to_string());
    }
    config
}

pub fn context(root: &Path, config: PipelineConfig) -> PipelineContext {
    PipelineContext::new(root, config).unwrap()
}

/// Fake PNG payload of `len` bytes.
pub fn png(len: usize) -> Vec<u8> {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    bytes.resize(len, 7);
    bytes
}
