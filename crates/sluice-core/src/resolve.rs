//! Import specifier resolution.
//!
//! Resolves import specifiers to absolute file paths, in this order:
//!
//! 1. Strip any `?query` (kept on the result for rule matching)
//! 2. Externals: a bare name mapped to a runtime global is not bundled
//! 3. Aliases: exact entries (`name$`, or an equal key) first, then prefix
//!    entries (`key/...`), each in declaration order
//! 4. Relative (`./x`), absolute (`/x`) or bare (`pkg`, `@scope/pkg/sub`)
//!    lookup, trying each configured extension, then `index` + extensions

use crate::config::ResolveConfig;
use rustc_hash::FxHashMap as HashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

/// Outcome of resolving a specifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A file to bundle.
    File {
        path: PathBuf,
        /// Query suffix from the specifier, without the `?`.
        query: Option<String>,
    },
    /// Provided at runtime by a global; never bundled or recursed into.
    External { name: String, global: String },
}

/// A specifier that could not be resolved.
#[derive(Error, Debug, Clone)]
#[error("Cannot resolve '{specifier}' from '{}': {message}", .importer.display())]
pub struct ResolveError {
    pub specifier: String,
    pub importer: PathBuf,
    pub message: String,
}

#[derive(Debug, Clone)]
struct Alias {
    find: String,
    exact: bool,
    replacement: String,
}

/// Import resolver.
#[derive(Debug)]
pub struct Resolver {
    root: PathBuf,
    aliases: Vec<Alias>,
    extensions: Vec<String>,
    externals: BTreeMap<String, String>,
    /// Cached resolutions, keyed by (specifier, importer directory).
    cache: RwLock<HashMap<(String, PathBuf), Resolution>>,
}

impl Resolver {
    /// Create a resolver for a project root.
    #[must_use]
    pub fn new(root: &Path, config: &ResolveConfig, externals: &BTreeMap<String, String>) -> Self {
        let aliases = config
            .alias
            .iter()
            .map(|a| match a.find.strip_suffix('$') {
                Some(find) => Alias {
                    find: find.to_string(),
                    exact: true,
                    replacement: a.replacement.clone(),
                },
                None => Alias {
                    find: a.find.clone(),
                    exact: false,
                    replacement: a.replacement.clone(),
                },
            })
            .collect();

        let mut extensions: Vec<String> = config
            .extensions
            .iter()
            .map(|e| if e == "*" { String::new() } else { e.clone() })
            .collect();
        if extensions.is_empty() {
            extensions.push(String::new());
        }

        Self {
            root: root.to_path_buf(),
            aliases,
            extensions,
            externals: externals.clone(),
            cache: RwLock::new(HashMap::default()),
        }
    }

    /// Drop cached resolutions (files may have appeared or disappeared).
    pub fn clear_cache(&self) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Resolve `specifier` as written in `importer`.
    pub fn resolve(&self, specifier: &str, importer: &Path) -> Result<Resolution, ResolveError> {
        let dir = importer.parent().unwrap_or(&self.root).to_path_buf();
        let cache_key = (specifier.to_string(), dir);
        if let Some(cached) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&cache_key)
        {
            return Ok(cached.clone());
        }

        let result = self.resolve_uncached(specifier, importer)?;

        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cache_key, result.clone());
        Ok(result)
    }

    fn resolve_uncached(&self, specifier: &str, importer: &Path) -> Result<Resolution, ResolveError> {
        let fail = |message: String| ResolveError {
            specifier: specifier.to_string(),
            importer: importer.to_path_buf(),
            message,
        };

        let (request, query) = match specifier.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (specifier, None),
        };
        if request.is_empty() {
            return Err(fail("empty specifier".to_string()));
        }

        if let Some(global) = self.externals.get(request) {
            return Ok(Resolution::External {
                name: request.to_string(),
                global: global.clone(),
            });
        }

        let request = self.apply_alias(request);

        let path = if request.starts_with("./") || request.starts_with("../") || request == "." || request == ".." {
            let from_dir = importer.parent().unwrap_or(&self.root);
            self.resolve_file_or_directory(&from_dir.join(&request))
                .ok_or_else(|| fail("file not found".to_string()))?
        } else if Path::new(&request).is_absolute() {
            self.resolve_file_or_directory(Path::new(&request))
                .ok_or_else(|| fail("file not found".to_string()))?
        } else {
            self.resolve_bare(&request, importer).map_err(fail)?
        };

        let path = dunce::canonicalize(&path).map_err(|e| fail(e.to_string()))?;
        Ok(Resolution::File { path, query })
    }

    /// Rewrite through the alias table. Path replacements become absolute.
    fn apply_alias(&self, request: &str) -> String {
        let exact = self.aliases.iter().find(|a| request == a.find);
        let rewritten = match exact {
            Some(alias) => Some(alias.replacement.clone()),
            None => self
                .aliases
                .iter()
                .filter(|a| !a.exact)
                .find_map(|a| {
                    request
                        .strip_prefix(a.find.as_str())
                        .filter(|rest| rest.starts_with('/'))
                        .map(|rest| format!("{}{rest}", a.replacement))
                }),
        };

        match rewritten {
            Some(r) if r.starts_with("./") || r.starts_with("../") || r == "." => {
                self.root.join(r).display().to_string()
            }
            Some(r) => r,
            None => request.to_string(),
        }
    }

    /// Resolve a bare specifier (node_modules lookup).
    fn resolve_bare(&self, specifier: &str, importer: &Path) -> Result<PathBuf, String> {
        let (pkg_name, subpath) = parse_bare_specifier(specifier);

        let mut current = importer.parent();
        while let Some(dir) = current {
            let pkg_dir = dir.join("node_modules").join(&pkg_name);

            if pkg_dir.is_dir() {
                let found = match &subpath {
                    Some(sub) => self.resolve_file_or_directory(&pkg_dir.join(sub)),
                    None => self.resolve_package_entry(&pkg_dir),
                };
                if let Some(found) = found {
                    return Ok(found);
                }
            }

            if dir == self.root {
                break;
            }
            current = dir.parent();
        }

        Err(format!("cannot find package '{pkg_name}' in node_modules"))
    }

    /// Resolve the entry point of a package directory from its package.json.
    fn resolve_package_entry(&self, pkg_dir: &Path) -> Option<PathBuf> {
        let pkg_json = pkg_dir.join("package.json");
        let json: Option<serde_json::Value> = std::fs::read_to_string(&pkg_json)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok());

        if let Some(json) = &json {
            let candidates = [
                json.get("exports").and_then(|e| resolve_exports(e, ".")),
                json.get("module").and_then(|v| v.as_str()).map(str::to_string),
                json.get("main").and_then(|v| v.as_str()).map(str::to_string),
            ];
            for entry in candidates.into_iter().flatten() {
                if let Some(found) = self.resolve_file_or_directory(&pkg_dir.join(entry)) {
                    return Some(found);
                }
            }
        }

        self.resolve_index(pkg_dir)
    }

    /// Resolve a path that might be a file or directory.
    fn resolve_file_or_directory(&self, target: &Path) -> Option<PathBuf> {
        for ext in &self.extensions {
            let candidate = if ext.is_empty() {
                target.to_path_buf()
            } else {
                PathBuf::from(format!("{}{ext}", target.display()))
            };
            if candidate.is_file() {
                return Some(candidate);
            }
        }

        if target.is_dir() {
            return self.resolve_index(target);
        }
        None
    }

    fn resolve_index(&self, dir: &Path) -> Option<PathBuf> {
        self.extensions
            .iter()
            .filter(|ext| !ext.is_empty())
            .map(|ext| dir.join(format!("index{ext}")))
            .find(|p| p.is_file())
    }
}

/// Parse a bare specifier into package name and subpath.
fn parse_bare_specifier(specifier: &str) -> (String, Option<String>) {
    if specifier.starts_with('@') {
        // Scoped package: @scope/pkg or @scope/pkg/subpath
        let parts: Vec<&str> = specifier.splitn(3, '/').collect();
        if parts.len() >= 2 {
            let pkg = format!("{}/{}", parts[0], parts[1]);
            (pkg, parts.get(2).map(|s| (*s).to_string()))
        } else {
            (specifier.to_string(), None)
        }
    } else {
        let mut parts = specifier.splitn(2, '/');
        let pkg = parts.next().unwrap_or(specifier).to_string();
        (pkg, parts.next().map(str::to_string))
    }
}

/// Resolve the `exports` field for a subpath (string and condition maps only).
fn resolve_exports(exports: &serde_json::Value, subpath: &str) -> Option<String> {
    match exports {
        serde_json::Value::String(s) if subpath == "." => Some(s.clone()),
        serde_json::Value::Object(map) => {
            if let Some(value) = map.get(subpath) {
                return resolve_export_value(value);
            }
            if subpath == "." {
                return map
                    .get("import")
                    .or_else(|| map.get("default"))
                    .and_then(resolve_export_value);
            }
            None
        }
        _ => None,
    }
}

/// Resolve a single export value. Prefers `import`, then `default`, then `require`.
fn resolve_export_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(map) => map
            .get("import")
            .or_else(|| map.get("default"))
            .or_else(|| map.get("require"))
            .and_then(resolve_export_value),
        _ => None,
    }
}
