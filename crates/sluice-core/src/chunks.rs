//! Code splitting.
//!
//! Partitions the module graph into chunks. Roots are the entries plus
//! every dynamic-import target that no entry reaches statically. A module
//! reached by one root lives in that root's chunk; a module reached by
//! several roots goes to a shared chunk named after the sorted root names.

use crate::graph::{ModuleGraph, ModuleId};
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Kind of chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    /// Loaded by the HTML document; runs its root on load.
    Entry,
    /// Loaded on demand by `import()`.
    Async,
    /// Modules reached from several roots.
    Shared,
}

/// A group of modules emitted together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub name: String,
    pub kind: ChunkKind,
    /// Root module (none for shared chunks).
    pub root: Option<ModuleId>,
    /// Modules in dependency order (dependencies first).
    pub modules: Vec<ModuleId>,
    /// Other chunks that must be loaded before the root can run, sorted.
    pub requires: Vec<String>,
}

/// Result of code splitting.
#[derive(Debug, Clone, Default)]
pub struct ChunkPartition {
    chunks: Vec<Chunk>,
    module_to_chunk: HashMap<ModuleId, usize>,
}

struct Root {
    name: String,
    id: ModuleId,
    kind: ChunkKind,
}

impl ChunkPartition {
    /// Split the graph into chunks.
    #[must_use]
    pub fn partition(graph: &ModuleGraph, split_shared: bool) -> Self {
        let roots = find_roots(graph);
        let root_ids: BTreeSet<ModuleId> = roots.iter().map(|r| r.id).collect();

        // Which roots reach each module, without walking into other roots
        let mut reached_by: BTreeMap<ModuleId, BTreeSet<usize>> = BTreeMap::new();
        for (index, root) in roots.iter().enumerate() {
            let mut stack = vec![root.id];
            let mut seen = BTreeSet::new();
            while let Some(id) = stack.pop() {
                if !seen.insert(id) {
                    continue;
                }
                if id != root.id && root_ids.contains(&id) {
                    continue;
                }
                reached_by.entry(id).or_default().insert(index);
                if let Some(module) = graph.get(id) {
                    stack.extend(module.static_deps());
                }
            }
        }

        let mut chunks: Vec<Chunk> = roots
            .iter()
            .map(|r| Chunk {
                name: r.name.clone(),
                kind: r.kind,
                root: Some(r.id),
                modules: Vec::new(),
                requires: Vec::new(),
            })
            .collect();
        let mut shared: BTreeMap<String, usize> = BTreeMap::new();
        let mut module_to_chunk: HashMap<ModuleId, usize> = HashMap::default();

        for (&id, owners) in &reached_by {
            let chunk_index = if root_ids.contains(&id) {
                roots.iter().position(|r| r.id == id).unwrap_or(0)
            } else if owners.len() == 1 || !split_shared {
                owners.iter().next().copied().unwrap_or(0)
            } else {
                let mut names: Vec<&str> = owners.iter().map(|&i| roots[i].name.as_str()).collect();
                names.sort_unstable();
                let name = format!("shared~{}", names.join("~"));
                *shared.entry(name).or_insert(usize::MAX)
            };
            module_to_chunk.insert(id, chunk_index);
        }

        // Shared chunks are appended after the root chunks, in name order
        for (name, slot) in &mut shared {
            *slot = chunks.len();
            chunks.push(Chunk {
                name: name.clone(),
                kind: ChunkKind::Shared,
                root: None,
                modules: Vec::new(),
                requires: Vec::new(),
            });
        }
        for (&id, owners) in &reached_by {
            if module_to_chunk.get(&id) == Some(&usize::MAX) {
                let mut names: Vec<&str> = owners.iter().map(|&i| roots[i].name.as_str()).collect();
                names.sort_unstable();
                let name = format!("shared~{}", names.join("~"));
                if let Some(&index) = shared.get(&name) {
                    module_to_chunk.insert(id, index);
                }
            }
        }

        for id in dependency_order(graph, roots.iter().map(|r| r.id)) {
            if let Some(&index) = module_to_chunk.get(&id) {
                chunks[index].modules.push(id);
            }
        }

        let mut partition = Self {
            chunks,
            module_to_chunk,
        };
        for index in 0..partition.chunks.len() {
            let Some(root) = partition.chunks[index].root else {
                continue;
            };
            let needed: BTreeSet<String> = static_closure(graph, root)
                .into_iter()
                .filter_map(|id| partition.chunk_of(id))
                .filter(|c| c.name != partition.chunks[index].name)
                .map(|c| c.name.clone())
                .collect();
            partition.chunks[index].requires = needed.into_iter().collect();
        }
        partition
    }

    /// All chunks: entries (entry-name order), async roots (path order), then shared (name order).
    #[must_use]
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.name == name)
    }

    /// The chunk holding `id`.
    #[must_use]
    pub fn chunk_of(&self, id: ModuleId) -> Option<&Chunk> {
        self.module_to_chunk.get(&id).map(|&i| &self.chunks[i])
    }

    /// Chunk names to load before `id` can be required: its own chunk and
    /// that chunk's requirements.
    #[must_use]
    pub fn load_set(&self, id: ModuleId) -> Vec<String> {
        let Some(chunk) = self.chunk_of(id) else {
            return Vec::new();
        };
        let mut names = vec![chunk.name.clone()];
        names.extend(chunk.requires.iter().cloned());
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

fn find_roots(graph: &ModuleGraph) -> Vec<Root> {
    let mut roots: Vec<Root> = Vec::new();
    for (name, &id) in graph.entries() {
        if graph.get(id).is_some() && !roots.iter().any(|r| r.id == id) {
            roots.push(Root {
                name: name.clone(),
                id,
                kind: ChunkKind::Entry,
            });
        }
    }

    let entry_reach = roots
        .iter()
        .fold(BTreeSet::new(), |mut acc, r| {
            acc.extend(static_closure(graph, r.id));
            acc
        });
    let reachable = graph.reachable_from(roots.iter().map(|r| r.id).collect::<Vec<_>>());

    // Async roots in path order, independent of discovery order
    let mut targets: BTreeMap<&str, ModuleId> = BTreeMap::new();
    for module in graph.iter().filter(|m| reachable.contains(&m.id)) {
        for target in module.dynamic_deps() {
            if entry_reach.contains(&target) || roots.iter().any(|r| r.id == target) {
                continue;
            }
            if let Some(target_module) = graph.get(target) {
                targets.insert(target_module.rel_path.as_str(), target);
            }
        }
    }
    for (rel_path, target) in targets {
        let stem = chunk_name_for(rel_path);
        let name = if roots.iter().any(|r| r.name == stem) {
            let key = graph.key_of(target).unwrap_or_default();
            format!("{stem}-{:08x}", key >> 16)
        } else {
            stem
        };
        roots.push(Root {
            name,
            id: target,
            kind: ChunkKind::Async,
        });
    }
    roots
}

/// Chunk name from a module path: the file stem, restricted to `[A-Za-z0-9_-]`.
fn chunk_name_for(rel_path: &str) -> String {
    let path = rel_path.split('?').next().unwrap_or(rel_path);
    let file = path.rsplit('/').next().unwrap_or(path);
    let stem = file.split('.').next().unwrap_or(file);
    let name: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if name.is_empty() {
        "chunk".to_string()
    } else {
        name
    }
}

/// Modules statically reachable from `root`, including it.
fn static_closure(graph: &ModuleGraph, root: ModuleId) -> BTreeSet<ModuleId> {
    let mut seen = BTreeSet::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if seen.insert(id) {
            if let Some(module) = graph.get(id) {
                stack.extend(module.static_deps());
            }
        }
    }
    seen
}

/// Post-order DFS over static edges from each root in turn: dependencies
/// come before their dependents, and the order only depends on the graph.
fn dependency_order(graph: &ModuleGraph, roots: impl Iterator<Item = ModuleId>) -> Vec<ModuleId> {
    let mut order = Vec::new();
    let mut visited = BTreeSet::new();
    for root in roots {
        // (module, next dependency index)
        let mut stack: Vec<(ModuleId, usize)> = vec![(root, 0)];
        if !visited.insert(root) {
            continue;
        }
        while let Some((id, next)) = stack.pop() {
            let deps: Vec<ModuleId> = graph
                .get(id)
                .map(|m| m.static_deps().collect())
                .unwrap_or_default();
            if let Some(&dep) = deps.get(next) {
                stack.push((id, next + 1));
                if visited.insert(dep) {
                    stack.push((dep, 0));
                }
            } else {
                order.push(id);
            }
        }
    }
    order
}
