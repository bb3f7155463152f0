//! Module dependency graph.
//!
//! An arena of modules indexed by [`ModuleId`], with exactly one module per
//! resolved path. A module keeps its id while it stays in the graph; slots
//! emptied by pruning are reused.
//!
//! Arena ids depend on discovery order and never leave the process. Emitted
//! code names modules by [`ModuleKey`], derived from the root-relative path
//! alone, so adding a module to one entry does not renumber another's.

use crate::transform::{Auxiliary, ContentKind};
use rustc_hash::FxHashMap as HashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Unique identifier for a module in the graph.
pub type ModuleId = usize;

/// Module id as it appears in emitted code and hot updates. Fits in 48 bits,
/// so it is exact as a JavaScript number.
pub type ModuleKey = u64;

/// Key for a root-relative path. `attempt` salts the hash after a collision.
fn derive_key(rel_path: &str, attempt: u32) -> ModuleKey {
    let path = rel_path.split('?').next().unwrap_or(rel_path);
    let mut hasher = blake3::Hasher::new();
    hasher.update(path.as_bytes());
    if attempt > 0 {
        hasher.update(&attempt.to_le_bytes());
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes[..6].copy_from_slice(&digest.as_bytes()[..6]);
    u64::from_le_bytes(bytes)
}

/// Build state of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleState {
    Pending,
    Built,
    Failed(String),
}

/// What a dependency points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyTarget {
    Module(ModuleId),
    /// Provided by a runtime global, never bundled.
    External { name: String, global: String },
}

/// An edge of the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    /// Specifier as written in the importer.
    pub specifier: String,
    pub target: DependencyTarget,
    pub dynamic: bool,
}

impl Dependency {
    /// Target module id, if this edge is not external.
    #[must_use]
    pub fn module(&self) -> Option<ModuleId> {
        match self.target {
            DependencyTarget::Module(id) => Some(id),
            DependencyTarget::External { .. } => None,
        }
    }
}

/// An asset file that goes to the output directory as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedAsset {
    /// Output path relative to the output directory.
    pub file: String,
    pub bytes: Vec<u8>,
}

/// A module in the dependency graph.
#[derive(Debug, Clone)]
pub struct Module {
    pub id: ModuleId,
    /// Id used in emitted code.
    pub key: ModuleKey,
    /// Absolute path to the module (identity).
    pub path: PathBuf,
    /// Root-relative path with forward slashes, plus the query of the first reference.
    pub rel_path: String,
    pub kind: ContentKind,
    /// Transformed content. For assets: the URL or data URI.
    pub content: String,
    /// BLAKE3 of the transformed content.
    pub hash: String,
    pub dependencies: Vec<Dependency>,
    pub auxiliary: Vec<Auxiliary>,
    pub asset: Option<EmittedAsset>,
    pub state: ModuleState,
}

impl Module {
    fn pending(id: ModuleId, key: ModuleKey, path: PathBuf, rel_path: String) -> Self {
        let kind = ContentKind::from_path(&path);
        Self {
            id,
            key,
            path,
            rel_path,
            kind,
            content: String::new(),
            hash: String::new(),
            dependencies: Vec::new(),
            auxiliary: Vec::new(),
            asset: None,
            state: ModuleState::Pending,
        }
    }

    /// Ids of static dependencies, in source order.
    pub fn static_deps(&self) -> impl Iterator<Item = ModuleId> + '_ {
        self.dependencies
            .iter()
            .filter(|d| !d.dynamic)
            .filter_map(Dependency::module)
    }

    /// Ids of dynamic dependencies (code split points), in source order.
    pub fn dynamic_deps(&self) -> impl Iterator<Item = ModuleId> + '_ {
        self.dependencies
            .iter()
            .filter(|d| d.dynamic)
            .filter_map(Dependency::module)
    }

    /// Look up the edge for a specifier as written.
    #[must_use]
    pub fn dependency(&self, specifier: &str) -> Option<&Dependency> {
        self.dependencies.iter().find(|d| d.specifier == specifier)
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self.state, ModuleState::Failed(_))
    }
}

/// The module dependency graph.
#[derive(Debug, Clone, Default)]
pub struct ModuleGraph {
    slots: Vec<Option<Module>>,
    path_to_id: HashMap<PathBuf, ModuleId>,
    key_to_id: HashMap<ModuleKey, ModuleId>,
    free: Vec<ModuleId>,
    entries: BTreeMap<String, ModuleId>,
}

impl ModuleGraph {
    /// Create a new empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the id for `path`, creating a pending module on first reference.
    /// The flag is true when the module is new.
    pub fn reserve(&mut self, path: &Path, rel_path: &str) -> (ModuleId, bool) {
        if let Some(&id) = self.path_to_id.get(path) {
            return (id, false);
        }
        let key = (0..)
            .map(|attempt| derive_key(rel_path, attempt))
            .find(|key| !self.key_to_id.contains_key(key))
            .unwrap_or_default();
        let id = self.free.pop().unwrap_or(self.slots.len());
        let module = Module::pending(id, key, path.to_path_buf(), rel_path.to_string());
        if id == self.slots.len() {
            self.slots.push(Some(module));
        } else {
            self.slots[id] = Some(module);
        }
        self.path_to_id.insert(path.to_path_buf(), id);
        self.key_to_id.insert(key, id);
        (id, true)
    }

    /// Get a module by ID.
    #[must_use]
    pub fn get(&self, id: ModuleId) -> Option<&Module> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: ModuleId) -> Option<&mut Module> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    /// Get module ID by path.
    #[must_use]
    pub fn id_of(&self, path: &Path) -> Option<ModuleId> {
        self.path_to_id.get(path).copied()
    }

    /// Id of the module emitted as `key`.
    #[must_use]
    pub fn id_for_key(&self, key: ModuleKey) -> Option<ModuleId> {
        self.key_to_id.get(&key).copied()
    }

    /// Emitted id of `id`.
    #[must_use]
    pub fn key_of(&self, id: ModuleId) -> Option<ModuleKey> {
        self.get(id).map(|m| m.key)
    }

    /// Number of live modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.path_to_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.path_to_id.is_empty()
    }

    /// Iterate over live modules in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Module> {
        self.slots.iter().flatten()
    }

    pub fn set_entry(&mut self, name: &str, id: ModuleId) {
        self.entries.insert(name.to_string(), id);
    }

    /// Entry modules by entry name (name order).
    #[must_use]
    pub fn entries(&self) -> &BTreeMap<String, ModuleId> {
        &self.entries
    }

    /// Modules that import `id`, statically or dynamically.
    #[must_use]
    pub fn dependents(&self, id: ModuleId) -> Vec<ModuleId> {
        self.iter()
            .filter(|m| m.dependencies.iter().any(|d| d.module() == Some(id)))
            .map(|m| m.id)
            .collect()
    }

    /// `ids` plus every module that transitively imports one of them.
    #[must_use]
    pub fn affected_by(&self, ids: &[ModuleId]) -> BTreeSet<ModuleId> {
        self.importer_closure(ids, true)
    }

    /// `ids` plus every module that transitively imports one of them
    /// statically. These are the modules to re-execute after `ids` change;
    /// dynamic importers fetch fresh exports on their next load.
    #[must_use]
    pub fn invalidated_by(&self, ids: &[ModuleId]) -> BTreeSet<ModuleId> {
        self.importer_closure(ids, false)
    }

    fn importer_closure(&self, ids: &[ModuleId], dynamic: bool) -> BTreeSet<ModuleId> {
        let mut importers: HashMap<ModuleId, Vec<ModuleId>> = HashMap::default();
        for module in self.iter() {
            for dep in module.dependencies.iter().filter(|d| dynamic || !d.dynamic) {
                if let Some(target) = dep.module() {
                    importers.entry(target).or_default().push(module.id);
                }
            }
        }

        let mut closure = BTreeSet::new();
        let mut stack: Vec<ModuleId> = ids.iter().copied().filter(|&id| self.get(id).is_some()).collect();
        while let Some(id) = stack.pop() {
            if closure.insert(id) {
                if let Some(parents) = importers.get(&id) {
                    stack.extend(parents.iter().copied());
                }
            }
        }
        closure
    }

    /// Every module reachable from `roots` over static and dynamic edges.
    #[must_use]
    pub fn reachable_from(&self, roots: impl IntoIterator<Item = ModuleId>) -> BTreeSet<ModuleId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<ModuleId> = roots.into_iter().collect();
        while let Some(id) = stack.pop() {
            let Some(module) = self.get(id) else { continue };
            if seen.insert(id) {
                stack.extend(module.dependencies.iter().filter_map(Dependency::module));
            }
        }
        seen
    }

    /// Remove modules unreachable from every entry. Returns the removed ids;
    /// their slots are handed out again by [`reserve`](Self::reserve).
    pub fn prune(&mut self) -> Vec<ModuleId> {
        let live = self.reachable_from(self.entries.values().copied());
        let mut removed = Vec::new();
        for slot in &mut self.slots {
            if let Some(module) = slot {
                if !live.contains(&module.id) {
                    self.path_to_id.remove(&module.path);
                    self.key_to_id.remove(&module.key);
                    removed.push(module.id);
                    *slot = None;
                }
            }
        }
        // Lowest slot first
        self.free.extend(removed.iter().rev().copied());
        while self.slots.last().is_some_and(Option::is_none) {
            let last = self.slots.len() - 1;
            self.slots.pop();
            self.free.retain(|&id| id != last);
        }
        removed
    }

    /// Modules whose build failed, with the failure message.
    #[must_use]
    pub fn failures(&self) -> Vec<(ModuleId, &str)> {
        self.iter()
            .filter_map(|m| match &m.state {
                ModuleState::Failed(msg) => Some((m.id, msg.as_str())),
                _ => None,
            })
            .collect()
    }

    /// Strongly connected components with more than one module, plus self-imports.
    /// Each cycle is sorted by id; cycles are ordered by their smallest id.
    #[must_use]
    pub fn cycles(&self) -> Vec<Vec<ModuleId>> {
        let mut tarjan = Tarjan {
            graph: self,
            index: 0,
            indices: HashMap::default(),
            lowlink: HashMap::default(),
            stack: Vec::new(),
            on_stack: BTreeSet::new(),
            components: Vec::new(),
        };
        for module in self.iter() {
            if !tarjan.indices.contains_key(&module.id) {
                tarjan.visit(module.id);
            }
        }

        let mut cycles: Vec<Vec<ModuleId>> = tarjan
            .components
            .into_iter()
            .filter(|c| {
                c.len() > 1
                    || self
                        .get(c[0])
                        .is_some_and(|m| m.dependencies.iter().any(|d| d.module() == Some(c[0])))
            })
            .map(|mut c| {
                c.sort_unstable();
                c
            })
            .collect();
        cycles.sort();
        cycles
    }
}

struct Tarjan<'a> {
    graph: &'a ModuleGraph,
    index: usize,
    indices: HashMap<ModuleId, usize>,
    lowlink: HashMap<ModuleId, usize>,
    stack: Vec<ModuleId>,
    on_stack: BTreeSet<ModuleId>,
    components: Vec<Vec<ModuleId>>,
}

impl Tarjan<'_> {
    fn visit(&mut self, id: ModuleId) {
        self.indices.insert(id, self.index);
        self.lowlink.insert(id, self.index);
        self.index += 1;
        self.stack.push(id);
        self.on_stack.insert(id);

        let deps: Vec<ModuleId> = self
            .graph
            .get(id)
            .map(|m| m.dependencies.iter().filter_map(Dependency::module).collect())
            .unwrap_or_default();

        for dep in deps {
            if self.graph.get(dep).is_none() {
                continue;
            }
            if !self.indices.contains_key(&dep) {
                self.visit(dep);
                let low = self.lowlink[&id].min(self.lowlink[&dep]);
                self.lowlink.insert(id, low);
            } else if self.on_stack.contains(&dep) {
                let low = self.lowlink[&id].min(self.indices[&dep]);
                self.lowlink.insert(id, low);
            }
        }

        if self.lowlink[&id] == self.indices[&id] {
            let mut component = Vec::new();
            while let Some(member) = self.stack.pop() {
                self.on_stack.remove(&member);
                component.push(member);
                if member == id {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}
