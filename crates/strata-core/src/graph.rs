use crate::CoreError;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use strata_schema::RecipeFile;

/// Kahn's algorithm over `deps` (node -> nodes it depends on).
///
/// The ready set is ordered, so ties break lexically and the result is
/// stable across runs. On a cycle, returns the nodes that lie on one; nodes
/// that are only downstream of a cycle are left out.
fn topo_sort<K: Ord + Clone>(
    nodes: &BTreeSet<K>,
    deps: &BTreeMap<K, BTreeSet<K>>,
) -> Result<Vec<K>, Vec<K>> {
    let mut in_degree: BTreeMap<&K, usize> = nodes.iter().map(|n| (n, 0)).collect();
    let mut dependents: BTreeMap<&K, Vec<&K>> = BTreeMap::new();

    for node in nodes {
        for dep in deps.get(node).into_iter().flatten() {
            if nodes.contains(dep) {
                *in_degree.entry(node).or_default() += 1;
                dependents.entry(dep).or_default().push(node);
            }
        }
    }

    let mut ready: BTreeSet<&K> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(node) = ready.pop_first() {
        order.push(node.clone());
        for dependent in dependents.get(node).into_iter().flatten() {
            if let Some(d) = in_degree.get_mut(dependent) {
                *d -= 1;
                if *d == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }

    if order.len() == nodes.len() {
        Ok(order)
    } else {
        let done: BTreeSet<&K> = order.iter().collect();
        let stuck: BTreeSet<&K> = nodes.iter().filter(|n| !done.contains(n)).collect();
        Err(stuck
            .iter()
            .copied()
            .filter(|&n| on_cycle(n, &stuck, deps))
            .cloned()
            .collect())
    }
}

/// Whether `start` can reach itself through `deps` without leaving `within`.
fn on_cycle<K: Ord>(start: &K, within: &BTreeSet<&K>, deps: &BTreeMap<K, BTreeSet<K>>) -> bool {
    let mut seen: BTreeSet<&K> = BTreeSet::new();
    let mut stack: Vec<&K> = vec![start];
    while let Some(node) = stack.pop() {
        for dep in deps.get(node).into_iter().flatten() {
            if dep == start {
                return true;
            }
            if within.contains(dep) && seen.insert(dep) {
                stack.push(dep);
            }
        }
    }
    false
}

/// Dependency graph between recipe files: a file depends on every other file
/// that defines a layer one of its recipes is built from.
#[derive(Debug)]
pub struct RecipeGraph {
    files: BTreeSet<PathBuf>,
    providers: BTreeMap<String, PathBuf>,
    deps: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
}

impl RecipeGraph {
    pub fn new(files: &[RecipeFile]) -> Result<Self, CoreError> {
        let mut providers: BTreeMap<String, PathBuf> = BTreeMap::new();
        for file in files {
            for layer in file.layer_names() {
                if let Some(other) = providers.get(layer) {
                    if other != file.path() {
                        return Err(CoreError::Config(format!(
                            "layer '{layer}' is defined in both {} and {}",
                            other.display(),
                            file.path().display()
                        )));
                    }
                }
                providers.insert(layer.to_owned(), file.path().to_path_buf());
            }
        }

        let mut deps: BTreeMap<PathBuf, BTreeSet<PathBuf>> = BTreeMap::new();
        for file in files {
            let edges = deps.entry(file.path().to_path_buf()).or_default();
            for tag in file.built_bases() {
                // Tags defined nowhere may name snapshots from an earlier run.
                if let Some(provider) = providers.get(tag) {
                    if provider != file.path() {
                        edges.insert(provider.clone());
                    }
                }
            }
        }

        Ok(Self {
            files: files.iter().map(|f| f.path().to_path_buf()).collect(),
            providers,
            deps,
        })
    }

    /// Files in build order: every file after the files it depends on.
    pub fn sort(&self) -> Result<Vec<PathBuf>, CoreError> {
        topo_sort(&self.files, &self.deps).map_err(|stuck| {
            CoreError::Cycle(stuck.iter().map(|p| p.display().to_string()).collect())
        })
    }

    /// Files `file` directly depends on, sorted.
    pub fn prerequisites(&self, file: &Path) -> Vec<PathBuf> {
        self.deps
            .get(file)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The file defining `layer`, if any file in the set does.
    pub fn provider(&self, layer: &str) -> Option<&Path> {
        self.providers.get(layer).map(PathBuf::as_path)
    }
}

/// Layers of one file in build order, following `Built` references between
/// layers of the same file.
pub fn layer_order(file: &RecipeFile) -> Result<Vec<String>, CoreError> {
    let nodes: BTreeSet<String> = file.layer_names().map(str::to_owned).collect();
    let mut deps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (name, recipe) in file.layers() {
        if let Some(tag) = recipe.from.built_tag() {
            if file.contains(tag) {
                deps.entry(name.to_owned())
                    .or_default()
                    .insert(tag.to_owned());
            }
        }
    }
    topo_sort(&nodes, &deps).map_err(CoreError::Cycle)
}
