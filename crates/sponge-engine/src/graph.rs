//! Module dependency graph.
//!
//! Ordering is derived only from declared dependencies, never from the order
//! modules happen to be listed in. The graph is sorted into waves with Kahn's
//! algorithm: every module in wave N has all of its dependencies in waves
//! 0..N-1, so the modules of one wave can be provisioned concurrently.

use std::collections::{BTreeMap, BTreeSet};

use sponge_core::{Composition, ModuleKind};
use tracing::debug;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone)]
pub struct ModuleGraph {
    /// Module → its declared dependencies.
    dependencies: BTreeMap<ModuleKind, Vec<ModuleKind>>,
    waves: Vec<Vec<ModuleKind>>,
}

impl ModuleGraph {
    /// Build and sort a graph.
    ///
    /// Fails with a dependency error when a module names a dependency that is
    /// not part of the graph, or when the declarations form a cycle.
    pub fn new(
        declarations: impl IntoIterator<Item = (ModuleKind, Vec<ModuleKind>)>,
    ) -> EngineResult<Self> {
        let dependencies: BTreeMap<ModuleKind, Vec<ModuleKind>> =
            declarations.into_iter().collect();

        for (module, deps) in &dependencies {
            if let Some(missing) = deps.iter().find(|d| !dependencies.contains_key(d)) {
                return Err(EngineError::Dependency {
                    module: *module,
                    reason: format!("depends on {missing}, which is not part of the environment"),
                });
            }
            if deps.contains(module) {
                return Err(EngineError::Dependency {
                    module: *module,
                    reason: "depends on itself".to_string(),
                });
            }
        }

        let waves = sort_waves(&dependencies)?;
        debug!(modules = dependencies.len(), waves = waves.len(), "sorted module graph");

        Ok(Self {
            dependencies,
            waves,
        })
    }

    pub fn from_composition(composition: &Composition) -> EngineResult<Self> {
        Self::new(
            composition
                .modules
                .iter()
                .map(|m| (m.kind, m.depends_on.clone())),
        )
    }

    pub fn dependencies(&self, kind: ModuleKind) -> &[ModuleKind] {
        self.dependencies.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Modules that declare `kind` as a direct dependency.
    fn dependents(&self, kind: ModuleKind) -> Vec<ModuleKind> {
        self.dependencies
            .iter()
            .filter(|(_, deps)| deps.contains(&kind))
            .map(|(module, _)| *module)
            .collect()
    }

    /// Everything downstream of `kind`, directly or transitively.
    pub fn downstream(&self, kind: ModuleKind) -> BTreeSet<ModuleKind> {
        let mut seen = BTreeSet::new();
        let mut frontier = vec![kind];
        while let Some(next) = frontier.pop() {
            for dependent in self.dependents(next) {
                if seen.insert(dependent) {
                    frontier.push(dependent);
                }
            }
        }
        seen
    }

    /// Groups of mutually independent modules, in dependency order.
    pub fn waves(&self) -> &[Vec<ModuleKind>] {
        &self.waves
    }

    /// A flat topological order (dependencies first).
    pub fn order(&self) -> Vec<ModuleKind> {
        self.waves.iter().flatten().copied().collect()
    }

    /// The topological order reversed (dependents first), used for teardown.
    pub fn reverse_order(&self) -> Vec<ModuleKind> {
        let mut order = self.order();
        order.reverse();
        order
    }
}

fn sort_waves(
    dependencies: &BTreeMap<ModuleKind, Vec<ModuleKind>>,
) -> EngineResult<Vec<Vec<ModuleKind>>> {
    let mut in_degree: BTreeMap<ModuleKind, usize> = dependencies
        .iter()
        .map(|(module, deps)| (*module, deps.len()))
        .collect();
    let mut placed = 0;
    let mut waves = Vec::new();

    while placed < dependencies.len() {
        let wave: Vec<ModuleKind> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(module, _)| *module)
            .collect();

        if wave.is_empty() {
            let stuck: Vec<String> = in_degree.keys().map(ToString::to_string).collect();
            let module = in_degree.keys().next().copied().unwrap_or(ModuleKind::Network);
            return Err(EngineError::Dependency {
                module,
                reason: format!("dependency cycle among [{}]", stuck.join(", ")),
            });
        }

        for module in &wave {
            in_degree.remove(module);
        }
        for (module, degree) in in_degree.iter_mut() {
            let satisfied = dependencies[module]
                .iter()
                .filter(|d| wave.contains(d))
                .count();
            *degree -= satisfied;
        }

        placed += wave.len();
        waves.push(wave);
    }

    Ok(waves)
}
