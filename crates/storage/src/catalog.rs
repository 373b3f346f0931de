//! View catalog seam and dependency readiness.

use std::collections::HashSet;

use engine_core::StorageId;

/// What the catalog knows about a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogEntry {
    Table,
    /// A materialized view and whether its target table is available.
    MaterializedView { target_attached: bool },
}

/// Read access to the table dependency graph.
pub trait ViewCatalog: Send + Sync {
    /// Views reading from `id`.
    fn dependencies(&self, id: &StorageId) -> Vec<StorageId>;

    fn table(&self, id: &StorageId) -> Option<CatalogEntry>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyCheck {
    Ready,
    /// The dependency is missing or its target table is not attached.
    NotReady(StorageId),
    /// The dependency graph loops back through this table.
    Cycle(StorageId),
}

impl DependencyCheck {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Checks that every direct and nested dependency of `root` is attached.
///
/// Walks the graph depth first with an explicit stack. Tables shared by
/// several paths are visited once; reaching a table that is still on the
/// current path reports a cycle.
pub fn check_dependencies(catalog: &dyn ViewCatalog, root: &StorageId) -> DependencyCheck {
    let mut on_path: HashSet<StorageId> = HashSet::from([root.clone()]);
    let mut done: HashSet<StorageId> = HashSet::new();
    let mut stack = vec![(root.clone(), catalog.dependencies(root), 0usize)];

    while let Some((_, dependencies, next)) = stack.last_mut() {
        let Some(dependency) = dependencies.get(*next).cloned() else {
            if let Some((id, _, _)) = stack.pop() {
                on_path.remove(&id);
                done.insert(id);
            }
            continue;
        };
        *next += 1;

        if on_path.contains(&dependency) {
            return DependencyCheck::Cycle(dependency);
        }
        if done.contains(&dependency) {
            continue;
        }

        match catalog.table(&dependency) {
            None
            | Some(CatalogEntry::MaterializedView {
                target_attached: false,
            }) => return DependencyCheck::NotReady(dependency),
            Some(_) => {}
        }

        let nested = catalog.dependencies(&dependency);
        on_path.insert(dependency.clone());
        stack.push((dependency, nested, 0));
    }

    DependencyCheck::Ready
}
