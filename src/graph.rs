//! Instantiation-order graph.
//!
//! An edge `R -> D` means "R must exist before D can be created".
//!
//! # Edge Construction Rules
//!
//! 1. **Dependencies** - `D.dependencies[slot] = R` adds `R -> D`.
//! 2. **Children** - `D.children[slot] = R` adds `R -> D` when R has a class
//!    of its own.
//! 3. **Internal children** - when R has no class it is built by D, so the
//!    edge is reversed to `D -> R`. Anything R requires (other than D or a
//!    sibling built by D) must then exist before D as well, so each such
//!    requirement `Q` also adds `Q -> D`.
//! 4. **Affects** - never produce edges here; see [`crate::affects`].
//!
//! Edges naming undeclared components are kept so the validator can report
//! them.

use crate::error::{ResolveError, ValidationErrors};
use crate::store::DeclarationStore;
use std::collections::{BTreeMap, BTreeSet};

/// Why an edge exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EdgeKind {
    /// Declared in `dependencies`.
    Dependency,
    /// Declared in `children`, child has a class.
    Child,
    /// Owner to its internal child.
    Owner,
    /// Requirement of an internal child carried over to its owner.
    Lifted,
}

/// One instantiation-order edge.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Edge {
    /// Must exist first.
    pub from: String,
    /// Created after `from`.
    pub to: String,
    /// Component whose declaration introduced the edge.
    pub referrer: String,
    pub kind: EdgeKind,
}

/// Directed graph over the components of one store.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeSet<String>,
    edges: BTreeSet<Edge>,
    dependents: BTreeMap<String, BTreeSet<String>>,
    requirements: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Build the graph, rejecting every self reference found.
    pub fn build(store: &DeclarationStore) -> Result<Self, ValidationErrors> {
        let (graph, errors) = Self::build_collecting(store);
        errors.into_result(graph)
    }

    pub(crate) fn build_collecting(store: &DeclarationStore) -> (Self, ValidationErrors) {
        let mut graph = DependencyGraph {
            nodes: store.all_names(),
            ..Default::default()
        };
        let mut errors = ValidationErrors::new();
        let mut self_referencing = BTreeSet::new();

        for decl in store.iter() {
            for (_, target) in decl.requirements() {
                if target == decl.name {
                    self_referencing.insert(decl.name.clone());
                }
            }

            for target in decl.children.values() {
                if target == &decl.name {
                    continue;
                }
                let built_here = store
                    .get(target)
                    .map(|child| child.is_internal() && child.owner.as_deref() == Some(&decl.name))
                    .unwrap_or(false);
                if built_here {
                    graph.add_edge(&decl.name, target, &decl.name, EdgeKind::Owner);
                } else {
                    graph.add_edge(target, &decl.name, &decl.name, EdgeKind::Child);
                }
            }

            for target in decl.dependencies.values() {
                if target == &decl.name {
                    continue;
                }
                graph.add_edge(target, &decl.name, &decl.name, EdgeKind::Dependency);
            }

            // Lift requirements of an internal child onto its owner.
            if let (true, Some(owner)) = (decl.is_internal(), decl.owner.as_deref()) {
                for (_, target) in decl.requirements() {
                    if target == decl.name || target == owner {
                        continue;
                    }
                    let sibling = store
                        .get(target)
                        .map(|t| t.is_internal() && t.owner.as_deref() == Some(owner))
                        .unwrap_or(false);
                    if !sibling {
                        graph.add_edge(target, owner, &decl.name, EdgeKind::Lifted);
                    }
                }
            }
        }

        for name in self_referencing {
            errors.push(ResolveError::SelfDependency(name));
        }
        (graph, errors)
    }

    fn add_edge(&mut self, from: &str, to: &str, referrer: &str, kind: EdgeKind) {
        self.edges.insert(Edge {
            from: from.to_string(),
            to: to.to_string(),
            referrer: referrer.to_string(),
            kind,
        });
        self.dependents
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
        self.requirements
            .entry(to.to_string())
            .or_default()
            .insert(from.to_string());
    }

    /// Declared components, in lexical order.
    pub fn nodes(&self) -> &BTreeSet<String> {
        &self.nodes
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Components that must be created after `name` (out-neighbours).
    pub fn dependents_of(&self, name: &str) -> impl Iterator<Item = &str> {
        self.dependents
            .get(name)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Components that must exist before `name` (in-neighbours).
    pub fn requirements_of(&self, name: &str) -> impl Iterator<Item = &str> {
        self.requirements
            .get(name)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Whether `from` must exist before `to`.
    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        self.dependents
            .get(from)
            .map(|targets| targets.contains(to))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::RawDeclaration;

    fn store(entries: Vec<(&str, RawDeclaration)>) -> DeclarationStore {
        DeclarationStore::load(entries.into_iter().map(|(n, d)| (n.to_string(), d))).unwrap()
    }

    #[test]
    fn test_dependency_and_child_edges() {
        let store = store(vec![
            ("Cam", RawDeclaration::with_class("x.Cam")),
            ("Stage", RawDeclaration::with_class("x.Stage")),
            (
                "Spec",
                RawDeclaration::with_class("x.Spec")
                    .child("detector", "Cam")
                    .dependency("stage", "Stage"),
            ),
        ]);
        let graph = DependencyGraph::build(&store).unwrap();

        assert!(graph.has_edge("Cam", "Spec"));
        assert!(graph.has_edge("Stage", "Spec"));
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(
            graph.requirements_of("Spec").collect::<Vec<_>>(),
            vec!["Cam", "Stage"]
        );
        assert_eq!(graph.dependents_of("Cam").collect::<Vec<_>>(), vec!["Spec"]);
    }

    #[test]
    fn test_internal_child_edges_point_from_owner() {
        let store = store(vec![
            ("Pump", RawDeclaration::with_class("x.Pump")),
            (
                "SEM",
                RawDeclaration::with_class("x.SEM")
                    .inline_child("scanner", RawDeclaration::default())
                    .inline_child(
                        "pressure",
                        RawDeclaration::default()
                            .dependency("pump", "Pump")
                            .dependency("scanner", "SEM.scanner"),
                    ),
            ),
        ]);
        let graph = DependencyGraph::build(&store).unwrap();

        assert!(graph.has_edge("SEM", "SEM.scanner"));
        assert!(graph.has_edge("SEM", "SEM.pressure"));
        assert!(graph.has_edge("Pump", "SEM.pressure"));
        // Lifted: Pump is needed while SEM builds its pressure child.
        assert!(graph.has_edge("Pump", "SEM"));
        // Siblings are not lifted.
        assert!(!graph.has_edge("SEM.scanner", "SEM"));
        assert!(graph
            .edges()
            .any(|e| e.kind == EdgeKind::Lifted && e.referrer == "SEM.pressure"));
    }

    #[test]
    fn test_self_references_are_all_rejected() {
        let store = store(vec![
            ("A", RawDeclaration::with_class("x.A").dependency("me", "A")),
            ("B", RawDeclaration::with_class("x.B").child("me", "B")),
            ("C", RawDeclaration::with_class("x.C")),
        ]);
        let errors = DependencyGraph::build(&store).unwrap_err();
        let names: Vec<_> = errors.iter().flat_map(|e| e.components()).collect();
        assert_eq!(names, vec!["A", "B"]);
        assert!(errors
            .iter()
            .all(|e| matches!(e, ResolveError::SelfDependency(_))));
    }

    #[test]
    fn test_affects_do_not_create_edges() {
        let store = store(vec![
            ("Light", RawDeclaration::with_class("x.Light").affects("Cam")),
            ("Cam", RawDeclaration::with_class("x.Cam")),
        ]);
        let graph = DependencyGraph::build(&store).unwrap();
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_dangling_edges_are_kept() {
        let store = store(vec![(
            "Spec",
            RawDeclaration::with_class("x.Spec").dependency("stage", "Missing"),
        )]);
        let graph = DependencyGraph::build(&store).unwrap();
        assert!(graph.has_edge("Missing", "Spec"));
        assert!(!graph.nodes().contains("Missing"));
    }
}
