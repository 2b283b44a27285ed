//! Cycle and consistency validation.
//!
//! A single call reports every defect of a model:
//!
//! - **Cycles** - strongly connected components with more than one member.
//!   Members are listed in the order a depth-first walk discovered them.
//! - **Dangling references** - `children`, `dependencies` and `affects`
//!   entries naming undeclared components.
//! - **Shared roles** - two components with the same role, when roles must be
//!   unique.

use crate::affects;
use crate::config::RolePolicy;
use crate::error::{ResolveError, ValidationErrors};
use crate::graph::DependencyGraph;
use crate::store::DeclarationStore;
use petgraph::algo::kosaraju_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Validate `graph` against `store`, collecting every violation.
pub fn validate(
    graph: &DependencyGraph,
    store: &DeclarationStore,
    role_policy: RolePolicy,
) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::new();

    let mut reported = BTreeSet::new();
    for edge in graph.edges() {
        for endpoint in [&edge.from, &edge.to] {
            if !store.contains(endpoint)
                && reported.insert((edge.referrer.as_str(), endpoint.as_str()))
            {
                errors.push(ResolveError::UnresolvedReference {
                    referrer: edge.referrer.clone(),
                    missing: endpoint.clone(),
                });
            }
        }
    }
    errors.extend(affects::unresolved_targets(store));

    for cycle in find_cycles(graph) {
        errors.push(ResolveError::CyclicDependency(cycle));
    }

    if role_policy == RolePolicy::Unique {
        let mut holders: BTreeMap<&str, &str> = BTreeMap::new();
        for decl in store.iter() {
            let Some(role) = decl.role.as_deref() else {
                continue;
            };
            match holders.get(role) {
                Some(first) => errors.push(ResolveError::DuplicateRole {
                    role: role.to_string(),
                    first: first.to_string(),
                    second: decl.name.clone(),
                }),
                None => {
                    holders.insert(role, &decl.name);
                }
            }
        }
    }

    debug!(
        components = store.len(),
        edges = graph.edge_count(),
        errors = errors.len(),
        "Validated model"
    );
    errors.into_result(())
}

/// Every cycle of the graph, as lists of component names in discovery order.
///
/// Nodes are visited in lexical order. Only strongly connected components with
/// more than one member are cycles; self references never reach the graph.
pub fn find_cycles(graph: &DependencyGraph) -> Vec<Vec<String>> {
    let mut g: DiGraph<&str, ()> = DiGraph::with_capacity(graph.nodes().len(), graph.edge_count());
    let indices: HashMap<&str, NodeIndex> = graph
        .nodes()
        .iter()
        .map(|name| (name.as_str(), g.add_node(name.as_str())))
        .collect();
    for edge in graph.edges() {
        if let (Some(&from), Some(&to)) = (
            indices.get(edge.from.as_str()),
            indices.get(edge.to.as_str()),
        ) {
            g.update_edge(from, to, ());
        }
    }

    // Preorder index of every node, roots taken in lexical order.
    let mut discovered: HashMap<NodeIndex, usize> = HashMap::with_capacity(g.node_count());
    let mut dfs = Dfs::empty(&g);
    for root in g.node_indices() {
        if discovered.contains_key(&root) {
            continue;
        }
        dfs.move_to(root);
        while let Some(node) = dfs.next(&g) {
            let next = discovered.len();
            discovered.entry(node).or_insert(next);
        }
    }

    let mut cycles: Vec<Vec<NodeIndex>> = kosaraju_scc(&g)
        .into_iter()
        .filter(|scc| scc.len() > 1)
        .collect();
    for cycle in &mut cycles {
        cycle.sort_by_key(|node| discovered[node]);
    }
    cycles.sort_by_key(|cycle| discovered[&cycle[0]]);

    cycles
        .into_iter()
        .map(|cycle| cycle.into_iter().map(|node| g[node].to_string()).collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::RawDeclaration;

    fn model(entries: Vec<(&str, RawDeclaration)>) -> (DeclarationStore, DependencyGraph) {
        let store =
            DeclarationStore::load(entries.into_iter().map(|(n, d)| (n.to_string(), d))).unwrap();
        let graph = DependencyGraph::build(&store).unwrap();
        (store, graph)
    }

    #[test]
    fn test_two_node_cycle() {
        let (store, graph) = model(vec![
            ("A", RawDeclaration::with_class("x").dependency("x", "B")),
            ("B", RawDeclaration::with_class("x").dependency("x", "A")),
        ]);
        let errors = validate(&graph, &store, RolePolicy::Unique).unwrap_err();

        assert_eq!(errors.len(), 1);
        assert!(matches!(
            errors.iter().next(),
            Some(ResolveError::CyclicDependency(names)) if names == &["A", "B"]
        ));
    }

    #[test]
    fn test_cycle_members_in_discovery_order() {
        // Edges: B -> C -> D -> B, plus A -> B
        let (store, graph) = model(vec![
            ("A", RawDeclaration::with_class("x")),
            ("B", RawDeclaration::with_class("x").dependency("a", "A").dependency("d", "D")),
            ("C", RawDeclaration::with_class("x").dependency("b", "B")),
            ("D", RawDeclaration::with_class("x").dependency("c", "C")),
        ]);
        assert_eq!(find_cycles(&graph), vec![vec!["B", "C", "D"]]);
        assert!(validate(&graph, &store, RolePolicy::Unique).is_err());
    }

    #[test]
    fn test_collects_all_violations() {
        let (store, graph) = model(vec![
            ("A", RawDeclaration::with_class("x").dependency("x", "B")),
            ("B", RawDeclaration::with_class("x").dependency("x", "A")),
            ("Cam", RawDeclaration::with_class("x").role("ccd").dependency("s", "Stage")),
            ("Cam2", RawDeclaration::with_class("x").role("ccd")),
            ("Light", RawDeclaration::with_class("x").affects("PMT1")),
            ("OK", RawDeclaration::with_class("x")),
        ]);
        let errors = validate(&graph, &store, RolePolicy::Unique).unwrap_err();
        let kinds: Vec<_> = errors
            .iter()
            .map(|e| match e {
                ResolveError::UnresolvedReference { referrer, missing } => {
                    format!("unresolved {}->{}", referrer, missing)
                }
                ResolveError::CyclicDependency(names) => format!("cycle {}", names.join(",")),
                ResolveError::DuplicateRole { role, .. } => format!("role {}", role),
                other => other.to_string(),
            })
            .collect();

        assert_eq!(
            kinds,
            vec![
                "unresolved Cam->Stage",
                "unresolved Light->PMT1",
                "cycle A,B",
                "role ccd",
            ]
        );
    }

    #[test]
    fn test_unresolved_child_reference() {
        let (store, graph) = model(vec![
            ("Spec", RawDeclaration::with_class("x").child("detector", "Missing Cam")),
        ]);
        let errors = validate(&graph, &store, RolePolicy::Unique).unwrap_err();

        assert_eq!(errors.len(), 1);
        assert!(matches!(
            errors.iter().next(),
            Some(ResolveError::UnresolvedReference { referrer, missing })
                if referrer == "Spec" && missing == "Missing Cam"
        ));
    }

    #[test]
    fn test_self_dependency_is_not_a_cycle() {
        let store = DeclarationStore::load(vec![(
            "Stage".to_string(),
            RawDeclaration::with_class("x").dependency("me", "Stage"),
        )])
        .unwrap();
        let (graph, errors) = DependencyGraph::build_collecting(&store);

        assert!(matches!(
            errors.iter().collect::<Vec<_>>().as_slice(),
            [ResolveError::SelfDependency(name)] if name == "Stage"
        ));
        assert!(find_cycles(&graph).is_empty());
        assert!(validate(&graph, &store, RolePolicy::Unique).is_ok());
    }

    #[test]
    fn test_deep_chain_has_no_cycle() {
        // N000001 depends on N000000, N000002 on N000001, and so on.
        let entries = (0..5000).map(|i| {
            let raw = if i == 0 {
                RawDeclaration::with_class("x")
            } else {
                RawDeclaration::with_class("x").dependency("prev", format!("N{:06}", i - 1))
            };
            (format!("N{:06}", i), raw)
        });
        let store = DeclarationStore::load(entries).unwrap();
        let graph = DependencyGraph::build(&store).unwrap();

        assert!(find_cycles(&graph).is_empty());
        assert!(validate(&graph, &store, RolePolicy::Unique).is_ok());
    }

    #[test]
    fn test_shared_roles_allowed_when_configured() {
        let (store, graph) = model(vec![
            ("Cam", RawDeclaration::with_class("x").role("ccd")),
            ("Cam2", RawDeclaration::with_class("x").role("ccd")),
        ]);
        assert!(validate(&graph, &store, RolePolicy::Shared).is_ok());
        assert!(validate(&graph, &store, RolePolicy::Unique).is_err());
    }

    #[test]
    fn test_valid_model() {
        let (store, graph) = model(vec![
            ("Stage", RawDeclaration::with_class("x").role("stage").affects("Cam")),
            ("Cam", RawDeclaration::with_class("x").role("ccd")),
            ("Spec", RawDeclaration::with_class("x").child("d", "Cam").dependency("s", "Stage")),
        ]);
        assert!(validate(&graph, &store, RolePolicy::Unique).is_ok());
        assert!(find_cycles(&graph).is_empty());
    }
}
