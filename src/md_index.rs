//! Topological signatures over call graphs and flow graphs.

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

/// Longest-path level of every node, measured from the source nodes. Cycles
/// are contracted to their strongly connected component first; all members of
/// an SCC share a level.
pub fn topological_levels<N, E>(graph: &DiGraph<N, E>) -> Vec<u64> {
    let sccs = tarjan_scc(graph);
    let mut scc_of = vec![0usize; graph.node_count()];
    for (i, scc) in sccs.iter().enumerate() {
        for &node in scc {
            scc_of[node.index()] = i;
        }
    }

    // tarjan_scc yields components in reverse topological order, so walking
    // the list backwards visits sources before their successors.
    let mut scc_level = vec![0u64; sccs.len()];
    for i in (0..sccs.len()).rev() {
        let mut level = 0u64;
        for &node in &sccs[i] {
            for pred in graph.neighbors_directed(node, Direction::Incoming) {
                let p = scc_of[pred.index()];
                if p != i {
                    level = level.max(scc_level[p] + 1);
                }
            }
        }
        scc_level[i] = level;
    }

    (0..graph.node_count())
        .map(|i| scc_level[scc_of[i]])
        .collect()
}

/// MD-index of a directed graph: for every edge (u, v) sum
/// 1 / sqrt(L(u) * out(u) * in(u) * L(v) * out(v) * in(v)), where zero
/// factors count as 1. Two graphs with equal MD-index are with very high
/// probability isomorphic with respect to these features.
///
/// Contributions are summed in value order, which makes the result exactly
/// invariant under node relabeling.
pub fn md_index<N, E>(graph: &DiGraph<N, E>) -> f64 {
    let levels = topological_levels(graph);
    let mut in_degree = vec![0u64; graph.node_count()];
    let mut out_degree = vec![0u64; graph.node_count()];
    for edge in graph.edge_references() {
        out_degree[edge.source().index()] += 1;
        in_degree[edge.target().index()] += 1;
    }

    let factor = |x: u64| if x == 0 { 1.0 } else { x as f64 };
    let weight = |n: usize| factor(levels[n]) * factor(in_degree[n]) * factor(out_degree[n]);

    let mut contributions: Vec<f64> = graph
        .edge_references()
        .map(|edge| {
            let u = edge.source().index();
            let v = edge.target().index();
            1.0 / (weight(u) * weight(v)).sqrt()
        })
        .collect();
    contributions.sort_by(|a, b| a.total_cmp(b));
    contributions.iter().sum()
}

/// MD-index of the one-hop neighborhood of `center`: the subgraph induced by
/// the node itself plus its direct predecessors and successors.
pub fn neighborhood_md_index<N, E>(graph: &DiGraph<N, E>, center: NodeIndex) -> f64 {
    let mut members: Vec<NodeIndex> = graph
        .neighbors_directed(center, Direction::Incoming)
        .chain(graph.neighbors_directed(center, Direction::Outgoing))
        .chain(std::iter::once(center))
        .collect();
    members.sort();
    members.dedup();

    let mut sub: DiGraph<(), ()> = DiGraph::new();
    let mut index_of = vec![None; graph.node_count()];
    for &node in &members {
        index_of[node.index()] = Some(sub.add_node(()));
    }
    for edge in graph.edge_references() {
        if let (Some(u), Some(v)) = (
            index_of[edge.source().index()],
            index_of[edge.target().index()],
        ) {
            sub.add_edge(u, v, ());
        }
    }
    md_index(&sub)
}

/// Non-trivial strongly connected components: size above one, or a single
/// node with a self edge. These are the loops of the graph.
pub fn nontrivial_sccs<N, E>(graph: &DiGraph<N, E>) -> Vec<Vec<NodeIndex>> {
    tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.find_edge(scc[0], scc[0]).is_some())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> DiGraph<(), ()> {
        // a -> b, a -> c, b -> d, c -> d
        let mut g = DiGraph::new();
        let a = g.add_node(());
        let b = g.add_node(());
        let c = g.add_node(());
        let d = g.add_node(());
        g.add_edge(a, b, ());
        g.add_edge(a, c, ());
        g.add_edge(b, d, ());
        g.add_edge(c, d, ());
        g
    }

    #[test]
    fn test_levels_on_dag() {
        let g = diamond();
        assert_eq!(topological_levels(&g), vec![0, 1, 1, 2]);
    }

    #[test]
    fn test_levels_with_cycle() {
        // a -> b -> c -> b (b and c form an SCC), c -> d
        let mut g = DiGraph::new();
        let a = g.add_node(());
        let b = g.add_node(());
        let c = g.add_node(());
        let d = g.add_node(());
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());
        g.add_edge(c, b, ());
        g.add_edge(c, d, ());
        let levels = topological_levels(&g);
        assert_eq!(levels[a.index()], 0);
        assert_eq!(levels[b.index()], levels[c.index()]);
        assert_eq!(levels[b.index()], 1);
        assert_eq!(levels[d.index()], 2);
    }

    #[test]
    fn test_md_index_invariant_under_relabeling() {
        let g = diamond();

        // Same topology, nodes created in a different order.
        let mut h = DiGraph::new();
        let d = h.add_node(());
        let c = h.add_node(());
        let a = h.add_node(());
        let b = h.add_node(());
        h.add_edge(a, b, ());
        h.add_edge(b, d, ());
        h.add_edge(a, c, ());
        h.add_edge(c, d, ());

        assert_eq!(md_index(&g).to_bits(), md_index(&h).to_bits());
    }

    #[test]
    fn test_md_index_changes_with_edges() {
        let g = diamond();
        let mut h = diamond();
        let nodes: Vec<_> = h.node_indices().collect();
        h.add_edge(nodes[0], nodes[3], ());
        assert_ne!(md_index(&g).to_bits(), md_index(&h).to_bits());

        let mut smaller = diamond();
        let edge = smaller.edge_indices().next().unwrap();
        smaller.remove_edge(edge);
        assert_ne!(md_index(&g).to_bits(), md_index(&smaller).to_bits());
    }

    #[test]
    fn test_md_index_empty_graph() {
        let g: DiGraph<(), ()> = DiGraph::new();
        assert_eq!(md_index(&g), 0.0);
    }

    #[test]
    fn test_nontrivial_sccs() {
        let mut g = DiGraph::new();
        let a = g.add_node(());
        let b = g.add_node(());
        let c = g.add_node(());
        g.add_edge(a, b, ());
        g.add_edge(b, a, ());
        g.add_edge(c, c, ());
        let sccs = nontrivial_sccs(&g);
        assert_eq!(sccs.len(), 2);

        let dag = diamond();
        assert!(nontrivial_sccs(&dag).is_empty());
    }
}
