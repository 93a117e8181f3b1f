use petgraph::algo::is_cyclic_directed;
use petgraph::dot::{Config, Dot};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

use crate::chain::model::ChainView;

/// Dependency graph over chains; edges run from a dependency to its dependent
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
}

impl DependencyGraph {
    pub fn from_views(views: &[ChainView]) -> Self {
        let mut graph = DiGraph::new();
        let mut nodes: HashMap<String, NodeIndex> = HashMap::new();

        let mut node = |graph: &mut DiGraph<String, ()>, id: &str| -> NodeIndex {
            *nodes
                .entry(id.to_string())
                .or_insert_with(|| graph.add_node(id.to_string()))
        };

        for view in views {
            let to = node(&mut graph, &view.chain_id);
            for dep in &view.dependencies {
                let from = node(&mut graph, dep);
                graph.add_edge(from, to, ());
            }
        }
        Self { graph }
    }

    pub fn has_cycle(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    pub fn to_dot(&self) -> String {
        format!("{:?}", Dot::with_config(&self.graph, &[Config::EdgeNoLabel]))
    }
}
