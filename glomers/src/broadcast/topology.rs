use std::collections::HashMap;

use smallvec::SmallVec;

use crate::NodeId;

pub type Neighbors = SmallVec<[NodeId; 4]>;

/// Who forwards to whom.
///
/// Fixed once configured; readers always observe a complete snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Topology {
    neighbors: HashMap<NodeId, Neighbors>,
}

impl Topology {
    /// Adopts a topology as announced by a `topology` message.
    pub fn from_map(map: HashMap<NodeId, Vec<NodeId>>) -> Self {
        Self {
            neighbors: map
                .into_iter()
                .map(|(node, neighbors)| (node, neighbors.into_iter().collect()))
                .collect(),
        }
    }

    /// Builds a spanning tree over `nodes` in which each node has at most
    /// `fanout` children.
    ///
    /// Nodes are laid out as in a heap: `nodes[0]` is the root and the
    /// children of `nodes[i]` are `nodes[fanout * i + 1 ..= fanout * i + fanout]`.
    /// Edges point from parent to child only.
    pub fn tree(nodes: &[NodeId], fanout: usize) -> Self {
        assert!(fanout > 0);

        let neighbors = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| {
                let first = fanout * i + 1;
                let children = nodes
                    .iter()
                    .skip(first)
                    .take(fanout)
                    .cloned()
                    .collect();

                (node.clone(), children)
            })
            .collect();

        Self { neighbors }
    }

    pub fn neighbors_of(&self, node: &NodeId) -> &[NodeId] {
        self.neighbors
            .get(node)
            .map(|n| n.as_slice())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.neighbors.len()
    }
}
