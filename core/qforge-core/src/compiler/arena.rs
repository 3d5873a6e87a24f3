//! Plan arena
//!
//! Flattens the external plan tree into an id-indexed arena so the rest of
//! the compiler can reference nodes, parents, and per-node output schemas
//! without chasing boxed children. Node ids are assigned pre-order; the
//! root is always id 0. Building the arena also runs the plan-level type
//! checks (every node's output schema must be derivable).

use crate::error::ForgeResult;
use crate::plan::{PlanNode, Schema};

pub type NodeId = usize;

pub struct PlanArena<'p> {
    nodes: Vec<&'p PlanNode>,
    parents: Vec<Option<(NodeId, usize)>>,
    children: Vec<Vec<NodeId>>,
    schemas: Vec<Schema>,
}

impl<'p> PlanArena<'p> {
    pub fn build(root: &'p PlanNode) -> ForgeResult<Self> {
        let mut arena = PlanArena {
            nodes: Vec::new(),
            parents: Vec::new(),
            children: Vec::new(),
            schemas: Vec::new(),
        };
        arena.add(root, None)?;
        Ok(arena)
    }

    fn add(&mut self, node: &'p PlanNode, parent: Option<(NodeId, usize)>) -> ForgeResult<NodeId> {
        let id = self.nodes.len();
        self.nodes.push(node);
        self.parents.push(parent);
        self.children.push(Vec::new());
        self.schemas.push(node.output_schema()?);
        for (ordinal, child) in node.children().into_iter().enumerate() {
            let child_id = self.add(child, Some((id, ordinal)))?;
            self.children[id].push(child_id);
        }
        Ok(id)
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &'p PlanNode {
        self.nodes[id]
    }

    /// Parent node and the child ordinal this node occupies under it.
    pub fn parent(&self, id: NodeId) -> Option<(NodeId, usize)> {
        self.parents[id]
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.children[id]
    }

    pub fn schema(&self, id: NodeId) -> &Schema {
        &self.schemas[id]
    }

    /// The data source feeding this node: descend through first children
    /// until a leaf.
    pub fn source_of(&self, id: NodeId) -> NodeId {
        let mut current = id;
        while let Some(&first) = self.children[current].first() {
            current = first;
        }
        current
    }
}
