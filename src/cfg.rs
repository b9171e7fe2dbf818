use anyhow::{Result, bail};

use crate::ir::{BasicBlock, BlockId, Cfg, Edge, EdgeKind};

/// Validated CFG lookup tables shared by the dataflow passes.
pub(crate) struct MethodGraph<'a> {
    cfg: &'a Cfg,
    predecessors: Vec<Vec<Edge>>,
    successors: Vec<Vec<Edge>>,
}

impl<'a> MethodGraph<'a> {
    /// Index a CFG, rejecting graphs the dataflow passes cannot iterate.
    pub(crate) fn new(cfg: &'a Cfg) -> Result<Self> {
        let count = cfg.blocks.len();
        for (index, block) in cfg.blocks.iter().enumerate() {
            if block.id.index() != index {
                bail!("block ids are not dense: {} stored at index {index}", block.id);
            }
        }
        for (name, id) in [("entry", cfg.entry), ("exit", cfg.exit)] {
            if id.index() >= count {
                bail!("{name} block {id} does not exist");
            }
        }

        let mut predecessors = vec![Vec::new(); count];
        let mut successors = vec![Vec::new(); count];
        for edge in &cfg.edges {
            if edge.from.index() >= count || edge.to.index() >= count {
                bail!("edge {} -> {} references an unknown block", edge.from, edge.to);
            }
            if edge.from == cfg.exit {
                bail!("exit block {} has an outgoing edge", cfg.exit);
            }
            successors[edge.from.index()].push(*edge);
            predecessors[edge.to.index()].push(*edge);
        }

        Ok(Self {
            cfg,
            predecessors,
            successors,
        })
    }

    pub(crate) fn cfg(&self) -> &'a Cfg {
        self.cfg
    }

    pub(crate) fn entry(&self) -> BlockId {
        self.cfg.entry
    }

    pub(crate) fn exit(&self) -> BlockId {
        self.cfg.exit
    }

    pub(crate) fn block_count(&self) -> usize {
        self.cfg.blocks.len()
    }

    pub(crate) fn block(&self, id: BlockId) -> &'a BasicBlock {
        &self.cfg.blocks[id.index()]
    }

    pub(crate) fn incoming(&self, id: BlockId) -> &[Edge] {
        &self.predecessors[id.index()]
    }

    pub(crate) fn outgoing(&self, id: BlockId) -> &[Edge] {
        &self.successors[id.index()]
    }

    /// Blocks reachable from the entry, in reverse postorder.
    pub(crate) fn reverse_postorder(&self) -> Vec<BlockId> {
        let mut visited = vec![false; self.block_count()];
        let mut postorder = Vec::with_capacity(self.block_count());
        let mut stack = vec![(self.entry(), 0usize)];
        visited[self.entry().index()] = true;
        while let Some((block, next)) = stack.last_mut() {
            let edges = self.outgoing(*block);
            if let Some(edge) = edges.get(*next) {
                *next += 1;
                if !visited[edge.to.index()] {
                    visited[edge.to.index()] = true;
                    stack.push((edge.to, 0));
                }
                continue;
            }
            postorder.push(*block);
            stack.pop();
        }
        postorder.reverse();
        postorder
    }

    /// Single predecessor reached through a fall-through edge, if unique.
    pub(crate) fn fall_through_predecessor(&self, id: BlockId) -> Option<BlockId> {
        match self.incoming(id) {
            [edge] if edge.kind == EdgeKind::FallThrough => Some(edge.from),
            _ => None,
        }
    }
}
