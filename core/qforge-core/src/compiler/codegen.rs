//! Shared code-generation state
//!
//! `CodeGen` is the read-only view translators receive while emitting
//! code: the plan arena, the translator registry, the pipelines, and a
//! few interior-mutable scratch tables that carry register assignments
//! across the produce/consume call chain (stashed outer rows for
//! nested-loop joins, scan row-id registers for mutators, limit
//! counters). Constants accumulate here and become the program's pool.

use ahash::AHashMap;
use std::cell::RefCell;

use crate::compiler::arena::{NodeId, PlanArena};
use crate::compiler::pipeline::Pipeline;
use crate::compiler::translators::{OperatorTranslator, OutputTranslator};
use crate::error::{ForgeError, ForgeResult};
use crate::vm::emitter::FunctionBuilder;
use crate::vm::program::{ConstId, Constant, LocalId};

pub struct CodeGen<'a> {
    pub arena: &'a PlanArena<'a>,
    pub translators: &'a [OperatorTranslator],
    pub pipelines: &'a [Pipeline],
    pub output: Option<&'a OutputTranslator>,
    pub query_id: u64,
    constants: RefCell<Vec<Constant>>,
    stashed_rows: RefCell<AHashMap<NodeId, Vec<LocalId>>>,
    scan_row_ids: RefCell<AHashMap<NodeId, LocalId>>,
    limit_counters: RefCell<AHashMap<NodeId, LocalId>>,
}

impl<'a> CodeGen<'a> {
    pub fn new(
        arena: &'a PlanArena<'a>,
        translators: &'a [OperatorTranslator],
        pipelines: &'a [Pipeline],
        output: Option<&'a OutputTranslator>,
        query_id: u64,
        constants: Vec<Constant>,
    ) -> Self {
        Self {
            arena,
            translators,
            pipelines,
            output,
            query_id,
            constants: RefCell::new(constants),
            stashed_rows: RefCell::new(AHashMap::new()),
            scan_row_ids: RefCell::new(AHashMap::new()),
            limit_counters: RefCell::new(AHashMap::new()),
        }
    }

    pub fn translator(&self, node: NodeId) -> &OperatorTranslator {
        &self.translators[node]
    }

    /// Emit `produce` for a node's translator.
    pub fn produce(&self, fb: &mut FunctionBuilder, node: NodeId) -> ForgeResult<()> {
        self.translators[node].produce(self, fb)
    }

    /// Deliver a row upward: dispatch `consume` on the parent translator,
    /// or on the synthesized output translator at the root.
    pub fn consume_parent(
        &self,
        fb: &mut FunctionBuilder,
        from: NodeId,
        row: &[LocalId],
    ) -> ForgeResult<()> {
        match self.arena.parent(from) {
            Some((parent, ordinal)) => self.translators[parent].consume(self, fb, ordinal, row),
            None => match self.output {
                Some(output) => output.consume(fb, row),
                None => Ok(()),
            },
        }
    }

    pub fn add_constant(&self, constant: Constant) -> ConstId {
        let mut pool = self.constants.borrow_mut();
        pool.push(constant);
        ConstId((pool.len() - 1) as u32)
    }

    pub fn take_constants(&self) -> Vec<Constant> {
        self.constants.replace(Vec::new())
    }

    pub fn stash_row(&self, node: NodeId, row: Vec<LocalId>) {
        self.stashed_rows.borrow_mut().insert(node, row);
    }

    pub fn stashed_row(&self, node: NodeId) -> ForgeResult<Vec<LocalId>> {
        self.stashed_rows
            .borrow()
            .get(&node)
            .cloned()
            .ok_or_else(|| internal(node, "no stashed outer row"))
    }

    pub fn set_scan_row_id(&self, node: NodeId, local: LocalId) {
        self.scan_row_ids.borrow_mut().insert(node, local);
    }

    pub fn scan_row_id(&self, node: NodeId) -> ForgeResult<LocalId> {
        self.scan_row_ids
            .borrow()
            .get(&node)
            .copied()
            .ok_or_else(|| internal(node, "no row-id register for source scan"))
    }

    pub fn set_limit_counter(&self, node: NodeId, local: LocalId) {
        self.limit_counters.borrow_mut().insert(node, local);
    }

    pub fn limit_counter(&self, node: NodeId) -> ForgeResult<LocalId> {
        self.limit_counters
            .borrow()
            .get(&node)
            .copied()
            .ok_or_else(|| internal(node, "limit counter was not prepared"))
    }
}

fn internal(node: NodeId, message: &str) -> ForgeError {
    ForgeError::InvalidPlan(format!("codegen invariant broken at node #{node}: {message}"))
}
