//! Mutation translators
//!
//! Insert, Update, and Delete. Insert is a source: it evaluates literal
//! rows and hands them to the storage collaborator. Update and Delete are
//! pass-through consumers over a scan of the target table; they use the
//! scan's row-id register to address the row being mutated. None of them
//! deliver rows downstream.

use crate::compiler::arena::{NodeId, PlanArena};
use crate::compiler::codegen::CodeGen;
use crate::compiler::expr::compile_expr;
use crate::error::{ForgeError, ForgeResult};
use crate::plan::{Expr, PlanNode, Schema, SqlType};
use crate::runtime::Value;
use crate::storage::TableId;
use crate::vm::bytecodes::Bytecode;
use crate::vm::emitter::FunctionBuilder;
use crate::vm::program::{LocalId, Operand, RegType};

pub struct InsertTranslator {
    node: NodeId,
    table: TableId,
    arity: usize,
    rows: Vec<Vec<Expr>>,
}

impl InsertTranslator {
    pub fn new(arena: &PlanArena, node: NodeId) -> ForgeResult<Self> {
        let PlanNode::Insert { table, schema, rows } = arena.node(node) else {
            return Err(ForgeError::InvalidPlan("expected Insert".to_string()));
        };
        let empty = Schema::default();
        for (i, row) in rows.iter().enumerate() {
            if row.len() != schema.arity() {
                return Err(ForgeError::InvalidPlan(format!(
                    "insert row {i} has {} value(s), table takes {}",
                    row.len(),
                    schema.arity()
                )));
            }
            for (expr, column) in row.iter().zip(&schema.columns) {
                // Bare NULL literals type-check against any column.
                if matches!(expr, Expr::Literal(Value::Null)) {
                    continue;
                }
                let context = format!("insert row {i} of node #{node}");
                let ty = expr.infer_type(&empty, &context)?;
                if ty != column.ty {
                    return Err(ForgeError::TypeMismatch {
                        expected: column.ty.name().to_string(),
                        actual: ty.name().to_string(),
                        context,
                    });
                }
            }
        }
        Ok(Self {
            node,
            table: *table,
            arity: schema.arity(),
            rows: rows.clone(),
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Source role: evaluate and insert every literal row.
    pub fn produce(&self, cg: &CodeGen, fb: &mut FunctionBuilder) -> ForgeResult<()> {
        for row in &self.rows {
            let block = fb.alloc_block(RegType::Val, self.arity);
            for (i, expr) in row.iter().enumerate() {
                let value = compile_expr(cg, fb, expr, &[])?;
                fb.emit(
                    Bytecode::Assign,
                    [
                        Operand::Local(LocalId(block.0 + i as u16)),
                        Operand::Local(value),
                    ],
                );
            }
            let row_id = fb.new_local(RegType::Val);
            fb.emit(
                Bytecode::TableInsert,
                [
                    Operand::Local(row_id),
                    Operand::Count(self.table),
                    Operand::Local(block),
                    Operand::Count(self.arity as u32),
                ],
            );
        }
        Ok(())
    }
}

pub struct UpdateTranslator {
    node: NodeId,
    table: TableId,
    arity: usize,
    assignments: Vec<(usize, Expr)>,
    /// The scan feeding row ids
    source: NodeId,
}

impl UpdateTranslator {
    pub fn new(arena: &PlanArena, node: NodeId) -> ForgeResult<Self> {
        let PlanNode::Update {
            table,
            input,
            assignments,
        } = arena.node(node)
        else {
            return Err(ForgeError::InvalidPlan("expected Update".to_string()));
        };
        let child_schema = input.output_schema()?;
        let source = validate_mutation_source(arena, node, *table)?;
        for (col, expr) in assignments {
            let column = child_schema.column(*col).ok_or(ForgeError::UnknownColumn {
                index: *col,
                context: format!("update assignment of node #{node}"),
            })?;
            if matches!(expr, Expr::Literal(Value::Null)) {
                continue;
            }
            let context = format!("update assignment of node #{node}");
            let ty = expr.infer_type(&child_schema, &context)?;
            let compatible = ty == column.ty
                || (matches!(ty, SqlType::Int | SqlType::Real)
                    && matches!(column.ty, SqlType::Int | SqlType::Real));
            if !compatible {
                return Err(ForgeError::TypeMismatch {
                    expected: column.ty.name().to_string(),
                    actual: ty.name().to_string(),
                    context,
                });
            }
        }
        Ok(Self {
            node,
            table: *table,
            arity: child_schema.arity(),
            assignments: assignments.clone(),
            source,
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn consume(&self, cg: &CodeGen, fb: &mut FunctionBuilder, row: &[LocalId]) -> ForgeResult<()> {
        // Start from the scanned row, overwrite assigned columns.
        let block = fb.alloc_block(RegType::Val, self.arity);
        for (i, reg) in row.iter().enumerate() {
            fb.emit(
                Bytecode::Assign,
                [
                    Operand::Local(LocalId(block.0 + i as u16)),
                    Operand::Local(*reg),
                ],
            );
        }
        for (col, expr) in &self.assignments {
            let value = compile_expr(cg, fb, expr, row)?;
            fb.emit(
                Bytecode::Assign,
                [
                    Operand::Local(LocalId(block.0 + *col as u16)),
                    Operand::Local(value),
                ],
            );
        }
        let row_id = cg.scan_row_id(self.source)?;
        let ok = fb.new_local(RegType::Bool);
        fb.emit(
            Bytecode::TableUpdate,
            [
                Operand::Local(ok),
                Operand::Count(self.table),
                Operand::Local(row_id),
                Operand::Local(block),
                Operand::Count(self.arity as u32),
            ],
        );
        Ok(())
    }
}

pub struct DeleteTranslator {
    node: NodeId,
    table: TableId,
    source: NodeId,
}

impl DeleteTranslator {
    pub fn new(arena: &PlanArena, node: NodeId) -> ForgeResult<Self> {
        let PlanNode::Delete { table, .. } = arena.node(node) else {
            return Err(ForgeError::InvalidPlan("expected Delete".to_string()));
        };
        let source = validate_mutation_source(arena, node, *table)?;
        Ok(Self {
            node,
            table: *table,
            source,
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn consume(&self, cg: &CodeGen, fb: &mut FunctionBuilder, _row: &[LocalId]) -> ForgeResult<()> {
        let row_id = cg.scan_row_id(self.source)?;
        let ok = fb.new_local(RegType::Bool);
        fb.emit(
            Bytecode::TableDelete,
            [
                Operand::Local(ok),
                Operand::Count(self.table),
                Operand::Local(row_id),
            ],
        );
        Ok(())
    }
}

/// Update/Delete must sit above a sequential scan of the table they
/// mutate; the scan supplies the row-id register.
fn validate_mutation_source(arena: &PlanArena, node: NodeId, table: TableId) -> ForgeResult<NodeId> {
    let source = arena.source_of(node);
    match arena.node(source) {
        PlanNode::SeqScan { table: scanned, .. } if *scanned == table => Ok(source),
        _ => Err(ForgeError::InvalidPlan(format!(
            "mutation at node #{node} must consume a sequential scan of table {table}"
        ))),
    }
}
