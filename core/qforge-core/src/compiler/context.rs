//! Compilation context
//!
//! Orchestrates one query compilation, in fixed order: build the
//! translator/pipeline graph from the plan tree, collect declared state
//! into the global record type, emit init, one function per pipeline in
//! execution order, teardown, and main, then run the static verifier over
//! the assembled program. One context compiles exactly one query;
//! generated names carry a per-process query id so concurrent
//! compilations never collide.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::compiler::arena::{NodeId, PlanArena};
use crate::compiler::codegen::CodeGen;
use crate::compiler::pipeline::{Pipeline, PipelineId, execution_order};
use crate::compiler::translators::{OperatorTranslator, OutputTranslator, create_translator};
use crate::error::{ForgeError, ForgeResult};
use crate::plan::{PlanNode, Schema};
use crate::vm::bytecodes::Bytecode;
use crate::vm::emitter::FunctionBuilder;
use crate::vm::program::{
    Function, FunctionId, Operand, Program, RegType, StateField, StateKind, StateLayout,
};
use crate::vm::verifier::verify;

static QUERY_SEQ: AtomicU64 = AtomicU64::new(1);

/// Compile a plan tree into an executable program.
///
/// `output_schema` declares the rows the terminal pipeline delivers to
/// the sink; plans rooted in a mutation operator take no output schema
/// and deliver none.
pub fn compile(plan: &PlanNode, output_schema: Option<&Schema>) -> ForgeResult<Program> {
    let arena = PlanArena::build(plan)?;

    for id in 0..arena.len() {
        if arena.node(id).is_mutator() && id != arena.root() {
            return Err(ForgeError::InvalidPlan(format!(
                "mutation operator at node #{id} must be the plan root"
            )));
        }
    }

    let output = match output_schema {
        Some(schema) => {
            if arena.node(arena.root()).is_mutator() {
                return Err(ForgeError::InvalidPlan(
                    "mutation plans produce no rows; compile them without an output schema"
                        .to_string(),
                ));
            }
            let produced = arena.schema(arena.root());
            if produced.arity() != schema.arity() {
                return Err(ForgeError::TypeMismatch {
                    expected: format!("{} output column(s)", schema.arity()),
                    actual: format!("{} column(s)", produced.arity()),
                    context: "output schema".to_string(),
                });
            }
            for (p, d) in produced.columns.iter().zip(&schema.columns) {
                if p.ty != d.ty {
                    return Err(ForgeError::TypeMismatch {
                        expected: d.ty.name().to_string(),
                        actual: p.ty.name().to_string(),
                        context: format!("output column '{}'", d.name),
                    });
                }
            }
            Some(OutputTranslator::new(schema.arity()))
        }
        None => {
            if !arena.node(arena.root()).is_mutator() {
                return Err(ForgeError::MissingOutputSchema { node: arena.root() });
            }
            None
        }
    };

    let ctx = CompilationContext::build(&arena)?;
    ctx.assemble(output)
}

/// Per-query compilation state: the translator registry and the pipeline
/// list produced by the decomposition pass.
pub struct CompilationContext<'a, 'p> {
    arena: &'a PlanArena<'p>,
    translators: Vec<Option<OperatorTranslator>>,
    pipelines: Vec<Pipeline>,
    query_id: u64,
}

impl<'a, 'p> CompilationContext<'a, 'p> {
    /// Run the pipeline decomposition pass over the whole plan.
    pub fn build(arena: &'a PlanArena<'p>) -> ForgeResult<Self> {
        let mut ctx = Self {
            arena,
            translators: (0..arena.len()).map(|_| None).collect(),
            pipelines: Vec::new(),
            query_id: QUERY_SEQ.fetch_add(1, Ordering::Relaxed),
        };
        let terminal = ctx.new_pipeline();
        ctx.prepare(arena.root(), terminal)?;
        debug!(
            query_id = ctx.query_id,
            pipelines = ctx.pipelines.len(),
            nodes = arena.len(),
            "pipeline decomposition complete"
        );
        Ok(ctx)
    }

    /// The registered translator for a plan node. Total after `build`.
    pub fn translator(&self, node: NodeId) -> Option<&OperatorTranslator> {
        self.translators.get(node).and_then(|t| t.as_ref())
    }

    pub fn pipelines(&self) -> &[Pipeline] {
        &self.pipelines
    }

    pub fn query_id(&self) -> u64 {
        self.query_id
    }

    fn new_pipeline(&mut self) -> PipelineId {
        let id = self.pipelines.len();
        self.pipelines.push(Pipeline::new(id));
        id
    }

    fn register(&mut self, node: NodeId, translator: OperatorTranslator) -> ForgeResult<()> {
        let slot = &mut self.translators[node];
        if slot.is_some() {
            return Err(ForgeError::InvalidPlan(format!(
                "node #{node} was prepared twice"
            )));
        }
        *slot = Some(translator);
        Ok(())
    }

    /// Recursive, operator-kind-dispatched pipeline decomposition.
    ///
    /// Pass-through operators stay in the current pipeline (child first,
    /// then self, so the source lands at index 0). Breakers open a new
    /// pipeline over their input and register themselves in both: last in
    /// the new pipeline (as the materializing consumer) and first-relative
    /// -to-ancestors in the current one (as its source). The hash join's
    /// probe child continues the current pipeline.
    fn prepare(&mut self, node: NodeId, pipeline: PipelineId) -> ForgeResult<()> {
        let children: Vec<NodeId> = self.arena.children(node).to_vec();
        match self.arena.node(node) {
            PlanNode::SeqScan { .. } | PlanNode::IndexScan { .. } | PlanNode::Insert { .. } => {
                let translator = create_translator(self.arena, node, None)?;
                self.register(node, translator)?;
                self.pipelines[pipeline].nodes.push(node);
            }
            PlanNode::Filter { .. }
            | PlanNode::Projection { .. }
            | PlanNode::Limit { .. }
            | PlanNode::Update { .. }
            | PlanNode::Delete { .. } => {
                self.prepare(children[0], pipeline)?;
                let translator = create_translator(self.arena, node, None)?;
                self.register(node, translator)?;
                self.pipelines[pipeline].nodes.push(node);
            }
            PlanNode::HashAggregate { .. } | PlanNode::OrderBy { .. } => {
                let build = self.new_pipeline();
                self.pipelines[pipeline].dependencies.push(build);
                self.prepare(children[0], build)?;
                let translator = create_translator(self.arena, node, Some(build))?;
                self.register(node, translator)?;
                self.pipelines[build].nodes.push(node);
                self.pipelines[pipeline].nodes.push(node);
            }
            PlanNode::HashJoin { .. } => {
                let build = self.new_pipeline();
                self.pipelines[pipeline].dependencies.push(build);
                self.prepare(children[0], build)?;
                let translator = create_translator(self.arena, node, Some(build))?;
                self.register(node, translator)?;
                self.pipelines[build].nodes.push(node);
                self.prepare(children[1], pipeline)?;
                self.pipelines[pipeline].nodes.push(node);
            }
            PlanNode::NestedLoopJoin { .. } => {
                self.prepare(children[0], pipeline)?;
                self.prepare(children[1], pipeline)?;
                let translator = create_translator(self.arena, node, None)?;
                self.register(node, translator)?;
                self.pipelines[pipeline].nodes.push(node);
            }
        }
        Ok(())
    }

    /// Emit the whole program: state record, init, pipeline functions in
    /// execution order, teardown, main; then verify.
    pub fn assemble(mut self, output: Option<OutputTranslator>) -> ForgeResult<Program> {
        // 1. Collect declared state. The record type is never empty.
        let mut layout = StateLayout::default();
        let mut constants = Vec::new();
        for translator in self.translators.iter_mut().flatten() {
            translator.declare_state(&mut layout, &mut constants);
        }
        if layout.is_empty() {
            layout.fields.push(StateField {
                name: "placeholder".to_string(),
                kind: StateKind::Placeholder,
            });
        }

        // Registry totality: exactly one translator per plan node.
        let translators = self
            .translators
            .into_iter()
            .enumerate()
            .map(|(node, t)| {
                t.ok_or_else(|| {
                    ForgeError::InvalidPlan(format!("node #{node} has no registered translator"))
                })
            })
            .collect::<ForgeResult<Vec<_>>>()?;

        // Partition-parallel eligibility: never the terminal pipeline,
        // only behind a scan marked parallel, and only when every member
        // tolerates concurrent workers.
        for pipeline in self.pipelines.iter_mut() {
            pipeline.parallel = pipeline.id != 0
                && pipeline.source().is_some_and(|source| {
                    matches!(&translators[source], OperatorTranslator::SeqScan(scan) if scan.parallel)
                })
                && pipeline.nodes[1..].iter().all(|&n| translators[n].parallel_safe());
        }

        let order = execution_order(&self.pipelines);
        let query_id = self.query_id;
        let cg = CodeGen::new(
            self.arena,
            &translators,
            &self.pipelines,
            output.as_ref(),
            query_id,
            constants,
        );
        let mut functions: Vec<Function> = Vec::new();

        // 2. init: every translator's initialization, into global state.
        let mut fb = FunctionBuilder::new(format!("q{query_id}_init"));
        for translator in &translators {
            translator.init_state(&cg, &mut fb)?;
        }
        fb.emit(Bytecode::Return, []);
        let init = push_function(&mut functions, fb.finish()?);

        // 3. One function per pipeline, in execution order. Each drives
        // produce on its source translator; parallel pipelines split into
        // a dispatching function and a per-partition worker.
        let mut pipeline_fns = Vec::with_capacity(order.len());
        for (pos, &pid) in order.iter().enumerate() {
            let pipeline = &self.pipelines[pid];
            let source = pipeline.source().ok_or_else(|| {
                ForgeError::InvalidPlan(format!("pipeline {pid} has no source translator"))
            })?;
            let mut fb = FunctionBuilder::new(format!("q{query_id}_pipeline{pos}"));
            if pipeline.parallel {
                let OperatorTranslator::SeqScan(scan) = &translators[source] else {
                    return Err(ForgeError::InvalidPlan(format!(
                        "parallel pipeline {pid} is not driven by a table scan"
                    )));
                };
                let mut wfb = FunctionBuilder::new(format!("q{query_id}_pipeline{pos}_worker"));
                let iter = wfb.new_param(RegType::Iter);
                for &n in &pipeline.nodes {
                    translators[n].prepare_pipeline(&cg, &mut wfb, pid)?;
                }
                scan.emit_loop(&cg, &mut wfb, iter)?;
                wfb.emit(Bytecode::Return, []);
                let worker = push_function(&mut functions, wfb.finish()?);
                fb.emit(
                    Bytecode::ParallelScanTable,
                    [Operand::Count(scan.table()), Operand::FuncRef(worker)],
                );
            } else {
                for &n in &pipeline.nodes {
                    translators[n].prepare_pipeline(&cg, &mut fb, pid)?;
                }
                cg.produce(&mut fb, source)?;
            }
            // Post-loop synchronization: merge/build/sort barriers of the
            // breakers this pipeline feeds.
            for &n in &pipeline.nodes {
                translators[n].finish_pipeline(&cg, &mut fb, pid)?;
            }
            if pid == 0 && let Some(out) = &output {
                out.finish(&mut fb);
            }
            fb.emit(Bytecode::Return, []);
            pipeline_fns.push(push_function(&mut functions, fb.finish()?));
        }

        // 4. teardown: inverse of init.
        let mut fb = FunctionBuilder::new(format!("q{query_id}_teardown"));
        for translator in translators.iter().rev() {
            translator.teardown_state(&cg, &mut fb)?;
        }
        fb.emit(Bytecode::Return, []);
        let teardown = push_function(&mut functions, fb.finish()?);

        // 5. main: state alloc is implicit in the backend; call init,
        // every pipeline in order, teardown, status 0.
        let mut fb = FunctionBuilder::new(format!("q{query_id}_main"));
        let status = fb.new_local(RegType::Int);
        fb.emit(Bytecode::Call, [Operand::FuncRef(init)]);
        for f in &pipeline_fns {
            fb.emit(Bytecode::Call, [Operand::FuncRef(*f)]);
        }
        fb.emit(Bytecode::Call, [Operand::FuncRef(teardown)]);
        fb.emit(
            Bytecode::AssignImmInt,
            [Operand::Local(status), Operand::Imm(0)],
        );
        fb.emit(Bytecode::Return, []);
        let main = push_function(&mut functions, fb.finish()?);

        let program = Program {
            functions,
            constants: cg.take_constants(),
            state: layout,
            init,
            pipelines: pipeline_fns,
            teardown,
            main,
            query_id,
        };

        // 6. Static semantic check before any backend sees the program.
        verify(&program)?;
        debug!(
            query_id,
            functions = program.functions.len(),
            "program assembled and verified"
        );
        Ok(program)
    }
}

fn push_function(functions: &mut Vec<Function>, function: Function) -> FunctionId {
    functions.push(function);
    FunctionId((functions.len() - 1) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{AggregateExpr, AggregateFunction, Column, Expr, SqlType};
    use crate::runtime::Value;

    fn int_scan(table: u32) -> PlanNode {
        PlanNode::SeqScan {
            table,
            schema: Schema::new(vec![Column::new("v", SqlType::Int)]),
            predicate: None,
            parallel: false,
        }
    }

    fn int_schema(names: &[&str]) -> Schema {
        Schema::new(names.iter().map(|n| Column::new(*n, SqlType::Int)).collect())
    }

    #[test]
    fn every_node_gets_exactly_one_translator() {
        let plan = PlanNode::Filter {
            input: Box::new(int_scan(1)),
            predicate: Expr::binary(Expr::col(0), crate::plan::BinaryOperator::Lt, Expr::lit(Value::Int(4))),
        };
        let arena = PlanArena::build(&plan).unwrap();
        let ctx = CompilationContext::build(&arena).unwrap();
        for node in 0..arena.len() {
            assert!(ctx.translator(node).is_some(), "node #{node} missing");
        }
        assert_eq!(ctx.pipelines().len(), 1);
        // Source-first ordering: the scan drives the pipeline.
        assert_eq!(ctx.pipelines()[0].source(), Some(1));
    }

    #[test]
    fn aggregate_splits_into_build_and_read_pipelines() {
        let plan = PlanNode::HashAggregate {
            input: Box::new(int_scan(1)),
            group_by: vec![0],
            aggregates: vec![AggregateExpr::new(AggregateFunction::Sum, 0)],
        };
        let arena = PlanArena::build(&plan).unwrap();
        let ctx = CompilationContext::build(&arena).unwrap();
        assert_eq!(ctx.pipelines().len(), 2);
        // Terminal pipeline depends on the build pipeline; execution
        // order runs the build first.
        assert_eq!(ctx.pipelines()[0].dependencies, vec![1]);
        assert_eq!(execution_order(ctx.pipelines()), vec![1, 0]);
        // The breaker appears in both pipelines: consumer-last in the
        // build, source-first in the read.
        assert_eq!(ctx.pipelines()[1].nodes.last(), Some(&0));
        assert_eq!(ctx.pipelines()[0].source(), Some(0));
    }

    #[test]
    fn hash_join_build_side_gets_its_own_pipeline() {
        let plan = PlanNode::HashJoin {
            build: Box::new(int_scan(1)),
            probe: Box::new(int_scan(2)),
            keys: vec![(0, 0)],
        };
        let arena = PlanArena::build(&plan).unwrap();
        let ctx = CompilationContext::build(&arena).unwrap();
        assert_eq!(ctx.pipelines().len(), 2);
        assert_eq!(execution_order(ctx.pipelines()), vec![1, 0]);
        // Probe scan drives the terminal pipeline.
        assert_eq!(ctx.pipelines()[0].source(), Some(2));
        // Build pipeline = build scan then the join's insert half.
        assert_eq!(ctx.pipelines()[1].nodes, vec![1, 0]);
    }

    #[test]
    fn nested_loop_join_stays_in_one_pipeline() {
        let plan = PlanNode::NestedLoopJoin {
            left: Box::new(int_scan(1)),
            right: Box::new(int_scan(2)),
            predicate: None,
        };
        let arena = PlanArena::build(&plan).unwrap();
        let ctx = CompilationContext::build(&arena).unwrap();
        assert_eq!(ctx.pipelines().len(), 1);
        // Left child first, then right, then the join itself.
        assert_eq!(ctx.pipelines()[0].nodes, vec![1, 2, 0]);
    }

    #[test]
    fn compile_rejects_missing_output_schema() {
        let err = compile(&int_scan(1), None).unwrap_err();
        assert!(matches!(err, ForgeError::MissingOutputSchema { node: 0 }));
    }

    #[test]
    fn compile_rejects_mismatched_output_schema() {
        let schema = Schema::new(vec![Column::new("v", SqlType::Str)]);
        let err = compile(&int_scan(1), Some(&schema)).unwrap_err();
        assert!(matches!(err, ForgeError::TypeMismatch { .. }));
    }

    #[test]
    fn compile_rejects_interior_mutators() {
        let plan = PlanNode::Filter {
            input: Box::new(PlanNode::Delete {
                table: 1,
                input: Box::new(int_scan(1)),
            }),
            predicate: Expr::IsNotNull(Box::new(Expr::col(0))),
        };
        assert!(matches!(
            compile(&plan, None),
            Err(ForgeError::InvalidPlan(_))
        ));
    }

    #[test]
    fn compiled_program_carries_the_function_table() {
        let plan = int_scan(1);
        let program = compile(&plan, Some(&int_schema(&["v"]))).unwrap();
        // init + 1 pipeline + teardown + main
        assert_eq!(program.functions.len(), 4);
        assert_eq!(program.pipelines.len(), 1);
        // No declared state: the placeholder keeps the record non-empty.
        assert_eq!(program.state.len(), 1);
        assert_eq!(program.state.fields[0].kind, StateKind::Placeholder);
    }

    #[test]
    fn generated_names_are_scoped_by_query_id() {
        let plan = int_scan(1);
        let a = compile(&plan, Some(&int_schema(&["v"]))).unwrap();
        let b = compile(&plan, Some(&int_schema(&["v"]))).unwrap();
        assert_ne!(a.query_id, b.query_id);
        let name_a = &a.function(a.main).unwrap().name;
        let name_b = &b.function(b.main).unwrap().name;
        assert_ne!(name_a, name_b);
    }
}
