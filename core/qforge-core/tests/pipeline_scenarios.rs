//! End-to-end compile-and-run scenarios against the in-memory storage
//! engine: pipeline decomposition, breaker ordering, joins, sorting,
//! limits, mutations, and parallel execution.

use std::sync::Arc;

use qforge_core::compiler::compile;
use qforge_core::error::{ForgeError, RuntimeFault};
use qforge_core::plan::{
    AggregateExpr, AggregateFunction, BinaryOperator, Column, Expr, IndexScanSpec, PlanNode,
    Schema, SortKey, SqlType,
};
use qforge_core::runtime::{CollectingSink, ExecutionContext, Value};
use qforge_core::storage::{MemStorage, MemTransactionManager, TransactionManager, TxnHandle};
use qforge_core::vm::{ParallelizationPolicy, run};

fn int_schema(names: &[&str]) -> Schema {
    Schema::new(names.iter().map(|n| Column::new(*n, SqlType::Int)).collect())
}

fn scan(table: u32, schema: &Schema) -> PlanNode {
    PlanNode::SeqScan {
        table,
        schema: schema.clone(),
        predicate: None,
        parallel: false,
    }
}

fn txn() -> TxnHandle {
    MemTransactionManager::new().begin().unwrap()
}

fn run_collect(
    plan: &PlanNode,
    output: &Schema,
    storage: Arc<MemStorage>,
) -> Vec<Vec<Value>> {
    let program = compile(plan, Some(output)).unwrap();
    let (sink, rows) = CollectingSink::new();
    let ctx = ExecutionContext::new(storage, txn(), Box::new(sink));
    assert_eq!(run(&program, &ctx).unwrap(), 0);
    let collected = rows.lock().clone();
    collected
}

fn ints(values: &[i64]) -> Vec<Vec<Value>> {
    values.iter().map(|&v| vec![Value::Int(v)]).collect()
}

// ----- Scenario: simple scan + filter -----

#[test]
fn scan_filter_emits_matching_rows_in_scan_order() {
    let storage = Arc::new(MemStorage::new());
    let schema = int_schema(&["v"]);
    storage.create_table(1, schema.clone());
    storage.load(1, ints(&[1, 2, 3, 4, 5])).unwrap();

    let plan = PlanNode::SeqScan {
        table: 1,
        schema: schema.clone(),
        predicate: Some(Expr::binary(
            Expr::col(0),
            BinaryOperator::Lt,
            Expr::lit(Value::Int(4)),
        )),
        parallel: false,
    };
    let program = compile(&plan, Some(&schema)).unwrap();
    // Single pipeline: no breaker anywhere.
    assert_eq!(program.pipelines.len(), 1);

    let rows = run_collect(&plan, &schema, storage);
    assert_eq!(rows, ints(&[1, 2, 3]));
}

#[test]
fn filter_spans_batches_and_mixed_conjuncts() {
    // Batch size 2 forces the two-level scan loop; the second conjunct is
    // not a column/literal shape so it runs as a residual guard.
    let storage = Arc::new(MemStorage::with_batch_size(2));
    let schema = int_schema(&["v"]);
    storage.create_table(1, schema.clone());
    storage.load(1, ints(&[5, 1, 4, 2, 6, 3])).unwrap();

    let residual = Expr::binary(
        Expr::binary(Expr::col(0), BinaryOperator::Plus, Expr::lit(Value::Int(1))),
        BinaryOperator::Gt,
        Expr::lit(Value::Int(2)),
    );
    let plan = PlanNode::SeqScan {
        table: 1,
        schema: schema.clone(),
        predicate: Some(Expr::binary(
            Expr::binary(Expr::col(0), BinaryOperator::Lt, Expr::lit(Value::Int(5))),
            BinaryOperator::And,
            residual,
        )),
        parallel: false,
    };
    // v < 5 and v + 1 > 2  =>  {4, 2, 3}, in scan order
    let rows = run_collect(&plan, &schema, storage);
    assert_eq!(rows, ints(&[4, 2, 3]));
}

#[test]
fn null_rows_never_pass_a_comparison_filter() {
    let storage = Arc::new(MemStorage::new());
    let schema = int_schema(&["v"]);
    storage.create_table(1, schema.clone());
    storage
        .load(1, vec![vec![Value::Int(1)], vec![Value::Null], vec![Value::Int(3)]])
        .unwrap();

    let plan = PlanNode::SeqScan {
        table: 1,
        schema: schema.clone(),
        predicate: Some(Expr::binary(
            Expr::col(0),
            BinaryOperator::Lt,
            Expr::lit(Value::Int(10)),
        )),
        parallel: false,
    };
    let rows = run_collect(&plan, &schema, storage);
    assert_eq!(rows, ints(&[1, 3]));
}

// ----- Scenario: aggregation breaker -----

#[test]
fn grouped_sum_builds_then_reads_two_pipelines() {
    let storage = Arc::new(MemStorage::new());
    let schema = Schema::new(vec![
        Column::new("k", SqlType::Str),
        Column::new("v", SqlType::Int),
    ]);
    storage.create_table(1, schema.clone());
    storage
        .load(
            1,
            vec![
                vec![Value::Str("a".into()), Value::Int(1)],
                vec![Value::Str("a".into()), Value::Int(2)],
                vec![Value::Str("b".into()), Value::Int(5)],
            ],
        )
        .unwrap();

    let plan = PlanNode::HashAggregate {
        input: Box::new(scan(1, &schema)),
        group_by: vec![0],
        aggregates: vec![AggregateExpr::new(AggregateFunction::Sum, 1)],
    };
    let out = Schema::new(vec![
        Column::new("k", SqlType::Str),
        Column::new("sum_1", SqlType::Int),
    ]);
    let program = compile(&plan, Some(&out)).unwrap();
    // Build pipeline, then read pipeline.
    assert_eq!(program.pipelines.len(), 2);

    let mut rows = run_collect(&plan, &out, storage);
    rows.sort_by(|a, b| a[0].cmp_sql(&b[0]));
    assert_eq!(
        rows,
        vec![
            vec![Value::Str("a".into()), Value::Int(3)],
            vec![Value::Str("b".into()), Value::Int(5)],
        ]
    );
}

#[test]
fn aggregate_functions_follow_sql_null_semantics() {
    let storage = Arc::new(MemStorage::new());
    let schema = int_schema(&["v"]);
    storage.create_table(1, schema.clone());
    storage
        .load(
            1,
            vec![vec![Value::Int(4)], vec![Value::Null], vec![Value::Int(2)]],
        )
        .unwrap();

    let plan = PlanNode::HashAggregate {
        input: Box::new(scan(1, &schema)),
        group_by: vec![],
        aggregates: vec![
            AggregateExpr::count_star(),
            AggregateExpr::new(AggregateFunction::Count, 0),
            AggregateExpr::new(AggregateFunction::Sum, 0),
            AggregateExpr::new(AggregateFunction::Min, 0),
            AggregateExpr::new(AggregateFunction::Max, 0),
            AggregateExpr::new(AggregateFunction::Avg, 0),
        ],
    };
    let out = plan.output_schema().unwrap();
    let rows = run_collect(&plan, &out, storage);
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0],
        vec![
            Value::Int(3),      // COUNT(*) counts the null row
            Value::Int(2),      // COUNT(v) does not
            Value::Int(6),      // SUM skips nulls
            Value::Int(2),      // MIN
            Value::Int(4),      // MAX
            Value::Real(3.0),   // AVG over non-null inputs
        ]
    );
}

// ----- Scenario: hash join -----

#[test]
fn hash_join_builds_before_probing() {
    let storage = Arc::new(MemStorage::new());
    let schema = int_schema(&["v"]);
    storage.create_table(1, schema.clone());
    storage.create_table(2, schema.clone());
    storage.load(1, ints(&[1, 2, 3])).unwrap();
    storage.load(2, ints(&[2, 3, 4])).unwrap();

    let plan = PlanNode::HashJoin {
        build: Box::new(scan(1, &schema)),
        probe: Box::new(scan(2, &schema)),
        keys: vec![(0, 0)],
    };
    let out = int_schema(&["l", "r"]);
    let program = compile(&plan, Some(&out)).unwrap();
    // Exactly one build pipeline ahead of the probe pipeline.
    assert_eq!(program.pipelines.len(), 2);

    let rows = run_collect(&plan, &out, storage);
    assert_eq!(
        rows,
        vec![
            vec![Value::Int(2), Value::Int(2)],
            vec![Value::Int(3), Value::Int(3)],
        ]
    );
}

#[test]
fn hash_join_emits_every_build_match() {
    let storage = Arc::new(MemStorage::new());
    let build_schema = Schema::new(vec![
        Column::new("k", SqlType::Int),
        Column::new("tag", SqlType::Str),
    ]);
    let probe_schema = int_schema(&["k"]);
    storage.create_table(1, build_schema.clone());
    storage.create_table(2, probe_schema.clone());
    storage
        .load(
            1,
            vec![
                vec![Value::Int(7), Value::Str("x".into())],
                vec![Value::Int(7), Value::Str("y".into())],
            ],
        )
        .unwrap();
    storage.load(2, ints(&[7])).unwrap();

    let plan = PlanNode::HashJoin {
        build: Box::new(scan(1, &build_schema)),
        probe: Box::new(scan(2, &probe_schema)),
        keys: vec![(0, 0)],
    };
    let out = plan.output_schema().unwrap();
    let mut rows = run_collect(&plan, &out, storage);
    rows.sort_by(|a, b| a[1].cmp_sql(&b[1]));
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][1], Value::Str("x".into()));
    assert_eq!(rows[1][1], Value::Str("y".into()));
}

// ----- Scenario: nested-loop join -----

#[test]
fn nested_loop_join_runs_in_one_pipeline() {
    let storage = Arc::new(MemStorage::new());
    let schema = int_schema(&["v"]);
    storage.create_table(1, schema.clone());
    storage.create_table(2, schema.clone());
    storage.load(1, ints(&[1, 2])).unwrap();
    storage.load(2, ints(&[10, 20])).unwrap();

    // Predicate over the combined row: left + right < 22
    let plan = PlanNode::NestedLoopJoin {
        left: Box::new(scan(1, &schema)),
        right: Box::new(scan(2, &schema)),
        predicate: Some(Expr::binary(
            Expr::binary(Expr::col(0), BinaryOperator::Plus, Expr::col(1)),
            BinaryOperator::Lt,
            Expr::lit(Value::Int(22)),
        )),
    };
    let out = int_schema(&["l", "r"]);
    let program = compile(&plan, Some(&out)).unwrap();
    assert_eq!(program.pipelines.len(), 1);

    let rows = run_collect(&plan, &out, storage);
    assert_eq!(
        rows,
        vec![
            vec![Value::Int(1), Value::Int(10)],
            vec![Value::Int(1), Value::Int(20)],
            vec![Value::Int(2), Value::Int(10)],
        ]
    );
}

// ----- Scenario: order-by -----

#[test]
fn order_by_two_keys_breaks_ties_deterministically() {
    let storage = Arc::new(MemStorage::new());
    let schema = int_schema(&["k1", "k2"]);
    storage.create_table(1, schema.clone());
    storage
        .load(
            1,
            vec![
                vec![Value::Int(2), Value::Int(1)],
                vec![Value::Int(1), Value::Int(5)],
                vec![Value::Int(2), Value::Int(9)],
                vec![Value::Int(1), Value::Int(7)],
            ],
        )
        .unwrap();

    let plan = PlanNode::OrderBy {
        input: Box::new(scan(1, &schema)),
        keys: vec![SortKey::asc(0), SortKey::desc(1)],
        limit: None,
    };
    let rows = run_collect(&plan, &schema, storage);
    assert_eq!(
        rows,
        vec![
            vec![Value::Int(1), Value::Int(7)],
            vec![Value::Int(1), Value::Int(5)],
            vec![Value::Int(2), Value::Int(9)],
            vec![Value::Int(2), Value::Int(1)],
        ]
    );
}

#[test]
fn order_by_with_limit_keeps_top_k() {
    let storage = Arc::new(MemStorage::new());
    let schema = int_schema(&["v"]);
    storage.create_table(1, schema.clone());
    storage.load(1, ints(&[9, 3, 7, 1, 5])).unwrap();

    let plan = PlanNode::OrderBy {
        input: Box::new(scan(1, &schema)),
        keys: vec![SortKey::asc(0)],
        limit: Some(2),
    };
    let rows = run_collect(&plan, &schema, storage);
    assert_eq!(rows, ints(&[1, 3]));
}

// ----- Limit / projection -----

#[test]
fn limit_applies_offset_then_count() {
    let storage = Arc::new(MemStorage::new());
    let schema = int_schema(&["v"]);
    storage.create_table(1, schema.clone());
    storage.load(1, ints(&[10, 20, 30, 40, 50])).unwrap();

    let plan = PlanNode::Limit {
        input: Box::new(scan(1, &schema)),
        count: 2,
        offset: 1,
    };
    let rows = run_collect(&plan, &schema, storage);
    assert_eq!(rows, ints(&[20, 30]));
}

#[test]
fn projection_computes_expressions_over_each_row() {
    let storage = Arc::new(MemStorage::new());
    let schema = int_schema(&["v"]);
    storage.create_table(1, schema.clone());
    storage.load(1, ints(&[1, 2, 3])).unwrap();

    let plan = PlanNode::Projection {
        input: Box::new(scan(1, &schema)),
        exprs: vec![
            Expr::col(0),
            Expr::binary(Expr::col(0), BinaryOperator::Multiply, Expr::lit(Value::Int(2))),
        ],
        names: vec![Some("v".into()), Some("double".into())],
    };
    let out = plan.output_schema().unwrap();
    let rows = run_collect(&plan, &out, storage);
    assert_eq!(
        rows,
        vec![
            vec![Value::Int(1), Value::Int(2)],
            vec![Value::Int(2), Value::Int(4)],
            vec![Value::Int(3), Value::Int(6)],
        ]
    );
}

// ----- Index scans -----

#[test]
fn index_point_and_range_scans_feed_the_pipeline() {
    let storage = Arc::new(MemStorage::new());
    let schema = int_schema(&["v"]);
    storage.create_table(1, schema.clone());
    storage.load(1, ints(&[30, 10, 20, 40])).unwrap();
    storage.create_index(9, 1, vec![0]);

    let point = PlanNode::IndexScan {
        index: 9,
        table: 1,
        schema: schema.clone(),
        spec: IndexScanSpec::Key(vec![Expr::lit(Value::Int(20))]),
    };
    assert_eq!(run_collect(&point, &schema, Arc::<MemStorage>::clone(&storage)), ints(&[20]));

    let range = PlanNode::IndexScan {
        index: 9,
        table: 1,
        schema: schema.clone(),
        spec: IndexScanSpec::Descending {
            low: vec![Expr::lit(Value::Int(15))],
            high: vec![Expr::lit(Value::Int(40))],
            limit: Some(2),
        },
    };
    assert_eq!(run_collect(&range, &schema, storage), ints(&[40, 30]));
}

// ----- Mutations -----

#[test]
fn insert_update_delete_round_trip() {
    let storage = Arc::new(MemStorage::new());
    let schema = int_schema(&["v"]);
    storage.create_table(1, schema.clone());

    // INSERT VALUES (1), (2), (3)
    let insert = PlanNode::Insert {
        table: 1,
        schema: schema.clone(),
        rows: vec![
            vec![Expr::lit(Value::Int(1))],
            vec![Expr::lit(Value::Int(2))],
            vec![Expr::lit(Value::Int(3))],
        ],
    };
    let program = compile(&insert, None).unwrap();
    let (sink, _) = CollectingSink::new();
    let ctx = ExecutionContext::new(Arc::<MemStorage>::clone(&storage), txn(), Box::new(sink));
    assert_eq!(run(&program, &ctx).unwrap(), 0);
    assert_eq!(storage.snapshot(1).unwrap(), ints(&[1, 2, 3]));

    // UPDATE SET v = v * 10 WHERE v = 2
    let update = PlanNode::Update {
        table: 1,
        input: Box::new(PlanNode::Filter {
            input: Box::new(scan(1, &schema)),
            predicate: Expr::binary(Expr::col(0), BinaryOperator::Eq, Expr::lit(Value::Int(2))),
        }),
        assignments: vec![(
            0,
            Expr::binary(Expr::col(0), BinaryOperator::Multiply, Expr::lit(Value::Int(10))),
        )],
    };
    let program = compile(&update, None).unwrap();
    let (sink, _) = CollectingSink::new();
    let ctx = ExecutionContext::new(Arc::<MemStorage>::clone(&storage), txn(), Box::new(sink));
    run(&program, &ctx).unwrap();
    assert_eq!(storage.snapshot(1).unwrap(), ints(&[1, 20, 3]));

    // DELETE WHERE v = 1
    let delete = PlanNode::Delete {
        table: 1,
        input: Box::new(PlanNode::Filter {
            input: Box::new(scan(1, &schema)),
            predicate: Expr::binary(Expr::col(0), BinaryOperator::Eq, Expr::lit(Value::Int(1))),
        }),
    };
    let program = compile(&delete, None).unwrap();
    let (sink, _) = CollectingSink::new();
    let ctx = ExecutionContext::new(Arc::<MemStorage>::clone(&storage), txn(), Box::new(sink));
    run(&program, &ctx).unwrap();
    assert_eq!(storage.snapshot(1).unwrap(), ints(&[20, 3]));
}

// ----- Parallel pipelines -----

#[test]
fn parallel_build_pipeline_matches_serial_results() {
    let storage = Arc::new(MemStorage::with_batch_size(16));
    let schema = int_schema(&["k", "v"]);
    storage.create_table(1, schema.clone());
    storage
        .load(
            1,
            (0..500)
                .map(|i| vec![Value::Int(i % 7), Value::Int(i)])
                .collect(),
        )
        .unwrap();

    let plan = PlanNode::HashAggregate {
        input: Box::new(PlanNode::SeqScan {
            table: 1,
            schema: schema.clone(),
            predicate: None,
            parallel: true,
        }),
        group_by: vec![0],
        aggregates: vec![AggregateExpr::new(AggregateFunction::Sum, 1)],
    };
    let out = plan.output_schema().unwrap();
    let program = compile(&plan, Some(&out)).unwrap();

    let collect = |policy: ParallelizationPolicy| {
        let (sink, rows) = CollectingSink::new();
        let ctx = ExecutionContext::with_policy(
            Arc::<MemStorage>::clone(&storage),
            txn(),
            Box::new(sink),
            policy,
        )
        .unwrap();
        run(&program, &ctx).unwrap();
        let mut r = rows.lock().clone();
        r.sort_by(|a, b| a[0].cmp_sql(&b[0]));
        r
    };

    let serial = collect(ParallelizationPolicy::Disabled);
    let parallel = collect(ParallelizationPolicy::Fixed(4));
    assert_eq!(serial.len(), 7);
    assert_eq!(serial, parallel);
}

// ----- Faults -----

#[test]
fn division_by_zero_surfaces_as_a_typed_runtime_fault() {
    let storage = Arc::new(MemStorage::new());
    let schema = int_schema(&["v"]);
    storage.create_table(1, schema.clone());
    storage.load(1, ints(&[1])).unwrap();

    let plan = PlanNode::Projection {
        input: Box::new(scan(1, &schema)),
        exprs: vec![Expr::binary(
            Expr::col(0),
            BinaryOperator::Divide,
            Expr::lit(Value::Int(0)),
        )],
        names: vec![None],
    };
    let out = plan.output_schema().unwrap();
    let program = compile(&plan, Some(&out)).unwrap();
    let (sink, _) = CollectingSink::new();
    let ctx = ExecutionContext::new(storage, txn(), Box::new(sink));
    let err = run(&program, &ctx).unwrap_err();
    assert!(matches!(
        err,
        ForgeError::Runtime(RuntimeFault::DivisionByZero)
    ));
}

#[test]
fn fault_in_a_breaker_pipeline_still_releases_state() {
    // The faulting expression sits below the aggregation, so the build
    // pipeline dies mid-flight; run() must still return the original
    // fault (teardown runs on the error path).
    let storage = Arc::new(MemStorage::new());
    let schema = int_schema(&["v"]);
    storage.create_table(1, schema.clone());
    storage.load(1, ints(&[1, 0])).unwrap();

    let plan = PlanNode::HashAggregate {
        input: Box::new(PlanNode::Projection {
            input: Box::new(scan(1, &schema)),
            exprs: vec![Expr::binary(
                Expr::lit(Value::Int(10)),
                BinaryOperator::Divide,
                Expr::col(0),
            )],
            names: vec![None],
        }),
        group_by: vec![],
        aggregates: vec![AggregateExpr::new(AggregateFunction::Sum, 0)],
    };
    let out = plan.output_schema().unwrap();
    let program = compile(&plan, Some(&out)).unwrap();
    let (sink, rows) = CollectingSink::new();
    let ctx = ExecutionContext::new(storage, txn(), Box::new(sink));
    let err = run(&program, &ctx).unwrap_err();
    assert!(matches!(
        err,
        ForgeError::Runtime(RuntimeFault::DivisionByZero)
    ));
    // Nothing reached the sink: the fault aborted before the read pipeline.
    assert!(rows.lock().is_empty());
}

// ----- Round-trip equivalence -----

#[test]
fn recompiling_the_same_plan_is_behaviorally_equivalent() {
    let storage = Arc::new(MemStorage::new());
    let schema = int_schema(&["v"]);
    storage.create_table(1, schema.clone());
    storage.load(1, ints(&[4, 1, 3, 2])).unwrap();

    let plan = PlanNode::OrderBy {
        input: Box::new(scan(1, &schema)),
        keys: vec![SortKey::asc(0)],
        limit: None,
    };
    let a = run_collect(&plan, &schema, Arc::<MemStorage>::clone(&storage));
    let b = run_collect(&plan, &schema, storage);
    // Internal identifiers differ between compilations; observable rows
    // and their order do not.
    assert_eq!(a, b);
    assert_eq!(a, ints(&[1, 2, 3, 4]));
}
