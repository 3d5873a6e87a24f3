//! Plan node and schema type definitions
//!
//! `PlanNode` is the closed set of physical operator kinds the compiler
//! understands. Children are boxed; operator parameters are bound (column
//! indices, not names).

use crate::error::{ForgeError, ForgeResult};
use crate::plan::expr::Expr;
use crate::storage::{IndexId, TableId};

/// SQL value types carried by columns and registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Bool,
    Int,
    Real,
    Str,
}

impl SqlType {
    pub fn name(self) -> &'static str {
        match self {
            SqlType::Bool => "Bool",
            SqlType::Int => "Int",
            SqlType::Real => "Real",
            SqlType::Str => "Str",
        }
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub ty: SqlType,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: SqlType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: true,
        }
    }

    pub fn not_null(name: impl Into<String>, ty: SqlType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: false,
        }
    }
}

/// An ordered list of columns.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Schema {
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, idx: usize) -> Option<&Column> {
        self.columns.get(idx)
    }

    /// Concatenation of two schemas (join output shape).
    pub fn join(&self, other: &Schema) -> Schema {
        let mut columns = self.columns.clone();
        columns.extend(other.columns.iter().cloned());
        Schema { columns }
    }
}

/// Aggregate functions supported by the aggregation hash table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    CountStar,
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

/// One aggregate computation: function plus the input column it reads.
/// `CountStar` reads no column.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateExpr {
    pub function: AggregateFunction,
    pub input: Option<usize>,
}

impl AggregateExpr {
    pub fn count_star() -> Self {
        Self {
            function: AggregateFunction::CountStar,
            input: None,
        }
    }

    pub fn new(function: AggregateFunction, input: usize) -> Self {
        Self {
            function,
            input: Some(input),
        }
    }
}

/// One sort key: input column, direction, and null placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub column: usize,
    pub asc: bool,
    pub nulls_first: bool,
}

impl SortKey {
    pub fn asc(column: usize) -> Self {
        Self {
            column,
            asc: true,
            nulls_first: true,
        }
    }

    pub fn desc(column: usize) -> Self {
        Self {
            column,
            asc: false,
            nulls_first: false,
        }
    }
}

/// How an index scan selects its row set.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexScanSpec {
    /// Exact-match lookup on the full key.
    Key(Vec<Expr>),
    /// Ordered range scan, low..=high, ascending.
    Ascending {
        low: Vec<Expr>,
        high: Vec<Expr>,
        limit: Option<usize>,
    },
    /// Ordered range scan, high..=low, descending.
    Descending {
        low: Vec<Expr>,
        high: Vec<Expr>,
        limit: Option<usize>,
    },
}

/// Physical plan operator tree.
///
/// Join convention: for `HashJoin`, child 0 (`build`) is materialized into
/// the hash table and child 1 (`probe`) streams; output rows are build
/// columns followed by probe columns. For `NestedLoopJoin`, the left child
/// drives the outer loop.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanNode {
    /// Sequential table scan with optional pushed-down predicate
    SeqScan {
        table: TableId,
        schema: Schema,
        predicate: Option<Expr>,
        parallel: bool,
    },
    /// Index point/range scan producing full table rows
    IndexScan {
        index: IndexId,
        table: TableId,
        schema: Schema,
        spec: IndexScanSpec,
    },
    /// Row filter
    Filter {
        input: Box<PlanNode>,
        predicate: Expr,
    },
    /// Column selection/computation
    Projection {
        input: Box<PlanNode>,
        exprs: Vec<Expr>,
        names: Vec<Option<String>>,
    },
    /// GROUP BY + aggregates (pipeline breaker)
    HashAggregate {
        input: Box<PlanNode>,
        group_by: Vec<usize>,
        aggregates: Vec<AggregateExpr>,
    },
    /// ORDER BY with optional top-K bound (pipeline breaker)
    OrderBy {
        input: Box<PlanNode>,
        keys: Vec<SortKey>,
        limit: Option<usize>,
    },
    /// Hash join; build side is child 0 (pipeline breaker on the build side)
    HashJoin {
        build: Box<PlanNode>,
        probe: Box<PlanNode>,
        /// (build column, probe column) equality pairs
        keys: Vec<(usize, usize)>,
    },
    /// Nested-loop join; no materialization barrier
    NestedLoopJoin {
        left: Box<PlanNode>,
        right: Box<PlanNode>,
        /// Predicate over the combined (left ++ right) row
        predicate: Option<Expr>,
    },
    /// LIMIT/OFFSET
    Limit {
        input: Box<PlanNode>,
        count: usize,
        offset: usize,
    },
    /// INSERT of literal rows (source operator, produces no output rows)
    Insert {
        table: TableId,
        schema: Schema,
        rows: Vec<Vec<Expr>>,
    },
    /// UPDATE rows delivered by the child (must scan the target table)
    Update {
        table: TableId,
        input: Box<PlanNode>,
        /// (column index, replacement expression over the child row)
        assignments: Vec<(usize, Expr)>,
    },
    /// DELETE rows delivered by the child (must scan the target table)
    Delete { table: TableId, input: Box<PlanNode> },
}

impl PlanNode {
    /// Short kind tag, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            PlanNode::SeqScan { .. } => "SeqScan",
            PlanNode::IndexScan { .. } => "IndexScan",
            PlanNode::Filter { .. } => "Filter",
            PlanNode::Projection { .. } => "Projection",
            PlanNode::HashAggregate { .. } => "HashAggregate",
            PlanNode::OrderBy { .. } => "OrderBy",
            PlanNode::HashJoin { .. } => "HashJoin",
            PlanNode::NestedLoopJoin { .. } => "NestedLoopJoin",
            PlanNode::Limit { .. } => "Limit",
            PlanNode::Insert { .. } => "Insert",
            PlanNode::Update { .. } => "Update",
            PlanNode::Delete { .. } => "Delete",
        }
    }

    /// Children in input order (build/left first).
    pub fn children(&self) -> Vec<&PlanNode> {
        match self {
            PlanNode::SeqScan { .. } | PlanNode::IndexScan { .. } | PlanNode::Insert { .. } => {
                vec![]
            }
            PlanNode::Filter { input, .. }
            | PlanNode::Projection { input, .. }
            | PlanNode::HashAggregate { input, .. }
            | PlanNode::OrderBy { input, .. }
            | PlanNode::Limit { input, .. }
            | PlanNode::Update { input, .. }
            | PlanNode::Delete { input, .. } => vec![input],
            PlanNode::HashJoin { build, probe, .. } => vec![build, probe],
            PlanNode::NestedLoopJoin { left, right, .. } => vec![left, right],
        }
    }

    /// True for operators that fully consume their input before producing
    /// (aggregation, sort) or whose build side does (hash join).
    pub fn is_pipeline_breaker(&self) -> bool {
        matches!(
            self,
            PlanNode::HashAggregate { .. } | PlanNode::OrderBy { .. } | PlanNode::HashJoin { .. }
        )
    }

    /// True for operators that mutate storage and deliver no rows downstream.
    pub fn is_mutator(&self) -> bool {
        matches!(
            self,
            PlanNode::Insert { .. } | PlanNode::Update { .. } | PlanNode::Delete { .. }
        )
    }

    /// Compute the operator's output schema.
    ///
    /// Fails with a compile-time configuration error when an expression or
    /// column reference does not type-check against the input schema.
    pub fn output_schema(&self) -> ForgeResult<Schema> {
        match self {
            PlanNode::SeqScan { schema, .. } | PlanNode::IndexScan { schema, .. } => {
                Ok(schema.clone())
            }
            PlanNode::Filter { input, .. } | PlanNode::Limit { input, .. } => input.output_schema(),
            PlanNode::Projection { input, exprs, names } => {
                let in_schema = input.output_schema()?;
                let mut columns = Vec::with_capacity(exprs.len());
                for (i, expr) in exprs.iter().enumerate() {
                    let ty = expr.infer_type(&in_schema, "projection")?;
                    let name = names
                        .get(i)
                        .cloned()
                        .flatten()
                        .unwrap_or_else(|| format!("col_{i}"));
                    columns.push(Column::new(name, ty));
                }
                Ok(Schema::new(columns))
            }
            PlanNode::HashAggregate {
                input,
                group_by,
                aggregates,
            } => {
                let in_schema = input.output_schema()?;
                let mut columns = Vec::new();
                for &g in group_by {
                    let col = in_schema.column(g).ok_or(ForgeError::UnknownColumn {
                        index: g,
                        context: "aggregate group-by".to_string(),
                    })?;
                    columns.push(col.clone());
                }
                for agg in aggregates {
                    columns.push(Column::new(
                        agg_column_name(agg),
                        agg_result_type(agg, &in_schema)?,
                    ));
                }
                Ok(Schema::new(columns))
            }
            PlanNode::OrderBy { input, keys, .. } => {
                let schema = input.output_schema()?;
                for key in keys {
                    if key.column >= schema.arity() {
                        return Err(ForgeError::UnknownColumn {
                            index: key.column,
                            context: "order-by key".to_string(),
                        });
                    }
                }
                Ok(schema)
            }
            PlanNode::HashJoin { build, probe, keys } => {
                let build_schema = build.output_schema()?;
                let probe_schema = probe.output_schema()?;
                for &(b, p) in keys {
                    let bc = build_schema.column(b).ok_or(ForgeError::UnknownColumn {
                        index: b,
                        context: "hash-join build key".to_string(),
                    })?;
                    let pc = probe_schema.column(p).ok_or(ForgeError::UnknownColumn {
                        index: p,
                        context: "hash-join probe key".to_string(),
                    })?;
                    if bc.ty != pc.ty {
                        return Err(ForgeError::TypeMismatch {
                            expected: bc.ty.name().to_string(),
                            actual: pc.ty.name().to_string(),
                            context: "hash-join key pair".to_string(),
                        });
                    }
                }
                Ok(build_schema.join(&probe_schema))
            }
            PlanNode::NestedLoopJoin { left, right, .. } => {
                Ok(left.output_schema()?.join(&right.output_schema()?))
            }
            PlanNode::Insert { .. } | PlanNode::Update { .. } | PlanNode::Delete { .. } => {
                Ok(Schema::default())
            }
        }
    }
}

fn agg_column_name(agg: &AggregateExpr) -> String {
    let fname = match agg.function {
        AggregateFunction::CountStar => "count_star",
        AggregateFunction::Count => "count",
        AggregateFunction::Sum => "sum",
        AggregateFunction::Min => "min",
        AggregateFunction::Max => "max",
        AggregateFunction::Avg => "avg",
    };
    match agg.input {
        Some(col) => format!("{fname}_{col}"),
        None => fname.to_string(),
    }
}

/// Result type of an aggregate: counts are Int, Avg is Real, the rest
/// follow their input column.
fn agg_result_type(agg: &AggregateExpr, input: &Schema) -> ForgeResult<SqlType> {
    match agg.function {
        AggregateFunction::CountStar | AggregateFunction::Count => Ok(SqlType::Int),
        AggregateFunction::Avg => Ok(SqlType::Real),
        AggregateFunction::Sum | AggregateFunction::Min | AggregateFunction::Max => {
            let col = agg.input.ok_or_else(|| {
                ForgeError::InvalidPlan(format!("{:?} requires an input column", agg.function))
            })?;
            let column = input.column(col).ok_or(ForgeError::UnknownColumn {
                index: col,
                context: "aggregate argument".to_string(),
            })?;
            if agg.function == AggregateFunction::Sum
                && !matches!(column.ty, SqlType::Int | SqlType::Real)
            {
                return Err(ForgeError::TypeMismatch {
                    expected: "Int or Real".to_string(),
                    actual: column.ty.name().to_string(),
                    context: "SUM argument".to_string(),
                });
            }
            Ok(column.ty)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::expr::{BinaryOperator, Expr};
    use crate::runtime::Value;

    fn two_col_schema() -> Schema {
        Schema::new(vec![
            Column::new("id", SqlType::Int),
            Column::new("name", SqlType::Str),
        ])
    }

    #[test]
    fn scan_output_schema_is_table_schema() {
        let scan = PlanNode::SeqScan {
            table: 1,
            schema: two_col_schema(),
            predicate: None,
            parallel: false,
        };
        assert_eq!(scan.output_schema().unwrap(), two_col_schema());
        assert!(scan.children().is_empty());
        assert!(!scan.is_pipeline_breaker());
    }

    #[test]
    fn aggregate_output_schema_groups_then_results() {
        let plan = PlanNode::HashAggregate {
            input: Box::new(PlanNode::SeqScan {
                table: 1,
                schema: two_col_schema(),
                predicate: None,
                parallel: false,
            }),
            group_by: vec![1],
            aggregates: vec![AggregateExpr::new(AggregateFunction::Sum, 0)],
        };
        let schema = plan.output_schema().unwrap();
        assert_eq!(schema.arity(), 2);
        assert_eq!(schema.columns[0].name, "name");
        assert_eq!(schema.columns[1].ty, SqlType::Int);
        assert!(plan.is_pipeline_breaker());
    }

    #[test]
    fn sum_over_string_column_is_rejected() {
        let plan = PlanNode::HashAggregate {
            input: Box::new(PlanNode::SeqScan {
                table: 1,
                schema: two_col_schema(),
                predicate: None,
                parallel: false,
            }),
            group_by: vec![],
            aggregates: vec![AggregateExpr::new(AggregateFunction::Sum, 1)],
        };
        assert!(matches!(
            plan.output_schema(),
            Err(ForgeError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn join_key_type_mismatch_is_rejected() {
        let left = PlanNode::SeqScan {
            table: 1,
            schema: two_col_schema(),
            predicate: None,
            parallel: false,
        };
        let plan = PlanNode::HashJoin {
            build: Box::new(left.clone()),
            probe: Box::new(left),
            keys: vec![(0, 1)],
        };
        assert!(matches!(
            plan.output_schema(),
            Err(ForgeError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn projection_names_fall_back_to_positional() {
        let plan = PlanNode::Projection {
            input: Box::new(PlanNode::SeqScan {
                table: 1,
                schema: two_col_schema(),
                predicate: None,
                parallel: false,
            }),
            exprs: vec![
                Expr::Column(0),
                Expr::BinaryOp {
                    left: Box::new(Expr::Column(0)),
                    op: BinaryOperator::Plus,
                    right: Box::new(Expr::Literal(Value::Int(1))),
                },
            ],
            names: vec![Some("id".to_string()), None],
        };
        let schema = plan.output_schema().unwrap();
        assert_eq!(schema.columns[0].name, "id");
        assert_eq!(schema.columns[1].name, "col_1");
        assert_eq!(schema.columns[1].ty, SqlType::Int);
    }
}
