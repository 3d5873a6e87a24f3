//! The virtual machine
//!
//! A table-driven interpreter over the opcode enumeration: one handler arm
//! per opcode, a frame of registers plus a frame-local iterator arena per
//! function activation. Instructions execute to completion; there is no
//! instruction-level suspension. Blocking happens only inside collaborator
//! calls (scans, mutations) and is opaque to the program.
//!
//! Iterator-typed registers hold an integer handle into the frame's
//! iterator arena; the verifier's type information keeps those registers
//! from mixing with data registers.

use std::cmp::Ordering as CmpOrdering;

use tracing::debug;

use crate::error::{ForgeError, ForgeResult, RuntimeFault};
use crate::runtime::state::{QueryState, StateSlot};
use crate::runtime::value::{self, Value};
use crate::runtime::{AggregationHashTable, ExecutionContext, JoinHashTable, Sorter};
use crate::storage::{Batch, IndexCursor, TableCursor};
use crate::vm::bytecodes::Bytecode;
use crate::vm::program::{Constant, FunctionId, Instr, Operand, Program};

/// An execution backend for compiled programs.
///
/// Contract: all backends produce identical observable results (emitted
/// rows, status code, runtime faults) for identical input rows. The
/// interpreter below is the reference implementation; an ahead-of-time
/// native backend plugs in here.
pub trait Backend: Send + Sync {
    fn run(&self, program: &Program, ctx: &ExecutionContext) -> ForgeResult<i32>;
}

/// Reference interpreter backend.
pub struct VmBackend;

impl Backend for VmBackend {
    fn run(&self, program: &Program, ctx: &ExecutionContext) -> ForgeResult<i32> {
        let state = QueryState::new(program.state.len());
        let vm = Vm {
            program,
            ctx,
            state: &state,
        };
        debug!(query_id = program.query_id, "executing program");
        match vm.exec(program.main, Vec::new()) {
            Ok(locals) => Ok(match locals.first() {
                Some(Value::Int(status)) => *status as i32,
                _ => 0,
            }),
            Err(fault) => {
                // Resource release is unconditional: run teardown (once)
                // before the fault propagates to the invoking layer.
                if state.mark_torn_down() {
                    let _ = vm.exec(program.teardown, Vec::new());
                }
                Err(fault)
            }
        }
    }
}

/// Execute a compiled program against an execution context.
pub fn run(program: &Program, ctx: &ExecutionContext) -> ForgeResult<i32> {
    VmBackend.run(program, ctx)
}

// ===== Frame-local iterators =====

struct TableIter {
    cursor: Box<dyn TableCursor>,
    batch: Option<Batch>,
    /// Selection vector over the current batch
    sel: Vec<u32>,
    pos: usize,
}

impl TableIter {
    fn new(cursor: Box<dyn TableCursor>) -> Self {
        Self {
            cursor,
            batch: None,
            sel: Vec::new(),
            pos: 0,
        }
    }

    fn next_batch(&mut self, ctx: &ExecutionContext) -> ForgeResult<bool> {
        self.batch = self.cursor.advance(ctx.txn())?;
        if let Some(batch) = &self.batch {
            self.sel = (0..batch.len() as u32).collect();
            self.pos = 0;
            Ok(true)
        } else {
            self.sel.clear();
            self.pos = 0;
            Ok(false)
        }
    }

    fn has_next(&self) -> bool {
        self.pos < self.sel.len()
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn current(&self) -> ForgeResult<usize> {
        self.sel
            .get(self.pos)
            .map(|&i| i as usize)
            .ok_or_else(|| malformed("batch read past the selection vector"))
    }

    fn get(&self, col: usize) -> ForgeResult<Value> {
        let row = self.current()?;
        let batch = self.batch.as_ref().ok_or_else(|| malformed("no current batch"))?;
        batch
            .columns
            .get(col)
            .and_then(|c| c.get(row))
            .cloned()
            .ok_or_else(|| malformed("batch column out of range"))
    }

    fn row_id(&self) -> ForgeResult<u64> {
        let row = self.current()?;
        let batch = self.batch.as_ref().ok_or_else(|| malformed("no current batch"))?;
        batch
            .row_ids
            .get(row)
            .copied()
            .ok_or_else(|| malformed("batch row id out of range"))
    }

    /// Refine the selection vector with a vectorized predicate.
    fn filter(&mut self, col: usize, f: impl Fn(&Value) -> ForgeResult<bool>) -> ForgeResult<()> {
        let Some(batch) = &self.batch else {
            return Ok(());
        };
        let column = batch
            .columns
            .get(col)
            .ok_or_else(|| malformed("filter column out of range"))?;
        let mut kept = Vec::with_capacity(self.sel.len());
        for &i in &self.sel {
            if f(&column[i as usize])? {
                kept.push(i);
            }
        }
        self.sel = kept;
        self.pos = 0;
        Ok(())
    }
}

struct IndexIter {
    cursor: Box<dyn IndexCursor>,
    row: Option<Vec<Value>>,
}

/// Snapshot row iterator shared by aggregation tables, sorters, and join
/// probes. Starts before the first row; `next()` steps and reports.
struct RowsIter {
    rows: Vec<Vec<Value>>,
    pos: Option<usize>,
}

impl RowsIter {
    fn new(rows: Vec<Vec<Value>>) -> Self {
        Self { rows, pos: None }
    }

    fn next(&mut self) -> bool {
        let next = self.pos.map_or(0, |p| p + 1);
        self.pos = Some(next);
        next < self.rows.len()
    }

    fn row(&self) -> ForgeResult<&[Value]> {
        self.pos
            .and_then(|p| self.rows.get(p))
            .map(|r| r.as_slice())
            .ok_or_else(|| malformed("row iterator read without a current row"))
    }
}

enum RuntimeIter {
    Table(TableIter),
    Index(IndexIter),
    Rows(RowsIter),
    Closed,
}

// ===== The interpreter =====

struct Frame {
    locals: Vec<Value>,
    iters: Vec<RuntimeIter>,
}

impl Frame {
    fn get(&self, operand: &Operand) -> ForgeResult<&Value> {
        match operand {
            Operand::Local(l) => self
                .locals
                .get(l.0 as usize)
                .ok_or_else(|| malformed("register out of range")),
            _ => Err(malformed("expected a register operand")),
        }
    }

    fn set(&mut self, operand: &Operand, value: Value) -> ForgeResult<()> {
        match operand {
            Operand::Local(l) => {
                let slot = self
                    .locals
                    .get_mut(l.0 as usize)
                    .ok_or_else(|| malformed("register out of range"))?;
                *slot = value;
                Ok(())
            }
            _ => Err(malformed("expected a register operand")),
        }
    }

    fn range(&self, first: &Operand, len: &Operand) -> ForgeResult<Vec<Value>> {
        let (Operand::Local(first), Operand::Count(len)) = (first, len) else {
            return Err(malformed("expected a register range"));
        };
        let start = first.0 as usize;
        let end = start + *len as usize;
        self.locals
            .get(start..end)
            .map(|s| s.to_vec())
            .ok_or_else(|| malformed("register range out of bounds"))
    }

    fn write_range(&mut self, first: &Operand, len: &Operand, values: &[Value]) -> ForgeResult<()> {
        let (Operand::Local(first), Operand::Count(len)) = (first, len) else {
            return Err(malformed("expected a register range"));
        };
        let start = first.0 as usize;
        let end = start + *len as usize;
        let slots = self
            .locals
            .get_mut(start..end)
            .ok_or_else(|| malformed("register range out of bounds"))?;
        if values.len() != slots.len() {
            return Err(malformed("row width does not match register block"));
        }
        slots.clone_from_slice(values);
        Ok(())
    }

    fn iter_handle(&self, operand: &Operand) -> ForgeResult<usize> {
        self.get(operand)?.as_int("iterator handle").map(|i| i as usize)
    }

    fn push_iter(&mut self, iter: RuntimeIter) -> Value {
        self.iters.push(iter);
        Value::Int((self.iters.len() - 1) as i64)
    }

    fn table_iter(&mut self, operand: &Operand) -> ForgeResult<&mut TableIter> {
        let handle = self.iter_handle(operand)?;
        match self.iters.get_mut(handle) {
            Some(RuntimeIter::Table(iter)) => Ok(iter),
            Some(RuntimeIter::Closed) => Err(malformed("use of a closed iterator")),
            _ => Err(malformed("register does not hold a table iterator")),
        }
    }

    fn index_iter(&mut self, operand: &Operand) -> ForgeResult<&mut IndexIter> {
        let handle = self.iter_handle(operand)?;
        match self.iters.get_mut(handle) {
            Some(RuntimeIter::Index(iter)) => Ok(iter),
            Some(RuntimeIter::Closed) => Err(malformed("use of a closed iterator")),
            _ => Err(malformed("register does not hold an index iterator")),
        }
    }

    fn rows_iter(&mut self, operand: &Operand) -> ForgeResult<&mut RowsIter> {
        let handle = self.iter_handle(operand)?;
        match self.iters.get_mut(handle) {
            Some(RuntimeIter::Rows(iter)) => Ok(iter),
            Some(RuntimeIter::Closed) => Err(malformed("use of a closed iterator")),
            _ => Err(malformed("register does not hold a row iterator")),
        }
    }

    fn close_iter(&mut self, operand: &Operand) -> ForgeResult<()> {
        let handle = self.iter_handle(operand)?;
        match self.iters.get_mut(handle) {
            Some(slot) => {
                *slot = RuntimeIter::Closed;
                Ok(())
            }
            None => Err(malformed("iterator handle out of range")),
        }
    }
}

fn malformed(message: &str) -> ForgeError {
    RuntimeFault::MalformedProgram(message.to_string()).into()
}

struct Vm<'a> {
    program: &'a Program,
    ctx: &'a ExecutionContext,
    state: &'a QueryState,
}

impl Vm<'_> {
    /// Execute one function to completion and return its final register
    /// file. `iters` provides iterator parameters (parallel scan workers).
    fn exec(&self, func_id: FunctionId, iters: Vec<RuntimeIter>) -> ForgeResult<Vec<Value>> {
        let func = self
            .program
            .function(func_id)
            .ok_or_else(|| malformed("call to a missing function"))?;
        let mut frame = Frame {
            locals: vec![Value::Null; func.locals.len()],
            iters,
        };
        // Iterator parameters arrive in arena order; expose their handles
        // through the leading registers.
        for p in 0..func.params {
            frame.locals[p] = Value::Int(p as i64);
        }

        let mut pc = 0usize;
        loop {
            let instr = func
                .code
                .get(pc)
                .ok_or_else(|| malformed("program counter ran past the function body"))?;
            match self.step(instr, &mut frame)? {
                Flow::Next => pc += 1,
                Flow::Jump(target) => pc = target,
                Flow::Return => {
                    if func_id == self.program.teardown {
                        self.state.mark_torn_down();
                    }
                    return Ok(frame.locals);
                }
            }
        }
    }

    /// One dispatch step. Every opcode of the ISA has exactly one arm.
    fn step(&self, instr: &Instr, frame: &mut Frame) -> ForgeResult<Flow> {
        use Bytecode as B;
        let ops = &instr.operands;
        match instr.op {
            // ----- Primitive integer ops (null-rejecting) -----
            B::IntAdd => self.prim_int(frame, ops, "IntAdd", |a, b| Ok(a.wrapping_add(b)))?,
            B::IntSub => self.prim_int(frame, ops, "IntSub", |a, b| Ok(a.wrapping_sub(b)))?,
            B::IntMul => self.prim_int(frame, ops, "IntMul", |a, b| Ok(a.wrapping_mul(b)))?,
            B::IntDiv => self.prim_int(frame, ops, "IntDiv", |a, b| {
                if b == 0 {
                    Err(RuntimeFault::DivisionByZero.into())
                } else {
                    Ok(a.wrapping_div(b))
                }
            })?,
            B::IntRem => self.prim_int(frame, ops, "IntRem", |a, b| {
                if b == 0 {
                    Err(RuntimeFault::DivisionByZero.into())
                } else {
                    Ok(a.wrapping_rem(b))
                }
            })?,
            B::IntNeg => {
                let v = frame.get(&ops[1])?.as_int("IntNeg")?;
                frame.set(&ops[0], Value::Int(v.wrapping_neg()))?;
            }
            B::BitAnd => self.prim_int(frame, ops, "BitAnd", |a, b| Ok(a & b))?,
            B::BitOr => self.prim_int(frame, ops, "BitOr", |a, b| Ok(a | b))?,
            B::BitXor => self.prim_int(frame, ops, "BitXor", |a, b| Ok(a ^ b))?,
            B::BitNot => {
                let v = frame.get(&ops[1])?.as_int("BitNot")?;
                frame.set(&ops[0], Value::Int(!v))?;
            }

            // ----- Primitive float ops -----
            B::RealAdd => self.prim_real(frame, ops, "RealAdd", |a, b| Ok(a + b))?,
            B::RealSub => self.prim_real(frame, ops, "RealSub", |a, b| Ok(a - b))?,
            B::RealMul => self.prim_real(frame, ops, "RealMul", |a, b| Ok(a * b))?,
            B::RealDiv => self.prim_real(frame, ops, "RealDiv", |a, b| {
                if b == 0.0 {
                    Err(RuntimeFault::DivisionByZero.into())
                } else {
                    Ok(a / b)
                }
            })?,
            B::RealNeg => {
                let v = frame.get(&ops[1])?.as_real("RealNeg")?;
                frame.set(&ops[0], Value::Real(-v))?;
            }

            // ----- Primitive comparisons -----
            B::IntEq => self.prim_cmp_int(frame, ops, "IntEq", |o| o == CmpOrdering::Equal)?,
            B::IntNe => self.prim_cmp_int(frame, ops, "IntNe", |o| o != CmpOrdering::Equal)?,
            B::IntLt => self.prim_cmp_int(frame, ops, "IntLt", |o| o == CmpOrdering::Less)?,
            B::IntLe => self.prim_cmp_int(frame, ops, "IntLe", |o| o != CmpOrdering::Greater)?,
            B::IntGt => self.prim_cmp_int(frame, ops, "IntGt", |o| o == CmpOrdering::Greater)?,
            B::IntGe => self.prim_cmp_int(frame, ops, "IntGe", |o| o != CmpOrdering::Less)?,
            B::RealEq => self.prim_cmp_real(frame, ops, "RealEq", |o| o == CmpOrdering::Equal)?,
            B::RealNe => self.prim_cmp_real(frame, ops, "RealNe", |o| o != CmpOrdering::Equal)?,
            B::RealLt => self.prim_cmp_real(frame, ops, "RealLt", |o| o == CmpOrdering::Less)?,
            B::RealLe => self.prim_cmp_real(frame, ops, "RealLe", |o| o != CmpOrdering::Greater)?,
            B::RealGt => self.prim_cmp_real(frame, ops, "RealGt", |o| o == CmpOrdering::Greater)?,
            B::RealGe => self.prim_cmp_real(frame, ops, "RealGe", |o| o != CmpOrdering::Less)?,
            B::StrEq => self.prim_cmp_str(frame, ops, "StrEq", |o| o == CmpOrdering::Equal)?,
            B::StrNe => self.prim_cmp_str(frame, ops, "StrNe", |o| o != CmpOrdering::Equal)?,
            B::StrLt => self.prim_cmp_str(frame, ops, "StrLt", |o| o == CmpOrdering::Less)?,
            B::StrLe => self.prim_cmp_str(frame, ops, "StrLe", |o| o != CmpOrdering::Greater)?,
            B::StrGt => self.prim_cmp_str(frame, ops, "StrGt", |o| o == CmpOrdering::Greater)?,
            B::StrGe => self.prim_cmp_str(frame, ops, "StrGe", |o| o != CmpOrdering::Less)?,
            B::Not => {
                let v = frame.get(&ops[1])?.as_bool("Not")?;
                frame.set(&ops[0], Value::Bool(!v))?;
            }

            // ----- Control flow -----
            B::Jump => {
                let Operand::JumpTarget(t) = ops[0] else {
                    return Err(malformed("Jump without a target"));
                };
                return Ok(Flow::Jump(t as usize));
            }
            B::JumpIfTrue | B::JumpIfFalse => {
                let cond = frame.get(&ops[0])?.as_bool("JumpIf")?;
                let Operand::JumpTarget(t) = ops[1] else {
                    return Err(malformed("conditional jump without a target"));
                };
                let take = if instr.op == B::JumpIfTrue { cond } else { !cond };
                if take {
                    return Ok(Flow::Jump(t as usize));
                }
            }
            B::Call => {
                let Operand::FuncRef(f) = ops[0] else {
                    return Err(malformed("Call without a function"));
                };
                self.exec(f, Vec::new())?;
            }
            B::Return => return Ok(Flow::Return),

            // ----- Register moves -----
            B::Assign => {
                let v = frame.get(&ops[1])?.clone();
                frame.set(&ops[0], v)?;
            }
            B::AssignImmInt => {
                let Operand::Imm(v) = ops[1] else {
                    return Err(malformed("AssignImmInt without an immediate"));
                };
                frame.set(&ops[0], Value::Int(v))?;
            }
            B::AssignImmReal => {
                let Operand::FImm(v) = ops[1] else {
                    return Err(malformed("AssignImmReal without an immediate"));
                };
                frame.set(&ops[0], Value::Real(v))?;
            }
            B::AssignImmBool => {
                let Operand::Imm(v) = ops[1] else {
                    return Err(malformed("AssignImmBool without an immediate"));
                };
                frame.set(&ops[0], Value::Bool(v != 0))?;
            }
            B::AssignNull => frame.set(&ops[0], Value::Null)?,
            B::LoadConstStr => {
                let Operand::ConstRef(c) = ops[1] else {
                    return Err(malformed("LoadConstStr without a constant"));
                };
                match self.program.constant(c) {
                    Some(Constant::Str(s)) => frame.set(&ops[0], Value::Str(s.clone()))?,
                    _ => return Err(malformed("LoadConstStr constant is not a string")),
                }
            }

            // ----- SQL value operations -----
            B::SqlAdd => self.sql_arith(frame, ops, "SqlAdd", |a, b| Ok(a.wrapping_add(b)), |a, b| Ok(a + b))?,
            B::SqlSub => self.sql_arith(frame, ops, "SqlSub", |a, b| Ok(a.wrapping_sub(b)), |a, b| Ok(a - b))?,
            B::SqlMul => self.sql_arith(frame, ops, "SqlMul", |a, b| Ok(a.wrapping_mul(b)), |a, b| Ok(a * b))?,
            B::SqlDiv => self.sql_arith(
                frame,
                ops,
                "SqlDiv",
                |a, b| {
                    if b == 0 {
                        Err(RuntimeFault::DivisionByZero.into())
                    } else {
                        Ok(a.wrapping_div(b))
                    }
                },
                |a, b| {
                    if b == 0.0 {
                        Err(RuntimeFault::DivisionByZero.into())
                    } else {
                        Ok(a / b)
                    }
                },
            )?,
            B::SqlRem => self.sql_arith(
                frame,
                ops,
                "SqlRem",
                |a, b| {
                    if b == 0 {
                        Err(RuntimeFault::DivisionByZero.into())
                    } else {
                        Ok(a.wrapping_rem(b))
                    }
                },
                |a, b| {
                    if b == 0.0 {
                        Err(RuntimeFault::DivisionByZero.into())
                    } else {
                        Ok(a % b)
                    }
                },
            )?,
            B::SqlEq => self.sql_cmp(frame, ops, "SqlEq", |o| o == CmpOrdering::Equal)?,
            B::SqlNe => self.sql_cmp(frame, ops, "SqlNe", |o| o != CmpOrdering::Equal)?,
            B::SqlLt => self.sql_cmp(frame, ops, "SqlLt", |o| o == CmpOrdering::Less)?,
            B::SqlLe => self.sql_cmp(frame, ops, "SqlLe", |o| o != CmpOrdering::Greater)?,
            B::SqlGt => self.sql_cmp(frame, ops, "SqlGt", |o| o == CmpOrdering::Greater)?,
            B::SqlGe => self.sql_cmp(frame, ops, "SqlGe", |o| o != CmpOrdering::Less)?,
            B::SqlAnd => {
                let v = value::sql_and(frame.get(&ops[1])?, frame.get(&ops[2])?)?;
                frame.set(&ops[0], v)?;
            }
            B::SqlOr => {
                let v = value::sql_or(frame.get(&ops[1])?, frame.get(&ops[2])?)?;
                frame.set(&ops[0], v)?;
            }
            B::SqlNot => {
                let v = value::sql_not(frame.get(&ops[1])?)?;
                frame.set(&ops[0], v)?;
            }
            B::ValIsNull => {
                let v = frame.get(&ops[1])?.is_null();
                frame.set(&ops[0], Value::Bool(v))?;
            }
            B::ValIsNotNull => {
                let v = !frame.get(&ops[1])?.is_null();
                frame.set(&ops[0], Value::Bool(v))?;
            }
            B::ForceBoolTruth => {
                let v = match frame.get(&ops[1])? {
                    Value::Null => false,
                    Value::Bool(b) => *b,
                    other => {
                        return Err(RuntimeFault::TypeFault {
                            op: "ForceBoolTruth",
                            expected: "Bool",
                            actual: other.type_name().to_string(),
                        }
                        .into());
                    }
                };
                frame.set(&ops[0], Value::Bool(v))?;
            }

            // ----- Hashing -----
            B::Hash => {
                let mut bytes = Vec::new();
                frame.get(&ops[1])?.encode_key(&mut bytes);
                frame.set(&ops[0], Value::Int(hash_bytes(&bytes) as i64))?;
            }
            B::HashCombine => {
                let a = frame.get(&ops[1])?.as_int("HashCombine")? as u64;
                let b = frame.get(&ops[2])?.as_int("HashCombine")? as u64;
                let combined = a ^ (b
                    .wrapping_add(0x9e37_79b9_7f4a_7c15)
                    .wrapping_add(a << 6)
                    .wrapping_add(a >> 2));
                frame.set(&ops[0], Value::Int(combined as i64))?;
            }

            // ----- Table iteration -----
            B::TableIterInit => {
                let Operand::Count(table) = ops[1] else {
                    return Err(malformed("TableIterInit without a table id"));
                };
                let cursor = self.ctx.storage().open_scan(table, &[], self.ctx.txn())?;
                let handle = frame.push_iter(RuntimeIter::Table(TableIter::new(cursor)));
                frame.set(&ops[0], handle)?;
            }
            B::TableIterNextBatch => {
                let has = {
                    let ctx = self.ctx;
                    frame.table_iter(&ops[1])?.next_batch(ctx)?
                };
                frame.set(&ops[0], Value::Bool(has))?;
            }
            B::TableIterClose => frame.close_iter(&ops[0])?,
            B::BatchHasNext => {
                let has = frame.table_iter(&ops[1])?.has_next();
                frame.set(&ops[0], Value::Bool(has))?;
            }
            B::BatchAdvance => frame.table_iter(&ops[0])?.advance(),
            B::BatchGet => {
                let Operand::Count(col) = ops[2] else {
                    return Err(malformed("BatchGet without a column"));
                };
                let v = frame.table_iter(&ops[1])?.get(col as usize)?;
                frame.set(&ops[0], v)?;
            }
            B::BatchGetRowId => {
                let id = frame.table_iter(&ops[1])?.row_id()?;
                frame.set(&ops[0], Value::Int(id as i64))?;
            }
            B::BatchFilterEq => self.batch_filter(frame, ops, |o| o == CmpOrdering::Equal)?,
            B::BatchFilterNe => self.batch_filter(frame, ops, |o| o != CmpOrdering::Equal)?,
            B::BatchFilterLt => self.batch_filter(frame, ops, |o| o == CmpOrdering::Less)?,
            B::BatchFilterLe => self.batch_filter(frame, ops, |o| o != CmpOrdering::Greater)?,
            B::BatchFilterGt => self.batch_filter(frame, ops, |o| o == CmpOrdering::Greater)?,
            B::BatchFilterGe => self.batch_filter(frame, ops, |o| o != CmpOrdering::Less)?,
            B::ParallelScanTable => {
                let Operand::Count(table) = ops[0] else {
                    return Err(malformed("ParallelScanTable without a table id"));
                };
                let Operand::FuncRef(worker) = ops[1] else {
                    return Err(malformed("ParallelScanTable without a worker"));
                };
                let parts = self.ctx.pool().partition_count();
                debug!(table, parts, "parallel scan");
                // Hard barrier: run_partitions returns only after every
                // worker finished.
                self.ctx.pool().run_partitions(parts, &|part| {
                    let cursor = self.ctx.storage().open_scan_partition(
                        table,
                        &[],
                        part,
                        parts,
                        self.ctx.txn(),
                    )?;
                    self.exec(worker, vec![RuntimeIter::Table(TableIter::new(cursor))])?;
                    Ok(())
                })?;
            }

            // ----- Index iteration -----
            B::IndexIterInit => {
                let Operand::Count(index) = ops[1] else {
                    return Err(malformed("IndexIterInit without an index id"));
                };
                let cursor = self.ctx.storage().open_index(index, self.ctx.txn())?;
                let handle = frame.push_iter(RuntimeIter::Index(IndexIter { cursor, row: None }));
                frame.set(&ops[0], handle)?;
            }
            B::IndexIterScanKey => {
                let key = frame.range(&ops[1], &ops[2])?;
                frame.index_iter(&ops[0])?.cursor.scan_key(&key)?;
            }
            B::IndexIterScanAscending | B::IndexIterScanDescending => {
                let low = frame.range(&ops[1], &ops[2])?;
                let high = frame.range(&ops[3], &ops[4])?;
                let Operand::Count(limit) = ops[5] else {
                    return Err(malformed("index range scan without a limit operand"));
                };
                let limit = if limit == 0 { None } else { Some(limit as usize) };
                let iter = frame.index_iter(&ops[0])?;
                if instr.op == B::IndexIterScanAscending {
                    iter.cursor.scan_ascending(&low, &high, limit)?;
                } else {
                    iter.cursor.scan_descending(&low, &high, limit)?;
                }
            }
            B::IndexIterAdvance => {
                let iter = frame.index_iter(&ops[1])?;
                iter.row = iter.cursor.advance()?;
                let has = iter.row.is_some();
                frame.set(&ops[0], Value::Bool(has))?;
            }
            B::IndexIterGet => {
                let Operand::Count(col) = ops[2] else {
                    return Err(malformed("IndexIterGet without a column"));
                };
                let iter = frame.index_iter(&ops[1])?;
                let v = iter
                    .row
                    .as_ref()
                    .and_then(|r| r.get(col as usize))
                    .cloned()
                    .ok_or_else(|| malformed("index read without a current row"))?;
                frame.set(&ops[0], v)?;
            }
            B::IndexIterFree => frame.close_iter(&ops[0])?,

            // ----- Aggregation hash table -----
            B::AggTableInit => {
                let (slot, c) = slot_and_const(ops)?;
                match self.program.constant(c) {
                    Some(Constant::AggSpec(spec)) => self
                        .state
                        .put(slot, StateSlot::AggTable(AggregationHashTable::new(spec.clone())))?,
                    _ => return Err(malformed("AggTableInit constant is not an aggregate spec")),
                }
            }
            B::AggTableUpsert => {
                let slot = state_slot(&ops[0])?;
                let keys = frame.range(&ops[1], &ops[2])?;
                let args = frame.range(&ops[3], &ops[4])?;
                self.state.with_agg_table(slot, |t| t.upsert(&keys, &args))?;
            }
            B::AggTableMergePartitions => {
                let slot = state_slot(&ops[0])?;
                self.state.with_agg_table(slot, |t| {
                    t.merge_partitions();
                    Ok(())
                })?;
            }
            B::AggIterInit => {
                let slot = state_slot(&ops[1])?;
                let rows = self
                    .state
                    .with_agg_table(slot, |t| Ok(t.rows()?.to_vec()))?;
                let handle = frame.push_iter(RuntimeIter::Rows(RowsIter::new(rows)));
                frame.set(&ops[0], handle)?;
            }
            B::AggIterNext | B::SorterIterNext | B::JoinProbeNext => {
                let has = frame.rows_iter(&ops[1])?.next();
                frame.set(&ops[0], Value::Bool(has))?;
            }
            B::AggIterRow | B::SorterIterRow | B::JoinProbeRow => {
                let row = frame.rows_iter(&ops[2])?.row()?.to_vec();
                frame.write_range(&ops[0], &ops[1], &row)?;
            }
            B::AggTableFree | B::JoinTableFree | B::SorterFree => {
                let slot = state_slot(&ops[0])?;
                self.state.free(slot)?;
            }

            // ----- Join hash table -----
            B::JoinTableInit => {
                let slot = state_slot(&ops[0])?;
                self.state.put(slot, StateSlot::JoinTable(JoinHashTable::new()))?;
            }
            B::JoinTableInsert => {
                let slot = state_slot(&ops[0])?;
                let keys = frame.range(&ops[1], &ops[2])?;
                let row = frame.range(&ops[3], &ops[4])?;
                self.state.with_join_table(slot, |t| t.insert(&keys, &row))?;
            }
            B::JoinTableBuild => {
                let slot = state_slot(&ops[0])?;
                self.state.with_join_table(slot, |t| {
                    t.build();
                    Ok(())
                })?;
            }
            B::JoinProbeInit => {
                let slot = state_slot(&ops[1])?;
                let keys = frame.range(&ops[2], &ops[3])?;
                let matches = self.state.with_join_table(slot, |t| t.probe(&keys))?;
                let handle = frame.push_iter(RuntimeIter::Rows(RowsIter::new(matches)));
                frame.set(&ops[0], handle)?;
            }

            // ----- Sorter -----
            B::SorterInit => {
                let (slot, c) = slot_and_const(ops)?;
                match self.program.constant(c) {
                    Some(Constant::SortSpec(spec)) => {
                        self.state.put(slot, StateSlot::Sorter(Sorter::new(spec.clone())))?
                    }
                    _ => return Err(malformed("SorterInit constant is not a sort spec")),
                }
            }
            B::SorterInsert => {
                let slot = state_slot(&ops[0])?;
                let row = frame.range(&ops[1], &ops[2])?;
                self.state.with_sorter(slot, |s| s.insert(row.clone()))?;
            }
            B::SorterSort => {
                let slot = state_slot(&ops[0])?;
                self.state.with_sorter(slot, |s| {
                    s.sort();
                    Ok(())
                })?;
            }
            B::SorterIterInit => {
                let slot = state_slot(&ops[1])?;
                let rows = self.state.with_sorter(slot, |s| Ok(s.rows()?.to_vec()))?;
                let handle = frame.push_iter(RuntimeIter::Rows(RowsIter::new(rows)));
                frame.set(&ops[0], handle)?;
            }

            // ----- Output -----
            B::OutputRow => {
                let row = frame.range(&ops[0], &ops[1])?;
                self.ctx.emit_row(&row)?;
            }
            B::OutputFinalize => self.ctx.finalize_output()?,

            // ----- Mutation -----
            B::TableInsert => {
                let Operand::Count(table) = ops[1] else {
                    return Err(malformed("TableInsert without a table id"));
                };
                let row = frame.range(&ops[2], &ops[3])?;
                let id = self.ctx.storage().insert(self.ctx.txn(), table, &row)?;
                frame.set(&ops[0], Value::Int(id as i64))?;
            }
            B::TableUpdate => {
                let Operand::Count(table) = ops[1] else {
                    return Err(malformed("TableUpdate without a table id"));
                };
                let row_id = frame.get(&ops[2])?.as_int("TableUpdate")? as u64;
                let row = frame.range(&ops[3], &ops[4])?;
                let ok = self.ctx.storage().update(self.ctx.txn(), table, row_id, &row)?;
                frame.set(&ops[0], Value::Bool(ok))?;
            }
            B::TableDelete => {
                let Operand::Count(table) = ops[1] else {
                    return Err(malformed("TableDelete without a table id"));
                };
                let row_id = frame.get(&ops[2])?.as_int("TableDelete")? as u64;
                let ok = self.ctx.storage().delete(self.ctx.txn(), table, row_id)?;
                frame.set(&ops[0], Value::Bool(ok))?;
            }

            // ----- Scalar math builtins (null-propagating) -----
            B::Abs => self.unary(frame, ops, |v| match v {
                Value::Int(i) => Ok(Value::Int(i.wrapping_abs())),
                Value::Real(r) => Ok(Value::Real(r.abs())),
                other => Err(num_fault("Abs", other)),
            })?,
            B::Sqrt => self.unary_real(frame, ops, "Sqrt", f64::sqrt)?,
            B::Ceil => self.unary_real(frame, ops, "Ceil", f64::ceil)?,
            B::Floor => self.unary_real(frame, ops, "Floor", f64::floor)?,
            B::Round => self.unary_real(frame, ops, "Round", f64::round)?,
            B::Exp => self.unary_real(frame, ops, "Exp", f64::exp)?,
            B::Ln => self.unary_real(frame, ops, "Ln", f64::ln)?,
            B::Log2 => self.unary_real(frame, ops, "Log2", f64::log2)?,
            B::Log10 => self.unary_real(frame, ops, "Log10", f64::log10)?,
            B::Sin => self.unary_real(frame, ops, "Sin", f64::sin)?,
            B::Cos => self.unary_real(frame, ops, "Cos", f64::cos)?,
            B::Tan => self.unary_real(frame, ops, "Tan", f64::tan)?,
            B::Pow => {
                let a = frame.get(&ops[1])?.clone();
                let b = frame.get(&ops[2])?.clone();
                let v = if a.is_null() || b.is_null() {
                    Value::Null
                } else {
                    Value::Real(a.as_numeric("Pow")?.powf(b.as_numeric("Pow")?))
                };
                frame.set(&ops[0], v)?;
            }

            // ----- Scalar string builtins (null-propagating) -----
            B::Upper => self.unary_str(frame, ops, "Upper", |s| s.to_uppercase())?,
            B::Lower => self.unary_str(frame, ops, "Lower", |s| s.to_lowercase())?,
            B::StrLength => self.unary(frame, ops, |v| match v {
                Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
                other => Err(str_fault("StrLength", other)),
            })?,
            B::Substring => {
                let src = frame.get(&ops[1])?.clone();
                let start = frame.get(&ops[2])?.clone();
                let len = frame.get(&ops[3])?.clone();
                let v = if src.is_null() || start.is_null() || len.is_null() {
                    Value::Null
                } else {
                    let s = src.as_str("Substring")?;
                    // SQL convention: 1-based start position
                    let start = (start.as_int("Substring")? - 1).max(0) as usize;
                    let len = len.as_int("Substring")?.max(0) as usize;
                    Value::Str(s.chars().skip(start).take(len).collect())
                };
                frame.set(&ops[0], v)?;
            }
            B::Trim => self.unary_str(frame, ops, "Trim", |s| s.trim().to_string())?,
            B::Concat => {
                let a = frame.get(&ops[1])?.clone();
                let b = frame.get(&ops[2])?.clone();
                let v = if a.is_null() || b.is_null() {
                    Value::Null
                } else {
                    Value::Str(format!("{}{}", a.as_str("Concat")?, b.as_str("Concat")?))
                };
                frame.set(&ops[0], v)?;
            }
            B::Repeat => self.str_int(frame, ops, "Repeat", |s, n| {
                s.repeat(n.max(0) as usize)
            })?,
            B::Reverse => self.unary_str(frame, ops, "Reverse", |s| s.chars().rev().collect())?,
            B::StrLeft => self.str_int(frame, ops, "StrLeft", |s, n| {
                s.chars().take(n.max(0) as usize).collect()
            })?,
            B::StrRight => self.str_int(frame, ops, "StrRight", |s, n| {
                let n = n.max(0) as usize;
                let count = s.chars().count();
                s.chars().skip(count.saturating_sub(n)).collect()
            })?,
        }
        Ok(Flow::Next)
    }

    // ----- handler helpers -----

    fn prim_int(
        &self,
        frame: &mut Frame,
        ops: &[Operand],
        name: &'static str,
        f: impl Fn(i64, i64) -> ForgeResult<i64>,
    ) -> ForgeResult<()> {
        let a = frame.get(&ops[1])?.as_int(name)?;
        let b = frame.get(&ops[2])?.as_int(name)?;
        frame.set(&ops[0], Value::Int(f(a, b)?))
    }

    fn prim_real(
        &self,
        frame: &mut Frame,
        ops: &[Operand],
        name: &'static str,
        f: impl Fn(f64, f64) -> ForgeResult<f64>,
    ) -> ForgeResult<()> {
        let a = frame.get(&ops[1])?.as_real(name)?;
        let b = frame.get(&ops[2])?.as_real(name)?;
        frame.set(&ops[0], Value::Real(f(a, b)?))
    }

    fn prim_cmp_int(
        &self,
        frame: &mut Frame,
        ops: &[Operand],
        name: &'static str,
        accept: impl Fn(CmpOrdering) -> bool,
    ) -> ForgeResult<()> {
        let a = frame.get(&ops[1])?.as_int(name)?;
        let b = frame.get(&ops[2])?.as_int(name)?;
        frame.set(&ops[0], Value::Bool(accept(a.cmp(&b))))
    }

    fn prim_cmp_real(
        &self,
        frame: &mut Frame,
        ops: &[Operand],
        name: &'static str,
        accept: impl Fn(CmpOrdering) -> bool,
    ) -> ForgeResult<()> {
        let a = frame.get(&ops[1])?.as_real(name)?;
        let b = frame.get(&ops[2])?.as_real(name)?;
        frame.set(&ops[0], Value::Bool(accept(a.total_cmp(&b))))
    }

    fn prim_cmp_str(
        &self,
        frame: &mut Frame,
        ops: &[Operand],
        name: &'static str,
        accept: impl Fn(CmpOrdering) -> bool,
    ) -> ForgeResult<()> {
        let a = frame.get(&ops[1])?.clone();
        let b = frame.get(&ops[2])?.clone();
        let ord = a.as_str(name)?.cmp(b.as_str(name)?);
        frame.set(&ops[0], Value::Bool(accept(ord)))
    }

    fn sql_arith(
        &self,
        frame: &mut Frame,
        ops: &[Operand],
        name: &'static str,
        int_op: fn(i64, i64) -> ForgeResult<i64>,
        real_op: fn(f64, f64) -> ForgeResult<f64>,
    ) -> ForgeResult<()> {
        let a = frame.get(&ops[1])?.clone();
        let b = frame.get(&ops[2])?.clone();
        let v = value::sql_arith(name, &a, &b, int_op, real_op)?;
        frame.set(&ops[0], v)
    }

    fn sql_cmp(
        &self,
        frame: &mut Frame,
        ops: &[Operand],
        name: &'static str,
        accept: fn(CmpOrdering) -> bool,
    ) -> ForgeResult<()> {
        let a = frame.get(&ops[1])?.clone();
        let b = frame.get(&ops[2])?.clone();
        let v = value::sql_compare(name, &a, &b, accept)?;
        frame.set(&ops[0], v)
    }

    fn batch_filter(
        &self,
        frame: &mut Frame,
        ops: &[Operand],
        accept: fn(CmpOrdering) -> bool,
    ) -> ForgeResult<()> {
        let Operand::Count(col) = ops[1] else {
            return Err(malformed("batch filter without a column"));
        };
        let rhs = frame.get(&ops[2])?.clone();
        frame.table_iter(&ops[0])?.filter(col as usize, move |v| {
            // SQL comparison semantics: Null never matches.
            match value::sql_compare("BatchFilter", v, &rhs, accept)? {
                Value::Bool(b) => Ok(b),
                _ => Ok(false),
            }
        })
    }

    fn unary(
        &self,
        frame: &mut Frame,
        ops: &[Operand],
        f: impl Fn(&Value) -> ForgeResult<Value>,
    ) -> ForgeResult<()> {
        let v = frame.get(&ops[1])?.clone();
        let out = if v.is_null() { Value::Null } else { f(&v)? };
        frame.set(&ops[0], out)
    }

    fn unary_real(
        &self,
        frame: &mut Frame,
        ops: &[Operand],
        name: &'static str,
        f: impl Fn(f64) -> f64,
    ) -> ForgeResult<()> {
        self.unary(frame, ops, |v| Ok(Value::Real(f(v.as_numeric(name)?))))
    }

    fn unary_str(
        &self,
        frame: &mut Frame,
        ops: &[Operand],
        name: &'static str,
        f: impl Fn(&str) -> String,
    ) -> ForgeResult<()> {
        self.unary(frame, ops, |v| Ok(Value::Str(f(v.as_str(name)?))))
    }

    fn str_int(
        &self,
        frame: &mut Frame,
        ops: &[Operand],
        name: &'static str,
        f: impl Fn(&str, i64) -> String,
    ) -> ForgeResult<()> {
        let a = frame.get(&ops[1])?.clone();
        let b = frame.get(&ops[2])?.clone();
        let v = if a.is_null() || b.is_null() {
            Value::Null
        } else {
            Value::Str(f(a.as_str(name)?, b.as_int(name)?))
        };
        frame.set(&ops[0], v)
    }
}

enum Flow {
    Next,
    Jump(usize),
    Return,
}

fn state_slot(operand: &Operand) -> ForgeResult<usize> {
    match operand {
        Operand::StateSlot(s) => Ok(*s as usize),
        _ => Err(malformed("expected a state slot operand")),
    }
}

fn slot_and_const(ops: &[Operand]) -> ForgeResult<(usize, crate::vm::program::ConstId)> {
    let slot = state_slot(&ops[0])?;
    match ops[1] {
        Operand::ConstRef(c) => Ok((slot, c)),
        _ => Err(malformed("expected a constant operand")),
    }
}

fn num_fault(op: &'static str, v: &Value) -> ForgeError {
    RuntimeFault::TypeFault {
        op,
        expected: "Int or Real",
        actual: v.type_name().to_string(),
    }
    .into()
}

fn str_fault(op: &'static str, v: &Value) -> ForgeError {
    RuntimeFault::TypeFault {
        op,
        expected: "Str",
        actual: v.type_name().to_string(),
    }
    .into()
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    use std::hash::{BuildHasher, Hasher};
    // Fixed seeds keep hashes stable within a process run.
    let mut hasher = ahash::RandomState::with_seeds(0x51ab, 0x9e37, 0x7f4a, 0xc15f).build_hasher();
    hasher.write(bytes);
    hasher.finish()
}
