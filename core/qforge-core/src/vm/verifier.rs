//! Static program verification
//!
//! Runs over the assembled program before any backend sees it. Errors
//! carry the function name and instruction index. Checks:
//!
//! 1. operand count and kinds match the opcode metadata, and every
//!    reference (register, jump target, function, state slot, constant)
//!    is in bounds;
//! 2. no function body falls off its end: the last instruction is
//!    terminal (`Return` or unconditional `Jump`);
//! 3. every register is written before it is read, on every control path
//!    (forward dataflow over the CFG; parameters are defined at entry);
//! 4. conditional jumps test Bool-typed registers, and structure-typed
//!    constants are referenced by the matching opcodes.

use ahash::AHashSet;

use crate::error::{ForgeError, ForgeResult};
use crate::vm::bytecodes::{Bytecode, OperandKind};
use crate::vm::program::{Constant, Function, Instr, Operand, Program, RegType};

/// Verify the whole program. The first violation aborts compilation.
pub fn verify(program: &Program) -> ForgeResult<()> {
    if program.state.is_empty() {
        return Err(ForgeError::Verify {
            function: "<program>".to_string(),
            pc: 0,
            message: "global state layout is empty".to_string(),
        });
    }
    for id in [program.init, program.teardown, program.main]
        .into_iter()
        .chain(program.pipelines.iter().copied())
    {
        if program.function(id).is_none() {
            return Err(ForgeError::Verify {
                function: "<program>".to_string(),
                pc: 0,
                message: format!("function table references missing function #{}", id.0),
            });
        }
    }
    for func in &program.functions {
        verify_function(program, func)?;
    }
    Ok(())
}

fn err(func: &Function, pc: usize, message: impl Into<String>) -> ForgeError {
    ForgeError::Verify {
        function: func.name.clone(),
        pc,
        message: message.into(),
    }
}

fn verify_function(program: &Program, func: &Function) -> ForgeResult<()> {
    if func.code.is_empty() {
        return Err(err(func, 0, "empty function body"));
    }

    for (pc, instr) in func.code.iter().enumerate() {
        verify_shape(program, func, pc, instr)?;
    }

    // Terminality: control must never fall off the end.
    let last = func.code.last().expect("non-empty body");
    if !last.op.is_terminal() {
        return Err(err(
            func,
            func.code.len() - 1,
            format!("function falls through past '{}'", last.op.name()),
        ));
    }

    verify_def_before_use(func)
}

/// Operand shapes and reference bounds.
fn verify_shape(program: &Program, func: &Function, pc: usize, instr: &Instr) -> ForgeResult<()> {
    let kinds = instr.op.operand_kinds();
    if instr.operands.len() != kinds.len() {
        return Err(err(
            func,
            pc,
            format!(
                "'{}' takes {} operand(s), got {}",
                instr.op.name(),
                kinds.len(),
                instr.operands.len()
            ),
        ));
    }
    for (operand, &kind) in instr.operands.iter().zip(kinds) {
        if !operand.matches(kind) {
            return Err(err(
                func,
                pc,
                format!("'{}' operand kind mismatch: {kind:?}", instr.op.name()),
            ));
        }
    }

    for ((first, len), _) in operand_ranges(instr, AccessKind::Any) {
        // Zero-length blocks reference no register at all.
        let end = first as usize + len as usize;
        if len > 0 && end > func.locals.len() {
            return Err(err(
                func,
                pc,
                format!("register block r{first}+{len} out of range"),
            ));
        }
    }

    for operand in &instr.operands {
        match operand {
            Operand::JumpTarget(target) => {
                if *target as usize >= func.code.len() {
                    return Err(err(func, pc, format!("jump target @{target} out of range")));
                }
            }
            Operand::FuncRef(f) => {
                if program.function(*f).is_none() {
                    return Err(err(func, pc, format!("reference to missing function #{}", f.0)));
                }
            }
            Operand::StateSlot(slot) => {
                if *slot as usize >= program.state.len() {
                    return Err(err(func, pc, format!("state slot {slot} out of range")));
                }
            }
            Operand::ConstRef(c) => {
                let Some(constant) = program.constant(*c) else {
                    return Err(err(func, pc, format!("reference to missing constant #{}", c.0)));
                };
                let ok = match instr.op {
                    Bytecode::AggTableInit => matches!(constant, Constant::AggSpec(_)),
                    Bytecode::SorterInit => matches!(constant, Constant::SortSpec(_)),
                    Bytecode::LoadConstStr => matches!(constant, Constant::Str(_)),
                    _ => true,
                };
                if !ok {
                    return Err(err(
                        func,
                        pc,
                        format!("'{}' references a constant of the wrong kind", instr.op.name()),
                    ));
                }
            }
            _ => {}
        }
    }

    // Conditional jumps must test a Bool register.
    if matches!(instr.op, Bytecode::JumpIfTrue | Bytecode::JumpIfFalse)
        && let Some(Operand::Local(cond)) = instr.operands.first()
        && func.locals.get(cond.0 as usize) != Some(&RegType::Bool)
    {
        return Err(err(func, pc, format!("condition register r{} is not Bool", cond.0)));
    }

    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum AccessKind {
    Read,
    Write,
    Any,
}

/// Register blocks accessed by an instruction, widened to (first, len).
/// Scalar register operands are length-1 blocks; a range operand takes its
/// length from the Count operand that follows it.
fn operand_ranges(instr: &Instr, access: AccessKind) -> Vec<((u16, u32), AccessKind)> {
    let kinds = instr.op.operand_kinds();
    let mut out = Vec::new();
    for (i, (operand, &kind)) in instr.operands.iter().zip(kinds).enumerate() {
        let Operand::Local(local) = operand else {
            continue;
        };
        let (this_access, len) = match kind {
            OperandKind::LocalSrc => (AccessKind::Read, 1),
            OperandKind::LocalDst => (AccessKind::Write, 1),
            OperandKind::LocalRangeSrc | OperandKind::LocalRangeDst => {
                let len = match instr.operands.get(i + 1) {
                    Some(Operand::Count(n)) => *n,
                    _ => 0,
                };
                let a = if kind == OperandKind::LocalRangeSrc {
                    AccessKind::Read
                } else {
                    AccessKind::Write
                };
                (a, len)
            }
            _ => continue,
        };
        if access == AccessKind::Any || access == this_access {
            out.push(((local.0, len), this_access));
        }
    }
    out
}

/// Forward must-be-defined dataflow over the CFG, then a checking pass.
fn verify_def_before_use(func: &Function) -> ForgeResult<()> {
    let code = &func.code;
    let n = code.len();

    // Block boundaries: entry, every jump target, every fall-through
    // successor of a control transfer.
    let mut starts: AHashSet<usize> = AHashSet::new();
    starts.insert(0);
    for (pc, instr) in code.iter().enumerate() {
        for operand in &instr.operands {
            if let Operand::JumpTarget(t) = operand {
                starts.insert(*t as usize);
            }
        }
        if (instr.op.is_jump() || instr.op == Bytecode::Return) && pc + 1 < n {
            starts.insert(pc + 1);
        }
    }
    let mut block_starts: Vec<usize> = starts.into_iter().collect();
    block_starts.sort_unstable();
    let block_of = |pc: usize| block_starts.partition_point(|&s| s <= pc) - 1;
    let block_end = |b: usize| block_starts.get(b + 1).copied().unwrap_or(n);

    let nblocks = block_starts.len();
    let nlocals = func.locals.len();

    // Successor edges per block.
    let mut succs: Vec<Vec<usize>> = vec![Vec::new(); nblocks];
    for (b, &start) in block_starts.iter().enumerate() {
        let end = block_end(b);
        let last = &code[end - 1];
        match last.op {
            Bytecode::Return => {}
            Bytecode::Jump => {
                if let Some(Operand::JumpTarget(t)) = last.operands.first() {
                    succs[b].push(block_of(*t as usize));
                }
            }
            Bytecode::JumpIfTrue | Bytecode::JumpIfFalse => {
                if let Some(Operand::JumpTarget(t)) = last.operands.get(1) {
                    succs[b].push(block_of(*t as usize));
                }
                if end < n {
                    succs[b].push(block_of(end));
                }
            }
            _ => {
                if end < n {
                    succs[b].push(block_of(end));
                }
            }
        }
        // Terminality check guarantees the last block ends in a terminal
        // instruction, so `end == n` without a successor is fine here.
    }

    // Optimistic fixpoint: in[entry] = params, in[b] = ALL elsewhere;
    // intersect over predecessors until stable.
    let all = vec![true; nlocals];
    let mut entry_in = vec![false; nlocals];
    for p in 0..func.params {
        entry_in[p] = true;
    }
    let mut ins: Vec<Vec<bool>> = (0..nblocks)
        .map(|b| if b == 0 { entry_in.clone() } else { all.clone() })
        .collect();

    let block_defs = |b: usize| {
        let mut defs: Vec<u16> = Vec::new();
        for instr in &code[block_starts[b]..block_end(b)] {
            for ((first, len), _) in operand_ranges(instr, AccessKind::Write) {
                for r in first..first + len as u16 {
                    defs.push(r);
                }
            }
        }
        defs
    };

    let mut changed = true;
    while changed {
        changed = false;
        for b in 0..nblocks {
            let mut out = ins[b].clone();
            for r in block_defs(b) {
                if let Some(slot) = out.get_mut(r as usize) {
                    *slot = true;
                }
            }
            for &s in &succs[b] {
                let next: Vec<bool> = ins[s].iter().zip(&out).map(|(a, b)| *a && *b).collect();
                if next != ins[s] {
                    ins[s] = next;
                    changed = true;
                }
            }
        }
    }

    // Checking pass: simulate each block from its stable in-set.
    for (b, &start) in block_starts.iter().enumerate() {
        let mut defined = ins[b].clone();
        for (pc, instr) in code[start..block_end(b)].iter().enumerate() {
            for ((first, len), _) in operand_ranges(instr, AccessKind::Read) {
                for r in first..first + len as u16 {
                    if !defined.get(r as usize).copied().unwrap_or(false) {
                        return Err(err(
                            func,
                            start + pc,
                            format!("register r{r} read before written"),
                        ));
                    }
                }
            }
            for ((first, len), _) in operand_ranges(instr, AccessKind::Write) {
                for r in first..first + len as u16 {
                    if let Some(slot) = defined.get_mut(r as usize) {
                        *slot = true;
                    }
                }
            }
        }
    }
    Ok(())
}
