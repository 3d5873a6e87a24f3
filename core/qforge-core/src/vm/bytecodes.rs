//! The bytecode instruction set
//!
//! The whole ISA is defined once in `for_each_bytecode!` as a table of
//! (opcode, operand-kind list) rows. The enumeration, the operand metadata
//! used by the verifier, the disassembler names, and the dispatch arms in
//! the interpreter are all derived from this single list; adding an opcode
//! means adding one row here and one handler arm in the VM.
//!
//! Operand shape is fixed per opcode and never data-dependent. A
//! `LocalRangeSrc`/`LocalRangeDst` operand names the first register of a
//! contiguous block and is always immediately followed by a `Count`
//! operand carrying the block length.

/// Operand kinds an instruction can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// Register written by the instruction
    LocalDst,
    /// Register read by the instruction
    LocalSrc,
    /// First register of a contiguous written block (length in next Count)
    LocalRangeDst,
    /// First register of a contiguous read block (length in next Count)
    LocalRangeSrc,
    /// Signed 64-bit immediate
    Imm,
    /// 64-bit float immediate
    FImm,
    /// Absolute instruction index within the current function
    JumpTarget,
    /// Function table reference
    FuncRef,
    /// Global state slot index
    StateSlot,
    /// Unsigned count (column index, table id, block length, bound)
    Count,
    /// Constant pool reference
    ConstRef,
}

/// The master list of all bytecodes and their operand shapes.
///
/// Families: primitive ops, control flow, register moves, SQL-value ops,
/// hashing, table and index iteration, the three materialization
/// structures, output, mutation, and scalar builtins.
macro_rules! for_each_bytecode {
    ($m:ident) => {
        $m! {
            // ----- Primitive integer arithmetic/bitwise (null-rejecting) -----
            IntAdd => [LocalDst, LocalSrc, LocalSrc],
            IntSub => [LocalDst, LocalSrc, LocalSrc],
            IntMul => [LocalDst, LocalSrc, LocalSrc],
            IntDiv => [LocalDst, LocalSrc, LocalSrc],
            IntRem => [LocalDst, LocalSrc, LocalSrc],
            IntNeg => [LocalDst, LocalSrc],
            BitAnd => [LocalDst, LocalSrc, LocalSrc],
            BitOr => [LocalDst, LocalSrc, LocalSrc],
            BitXor => [LocalDst, LocalSrc, LocalSrc],
            BitNot => [LocalDst, LocalSrc],
            // ----- Primitive float arithmetic -----
            RealAdd => [LocalDst, LocalSrc, LocalSrc],
            RealSub => [LocalDst, LocalSrc, LocalSrc],
            RealMul => [LocalDst, LocalSrc, LocalSrc],
            RealDiv => [LocalDst, LocalSrc, LocalSrc],
            RealNeg => [LocalDst, LocalSrc],
            // ----- Primitive comparisons (result Bool) -----
            IntEq => [LocalDst, LocalSrc, LocalSrc],
            IntNe => [LocalDst, LocalSrc, LocalSrc],
            IntLt => [LocalDst, LocalSrc, LocalSrc],
            IntLe => [LocalDst, LocalSrc, LocalSrc],
            IntGt => [LocalDst, LocalSrc, LocalSrc],
            IntGe => [LocalDst, LocalSrc, LocalSrc],
            RealEq => [LocalDst, LocalSrc, LocalSrc],
            RealNe => [LocalDst, LocalSrc, LocalSrc],
            RealLt => [LocalDst, LocalSrc, LocalSrc],
            RealLe => [LocalDst, LocalSrc, LocalSrc],
            RealGt => [LocalDst, LocalSrc, LocalSrc],
            RealGe => [LocalDst, LocalSrc, LocalSrc],
            StrEq => [LocalDst, LocalSrc, LocalSrc],
            StrNe => [LocalDst, LocalSrc, LocalSrc],
            StrLt => [LocalDst, LocalSrc, LocalSrc],
            StrLe => [LocalDst, LocalSrc, LocalSrc],
            StrGt => [LocalDst, LocalSrc, LocalSrc],
            StrGe => [LocalDst, LocalSrc, LocalSrc],
            Not => [LocalDst, LocalSrc],
            // ----- Control flow -----
            Jump => [JumpTarget],
            JumpIfTrue => [LocalSrc, JumpTarget],
            JumpIfFalse => [LocalSrc, JumpTarget],
            Call => [FuncRef],
            Return => [],
            // ----- Register moves / immediates -----
            Assign => [LocalDst, LocalSrc],
            AssignImmInt => [LocalDst, Imm],
            AssignImmReal => [LocalDst, FImm],
            AssignImmBool => [LocalDst, Imm],
            AssignNull => [LocalDst],
            LoadConstStr => [LocalDst, ConstRef],
            // ----- SQL value operations (null-propagating) -----
            SqlAdd => [LocalDst, LocalSrc, LocalSrc],
            SqlSub => [LocalDst, LocalSrc, LocalSrc],
            SqlMul => [LocalDst, LocalSrc, LocalSrc],
            SqlDiv => [LocalDst, LocalSrc, LocalSrc],
            SqlRem => [LocalDst, LocalSrc, LocalSrc],
            SqlEq => [LocalDst, LocalSrc, LocalSrc],
            SqlNe => [LocalDst, LocalSrc, LocalSrc],
            SqlLt => [LocalDst, LocalSrc, LocalSrc],
            SqlLe => [LocalDst, LocalSrc, LocalSrc],
            SqlGt => [LocalDst, LocalSrc, LocalSrc],
            SqlGe => [LocalDst, LocalSrc, LocalSrc],
            SqlAnd => [LocalDst, LocalSrc, LocalSrc],
            SqlOr => [LocalDst, LocalSrc, LocalSrc],
            SqlNot => [LocalDst, LocalSrc],
            ValIsNull => [LocalDst, LocalSrc],
            ValIsNotNull => [LocalDst, LocalSrc],
            ForceBoolTruth => [LocalDst, LocalSrc],
            // ----- Hashing -----
            Hash => [LocalDst, LocalSrc],
            HashCombine => [LocalDst, LocalSrc, LocalSrc],
            // ----- Table iteration -----
            TableIterInit => [LocalDst, Count],
            TableIterNextBatch => [LocalDst, LocalSrc],
            TableIterClose => [LocalSrc],
            BatchHasNext => [LocalDst, LocalSrc],
            BatchAdvance => [LocalSrc],
            BatchGet => [LocalDst, LocalSrc, Count],
            BatchGetRowId => [LocalDst, LocalSrc],
            // Vectorized predicates over the current batch's selection vector
            BatchFilterEq => [LocalSrc, Count, LocalSrc],
            BatchFilterNe => [LocalSrc, Count, LocalSrc],
            BatchFilterLt => [LocalSrc, Count, LocalSrc],
            BatchFilterLe => [LocalSrc, Count, LocalSrc],
            BatchFilterGt => [LocalSrc, Count, LocalSrc],
            BatchFilterGe => [LocalSrc, Count, LocalSrc],
            // Partitioned parallel scan; hard barrier until all workers finish
            ParallelScanTable => [Count, FuncRef],
            // ----- Index iteration -----
            IndexIterInit => [LocalDst, Count],
            IndexIterScanKey => [LocalSrc, LocalRangeSrc, Count],
            IndexIterScanAscending => [LocalSrc, LocalRangeSrc, Count, LocalRangeSrc, Count, Count],
            IndexIterScanDescending => [LocalSrc, LocalRangeSrc, Count, LocalRangeSrc, Count, Count],
            IndexIterAdvance => [LocalDst, LocalSrc],
            IndexIterGet => [LocalDst, LocalSrc, Count],
            IndexIterFree => [LocalSrc],
            // ----- Aggregation hash table -----
            AggTableInit => [StateSlot, ConstRef],
            AggTableUpsert => [StateSlot, LocalRangeSrc, Count, LocalRangeSrc, Count],
            AggTableMergePartitions => [StateSlot],
            AggIterInit => [LocalDst, StateSlot],
            AggIterNext => [LocalDst, LocalSrc],
            AggIterRow => [LocalRangeDst, Count, LocalSrc],
            AggTableFree => [StateSlot],
            // ----- Join hash table -----
            JoinTableInit => [StateSlot],
            JoinTableInsert => [StateSlot, LocalRangeSrc, Count, LocalRangeSrc, Count],
            JoinTableBuild => [StateSlot],
            JoinProbeInit => [LocalDst, StateSlot, LocalRangeSrc, Count],
            JoinProbeNext => [LocalDst, LocalSrc],
            JoinProbeRow => [LocalRangeDst, Count, LocalSrc],
            JoinTableFree => [StateSlot],
            // ----- Sorter -----
            SorterInit => [StateSlot, ConstRef],
            SorterInsert => [StateSlot, LocalRangeSrc, Count],
            SorterSort => [StateSlot],
            SorterIterInit => [LocalDst, StateSlot],
            SorterIterNext => [LocalDst, LocalSrc],
            SorterIterRow => [LocalRangeDst, Count, LocalSrc],
            SorterFree => [StateSlot],
            // ----- Output -----
            OutputRow => [LocalRangeSrc, Count],
            OutputFinalize => [],
            // ----- Mutation -----
            TableInsert => [LocalDst, Count, LocalRangeSrc, Count],
            TableUpdate => [LocalDst, Count, LocalSrc, LocalRangeSrc, Count],
            TableDelete => [LocalDst, Count, LocalSrc],
            // ----- Scalar math builtins -----
            Abs => [LocalDst, LocalSrc],
            Sqrt => [LocalDst, LocalSrc],
            Ceil => [LocalDst, LocalSrc],
            Floor => [LocalDst, LocalSrc],
            Round => [LocalDst, LocalSrc],
            Exp => [LocalDst, LocalSrc],
            Ln => [LocalDst, LocalSrc],
            Log2 => [LocalDst, LocalSrc],
            Log10 => [LocalDst, LocalSrc],
            Sin => [LocalDst, LocalSrc],
            Cos => [LocalDst, LocalSrc],
            Tan => [LocalDst, LocalSrc],
            Pow => [LocalDst, LocalSrc, LocalSrc],
            // ----- Scalar string builtins -----
            Upper => [LocalDst, LocalSrc],
            Lower => [LocalDst, LocalSrc],
            StrLength => [LocalDst, LocalSrc],
            Substring => [LocalDst, LocalSrc, LocalSrc, LocalSrc],
            Trim => [LocalDst, LocalSrc],
            Concat => [LocalDst, LocalSrc, LocalSrc],
            Repeat => [LocalDst, LocalSrc, LocalSrc],
            Reverse => [LocalDst, LocalSrc],
            StrLeft => [LocalDst, LocalSrc, LocalSrc],
            StrRight => [LocalDst, LocalSrc, LocalSrc],
        }
    };
}

macro_rules! define_bytecode_enum {
    ($($name:ident => [$($kind:ident),*]),+ $(,)?) => {
        /// The single enumeration of all bytecode instructions.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum Bytecode {
            $($name),+
        }

        impl Bytecode {
            /// Every opcode, in declaration order.
            pub const ALL: &'static [Bytecode] = &[$(Bytecode::$name),+];

            /// Total number of opcodes in the ISA.
            pub const COUNT: usize = Bytecode::ALL.len();

            /// Disassembler name.
            pub fn name(self) -> &'static str {
                match self {
                    $(Bytecode::$name => stringify!($name)),+
                }
            }

            /// Fixed operand shape, known statically from the opcode.
            pub fn operand_kinds(self) -> &'static [OperandKind] {
                match self {
                    $(Bytecode::$name => &[$(OperandKind::$kind),*]),+
                }
            }
        }
    };
}

for_each_bytecode!(define_bytecode_enum);

impl Bytecode {
    /// A bytecode is terminal iff it is `Return` or an unconditional
    /// `Jump`: control never falls through to the next instruction.
    pub fn is_terminal(self) -> bool {
        matches!(self, Bytecode::Return | Bytecode::Jump)
    }

    /// Any control transfer carrying a jump target.
    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Bytecode::Jump | Bytecode::JumpIfTrue | Bytecode::JumpIfFalse
        )
    }

    pub fn operand_count(self) -> usize {
        self.operand_kinds().len()
    }
}
