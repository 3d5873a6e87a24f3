//! Error types for the qforge compilation core.
//!
//! All public APIs return `ForgeResult<T>` — no panics in library code.

use thiserror::Error;

/// Unified error type for compilation and execution.
#[derive(Debug, Error)]
pub enum ForgeError {
    /// Plan contains an operator kind with no registered translator factory
    #[error("no translator registered for operator kind '{kind}' at plan node #{node}")]
    UnknownOperator { kind: String, node: usize },

    /// A plan that must deliver rows was compiled without an output schema
    #[error("plan node #{node} produces rows but no output schema was supplied")]
    MissingOutputSchema { node: usize },

    /// Type mismatch between a declared column and an expression
    #[error("type mismatch at {context}: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: String,
        actual: String,
        context: String,
    },

    /// Expression references a column outside its input schema
    #[error("column index {index} out of range at {context}")]
    UnknownColumn { index: usize, context: String },

    /// Structurally invalid plan (wrong arity, misplaced mutator, etc.)
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    /// Post-assembly static check failed; the program never reaches a backend
    #[error("verification failed in '{function}' at pc {pc}: {message}")]
    Verify {
        function: String,
        pc: usize,
        message: String,
    },

    /// Typed runtime data fault raised by the VM
    #[error("runtime fault: {0}")]
    Runtime(#[from] RuntimeFault),

    /// Storage collaborator error, propagated unchanged
    #[error("storage error: {0}")]
    Storage(String),

    /// Requested table does not exist in the storage collaborator
    #[error("table {0} not found")]
    TableNotFound(u32),

    /// Requested index does not exist in the storage collaborator
    #[error("index {0} not found")]
    IndexNotFound(u32),

    /// Transaction conflict reported by the transaction collaborator
    #[error("transaction conflict: {message}")]
    TransactionConflict { message: String },

    /// Transaction aborted by the transaction collaborator
    #[error("transaction aborted: {reason}")]
    TransactionAborted { reason: String },
}

/// Data faults raised while executing a compiled program. These abort the
/// enclosing execution; teardown still runs before the fault propagates.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuntimeFault {
    #[error("division by zero")]
    DivisionByZero,

    #[error("null value passed to non-null-aware operation '{0}'")]
    NullConstraint(&'static str),

    #[error("operand type fault in '{op}': expected {expected}, got {actual}")]
    TypeFault {
        op: &'static str,
        expected: &'static str,
        actual: String,
    },

    #[error("state slot {0} holds no live structure")]
    DeadStateSlot(usize),

    #[error("malformed program reached the VM: {0}")]
    MalformedProgram(String),
}

/// Result type alias for all qforge operations.
pub type ForgeResult<T> = Result<T, ForgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_unknown_operator() {
        let err = ForgeError::UnknownOperator {
            kind: "WindowAggregate".to_string(),
            node: 3,
        };
        assert_eq!(
            err.to_string(),
            "no translator registered for operator kind 'WindowAggregate' at plan node #3"
        );
    }

    #[test]
    fn error_display_type_mismatch() {
        let err = ForgeError::TypeMismatch {
            expected: "Int".to_string(),
            actual: "Str".to_string(),
            context: "filter predicate of node #1".to_string(),
        };
        assert!(err.to_string().contains("expected Int, got Str"));
    }

    #[test]
    fn error_display_verify_carries_position() {
        let err = ForgeError::Verify {
            function: "q1_pipeline0".to_string(),
            pc: 17,
            message: "local 4 read before written".to_string(),
        };
        assert!(err.to_string().contains("q1_pipeline0"));
        assert!(err.to_string().contains("pc 17"));
    }

    #[test]
    fn runtime_fault_wraps_into_forge_error() {
        let err: ForgeError = RuntimeFault::DivisionByZero.into();
        assert!(matches!(err, ForgeError::Runtime(RuntimeFault::DivisionByZero)));
        assert_eq!(err.to_string(), "runtime fault: division by zero");
    }

    #[test]
    fn forge_result_err() {
        let result: ForgeResult<i32> = Err(ForgeError::TableNotFound(7));
        assert!(result.is_err());
    }
}
