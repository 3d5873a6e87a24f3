//! Runtime SQL values
//!
//! `Value` is the unit stored in VM registers, rows, and hash-table keys.
//! Null-awareness lives here: the SQL operation helpers propagate Null,
//! while the VM's primitive opcodes reject it with a typed fault.

use std::cmp::Ordering;

use crate::error::{ForgeResult, RuntimeFault};
use crate::plan::SqlType;

/// A single SQL value. `Null` is the SQL NULL of any type.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Str(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The value's SQL type; `None` for Null.
    pub fn sql_type(&self) -> Option<SqlType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(SqlType::Bool),
            Value::Int(_) => Some(SqlType::Int),
            Value::Real(_) => Some(SqlType::Real),
            Value::Str(_) => Some(SqlType::Str),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.sql_type() {
            None => "Null",
            Some(t) => t.name(),
        }
    }

    pub fn as_bool(&self, op: &'static str) -> ForgeResult<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Null => Err(RuntimeFault::NullConstraint(op).into()),
            other => Err(type_fault(op, "Bool", other)),
        }
    }

    pub fn as_int(&self, op: &'static str) -> ForgeResult<i64> {
        match self {
            Value::Int(i) => Ok(*i),
            Value::Null => Err(RuntimeFault::NullConstraint(op).into()),
            other => Err(type_fault(op, "Int", other)),
        }
    }

    pub fn as_real(&self, op: &'static str) -> ForgeResult<f64> {
        match self {
            Value::Real(r) => Ok(*r),
            Value::Null => Err(RuntimeFault::NullConstraint(op).into()),
            other => Err(type_fault(op, "Real", other)),
        }
    }

    /// Numeric widening read: Int or Real, as f64.
    pub fn as_numeric(&self, op: &'static str) -> ForgeResult<f64> {
        match self {
            Value::Int(i) => Ok(*i as f64),
            Value::Real(r) => Ok(*r),
            Value::Null => Err(RuntimeFault::NullConstraint(op).into()),
            other => Err(type_fault(op, "Int or Real", other)),
        }
    }

    pub fn as_str(&self, op: &'static str) -> ForgeResult<&str> {
        match self {
            Value::Str(s) => Ok(s),
            Value::Null => Err(RuntimeFault::NullConstraint(op).into()),
            other => Err(type_fault(op, "Str", other)),
        }
    }

    /// Append this value to a byte key buffer. Distinct values map to
    /// distinct encodings; a leading marker byte separates Null from
    /// everything else.
    pub fn encode_key(&self, key: &mut Vec<u8>) {
        match self {
            Value::Null => key.push(0),
            Value::Bool(b) => {
                key.push(1);
                key.push(*b as u8);
            }
            Value::Int(i) => {
                key.push(2);
                key.extend_from_slice(&i.to_le_bytes());
            }
            Value::Real(r) => {
                key.push(3);
                key.extend_from_slice(&r.to_bits().to_le_bytes());
            }
            Value::Str(s) => {
                key.push(4);
                key.extend_from_slice(&(s.len() as u32).to_le_bytes());
                key.extend_from_slice(s.as_bytes());
            }
        }
    }

    /// Total order for sorting: Null placement is decided by the caller,
    /// non-null values compare within their type (numerics cross-compare,
    /// reals by total order).
    pub fn cmp_sql(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            // Callers handle Null placement; keep a stable fallback.
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Real(a), Value::Real(b)) => a.total_cmp(b),
            (Value::Int(a), Value::Real(b)) => (*a as f64).total_cmp(b),
            (Value::Real(a), Value::Int(b)) => a.total_cmp(&(*b as f64)),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            // Mixed incomparable types order by type tag; the compiler
            // rejects such comparisons before execution.
            (a, b) => type_rank(a).cmp(&type_rank(b)),
        }
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Int(_) => 2,
        Value::Real(_) => 2,
        Value::Str(_) => 3,
    }
}

fn type_fault(op: &'static str, expected: &'static str, actual: &Value) -> crate::error::ForgeError {
    RuntimeFault::TypeFault {
        op,
        expected,
        actual: actual.type_name().to_string(),
    }
    .into()
}

// ===== Null-propagating SQL operations =====

/// Null-aware arithmetic: Null in, Null out; Int op Int stays Int,
/// any Real operand promotes to Real. Division by zero faults.
pub fn sql_arith(
    op: &'static str,
    a: &Value,
    b: &Value,
    int_op: fn(i64, i64) -> ForgeResult<i64>,
    real_op: fn(f64, f64) -> ForgeResult<f64>,
) -> ForgeResult<Value> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(int_op(*x, *y)?)),
        _ => {
            let x = a.as_numeric(op)?;
            let y = b.as_numeric(op)?;
            Ok(Value::Real(real_op(x, y)?))
        }
    }
}

/// Null-aware comparison: Null in, Null out; otherwise Bool.
pub fn sql_compare(
    op: &'static str,
    a: &Value,
    b: &Value,
    accept: fn(Ordering) -> bool,
) -> ForgeResult<Value> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        _ => {
            // Cross-type numeric comparison is allowed; anything else must
            // match types exactly.
            let comparable = a.sql_type() == b.sql_type()
                || (matches!(a, Value::Int(_) | Value::Real(_))
                    && matches!(b, Value::Int(_) | Value::Real(_)));
            if !comparable {
                return Err(type_fault(op, "comparable operands", b));
            }
            Ok(Value::Bool(accept(a.cmp_sql(b))))
        }
    }
}

/// Three-valued AND.
pub fn sql_and(a: &Value, b: &Value) -> ForgeResult<Value> {
    match (bool3(a, "SqlAnd")?, bool3(b, "SqlAnd")?) {
        (Some(false), _) | (_, Some(false)) => Ok(Value::Bool(false)),
        (Some(true), Some(true)) => Ok(Value::Bool(true)),
        _ => Ok(Value::Null),
    }
}

/// Three-valued OR.
pub fn sql_or(a: &Value, b: &Value) -> ForgeResult<Value> {
    match (bool3(a, "SqlOr")?, bool3(b, "SqlOr")?) {
        (Some(true), _) | (_, Some(true)) => Ok(Value::Bool(true)),
        (Some(false), Some(false)) => Ok(Value::Bool(false)),
        _ => Ok(Value::Null),
    }
}

/// Three-valued NOT.
pub fn sql_not(a: &Value) -> ForgeResult<Value> {
    Ok(match bool3(a, "SqlNot")? {
        Some(b) => Value::Bool(!b),
        None => Value::Null,
    })
}

fn bool3(v: &Value, op: &'static str) -> ForgeResult<Option<bool>> {
    match v {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(*b)),
        other => Err(type_fault(op, "Bool", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_propagates_through_sql_arith() {
        let r = sql_arith(
            "SqlAdd",
            &Value::Null,
            &Value::Int(1),
            |a, b| Ok(a + b),
            |a, b| Ok(a + b),
        )
        .unwrap();
        assert!(r.is_null());
    }

    #[test]
    fn int_arith_stays_int_real_promotes() {
        let add_i = |a: i64, b: i64| Ok(a + b);
        let add_r = |a: f64, b: f64| Ok(a + b);
        assert_eq!(
            sql_arith("SqlAdd", &Value::Int(2), &Value::Int(3), add_i, add_r).unwrap(),
            Value::Int(5)
        );
        assert_eq!(
            sql_arith("SqlAdd", &Value::Int(2), &Value::Real(0.5), add_i, add_r).unwrap(),
            Value::Real(2.5)
        );
    }

    #[test]
    fn comparison_is_null_aware() {
        let lt = |o: Ordering| o == Ordering::Less;
        assert_eq!(
            sql_compare("SqlLt", &Value::Int(1), &Value::Int(2), lt).unwrap(),
            Value::Bool(true)
        );
        assert!(
            sql_compare("SqlLt", &Value::Null, &Value::Int(2), lt)
                .unwrap()
                .is_null()
        );
    }

    #[test]
    fn three_valued_logic_tables() {
        let t = Value::Bool(true);
        let f = Value::Bool(false);
        let n = Value::Null;
        assert_eq!(sql_and(&f, &n).unwrap(), Value::Bool(false));
        assert!(sql_and(&t, &n).unwrap().is_null());
        assert_eq!(sql_or(&t, &n).unwrap(), Value::Bool(true));
        assert!(sql_or(&f, &n).unwrap().is_null());
        assert!(sql_not(&n).unwrap().is_null());
    }

    #[test]
    fn key_encoding_distinguishes_null_from_zero() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        Value::Null.encode_key(&mut a);
        Value::Int(0).encode_key(&mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn primitive_accessors_fault_on_null() {
        let err = Value::Null.as_int("IntAdd").unwrap_err();
        assert!(err.to_string().contains("non-null-aware"));
    }
}
