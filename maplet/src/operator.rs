//! Merge operators: pluggable binary functions for combining values stored
//! under the same slot. One operator instance lives per maplet; see §9's
//! guidance against a vtable-per-slot.

use std::fmt;
use std::sync::Arc;

use crate::error::MapletError;

/// A value held by a slot. `Scalar` backs the `Counter`/`Max`/`Min`
/// operators; `Vector` backs elementwise addition.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(u64),
    Vector(Vec<f64>),
}

impl Value {
    pub fn as_scalar(&self) -> Option<u64> {
        match self {
            Value::Scalar(v) => Some(*v),
            Value::Vector(_) => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f64]> {
        match self {
            Value::Vector(v) => Some(v),
            Value::Scalar(_) => None,
        }
    }
}

type MergeFn = dyn Fn(&Value, &Value) -> Result<Value, MapletError> + Send + Sync;

/// A user-supplied merge function paired with the identity element it must
/// respect. The system does not verify associativity/commutativity.
#[derive(Clone)]
pub struct CustomOperator {
    pub identity: Value,
    pub merge_fn: Arc<MergeFn>,
}

impl fmt::Debug for CustomOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomOperator")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// Tagged variant over the fixed merge operators plus a user-defined escape
/// hatch, instead of dynamic dispatch per slot.
#[derive(Debug, Clone)]
pub enum Operator {
    Counter,
    Max,
    Min,
    Vector,
    Custom(CustomOperator),
}

impl Operator {
    /// The operator's identity element: merging it with any value `v`
    /// yields `v`.
    pub fn identity(&self) -> Value {
        match self {
            Operator::Counter => Value::Scalar(0),
            Operator::Max => Value::Scalar(0),
            Operator::Min => Value::Scalar(u64::MAX),
            Operator::Vector => Value::Vector(Vec::new()),
            Operator::Custom(c) => c.identity.clone(),
        }
    }

    /// Merges two values stored for the same key. Must be associative and
    /// commutative for deterministic results.
    pub fn merge(&self, a: &Value, b: &Value) -> Result<Value, MapletError> {
        match self {
            Operator::Counter => match (a, b) {
                (Value::Scalar(x), Value::Scalar(y)) => Ok(Value::Scalar(x.saturating_add(*y))),
                _ => Err(MapletError::OperatorError(
                    "Counter operator requires scalar values".into(),
                )),
            },
            Operator::Max => match (a, b) {
                (Value::Scalar(x), Value::Scalar(y)) => Ok(Value::Scalar((*x).max(*y))),
                _ => Err(MapletError::OperatorError(
                    "Max operator requires scalar values".into(),
                )),
            },
            Operator::Min => match (a, b) {
                (Value::Scalar(x), Value::Scalar(y)) => Ok(Value::Scalar((*x).min(*y))),
                _ => Err(MapletError::OperatorError(
                    "Min operator requires scalar values".into(),
                )),
            },
            Operator::Vector => match (a, b) {
                (Value::Vector(x), Value::Vector(y)) => {
                    if x.is_empty() {
                        return Ok(Value::Vector(y.clone()));
                    }
                    if y.is_empty() {
                        return Ok(Value::Vector(x.clone()));
                    }
                    if x.len() != y.len() {
                        return Err(MapletError::OperatorError(format!(
                            "vector length mismatch: {} vs {}",
                            x.len(),
                            y.len()
                        )));
                    }
                    Ok(Value::Vector(x.iter().zip(y.iter()).map(|(a, b)| a + b).collect()))
                }
                _ => Err(MapletError::OperatorError(
                    "Vector operator requires vector values".into(),
                )),
            },
            Operator::Custom(c) => (c.merge_fn)(a, b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_saturates() {
        let op = Operator::Counter;
        let merged = op
            .merge(&Value::Scalar(u64::MAX - 1), &Value::Scalar(10))
            .unwrap();
        assert_eq!(merged, Value::Scalar(u64::MAX));
    }

    #[test]
    fn max_and_min() {
        assert_eq!(
            Operator::Max.merge(&Value::Scalar(10), &Value::Scalar(30)).unwrap(),
            Value::Scalar(30)
        );
        assert_eq!(
            Operator::Min.merge(&Value::Scalar(10), &Value::Scalar(30)).unwrap(),
            Value::Scalar(10)
        );
    }

    #[test]
    fn vector_elementwise_add() {
        let op = Operator::Vector;
        let merged = op
            .merge(
                &Value::Vector(vec![1.0, 2.0, 3.0]),
                &Value::Vector(vec![4.0, 5.0, 6.0]),
            )
            .unwrap();
        assert_eq!(merged, Value::Vector(vec![5.0, 7.0, 9.0]));
    }

    #[test]
    fn vector_length_mismatch_is_error() {
        let op = Operator::Vector;
        let err = op
            .merge(&Value::Vector(vec![1.0, 2.0, 3.0]), &Value::Vector(vec![1.0, 2.0]))
            .unwrap_err();
        assert!(matches!(err, MapletError::OperatorError(_)));
    }
}
