// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Scalar attribute values carried by features and produced when evaluating
//! attribute expressions in-process.
//!

use core::fmt;
use jiff::civil::Date;

/// A feature attribute value, or the result of evaluating an expression.
///
/// Comparisons follow SQL three-valued logic: anything compared with `Null`
/// is `Null`, which the evaluator folds to "no match" at the top level.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// Boolean.
    Bool(bool),
    /// Numeric. Integers are carried as exact `f64` values.
    Num(f64),
    /// Character data.
    Str(String),
    /// Calendar date.
    Date(Date),
}

impl Value {
    /// TRUE when this is the SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Coerce to a number when the variant allows it.
    pub fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(x) => Some(*x),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Str(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Borrow as a string when this is character data.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Three-valued truthiness: `Some(true/false)` or `None` for NULL.
    pub fn truth(&self) -> Option<bool> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(*b),
            Value::Num(x) => Some(*x != 0.0),
            Value::Str(s) => Some(!s.is_empty()),
            Value::Date(_) => Some(true),
        }
    }

    /// SQL ordering comparison between two values of compatible types;
    /// `None` when either side is NULL or the types are incomparable.
    pub fn compare(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Num(a), Value::Num(b)) => a.partial_cmp(b),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            // a textual column compared against a numeric literal follows
            // the cast-to-numeric heuristic used in SQL generation...
            (Value::Str(_), Value::Num(b)) => self.as_num().and_then(|a| a.partial_cmp(b)),
            (Value::Num(a), Value::Str(_)) => other.as_num().and_then(|b| a.partial_cmp(&b)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(x) => write!(f, "{}", if *x { "TRUE" } else { "FALSE" }),
            Value::Num(x) => write!(f, "{x}"),
            Value::Str(x) => write!(f, "'{x}'"),
            Value::Date(x) => write!(f, "'{x}'"),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Num(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Num(value as f64)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Date> for Value {
    fn from(value: Date) -> Self {
        Value::Date(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn test_null_comparisons_are_null() {
        assert!(Value::Null.compare(&Value::from(1.0)).is_none());
        assert!(Value::from("x").compare(&Value::Null).is_none());
    }

    #[test]
    fn test_numeric_text_coercion() {
        let pop = Value::from(" 42 ");
        assert_eq!(pop.compare(&Value::from(41.0)), Some(Ordering::Greater));
        let word = Value::from("forty-two");
        assert!(word.compare(&Value::from(41.0)).is_none());
    }

    #[test]
    fn test_truth() {
        assert_eq!(Value::Null.truth(), None);
        assert_eq!(Value::from(true).truth(), Some(true));
        assert_eq!(Value::from(0.0).truth(), Some(false));
    }
}
