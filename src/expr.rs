// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Attribute-expression AST produced by the PEG parser, plus an in-process
//! evaluator used by the OGR backend and by callers falling back from
//! `ExpressionNotTranslatable`.
//!
//! Logically connected predicates follow SQL three-valued logic, where `T`
//! is TRUE, `F` is FALSE and `N` is NULL:
//! ```text
//! +-----+-----+---------+---------+
//! | P1  | P2  | P1 & P2 | P1 | P2 |
//! +-----+-----+---------+---------+
//! |  T  |  N  |    N    |    T    |
//! |  F  |  N  |    F    |    N    |
//! |  N  |  N  |    N    |    N    |
//! +-----+-----+---------+---------+
//! ```
//!

use crate::{error::FilterError, value::Value};
use core::fmt;
use std::collections::HashMap;

/// Attributes of one feature, keyed by column name.
pub type Attributes = HashMap<String, Value>;

/// Operators of the attribute-expression language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    // arithmetic...
    Plus,
    Minus, // both (M) negation of a numeric, and (D) subtraction
    Mult,
    Div,
    Mod,
    Neg, // (M) NOT of a boolean predicate
    // comparison...
    Eq,
    Neq,
    Lt,
    Gt,
    Lte,
    Gte,
    And,
    Or,
    // extended comparison...
    IsLike,
    IsNotLike,
    IsILike,
    IsNotILike,
    IsBetween,
    IsNotBetween,
    IsInList,
    IsNotInList,
    IsNull,    // (M)
    IsNotNull, // (M)
}

impl Op {
    pub(crate) fn arithmetic(&self) -> bool {
        matches!(self, Op::Plus | Op::Minus | Op::Mult | Op::Div | Op::Mod)
    }

    pub(crate) fn comparison(&self) -> bool {
        matches!(self, Op::Eq | Op::Neq | Op::Lt | Op::Lte | Op::Gt | Op::Gte)
    }

    pub(crate) fn like(&self) -> bool {
        matches!(
            self,
            Op::IsLike | Op::IsNotLike | Op::IsILike | Op::IsNotILike
        )
    }

    pub(crate) fn nullable(&self) -> bool {
        matches!(self, Op::IsNull | Op::IsNotNull)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Plus => write!(f, "+"),
            Op::Minus => write!(f, "-"),
            Op::Mult => write!(f, "*"),
            Op::Div => write!(f, "/"),
            Op::Mod => write!(f, "%"),
            Op::Neg => write!(f, "NOT"),
            Op::Eq => write!(f, "="),
            Op::Neq => write!(f, "<>"),
            Op::Lt => write!(f, "<"),
            Op::Gt => write!(f, ">"),
            Op::Lte => write!(f, "<="),
            Op::Gte => write!(f, ">="),
            Op::And => write!(f, "AND"),
            Op::Or => write!(f, "OR"),
            Op::IsLike => write!(f, "LIKE"),
            Op::IsNotLike => write!(f, "NOT LIKE"),
            Op::IsILike => write!(f, "ILIKE"),
            Op::IsNotILike => write!(f, "NOT ILIKE"),
            Op::IsBetween => write!(f, "BETWEEN"),
            Op::IsNotBetween => write!(f, "NOT BETWEEN"),
            Op::IsInList => write!(f, "IN"),
            Op::IsNotInList => write!(f, "NOT IN"),
            Op::IsNull => write!(f, "IS NULL"),
            Op::IsNotNull => write!(f, "IS NOT NULL"),
        }
    }
}

/// Expression variants...
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) enum E {
    #[default]
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    Column(String),
    Monadic(Op, Box<E>),
    Dyadic(Op, Box<E>, Box<E>),
    Array(Vec<E>),
    Function(String, Vec<E>),
    Case {
        whens: Vec<(E, E)>,
        otherwise: Option<Box<E>>,
    },
}

impl fmt::Display for E {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            E::Null => write!(f, "NULL"),
            E::Bool(x) => write!(f, "{}", if *x { "TRUE" } else { "FALSE" }),
            E::Num(x) => write!(f, "{x}"),
            E::Str(x) => write!(f, "'{x}'"),
            E::Column(x) => write!(f, "\"{x}\""),
            E::Monadic(op, x) if op.nullable() => write!(f, "{x} {op}"),
            E::Monadic(op, x) => write!(f, "{op} ({x})"),
            E::Dyadic(op, a, b)
                if matches!(op, Op::IsBetween) || matches!(op, Op::IsNotBetween) =>
            {
                // RHS of [NOT] BETWEEN is an array of 2 expressions...
                match &**b {
                    E::Array(x) => write!(f, "{a} {op} {} AND {}", x[0], x[1]),
                    _ => write!(f, "{a} {op} ?"),
                }
            }
            E::Dyadic(op, a, b) => write!(f, "({a} {op} {b})"),
            E::Array(x) => {
                let items: Vec<_> = x.iter().map(|x| x.to_string()).collect();
                write!(f, "({})", items.join(", "))
            }
            E::Function(name, params) => {
                let params: Vec<_> = params.iter().map(|x| x.to_string()).collect();
                write!(f, "{name}({})", params.join(", "))
            }
            E::Case { whens, otherwise } => {
                write!(f, "CASE")?;
                for (cond, val) in whens {
                    write!(f, " WHEN {cond} THEN {val}")?;
                }
                if let Some(x) = otherwise {
                    write!(f, " ELSE {x}")?;
                }
                write!(f, " END")
            }
        }
    }
}

impl E {
    /// Return TRUE if this is a literal value; FALSE otherwise.
    pub(crate) fn is_literal(&self) -> bool {
        match self {
            E::Null | E::Bool(_) | E::Num(_) | E::Str(_) => true,
            E::Array(x) => x.iter().all(|y| y.is_literal()),
            _ => false,
        }
    }

    // Return TRUE if it's a literal value or just a column reference.
    pub(crate) fn is_literal_or_column(&self) -> bool {
        self.is_literal() || matches!(self, E::Column(_))
    }

    /// Evaluate against a feature's attributes, yielding a [`Value`].
    /// Missing attributes evaluate to NULL; the schema check belongs to the
    /// SQL translator, not the evaluator.
    pub(crate) fn eval(&self, feature: &Attributes) -> Result<Value, FilterError> {
        match self {
            E::Null => Ok(Value::Null),
            E::Bool(x) => Ok(Value::Bool(*x)),
            E::Num(x) => Ok(Value::Num(*x)),
            E::Str(x) => Ok(Value::Str(x.clone())),
            E::Column(name) => Ok(feature.get(name).cloned().unwrap_or(Value::Null)),
            E::Monadic(op, x) => self.eval_monadic(*op, x, feature),
            E::Dyadic(op, a, b) => self.eval_dyadic(*op, a, b, feature),
            E::Array(_) => Err(FilterError::Runtime(
                "bare value list outside IN/BETWEEN".into(),
            )),
            E::Function(name, params) => eval_function(name, params, feature),
            E::Case { whens, otherwise } => {
                for (cond, val) in whens {
                    if cond.eval(feature)?.truth() == Some(true) {
                        return val.eval(feature);
                    }
                }
                match otherwise {
                    Some(x) => x.eval(feature),
                    None => Ok(Value::Null),
                }
            }
        }
    }

    /// Evaluate as a WHERE-clause predicate: `Some(bool)` or `None` (NULL).
    pub(crate) fn matches(&self, feature: &Attributes) -> Result<Option<bool>, FilterError> {
        Ok(self.eval(feature)?.truth())
    }

    fn eval_monadic(&self, op: Op, x: &E, feature: &Attributes) -> Result<Value, FilterError> {
        let v = x.eval(feature)?;
        match op {
            Op::IsNull => Ok(Value::Bool(v.is_null())),
            Op::IsNotNull => Ok(Value::Bool(!v.is_null())),
            Op::Neg => Ok(match v.truth() {
                Some(b) => Value::Bool(!b),
                None => Value::Null,
            }),
            Op::Minus => Ok(match v.as_num() {
                Some(n) => Value::Num(-n),
                None => Value::Null,
            }),
            x => Err(FilterError::Runtime(
                format!("Unexpected ({x}) monadic operator").into(),
            )),
        }
    }

    fn eval_dyadic(&self, op: Op, a: &E, b: &E, feature: &Attributes) -> Result<Value, FilterError> {
        match op {
            Op::And => {
                let lhs = a.eval(feature)?.truth();
                let rhs = b.eval(feature)?.truth();
                Ok(match (lhs, rhs) {
                    (Some(false), _) | (_, Some(false)) => Value::Bool(false),
                    (Some(true), Some(true)) => Value::Bool(true),
                    _ => Value::Null,
                })
            }
            Op::Or => {
                let lhs = a.eval(feature)?.truth();
                let rhs = b.eval(feature)?.truth();
                Ok(match (lhs, rhs) {
                    (Some(true), _) | (_, Some(true)) => Value::Bool(true),
                    (Some(false), Some(false)) => Value::Bool(false),
                    _ => Value::Null,
                })
            }
            op if op.comparison() => {
                let lhs = a.eval(feature)?;
                let rhs = b.eval(feature)?;
                Ok(match lhs.compare(&rhs) {
                    None => Value::Null,
                    Some(ord) => Value::Bool(match op {
                        Op::Eq => ord.is_eq(),
                        Op::Neq => ord.is_ne(),
                        Op::Lt => ord.is_lt(),
                        Op::Lte => ord.is_le(),
                        Op::Gt => ord.is_gt(),
                        Op::Gte => ord.is_ge(),
                        _ => unreachable!(),
                    }),
                })
            }
            op if op.arithmetic() => {
                let lhs = a.eval(feature)?.as_num();
                let rhs = b.eval(feature)?.as_num();
                Ok(match (lhs, rhs) {
                    (Some(x), Some(y)) => match op {
                        Op::Plus => Value::Num(x + y),
                        Op::Minus => Value::Num(x - y),
                        Op::Mult => Value::Num(x * y),
                        Op::Div if y != 0.0 => Value::Num(x / y),
                        Op::Mod if y != 0.0 => Value::Num(x % y),
                        _ => Value::Null,
                    },
                    _ => Value::Null,
                })
            }
            op if op.like() => {
                let lhs = a.eval(feature)?;
                let rhs = b.eval(feature)?;
                match (lhs.as_str(), rhs.as_str()) {
                    (Some(text), Some(pattern)) => {
                        let ci = matches!(op, Op::IsILike | Op::IsNotILike);
                        let hit = like_match(text, pattern, ci);
                        let negated = matches!(op, Op::IsNotLike | Op::IsNotILike);
                        Ok(Value::Bool(hit != negated))
                    }
                    _ => Ok(Value::Null),
                }
            }
            Op::IsBetween | Op::IsNotBetween => {
                let x = a.eval(feature)?;
                let (lo, hi) = match b {
                    E::Array(pair) if pair.len() == 2 => {
                        (pair[0].eval(feature)?, pair[1].eval(feature)?)
                    }
                    _ => {
                        return Err(FilterError::Runtime(
                            "[NOT] BETWEEN RHS is not a pair".into(),
                        ));
                    }
                };
                let within = match (x.compare(&lo), x.compare(&hi)) {
                    (Some(a), Some(b)) => Some(a.is_ge() && b.is_le()),
                    _ => None,
                };
                Ok(match within {
                    Some(w) => Value::Bool(w != matches!(op, Op::IsNotBetween)),
                    None => Value::Null,
                })
            }
            Op::IsInList | Op::IsNotInList => {
                let x = a.eval(feature)?;
                if x.is_null() {
                    return Ok(Value::Null);
                }
                let items = match b {
                    E::Array(items) => items,
                    _ => return Err(FilterError::Runtime("IN RHS is not a list".into())),
                };
                let mut saw_null = false;
                let mut hit = false;
                for item in items {
                    let v = item.eval(feature)?;
                    match x.compare(&v) {
                        Some(ord) if ord.is_eq() => {
                            hit = true;
                            break;
                        }
                        None if v.is_null() => saw_null = true,
                        _ => (),
                    }
                }
                Ok(if hit {
                    Value::Bool(!matches!(op, Op::IsNotInList))
                } else if saw_null {
                    Value::Null
                } else {
                    Value::Bool(matches!(op, Op::IsNotInList))
                })
            }
            x => Err(FilterError::Runtime(
                format!("Unexpected ({x}) dyadic operator").into(),
            )),
        }
    }
}

// SQL LIKE pattern matching: `%` matches any run, `_` any single character.
fn like_match(text: &str, pattern: &str, case_insensitive: bool) -> bool {
    let (text, pattern) = if case_insensitive {
        (text.to_lowercase(), pattern.to_lowercase())
    } else {
        (text.to_owned(), pattern.to_owned())
    };
    let t: Vec<char> = text.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    like_match_impl(&t, &p)
}

fn like_match_impl(text: &[char], pattern: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('%') => {
            // try swallowing 0..=len characters...
            (0..=text.len()).any(|skip| like_match_impl(&text[skip..], &pattern[1..]))
        }
        Some('_') => !text.is_empty() && like_match_impl(&text[1..], &pattern[1..]),
        Some(c) => text.first() == Some(c) && like_match_impl(&text[1..], &pattern[1..]),
    }
}

// The closed whitelist of scalar functions the engine understands. The SQL
// translator consults the same list through `is_builtin`.
fn eval_function(name: &str, params: &[E], feature: &Attributes) -> Result<Value, FilterError> {
    let args: Result<Vec<Value>, FilterError> =
        params.iter().map(|x| x.eval(feature)).collect();
    let args = args?;
    let lowered = name.to_ascii_lowercase();
    match (lowered.as_str(), args.as_slice()) {
        ("upper", [Value::Str(s)]) => Ok(Value::Str(s.to_uppercase())),
        ("lower", [Value::Str(s)]) => Ok(Value::Str(s.to_lowercase())),
        ("length", [Value::Str(s)]) => Ok(Value::Num(s.chars().count() as f64)),
        ("trim", [Value::Str(s)]) => Ok(Value::Str(s.trim().to_owned())),
        ("abs", [x]) => Ok(x.as_num().map(|n| Value::Num(n.abs())).unwrap_or(Value::Null)),
        ("round", [x]) => Ok(x
            .as_num()
            .map(|n| Value::Num(n.round()))
            .unwrap_or(Value::Null)),
        ("coalesce", args) => Ok(args
            .iter()
            .find(|x| !x.is_null())
            .cloned()
            .unwrap_or(Value::Null)),
        ("upper" | "lower" | "length" | "trim", [Value::Null]) => Ok(Value::Null),
        (other, _) if is_builtin(other) => Ok(Value::Null),
        (other, _) => Err(FilterError::ExpressionNotTranslatable(
            format!("unknown function '{other}'").into(),
        )),
    }
}

/// TRUE when `name` is one of the scalar functions the engine understands.
pub(crate) fn is_builtin(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "upper" | "lower" | "length" | "trim" | "abs" | "round" | "coalesce"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_expression;

    fn feature(pairs: &[(&str, Value)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn check(expr: &str, feature: &Attributes, expected: Option<bool>) {
        let e = parse_expression(expr).unwrap();
        assert_eq!(e.matches(feature).unwrap(), expected, "{expr}");
    }

    #[test]
    fn test_comparisons() {
        let f = feature(&[("population", Value::from(25.0))]);
        check("population >= 20 AND population < 40", &f, Some(true));
        check("population > 25", &f, Some(false));
        check("missing > 1", &f, None);
    }

    #[test]
    fn test_three_valued_and_or() {
        let f = feature(&[("a", Value::from(1.0))]);
        // F AND N = F, T OR N = T...
        check("a = 2 AND missing = 1", &f, Some(false));
        check("a = 1 OR missing = 1", &f, Some(true));
        check("a = 1 AND missing = 1", &f, None);
    }

    #[test]
    fn test_like() {
        let f = feature(&[("name", Value::from("Ljubljana"))]);
        check("name LIKE 'Lju%'", &f, Some(true));
        check("name LIKE 'lju%'", &f, Some(false));
        check("name ILIKE 'LJU%'", &f, Some(true));
        check("name LIKE '_jubljana'", &f, Some(true));
        check("name NOT LIKE 'x%'", &f, Some(true));
    }

    #[test]
    fn test_in_and_between() {
        let f = feature(&[("code", Value::from(7.0))]);
        check("code IN (1, 7, 9)", &f, Some(true));
        check("code NOT IN (1, 9)", &f, Some(true));
        check("code BETWEEN 5 AND 9", &f, Some(true));
        check("code NOT BETWEEN 5 AND 9", &f, Some(false));
        check("code IN (1, NULL)", &f, None);
    }

    #[test]
    fn test_null_predicates() {
        let f = feature(&[("name", Value::Null)]);
        check("name IS NULL", &f, Some(true));
        check("name IS NOT NULL", &f, Some(false));
    }

    #[test]
    fn test_arithmetic() {
        let f = feature(&[("x", Value::from(10.0))]);
        check("x * 2 + 1 = 21", &f, Some(true));
        check("x / 0 = 1", &f, None);
        check("-x = -10", &f, Some(true));
        check("x % 3 = 1", &f, Some(true));
    }

    #[test]
    fn test_functions() {
        let f = feature(&[("name", Value::from("  Oslo "))]);
        check("upper(trim(name)) = 'OSLO'", &f, Some(true));
        check("length(trim(name)) = 4", &f, Some(true));
        check("coalesce(missing, name) IS NOT NULL", &f, Some(true));
        check("abs(-3) = 3", &f, Some(true));
    }

    #[test]
    fn test_case() {
        let f = feature(&[("population", Value::from(5000.0))]);
        check(
            "CASE WHEN population > 10000 THEN 'city' ELSE 'town' END = 'town'",
            &f,
            Some(true),
        );
        check(
            "CASE WHEN population > 1000 THEN 1 END = 1",
            &f,
            Some(true),
        );
    }

    #[test]
    fn test_unknown_function_is_not_translatable() {
        let e = parse_expression("sketchy(1) = 1").unwrap();
        let err = e.matches(&Attributes::new()).unwrap_err();
        assert!(matches!(err, FilterError::ExpressionNotTranslatable(_)));
    }
}
