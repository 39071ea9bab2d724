// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Lowering of attribute expressions to backend SQL WHERE fragments.
//!
//! One recursive builder covers all three dialects; the differences are
//! confined to literal parameterisation, the case-insensitive LIKE form and
//! the function whitelist. Identifier and literal rendering go through typed
//! holes, never bare string concatenation.
//!

use crate::{
    backend::BackendKind,
    error::FilterError,
    expr::{E, Op, is_builtin},
    layer::{ColumnType, LayerDescriptor},
    parse::parse_expression,
    value::Value,
};

/// Whether literals are inlined into the fragment or replaced with
/// positional placeholders and returned out-of-band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamMode {
    /// Literals escaped and embedded in the SQL text. Mandatory for subset
    /// strings and for the OGR dialect.
    Inline,
    /// Literals become `$1`/`?` placeholders with values collected in
    /// [`Translated::params`].
    Positional,
}

/// A lowered WHERE fragment plus any out-of-band parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Translated {
    /// The SQL fragment.
    pub sql: String,
    /// Bind values, in placeholder order. Empty in inline mode.
    pub params: Vec<Value>,
}

/// Parse and lower a host attribute expression for one backend dialect.
pub fn translate_expression(
    input: &str,
    layer: &LayerDescriptor,
    kind: BackendKind,
    mode: ParamMode,
) -> Result<Translated, FilterError> {
    let e = parse_expression(input)?;
    translate(&e, layer, kind, mode)
}

pub(crate) fn translate(
    e: &E,
    layer: &LayerDescriptor,
    kind: BackendKind,
    mode: ParamMode,
) -> Result<Translated, FilterError> {
    // the OGR dialect has no parameter machinery at all...
    let mode = if kind == BackendKind::Ogr {
        ParamMode::Inline
    } else {
        mode
    };
    let mut tr = Translator {
        kind,
        layer,
        mode,
        params: Vec::new(),
    };
    let sql = tr.sql(e)?;
    Ok(Translated {
        sql,
        params: tr.params,
    })
}

/// Quote an identifier with the double-quote rules shared by all three
/// dialects; embedded quotes are doubled.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Escape and single-quote a string literal.
pub fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

struct Translator<'a> {
    kind: BackendKind,
    layer: &'a LayerDescriptor,
    mode: ParamMode,
    params: Vec<Value>,
}

impl Translator<'_> {
    fn sql(&mut self, exp: &E) -> Result<String, FilterError> {
        match exp {
            E::Null => Ok("NULL".to_owned()),
            E::Bool(true) => Ok("TRUE".to_owned()),
            E::Bool(false) => Ok("FALSE".to_owned()),
            E::Num(x) => self.literal(Value::Num(*x)),
            E::Str(x) => self.literal(Value::Str(x.clone())),
            E::Column(name) => self.column(name),
            E::Monadic(op, x) if op.nullable() => {
                let is_simple = x.is_literal_or_column();
                let lhs = self.sql(x)?;
                if is_simple {
                    Ok(format!("{lhs} {op}"))
                } else {
                    Ok(format!("({lhs}) {op}"))
                }
            }
            E::Monadic(op, x) => match op {
                Op::Neg => {
                    let rhs = self.sql(x)?;
                    Ok(format!("NOT ({rhs})"))
                }
                Op::Minus => {
                    let is_simple = x.is_literal_or_column();
                    let rhs = self.sql(x)?;
                    if is_simple {
                        Ok(format!("-{rhs}"))
                    } else {
                        Ok(format!("-({rhs})"))
                    }
                }
                x => Err(FilterError::Runtime(
                    format!("Unexpected ({x}) monadic operator").into(),
                )),
            },
            E::Dyadic(op, a, b)
                if matches!(op, Op::IsBetween) || matches!(op, Op::IsNotBetween) =>
            {
                // RHS of [NOT] BETWEEN is an array of 2 expressions...
                match &**b {
                    E::Array(rhs) if rhs.len() == 2 => {
                        let lhs = self.sql(a)?;
                        let lo = self.sql(&rhs[0])?;
                        let hi = self.sql(&rhs[1])?;
                        Ok(format!("{lhs} {op} {lo} AND {hi}"))
                    }
                    _ => Err(FilterError::Runtime(
                        "[NOT] BETWEEN RHS is not a pair".into(),
                    )),
                }
            }
            E::Dyadic(op, a, b) if matches!(op, Op::IsInList | Op::IsNotInList) => {
                let lhs = self.sql(a)?;
                match &**b {
                    E::Array(items) => {
                        let rendered: Result<Vec<String>, FilterError> =
                            items.iter().map(|x| self.sql(x)).collect();
                        Ok(format!("{lhs} {op} ({})", rendered?.join(", ")))
                    }
                    _ => Err(FilterError::Runtime("IN RHS is not a list".into())),
                }
            }
            E::Dyadic(op, a, b) if op.like() => self.like(*op, a, b),
            E::Dyadic(op, a, b) => {
                let lhs = self.comparison_side(a, b, *op)?;
                let rhs = self.comparison_side(b, a, *op)?;
                let a_simple = a.is_literal_or_column();
                let b_simple = b.is_literal_or_column();
                match (a_simple, b_simple) {
                    (true, true) => Ok(format!("{lhs} {op} {rhs}")),
                    (true, false) => Ok(format!("{lhs} {op} ({rhs})")),
                    (false, true) => Ok(format!("({lhs}) {op} {rhs}")),
                    (false, false) => Ok(format!("({lhs}) {op} ({rhs})")),
                }
            }
            E::Function(name, params) => self.function(name, params),
            E::Case { whens, otherwise } => self.case(whens, otherwise.as_deref()),
            E::Array(_) => Err(FilterError::Runtime(
                "bare value list outside IN/BETWEEN".into(),
            )),
        }
    }

    fn column(&self, name: &str) -> Result<String, FilterError> {
        if self.layer.column(name).is_none() && self.layer.primary_key() != Some(name) {
            return Err(FilterError::UnknownColumn(name.to_owned()));
        }
        Ok(quote_ident(name))
    }

    fn literal(&mut self, v: Value) -> Result<String, FilterError> {
        match self.mode {
            ParamMode::Inline => Ok(match &v {
                Value::Null => "NULL".to_owned(),
                Value::Bool(x) => if *x { "TRUE" } else { "FALSE" }.to_owned(),
                Value::Num(x) => x.to_string(),
                Value::Str(x) => quote_literal(x),
                Value::Date(x) => format!("'{x}'"),
            }),
            ParamMode::Positional => {
                self.params.push(v);
                Ok(match self.kind {
                    BackendKind::Postgres => format!("${}", self.params.len()),
                    _ => "?".to_owned(),
                })
            }
        }
    }

    // One side of an ordering/equality comparison. PostgreSQL alone gets the
    // `::numeric` cast when a textual column faces a numeric literal.
    fn comparison_side(&mut self, side: &E, other: &E, op: Op) -> Result<String, FilterError> {
        if self.kind == BackendKind::Postgres && op.comparison() {
            if let (E::Column(name), E::Num(_)) = (side, other) {
                if let Some(col) = self.layer.column(name) {
                    if col.ty == ColumnType::Text {
                        return Ok(format!("{}::numeric", self.column(name)?));
                    }
                }
            }
        }
        self.sql(side)
    }

    fn like(&mut self, op: Op, a: &E, b: &E) -> Result<String, FilterError> {
        let negate = matches!(op, Op::IsNotLike | Op::IsNotILike);
        let ci = matches!(op, Op::IsILike | Op::IsNotILike);
        let lhs = self.sql(a)?;
        let rhs = self.sql(b)?;
        let core = if !ci {
            format!("{lhs} LIKE {rhs}")
        } else {
            match self.kind {
                BackendKind::Postgres => format!("{lhs} ILIKE {rhs}"),
                BackendKind::Spatialite => format!("{lhs} LIKE {rhs} COLLATE NOCASE"),
                BackendKind::Ogr => format!("LOWER({lhs}) LIKE LOWER({rhs})"),
            }
        };
        if negate {
            Ok(format!("NOT ({core})"))
        } else {
            Ok(core)
        }
    }

    fn function(&mut self, name: &str, params: &[E]) -> Result<String, FilterError> {
        let lowered = name.to_ascii_lowercase();
        if !is_builtin(&lowered) {
            return Err(FilterError::ExpressionNotTranslatable(
                format!("unknown function '{name}'").into(),
            ));
        }
        // the OGR SQL dialect only understands the case-folding pair;
        // callers fall back to in-process evaluation for the rest...
        if self.kind == BackendKind::Ogr && !matches!(lowered.as_str(), "upper" | "lower") {
            return Err(FilterError::ExpressionNotTranslatable(
                format!("function '{name}' not available on this backend").into(),
            ));
        }
        let rendered: Result<Vec<String>, FilterError> =
            params.iter().map(|x| self.sql(x)).collect();
        Ok(format!(
            "{}({})",
            lowered.to_ascii_uppercase(),
            rendered?.join(", ")
        ))
    }

    fn case(&mut self, whens: &[(E, E)], otherwise: Option<&E>) -> Result<String, FilterError> {
        if self.kind == BackendKind::Ogr {
            return Err(FilterError::ExpressionNotTranslatable(
                "CASE not available on this backend".into(),
            ));
        }
        let mut sql = String::from("CASE");
        for (cond, val) in whens {
            let c = self.sql(cond)?;
            let v = self.sql(val)?;
            sql.push_str(&format!(" WHEN {c} THEN {v}"));
        }
        if let Some(x) = otherwise {
            let v = self.sql(x)?;
            sql.push_str(&format!(" ELSE {v}"));
        }
        sql.push_str(" END");
        Ok(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{Column, GeomEncoding, LayerKind, LayerRef};

    fn layer() -> LayerDescriptor {
        LayerDescriptor {
            layer: LayerRef::from("places"),
            kind: LayerKind::Postgres,
            provider_uri: "postgres://gis/db".into(),
            table_name: "places".into(),
            geometry_column: "geom".into(),
            srid: 4326,
            geometry_type: "Point".into(),
            encoding: GeomEncoding::Native,
            declared_primary_key: Some("gid".into()),
            host_row_id: None,
            feature_count_hint: None,
            columns: vec![
                Column::new("name", ColumnType::Text),
                Column::new("population", ColumnType::Integer),
                Column::new("elevation_txt", ColumnType::Text),
            ],
        }
    }

    fn inline(input: &str, kind: BackendKind) -> String {
        translate_expression(input, &layer(), kind, ParamMode::Inline)
            .unwrap()
            .sql
    }

    #[test]
    fn test_basic_comparison() {
        assert_eq!(
            inline("population >= 20 AND population < 40", BackendKind::Ogr),
            r#"("population" >= 20) AND ("population" < 40)"#
        );
    }

    #[test]
    fn test_unknown_column() {
        let err =
            translate_expression("popluation > 1", &layer(), BackendKind::Ogr, ParamMode::Inline)
                .unwrap_err();
        assert!(matches!(err, FilterError::UnknownColumn(x) if x == "popluation"));
    }

    #[test]
    fn test_pk_column_is_known() {
        assert_eq!(inline("gid = 4", BackendKind::Postgres), r#""gid" = 4"#);
    }

    #[test]
    fn test_pg_numeric_cast_for_textual_column() {
        assert_eq!(
            inline("elevation_txt > 100", BackendKind::Postgres),
            r#""elevation_txt"::numeric > 100"#
        );
        // not applied to already-numeric columns, nor off PostgreSQL...
        assert_eq!(
            inline("population > 100", BackendKind::Postgres),
            r#""population" > 100"#
        );
        assert_eq!(
            inline("elevation_txt > 100", BackendKind::Spatialite),
            r#""elevation_txt" > 100"#
        );
    }

    #[test]
    fn test_ilike_mapping() {
        assert_eq!(
            inline("name ILIKE 'os%'", BackendKind::Postgres),
            r#""name" ILIKE 'os%'"#
        );
        assert_eq!(
            inline("name ILIKE 'os%'", BackendKind::Spatialite),
            r#""name" LIKE 'os%' COLLATE NOCASE"#
        );
        assert_eq!(
            inline("name ILIKE 'os%'", BackendKind::Ogr),
            r#"LOWER("name") LIKE LOWER('os%')"#
        );
    }

    #[test]
    fn test_literal_quoting() {
        assert_eq!(
            inline("name = 'O''Brien'", BackendKind::Ogr),
            r#""name" = 'O''Brien'"#
        );
    }

    #[test]
    fn test_positional_params() {
        let t = translate_expression(
            "name = 'Oslo' AND population > 5",
            &layer(),
            BackendKind::Postgres,
            ParamMode::Positional,
        )
        .unwrap();
        assert_eq!(t.sql, r#"("name" = $1) AND ("population" > $2)"#);
        assert_eq!(
            t.params,
            vec![Value::from("Oslo"), Value::from(5.0)]
        );

        let t = translate_expression(
            "name = 'Oslo'",
            &layer(),
            BackendKind::Spatialite,
            ParamMode::Positional,
        )
        .unwrap();
        assert_eq!(t.sql, r#""name" = ?"#);
    }

    #[test]
    fn test_ogr_is_always_inline() {
        let t = translate_expression(
            "name = 'Oslo'",
            &layer(),
            BackendKind::Ogr,
            ParamMode::Positional,
        )
        .unwrap();
        assert_eq!(t.sql, r#""name" = 'Oslo'"#);
        assert!(t.params.is_empty());
    }

    #[test]
    fn test_in_between_null() {
        assert_eq!(
            inline("population IN (1, 2, 3)", BackendKind::Spatialite),
            r#""population" IN (1, 2, 3)"#
        );
        assert_eq!(
            inline("population BETWEEN 10 AND 20", BackendKind::Spatialite),
            r#""population" BETWEEN 10 AND 20"#
        );
        assert_eq!(
            inline("name IS NOT NULL", BackendKind::Spatialite),
            r#""name" IS NOT NULL"#
        );
    }

    #[test]
    fn test_case_lowering() {
        assert_eq!(
            inline(
                "CASE WHEN population > 10 THEN 'big' ELSE 'small' END = 'big'",
                BackendKind::Postgres
            ),
            r#"(CASE WHEN "population" > 10 THEN 'big' ELSE 'small' END) = 'big'"#
        );
        let err = translate_expression(
            "CASE WHEN population > 10 THEN 1 END = 1",
            &layer(),
            BackendKind::Ogr,
            ParamMode::Inline,
        )
        .unwrap_err();
        assert!(matches!(err, FilterError::ExpressionNotTranslatable(_)));
    }

    #[test]
    fn test_function_whitelist() {
        assert_eq!(
            inline("upper(name) = 'OSLO'", BackendKind::Spatialite),
            r#"(UPPER("name")) = 'OSLO'"#
        );
        let err = translate_expression(
            "trim(name) = 'x'",
            &layer(),
            BackendKind::Ogr,
            ParamMode::Inline,
        )
        .unwrap_err();
        assert!(matches!(err, FilterError::ExpressionNotTranslatable(_)));
    }
}
