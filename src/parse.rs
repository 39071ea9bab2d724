// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! PEG parser for the host's attribute-expression language.
//!
//! Being a PEG parser means alternatives are ordered: the longest or most
//! specific choice goes first, and once a rule consumes input there is no
//! backtracking within it. Postfix predicates (`IS NULL`, `BETWEEN`, `IN`,
//! `LIKE`) are therefore tried before the bare comparison and the bare
//! scalar.
//!

use crate::{
    error::FilterError,
    expr::{E, Op},
};

// Words that may not be used as bare column identifiers.
const KEYWORDS: [&str; 16] = [
    "and", "or", "not", "in", "like", "ilike", "between", "is", "null", "true", "false", "case",
    "when", "then", "else", "end",
];

fn is_keyword(s: &str) -> bool {
    KEYWORDS.contains(&s.to_ascii_lowercase().as_str())
}

peg::parser! {
    grammar attrexpr() for str {
        // howto handle case-insensitive tokens.  see
        // https://github.com/kevinmehall/rust-peg/issues/216
        rule i(literal: &'static str)
        = input:$([_]*<{literal.len()}>)
        {? if input.eq_ignore_ascii_case(literal) { Ok(()) } else { Err(literal) } }

        // keyword: case-insensitive token that must not run into an identifier.
        rule kw(literal: &'static str)
        = i(literal) !['a'..='z' | 'A'..='Z' | '0'..='9' | '_']

        rule _ = quiet! { [' ' | '\t' | '\n' | '\r']* }

        // ignore whitespaces and EOL + EOF...
        pub rule expression() -> E = _ x:or_expr() _ ![_] { x }

        rule or_expr() -> E
        = x:and_expr() y:(_ kw("OR") _ z:and_expr() { z })* {
            y.into_iter().fold(x, |acc, z| E::Dyadic(Op::Or, Box::new(acc), Box::new(z)))
        }

        rule and_expr() -> E
        = x:not_expr() y:(_ kw("AND") _ z:not_expr() { z })* {
            y.into_iter().fold(x, |acc, z| E::Dyadic(Op::And, Box::new(acc), Box::new(z)))
        }

        rule not_expr() -> E
        = kw("NOT") _ x:not_expr() { E::Monadic(Op::Neg, Box::new(x)) }
        / boolean_primary()

        rule boolean_primary() -> E
        = x:predicate()             { x }
        / "(" _ x:or_expr() _ ")"   { x }

        rule predicate() -> E
        = x:scalar() _ kw("IS") _ kw("NOT") _ kw("NULL")
            { E::Monadic(Op::IsNotNull, Box::new(x)) }
        / x:scalar() _ kw("IS") _ kw("NULL")
            { E::Monadic(Op::IsNull, Box::new(x)) }
        / x:scalar() _ kw("NOT") _ kw("BETWEEN") _ lo:scalar() _ kw("AND") _ hi:scalar()
            { E::Dyadic(Op::IsNotBetween, Box::new(x), Box::new(E::Array(vec![lo, hi]))) }
        / x:scalar() _ kw("BETWEEN") _ lo:scalar() _ kw("AND") _ hi:scalar()
            { E::Dyadic(Op::IsBetween, Box::new(x), Box::new(E::Array(vec![lo, hi]))) }
        / x:scalar() _ kw("NOT") _ kw("IN") _ "(" _ items:value_list() _ ")"
            { E::Dyadic(Op::IsNotInList, Box::new(x), Box::new(E::Array(items))) }
        / x:scalar() _ kw("IN") _ "(" _ items:value_list() _ ")"
            { E::Dyadic(Op::IsInList, Box::new(x), Box::new(E::Array(items))) }
        / x:scalar() _ kw("NOT") _ kw("ILIKE") _ y:scalar()
            { E::Dyadic(Op::IsNotILike, Box::new(x), Box::new(y)) }
        / x:scalar() _ kw("ILIKE") _ y:scalar()
            { E::Dyadic(Op::IsILike, Box::new(x), Box::new(y)) }
        / x:scalar() _ kw("NOT") _ kw("LIKE") _ y:scalar()
            { E::Dyadic(Op::IsNotLike, Box::new(x), Box::new(y)) }
        / x:scalar() _ kw("LIKE") _ y:scalar()
            { E::Dyadic(Op::IsLike, Box::new(x), Box::new(y)) }
        / a:scalar() _ op:comparison_operator() _ b:scalar()
            { E::Dyadic(op, Box::new(a), Box::new(b)) }
        / x:scalar() { x }

        rule comparison_operator() -> Op
        = "<=" { Op::Lte }
        / ">=" { Op::Gte }
        / "<>" { Op::Neq }
        / "!=" { Op::Neq }
        / "="  { Op::Eq }
        / "<"  { Op::Lt }
        / ">"  { Op::Gt }

        rule value_list() -> Vec<E>
        = items:(scalar() ** (_ "," _)) { items }

        rule scalar() -> E
        = x:additive() { x }

        rule additive() -> E
        = x:multiplicative() y:(_ op:additive_op() _ z:multiplicative() { (op, z) })* {
            y.into_iter().fold(x, |acc, (op, z)| E::Dyadic(op, Box::new(acc), Box::new(z)))
        }

        rule additive_op() -> Op
        = "+" { Op::Plus }
        / "-" { Op::Minus }

        rule multiplicative() -> E
        = x:unary() y:(_ op:multiplicative_op() _ z:unary() { (op, z) })* {
            y.into_iter().fold(x, |acc, (op, z)| E::Dyadic(op, Box::new(acc), Box::new(z)))
        }

        rule multiplicative_op() -> Op
        = "*" { Op::Mult }
        / "/" { Op::Div }
        / "%" { Op::Mod }

        rule unary() -> E
        = "-" _ x:unary() { E::Monadic(Op::Minus, Box::new(x)) }
        / primary()

        rule primary() -> E
        = x:numeric_literal()       { x }
        / x:string_literal()        { x }
        / kw("TRUE")                { E::Bool(true) }
        / kw("FALSE")               { E::Bool(false) }
        / kw("NULL")                { E::Null }
        / x:case_expression()       { x }
        / x:function()              { x }
        / x:column()                { x }
        / "(" _ x:additive() _ ")"  { x }

        rule numeric_literal() -> E
        = x:$(['0'..='9']+ ("." ['0'..='9']+)? (['e' | 'E'] ['+' | '-']? ['0'..='9']+)?) {?
            x.parse::<f64>().map(E::Num).or(Err("number"))
        }

        // single-quoted string; embedded quotes are doubled...
        rule string_literal() -> E
        = "'" x:$(("''" / [^'\''])*) "'" { E::Str(x.replace("''", "'")) }

        rule case_expression() -> E
        = kw("CASE") whens:(_ w:when_clause() { w })+ otherwise:(_ kw("ELSE") _ x:or_expr() { x })? _ kw("END") {
            E::Case { whens, otherwise: otherwise.map(Box::new) }
        }

        rule when_clause() -> (E, E)
        = kw("WHEN") _ cond:or_expr() _ kw("THEN") _ val:or_expr() { (cond, val) }

        rule function() -> E
        = name:bare_identifier() _ "(" _ params:(or_expr() ** (_ "," _)) _ ")" {
            E::Function(name, params)
        }

        rule column() -> E
        = x:quoted_identifier() { E::Column(x) }
        / x:bare_identifier()   { E::Column(x) }

        // double-quoted identifier; embedded quotes are doubled...
        rule quoted_identifier() -> String
        = "\"" x:$(("\"\"" / [^'"'])+) "\"" { x.replace("\"\"", "\"") }

        rule bare_identifier() -> String
        = x:$(['a'..='z' | 'A'..='Z' | '_'] ['a'..='z' | 'A'..='Z' | '0'..='9' | '_']*) {?
            if is_keyword(x) { Err("identifier") } else { Ok(x.to_owned()) }
        }
    }
}

/// Constructs the translator refuses outright; their presence anywhere
/// outside a string literal makes the expression unsafe, never retried.
const FORBIDDEN_SEQUENCES: [&str; 3] = [";", "--", "/*"];
const FORBIDDEN_WORDS: [&str; 7] = [
    "update", "insert", "delete", "drop", "alter", "pragma", "attach",
];

/// Reject anything that could alter rows or smuggle a second statement:
/// statement separators, SQL comments, and DML/DDL keywords. The scan
/// ignores the inside of single-quoted string literals.
pub fn ensure_safe(input: &str) -> Result<(), FilterError> {
    let mut outside = String::with_capacity(input.len());
    let mut in_string = false;
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if in_string {
            if c == '\'' {
                // doubled quote stays inside the literal...
                if chars.peek() == Some(&'\'') {
                    chars.next();
                } else {
                    in_string = false;
                }
            }
        } else if c == '\'' {
            in_string = true;
            outside.push(' ');
        } else {
            outside.push(c);
        }
    }
    for seq in FORBIDDEN_SEQUENCES {
        if outside.contains(seq) {
            return Err(FilterError::UnsafeExpression(
                format!("contains '{seq}'").into(),
            ));
        }
    }
    let lowered = outside.to_ascii_lowercase();
    for word in lowered.split(|c: char| !c.is_ascii_alphanumeric() && c != '_') {
        if FORBIDDEN_WORDS.contains(&word) {
            return Err(FilterError::UnsafeExpression(
                format!("contains '{word}'").into(),
            ));
        }
    }
    Ok(())
}

/// Parse a host attribute expression into the internal AST, after the
/// unsafe-construct pre-scan.
pub(crate) fn parse_expression(input: &str) -> Result<E, FilterError> {
    ensure_safe(input)?;
    let e = attrexpr::expression(input)?;
    Ok(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(input: &str) -> E {
        parse_expression(input).unwrap_or_else(|x| panic!("{input}: {x}"))
    }

    #[test]
    fn test_comparison_chain() {
        let e = ok("population >= 20 AND population < 40");
        assert_eq!(
            e.to_string(),
            r#"(("population" >= 20) AND ("population" < 40))"#
        );
    }

    #[test]
    fn test_quoted_identifier() {
        let e = ok(r#""weird name" = 'x'"#);
        assert_eq!(e.to_string(), r#"("weird name" = 'x')"#);
    }

    #[test]
    fn test_string_escapes() {
        let e = ok("name = 'O''Brien'");
        assert_eq!(e.to_string(), r#"("name" = 'O'Brien')"#);
    }

    #[test]
    fn test_arithmetic_precedence() {
        let e = ok("a + b * 2 = 7");
        assert_eq!(e.to_string(), r#"(("a" + ("b" * 2)) = 7)"#);
    }

    #[test]
    fn test_parenthesised_arithmetic_comparison() {
        let e = ok("(a + 1) > 2");
        assert_eq!(e.to_string(), r#"(("a" + 1) > 2)"#);
    }

    #[test]
    fn test_parenthesised_boolean() {
        let e = ok("(a = 1 OR b = 2) AND c = 3");
        assert_eq!(
            e.to_string(),
            r#"((("a" = 1) OR ("b" = 2)) AND ("c" = 3))"#
        );
    }

    #[test]
    fn test_not_in_between_like() {
        ok("code NOT IN (1, 2, 3)");
        ok("x BETWEEN 1 AND 10 AND y = 2");
        ok("name NOT LIKE 'foo%'");
        ok("name ILIKE '%BAR%'");
        ok("name IS NOT NULL");
        ok("NOT (a = 1)");
    }

    #[test]
    fn test_case_and_functions() {
        ok("CASE WHEN population > 10 THEN 'big' ELSE 'small' END = 'big'");
        ok("upper(name) = 'OSLO'");
        ok("coalesce(a, b, 0) > 1");
    }

    #[test]
    fn test_keyword_not_an_identifier() {
        assert!(parse_expression("select = 1").is_ok());
        assert!(parse_expression("and = 1").is_err());
    }

    #[test]
    fn test_unsafe_expressions() {
        for bad in [
            "1 = 1; DROP TABLE x",
            "a = 1 -- comment",
            "a = 1 /* sneaky */",
            "update x",
            "1 = 1 AND delete > 0",
        ] {
            let err = parse_expression(bad).unwrap_err();
            assert!(
                matches!(err, FilterError::UnsafeExpression(_)),
                "{bad}: {err}"
            );
        }
        // quoting keeps literals out of the scan...
        assert!(parse_expression("note = 'please; do not -- delete'").is_ok());
    }
}
