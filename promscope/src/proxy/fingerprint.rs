//! Query shape fingerprinting.
//!
//! The expression is parsed and every vector selector's non-`__name__`
//! matcher value is replaced with a constant sentinel, so that two queries
//! differing only in matcher values hash identically while a change to a
//! metric name, function, or operator produces a distinct fingerprint.

use promql_parser::parser::{self, Expr, VectorSelector};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Sentinel replacing masked matcher values.
const MASK: &str = "*";

const NAME_LABEL: &str = "__name__";

/// Fingerprint and masked label matchers of a PromQL expression.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryShape {
    /// Hex digest of the canonicalized masked expression; empty when the
    /// expression failed to parse.
    pub fingerprint: String,

    /// One name→value map per vector selector, non-`__name__` values
    /// masked.
    pub label_matchers: Vec<BTreeMap<String, String>>,
}

/// Computes the [`QueryShape`] of an expression.
///
/// Parse failures yield an empty fingerprint and no matchers; the record is
/// still ingested by the caller.
pub fn query_shape(expr_text: &str) -> QueryShape {
    let Ok(mut ast) = parser::parse(expr_text) else {
        return QueryShape::default();
    };

    mask_expr(&mut ast);

    let mut label_matchers = vec![];
    collect_selectors(&ast, &mut label_matchers);

    let digest = Sha256::digest(ast.to_string().as_bytes());

    QueryShape {
        fingerprint: hex::encode(digest),
        label_matchers,
    }
}

fn mask_expr(expr: &mut Expr) {
    match expr {
        Expr::Aggregate(aggregate) => {
            mask_expr(&mut aggregate.expr);
            if let Some(param) = &mut aggregate.param {
                mask_expr(param);
            }
        }
        Expr::Unary(unary) => mask_expr(&mut unary.expr),
        Expr::Binary(binary) => {
            mask_expr(&mut binary.lhs);
            mask_expr(&mut binary.rhs);
        }
        Expr::Paren(paren) => mask_expr(&mut paren.expr),
        Expr::Subquery(subquery) => mask_expr(&mut subquery.expr),
        Expr::VectorSelector(selector) => mask_selector(selector),
        Expr::MatrixSelector(matrix) => mask_selector(&mut matrix.vs),
        Expr::Call(call) => {
            for arg in &mut call.args.args {
                mask_expr(arg);
            }
        }
        _ => {}
    }
}

fn mask_selector(selector: &mut VectorSelector) {
    for matcher in &mut selector.matchers.matchers {
        if matcher.name != NAME_LABEL {
            matcher.value = MASK.into();
        }
    }
}

fn collect_selectors(expr: &Expr, out: &mut Vec<BTreeMap<String, String>>) {
    match expr {
        Expr::Aggregate(aggregate) => {
            collect_selectors(&aggregate.expr, out);
            if let Some(param) = &aggregate.param {
                collect_selectors(param, out);
            }
        }
        Expr::Unary(unary) => collect_selectors(&unary.expr, out),
        Expr::Binary(binary) => {
            collect_selectors(&binary.lhs, out);
            collect_selectors(&binary.rhs, out);
        }
        Expr::Paren(paren) => collect_selectors(&paren.expr, out),
        Expr::Subquery(subquery) => collect_selectors(&subquery.expr, out),
        Expr::VectorSelector(selector) => out.push(selector_matchers(selector)),
        Expr::MatrixSelector(matrix) => out.push(selector_matchers(&matrix.vs)),
        Expr::Call(call) => {
            for arg in &call.args.args {
                collect_selectors(arg, out);
            }
        }
        _ => {}
    }
}

fn selector_matchers(selector: &VectorSelector) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();

    if let Some(name) = &selector.name {
        map.insert(NAME_LABEL.to_owned(), name.clone());
    }

    for matcher in &selector.matchers.matchers {
        if matcher.name == NAME_LABEL {
            map.insert(NAME_LABEL.to_owned(), matcher.value.clone());
        } else {
            map.insert(matcher.name.clone(), MASK.to_owned());
        }
    }

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matcher_values_do_not_affect_the_fingerprint() {
        let a = query_shape(r#"up{job="prometheus"}"#);
        let b = query_shape(r#"up{job="node-exporter"}"#);

        assert!(!a.fingerprint.is_empty());
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn metric_name_changes_the_fingerprint() {
        let a = query_shape(r#"up{job="x"}"#);
        let b = query_shape(r#"process_start_time_seconds{job="x"}"#);

        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn function_changes_the_fingerprint() {
        let a = query_shape("rate(http_requests_total[5m])");
        let b = query_shape("increase(http_requests_total[5m])");

        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn operator_changes_the_fingerprint() {
        let a = query_shape("foo + bar");
        let b = query_shape("foo - bar");

        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn fingerprint_is_stable_across_runs() {
        let expr = r#"sum by (instance) (rate(http_requests_total{code="500"}[5m]))"#;

        assert_eq!(query_shape(expr).fingerprint, query_shape(expr).fingerprint);
    }

    #[test]
    fn regex_matcher_values_are_masked_too() {
        let a = query_shape(r#"up{job=~"prod-.*"}"#);
        let b = query_shape(r#"up{job=~"staging-.*"}"#);

        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn parse_failure_yields_empty_shape() {
        let shape = query_shape("sum(rate(");

        assert_eq!(shape, QueryShape::default());
    }

    #[test]
    fn matchers_keep_the_name_and_mask_the_rest() {
        let shape = query_shape(r#"sum(rate(http_requests_total{code="200",job="api"}[5m]))"#);

        assert_eq!(shape.label_matchers.len(), 1);

        let matchers = &shape.label_matchers[0];

        assert_eq!(
            matchers.get(NAME_LABEL).map(String::as_str),
            Some("http_requests_total")
        );
        assert_eq!(matchers.get("code").map(String::as_str), Some(MASK));
        assert_eq!(matchers.get("job").map(String::as_str), Some(MASK));
    }

    #[test]
    fn name_via_matcher_is_preserved() {
        let shape = query_shape(r#"{__name__="up",job="api"}"#);

        assert_eq!(
            shape.label_matchers[0].get(NAME_LABEL).map(String::as_str),
            Some("up")
        );
    }

    #[test]
    fn binary_queries_collect_both_selectors() {
        let shape = query_shape(r#"foo{a="1"} / bar{b="2"}"#);

        assert_eq!(shape.label_matchers.len(), 2);
    }
}
