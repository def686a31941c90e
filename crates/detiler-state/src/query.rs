//! Index query language: parser and evaluator.
//!
//! A query is either the wildcard `*` or a whitespace-separated conjunction
//! of field predicates:
//!
//! | Form | Meaning |
//! |---|---|
//! | `@f:[lo hi]` | numeric range, inclusive; `(`-prefixed bound is exclusive, `-inf`/`+inf`/`inf` unbounded |
//! | `@f:{a\|b}` | tag equal to any listed value |
//! | `@f:(a\|b)` | same as the tag form |
//! | `@f:[WITHIN $p]` | document shape lies within parameter `p` |
//! | `@f:[CONTAINS $p]` | document shape contains parameter `p` |
//!
//! Inside a tag list a backslash makes the next character literal and
//! unescaped whitespace is ignored; [`escape_tag`] produces such values.
//! Array-valued document fields match when any element matches.

use std::collections::HashMap;

use geo::{Contains, Within};
use geo_types::Geometry;
use serde_json::Value;

use crate::engine::{FieldKind, IndexSchema};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    All,
    And(Vec<Predicate>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Numeric {
        field: String,
        min: Bound,
        max: Bound,
    },
    Tag {
        field: String,
        values: Vec<String>,
    },
    Geo {
        field: String,
        relation: GeoRelation,
        param: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bound {
    Unbounded,
    Inclusive(f64),
    Exclusive(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoRelation {
    Within,
    Contains,
}

impl Predicate {
    fn field(&self) -> &str {
        match self {
            Predicate::Numeric { field, .. }
            | Predicate::Tag { field, .. }
            | Predicate::Geo { field, .. } => field,
        }
    }
}

fn syntax(msg: impl Into<String>) -> StoreError {
    StoreError::Validation(format!("query syntax: {}", msg.into()))
}

/// Parse a query string.
pub fn parse(input: &str) -> StoreResult<Query> {
    let input = input.trim();
    if input == "*" {
        return Ok(Query::All);
    }
    if input.is_empty() {
        return Err(syntax("empty query"));
    }

    let mut predicates = Vec::new();
    let mut rest = input;
    while !rest.is_empty() {
        let (predicate, tail) = parse_predicate(rest)?;
        predicates.push(predicate);
        rest = tail.trim_start();
    }
    Ok(Query::And(predicates))
}

fn parse_predicate(input: &str) -> StoreResult<(Predicate, &str)> {
    let body = input
        .strip_prefix('@')
        .ok_or_else(|| syntax(format!("expected '@' at {input:?}")))?;
    let colon = body
        .find(':')
        .ok_or_else(|| syntax(format!("missing ':' after field in {input:?}")))?;
    let field = &body[..colon];
    if field.is_empty() || !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(syntax(format!("invalid field name {field:?}")));
    }
    let field = field.to_string();
    let expr = &body[colon + 1..];

    let close = match expr.chars().next() {
        Some('[') => ']',
        Some('{') => '}',
        Some('(') => ')',
        _ => return Err(syntax(format!("expected '[', '{{' or '(' after @{field}:"))),
    };
    if close != ']' {
        let (values, tail) = parse_tag_list(&field, &expr[1..], close)?;
        return Ok((Predicate::Tag { field, values }, tail));
    }
    let end = expr
        .find(close)
        .ok_or_else(|| syntax(format!("unterminated expression for @{field}")))?;
    let inner = expr[1..end].trim();
    Ok((parse_bracket(field, inner)?, &expr[end + 1..]))
}

/// Escape a tag value so it survives [`parse`] unchanged.
pub fn escape_tag(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if !(c.is_ascii_alphanumeric() || c == '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn parse_tag_list<'a>(field: &str, body: &'a str, close: char) -> StoreResult<(Vec<String>, &'a str)> {
    let mut values = Vec::new();
    let mut current = String::new();
    let mut chars = body.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, literal)) => current.push(literal),
                None => break,
            },
            '|' => values.push(std::mem::take(&mut current)),
            c if c == close => {
                values.push(current);
                values.retain(|v| !v.is_empty());
                if values.is_empty() {
                    return Err(syntax(format!("empty value list for @{field}")));
                }
                return Ok((values, &body[i + c.len_utf8()..]));
            }
            c if c.is_whitespace() => {}
            c => current.push(c),
        }
    }
    Err(syntax(format!("unterminated expression for @{field}")))
}

fn parse_bracket(field: String, inner: &str) -> StoreResult<Predicate> {
    let parts: Vec<&str> = inner.split_whitespace().collect();
    match parts.as_slice() {
        [op, param] if op.eq_ignore_ascii_case("WITHIN") || op.eq_ignore_ascii_case("CONTAINS") => {
            let param = param
                .strip_prefix('$')
                .ok_or_else(|| syntax(format!("geo parameter must start with '$': {param}")))?;
            let relation = if op.eq_ignore_ascii_case("WITHIN") {
                GeoRelation::Within
            } else {
                GeoRelation::Contains
            };
            Ok(Predicate::Geo {
                field,
                relation,
                param: param.to_string(),
            })
        }
        [min, max] => Ok(Predicate::Numeric {
            field,
            min: parse_bound(min, true)?,
            max: parse_bound(max, false)?,
        }),
        _ => Err(syntax(format!("expected two bounds for @{field}, got {inner:?}"))),
    }
}

fn parse_bound(token: &str, lower: bool) -> StoreResult<Bound> {
    match token {
        "-inf" if lower => return Ok(Bound::Unbounded),
        "+inf" | "inf" if !lower => return Ok(Bound::Unbounded),
        _ => {}
    }
    let (exclusive, number) = match token.strip_prefix('(') {
        Some(n) => (true, n),
        None => (false, token),
    };
    let value: f64 = number
        .parse()
        .map_err(|_| syntax(format!("invalid numeric bound {token:?}")))?;
    Ok(if exclusive {
        Bound::Exclusive(value)
    } else {
        Bound::Inclusive(value)
    })
}

/// Geometry parameters resolved once per search.
pub type GeoParams = HashMap<String, Geometry<f64>>;

impl Query {
    /// Check every predicate against the index schema and its parameters.
    pub fn check(&self, schema: &IndexSchema, params: &GeoParams) -> StoreResult<()> {
        let Query::And(predicates) = self else {
            return Ok(());
        };
        for predicate in predicates {
            let kind = schema.field_kind(predicate.field()).ok_or_else(|| {
                StoreError::Validation(format!(
                    "field {} is not indexed by {}",
                    predicate.field(),
                    schema.name
                ))
            })?;
            let expected = match predicate {
                Predicate::Numeric { .. } => FieldKind::Numeric,
                Predicate::Tag { .. } => FieldKind::Tag,
                Predicate::Geo { param, .. } => {
                    if !params.contains_key(param) {
                        return Err(StoreError::Validation(format!(
                            "missing query parameter ${param}"
                        )));
                    }
                    FieldKind::GeoShape
                }
            };
            if kind != expected {
                return Err(StoreError::Validation(format!(
                    "field {} is {kind:?}, not {expected:?}",
                    predicate.field()
                )));
            }
        }
        Ok(())
    }

    pub fn matches(&self, doc: &Value, params: &GeoParams) -> bool {
        match self {
            Query::All => true,
            Query::And(predicates) => predicates.iter().all(|p| p.matches(doc, params)),
        }
    }
}

impl Predicate {
    fn matches(&self, doc: &Value, params: &GeoParams) -> bool {
        let Some(value) = doc.get(self.field()) else {
            return false;
        };
        match self {
            Predicate::Numeric { min, max, .. } => {
                any_scalar(value, |v| v.as_f64().is_some_and(|n| in_range(n, *min, *max)))
            }
            Predicate::Tag { values, .. } => any_scalar(value, |v| {
                tag_text(v).is_some_and(|t| values.iter().any(|candidate| *candidate == t))
            }),
            Predicate::Geo {
                relation, param, ..
            } => {
                let (Some(wkt), Some(query_geom)) = (value.as_str(), params.get(param)) else {
                    return false;
                };
                // Documents whose shape does not parse are not part of the index.
                let Ok(doc_geom) = detiler_core::geometry::parse_wkt(wkt) else {
                    return false;
                };
                match relation {
                    GeoRelation::Within => doc_geom.is_within(query_geom),
                    GeoRelation::Contains => doc_geom.contains(query_geom),
                }
            }
        }
    }
}

fn any_scalar(value: &Value, pred: impl Fn(&Value) -> bool) -> bool {
    match value {
        Value::Array(items) => items.iter().any(&pred),
        other => pred(other),
    }
}

fn tag_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn in_range(n: f64, min: Bound, max: Bound) -> bool {
    let above = match min {
        Bound::Unbounded => true,
        Bound::Inclusive(m) => n >= m,
        Bound::Exclusive(m) => n > m,
    };
    let below = match max {
        Bound::Unbounded => true,
        Bound::Inclusive(m) => n <= m,
        Bound::Exclusive(m) => n < m,
    };
    above && below
}
