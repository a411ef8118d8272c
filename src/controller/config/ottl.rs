//! Builders and checks for collector transformation-language expressions

use thiserror::Error;

use crate::controller::pipeline::SignalType;
use crate::crd::{FilterSpec, TransformSpec};

pub fn resource_attribute(key: &str) -> String {
    format!("resource.attributes[\"{key}\"]")
}

pub fn attribute(key: &str) -> String {
    format!("attributes[\"{key}\"]")
}

pub fn resource_attribute_equals(key: &str, value: &str) -> String {
    format!("{} == \"{value}\"", resource_attribute(key))
}

pub fn resource_attribute_is_nil(key: &str) -> String {
    format!("{} == nil", resource_attribute(key))
}

pub fn resource_attribute_is_not_nil(key: &str) -> String {
    format!("{} != nil", resource_attribute(key))
}

pub fn is_match(path: &str, regex: &str) -> String {
    format!("IsMatch({path}, \"{regex}\")")
}

pub fn not(expr: &str) -> String {
    format!("not({expr})")
}

/// Conjunction of the given expressions
pub fn join_with_and<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts
        .into_iter()
        .map(Into::into)
        .collect::<Vec<String>>()
        .join(" and ")
}

/// Disjunction of the given expressions, parenthesized when there is more than one
pub fn join_with_or<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let parts: Vec<String> = parts.into_iter().map(Into::into).collect();
    match parts.len() {
        1 => parts.into_iter().next().unwrap_or_default(),
        _ => format!("({})", parts.join(" or ")),
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {kind} '{expression}': {detail}")]
pub struct OttlError {
    pub kind: &'static str,
    pub expression: String,
    pub detail: String,
}

/// Path contexts every signal may address
const COMMON_CONTEXTS: &[&str] = &["resource", "scope"];
const ALL_CONTEXTS: &[&str] = &[
    "resource", "scope", "log", "span", "spanevent", "metric", "datapoint",
];

fn allowed_contexts(signal: SignalType) -> &'static [&'static str] {
    match signal {
        SignalType::Log => &["log"],
        SignalType::Trace => &["span", "spanevent"],
        SignalType::Metric => &["metric", "datapoint"],
    }
}

/// Lexical check of user-provided transform statements and filter conditions.
///
/// This catches what the collector would refuse at start-up: empty
/// expressions, unbalanced brackets or quotes, statements that are not a
/// function call, and paths into a context the signal does not have.
pub fn validate_statements(
    signal: SignalType,
    transforms: &[TransformSpec],
    filters: &[FilterSpec],
) -> Result<(), OttlError> {
    for transform in transforms {
        for statement in &transform.statements {
            check_expression(signal, "statement", statement)?;
            check_statement_shape(statement)?;
        }
        for condition in &transform.conditions {
            check_expression(signal, "condition", condition)?;
        }
    }
    for filter in filters {
        for condition in &filter.conditions {
            check_expression(signal, "condition", condition)?;
        }
    }
    Ok(())
}

fn err(kind: &'static str, expression: &str, detail: impl Into<String>) -> OttlError {
    OttlError {
        kind,
        expression: expression.to_string(),
        detail: detail.into(),
    }
}

fn check_expression(signal: SignalType, kind: &'static str, expr: &str) -> Result<(), OttlError> {
    if expr.trim().is_empty() {
        return Err(err(kind, expr, "expression is empty"));
    }

    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut word = String::new();
    let mut words = Vec::new();

    for c in expr.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
            word.push(c);
            continue;
        }
        if !word.is_empty() {
            words.push(std::mem::take(&mut word));
        }
        match c {
            '"' => in_string = true,
            '(' | '[' | '{' => stack.push(c),
            ')' | ']' | '}' => {
                let open = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if stack.pop() != Some(open) {
                    return Err(err(kind, expr, format!("unexpected '{c}'")));
                }
            }
            _ => {}
        }
    }
    if !word.is_empty() {
        words.push(word);
    }
    if in_string {
        return Err(err(kind, expr, "unterminated string literal"));
    }
    if let Some(open) = stack.pop() {
        return Err(err(kind, expr, format!("unclosed '{open}'")));
    }

    let allowed = allowed_contexts(signal);
    for w in words {
        let Some((context, _)) = w.split_once('.') else {
            continue;
        };
        if ALL_CONTEXTS.contains(&context)
            && !COMMON_CONTEXTS.contains(&context)
            && !allowed.contains(&context)
        {
            return Err(err(
                kind,
                expr,
                format!("path context '{context}' is not available for {signal} pipelines"),
            ));
        }
    }
    Ok(())
}

fn check_statement_shape(statement: &str) -> Result<(), OttlError> {
    let head = statement.trim_start();
    let name_len = head
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .count();
    if name_len == 0 || !head[name_len..].trim_start().starts_with('(') {
        return Err(err(
            "statement",
            statement,
            "a statement must start with a function call",
        ));
    }
    Ok(())
}
