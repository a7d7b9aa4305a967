//! Cross-resource references inside property mappings.
//!
//! Two forms are recognised:
//! - a mapping with the single key `ref`: `{ ref: vpc }` or `{ ref: vpc.cidr }`
//! - string interpolation: `"subnet-${vpc.cidr}"`, with `$$` for a literal `$`
//!
//! A bare name stands for the physical id of that resource; `name.attr`
//! stands for one of its outputs. Nested outputs are reached with further
//! dots (`name.endpoint.host`).

use serde_json::{Map, Value};
use std::fmt;

/// Key marking a reference mapping.
pub const REF_KEY: &str = "ref";

/// A parsed reference to another resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    /// Logical name of the referenced resource.
    pub target: String,
    /// Output path, or `None` for the physical id.
    pub attribute: Option<String>,
}

/// Piece of an interpolated string.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Ref(Reference),
}

impl Reference {
    /// Parses `name` or `name.attr`.
    ///
    /// # Errors
    ///
    /// Returns a description when either part is empty.
    pub fn parse(expr: &str) -> Result<Self, String> {
        let expr = expr.trim();
        let (target, attribute) = match expr.split_once('.') {
            Some((target, attr)) => (target, Some(attr)),
            None => (expr, None),
        };

        if target.is_empty() {
            return Err(format!("reference '{expr}' has no resource name"));
        }
        if let Some(attr) = attribute
            && (attr.is_empty() || attr.split('.').any(str::is_empty))
        {
            return Err(format!("reference '{expr}' has an empty attribute"));
        }

        Ok(Self {
            target: target.to_string(),
            attribute: attribute.map(str::to_string),
        })
    }

    /// Looks up the referenced value in a resource's physical id and outputs.
    #[must_use]
    pub fn select(&self, physical_id: &str, outputs: &Map<String, Value>) -> Option<Value> {
        let Some(attribute) = &self.attribute else {
            return Some(Value::String(physical_id.to_string()));
        };

        let mut parts = attribute.split('.');
        let first = parts.next()?;
        let mut current = outputs.get(first)?;
        for part in parts {
            current = current.get(part)?;
        }
        Some(current.clone())
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.attribute {
            Some(attr) => write!(f, "{}.{}", self.target, attr),
            None => write!(f, "{}", self.target),
        }
    }
}

/// Collects every reference in a property value, in key order.
///
/// # Errors
///
/// Returns a description of the first malformed reference.
pub fn collect_references(value: &Value) -> Result<Vec<Reference>, String> {
    let mut refs = Vec::new();
    collect_into(value, &mut refs)?;
    Ok(refs)
}

fn collect_into(value: &Value, refs: &mut Vec<Reference>) -> Result<(), String> {
    match value {
        Value::String(s) => {
            for segment in parse_template(s)? {
                if let Segment::Ref(r) = segment {
                    refs.push(r);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_into(item, refs)?;
            }
        }
        Value::Object(map) => {
            if let Some(expr) = ref_expression(map)? {
                refs.push(Reference::parse(expr)?);
            } else {
                for item in map.values() {
                    collect_into(item, refs)?;
                }
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

/// Returns the expression of a `{ ref: ... }` mapping.
fn ref_expression(map: &Map<String, Value>) -> Result<Option<&str>, String> {
    let Some(target) = map.get(REF_KEY) else {
        return Ok(None);
    };
    if map.len() != 1 {
        return Err(String::from("a 'ref' mapping must not have other keys"));
    }
    match target {
        Value::String(expr) => Ok(Some(expr)),
        other => Err(format!("'ref' must be a string, found {other}")),
    }
}

/// Replaces every reference in `value` using `lookup`.
///
/// `{ ref }` mappings take the referenced value as is. Interpolated
/// strings render strings verbatim and other values as JSON.
///
/// # Errors
///
/// Returns a description when a reference is malformed or `lookup`
/// cannot supply its value.
pub fn resolve<F>(value: &Value, lookup: &F) -> Result<Value, String>
where
    F: Fn(&Reference) -> Option<Value>,
{
    match value {
        Value::String(s) => {
            let mut rendered = String::with_capacity(s.len());
            for segment in parse_template(s)? {
                match segment {
                    Segment::Literal(text) => rendered.push_str(&text),
                    Segment::Ref(r) => match lookup_value(&r, lookup)? {
                        Value::String(text) => rendered.push_str(&text),
                        other => rendered.push_str(&other.to_string()),
                    },
                }
            }
            Ok(Value::String(rendered))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| resolve(item, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            if let Some(expr) = ref_expression(map)? {
                return lookup_value(&Reference::parse(expr)?, lookup);
            }
            let mut resolved = Map::with_capacity(map.len());
            for (key, item) in map {
                resolved.insert(key.clone(), resolve(item, lookup)?);
            }
            Ok(Value::Object(resolved))
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => Ok(value.clone()),
    }
}

fn lookup_value<F>(reference: &Reference, lookup: &F) -> Result<Value, String>
where
    F: Fn(&Reference) -> Option<Value>,
{
    lookup(reference).ok_or_else(|| format!("cannot resolve reference '{reference}'"))
}

/// Splits a string into literal text and `${...}` references.
fn parse_template(s: &str) -> Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = s.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if c != '$' {
            literal.push(c);
            continue;
        }

        match chars.peek() {
            Some((_, '$')) => {
                chars.next();
                literal.push('$');
            }
            Some((_, '{')) => {
                chars.next();
                let start = i + 2;
                let Some(len) = s[start..].find('}') else {
                    return Err(format!("unterminated '${{' in \"{s}\""));
                };
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Ref(Reference::parse(&s[start..start + len])?));
                // Skip past the closing brace.
                for (j, _) in chars.by_ref() {
                    if j == start + len {
                        break;
                    }
                }
            }
            _ => literal.push('$'),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}
