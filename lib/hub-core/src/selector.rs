//! Label and field selectors of list and watch requests
//!
//! Selectors are parsed into a canonical, sorted form so two requests that
//! spell the same selector differently resolve to the same cached view.

use std::collections::BTreeMap;
use std::fmt;

use crate::{HubError, Result};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Operator {
    Equals(String),
    NotEquals(String),
    In(Vec<String>),
    NotIn(Vec<String>),
    Exists,
    DoesNotExist,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Requirement {
    pub key: String,
    pub op: Operator,
}

impl Requirement {
    fn matches(&self, value: Option<&str>) -> bool {
        match (&self.op, value) {
            (Operator::Equals(v), Some(actual)) => actual == v,
            (Operator::Equals(_), None) => false,
            (Operator::NotEquals(v), actual) => actual != Some(v.as_str()),
            (Operator::In(values), Some(actual)) => values.iter().any(|v| v == actual),
            (Operator::In(_), None) => false,
            (Operator::NotIn(values), actual) => actual.map(|a| !values.iter().any(|v| v == a)).unwrap_or(true),
            (Operator::Exists, actual) => actual.is_some(),
            (Operator::DoesNotExist, actual) => actual.is_none(),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.op {
            Operator::Equals(v) => write!(f, "{}={}", self.key, v),
            Operator::NotEquals(v) => write!(f, "{}!={}", self.key, v),
            Operator::In(values) => write!(f, "{} in ({})", self.key, values.join(",")),
            Operator::NotIn(values) => write!(f, "{} notin ({})", self.key, values.join(",")),
            Operator::Exists => write!(f, "{}", self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// Parsed label and field selector of one request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListSelector {
    pub labels: Vec<Requirement>,
    pub fields: Vec<Requirement>,
}

impl ListSelector {
    /// Parse raw `labelSelector` / `fieldSelector` query values
    pub fn parse(label_selector: Option<&str>, field_selector: Option<&str>) -> Result<Self> {
        let mut labels = match label_selector {
            Some(raw) => split_terms(raw)?
                .iter()
                .map(|term| parse_label_term(term))
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        let mut fields = match field_selector {
            Some(raw) => split_terms(raw)?
                .iter()
                .map(|term| parse_field_term(term))
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        labels.sort();
        labels.dedup();
        fields.sort();
        fields.dedup();
        Ok(Self { labels, fields })
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.fields.is_empty()
    }

    /// Canonical label selector string
    pub fn label_string(&self) -> String {
        self.labels.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
    }

    /// Canonical field selector string
    pub fn field_string(&self) -> String {
        self.fields.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
    }

    /// Evaluate against an object's labels and a field accessor
    pub fn matches<F>(&self, labels: &BTreeMap<String, String>, field: F) -> bool
    where
        F: Fn(&str) -> Option<String>,
    {
        self.labels
            .iter()
            .all(|req| req.matches(labels.get(&req.key).map(String::as_str)))
            && self
                .fields
                .iter()
                .all(|req| req.matches(field(&req.key).as_deref()))
    }
}

impl fmt::Display for ListSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "labels[{}] fields[{}]", self.label_string(), self.field_string())
    }
}

/// Split on commas that are not inside a parenthesised value set
fn split_terms(raw: &str) -> Result<Vec<String>> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in raw.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| HubError::InvalidRequest(format!("unbalanced selector {}", raw)))?;
                current.push(c);
            }
            ',' if depth == 0 => {
                terms.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if depth != 0 {
        return Err(HubError::InvalidRequest(format!("unbalanced selector {}", raw)));
    }
    terms.push(current);
    Ok(terms
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect())
}

fn parse_label_term(term: &str) -> Result<Requirement> {
    for (keyword, set_op) in [(" notin ", false), (" in ", true)] {
        if let Some(idx) = term.find(keyword) {
            let key = term[..idx].trim().to_string();
            let values = term[idx + keyword.len()..].trim();
            let values = values
                .strip_prefix('(')
                .and_then(|v| v.strip_suffix(')'))
                .ok_or_else(|| HubError::InvalidRequest(format!("invalid set requirement {}", term)))?;
            let mut values: Vec<String> = values
                .split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect();
            values.sort();
            let op = if set_op { Operator::In(values) } else { Operator::NotIn(values) };
            return Ok(Requirement { key, op });
        }
    }
    if let Some(key) = term.strip_prefix('!') {
        return Ok(Requirement {
            key: key.trim().to_string(),
            op: Operator::DoesNotExist,
        });
    }
    if term.contains('=') {
        return parse_field_term(term);
    }
    Ok(Requirement {
        key: term.to_string(),
        op: Operator::Exists,
    })
}

fn parse_field_term(term: &str) -> Result<Requirement> {
    let (key, op) = if let Some((k, v)) = term.split_once("!=") {
        (k, Operator::NotEquals(v.trim().to_string()))
    } else if let Some((k, v)) = term.split_once("==") {
        (k, Operator::Equals(v.trim().to_string()))
    } else if let Some((k, v)) = term.split_once('=') {
        (k, Operator::Equals(v.trim().to_string()))
    } else {
        return Err(HubError::InvalidRequest(format!("invalid selector term {}", term)));
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(HubError::InvalidRequest(format!("empty selector key in {}", term)));
    }
    Ok(Requirement {
        key: key.to_string(),
        op,
    })
}
