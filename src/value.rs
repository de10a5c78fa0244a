use crate::blocks::Literal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

/// A runtime value. Variables, reporters and block arguments all carry one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl Default for Value {
    fn default() -> Self {
        Value::Number(0.0)
    }
}

impl From<&Literal> for Value {
    fn from(lit: &Literal) -> Self {
        match lit {
            Literal::Number(n) => Value::Number(*n),
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Text(s) => Value::Text(s.clone()),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

impl Value {
    /// Lenient numeric cast used by operators: anything unparsable is 0.
    pub fn to_number(&self) -> f64 {
        match self {
            Value::Number(n) if n.is_nan() => 0.0,
            Value::Number(n) => *n,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Text(s) => parse_number(s).unwrap_or(0.0),
        }
    }

    /// Strict numeric cast used for primitive arguments. Empty text counts as
    /// zero, any other non-numeric text is rejected.
    pub fn try_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) if n.is_nan() => Some(0.0),
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(f64::from(u8::from(*b))),
            Value::Text(s) if s.trim().is_empty() => Some(0.0),
            Value::Text(s) => parse_number(s),
        }
    }

    pub fn to_bool(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Text(s) => {
                let lowered = s.to_lowercase();
                !(s.is_empty() || lowered == "0" || lowered == "false")
            }
        }
    }

    pub fn as_text(&self) -> String {
        self.to_string()
    }

    /// Numeric comparison when both sides look like numbers, otherwise
    /// case-insensitive text comparison.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self.numeric_view(), other.numeric_view()) {
            (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
            _ => self
                .as_text()
                .to_lowercase()
                .cmp(&other.as_text().to_lowercase()),
        }
    }

    pub fn loosely_equals(&self, other: &Value) -> bool {
        self.compare(other) == Ordering::Equal
    }

    fn numeric_view(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(_) => None,
            Value::Text(s) if s.trim().is_empty() => None,
            Value::Text(s) => parse_number(s),
        }
    }
}

pub fn parse_number(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(hex) = trimmed.strip_prefix("0x") {
        return i64::from_str_radix(hex, 16).ok().map(|n| n as f64);
    }
    match trimmed.parse::<f64>() {
        Ok(n) if n.is_nan() => None,
        Ok(n) => Some(n),
        Err(_) => None,
    }
}

pub fn format_number(v: f64) -> String {
    if v.is_infinite() {
        return if v > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if (v - v.round()).abs() < 1e-9 && v.abs() < 1e15 {
        format!("{}", v.round() as i64)
    } else {
        let s = format!("{:.10}", v);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}
