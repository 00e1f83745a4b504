//! Typed values carried by a command set.

use crate::schema::Kind;

/// A decoded or to-be-encoded value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<String>),
}

impl Value {
    /// Truthiness as the handlers see it: nonzero numbers and non-empty text are true.
    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(x) => *x != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(v) => !v.is_empty(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(*b as i64),
            Value::Int(i) => Some(*i),
            Value::Float(x) => Some(*x as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(*b as i64 as f64),
            Value::Int(i) => Some(*i as f64),
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// List items; a bare string is treated as a one-item list.
    pub fn as_list(&self) -> Option<Vec<&str>> {
        match self {
            Value::List(v) => Some(v.iter().map(String::as_str).collect()),
            Value::Str(s) => Some(vec![s.as_str()]),
            _ => None,
        }
    }

    /// Canonical wire token for this value under `kind`.
    ///
    /// Returns `None` when the value cannot be expressed in that kind,
    /// in which case the encoder leaves the key out. Strings must be a
    /// single non-empty token, since the decoder pairs keys and values by
    /// whitespace.
    pub fn render(&self, kind: Kind) -> Option<String> {
        match kind {
            Kind::Bool | Kind::Int { .. } => self.as_int().map(|i| i.to_string()),
            Kind::Float { .. } => self.as_float().map(|x| format!("{x:.2}")),
            Kind::Str(_) => match self {
                Value::Str(s) if is_token(s) => Some(s.clone()),
                Value::Int(i) => Some(i.to_string()),
                _ => None,
            },
            Kind::List(_) => {
                let items = self.as_list()?;
                items
                    .iter()
                    .all(|item| is_token(item) && !item.contains(','))
                    .then(|| items.join(","))
                    .filter(|joined| !joined.is_empty())
            }
        }
    }

    /// Approximate equality: floats compare within the 2-decimal wire precision.
    pub fn approx_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => (a - b).abs() <= 0.01,
            (a, b) => a == b,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::List(v)
    }
}

fn is_token(s: &str) -> bool {
    !s.is_empty() && !s.contains(char::is_whitespace)
}
