//! Text codec between command sets and `CODE VALUE ` token streams.
//!
//! ```text
//! IDN EXN SSA 5000 FRC 0.20 END\r\n
//! ```
//!
//! Keys not in the schema are dropped on both encode and decode.
//! Decoding never fails outright: each key either validates into the
//! result or, when error reporting is on, lands in the `ERR` list.

use crate::command::CommandSet;
use crate::schema::{lookup, Code, Kind};
use crate::value::Value;
use crate::TERMINATOR;

/// Render a command set to wire bytes, terminator included.
pub fn encode(cmd: &CommandSet) -> Vec<u8> {
    let mut out = String::new();
    for (code, value) in cmd.iter() {
        if let Some(token) = value.render(code.kind()) {
            out.push_str(code.as_str());
            out.push(' ');
            out.push_str(&token);
            out.push(' ');
        }
    }

    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(TERMINATOR);
    bytes
}

/// Decode one frame of text (terminator already removed).
///
/// Keys failing validation are left out of the result. With
/// `report_errors` they are also collected under [`Code::ERR`], which is
/// present only when non-empty.
pub fn decode(text: &str, report_errors: bool) -> CommandSet {
    let tokens = text.split_whitespace().collect::<Vec<_>>();
    let mut cmd = CommandSet::new();
    let mut errors: Vec<&'static str> = Vec::new();

    // A trailing unpaired token is ignored
    for pair in tokens.chunks_exact(2) {
        let Some(code) = lookup(pair[0]) else {
            continue;
        };

        match validate(code.kind(), pair[1]) {
            Some(value) if code == Code::ERR => {
                // Errors reported by the sender join our own list
                if let Value::List(items) = value {
                    for item in items {
                        if let Some(c) = lookup(&item) {
                            errors.push(c.as_str());
                        }
                    }
                }
            }
            Some(value) => {
                cmd.insert(code, value);
            }
            None => errors.push(code.as_str()),
        }
    }

    if report_errors && !errors.is_empty() {
        let mut unique: Vec<String> = Vec::with_capacity(errors.len());
        for e in errors {
            if !unique.iter().any(|u| u == e) {
                unique.push(e.to_owned());
            }
        }
        cmd.insert(Code::ERR, unique);
    }

    cmd
}

/// Parse and range-check one token against its schema kind.
fn validate(kind: Kind, token: &str) -> Option<Value> {
    match kind {
        Kind::Bool => match token {
            "0" => Some(Value::Bool(false)),
            "1" => Some(Value::Bool(true)),
            _ => None,
        },
        Kind::Int { min, max } => {
            let v = token.parse::<i64>().ok()?;
            (min..=max).contains(&v).then_some(Value::Int(v))
        }
        Kind::Float { min, max } => {
            let v = token.parse::<f64>().ok()?;
            (v.is_finite() && v >= min && v <= max).then_some(Value::Float(v))
        }
        Kind::Str(domain) => {
            (domain.is_empty() || domain.contains(&token)).then(|| Value::Str(token.to_owned()))
        }
        Kind::List(domain) => {
            let items = token.split(',').collect::<Vec<_>>();
            let valid = items
                .iter()
                .all(|item| !item.is_empty() && (domain.is_empty() || domain.contains(item)));
            valid.then(|| Value::List(items.into_iter().map(str::to_owned).collect()))
        }
    }
}
