//! Free-form API parameters.
//!
//! Operations accept arbitrary keyword parameters and pass them through to
//! the PVE API untouched.

use serde_json::{Map, Value};

use crate::error::CloudError;

/// Keyword parameters forwarded verbatim to the API.
pub type Params = Map<String, Value>;

/// Encode params as query pairs.
///
/// PVE booleans are `0`/`1`; nested values are sent as JSON text.
#[must_use]
pub fn to_query(params: &Params) -> Vec<(String, String)> {
    params
        .iter()
        .map(|(key, value)| {
            let encoded = match value {
                Value::String(s) => s.clone(),
                Value::Bool(b) => String::from(if *b { "1" } else { "0" }),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (key.clone(), encoded)
        })
        .collect()
}

/// Parse a `key=value` command line argument.
///
/// Values that are valid JSON scalars (numbers, booleans) keep their type;
/// everything else is a string.
///
/// # Errors
/// Returns a usage error if the argument has no `=`.
pub fn parse_kwarg(arg: &str) -> Result<(String, Value), CloudError> {
    let (key, raw) = arg
        .split_once('=')
        .ok_or_else(|| CloudError::Usage(format!("Expected key=value, got '{arg}'")))?;

    let value = match serde_json::from_str::<Value>(raw) {
        Ok(v @ (Value::Number(_) | Value::Bool(_))) => v,
        _ => Value::String(raw.to_string()),
    };

    Ok((key.to_string(), value))
}

/// Parse a list of `key=value` arguments into params.
///
/// # Errors
/// Returns a usage error on the first malformed argument.
pub fn parse_kwargs<S: AsRef<str>>(args: &[S]) -> Result<Params, CloudError> {
    args.iter().map(|a| parse_kwarg(a.as_ref())).collect()
}

/// Read a VM id from params, accepting integers and numeric strings.
///
/// # Errors
/// Returns `MissingParameter` when absent and a usage error when not a valid id.
pub fn require_vmid(params: &Params, key: &str) -> Result<u32, CloudError> {
    let value = params
        .get(key)
        .ok_or_else(|| CloudError::MissingParameter(key.to_string()))?;

    let parsed = match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    };

    parsed.ok_or_else(|| {
        CloudError::Usage(format!("Parameter '{key}' is not a valid VM id: {value}"))
    })
}
