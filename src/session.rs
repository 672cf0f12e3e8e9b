use reqwest::header::HeaderValue;
use serde_json::Value;

/// Cookie carrying the platform login session. Only probed for diagnostics.
pub const SESSION_COOKIE_NAME: &str = "secure-token";

#[derive(Debug, PartialEq, Eq)]
pub enum SessionError {
    Missing,
    InvalidFormat(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Missing => write!(f, "Missing cookies"),
            SessionError::InvalidFormat(reason) => write!(f, "Invalid cookies format: {}", reason),
        }
    }
}

impl std::error::Error for SessionError {}

/// Turns the caller's `cookies` field into a single `Cookie` header string.
///
/// A string is used verbatim; a sequence of `{name, value}` records is joined
/// as `name=value` pairs with `"; "` in the order given.
pub fn normalize_cookies(raw: Option<&Value>) -> Result<String, SessionError> {
    let cookie_string = match raw {
        None | Some(Value::Null) => return Err(SessionError::Missing),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(pairs)) => pairs
            .iter()
            .enumerate()
            .map(|(idx, pair)| cookie_pair(idx, pair))
            .collect::<Result<Vec<_>, _>>()?
            .join("; "),
        Some(other) => {
            return Err(SessionError::InvalidFormat(format!(
                "expected a string or a list of {{name, value}} records, got {}",
                shape_of(Some(other))
            )))
        }
    };

    if cookie_string.trim().is_empty() {
        return Err(SessionError::Missing);
    }
    if HeaderValue::from_str(&cookie_string).is_err() {
        return Err(SessionError::InvalidFormat(
            "cookie string contains characters not allowed in an HTTP header".to_string(),
        ));
    }
    Ok(cookie_string)
}

fn cookie_pair(idx: usize, pair: &Value) -> Result<String, SessionError> {
    let name = pair
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| SessionError::InvalidFormat(format!("cookie #{} has no string name", idx)))?;
    let value = match pair.get("value") {
        Some(Value::String(s)) => s.clone(),
        Some(v @ (Value::Number(_) | Value::Bool(_))) => v.to_string(),
        _ => {
            return Err(SessionError::InvalidFormat(format!(
                "cookie '{}' has no scalar value",
                name
            )))
        }
    };
    Ok(format!("{}={}", name, value))
}

/// Short description of the JSON shape of the `cookies` field, for the trace log.
pub fn shape_of(raw: Option<&Value>) -> &'static str {
    match raw {
        None => "missing",
        Some(Value::Null) => "null",
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "array",
        Some(Value::Object(_)) => "object",
        Some(Value::Number(_)) => "number",
        Some(Value::Bool(_)) => "boolean",
    }
}

/// Whether a cookie with the given name appears in a normalized cookie string.
pub fn has_cookie(cookie_string: &str, name: &str) -> bool {
    cookie_string
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .any(|(key, _)| key == name)
}
