//! Application-level return codes embedded in upstream JSON bodies.
//!
//! Older upstream revisions report `ret_code`/`ret_msg`, newer ones
//! `retCode`/`retMsg`. Both collapse into one [`AppStatus`].

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppStatus {
    pub code: i64,
    pub message: String,
}

/// Code reported for a return-code field that is present but not a number.
pub const UNREADABLE_CODE: i64 = i64::MIN;

/// Reads the application return code from either naming convention, taking
/// the first field that is not null. Returns `None` when the body carries no
/// return code at all; a code that cannot be read becomes [`UNREADABLE_CODE`].
pub fn app_status(body: &Value) -> Option<AppStatus> {
    let raw_code = first_present(body, "ret_code", "retCode")?;
    let message = first_present(body, "ret_msg", "retMsg")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    match as_code(raw_code) {
        Some(code) => Some(AppStatus { code, message }),
        None => Some(AppStatus {
            code: UNREADABLE_CODE,
            message: format!("unreadable return code {}: {}", raw_code, message),
        }),
    }
}

/// A body without a return code counts as success.
pub fn is_success(body: &Value) -> bool {
    app_status(body).map_or(true, |status| status.code == 0)
}

fn first_present<'a>(body: &'a Value, snake: &str, camel: &str) -> Option<&'a Value> {
    [snake, camel]
        .iter()
        .filter_map(|key| body.get(*key))
        .find(|value| !value.is_null())
}

fn as_code(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
