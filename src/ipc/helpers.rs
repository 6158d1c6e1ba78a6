use crate::calc::CalcError;
use crate::ipc::error::err;
use crate::ipc::types::Request;
use serde_json::json;

/// Trimmed, non-empty string param or a ready-made `bad_params` response.
pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    match req.params.get(key).and_then(|v| v.as_str()).map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(err(&req.id, "bad_params", format!("missing {}", key), None)),
    }
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn calc_err(id: &str, e: CalcError) -> serde_json::Value {
    err(id, &e.code, e.message, e.details)
}

pub fn db_err(id: &str, code: &str, e: rusqlite::Error, table: &str) -> serde_json::Value {
    err(id, code, e.to_string(), Some(json!({ "table": table })))
}
