//! Scoring script payload parsing.

use std::collections::HashMap;

use serde_json::Value;

/// Parse a scoring script's stdout into `check id → passed`.
///
/// Two shapes are accepted: a flat object of booleans, or the same
/// object nested under a `"checks"` key. Non-boolean values are ignored;
/// a payload with no boolean check data at all is an error.
pub fn parse_check_payload(raw: &str) -> Result<HashMap<String, bool>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("empty payload".to_string());
    }

    let value: Value =
        serde_json::from_str(trimmed).map_err(|e| format!("payload is not JSON: {e}"))?;

    if let Some(object) = value.as_object() {
        let flat: HashMap<String, bool> = object
            .iter()
            .filter_map(|(key, v)| v.as_bool().map(|b| (key.clone(), b)))
            .collect();
        if !flat.is_empty() {
            return Ok(flat);
        }

        if let Some(checks) = object.get("checks").and_then(Value::as_object) {
            return Ok(checks
                .iter()
                .filter_map(|(key, v)| v.as_bool().map(|b| (key.clone(), b)))
                .collect());
        }
    }

    Err("payload missing boolean check data".to_string())
}
