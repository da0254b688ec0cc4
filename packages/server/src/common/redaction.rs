//! Structured-log field redaction.
//!
//! Log records that reach the live event bus may carry arbitrary structured
//! fields. Any field whose key matches the redaction list is replaced with a
//! censor token before the record leaves the process.

use serde_json::Value;

/// Token substituted for redacted values.
pub const REDACTED: &str = "[REDACTED]";

/// Field names whose values are never emitted. Matching is case-insensitive
/// and applies at any nesting depth.
const REDACTED_FIELDS: &[&str] = &[
    "password",
    "token",
    "apikey",
    "authorization",
    "cookie",
    "encrypteddata",
    "serviceaccountjson",
];

fn is_redacted_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    let flattened: String = lowered.chars().filter(|c| *c != '_' && *c != '-').collect();
    REDACTED_FIELDS.contains(&flattened.as_str())
}

/// Walk a JSON value and mask every field on the redaction list.
pub fn redact_fields(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                if is_redacted_key(key) {
                    *val = Value::String(REDACTED.to_string());
                } else {
                    redact_fields(val);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                redact_fields(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn top_level_secret_is_masked() {
        let mut fields = json!({"password": "hunter2", "host": "example.com"});
        redact_fields(&mut fields);
        assert_eq!(fields["password"], REDACTED);
        assert_eq!(fields["host"], "example.com");
    }

    #[test]
    fn nested_secret_is_masked() {
        let mut fields = json!({"request": {"headers": {"Authorization": "Bearer abc"}}});
        redact_fields(&mut fields);
        assert_eq!(fields["request"]["headers"]["Authorization"], REDACTED);
    }

    #[test]
    fn snake_case_variants_are_masked() {
        let mut fields = json!({"api_key": "k", "service_account_json": "{}"});
        redact_fields(&mut fields);
        assert_eq!(fields["api_key"], REDACTED);
        assert_eq!(fields["service_account_json"], REDACTED);
    }

    #[test]
    fn arrays_are_walked() {
        let mut fields = json!([{"cookie": "session=1"}, {"ok": true}]);
        redact_fields(&mut fields);
        assert_eq!(fields[0]["cookie"], REDACTED);
        assert_eq!(fields[1]["ok"], true);
    }

    #[test]
    fn original_value_never_survives() {
        let mut fields = json!({"outer": {"token": "secret-token-value"}});
        redact_fields(&mut fields);
        let rendered = fields.to_string();
        assert!(!rendered.contains("secret-token-value"));
        assert!(rendered.contains(REDACTED));
    }
}
