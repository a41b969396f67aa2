//! Report payload sent to the context collector
//!
//! A report is a flat JSON array; every element carries its own data type
//! so samples from all sources travel in one request:
//!
//! ```text
//! [
//!   {"timestamp": 1700000000, "dataTypeID": "ctx.sdk.network", "value": {"connectionType": -99}},
//!   {"timestamp": 1700000060, "dataTypeID": "ctx.sdk.location", "value": {"lat": 43.6, "lng": -79.3}}
//! ]
//! ```

use serde::{Deserialize, Serialize};

/// One buffered sample in collector format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    /// Collection time in whole seconds since the Unix epoch
    pub timestamp: i64,

    /// Type id of the source that produced the sample
    #[serde(rename = "dataTypeID")]
    pub data_type_id: String,

    /// Sample in the source's wire format
    pub value: serde_json::Value,
}

/// Error message extracted from a collector error body
///
/// The collector reports failures as JSON with the message in one of several
/// fields, checked in order: `messageJSON`, `exceptionMessage`, `message`.
pub fn parse_error_message(body: &str) -> String {
    const UNEXPECTED: &str = "Unexpected error has occurred";

    let parsed: serde_json::Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) => return "Malformed server response".to_string(),
    };

    ["messageJSON", "exceptionMessage", "message"]
        .iter()
        .find_map(|field| match parsed.get(*field) {
            Some(serde_json::Value::String(s)) => (!s.is_empty()).then(|| s.clone()),
            Some(serde_json::Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        })
        .unwrap_or_else(|| UNEXPECTED.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_field_names() {
        let entry = ReportEntry {
            timestamp: 1_700_000_000,
            data_type_id: "ctx.sdk.network".to_string(),
            value: json!({"connectionType": -99}),
        };
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            json!({
                "timestamp": 1_700_000_000,
                "dataTypeID": "ctx.sdk.network",
                "value": {"connectionType": -99}
            })
        );
    }

    #[test]
    fn test_parse_error_message_field_precedence() {
        assert_eq!(
            parse_error_message(r#"{"message": "m", "exceptionMessage": "e"}"#),
            "e"
        );
        assert_eq!(
            parse_error_message(r#"{"message": "m", "messageJSON": "j", "exceptionMessage": "e"}"#),
            "j"
        );
        assert_eq!(parse_error_message(r#"{"message": "m"}"#), "m");
    }

    #[test]
    fn test_parse_error_message_fallbacks() {
        assert_eq!(
            parse_error_message(r#"{"status": 500}"#),
            "Unexpected error has occurred"
        );
        assert_eq!(parse_error_message("<html>"), "Malformed server response");
        assert_eq!(parse_error_message(""), "Malformed server response");
    }
}
