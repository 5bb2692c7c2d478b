//! Podping events parsed from producer-written files.

use serde_json::{Map, Value};

/// Reason used when a file does not carry one.
pub const UNKNOWN_REASON: &str = "unknown";

/// One unit of work: a parsed event file destined for one HTTP call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Path segment appended to the endpoint.
    pub reason: String,
    /// IRIs joined with commas; empty when the file has none.
    pub iris: String,
    /// The file's original JSON, sent as the request body.
    pub body: String,
}

impl Event {
    /// Parse file content as a single JSON object.
    ///
    /// A missing, null, empty or non-string `reason` becomes `"unknown"`.
    /// `iris` is flattened into a comma-joined string; anything other than
    /// an array yields an empty string, and non-string elements are skipped.
    pub fn parse(content: &str) -> Result<Self, serde_json::Error> {
        let object: Map<String, Value> = serde_json::from_str(content)?;

        let reason = match object.get("reason") {
            Some(Value::String(reason)) if !reason.is_empty() => reason.clone(),
            _ => UNKNOWN_REASON.to_string(),
        };

        let iris = match object.get("iris") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(","),
            _ => String::new(),
        };

        Ok(Self {
            reason,
            iris,
            body: content.to_string(),
        })
    }
}
