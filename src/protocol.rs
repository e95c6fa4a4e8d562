//! The shim<->governor wire protocol: one UTF-8 JSON object per line.
//!
//! Structurally this follows `network/protocol.rs`'s precedent of one struct
//! per message type with an `encode`/`decode` pair and roundtrip tests, but
//! the wire format itself is JSON-lines (`serde_json`) rather than manual
//! little-endian byte packing, per this project's framing requirement.
//! Unknown fields are tolerated on decode (`#[serde(default)]` throughout)
//! so older/newer shims and governors stay forward-compatible.

use serde::{Deserialize, Serialize};

use crate::classifier::Classification;
use crate::validation::is_not_empty;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquireRequestData {
    pub tool: String,
    pub args_hash: String,
    pub requested_tokens: u32,
    pub timeout_ms: u64,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub source_file: Option<String>,
    #[serde(default)]
    pub is_ltcg: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquireResponseData {
    pub granted: bool,
    #[serde(default)]
    pub lease_id: Option<String>,
    #[serde(default)]
    pub granted_tokens: u32,
    pub recommended_parallelism: u32,
    #[serde(default)]
    pub reason: Option<String>,
    pub commit_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequestData {
    pub lease_id: String,
    pub peak_working_set_bytes: u64,
    pub peak_commit_bytes: u64,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub stderr_had_diagnostics: bool,
    #[serde(default)]
    pub stderr_digest: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseResponseData {
    pub acknowledged: bool,
    pub classification: Classification,
    #[serde(default)]
    pub message: Option<String>,
    pub should_retry: bool,
    #[serde(default)]
    pub retry_with_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StatusRequestData {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponseData {
    pub total_tokens: u32,
    pub available_tokens: u32,
    pub active_leases: u32,
    pub commit_ratio: f64,
    pub commit_charge_bytes: u64,
    pub commit_limit_bytes: u64,
    pub available_memory_bytes: u64,
    pub recommended_parallelism: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequestData {
    pub lease_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponseData {
    pub alive: bool,
    pub timestamp: u64,
}

/// One line on the wire: `{"type": "...", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: T,
}

impl<T: Serialize> Envelope<T> {
    pub fn new(kind: impl Into<String>, data: T) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Encodes this envelope as one LF-terminated JSON line.
    pub fn encode_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// A request received from a shim, after stripping the envelope's `type`
/// tag and routing to the matching payload variant.
#[derive(Debug, Clone)]
pub enum Request {
    Acquire(AcquireRequestData),
    Release(ReleaseRequestData),
    Status(StatusRequestData),
    Heartbeat(HeartbeatRequestData),
}

/// Parses one line of input into a typed `Request`, or a malformed-message
/// error carrying a reason suitable for the protocol's `{"error": "..."}`
/// response.
pub fn parse_request(line: &str) -> Result<Request, String> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| format!("invalid JSON: {e}"))?;

    let kind = value
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "missing 'type' field".to_string())?;

    let data = value
        .get("data")
        .cloned()
        .unwrap_or(serde_json::Value::Null);

    match kind {
        "acquire" => {
            let data: AcquireRequestData =
                serde_json::from_value(data).map_err(|e| format!("malformed acquire data: {e}"))?;
            is_not_empty(&data.tool).map_err(|e| format!("malformed acquire data: {e}"))?;
            Ok(Request::Acquire(data))
        }
        "release" => {
            let data: ReleaseRequestData =
                serde_json::from_value(data).map_err(|e| format!("malformed release data: {e}"))?;
            is_not_empty(&data.lease_id).map_err(|e| format!("malformed release data: {e}"))?;
            Ok(Request::Release(data))
        }
        "status" => Ok(Request::Status(StatusRequestData::default())),
        "heartbeat" => {
            let data: HeartbeatRequestData = serde_json::from_value(data)
                .map_err(|e| format!("malformed heartbeat data: {e}"))?;
            is_not_empty(&data.lease_id).map_err(|e| format!("malformed heartbeat data: {e}"))?;
            Ok(Request::Heartbeat(data))
        }
        other => Err(format!("unrecognized message type '{other}'")),
    }
}

/// Encodes a one-shot protocol-level error response.
pub fn encode_error(reason: &str) -> String {
    let mut line = serde_json::json!({ "error": reason }).to_string();
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_request_roundtrip() {
        let data = AcquireRequestData {
            tool: "cl".into(),
            args_hash: "abc123".into(),
            requested_tokens: 2,
            timeout_ms: 60_000,
            working_directory: Some("/tmp/build".into()),
            source_file: Some("main.cpp".into()),
            is_ltcg: None,
        };
        let envelope = Envelope::new("acquire", data);
        let line = envelope.encode_line().unwrap();
        assert!(line.ends_with('\n'));

        let parsed = parse_request(line.trim_end()).unwrap();
        match parsed {
            Request::Acquire(d) => {
                assert_eq!(d.tool, "cl");
                assert_eq!(d.requested_tokens, 2);
                assert_eq!(d.working_directory.as_deref(), Some("/tmp/build"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn release_request_roundtrip() {
        let data = ReleaseRequestData {
            lease_id: "abc123def456".into(),
            peak_working_set_bytes: 1 << 30,
            peak_commit_bytes: 2 << 30,
            exit_code: 0,
            duration_ms: 3000,
            stderr_had_diagnostics: false,
            stderr_digest: None,
        };
        let envelope = Envelope::new("release", data);
        let line = envelope.encode_line().unwrap();
        let parsed = parse_request(line.trim_end()).unwrap();
        match parsed {
            Request::Release(d) => assert_eq!(d.lease_id, "abc123def456"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let line = r#"{"type":"heartbeat","data":{"leaseId":"abc123def456","extra":"field","fromTheFuture":42}}"#;
        let parsed = parse_request(line).unwrap();
        match parsed {
            Request::Heartbeat(d) => assert_eq!(d.lease_id, "abc123def456"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn missing_type_field_is_malformed() {
        let line = r#"{"data":{}}"#;
        assert!(parse_request(line).is_err());
    }

    #[test]
    fn non_json_line_is_malformed() {
        assert!(parse_request("not json at all").is_err());
    }

    #[test]
    fn unrecognized_type_produces_error_response() {
        let line = r#"{"type":"teleport","data":{}}"#;
        let err = parse_request(line).unwrap_err();
        let response = encode_error(&err);
        assert!(response.contains("\"error\""));
        assert!(response.ends_with('\n'));
    }

    #[test]
    fn acquire_with_empty_tool_is_malformed() {
        let line = r#"{"type":"acquire","data":{"tool":"","argsHash":"h","requestedTokens":1,"timeoutMs":10}}"#;
        assert!(parse_request(line).is_err());
    }

    #[test]
    fn release_with_empty_lease_id_is_malformed() {
        let line = r#"{"type":"release","data":{"leaseId":"","peakWorkingSetBytes":0,"peakCommitBytes":0,"exitCode":0,"durationMs":0,"stderrHadDiagnostics":false}}"#;
        assert!(parse_request(line).is_err());
    }

    #[test]
    fn status_request_ignores_absent_data() {
        let line = r#"{"type":"status"}"#;
        let parsed = parse_request(line).unwrap();
        assert!(matches!(parsed, Request::Status(_)));
    }
}
