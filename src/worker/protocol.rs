//! Protocol types for worker communication.
//!
//! Both directions carry one UTF-8 JSON object per line:
//!
//! ```text
//! -> {"requestId":"r1","payload":"hi","timestamp":1718000000000}
//! <- {"requestId":"r1","result":"hello","confidence":"high"}
//! <- {"requestId":"r2","error":"model unavailable"}
//! <- {"type":"ready"}
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Request/Response Envelope
// ============================================================================

/// Request envelope sent to the worker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    /// Unique request ID for correlation.
    pub request_id: String,
    /// Opaque request payload.
    pub payload: String,
    /// Submission time in milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl RequestEnvelope {
    /// Build an envelope stamped with the current wall-clock time.
    pub fn new(request_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            payload: payload.into(),
            timestamp: now_millis(),
        }
    }

    /// Serialize as a single newline-terminated frame.
    pub fn to_line(&self) -> serde_json::Result<String> {
        Ok(serde_json::to_string(self)? + "\n")
    }
}

/// Response envelope received from the worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    /// Request ID this response corresponds to.
    pub request_id: String,
    /// Result text (present on success).
    #[serde(default)]
    pub result: Option<String>,
    /// Error message. Takes precedence over `result` when both are present.
    #[serde(default)]
    pub error: Option<String>,
    /// Any other keys the worker attached (timings, confidence, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResponseEnvelope {
    /// Split the envelope into the caller-facing outcome.
    pub fn into_outcome(self) -> Result<Answer, String> {
        if let Some(error) = self.error {
            return Err(error);
        }
        Ok(Answer {
            text: self.result.unwrap_or_default(),
            metadata: self.extra,
        })
    }
}

/// A successful answer, from either the persistent worker or a fallback process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Answer {
    /// The worker's result string.
    pub text: String,
    /// Extra keys from the reply record. Always empty on the fallback path.
    pub metadata: Map<String, Value>,
}

impl Answer {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: Map::new(),
        }
    }
}

// ============================================================================
// Frames
// ============================================================================

/// One decoded unit of worker output.
#[derive(Debug, Clone)]
pub enum Frame {
    /// A reply correlated by `requestId`.
    Reply(ResponseEnvelope),
    /// `{"type":"ready"}`: the worker finished initialising.
    Ready,
    /// A non-record line. Observed only, never dispatched.
    Diagnostic(String),
}

/// Value of the `type` key that marks a readiness frame.
pub const READY_FRAME_TYPE: &str = "ready";

/// Classify a parsed JSON object as a frame.
pub(crate) fn classify_record(record: Map<String, Value>) -> Result<Frame, String> {
    if record.get("type").and_then(Value::as_str) == Some(READY_FRAME_TYPE) {
        return Ok(Frame::Ready);
    }
    serde_json::from_value::<ResponseEnvelope>(Value::Object(record))
        .map(Frame::Reply)
        .map_err(|e| e.to_string())
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
