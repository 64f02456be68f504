//! Wire protocol between the executor and the control-plane gateway.
//!
//! Messages travel over a single TLS connection as length-prefixed JSON
//! frames: a 4-byte big-endian length followed by exactly that many bytes of
//! UTF-8 JSON. The executor sends [`Outbound`] messages and receives frames
//! it dispatches by their `type` field.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Maximum accepted inbound frame body, in bytes.
pub const MAX_FRAME_BYTES: u32 = 5 * 1024 * 1024;

/// Width of the length prefix preceding every frame body.
pub const FRAME_HEADER_LEN: usize = 4;

/// Task logs embedded in a result are truncated to this many bytes.
pub const MAX_LOG_BYTES: usize = 16_384;

/// Engine output is chunked into log frames of this size.
pub const LOG_CHUNK_SIZE: usize = 2048;

/// Framing errors raised while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length 0")]
    EmptyFrame,
    #[error("frame too large: {0} bytes (max={MAX_FRAME_BYTES})")]
    Oversized(u32),
    #[error("frame body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialise a message into a complete frame: length prefix plus JSON body.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(message)?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Validate a declared frame length read off the wire.
pub fn check_frame_length(length: u32) -> Result<usize, FrameError> {
    if length == 0 {
        return Err(FrameError::EmptyFrame);
    }
    if length > MAX_FRAME_BYTES {
        return Err(FrameError::Oversized(length));
    }
    Ok(length as usize)
}

/// Parse a frame body into a generic JSON object.
pub fn decode_frame(body: &[u8]) -> Result<serde_json::Value, FrameError> {
    Ok(serde_json::from_slice(body)?)
}

/// A message sent from the executor to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    /// Announce this executor to the gateway after connecting.
    Register(Register),
    /// Periodic liveness report with host metrics.
    Heartbeat(Heartbeat),
    /// One slice of engine stdout/stderr for a running task.
    LogChunk(LogChunk),
    /// Terminal outcome of a task. Exactly one per assignment.
    TaskResult(TaskResult),
}

/// Registration payload. Sent exactly once per connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Register {
    pub token: String,
    pub host: String,
}

/// Heartbeat payload, sent every five seconds.
///
/// The `goroutines` field name is a wire-compatibility holdover; it reports
/// the number of live task workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub token: String,
    pub cpu_usage: f64,
    pub memory_usage_mb: u64,
    pub goroutines: usize,
    #[serde(rename = "processUptimeS")]
    pub process_uptime_s: i64,
}

/// The stream a log chunk was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One slice of engine output.
///
/// Sequences are allocated from a counter shared by both streams of a task,
/// so chunks are totally ordered per task. The final chunk of each stream has
/// `is_last` set and may carry empty content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogChunk {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_type: Option<String>,
    pub sequence: i64,
    pub stream: LogStream,
    pub content: String,
    pub is_last: bool,
}

/// Terminal result of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,
    pub stage_id: String,
    pub stage_type: String,
    pub success: bool,
    /// Engine log, truncated to [`MAX_LOG_BYTES`].
    pub log: String,
    /// Primary engine output (SARIF or vulnerability JSON).
    pub result: String,
    /// Secondary engine log payload (Semgrep's JSON log file).
    pub run_log: String,
    pub exit_code: i64,
    /// Side-channel outputs keyed by artifact name (`sbom`, `usage-index`).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub artifacts: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Truncate a log payload to `max` bytes.
pub fn truncate_log(log: &str, max: usize) -> String {
    if log.len() <= max {
        return log.to_string();
    }
    // Back off to a char boundary so the slice stays valid UTF-8.
    let mut end = max;
    while end > 0 && !log.is_char_boundary(end) {
        end -= 1;
    }
    log[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let msg = Outbound::Register(Register {
            token: "tok-1".into(),
            host: "executor-a".into(),
        });
        let frame = encode_frame(&msg).unwrap();

        let declared = u32::from_be_bytes(frame[..4].try_into().unwrap());
        let body_len = check_frame_length(declared).unwrap();
        assert_eq!(body_len, frame.len() - FRAME_HEADER_LEN);

        let value = decode_frame(&frame[4..]).unwrap();
        assert_eq!(value["type"], "register");
        assert_eq!(value["token"], "tok-1");
        assert_eq!(value["host"], "executor-a");
    }

    #[test]
    fn test_frame_length_bounds() {
        assert!(matches!(check_frame_length(0), Err(FrameError::EmptyFrame)));
        assert!(matches!(
            check_frame_length(MAX_FRAME_BYTES + 1),
            Err(FrameError::Oversized(_))
        ));
        assert_eq!(check_frame_length(MAX_FRAME_BYTES).unwrap(), MAX_FRAME_BYTES as usize);
        assert_eq!(check_frame_length(1).unwrap(), 1);
    }

    #[test]
    fn test_log_chunk_wire_shape() {
        let chunk = Outbound::LogChunk(LogChunk {
            task_id: "t1".into(),
            stage_id: Some("s1".into()),
            stage_type: None,
            sequence: 7,
            stream: LogStream::Stderr,
            content: "boom".into(),
            is_last: false,
        });
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["type"], "log_chunk");
        assert_eq!(value["taskId"], "t1");
        assert_eq!(value["stageId"], "s1");
        assert_eq!(value["sequence"], 7);
        assert_eq!(value["stream"], "stderr");
        assert_eq!(value["isLast"], false);
        assert!(value.get("stageType").is_none());
    }

    #[test]
    fn test_task_result_omits_empty_artifacts_and_error() {
        let result = Outbound::TaskResult(TaskResult {
            task_id: "t1".into(),
            stage_id: "s1".into(),
            stage_type: "sast".into(),
            success: true,
            log: String::new(),
            result: "{}".into(),
            run_log: String::new(),
            exit_code: 0,
            artifacts: HashMap::new(),
            error: None,
        });
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["type"], "task_result");
        assert_eq!(value["exitCode"], 0);
        assert!(value.get("artifacts").is_none());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_truncate_log_respects_char_boundaries() {
        assert_eq!(truncate_log("abcdef", 4), "abcd");
        assert_eq!(truncate_log("ab", 4), "ab");
        // Multi-byte char straddling the cut point is dropped whole.
        let s = "aé"; // 'é' is two bytes starting at index 1
        assert_eq!(truncate_log(s, 2), "a");
    }
}
