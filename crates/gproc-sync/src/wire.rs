use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Text frames above this size are treated as malformed and dropped.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Closed set of real-time event categories carried by the live stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    ProcessSnapshot,
    MetricsSample,
    Alert,
    ClusterSnapshot,
    DeploymentSnapshot,
    LogLine,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::ProcessSnapshot,
        Topic::MetricsSample,
        Topic::Alert,
        Topic::ClusterSnapshot,
        Topic::DeploymentSnapshot,
        Topic::LogLine,
    ];

    /// The `type` string the backend puts in the envelope.
    pub fn wire_name(self) -> &'static str {
        match self {
            Topic::ProcessSnapshot => "process_update",
            Topic::MetricsSample => "metrics_update",
            Topic::Alert => "alert",
            Topic::ClusterSnapshot => "cluster_update",
            Topic::DeploymentSnapshot => "deployment_update",
            Topic::LogLine => "log_stream",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "process_update" => Some(Topic::ProcessSnapshot),
            "metrics_update" => Some(Topic::MetricsSample),
            "alert" => Some(Topic::Alert),
            "cluster_update" => Some(Topic::ClusterSnapshot),
            "deployment_update" => Some(Topic::DeploymentSnapshot),
            "log_stream" => Some(Topic::LogLine),
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Topic::from_wire_name(input.trim()).ok_or_else(|| format!("Unknown topic: {input}"))
    }
}

/// A `log_stream` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogLine {
    #[serde(rename = "processId", deserialize_with = "deserialize_id")]
    pub process_id: String,
    pub line: String,
}

/// A decoded inbound frame; exactly one variant per [`Topic`].
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    ProcessSnapshot(Value),
    MetricsSample(Value),
    Alert(Value),
    ClusterSnapshot(Value),
    DeploymentSnapshot(Value),
    LogLine(LogLine),
}

impl Frame {
    pub fn topic(&self) -> Topic {
        match self {
            Frame::ProcessSnapshot(_) => Topic::ProcessSnapshot,
            Frame::MetricsSample(_) => Topic::MetricsSample,
            Frame::Alert(_) => Topic::Alert,
            Frame::ClusterSnapshot(_) => Topic::ClusterSnapshot,
            Frame::DeploymentSnapshot(_) => Topic::DeploymentSnapshot,
            Frame::LogLine(_) => Topic::LogLine,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("unknown frame type: {0}")]
    UnknownType(String),
    #[error("frame of type {0} has no data")]
    MissingData(Topic),
    #[error("invalid {topic} payload: {reason}")]
    InvalidPayload { topic: Topic, reason: String },
    #[error("frame encode failed: {0}")]
    Encode(String),
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Serialize)]
struct OutboundEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a Value,
}

pub fn decode_frame(raw: &str, max_frame_bytes: usize) -> Result<Frame, WireError> {
    if raw.len() > max_frame_bytes {
        return Err(WireError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    let envelope: RawEnvelope =
        serde_json::from_str(raw).map_err(|err| WireError::Decode(err.to_string()))?;
    let topic = Topic::from_wire_name(&envelope.kind)
        .ok_or_else(|| WireError::UnknownType(envelope.kind.clone()))?;
    let data = match envelope.data {
        Some(Value::Null) | None => return Err(WireError::MissingData(topic)),
        Some(data) => data,
    };

    let frame = match topic {
        Topic::ProcessSnapshot => Frame::ProcessSnapshot(data),
        Topic::MetricsSample => Frame::MetricsSample(data),
        Topic::Alert => Frame::Alert(data),
        Topic::ClusterSnapshot => Frame::ClusterSnapshot(data),
        Topic::DeploymentSnapshot => Frame::DeploymentSnapshot(data),
        Topic::LogLine => {
            let line: LogLine =
                serde_json::from_value(data).map_err(|err| WireError::InvalidPayload {
                    topic,
                    reason: err.to_string(),
                })?;
            if line.process_id.trim().is_empty() || line.line.is_empty() {
                return Err(WireError::InvalidPayload {
                    topic,
                    reason: "processId and line must be non-empty".to_string(),
                });
            }
            Frame::LogLine(line)
        }
    };
    Ok(frame)
}

/// Encodes a frame into the envelope the backend emits. Used by test servers
/// and replay tooling; the client itself never sends topic frames.
pub fn encode_frame(frame: &Frame) -> Result<String, WireError> {
    let log_value;
    let data = match frame {
        Frame::ProcessSnapshot(value)
        | Frame::MetricsSample(value)
        | Frame::Alert(value)
        | Frame::ClusterSnapshot(value)
        | Frame::DeploymentSnapshot(value) => value,
        Frame::LogLine(line) => {
            log_value =
                serde_json::to_value(line).map_err(|err| WireError::Encode(err.to_string()))?;
            &log_value
        }
    };
    serde_json::to_string(&OutboundEnvelope {
        kind: frame.topic().wire_name(),
        data,
    })
    .map_err(|err| WireError::Encode(err.to_string()))
}

/// Deserialize an ID that can be either a string or a number into a String
pub(crate) fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}
