//! Newline-delimited JSON protocol.
//!
//! Every request is one JSON object on one line with a `command` field.
//! Every response is one JSON object on one line with a `success` field.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use talkhead_core::runtime::{
    InferenceRequest, PreprocessRequest, StreamRequest, TemplateRequest,
};
use talkhead_core::segment::{SegmentEvent, SegmentOutput, SegmentPlan, StreamSummary};

use crate::error::ApiError;

/// Commands understood by the session service.
pub const COMMANDS: &[&str] = &[
    "ping",
    "preprocess",
    "inference",
    "stream",
    "check_cache",
    "list_cache",
    "invalidate",
    "status",
    "shutdown",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Ping,
    Preprocess(PreprocessRequest),
    Inference(InferenceRequest),
    Stream(StreamRequest),
    CheckCache(TemplateRequest),
    ListCache,
    Invalidate(TemplateRequest),
    Status,
    Shutdown,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping => "ping",
            Command::Preprocess(_) => "preprocess",
            Command::Inference(_) => "inference",
            Command::Stream(_) => "stream",
            Command::CheckCache(_) => "check_cache",
            Command::ListCache => "list_cache",
            Command::Invalidate(_) => "invalidate",
            Command::Status => "status",
            Command::Shutdown => "shutdown",
        }
    }
}

/// Parse one request line.
pub fn parse_command(line: &str) -> Result<Command, ApiError> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| ApiError::protocol(format!("Malformed JSON: {e}")))?;

    let name = match value.get("command") {
        Some(Value::String(name)) => name.clone(),
        Some(_) => return Err(ApiError::protocol("Field 'command' must be a string")),
        None if value.is_object() => return Err(ApiError::protocol("Missing 'command' field")),
        None => return Err(ApiError::protocol("Request must be a JSON object")),
    };
    if !COMMANDS.contains(&name.as_str()) {
        return Err(ApiError::protocol(format!("Unknown command: {name}")));
    }

    serde_json::from_value(value)
        .map_err(|e| ApiError::protocol(format!("Invalid '{name}' request: {e}")))
}

/// `{success:true, ...body}` for any body that serializes to an object.
pub fn success<T: Serialize>(body: &T) -> Result<Value, ApiError> {
    let mut map = match serde_json::to_value(body)? {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("result".to_string(), other);
            map
        }
    };
    map.insert("success".to_string(), Value::Bool(true));
    Ok(Value::Object(map))
}

/// One response line per streaming event.
pub fn segment_event(event: &SegmentEvent) -> Value {
    match event {
        SegmentEvent::Segment(output) => segment_line(output),
        SegmentEvent::SegmentFailed { plan, error } => segment_failed_line(plan, error),
        SegmentEvent::Finished(summary) => finished_line(summary),
    }
}

fn segment_line(output: &SegmentOutput) -> Value {
    json!({
        "success": true,
        "event": "segment",
        "index": output.plan.index,
        "startFrame": output.plan.start_frame,
        "frameCount": output.plan.frame_count,
        "tier": output.plan.tier.name(),
        "outputPath": output.output_path,
        "renderedFrames": output.rendered_frames,
        "failedFrames": output.failed_frames,
    })
}

fn segment_failed_line(plan: &SegmentPlan, error: &str) -> Value {
    json!({
        "success": false,
        "event": "segmentFailed",
        "index": plan.index,
        "startFrame": plan.start_frame,
        "frameCount": plan.frame_count,
        "error": error,
        "errorType": "backendError",
    })
}

fn finished_line(summary: &StreamSummary) -> Value {
    json!({
        "success": summary.failed_segments == 0 && !summary.cancelled,
        "event": "finished",
        "segments": summary.segments,
        "failedSegments": summary.failed_segments,
        "cancelled": summary.cancelled,
        "state": summary.state,
    })
}
