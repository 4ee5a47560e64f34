// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Stream Event Domain
//!
//! Closed set of events delivered to a chat caller over one long-lived
//! connection, and their wire frames (one JSON object per frame).
//!
//! | Event | Frame |
//! |-------|-------|
//! | `Token` | `{"token": "..."}` |
//! | `Meta(QueueHeartbeat)` | `{"_meta": "queue_heartbeat", "position": 0}` |
//! | `Meta(Pulse)` | `{"_meta": "pulse"}` |
//! | `Meta(ThinkingStart)` | `{"_meta": "thinking_start"}` |
//! | `Meta(ThinkingStep)` | `{"_meta": "thinking_step", "stage": "verify", ...}` |
//! | `Meta(ThinkingEnd)` | `{"_meta": "thinking_end", "duration_ms", "chars_filtered", "think_content"}` |
//! | `Meta(Confidence)` | `{"_meta": "confidence", "score", "level", "factors"}` |
//! | `Meta(Loading)` | `{"status": "loading", "model": "..."}` |
//! | `Error` | `{"error": "...", "kind": "model_unresponsive"}` |
//! | `Done` | `{"done": true, ...summary}` |
//!
//! Exactly one `Error` or `Done` terminates a stream.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::domain::admission::RequestId;
use crate::domain::chat::ChatMode;
use crate::domain::cognition::Stage;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Token(String),
    Meta(MetaEvent),
    Error(StreamFailure),
    Done(DoneSummary),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetaEvent {
    QueueHeartbeat {
        position: usize,
    },
    Pulse,
    ThinkingStart,
    ThinkingStep {
        stage: Stage,
        iteration: u32,
        total_iterations: u32,
    },
    ThinkingEnd {
        duration_ms: u64,
        chars_filtered: usize,
        think_content: String,
    },
    Confidence {
        score: f64,
        level: ConfidenceLevel,
        factors: Vec<String>,
    },
    Loading {
        model: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

impl ConfidenceLevel {
    /// `High` at or above the acceptance threshold, `Medium` within 0.25 of
    /// it, `Low` otherwise.
    pub fn from_score(score: f64, accept_threshold: f64) -> Self {
        if score >= accept_threshold {
            ConfidenceLevel::High
        } else if score >= accept_threshold - 0.25 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceLevel::High => "high",
            ConfidenceLevel::Medium => "medium",
            ConfidenceLevel::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No token from the model for the hard stall window.
    ModelUnresponsive,
    /// The request-level deadline elapsed while the model was still working.
    TookTooLong,
    /// No slot could be granted (pool shut down).
    Unavailable,
    /// The inference backend reported an error.
    Inference,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ModelUnresponsive => "model_unresponsive",
            FailureKind::TookTooLong => "took_too_long",
            FailureKind::Unavailable => "unavailable",
            FailureKind::Inference => "inference",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StreamFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    /// Fast/standard generation finished.
    Completed,
    /// Deep loop accepted an answer.
    Accepted,
    /// Deep loop exhausted its iterations without a verified answer.
    Rejected,
    /// Stopped by the caller.
    Cancelled,
}

impl RequestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestOutcome::Completed => "completed",
            RequestOutcome::Accepted => "accepted",
            RequestOutcome::Rejected => "rejected",
            RequestOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DoneSummary {
    pub request_id: RequestId,
    pub mode: ChatMode,
    pub outcome: RequestOutcome,
    pub duration_ms: u64,
    pub queue_wait_ms: u64,
    pub chars: usize,
    pub iterations: Option<u32>,
    pub score: Option<f64>,
    pub summary: Option<String>,
}

impl StreamEvent {
    pub fn token(text: impl Into<String>) -> Self {
        StreamEvent::Token(text.into())
    }

    pub fn pulse() -> Self {
        StreamEvent::Meta(MetaEvent::Pulse)
    }

    pub fn error(kind: FailureKind, message: impl Into<String>) -> Self {
        StreamEvent::Error(StreamFailure::new(kind, message))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Error(_) | StreamEvent::Done(_))
    }

    /// Short event name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Token(_) => "token",
            StreamEvent::Meta(meta) => meta.kind(),
            StreamEvent::Error(_) => "error",
            StreamEvent::Done(_) => "done",
        }
    }

    /// Wire frame for this event.
    pub fn to_frame(&self) -> Value {
        match self {
            StreamEvent::Token(text) => json!({ "token": text }),
            StreamEvent::Meta(meta) => meta.to_frame(),
            StreamEvent::Error(failure) => json!({
                "error": failure.message,
                "kind": failure.kind.as_str(),
            }),
            StreamEvent::Done(summary) => summary.to_frame(),
        }
    }
}

impl MetaEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            MetaEvent::QueueHeartbeat { .. } => "queue_heartbeat",
            MetaEvent::Pulse => "pulse",
            MetaEvent::ThinkingStart => "thinking_start",
            MetaEvent::ThinkingStep { .. } => "thinking_step",
            MetaEvent::ThinkingEnd { .. } => "thinking_end",
            MetaEvent::Confidence { .. } => "confidence",
            MetaEvent::Loading { .. } => "loading",
        }
    }

    fn to_frame(&self) -> Value {
        match self {
            MetaEvent::QueueHeartbeat { position } => json!({
                "_meta": "queue_heartbeat",
                "position": position,
            }),
            MetaEvent::Pulse => json!({ "_meta": "pulse" }),
            MetaEvent::ThinkingStart => json!({ "_meta": "thinking_start" }),
            MetaEvent::ThinkingStep {
                stage,
                iteration,
                total_iterations,
            } => json!({
                "_meta": "thinking_step",
                "stage": stage.as_str(),
                "iteration": iteration,
                "total_iterations": total_iterations,
            }),
            MetaEvent::ThinkingEnd {
                duration_ms,
                chars_filtered,
                think_content,
            } => json!({
                "_meta": "thinking_end",
                "duration_ms": duration_ms,
                "chars_filtered": chars_filtered,
                "think_content": think_content,
            }),
            MetaEvent::Confidence {
                score,
                level,
                factors,
            } => json!({
                "_meta": "confidence",
                "score": score,
                "level": level.as_str(),
                "factors": factors,
            }),
            MetaEvent::Loading { model } => json!({
                "status": "loading",
                "model": model,
            }),
        }
    }
}

impl DoneSummary {
    fn to_frame(&self) -> Value {
        let mut frame = Map::new();
        frame.insert("done".to_string(), Value::Bool(true));
        frame.insert("request_id".to_string(), json!(self.request_id.to_string()));
        frame.insert("mode".to_string(), json!(self.mode.as_str()));
        frame.insert("outcome".to_string(), json!(self.outcome.as_str()));
        frame.insert("duration_ms".to_string(), json!(self.duration_ms));
        frame.insert("queue_wait_ms".to_string(), json!(self.queue_wait_ms));
        frame.insert("chars".to_string(), json!(self.chars));
        if let Some(iterations) = self.iterations {
            frame.insert("iterations".to_string(), json!(iterations));
        }
        if let Some(score) = self.score {
            frame.insert("score".to_string(), json!(score));
        }
        if let Some(summary) = &self.summary {
            frame.insert("summary".to_string(), json!(summary));
        }
        Value::Object(frame)
    }
}
