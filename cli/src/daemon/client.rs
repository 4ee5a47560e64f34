// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP client for the chat server API
//!
//! `POST /api/chat` answers with `text/event-stream`; every `data:` payload is
//! one JSON frame. [`SseDecoder`] reassembles payloads across chunk
//! boundaries and [`Frame::parse`] turns them into typed frames.

use anyhow::{Context, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// One decoded server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Token(String),
    Loading {
        model: String,
    },
    QueueHeartbeat {
        position: u64,
    },
    Pulse,
    ThinkingStart,
    ThinkingStep {
        stage: String,
        iteration: u64,
        total_iterations: u64,
    },
    ThinkingEnd {
        duration_ms: u64,
    },
    Confidence {
        score: f64,
        level: String,
    },
    Error {
        kind: String,
        message: String,
    },
    Done(Value),
    Unknown(Value),
}

impl Frame {
    pub fn parse(data: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(data).with_context(|| format!("Malformed frame: {}", data))?;
        Ok(Self::from_value(value))
    }

    fn from_value(value: Value) -> Self {
        if value["done"].as_bool() == Some(true) {
            return Frame::Done(value);
        }
        if let Some(token) = value["token"].as_str() {
            return Frame::Token(token.to_string());
        }

        let text = |key: &str| value[key].as_str().unwrap_or_default().to_string();
        let number = |key: &str| value[key].as_u64().unwrap_or_default();
        if value.get("error").is_some() {
            return Frame::Error {
                kind: text("kind"),
                message: text("error"),
            };
        }
        if value["status"] == "loading" {
            return Frame::Loading {
                model: text("model"),
            };
        }
        match value["_meta"].as_str() {
            Some("queue_heartbeat") => Frame::QueueHeartbeat {
                position: number("position"),
            },
            Some("pulse") => Frame::Pulse,
            Some("thinking_start") => Frame::ThinkingStart,
            Some("thinking_step") => Frame::ThinkingStep {
                stage: text("stage"),
                iteration: number("iteration"),
                total_iterations: number("total_iterations"),
            },
            Some("thinking_end") => Frame::ThinkingEnd {
                duration_ms: number("duration_ms"),
            },
            Some("confidence") => Frame::Confidence {
                score: value["score"].as_f64().unwrap_or_default(),
                level: text("level"),
            },
            _ => Frame::Unknown(value.clone()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Frame::Done(_) | Frame::Error { .. })
    }
}

/// Incremental `text/event-stream` decoder yielding complete `data` payloads.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data
                    .push(data.strip_prefix(' ').unwrap_or(data).to_string());
            }
            // Comments (keep-alives) and other fields are ignored
        }
        events
    }
}

#[derive(Debug, Clone)]
pub struct ChatClient {
    client: Client,
    base_url: String,
}

/// Live reply stream for one request.
pub struct ChatStream {
    request_id: Option<String>,
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: SseDecoder,
    ready: VecDeque<String>,
}

impl ChatStream {
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Next frame, or `None` once the server closes the stream.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(data) = self.ready.pop_front() {
                return Frame::parse(&data).map(Some);
            }
            match self.body.next().await {
                Some(chunk) => {
                    let chunk = chunk.context("Failed to read event stream chunk")?;
                    self.ready.extend(self.decoder.push(&chunk));
                }
                None => return Ok(None),
            }
        }
    }
}

impl ChatClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            // No global timeout: replies are long-lived streams
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub async fn chat(&self, message: &str, mode: &str, background: bool) -> Result<ChatStream> {
        #[derive(Serialize)]
        struct ChatBody<'a> {
            message: &'a str,
            mode: &'a str,
            background: bool,
        }

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&ChatBody {
                message,
                mode,
                background,
            })
            .send()
            .await
            .context("Failed to reach chat server")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Chat request rejected ({}): {}", status, error_text);
        }

        let request_id = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();

        Ok(ChatStream {
            request_id,
            body,
            decoder: SseDecoder::default(),
            ready: VecDeque::new(),
        })
    }

    /// `Ok(false)` when the server knows no live request with that id.
    pub async fn stop(&self, request_id: &str) -> Result<bool> {
        let response = self
            .client
            .post(format!("{}/api/chat/{}/stop", self.base_url, request_id))
            .send()
            .await
            .context("Failed to reach chat server")?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let error_text = response.text().await.unwrap_or_default();
                anyhow::bail!("Stop failed ({}): {}", status, error_text)
            }
        }
    }
}
