// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Ollama Inference Adapter
//
// Anti-Corruption Layer for Ollama local models. Streams `/api/chat` as
// newline-delimited JSON and maps each chunk's `message.content` to a token.
// Dropping the returned stream drops the HTTP body, which aborts generation.

use crate::domain::llm::{GenerationRequest, InferenceBackend, InferenceError, TokenStream};
use crate::domain::node_config::InferenceConfig;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct OllamaBackend {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<i32>,
}

#[derive(Deserialize)]
struct OllamaChatChunk {
    #[serde(default)]
    message: Option<OllamaChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct OllamaChunkMessage {
    #[serde(default)]
    content: String,
}

enum ChunkLine {
    Token(String),
    Done,
    Skip,
    Failed(InferenceError),
}

impl OllamaBackend {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::Provider(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
        })
    }

    pub fn from_config(config: &InferenceConfig) -> Result<Self, InferenceError> {
        Self::new(config.endpoint.clone(), config.model.clone())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), path)
    }
}

fn parse_line(line: &[u8]) -> ChunkLine {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return ChunkLine::Skip;
    }
    let chunk: OllamaChatChunk = match serde_json::from_str(text) {
        Ok(chunk) => chunk,
        Err(e) => {
            return ChunkLine::Failed(InferenceError::Provider(format!(
                "Failed to parse stream chunk: {}",
                e
            )))
        }
    };
    if let Some(error) = chunk.error {
        return ChunkLine::Failed(InferenceError::Provider(error));
    }
    let content = chunk.message.map(|m| m.content).unwrap_or_default();
    match (content.is_empty(), chunk.done) {
        (false, _) => ChunkLine::Token(content),
        (true, true) => ChunkLine::Done,
        (true, false) => ChunkLine::Skip,
    }
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    async fn generate(&self, request: GenerationRequest) -> Result<TokenStream, InferenceError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system.as_deref() {
            messages.push(OllamaMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(OllamaMessage {
            role: "user",
            content: &request.prompt,
        });

        let body = OllamaChatRequest {
            model: &self.model,
            messages,
            stream: true,
            options: OllamaOptions {
                temperature: request.options.temperature,
                num_predict: request.options.max_tokens.map(|t| t as i32),
            },
        };

        let response = self
            .client
            .post(self.url("/api/chat"))
            .json(&body)
            .send()
            .await
            .map_err(|e| InferenceError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();

            return Err(if status == 404 {
                InferenceError::ModelNotFound(self.model.clone())
            } else {
                InferenceError::Provider(format!("HTTP {}: {}", status, error_text))
            });
        }

        debug!(model = %self.model, "Ollama stream opened");
        let mut body = response.bytes_stream();
        let tokens = async_stream::stream! {
            let mut pending: Vec<u8> = Vec::new();
            let mut finished = false;
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(InferenceError::Network(e.to_string()));
                        finished = true;
                        break;
                    }
                };
                pending.extend_from_slice(&chunk);
                while let Some(newline) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=newline).collect();
                    match parse_line(&line) {
                        ChunkLine::Token(text) => yield Ok(text),
                        ChunkLine::Skip => {}
                        ChunkLine::Done => {
                            finished = true;
                            break;
                        }
                        ChunkLine::Failed(e) => {
                            yield Err(e);
                            finished = true;
                            break;
                        }
                    }
                }
                if finished {
                    break;
                }
            }
            if !finished {
                match parse_line(&pending) {
                    ChunkLine::Token(text) => yield Ok(text),
                    ChunkLine::Failed(e) => yield Err(e),
                    ChunkLine::Done | ChunkLine::Skip => {}
                }
            }
        };

        Ok(tokens.boxed())
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn health_check(&self) -> Result<(), InferenceError> {
        // Check if Ollama server is running by listing models
        let response = self
            .client
            .get(self.url("/api/tags"))
            .send()
            .await
            .map_err(|e| InferenceError::Network(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(InferenceError::Network(format!("HTTP {}", response.status())))
        }
    }
}
