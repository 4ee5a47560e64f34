// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Llm
//!
//! Streaming inference port (Anti-Corruption Layer).
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Treats model inference as an opaque async operation that
//!   yields token chunks and eventually completes or fails. Implementations
//!   live in `infrastructure/llm/`.
//!
//! Dropping a [`TokenStream`] is the cancellation signal: adapters must stop
//! generation upstream when their stream is dropped.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

/// Raw token chunks as produced by the model.
pub type TokenStream = BoxStream<'static, Result<String, InferenceError>>;

/// Domain interface for streaming inference backends
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Start a generation. The returned stream yields chunks until the model
    /// finishes, fails, or the stream is dropped.
    async fn generate(&self, request: GenerationRequest) -> Result<TokenStream, InferenceError>;

    /// Model identifier reported in `loading` frames.
    fn model(&self) -> &str;

    /// Check if provider is healthy and accessible
    async fn health_check(&self) -> Result<(), InferenceError>;
}

/// One generation request. `system` is the trusted instruction channel;
/// `prompt` may carry user-supplied text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub options: GenerationOptions,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            options: GenerationOptions::default(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }
}

/// Options for LLM generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,

    /// Sampling temperature (0.0 = deterministic, 1.0 = creative)
    pub temperature: Option<f32>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: Some(4096),
            temperature: Some(0.7),
        }
    }
}

impl GenerationOptions {
    pub fn fast() -> Self {
        Self {
            max_tokens: Some(512),
            temperature: Some(0.5),
        }
    }

    /// Low temperature for scoring and planning calls.
    pub fn precise() -> Self {
        Self {
            max_tokens: Some(1024),
            temperature: Some(0.1),
        }
    }
}

/// Errors that can occur during inference
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InferenceError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Drains a token stream into one string. Used by stages that need the whole
/// completion rather than live tokens.
pub async fn collect_completion(mut stream: TokenStream) -> Result<String, InferenceError> {
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        text.push_str(&chunk?);
    }
    Ok(text)
}
