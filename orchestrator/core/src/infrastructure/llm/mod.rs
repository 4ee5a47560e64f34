// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Inference Backend Infrastructure - Anti-Corruption Layer Implementations
//
// Each adapter translates between the streaming domain interface and an
// external model server.

pub mod ollama;

pub use ollama::OllamaBackend;

use crate::domain::llm::{InferenceBackend, InferenceError};
use crate::domain::node_config::InferenceConfig;
use std::sync::Arc;
use tracing::info;

/// Builds the backend named by `spec.inference.provider`.
pub fn backend_from_config(
    config: &InferenceConfig,
) -> Result<Arc<dyn InferenceBackend>, InferenceError> {
    match config.provider.as_str() {
        "ollama" => {
            info!(
                "Using Ollama backend at {} with model {}",
                config.endpoint, config.model
            );
            Ok(Arc::new(OllamaBackend::from_config(config)?))
        }
        other => Err(InferenceError::InvalidInput(format!(
            "Unsupported inference provider: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_provider_rejected() {
        let config = InferenceConfig {
            provider: "mystery".to_string(),
            ..InferenceConfig::default()
        };
        assert!(matches!(
            backend_from_config(&config),
            Err(InferenceError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_ollama_backend_reports_model() {
        let backend = backend_from_config(&InferenceConfig::default()).unwrap();
        assert_eq!(backend.model(), "llama3.2:latest");
    }
}
