// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod llm;
pub mod stages;

pub use llm::{backend_from_config, OllamaBackend};
pub use stages::{llm_stages, LlmExecutor, LlmPlanner, LlmVerifier, SummarizingMemory};
