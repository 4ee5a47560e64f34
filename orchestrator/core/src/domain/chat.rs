// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Inbound chat request shape shared by the HTTP API and the CLI client.

use serde::{Deserialize, Serialize};

use crate::domain::admission::PriorityClass;

/// How much cognition a request gets once it holds a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    /// Single short generation, low token budget.
    Fast,
    /// Single generation with the default budget.
    #[default]
    Standard,
    /// Plan -> execute -> verify -> remember loop.
    Deep,
}

impl ChatMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatMode::Fast => "fast",
            ChatMode::Standard => "standard",
            ChatMode::Deep => "deep",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,

    #[serde(default)]
    pub mode: ChatMode,

    /// Requests are user-priority unless explicitly marked background.
    #[serde(default)]
    pub background: bool,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>, mode: ChatMode) -> Self {
        Self {
            message: message.into(),
            conversation_id: None,
            mode,
            background: false,
        }
    }

    pub fn priority_class(&self) -> PriorityClass {
        if self.background {
            PriorityClass::Background
        } else {
            PriorityClass::User
        }
    }
}
