// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain Layer
//!
//! Value types, invariants and ports. Nothing here performs I/O.

pub mod admission;
pub mod chat;
pub mod cognition;
pub mod llm;
pub mod node_config;
pub mod stream;
