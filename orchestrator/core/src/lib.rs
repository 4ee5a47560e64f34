// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! AEGIS Chat Core
//!
//! Serves concurrent chat requests against a small pool of inference slots.
//!
//! # Architecture
//!
//! - **domain:** admission tickets, stream events, cognitive state, ports
//! - **application:** slot manager, heartbeat wrapper, cognitive loop, request lifecycle
//! - **infrastructure:** Ollama streaming adapter, LLM-backed cognitive stages
//! - **presentation:** axum SSE API

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
