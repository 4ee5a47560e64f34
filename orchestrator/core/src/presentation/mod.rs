// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`aegis-chat-core`)
//!
//! HTTP surface that translates external requests into application service
//! calls. All real work is delegated to [`crate::application::ChatService`].
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`api`] | HTTP/SSE (Axum) | chat stream, stop, health |

pub mod api;

pub use api::app;
