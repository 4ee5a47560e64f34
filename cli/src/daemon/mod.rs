// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Server mode and the HTTP client that talks to it
//!
//! Handles:
//! - Server bootstrap and graceful shutdown
//! - SSE frame decoding for the terminal client

pub mod client;
pub mod server;

pub use client::{ChatClient, Frame};
pub use server::start_server;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8000;

/// Accepts either a bare host or a full `http(s)://` origin.
pub fn base_url(host: &str, port: u16) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{}:{}", host.trim_end_matches('/'), port)
    } else {
        format!("http://{}:{}", host, port)
    }
}
