// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the AEGIS chat CLI

pub mod chat;
pub mod config;
pub mod stop;

pub use self::chat::ChatArgs;
pub use self::config::ConfigCommand;
