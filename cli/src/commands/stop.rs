// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `aegis-chat stop`: out-of-band cancellation of a live request.

use anyhow::Result;
use colored::Colorize;

use crate::daemon::client::ChatClient;

pub async fn handle_command(request_id: &str, base_url: &str) -> Result<()> {
    let client = ChatClient::new(base_url)?;
    if client.stop(request_id).await? {
        println!("{}", format!("✓ Stopped request {}", request_id).green());
        Ok(())
    } else {
        anyhow::bail!("No live request with id {}", request_id)
    }
}
