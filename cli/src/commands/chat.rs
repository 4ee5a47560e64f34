// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `aegis-chat chat`: stream one reply to the terminal.
//!
//! Tokens go to stdout; queue position, thinking progress and the final
//! summary go to stderr so the answer can be piped. Ctrl+C sends a stop for
//! the request and keeps reading until the server closes the stream.

use anyhow::Result;
use clap::{Args, ValueEnum};
use colored::Colorize;
use std::io::Write;

use crate::daemon::client::{ChatClient, Frame};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Mode {
    Fast,
    Standard,
    Deep,
}

impl Mode {
    fn as_str(&self) -> &'static str {
        match self {
            Mode::Fast => "fast",
            Mode::Standard => "standard",
            Mode::Deep => "deep",
        }
    }
}

#[derive(Debug, Args)]
pub struct ChatArgs {
    /// Message to send
    pub message: String,

    /// Execution mode
    #[arg(short, long, value_enum, default_value = "standard")]
    pub mode: Mode,

    /// Queue behind interactive requests
    #[arg(long)]
    pub background: bool,
}

pub async fn handle_command(args: ChatArgs, base_url: &str) -> Result<()> {
    let client = ChatClient::new(base_url)?;
    let mut stream = client
        .chat(&args.message, args.mode.as_str(), args.background)
        .await?;
    let request_id = stream.request_id().map(str::to_string);
    if let Some(id) = &request_id {
        eprintln!("{}", format!("request {}", id).dimmed());
    }

    let mut renderer = Renderer::default();
    let mut stop_sent = false;
    loop {
        let frame = tokio::select! {
            frame = stream.next_frame() => frame?,
            _ = tokio::signal::ctrl_c(), if !stop_sent => {
                stop_sent = true;
                if let Some(id) = &request_id {
                    client.stop(id).await?;
                }
                continue;
            }
        };
        let Some(frame) = frame else { break };
        renderer.render(&frame)?;
        if frame.is_terminal() {
            break;
        }
    }

    if !renderer.finished {
        anyhow::bail!("Stream closed before a final frame");
    }
    if renderer.failed {
        std::process::exit(2);
    }
    Ok(())
}

/// Terminal state for one reply.
#[derive(Debug, Default)]
struct Renderer {
    queued: bool,
    wrote_tokens: bool,
    finished: bool,
    failed: bool,
}

impl Renderer {
    fn render(&mut self, frame: &Frame) -> Result<()> {
        if self.queued && !matches!(frame, Frame::QueueHeartbeat { .. }) {
            self.queued = false;
            eprintln!();
        }
        match frame {
            Frame::Token(text) => {
                let mut stdout = std::io::stdout();
                write!(stdout, "{}", text)?;
                stdout.flush()?;
                self.wrote_tokens = true;
            }
            Frame::QueueHeartbeat { position } => {
                self.queued = true;
                eprint!(
                    "\r{}",
                    format!("waiting for a slot ({} ahead)", position).yellow()
                );
            }
            Frame::Loading { model } => {
                eprintln!("{}", format!("loading {}", model).dimmed());
            }
            Frame::Pulse | Frame::Unknown(_) => {}
            Frame::ThinkingStart => eprintln!("{}", "thinking...".cyan()),
            Frame::ThinkingStep {
                stage,
                iteration,
                total_iterations,
            } => {
                eprintln!(
                    "{}",
                    format!("  {} (attempt {}, #{})", stage, iteration, total_iterations).dimmed()
                );
            }
            Frame::Confidence { score, level } => {
                eprintln!("{}", format!("  confidence {:.2} ({})", score, level).dimmed());
            }
            Frame::ThinkingEnd { duration_ms } => {
                eprintln!(
                    "{}",
                    format!("thought for {:.1}s", *duration_ms as f64 / 1000.0).cyan()
                );
            }
            Frame::Error { kind, message } => {
                self.end_line();
                eprintln!("{} {}", format!("error [{}]:", kind).red().bold(), message);
                self.finished = true;
                self.failed = true;
            }
            Frame::Done(summary) => {
                self.end_line();
                let outcome = summary["outcome"].as_str().unwrap_or("done");
                let mut line = format!(
                    "{} in {}ms",
                    outcome,
                    summary["duration_ms"].as_u64().unwrap_or_default()
                );
                if let Some(note) = summary["summary"].as_str() {
                    line.push_str(&format!(" ({})", note));
                }
                eprintln!("{}", line.dimmed());
                self.finished = true;
            }
        }
        Ok(())
    }

    fn end_line(&mut self) {
        if self.wrote_tokens {
            println!();
            self.wrote_tokens = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_renderer_tracks_terminal_frames() {
        let mut renderer = Renderer::default();
        renderer
            .render(&Frame::QueueHeartbeat { position: 1 })
            .unwrap();
        assert!(renderer.queued);
        renderer
            .render(&Frame::Loading {
                model: "m".to_string(),
            })
            .unwrap();
        assert!(!renderer.queued);
        assert!(!renderer.finished);

        renderer
            .render(&Frame::Done(json!({"done": true, "outcome": "cancelled"})))
            .unwrap();
        assert!(renderer.finished);
        assert!(!renderer.failed);
    }

    #[test]
    fn test_renderer_marks_errors_failed() {
        let mut renderer = Renderer::default();
        renderer
            .render(&Frame::Error {
                kind: "model_unresponsive".to_string(),
                message: "Model unresponsive".to_string(),
            })
            .unwrap();
        assert!(renderer.finished && renderer.failed);
    }
}
