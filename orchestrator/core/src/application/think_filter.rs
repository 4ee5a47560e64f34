// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Think-tag filter
//!
//! Splits raw model output into visible text and `<think>...</think>` blocks.
//! Text that might be the start of a delimiter (`"<th"`) is held back until
//! the next chunk resolves it or the caller forces it out with
//! [`ThinkFilter::flush_pending`]. Timing of that flush belongs to the caller.

use tokio::time::Instant;

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filtered {
    Visible(String),
    ThinkingStart,
    ThinkingEnd {
        duration_ms: u64,
        chars_filtered: usize,
        think_content: String,
    },
}

#[derive(Debug)]
enum Region {
    Visible,
    Thinking { started: Instant, content: String },
}

#[derive(Debug)]
pub struct ThinkFilter {
    region: Region,
    pending: String,
}

impl Default for ThinkFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl ThinkFilter {
    pub fn new() -> Self {
        Self {
            region: Region::Visible,
            pending: String::new(),
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn in_thinking(&self) -> bool {
        matches!(self.region, Region::Thinking { .. })
    }

    pub fn push(&mut self, chunk: &str, now: Instant) -> Vec<Filtered> {
        let mut out = Vec::new();
        let mut buf = std::mem::take(&mut self.pending);
        buf.push_str(chunk);

        loop {
            match &mut self.region {
                Region::Visible => {
                    if let Some(index) = buf.find(OPEN_TAG) {
                        push_visible(&mut out, &buf[..index]);
                        out.push(Filtered::ThinkingStart);
                        buf = buf[index + OPEN_TAG.len()..].to_string();
                        self.region = Region::Thinking {
                            started: now,
                            content: String::new(),
                        };
                        continue;
                    }
                    let keep = partial_suffix_len(&buf, OPEN_TAG);
                    let split = buf.len() - keep;
                    push_visible(&mut out, &buf[..split]);
                    self.pending = buf[split..].to_string();
                    break;
                }
                Region::Thinking { content, .. } => {
                    if let Some(index) = buf.find(CLOSE_TAG) {
                        content.push_str(&buf[..index]);
                        buf = buf[index + CLOSE_TAG.len()..].to_string();
                        out.push(self.close_thinking(now));
                        continue;
                    }
                    let keep = partial_suffix_len(&buf, CLOSE_TAG);
                    let split = buf.len() - keep;
                    content.push_str(&buf[..split]);
                    self.pending = buf[split..].to_string();
                    break;
                }
            }
        }
        out
    }

    /// Releases held-back partial-tag text verbatim into whichever region is
    /// current.
    pub fn flush_pending(&mut self) -> Vec<Filtered> {
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return Vec::new();
        }
        match &mut self.region {
            Region::Visible => vec![Filtered::Visible(pending)],
            Region::Thinking { content, .. } => {
                content.push_str(&pending);
                Vec::new()
            }
        }
    }

    /// End of input: flushes held text and closes an unterminated think block.
    pub fn finish(&mut self, now: Instant) -> Vec<Filtered> {
        let mut out = self.flush_pending();
        if self.in_thinking() {
            out.push(self.close_thinking(now));
        }
        out
    }

    fn close_thinking(&mut self, now: Instant) -> Filtered {
        match std::mem::replace(&mut self.region, Region::Visible) {
            Region::Thinking { started, content } => Filtered::ThinkingEnd {
                duration_ms: now.saturating_duration_since(started).as_millis() as u64,
                chars_filtered: content.chars().count(),
                think_content: content,
            },
            Region::Visible => Filtered::ThinkingEnd {
                duration_ms: 0,
                chars_filtered: 0,
                think_content: String::new(),
            },
        }
    }
}

fn push_visible(out: &mut Vec<Filtered>, text: &str) {
    if !text.is_empty() {
        out.push(Filtered::Visible(text.to_string()));
    }
}

/// Length of the longest suffix of `buf` that is a proper prefix of `tag`.
fn partial_suffix_len(buf: &str, tag: &str) -> usize {
    let max = buf.len().min(tag.len() - 1);
    (1..=max)
        .rev()
        .find(|&len| buf.is_char_boundary(buf.len() - len) && tag.starts_with(&buf[buf.len() - len..]))
        .unwrap_or(0)
}
