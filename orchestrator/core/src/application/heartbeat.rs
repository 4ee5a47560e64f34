// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Heartbeat Wrapper
//!
//! Wraps a raw [`TokenStream`] into a stream of [`StreamEvent`]s that keeps
//! the caller's connection alive while the model is silent.
//!
//! Two clocks run against the time of the last token:
//!
//! | Deadline | Effect |
//! |----------|--------|
//! | `pulse_interval` | emit `pulse`, repeat every interval; does not reset the token clock |
//! | `hard_stall_timeout` | emit one `model_unresponsive` error, drop the source, end |
//!
//! A third deadline (`partial_tag_flush`) force-flushes text held back by the
//! [`ThinkFilter`] when no resolving chunk arrives. Cancellation ends the
//! stream without further events.

use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use std::future::Future;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::application::think_filter::{Filtered, ThinkFilter};
use crate::domain::llm::{InferenceError, TokenStream};
use crate::domain::node_config::StreamingConfig;
use crate::domain::stream::{FailureKind, MetaEvent, StreamEvent};

pub type EventStream = BoxStream<'static, StreamEvent>;

enum Wake {
    Cancelled,
    Chunk(Option<Result<String, InferenceError>>),
    Flush,
    Stall,
    Pulse,
}

#[derive(Debug, Clone)]
pub struct HeartbeatWrapper {
    config: StreamingConfig,
}

impl HeartbeatWrapper {
    pub fn new(config: StreamingConfig) -> Self {
        Self { config }
    }

    /// Like [`HeartbeatWrapper::wrap`], but the clocks start before the
    /// source exists: pulses and the stall deadline also cover the wait for
    /// `opening`. An opening error ends the stream as an inference error.
    pub fn wrap_opening<F>(&self, opening: F, cancel: CancellationToken) -> EventStream
    where
        F: Future<Output = Result<TokenStream, InferenceError>> + Send + 'static,
    {
        let source = stream::once(opening).try_flatten().boxed();
        self.wrap(source, cancel)
    }

    pub fn wrap(&self, source: TokenStream, cancel: CancellationToken) -> EventStream {
        let pulse_interval = self.config.pulse_interval;
        let stall_timeout = self.config.hard_stall_timeout;
        let flush_after = self.config.partial_tag_flush;

        let events = async_stream::stream! {
            let mut source = source;
            let mut filter = ThinkFilter::new();
            let mut last_token = Instant::now();
            let mut next_pulse = last_token + pulse_interval;
            let mut flush_at: Option<Instant> = None;

            loop {
                let stall_at = last_token + stall_timeout;
                let flush_deadline = flush_at.unwrap_or(stall_at);

                let wake = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Wake::Cancelled,
                    chunk = source.next() => Wake::Chunk(chunk),
                    _ = sleep_until(flush_deadline), if flush_at.is_some() => Wake::Flush,
                    _ = sleep_until(stall_at) => Wake::Stall,
                    _ = sleep_until(next_pulse) => Wake::Pulse,
                };

                match wake {
                    Wake::Cancelled => {
                        debug!("Token stream cancelled by caller");
                        break;
                    }
                    Wake::Chunk(Some(Ok(text))) => {
                        let now = Instant::now();
                        last_token = now;
                        next_pulse = now + pulse_interval;
                        for out in filter.push(&text, now) {
                            if let Some(event) = to_event(out) {
                                yield event;
                            }
                        }
                        flush_at = filter.has_pending().then(|| now + flush_after);
                    }
                    Wake::Chunk(Some(Err(e))) => {
                        for out in filter.finish(Instant::now()) {
                            if let Some(event) = to_event(out) {
                                yield event;
                            }
                        }
                        warn!("Inference stream failed: {}", e);
                        yield StreamEvent::error(FailureKind::Inference, e.to_string());
                        break;
                    }
                    Wake::Chunk(None) => {
                        for out in filter.finish(Instant::now()) {
                            if let Some(event) = to_event(out) {
                                yield event;
                            }
                        }
                        break;
                    }
                    Wake::Flush => {
                        flush_at = None;
                        for out in filter.flush_pending() {
                            if let Some(event) = to_event(out) {
                                yield event;
                            }
                        }
                    }
                    Wake::Stall => {
                        metrics::counter!("aegis_chat_stream_stalls_total").increment(1);
                        warn!(
                            "No tokens for {:?}, abandoning generation",
                            stall_timeout
                        );
                        yield StreamEvent::error(
                            FailureKind::ModelUnresponsive,
                            format!(
                                "Model unresponsive: no output for {}s",
                                stall_timeout.as_secs()
                            ),
                        );
                        break;
                    }
                    Wake::Pulse => {
                        metrics::counter!("aegis_chat_stream_pulses_total").increment(1);
                        next_pulse = Instant::now() + pulse_interval;
                        yield StreamEvent::pulse();
                    }
                }
            }
            // `source` drops here, which stops generation upstream.
        };

        events.boxed()
    }
}

fn to_event(out: Filtered) -> Option<StreamEvent> {
    match out {
        Filtered::Visible(text) if text.is_empty() => None,
        Filtered::Visible(text) => Some(StreamEvent::Token(text)),
        Filtered::ThinkingStart => Some(StreamEvent::Meta(MetaEvent::ThinkingStart)),
        Filtered::ThinkingEnd {
            duration_ms,
            chars_filtered,
            think_content,
        } => Some(StreamEvent::Meta(MetaEvent::ThinkingEnd {
            duration_ms,
            chars_filtered,
            think_content,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn config(pulse_secs: u64, stall_secs: u64) -> StreamingConfig {
        StreamingConfig {
            pulse_interval: Duration::from_secs(pulse_secs),
            hard_stall_timeout: Duration::from_secs(stall_secs),
            partial_tag_flush: Duration::from_millis(200),
            ..StreamingConfig::default()
        }
    }

    fn tokens(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Token(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    fn pulses(events: &[StreamEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Meta(MetaEvent::Pulse)))
            .count()
    }

    /// Yields `chunks` in order, sleeping the paired delay before each one.
    fn timed_source(chunks: Vec<(u64, &'static str)>) -> TokenStream {
        async_stream::stream! {
            for (delay_ms, text) in chunks {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                yield Ok(text.to_string());
            }
        }
        .boxed()
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_pass_through_in_order() {
        let wrapper = HeartbeatWrapper::new(config(1, 120));
        let source = timed_source(vec![(0, "Hel"), (10, "lo"), (10, " there")]);
        let events: Vec<_> = wrapper.wrap(source, CancellationToken::new()).collect().await;
        assert_eq!(tokens(&events), "Hello there");
        assert_eq!(pulses(&events), 0);
        assert!(events.iter().all(|e| !e.is_terminal()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_emits_pulses_then_tokens_resume() {
        let wrapper = HeartbeatWrapper::new(config(1, 120));
        let source = timed_source(vec![(0, "a"), (3_500, "b")]);
        let events: Vec<_> = wrapper.wrap(source, CancellationToken::new()).collect().await;

        assert_eq!(tokens(&events), "ab");
        assert_eq!(pulses(&events), 3);
        assert_eq!(events.first(), Some(&StreamEvent::token("a")));
        assert_eq!(events.last(), Some(&StreamEvent::token("b")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_stall_emits_single_error_and_stops_source() {
        let polled_after_stall = Arc::new(AtomicBool::new(false));
        let flag = polled_after_stall.clone();
        let source: TokenStream = async_stream::stream! {
            yield Ok("a".to_string());
            tokio::time::sleep(Duration::from_secs(600)).await;
            flag.store(true, Ordering::SeqCst);
            yield Ok("late".to_string());
        }
        .boxed();

        let wrapper = HeartbeatWrapper::new(config(1, 5));
        let events: Vec<_> = wrapper.wrap(source, CancellationToken::new()).collect().await;

        let errors: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(errors.len(), 1);
        match events.last() {
            Some(StreamEvent::Error(failure)) => {
                assert_eq!(failure.kind, FailureKind::ModelUnresponsive)
            }
            other => panic!("expected stall error, got {:?}", other),
        }
        assert_eq!(tokens(&events), "a");
        assert_eq!(pulses(&events), 4);

        tokio::time::sleep(Duration::from_secs(1_000)).await;
        assert!(!polled_after_stall.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_think_blocks_become_meta_events() {
        let wrapper = HeartbeatWrapper::new(config(1, 120));
        let source = timed_source(vec![(0, "Hello <thi"), (5, "nk>secret</think> world")]);
        let events: Vec<_> = wrapper.wrap(source, CancellationToken::new()).collect().await;

        assert_eq!(tokens(&events), "Hello  world");
        assert!(events.contains(&StreamEvent::Meta(MetaEvent::ThinkingStart)));
        let end = events.iter().find_map(|e| match e {
            StreamEvent::Meta(MetaEvent::ThinkingEnd { think_content, .. }) => {
                Some(think_content.clone())
            }
            _ => None,
        });
        assert_eq!(end.as_deref(), Some("secret"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_tag_flushed_after_timeout() {
        let wrapper = HeartbeatWrapper::new(config(1, 120));
        let source = timed_source(vec![(0, "a <th"), (5_000, "ink about it")]);
        let events: Vec<_> = wrapper.wrap(source, CancellationToken::new()).collect().await;

        assert_eq!(events[0], StreamEvent::token("a "));
        assert_eq!(events[1], StreamEvent::token("<th"));
        assert_eq!(events[2], StreamEvent::pulse());
        assert_eq!(tokens(&events), "a <think about it");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_ends_stream_silently() {
        let cancel = CancellationToken::new();
        let source: TokenStream = async_stream::stream! {
            yield Ok("a".to_string());
            futures::future::pending::<()>().await;
        }
        .boxed();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2_500)).await;
            trigger.cancel();
        });

        let wrapper = HeartbeatWrapper::new(config(1, 120));
        let events: Vec<_> = wrapper.wrap(source, cancel).collect().await;
        assert_eq!(tokens(&events), "a");
        assert_eq!(pulses(&events), 2);
        assert!(events.iter().all(|e| !e.is_terminal()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_stream_open_counts_as_silence() {
        let opening = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(timed_source(vec![(0, "late")]))
        };
        let wrapper = HeartbeatWrapper::new(config(1, 5));
        let events: Vec<_> = wrapper
            .wrap_opening(opening, CancellationToken::new())
            .collect()
            .await;

        assert_eq!(pulses(&events), 4);
        assert_eq!(tokens(&events), "");
        match events.last() {
            Some(StreamEvent::Error(failure)) => {
                assert_eq!(failure.kind, FailureKind::ModelUnresponsive)
            }
            other => panic!("expected stall error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_stream_open_is_inference_error() {
        let opening = async { Err(InferenceError::ModelNotFound("m".to_string())) };
        let wrapper = HeartbeatWrapper::new(config(1, 5));
        let events: Vec<_> = wrapper
            .wrap_opening(opening, CancellationToken::new())
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            StreamEvent::Error(failure) if failure.kind == FailureKind::Inference
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_consumer_gets_no_burst_of_overdue_pulses() {
        let source: TokenStream = futures::stream::pending().boxed();
        let wrapper = HeartbeatWrapper::new(config(1, 120));
        let mut events = wrapper.wrap(source, CancellationToken::new());

        assert_eq!(events.next().await, Some(StreamEvent::pulse()));
        // Consumer stalls for several pulse intervals
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(events.next().await, Some(StreamEvent::pulse()));
        let caught_up = Instant::now();
        assert_eq!(events.next().await, Some(StreamEvent::pulse()));
        assert_eq!(Instant::now() - caught_up, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_error_is_terminal() {
        let source: TokenStream = futures::stream::iter(vec![
            Ok("x".to_string()),
            Err(InferenceError::Network("connection reset".to_string())),
        ])
        .boxed();
        let wrapper = HeartbeatWrapper::new(config(1, 120));
        let events: Vec<_> = wrapper.wrap(source, CancellationToken::new()).collect().await;
        match events.last() {
            Some(StreamEvent::Error(failure)) => assert_eq!(failure.kind, FailureKind::Inference),
            other => panic!("expected error, got {:?}", other),
        }
    }
}
