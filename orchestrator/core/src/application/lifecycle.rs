// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Chat Request Lifecycle
//!
//! Binds one inbound [`ChatRequest`] to an admission ticket, an execution
//! path and an event channel, and tears all of it down on completion, error
//! or cancellation.
//!
//! ```text
//! start() ─► enqueue ─► queue_heartbeat* ─► loading ─┬─ fast/standard: generate ─► HeartbeatWrapper ─► token/pulse*
//!                                                    └─ deep: CognitiveLoop ─► thinking_* / confidence / pulse*
//!                                                                         ─► done | error
//! ```
//!
//! Two cancellation sources feed one work token: an explicit stop (answered
//! with `done {outcome: cancelled}`) and a caller disconnect (silent, nobody is
//! listening). Slot release and registry cleanup are scope guards, so every
//! exit path gives the slot back.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::application::cancellation::{CancellationRegistry, Registration};
use crate::application::cognitive_loop::{CognitiveLoop, LoopEnd, LoopObserver};
use crate::application::event_stream::{event_channel, EventReceiver, EventSink};
use crate::application::heartbeat::HeartbeatWrapper;
use crate::application::slot_manager::{SlotGuard, SlotManager};
use crate::domain::admission::{AdmissionError, RequestId, SlotPoolSnapshot};
use crate::domain::chat::{ChatMode, ChatRequest};
use crate::domain::cognition::{CognitiveStages, Stage, Verdict};
use crate::domain::llm::{GenerationOptions, GenerationRequest, InferenceBackend, InferenceError};
use crate::domain::node_config::{InferenceConfig, NodeConfigSpec, SchedulerConfig, StreamingConfig};
use crate::domain::stream::{
    ConfidenceLevel, DoneSummary, FailureKind, MetaEvent, RequestOutcome, StreamEvent,
};

const ASSISTANT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Answer clearly and concisely.";

/// Handle returned to the transport for one started request.
#[derive(Debug)]
pub struct StartedChat {
    pub request_id: RequestId,
    pub events: EventReceiver,
}

pub struct ChatService {
    slots: Arc<SlotManager>,
    cancellations: Arc<CancellationRegistry>,
    backend: Arc<dyn InferenceBackend>,
    stages: CognitiveStages,
    cognitive: CognitiveLoop,
    heartbeat: HeartbeatWrapper,
    scheduler: SchedulerConfig,
    streaming: StreamingConfig,
    inference: InferenceConfig,
}

/// How a request left the pipeline; drives the completion metric.
enum Exit {
    Finished(RequestOutcome),
    Failed(FailureKind),
    Disconnected,
}

impl Exit {
    fn label(&self) -> &'static str {
        match self {
            Exit::Finished(outcome) => outcome.as_str(),
            Exit::Failed(kind) => kind.as_str(),
            Exit::Disconnected => "disconnected",
        }
    }
}

impl ChatService {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        stages: CognitiveStages,
        config: &NodeConfigSpec,
    ) -> Self {
        Self {
            slots: Arc::new(SlotManager::new(config.scheduler.capacity)),
            cancellations: Arc::new(CancellationRegistry::new()),
            backend,
            stages,
            cognitive: CognitiveLoop::new(config.cognition.clone()),
            heartbeat: HeartbeatWrapper::new(config.streaming.clone()),
            scheduler: config.scheduler.clone(),
            streaming: config.streaming.clone(),
            inference: config.inference.clone(),
        }
    }

    pub fn slots(&self) -> &Arc<SlotManager> {
        &self.slots
    }

    pub fn snapshot(&self) -> SlotPoolSnapshot {
        self.slots.snapshot()
    }

    pub fn model(&self) -> &str {
        self.backend.model()
    }

    pub async fn backend_health(&self) -> Result<(), InferenceError> {
        self.backend.health_check().await
    }

    /// Out-of-band stop keyed by request id.
    pub fn stop(&self, request_id: RequestId) -> bool {
        self.cancellations.stop(request_id)
    }

    pub fn live_requests(&self) -> usize {
        self.cancellations.len()
    }

    /// Closes admission: queued requests fail with `unavailable`, running
    /// ones finish.
    pub fn shutdown(&self) {
        self.slots.shutdown();
    }

    /// Registers the request and runs it on its own task. The returned
    /// receiver yields frames until exactly one `done` or `error`.
    pub fn start(self: &Arc<Self>, request: ChatRequest) -> StartedChat {
        let request_id = RequestId::new();
        let registration = self.cancellations.register(request_id);
        let (sink, events) = event_channel(request_id, self.streaming.channel_capacity);

        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.run(request, registration, sink).await;
        });

        StartedChat { request_id, events }
    }

    async fn run(&self, request: ChatRequest, registration: Registration, mut sink: EventSink) {
        let request_id = registration.request_id();
        let started = Instant::now();
        let mode = request.mode;
        metrics::counter!("aegis_chat_requests_total", "mode" => mode.as_str()).increment(1);
        info!(
            request_id = %request_id,
            mode = mode.as_str(),
            class = request.priority_class().as_str(),
            "Chat request started"
        );

        // Stop or disconnect; both end work, only stop is reported.
        let work = registration.token().child_token();
        let _teardown = work.clone().drop_guard();
        spawn_disconnect_watch(&sink, work.clone());

        let exit = match self.admit(&request, &mut sink, &work).await {
            Ok(slot) => {
                let queue_wait = slot.queue_wait();
                let ctx = RunContext {
                    request_id,
                    mode,
                    started,
                    queue_wait,
                    work: &work,
                };
                let exit = match mode {
                    ChatMode::Fast | ChatMode::Standard => {
                        self.run_direct(&request, &ctx, &mut sink).await
                    }
                    ChatMode::Deep => self.run_deep(&request, &ctx, &mut sink).await,
                };
                drop(slot);
                exit
            }
            Err(exit) => exit,
        };

        let exit = match exit {
            Exit::Finished(RequestOutcome::Cancelled) if !registration.is_stopped() => {
                Exit::Disconnected
            }
            other => other,
        };
        if let Exit::Finished(RequestOutcome::Cancelled) = exit {
            let summary = done_summary(
                request_id,
                mode,
                RequestOutcome::Cancelled,
                started,
                Duration::ZERO,
                0,
            );
            let _ = sink.send(StreamEvent::Done(summary)).await;
        }

        metrics::counter!("aegis_chat_requests_completed_total", "outcome" => exit.label())
            .increment(1);
        info!(
            request_id = %request_id,
            outcome = exit.label(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Chat request finished"
        );
    }

    /// Waits for a slot, reporting queue position on every heartbeat tick.
    async fn admit(
        &self,
        request: &ChatRequest,
        sink: &mut EventSink,
        work: &CancellationToken,
    ) -> Result<SlotGuard, Exit> {
        let request_id = sink.request_id();
        let mut pending = match self.slots.enqueue(request_id, request.priority_class()) {
            Ok(pending) => pending,
            Err(e) => return Err(fail(sink, FailureKind::Unavailable, e.to_string()).await),
        };

        let mut ticker = interval(self.scheduler.queue_heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = work.cancelled() => {
                    debug!(request_id = %request_id, "Cancelled while queued");
                    return Err(Exit::Finished(RequestOutcome::Cancelled));
                }
                granted = pending.granted() => {
                    return match granted {
                        Ok(slot) => Ok(slot),
                        Err(AdmissionError::Unavailable) => Err(fail(
                            sink,
                            FailureKind::Unavailable,
                            "Service is shutting down; no inference slot available",
                        )
                        .await),
                        Err(e) => Err(fail(sink, FailureKind::Unavailable, e.to_string()).await),
                    };
                }
                _ = ticker.tick() => {
                    let position = pending.position();
                    let beat = StreamEvent::Meta(MetaEvent::QueueHeartbeat { position });
                    if sink.send(beat).await.is_err() {
                        return Err(Exit::Disconnected);
                    }
                }
            }
        }
    }

    async fn run_direct(
        &self,
        request: &ChatRequest,
        ctx: &RunContext<'_>,
        sink: &mut EventSink,
    ) -> Exit {
        if self.announce_model(sink).await.is_err() {
            return Exit::Disconnected;
        }

        let options = match request.mode {
            ChatMode::Fast => GenerationOptions::fast(),
            _ => GenerationOptions::default(),
        };
        let generation = GenerationRequest::new(request.message.clone())
            .with_system(ASSISTANT_SYSTEM_PROMPT)
            .with_options(options);

        let deadline = sleep(self.inference.request_timeout);
        tokio::pin!(deadline);

        // Waiting for the backend to open its stream (model load) counts as
        // silence for the pulse and stall clocks.
        let backend = Arc::clone(&self.backend);
        let opening = async move { backend.generate(generation).await };
        let mut events = self.heartbeat.wrap_opening(opening, ctx.work.clone());
        let mut chars = 0usize;
        loop {
            tokio::select! {
                biased;
                event = events.next() => match event {
                    Some(event) => {
                        if let StreamEvent::Token(text) = &event {
                            chars += text.chars().count();
                        }
                        let failure = match &event {
                            StreamEvent::Error(failure) => Some(failure.kind),
                            _ => None,
                        };
                        if sink.send(event).await.is_err() {
                            return Exit::Disconnected;
                        }
                        if let Some(kind) = failure {
                            return Exit::Failed(kind);
                        }
                    }
                    None => break,
                },
                _ = &mut deadline => return self.took_too_long(sink).await,
            }
        }

        if ctx.work.is_cancelled() {
            return Exit::Finished(RequestOutcome::Cancelled);
        }

        let summary = done_summary(
            ctx.request_id,
            ctx.mode,
            RequestOutcome::Completed,
            ctx.started,
            ctx.queue_wait,
            chars,
        );
        finish(sink, summary).await
    }

    async fn run_deep(
        &self,
        request: &ChatRequest,
        ctx: &RunContext<'_>,
        sink: &mut EventSink,
    ) -> Exit {
        if self.announce_model(sink).await.is_err()
            || sink
                .send(StreamEvent::Meta(MetaEvent::ThinkingStart))
                .await
                .is_err()
        {
            return Exit::Disconnected;
        }
        let thinking_started = Instant::now();

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let observer = ProgressObserver {
            tx: progress_tx,
            accept_threshold: self.cognitive.config().accept_threshold,
        };

        let pulse_every = self.streaming.pulse_interval;
        let mut pulse = interval_at(Instant::now() + pulse_every, pulse_every);
        pulse.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let run = self
            .cognitive
            .run(&request.message, &self.stages, ctx.work, &observer);
        tokio::pin!(run);

        let outcome = loop {
            tokio::select! {
                biased;
                outcome = &mut run => break outcome,
                Some(meta) = progress_rx.recv() => {
                    pulse.reset();
                    if sink.send(StreamEvent::Meta(meta)).await.is_err() {
                        ctx.work.cancel();
                    }
                }
                _ = pulse.tick() => {
                    metrics::counter!("aegis_chat_stream_pulses_total").increment(1);
                    if sink.send(StreamEvent::pulse()).await.is_err() {
                        ctx.work.cancel();
                    }
                }
            }
        };
        while let Ok(meta) = progress_rx.try_recv() {
            let _ = sink.send(StreamEvent::Meta(meta)).await;
        }

        if outcome.end == LoopEnd::Cancelled {
            return Exit::Finished(RequestOutcome::Cancelled);
        }

        let think_content = outcome
            .state
            .plan()
            .map(|plan| plan.steps.join("\n"))
            .unwrap_or_default();
        let thinking_end = MetaEvent::ThinkingEnd {
            duration_ms: thinking_started.elapsed().as_millis() as u64,
            chars_filtered: think_content.chars().count(),
            think_content,
        };
        if sink.send(StreamEvent::Meta(thinking_end)).await.is_err() {
            return Exit::Disconnected;
        }

        let iterations = outcome.total_iterations();
        let (answer, outcome_kind, score, summary_text) = match outcome.end {
            LoopEnd::Accepted { answer, score } => {
                (Some(answer), RequestOutcome::Accepted, Some(score), None)
            }
            LoopEnd::Rejected {
                best_answer,
                best_score,
            } => (
                best_answer,
                RequestOutcome::Rejected,
                best_score,
                Some(format!(
                    "could not verify an answer after {} attempts; showing the best candidate",
                    iterations
                )),
            ),
            LoopEnd::TimedOut => {
                return fail(
                    sink,
                    FailureKind::TookTooLong,
                    format!(
                        "Deep reasoning took too long (limit {}s)",
                        self.cognitive.config().cognitive_loop_timeout.as_secs()
                    ),
                )
                .await;
            }
            LoopEnd::Cancelled => return Exit::Finished(RequestOutcome::Cancelled),
        };

        let mut chars = 0;
        if let Some(answer) = answer.filter(|a| !a.is_empty()) {
            chars = answer.chars().count();
            if sink.send(StreamEvent::Token(answer)).await.is_err() {
                return Exit::Disconnected;
            }
        }

        let mut summary = done_summary(
            ctx.request_id,
            ctx.mode,
            outcome_kind,
            ctx.started,
            ctx.queue_wait,
            chars,
        );
        summary.iterations = Some(iterations);
        summary.score = score;
        summary.summary = summary_text;
        finish(sink, summary).await
    }

    async fn announce_model(&self, sink: &mut EventSink) -> Result<(), ()> {
        let loading = MetaEvent::Loading {
            model: self.backend.model().to_string(),
        };
        sink.send(StreamEvent::Meta(loading)).await.map_err(|_| ())
    }

    async fn took_too_long(&self, sink: &mut EventSink) -> Exit {
        fail(
            sink,
            FailureKind::TookTooLong,
            format!(
                "Generation took too long (limit {}s)",
                self.inference.request_timeout.as_secs()
            ),
        )
        .await
    }
}

struct RunContext<'a> {
    request_id: RequestId,
    mode: ChatMode,
    started: Instant,
    queue_wait: Duration,
    work: &'a CancellationToken,
}

/// Forwards loop progress into the request's frame sequence.
struct ProgressObserver {
    tx: mpsc::UnboundedSender<MetaEvent>,
    accept_threshold: f64,
}

#[async_trait]
impl LoopObserver for ProgressObserver {
    async fn on_stage(&self, stage: Stage, iteration: u32, total_iterations: u32) {
        let _ = self.tx.send(MetaEvent::ThinkingStep {
            stage,
            iteration,
            total_iterations,
        });
    }

    async fn on_verdict(&self, score: f64, verdict: &Verdict) {
        let _ = self.tx.send(MetaEvent::Confidence {
            score,
            level: ConfidenceLevel::from_score(score, self.accept_threshold),
            factors: verdict.factors.clone(),
        });
    }
}

/// Cancels `work` once the caller drops its receiver. Ends on its own when
/// `work` is cancelled for any other reason.
fn spawn_disconnect_watch(sink: &EventSink, work: CancellationToken) {
    let closed = sink.disconnect_signal();
    tokio::spawn(async move {
        tokio::select! {
            _ = work.cancelled() => {}
            _ = closed => {
                debug!("Caller disconnected; stopping work");
                work.cancel();
            }
        }
    });
}

fn done_summary(
    request_id: RequestId,
    mode: ChatMode,
    outcome: RequestOutcome,
    started: Instant,
    queue_wait: Duration,
    chars: usize,
) -> DoneSummary {
    DoneSummary {
        request_id,
        mode,
        outcome,
        duration_ms: started.elapsed().as_millis() as u64,
        queue_wait_ms: queue_wait.as_millis() as u64,
        chars,
        iterations: None,
        score: None,
        summary: None,
    }
}

async fn finish(sink: &mut EventSink, summary: DoneSummary) -> Exit {
    let outcome = summary.outcome;
    match sink.send(StreamEvent::Done(summary)).await {
        Ok(()) => Exit::Finished(outcome),
        Err(_) => Exit::Disconnected,
    }
}

async fn fail(sink: &mut EventSink, kind: FailureKind, message: impl Into<String>) -> Exit {
    match sink.send(StreamEvent::error(kind, message)).await {
        Ok(()) => Exit::Failed(kind),
        Err(_) => Exit::Disconnected,
    }
}
