// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod cancellation;
pub mod cognitive_loop;
pub mod event_stream;
pub mod heartbeat;
pub mod lifecycle;
pub mod slot_manager;
pub mod think_filter;

// Re-export services for convenience
pub use cancellation::{CancellationRegistry, Registration};
pub use cognitive_loop::{CognitiveLoop, LoopEnd, LoopObserver, LoopOutcome, VERIFIER_DIRECTIVE};
pub use event_stream::{event_channel, EventReceiver, EventSink, StreamError};
pub use heartbeat::HeartbeatWrapper;
pub use lifecycle::{ChatService, StartedChat};
pub use slot_manager::{PendingAdmission, SlotGuard, SlotManager};
