// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Admission Domain
//!
//! Value types describing how a chat request is admitted onto one of the
//! inference slots. The stateful scheduler lives in
//! `application::slot_manager`; this module only holds the vocabulary.
//!
//! | Type | Description |
//! |------|-------------|
//! | `RequestId` | Stable identifier of one inbound chat request |
//! | `PriorityClass` | `User` sorts ahead of `Background` in the wait queue |
//! | `AdmissionTicket` | Snapshot of a request's place in the slot pool |
//! | `SlotPoolSnapshot` | Read-only view used by `/health` and gauges |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Priority class of a request. Declaration order is queue order: a lower
/// variant always sorts ahead of a higher one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PriorityClass {
    #[default]
    User,
    Background,
}

impl PriorityClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityClass::User => "user",
            PriorityClass::Background => "background",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Released tickets leave the pool entirely, so no state is kept for them.
pub enum TicketState {
    Queued,
    Granted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionTicket {
    pub request_id: RequestId,
    pub priority_class: PriorityClass,
    pub enqueued_at: DateTime<Utc>,
    pub state: TicketState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotPoolSnapshot {
    pub capacity: usize,
    pub active: usize,
    pub waiting_user: usize,
    pub waiting_background: usize,
}

impl SlotPoolSnapshot {
    pub fn waiting(&self) -> usize {
        self.waiting_user + self.waiting_background
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Slot pool is unavailable (shutting down)")]
    Unavailable,

    #[error("Request {0} is already admitted or queued")]
    Duplicate(RequestId),
}
