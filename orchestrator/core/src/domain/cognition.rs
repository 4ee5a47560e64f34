// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Cognition Domain
//!
//! State and stage ports for the deep-mode loop:
//! Plan -> Execute -> Verify -> Remember, repeated until a verdict clears the
//! acceptance threshold or one of the iteration caps is hit.
//!
//! Each stage is an injected async port (`Planner`, `Executor`, `Verifier`,
//! `Rememberer`). The loop in `application::cognitive_loop` owns all
//! bookkeeping; stages never see or mutate `CognitiveState` directly.
//!
//! ## Counters
//! | Counter | Reset | Cap |
//! |---------|-------|-----|
//! | `iterations` | when a brand-new plan is adopted | `max_iterations_per_plan` (forces a fresh plan) |
//! | `total_iterations` | never (one request) | `max_total_iterations` (forces `Rejected`) |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::domain::llm::InferenceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Plan,
    Execute,
    Verify,
    Remember,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Plan => "plan",
            Stage::Execute => "execute",
            Stage::Verify => "verify",
            Stage::Remember => "remember",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CognitiveStatus {
    Planning,
    Executing,
    Verifying,
    Remembering,
    Accepted,
    Rejected,
    Aborted,
}

impl CognitiveStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CognitiveStatus::Accepted | CognitiveStatus::Rejected | CognitiveStatus::Aborted
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<String>,
    #[serde(default)]
    pub rationale: String,
}

impl Plan {
    pub fn new(steps: Vec<String>) -> Self {
        Self {
            steps,
            rationale: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureCategory {
    Logic,
    Syntax,
    Other,
}

impl FailureCategory {
    /// Keyword classification used when a stage does not name a category.
    pub fn classify(text: &str) -> Self {
        let lowered = text.to_lowercase();
        const SYNTAX: [&str; 6] = ["syntax", "parse", "malformed", "json", "compile", "unexpected token"];
        const LOGIC: [&str; 6] = ["logic", "incorrect", "wrong", "contradict", "incomplete", "missing"];

        if SYNTAX.iter().any(|k| lowered.contains(k)) {
            FailureCategory::Syntax
        } else if LOGIC.iter().any(|k| lowered.contains(k)) {
            FailureCategory::Logic
        } else {
            FailureCategory::Other
        }
    }
}

/// Bounded record of one failed attempt. Built through [`FailureSummary::new`]
/// so the description is always collapsed and truncated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub attempt_number: u32,
    pub cause_category: FailureCategory,
    pub short_description: String,
    /// Number of attempts that failed for this same reason.
    #[serde(default = "default_occurrences")]
    pub occurrences: u32,
}

fn default_occurrences() -> u32 {
    1
}

impl FailureSummary {
    pub fn new(
        attempt_number: u32,
        cause_category: FailureCategory,
        description: &str,
        max_chars: usize,
    ) -> Self {
        Self {
            attempt_number,
            cause_category,
            short_description: truncate_description(description, max_chars),
            occurrences: 1,
        }
    }

    fn same_cause(&self, other: &FailureSummary) -> bool {
        self.cause_category == other.cause_category
            && self.short_description == other.short_description
    }
}

/// Collapses whitespace and cuts to `max_chars` characters, marking the cut
/// with a trailing ellipsis.
pub fn truncate_description(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    if max_chars == 0 {
        return String::new();
    }
    let mut cut: String = collapsed.chars().take(max_chars - 1).collect();
    cut.push('…');
    cut
}

/// Score and feedback returned by the verify stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// 0.0 (reject) to 1.0 (perfect)
    pub score: f64,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub category: Option<FailureCategory>,
    /// Signals that drove the score, surfaced in the confidence event.
    #[serde(default)]
    pub factors: Vec<String>,
}

impl Verdict {
    /// Score clamped into `[0, 1]`; NaN counts as 0.
    pub fn normalized_score(&self) -> f64 {
        if self.score.is_nan() {
            0.0
        } else {
            self.score.clamp(0.0, 1.0)
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StageError {
    #[error("{stage:?} stage failed: {message}")]
    Failed { stage: Stage, message: String },

    #[error("{stage:?} stage timed out after {after:?}")]
    Timeout { stage: Stage, after: Duration },

    #[error("{stage:?} stage returned malformed output: {message}")]
    Malformed { stage: Stage, message: String },
}

impl StageError {
    pub fn failed(stage: Stage, message: impl Into<String>) -> Self {
        StageError::Failed {
            stage,
            message: message.into(),
        }
    }

    pub fn malformed(stage: Stage, message: impl Into<String>) -> Self {
        StageError::Malformed {
            stage,
            message: message.into(),
        }
    }

    pub fn from_inference(stage: Stage, err: InferenceError) -> Self {
        StageError::failed(stage, err.to_string())
    }

    pub fn stage(&self) -> Stage {
        match self {
            StageError::Failed { stage, .. }
            | StageError::Timeout { stage, .. }
            | StageError::Malformed { stage, .. } => *stage,
        }
    }

    pub fn category(&self) -> FailureCategory {
        match self {
            StageError::Malformed { .. } => FailureCategory::Syntax,
            StageError::Timeout { .. } => FailureCategory::Other,
            StageError::Failed { message, .. } => FailureCategory::classify(message),
        }
    }
}

/// Input for the plan stage.
#[derive(Debug)]
pub struct PlanContext<'a> {
    pub message: &'a str,
    pub current_plan: Option<&'a Plan>,
    pub past_failures: &'a [FailureSummary],
    /// Set when the current plan hit its per-plan cap; the planner must not
    /// hand back the same plan.
    pub require_fresh: bool,
}

/// Input for the execute stage. `past_failures` must be referenced in the
/// prompt so earlier mistakes are not repeated.
#[derive(Debug)]
pub struct ExecutionContext<'a> {
    pub message: &'a str,
    pub plan: &'a Plan,
    pub past_failures: &'a [FailureSummary],
}

/// Input for the verify stage. `directive` is the trusted instruction
/// context; `user_message` and `output` are untrusted content and must never
/// be placed in the same instruction channel as `directive`.
#[derive(Debug)]
pub struct VerificationContext<'a> {
    pub directive: &'a str,
    pub user_message: &'a str,
    pub plan: &'a Plan,
    pub output: &'a str,
}

/// Input for the remember stage: exactly one of `verdict` or `error` is set.
#[derive(Debug)]
pub struct RememberContext<'a> {
    pub attempt_number: u32,
    pub verdict: Option<&'a Verdict>,
    pub error: Option<&'a StageError>,
    pub output: Option<&'a str>,
    pub max_chars: usize,
}

impl RememberContext<'_> {
    /// Categorizes the failure and bounds its description. Raw output is
    /// never copied into the summary.
    pub fn summarize(&self) -> FailureSummary {
        if let Some(error) = self.error {
            return FailureSummary::new(
                self.attempt_number,
                error.category(),
                &error.to_string(),
                self.max_chars,
            );
        }
        match self.verdict {
            Some(verdict) => {
                let description = if verdict.feedback.trim().is_empty() {
                    format!(
                        "Answer scored {:.2}, below the acceptance threshold",
                        verdict.normalized_score()
                    )
                } else {
                    verdict.feedback.clone()
                };
                let category = verdict
                    .category
                    .unwrap_or_else(|| FailureCategory::classify(&description));
                FailureSummary::new(self.attempt_number, category, &description, self.max_chars)
            }
            None => FailureSummary::new(
                self.attempt_number,
                FailureCategory::Other,
                "Attempt failed",
                self.max_chars,
            ),
        }
    }
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, ctx: &PlanContext<'_>) -> Result<Plan, StageError>;
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<String, StageError>;
}

#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, ctx: &VerificationContext<'_>) -> Result<Verdict, StageError>;
}

#[async_trait]
pub trait Rememberer: Send + Sync {
    async fn remember(&self, ctx: &RememberContext<'_>) -> Result<FailureSummary, StageError>;
}

/// The four stage ports bundled for one loop.
#[derive(Clone)]
pub struct CognitiveStages {
    pub planner: Arc<dyn Planner>,
    pub executor: Arc<dyn Executor>,
    pub verifier: Arc<dyn Verifier>,
    pub memory: Arc<dyn Rememberer>,
}

/// Mutable bookkeeping of one deep request. Counters are private so they can
/// only move through the methods below.
#[derive(Debug, Clone, Serialize)]
pub struct CognitiveState {
    plan: Option<Plan>,
    iterations: u32,
    total_iterations: u32,
    past_failures: Vec<FailureSummary>,
    last_score: Option<f64>,
    status: CognitiveStatus,
    max_failures: usize,
}

impl CognitiveState {
    pub fn new(max_failures: usize) -> Self {
        Self {
            plan: None,
            iterations: 0,
            total_iterations: 0,
            past_failures: Vec::new(),
            last_score: None,
            status: CognitiveStatus::Planning,
            max_failures: max_failures.max(1),
        }
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn total_iterations(&self) -> u32 {
        self.total_iterations
    }

    pub fn past_failures(&self) -> &[FailureSummary] {
        &self.past_failures
    }

    pub fn last_score(&self) -> Option<f64> {
        self.last_score
    }

    pub fn status(&self) -> CognitiveStatus {
        self.status
    }

    pub fn transition(&mut self, status: CognitiveStatus) {
        if !self.status.is_terminal() {
            self.status = status;
        }
    }

    /// Installs `plan`. Returns `true` when it counts as a brand-new plan,
    /// which resets the per-plan counter.
    pub fn adopt_plan(&mut self, plan: Plan, force_new: bool) -> bool {
        let is_new = force_new || self.plan.as_ref() != Some(&plan);
        if is_new {
            self.iterations = 0;
        }
        self.plan = Some(plan);
        is_new
    }

    pub fn record_score(&mut self, score: f64) {
        self.last_score = Some(score);
    }

    /// Counts one failed cycle against both counters.
    pub fn count_cycle(&mut self) {
        self.iterations += 1;
        self.total_iterations += 1;
    }

    /// Counts a failed planning attempt. No plan is active, so only the
    /// request-wide counter moves.
    pub fn count_planning_failure(&mut self) {
        self.total_iterations += 1;
    }

    /// Aggregates `summary` into memory: a repeat of an already-remembered
    /// cause bumps that entry instead of growing the list, and the list never
    /// exceeds its cap (oldest entries are dropped first).
    pub fn remember(&mut self, summary: FailureSummary) {
        if let Some(existing) = self.past_failures.iter_mut().find(|f| f.same_cause(&summary)) {
            existing.occurrences += 1;
            existing.attempt_number = summary.attempt_number;
            return;
        }
        if self.past_failures.len() >= self.max_failures {
            self.past_failures.remove(0);
        }
        self.past_failures.push(summary);
    }
}
