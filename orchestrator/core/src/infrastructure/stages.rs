// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! LLM-backed cognitive stages
//!
//! Planner, executor and verifier each make one non-streaming completion
//! through the [`InferenceBackend`] port. The memory stage is deterministic:
//! it categorizes and truncates, it never calls the model.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::cognition::{
    CognitiveStages, ExecutionContext, FailureCategory, FailureSummary, Plan, PlanContext,
    Planner, RememberContext, Rememberer, Stage, StageError, Verdict, VerificationContext,
    Verifier, Executor,
};
use crate::domain::llm::{
    collect_completion, GenerationOptions, GenerationRequest, InferenceBackend,
};

const PLANNER_SYSTEM_PROMPT: &str = r#"You plan how to answer a user's message.
Respond with JSON only:
{"steps": ["<short step>", ...], "rationale": "<one sentence>"}
Use at most 5 steps."#;

const EXECUTOR_SYSTEM_PROMPT: &str = "You are a careful assistant. Follow the plan to answer \
the user's message. If earlier attempts failed, avoid repeating their mistakes. \
Reply with the final answer only.";

/// Wires all four stages to one backend.
pub fn llm_stages(backend: Arc<dyn InferenceBackend>) -> CognitiveStages {
    CognitiveStages {
        planner: Arc::new(LlmPlanner::new(backend.clone())),
        executor: Arc::new(LlmExecutor::new(backend.clone())),
        verifier: Arc::new(LlmVerifier::new(backend)),
        memory: Arc::new(SummarizingMemory),
    }
}

async fn complete(
    backend: &dyn InferenceBackend,
    stage: Stage,
    request: GenerationRequest,
) -> Result<String, StageError> {
    let stream = backend
        .generate(request)
        .await
        .map_err(|e| StageError::from_inference(stage, e))?;
    let text = collect_completion(stream)
        .await
        .map_err(|e| StageError::from_inference(stage, e))?;
    Ok(strip_thinking(&text).trim().to_string())
}

/// Removes `<think>`/`<thinking>` blocks; an unterminated block drops the rest.
pub fn strip_thinking(input: &str) -> String {
    let mut output = input.to_string();
    for (start, end) in [("<think>", "</think>"), ("<thinking>", "</thinking>")] {
        while let Some(start_idx) = output.find(start) {
            let Some(relative_end) = output[start_idx + start.len()..].find(end) else {
                output.truncate(start_idx);
                break;
            };
            let end_idx = start_idx + start.len() + relative_end + end.len();
            output.replace_range(start_idx..end_idx, "");
        }
    }
    output
}

/// Outermost `{...}` span, tolerating prose or code fences around it.
fn json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn format_failures(failures: &[FailureSummary]) -> String {
    failures
        .iter()
        .map(|f| {
            let repeat = if f.occurrences > 1 {
                format!(" (seen {} times)", f.occurrences)
            } else {
                String::new()
            };
            format!(
                "- attempt {} [{:?}]{}: {}",
                f.attempt_number, f.cause_category, repeat, f.short_description
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_steps(plan: &Plan) -> String {
    plan.steps
        .iter()
        .enumerate()
        .map(|(i, step)| format!("{}. {}", i + 1, step))
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct LlmPlanner {
    backend: Arc<dyn InferenceBackend>,
}

impl LlmPlanner {
    pub fn new(backend: Arc<dyn InferenceBackend>) -> Self {
        Self { backend }
    }

    fn parse(text: &str) -> Result<Plan, StageError> {
        if let Some(json) = json_object(text) {
            if let Ok(plan) = serde_json::from_str::<Plan>(json) {
                if !plan.steps.is_empty() {
                    return Ok(plan);
                }
            }
        }
        // Models that ignore the format usually still emit a list
        let steps: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter_map(|line| {
                let item = line
                    .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')')
                    .trim_start_matches(['-', '*'])
                    .trim();
                (item.len() < line.len() && !item.is_empty()).then(|| item.to_string())
            })
            .collect();
        if steps.is_empty() {
            return Err(StageError::malformed(Stage::Plan, "planner returned no steps"));
        }
        Ok(Plan::new(steps))
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(&self, ctx: &PlanContext<'_>) -> Result<Plan, StageError> {
        let mut prompt = format!("User message:\n{}\n", ctx.message);
        if !ctx.past_failures.is_empty() {
            prompt.push_str("\nEarlier attempts failed:\n");
            prompt.push_str(&format_failures(ctx.past_failures));
            prompt.push('\n');
        }
        if let Some(current) = ctx.current_plan {
            prompt.push_str("\nCurrent plan:\n");
            prompt.push_str(&format_steps(current));
            prompt.push('\n');
            if ctx.require_fresh {
                prompt.push_str("\nThe current plan has been retried too often. Propose a different approach.\n");
            }
        }

        let request = GenerationRequest::new(prompt)
            .with_system(PLANNER_SYSTEM_PROMPT)
            .with_options(GenerationOptions::precise());
        let text = complete(self.backend.as_ref(), Stage::Plan, request).await?;
        let plan = Self::parse(&text)?;
        debug!("Planner produced {} steps", plan.steps.len());
        Ok(plan)
    }
}

pub struct LlmExecutor {
    backend: Arc<dyn InferenceBackend>,
}

impl LlmExecutor {
    pub fn new(backend: Arc<dyn InferenceBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Executor for LlmExecutor {
    async fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<String, StageError> {
        let mut prompt = format!(
            "Plan:\n{}\n\nUser message:\n{}\n",
            format_steps(ctx.plan),
            ctx.message
        );
        if !ctx.past_failures.is_empty() {
            prompt.push_str("\nPrevious attempts were rejected for these reasons; address each one:\n");
            prompt.push_str(&format_failures(ctx.past_failures));
            prompt.push('\n');
        }

        let request = GenerationRequest::new(prompt).with_system(EXECUTOR_SYSTEM_PROMPT);
        let answer = complete(self.backend.as_ref(), Stage::Execute, request).await?;
        if answer.is_empty() {
            return Err(StageError::failed(Stage::Execute, "model returned an empty answer"));
        }
        Ok(answer)
    }
}

/// Scores a candidate answer. The fixed directive travels on the system
/// channel; user text and the candidate only ever appear in the prompt body.
pub struct LlmVerifier {
    backend: Arc<dyn InferenceBackend>,
}

impl LlmVerifier {
    pub fn new(backend: Arc<dyn InferenceBackend>) -> Self {
        Self { backend }
    }

    fn parse(text: &str) -> Result<Verdict, StageError> {
        let json = json_object(text)
            .ok_or_else(|| StageError::malformed(Stage::Verify, "verifier reply has no JSON object"))?;
        let value: serde_json::Value = serde_json::from_str(json).map_err(|e| {
            StageError::malformed(Stage::Verify, format!("verifier JSON parse error: {}", e))
        })?;

        let score = value["score"]
            .as_f64()
            .or_else(|| value["confidence"].as_f64())
            .ok_or_else(|| StageError::malformed(Stage::Verify, "verifier JSON has no score"))?;
        let feedback = value["feedback"].as_str().unwrap_or_default().to_string();
        let category = match value["category"].as_str().map(str::to_ascii_lowercase) {
            Some(c) if c == "logic" => Some(FailureCategory::Logic),
            Some(c) if c == "syntax" => Some(FailureCategory::Syntax),
            Some(c) if c == "other" => Some(FailureCategory::Other),
            _ => None,
        };
        let factors = value["factors"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|f| f.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Verdict {
            score,
            feedback,
            category,
            factors,
        })
    }
}

#[async_trait]
impl Verifier for LlmVerifier {
    async fn verify(&self, ctx: &VerificationContext<'_>) -> Result<Verdict, StageError> {
        let prompt = format!(
            "USER MESSAGE:\n<<<\n{}\n>>>\n\nPLAN:\n{}\n\nCANDIDATE ANSWER:\n<<<\n{}\n>>>\n",
            ctx.user_message,
            format_steps(ctx.plan),
            ctx.output
        );
        let request = GenerationRequest::new(prompt)
            .with_system(ctx.directive)
            .with_options(GenerationOptions::precise());
        let text = complete(self.backend.as_ref(), Stage::Verify, request).await?;
        Self::parse(&text).inspect_err(|e| warn!("Unusable verifier reply: {}", e))
    }
}

/// Categorize-and-truncate memory.
pub struct SummarizingMemory;

#[async_trait]
impl Rememberer for SummarizingMemory {
    async fn remember(&self, ctx: &RememberContext<'_>) -> Result<FailureSummary, StageError> {
        Ok(ctx.summarize())
    }
}
