//! Sequential stage execution with per-stage failure policies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::stage::Stage;
use crate::context::DeploymentContext;
use crate::core::{FailurePolicy, StageStatus};
use crate::errors::{DeployError, ErrorInfo};
use crate::events::{kinds, EventSink, NoOpEventSink};
use crate::observability::Diagnostics;
use crate::operator::Confirmer;

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result", content = "stage")]
pub enum PipelineOutcome {
    /// Every stage ran.
    Completed,
    /// Execution stopped at the named stage.
    HaltedAt(String),
}

impl fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::HaltedAt(stage) => write!(f, "halted at '{stage}'"),
        }
    }
}

/// What happened to one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage name.
    pub name: String,
    /// Declared failure policy.
    pub policy: FailurePolicy,
    /// Final status.
    pub status: StageStatus,
    /// Failure details, if the stage failed.
    pub error: Option<ErrorInfo>,
    /// Exit code of the external command that failed the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Wall time spent in the stage.
    pub duration_ms: u64,
}

/// Result of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    /// Pipeline name.
    pub pipeline: String,
    /// Run id, shared with the context.
    pub run_id: Uuid,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub finished_at: DateTime<Utc>,
    /// Overall outcome.
    pub outcome: PipelineOutcome,
    /// One record per declared stage, in order.
    pub stages: Vec<StageRecord>,
}

impl PipelineReport {
    /// Returns true if every stage ran.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.outcome == PipelineOutcome::Completed
    }

    /// Name of the stage the run halted at.
    #[must_use]
    pub fn halted_at(&self) -> Option<&str> {
        match &self.outcome {
            PipelineOutcome::HaltedAt(stage) => Some(stage),
            PipelineOutcome::Completed => None,
        }
    }

    /// Names of the stages that actually ran.
    #[must_use]
    pub fn executed(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.status.was_executed())
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Record for `name`.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Pretty JSON rendering.
    pub fn to_json_pretty(&self) -> Result<String, DeployError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Runs stages strictly in order.
#[derive(Clone)]
pub struct PipelineRunner {
    name: String,
    stages: Vec<Stage>,
    confirmer: Confirmer,
    events: Arc<dyn EventSink>,
    diagnostics: Diagnostics,
}

impl PipelineRunner {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new(name: impl Into<String>, confirmer: Confirmer) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            confirmer,
            events: Arc::new(NoOpEventSink),
            diagnostics: Diagnostics::stderr(),
        }
    }

    /// Appends a stage.
    #[must_use]
    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Appends several stages.
    #[must_use]
    pub fn with_stages(mut self, stages: impl IntoIterator<Item = Stage>) -> Self {
        self.stages.extend(stages);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the diagnostics reporter.
    #[must_use]
    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared stages.
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Decides the status of a failed stage, prompting when its policy allows.
    async fn resolve_failure(&self, stage: &Stage, err: &DeployError) -> StageStatus {
        // An operator abort inside a stage already was the operator's decision.
        let policy = if err.is_operator_abort() {
            FailurePolicy::Fatal
        } else {
            stage.policy()
        };
        match policy {
            FailurePolicy::Fatal => StageStatus::Failed,
            FailurePolicy::PromptContinue => {
                let question = format!("Stage '{}' failed. Continue anyway?", stage.name());
                if self.confirmer.confirm(&question).await.is_yes() {
                    StageStatus::ContinuedAfterFailure
                } else {
                    StageStatus::Failed
                }
            }
        }
    }

    /// Runs every stage against `ctx`.
    pub async fn run(&self, ctx: &mut DeploymentContext) -> PipelineReport {
        let started_at = Utc::now();
        let mut records = Vec::with_capacity(self.stages.len());
        let mut halted: Option<String> = None;

        info!(pipeline = %self.name, run_id = %ctx.run_id(), stages = self.stages.len(), "Pipeline started");

        for (index, stage) in self.stages.iter().enumerate() {
            let name = stage.name();
            if halted.is_some() {
                self.events
                    .emit(kinds::STAGE_SKIPPED, Some(json!({ "stage": name, "index": index })))
                    .await;
                records.push(StageRecord {
                    name: name.to_string(),
                    policy: stage.policy(),
                    status: StageStatus::Skipped,
                    error: None,
                    exit_code: None,
                    duration_ms: 0,
                });
                continue;
            }

            self.diagnostics.step(name);
            self.events
                .emit(
                    kinds::STAGE_STARTED,
                    Some(json!({ "stage": name, "index": index, "policy": stage.policy() })),
                )
                .await;

            let start = Instant::now();
            let result = stage.action().execute(ctx).await;
            let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

            let (status, error, exit_code) = match result {
                Ok(()) => {
                    info!(stage = name, duration_ms, "Stage completed");
                    self.diagnostics.ok(name, "");
                    self.events
                        .emit(kinds::STAGE_COMPLETED, Some(json!({ "stage": name, "duration_ms": duration_ms })))
                        .await;
                    (StageStatus::Ok, None, None)
                }
                Err(err) => {
                    let info = err.info();
                    error!(stage = name, code = err.code(), error = %err, "Stage failed");
                    self.diagnostics.fail(name, &err.to_string());
                    self.events
                        .emit(kinds::STAGE_FAILED, Some(json!({ "stage": name, "error": &info })))
                        .await;

                    let status = self.resolve_failure(stage, &err).await;
                    if status == StageStatus::ContinuedAfterFailure {
                        warn!(stage = name, "Continuing after failed stage");
                        self.diagnostics.warn(name, "continuing after failure");
                        self.events
                            .emit(kinds::STAGE_CONTINUED, Some(json!({ "stage": name })))
                            .await;
                    } else {
                        halted = Some(name.to_string());
                    }
                    (status, Some(info), err.exit_code())
                }
            };

            records.push(StageRecord {
                name: name.to_string(),
                policy: stage.policy(),
                status,
                error,
                exit_code,
                duration_ms,
            });
        }

        let outcome = match halted {
            Some(stage) => {
                error!(pipeline = %self.name, stage = %stage, "Pipeline halted");
                self.events
                    .emit(kinds::PIPELINE_HALTED, Some(json!({ "pipeline": self.name, "stage": stage })))
                    .await;
                PipelineOutcome::HaltedAt(stage)
            }
            None => {
                let continued = records.iter().filter(|r| r.status.is_failure()).count();
                info!(pipeline = %self.name, continued, "Pipeline completed");
                self.events
                    .emit(kinds::PIPELINE_COMPLETED, Some(json!({ "pipeline": self.name })))
                    .await;
                PipelineOutcome::Completed
            }
        };

        PipelineReport {
            pipeline: self.name.clone(),
            run_id: ctx.run_id(),
            started_at,
            finished_at: Utc::now(),
            outcome,
            stages: records,
        }
    }
}

impl fmt::Debug for PipelineRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineRunner")
            .field("name", &self.name)
            .field("stages", &self.stages.iter().map(Stage::name).collect::<Vec<_>>())
            .field("diagnostics", &self.diagnostics)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::operator::{PromptMode, PromptPolicy};
    use crate::testing::{ExecutionLog, ScriptedOperator};
    use pretty_assertions::assert_eq;

    fn confirmer(replies: &[&str]) -> (Confirmer, Arc<ScriptedOperator>) {
        let operator = Arc::new(ScriptedOperator::new(replies.iter().copied()));
        let policy = PromptPolicy {
            mode: PromptMode::Interactive,
            max_attempts: 3,
        };
        (Confirmer::new(operator.clone(), policy), operator)
    }

    #[tokio::test]
    async fn test_all_stages_run_in_order() {
        let log = ExecutionLog::new();
        let (confirmer, operator) = confirmer(&[]);
        let runner = PipelineRunner::new("deploy", confirmer)
            .with_diagnostics(Diagnostics::silent())
            .with_stage(Stage::fatal("a", log.action("a")))
            .with_stage(Stage::prompt_continue("b", log.action("b")))
            .with_stage(Stage::fatal("c", log.action("c")));

        let report = runner.run(&mut DeploymentContext::new("ts", "ricxapp")).await;

        assert!(report.is_completed());
        assert_eq!(log.entries(), vec!["a", "b", "c"]);
        assert_eq!(operator.prompt_count(), 0);
    }

    #[tokio::test]
    async fn test_fatal_failure_halts() {
        let log = ExecutionLog::new();
        let (confirmer, operator) = confirmer(&["y"]);
        let diagnostics = Diagnostics::capture();
        let runner = PipelineRunner::new("deploy", confirmer)
            .with_diagnostics(diagnostics.clone())
            .with_stage(Stage::fatal("a", log.action("a")))
            .with_stage(Stage::fatal("b", log.failing_action("b")))
            .with_stage(Stage::fatal("c", log.action("c")));

        let report = runner.run(&mut DeploymentContext::new("ts", "ricxapp")).await;

        assert_eq!(report.outcome, PipelineOutcome::HaltedAt("b".to_string()));
        assert_eq!(log.entries(), vec!["a", "b"]);
        assert_eq!(report.stage("c").unwrap().status, StageStatus::Skipped);
        assert_eq!(operator.prompt_count(), 0);
        assert!(diagnostics.lines().iter().any(|l| l.starts_with("[FAIL] b")));
    }

    #[tokio::test]
    async fn test_prompt_continue_yes_runs_everything() {
        let log = ExecutionLog::new();
        let (confirmer, _) = confirmer(&["y"]);
        let runner = PipelineRunner::new("deploy", confirmer)
            .with_diagnostics(Diagnostics::silent())
            .with_stage(Stage::prompt_continue("build-image", log.failing_action("build-image")))
            .with_stage(Stage::fatal("onboard", log.action("onboard")));

        let report = runner.run(&mut DeploymentContext::new("ts", "ricxapp")).await;

        assert!(report.is_completed());
        assert_eq!(log.entries(), vec!["build-image", "onboard"]);
        let record = report.stage("build-image").unwrap();
        assert_eq!(record.status, StageStatus::ContinuedAfterFailure);
        assert!(record.error.is_some());
    }

    #[tokio::test]
    async fn test_prompt_continue_no_halts() {
        let log = ExecutionLog::new();
        let (confirmer, _) = confirmer(&["n"]);
        let runner = PipelineRunner::new("deploy", confirmer)
            .with_diagnostics(Diagnostics::silent())
            .with_stage(Stage::prompt_continue("build-image", log.failing_action("build-image")))
            .with_stage(Stage::fatal("onboard", log.action("onboard")));

        let report = runner.run(&mut DeploymentContext::new("ts", "ricxapp")).await;

        assert_eq!(report.halted_at(), Some("build-image"));
        assert_eq!(log.entries(), vec!["build-image"]);
    }

    #[tokio::test]
    async fn test_operator_abort_inside_stage_is_fatal() {
        let log = ExecutionLog::new();
        let (confirmer, operator) = confirmer(&["y"]);
        let runner = PipelineRunner::new("deploy", confirmer)
            .with_diagnostics(Diagnostics::silent())
            .with_stage(Stage::prompt_continue(
                "reclaim-ports",
                log.action_failing_with("reclaim-ports", || DeployError::operator_abort("reclaim port 8086")),
            ))
            .with_stage(Stage::fatal("next", log.action("next")));

        let report = runner.run(&mut DeploymentContext::new("ts", "ricxapp")).await;

        assert_eq!(report.halted_at(), Some("reclaim-ports"));
        assert_eq!(operator.prompt_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_command_exit_code_recorded() {
        let log = ExecutionLog::new();
        let (confirmer, _) = confirmer(&["y"]);
        let runner = PipelineRunner::new("deploy", confirmer)
            .with_diagnostics(Diagnostics::silent())
            .with_stage(Stage::prompt_continue(
                "install-deps",
                log.action_failing_with("install-deps", || DeployError::ExternalTool {
                    command: "sh -c 'apt-get install -y jq'".to_string(),
                    code: Some(100),
                    stderr: "E: Unable to locate package jq".to_string(),
                }),
            ))
            .with_stage(Stage::fatal("next", log.action("next")));

        let report = runner.run(&mut DeploymentContext::new("ts", "ricxapp")).await;

        assert!(report.is_completed());
        assert_eq!(report.stage("install-deps").unwrap().exit_code, Some(100));
        assert_eq!(report.stage("next").unwrap().exit_code, None);
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let log = ExecutionLog::new();
        let sink = Arc::new(CollectingEventSink::new());
        let (confirmer, _) = confirmer(&["y"]);
        let runner = PipelineRunner::new("deploy", confirmer)
            .with_diagnostics(Diagnostics::silent())
            .with_events(sink.clone())
            .with_stage(Stage::prompt_continue("a", log.failing_action("a")))
            .with_stage(Stage::fatal("b", log.action("b")));

        runner.run(&mut DeploymentContext::new("ts", "ricxapp")).await;

        assert_eq!(
            sink.event_types(),
            vec![
                "stage.started",
                "stage.failed",
                "stage.continued",
                "stage.started",
                "stage.completed",
                "pipeline.completed"
            ]
        );
    }

    #[tokio::test]
    async fn test_report_serializes() {
        let log = ExecutionLog::new();
        let (confirmer, _) = confirmer(&[]);
        let runner = PipelineRunner::new("undeploy", confirmer)
            .with_diagnostics(Diagnostics::silent())
            .with_stage(Stage::fatal("a", log.failing_action("a")));

        let report = runner.run(&mut DeploymentContext::new("ts", "ricxapp")).await;
        let json = report.to_json_pretty().unwrap();
        let back: PipelineReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
        assert!(json.contains("\"halted_at\""));
    }
}
