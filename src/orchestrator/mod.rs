//! Top-level sequencing for one `generate` run (C10): plans every target
//! operation in parallel (bounded by `limits.max_workers`), then for each
//! target runs the baseline generator, the negative-scenario generator,
//! and the artifact builder in sequence — baseline generation and
//! scenario materialization mutate external backend state via the request
//! sender, so distinct targets cannot safely share that part of the
//! pipeline concurrently.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{instrument, warn};

use crate::artifact::{self, ReplayArtifact};
use crate::baseline::{BaselineGenerator, FlowStatus};
use crate::config::RunConfig;
use crate::oracle::LlmOracle;
use crate::planner;
use crate::report::{self, RawCaseReport, SuiteReport};
use crate::scenarios::{FailedMaterialization, NegativeScenarioGenerator, ScenarioOptions};
use crate::sender::RequestSender;
use crate::spec::SpecModel;

/// An injected collaborator that executes emitted artifacts against the
/// real target and returns raw per-case reports. The concrete runner (a
/// Postman/newman subprocess, an in-house replayer, ...) is an external
/// I/O adapter outside this engine's scope; this trait is the seam a
/// caller binds a real implementation to.
#[async_trait]
pub trait ArtifactRunner: Send + Sync {
    async fn execute_all(&self, suite_name: &str, artifacts: &[ReplayArtifact]) -> Vec<RawCaseReport>;
}

/// Executes nothing and reports nothing. Lets `generate` still produce
/// artifacts and scaffolding when no external runner is wired in.
pub struct NoopRunner;

#[async_trait]
impl ArtifactRunner for NoopRunner {
    async fn execute_all(&self, _suite_name: &str, _artifacts: &[ReplayArtifact]) -> Vec<RawCaseReport> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetOutcome {
    pub target_op_id: String,
    pub status: String,
    pub test_count: usize,
    pub failed_materializations: Vec<FailedMaterializationRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedMaterializationRecord {
    pub scenario_name: String,
    pub description: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct RunSummary {
    pub successful_operations: usize,
    pub server_errors: usize,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub total_tests: usize,
    pub failed_tests: usize,
    #[serde(rename = "time_duration")]
    pub time_duration_ms: u64,
}

pub struct RunOutput {
    pub artifacts: Vec<(String, Vec<ReplayArtifact>)>,
    pub reports: Vec<SuiteReport>,
    pub outcomes: Vec<TargetOutcome>,
    pub summary: RunSummary,
}

pub struct Orchestrator {
    pub oracle: Arc<dyn LlmOracle>,
    pub model: Arc<SpecModel>,
    pub sender: Arc<RequestSender>,
    pub config: RunConfig,
    pub runner: Arc<dyn ArtifactRunner>,
}

impl Orchestrator {
    #[instrument(skip(self, targets))]
    pub async fn run(&self, targets: &[String]) -> RunOutput {
        let start = std::time::Instant::now();

        let plans = planner::plan_all(
            Arc::clone(&self.oracle),
            Arc::clone(&self.model),
            targets,
            self.config.user_input.as_deref(),
            &self.config.limits,
        )
        .await;

        let baseline_gen = BaselineGenerator::new(self.oracle.as_ref(), self.sender.as_ref(), self.model.as_ref(), &self.config.limits);
        let scenario_gen = NegativeScenarioGenerator::new(self.oracle.as_ref(), self.model.as_ref(), &self.config.limits);

        let mut artifacts_all = Vec::new();
        let mut reports = Vec::new();
        let mut outcomes = Vec::new();
        let mut successful_operations = 0usize;
        let mut server_errors = 0usize;
        let mut total_tests = 0usize;
        let mut failed_tests = 0usize;

        for plan in &plans {
            if let Some(script) = &self.config.env_init_script {
                run_env_init_script(script).await;
            }

            let flow = baseline_gen.generate(plan).await;

            match flow.status {
                FlowStatus::ServerError => {
                    server_errors += 1;
                    outcomes.push(TargetOutcome {
                        target_op_id: plan.target_op_id.clone(),
                        status: "server_error".to_string(),
                        test_count: 0,
                        failed_materializations: Vec::new(),
                    });
                    continue;
                }
                FlowStatus::Failure => {
                    outcomes.push(TargetOutcome {
                        target_op_id: plan.target_op_id.clone(),
                        status: "failure".to_string(),
                        test_count: 0,
                        failed_materializations: Vec::new(),
                    });
                    continue;
                }
                FlowStatus::Success => {}
            }
            successful_operations += 1;

            let options = ScenarioOptions { structural: self.config.structural, functional: self.config.functional };
            let (cases, failed) = scenario_gen.generate(&flow, &options).await;

            let mut suite_artifacts = Vec::new();
            for case in &cases {
                match artifact::build_artifact(&flow, case, self.model.as_ref(), &self.config.limits) {
                    Ok(a) => suite_artifacts.push(a),
                    Err(e) => warn!(target = %plan.target_op_id, scenario = %case.scenario.name, error = %e, "failed to build artifact"),
                }
            }
            total_tests += suite_artifacts.len();

            let suite_name = test_suite_name(&plan.target_op_id);
            let raw_reports = self.runner.execute_all(&suite_name, &suite_artifacts).await;
            let mut suite_report = SuiteReport::new(suite_name.clone());
            for raw in &raw_reports {
                let case_result = report::classify_case(raw);
                if !case_result.passed {
                    failed_tests += 1;
                }
                suite_report.upsert_case(case_result);
            }

            outcomes.push(TargetOutcome {
                target_op_id: plan.target_op_id.clone(),
                status: "success".to_string(),
                test_count: suite_artifacts.len(),
                failed_materializations: failed
                    .iter()
                    .map(|f: &FailedMaterialization| FailedMaterializationRecord {
                        scenario_name: f.scenario_name.clone(),
                        description: f.description.clone(),
                        reason: f.reason.clone(),
                    })
                    .collect(),
            });

            artifacts_all.push((suite_name, suite_artifacts));
            reports.push(suite_report);
        }

        let usage = self.oracle.usage();
        let summary = RunSummary {
            successful_operations,
            server_errors,
            total_tokens: usage.prompt_tokens + usage.completion_tokens,
            total_cost: usage.cost_usd,
            total_tests,
            failed_tests,
            time_duration_ms: start.elapsed().as_millis() as u64,
        };

        RunOutput { artifacts: artifacts_all, reports, outcomes, summary }
    }
}

/// `TestCreateOrder` style suite name from an operation id.
fn test_suite_name(op_id: &str) -> String {
    let mut pascal = String::with_capacity(op_id.len() + 4);
    let mut capitalize_next = true;
    for c in op_id.chars() {
        if c == '_' || c == '-' {
            capitalize_next = true;
            continue;
        }
        if capitalize_next {
            pascal.extend(c.to_uppercase());
            capitalize_next = false;
        } else {
            pascal.push(c);
        }
    }
    format!("Test{}", pascal)
}

/// Invokes the environment-init script (python/powershell/bash/batch) by
/// absolute path, with a 300s timeout. A non-zero exit is surfaced as a
/// warning; the run proceeds regardless, per the external-interfaces
/// contract for this collaborator.
async fn run_env_init_script(path: &std::path::Path) {
    let program = match path.extension().and_then(|e| e.to_str()) {
        Some("py") => "python3",
        Some("ps1") => "powershell",
        Some("sh") => "sh",
        Some("bat") | Some("cmd") => "cmd",
        _ => {
            warn!(path = %path.display(), "env-init script has an unsupported extension; skipping");
            return;
        }
    };

    let mut command = tokio::process::Command::new(program);
    if matches!(program, "cmd") {
        command.arg("/C").arg(path);
    } else if program == "powershell" {
        command.arg("-File").arg(path);
    } else {
        command.arg(path);
    }

    let run = tokio::time::timeout(std::time::Duration::from_secs(300), command.status()).await;
    match run {
        Ok(Ok(status)) if !status.success() => {
            warn!(path = %path.display(), code = ?status.code(), "env-init script exited non-zero; proceeding anyway");
        }
        Ok(Err(e)) => warn!(path = %path.display(), error = %e, "failed to launch env-init script; proceeding anyway"),
        Err(_) => warn!(path = %path.display(), "env-init script timed out after 300s; proceeding anyway"),
        Ok(Ok(_)) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suite_name_is_pascal_cased_with_prefix() {
        assert_eq!(test_suite_name("createOrder"), "TestCreateOrder");
        assert_eq!(test_suite_name("list_pet_owners"), "TestListPetOwners");
    }
}
