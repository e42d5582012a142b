//! The operation-graph planner (C3): for one target operation, asks the
//! oracle to select a dependency-respecting sequence of prior operations
//! ending at the target, validates the answer against the operation
//! catalog, and retries with the rejected attempt fed back as context.
//!
//! Persistent oracle failure or persistent validation failure both fall
//! back to the trivial one-step plan `[target]` with an empty guide — the
//! engine never blocks indefinitely on an uncooperative oracle.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{instrument, warn};

use crate::config::RunLimits;
use crate::oracle::{ask_json, prompts, LlmOracle};
use crate::spec::SpecModel;

/// An ordered dependency chain ending at `target_op_id`, plus the oracle's
/// free-text usage guide carried along into `GenerateValid`/`FixValid`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Plan {
    pub target_op_id: String,
    pub sequence: Vec<String>,
    pub usage_guide: String,
}

impl Plan {
    fn fallback(target_op_id: &str) -> Self {
        Self {
            target_op_id: target_op_id.to_string(),
            sequence: vec![target_op_id.to_string()],
            usage_guide: String::new(),
        }
    }
}

pub struct Planner<'a> {
    oracle: &'a dyn LlmOracle,
    model: &'a SpecModel,
}

impl<'a> Planner<'a> {
    pub fn new(oracle: &'a dyn LlmOracle, model: &'a SpecModel) -> Self {
        Self { oracle, model }
    }

    /// Plans the dependency chain for `target_op_id`, retrying up to
    /// `max_retries` times with the previous rejected output appended as
    /// context before giving up and returning the `[target]` fallback.
    #[instrument(skip(self, user_guidance), fields(target = %target_op_id))]
    pub async fn plan(
        &self,
        target_op_id: &str,
        user_guidance: Option<&str>,
        max_retries: u32,
    ) -> Plan {
        if !self.model.contains(target_op_id) {
            warn!(target = target_op_id, "target operation id not in spec; using fallback plan");
            return Plan::fallback(target_op_id);
        }

        let catalog = prompts::pruned_catalog(self.model);
        let mut feedback: Option<String> = None;

        for attempt in 0..=max_retries {
            let mut prompt = prompts::select_operations(&catalog, target_op_id, user_guidance);
            if let Some(reason) = &feedback {
                prompt.push_str(&format!(
                    "\n\nYour previous answer was rejected: {}\nTry again, respecting the same contract.",
                    reason
                ));
            }

            let parsed = match ask_json(self.oracle, &prompt, max_retries).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(attempt, error = %e, "oracle unavailable while planning");
                    feedback = Some(e.to_string());
                    continue;
                }
            };

            match self.validate(&parsed, target_op_id) {
                Ok(plan) => return plan,
                Err(reason) => {
                    warn!(attempt, target = target_op_id, reason = %reason, "planner output rejected");
                    feedback = Some(reason);
                }
            }
        }

        warn!(target = target_op_id, "planner exhausted retries; falling back to [target]");
        Plan::fallback(target_op_id)
    }

    /// Every returned opId must exist in the spec and the last element must
    /// equal the target.
    fn validate(&self, value: &Value, target_op_id: &str) -> Result<Plan, String> {
        let sequence: Vec<String> = value
            .get("operation_sequence")
            .and_then(Value::as_array)
            .ok_or_else(|| "missing operation_sequence array".to_string())?
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| "operation_sequence must contain only strings".to_string())?;

        if sequence.is_empty() {
            return Err("operation_sequence must not be empty".to_string());
        }
        if sequence.last().map(String::as_str) != Some(target_op_id) {
            return Err(format!(
                "last element of operation_sequence must equal '{}'",
                target_op_id
            ));
        }
        for op_id in &sequence {
            if !self.model.contains(op_id) {
                return Err(format!("unknown operation id '{}'", op_id));
            }
        }

        let usage_guide = value
            .get("usage_guide")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(Plan {
            target_op_id: target_op_id.to_string(),
            sequence,
            usage_guide,
        })
    }
}

/// Plans many targets concurrently, bounded by `limits.max_workers`
/// concurrent oracle-bound tasks sharing one oracle instance.
pub async fn plan_all(
    oracle: Arc<dyn LlmOracle>,
    model: Arc<SpecModel>,
    targets: &[String],
    user_guidance: Option<&str>,
    limits: &RunLimits,
) -> Vec<Plan> {
    let semaphore = Arc::new(Semaphore::new(limits.max_workers.max(1)));
    let guidance = user_guidance.map(str::to_string);
    let max_retries = limits.max_oracle_retries;

    let mut handles = Vec::with_capacity(targets.len());
    for target in targets {
        let oracle = Arc::clone(&oracle);
        let model = Arc::clone(&model);
        let semaphore = Arc::clone(&semaphore);
        let guidance = guidance.clone();
        let target = target.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("planning semaphore closed");
            let planner = Planner::new(oracle.as_ref(), model.as_ref());
            planner.plan(&target, guidance.as_deref(), max_retries).await
        }));
    }

    let mut plans = Vec::with_capacity(handles.len());
    for handle in handles {
        if let Ok(plan) = handle.await {
            plans.push(plan);
        }
    }
    plans
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::errors::StructuredError;
    use crate::oracle::UsageStats;
    use crate::spec::from_document;

    struct ScriptedOracle {
        responses: Vec<&'static str>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmOracle for ScriptedOracle {
        async fn ask(&self, _prompt: &str, _want_json: bool) -> Result<String, StructuredError> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.responses.get(i).copied().unwrap_or("{}").to_string())
        }
        fn usage(&self) -> UsageStats {
            UsageStats::default()
        }
    }

    fn two_op_model() -> SpecModel {
        let doc = json!({
            "paths": {
                "/user": {"post": {"operationId": "createUser", "responses": {"200": {}}}},
                "/user/{userId}": {"get": {"operationId": "getUser", "responses": {"200": {}}}}
            }
        });
        from_document(doc).unwrap()
    }

    #[tokio::test]
    async fn accepts_a_valid_plan() {
        let model = two_op_model();
        let oracle = ScriptedOracle {
            responses: vec![r#"{"operation_sequence": ["createUser", "getUser"], "usage_guide": "create then fetch"}"#],
            calls: AtomicUsize::new(0),
        };
        let planner = Planner::new(&oracle, &model);
        let plan = planner.plan("getUser", None, 3).await;
        assert_eq!(plan.sequence, vec!["createUser".to_string(), "getUser".to_string()]);
        assert_eq!(plan.usage_guide, "create then fetch");
    }

    #[tokio::test]
    async fn retries_then_falls_back_when_last_element_wrong() {
        let model = two_op_model();
        let oracle = ScriptedOracle {
            responses: vec![
                r#"{"operation_sequence": ["createUser"], "usage_guide": ""}"#,
                r#"{"operation_sequence": ["createUser"], "usage_guide": ""}"#,
                r#"{"operation_sequence": ["createUser"], "usage_guide": ""}"#,
                r#"{"operation_sequence": ["createUser"], "usage_guide": ""}"#,
            ],
            calls: AtomicUsize::new(0),
        };
        let planner = Planner::new(&oracle, &model);
        let plan = planner.plan("getUser", None, 3).await;
        assert_eq!(
            plan,
            Plan {
                target_op_id: "getUser".into(),
                sequence: vec!["getUser".into()],
                usage_guide: String::new()
            }
        );
    }

    #[tokio::test]
    async fn rejects_unknown_operation_ids() {
        let model = two_op_model();
        let oracle = ScriptedOracle {
            responses: vec![
                r#"{"operation_sequence": ["doesNotExist", "getUser"], "usage_guide": ""}"#,
                r#"{"operation_sequence": ["getUser"], "usage_guide": ""}"#,
            ],
            calls: AtomicUsize::new(0),
        };
        let planner = Planner::new(&oracle, &model);
        let plan = planner.plan("getUser", None, 3).await;
        assert_eq!(plan.sequence, vec!["getUser".to_string()]);
    }

    #[tokio::test]
    async fn unknown_target_short_circuits_to_fallback() {
        let model = two_op_model();
        let oracle = ScriptedOracle { responses: vec![], calls: AtomicUsize::new(0) };
        let planner = Planner::new(&oracle, &model);
        let plan = planner.plan("doesNotExist", None, 3).await;
        assert_eq!(plan, Plan::fallback("doesNotExist"));
    }

    #[tokio::test]
    async fn plan_all_runs_every_target() {
        let model = Arc::new(two_op_model());
        let oracle: Arc<dyn LlmOracle> = Arc::new(ScriptedOracle {
            responses: vec![
                r#"{"operation_sequence": ["createUser"], "usage_guide": ""}"#,
                r#"{"operation_sequence": ["createUser", "getUser"], "usage_guide": ""}"#,
            ],
            calls: AtomicUsize::new(0),
        });
        let limits = RunLimits::default();
        let targets = vec!["createUser".to_string(), "getUser".to_string()];
        let plans = plan_all(oracle, model, &targets, None, &limits).await;
        assert_eq!(plans.len(), 2);
    }
}
