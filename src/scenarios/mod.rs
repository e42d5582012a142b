//! The negative-scenario generator (C7): turns one successful baseline
//! flow into a set of named scenarios — the synthetic always-present
//! `validRequest` case plus oracle-proposed structural (`_ST`) and
//! functional (`_FU`) negatives — and materializes each into a concrete
//! overlay over the baseline's [`ValueStore`].

use tracing::{instrument, warn};

use crate::baseline::OperationFlow;
use crate::config::RunLimits;
use crate::oracle::{ask_json, prompts, LlmOracle};
use crate::spec::SpecModel;
use crate::values::{OverlayValue, ValueSlot, ValueStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioKind {
    Valid,
    Structural,
    Functional,
}

#[derive(Debug, Clone)]
pub struct TestScenario {
    pub name: String,
    pub description: String,
    pub kind: ScenarioKind,
}

#[derive(Debug, Clone)]
pub struct ScenarioCase {
    pub scenario: TestScenario,
    pub values: ValueStore,
}

#[derive(Debug, Clone, Default)]
pub struct ScenarioOptions {
    pub structural: bool,
    pub functional: bool,
}

#[derive(Debug, Clone)]
pub struct FailedMaterialization {
    pub scenario_name: String,
    pub description: String,
    pub reason: String,
}

const MATERIALIZE_ATTEMPTS: u32 = 3;

pub struct NegativeScenarioGenerator<'a> {
    oracle: &'a dyn LlmOracle,
    model: &'a SpecModel,
    limits: &'a RunLimits,
}

impl<'a> NegativeScenarioGenerator<'a> {
    pub fn new(oracle: &'a dyn LlmOracle, model: &'a SpecModel, limits: &'a RunLimits) -> Self {
        Self { oracle, model, limits }
    }

    #[instrument(skip(self, flow, options), fields(target = %flow.target_op_id))]
    pub async fn generate(
        &self,
        flow: &OperationFlow,
        options: &ScenarioOptions,
    ) -> (Vec<ScenarioCase>, Vec<FailedMaterialization>) {
        let mut cases = vec![ScenarioCase {
            scenario: TestScenario {
                name: "validRequest".to_string(),
                description: "The baseline happy-path request sequence.".to_string(),
                kind: ScenarioKind::Valid,
            },
            values: flow.values.clone(),
        }];

        let mut names = vec!["validRequest".to_string()];
        let mut proposals: Vec<TestScenario> = Vec::new();

        let baseline_preview = placeholder_view(&flow.values);
        let catalog = prompts::pruned_catalog(self.model);

        if options.structural {
            let prompt = prompts::generate_structural_negatives(&flow.plan, &baseline_preview, &catalog, &flow.target_op_id);
            match ask_json(self.oracle, &prompt, self.limits.max_oracle_retries).await {
                Ok(value) => {
                    for item in value.as_array().cloned().unwrap_or_default() {
                        if let Some(scenario) = parse_proposal(&item, "_ST", ScenarioKind::Structural, &names) {
                            names.push(scenario.name.clone());
                            proposals.push(scenario);
                        }
                    }
                }
                Err(e) => warn!(target = %flow.target_op_id, error = %e, "structural negative generation failed"),
            }
        }

        if options.functional {
            let prompt = prompts::generate_functional_negatives(
                &flow.plan,
                &baseline_preview,
                &catalog,
                &flow.target_op_id,
                &names,
            );
            match ask_json(self.oracle, &prompt, self.limits.max_oracle_retries).await {
                Ok(value) => {
                    for item in value.as_array().cloned().unwrap_or_default() {
                        if let Some(scenario) = parse_proposal(&item, "_FU", ScenarioKind::Functional, &names) {
                            names.push(scenario.name.clone());
                            proposals.push(scenario);
                        }
                    }
                }
                Err(e) => warn!(target = %flow.target_op_id, error = %e, "functional negative generation failed"),
            }
        }

        let mut failed = Vec::new();
        for scenario in proposals {
            match self.materialize(flow, &scenario, &baseline_preview, &catalog).await {
                Ok(values) => cases.push(ScenarioCase { scenario, values }),
                Err(reason) => failed.push(FailedMaterialization {
                    scenario_name: scenario.name.clone(),
                    description: scenario.description.clone(),
                    reason,
                }),
            }
        }

        (cases, failed)
    }

    async fn materialize(
        &self,
        flow: &OperationFlow,
        scenario: &TestScenario,
        baseline_preview: &serde_json::Value,
        catalog: &serde_json::Value,
    ) -> Result<ValueStore, String> {
        let target_status_key = format!(
            "{}.response.status_code",
            flow.plan.last().cloned().unwrap_or_else(|| flow.target_op_id.clone())
        );

        let mut last_reason = String::new();
        for attempt in 0..MATERIALIZE_ATTEMPTS {
            let prompt = prompts::materialize_scenario(&scenario.description, baseline_preview, catalog);
            let parsed = match ask_json(self.oracle, &prompt, self.limits.max_oracle_retries).await {
                Ok(v) => v,
                Err(e) => {
                    last_reason = e.to_string();
                    warn!(attempt, scenario = %scenario.name, error = %e, "oracle unavailable while materializing scenario");
                    continue;
                }
            };

            match self.apply(flow, &parsed, &target_status_key) {
                Ok(store) => return Ok(store),
                Err(reason) => {
                    warn!(attempt, scenario = %scenario.name, reason = %reason, "materialization overlay rejected");
                    last_reason = reason;
                }
            }
        }

        Err(format!(
            "materialization exhausted {} attempts for scenario '{}': {}",
            MATERIALIZE_ATTEMPTS, scenario.name, last_reason
        ))
    }

    fn apply(&self, flow: &OperationFlow, overlay_json: &serde_json::Value, target_status_key: &str) -> Result<ValueStore, String> {
        let obj = overlay_json
            .as_object()
            .ok_or_else(|| "overlay is not a JSON object".to_string())?;

        let known_prefixes = &flow.plan;
        let mut overlay = Vec::with_capacity(obj.len());
        for (key, value) in obj {
            let prefix_ok = known_prefixes
                .iter()
                .any(|p| key == p || key.starts_with(&format!("{}.", p)));
            if !prefix_ok {
                return Err(format!("overlay key '{}' has no known operation-id prefix", key));
            }
            overlay.push((key.clone(), OverlayValue::from_raw(value.clone())));
        }

        let mut store = flow.values.clone();
        store.apply_overlay(overlay);

        // The target's asserted status is always the configured forced
        // code, never whatever the oracle proposed in the overlay.
        store.set_slot(
            target_status_key.to_string(),
            ValueSlot::Literal(serde_json::json!(self.limits.force_negative_status)),
        );

        Ok(store)
    }
}

fn parse_proposal(item: &serde_json::Value, suffix: &str, kind: ScenarioKind, existing: &[String]) -> Option<TestScenario> {
    let description = item.get("description")?.as_str()?.to_string();
    let base_name = item.get("test_case_name")?.as_str()?.to_string();
    let name = format!("{}{}", base_name, suffix);
    if existing.contains(&name) {
        return None;
    }
    Some(TestScenario { name, description, kind })
}

fn placeholder_view(values: &ValueStore) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (key, slot) in values.iter() {
        let rendered = match slot {
            ValueSlot::Literal(v) => v.clone(),
            ValueSlot::Dependent { template, .. } | ValueSlot::Composite { template, .. } => {
                serde_json::Value::String(template.clone())
            }
        };
        map.insert(key.clone(), rendered);
    }
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::{FlowStatus, OperationExecution};
    use crate::sender::{RequestValues, ResponseRecord};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn sample_flow() -> OperationFlow {
        let mut values = ValueStore::new();
        values.set("createOrder.request.body.quantity", json!(3));
        values.set("createOrder.response.status_code", json!(201));

        OperationFlow {
            target_op_id: "createOrder".into(),
            plan: vec!["createOrder".into()],
            usage_guide: String::new(),
            executions: vec![OperationExecution {
                suffixed_op_id: "createOrder".into(),
                op_id: "createOrder".into(),
                verb: "POST".into(),
                path_template: "/orders".into(),
                request: RequestValues::default(),
                response: ResponseRecord { status: 201, headers: BTreeMap::new(), cookies: BTreeMap::new(), body: json!({}), duration_ms: 1 },
            }],
            status: FlowStatus::Success,
            values,
        }
    }

    #[test]
    fn proposal_suffix_is_applied_and_dedup_skips_repeats() {
        let item = json!({"description": "negative length", "test_case_name": "quantityTooLarge"});
        let existing = vec!["validRequest".to_string()];
        let scenario = parse_proposal(&item, "_ST", ScenarioKind::Structural, &existing).unwrap();
        assert_eq!(scenario.name, "quantityTooLarge_ST");

        let existing_with = vec!["validRequest".to_string(), scenario.name.clone()];
        assert!(parse_proposal(&item, "_ST", ScenarioKind::Structural, &existing_with).is_none());
    }

    #[test]
    fn apply_forces_target_status_into_configured_4xx_regardless_of_oracle_value() {
        let flow = sample_flow();
        let limits = RunLimits { force_negative_status: 400, ..RunLimits::default() };
        let gen = NegativeScenarioGenerator { oracle: &NoopOracle, model: &model_stub(), limits: &limits };

        let overlay = json!({
            "createOrder.request.body.quantity": -1,
            "createOrder.response.status_code": 404,
        });
        let store = gen.apply(&flow, &overlay, "createOrder.response.status_code").unwrap();
        assert_eq!(store.get("createOrder.response.status_code"), Some(&ValueSlot::Literal(json!(400))));
        assert_eq!(store.get("createOrder.request.body.quantity"), Some(&ValueSlot::Literal(json!(-1))));
    }

    #[test]
    fn apply_rejects_overlay_keys_with_unknown_prefix() {
        let flow = sample_flow();
        let limits = RunLimits::default();
        let gen = NegativeScenarioGenerator { oracle: &NoopOracle, model: &model_stub(), limits: &limits };
        let overlay = json!({"someOtherOp.request.body.x": 1});
        assert!(gen.apply(&flow, &overlay, "createOrder.response.status_code").is_err());
    }

    struct NoopOracle;
    #[async_trait::async_trait]
    impl LlmOracle for NoopOracle {
        async fn ask(&self, _prompt: &str, _want_json: bool) -> Result<String, crate::errors::StructuredError> {
            Ok("{}".to_string())
        }
        fn usage(&self) -> crate::oracle::UsageStats {
            crate::oracle::UsageStats::default()
        }
    }

    fn model_stub() -> SpecModel {
        crate::spec::from_document(json!({"paths": {}})).unwrap()
    }
}
