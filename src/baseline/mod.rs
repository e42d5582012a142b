//! The baseline generator (C6): walks one planned operation sequence,
//! asking the oracle for concrete request values at each step and sending
//! them through the [`RequestSender`], repairing 4xx responses with
//! `FixValid` up to the step attempt budget, aborting the flow outright on
//! a 5xx, and persisting every resolved field into a shared [`ValueStore`]
//! that later steps and the negative-scenario generator (C7) read from.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::{instrument, warn};

use crate::config::RunLimits;
use crate::oracle::{ask_json, prompts, LlmOracle};
use crate::planner::Plan;
use crate::sender::{RequestSender, RequestValues, ResponseRecord};
use crate::spec::{self, Operation, ParamLocation, SpecModel};
use crate::values::{OverlayValue, ValueSlot, ValueStore, UNDEFINED_SENTINEL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    Success,
    Failure,
    ServerError,
}

/// One step's concrete request and the response it got, keyed by its
/// suffixed operation id within the flow.
#[derive(Debug, Clone)]
pub struct OperationExecution {
    pub suffixed_op_id: String,
    pub op_id: String,
    pub verb: String,
    pub path_template: String,
    pub request: RequestValues,
    pub response: ResponseRecord,
}

/// The outcome of generating a baseline for one target operation.
#[derive(Debug, Clone)]
pub struct OperationFlow {
    pub target_op_id: String,
    /// Suffixed op ids, in execution order.
    pub plan: Vec<String>,
    pub usage_guide: String,
    pub executions: Vec<OperationExecution>,
    pub status: FlowStatus,
    pub values: ValueStore,
}

/// Assigns the deterministic per-occurrence suffix: an opId that appears
/// once in the plan stays bare; one that repeats gets `_1`, `_2`, ... in
/// order of first appearance, and no unsuffixed key for it survives.
pub fn suffix_plan(plan: &[String]) -> Vec<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for op_id in plan {
        *counts.entry(op_id.as_str()).or_insert(0) += 1;
    }
    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
    plan.iter()
        .map(|op_id| {
            if counts[op_id.as_str()] == 1 {
                op_id.clone()
            } else {
                let n = seen.entry(op_id.as_str()).or_insert(0);
                *n += 1;
                format!("{}_{}", op_id, n)
            }
        })
        .collect()
}

enum StepOutcome {
    Success(OperationExecution),
    ServerError(OperationExecution),
}

pub struct BaselineGenerator<'a> {
    oracle: &'a dyn LlmOracle,
    sender: &'a RequestSender,
    model: &'a SpecModel,
    limits: &'a RunLimits,
}

impl<'a> BaselineGenerator<'a> {
    pub fn new(
        oracle: &'a dyn LlmOracle,
        sender: &'a RequestSender,
        model: &'a SpecModel,
        limits: &'a RunLimits,
    ) -> Self {
        Self {
            oracle,
            sender,
            model,
            limits,
        }
    }

    #[instrument(skip(self, plan), fields(target = %plan.target_op_id))]
    pub async fn generate(&self, plan: &Plan) -> OperationFlow {
        let suffixed_plan = suffix_plan(&plan.sequence);
        let mut values = ValueStore::new();
        let mut executions = Vec::with_capacity(suffixed_plan.len());

        for (idx, suffixed_id) in suffixed_plan.iter().enumerate() {
            let op_id = &plan.sequence[idx];
            let Some(operation) = self.model.get(op_id) else {
                warn!(op_id, "planned operation vanished from the spec; aborting flow");
                return OperationFlow {
                    target_op_id: plan.target_op_id.clone(),
                    plan: suffixed_plan,
                    usage_guide: plan.usage_guide.clone(),
                    executions,
                    status: FlowStatus::Failure,
                    values,
                };
            };

            match self.run_step(plan, suffixed_id, operation, &mut values).await {
                Some(StepOutcome::Success(execution)) => executions.push(execution),
                Some(StepOutcome::ServerError(execution)) => {
                    executions.push(execution);
                    return OperationFlow {
                        target_op_id: plan.target_op_id.clone(),
                        plan: suffixed_plan,
                        usage_guide: plan.usage_guide.clone(),
                        executions,
                        status: FlowStatus::ServerError,
                        values,
                    };
                }
                None => {
                    return OperationFlow {
                        target_op_id: plan.target_op_id.clone(),
                        plan: suffixed_plan,
                        usage_guide: plan.usage_guide.clone(),
                        executions,
                        status: FlowStatus::Failure,
                        values,
                    };
                }
            }
        }

        OperationFlow {
            target_op_id: plan.target_op_id.clone(),
            plan: suffixed_plan,
            usage_guide: plan.usage_guide.clone(),
            executions,
            status: FlowStatus::Success,
            values,
        }
    }

    async fn run_step(
        &self,
        plan: &Plan,
        suffixed_id: &str,
        operation: &Operation,
        values: &mut ValueStore,
    ) -> Option<StepOutcome> {
        let mut last_failure: Option<(Value, u16, Value)> = None;

        for attempt in 1..=self.limits.max_step_attempts {
            let step_signature = step_signature_json(operation);
            let running_preview = placeholder_view(values);

            let prompt = if let Some((failed_body, status, failure_resp)) = &last_failure {
                prompts::fix_valid(
                    &plan.sequence,
                    &plan.usage_guide,
                    &step_signature,
                    &running_preview,
                    failed_body,
                    *status,
                    failure_resp,
                )
            } else {
                prompts::generate_valid(&plan.sequence, &plan.usage_guide, &step_signature, &running_preview)
            };

            let generated = match ask_json(self.oracle, &prompt, self.limits.max_oracle_retries).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(attempt, suffixed_id, error = %e, "oracle unavailable while generating step values");
                    last_failure = Some((json!({}), 0, json!({"error": e.to_string()})));
                    continue;
                }
            };

            clear_request_prefix(values, suffixed_id);
            apply_generated_values(values, suffixed_id, &generated);

            let resolved = match values.resolved() {
                Ok(r) => r,
                Err(e) => {
                    warn!(attempt, suffixed_id, error = %e, "generated values left an unresolved reference");
                    last_failure = Some((
                        generated.get("body").cloned().unwrap_or(json!({})),
                        0,
                        json!({"error": e.to_string()}),
                    ));
                    continue;
                }
            };

            let request_values = build_request_values(operation, suffixed_id, &resolved);

            let response = match self.sender.send(operation, &request_values, self.limits).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(attempt, suffixed_id, error = %e, "transport failure sending step request");
                    last_failure = Some((
                        generated.get("body").cloned().unwrap_or(json!({})),
                        0,
                        json!({"error": e.to_string()}),
                    ));
                    continue;
                }
            };

            clear_response_prefix(values, suffixed_id);
            record_response(values, suffixed_id, &response);

            let execution = OperationExecution {
                suffixed_op_id: suffixed_id.to_string(),
                op_id: operation.op_id.clone(),
                verb: operation.method.clone(),
                path_template: operation.path.clone(),
                request: request_values,
                response: response.clone(),
            };

            if response.is_2xx() {
                return Some(StepOutcome::Success(execution));
            } else if response.is_5xx() {
                return Some(StepOutcome::ServerError(execution));
            } else {
                last_failure = Some((
                    generated.get("body").cloned().unwrap_or(json!({})),
                    response.status,
                    response.body.clone(),
                ));
                continue;
            }
        }

        warn!(suffixed_id, "exhausted step attempts without a 2xx response");
        None
    }
}

fn section_name(loc: ParamLocation) -> &'static str {
    match loc {
        ParamLocation::Path => "path_params",
        ParamLocation::Query => "query_params",
        ParamLocation::Header => "headers",
        ParamLocation::Cookie => "cookies",
    }
}

fn step_signature_json(operation: &Operation) -> Value {
    json!({
        "op_id": operation.op_id,
        "method": operation.method,
        "path": operation.path,
        "parameters": operation.parameters.iter().map(|p| json!({
            "name": p.name,
            "in": format!("{:?}", p.location).to_lowercase(),
            "required": p.required,
            "schema": p.schema,
        })).collect::<Vec<_>>(),
        "request_body": operation.request_body,
    })
}

/// A JSON preview of the running value map for prompt context: dependent
/// and composite slots keep their `{{key}}` template text, literals render
/// as themselves.
fn placeholder_view(values: &ValueStore) -> Value {
    let mut map = serde_json::Map::new();
    for (key, slot) in values.iter() {
        let rendered = match slot {
            ValueSlot::Literal(v) => v.clone(),
            ValueSlot::Dependent { template, .. } | ValueSlot::Composite { template, .. } => {
                Value::String(template.clone())
            }
        };
        map.insert(key.clone(), rendered);
    }
    Value::Object(map)
}

/// Marks every existing `<suffixed_id>.request.*` slot undefined before a
/// retry writes its own fields, so a field the new attempt omits doesn't
/// keep carrying a stale value from an earlier failed attempt.
fn clear_request_prefix(values: &mut ValueStore, suffixed_id: &str) {
    let prefix = format!("{}.request.", suffixed_id);
    let stale: Vec<String> = values.keys().filter(|k| k.starts_with(&prefix)).cloned().collect();
    for key in stale {
        values.set_slot(key, ValueSlot::Literal(Value::String(UNDEFINED_SENTINEL.to_string())));
    }
}

/// Erases every `<suffixed_id>.response.*` slot left over from an earlier
/// attempt at this step before recording the current one, so a 4xx
/// transcript's fields (e.g. an error body) never survive into the flow's
/// final value map once the step eventually lands a 2xx.
fn clear_response_prefix(values: &mut ValueStore, suffixed_id: &str) {
    values.apply_overlay(vec![(format!("{}.response", suffixed_id), OverlayValue::Undefined)]);
}

fn apply_generated_values(values: &mut ValueStore, suffixed_id: &str, generated: &Value) {
    for section in ["path_params", "query_params", "headers", "cookies"] {
        if let Some(obj) = generated.get(section).and_then(Value::as_object) {
            for (name, v) in obj {
                let key = format!("{}.request.{}.{}", suffixed_id, section, name);
                values.set_slot(key, ValueSlot::from_value(v.clone()));
            }
        }
    }

    if let Some(body) = generated.get("body") {
        if let Ok(flat) = spec::flatten(body) {
            for (rel_key, leaf) in flat {
                let key = format!("{}.request.body.{}", suffixed_id, rel_key);
                values.set_slot(key, ValueSlot::from_value(leaf));
            }
        }
    }
}

fn record_response(values: &mut ValueStore, suffixed_id: &str, response: &ResponseRecord) {
    values.set(format!("{}.response.status_code", suffixed_id), json!(response.status));
    if let Ok(flat) = spec::flatten(&response.body) {
        for (rel_key, leaf) in flat {
            values.set(format!("{}.response.body.{}", suffixed_id, rel_key), leaf);
        }
    }
    for (name, value) in &response.headers {
        values.set(format!("{}.response.headers.{}", suffixed_id, name), json!(value));
    }
    for (name, value) in &response.cookies {
        values.set(format!("{}.response.cookies.{}", suffixed_id, name), json!(value));
    }
}

fn build_request_values(operation: &Operation, suffixed_id: &str, resolved: &BTreeMap<String, Value>) -> RequestValues {
    let mut values = RequestValues::default();

    for param in &operation.parameters {
        let key = format!("{}.request.{}.{}", suffixed_id, section_name(param.location), param.name);
        let Some(v) = resolved.get(&key) else { continue };
        if matches!(v, Value::String(s) if s == UNDEFINED_SENTINEL) {
            continue;
        }
        match param.location {
            ParamLocation::Path => {
                values.path_params.insert(param.name.clone(), v.clone());
            }
            ParamLocation::Query => {
                values.query_params.insert(param.name.clone(), v.clone());
            }
            ParamLocation::Header => {
                values.headers.insert(param.name.clone(), v.clone());
            }
            ParamLocation::Cookie => {
                values.cookies.insert(param.name.clone(), v.clone());
            }
        }
    }

    let body_prefix = format!("{}.request.body.", suffixed_id);
    let mut body_leaves: BTreeMap<String, Value> = BTreeMap::new();
    for (key, v) in resolved {
        let Some(rel) = key.strip_prefix(&body_prefix) else { continue };
        if matches!(v, Value::String(s) if s == UNDEFINED_SENTINEL) {
            continue;
        }
        body_leaves.insert(rel.to_string(), v.clone());
    }
    if !body_leaves.is_empty() {
        values.body = Some(spec::unflatten(&body_leaves));
    }

    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn suffix_plan_leaves_unique_op_ids_bare() {
        let plan = vec!["createUser".to_string(), "getUser".to_string()];
        assert_eq!(suffix_plan(&plan), vec!["createUser".to_string(), "getUser".to_string()]);
    }

    #[test]
    fn suffix_plan_numbers_repeated_op_ids_in_order() {
        let plan = vec!["createPost".to_string(), "createPost".to_string(), "deletePost".to_string()];
        assert_eq!(
            suffix_plan(&plan),
            vec!["createPost_1".to_string(), "createPost_2".to_string(), "deletePost".to_string()]
        );
    }

    #[test]
    fn apply_and_build_round_trips_params_and_body() {
        let op = Operation {
            op_id: "createOrder".into(),
            method: "POST".into(),
            path: "/orders".into(),
            parameters: vec![crate::spec::Parameter {
                name: "traceId".into(),
                location: ParamLocation::Header,
                required: false,
                schema: Value::Null,
            }],
            request_body: BTreeMap::new(),
            responses: BTreeMap::new(),
        };
        let mut values = ValueStore::new();
        let generated = json!({
            "path_params": {},
            "query_params": {},
            "headers": {"traceId": "abc"},
            "cookies": {},
            "body": {"item": {"quantity": 3}}
        });
        apply_generated_values(&mut values, "createOrder", &generated);
        let resolved = values.resolved().unwrap();
        let request = build_request_values(&op, "createOrder", &resolved);
        assert_eq!(request.headers.get("traceId"), Some(&json!("abc")));
        assert_eq!(request.body, Some(json!({"item": {"quantity": 3}})));
    }

    #[test]
    fn undefined_sentinel_omits_body_field() {
        let op = Operation {
            op_id: "createOrder".into(),
            method: "POST".into(),
            path: "/orders".into(),
            parameters: vec![],
            request_body: BTreeMap::new(),
            responses: BTreeMap::new(),
        };
        let mut values = ValueStore::new();
        values.set("createOrder.request.body.quantity", json!(UNDEFINED_SENTINEL));
        values.set("createOrder.request.body.name", json!("widget"));
        let resolved = values.resolved().unwrap();
        let request = build_request_values(&op, "createOrder", &resolved);
        assert_eq!(request.body, Some(json!({"name": "widget"})));
    }

    #[test]
    fn clear_request_prefix_drops_stale_fields_between_attempts() {
        let mut values = ValueStore::new();
        values.set("createOrder.request.body.extra", json!("stale"));
        clear_request_prefix(&mut values, "createOrder");
        let generated = json!({"body": {"name": "widget"}});
        apply_generated_values(&mut values, "createOrder", &generated);
        let resolved = values.resolved().unwrap();
        assert!(!resolved.contains_key("createOrder.request.body.extra")
            || resolved["createOrder.request.body.extra"] == json!(UNDEFINED_SENTINEL));
    }

    #[test]
    fn clear_response_prefix_removes_stale_keys_entirely() {
        let mut values = ValueStore::new();
        values.set("createOrder.response.status_code", json!(400));
        values.set("createOrder.response.body.error", json!("productId required"));
        values.set("createOrder.response.headers.x-request-id", json!("abc"));

        clear_response_prefix(&mut values, "createOrder");

        assert!(values.get("createOrder.response.status_code").is_none());
        assert!(values.get("createOrder.response.body.error").is_none());
        assert!(values.get("createOrder.response.headers.x-request-id").is_none());

        record_response(
            &mut values,
            "createOrder",
            &ResponseRecord {
                status: 201,
                headers: BTreeMap::new(),
                cookies: BTreeMap::new(),
                body: json!({"orderId": "o-1"}),
                duration_ms: 1,
            },
        );
        let resolved = values.resolved().unwrap();
        assert!(!resolved.contains_key("createOrder.response.body.error"));
        assert_eq!(resolved["createOrder.response.body.orderId"], json!("o-1"));
        assert_eq!(resolved["createOrder.response.status_code"], json!(201));
    }
}
