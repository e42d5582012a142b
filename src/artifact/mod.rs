//! The replay-artifact builder (C8): turns one scenario case into a
//! self-contained, Postman-collection-compatible JSON document a generic
//! HTTP runner can replay without this engine present. All cross-step
//! references are carried as `{{dotted.key}}` variable names — the exact
//! keys this engine's own [`ValueStore`] uses — so a runner only needs one
//! generic "substitute `{{var}}` in strings, then look up a captured value
//! by dotted path" primitive.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::baseline::OperationFlow;
use crate::config::RunLimits;
use crate::errors::{ErrorCode, StructuredError};
use crate::scenarios::{ScenarioCase, ScenarioKind};
use crate::spec::{self, ParamLocation, SpecModel};
use crate::values::{ValueSlot, UNDEFINED_SENTINEL};

#[derive(Debug, Clone, Serialize)]
pub struct ReplayArtifact {
    pub name: String,
    pub description: String,
    pub base_url_variable: String,
    pub preamble: Vec<VariableAssignment>,
    pub steps: Vec<ReplayStep>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VariableAssignment {
    pub variable: String,
    pub literal: Option<Value>,
    pub template: Option<String>,
}

impl VariableAssignment {
    fn from_slot(variable: String, slot: &ValueSlot) -> Self {
        match slot {
            ValueSlot::Literal(v) => Self { variable, literal: Some(v.clone()), template: None },
            ValueSlot::Dependent { template, .. } | ValueSlot::Composite { template, .. } => {
                Self { variable, literal: None, template: Some(template.clone()) }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HeaderSpec {
    pub name: String,
    pub value_template: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UrlSpec {
    pub path: String,
    pub query: Vec<(String, String)>,
    pub raw: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BodySpec {
    pub media_type: String,
    pub raw: String,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StatusClass {
    TwoXx,
    FourXx,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureSource {
    Status,
    Header,
    Cookie,
    Body,
}

#[derive(Debug, Clone, Serialize)]
pub struct Capture {
    pub source: CaptureSource,
    pub path: String,
    pub variable: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssertionSpec {
    pub expected_class: StatusClass,
    pub captures: Vec<Capture>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayStep {
    pub name: String,
    pub method: String,
    pub url: UrlSpec,
    pub headers: Vec<HeaderSpec>,
    pub body: Option<BodySpec>,
    pub pre_step: Vec<VariableAssignment>,
    pub assertions: AssertionSpec,
}

/// Builds the replayable artifact for one scenario case of one flow.
/// Topology (which operations, in which order) always comes from the
/// baseline flow; only field values and the target's expected status
/// class vary by scenario.
pub fn build_artifact(
    flow: &OperationFlow,
    case: &ScenarioCase,
    model: &SpecModel,
    _limits: &RunLimits,
) -> Result<ReplayArtifact, StructuredError> {
    case.values.resolved()?;

    let target_suffixed = flow
        .executions
        .last()
        .map(|e| e.suffixed_op_id.clone())
        .unwrap_or_default();

    let mut steps = Vec::with_capacity(flow.executions.len());
    for execution in &flow.executions {
        let operation = model.get(&execution.op_id).ok_or_else(|| {
            StructuredError::new(
                ErrorCode::SPEC_UNKNOWN_OPERATION,
                format!("unknown operation id '{}' while building artifact", execution.op_id),
            )
        })?;

        let suffixed_id = &execution.suffixed_op_id;
        let is_target = *suffixed_id == target_suffixed;
        let expect_4xx = is_target && case.scenario.kind != ScenarioKind::Valid;

        let mut pre_step = Vec::new();
        let mut path_bindings: BTreeMap<String, String> = BTreeMap::new();
        let mut query = Vec::new();
        let mut headers = Vec::new();

        for param in &operation.parameters {
            let key = format!("{}.request.{}.{}", suffixed_id, section_name(param.location), param.name);
            let Some(slot) = case.values.get(&key) else { continue };
            if is_undefined(slot) {
                continue;
            }
            let template = binding_template(slot);
            pre_step.push(VariableAssignment::from_slot(key, slot));
            match param.location {
                ParamLocation::Path => {
                    path_bindings.insert(param.name.clone(), template);
                }
                ParamLocation::Query => query.push((param.name.clone(), template)),
                ParamLocation::Header => headers.push(HeaderSpec { name: param.name.clone(), value_template: template }),
                ParamLocation::Cookie => headers.push(HeaderSpec {
                    name: "Cookie".to_string(),
                    value_template: format!("{}={}", param.name, template),
                }),
            }
        }

        let body = render_body(case, suffixed_id, &mut pre_step)?;
        if body.is_some() && !headers.iter().any(|h| h.name.eq_ignore_ascii_case("content-type")) {
            headers.push(HeaderSpec {
                name: "Content-Type".to_string(),
                value_template: body.as_ref().unwrap().media_type.clone(),
            });
        }

        let mut path = operation.path.clone();
        for (name, template) in &path_bindings {
            path = path.replace(&format!("{{{}}}", name), template);
        }

        let raw_query = query
            .iter()
            .map(|(k, v): &(String, String)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let raw = if raw_query.is_empty() {
            format!("{{{{baseUrl}}}}{}", path)
        } else {
            format!("{{{{baseUrl}}}}{}?{}", path, raw_query)
        };

        let captures = if expect_4xx {
            Vec::new()
        } else {
            let prefix = format!("{}.response.", suffixed_id);
            flow.values
                .iter()
                .filter(|(k, _)| k.starts_with(&prefix))
                .map(|(k, _)| Capture { source: capture_source(k), path: k.clone(), variable: k.clone() })
                .collect()
        };

        steps.push(ReplayStep {
            name: suffixed_id.clone(),
            method: execution.verb.clone(),
            url: UrlSpec { path, query, raw },
            headers,
            body,
            pre_step,
            assertions: AssertionSpec {
                expected_class: if expect_4xx { StatusClass::FourXx } else { StatusClass::TwoXx },
                captures,
            },
        });
    }

    Ok(ReplayArtifact {
        name: case.scenario.name.clone(),
        description: case.scenario.description.clone(),
        base_url_variable: "baseUrl".to_string(),
        preamble: vec![VariableAssignment { variable: "baseUrl".to_string(), literal: None, template: None }],
        steps,
    })
}

fn section_name(loc: ParamLocation) -> &'static str {
    match loc {
        ParamLocation::Path => "path_params",
        ParamLocation::Query => "query_params",
        ParamLocation::Header => "headers",
        ParamLocation::Cookie => "cookies",
    }
}

fn is_undefined(slot: &ValueSlot) -> bool {
    matches!(slot, ValueSlot::Literal(Value::String(s)) if s == UNDEFINED_SENTINEL)
}

fn binding_template(slot: &ValueSlot) -> String {
    match slot {
        ValueSlot::Literal(v) => match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
        ValueSlot::Dependent { template, .. } | ValueSlot::Composite { template, .. } => template.clone(),
    }
}

fn render_body(
    case: &ScenarioCase,
    suffixed_id: &str,
    pre_step: &mut Vec<VariableAssignment>,
) -> Result<Option<BodySpec>, StructuredError> {
    let prefix = format!("{}.request.body.", suffixed_id);
    let mut leaves: BTreeMap<String, Value> = BTreeMap::new();
    let mut any = false;

    for (key, slot) in case.values.iter() {
        let Some(rel) = key.strip_prefix(&prefix) else { continue };
        any = true;
        if is_undefined(slot) {
            continue;
        }
        let rendered = match slot {
            ValueSlot::Literal(v) => v.clone(),
            ValueSlot::Dependent { template, .. } | ValueSlot::Composite { template, .. } => {
                Value::String(template.clone())
            }
        };
        pre_step.push(VariableAssignment::from_slot(key.clone(), slot));
        leaves.insert(rel.to_string(), rendered);
    }

    if !any {
        return Ok(None);
    }

    let body_value = spec::unflatten(&leaves);
    let raw = serde_json::to_string(&body_value)
        .map_err(|e| StructuredError::new(ErrorCode::SERIALIZATION_ERROR, e.to_string()))?;
    Ok(Some(BodySpec { media_type: "application/json".to_string(), raw }))
}

fn capture_source(key: &str) -> CaptureSource {
    if key.ends_with(".response.status_code") {
        CaptureSource::Status
    } else if key.contains(".response.headers.") {
        CaptureSource::Header
    } else if key.contains(".response.cookies.") {
        CaptureSource::Cookie
    } else {
        CaptureSource::Body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::{FlowStatus, OperationExecution};
    use crate::scenarios::TestScenario;
    use crate::sender::{RequestValues, ResponseRecord};
    use crate::spec::from_document;
    use crate::values::ValueStore;
    use serde_json::json;

    fn model() -> SpecModel {
        from_document(json!({
            "paths": {
                "/orders/{orderId}": {
                    "get": {"operationId": "getOrder", "responses": {"200": {}}}
                }
            }
        }))
        .unwrap()
    }

    fn flow_and_case(status: u16, kind: ScenarioKind) -> (OperationFlow, ScenarioCase) {
        let mut values = ValueStore::new();
        values.set("getOrder.request.path_params.orderId", json!("abc-1"));
        values.set("getOrder.response.status_code", json!(status));
        values.set("getOrder.response.body.total", json!(10));

        let flow = OperationFlow {
            target_op_id: "getOrder".into(),
            plan: vec!["getOrder".into()],
            usage_guide: String::new(),
            executions: vec![OperationExecution {
                suffixed_op_id: "getOrder".into(),
                op_id: "getOrder".into(),
                verb: "GET".into(),
                path_template: "/orders/{orderId}".into(),
                request: RequestValues::default(),
                response: ResponseRecord {
                    status: 200,
                    headers: Default::default(),
                    cookies: Default::default(),
                    body: json!({"total": 10}),
                    duration_ms: 1,
                },
            }],
            status: FlowStatus::Success,
            values: values.clone(),
        };

        let case = ScenarioCase {
            scenario: TestScenario { name: "validRequest".into(), description: "baseline".into(), kind },
            values,
        };
        (flow, case)
    }

    #[test]
    fn builds_path_and_captures_for_valid_scenario() {
        let (flow, case) = flow_and_case(200, ScenarioKind::Valid);
        let artifact = build_artifact(&flow, &case, &model(), &RunLimits::default()).unwrap();
        assert_eq!(artifact.steps.len(), 1);
        let step = &artifact.steps[0];
        assert_eq!(step.url.path, "/orders/abc-1");
        assert_eq!(step.assertions.expected_class, StatusClass::TwoXx);
        assert!(!step.assertions.captures.is_empty());
    }

    #[test]
    fn negative_scenario_on_target_expects_4xx_and_has_no_captures() {
        let (flow, case) = flow_and_case(400, ScenarioKind::Structural);
        let artifact = build_artifact(&flow, &case, &model(), &RunLimits::default()).unwrap();
        let step = &artifact.steps[0];
        assert_eq!(step.assertions.expected_class, StatusClass::FourXx);
        assert!(step.assertions.captures.is_empty());
    }

    #[test]
    fn unknown_operation_id_is_an_error() {
        let (mut flow, case) = flow_and_case(200, ScenarioKind::Valid);
        flow.executions[0].op_id = "vanished".into();
        assert!(build_artifact(&flow, &case, &model(), &RunLimits::default()).is_err());
    }
}
