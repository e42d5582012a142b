//! The six prompt templates the oracle is driven with. Each function
//! renders a deterministic prompt string from structured inputs; parsing
//! the response back into a typed shape is the caller's job via
//! [`super::ask_json`] plus `serde_json::from_value`.

use serde_json::{json, Map, Value};

/// `SelectOperations`: asks the oracle to pick a dependency-respecting
/// sequence of operations ending at `target_op_id`.
pub fn select_operations(catalog: &Value, target_op_id: &str, guidance: Option<&str>) -> String {
    format!(
        "You are planning the dependency sequence of HTTP operations needed to \
         exercise a target API operation against an empty backend.\n\n\
         Operation catalog (2xx responses only):\n{catalog}\n\n\
         Target operation id: {target_op_id}\n\
         {guidance_line}\n\n\
         Return ONLY a JSON object of the form:\n\
         {{\"operation_sequence\": [\"opId1\", \"opId2\", ...], \"usage_guide\": \"free text\"}}\n\
         The last element of operation_sequence MUST equal the target operation id. \
         Include only operations that are required to satisfy a parameter of a later \
         step, create a required resource, or are the target itself.",
        catalog = catalog,
        target_op_id = target_op_id,
        guidance_line = guidance
            .map(|g| format!("User guidance: {}", g))
            .unwrap_or_default(),
    )
}

/// `GenerateValid`: asks for concrete request values for one step, given
/// the plan so far and the running flat value map.
pub fn generate_valid(
    plan: &[String],
    guide: &str,
    step_signature: &Value,
    running_values: &Value,
) -> String {
    format!(
        "You are synthesizing a valid request body and parameters for one step of a \
         multi-step API test flow.\n\n\
         Full plan: {plan:?}\n\
         Usage guide: {guide}\n\n\
         Current step signature:\n{step_signature}\n\n\
         Values captured so far (reference with {{{{key}}}}):\n{running_values}\n\n\
         Return ONLY a JSON object:\n\
         {{\"path_params\": {{}}, \"query_params\": {{}}, \"headers\": {{}}, \"cookies\": {{}}, \"body\": {{}}}}\n\
         Any value that should reuse a prior result MUST be written as \
         \"{{{{dotted.key.path}}}}\" referencing a key present above.",
    )
}

/// `FixValid`: like `GenerateValid` but after a 4xx, with the failed
/// request and response attached so the oracle can repair it.
pub fn fix_valid(
    plan: &[String],
    guide: &str,
    step_signature: &Value,
    running_values: &Value,
    failed_body: &Value,
    failure_status: u16,
    failure_response: &Value,
) -> String {
    format!(
        "The previous attempt at this step failed with a {failure_status} response.\n\n\
         Full plan: {plan:?}\n\
         Usage guide: {guide}\n\n\
         Current step signature:\n{step_signature}\n\n\
         Values captured so far:\n{running_values}\n\n\
         Request body that was sent:\n{failed_body}\n\n\
         Response received (status {failure_status}):\n{failure_response}\n\n\
         Return ONLY a corrected JSON object in the same shape as before:\n\
         {{\"path_params\": {{}}, \"query_params\": {{}}, \"headers\": {{}}, \"cookies\": {{}}, \"body\": {{}}}}",
    )
}

/// `GenerateStructuralNegatives`: schema-violating test-case ideas for the
/// target operation only.
pub fn generate_structural_negatives(plan: &[String], baseline: &Value, catalog: &Value, target: &str) -> String {
    format!(
        "Given a successful baseline flow, propose structural (schema-violation) \
         negative test cases for ONLY the target operation '{target}'.\n\n\
         Plan: {plan:?}\n\
         Baseline values (with placeholders preserved): {baseline}\n\
         Operation catalog: {catalog}\n\n\
         Return ONLY a JSON array of objects:\n\
         [{{\"description\": \"...\", \"test_case_name\": \"camelCaseName\"}}]\n\
         Each description must name a concrete schema violation (wrong type, missing \
         required field, value out of range/length) with a concrete offending example.",
    )
}

/// `GenerateFunctionalNegatives`: business-rule-violating test-case ideas.
pub fn generate_functional_negatives(
    plan: &[String],
    baseline: &Value,
    catalog: &Value,
    target: &str,
    existing_names: &[String],
) -> String {
    format!(
        "Given a successful baseline flow, propose functional (business-rule-violation) \
         negative test cases for the target operation '{target}'. All prior steps in the \
         plan must remain schema-valid; only the target's business-rule expectations are \
         violated.\n\n\
         Plan: {plan:?}\n\
         Baseline values: {baseline}\n\
         Operation catalog: {catalog}\n\
         Existing test case names (do not duplicate): {existing_names:?}\n\n\
         Return ONLY a JSON array of objects:\n\
         [{{\"description\": \"...\", \"test_case_name\": \"camelCaseName\"}}]",
    )
}

/// `MaterializeScenario`: turns a scenario description into a concrete
/// overlay over the baseline flat value map.
pub fn materialize_scenario(description: &str, baseline: &Value, catalog: &Value) -> String {
    format!(
        "Materialize the following test scenario into concrete overlay values against \
         a baseline flow.\n\n\
         Scenario: {description}\n\
         Baseline values (dotted keys, placeholders preserved): {baseline}\n\
         Operation catalog: {catalog}\n\n\
         Return ONLY a JSON object mapping dotted keys to values, literals, \
         \"{{{{placeholder}}}}\" references, null, or the string \"__undefined\" to omit a \
         key. Keys MUST be prefixed by an operation id, e.g. \
         \"createOrder.request.body.quantity\" or \"createOrder.response.status_code\". \
         The overlay MUST include an entry setting the target operation's \
         response.status_code into the 4xx range.",
    )
}

/// Builds the pruned operation-catalog JSON (2xx responses only) used by
/// several of the templates above, keeping prompt size bounded.
pub fn pruned_catalog(model: &crate::spec::SpecModel) -> Value {
    let mut entries = Map::new();
    for op in model.operations() {
        entries.insert(
            op.op_id.clone(),
            json!({
                "method": op.method,
                "path": op.path,
                "parameters": op.parameters.iter().map(|p| json!({
                    "name": p.name,
                    "in": format!("{:?}", p.location).to_lowercase(),
                    "required": p.required,
                })).collect::<Vec<_>>(),
                "responses": op.success_responses(),
            }),
        );
    }
    Value::Object(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_operations_includes_target_and_guidance() {
        let prompt = select_operations(&json!({}), "createOrder", Some("focus on checkout"));
        assert!(prompt.contains("createOrder"));
        assert!(prompt.contains("focus on checkout"));
    }

    #[test]
    fn materialize_scenario_mentions_status_code_requirement() {
        let prompt = materialize_scenario("name too long", &json!({}), &json!({}));
        assert!(prompt.contains("status_code"));
        assert!(prompt.contains("4xx"));
    }
}
