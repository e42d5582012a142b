//! The canonical operation catalog: loads an OpenAPI 3.x document (JSON or
//! YAML), resolves local `$ref`s, and exposes a flat list of operations with
//! their parameters and response schemas. Also hosts the flatten/unflatten
//! pair used to turn nested JSON bodies into dotted-key maps and back.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{ErrorCode, StructuredError};

/// Where a parameter is carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamLocation {
    Path,
    Query,
    Header,
    Cookie,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub location: ParamLocation,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub schema: Value,
}

/// One `(verb, path)` endpoint with everything needed to build a request and
/// recognize its responses. `responses` maps a status-code pattern
/// (`"200"`, `"4XX"`, `"default"`) to a response-body schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub op_id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    /// Media type -> schema, e.g. `"application/json" -> {...}`.
    #[serde(default)]
    pub request_body: BTreeMap<String, Value>,
    #[serde(default)]
    pub responses: BTreeMap<String, Value>,
}

impl Operation {
    pub fn path_params(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters
            .iter()
            .filter(|p| p.location == ParamLocation::Path)
    }

    /// A pruned view of responses keeping only 2xx entries, for prompts
    /// where the full response catalog would blow the token budget.
    pub fn success_responses(&self) -> BTreeMap<String, Value> {
        self.responses
            .iter()
            .filter(|(code, _)| code.starts_with('2') || code.eq_ignore_ascii_case("2xx"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// The resolved, immutable operation catalog for one run.
#[derive(Debug, Clone)]
pub struct SpecModel {
    operations: BTreeMap<String, Operation>,
    pub preferred_base_url: Option<String>,
}

impl SpecModel {
    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.operations.values()
    }

    pub fn get(&self, op_id: &str) -> Option<&Operation> {
        self.operations.get(op_id)
    }

    pub fn contains(&self, op_id: &str) -> bool {
        self.operations.contains_key(op_id)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Reads a spec file from disk (sniffing JSON vs YAML by extension, falling
/// back to JSON-then-YAML on an unrecognized one) and resolves it into a
/// [`SpecModel`].
pub fn load(path: impl AsRef<Path>) -> Result<SpecModel, StructuredError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|e| {
        StructuredError::new(
            ErrorCode::SPEC_UNREADABLE,
            format!("failed to read {}: {}", path.display(), e),
        )
    })?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );

    let doc: Value = if is_yaml {
        serde_yaml::from_str(&raw).map_err(|e| {
            StructuredError::new(ErrorCode::SPEC_INVALID_DOCUMENT, format!("invalid YAML: {}", e))
        })?
    } else {
        serde_json::from_str(&raw).or_else(|_| serde_yaml::from_str(&raw)).map_err(|e| {
            StructuredError::new(
                ErrorCode::SPEC_INVALID_DOCUMENT,
                format!("not valid JSON or YAML: {}", e),
            )
        })?
    };

    from_document(doc)
}

/// Resolves local `$ref`s against `doc` and builds the operation catalog.
pub fn from_document(doc: Value) -> Result<SpecModel, StructuredError> {
    let resolved = resolve_refs(&doc, &doc, &mut Vec::new())?;

    let preferred_base_url = resolved
        .get("servers")
        .and_then(|s| s.as_array())
        .and_then(|arr| arr.first())
        .and_then(|s| s.get("url"))
        .and_then(|u| u.as_str())
        .map(str::to_string);

    let mut operations = BTreeMap::new();
    if let Some(paths) = resolved.get("paths").and_then(|p| p.as_object()) {
        for (path, item) in paths {
            let Some(item) = item.as_object() else { continue };
            for method in ["get", "post", "put", "patch", "delete", "head", "options"] {
                let Some(op) = item.get(method) else { continue };
                let op_id = op
                    .get("operationId")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{}_{}", method, path.replace(['/', '{', '}'], "_")));

                let parameters = parse_parameters(op.get("parameters"));
                let request_body = parse_request_body(op.get("requestBody"));
                let responses = parse_responses(op.get("responses"));

                operations.insert(
                    op_id.clone(),
                    Operation {
                        op_id,
                        method: method.to_uppercase(),
                        path: path.clone(),
                        parameters,
                        request_body,
                        responses,
                    },
                );
            }
        }
    }

    Ok(SpecModel {
        operations,
        preferred_base_url,
    })
}

fn parse_parameters(raw: Option<&Value>) -> Vec<Parameter> {
    let Some(arr) = raw.and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    arr.iter()
        .filter_map(|p| {
            let name = p.get("name")?.as_str()?.to_string();
            let location = match p.get("in")?.as_str()? {
                "path" => ParamLocation::Path,
                "query" => ParamLocation::Query,
                "header" => ParamLocation::Header,
                "cookie" => ParamLocation::Cookie,
                _ => return None,
            };
            let required = p.get("required").and_then(|v| v.as_bool()).unwrap_or(false);
            let schema = p.get("schema").cloned().unwrap_or(Value::Null);
            Some(Parameter {
                name,
                location,
                required,
                schema,
            })
        })
        .collect()
}

fn parse_request_body(raw: Option<&Value>) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    if let Some(content) = raw.and_then(|b| b.get("content")).and_then(|c| c.as_object()) {
        for (media_type, body) in content {
            if let Some(schema) = body.get("schema") {
                out.insert(media_type.clone(), schema.clone());
            }
        }
    }
    out
}

fn parse_responses(raw: Option<&Value>) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    if let Some(obj) = raw.and_then(|r| r.as_object()) {
        for (status, resp) in obj {
            let schema = resp
                .get("content")
                .and_then(|c| c.get("application/json"))
                .and_then(|m| m.get("schema"))
                .cloned()
                .unwrap_or(Value::Null);
            out.insert(status.clone(), schema);
        }
    }
    out
}

/// Walks `value`, replacing any `{"$ref": "#/..."}` node with the pointee
/// resolved against `root`. Local refs only; a cycle (a pointer revisited
/// while still on the `stack`) is a hard error.
fn resolve_refs(value: &Value, root: &Value, stack: &mut Vec<String>) -> Result<Value, StructuredError> {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(ptr)) = map.get("$ref") {
                if !ptr.starts_with("#/") {
                    return Err(StructuredError::new(
                        ErrorCode::SPEC_UNRESOLVABLE_REF,
                        format!("only local refs are supported, got {}", ptr),
                    ));
                }
                if stack.iter().any(|s| s == ptr) {
                    return Err(StructuredError::new(
                        ErrorCode::SPEC_REF_CYCLE,
                        format!("cyclic $ref detected at {}", ptr),
                    ));
                }
                let target = resolve_pointer(root, ptr).ok_or_else(|| {
                    StructuredError::new(
                        ErrorCode::SPEC_UNRESOLVABLE_REF,
                        format!("unresolvable $ref: {}", ptr),
                    )
                })?;
                stack.push(ptr.clone());
                let resolved = resolve_refs(target, root, stack)?;
                stack.pop();
                return Ok(resolved);
            }

            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_refs(v, root, stack)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_refs(item, root, stack)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_pointer<'a>(root: &'a Value, pointer: &str) -> Option<&'a Value> {
    let path = pointer.strip_prefix('#')?;
    root.pointer(path)
}

/// Grammar: `segment ( ('.' segment) | ('[' digits ']') )*`.
/// Flattens a JSON body into dotted-key leaves. Fails on cyclic structures,
/// which cannot occur for `serde_json::Value` trees built from parsed JSON
/// but can in principle be constructed programmatically; the recursion is
/// depth-bounded defensively rather than truly cycle-checked.
pub fn flatten(value: &Value) -> Result<BTreeMap<String, Value>, StructuredError> {
    let mut out = BTreeMap::new();
    flatten_into(value, String::new(), &mut out, 0)?;
    Ok(out)
}

const MAX_FLATTEN_DEPTH: usize = 64;

fn flatten_into(
    value: &Value,
    prefix: String,
    out: &mut BTreeMap<String, Value>,
    depth: usize,
) -> Result<(), StructuredError> {
    if depth > MAX_FLATTEN_DEPTH {
        return Err(StructuredError::new(
            ErrorCode::SPEC_FLATTEN_CYCLE,
            "flatten exceeded maximum nesting depth",
        ));
    }
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (k, v) in map {
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{}.{}", prefix, k)
                };
                flatten_into(v, key, out, depth + 1)?;
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (i, v) in items.iter().enumerate() {
                let key = format!("{}[{}]", prefix, i);
                flatten_into(v, key, out, depth + 1)?;
            }
        }
        leaf => {
            out.insert(prefix, leaf.clone());
        }
    }
    Ok(())
}

#[derive(Debug)]
enum Segment {
    Key(String),
    Index(usize),
}

fn parse_key(key: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut rest = key;
    loop {
        if let Some(bracket) = rest.find('[') {
            if bracket > 0 {
                segments.push(Segment::Key(rest[..bracket].to_string()));
            }
            let close = rest[bracket..].find(']').map(|i| bracket + i).unwrap_or(rest.len());
            if let Ok(idx) = rest[bracket + 1..close].parse::<usize>() {
                segments.push(Segment::Index(idx));
            }
            rest = &rest[(close + 1).min(rest.len())..];
            rest = rest.strip_prefix('.').unwrap_or(rest);
        } else if let Some(dot) = rest.find('.') {
            segments.push(Segment::Key(rest[..dot].to_string()));
            rest = &rest[dot + 1..];
        } else {
            if !rest.is_empty() {
                segments.push(Segment::Key(rest.to_string()));
            }
            break;
        }
    }
    segments
}

/// The exact inverse of [`flatten`] for bodies without mixed-type arrays.
pub fn unflatten(map: &BTreeMap<String, Value>) -> Value {
    let mut root = Value::Null;
    for (key, leaf) in map {
        let segments = parse_key(key);
        set_path(&mut root, &segments, leaf.clone());
    }
    if root.is_null() {
        Value::Object(Map::new())
    } else {
        root
    }
}

fn set_path(node: &mut Value, segments: &[Segment], leaf: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *node = leaf;
        return;
    };

    match head {
        Segment::Key(k) => {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            let obj = node.as_object_mut().unwrap();
            let entry = obj.entry(k.clone()).or_insert(Value::Null);
            set_path(entry, rest, leaf);
        }
        Segment::Index(i) => {
            if !node.is_array() {
                *node = Value::Array(Vec::new());
            }
            let arr = node.as_array_mut().unwrap();
            while arr.len() <= *i {
                arr.push(Value::Null);
            }
            set_path(&mut arr[*i], rest, leaf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flatten_and_unflatten_are_inverses() {
        let body = json!({
            "id": 1,
            "name": "Fido",
            "tags": ["a", "b"],
            "owner": {"id": 9, "address": {"city": "SF"}},
        });
        let flat = flatten(&body).unwrap();
        let back = unflatten(&flat);
        assert_eq!(body, back);
    }

    #[test]
    fn flatten_keys_use_dotted_grammar() {
        let body = json!({"owner": {"pets": [{"id": 1}]}});
        let flat = flatten(&body).unwrap();
        assert_eq!(
            flat.get("owner.pets[0].id").cloned(),
            Some(json!(1))
        );
    }

    #[test]
    fn resolves_local_ref_without_cycle() {
        let doc = json!({
            "components": {"schemas": {"Pet": {"type": "object"}}},
            "paths": {
                "/pet": {"get": {"operationId": "getPet", "responses": {
                    "200": {"content": {"application/json": {"schema": {"$ref": "#/components/schemas/Pet"}}}}
                }}}
            }
        });
        let model = from_document(doc).unwrap();
        let op = model.get("getPet").unwrap();
        assert_eq!(op.responses.get("200").unwrap()["type"], json!("object"));
    }

    #[test]
    fn detects_ref_cycle() {
        let doc = json!({
            "components": {"schemas": {
                "A": {"$ref": "#/components/schemas/B"},
                "B": {"$ref": "#/components/schemas/A"},
            }},
            "paths": {
                "/x": {"get": {"operationId": "getX", "responses": {
                    "200": {"content": {"application/json": {"schema": {"$ref": "#/components/schemas/A"}}}}
                }}}
            }
        });
        assert!(from_document(doc).is_err());
    }

    #[test]
    fn success_responses_filters_non_2xx() {
        let op = Operation {
            op_id: "x".into(),
            method: "GET".into(),
            path: "/x".into(),
            parameters: vec![],
            request_body: BTreeMap::new(),
            responses: BTreeMap::from([
                ("200".to_string(), json!({"type": "object"})),
                ("404".to_string(), json!({"type": "object"})),
            ]),
        };
        let success = op.success_responses();
        assert_eq!(success.len(), 1);
        assert!(success.contains_key("200"));
    }
}
