//! The request sender: turns a resolved [`RequestValues`] into an HTTP call
//! against a concrete [`crate::spec::Operation`] and captures a normalized
//! [`ResponseRecord`]. Generalizes the request-building/response-capture
//! half of the executor the rest of this codebase uses for plan replay,
//! stripped of assertion evaluation (that belongs to the artifact runner,
//! §4.8) and widened to the parameter locations and content-type rules this
//! engine's baseline/scenario generators need.

use std::collections::BTreeMap;
use std::time::Instant;

use reqwest::{Client, Method};
use serde_json::Value;
use tracing::{instrument, warn};

use crate::config::RunLimits;
use crate::errors::{ErrorCode, StructuredError};
use crate::spec::{Operation, ParamLocation};

/// Everything needed to send one request: resolved parameter maps plus an
/// optional body, already stripped of placeholders.
#[derive(Debug, Clone, Default)]
pub struct RequestValues {
    pub path_params: BTreeMap<String, Value>,
    pub query_params: BTreeMap<String, Value>,
    pub headers: BTreeMap<String, Value>,
    pub cookies: BTreeMap<String, Value>,
    pub body: Option<Value>,
}

/// A normalized, truncated view of an HTTP response.
#[derive(Debug, Clone)]
pub struct ResponseRecord {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Parsed from `Set-Cookie` response headers; name -> value, attributes
    /// (`Path=`, `HttpOnly`, ...) discarded since only the value is ever
    /// captured into the running map.
    pub cookies: BTreeMap<String, String>,
    pub body: Value,
    pub duration_ms: u64,
}

impl ResponseRecord {
    pub fn is_2xx(&self) -> bool {
        (200..300).contains(&self.status)
    }
    pub fn is_4xx(&self) -> bool {
        (400..500).contains(&self.status)
    }
    pub fn is_5xx(&self) -> bool {
        (500..600).contains(&self.status)
    }
}

pub struct RequestSender {
    client: Client,
    base_url: String,
}

impl RequestSender {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    #[instrument(skip(self, values), fields(op_id = %operation.op_id, method = %operation.method))]
    pub async fn send(
        &self,
        operation: &Operation,
        values: &RequestValues,
        limits: &RunLimits,
    ) -> Result<ResponseRecord, StructuredError> {
        let url = self.build_url(operation, values)?;
        let method = Method::from_bytes(operation.method.as_bytes()).map_err(|_| {
            StructuredError::new(
                ErrorCode::TRANSPORT_INVALID_ENCODING,
                format!("invalid HTTP method: {}", operation.method),
            )
        })?;

        let mut request = self.client.request(method, &url);

        for (name, value) in &values.headers {
            request = request.header(name, to_header_value(value));
        }
        for (name, value) in &values.cookies {
            request = request.header("Cookie", format!("{}={}", name, to_header_value(value)));
        }

        request = self.attach_body(request, values);

        let start = Instant::now();
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                StructuredError::new(ErrorCode::TRANSPORT_TIMEOUT, e.to_string())
            } else {
                StructuredError::new(ErrorCode::TRANSPORT_CONNECTION_ERROR, e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let cookies = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(parse_set_cookie)
            .collect();

        let bytes = response.bytes().await.map_err(|e| {
            StructuredError::new(ErrorCode::TRANSPORT_INVALID_ENCODING, e.to_string())
        })?;
        let duration_ms = start.elapsed().as_millis() as u64;

        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        let body = truncate_arrays(body, limits.array_truncate_len);

        Ok(ResponseRecord {
            status,
            headers,
            cookies,
            body,
            duration_ms,
        })
    }

    fn build_url(&self, operation: &Operation, values: &RequestValues) -> Result<String, StructuredError> {
        let mut path = operation.path.clone();
        for (name, value) in &values.path_params {
            let placeholder = format!("{{{}}}", name);
            path = path.replace(&placeholder, &urlencoding::encode(&to_plain_string(value)));
        }
        if path.contains('{') {
            return Err(StructuredError::new(
                ErrorCode::DEPENDENCY_UNRESOLVED,
                format!("unresolved path parameter remains in '{}'", path),
            ));
        }

        let mut url = format!("{}{}", self.base_url.trim_end_matches('/'), path);

        if !values.query_params.is_empty() {
            let query: Vec<String> = values
                .query_params
                .iter()
                .map(|(k, v)| format!("{}={}", urlencoding::encode(k), encode_query_value(v)))
                .collect();
            url.push('?');
            url.push_str(&query.join("&"));
        }

        Ok(url)
    }

    fn attach_body(&self, mut request: reqwest::RequestBuilder, values: &RequestValues) -> reqwest::RequestBuilder {
        let Some(body) = &values.body else {
            return request;
        };

        let content_type = values
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| to_plain_string(v));

        let is_form = content_type
            .as_deref()
            .map(|ct| ct.eq_ignore_ascii_case("application/x-www-form-urlencoded"))
            .unwrap_or(false);

        if is_form {
            if let Value::Object(map) = body {
                let form: Vec<(String, String)> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), to_plain_string(v)))
                    .collect();
                request = request.form(&form);
            }
        } else {
            if content_type.is_none() {
                request = request.header("Content-Type", "application/json");
            }
            request = request.json(body);
        }
        request
    }
}

/// Pulls the `name=value` pair out of a `Set-Cookie` header, discarding the
/// `; Path=...; HttpOnly` attribute tail.
fn parse_set_cookie(raw: &str) -> Option<(String, String)> {
    let pair = raw.split(';').next()?.trim();
    let (name, value) = pair.split_once('=')?;
    Some((name.trim().to_string(), value.trim().to_string()))
}

fn to_header_value(value: &Value) -> String {
    to_plain_string(value)
}

fn to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Composite/object-shaped query values are percent-encoded as JSON text;
/// plain scalars are percent-encoded as their textual form.
fn encode_query_value(value: &Value) -> String {
    match value {
        Value::Object(_) | Value::Array(_) => urlencoding::encode(&value.to_string()).into_owned(),
        other => urlencoding::encode(&to_plain_string(other)).into_owned(),
    }
}

/// Bounds a response body that is itself a top-level list to `limit`
/// elements, leaving its shape otherwise untouched. Only the response
/// body's own top-level array is in scope here, not arrays nested inside
/// an object — the truncation exists to bound prompt size for a captured
/// *list response*, not to rewrite arbitrary nested payloads.
fn truncate_arrays(value: Value, limit: usize) -> Value {
    match value {
        Value::Array(mut items) if items.len() > limit => {
            warn!(original_len = items.len(), limit, "response body list truncated");
            items.truncate(limit);
            Value::Array(items)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op() -> Operation {
        Operation {
            op_id: "getPet".into(),
            method: "GET".into(),
            path: "/pet/{petId}".into(),
            parameters: vec![],
            request_body: BTreeMap::new(),
            responses: BTreeMap::new(),
        }
    }

    #[test]
    fn build_url_substitutes_path_params() {
        let sender = RequestSender::new("http://localhost:8080");
        let mut values = RequestValues::default();
        values.path_params.insert("petId".into(), json!(42));
        let url = sender.build_url(&op(), &values).unwrap();
        assert_eq!(url, "http://localhost:8080/pet/42");
    }

    #[test]
    fn build_url_fails_on_unresolved_path_param() {
        let sender = RequestSender::new("http://localhost:8080");
        let values = RequestValues::default();
        assert!(sender.build_url(&op(), &values).is_err());
    }

    #[test]
    fn truncate_arrays_caps_top_level_list_body_at_exactly_the_limit() {
        let value = Value::Array((0..20).map(|i| json!(i)).collect());
        let truncated = truncate_arrays(value, 10);
        let items = truncated.as_array().unwrap();
        assert_eq!(items.len(), 10);
        assert_eq!(items, &(0..10).map(|i| json!(i)).collect::<Vec<_>>());
    }

    #[test]
    fn truncate_arrays_leaves_short_lists_and_nested_arrays_untouched() {
        let short = Value::Array((0..5).map(|i| json!(i)).collect());
        assert_eq!(truncate_arrays(short.clone(), 10), short);

        let nested = json!({"items": (0..20).collect::<Vec<_>>()});
        assert_eq!(truncate_arrays(nested.clone(), 10), nested);
    }

    #[test]
    fn parses_set_cookie_name_value_and_drops_attributes() {
        assert_eq!(
            parse_set_cookie("sessionId=abc123; Path=/; HttpOnly"),
            Some(("sessionId".to_string(), "abc123".to_string()))
        );
        assert_eq!(parse_set_cookie("malformed"), None);
    }

    #[test]
    fn response_status_classification() {
        let rec = ResponseRecord {
            status: 404,
            headers: BTreeMap::new(),
            cookies: BTreeMap::new(),
            body: Value::Null,
            duration_ms: 1,
        };
        assert!(rec.is_4xx());
        assert!(!rec.is_2xx());
        assert!(!rec.is_5xx());
    }
}
