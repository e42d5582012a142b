//! The LLM oracle: a single synchronous `ask(prompt, want_json) -> text`
//! contract, a content-addressed response cache, and the six prompt
//! templates the rest of the engine drives it with.
//!
//! Transport is a minimal OpenAI-compatible chat-completions client, reqwest
//! with bearer auth in the same style the ecosystem's other LLM clients use.

pub mod prompts;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{instrument, warn};

use crate::config::ProviderConfig;
use crate::errors::{ErrorCode, StructuredError};

/// Running token/cost counters, shared across concurrent planning tasks.
#[derive(Debug, Default, Clone, Copy)]
pub struct UsageStats {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

/// Per-million-token USD prices; `None` when the model's pricing is not
/// known, in which case cost is left at zero but token counts still accrue.
fn unit_cost(_model: &str) -> Option<(f64, f64)> {
    // (prompt $/1M tokens, completion $/1M tokens) — conservative GPT-4o-class default.
    Some((5.0, 15.0))
}

#[async_trait]
pub trait LlmOracle: Send + Sync {
    async fn ask(&self, prompt: &str, want_json: bool) -> Result<String, StructuredError>;
    fn usage(&self) -> UsageStats;
}

/// An OpenAI-compatible chat-completions client, bearing either Azure or
/// plain OpenAI credentials, with a content-addressed in-process cache and
/// bounded retry-on-malformed-output handled by the caller via
/// [`ask_json`].
pub struct HttpOracle {
    client: reqwest::Client,
    provider: ProviderConfig,
    timeout: Duration,
    cache: Mutex<HashMap<String, String>>,
    usage: Mutex<UsageStats>,
}

impl HttpOracle {
    pub fn new(provider: ProviderConfig, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            provider,
            timeout,
            cache: Mutex::new(HashMap::new()),
            usage: Mutex::new(UsageStats::default()),
        }
    }

    fn cache_key(&self, prompt: &str, want_json: bool) -> String {
        let mut hasher = Sha256::new();
        hasher.update(prompt.as_bytes());
        hasher.update([want_json as u8]);
        hasher.update(self.model_id().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn model_id(&self) -> String {
        match &self.provider {
            ProviderConfig::AzureOpenAi { deployment, .. } => deployment.clone(),
            ProviderConfig::OpenAi { model_name, .. } => model_name.clone(),
        }
    }

    fn endpoint_and_auth(&self) -> (String, Option<(String, String)>) {
        match &self.provider {
            ProviderConfig::AzureOpenAi {
                api_key,
                endpoint,
                api_version,
                deployment,
            } => (
                format!(
                    "{}/openai/deployments/{}/chat/completions?api-version={}",
                    endpoint.trim_end_matches('/'),
                    deployment,
                    api_version
                ),
                Some(("api-key".to_string(), api_key.clone())),
            ),
            ProviderConfig::OpenAi { api_key, .. } => (
                "https://api.openai.com/v1/chat/completions".to_string(),
                Some(("Authorization".to_string(), format!("Bearer {}", api_key))),
            ),
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl LlmOracle for HttpOracle {
    #[instrument(skip(self, prompt), fields(want_json, prompt_len = prompt.len()))]
    async fn ask(&self, prompt: &str, want_json: bool) -> Result<String, StructuredError> {
        let key = self.cache_key(prompt, want_json);
        if let Some(cached) = self.cache.lock().unwrap().get(&key).cloned() {
            return Ok(cached);
        }

        let (url, auth_header) = self.endpoint_and_auth();
        let mut body = json!({
            "model": self.model_id(),
            "temperature": 0.1,
            "messages": [{"role": "user", "content": prompt}],
        });
        if want_json {
            body["response_format"] = json!({"type": "json_object"});
        }

        let mut request = self.client.post(&url).timeout(self.timeout).json(&body);
        if let Some((header, value)) = auth_header {
            request = request.header(header, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                StructuredError::new(ErrorCode::ORACLE_TIMEOUT, e.to_string())
            } else {
                StructuredError::new(ErrorCode::ORACLE_UNAVAILABLE, e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(StructuredError::new(
                ErrorCode::ORACLE_UNAVAILABLE,
                format!("oracle returned HTTP {}", response.status()),
            ));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            StructuredError::new(ErrorCode::ORACLE_MALFORMED_OUTPUT, e.to_string())
        })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| {
                StructuredError::new(ErrorCode::ORACLE_MALFORMED_OUTPUT, "no choices in response")
            })?;

        if let Some(usage) = parsed.usage {
            let mut stats = self.usage.lock().unwrap();
            stats.prompt_tokens += usage.prompt_tokens;
            stats.completion_tokens += usage.completion_tokens;
            if let Some((prompt_rate, completion_rate)) = unit_cost(&self.model_id()) {
                stats.cost_usd += usage.prompt_tokens as f64 / 1_000_000.0 * prompt_rate;
                stats.cost_usd += usage.completion_tokens as f64 / 1_000_000.0 * completion_rate;
            }
        }

        self.cache.lock().unwrap().insert(key, text.clone());
        Ok(text)
    }

    fn usage(&self) -> UsageStats {
        *self.usage.lock().unwrap()
    }
}

/// Extracts the first outermost JSON object or array from free-form model
/// output and parses it. Oracles are asked for bare JSON but sometimes wrap
/// it in prose or a fenced code block.
pub fn extract_json(text: &str) -> Result<Value, StructuredError> {
    let bytes = text.as_bytes();
    let mut start = None;
    let mut depth: i32 = 0;
    let mut opening: u8 = 0;
    let mut closing: u8 = 0;

    for (i, &b) in bytes.iter().enumerate() {
        if start.is_none() && (b == b'{' || b == b'[') {
            start = Some(i);
            opening = b;
            closing = if b == b'{' { b'}' } else { b']' };
            depth = 1;
            continue;
        }
        if start.is_some() {
            if b == opening {
                depth += 1;
            } else if b == closing {
                depth -= 1;
                if depth == 0 {
                    let slice = &text[start.unwrap()..=i];
                    return serde_json::from_str(slice).map_err(|e| {
                        StructuredError::new(
                            ErrorCode::ORACLE_MALFORMED_OUTPUT,
                            format!("failed to parse extracted JSON: {}", e),
                        )
                    });
                }
            }
        }
    }

    Err(StructuredError::new(
        ErrorCode::ORACLE_MALFORMED_OUTPUT,
        "no JSON object or array found in oracle output",
    ))
}

/// Calls the oracle with `want_json = true`, retrying with the prior
/// malformed output and parse error appended to the prompt up to
/// `max_retries` times.
pub async fn ask_json(
    oracle: &dyn LlmOracle,
    prompt: &str,
    max_retries: u32,
) -> Result<Value, StructuredError> {
    let mut current_prompt = prompt.to_string();
    let mut last_err = None;

    for attempt in 0..=max_retries {
        let text = oracle.ask(&current_prompt, true).await?;
        match extract_json(&text) {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(attempt, error = %e, "oracle output failed to parse as JSON");
                current_prompt = format!(
                    "{}\n\nYour previous response could not be parsed as JSON. It was:\n{}\n\nParse error: {}\n\nRespond again with ONLY valid JSON.",
                    prompt, text, e
                );
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        StructuredError::new(ErrorCode::ORACLE_RETRIES_EXHAUSTED, "oracle retries exhausted")
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_json_object_from_prose() {
        let text = "Sure, here you go:\n```json\n{\"a\": 1, \"b\": [1,2]}\n```\nHope that helps!";
        let value = extract_json(text).unwrap();
        assert_eq!(value["a"], json!(1));
    }

    #[test]
    fn extracts_json_array() {
        let text = "[{\"name\": \"x\"}, {\"name\": \"y\"}]";
        let value = extract_json(text).unwrap();
        assert!(value.is_array());
    }

    #[test]
    fn fails_on_no_json() {
        assert!(extract_json("no json here").is_err());
    }
}
