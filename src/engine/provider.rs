// Hearth Agent Engine — Model Client
//
// One chat completion per call against an OpenAI-compatible endpoint:
// system prompt + message array, structured tool declarations, tool-choice
// auto/required/none, and a per-call deadline. The reasoning loop and step
// capture live in agent_loop — this layer only speaks the wire format.
//
// The `ChatBackend` trait is the seam: the engine and its tests run against
// scripted fakes; production uses `HttpModelClient`.

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::config::EngineConfig;
use crate::engine::types::*;
use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

/// One model invocation.
#[derive(Debug, Clone)]
pub struct ChatCall {
    pub model: String,
    /// Full prompt, system message first.
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDescriptor>,
    pub tool_choice: ToolChoice,
    pub temperature: f64,
    pub deadline: Duration,
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat(&self, call: ChatCall) -> EngineResult<ChatOutcome>;
}

/// OpenAI-compatible chat-completions client.
pub struct HttpModelClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpModelClient {
    pub fn new(config: &EngineConfig) -> Self {
        HttpModelClient {
            client: Client::new(),
            base_url: config.model_url.clone(),
            api_key: config.model_api_key.clone(),
        }
    }

    fn wire_messages(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                };
                let mut obj = json!({ "role": role, "content": m.content });
                if let Some(calls) = &m.tool_calls {
                    if !calls.is_empty() {
                        obj["tool_calls"] = json!(calls
                            .iter()
                            .map(|tc| {
                                json!({
                                    "id": tc.id,
                                    "type": tc.call_type,
                                    "function": {
                                        "name": tc.function.name,
                                        "arguments": tc.function.arguments,
                                    },
                                })
                            })
                            .collect::<Vec<_>>());
                    }
                }
                if let Some(id) = &m.tool_call_id {
                    obj["tool_call_id"] = json!(id);
                }
                obj
            })
            .collect()
    }

    fn wire_tools(tools: &[ToolDescriptor]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    },
                })
            })
            .collect()
    }

    fn parse_outcome(v: &Value) -> EngineResult<ChatOutcome> {
        let message = &v["choices"][0]["message"];
        if message.is_null() {
            return Err(EngineError::provider("model", "response has no choices[0].message"));
        }

        let text = message["content"].as_str().unwrap_or("").to_string();

        let mut tool_calls = Vec::new();
        if let Some(calls) = message["tool_calls"].as_array() {
            for tc in calls {
                let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
                if name.is_empty() {
                    continue;
                }
                let id = tc["id"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4()));
                let arguments = match &tc["function"]["arguments"] {
                    Value::String(s) => s.clone(),
                    other if !other.is_null() => other.to_string(),
                    _ => "{}".to_string(),
                };
                tool_calls.push(ToolCall {
                    id,
                    call_type: "function".into(),
                    function: FunctionCall { name, arguments },
                });
            }
        }

        let usage = TokenUsage {
            prompt_tokens: v["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: v["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        };

        Ok(ChatOutcome { text, tool_calls, usage, model: v["model"].as_str().map(str::to_string) })
    }
}

#[async_trait]
impl ChatBackend for HttpModelClient {
    async fn chat(&self, call: ChatCall) -> EngineResult<ChatOutcome> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let mut body = json!({
            "model": call.model,
            "messages": Self::wire_messages(&call.messages),
            "temperature": call.temperature,
        });
        if !call.tools.is_empty() {
            body["tools"] = json!(Self::wire_tools(&call.tools));
            body["tool_choice"] = json!(match call.tool_choice {
                ToolChoice::Auto => "auto",
                ToolChoice::Required => "required",
                ToolChoice::None => "none",
            });
        }

        debug!(
            "[provider] chat model={} messages={} tools={}",
            call.model,
            call.messages.len(),
            call.tools.len()
        );

        let mut req = self.client.post(&url).json(&body).timeout(call.deadline);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::provider("model", "deadline elapsed")
            } else {
                EngineError::Network(e)
            }
        })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(EngineError::provider(
                "model",
                format!("{} — {}", status, truncate_utf8(&text, 500)),
            ));
        }

        let v: Value = resp.json().await?;
        Self::parse_outcome(&v)
    }
}

/// Whether an error looks like a malformed-tool-call rejection from the
/// provider (as opposed to transport trouble). Drives the retry branch.
pub fn is_tool_call_error(err: &EngineError) -> bool {
    match err {
        EngineError::Provider { message, .. } => {
            let m = message.to_lowercase();
            m.contains("tool_call") || m.contains("tool call") || m.contains("function_call")
                || m.contains("invalid_function") || m.contains("arguments")
        }
        _ => false,
    }
}

/// Whether an error is the per-attempt deadline (treated as transient).
pub fn is_deadline_error(err: &EngineError) -> bool {
    matches!(err, EngineError::Provider { message, .. } if message.contains("deadline"))
}
