// Hearth Agent Engine — Orchestrator Client
//
// The orchestrator hosts the capability servers and exposes exactly two
// operations the engine cares about: list the tool catalog, and call a tool.
// Tool content comes back as a structured envelope whose text payload is
// JSON; the engine unwraps one level (`response.data` or `response`) before
// use. The trace id rides a header on every call.
//
// `ToolHost` is the seam — engine logic and tests run against fakes.

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::config::EngineConfig;
use crate::engine::trace::{TraceContext, TRACE_HEADER};
use crate::engine::types::*;
use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

#[async_trait]
pub trait ToolHost: Send + Sync {
    /// Fetch the current tool catalog.
    async fn list_tools(&self) -> EngineResult<Vec<ToolDescriptor>>;

    /// Execute one tool call. Tool-level failures come back as
    /// `Ok(ToolOutcome { success: false, .. })`; transport failures as `Err`.
    async fn call_tool(
        &self,
        name: &str,
        args: &Value,
        trace: &TraceContext,
    ) -> EngineResult<ToolOutcome>;
}

pub struct HttpOrchestrator {
    client: Client,
    base_url: String,
}

impl HttpOrchestrator {
    pub fn new(config: &EngineConfig) -> Self {
        HttpOrchestrator { client: Client::new(), base_url: config.orchestrator_url.clone() }
    }

    /// Unwrap one envelope level: `{"response": {"data": X}}` → X,
    /// `{"response": X}` → X, otherwise the value itself.
    fn unwrap_envelope(v: Value) -> Value {
        match v {
            Value::Object(mut obj) => {
                if let Some(response) = obj.remove("response") {
                    match response {
                        Value::Object(mut inner) => {
                            if let Some(data) = inner.remove("data") {
                                data
                            } else {
                                Value::Object(inner)
                            }
                        }
                        other => other,
                    }
                } else if let Some(data) = obj.remove("data") {
                    data
                } else {
                    Value::Object(obj)
                }
            }
            other => other,
        }
    }

    fn payload_text(v: Value) -> String {
        match v {
            Value::String(s) => s,
            other => other.to_string(),
        }
    }
}

#[async_trait]
impl ToolHost for HttpOrchestrator {
    async fn list_tools(&self) -> EngineResult<Vec<ToolDescriptor>> {
        let url = format!("{}/tools", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await?
            .error_for_status()?;

        let v: Value = resp.json().await?;
        let v = Self::unwrap_envelope(v);
        let tools: Vec<ToolDescriptor> = serde_json::from_value(v)?;
        debug!("[orchestrator] Catalog: {} tool(s)", tools.len());
        Ok(tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        args: &Value,
        trace: &TraceContext,
    ) -> EngineResult<ToolOutcome> {
        let url = format!("{}/tools/call", self.base_url.trim_end_matches('/'));
        let body = json!({ "name": name, "args": args });

        let resp = self
            .client
            .post(&url)
            .header(TRACE_HEADER, &trace.id)
            .json(&body)
            .timeout(Duration::from_secs(60))
            .send()
            .await
            .map_err(|e| EngineError::tool(name, format!("transport: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(EngineError::tool(name, format!("{} — {}", status, truncate_utf8(&text, 300))));
        }

        let v: Value = resp.json().await?;
        let success = v["success"].as_bool().unwrap_or(true);
        let output = if success {
            Self::payload_text(Self::unwrap_envelope(
                v.get("content").cloned().unwrap_or(Value::Null),
            ))
        } else {
            v["error"].as_str().map(str::to_string).unwrap_or_else(|| "tool failed".into())
        };

        debug!(
            "[orchestrator] {} success={} output_len={} trace={}",
            name,
            success,
            output.len(),
            trace.short()
        );
        Ok(ToolOutcome { success, output })
    }
}
