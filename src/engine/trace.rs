// Hearth Agent Engine — Trace Context
//
// One identifier per top-level request, forwarded on every collaborator call
// and stamped into log lines. Correlation only — carries no authorization
// meaning.

use std::fmt;

/// Header the orchestrator expects the trace id on.
pub const TRACE_HEADER: &str = "x-hearth-trace";

#[derive(Debug, Clone)]
pub struct TraceContext {
    pub id: String,
}

impl TraceContext {
    /// Fresh trace id for a new top-level request.
    pub fn new() -> Self {
        TraceContext { id: uuid::Uuid::new_v4().to_string() }
    }

    /// Adopt an id handed in by the orchestrator, or mint one.
    pub fn from_incoming(id: Option<String>) -> Self {
        match id {
            Some(id) if !id.is_empty() => TraceContext { id },
            _ => TraceContext::new(),
        }
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.id[..self.id.len().min(8)]
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}
