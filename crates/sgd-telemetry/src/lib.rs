// SPDX-License-Identifier: MIT OR Apache-2.0
//! Request-scoped trace accounting: a `Trace` owns nested `Span`s, each of
//! which may own `LlmCall` records. Prompts and completions are never stored
//! raw — only their SHA-256 hashes — so a trace is always safe to export.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sgd_core::hex_sha256;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpanStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCall {
    pub model: String,
    pub task: String,
    pub prompt_hash: String,
    pub completion_hash: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub latency_ms: u64,
    pub cost_usd: f64,
    pub timestamp: DateTime<Utc>,
}

impl LlmCall {
    /// Hash `prompt`/`completion` rather than storing them, so a call
    /// record is safe to export even though the trace may be shipped to an
    /// external sink.
    pub fn new(
        model: impl Into<String>,
        task: impl Into<String>,
        prompt: &str,
        completion: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
        latency_ms: u64,
        cost_usd: f64,
    ) -> Self {
        LlmCall {
            model: model.into(),
            task: task.into(),
            prompt_hash: hex_sha256(prompt.as_bytes()),
            completion_hash: hex_sha256(completion.as_bytes()),
            prompt_tokens,
            completion_tokens,
            latency_ms,
            cost_usd,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub meta: BTreeMap<String, String>,
    pub status: SpanStatus,
    pub llm_calls: Vec<LlmCall>,
}

impl Span {
    fn new(name: impl Into<String>) -> Self {
        Span {
            name: name.into(),
            start: Utc::now(),
            end: None,
            meta: BTreeMap::new(),
            status: SpanStatus::Ok,
            llm_calls: Vec::new(),
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end.map(|end| (end - self.start).num_milliseconds())
    }
}

/// A push/pop-scoped span handle returned by [`Trace::start_span`]. Dropping
/// it without calling [`Self::finish`] closes the span as `OK` with an end
/// timestamp of "now", so a span is never left permanently open by an early
/// `return`/`?`.
pub struct SpanGuard<'a> {
    trace: &'a Trace,
    index: usize,
    finished: bool,
}

impl<'a> SpanGuard<'a> {
    pub fn record_llm_call(&self, call: LlmCall) {
        let mut spans = self.trace.spans.lock().expect("spans mutex poisoned");
        spans[self.index].llm_calls.push(call);
    }

    pub fn set_meta(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut spans = self.trace.spans.lock().expect("spans mutex poisoned");
        spans[self.index].meta.insert(key.into(), value.into());
    }

    pub fn finish(mut self, status: SpanStatus) {
        self.close(status);
    }

    fn close(&mut self, status: SpanStatus) {
        if self.finished {
            return;
        }
        self.finished = true;
        let mut spans = self.trace.spans.lock().expect("spans mutex poisoned");
        spans[self.index].end = Some(Utc::now());
        spans[self.index].status = status;
    }
}

impl Drop for SpanGuard<'_> {
    fn drop(&mut self) {
        self.close(SpanStatus::Ok);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSnapshot {
    pub id: Uuid,
    pub name: String,
    pub spans: Vec<Span>,
    pub total_cost_usd: f64,
    pub total_tokens: u64,
}

/// Owns the spans and LLM-call records belonging to one request. Cheap to
/// clone (an `Arc`-backed handle would be the caller's choice); `Trace`
/// itself holds its state behind a mutex so spans can be opened/closed from
/// anywhere the request's call stack reaches.
pub struct Trace {
    id: Uuid,
    name: String,
    spans: Mutex<Vec<Span>>,
}

impl Trace {
    pub fn new(name: impl Into<String>) -> Self {
        Trace {
            id: Uuid::new_v4(),
            name: name.into(),
            spans: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn start_span(&self, name: impl Into<String>) -> SpanGuard<'_> {
        let mut spans = self.spans.lock().expect("spans mutex poisoned");
        let index = spans.len();
        spans.push(Span::new(name));
        SpanGuard { trace: self, index, finished: false }
    }

    /// `total_cost_usd` is always the sum of `cost_usd` across every
    /// `llm_call` in every span; `total_tokens` sums prompt+completion
    /// tokens the same way. Computed on demand rather than tracked
    /// incrementally so it can never drift from the underlying records.
    pub fn snapshot(&self) -> TraceSnapshot {
        let spans = self.spans.lock().expect("spans mutex poisoned").clone();
        let total_cost_usd: f64 = spans.iter().flat_map(|s| &s.llm_calls).map(|c| c.cost_usd).sum();
        let total_tokens: u64 = spans
            .iter()
            .flat_map(|s| &s.llm_calls)
            .map(|c| c.prompt_tokens + c.completion_tokens)
            .sum();
        TraceSnapshot {
            id: self.id,
            name: self.name.clone(),
            spans,
            total_cost_usd,
            total_tokens,
        }
    }
}

/// Ships a finished trace somewhere (a real sink in production, a
/// `tracing`-backed one for local dev and tests). The core never depends on
/// a concrete vendor SDK.
pub trait TraceExporter: Send + Sync {
    fn export(&self, trace: &TraceSnapshot) -> Result<(), String>;
}

/// Emits one structured `tracing::info!` event per span and per LLM call,
/// plus a summary event for the trace itself.
#[derive(Debug, Default)]
pub struct TracingExporter;

impl TraceExporter for TracingExporter {
    fn export(&self, trace: &TraceSnapshot) -> Result<(), String> {
        tracing::info!(
            trace_id = %trace.id,
            name = %trace.name,
            total_cost_usd = trace.total_cost_usd,
            total_tokens = trace.total_tokens,
            span_count = trace.spans.len(),
            "trace_finished"
        );
        for span in &trace.spans {
            tracing::info!(
                trace_id = %trace.id,
                span_name = %span.name,
                status = ?span.status,
                duration_ms = span.duration_ms(),
                "trace_span"
            );
            for call in &span.llm_calls {
                tracing::info!(
                    trace_id = %trace.id,
                    span_name = %span.name,
                    model = %call.model,
                    task = %call.task,
                    prompt_hash = %call.prompt_hash,
                    completion_hash = %call.completion_hash,
                    cost_usd = call.cost_usd,
                    "trace_llm_call"
                );
            }
        }
        Ok(())
    }
}

/// Serializes the snapshot as pretty JSON; mirrors the teacher's
/// `JsonExporter` and is useful for tests asserting on exported shape.
#[derive(Debug, Default)]
pub struct JsonExporter;

impl TraceExporter for JsonExporter {
    fn export(&self, trace: &TraceSnapshot) -> Result<(), String> {
        serde_json::to_string_pretty(trace).map(|_| ()).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_closes_with_ok_status_and_duration_on_finish() {
        let trace = Trace::new("render");
        let span = trace.start_span("plan");
        span.finish(SpanStatus::Ok);

        let snap = trace.snapshot();
        assert_eq!(snap.spans.len(), 1);
        assert_eq!(snap.spans[0].status, SpanStatus::Ok);
        assert!(snap.spans[0].duration_ms().is_some());
    }

    #[test]
    fn dropped_span_without_finish_still_closes() {
        let trace = Trace::new("render");
        {
            let _span = trace.start_span("plan");
        }
        let snap = trace.snapshot();
        assert!(snap.spans[0].end.is_some());
    }

    #[test]
    fn llm_call_never_stores_raw_prompt_or_completion() {
        let call = LlmCall::new("gpt-x", "planner", "secret prompt", "secret completion", 10, 20, 5, 0.01);
        let json = serde_json::to_string(&call).unwrap();
        assert!(!json.contains("secret prompt"));
        assert!(!json.contains("secret completion"));
        assert_eq!(call.prompt_hash.len(), 64);
        assert_eq!(call.completion_hash.len(), 64);
    }

    #[test]
    fn trace_total_cost_and_tokens_sum_across_spans() {
        let trace = Trace::new("render");
        let span_a = trace.start_span("plan");
        span_a.record_llm_call(LlmCall::new("a", "planner", "p1", "c1", 10, 5, 100, 0.02));
        span_a.finish(SpanStatus::Ok);

        let span_b = trace.start_span("image");
        span_b.record_llm_call(LlmCall::new("b", "image", "p2", "c2", 20, 10, 200, 0.05));
        span_b.finish(SpanStatus::Ok);

        let snap = trace.snapshot();
        assert!((snap.total_cost_usd - 0.07).abs() < 1e-9);
        assert_eq!(snap.total_tokens, 45);
    }

    #[test]
    fn error_status_is_recorded() {
        let trace = Trace::new("render");
        let span = trace.start_span("plan");
        span.finish(SpanStatus::Error);
        let snap = trace.snapshot();
        assert_eq!(snap.spans[0].status, SpanStatus::Error);
    }

    #[test]
    fn tracing_exporter_succeeds_on_empty_trace() {
        let trace = Trace::new("render");
        let exporter = TracingExporter;
        assert!(exporter.export(&trace.snapshot()).is_ok());
    }

    #[test]
    fn json_exporter_excludes_raw_text_but_includes_cost() {
        let trace = Trace::new("render");
        let span = trace.start_span("plan");
        span.record_llm_call(LlmCall::new("a", "planner", "raw prompt text", "raw completion text", 1, 1, 1, 1.5));
        span.finish(SpanStatus::Ok);

        let snap = trace.snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        assert!(!json.contains("raw prompt text"));
        assert!(json.contains("1.5"));
    }
}
