// SPDX-License-Identifier: MIT OR Apache-2.0
//! Render pipeline (C10): validate, budget precheck, plan, enforce brand
//! canon, generate, store, critique, track cost. Each stage is wrapped in
//! its own trace span; the whole pipeline also implements [`JobProcessor`]
//! so it can be driven by `sgd-workers` from the async render queue.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sgd_budget::BudgetController;
use sgd_cache::Cache;
use sgd_core::{
    Asset, Audit, BrandCanon, Job, JobOutcome, MergedConstraints, RenderRequest, RenderResult,
    SgdError, SynthId, VerifiedBy,
};
use sgd_provider::{LlmCallRecord, ProviderClient, ProviderTask};
use sgd_storage::{SIGNED_URL_TTL, StorageAdapter, StorageArea, object_key};
use sgd_telemetry::{LlmCall, SpanStatus, Trace};
use sgd_workers::JobProcessor;
use uuid::Uuid;

const PLAN_CACHE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RenderPlan {
    summary: String,
    #[serde(default)]
    elements: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeneratedImage {
    data_base64: String,
    #[serde(default)]
    synthid_present: bool,
    #[serde(default)]
    synthid_payload: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ImageGenResponse {
    #[serde(default)]
    images: Vec<GeneratedImage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Critique {
    #[serde(default)]
    passed: bool,
    #[serde(default)]
    notes: Vec<String>,
    #[serde(default)]
    externally_verified: bool,
}

/// Payload enqueued for an async render: the org making the request plus
/// the already-shaped request itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderJob {
    pub org_id: String,
    pub request: RenderRequest,
}

/// A provider call's raw text plus the accounting record needed to charge
/// it to the trace — captured out of a cache factory closure, since
/// `Cache::get_or_compute` only returns the cached value itself and a
/// cache *hit* must record no new call.
struct CapturedCall {
    record: LlmCallRecord,
    raw_text: String,
}

/// Strip Markdown code fences and, failing that, locate the outermost
/// `{...}` span, per the documented planner/critic parse tie-break.
fn parse_strict_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, String> {
    if let Ok(value) = serde_json::from_str(text) {
        return Ok(value);
    }
    let stripped = text
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    if let Ok(value) = serde_json::from_str(stripped) {
        return Ok(value);
    }
    if let (Some(start), Some(end)) = (stripped.find('{'), stripped.rfind('}'))
        && start < end
        && let Ok(value) = serde_json::from_str(&stripped[start..=end])
    {
        return Ok(value);
    }
    Err(format!("could not locate valid JSON object in: {text}"))
}

/// Pull the assistant message text out of an OpenRouter-shaped chat
/// completion body; falls back to the raw body as text for transports that
/// return the content directly.
fn message_content(body: &serde_json::Value) -> String {
    body.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string())
}

fn enhanced_prompt(request: &RenderRequest, plan: &RenderPlan, merged: &MergedConstraints) -> String {
    format!(
        "{instruction}\n\nPlan: {summary}\nElements: {elements}\nPalette: {palette}\nFonts: {fonts}\nLogo safe zone: {pct}%",
        instruction = request.prompts.instruction,
        summary = plan.summary,
        elements = plan.elements.join(", "),
        palette = merged.palette_hex.join(", "),
        fonts = merged.fonts.join(", "),
        pct = merged.logo_safe_zone_pct,
    )
}

pub struct RenderPipeline {
    provider: Arc<ProviderClient>,
    cache: Arc<Cache>,
    storage: Arc<dyn StorageAdapter>,
    budget: Arc<BudgetController>,
}

impl RenderPipeline {
    pub fn new(
        provider: Arc<ProviderClient>,
        cache: Arc<Cache>,
        storage: Arc<dyn StorageAdapter>,
        budget: Arc<BudgetController>,
    ) -> Self {
        RenderPipeline {
            provider,
            cache,
            storage,
            budget,
        }
    }

    /// Run the full pipeline for `org_id` and a validated `request`.
    pub async fn render(&self, org_id: &str, request: RenderRequest) -> Result<RenderResult, SgdError> {
        let trace = Trace::new("render");

        let validate_span = trace.start_span("validate");
        let request = match request.validate_and_sanitize() {
            Ok(r) => {
                validate_span.finish(SpanStatus::Ok);
                r
            }
            Err(e) => {
                validate_span.finish(SpanStatus::Error);
                return Err(e);
            }
        };

        let budget_span = trace.start_span("budget_precheck");
        let precheck = self.budget.check(org_id);
        if precheck.is_exceeded {
            budget_span.finish(SpanStatus::Error);
            return Err(SgdError::BudgetExceeded {
                org_id: org_id.to_string(),
                retry_after_seconds: precheck.retry_after_seconds.unwrap_or(86_400),
            });
        }
        budget_span.finish(SpanStatus::Ok);

        let mut model_route = Vec::new();

        let plan = self.plan(&request, &trace, &mut model_route).await?;
        let (merged, guardrails_ok, violations) = self.enforce_canon(org_id, &request, &trace).await;
        let images = self
            .generate(&request, &plan, &merged, &trace, &mut model_route)
            .await?;
        let assets = self.store(org_id, &request, images, StorageArea::Public).await?;
        let externally_verified = self
            .critique(&request, &violations, &trace, &mut model_route)
            .await;

        let declared = assets.iter().any(|a| a.synthid.present);
        let verified_by = if externally_verified {
            VerifiedBy::External
        } else if declared {
            VerifiedBy::Declared
        } else {
            VerifiedBy::None
        };

        let snapshot = trace.snapshot();
        let status = self.budget.track(
            org_id,
            snapshot.total_cost_usd,
            model_route.last().map(String::as_str).unwrap_or("unknown"),
            "render",
            0,
            0,
        );
        // The call that pushes spend over budget is still the last permitted
        // one for the day — this request already succeeded, so its result
        // is returned regardless of `status.is_exceeded`.
        if status.is_exceeded {
            tracing::info!(org_id, "render pushed daily spend over budget");
        }

        Ok(RenderResult {
            assets,
            audit: Audit {
                trace_id: snapshot.id,
                model_route,
                cost_usd: snapshot.total_cost_usd,
                guardrails_ok,
                verified_by,
            },
        })
    }

    async fn plan(
        &self,
        request: &RenderRequest,
        trace: &Trace,
        model_route: &mut Vec<String>,
    ) -> Result<RenderPlan, SgdError> {
        let span = trace.start_span("plan");
        let (project_id, instruction, constraints) = request.plan_cache_parts();
        let cache_key = Cache::derive_key(&["plan", &project_id, &instruction, &constraints]);

        let captured: Arc<Mutex<Option<CapturedCall>>> = Arc::new(Mutex::new(None));
        let provider = self.provider.clone();
        let payload = serde_json::json!({
            "messages": [
                {
                    "role": "system",
                    "content": "Respond with strict JSON only: {\"summary\": string, \"elements\": [string]}. No prose, no code fences.",
                },
                {"role": "user", "content": instruction},
            ],
        });

        let captured_for_factory = captured.clone();
        let plan_result = self
            .cache
            .get_or_compute(&cache_key, PLAN_CACHE_TTL, move || {
                let provider = provider.clone();
                let payload = payload.clone();
                let captured = captured_for_factory.clone();
                async move {
                    let (response, record) = provider
                        .execute(ProviderTask::Planner, payload)
                        .await
                        .map_err(|e| e.to_string())?;
                    let raw_text = message_content(&response.body);
                    let plan: RenderPlan = parse_strict_json(&raw_text)?;
                    *captured.lock().expect("captured mutex poisoned") = Some(CapturedCall { record, raw_text });
                    Ok(plan)
                }
            })
            .await;

        let plan = match plan_result {
            Ok(plan) => plan,
            Err(e) => {
                span.finish(SpanStatus::Error);
                return Err(SgdError::validation(format!("planner returned invalid JSON: {e}")));
            }
        };

        if let Some(call) = captured.lock().expect("captured mutex poisoned").take() {
            model_route.push(call.record.model.clone());
            span.record_llm_call(LlmCall::new(
                call.record.model,
                "planner",
                &instruction,
                &call.raw_text,
                call.record.prompt_tokens,
                call.record.completion_tokens,
                call.record.latency.as_millis() as u64,
                call.record.cost_usd,
            ));
        }
        span.finish(SpanStatus::Ok);
        Ok(plan)
    }

    async fn enforce_canon(
        &self,
        org_id: &str,
        request: &RenderRequest,
        trace: &Trace,
    ) -> (MergedConstraints, bool, Vec<String>) {
        let span = trace.start_span("canon_enforcement");
        let key = Cache::derive_key(&["canon", org_id, &request.project_id]);

        let (canon, guardrails_ok) = match self.cache.peek::<BrandCanon>(&key).await {
            Ok(Some(canon)) => (canon, true),
            Ok(None) => {
                tracing::warn!(org_id, project_id = %request.project_id, "no brand canon cached, using conservative default");
                (BrandCanon::conservative_default(), false)
            }
            Err(error) => {
                tracing::warn!(org_id, %error, "canon lookup failed, using conservative default");
                (BrandCanon::conservative_default(), false)
            }
        };

        let merged = canon.merge_request_constraints(&request.constraints);
        let violations = canon.detect_violations(&request.constraints);
        if !violations.is_empty() {
            span.set_meta("violations", violations.join("; "));
        }
        span.finish(if guardrails_ok { SpanStatus::Ok } else { SpanStatus::Error });
        (merged, guardrails_ok, violations)
    }

    async fn generate(
        &self,
        request: &RenderRequest,
        plan: &RenderPlan,
        merged: &MergedConstraints,
        trace: &Trace,
        model_route: &mut Vec<String>,
    ) -> Result<Vec<GeneratedImage>, SgdError> {
        let span = trace.start_span("generate");
        let prompt = enhanced_prompt(request, plan, merged);
        let payload = serde_json::json!({
            "prompt": prompt,
            "count": request.outputs.count,
            "width": request.outputs.width,
            "height": request.outputs.height,
            "format": request.outputs.format.extension(),
        });

        let (response, record) = match self.provider.execute(ProviderTask::Image, payload).await {
            Ok(pair) => pair,
            Err(error) => {
                span.finish(SpanStatus::Error);
                return Err(SgdError::ProviderError {
                    task: "image".to_string(),
                    cause: error.to_string(),
                });
            }
        };

        let parsed: ImageGenResponse = match serde_json::from_value(response.body.clone()) {
            Ok(parsed) => parsed,
            Err(e) => {
                span.finish(SpanStatus::Error);
                return Err(SgdError::ProviderError {
                    task: "image".to_string(),
                    cause: format!("malformed image response: {e}"),
                });
            }
        };

        if parsed.images.is_empty() {
            span.finish(SpanStatus::Error);
            return Err(SgdError::ProviderError {
                task: "image".to_string(),
                cause: "provider returned zero images".to_string(),
            });
        }

        model_route.push(record.model.clone());
        span.record_llm_call(LlmCall::new(
            record.model,
            "image",
            &prompt,
            &format!("{} image(s)", parsed.images.len()),
            record.prompt_tokens,
            record.completion_tokens,
            record.latency.as_millis() as u64,
            record.cost_usd,
        ));
        span.finish(SpanStatus::Ok);
        Ok(parsed.images)
    }

    async fn store(
        &self,
        org_id: &str,
        request: &RenderRequest,
        images: Vec<GeneratedImage>,
        area: StorageArea,
    ) -> Result<Vec<Asset>, SgdError> {
        let mut assets = Vec::with_capacity(images.len());
        for image in images {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(image.data_base64)
                .map_err(|e| SgdError::Internal(format!("invalid base64 image data: {e}")))?;

            let tail = format!("{}.{}", Uuid::new_v4(), request.outputs.format.extension());
            let key = object_key(org_id, area, &request.project_id, &tail);

            self.storage
                .put(&key, &bytes, request.outputs.format.content_type())
                .await
                .map_err(|e| SgdError::StorageError { message: e.to_string() })?;
            let signed = self
                .storage
                .sign(&key, SIGNED_URL_TTL)
                .await
                .map_err(|e| SgdError::StorageError { message: e.to_string() })?;

            assets.push(Asset {
                url: signed.url,
                storage_key: key,
                synthid: SynthId {
                    present: image.synthid_present,
                    payload: image.synthid_payload,
                },
            });
        }
        Ok(assets)
    }

    /// Best-effort critique: failures are logged, never propagated, and
    /// never charged a retry — a bad critique does not fail the render.
    async fn critique(
        &self,
        request: &RenderRequest,
        violations: &[String],
        trace: &Trace,
        model_route: &mut Vec<String>,
    ) -> bool {
        let span = trace.start_span("critique");
        let payload = serde_json::json!({
            "messages": [
                {
                    "role": "system",
                    "content": "Respond with strict JSON only: {\"passed\": bool, \"notes\": [string], \"externally_verified\": bool}.",
                },
                {
                    "role": "user",
                    "content": format!(
                        "Instruction: {}\nKnown canon violations: {:?}",
                        request.prompts.instruction, violations
                    ),
                },
            ],
        });

        let (response, record) = match self.provider.execute(ProviderTask::Critic, payload).await {
            Ok(pair) => pair,
            Err(error) => {
                tracing::warn!(%error, "critique call failed, continuing without it");
                span.finish(SpanStatus::Error);
                return false;
            }
        };

        let raw_text = message_content(&response.body);
        let critique: Critique = match parse_strict_json(&raw_text) {
            Ok(c) => c,
            Err(error) => {
                tracing::warn!(%error, "critique returned invalid JSON, continuing without it");
                span.finish(SpanStatus::Error);
                return false;
            }
        };

        model_route.push(record.model.clone());
        span.record_llm_call(LlmCall::new(
            record.model,
            "critic",
            &request.prompts.instruction,
            &raw_text,
            record.prompt_tokens,
            record.completion_tokens,
            record.latency.as_millis() as u64,
            record.cost_usd,
        ));
        span.set_meta("passed", critique.passed.to_string());
        if !critique.notes.is_empty() {
            span.set_meta("notes", critique.notes.join("; "));
        }
        span.finish(SpanStatus::Ok);
        critique.externally_verified
    }

    /// Render a single, reduced-dimension preview image ahead of the final
    /// pass, stored under the previews area. Reuses the same plan and canon
    /// enforcement as the final render so the preview reflects the same
    /// prompt and brand constraints.
    async fn render_preview(&self, org_id: &str, request: &RenderRequest) -> Result<String, SgdError> {
        let trace = Trace::new("render_preview");
        let mut model_route = Vec::new();

        let plan = self.plan(request, &trace, &mut model_route).await?;
        let (merged, _guardrails_ok, _violations) = self.enforce_canon(org_id, request, &trace).await;

        let mut preview_request = request.clone();
        preview_request.outputs.count = 1;
        preview_request.outputs.width = (request.outputs.width / 4).max(64);
        preview_request.outputs.height = (request.outputs.height / 4).max(64);

        let images = self
            .generate(&preview_request, &plan, &merged, &trace, &mut model_route)
            .await?;
        let assets = self
            .store(org_id, &preview_request, images, StorageArea::Previews)
            .await?;
        assets
            .into_iter()
            .next()
            .map(|asset| asset.url)
            .ok_or_else(|| SgdError::Internal("preview render produced no image".to_string()))
    }
}

#[async_trait]
impl JobProcessor for RenderPipeline {
    async fn process(&self, job: Job) -> Result<JobOutcome, String> {
        let render_job: RenderJob =
            serde_json::from_value(job.payload.clone()).map_err(|e| format!("invalid render job payload: {e}"))?;

        match self.render(&render_job.org_id, render_job.request).await {
            Ok(result) => Ok(JobOutcome::Result(result)),
            Err(error) => Ok(JobOutcome::Error {
                error: error.category().to_string(),
                message: error.to_string(),
            }),
        }
    }

    async fn produce_preview(&self, job: &Job) -> Option<String> {
        let render_job: RenderJob = serde_json::from_value(job.payload.clone()).ok()?;
        match self.render_preview(&render_job.org_id, &render_job.request).await {
            Ok(url) => Some(url),
            Err(error) => {
                tracing::warn!(job_id = %job.id, %error, "preview render failed, continuing without it");
                None
            }
        }
    }
}
