//! `RenderResult` — the terminal output of a successful render pipeline run.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum VerifiedBy {
    Declared,
    External,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SynthId {
    pub present: bool,
    pub payload: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Asset {
    pub url: String,
    pub storage_key: String,
    pub synthid: SynthId,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Audit {
    pub trace_id: Uuid,
    pub model_route: Vec<String>,
    pub cost_usd: f64,
    pub guardrails_ok: bool,
    pub verified_by: VerifiedBy,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RenderResult {
    pub assets: Vec<Asset>,
    pub audit: Audit,
}
