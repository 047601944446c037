//! `EvidenceVector` — embedded brand evidence, never mutated after ingest.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EvidencePayload {
    pub text_snippet: String,
    pub asset_ref: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EvidenceVector {
    pub id: Uuid,
    pub project_id: String,
    pub org_id: String,
    pub vector: Vec<f32>,
    pub payload: EvidencePayload,
}

impl EvidenceVector {
    /// `payload.text_snippet` is capped at 1kB per the ingest contract.
    pub fn truncate_snippet(mut self) -> Self {
        const MAX_BYTES: usize = 1024;
        if self.payload.text_snippet.len() > MAX_BYTES {
            let mut end = MAX_BYTES;
            while !self.payload.text_snippet.is_char_boundary(end) {
                end -= 1;
            }
            self.payload.text_snippet.truncate(end);
        }
        self
    }

    /// Per-org collection name, sanitized and length-bounded:
    /// `brand_assets_{org_id}`, hashed if it would exceed 63 chars.
    pub fn collection_name(org_id: &str) -> String {
        let sanitized: String = org_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        let name = format!("brand_assets_{sanitized}");
        if name.len() <= 63 {
            name
        } else {
            let hash = crate::hash::hex_sha256(org_id.as_bytes());
            format!("brand_assets_{}", &hash[..32])
        }
    }
}
