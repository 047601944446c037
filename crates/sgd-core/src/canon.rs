//! `BrandCanon` — the normalized brand specification derived from ingested
//! evidence and enforced during generation.

use crate::error::SgdError;
use crate::request::{is_hex_color, Constraints};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Voice {
    pub tone: String,
    #[serde(default)]
    pub dos: Vec<String>,
    #[serde(default)]
    pub donts: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct StyleGuidelines {
    #[serde(default)]
    pub prefer_minimal: bool,
    #[serde(default)]
    pub avoid_gradients: bool,
    #[serde(default)]
    pub max_colors: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct BrandCanon {
    #[serde(default)]
    pub palette_hex: Vec<String>,
    #[serde(default)]
    pub fonts: Vec<String>,
    #[serde(default)]
    pub voice: Voice,
    pub logo_safe_zone_pct: u32,
    #[serde(default)]
    pub style_guidelines: StyleGuidelines,
}

impl BrandCanon {
    /// A conservative canon used when no canon can be loaded or derived,
    /// per the render pipeline's documented fallback (marks `guardrails_ok=false`
    /// at the call site, not here — this type only carries the data).
    pub fn conservative_default() -> Self {
        BrandCanon {
            palette_hex: vec!["#000000".into(), "#ffffff".into()],
            fonts: vec![],
            voice: Voice {
                tone: "neutral".into(),
                dos: vec![],
                donts: vec![],
            },
            logo_safe_zone_pct: 10,
            style_guidelines: StyleGuidelines {
                prefer_minimal: true,
                avoid_gradients: true,
                max_colors: Some(4),
            },
        }
    }

    pub fn validate(&self) -> Result<(), SgdError> {
        for hex in &self.palette_hex {
            if !is_hex_color(hex) {
                return Err(SgdError::validation_field(
                    format!("invalid hex color in canon: {hex}"),
                    "palette_hex",
                ));
            }
        }
        if self.logo_safe_zone_pct > 40 {
            return Err(SgdError::validation_field(
                "logo_safe_zone_pct must be 0-40",
                "logo_safe_zone_pct",
            ));
        }
        Ok(())
    }

    /// Merge request constraints into this canon. The canon wins on the
    /// core brand elements (palette, fonts, voice is not request-overridable
    /// at all); the request may only narrow the safe zone further.
    pub fn merge_request_constraints(&self, request: &Constraints) -> MergedConstraints {
        let palette_hex = if self.palette_hex.is_empty() {
            request.palette_hex.clone()
        } else {
            self.palette_hex.clone()
        };
        let fonts = if self.fonts.is_empty() {
            request.fonts.clone()
        } else {
            self.fonts.clone()
        };
        let safe_zone = request
            .logo_safe_zone_pct
            .map(|req_pct| req_pct.min(self.logo_safe_zone_pct))
            .unwrap_or(self.logo_safe_zone_pct);

        MergedConstraints {
            palette_hex,
            fonts,
            logo_safe_zone_pct: safe_zone,
        }
    }

    /// Detect constraint violations against this canon: colors/fonts in the
    /// request that are not present in the canon, or a safe zone narrower
    /// than the canon requires.
    pub fn detect_violations(&self, request: &Constraints) -> Vec<String> {
        let mut violations = Vec::new();
        if !self.palette_hex.is_empty() {
            for color in &request.palette_hex {
                if !self.palette_hex.iter().any(|c| c.eq_ignore_ascii_case(color)) {
                    violations.push(format!("color not in brand canon: {color}"));
                }
            }
        }
        if !self.fonts.is_empty() {
            for font in &request.fonts {
                if !self.fonts.iter().any(|f| f.eq_ignore_ascii_case(font)) {
                    violations.push(format!("font not in brand canon: {font}"));
                }
            }
        }
        if let Some(req_pct) = request.logo_safe_zone_pct
            && req_pct < self.logo_safe_zone_pct
        {
            violations.push(format!(
                "requested safe zone {req_pct}% below canon minimum {}%",
                self.logo_safe_zone_pct
            ));
        }
        violations
    }
}

#[derive(Debug, Clone)]
pub struct MergedConstraints {
    pub palette_hex: Vec<String>,
    pub fonts: Vec<String>,
    pub logo_safe_zone_pct: u32,
}
