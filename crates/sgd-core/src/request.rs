//! `RenderRequest` and its validation/sanitization rules.

use crate::error::SgdError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Banned terms enforced at validation time. A real deployment would load
/// this list from config; a small static list keeps the core's contract
/// testable without external policy infrastructure.
const BANNED_TERMS: &[&str] = &["violence", "gore", "weapon instructions"];

const MAX_REFERENCES: usize = 8;
const MAX_PALETTE: usize = 12;
const MAX_FONTS: usize = 6;
const MAX_PIXELS: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    Create,
    Edit,
    Variations,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpg,
    Webp,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpg => "jpg",
            ImageFormat::Webp => "webp",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpg => "image/jpeg",
            ImageFormat::Webp => "image/webp",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Prompts {
    pub task: Task,
    pub instruction: String,
    #[serde(default)]
    pub references: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Outputs {
    pub count: u32,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Constraints {
    #[serde(default)]
    pub palette_hex: Vec<String>,
    #[serde(default)]
    pub fonts: Vec<String>,
    #[serde(default)]
    pub logo_safe_zone_pct: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RenderRequest {
    pub project_id: String,
    pub prompts: Prompts,
    pub outputs: Outputs,
    #[serde(default)]
    pub constraints: Constraints,
}

impl RenderRequest {
    /// Validate structural and business-rule constraints, then sanitize
    /// free-text fields (trim whitespace). Returns the sanitized request.
    ///
    /// Order matters: content-policy checks run before generic validation
    /// failures are returned, matching the API's documented precedence
    /// (content policy is a 400, plain validation is a 422, and a banned
    /// term should never be masked by an unrelated field error).
    pub fn validate_and_sanitize(mut self) -> Result<Self, SgdError> {
        self.project_id = self.project_id.trim().to_string();
        self.prompts.instruction = self.prompts.instruction.trim().to_string();

        if self.project_id.is_empty() || self.project_id.len() > 64 {
            return Err(SgdError::validation_field(
                "project_id must be 1-64 characters",
                "project_id",
            ));
        }

        self.check_content_policy()?;

        let len = self.prompts.instruction.chars().count();
        if !(5..=2000).contains(&len) {
            return Err(SgdError::validation_field(
                "instruction must be 5-2000 characters",
                "prompts.instruction",
            ));
        }

        if self.prompts.references.len() > MAX_REFERENCES {
            return Err(SgdError::validation_field(
                format!("at most {MAX_REFERENCES} references allowed"),
                "prompts.references",
            ));
        }
        for r in &self.prompts.references {
            if !r.starts_with("https://") {
                return Err(SgdError::ContentPolicyViolation {
                    reason: format!("reference url must use https: {r}"),
                });
            }
        }

        if !(1..=6).contains(&self.outputs.count) {
            return Err(SgdError::validation_field(
                "outputs.count must be 1-6",
                "outputs.count",
            ));
        }
        if self.outputs.width < 64 || self.outputs.height < 64 {
            return Err(SgdError::validation_field(
                "outputs dimensions must be >= 64px",
                "outputs.dimensions",
            ));
        }
        if self.outputs.width.saturating_mul(self.outputs.height) > MAX_PIXELS {
            return Err(SgdError::validation_field(
                "outputs dimensions exceed 16 megapixels",
                "outputs.dimensions",
            ));
        }

        if self.constraints.palette_hex.len() > MAX_PALETTE {
            return Err(SgdError::validation_field(
                format!("at most {MAX_PALETTE} palette colors allowed"),
                "constraints.palette_hex",
            ));
        }
        for hex in &self.constraints.palette_hex {
            if !is_hex_color(hex) {
                return Err(SgdError::validation_field(
                    format!("invalid hex color: {hex}"),
                    "constraints.palette_hex",
                ));
            }
        }
        if self.constraints.fonts.len() > MAX_FONTS {
            return Err(SgdError::validation_field(
                format!("at most {MAX_FONTS} fonts allowed"),
                "constraints.fonts",
            ));
        }
        if let Some(pct) = self.constraints.logo_safe_zone_pct
            && pct > 40
        {
            return Err(SgdError::validation_field(
                "logo_safe_zone_pct must be 0-40",
                "constraints.logo_safe_zone_pct",
            ));
        }

        Ok(self)
    }

    fn check_content_policy(&self) -> Result<(), SgdError> {
        let lower = self.prompts.instruction.to_lowercase();
        for term in BANNED_TERMS {
            if lower.contains(term) {
                return Err(SgdError::ContentPolicyViolation {
                    reason: format!("banned term: {term}"),
                });
            }
        }
        Ok(())
    }

    /// Stable, order-sensitive canonical key used for plan caching
    /// (`project_id`, `instruction`, and constraints, per the render
    /// pipeline's plan-cache key).
    pub fn plan_cache_parts(&self) -> (String, String, String) {
        let canon_constraints = serde_json::to_string(&self.constraints)
            .unwrap_or_default();
        (
            self.project_id.clone(),
            self.prompts.instruction.clone(),
            canon_constraints,
        )
    }
}

/// `^#[0-9A-Fa-f]{6}$`
pub fn is_hex_color(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 7 && bytes[0] == b'#' && bytes[1..].iter().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request() -> RenderRequest {
        RenderRequest {
            project_id: "p1".into(),
            prompts: Prompts {
                task: Task::Create,
                instruction: "Create a modern banner for a tech startup".into(),
                references: vec![],
            },
            outputs: Outputs {
                count: 1,
                format: ImageFormat::Png,
                width: 512,
                height: 512,
            },
            constraints: Constraints::default(),
        }
    }

    #[test]
    fn valid_request_passes() {
        assert!(base_request().validate_and_sanitize().is_ok());
    }

    #[test]
    fn banned_term_rejected() {
        let mut req = base_request();
        req.prompts.instruction = "A banner depicting violence in the city".into();
        let err = req.validate_and_sanitize().unwrap_err();
        assert!(matches!(err, SgdError::ContentPolicyViolation { .. }));
    }

    #[test]
    fn non_https_reference_rejected() {
        let mut req = base_request();
        req.prompts.references = vec!["http://example.com/a.png".into()];
        let err = req.validate_and_sanitize().unwrap_err();
        assert!(matches!(err, SgdError::ContentPolicyViolation { .. }));
    }

    #[test]
    fn too_many_megapixels_rejected() {
        let mut req = base_request();
        req.outputs.width = 8192;
        req.outputs.height = 8192;
        let err = req.validate_and_sanitize().unwrap_err();
        assert!(matches!(err, SgdError::Validation { .. }));
    }

    #[test]
    fn instruction_too_short_rejected() {
        let mut req = base_request();
        req.prompts.instruction = "hi".into();
        assert!(req.validate_and_sanitize().is_err());
    }

    #[test]
    fn invalid_hex_rejected() {
        let mut req = base_request();
        req.constraints.palette_hex = vec!["blue".into()];
        assert!(req.validate_and_sanitize().is_err());
    }

    #[test]
    fn hex_color_matcher() {
        assert!(is_hex_color("#1a2b3c"));
        assert!(!is_hex_color("#1a2b3"));
        assert!(!is_hex_color("1a2b3c"));
        assert!(!is_hex_color("#gggggg"));
    }
}
