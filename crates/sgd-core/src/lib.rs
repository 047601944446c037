// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared data model and error taxonomy consumed by every crate in the
//! design-generation core: request/result/job/canon/evidence types, content
//! hashing, and the typed error enum components raise and the API layer
//! translates to HTTP.

pub mod canon;
pub mod error;
pub mod evidence;
pub mod hash;
pub mod job;
pub mod request;
pub mod result;

pub use canon::{BrandCanon, MergedConstraints, StyleGuidelines, Voice};
pub use error::{ErrorCategory, SgdError, SgdResult};
pub use evidence::{EvidencePayload, EvidenceVector};
pub use hash::{content_hash, hex_sha256, keyed_hash};
pub use job::{Job, JobOutcome, JobState};
pub use request::{Constraints, ImageFormat, Outputs, Prompts, RenderRequest, Task};
pub use result::{Asset, Audit, RenderResult, SynthId, VerifiedBy};
