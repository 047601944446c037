// SPDX-License-Identifier: MIT OR Apache-2.0
//! Security scanning for ingested content: magic-byte MIME detection,
//! declared/actual MIME and extension checks, executable-signature
//! detection, antivirus scanning via a pluggable [`MalwareScanner`], and
//! EXIF stripping for images.

use std::io::Cursor;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const BLOCKED_EXTENSIONS: &[&str] = &[
    ".exe", ".dll", ".scr", ".vbs", ".js", ".jar", ".bat", ".cmd", ".com", ".pif",
    ".application", ".gadget", ".msi", ".msp", ".hta", ".cpl", ".msc", ".reg", ".app", ".sh",
];

const ALLOWED_MIMES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/webp",
    "image/gif",
    "application/pdf",
    "text/plain",
];

/// Magic-byte signatures for executables/scripts — never promoted to
/// public storage, always quarantined under a content-addressed key.
const EXECUTABLE_SIGNATURES: &[(&[u8], &str)] = &[
    (b"MZ", "Windows PE executable"),
    (b"\x7fELF", "ELF executable"),
    (b"\xca\xfe\xba\xbe", "Mach-O / Java class (fat binary magic)"),
    (b"#!/", "shebang script"),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub is_safe: bool,
    pub threats: Vec<String>,
    pub declared_mime: Option<String>,
    pub actual_mime: String,
    pub exif_removed: bool,
    pub file_hash: String,
    pub scan_details: std::collections::BTreeMap<String, String>,
}

impl ScanResult {
    pub fn has_executable_signature(&self) -> bool {
        self.threats.iter().any(|t| t.starts_with("executable signature"))
    }
}

/// Antivirus scanner, pluggable so tests and local development can run
/// without a ClamAV install. A production deployment without a real
/// implementation wired in must fail closed — see [`require_scanner_in_production`].
pub trait MalwareScanner: Send + Sync {
    /// Returns detected threat descriptions; empty means clean.
    fn scan(&self, content: &[u8]) -> Vec<String>;
}

pub struct NoopScanner;

impl MalwareScanner for NoopScanner {
    fn scan(&self, _content: &[u8]) -> Vec<String> {
        Vec::new()
    }
}

/// Guards against running [`NoopScanner`] (or no scanner) outside
/// dev/test/local environments, mirroring the original's hard requirement
/// that ClamAV be present in production.
pub fn require_scanner_in_production(service_env: &str, scanner_is_real: bool) -> Result<(), String> {
    let is_dev_like = matches!(service_env, "dev" | "test" | "development" | "local");
    if !is_dev_like && !scanner_is_real {
        return Err("an antivirus scanner is required outside dev/test/local environments".to_string());
    }
    Ok(())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn detect_mime(content: &[u8]) -> &'static str {
    if content.starts_with(b"\x89PNG") {
        "image/png"
    } else if content.starts_with(b"\xff\xd8\xff") {
        "image/jpeg"
    } else if content.starts_with(b"RIFF") && content.len() >= 12 && &content[8..12] == b"WEBP" {
        "image/webp"
    } else if content.starts_with(b"GIF8") {
        "image/gif"
    } else if content.starts_with(b"%PDF") {
        "application/pdf"
    } else {
        "application/octet-stream"
    }
}

fn extension_of(filename: &str) -> String {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| format!(".{}", ext.to_lowercase()))
        .unwrap_or_default()
}

fn is_acceptable_mime_mismatch(declared: &str, actual: &str) -> bool {
    matches!(
        (declared, actual),
        ("text/plain", "text/html")
            | ("text/html", "text/plain")
            | ("image/jpg", "image/jpeg")
            | ("image/jpeg", "image/jpg")
    ) || declared == "application/octet-stream"
        || actual == "application/octet-stream"
}

fn executable_signature(content: &[u8]) -> Option<&'static str> {
    EXECUTABLE_SIGNATURES
        .iter()
        .find(|(sig, _)| content.starts_with(sig))
        .map(|(_, name)| *name)
}

pub struct SecurityScanner {
    malware: Box<dyn MalwareScanner>,
}

impl SecurityScanner {
    pub fn new(malware: Box<dyn MalwareScanner>) -> Self {
        SecurityScanner { malware }
    }

    /// Scan `content`, returning the scan result and, for images, the bytes
    /// with EXIF metadata stripped (identical to `content` when no EXIF was
    /// present or the format is unsupported for re-encoding).
    pub fn scan(
        &self,
        content: &[u8],
        declared_mime: Option<&str>,
        filename: Option<&str>,
    ) -> (ScanResult, Vec<u8>) {
        let mut threats = Vec::new();
        let mut scan_details = std::collections::BTreeMap::new();

        let file_hash = sha256_hex(content);
        scan_details.insert("size".to_string(), content.len().to_string());

        if let Some(name) = filename {
            let ext = extension_of(name);
            if BLOCKED_EXTENSIONS.contains(&ext.as_str()) {
                threats.push(format!("blocked file extension: {ext}"));
            }
        }

        if let Some(sig_name) = executable_signature(content) {
            threats.push(format!("executable signature: {sig_name}"));
        }

        let actual_mime = detect_mime(content);
        scan_details.insert("actual_mime".to_string(), actual_mime.to_string());

        if let Some(declared) = declared_mime
            && declared != actual_mime
            && !is_acceptable_mime_mismatch(declared, actual_mime)
        {
            threats.push(format!("MIME mismatch: declared={declared}, actual={actual_mime}"));
        }

        if !ALLOWED_MIMES.contains(&actual_mime) {
            threats.push(format!("disallowed MIME type: {actual_mime}"));
        }

        threats.extend(self.malware.scan(content));

        let mut exif_removed = false;
        let mut output = content.to_vec();
        if actual_mime.starts_with("image/") && threats.is_empty() {
            match strip_exif(content, actual_mime) {
                Ok(Some(stripped)) => {
                    exif_removed = true;
                    output = stripped;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "failed to process image for EXIF stripping");
                }
            }
        }

        let is_safe = threats.is_empty();
        (
            ScanResult {
                is_safe,
                threats,
                declared_mime: declared_mime.map(String::from),
                actual_mime: actual_mime.to_string(),
                exif_removed,
                file_hash,
                scan_details,
            },
            output,
        )
    }
}

/// Re-encode the image with metadata stripped. Returns `Ok(None)` when the
/// format can't be round-tripped by the `image` crate's decoder/encoder
/// pair (treated as "nothing to strip", not a failure).
fn strip_exif(content: &[u8], mime: &str) -> Result<Option<Vec<u8>>, image::ImageError> {
    let format = match mime {
        "image/png" => image::ImageFormat::Png,
        "image/jpeg" => image::ImageFormat::Jpeg,
        "image/webp" => image::ImageFormat::WebP,
        "image/gif" => image::ImageFormat::Gif,
        _ => return Ok(None),
    };

    let img = image::load_from_memory_with_format(content, format)?;
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, format)?;
    Ok(Some(buf.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner() -> SecurityScanner {
        SecurityScanner::new(Box::new(NoopScanner))
    }

    #[test]
    fn clean_png_bytes_pass() {
        let png = image_bytes_png();
        let (result, _) = scanner().scan(&png, Some("image/png"), Some("a.png"));
        assert!(result.is_safe);
        assert_eq!(result.actual_mime, "image/png");
    }

    #[test]
    fn blocked_extension_is_flagged() {
        let (result, _) = scanner().scan(b"plain text", Some("text/plain"), Some("evil.exe"));
        assert!(!result.is_safe);
        assert!(result.threats.iter().any(|t| t.contains("blocked file extension")));
    }

    #[test]
    fn executable_signature_is_detected_and_never_safe() {
        let mz_bytes = b"MZ\x90\x00\x03\x00\x00\x00\x04\x00\x00\x00";
        let (result, _) = scanner().scan(mz_bytes, None, Some("innocuous.png"));
        assert!(!result.is_safe);
        assert!(result.has_executable_signature());
    }

    #[test]
    fn elf_signature_is_detected() {
        let elf = b"\x7fELF\x02\x01\x01\x00";
        let (result, _) = scanner().scan(elf, None, None);
        assert!(!result.is_safe);
        assert!(result.has_executable_signature());
    }

    #[test]
    fn mime_mismatch_is_flagged_unless_acceptable() {
        let png = image_bytes_png();
        let (result, _) = scanner().scan(&png, Some("application/pdf"), None);
        assert!(!result.is_safe);
        assert!(result.threats.iter().any(|t| t.contains("MIME mismatch")));
    }

    #[test]
    fn disallowed_mime_is_flagged() {
        let (result, _) = scanner().scan(b"random bytes, no known signature", None, None);
        assert!(!result.is_safe);
        assert!(result.threats.iter().any(|t| t.contains("disallowed MIME type")));
    }

    #[test]
    fn file_hash_is_sha256_of_original_content() {
        let (result, _) = scanner().scan(b"hello", None, None);
        assert_eq!(result.file_hash, sha256_hex(b"hello"));
    }

    #[test]
    fn production_without_real_scanner_is_rejected() {
        assert!(require_scanner_in_production("production", false).is_err());
        assert!(require_scanner_in_production("dev", false).is_ok());
        assert!(require_scanner_in_production("production", true).is_ok());
    }

    fn image_bytes_png() -> Vec<u8> {
        let img = image::RgbImage::new(2, 2);
        let mut buf = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }
}
