//! Content fingerprints for generation requests.
//!
//! A fingerprint is the SHA-256 of the request's defining parameters, so two
//! identical requests always land on the same upstream prompt id and the same
//! output filenames. The short [`RequestId`] is what appears in filenames.

use std::fmt;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::job::QueueRequest;

/// Length of the filename-facing id. Collisions inside this namespace are not guarded against.
pub const REQUEST_ID_LEN: usize = 8;

/// Hex digits in a full SHA-256 fingerprint.
pub const FINGERPRINT_LEN: usize = 64;

const ABSENT: &str = "None";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl Fingerprint {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Accept a client-supplied id: at least a full request id worth of hex, at most a
    /// whole fingerprint. Shorter ids would match unrelated filename fields.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if !(REQUEST_ID_LEN..=FINGERPRINT_LEN).contains(&raw.len()) {
            bail!(
                "prompt_id must be {REQUEST_ID_LEN}..={FINGERPRINT_LEN} hex characters, got {}",
                raw.len()
            );
        }
        if !raw.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!("prompt_id must be hexadecimal");
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }

    pub fn of(request: &QueueRequest) -> Self {
        let canonical = canonical_parameters(request);
        let digest = Sha256::digest(canonical.as_bytes());
        Self(format!("{digest:x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn request_id(&self) -> RequestId {
        RequestId::from_prompt_id(&self.0)
    }
}

impl RequestId {
    pub fn from_prompt_id(prompt_id: &str) -> Self {
        Self(prompt_id.chars().take(REQUEST_ID_LEN).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `-workflow-model-prompt-seed-width-height-upscale-step-cfg-seconds-`
pub fn canonical_parameters(request: &QueueRequest) -> String {
    let fields = [
        request.workflow.clone(),
        render_opt(request.model.as_deref()),
        request.prompt.clone(),
        render_opt(request.seed),
        render_opt(request.width),
        render_opt(request.height),
        render_opt_float(request.upscale_factor),
        render_opt(request.step),
        render_opt_float(request.cfg),
        render_opt(request.seconds),
    ];

    let mut canonical = String::from("-");
    for field in &fields {
        canonical.push_str(field);
        canonical.push('-');
    }
    canonical
}

fn render_opt<T: fmt::Display>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| ABSENT.to_string())
}

/// Integral floats keep their `.0` so `2.0` and `2` never alias.
fn render_opt_float(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() && v.fract() == 0.0 => format!("{v:.1}"),
        Some(v) => v.to_string(),
        None => ABSENT.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn base_request() -> QueueRequest {
        QueueRequest {
            workflow: "t2i".to_string(),
            prompt: "a cat".to_string(),
            seed: Some(42),
            width: Some(512),
            height: Some(512),
            ..QueueRequest::default()
        }
    }

    #[test]
    fn canonical_string_renders_absent_values() {
        let canonical = canonical_parameters(&base_request());
        assert_eq!(
            canonical,
            "-t2i-None-a cat-42-512-512-None-None-None-None-"
        );
    }

    #[test]
    fn floats_keep_decimal_point() {
        let request = QueueRequest {
            upscale_factor: Some(2.0),
            cfg: Some(7.5),
            ..base_request()
        };
        let canonical = canonical_parameters(&request);
        assert_eq!(canonical, "-t2i-None-a cat-42-512-512-2.0-None-7.5-None-");
    }

    #[test]
    fn fingerprint_is_stable() {
        let request = base_request();
        let first = Fingerprint::of(&request);
        for _ in 0..10 {
            assert_eq!(Fingerprint::of(&request), first);
        }
        assert_eq!(first.as_str().len(), 64);
        assert!(first.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn every_field_changes_the_fingerprint() {
        let base = base_request();
        let variants = vec![
            base.clone(),
            QueueRequest { workflow: "t2i_wan22".into(), ..base.clone() },
            QueueRequest { model: Some("sd15.safetensors".into()), ..base.clone() },
            QueueRequest { model: Some(String::new()), ..base.clone() },
            QueueRequest { prompt: "a cat ".into(), ..base.clone() },
            QueueRequest { prompt: "A cat".into(), ..base.clone() },
            QueueRequest { seed: None, ..base.clone() },
            QueueRequest { seed: Some(43), ..base.clone() },
            QueueRequest { width: Some(768), ..base.clone() },
            QueueRequest { height: None, ..base.clone() },
            QueueRequest { upscale_factor: Some(1.5), ..base.clone() },
            QueueRequest { upscale_factor: Some(2.0), ..base.clone() },
            QueueRequest { step: Some(20), ..base.clone() },
            QueueRequest { cfg: Some(8.0), ..base.clone() },
            QueueRequest { seconds: Some(3), ..base.clone() },
            QueueRequest { seconds: Some(0), ..base.clone() },
        ];

        let fingerprints: HashSet<Fingerprint> = variants.iter().map(Fingerprint::of).collect();
        assert_eq!(fingerprints.len(), variants.len());
    }

    #[test]
    fn style_and_negative_prompt_are_not_fingerprinted() {
        let base = base_request();
        let styled = QueueRequest {
            style: Some("anime".into()),
            negative_prompt: Some("blurry".into()),
            ..base.clone()
        };
        assert_eq!(Fingerprint::of(&base), Fingerprint::of(&styled));
    }

    #[test]
    fn request_id_is_eight_char_prefix() {
        let fingerprint = Fingerprint::of(&base_request());
        let request_id = fingerprint.request_id();
        assert_eq!(request_id.as_str().len(), REQUEST_ID_LEN);
        assert!(fingerprint.as_str().starts_with(request_id.as_str()));
    }

    #[test]
    fn short_prompt_ids_are_used_whole() {
        assert_eq!(RequestId::from_prompt_id("abc").as_str(), "abc");
    }

    #[test]
    fn parse_rejects_ids_shorter_than_a_request_id() {
        for raw in ["", "0", "abcdef0", "   "] {
            assert!(Fingerprint::parse(raw).is_err(), "{raw:?} should be rejected");
        }
    }

    #[test]
    fn parse_rejects_non_hex_and_oversized_ids() {
        assert!(Fingerprint::parse("abcdefg1").is_err());
        assert!(Fingerprint::parse("../../etc").is_err());
        assert!(Fingerprint::parse(&"a".repeat(FINGERPRINT_LEN + 1)).is_err());
    }

    #[test]
    fn parse_accepts_prefixes_and_full_fingerprints() {
        let fingerprint = Fingerprint::of(&base_request());
        assert_eq!(Fingerprint::parse(fingerprint.as_str()).expect("full"), fingerprint);

        let short = Fingerprint::parse(" ABCDEF01 ").expect("short");
        assert_eq!(short.as_str(), "abcdef01");
        assert_eq!(short.request_id().as_str(), "abcdef01");
    }
}
