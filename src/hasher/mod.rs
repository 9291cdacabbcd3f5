//! Content fingerprinting
//!
//! A [`Fingerprint`] carries two SHA-256 digests of a fetched page:
//!
//! - `full_hash` over the canonical serialization (text, tags and stable
//!   attributes), which changes whenever visible content changes
//! - `structural_hash` over the tag skeleton only, which changes when the
//!   page layout changes
//!
//! Bodies that are not valid UTF-8, or whose content type is neither HTML
//! nor XML, are hashed as raw bytes and flagged as degraded.

mod normalize;

use crate::config::HasherConfig;
use crate::ConfigError;
use normalize::{canonicalize, NormalizationRules};
use regex::Regex;
use scraper::Html;
use sha2::{Digest, Sha256};

/// Hashes of one fetched page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub full_hash: String,
    /// `None` when the body could not be parsed
    pub structural_hash: Option<String>,
    /// Length of the raw body in bytes
    pub content_length: u64,
    pub parse_degraded: bool,
}

/// Computes page fingerprints under a fixed set of normalization rules
pub struct ContentHasher {
    rules: NormalizationRules,
}

impl ContentHasher {
    /// Builds a hasher from configuration, compiling the volatile patterns
    pub fn new(config: &HasherConfig) -> Result<Self, ConfigError> {
        let volatile_patterns = config
            .volatile_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    ConfigError::InvalidPattern(format!("volatile pattern '{}': {}", p, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            rules: NormalizationRules {
                ignore_script_content: config.ignore_script_content,
                volatile_attributes: config
                    .volatile_attributes
                    .iter()
                    .map(|a| a.trim().to_ascii_lowercase())
                    .collect(),
                volatile_patterns,
            },
        })
    }

    /// Fingerprints a response body
    ///
    /// Never fails: content that cannot be parsed yields a degraded
    /// fingerprint over the raw bytes.
    pub fn fingerprint(&self, body: &[u8], content_type: Option<&str>) -> Fingerprint {
        let content_length = body.len() as u64;

        let text = match (is_markup(content_type), std::str::from_utf8(body)) {
            (true, Ok(text)) => text,
            _ => {
                return Fingerprint {
                    full_hash: sha256_hex(body),
                    structural_hash: None,
                    content_length,
                    parse_degraded: true,
                }
            }
        };

        let document = Html::parse_document(text);
        let canonical = canonicalize(&document, &self.rules);

        Fingerprint {
            full_hash: sha256_hex(canonical.content.as_bytes()),
            structural_hash: Some(sha256_hex(canonical.skeleton.as_bytes())),
            content_length,
            parse_degraded: false,
        }
    }
}

/// HTML and XML are parsed; a missing content type is sniffed as markup
fn is_markup(content_type: Option<&str>) -> bool {
    match content_type {
        None => true,
        Some(ct) => {
            let mime = ct
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase();
            mime.is_empty() || mime.contains("html") || mime.contains("xml")
        }
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
