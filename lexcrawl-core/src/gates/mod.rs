//! Quality gates applied to every fetched artifact before it is accepted.
//!
//! The chain is ordered and short-circuits on the first failure with a
//! structured reason:
//!
//! 1. HTTP response - status, content length, response time.
//! 2. Payload type - magic bytes / decodability, size ceiling.
//! 3. Write integrity - on-disk size after fsync (enforced by the artifact
//!    store commit, surfaced here as [`FailureReason::SizeMismatch`]).
//! 4. Hash uniqueness - the catalog insert outcome; a conflict is the
//!    `duplicate` outcome, not a failure.
//!
//! Later gates (extraction confidence, metadata completeness, quality
//! score, upload verification) belong to the downstream pipeline; the
//! `file_storage.quality_tier` slot is left for them to fill.

use std::time::Duration;

use serde::Serialize;

use crate::config::GateConfig;

/// How a failure is treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Worth retrying with backoff within this run.
    Transient,
    /// The document stays failed for this run; no retry.
    Terminal,
}

/// Structured reason a document did not produce an accepted artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    HttpStatus { status: u16 },
    SlowResponse { elapsed_ms: u64, limit_ms: u64 },
    TooSmall { bytes: u64, min: u64 },
    TooLarge { bytes: u64, max: u64 },
    NotPdf,
    EmptyBody,
    MalformedText,
    Network { detail: String },
    RateLimitTimeout,
    WriteFailed { detail: String },
    SizeMismatch { expected: u64, actual: u64 },
    Persistence { detail: String },
    Unfetchable,
}

impl FailureReason {
    pub fn kind(&self) -> FailureKind {
        match self {
            FailureReason::HttpStatus { status } => match status {
                429 => FailureKind::Transient,
                500..=599 => FailureKind::Transient,
                _ => FailureKind::Terminal,
            },
            FailureReason::SlowResponse { .. }
            | FailureReason::Network { .. }
            | FailureReason::RateLimitTimeout
            | FailureReason::WriteFailed { .. }
            | FailureReason::SizeMismatch { .. }
            | FailureReason::Persistence { .. } => FailureKind::Transient,
            FailureReason::TooSmall { .. }
            | FailureReason::TooLarge { .. }
            | FailureReason::NotPdf
            | FailureReason::EmptyBody
            | FailureReason::MalformedText
            | FailureReason::Unfetchable => FailureKind::Terminal,
        }
    }

    /// Stable grouping key for the end-of-run failure summary.
    pub fn label(&self) -> &'static str {
        match self {
            FailureReason::HttpStatus { status } => match status {
                429 => "http_429",
                400..=499 => "http_4xx",
                500..=599 => "http_5xx",
                _ => "http_other",
            },
            FailureReason::SlowResponse { .. } => "slow_response",
            FailureReason::TooSmall { .. } => "too_small",
            FailureReason::TooLarge { .. } => "too_large",
            FailureReason::NotPdf => "not_pdf",
            FailureReason::EmptyBody => "empty_body",
            FailureReason::MalformedText => "malformed_text",
            FailureReason::Network { .. } => "network",
            FailureReason::RateLimitTimeout => "rate_limit_timeout",
            FailureReason::WriteFailed { .. } => "write_failed",
            FailureReason::SizeMismatch { .. } => "size_mismatch",
            FailureReason::Persistence { .. } => "persistence",
            FailureReason::Unfetchable => "unfetchable",
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FailureReason::HttpStatus { status: 429 })
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::HttpStatus { status } => {
                write!(f, "http status {status}")
            }
            FailureReason::SlowResponse {
                elapsed_ms,
                limit_ms,
            } => write!(
                f,
                "response took {elapsed_ms} ms (limit {limit_ms} ms)"
            ),
            FailureReason::TooSmall { bytes, min } => {
                write!(f, "payload {bytes} bytes below minimum {min}")
            }
            FailureReason::TooLarge { bytes, max } => {
                write!(f, "payload {bytes} bytes above maximum {max}")
            }
            FailureReason::NotPdf => {
                f.write_str("payload missing PDF magic bytes")
            }
            FailureReason::EmptyBody => f.write_str("empty response body"),
            FailureReason::MalformedText => {
                f.write_str("HTML payload is not decodable text")
            }
            FailureReason::Network { detail } => {
                write!(f, "network error: {detail}")
            }
            FailureReason::RateLimitTimeout => {
                f.write_str("rate limit acquisition timed out")
            }
            FailureReason::WriteFailed { detail } => {
                write!(f, "cache write failed: {detail}")
            }
            FailureReason::SizeMismatch { expected, actual } => write!(
                f,
                "staged file is {actual} bytes, expected {expected}"
            ),
            FailureReason::Persistence { detail } => {
                write!(f, "catalog write failed: {detail}")
            }
            FailureReason::Unfetchable => {
                f.write_str("url cannot yield a document")
            }
        }
    }
}

/// Payload shape the fetch expects, derived from the URL and response
/// headers before Gate 2 runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Pdf,
    Html,
}

impl PayloadKind {
    pub const fn extension(&self) -> &'static str {
        match self {
            PayloadKind::Pdf => "pdf",
            PayloadKind::Html => "html",
        }
    }
}

const PDF_MAGIC: &[u8] = b"%PDF-";

/// Gates 1-3, configured once and shared by every worker.
#[derive(Debug, Clone, Copy)]
pub struct QualityGates {
    min_bytes: u64,
    max_bytes: u64,
    max_response_time: Duration,
}

impl QualityGates {
    pub fn new(config: &GateConfig) -> Self {
        Self {
            min_bytes: config.min_bytes,
            max_bytes: config.max_bytes,
            max_response_time: config.max_response_time(),
        }
    }

    pub const fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Gate 1: the HTTP exchange itself. Any 2xx passes; everything else
    /// is a failure whose retry class follows from the status code.
    pub fn check_http(
        &self,
        status: u16,
        body_len: u64,
        elapsed: Duration,
    ) -> Option<FailureReason> {
        if !(200..300).contains(&status) {
            return Some(FailureReason::HttpStatus { status });
        }
        if elapsed > self.max_response_time {
            return Some(FailureReason::SlowResponse {
                elapsed_ms: elapsed.as_millis() as u64,
                limit_ms: self.max_response_time.as_millis() as u64,
            });
        }
        if body_len < self.min_bytes {
            return Some(FailureReason::TooSmall {
                bytes: body_len,
                min: self.min_bytes,
            });
        }
        None
    }

    /// Gate 2: payload shape. PDF payloads must open with the PDF magic;
    /// HTML payloads must be non-empty and decode as UTF-8 in the prefix.
    pub fn check_payload(
        &self,
        expected: PayloadKind,
        bytes: &[u8],
    ) -> Option<FailureReason> {
        if bytes.len() as u64 > self.max_bytes {
            return Some(FailureReason::TooLarge {
                bytes: bytes.len() as u64,
                max: self.max_bytes,
            });
        }
        match expected {
            PayloadKind::Pdf => {
                if !bytes.starts_with(PDF_MAGIC) {
                    return Some(FailureReason::NotPdf);
                }
            }
            PayloadKind::Html => {
                if bytes.is_empty() {
                    return Some(FailureReason::EmptyBody);
                }
                let prefix = &bytes[..bytes.len().min(4096)];
                if let Err(err) = std::str::from_utf8(prefix) {
                    // A multi-byte sequence cut at the prefix boundary is
                    // fine; reject only when the error sits inside it.
                    if prefix.len() - err.valid_up_to() > 3 {
                        return Some(FailureReason::MalformedText);
                    }
                }
            }
        }
        None
    }

    /// Gate 3: write integrity, evaluated against the staged file's size
    /// after fsync.
    pub fn check_write(
        &self,
        expected: u64,
        on_disk: u64,
    ) -> Option<FailureReason> {
        if expected != on_disk {
            return Some(FailureReason::SizeMismatch {
                expected,
                actual: on_disk,
            });
        }
        None
    }
}
