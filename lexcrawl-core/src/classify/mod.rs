//! URL classification ahead of any network I/O.
//!
//! Every candidate URL gets a verdict before it is handed to a worker:
//! plain HTTP (`Direct`), JS-required (`Rendered`), or structurally
//! incapable of yielding a document (`Unfetchable`). Rules are compiled
//! once at startup and evaluated in order; unknown URLs default to
//! `Direct` with a low-confidence flag.

use std::sync::atomic::{AtomicU64, Ordering};

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::ClassifierConfig;
use crate::error::{CollectError, Result};

/// The classifier's decision for one URL.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Direct,
    Rendered,
    Unfetchable,
}

impl Verdict {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Verdict::Direct => "direct",
            Verdict::Rendered => "rendered",
            Verdict::Unfetchable => "unfetchable",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A verdict plus whether a rule actually matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub verdict: Verdict,
    /// False when no rule matched and the default verdict was applied.
    pub confident: bool,
}

#[derive(Debug)]
enum Pattern {
    Suffix(String),
    Substring(String),
    Regex(Regex),
}

impl Pattern {
    fn matches(&self, url: &str) -> bool {
        match self {
            Pattern::Suffix(suffix) => {
                url.to_ascii_lowercase().ends_with(suffix)
            }
            Pattern::Substring(needle) => url.contains(needle.as_str()),
            Pattern::Regex(re) => re.is_match(url),
        }
    }

    /// `re:` and `suffix:` prefixes select the pattern kind; everything
    /// else is a substring match.
    fn parse(raw: &str) -> Result<Self> {
        if let Some(expr) = raw.strip_prefix("re:") {
            let re = Regex::new(expr).map_err(|err| {
                CollectError::Config(format!(
                    "invalid classifier regex {expr:?}: {err}"
                ))
            })?;
            Ok(Pattern::Regex(re))
        } else if let Some(suffix) = raw.strip_prefix("suffix:") {
            Ok(Pattern::Suffix(suffix.to_ascii_lowercase()))
        } else {
            Ok(Pattern::Substring(raw.to_string()))
        }
    }
}

#[derive(Debug)]
struct Rule {
    pattern: Pattern,
    verdict: Verdict,
}

/// Running totals per verdict, reported at run end for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerdictCounts {
    pub direct: u64,
    pub rendered: u64,
    pub unfetchable: u64,
    pub low_confidence: u64,
}

#[derive(Debug)]
pub struct UrlClassifier {
    rules: Vec<Rule>,
    direct: AtomicU64,
    rendered: AtomicU64,
    unfetchable: AtomicU64,
    low_confidence: AtomicU64,
}

impl UrlClassifier {
    /// Compile the configured rule lists. Evaluation order is unfetchable,
    /// rendered, direct, so exclusion rules always win.
    pub fn from_config(config: &ClassifierConfig) -> Result<Self> {
        let mut rules = Vec::new();
        for (list, verdict) in [
            (&config.unfetchable, Verdict::Unfetchable),
            (&config.rendered, Verdict::Rendered),
            (&config.direct, Verdict::Direct),
        ] {
            for raw in list {
                rules.push(Rule {
                    pattern: Pattern::parse(raw)?,
                    verdict,
                });
            }
        }
        Ok(Self {
            rules,
            direct: AtomicU64::new(0),
            rendered: AtomicU64::new(0),
            unfetchable: AtomicU64::new(0),
            low_confidence: AtomicU64::new(0),
        })
    }

    pub fn classify(&self, url: &str) -> Classification {
        // A URL that does not parse cannot be fetched by any transport;
        // ruling it out here avoids a pointless retry loop downstream.
        if Url::parse(url).is_err() {
            self.bump(Verdict::Unfetchable);
            return Classification {
                verdict: Verdict::Unfetchable,
                confident: true,
            };
        }

        for rule in &self.rules {
            if rule.pattern.matches(url) {
                self.bump(rule.verdict);
                return Classification {
                    verdict: rule.verdict,
                    confident: true,
                };
            }
        }

        // Unknown shapes are worth attempting as a plain GET.
        self.bump(Verdict::Direct);
        self.low_confidence.fetch_add(1, Ordering::Relaxed);
        Classification {
            verdict: Verdict::Direct,
            confident: false,
        }
    }

    /// Substring patterns routed to the catalog gateway so unfetchable URLs
    /// can be excluded at query time as well.
    pub fn unfetchable_substrings(&self) -> Vec<String> {
        self.rules
            .iter()
            .filter(|rule| rule.verdict == Verdict::Unfetchable)
            .filter_map(|rule| match &rule.pattern {
                Pattern::Substring(needle) => Some(needle.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn counts(&self) -> VerdictCounts {
        VerdictCounts {
            direct: self.direct.load(Ordering::Relaxed),
            rendered: self.rendered.load(Ordering::Relaxed),
            unfetchable: self.unfetchable.load(Ordering::Relaxed),
            low_confidence: self.low_confidence.load(Ordering::Relaxed),
        }
    }

    fn bump(&self, verdict: Verdict) {
        let counter = match verdict {
            Verdict::Direct => &self.direct,
            Verdict::Rendered => &self.rendered,
            Verdict::Unfetchable => &self.unfetchable,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
