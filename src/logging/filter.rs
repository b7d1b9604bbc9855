//! Noise filtering and user-facing message rewriting.
//!
//! Subprocess output (image pulls in particular) is overwhelmingly chatter.
//! The noise filter keeps known-uninteresting lines off the user channel
//! while the durable sink still records them; the rewrite table turns a few
//! recognizable technical messages into shorter human phrasing.

use regex::{Regex, RegexSet};

/// Patterns for lines a human never needs to see live.
const NOISE_PATTERNS: &[&str] = &[
    // Per-layer pull progress and its trailers.
    r"(?i)(pulling fs layer|downloading|download complete|verifying checksum|extracting|pull complete|waiting|already exists)",
    r"^Digest:\s+sha256:",
    r"(?i)^Status:\s+(downloaded newer image|image is up to date)",
    // Raw container/layer ids on a line of their own.
    r"^[0-9a-f]{12,64}$",
    // Network and volume scaffolding chatter from compose.
    r#"(?i)(network|volume)\s+\S+\s+(creating|created|removing|removed)"#,
    r#"(?i)creating\s+(network|volume)"#,
    // Blank lines.
    r"^\s*$",
];

/// Matches lines that should not reach the user-facing channel.
#[derive(Debug)]
pub struct NoiseFilter {
    set: RegexSet,
}

impl Default for NoiseFilter {
    fn default() -> Self {
        Self {
            set: RegexSet::new(NOISE_PATTERNS).expect("noise patterns are valid regexes"),
        }
    }
}

impl NoiseFilter {
    pub fn is_noise(&self, line: &str) -> bool {
        self.set.is_match(line)
    }
}

/// Ordered pattern → template rules; the first matching rule rewrites the
/// message for display. Non-matching messages pass through unchanged.
#[derive(Debug)]
pub struct RewriteRules {
    rules: Vec<(Regex, &'static str)>,
}

impl Default for RewriteRules {
    fn default() -> Self {
        let table: &[(&str, &str)] = &[
            (
                r"(?i)^\s*Container\s+(?P<name>\S+)\s+Creat(?:ing|ed)",
                "Creating $name",
            ),
            (
                r"(?i)^\s*Container\s+(?P<name>\S+)\s+Start(?:ing|ed)",
                "Starting $name",
            ),
            (
                r"(?i)^\s*Container\s+(?P<name>\S+)\s+Stopp(?:ing|ed)",
                "Stopping $name",
            ),
            (
                r"(?i)^\s*Container\s+(?P<name>\S+)\s+Remov(?:ing|ed)",
                "Removing $name",
            ),
            (r"(?i)^\s*(?P<svc>\S+)\s+Pulled\b", "Updated image for $svc"),
            (
                r"(?i)^Cannot connect to the Docker daemon.*",
                "Docker daemon is not running",
            ),
        ];
        let rules = table
            .iter()
            .map(|(pattern, template)| {
                (
                    Regex::new(pattern).expect("rewrite patterns are valid regexes"),
                    *template,
                )
            })
            .collect();
        Self { rules }
    }
}

impl RewriteRules {
    pub fn apply(&self, message: &str) -> String {
        for (pattern, template) in &self.rules {
            if pattern.is_match(message) {
                return pattern.replace(message, *template).into_owned();
            }
        }
        message.to_string()
    }
}
