//! Arbiter trailer parsing.
//!
//! Arbiter and revision outputs end with optional `CONFIDENCE:`, `STATUS:` and
//! `RATIONALE:` lines. They are parsed into an [`ArbiterVerdict`] and stripped from
//! the artifact text.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArbiterStatus {
    Approved,
    NeedsChanges,
    Unspecified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbiterVerdict {
    pub confidence: Option<f32>,
    pub status: ArbiterStatus,
    pub rationale: Option<String>,
}

impl Default for ArbiterVerdict {
    fn default() -> Self {
        Self {
            confidence: None,
            status: ArbiterStatus::Unspecified,
            rationale: None,
        }
    }
}

impl ArbiterVerdict {
    /// Accepted unless the arbiter asked for changes or reported low confidence.
    pub fn accepted(&self, threshold: f32) -> bool {
        self.status != ArbiterStatus::NeedsChanges
            && self.confidence.map_or(true, |c| c >= threshold)
    }
}

fn parse_confidence(value: &str) -> Option<f32> {
    let value = value.trim();
    let (number, percent) = match value.strip_suffix('%') {
        Some(number) => (number.trim(), true),
        None => (value, false),
    };
    let parsed: f32 = number.parse().ok()?;
    if !parsed.is_finite() {
        return None;
    }
    let scaled = if percent || parsed > 1.0 {
        parsed / 100.0
    } else {
        parsed
    };
    Some(scaled.clamp(0.0, 1.0))
}

fn parse_status(value: &str) -> ArbiterStatus {
    let normalized = value.trim().to_ascii_lowercase().replace(['_', ' '], "-");
    match normalized.as_str() {
        "approved" | "approve" | "accepted" => ArbiterStatus::Approved,
        "needs-changes" | "needs-change" | "changes-requested" => ArbiterStatus::NeedsChanges,
        _ => ArbiterStatus::Unspecified,
    }
}

fn split_field(line: &str) -> Option<(String, &str)> {
    let (key, value) = line.split_once(':')?;
    let key = key.trim().trim_start_matches(['*', '#', '-']).trim_end_matches('*').trim();
    Some((key.to_ascii_uppercase(), value.trim_start_matches('*')))
}

/// Split `text` into the artifact body and the verdict from its trailing lines.
pub fn parse_trailer(text: &str) -> (String, ArbiterVerdict) {
    let lines: Vec<&str> = text.lines().collect();
    let mut verdict = ArbiterVerdict::default();
    let mut cut = lines.len();

    while cut > 0 {
        let line = lines[cut - 1].trim();
        if line.is_empty() {
            cut -= 1;
            continue;
        }
        let Some((key, value)) = split_field(line) else {
            break;
        };
        match key.as_str() {
            "CONFIDENCE" => verdict.confidence = parse_confidence(value),
            "STATUS" => verdict.status = parse_status(value),
            "RATIONALE" => verdict.rationale = Some(value.trim().to_string()),
            _ => break,
        }
        cut -= 1;
    }

    let body = lines[..cut].join("\n").trim_end().to_string();
    (body, verdict)
}
