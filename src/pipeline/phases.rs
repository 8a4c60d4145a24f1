//! Phase extraction from plan documents.
//!
//! A phase starts at a markdown heading of the form `## Phase N: Title` (any heading
//! level, `:`, `-` or `.` after the number). An `Acceptance criteria` line inside a
//! phase introduces the bullet list collected into `acceptance_criteria`.

use crate::pipeline::Phase;
use std::collections::HashSet;

fn parse_heading(line: &str) -> Option<(u32, String)> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with('#') {
        return None;
    }
    let rest = trimmed.trim_start_matches('#').trim().trim_start_matches("**");
    let lower = rest.to_ascii_lowercase();
    if !lower.starts_with("phase") {
        return None;
    }
    let after = rest["phase".len()..].trim_start();
    let digits: String = after.chars().take_while(|c| c.is_ascii_digit()).collect();
    let number: u32 = digits.parse().ok()?;
    let title = after[digits.len()..]
        .trim_start_matches([':', '-', '.', ' ', '\u{2013}'])
        .trim()
        .trim_end_matches("**")
        .trim()
        .to_string();
    Some((number, title))
}

fn is_criteria_marker(line: &str) -> bool {
    let cleaned = line
        .trim()
        .trim_start_matches('#')
        .trim()
        .trim_matches('*')
        .trim()
        .trim_end_matches(':')
        .trim_end_matches('*')
        .trim()
        .to_ascii_lowercase();
    cleaned == "acceptance criteria"
}

fn bullet_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    for marker in ["- [ ] ", "- [x] ", "- ", "* ", "+ "] {
        if let Some(rest) = trimmed.strip_prefix(marker) {
            return Some(rest.trim());
        }
    }
    let digits = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &trimmed[digits..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return Some(rest.trim());
        }
    }
    None
}

fn criteria(body: &[&str]) -> Vec<String> {
    let Some(start) = body.iter().position(|line| is_criteria_marker(line)) else {
        return Vec::new();
    };
    let mut items = Vec::new();
    for line in &body[start + 1..] {
        if line.trim().is_empty() {
            if items.is_empty() {
                continue;
            }
            break;
        }
        match bullet_text(line) {
            Some(text) if !text.is_empty() => items.push(text.to_string()),
            Some(_) => {}
            None => break,
        }
    }
    items
}

/// Extract phases in document order. Numbers are kept when unique, otherwise
/// phases are renumbered 1..n.
pub fn parse_phases(text: &str) -> Vec<Phase> {
    let lines: Vec<&str> = text.lines().collect();
    let headings: Vec<(usize, u32, String)> = lines
        .iter()
        .enumerate()
        .filter_map(|(i, line)| parse_heading(line).map(|(n, title)| (i, n, title)))
        .collect();

    let mut phases: Vec<Phase> = headings
        .iter()
        .enumerate()
        .map(|(k, (start, number, title))| {
            let end = headings.get(k + 1).map_or(lines.len(), |(next, _, _)| *next);
            let body = &lines[start + 1..end];
            Phase {
                number: *number,
                title: title.clone(),
                content: body.join("\n").trim().to_string(),
                acceptance_criteria: criteria(body),
            }
        })
        .collect();

    let unique: HashSet<u32> = phases.iter().map(|p| p.number).collect();
    if unique.len() != phases.len() || unique.contains(&0) {
        for (i, phase) in phases.iter_mut().enumerate() {
            phase.number = i as u32 + 1;
        }
    }
    phases
}
