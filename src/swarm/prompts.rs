//! Message builders for arbiter, critique and revision units.

use crate::provider::{ChatMessage, MessageRole};
use crate::swarm::verdict::ArbiterVerdict;

const TRAILER_INSTRUCTIONS: &str = "End your answer with exactly these three lines:\n\
CONFIDENCE: <number between 0 and 1>\n\
STATUS: approved | needs-changes\n\
RATIONALE: <one sentence>";

/// Stable label for the drone at `index` (0-based): "Candidate A", "Candidate B", ...
pub fn candidate_label(index: usize) -> String {
    if index < 26 {
        format!("Candidate {}", (b'A' + index as u8) as char)
    } else {
        format!("Candidate {}", index + 1)
    }
}

fn original_task(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter(|m| m.role != MessageRole::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn original_system(messages: &[ChatMessage]) -> Option<&str> {
    messages
        .iter()
        .find(|m| m.role == MessageRole::System)
        .map(|m| m.content.as_str())
}

pub fn arbiter_messages(original: &[ChatMessage], candidates: &[(String, String)]) -> Vec<ChatMessage> {
    let mut system = String::from(
        "You are the arbiter of an ensemble. Several independent drafts answer the same \
task. Merge their strongest parts into one complete answer in the format the task asks for.",
    );
    if let Some(role) = original_system(original) {
        system.push_str("\n\nThe drafts were written under these instructions:\n");
        system.push_str(role);
    }
    system.push_str("\n\n");
    system.push_str(TRAILER_INSTRUCTIONS);

    let mut user = format!("## Task\n\n{}\n", original_task(original));
    for (label, text) in candidates {
        user.push_str(&format!("\n## {}\n\n{}\n", label, text.trim_end()));
    }
    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

pub fn critique_messages(
    original: &[ChatMessage],
    draft: &str,
    verdict: &ArbiterVerdict,
) -> Vec<ChatMessage> {
    let mut user = format!(
        "## Task\n\n{}\n\n## Draft\n\n{}\n",
        original_task(original),
        draft.trim_end()
    );
    if let Some(rationale) = &verdict.rationale {
        user.push_str(&format!("\n## Reviewer note\n\n{}\n", rationale));
    }
    vec![
        ChatMessage::system(
            "You are a strict reviewer. List the concrete problems in the draft: gaps, \
errors and places where it does not follow the task. Do not rewrite it.",
        ),
        ChatMessage::user(user),
    ]
}

pub fn revise_messages(original: &[ChatMessage], draft: &str, critique: &str) -> Vec<ChatMessage> {
    let user = format!(
        "## Task\n\n{}\n\n## Draft\n\n{}\n\n## Critique\n\n{}\n",
        original_task(original),
        draft.trim_end(),
        critique.trim_end()
    );
    vec![
        ChatMessage::system(format!(
            "Revise the draft so it addresses every point of the critique. Return the full \
revised answer.\n\n{}",
            TRAILER_INSTRUCTIONS
        )),
        ChatMessage::user(user),
    ]
}
