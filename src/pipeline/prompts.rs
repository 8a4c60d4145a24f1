//! Stage prompt builders.
//!
//! Every stage talks to the same provider interface; only the messages differ. A
//! [`PromptRegistry`] maps stage names to [`StagePromptBuilder`]s and falls back
//! to a generic builder for stages it does not know.

use crate::pipeline::{Phase, PipelineRun};
use crate::provider::ChatMessage;
use std::collections::HashMap;
use std::sync::Arc;

/// Inputs available to a prompt builder.
pub struct StageContext<'a> {
    pub run: &'a PipelineRun,
    pub stage: &'a str,
    pub phase: Option<&'a Phase>,
}

impl<'a> StageContext<'a> {
    /// Outputs of completed stages that come before this one, in pipeline order.
    pub fn prior_outputs(&self) -> Vec<(&'a str, &'a str)> {
        let run: &'a PipelineRun = self.run;
        run.stages
            .iter()
            .take_while(|s| s.name != self.stage)
            .filter(|s| s.is_complete())
            .filter_map(|s| s.output.as_deref().map(|o| (s.name.as_str(), o)))
            .collect()
    }

    pub fn output_of(&self, stage: &str) -> Option<&'a str> {
        let run: &'a PipelineRun = self.run;
        run.stage(stage)
            .filter(|s| s.is_complete())
            .and_then(|s| s.output.as_deref())
    }
}

pub trait StagePromptBuilder: Send + Sync {
    fn build(&self, ctx: &StageContext<'_>) -> Vec<ChatMessage>;
}

impl<F> StagePromptBuilder for F
where
    F: Fn(&StageContext<'_>) -> Vec<ChatMessage> + Send + Sync,
{
    fn build(&self, ctx: &StageContext<'_>) -> Vec<ChatMessage> {
        self(ctx)
    }
}

fn brief_section(ctx: &StageContext<'_>) -> String {
    format!("## Project brief\n\n{}\n", ctx.run.brief.trim())
}

fn context_sections(ctx: &StageContext<'_>) -> String {
    ctx.prior_outputs()
        .into_iter()
        .map(|(name, output)| format!("\n## {} output\n\n{}\n", name, output.trim()))
        .collect()
}

fn phase_section(phase: &Phase) -> String {
    let mut section = format!(
        "\n## Phase {}: {}\n\n{}\n",
        phase.number,
        phase.title,
        phase.content.trim()
    );
    if !phase.acceptance_criteria.is_empty() {
        section.push_str("\nAcceptance criteria:\n");
        for item in &phase.acceptance_criteria {
            section.push_str(&format!("- {}\n", item));
        }
    }
    section
}

struct DesignPrompt;

impl StagePromptBuilder for DesignPrompt {
    fn build(&self, ctx: &StageContext<'_>) -> Vec<ChatMessage> {
        vec![
            ChatMessage::system(
                "You are a senior software architect. Write a design document for the \
project: goals, architecture, components, data model, interfaces and risks. Use markdown.",
            ),
            ChatMessage::user(brief_section(ctx)),
        ]
    }
}

struct PlanPrompt;

impl StagePromptBuilder for PlanPrompt {
    fn build(&self, ctx: &StageContext<'_>) -> Vec<ChatMessage> {
        vec![
            ChatMessage::system(
                "You are a technical lead. Break the design into implementation phases that \
can be worked on independently. Write each phase as a heading `## Phase N: Title`, a short \
description, then a line `Acceptance criteria:` followed by a bullet list.",
            ),
            ChatMessage::user(format!("{}{}", brief_section(ctx), context_sections(ctx))),
        ]
    }
}

struct PhasePrompt;

impl StagePromptBuilder for PhasePrompt {
    fn build(&self, ctx: &StageContext<'_>) -> Vec<ChatMessage> {
        let mut user = brief_section(ctx);
        if let Some(design) = ctx.output_of("design") {
            user.push_str(&format!("\n## Design\n\n{}\n", design.trim()));
        }
        if let Some(phase) = ctx.phase {
            user.push_str(&phase_section(phase));
        }
        vec![
            ChatMessage::system(
                "You are a senior engineer. Expand the given phase into a detailed \
specification: tasks, files or modules touched, interfaces, tests, and how each acceptance \
criterion will be verified.",
            ),
            ChatMessage::user(user),
        ]
    }
}

struct HandoffPrompt;

impl StagePromptBuilder for HandoffPrompt {
    fn build(&self, ctx: &StageContext<'_>) -> Vec<ChatMessage> {
        vec![
            ChatMessage::system(
                "Write a handoff document for the engineers who will implement this \
project: summary, order of work, open questions and where to find each artifact.",
            ),
            ChatMessage::user(format!("{}{}", brief_section(ctx), context_sections(ctx))),
        ]
    }
}

struct GenericPrompt;

impl StagePromptBuilder for GenericPrompt {
    fn build(&self, ctx: &StageContext<'_>) -> Vec<ChatMessage> {
        let mut user = format!("{}{}", brief_section(ctx), context_sections(ctx));
        if let Some(phase) = ctx.phase {
            user.push_str(&phase_section(phase));
        }
        vec![
            ChatMessage::system(format!(
                "Produce the '{}' artifact for this project as a markdown document.",
                ctx.stage
            )),
            ChatMessage::user(user),
        ]
    }
}

/// Stage name to prompt builder map.
#[derive(Clone)]
pub struct PromptRegistry {
    builders: HashMap<String, Arc<dyn StagePromptBuilder>>,
    fallback: Arc<dyn StagePromptBuilder>,
}

impl Default for PromptRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl PromptRegistry {
    /// Registry with only the generic fallback.
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
            fallback: Arc::new(GenericPrompt),
        }
    }

    /// Builders for the default design, plan, phases and handoff stages.
    pub fn with_defaults() -> Self {
        Self::empty()
            .register("design", DesignPrompt)
            .register("plan", PlanPrompt)
            .register("phases", PhasePrompt)
            .register("handoff", HandoffPrompt)
    }

    pub fn register(mut self, stage: impl Into<String>, builder: impl StagePromptBuilder + 'static) -> Self {
        self.builders.insert(stage.into(), Arc::new(builder));
        self
    }

    pub fn build(&self, ctx: &StageContext<'_>) -> Vec<ChatMessage> {
        self.builders
            .get(ctx.stage)
            .unwrap_or(&self.fallback)
            .build(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PipelineConfig, StageStatus};
    use crate::swarm::SwarmConfig;

    fn run() -> PipelineRun {
        let mut run = PipelineRun::new(
            "run-1",
            "Build a cache",
            &PipelineConfig::default().definitions(),
            &SwarmConfig::default(),
        );
        run.stages[0].status = StageStatus::Complete;
        run.stages[0].output = Some("DESIGN DOC".to_string());
        run
    }

    #[test]
    fn plan_prompt_includes_brief_and_prior_outputs() {
        let run = run();
        let registry = PromptRegistry::with_defaults();
        let messages = registry.build(&StageContext {
            run: &run,
            stage: "plan",
            phase: None,
        });
        assert!(messages[0].content.contains("## Phase N: Title"));
        assert!(messages[1].content.contains("Build a cache"));
        assert!(messages[1].content.contains("DESIGN DOC"));
    }

    #[test]
    fn prior_outputs_exclude_later_stages() {
        let mut run = run();
        run.stages[3].status = StageStatus::Complete;
        run.stages[3].output = Some("HANDOFF".to_string());
        let ctx = StageContext {
            run: &run,
            stage: "plan",
            phase: None,
        };
        let names: Vec<&str> = ctx.prior_outputs().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["design"]);
    }

    #[test]
    fn custom_builders_override_and_unknown_stages_fall_back() {
        let run = run();
        fn custom(_: &StageContext<'_>) -> Vec<ChatMessage> {
            vec![ChatMessage::user("custom")]
        }
        let registry = PromptRegistry::with_defaults().register("plan", custom);
        let custom = registry.build(&StageContext {
            run: &run,
            stage: "plan",
            phase: None,
        });
        assert_eq!(custom[0].content, "custom");

        let generic = registry.build(&StageContext {
            run: &run,
            stage: "review",
            phase: None,
        });
        assert!(generic[0].content.contains("'review'"));
    }
}
