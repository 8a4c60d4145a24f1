//! Run presentation: summaries, the status table and checkpoint inspection.

use crate::checkpoint::RunSummary;
use crate::error::PipelineError;
use crate::pipeline::{PipelineRun, RunStatus, StageStatus};
use comfy_table::Table;
use serde_json::json;

pub fn format_run_summary(run: &PipelineRun) -> String {
    let mut s = format!(
        "Run {}: {} ({}/{} stages complete)",
        run.id,
        run.status,
        run.completed_stages(),
        run.stages.len()
    );
    for stage in &run.stages {
        s.push_str(&format!("\n  {:<10} {}", stage.name, stage.status));
        if stage.retry_count > 0 {
            s.push_str(&format!(" (retries: {})", stage.retry_count));
        }
    }
    if let Some(failure) = run.failed_stage().and_then(|s| s.failure.as_ref()) {
        s.push_str(&format!(
            "\n\nFailure [{}] after {} attempt(s): {}",
            failure.category, failure.attempts, failure.message
        ));
        if !failure.partial_output.is_empty() {
            s.push_str(&format!(
                "\nPartial output: {} chars",
                failure.partial_output.chars().count()
            ));
        }
    }
    if matches!(run.status, RunStatus::Paused | RunStatus::Failed) {
        s.push_str(&format!("\n\nResume with: blueprint resume {}", run.id));
    }
    s
}

pub fn format_status_table(runs: &[RunSummary]) -> String {
    if runs.is_empty() {
        return "No runs found.".to_string();
    }
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.set_header(vec!["Run", "Status", "Stages", "Updated"]);
    for r in runs {
        table.add_row(vec![
            r.run_id.clone(),
            r.status.to_string(),
            format!("{}/{}", r.completed_stages, r.total_stages),
            r.updated_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        ]);
    }
    table.to_string()
}

pub fn format_status_json(runs: &[RunSummary]) -> Result<String, PipelineError> {
    let arr: Vec<serde_json::Value> = runs
        .iter()
        .map(|r| {
            json!({
                "run_id": r.run_id,
                "status": r.status,
                "completed_stages": r.completed_stages,
                "total_stages": r.total_stages,
                "updated_at": r.updated_at,
            })
        })
        .collect();
    serde_json::to_string_pretty(&arr).map_err(|e| PipelineError::InvalidRun(e.to_string()))
}

pub fn format_inspect_text(run: &PipelineRun) -> String {
    let mut s = format!(
        "Checkpoint valid.\nRun {}: {}\nBrief: {}\n",
        run.id,
        run.status,
        run.brief.lines().next().unwrap_or("").trim()
    );
    for (index, stage) in run.stages.iter().enumerate() {
        s.push_str(&format!(
            "\n## [{}] {} ({}{})\n",
            index + 1,
            stage.name,
            stage.status,
            if stage.ensemble { ", ensemble" } else { "" }
        ));
        if !stage.phases.is_empty() {
            let done = stage
                .phases
                .iter()
                .filter(|p| p.status == StageStatus::Complete)
                .count();
            s.push_str(&format!("Phases: {}/{} complete\n", done, stage.phases.len()));
        }
        if let Some(failure) = &stage.failure {
            s.push_str(&format!("Failed [{}]: {}\n", failure.category, failure.message));
        }
        if let Some(output) = &stage.output {
            s.push('\n');
            s.push_str(output.trim_end());
            s.push('\n');
        }
    }
    s
}

pub fn format_inspect_json(run: &PipelineRun) -> Result<String, PipelineError> {
    serde_json::to_string_pretty(run).map_err(|e| PipelineError::InvalidRun(e.to_string()))
}
