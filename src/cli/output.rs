//! CLI output formatting

use crate::{
    core::{PipelineDefinition, RunStatus, StepExecution, StepStatus},
    execution::RunOutcome,
    vault::RotationReport,
};
use console::Emoji;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Format a run status for display
pub fn format_status(status: RunStatus) -> String {
    match status {
        RunStatus::Pending => style("PENDING").dim().to_string(),
        RunStatus::Running => style("RUNNING").yellow().to_string(),
        RunStatus::Completed => style("COMPLETED").green().to_string(),
        RunStatus::Failed => style("FAILED").red().to_string(),
        RunStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

/// Format a step status for display
pub fn format_step_status(status: StepStatus) -> String {
    match status {
        StepStatus::Pending => style("PENDING").dim().to_string(),
        StepStatus::Running => style("RUNNING").yellow().to_string(),
        StepStatus::Completed => style("COMPLETED").green().to_string(),
        StepStatus::Failed => style("FAILED").red().to_string(),
        StepStatus::Skipped => style("SKIPPED").dim().to_string(),
    }
}

/// One-line summary of how a run ended
pub fn format_outcome(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Completed { totals, .. } => format!(
            "{} Run {} ({} tokens, {:.4} cents)",
            CHECK,
            style("completed").green(),
            style(totals.total_tokens).cyan(),
            totals.total_cost_cents
        ),
        RunOutcome::Failed { error, .. } => format!(
            "{} Run {}: {}",
            CROSS,
            style("failed").red(),
            style(error).dim()
        ),
        RunOutcome::Cancelled { completed_steps } => format!(
            "{} Run {} after {} step(s)",
            WARN,
            style("cancelled").yellow(),
            completed_steps
        ),
        RunOutcome::Skipped { status } => format!(
            "{} Run skipped; it is already {}",
            INFO,
            format_status(*status)
        ),
    }
}

/// Format a step execution record
pub fn format_step(step: &StepExecution) -> String {
    let mut line = format!(
        "  [{}] {} {} {}ms",
        step.step_index + 1,
        style(&step.step_id).cyan(),
        format_step_status(step.status),
        step.duration_ms
    );
    if step.input_tokens + step.output_tokens > 0 {
        line.push_str(&format!(
            " ({} in / {} out)",
            step.input_tokens, step.output_tokens
        ));
    }
    if let Some(error) = &step.error {
        line.push_str(&format!("\n      {}", style(error).red()));
    }
    line
}

/// Summarise a validated definition
pub fn format_definition(definition: &PipelineDefinition) -> String {
    let mut lines = vec![
        format!("  Name: {}", style(&definition.name).bold()),
        format!("  Steps: {}", style(definition.steps.len()).cyan()),
        format!("  Variables: {}", style(definition.variables.len()).cyan()),
    ];
    for step in &definition.steps {
        lines.push(format!(
            "    - {} ({})",
            style(&step.id).cyan(),
            style(step.kind.type_name()).dim()
        ));
    }
    if let Some(output) = definition.output_step_id() {
        lines.push(format!("  Output from: {}", style(output).cyan()));
    }
    if let Some(webhook) = &definition.webhook {
        lines.push(format!("  Webhook: {} {}", webhook.method, style(&webhook.url).dim()));
    }
    lines.join("\n")
}

/// Format a key rotation report
pub fn format_rotation_report(report: &RotationReport) -> String {
    let icon = if report.is_clean() { CHECK } else { WARN };
    let mut out = format!(
        "{} {} secrets: {} re-wrapped, {} already current, {} failed{}",
        icon,
        report.total,
        style(report.rewrapped).green(),
        style(report.skipped).dim(),
        style(report.failed.len()).red(),
        if report.dry_run {
            style(" (dry run, nothing written)").yellow().to_string()
        } else {
            String::new()
        }
    );
    for (id, reason) in &report.failed {
        out.push_str(&format!("\n  {} {}: {}", CROSS, style(id).dim(), reason));
    }
    out
}

/// Format output with truncation
pub fn format_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();

    if lines.len() <= max_lines {
        output.to_string()
    } else {
        let truncated = lines[..max_lines].join("\n");
        format!(
            "{}\n{}... ({} more lines)",
            truncated,
            style("[truncated]").dim(),
            lines.len() - max_lines
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RunTotals;
    use uuid::Uuid;

    #[test]
    fn test_format_output_truncates() {
        let text = "a\nb\nc\nd";
        assert_eq!(format_output(text, 5), text);
        let truncated = format_output(text, 2);
        assert!(truncated.starts_with("a\nb\n"));
        assert!(truncated.contains("2 more lines"));
    }

    #[test]
    fn test_rotation_report_lists_failures() {
        let report = RotationReport {
            total: 2,
            rewrapped: 1,
            skipped: 0,
            failed: vec![(Uuid::nil(), "bad blob".into())],
            dry_run: true,
        };
        let text = console::strip_ansi_codes(&format_rotation_report(&report)).to_string();
        assert!(text.contains("2 secrets"));
        assert!(text.contains("bad blob"));
        assert!(text.contains("dry run"));
    }

    #[test]
    fn test_outcome_mentions_error() {
        let outcome = RunOutcome::Failed {
            error: "Step \"s1\" failed: boom".into(),
            totals: RunTotals::default(),
        };
        let text = console::strip_ansi_codes(&format_outcome(&outcome)).to_string();
        assert!(text.contains("Step \"s1\" failed"));
    }
}
