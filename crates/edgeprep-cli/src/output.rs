//! Human-readable rendering on stderr. Stdout carries JSON only.

use colored::Colorize;
use edgeprep_hal::QuiesceReport;
use edgeprep_runtime::{RunSummary, StepOutcome, StepStatus};
use edgeprep_types::{UnitState, format_size};

fn status_tag(status: StepStatus) -> colored::ColoredString {
    match status {
        StepStatus::Ok => "ok".green().bold(),
        StepStatus::Failed => "FAILED".red().bold(),
        StepStatus::Skipped => "skipped".dimmed(),
    }
}

fn step<T>(label: &str, outcome: &StepOutcome<T>, detail: impl FnOnce(&T) -> String) {
    let text = match (&outcome.value, &outcome.error) {
        (Some(value), _) => detail(value),
        (None, Some(error)) => error.to_string(),
        (None, None) => String::new(),
    };
    eprintln!("  {:<12} {:<8} {}", label, status_tag(outcome.status), text);
}

pub fn print_summary(summary: &RunSummary) {
    let leaves = &summary.leaves;
    eprintln!();
    eprintln!("{}", "  edgeprep run".bold().cyan());

    step("boot config", &leaves.boot_config, |c| {
        if c.written {
            format!("{} directive(s) written to {}", c.applied.len(), c.path.display())
        } else {
            "unchanged".to_string()
        }
    });
    step("swap", &leaves.swap, |s| {
        format!(
            "{} {} ({}), ~{} effective{}",
            s.device,
            format_size(s.swap.size_bytes),
            s.swap.algorithm,
            format_size(s.effective_capacity),
            if s.created { "" } else { ", already present" }
        )
    });
    step("governor", &leaves.governor, |cores| format!("{} core(s)", cores.len()));
    for overlay in &leaves.overlays {
        step("overlay", &overlay.outcome, |m| {
            format!("{} ({})", m.path.display(), format_size(m.size_limit))
        });
    }
    step("sysctl", &leaves.sysctl, |keys| keys.join(", "));

    for unit in &summary.services.units {
        let state = match unit.state {
            UnitState::Running => unit.state.to_string().green(),
            UnitState::Failed => unit.state.to_string().red(),
            _ => unit.state.to_string().yellow(),
        };
        eprintln!(
            "  {:<12} {:<8} {}",
            unit.name,
            state,
            unit.failure.as_deref().unwrap_or_default()
        );
    }

    if summary.reboot_required {
        eprintln!("{}", "  Reboot required for boot configuration changes.".yellow());
    }
    if summary.is_success() {
        eprintln!("  {}", "✓ done".green().bold());
    } else {
        eprintln!(
            "  {} {} error(s), exit code {}",
            "✗".red().bold(),
            summary.errors.len(),
            summary.exit_code
        );
    }
}

pub fn print_quiesce(report: &QuiesceReport) {
    if report.is_clean() {
        eprintln!(
            "  {} {} actuator(s) quiesced, {} skipped",
            "✓".green(),
            report.applied.len(),
            report.skipped.len()
        );
    } else {
        eprintln!(
            "  {} quiesce incomplete: failed [{}]{}",
            "⚠".yellow().bold(),
            report.failed.join(", "),
            if report.timed_out { ", timed out" } else { "" }
        );
    }
}
