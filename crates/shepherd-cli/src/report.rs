//! Human-readable output.

use chrono::{DateTime, Utc};

use shepherd_runtime::RunReport;
use shepherd_store::{RecoveryEvent, Session};

fn outcome_line(report: &RunReport) -> &'static str {
    match report.exit_code() {
        0 => "COMPLETED",
        1 => "COMPLETED WITH FAILURES",
        2 => "ABORTED",
        4 => "PAUSED (budget exhausted, resumable)",
        _ => "INTERRUPTED (resumable)",
    }
}

fn print_counts(report: &RunReport) {
    println!("Resources:          {}", report.total);
    println!("Completed:          {}", report.completed);
    println!("Failed:             {}", report.failed);
    println!("Rolled back:        {}", report.rolled_back);
    println!("Pending:            {}", report.pending);
    println!("Budget overrun:     {} units", report.overrun_units);
    println!("Recovery events:    {}", report.recovery_events);

    if !report.failures.is_empty() {
        println!();
        println!("Failures:");
        for f in &report.failures {
            println!("  - {}: {}", f.resource, f.reason);
        }
    }
}

pub fn print_run(report: &RunReport) {
    println!("=== Shepherd Session {} ===", report.session_id);
    println!();
    print_counts(report);
    println!();
    println!("Status: {}", outcome_line(report));
    if matches!(report.exit_code(), 4 | 5) {
        println!("Resume with: shepherd resume {}", report.session_id);
    }
}

pub fn print_status(
    session: &Session,
    report: &RunReport,
    checkpoint: Option<(i64, DateTime<Utc>)>,
    events: &[RecoveryEvent],
) {
    println!("=== Shepherd Session {} ===", session.id);
    println!();
    println!("Target root:        {}", session.manifest.root.display());
    println!("Started:            {}", session.started_at.to_rfc3339());
    println!("Status:             {}", session.status);
    match checkpoint {
        Some((seq, at)) => println!("Last checkpoint:    #{} at {}", seq, at.to_rfc3339()),
        None => println!("Last checkpoint:    none"),
    }
    println!();
    print_counts(report);

    if !events.is_empty() {
        println!();
        println!("Recovery:");
        for e in events {
            println!("  - {} {}: {}", e.kind.as_str(), e.resource_id, e.detail);
        }
    }
}
