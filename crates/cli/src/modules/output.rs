/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Human readable rendering of run, plan and prune reports

use backup_rotation::{
    retention::BandCutoffs, RemotePruneReport, RetentionPlan, RetentionPolicy, RunReport,
};
use console::style;
use prettytable::{Attr, Cell, Row, Table};

/// What the plan would do with one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
    Keep,
    Delete,
    Ignore,
}

impl PlanAction {
    fn label(&self) -> String {
        match self {
            PlanAction::Keep => style("keep").green().to_string(),
            PlanAction::Delete => style("delete").red().to_string(),
            PlanAction::Ignore => style("ignore").dim().to_string(),
        }
    }
}

/// Rows of the plan table, newest first, unparsed names last
pub fn plan_rows(plan: &RetentionPlan, policy: &RetentionPolicy) -> Vec<(String, String, String, PlanAction)> {
    let cutoffs = BandCutoffs::new(plan.now, policy);
    let mut records: Vec<_> = plan.records.iter().collect();
    records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.name.cmp(&b.name)));

    records
        .into_iter()
        .map(|record| {
            let action = if plan.decision.keep.contains(&record.id) {
                PlanAction::Keep
            } else if plan.decision.delete.contains(&record.id) {
                PlanAction::Delete
            } else {
                PlanAction::Ignore
            };
            let (timestamp, band) = match record.timestamp {
                Some(ts) => (
                    ts.format("%Y-%m-%d %H:%M:%S").to_string(),
                    cutoffs.band(ts).to_string(),
                ),
                None => ("-".to_string(), "-".to_string()),
            };
            (record.name.clone(), timestamp, band, action)
        })
        .collect()
}

pub fn print_plan(plan: &RetentionPlan, policy: &RetentionPolicy) {
    let rows = plan_rows(plan, policy);
    if rows.is_empty() {
        println!("{}", style("No backups found in remote storage.").dim());
        return;
    }

    let mut table = Table::new();
    table.add_row(Row::new(vec![
        Cell::new("Name").with_style(Attr::Bold),
        Cell::new("Timestamp (UTC)").with_style(Attr::Bold),
        Cell::new("Band").with_style(Attr::Bold),
        Cell::new("Action").with_style(Attr::Bold),
    ]));
    for (name, timestamp, band, action) in &rows {
        table.add_row(Row::new(vec![
            Cell::new(name),
            Cell::new(timestamp),
            Cell::new(band),
            Cell::new(&action.label()),
        ]));
    }
    table.printstd();

    println!(
        "\n{} to keep, {} to delete, {} ignored.",
        plan.decision.keep.len(),
        plan.decision.delete.len(),
        plan.decision.unparsed.len()
    );
}

pub fn print_prune_report(report: &RemotePruneReport) {
    let mut table = Table::new();
    for (label, value) in [
        ("Listed", report.listed),
        ("Kept", report.kept),
        ("Deleted", report.deleted.len()),
        ("Failed deletes", report.failed.len()),
        ("Ignored", report.unparsed),
    ] {
        table.add_row(Row::new(vec![
            Cell::new(label).with_style(Attr::Bold),
            Cell::new(&value.to_string()),
        ]));
    }
    table.printstd();

    for failure in &report.failed {
        eprintln!(
            "{} could not delete {}: {}",
            style("warning:").yellow().bold(),
            failure.id,
            failure.reason
        );
    }
}

pub fn print_run_report(report: &RunReport) {
    let mut table = Table::new();
    let status = match report.failed_stage() {
        None => style("success".to_string()).green().to_string(),
        Some(stage) => style(format!("failed during {stage}")).red().to_string(),
    };

    let mut add = |label: &str, value: String| {
        table.add_row(Row::new(vec![
            Cell::new(label).with_style(Attr::Bold),
            Cell::new(&value),
        ]));
    };
    add("Status", status);
    add(
        "Started",
        report.started_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    );
    add("Duration", format!("{:.1}s", report.duration_secs));
    if let Some(artifact) = &report.artifact {
        add("Artifact", artifact.display().to_string());
    }
    if let Some(bytes) = report.artifact_bytes {
        add("Size", format!("{bytes} bytes"));
    }
    if let Some(id) = &report.uploaded_id {
        add("Remote id", id.clone());
    }
    if let Some(local) = &report.local_prune {
        add("Local pruned", local.deleted.len().to_string());
    }
    if let Some(remote) = &report.remote_prune {
        add(
            "Remote pruned",
            format!("{} ({} failed)", remote.deleted.len(), remote.failed.len()),
        );
    }
    if let Some(error) = &report.error {
        add("Error", error.clone());
    }
    table.printstd();

    for note in &report.notes {
        eprintln!("{} {note}", style("warning:").yellow().bold());
    }
}
