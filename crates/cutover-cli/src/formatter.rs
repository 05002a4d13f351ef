//! Output formatters for command results.

use clap::ValueEnum;
use comfy_table::{Cell, Table};
use serde::Serialize;

use cutover_core::migration::{
    IntegrityIssue, LedgerEntry, MigrationOutcome, MigrationPlan, MigrationStatusReport,
    RollbackPlan,
};
use cutover_core::{DeploymentResult, EnvironmentName, SystemHealth};

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Trait for formatting output.
pub trait Formatter: Send + Sync {
    /// Format the migration status of the active environment.
    fn format_status(&self, active: EnvironmentName, status: &MigrationStatusReport) -> String;

    /// Format per-migration outcomes.
    fn format_outcomes(&self, outcomes: &[MigrationOutcome]) -> String;

    /// Format a migration plan.
    fn format_plan(&self, plan: &MigrationPlan) -> String;

    /// Format a rollback plan.
    fn format_rollback_plan(&self, plan: &RollbackPlan) -> String;

    /// Format integrity issues.
    fn format_issues(&self, issues: &[IntegrityIssue]) -> String;

    /// Format the ledger.
    fn format_history(&self, entries: &[LedgerEntry]) -> String;

    /// Format a deployment or rollback result.
    fn format_deployment(&self, result: &DeploymentResult) -> String;

    /// Format a health snapshot.
    fn format_health(&self, health: &SystemHealth) -> String;

    /// Format an error message.
    fn format_error(&self, error: &str) -> String;

    /// Format a simple message.
    fn format_message(&self, message: &str) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    }
}

/// Table formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_status(&self, active: EnvironmentName, status: &MigrationStatusReport) -> String {
        let mut table = Table::new();
        table.set_header(vec!["Property", "Value"]);
        table.add_row(vec!["Active environment".to_string(), active.to_string()]);
        table.add_row(vec!["Schema version".to_string(), status.current_version.to_string()]);
        table.add_row(vec!["Applied".to_string(), status.applied_count.to_string()]);
        table.add_row(vec!["Pending".to_string(), status.pending_count.to_string()]);
        if let Some(last) = &status.last_applied {
            table.add_row(vec![
                "Last applied".to_string(),
                format!("{} at {}", last.migration_id, last.applied_at.to_rfc3339()),
            ]);
        }

        let mut output = table.to_string();
        if !status.pending.is_empty() {
            let mut pending = Table::new();
            pending.set_header(vec!["Version", "Pending migration", "Category", "Risk"]);
            for m in &status.pending {
                pending.add_row(vec![
                    m.version.to_string(),
                    m.id.clone(),
                    m.category.to_string(),
                    m.risk_level.to_string(),
                ]);
            }
            output.push_str("\n\n");
            output.push_str(&pending.to_string());
        }
        output
    }

    fn format_outcomes(&self, outcomes: &[MigrationOutcome]) -> String {
        if outcomes.is_empty() {
            return "Nothing to do".to_string();
        }

        let mut table = Table::new();
        table.set_header(vec!["Version", "Migration", "Status", "Time (ms)", "Rollback", "Error"]);
        for o in outcomes {
            let status = match (o.dry_run, o.success) {
                (true, _) => "planned",
                (false, true) => "ok",
                (false, false) => "FAILED",
            };
            table.add_row(vec![
                Cell::new(o.version),
                Cell::new(&o.migration_id),
                Cell::new(status),
                Cell::new(o.execution_time_ms),
                Cell::new(yes_no(o.can_rollback)),
                Cell::new(o.error.as_deref().unwrap_or("")),
            ]);
        }
        table.to_string()
    }

    fn format_plan(&self, plan: &MigrationPlan) -> String {
        if plan.is_empty() {
            return "No pending migrations".to_string();
        }

        let mut table = Table::new();
        table.set_header(vec!["Version", "Migration", "Category", "Risk", "Est. (ms)", "Rollback"]);
        for m in &plan.migrations {
            table.add_row(vec![
                Cell::new(m.version),
                Cell::new(&m.id),
                Cell::new(m.category),
                Cell::new(m.risk_level),
                Cell::new(m.estimated_time().as_millis()),
                Cell::new(yes_no(m.can_rollback())),
            ]);
        }

        let mut output = table.to_string();
        output.push_str(&format!(
            "\n{} pending, estimated {} ms, rollback {}",
            plan.total_count,
            plan.estimated_time.as_millis(),
            if plan.can_rollback { "supported" } else { "not fully supported" }
        ));
        for message in &plan.dependencies {
            output.push_str(&format!("\nunmet dependency: {}", message));
        }
        for warning in &plan.warnings {
            output.push_str(&format!("\nwarning: {}", warning));
        }
        output
    }

    fn format_rollback_plan(&self, plan: &RollbackPlan) -> String {
        let mut table = Table::new();
        table.set_header(vec!["Version", "Migration", "Category", "Rollback SQL"]);
        for m in &plan.migrations {
            table.add_row(vec![
                Cell::new(m.version),
                Cell::new(&m.id),
                Cell::new(m.category),
                Cell::new(if m.can_rollback() { "present" } else { "MISSING" }),
            ]);
        }

        let mut output = format!("v{} -> v{}\n", plan.current_version, plan.target_version);
        output.push_str(&table.to_string());
        for risk in &plan.risky_operations {
            output.push_str(&format!("\nrisk: {}", risk));
        }
        output
    }

    fn format_issues(&self, issues: &[IntegrityIssue]) -> String {
        if issues.is_empty() {
            return "No integrity issues".to_string();
        }

        let mut table = Table::new();
        table.set_header(vec!["Kind", "Detail"]);
        for issue in issues {
            table.add_row(vec![issue.kind().to_string(), issue.to_string()]);
        }
        table.to_string()
    }

    fn format_history(&self, entries: &[LedgerEntry]) -> String {
        if entries.is_empty() {
            return "No migrations applied".to_string();
        }

        let mut table = Table::new();
        table.set_header(vec![
            "Version", "Migration", "Category", "Applied at", "Time (ms)", "Applied by", "Checksum",
        ]);
        for e in entries {
            table.add_row(vec![
                Cell::new(e.version),
                Cell::new(&e.migration_id),
                Cell::new(e.category),
                Cell::new(e.applied_at.format("%Y-%m-%d %H:%M:%S")),
                Cell::new(e.execution_time_ms),
                Cell::new(&e.applied_by),
                Cell::new(e.checksum.get(..12).unwrap_or(&e.checksum)),
            ]);
        }
        table.to_string()
    }

    fn format_deployment(&self, result: &DeploymentResult) -> String {
        let mut table = Table::new();
        table.set_header(vec!["Property", "Value"]);
        table.add_row(vec!["Success".to_string(), yes_no(result.success).to_string()]);
        table.add_row(vec!["Active environment".to_string(), result.active_environment.to_string()]);
        table.add_row(vec![
            "Previous environment".to_string(),
            result
                .previous_environment
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
        ]);
        table.add_row(vec!["Schema version".to_string(), result.schema_version.to_string()]);
        table.add_row(vec!["Duration (ms)".to_string(), result.duration_ms.to_string()]);
        table.add_row(vec!["Rollback available".to_string(), yes_no(result.rollback_available).to_string()]);
        if let Some(copy) = &result.copy {
            table.add_row(vec![
                "Rows copied".to_string(),
                format!("{} across {} tables", copy.total_rows(), copy.tables.len()),
            ]);
        }
        if let Some(phase) = result.failed_phase {
            table.add_row(vec!["Failed phase".to_string(), phase.to_string()]);
        }
        if let Some(error) = &result.error {
            table.add_row(vec!["Error".to_string(), error.clone()]);
        }

        let mut output = table.to_string();
        if !result.migrations.is_empty() {
            output.push_str("\n\n");
            output.push_str(&self.format_outcomes(&result.migrations));
        }
        output
    }

    fn format_health(&self, health: &SystemHealth) -> String {
        let mut table = Table::new();
        table.set_header(vec!["Environment", "Active", "Health", "Version", "Created", "Path"]);
        for env in &health.environments {
            table.add_row(vec![
                Cell::new(env.name),
                Cell::new(yes_no(env.active)),
                Cell::new(env.health),
                Cell::new(env.schema_version),
                Cell::new(env.created_at.format("%Y-%m-%d %H:%M:%S")),
                Cell::new(&env.path),
            ]);
        }

        let mut output = table.to_string();
        output.push_str(&format!("\nphase: {}", health.phase));
        match health.rollback_remaining_ms {
            Some(ms) if health.rollback_available => {
                output.push_str(&format!("\nrollback available for {} s", ms / 1000))
            }
            _ => output.push_str("\nrollback not available"),
        }
        if health.deployment_in_progress {
            output.push_str("\ndeployment in progress");
        }
        output
    }

    fn format_error(&self, error: &str) -> String {
        format!("Error: {}", error)
    }

    fn format_message(&self, message: &str) -> String {
        message.to_string()
    }
}

/// JSON formatter.
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn format_status(&self, active: EnvironmentName, status: &MigrationStatusReport) -> String {
        pretty(&serde_json::json!({
            "active_environment": active,
            "status": status,
        }))
    }

    fn format_outcomes(&self, outcomes: &[MigrationOutcome]) -> String {
        pretty(&outcomes)
    }

    fn format_plan(&self, plan: &MigrationPlan) -> String {
        pretty(plan)
    }

    fn format_rollback_plan(&self, plan: &RollbackPlan) -> String {
        pretty(plan)
    }

    fn format_issues(&self, issues: &[IntegrityIssue]) -> String {
        pretty(&issues)
    }

    fn format_history(&self, entries: &[LedgerEntry]) -> String {
        pretty(&entries)
    }

    fn format_deployment(&self, result: &DeploymentResult) -> String {
        pretty(result)
    }

    fn format_health(&self, health: &SystemHealth) -> String {
        pretty(health)
    }

    fn format_error(&self, error: &str) -> String {
        serde_json::json!({
            "error": error
        })
        .to_string()
    }

    fn format_message(&self, message: &str) -> String {
        serde_json::json!({
            "message": message
        })
        .to_string()
    }
}

fn pretty<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}
