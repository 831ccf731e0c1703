//! Terminal rendering of stacks, plans and progress events.

use colored::Colorize;
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tracing::info;

use strata_core::{
    Event, Plan, ResourceChange, StackInfo, CHANGE_SET_STATUS_NOT_FOUND, STACK_STATUS_NOT_FOUND,
};

/// Colorize a remote status string by its class.
pub fn colorize_status(status: &str) -> String {
    if status == "ROLLBACK_IN_PROGRESS" {
        status.bright_red().to_string()
    } else if status == "ROLLBACK_COMPLETE" {
        status.red().to_string()
    } else if status.ends_with("_COMPLETE") || status == "AVAILABLE" {
        status.green().to_string()
    } else if status.ends_with("_IN_PROGRESS") || status.ends_with("_PENDING") {
        status.yellow().to_string()
    } else if status == STACK_STATUS_NOT_FOUND
        || status == CHANGE_SET_STATUS_NOT_FOUND
        || status == "UNAVAILABLE"
    {
        status.bright_black().to_string()
    } else if status.ends_with("_FAILED") {
        status.red().to_string()
    } else {
        status.white().to_string()
    }
}

/// Stream a progress event to stderr as a status line.
pub fn status_line(event: Event) {
    match event {
        Event::Stack(stack) => {
            info!(
                "stack status - {} [{}] {}",
                stack.data.name.bright_white(),
                colorize_status(&stack.data.status),
                stack.data.status_reason
            );
        }
        Event::ChangeSet(cs) => {
            info!(
                "changeset status - {} [{}] {}",
                cs.name.bright_white(),
                colorize_status(&cs.status),
                cs.status_reason
            );
        }
        Event::StackEvent(event) => {
            info!(
                "resource status - {}:{} ({}) - [{}] {}",
                event.stack_name.bright_white(),
                event.logical_resource_id.bright_white(),
                event.resource_type,
                colorize_status(&event.resource_status),
                event.resource_status_reason
            );
        }
    }
}

/// Render one stack; `long` includes parameters and outputs.
pub fn render_stack(stack: &StackInfo, long: bool) -> String {
    let mut out = String::new();
    let data = &stack.data;
    out.push_str(&format!(
        "{}: {}\n",
        "Stack".bright_white(),
        stack.config_name.cyan()
    ));
    out.push_str(&format!("{}: {}\n", "StackName".bright_white(), data.name));
    out.push_str(&format!(
        "{}: {} {}\n",
        "StackStatus".bright_white(),
        colorize_status(&data.status),
        data.status_reason
    ));
    if data.exists() {
        out.push_str(&format!("{}: {}\n", "Id".bright_white(), data.id));
    }
    if long {
        if !data.parameters.is_empty() {
            out.push_str(&format!("{}:\n", "Parameters".bright_white()));
            for (key, value) in &data.parameters {
                out.push_str(&format!("  {}: {:?}\n", key.bright_white(), value));
            }
        }
        if !data.outputs.is_empty() {
            out.push_str(&format!("{}:\n", "Outputs".bright_white()));
            for (key, value) in &data.outputs {
                out.push_str(&format!("  {}: {:?}\n", key.bright_white(), value));
            }
        }
    }
    out.trim_end().to_string()
}

#[derive(Tabled)]
struct StackRow {
    #[tabled(rename = "STACK")]
    stack: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "REASON")]
    reason: String,
}

/// Render the stack list as a table, in configuration order.
pub fn render_list(stacks: &[StackInfo]) -> String {
    let rows: Vec<StackRow> = stacks
        .iter()
        .map(|s| StackRow {
            stack: s.config_name.clone(),
            name: s.data.name.clone(),
            status: colorize_status(&s.data.status),
            reason: s.data.status_reason.clone(),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    table.to_string()
}

fn change_sign(change: &ResourceChange) -> String {
    match change.action.as_str() {
        "Add" => format!("[+] {}", change.logical_resource_id).green().to_string(),
        "Remove" => format!("[-] {}", change.logical_resource_id).red().to_string(),
        "Modify" => match change.replacement.as_str() {
            "True" => format!("[±] {}", change.logical_resource_id).red().to_string(),
            "Conditional" => {
                format!("[?] {}", change.logical_resource_id).bright_red().to_string()
            }
            _ => format!("[~] {}", change.logical_resource_id).yellow().to_string(),
        },
        _ => format!("[ ] {}", change.logical_resource_id),
    }
}

/// Render a plan: stack and change-set headers, changed parameters, and the
/// resource change list with per-change details.
pub fn render_plan(plan: &Plan) -> String {
    let mut out = String::new();
    let stack = &plan.stack;
    out.push_str(&format!("{}: {}\n", "Stack".bright_white(), stack.config_name.cyan()));
    out.push_str(&format!("{}: {}\n", "StackName".bright_white(), stack.data.name));
    out.push_str(&format!(
        "{}: {}\n",
        "StackStatus".bright_white(),
        colorize_status(&stack.data.status)
    ));
    if stack.data.exists() {
        out.push_str(&format!("{}: {}\n", "StackId".bright_white(), stack.data.id));
    }
    out.push_str(&format!("{}: {}\n", "ChangeSetId".bright_white(), plan.change_set.id));
    out.push_str(&format!("{}: {}\n", "ChangeSetName".bright_white(), plan.change_set.name));
    out.push_str(&format!(
        "{}: {}\n",
        "ExecutionStatus".bright_white(),
        colorize_status(&plan.change_set.execution_status)
    ));
    out.push_str(&format!("{}: {}\n", "RoleARN".bright_white(), plan.role_arn));

    if plan.parameters.has_change() {
        out.push_str(&format!("\n{}:\n", "Parameters".bright_white()));
        for (name, diff) in plan.parameters.iter() {
            if diff.is_equal() {
                continue;
            }
            out.push_str(&format!(
                "  {}: {}\n",
                name.bright_white(),
                diff.to_string().yellow()
            ));
        }
    }

    if !plan.change_set.changes.is_empty() {
        out.push_str(&format!("\n{}:\n", "ResourceChanges".bright_white()));
        for change in &plan.change_set.changes {
            out.push_str(&format!("{} ({})\n", change_sign(change), change.resource_type));
            for detail in &change.details {
                out.push_str(&format!(
                    "    {}: {}",
                    "ChangeSource".bright_white(),
                    detail.change_source
                ));
                if !detail.causing_entity.is_empty() {
                    out.push_str(&format!(
                        ", {}: {}",
                        "CausingEntity".bright_white(),
                        detail.causing_entity
                    ));
                }
                out.push_str(&format!(
                    ", {}: {}",
                    "Evaluation".bright_white(),
                    detail.evaluation
                ));
                match detail.target.requires_recreation.as_str() {
                    "Always" => {
                        out.push_str(&format!(" {}", "(requires recreation)".red()))
                    }
                    "Conditionally" => out.push_str(&format!(
                        " {}",
                        "(conditional recreation)".bright_red()
                    )),
                    _ => {}
                }
                out.push('\n');
            }
        }
    }

    out.trim_end().to_string()
}
