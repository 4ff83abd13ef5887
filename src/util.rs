use chrono::{DateTime, Utc};

use crate::app::{BatchReport, MonthSummary, PermissionRow};
use crate::entities::{action_plan, notification, user};
use crate::lifecycle::Phase;
use crate::unlock::UnlockBatch;

fn has_text(value: &Option<String>) -> bool {
    value
        .as_deref()
        .map(|text| !text.trim().is_empty())
        .unwrap_or(false)
}

fn push_optional(output: &mut String, label: &str, value: &Option<String>) {
    if has_text(value) {
        output.push_str(&format!("{label}: {}\n", value.as_deref().unwrap_or("")));
    }
}

pub fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M").to_string()
}

pub fn format_plan_detail(plan: &action_plan::Model) -> String {
    let mut output = String::new();
    output.push_str(&format!("Plan ID: {}\n", plan.id));
    output.push_str(&format!(
        "Scope: {} {} {}\n",
        plan.department_code, plan.month, plan.year
    ));
    output.push_str(&format!("Phase: {}\n", Phase::of(plan).as_str()));
    output.push_str(&format!("Status: {}\n", plan.status));
    output.push_str(&format!("Action: {}\n", plan.action_plan));
    output.push_str(&format!("PIC: {}\n", plan.pic));
    push_optional(&mut output, "Assignee", &plan.assignee_id);
    if !plan.category.is_empty() {
        output.push_str(&format!("Category: {}\n", plan.category));
    }
    if !plan.area_focus.is_empty() {
        output.push_str(&format!("Area Focus: {}\n", plan.area_focus));
    }
    if !plan.goal_strategy.is_empty() {
        output.push_str(&format!("Goal Strategy: {}\n", plan.goal_strategy));
    }
    if !plan.indicator.is_empty() {
        output.push_str(&format!("Indicator: {}\n", plan.indicator));
    }
    push_optional(&mut output, "Evidence", &plan.evidence);
    push_optional(&mut output, "Report Format", &plan.report_format);
    push_optional(&mut output, "Outcome Link", &plan.outcome_link);
    push_optional(&mut output, "Remark", &plan.remark);

    if let Some(score) = plan.quality_score {
        output.push_str(&format!("Score: {score}\n"));
    }
    push_optional(&mut output, "Feedback", &plan.admin_feedback);
    if let (Some(by), Some(at)) = (&plan.reviewed_by, plan.reviewed_at) {
        output.push_str(&format!("Reviewed: {} by {}\n", format_datetime(at), by));
    }

    output.push_str(&format!("Unlock: {}\n", plan.unlock_status));
    push_optional(&mut output, "Unlock Reason", &plan.unlock_reason);
    if let Some(until) = plan.approved_until {
        output.push_str(&format!("Unlocked Until: {}\n", format_datetime(until)));
    }
    push_optional(
        &mut output,
        "Unlock Rejection",
        &plan.unlock_rejection_reason,
    );

    if let Some(deleted_at) = plan.deleted_at {
        output.push_str(&format!(
            "Deleted: {} by {}\n",
            format_datetime(deleted_at),
            plan.deleted_by.as_deref().unwrap_or("unknown")
        ));
        push_optional(&mut output, "Deletion Reason", &plan.deletion_reason);
    }
    output.push_str(&format!("Created: {}\n", format_datetime(plan.created_at)));
    output.push_str(&format!("Updated: {}\n", format_datetime(plan.updated_at)));
    output.trim_end().to_string()
}

pub fn print_plan_list(plans: &[action_plan::Model]) {
    println!(
        "{:<5} {:<6} {:<8} {:<10} {:<13} {:<6} {:<9} {}",
        "ID", "DEPT", "MONTH", "PHASE", "STATUS", "SCORE", "UNLOCK", "ACTION"
    );
    for plan in plans {
        println!(
            "{:<5} {:<6} {:<8} {:<10} {:<13} {:<6} {:<9} {}",
            plan.id,
            plan.department_code,
            format!("{} {}", plan.month, plan.year),
            Phase::of(plan).as_str(),
            plan.status,
            plan.quality_score
                .map(|score| score.to_string())
                .unwrap_or_else(|| "-".to_string()),
            plan.unlock_status,
            plan.action_plan
        );
    }
}

pub fn print_batch_report(verb: &str, report: &BatchReport) {
    println!("{verb} {} plan(s).", report.success_count());
    for failure in &report.failures {
        println!("- plan id {}: {}", failure.id, failure.reason);
    }
}

pub fn format_month_summary(scope: &str, summary: &MonthSummary) -> String {
    let mut output = String::new();
    output.push_str(&format!("Month: {scope}\n"));
    output.push_str(&format!("Draft: {}\n", summary.draft));
    output.push_str(&format!("Submitted: {}\n", summary.submitted_ungraded));
    output.push_str(&format!("Graded: {}\n", summary.graded));
    output.push_str(&format!("Pending Unlock: {}\n", summary.pending_unlock));
    output.push_str(&format!("Deleted: {}\n", summary.deleted));
    if let Some(average) = summary.average_score {
        output.push_str(&format!("Average Score: {average:.1}\n"));
    }
    output.trim_end().to_string()
}

pub fn print_unlock_batches(batches: &[UnlockBatch]) {
    println!(
        "{:<6} {:<10} {:<14} {:<17} {:<12} {}",
        "DEPT", "MONTH", "REQUESTER", "REQUESTED", "IDS", "REASON"
    );
    for batch in batches {
        let ids = batch
            .plan_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{:<6} {:<10} {:<14} {:<17} {:<12} {}",
            batch.key.department_code,
            format!("{} {}", batch.key.month, batch.key.year),
            batch.key.requested_by,
            batch
                .requested_at
                .map(format_datetime)
                .unwrap_or_else(|| "-".to_string()),
            ids,
            batch.reason.as_deref().unwrap_or("")
        );
    }
}

pub fn print_user_list(users: &[user::Model]) {
    println!("{:<14} {:<10} {:<6} {}", "ID", "ROLE", "DEPT", "NAME");
    for row in users {
        println!(
            "{:<14} {:<10} {:<6} {}",
            row.id,
            row.role,
            row.department_code.as_deref().unwrap_or("-"),
            row.full_name
        );
    }
}

pub fn print_permission_rows(rows: &[PermissionRow]) {
    println!(
        "{:<10} {:<28} {:<14} {}",
        "ROLE", "PERMISSION", "TIER", "ALLOWED"
    );
    for row in rows {
        println!(
            "{:<10} {:<28} {:<14} {}",
            row.role.as_str(),
            format!("{}.{}", row.resource.as_str(), row.action.as_str()),
            row.tier.as_str(),
            if row.allowed { "yes" } else { "no" }
        );
    }
}

pub fn print_notifications(rows: &[notification::Model]) {
    for row in rows {
        println!(
            "{} [{}] plan id {}: {}",
            format_datetime(row.created_at),
            row.kind,
            row.plan_id,
            row.message
        );
    }
}
