mod app;
mod cli;
mod clock;
mod config;
mod db;
mod entities;
mod error;
mod events;
mod grading;
mod lifecycle;
mod model;
mod permission;
mod unlock;
mod util;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::app::App;
use crate::cli::{
    BatchArgs, Cli, Command, DecisionArg, ExpiryArgs, GradeCommand, MonthArgs, MonthCommand,
    PermissionCommand, PlanAdd, PlanCommand, PlanEdit, PlanList, PlanProgress, SubmissionArg,
    UnlockArg, UnlockCommand, UserCommand,
};
use crate::clock::SystemClock;
use crate::config::{Config, LOG_ENV, USER_ENV};
use crate::error::AppError;
use crate::lifecycle::UnlockExpiry;
use crate::model::{
    Action, Actor, MonthScope, NewUser, PlanChanges, PlanInput, PlanQuery, ProgressChanges,
    ResetScope, Resource, SubmissionStatus, UnlockStatus,
};
use crate::unlock::{UnlockAction, UnlockBatchKey};
use crate::util::{
    format_datetime, format_month_summary, format_plan_detail, print_batch_report,
    print_notifications, print_permission_rows, print_plan_list, print_unlock_batches,
    print_user_list,
};

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("Error [{}]: {err}", err.code());
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run() -> Result<(), AppError> {
    let Cli {
        home,
        acting_user,
        command,
    } = Cli::parse();
    let config = Config::resolve(home, acting_user)?;

    let db_path = config.db_path();
    db::ensure_parent_dir(&db_path)?;
    let mut lock = db::open_lock(&db_path)?;
    let _guard = lock.write()?;

    let db = db::connect(&db_path).await?;
    db::ensure_schema(&db).await?;
    let app = App::new(db, Arc::new(SystemClock), &config);

    if let Command::Setup(args) = command {
        let admin = app.setup_admin(&args.id, &args.name).await?;
        println!("Created admin: {} ({})", admin.id, admin.full_name);
        return Ok(());
    }

    let actor = resolve_actor(&app, &config).await?;
    match command {
        Command::Setup(_) => Ok(()),
        Command::User(command) => handle_user(&app, &actor, command).await,
        Command::Plan(command) => handle_plan(&app, &actor, command).await,
        Command::Month(command) => handle_month(&app, &actor, command).await,
        Command::Grade(command) => handle_grade(&app, &actor, command).await,
        Command::Unlock(command) => handle_unlock(&app, &actor, command).await,
        Command::Permission(command) => handle_permission(&app, &actor, command).await,
        Command::Notifications => {
            let rows = app.list_notifications(&actor).await?;
            if rows.is_empty() {
                println!("No notifications.");
            } else {
                print_notifications(&rows);
            }
            Ok(())
        }
    }
}

async fn resolve_actor(app: &App, config: &Config) -> Result<Actor, AppError> {
    let user_id = config.acting_user.as_deref().ok_or_else(|| {
        AppError::InvalidInput(format!("no acting user; pass --as or set {USER_ENV}"))
    })?;
    app.resolve_actor(user_id).await
}

async fn handle_user(app: &App, actor: &Actor, command: UserCommand) -> Result<(), AppError> {
    match command {
        UserCommand::Add(args) => {
            let created = app
                .add_user(
                    actor,
                    NewUser {
                        id: args.id,
                        full_name: args.name,
                        role: args.role,
                        department_code: args.department,
                    },
                )
                .await?;
            println!(
                "Created user: {} ({}, {})",
                created.id,
                created.role,
                created.department_code.as_deref().unwrap_or("-")
            );
        }
        UserCommand::List => {
            let users = app.list_users(actor).await?;
            if users.is_empty() {
                println!("No users found.");
            } else {
                print_user_list(&users);
            }
        }
        UserCommand::Role(args) => {
            let updated = app.update_user_role(actor, &args.id, args.role).await?;
            println!("Updated user: {} is now {}", updated.id, updated.role);
        }
        UserCommand::Remove(args) => {
            app.remove_user(actor, &args.id).await?;
            println!("Removed user: {}", args.id);
        }
    }
    Ok(())
}

async fn handle_plan(app: &App, actor: &Actor, command: PlanCommand) -> Result<(), AppError> {
    match command {
        PlanCommand::Add(args) => handle_plan_add(app, actor, args).await,
        PlanCommand::Show(args) => {
            let plan = app.get_plan(args.id).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                println!("{}", format_plan_detail(&plan));
            }
            Ok(())
        }
        PlanCommand::List(args) => handle_plan_list(app, args).await,
        PlanCommand::Edit(args) => handle_plan_edit(app, actor, args).await,
        PlanCommand::Status(args) => {
            let plan = app.update_status(actor, args.id, args.status).await?;
            println!("Updated plan ID: {} status: {}", plan.id, plan.status);
            Ok(())
        }
        PlanCommand::Progress(args) => handle_plan_progress(app, actor, args).await,
        PlanCommand::Delete(args) => {
            let plan = app.soft_delete(actor, args.id, &args.reason).await?;
            println!("Deleted plan ID: {}", plan.id);
            Ok(())
        }
        PlanCommand::Restore(args) => {
            let plan = app.restore(actor, args.id).await?;
            println!("Restored plan ID: {}", plan.id);
            Ok(())
        }
        PlanCommand::Purge(args) => {
            app.purge(actor, args.id).await?;
            println!("Purged plan ID: {}", args.id);
            Ok(())
        }
        PlanCommand::Recall(args) => {
            let plan = app.recall_single(actor, args.id).await?;
            println!("Recalled plan ID: {} to draft", plan.id);
            Ok(())
        }
    }
}

async fn handle_plan_add(app: &App, actor: &Actor, args: PlanAdd) -> Result<(), AppError> {
    let plan = app
        .create_plan(
            actor,
            PlanInput {
                department_code: args.department,
                year: args.year,
                month: Some(args.month),
                category: args.category,
                area_focus: args.area_focus,
                goal_strategy: args.goal_strategy,
                action_plan: args.action,
                indicator: args.indicator,
                pic: args.pic,
                assignee_id: args.assignee,
                evidence: args.evidence,
                report_format: args.report_format,
            },
        )
        .await?;
    println!(
        "Created plan ID: {} ({} {} {})",
        plan.id, plan.department_code, plan.month, plan.year
    );
    Ok(())
}

async fn handle_plan_list(app: &App, args: PlanList) -> Result<(), AppError> {
    let query = PlanQuery {
        department_code: args.department,
        year: args.year,
        month: args.month,
        submission_status: args.submission.map(|arg| match arg {
            SubmissionArg::Draft => SubmissionStatus::Draft,
            SubmissionArg::Submitted => SubmissionStatus::Submitted,
        }),
        unlock_status: args.unlock.map(unlock_status_from_arg),
        deleted: args.deleted,
    };
    let plans = app.list_plans(&query).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&plans)?);
        return Ok(());
    }
    if plans.is_empty() {
        println!("No plans found.");
        return Ok(());
    }
    print_plan_list(&plans);
    Ok(())
}

async fn handle_plan_edit(app: &App, actor: &Actor, args: PlanEdit) -> Result<(), AppError> {
    let plan = app
        .update_plan(
            actor,
            args.id,
            PlanChanges {
                category: args.category,
                area_focus: args.area_focus,
                goal_strategy: args.goal_strategy,
                action_plan: args.action,
                indicator: args.indicator,
                pic: args.pic,
                assignee_id: args.assignee,
                report_format: args.report_format,
            },
        )
        .await?;
    println!("Updated plan ID: {}", plan.id);
    Ok(())
}

async fn handle_plan_progress(
    app: &App,
    actor: &Actor,
    args: PlanProgress,
) -> Result<(), AppError> {
    let plan = app
        .update_progress(
            actor,
            args.id,
            ProgressChanges {
                evidence: args.evidence,
                outcome_link: args.outcome_link,
                remark: args.remark,
            },
        )
        .await?;
    println!("Updated progress for plan ID: {}", plan.id);
    Ok(())
}

async fn handle_month(app: &App, actor: &Actor, command: MonthCommand) -> Result<(), AppError> {
    match command {
        MonthCommand::Finalize(args) => {
            let scope = month_scope(&args);
            let report = app.finalize_month(actor, &scope).await?;
            print_batch_report(&format!("Finalized {scope}:"), &report);
        }
        MonthCommand::Recall(args) => {
            let scope = month_scope(&args);
            let report = app.recall_month(actor, &scope).await?;
            println!(
                "Recalled {scope}: {} plan(s) back to draft, {} graded kept.",
                report.recalled.len(),
                report.graded_kept.len()
            );
        }
        MonthCommand::Summary(args) => {
            let scope = month_scope(&args);
            let summary = app.month_summary(&scope).await?;
            println!("{}", format_month_summary(&scope.to_string(), &summary));
        }
    }
    Ok(())
}

async fn handle_grade(app: &App, actor: &Actor, command: GradeCommand) -> Result<(), AppError> {
    match command {
        GradeCommand::Approve(args) => {
            let plan = app.approve(actor, args.id, args.score, args.feedback).await?;
            println!(
                "Graded plan ID: {} score: {}",
                plan.id,
                plan.quality_score.unwrap_or_default()
            );
        }
        GradeCommand::Reject(args) => {
            let plan = app.reject(actor, args.id, &args.feedback).await?;
            println!("Returned plan ID: {} for revision", plan.id);
        }
        GradeCommand::Reset(args) => {
            let scope = ResetScope {
                year: args.year,
                month: args.month,
                department_code: args.department,
            };
            let reset = app.bulk_reset_grades(actor, &scope, &args.confirm).await?;
            if reset.is_empty() {
                println!("No graded plans in scope.");
            } else {
                println!("Reset {} graded plan(s).", reset.len());
            }
        }
    }
    Ok(())
}

async fn handle_unlock(app: &App, actor: &Actor, command: UnlockCommand) -> Result<(), AppError> {
    match command {
        UnlockCommand::Request(args) => {
            let report = app.request_unlock(actor, &args.ids, &args.reason).await?;
            print_batch_report("Requested unlock for", &report);
        }
        UnlockCommand::List => {
            let batches = app.list_unlock_batches(actor).await?;
            if batches.is_empty() {
                println!("No pending unlock requests.");
            } else {
                print_unlock_batches(&batches);
            }
        }
        UnlockCommand::Approve(args) => {
            let expiry = unlock_expiry(&args.expiry)?;
            let approved = app
                .approve_unlock(actor, &batch_key(&args.batch), expiry)
                .await?;
            let until = approved
                .first()
                .and_then(|plan| plan.approved_until)
                .map(format_datetime)
                .unwrap_or_default();
            println!("Unlocked {} plan(s) until {until}", approved.len());
        }
        UnlockCommand::Reject(args) => {
            let rejected = app
                .reject_unlock(actor, &batch_key(&args.batch), args.reason)
                .await?;
            println!("Rejected unlock for {} plan(s)", rejected.len());
        }
        UnlockCommand::Revoke(args) => {
            let revoked = app.revoke_unlock(actor, &batch_key(&args)).await?;
            println!("Revoked unlock for {} plan(s)", revoked.len());
        }
        UnlockCommand::ApproveRecord(args) => {
            let expiry = unlock_expiry(&args.expiry)?;
            let plan = app
                .process_unlock_request(actor, args.id, UnlockAction::Approve, Some(expiry), None)
                .await?;
            println!(
                "Unlocked plan ID: {} until {}",
                plan.id,
                plan.approved_until.map(format_datetime).unwrap_or_default()
            );
        }
        UnlockCommand::RejectRecord(args) => {
            let plan = app
                .process_unlock_request(actor, args.id, UnlockAction::Reject, None, args.reason)
                .await?;
            println!("Rejected unlock for plan ID: {}", plan.id);
        }
        UnlockCommand::RevokeRecord(args) => {
            let plan = app.revoke_unlock_access(actor, args.id).await?;
            println!("Plan ID: {} unlock: {}", plan.id, plan.unlock_status);
        }
    }
    Ok(())
}

async fn handle_permission(
    app: &App,
    actor: &Actor,
    command: PermissionCommand,
) -> Result<(), AppError> {
    match command {
        PermissionCommand::List => {
            let rows = app.list_permissions(actor).await?;
            print_permission_rows(&rows);
        }
        PermissionCommand::Set(args) => {
            let resource: Resource = args.resource.parse()?;
            let action: Action = args.action.parse()?;
            let allowed = matches!(args.decision, DecisionArg::Allow);
            app.set_permission(actor, args.role, resource, action, allowed)
                .await?;
            println!(
                "Set {} {}.{} = {}",
                args.role.as_str(),
                resource.as_str(),
                action.as_str(),
                if allowed { "allow" } else { "deny" }
            );
        }
    }
    Ok(())
}

fn month_scope(args: &MonthArgs) -> MonthScope {
    MonthScope::new(&args.department, args.year, args.month)
}

fn batch_key(args: &BatchArgs) -> UnlockBatchKey {
    UnlockBatchKey::new(&args.department, args.year, args.month, &args.requester)
}

fn unlock_expiry(args: &ExpiryArgs) -> Result<UnlockExpiry, AppError> {
    match (args.hours, args.until) {
        (Some(hours), None) => UnlockExpiry::from_hours(hours),
        (None, Some(until)) => Ok(UnlockExpiry::At(until)),
        _ => Err(AppError::InvalidInput(
            "pass exactly one of --hours or --until".to_string(),
        )),
    }
}

fn unlock_status_from_arg(arg: UnlockArg) -> UnlockStatus {
    match arg {
        UnlockArg::None => UnlockStatus::None,
        UnlockArg::Pending => UnlockStatus::Pending,
        UnlockArg::Approved => UnlockStatus::Approved,
        UnlockArg::Rejected => UnlockStatus::Rejected,
    }
}
