use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::model::{CompletionStatus, Month, Role};

#[derive(Parser, Debug)]
#[command(
    name = "actionplan",
    version,
    about = "Track departmental action plans through submission, grading and unlocks"
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Data directory (defaults to $ACTIONPLAN_HOME or ~/.actionplan)"
    )]
    pub home: Option<PathBuf>,
    #[arg(
        long = "as",
        global = true,
        value_name = "USER_ID",
        help = "Acting user (defaults to $ACTIONPLAN_USER)"
    )]
    pub acting_user: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the first administrator on an empty store.
    Setup(Setup),
    #[command(subcommand)]
    User(UserCommand),
    #[command(subcommand)]
    Plan(PlanCommand),
    #[command(subcommand)]
    Month(MonthCommand),
    #[command(subcommand)]
    Grade(GradeCommand),
    #[command(subcommand)]
    Unlock(UnlockCommand),
    #[command(subcommand)]
    Permission(PermissionCommand),
    Notifications,
}

#[derive(Subcommand, Debug)]
pub enum UserCommand {
    Add(UserAdd),
    List,
    Role(UserRole),
    Remove(UserRemove),
}

#[derive(Subcommand, Debug)]
pub enum PlanCommand {
    Add(PlanAdd),
    Show(PlanView),
    List(PlanList),
    Edit(PlanEdit),
    Status(PlanStatus),
    Progress(PlanProgress),
    Delete(PlanDelete),
    Restore(PlanShow),
    Purge(PlanShow),
    Recall(PlanShow),
}

#[derive(Subcommand, Debug)]
pub enum MonthCommand {
    Finalize(MonthArgs),
    Recall(MonthArgs),
    Summary(MonthArgs),
}

#[derive(Subcommand, Debug)]
pub enum GradeCommand {
    Approve(GradeApprove),
    Reject(GradeReject),
    Reset(GradeReset),
}

#[derive(Subcommand, Debug)]
pub enum UnlockCommand {
    Request(UnlockRequest),
    List,
    Approve(UnlockApprove),
    Reject(UnlockReject),
    Revoke(BatchArgs),
    #[command(name = "approve-record")]
    ApproveRecord(UnlockApproveRecord),
    #[command(name = "reject-record")]
    RejectRecord(UnlockRejectRecord),
    #[command(name = "revoke-record")]
    RevokeRecord(PlanShow),
}

#[derive(Subcommand, Debug)]
pub enum PermissionCommand {
    List,
    Set(PermissionSet),
}

#[derive(Args, Debug)]
pub struct Setup {
    pub id: String,
    pub name: String,
}

#[derive(Args, Debug)]
pub struct UserAdd {
    pub id: String,
    pub name: String,
    #[arg(long, value_parser = parse_role)]
    pub role: Role,
    #[arg(long, value_name = "CODE")]
    pub department: Option<String>,
}

#[derive(Args, Debug)]
pub struct UserRole {
    pub id: String,
    #[arg(value_parser = parse_role)]
    pub role: Role,
}

#[derive(Args, Debug)]
pub struct UserRemove {
    pub id: String,
}

#[derive(Args, Debug)]
pub struct PlanAdd {
    #[arg(long, value_name = "CODE")]
    pub department: String,
    #[arg(long)]
    pub year: i32,
    #[arg(long, value_parser = parse_month)]
    pub month: Month,
    #[arg(long, value_name = "TEXT")]
    pub action: String,
    #[arg(long)]
    pub pic: String,
    #[arg(long, default_value = "")]
    pub category: String,
    #[arg(long, default_value = "")]
    pub area_focus: String,
    #[arg(long, default_value = "")]
    pub goal_strategy: String,
    #[arg(long, default_value = "")]
    pub indicator: String,
    #[arg(long, value_name = "USER_ID")]
    pub assignee: Option<String>,
    #[arg(long)]
    pub evidence: Option<String>,
    #[arg(long)]
    pub report_format: Option<String>,
}

#[derive(Args, Debug)]
pub struct PlanShow {
    pub id: i64,
}

#[derive(Args, Debug)]
pub struct PlanView {
    pub id: i64,
    #[arg(long, help = "Print the stored record as JSON")]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct PlanList {
    #[arg(long, value_name = "CODE")]
    pub department: Option<String>,
    #[arg(long)]
    pub year: Option<i32>,
    #[arg(long, value_parser = parse_month)]
    pub month: Option<Month>,
    #[arg(long, value_enum)]
    pub submission: Option<SubmissionArg>,
    #[arg(long, value_enum)]
    pub unlock: Option<UnlockArg>,
    #[arg(long, help = "List soft-deleted plans instead of active ones")]
    pub deleted: bool,
    #[arg(long, help = "Print the matching records as a JSON array")]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct PlanEdit {
    pub id: i64,
    #[arg(long)]
    pub category: Option<String>,
    #[arg(long)]
    pub area_focus: Option<String>,
    #[arg(long)]
    pub goal_strategy: Option<String>,
    #[arg(long, value_name = "TEXT")]
    pub action: Option<String>,
    #[arg(long)]
    pub indicator: Option<String>,
    #[arg(long)]
    pub pic: Option<String>,
    #[arg(long, value_name = "USER_ID")]
    pub assignee: Option<String>,
    #[arg(long)]
    pub report_format: Option<String>,
}

#[derive(Args, Debug)]
pub struct PlanStatus {
    pub id: i64,
    #[arg(value_parser = parse_status)]
    pub status: CompletionStatus,
}

#[derive(Args, Debug)]
pub struct PlanProgress {
    pub id: i64,
    #[arg(long)]
    pub evidence: Option<String>,
    #[arg(long)]
    pub outcome_link: Option<String>,
    #[arg(long)]
    pub remark: Option<String>,
}

#[derive(Args, Debug)]
pub struct PlanDelete {
    pub id: i64,
    #[arg(long)]
    pub reason: String,
}

#[derive(Args, Debug)]
pub struct MonthArgs {
    pub department: String,
    pub year: i32,
    #[arg(value_parser = parse_month)]
    pub month: Month,
}

#[derive(Args, Debug)]
pub struct GradeApprove {
    pub id: i64,
    #[arg(long)]
    pub score: i32,
    #[arg(long)]
    pub feedback: Option<String>,
}

#[derive(Args, Debug)]
pub struct GradeReject {
    pub id: i64,
    #[arg(long)]
    pub feedback: String,
}

#[derive(Args, Debug)]
pub struct GradeReset {
    #[arg(long, value_name = "TEXT", help = "Must be exactly: RESET ALL GRADES")]
    pub confirm: String,
    #[arg(long)]
    pub year: Option<i32>,
    #[arg(long, value_parser = parse_month)]
    pub month: Option<Month>,
    #[arg(long, value_name = "CODE")]
    pub department: Option<String>,
}

#[derive(Args, Debug)]
pub struct UnlockRequest {
    #[arg(value_name = "ID", num_args = 1..)]
    pub ids: Vec<i64>,
    #[arg(long)]
    pub reason: String,
}

#[derive(Args, Debug)]
pub struct BatchArgs {
    pub department: String,
    pub year: i32,
    #[arg(value_parser = parse_month)]
    pub month: Month,
    #[arg(long, value_name = "USER_ID")]
    pub requester: String,
}

#[derive(Args, Debug)]
#[group(id = "expiry", required = true, multiple = false)]
pub struct ExpiryArgs {
    #[arg(long, value_name = "24|48|168")]
    pub hours: Option<u32>,
    #[arg(long, value_name = "RFC3339", value_parser = parse_instant)]
    pub until: Option<DateTime<Utc>>,
}

#[derive(Args, Debug)]
pub struct UnlockApprove {
    #[command(flatten)]
    pub batch: BatchArgs,
    #[command(flatten)]
    pub expiry: ExpiryArgs,
}

#[derive(Args, Debug)]
pub struct UnlockReject {
    #[command(flatten)]
    pub batch: BatchArgs,
    #[arg(long)]
    pub reason: Option<String>,
}

#[derive(Args, Debug)]
pub struct UnlockApproveRecord {
    pub id: i64,
    #[command(flatten)]
    pub expiry: ExpiryArgs,
}

#[derive(Args, Debug)]
pub struct UnlockRejectRecord {
    pub id: i64,
    #[arg(long)]
    pub reason: Option<String>,
}

#[derive(Args, Debug)]
pub struct PermissionSet {
    #[arg(value_parser = parse_role)]
    pub role: Role,
    pub resource: String,
    pub action: String,
    #[arg(value_enum)]
    pub decision: DecisionArg,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum SubmissionArg {
    Draft,
    Submitted,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum UnlockArg {
    None,
    Pending,
    Approved,
    Rejected,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum DecisionArg {
    Allow,
    Deny,
}

fn parse_role(value: &str) -> Result<Role, String> {
    Role::parse(value).map_err(|err| err.to_string())
}

fn parse_month(value: &str) -> Result<Month, String> {
    Month::parse(value).map_err(|err| err.to_string())
}

fn parse_status(value: &str) -> Result<CompletionStatus, String> {
    CompletionStatus::parse(value).map_err(|err| err.to_string())
}

fn parse_instant(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|instant| instant.with_timezone(&Utc))
        .map_err(|err| format!("invalid RFC3339 instant '{value}': {err}"))
}
