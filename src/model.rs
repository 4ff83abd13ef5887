use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Executive,
    Leader,
    Staff,
}

impl Role {
    pub const NON_ADMIN: [Role; 3] = [Role::Executive, Role::Leader, Role::Staff];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Executive => "executive",
            Self::Leader => "leader",
            Self::Staff => "staff",
        }
    }

    /// Accepts any casing and the legacy department-head labels.
    pub fn parse(value: &str) -> Result<Self, AppError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Self::Admin),
            "executive" => Ok(Self::Executive),
            "leader" | "dept_head" | "head" => Ok(Self::Leader),
            "staff" => Ok(Self::Staff),
            other => Err(AppError::InvalidInput(format!("unknown role '{other}'"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Resource {
    ActionPlan,
    User,
    Report,
    Settings,
}

impl Resource {
    pub const ALL: [Resource; 4] = [
        Resource::ActionPlan,
        Resource::User,
        Resource::Report,
        Resource::Settings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActionPlan => "action_plan",
            Self::User => "user",
            Self::Report => "report",
            Self::Settings => "settings",
        }
    }

    pub fn actions(&self) -> &'static [Action] {
        match self {
            Self::ActionPlan => &[
                Action::Create,
                Action::Edit,
                Action::Delete,
                Action::UpdateStatus,
                Action::UpdateProgress,
                Action::Grade,
                Action::Submit,
            ],
            Self::User => &[Action::Create, Action::Edit, Action::Delete, Action::View],
            Self::Report => &[Action::Export],
            Self::Settings => &[Action::Manage],
        }
    }

    pub fn supports(&self, action: Action) -> bool {
        self.actions().contains(&action)
    }
}

impl FromStr for Resource {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Resource::ALL
            .into_iter()
            .find(|resource| resource.as_str() == value.trim().to_ascii_lowercase())
            .ok_or_else(|| AppError::InvalidInput(format!("unknown resource '{value}'")))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Action {
    Create,
    Edit,
    Delete,
    UpdateStatus,
    UpdateProgress,
    Grade,
    Submit,
    View,
    Export,
    Manage,
}

impl Action {
    pub const ALL: [Action; 10] = [
        Action::Create,
        Action::Edit,
        Action::Delete,
        Action::UpdateStatus,
        Action::UpdateProgress,
        Action::Grade,
        Action::Submit,
        Action::View,
        Action::Export,
        Action::Manage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Edit => "edit",
            Self::Delete => "delete",
            Self::UpdateStatus => "update_status",
            Self::UpdateProgress => "update_progress",
            Self::Grade => "grade",
            Self::Submit => "submit",
            Self::View => "view",
            Self::Export => "export",
            Self::Manage => "manage",
        }
    }
}

impl FromStr for Action {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|action| action.as_str() == value.trim().to_ascii_lowercase())
            .ok_or_else(|| AppError::InvalidInput(format!("unknown action '{value}'")))
    }
}

/// Completion axis of a plan. Two legacy values are still readable.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CompletionStatus {
    Pending,
    OnProgress,
    Achieved,
    NotAchieved,
    InternalReview,
    WaitingApproval,
}

impl CompletionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::OnProgress => "On Progress",
            Self::Achieved => "Achieved",
            Self::NotAchieved => "Not Achieved",
            Self::InternalReview => "Internal Review",
            Self::WaitingApproval => "Waiting Approval",
        }
    }

    pub fn parse(value: &str) -> Result<Self, AppError> {
        let normalized = value.trim().to_ascii_lowercase().replace(['_', '-'], " ");
        match normalized.as_str() {
            "pending" => Ok(Self::Pending),
            "on progress" => Ok(Self::OnProgress),
            "achieved" => Ok(Self::Achieved),
            "not achieved" => Ok(Self::NotAchieved),
            "internal review" => Ok(Self::InternalReview),
            "waiting approval" => Ok(Self::WaitingApproval),
            _ => Err(AppError::InvalidInput(format!(
                "unknown completion status '{value}'"
            ))),
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::InternalReview | Self::WaitingApproval)
    }

    /// Achieved and Not Achieved are the only statuses a month may be finalized with.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Achieved | Self::NotAchieved)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SubmissionStatus {
    Draft,
    Submitted,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
        }
    }

    /// Absent values are drafts.
    pub fn from_column(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("submitted") => Self::Submitted,
            _ => Self::Draft,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum UnlockStatus {
    None,
    Pending,
    Approved,
    Rejected,
}

impl UnlockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn from_column(value: &str) -> Self {
        match value.trim() {
            "pending" => Self::Pending,
            "approved" => Self::Approved,
            "rejected" => Self::Rejected,
            _ => Self::None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Month {
    Jan,
    Feb,
    Mar,
    Apr,
    May,
    Jun,
    Jul,
    Aug,
    Sep,
    Oct,
    Nov,
    Dec,
}

impl Month {
    pub const ALL: [Month; 12] = [
        Month::Jan,
        Month::Feb,
        Month::Mar,
        Month::Apr,
        Month::May,
        Month::Jun,
        Month::Jul,
        Month::Aug,
        Month::Sep,
        Month::Oct,
        Month::Nov,
        Month::Dec,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jan => "Jan",
            Self::Feb => "Feb",
            Self::Mar => "Mar",
            Self::Apr => "Apr",
            Self::May => "May",
            Self::Jun => "Jun",
            Self::Jul => "Jul",
            Self::Aug => "Aug",
            Self::Sep => "Sep",
            Self::Oct => "Oct",
            Self::Nov => "Nov",
            Self::Dec => "Dec",
        }
    }

    /// Accepts labels ("Mar", "march") or 1-based numbers.
    pub fn parse(value: &str) -> Result<Self, AppError> {
        let trimmed = value.trim();
        if let Ok(number) = trimmed.parse::<usize>() {
            if (1..=12).contains(&number) {
                return Ok(Month::ALL[number - 1]);
            }
        }
        let lower = trimmed.to_ascii_lowercase();
        Month::ALL
            .into_iter()
            .find(|month| lower.len() >= 3 && lower.starts_with(&month.as_str().to_ascii_lowercase()))
            .ok_or_else(|| AppError::InvalidInput(format!("unknown month '{value}'")))
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Department + year + month: the unit finalize and recall operate on.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct MonthScope {
    pub department_code: String,
    pub year: i32,
    pub month: Month,
}

impl MonthScope {
    pub fn new(department_code: &str, year: i32, month: Month) -> Self {
        Self {
            department_code: normalize_department(department_code),
            year,
            month,
        }
    }
}

impl fmt::Display for MonthScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.department_code, self.month, self.year)
    }
}

/// Department codes are stored trimmed and upper-cased.
pub fn normalize_department(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// The identity a request is made under.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub department_code: Option<String>,
}

impl Actor {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn in_department(&self, department_code: &str) -> bool {
        self.department_code
            .as_deref()
            .is_some_and(|own| own.eq_ignore_ascii_case(department_code.trim()))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PlanInput {
    pub department_code: String,
    pub year: i32,
    pub month: Option<Month>,
    pub category: String,
    pub area_focus: String,
    pub goal_strategy: String,
    pub action_plan: String,
    pub indicator: String,
    pub pic: String,
    pub assignee_id: Option<String>,
    pub evidence: Option<String>,
    pub report_format: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PlanChanges {
    pub category: Option<String>,
    pub area_focus: Option<String>,
    pub goal_strategy: Option<String>,
    pub action_plan: Option<String>,
    pub indicator: Option<String>,
    pub pic: Option<String>,
    pub assignee_id: Option<String>,
    pub report_format: Option<String>,
}

impl PlanChanges {
    pub fn is_empty(&self) -> bool {
        self.category.is_none()
            && self.area_focus.is_none()
            && self.goal_strategy.is_none()
            && self.action_plan.is_none()
            && self.indicator.is_none()
            && self.pic.is_none()
            && self.assignee_id.is_none()
            && self.report_format.is_none()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProgressChanges {
    pub evidence: Option<String>,
    pub outcome_link: Option<String>,
    pub remark: Option<String>,
}

impl ProgressChanges {
    pub fn is_empty(&self) -> bool {
        self.evidence.is_none() && self.outcome_link.is_none() && self.remark.is_none()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PlanQuery {
    pub department_code: Option<String>,
    pub year: Option<i32>,
    pub month: Option<Month>,
    pub submission_status: Option<SubmissionStatus>,
    pub unlock_status: Option<UnlockStatus>,
    pub deleted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewUser {
    pub id: String,
    pub full_name: String,
    pub role: Role,
    pub department_code: Option<String>,
}

/// Scope of a company-wide grade reset. Unset fields widen the scope.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResetScope {
    pub year: Option<i32>,
    pub month: Option<Month>,
    pub department_code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parse_normalizes_case_and_legacy_labels() {
        assert_eq!(Role::parse("ADMIN").unwrap(), Role::Admin);
        assert_eq!(Role::parse(" Leader ").unwrap(), Role::Leader);
        assert_eq!(Role::parse("dept_head").unwrap(), Role::Leader);
        assert_eq!(Role::parse("Dept_Head").unwrap(), Role::Leader);
        assert!(Role::parse("guest").is_err());
    }

    #[test]
    fn month_parse_accepts_labels_and_numbers() {
        assert_eq!(Month::parse("Mar").unwrap(), Month::Mar);
        assert_eq!(Month::parse("march").unwrap(), Month::Mar);
        assert_eq!(Month::parse("12").unwrap(), Month::Dec);
        assert!(Month::parse("13").is_err());
        assert!(Month::parse("ma").is_err());
        assert!(Month::Jan < Month::Dec);
    }

    #[test]
    fn completion_status_accepts_legacy_values() {
        let status = CompletionStatus::parse("Waiting Approval").unwrap();
        assert!(status.is_legacy());
        assert!(!status.is_final());
        assert_eq!(
            CompletionStatus::parse("not_achieved").unwrap(),
            CompletionStatus::NotAchieved
        );
    }

    #[test]
    fn missing_submission_status_is_draft() {
        assert_eq!(SubmissionStatus::from_column(None), SubmissionStatus::Draft);
        assert_eq!(
            SubmissionStatus::from_column(Some("submitted")),
            SubmissionStatus::Submitted
        );
    }

    #[test]
    fn resource_action_pairs_are_closed() {
        assert!(Resource::ActionPlan.supports(Action::Grade));
        assert!(!Resource::Report.supports(Action::Grade));
        assert_eq!("user".parse::<Resource>().unwrap(), Resource::User);
        assert_eq!(
            "update_status".parse::<Action>().unwrap(),
            Action::UpdateStatus
        );
    }
}
