use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::model::{CompletionStatus, SubmissionStatus, UnlockStatus};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "action_plans")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub department_code: String,
    pub year: i32,
    pub month: String,
    pub category: String,
    pub area_focus: String,
    pub goal_strategy: String,
    pub action_plan: String,
    pub indicator: String,
    pub pic: String,
    pub assignee_id: Option<String>,
    pub evidence: Option<String>,
    pub report_format: Option<String>,
    pub outcome_link: Option<String>,
    pub remark: Option<String>,
    pub status: String,
    pub submission_status: Option<String>,
    pub recalled_at: Option<DateTimeUtc>,
    pub quality_score: Option<i32>,
    pub admin_feedback: Option<String>,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTimeUtc>,
    pub deleted_at: Option<DateTimeUtc>,
    pub deleted_by: Option<String>,
    pub deletion_reason: Option<String>,
    pub unlock_status: String,
    pub unlock_reason: Option<String>,
    pub unlock_requested_by: Option<String>,
    pub unlock_requested_at: Option<DateTimeUtc>,
    pub unlock_rejection_reason: Option<String>,
    pub unlock_approved_by: Option<String>,
    pub unlock_approved_at: Option<DateTimeUtc>,
    pub approved_until: Option<DateTimeUtc>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

impl Model {
    /// Unknown labels read back as Pending rather than failing the row.
    pub fn completion(&self) -> CompletionStatus {
        CompletionStatus::parse(&self.status).unwrap_or(CompletionStatus::Pending)
    }

    pub fn submission(&self) -> SubmissionStatus {
        SubmissionStatus::from_column(self.submission_status.as_deref())
    }

    pub fn unlock(&self) -> UnlockStatus {
        UnlockStatus::from_column(&self.unlock_status)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_graded(&self) -> bool {
        self.quality_score.is_some()
    }

    /// A draft that was submitted and then pulled back by its department.
    pub fn was_recalled(&self) -> bool {
        self.submission() == SubmissionStatus::Draft && self.recalled_at.is_some()
    }
}

#[derive(Copy, Clone, Debug, EnumIter)]
pub enum Relation {
    Notification,
}

impl RelationTrait for Relation {
    fn def(&self) -> RelationDef {
        match self {
            Self::Notification => Entity::has_many(super::notification::Entity).into(),
        }
    }
}

impl Related<super::notification::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Notification.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
