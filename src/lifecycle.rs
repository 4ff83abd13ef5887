//! Lock-state rules for a single action plan.
//!
//! `submission_status` and the presence of `quality_score` collapse into
//! three phases. Completion status is tracked separately and never changes
//! the phase on its own. The unlock window is evaluated against the clock
//! on every call; nothing here is cached.

use chrono::{DateTime, Duration, Utc};
use sea_orm::{ColumnTrait, Condition};

use crate::entities::action_plan;
use crate::error::{AppError, Blocker};
use crate::model::{SubmissionStatus, UnlockStatus};

pub const MIN_SCORE: i32 = 0;
pub const MAX_SCORE: i32 = 100;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Draft,
    SubmittedUngraded,
    SubmittedGraded,
}

impl Phase {
    pub fn of(plan: &action_plan::Model) -> Self {
        match (plan.submission(), plan.is_graded()) {
            (SubmissionStatus::Draft, _) => Self::Draft,
            (SubmissionStatus::Submitted, false) => Self::SubmittedUngraded,
            (SubmissionStatus::Submitted, true) => Self::SubmittedGraded,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::SubmittedUngraded => "submitted",
            Self::SubmittedGraded => "graded",
        }
    }
}

pub fn unlock_window_open(plan: &action_plan::Model, now: DateTime<Utc>) -> bool {
    plan.unlock() == UnlockStatus::Approved
        && plan.approved_until.is_some_and(|until| until > now)
}

/// Approvals whose window has passed behave like `none`.
pub fn unlock_lapsed(plan: &action_plan::Model, now: DateTime<Utc>) -> bool {
    match plan.unlock() {
        UnlockStatus::None => true,
        UnlockStatus::Approved => !unlock_window_open(plan, now),
        UnlockStatus::Pending | UnlockStatus::Rejected => false,
    }
}

/// Whether the plan's owner may change it right now.
pub fn is_editable(plan: &action_plan::Model, now: DateTime<Utc>) -> bool {
    plan.submission() == SubmissionStatus::Draft || unlock_window_open(plan, now)
}

pub fn ensure_active(plan: &action_plan::Model) -> Result<(), AppError> {
    if plan.is_deleted() {
        return Err(AppError::precondition(format!(
            "plan id {} is deleted; restore it first",
            plan.id
        )));
    }
    Ok(())
}

pub fn ensure_editable(plan: &action_plan::Model, now: DateTime<Utc>) -> Result<(), AppError> {
    ensure_active(plan)?;
    if is_editable(plan, now) {
        return Ok(());
    }
    let detail = match (plan.unlock(), plan.approved_until) {
        (UnlockStatus::Approved, Some(until)) => {
            format!("unlock window expired at {}", until.format("%Y-%m-%d %H:%M"))
        }
        (UnlockStatus::Pending, _) => "unlock request is pending".to_string(),
        _ => "request an unlock to edit it".to_string(),
    };
    Err(AppError::precondition(format!(
        "plan id {} is locked ({}); {detail}",
        plan.id,
        Phase::of(plan).as_str()
    )))
}

/// Grading needs a submitted plan. A draft pulled back by its department
/// reports the recall so the grader re-fetches.
pub fn ensure_gradable(plan: &action_plan::Model) -> Result<(), AppError> {
    if plan.was_recalled() {
        return Err(AppError::ItemRecalled(plan.id));
    }
    if plan.submission() == SubmissionStatus::Draft {
        return Err(AppError::precondition(format!(
            "plan id {} is a draft and has not been submitted for grading",
            plan.id
        )));
    }
    Ok(())
}

/// Items that stop a department month from being finalized.
///
/// Drafts must carry a final completion status, and no item in scope may
/// have an unlock request in flight.
pub fn finalize_blockers(items: &[action_plan::Model]) -> Vec<Blocker> {
    let mut blockers = Vec::new();
    for item in items.iter().filter(|item| !item.is_deleted()) {
        if item.unlock() == UnlockStatus::Pending {
            blockers.push(Blocker {
                id: item.id,
                reason: "unlock request is pending".to_string(),
            });
            continue;
        }
        if item.submission() == SubmissionStatus::Draft && !item.completion().is_final() {
            blockers.push(Blocker {
                id: item.id,
                reason: format!(
                    "status is {}; must be Achieved or Not Achieved",
                    item.completion().as_str()
                ),
            });
        }
    }
    blockers
}

pub fn validate_score(score: i32) -> Result<(), AppError> {
    if !(MIN_SCORE..=MAX_SCORE).contains(&score) {
        return Err(AppError::InvalidInput(format!(
            "quality score must be between {MIN_SCORE} and {MAX_SCORE}, got {score}"
        )));
    }
    Ok(())
}

/// How long an approved unlock stays open.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnlockExpiry {
    Hours24,
    Hours48,
    Week,
    At(DateTime<Utc>),
}

impl UnlockExpiry {
    pub fn from_hours(hours: u32) -> Result<Self, AppError> {
        match hours {
            24 => Ok(Self::Hours24),
            48 => Ok(Self::Hours48),
            168 => Ok(Self::Week),
            other => Err(AppError::InvalidInput(format!(
                "unlock duration must be 24, 48 or 168 hours, got {other}"
            ))),
        }
    }

    pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Hours24 => now + Duration::hours(24),
            Self::Hours48 => now + Duration::hours(48),
            Self::Week => now + Duration::hours(168),
            Self::At(at) => *at,
        }
    }

    /// Resolves against `now` and refuses instants that are not strictly later.
    pub fn resolve_future(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, AppError> {
        let until = self.resolve(now);
        if until <= now {
            return Err(AppError::InvalidInput(format!(
                "unlock expiry {} must be in the future",
                until.to_rfc3339()
            )));
        }
        Ok(until)
    }
}

pub fn active_condition() -> Condition {
    Condition::all().add(action_plan::Column::DeletedAt.is_null())
}

pub fn draft_condition() -> Condition {
    Condition::any()
        .add(action_plan::Column::SubmissionStatus.eq(SubmissionStatus::Draft.as_str()))
        .add(action_plan::Column::SubmissionStatus.is_null())
}

pub fn submitted_condition() -> Condition {
    Condition::all().add(
        action_plan::Column::SubmissionStatus.eq(SubmissionStatus::Submitted.as_str()),
    )
}

pub fn unlock_window_condition(now: DateTime<Utc>) -> Condition {
    Condition::all()
        .add(action_plan::Column::UnlockStatus.eq(UnlockStatus::Approved.as_str()))
        .add(action_plan::Column::ApprovedUntil.gt(now))
}

/// Store-side form of [`unlock_lapsed`].
pub fn unlock_lapsed_condition(now: DateTime<Utc>) -> Condition {
    Condition::any()
        .add(action_plan::Column::UnlockStatus.eq(UnlockStatus::None.as_str()))
        .add(
            Condition::all()
                .add(action_plan::Column::UnlockStatus.eq(UnlockStatus::Approved.as_str()))
                .add(
                    Condition::any()
                        .add(action_plan::Column::ApprovedUntil.is_null())
                        .add(action_plan::Column::ApprovedUntil.lte(now)),
                ),
        )
}

/// Store-side form of [`is_editable`], re-checked by every conditional write.
pub fn editable_condition(now: DateTime<Utc>) -> Condition {
    Condition::all().add(active_condition()).add(
        Condition::any()
            .add(draft_condition())
            .add(unlock_window_condition(now)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 10, 9, 0, 0).unwrap()
    }

    fn plan(id: i64) -> action_plan::Model {
        action_plan::Model {
            id,
            department_code: "OPS".to_string(),
            year: 2026,
            month: "May".to_string(),
            category: "Quality".to_string(),
            area_focus: "Process".to_string(),
            goal_strategy: "Standardize".to_string(),
            action_plan: "Write SOP".to_string(),
            indicator: "SOP published".to_string(),
            pic: "Ayu".to_string(),
            assignee_id: None,
            evidence: None,
            report_format: None,
            outcome_link: None,
            remark: None,
            status: "Achieved".to_string(),
            submission_status: Some("draft".to_string()),
            recalled_at: None,
            quality_score: None,
            admin_feedback: None,
            reviewed_by: None,
            reviewed_at: None,
            deleted_at: None,
            deleted_by: None,
            deletion_reason: None,
            unlock_status: "none".to_string(),
            unlock_reason: None,
            unlock_requested_by: None,
            unlock_requested_at: None,
            unlock_rejection_reason: None,
            unlock_approved_by: None,
            unlock_approved_at: None,
            approved_until: None,
            created_at: now(),
            updated_at: now(),
        }
    }

    #[test]
    fn phases_follow_submission_and_score() {
        let mut item = plan(1);
        assert_eq!(Phase::of(&item), Phase::Draft);
        item.submission_status = None;
        assert_eq!(Phase::of(&item), Phase::Draft);
        item.submission_status = Some("submitted".to_string());
        assert_eq!(Phase::of(&item), Phase::SubmittedUngraded);
        item.quality_score = Some(90);
        assert_eq!(Phase::of(&item), Phase::SubmittedGraded);
    }

    #[test]
    fn submitted_plan_is_editable_only_inside_unlock_window() {
        let mut item = plan(1);
        item.submission_status = Some("submitted".to_string());
        assert!(!is_editable(&item, now()));

        item.unlock_status = "approved".to_string();
        item.approved_until = Some(now() + Duration::hours(1));
        assert!(is_editable(&item, now()));
        assert!(!is_editable(&item, now() + Duration::hours(1)));
        assert!(!is_editable(&item, now() + Duration::hours(2)));
    }

    #[test]
    fn expired_window_reports_expiry() {
        let mut item = plan(3);
        item.submission_status = Some("submitted".to_string());
        item.unlock_status = "approved".to_string();
        item.approved_until = Some(now() - Duration::minutes(1));
        let err = ensure_editable(&item, now()).unwrap_err();
        assert_eq!(err.code(), "PRECONDITION_FAILED");
        assert!(err.to_string().contains("unlock window expired"));
    }

    #[test]
    fn approval_lapses_once_window_closes() {
        let mut item = plan(5);
        item.submission_status = Some("submitted".to_string());
        assert!(unlock_lapsed(&item, now()));

        item.unlock_status = "approved".to_string();
        item.approved_until = Some(now() + Duration::hours(1));
        assert!(!unlock_lapsed(&item, now()));
        assert!(unlock_lapsed(&item, now() + Duration::hours(1)));

        item.unlock_status = "rejected".to_string();
        item.approved_until = None;
        assert!(!unlock_lapsed(&item, now()));
    }

    #[test]
    fn grading_distinguishes_recalled_from_unsubmitted_drafts() {
        let mut item = plan(6);
        assert_eq!(ensure_gradable(&item).unwrap_err().code(), "PRECONDITION_FAILED");
        item.recalled_at = Some(now());
        assert_eq!(ensure_gradable(&item).unwrap_err().code(), "ITEM_RECALLED");
        item.submission_status = Some("submitted".to_string());
        assert!(ensure_gradable(&item).is_ok());
    }

    #[test]
    fn deleted_plan_is_never_editable() {
        let mut item = plan(4);
        item.deleted_at = Some(now());
        let err = ensure_editable(&item, now()).unwrap_err();
        assert!(err.to_string().contains("deleted"));
    }

    #[test]
    fn finalize_blockers_pick_incomplete_drafts_and_pending_unlocks() {
        let mut pending = plan(1);
        pending.status = "Pending".to_string();
        let done = plan(2);
        let mut not_achieved = plan(3);
        not_achieved.status = "Not Achieved".to_string();
        let mut unlocking = plan(4);
        unlocking.submission_status = Some("submitted".to_string());
        unlocking.unlock_status = "pending".to_string();
        let mut deleted = plan(5);
        deleted.status = "Pending".to_string();
        deleted.deleted_at = Some(now());

        let blockers = finalize_blockers(&[pending, done, not_achieved, unlocking, deleted]);
        let ids: Vec<i64> = blockers.iter().map(|blocker| blocker.id).collect();
        assert_eq!(ids, vec![1, 4]);
    }

    #[test]
    fn score_bounds_are_inclusive() {
        assert!(validate_score(0).is_ok());
        assert!(validate_score(100).is_ok());
        assert!(validate_score(101).is_err());
        assert!(validate_score(-1).is_err());
    }

    #[test]
    fn unlock_expiry_presets_and_custom_instants() {
        assert_eq!(
            UnlockExpiry::from_hours(48).unwrap().resolve(now()),
            now() + Duration::hours(48)
        );
        assert!(UnlockExpiry::from_hours(12).is_err());
        assert!(UnlockExpiry::At(now()).resolve_future(now()).is_err());
        assert!(UnlockExpiry::At(now() - Duration::seconds(1))
            .resolve_future(now())
            .is_err());
        assert_eq!(
            UnlockExpiry::At(now() + Duration::seconds(1))
                .resolve_future(now())
                .unwrap(),
            now() + Duration::seconds(1)
        );
    }
}
