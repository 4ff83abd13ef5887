//! Grading by the central authority.
//!
//! Approve and reject are single conditional updates keyed on
//! `submission_status = submitted`. They run outside an explicit
//! transaction so a concurrent recall is decided by whichever statement
//! the store applies first; the loser sees zero affected rows.

use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait};
use tracing::info;

use crate::app::{ensure_non_empty, finalize_transaction, App};
use crate::entities::action_plan;
use crate::error::AppError;
use crate::events::{self, EventKind, PlanEvent};
use crate::lifecycle;
use crate::model::{
    normalize_department, Action, Actor, CompletionStatus, ResetScope, Resource, SubmissionStatus,
};

impl App {
    pub async fn approve(
        &self,
        actor: &Actor,
        id: i64,
        score: i32,
        feedback: Option<String>,
    ) -> Result<action_plan::Model, AppError> {
        let plan = self.get_plan(id).await?;
        let engine = self.permission_engine().await?;
        engine.require(actor, Resource::ActionPlan, Action::Grade, Some(&plan))?;
        lifecycle::validate_score(score)?;
        lifecycle::ensure_active(&plan)?;
        lifecycle::ensure_gradable(&plan)?;

        let now = self.now();
        let active = action_plan::ActiveModel {
            status: Set(CompletionStatus::Achieved.as_str().to_string()),
            quality_score: Set(Some(score)),
            admin_feedback: Set(feedback
                .map(|text| text.trim().to_string())
                .filter(|text| !text.is_empty())),
            reviewed_by: Set(Some(actor.id.clone())),
            reviewed_at: Set(Some(now)),
            updated_at: Set(now),
            ..Default::default()
        };
        let result = action_plan::Entity::update_many()
            .set(active)
            .filter(action_plan::Column::Id.eq(id))
            .filter(lifecycle::active_condition())
            .filter(lifecycle::submitted_condition())
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(self.explain_lost_grade(id).await);
        }

        let graded = self.get_plan(id).await?;
        info!(plan_id = id, score, actor = %actor.id, "approved plan");
        events::emit(
            &self.db,
            vec![PlanEvent::for_plan(
                EventKind::GradeReceived,
                &graded,
                Some(recipient_of(&graded)),
                &actor.id,
                format!("plan id {id} graded {score}"),
            )],
            now,
        )
        .await;
        Ok(graded)
    }

    /// Sends a submitted plan back for revision.
    pub async fn reject(
        &self,
        actor: &Actor,
        id: i64,
        feedback: &str,
    ) -> Result<action_plan::Model, AppError> {
        let plan = self.get_plan(id).await?;
        let engine = self.permission_engine().await?;
        engine.require(actor, Resource::ActionPlan, Action::Grade, Some(&plan))?;
        ensure_non_empty("revision feedback", feedback)?;
        lifecycle::ensure_active(&plan)?;
        lifecycle::ensure_gradable(&plan)?;

        let now = self.now();
        let active = action_plan::ActiveModel {
            status: Set(CompletionStatus::OnProgress.as_str().to_string()),
            submission_status: Set(Some(SubmissionStatus::Draft.as_str().to_string())),
            quality_score: Set(None),
            admin_feedback: Set(Some(feedback.trim().to_string())),
            reviewed_by: Set(Some(actor.id.clone())),
            reviewed_at: Set(Some(now)),
            updated_at: Set(now),
            ..Default::default()
        };
        let result = action_plan::Entity::update_many()
            .set(active)
            .filter(action_plan::Column::Id.eq(id))
            .filter(lifecycle::active_condition())
            .filter(lifecycle::submitted_condition())
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(self.explain_lost_grade(id).await);
        }

        let returned = self.get_plan(id).await?;
        info!(plan_id = id, actor = %actor.id, "returned plan for revision");
        events::emit(
            &self.db,
            vec![PlanEvent::for_plan(
                EventKind::Kickback,
                &returned,
                Some(recipient_of(&returned)),
                &actor.id,
                format!("plan id {id} needs revision: {}", feedback.trim()),
            )],
            now,
        )
        .await;
        Ok(returned)
    }

    /// Wipes every graded plan in scope back to a Pending draft.
    ///
    /// All-or-nothing: if any selected row changes before the write, the
    /// whole reset rolls back.
    pub async fn bulk_reset_grades(
        &self,
        actor: &Actor,
        scope: &ResetScope,
        confirmation: &str,
    ) -> Result<Vec<i64>, AppError> {
        let engine = self.permission_engine().await?;
        engine.require_admin(actor, "reset grades")?;
        if confirmation != self.reset_confirmation {
            return Err(AppError::InvalidInput(format!(
                "confirmation must be exactly '{}'",
                self.reset_confirmation
            )));
        }

        let now = self.now();
        let txn = self.db.begin().await?;
        let result: Result<Vec<action_plan::Model>, AppError> = async {
            let mut select = action_plan::Entity::find()
                .filter(lifecycle::active_condition())
                .filter(lifecycle::submitted_condition())
                .filter(action_plan::Column::QualityScore.is_not_null());
            if let Some(year) = scope.year {
                select = select.filter(action_plan::Column::Year.eq(year));
            }
            if let Some(month) = scope.month {
                select = select.filter(action_plan::Column::Month.eq(month.as_str()));
            }
            if let Some(department) = scope.department_code.as_deref() {
                select = select
                    .filter(action_plan::Column::DepartmentCode.eq(normalize_department(department)));
            }
            let graded = select
                .order_by_asc(action_plan::Column::Id)
                .all(&txn)
                .await?;
            if graded.is_empty() {
                return Ok(graded);
            }

            let ids: Vec<i64> = graded.iter().map(|item| item.id).collect();
            let active = action_plan::ActiveModel {
                status: Set(CompletionStatus::Pending.as_str().to_string()),
                submission_status: Set(Some(SubmissionStatus::Draft.as_str().to_string())),
                quality_score: Set(None),
                admin_feedback: Set(None),
                outcome_link: Set(None),
                remark: Set(None),
                updated_at: Set(now),
                ..Default::default()
            };
            let updated = action_plan::Entity::update_many()
                .set(active)
                .filter(action_plan::Column::Id.is_in(ids.clone()))
                .filter(lifecycle::active_condition())
                .filter(lifecycle::submitted_condition())
                .filter(action_plan::Column::QualityScore.is_not_null())
                .exec(&txn)
                .await?;
            if updated.rows_affected != ids.len() as u64 {
                return Err(AppError::precondition(format!(
                    "{} of {} graded plans changed during the reset; nothing was reset",
                    ids.len() as u64 - updated.rows_affected,
                    ids.len()
                )));
            }
            Ok(graded)
        }
        .await;

        let reset = finalize_transaction(txn, result).await?;
        let ids: Vec<i64> = reset.iter().map(|item| item.id).collect();
        info!(count = ids.len(), actor = %actor.id, "reset grades");
        let notices = reset
            .iter()
            .map(|item| {
                PlanEvent::for_plan(
                    EventKind::StatusChange,
                    item,
                    None,
                    &actor.id,
                    format!("grade for plan id {} was reset", item.id),
                )
            })
            .collect();
        events::emit(&self.db, notices, now).await;
        Ok(ids)
    }

    /// Why a grading write matched nothing.
    async fn explain_lost_grade(&self, id: i64) -> AppError {
        match self.get_plan(id).await {
            Ok(plan) if plan.is_deleted() => {
                AppError::precondition(format!("plan id {id} was deleted"))
            }
            Ok(plan) if plan.was_recalled() => AppError::ItemRecalled(id),
            Ok(_) => AppError::precondition(format!(
                "plan id {id} changed while grading; re-fetch and retry"
            )),
            Err(err) => err,
        }
    }
}

fn recipient_of(plan: &action_plan::Model) -> String {
    plan.assignee_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| plan.pic.clone())
}
