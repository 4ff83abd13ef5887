//! Time-bounded edit access for locked plans.
//!
//! Per record: `none -> pending -> approved | rejected`, and back to `none`
//! on revoke. Approval stamps `approved_until`; nothing ever clears it on a
//! timer. Editability compares it to the clock at write time.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sea_orm::{
    ColumnTrait, Condition, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use tracing::info;

use crate::app::{
    ensure_non_empty, finalize_transaction, find_plan_with_conn, join_ids, scope_condition,
    unique_ids, App, BatchFailure, BatchReport,
};
use crate::entities::action_plan;
use crate::error::AppError;
use crate::events::{self, EventKind, PlanEvent};
use crate::lifecycle::{self, UnlockExpiry};
use crate::model::{
    normalize_department, Action, Actor, Month, MonthScope, Resource, SubmissionStatus,
    UnlockStatus,
};
use crate::permission::PermissionEngine;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnlockAction {
    Approve,
    Reject,
}

/// Records requested together: same department month, same requester.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UnlockBatchKey {
    pub department_code: String,
    pub year: i32,
    pub month: Month,
    pub requested_by: String,
}

impl UnlockBatchKey {
    pub fn new(department_code: &str, year: i32, month: Month, requested_by: &str) -> Self {
        Self {
            department_code: normalize_department(department_code),
            year,
            month,
            requested_by: requested_by.trim().to_string(),
        }
    }

    fn matches(&self) -> Condition {
        scope_condition(&MonthScope::new(&self.department_code, self.year, self.month))
            .add(action_plan::Column::UnlockRequestedBy.eq(self.requested_by.as_str()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnlockBatch {
    pub key: UnlockBatchKey,
    pub plan_ids: Vec<i64>,
    pub reason: Option<String>,
    pub requested_at: Option<DateTime<Utc>>,
}

impl App {
    /// Marks submitted plans as waiting for an unlock decision.
    ///
    /// Every id must belong to one department month. Records that are not
    /// eligible are reported individually; the rest move to `pending`.
    pub async fn request_unlock(
        &self,
        actor: &Actor,
        ids: &[i64],
        reason: &str,
    ) -> Result<BatchReport, AppError> {
        ensure_non_empty("unlock reason", reason)?;
        let ids = unique_ids(ids);
        if ids.is_empty() {
            return Err(AppError::InvalidInput(
                "at least one plan id is required".to_string(),
            ));
        }

        let plans = action_plan::Entity::find()
            .filter(action_plan::Column::Id.is_in(ids.clone()))
            .order_by_asc(action_plan::Column::Id)
            .all(&self.db)
            .await?;
        let missing: Vec<i64> = ids
            .iter()
            .copied()
            .filter(|id| !plans.iter().any(|plan| plan.id == *id))
            .collect();
        if !missing.is_empty() {
            return Err(AppError::NotFound(format!("plan id(s) {}", join_ids(&missing))));
        }
        if let Some(first) = plans.first() {
            let mixed = plans.iter().any(|plan| {
                plan.department_code != first.department_code
                    || plan.year != first.year
                    || plan.month != first.month
            });
            if mixed {
                return Err(AppError::InvalidInput(
                    "unlock requests must cover a single department month".to_string(),
                ));
            }
        }

        let engine = self.permission_engine().await?;
        for plan in &plans {
            engine.require(actor, Resource::ActionPlan, Action::Submit, Some(plan))?;
        }

        let now = self.now();
        let txn = self.db.begin().await?;
        let result: Result<BatchReport, AppError> = async {
            let mut report = BatchReport::default();
            for plan in &plans {
                if let Some(why) = request_ineligible(plan, now) {
                    report.failures.push(BatchFailure {
                        id: plan.id,
                        reason: why,
                    });
                    continue;
                }
                let active = action_plan::ActiveModel {
                    unlock_status: Set(UnlockStatus::Pending.as_str().to_string()),
                    unlock_reason: Set(Some(reason.trim().to_string())),
                    unlock_requested_by: Set(Some(actor.id.clone())),
                    unlock_requested_at: Set(Some(now)),
                    unlock_rejection_reason: Set(None),
                    unlock_approved_by: Set(None),
                    unlock_approved_at: Set(None),
                    approved_until: Set(None),
                    updated_at: Set(now),
                    ..Default::default()
                };
                let updated = action_plan::Entity::update_many()
                    .set(active)
                    .filter(action_plan::Column::Id.eq(plan.id))
                    .filter(lifecycle::active_condition())
                    .filter(lifecycle::submitted_condition())
                    .filter(lifecycle::unlock_lapsed_condition(now))
                    .exec(&txn)
                    .await?;
                if updated.rows_affected == 0 {
                    report.failures.push(BatchFailure {
                        id: plan.id,
                        reason: "changed concurrently".to_string(),
                    });
                } else {
                    report.succeeded.push(plan.id);
                }
            }
            Ok(report)
        }
        .await;

        let report = finalize_transaction(txn, result).await?;
        info!(
            requested = report.success_count(),
            failed = report.failures.len(),
            actor = %actor.id,
            "requested unlock"
        );
        Ok(report)
    }

    /// Pending requests grouped by department month and requester.
    pub async fn list_unlock_batches(&self, actor: &Actor) -> Result<Vec<UnlockBatch>, AppError> {
        let mut select = action_plan::Entity::find()
            .filter(lifecycle::active_condition())
            .filter(action_plan::Column::UnlockStatus.eq(UnlockStatus::Pending.as_str()));
        if !actor.is_admin() {
            let department = actor.department_code.clone().unwrap_or_default();
            select = select.filter(action_plan::Column::DepartmentCode.eq(department));
        }
        let pending = select
            .order_by_asc(action_plan::Column::Id)
            .all(&self.db)
            .await?;

        let mut batches: BTreeMap<UnlockBatchKey, UnlockBatch> = BTreeMap::new();
        for plan in pending {
            let month = Month::parse(&plan.month)?;
            let key = UnlockBatchKey::new(
                &plan.department_code,
                plan.year,
                month,
                plan.unlock_requested_by.as_deref().unwrap_or_default(),
            );
            let batch = batches.entry(key.clone()).or_insert_with(|| UnlockBatch {
                key,
                plan_ids: Vec::new(),
                reason: plan.unlock_reason.clone(),
                requested_at: plan.unlock_requested_at,
            });
            batch.plan_ids.push(plan.id);
            if plan.unlock_requested_at < batch.requested_at {
                batch.requested_at = plan.unlock_requested_at;
            }
        }
        Ok(batches.into_values().collect())
    }

    /// Opens every record of a pending batch until the chosen expiry.
    pub async fn approve_unlock(
        &self,
        actor: &Actor,
        key: &UnlockBatchKey,
        expiry: UnlockExpiry,
    ) -> Result<Vec<action_plan::Model>, AppError> {
        let now = self.now();
        let until = expiry.resolve_future(now)?;
        self.decide_batch(actor, key, UnlockAction::Approve, Some(until), None, now)
            .await
    }

    pub async fn reject_unlock(
        &self,
        actor: &Actor,
        key: &UnlockBatchKey,
        reason: Option<String>,
    ) -> Result<Vec<action_plan::Model>, AppError> {
        let now = self.now();
        self.decide_batch(actor, key, UnlockAction::Reject, None, reason, now)
            .await
    }

    /// Resets every record of a batch to `none`. Records already at `none`
    /// are left as they are.
    pub async fn revoke_unlock(
        &self,
        actor: &Actor,
        key: &UnlockBatchKey,
    ) -> Result<Vec<action_plan::Model>, AppError> {
        let engine = self.permission_engine().await?;
        let now = self.now();
        let txn = self.db.begin().await?;
        let result: Result<Vec<(action_plan::Model, bool)>, AppError> = async {
            let records = action_plan::Entity::find()
                .filter(key.matches())
                .filter(lifecycle::active_condition())
                .order_by_asc(action_plan::Column::Id)
                .all(&txn)
                .await?;
            let mut revoked = Vec::new();
            for record in records {
                revoked.push(revoke_with_conn(&txn, &engine, actor, record.id, now).await?);
            }
            Ok(revoked)
        }
        .await;

        let revoked = finalize_transaction(txn, result).await?;
        self.emit_revoked(actor, &revoked, now).await;
        Ok(revoked.into_iter().map(|(plan, _)| plan).collect())
    }

    /// Single-record approve/reject; the batch operations are built on it.
    pub async fn process_unlock_request(
        &self,
        actor: &Actor,
        record_id: i64,
        action: UnlockAction,
        expiry: Option<UnlockExpiry>,
        rejection_reason: Option<String>,
    ) -> Result<action_plan::Model, AppError> {
        let engine = self.permission_engine().await?;
        let now = self.now();
        let until = match (action, expiry) {
            (UnlockAction::Approve, Some(expiry)) => Some(expiry.resolve_future(now)?),
            (UnlockAction::Approve, None) => {
                return Err(AppError::InvalidInput(
                    "an expiry is required to approve an unlock".to_string(),
                ))
            }
            (UnlockAction::Reject, _) => None,
        };

        let txn = self.db.begin().await?;
        let result = process_with_conn(
            &txn,
            &engine,
            actor,
            record_id,
            action,
            until,
            rejection_reason.as_deref(),
            now,
        )
        .await;
        let updated = finalize_transaction(txn, result).await?;
        self.emit_decisions(actor, action, std::slice::from_ref(&updated), now)
            .await;
        Ok(updated)
    }

    /// Ends any unlock state immediately. Calling it on a record already at
    /// `none` returns the record unchanged.
    pub async fn revoke_unlock_access(
        &self,
        actor: &Actor,
        record_id: i64,
    ) -> Result<action_plan::Model, AppError> {
        let engine = self.permission_engine().await?;
        let now = self.now();
        let txn = self.db.begin().await?;
        let result = revoke_with_conn(&txn, &engine, actor, record_id, now).await;
        let revoked = finalize_transaction(txn, result).await?;
        self.emit_revoked(actor, std::slice::from_ref(&revoked), now)
            .await;
        Ok(revoked.0)
    }

    async fn decide_batch(
        &self,
        actor: &Actor,
        key: &UnlockBatchKey,
        action: UnlockAction,
        until: Option<DateTime<Utc>>,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Vec<action_plan::Model>, AppError> {
        let engine = self.permission_engine().await?;
        let txn = self.db.begin().await?;
        let result: Result<Vec<action_plan::Model>, AppError> = async {
            let records = action_plan::Entity::find()
                .filter(key.matches())
                .filter(lifecycle::active_condition())
                .filter(action_plan::Column::UnlockStatus.eq(UnlockStatus::Pending.as_str()))
                .order_by_asc(action_plan::Column::Id)
                .all(&txn)
                .await?;
            if records.is_empty() {
                return Err(AppError::NotFound(format!(
                    "pending unlock batch for {} {} {} by {}",
                    key.department_code, key.month, key.year, key.requested_by
                )));
            }
            let mut decided = Vec::with_capacity(records.len());
            for record in records {
                decided.push(
                    process_with_conn(
                        &txn,
                        &engine,
                        actor,
                        record.id,
                        action,
                        until,
                        reason.as_deref(),
                        now,
                    )
                    .await?,
                );
            }
            Ok(decided)
        }
        .await;

        let decided = finalize_transaction(txn, result).await?;
        info!(
            batch = %format!("{} {} {}", key.department_code, key.month, key.year),
            requester = %key.requested_by,
            count = decided.len(),
            approved = action == UnlockAction::Approve,
            actor = %actor.id,
            "decided unlock batch"
        );
        self.emit_decisions(actor, action, &decided, now).await;
        Ok(decided)
    }

    async fn emit_decisions(
        &self,
        actor: &Actor,
        action: UnlockAction,
        records: &[action_plan::Model],
        now: DateTime<Utc>,
    ) {
        let notices = records
            .iter()
            .map(|record| {
                let (kind, message) = match action {
                    UnlockAction::Approve => (
                        EventKind::UnlockApproved,
                        format!(
                            "unlock for plan id {} approved until {}",
                            record.id,
                            record
                                .approved_until
                                .map(|until| until.format("%Y-%m-%d %H:%M").to_string())
                                .unwrap_or_default()
                        ),
                    ),
                    UnlockAction::Reject => (
                        EventKind::UnlockRejected,
                        format!("unlock for plan id {} rejected", record.id),
                    ),
                };
                PlanEvent::for_plan(
                    kind,
                    record,
                    record.unlock_requested_by.clone(),
                    &actor.id,
                    message,
                )
            })
            .collect();
        events::emit(&self.db, notices, now).await;
    }

    async fn emit_revoked(
        &self,
        actor: &Actor,
        records: &[(action_plan::Model, bool)],
        now: DateTime<Utc>,
    ) {
        let notices = records
            .iter()
            .filter(|(_, changed)| *changed)
            .map(|(record, _)| {
                PlanEvent::for_plan(
                    EventKind::UnlockRevoked,
                    record,
                    record.unlock_requested_by.clone(),
                    &actor.id,
                    format!("unlock for plan id {} revoked", record.id),
                )
            })
            .collect::<Vec<_>>();
        if !notices.is_empty() {
            info!(count = notices.len(), actor = %actor.id, "revoked unlock access");
        }
        events::emit(&self.db, notices, now).await;
    }
}

fn request_ineligible(plan: &action_plan::Model, now: DateTime<Utc>) -> Option<String> {
    if plan.is_deleted() {
        return Some("plan is deleted".to_string());
    }
    if plan.submission() == SubmissionStatus::Draft {
        return Some("plan is a draft and already editable".to_string());
    }
    if lifecycle::unlock_lapsed(plan, now) {
        return None;
    }
    match plan.unlock() {
        UnlockStatus::Approved => Some("plan is already unlocked".to_string()),
        other => Some(format!(
            "unlock is already {}; revoke it before requesting again",
            other.as_str()
        )),
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_with_conn<C: ConnectionTrait>(
    db: &C,
    engine: &PermissionEngine,
    actor: &Actor,
    record_id: i64,
    action: UnlockAction,
    until: Option<DateTime<Utc>>,
    rejection_reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<action_plan::Model, AppError> {
    let plan = find_plan_with_conn(db, record_id).await?;
    engine.require(actor, Resource::ActionPlan, Action::Grade, Some(&plan))?;
    lifecycle::ensure_active(&plan)?;
    if plan.unlock() != UnlockStatus::Pending {
        return Err(AppError::precondition(format!(
            "plan id {record_id} has no pending unlock request (unlock is {})",
            plan.unlock().as_str()
        )));
    }

    let active = match action {
        UnlockAction::Approve => {
            let until = until.ok_or_else(|| {
                AppError::InvalidInput("an expiry is required to approve an unlock".to_string())
            })?;
            action_plan::ActiveModel {
                unlock_status: Set(UnlockStatus::Approved.as_str().to_string()),
                approved_until: Set(Some(until)),
                unlock_approved_by: Set(Some(actor.id.clone())),
                unlock_approved_at: Set(Some(now)),
                unlock_rejection_reason: Set(None),
                updated_at: Set(now),
                ..Default::default()
            }
        }
        UnlockAction::Reject => action_plan::ActiveModel {
            unlock_status: Set(UnlockStatus::Rejected.as_str().to_string()),
            approved_until: Set(None),
            unlock_rejection_reason: Set(rejection_reason
                .map(|text| text.trim().to_string())
                .filter(|text| !text.is_empty())),
            updated_at: Set(now),
            ..Default::default()
        },
    };
    let updated = action_plan::Entity::update_many()
        .set(active)
        .filter(action_plan::Column::Id.eq(record_id))
        .filter(action_plan::Column::UnlockStatus.eq(UnlockStatus::Pending.as_str()))
        .exec(db)
        .await?;
    if updated.rows_affected == 0 {
        return Err(AppError::precondition(format!(
            "unlock request for plan id {record_id} changed concurrently; re-fetch and retry"
        )));
    }
    find_plan_with_conn(db, record_id).await
}

/// Returns the record and whether anything changed.
async fn revoke_with_conn<C: ConnectionTrait>(
    db: &C,
    engine: &PermissionEngine,
    actor: &Actor,
    record_id: i64,
    now: DateTime<Utc>,
) -> Result<(action_plan::Model, bool), AppError> {
    let plan = find_plan_with_conn(db, record_id).await?;
    engine.require(actor, Resource::ActionPlan, Action::Grade, Some(&plan))?;
    lifecycle::ensure_active(&plan)?;
    let current = plan.unlock();
    if current == UnlockStatus::None {
        return Ok((plan, false));
    }

    let active = action_plan::ActiveModel {
        unlock_status: Set(UnlockStatus::None.as_str().to_string()),
        approved_until: Set(None),
        updated_at: Set(now),
        ..Default::default()
    };
    let updated = action_plan::Entity::update_many()
        .set(active)
        .filter(action_plan::Column::Id.eq(record_id))
        .filter(lifecycle::active_condition())
        .filter(action_plan::Column::UnlockStatus.eq(current.as_str()))
        .exec(db)
        .await?;
    if updated.rows_affected == 0 {
        let latest = find_plan_with_conn(db, record_id).await?;
        if latest.unlock() == UnlockStatus::None {
            return Ok((latest, false));
        }
        return Err(AppError::precondition(format!(
            "unlock state of plan id {record_id} changed concurrently; re-fetch and retry"
        )));
    }
    Ok((find_plan_with_conn(db, record_id).await?, true))
}
