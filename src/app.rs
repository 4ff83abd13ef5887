use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection,
    DatabaseTransaction, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use tokio::sync::Mutex;
use tracing::info;

use crate::clock::Clock;
use crate::config::Config;
use crate::entities::{action_plan, notification, role_permission, user};
use crate::error::{AppError, Blocker};
use crate::events::{self, EventKind, PlanEvent};
use crate::lifecycle::{self, Phase};
use crate::model::{
    normalize_department, Action, Actor, CompletionStatus, MonthScope, NewUser, PlanChanges,
    PlanInput, PlanQuery, ProgressChanges, Resource, Role, SubmissionStatus, UnlockStatus,
};
use crate::permission::{
    self, rule_tier, PermissionCache, PermissionEngine, PermissionMatrix, RuleTier,
};

pub struct App {
    pub(crate) db: DatabaseConnection,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) reset_confirmation: String,
    permissions: Mutex<PermissionCache>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchFailure {
    pub id: i64,
    pub reason: String,
}

/// Per-record outcome of a multi-record transition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: Vec<i64>,
    pub failures: Vec<BatchFailure>,
}

impl BatchReport {
    pub fn success_count(&self) -> usize {
        self.succeeded.len()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecallReport {
    pub recalled: Vec<i64>,
    /// Graded items in the month, left submitted.
    pub graded_kept: Vec<i64>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MonthSummary {
    pub draft: usize,
    pub submitted_ungraded: usize,
    pub graded: usize,
    pub deleted: usize,
    pub pending_unlock: usize,
    pub average_score: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PermissionRow {
    pub role: Role,
    pub resource: Resource,
    pub action: Action,
    pub tier: RuleTier,
    pub allowed: bool,
}

impl App {
    pub fn new(db: DatabaseConnection, clock: Arc<dyn Clock>, config: &Config) -> Self {
        Self {
            db,
            clock,
            reset_confirmation: config.reset_confirmation.clone(),
            permissions: Mutex::new(PermissionCache::new(config.permission_cache_ttl)),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Current matrix, reloaded from the store once the cached copy is stale.
    pub async fn permission_engine(&self) -> Result<PermissionEngine, AppError> {
        let now = self.now();
        let mut cache = self.permissions.lock().await;
        if let Some(matrix) = cache.get(now) {
            return Ok(PermissionEngine::new(matrix));
        }
        let rows = role_permission::Entity::find().all(&self.db).await?;
        tracing::debug!(rows = rows.len(), "reloaded permission matrix");
        let matrix = cache.store(PermissionMatrix::from_rows(&rows), now);
        Ok(PermissionEngine::new(matrix))
    }

    pub async fn resolve_actor(&self, user_id: &str) -> Result<Actor, AppError> {
        let model = user::Entity::find_by_id(user_id.trim().to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user id {user_id}")))?;
        actor_from_user(&model)
    }

    pub async fn get_plan(&self, id: i64) -> Result<action_plan::Model, AppError> {
        find_plan_with_conn(&self.db, id).await
    }

    pub async fn list_plans(&self, query: &PlanQuery) -> Result<Vec<action_plan::Model>, AppError> {
        let mut select = action_plan::Entity::find();
        select = if query.deleted {
            select.filter(action_plan::Column::DeletedAt.is_not_null())
        } else {
            select.filter(lifecycle::active_condition())
        };
        if let Some(department) = query.department_code.as_deref() {
            select = select
                .filter(action_plan::Column::DepartmentCode.eq(normalize_department(department)));
        }
        if let Some(year) = query.year {
            select = select.filter(action_plan::Column::Year.eq(year));
        }
        if let Some(month) = query.month {
            select = select.filter(action_plan::Column::Month.eq(month.as_str()));
        }
        match query.submission_status {
            Some(SubmissionStatus::Draft) => select = select.filter(lifecycle::draft_condition()),
            Some(SubmissionStatus::Submitted) => {
                select = select.filter(lifecycle::submitted_condition())
            }
            None => {}
        }
        if let Some(unlock) = query.unlock_status {
            select = select.filter(action_plan::Column::UnlockStatus.eq(unlock.as_str()));
        }
        Ok(select
            .order_by_asc(action_plan::Column::Year)
            .order_by_asc(action_plan::Column::Id)
            .all(&self.db)
            .await?)
    }

    pub async fn month_summary(&self, scope: &MonthScope) -> Result<MonthSummary, AppError> {
        let scope = MonthScope::new(&scope.department_code, scope.year, scope.month);
        let items = action_plan::Entity::find()
            .filter(scope_condition(&scope))
            .all(&self.db)
            .await?;
        let mut summary = MonthSummary::default();
        let mut scores = Vec::new();
        for item in &items {
            if item.is_deleted() {
                summary.deleted += 1;
                continue;
            }
            match Phase::of(item) {
                Phase::Draft => summary.draft += 1,
                Phase::SubmittedUngraded => summary.submitted_ungraded += 1,
                Phase::SubmittedGraded => summary.graded += 1,
            }
            if item.unlock() == UnlockStatus::Pending {
                summary.pending_unlock += 1;
            }
            if let Some(score) = item.quality_score {
                scores.push(score);
            }
        }
        if !scores.is_empty() {
            let total: i64 = scores.iter().map(|score| i64::from(*score)).sum();
            summary.average_score = Some(total as f64 / scores.len() as f64);
        }
        Ok(summary)
    }

    pub async fn create_plan(
        &self,
        actor: &Actor,
        input: PlanInput,
    ) -> Result<action_plan::Model, AppError> {
        let month = input
            .month
            .ok_or_else(|| AppError::InvalidInput("month is required".to_string()))?;
        ensure_non_empty("department code", &input.department_code)?;
        ensure_non_empty("action plan", &input.action_plan)?;
        ensure_non_empty("pic", &input.pic)?;
        ensure_year(input.year)?;
        let department_code = normalize_department(&input.department_code);

        let engine = self.permission_engine().await?;
        engine.require_department(actor, Resource::ActionPlan, Action::Create, &department_code)?;

        let now = self.now();
        let active = action_plan::ActiveModel {
            department_code: Set(department_code),
            year: Set(input.year),
            month: Set(month.as_str().to_string()),
            category: Set(input.category.trim().to_string()),
            area_focus: Set(input.area_focus.trim().to_string()),
            goal_strategy: Set(input.goal_strategy.trim().to_string()),
            action_plan: Set(input.action_plan.trim().to_string()),
            indicator: Set(input.indicator.trim().to_string()),
            pic: Set(input.pic.trim().to_string()),
            assignee_id: Set(non_empty(input.assignee_id)),
            evidence: Set(non_empty(input.evidence)),
            report_format: Set(non_empty(input.report_format)),
            status: Set(CompletionStatus::Pending.as_str().to_string()),
            submission_status: Set(Some(SubmissionStatus::Draft.as_str().to_string())),
            unlock_status: Set(UnlockStatus::None.as_str().to_string()),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };
        let insert = action_plan::Entity::insert(active).exec(&self.db).await?;
        let created = self.get_plan(insert.last_insert_id).await?;
        info!(plan_id = created.id, actor = %actor.id, "created action plan");
        Ok(created)
    }

    pub async fn update_plan(
        &self,
        actor: &Actor,
        id: i64,
        changes: PlanChanges,
    ) -> Result<action_plan::Model, AppError> {
        if changes.is_empty() {
            return Err(AppError::InvalidInput("no changes given".to_string()));
        }
        if let Some(text) = changes.action_plan.as_deref() {
            ensure_non_empty("action plan", text)?;
        }
        if let Some(pic) = changes.pic.as_deref() {
            ensure_non_empty("pic", pic)?;
        }

        let plan = self.get_plan(id).await?;
        let engine = self.permission_engine().await?;
        engine.require(actor, Resource::ActionPlan, Action::Edit, Some(&plan))?;
        let now = self.now();
        lifecycle::ensure_editable(&plan, now)?;

        let mut active = action_plan::ActiveModel {
            updated_at: Set(now),
            ..Default::default()
        };
        if let Some(value) = changes.category {
            active.category = Set(value.trim().to_string());
        }
        if let Some(value) = changes.area_focus {
            active.area_focus = Set(value.trim().to_string());
        }
        if let Some(value) = changes.goal_strategy {
            active.goal_strategy = Set(value.trim().to_string());
        }
        if let Some(value) = changes.action_plan {
            active.action_plan = Set(value.trim().to_string());
        }
        if let Some(value) = changes.indicator {
            active.indicator = Set(value.trim().to_string());
        }
        if let Some(value) = changes.pic {
            active.pic = Set(value.trim().to_string());
        }
        if let Some(value) = changes.assignee_id {
            active.assignee_id = Set(non_empty(Some(value)));
        }
        if let Some(value) = changes.report_format {
            active.report_format = Set(non_empty(Some(value)));
        }

        self.write_if_editable(id, active, now).await?;
        info!(plan_id = id, actor = %actor.id, "updated action plan");
        self.get_plan(id).await
    }

    pub async fn update_status(
        &self,
        actor: &Actor,
        id: i64,
        status: CompletionStatus,
    ) -> Result<action_plan::Model, AppError> {
        if status.is_legacy() {
            return Err(AppError::InvalidInput(format!(
                "status '{}' is kept for history only and cannot be set",
                status.as_str()
            )));
        }
        let plan = self.get_plan(id).await?;
        let engine = self.permission_engine().await?;
        engine.require(actor, Resource::ActionPlan, Action::UpdateStatus, Some(&plan))?;
        let now = self.now();
        lifecycle::ensure_editable(&plan, now)?;

        let active = action_plan::ActiveModel {
            status: Set(status.as_str().to_string()),
            updated_at: Set(now),
            ..Default::default()
        };
        self.write_if_editable(id, active, now).await?;
        info!(plan_id = id, status = status.as_str(), actor = %actor.id, "updated completion status");
        self.get_plan(id).await
    }

    pub async fn update_progress(
        &self,
        actor: &Actor,
        id: i64,
        changes: ProgressChanges,
    ) -> Result<action_plan::Model, AppError> {
        if changes.is_empty() {
            return Err(AppError::InvalidInput("no progress changes given".to_string()));
        }
        let plan = self.get_plan(id).await?;
        let engine = self.permission_engine().await?;
        engine.require(actor, Resource::ActionPlan, Action::UpdateProgress, Some(&plan))?;
        let now = self.now();
        lifecycle::ensure_editable(&plan, now)?;

        let mut active = action_plan::ActiveModel {
            updated_at: Set(now),
            ..Default::default()
        };
        if let Some(value) = changes.evidence {
            active.evidence = Set(non_empty(Some(value)));
        }
        if let Some(value) = changes.outcome_link {
            active.outcome_link = Set(non_empty(Some(value)));
        }
        if let Some(value) = changes.remark {
            active.remark = Set(non_empty(Some(value)));
        }
        self.write_if_editable(id, active, now).await?;
        info!(plan_id = id, actor = %actor.id, "updated progress");
        self.get_plan(id).await
    }

    pub async fn soft_delete(
        &self,
        actor: &Actor,
        id: i64,
        reason: &str,
    ) -> Result<action_plan::Model, AppError> {
        ensure_non_empty("deletion reason", reason)?;
        let plan = self.get_plan(id).await?;
        let engine = self.permission_engine().await?;
        engine.require(actor, Resource::ActionPlan, Action::Delete, Some(&plan))?;
        lifecycle::ensure_active(&plan)?;
        if plan.completion() == CompletionStatus::Achieved {
            engine.require_admin(actor, "delete an achieved plan")?;
        }
        let now = self.now();
        let guard = if actor.is_admin() {
            lifecycle::active_condition()
        } else {
            lifecycle::ensure_editable(&plan, now)?;
            lifecycle::editable_condition(now)
        };

        let active = action_plan::ActiveModel {
            deleted_at: Set(Some(now)),
            deleted_by: Set(Some(actor.id.clone())),
            deletion_reason: Set(Some(reason.trim().to_string())),
            updated_at: Set(now),
            ..Default::default()
        };
        let result = action_plan::Entity::update_many()
            .set(active)
            .filter(action_plan::Column::Id.eq(id))
            .filter(guard)
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(self.explain_locked(id, now).await);
        }
        info!(plan_id = id, actor = %actor.id, "soft-deleted action plan");
        self.get_plan(id).await
    }

    pub async fn restore(&self, actor: &Actor, id: i64) -> Result<action_plan::Model, AppError> {
        let plan = self.get_plan(id).await?;
        if !plan.is_deleted() {
            return Err(AppError::precondition(format!("plan id {id} is not deleted")));
        }
        let engine = self.permission_engine().await?;
        engine.require(actor, Resource::ActionPlan, Action::Delete, Some(&plan))?;

        let active = action_plan::ActiveModel {
            deleted_at: Set(None),
            deleted_by: Set(None),
            deletion_reason: Set(None),
            updated_at: Set(self.now()),
            ..Default::default()
        };
        let result = action_plan::Entity::update_many()
            .set(active)
            .filter(action_plan::Column::Id.eq(id))
            .filter(action_plan::Column::DeletedAt.is_not_null())
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(AppError::precondition(format!("plan id {id} is not deleted")));
        }
        info!(plan_id = id, actor = %actor.id, "restored action plan");
        self.get_plan(id).await
    }

    /// Hard delete. Only soft-deleted plans can be purged.
    pub async fn purge(&self, actor: &Actor, id: i64) -> Result<(), AppError> {
        let engine = self.permission_engine().await?;
        engine.require_admin(actor, "permanently delete plans")?;

        let txn = self.db.begin().await?;
        let result: Result<(), AppError> = async {
            let plan = find_plan_with_conn(&txn, id).await?;
            if !plan.is_deleted() {
                return Err(AppError::precondition(format!(
                    "plan id {id} must be soft-deleted before it can be purged"
                )));
            }
            notification::Entity::delete_many()
                .filter(notification::Column::PlanId.eq(id))
                .exec(&txn)
                .await?;
            let deleted = action_plan::Entity::delete_many()
                .filter(action_plan::Column::Id.eq(id))
                .filter(action_plan::Column::DeletedAt.is_not_null())
                .exec(&txn)
                .await?;
            if deleted.rows_affected == 0 {
                return Err(AppError::NotFound(format!("plan id {id}")));
            }
            Ok(())
        }
        .await;

        finalize_transaction(txn, result).await?;
        info!(plan_id = id, actor = %actor.id, "purged action plan");
        Ok(())
    }

    /// Draft → submitted for every draft item in a department month.
    ///
    /// Refuses the whole month while any draft lacks a final completion
    /// status or any item has an unlock request pending.
    pub async fn finalize_month(
        &self,
        actor: &Actor,
        scope: &MonthScope,
    ) -> Result<BatchReport, AppError> {
        let scope = MonthScope::new(&scope.department_code, scope.year, scope.month);
        let engine = self.permission_engine().await?;
        engine.require_department(
            actor,
            Resource::ActionPlan,
            Action::Submit,
            &scope.department_code,
        )?;
        let now = self.now();

        let txn = self.db.begin().await?;
        let result: Result<(BatchReport, Vec<action_plan::Model>), AppError> = async {
            let items = load_scope_with_conn(&txn, &scope).await?;
            let blockers = lifecycle::finalize_blockers(&items);
            if !blockers.is_empty() {
                return Err(AppError::blocked(
                    format!("cannot finalize {scope}"),
                    blockers,
                ));
            }
            let drafts: Vec<action_plan::Model> = items
                .into_iter()
                .filter(|item| item.submission() == SubmissionStatus::Draft)
                .collect();
            if drafts.is_empty() {
                return Err(AppError::precondition(format!(
                    "no draft items to finalize in {scope}"
                )));
            }

            let mut report = BatchReport::default();
            for item in &drafts {
                let active = action_plan::ActiveModel {
                    submission_status: Set(Some(SubmissionStatus::Submitted.as_str().to_string())),
                    recalled_at: Set(None),
                    updated_at: Set(now),
                    ..Default::default()
                };
                let updated = action_plan::Entity::update_many()
                    .set(active)
                    .filter(action_plan::Column::Id.eq(item.id))
                    .filter(lifecycle::active_condition())
                    .filter(lifecycle::draft_condition())
                    .exec(&txn)
                    .await?;
                if updated.rows_affected == 0 {
                    report.failures.push(BatchFailure {
                        id: item.id,
                        reason: "no longer a draft".to_string(),
                    });
                } else {
                    report.succeeded.push(item.id);
                }
            }
            Ok((report, drafts))
        }
        .await;

        let (report, drafts) = finalize_transaction(txn, result).await?;
        info!(
            scope = %scope,
            submitted = report.success_count(),
            failed = report.failures.len(),
            actor = %actor.id,
            "finalized month"
        );
        let succeeded: HashSet<i64> = report.succeeded.iter().copied().collect();
        let notices = drafts
            .iter()
            .filter(|item| succeeded.contains(&item.id))
            .map(|item| {
                PlanEvent::for_plan(
                    EventKind::StatusChange,
                    item,
                    None,
                    &actor.id,
                    format!("plan id {} submitted for grading", item.id),
                )
            })
            .collect();
        events::emit(&self.db, notices, now).await;
        Ok(report)
    }

    /// Submitted → draft for every ungraded item in a department month.
    ///
    /// Graded items are left untouched. The transition is one conditional
    /// statement, so an approval racing with it either lands first (and the
    /// item stays graded) or finds the item already back in draft.
    pub async fn recall_month(
        &self,
        actor: &Actor,
        scope: &MonthScope,
    ) -> Result<RecallReport, AppError> {
        let scope = MonthScope::new(&scope.department_code, scope.year, scope.month);
        let engine = self.permission_engine().await?;
        engine.require_department(
            actor,
            Resource::ActionPlan,
            Action::Submit,
            &scope.department_code,
        )?;
        let now = self.now();

        let candidates = action_plan::Entity::find()
            .filter(scope_condition(&scope))
            .filter(lifecycle::active_condition())
            .filter(lifecycle::submitted_condition())
            .all(&self.db)
            .await?;
        if candidates.is_empty() {
            return Err(AppError::precondition(format!(
                "no submitted items to recall in {scope}"
            )));
        }
        let blockers: Vec<Blocker> = candidates
            .iter()
            .filter(|item| !item.is_graded() && item.unlock() == UnlockStatus::Pending)
            .map(|item| Blocker {
                id: item.id,
                reason: "unlock request is pending".to_string(),
            })
            .collect();
        if !blockers.is_empty() {
            return Err(AppError::blocked(
                format!("cannot recall {scope} while unlock requests are pending"),
                blockers,
            ));
        }

        let active = action_plan::ActiveModel {
            submission_status: Set(Some(SubmissionStatus::Draft.as_str().to_string())),
            recalled_at: Set(Some(now)),
            updated_at: Set(now),
            ..Default::default()
        };
        let candidate_ids: Vec<i64> = candidates.iter().map(|item| item.id).collect();
        let updated = action_plan::Entity::update_many()
            .set(active)
            .filter(action_plan::Column::Id.is_in(candidate_ids.clone()))
            .filter(lifecycle::active_condition())
            .filter(lifecycle::submitted_condition())
            .filter(action_plan::Column::QualityScore.is_null())
            .filter(action_plan::Column::UnlockStatus.ne(UnlockStatus::Pending.as_str()))
            .exec(&self.db)
            .await?;

        let after = action_plan::Entity::find()
            .filter(action_plan::Column::Id.is_in(candidate_ids))
            .order_by_asc(action_plan::Column::Id)
            .all(&self.db)
            .await?;
        let mut report = RecallReport::default();
        for item in &after {
            match Phase::of(item) {
                Phase::Draft => report.recalled.push(item.id),
                Phase::SubmittedGraded => report.graded_kept.push(item.id),
                Phase::SubmittedUngraded => {}
            }
        }
        info!(
            scope = %scope,
            recalled = updated.rows_affected,
            graded_kept = report.graded_kept.len(),
            actor = %actor.id,
            "recalled month"
        );
        let notices = after
            .iter()
            .filter(|item| report.recalled.contains(&item.id))
            .map(|item| {
                PlanEvent::for_plan(
                    EventKind::StatusChange,
                    item,
                    None,
                    &actor.id,
                    format!("plan id {} recalled to draft", item.id),
                )
            })
            .collect();
        events::emit(&self.db, notices, now).await;
        Ok(report)
    }

    /// Returns one submitted item to draft.
    ///
    /// Graded items stay locked for department leaders; only an admin may
    /// recall them, which clears the score so the item can be graded again.
    pub async fn recall_single(
        &self,
        actor: &Actor,
        id: i64,
    ) -> Result<action_plan::Model, AppError> {
        let plan = self.get_plan(id).await?;
        let engine = self.permission_engine().await?;
        engine.require(actor, Resource::ActionPlan, Action::Submit, Some(&plan))?;
        lifecycle::ensure_active(&plan)?;
        match Phase::of(&plan) {
            Phase::Draft => {
                return Err(AppError::precondition(format!(
                    "plan id {id} is already a draft"
                )))
            }
            Phase::SubmittedGraded => engine.require_admin(actor, "recall a graded plan")?,
            Phase::SubmittedUngraded => {}
        }
        if plan.unlock() == UnlockStatus::Pending {
            return Err(AppError::precondition(format!(
                "plan id {id} has a pending unlock request; resolve it first"
            )));
        }

        let now = self.now();
        let active = action_plan::ActiveModel {
            submission_status: Set(Some(SubmissionStatus::Draft.as_str().to_string())),
            quality_score: Set(None),
            recalled_at: Set(Some(now)),
            updated_at: Set(now),
            ..Default::default()
        };
        let mut guard = Condition::all()
            .add(action_plan::Column::Id.eq(id))
            .add(lifecycle::active_condition())
            .add(lifecycle::submitted_condition());
        guard = match plan.quality_score {
            Some(score) => guard.add(action_plan::Column::QualityScore.eq(score)),
            None => guard.add(action_plan::Column::QualityScore.is_null()),
        };
        let result = action_plan::Entity::update_many()
            .set(active)
            .filter(guard)
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(AppError::precondition(format!(
                "plan id {id} changed while recalling; re-fetch and retry"
            )));
        }

        let recalled = self.get_plan(id).await?;
        info!(plan_id = id, was_graded = plan.is_graded(), actor = %actor.id, "recalled plan");
        events::emit(
            &self.db,
            vec![PlanEvent::for_plan(
                EventKind::StatusChange,
                &recalled,
                None,
                &actor.id,
                format!("plan id {id} recalled to draft"),
            )],
            now,
        )
        .await;
        Ok(recalled)
    }

    /// First administrator. Only valid on an empty user table.
    pub async fn setup_admin(&self, id: &str, full_name: &str) -> Result<user::Model, AppError> {
        ensure_non_empty("user id", id)?;
        ensure_non_empty("full name", full_name)?;
        let existing = user::Entity::find().count(&self.db).await?;
        if existing > 0 {
            return Err(AppError::precondition(
                "users already exist; add users as an admin instead",
            ));
        }
        let model = user::ActiveModel {
            id: Set(id.trim().to_string()),
            full_name: Set(full_name.trim().to_string()),
            role: Set(Role::Admin.as_str().to_string()),
            department_code: Set(None),
            created_at: Set(self.now()),
        }
        .insert(&self.db)
        .await?;
        info!(user = %model.id, "bootstrapped admin");
        Ok(model)
    }

    pub async fn add_user(&self, actor: &Actor, input: NewUser) -> Result<user::Model, AppError> {
        ensure_non_empty("user id", &input.id)?;
        ensure_non_empty("full name", &input.full_name)?;
        let department_code = input
            .department_code
            .as_deref()
            .map(normalize_department)
            .filter(|code| !code.is_empty());
        let engine = self.permission_engine().await?;
        match (&department_code, input.role) {
            (_, Role::Admin) => engine.require_admin(actor, "create admin users")?,
            (Some(code), _) => {
                engine.require_department(actor, Resource::User, Action::Create, code)?
            }
            (None, _) => {
                return Err(AppError::InvalidInput(format!(
                    "{} users need a department code",
                    input.role.as_str()
                )))
            }
        }

        let id = input.id.trim().to_string();
        if user::Entity::find_by_id(id.clone())
            .one(&self.db)
            .await?
            .is_some()
        {
            return Err(AppError::InvalidInput(format!("user id {id} already exists")));
        }
        let model = user::ActiveModel {
            id: Set(id),
            full_name: Set(input.full_name.trim().to_string()),
            role: Set(input.role.as_str().to_string()),
            department_code: Set(department_code),
            created_at: Set(self.now()),
        }
        .insert(&self.db)
        .await?;
        info!(user = %model.id, role = %model.role, actor = %actor.id, "added user");
        Ok(model)
    }

    pub async fn list_users(&self, actor: &Actor) -> Result<Vec<user::Model>, AppError> {
        let engine = self.permission_engine().await?;
        let mut select = user::Entity::find();
        if !actor.is_admin() {
            let department = actor.department_code.clone().unwrap_or_default();
            engine.require_department(actor, Resource::User, Action::View, &department)?;
            select = select.filter(user::Column::DepartmentCode.eq(department));
        }
        Ok(select.order_by_asc(user::Column::Id).all(&self.db).await?)
    }

    pub async fn update_user_role(
        &self,
        actor: &Actor,
        id: &str,
        role: Role,
    ) -> Result<user::Model, AppError> {
        let target = user::Entity::find_by_id(id.trim().to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user id {id}")))?;
        let engine = self.permission_engine().await?;
        let current = Role::parse(&target.role)?;
        if role == Role::Admin || current == Role::Admin {
            engine.require_admin(actor, "change admin roles")?;
        } else {
            let department = target.department_code.clone().unwrap_or_default();
            engine.require_department(actor, Resource::User, Action::Edit, &department)?;
        }
        if role != Role::Admin && target.department_code.is_none() {
            return Err(AppError::InvalidInput(format!(
                "user id {id} has no department; {} users need one",
                role.as_str()
            )));
        }
        let mut active: user::ActiveModel = target.into();
        active.role = Set(role.as_str().to_string());
        let model = active.update(&self.db).await?;
        info!(user = %model.id, role = %model.role, actor = %actor.id, "changed user role");
        Ok(model)
    }

    pub async fn remove_user(&self, actor: &Actor, id: &str) -> Result<(), AppError> {
        if actor.id == id.trim() {
            return Err(AppError::InvalidInput("cannot remove yourself".to_string()));
        }
        let target = user::Entity::find_by_id(id.trim().to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user id {id}")))?;
        let engine = self.permission_engine().await?;
        match target.department_code.as_deref() {
            Some(department) if target.role != Role::Admin.as_str() => {
                engine.require_department(actor, Resource::User, Action::Delete, department)?
            }
            _ => engine.require_admin(actor, "remove admin users")?,
        }
        user::Entity::delete_by_id(target.id.clone())
            .exec(&self.db)
            .await?;
        info!(user = %target.id, actor = %actor.id, "removed user");
        Ok(())
    }

    pub async fn list_permissions(&self, actor: &Actor) -> Result<Vec<PermissionRow>, AppError> {
        let engine = self.permission_engine().await?;
        engine.require(actor, Resource::Settings, Action::Manage, None)?;
        let mut rows = Vec::new();
        for role in Role::NON_ADMIN {
            for resource in Resource::ALL {
                for action in resource.actions() {
                    rows.push(PermissionRow {
                        role,
                        resource,
                        action: *action,
                        tier: rule_tier(role, resource, *action),
                        allowed: engine.allowed(role, resource, *action),
                    });
                }
            }
        }
        Ok(rows)
    }

    /// Stores a configurable grant and drops the cached matrix.
    pub async fn set_permission(
        &self,
        actor: &Actor,
        role: Role,
        resource: Resource,
        action: Action,
        allowed: bool,
    ) -> Result<(), AppError> {
        let engine = self.permission_engine().await?;
        engine.require(actor, Resource::Settings, Action::Manage, None)?;
        if !resource.supports(action) {
            return Err(AppError::InvalidInput(format!(
                "{}.{} is not a permission",
                resource.as_str(),
                action.as_str()
            )));
        }
        let tier = rule_tier(role, resource, action);
        if role == Role::Admin || tier != RuleTier::Configurable {
            return Err(AppError::InvalidInput(format!(
                "{} {}.{} is {} and cannot be changed",
                role.as_str(),
                resource.as_str(),
                action.as_str(),
                tier.as_str()
            )));
        }

        let now = self.now();
        let existing = role_permission::Entity::find()
            .filter(role_permission::Column::Role.eq(role.as_str()))
            .filter(role_permission::Column::Resource.eq(resource.as_str()))
            .filter(role_permission::Column::Action.eq(action.as_str()))
            .one(&self.db)
            .await?;
        match existing {
            Some(row) => {
                let mut active: role_permission::ActiveModel = row.into();
                active.is_allowed = Set(allowed);
                active.updated_at = Set(now);
                active.update(&self.db).await?;
            }
            None => {
                role_permission::ActiveModel {
                    role: Set(role.as_str().to_string()),
                    resource: Set(resource.as_str().to_string()),
                    action: Set(action.as_str().to_string()),
                    is_allowed: Set(allowed),
                    updated_at: Set(now),
                    ..Default::default()
                }
                .insert(&self.db)
                .await?;
            }
        }
        self.permissions.lock().await.invalidate();
        info!(
            role = role.as_str(),
            permission = %format!("{}.{}", resource.as_str(), action.as_str()),
            allowed,
            actor = %actor.id,
            "changed permission"
        );
        Ok(())
    }

    /// Notifications addressed to the actor, plus department-wide ones.
    pub async fn list_notifications(
        &self,
        actor: &Actor,
    ) -> Result<Vec<notification::Model>, AppError> {
        let mut select = notification::Entity::find();
        if !actor.is_admin() {
            let department = actor.department_code.clone().unwrap_or_default();
            select = select.filter(notification::Column::DepartmentCode.eq(department));
        }
        let rows = select
            .order_by_desc(notification::Column::CreatedAt)
            .order_by_desc(notification::Column::Id)
            .all(&self.db)
            .await?;
        Ok(rows
            .into_iter()
            .filter(|row| match row.recipient.as_deref() {
                None => true,
                Some(recipient) => {
                    actor.is_admin()
                        || recipient == actor.id
                        || permission::names_match(recipient, &actor.name)
                }
            })
            .collect())
    }

    /// Conditional write that re-checks editability against `now` in the store.
    async fn write_if_editable(
        &self,
        id: i64,
        active: action_plan::ActiveModel,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let result = action_plan::Entity::update_many()
            .set(active)
            .filter(action_plan::Column::Id.eq(id))
            .filter(lifecycle::editable_condition(now))
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(self.explain_locked(id, now).await);
        }
        Ok(())
    }

    async fn explain_locked(&self, id: i64, now: DateTime<Utc>) -> AppError {
        match self.get_plan(id).await {
            Ok(plan) => match lifecycle::ensure_editable(&plan, now) {
                Err(err) => err,
                Ok(()) => AppError::precondition(format!(
                    "plan id {id} changed concurrently; re-fetch and retry"
                )),
            },
            Err(err) => err,
        }
    }
}

pub(crate) fn actor_from_user(model: &user::Model) -> Result<Actor, AppError> {
    Ok(Actor {
        id: model.id.clone(),
        name: model.full_name.clone(),
        role: Role::parse(&model.role)?,
        department_code: model.department_code.clone(),
    })
}

pub(crate) async fn find_plan_with_conn<C: ConnectionTrait>(
    db: &C,
    id: i64,
) -> Result<action_plan::Model, AppError> {
    action_plan::Entity::find_by_id(id)
        .one(db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("plan id {id}")))
}

pub(crate) fn scope_condition(scope: &MonthScope) -> Condition {
    Condition::all()
        .add(action_plan::Column::DepartmentCode.eq(scope.department_code.as_str()))
        .add(action_plan::Column::Year.eq(scope.year))
        .add(action_plan::Column::Month.eq(scope.month.as_str()))
}

async fn load_scope_with_conn<C: ConnectionTrait>(
    db: &C,
    scope: &MonthScope,
) -> Result<Vec<action_plan::Model>, AppError> {
    Ok(action_plan::Entity::find()
        .filter(scope_condition(scope))
        .filter(lifecycle::active_condition())
        .order_by_asc(action_plan::Column::Id)
        .all(db)
        .await?)
}

pub(crate) async fn finalize_transaction<T>(
    txn: DatabaseTransaction,
    result: Result<T, AppError>,
) -> Result<T, AppError> {
    match result {
        Ok(value) => {
            txn.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = txn.rollback().await {
                return Err(rollback_err.into());
            }
            Err(err)
        }
    }
}

pub(crate) fn unique_ids(ids: &[i64]) -> Vec<i64> {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for id in ids {
        if seen.insert(*id) {
            unique.push(*id);
        }
    }
    unique
}

pub(crate) fn join_ids(ids: &[i64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn ensure_non_empty(label: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::InvalidInput(format!("{label} cannot be empty")));
    }
    Ok(())
}

fn ensure_year(year: i32) -> Result<(), AppError> {
    if !(2000..=2100).contains(&year) {
        return Err(AppError::InvalidInput(format!(
            "year must be between 2000 and 2100, got {year}"
        )));
    }
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Month;
    use crate::testing::{
        add_plan, add_plans_with_status, march, setup_app, ADMIN, HR_LEADER, LEADER, STAFF,
    };

    #[tokio::test]
    async fn create_plan_starts_as_pending_draft() {
        let (_dir, app, _clock) = setup_app().await;
        let leader = app.resolve_actor(LEADER).await.expect("leader");
        let plan = add_plan(&app, &leader, Month::Mar, "Dewi").await;

        assert_eq!(plan.department_code, "FIN");
        assert_eq!(plan.completion(), CompletionStatus::Pending);
        assert_eq!(plan.submission(), SubmissionStatus::Draft);
        assert_eq!(plan.unlock(), UnlockStatus::None);
        assert!(plan.quality_score.is_none());
        assert!(plan.approved_until.is_none());
    }

    #[tokio::test]
    async fn create_plan_outside_department_is_denied() {
        let (_dir, app, _clock) = setup_app().await;
        let leader = app.resolve_actor(HR_LEADER).await.expect("leader");
        let err = app
            .create_plan(
                &leader,
                PlanInput {
                    department_code: "fin".to_string(),
                    year: 2026,
                    month: Some(Month::Mar),
                    action_plan: "Close books".to_string(),
                    pic: "Dewi".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");
    }

    #[tokio::test]
    async fn create_plan_requires_month_and_text() {
        let (_dir, app, _clock) = setup_app().await;
        let admin = app.resolve_actor(ADMIN).await.expect("admin");
        let err = app
            .create_plan(
                &admin,
                PlanInput {
                    department_code: "FIN".to_string(),
                    year: 2026,
                    action_plan: "Close books".to_string(),
                    pic: "Dewi".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("month is required"));

        let err = app
            .create_plan(
                &admin,
                PlanInput {
                    department_code: "FIN".to_string(),
                    year: 2026,
                    month: Some(Month::Mar),
                    action_plan: "   ".to_string(),
                    pic: "Dewi".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("action plan cannot be empty"));
    }

    #[tokio::test]
    async fn staff_updates_own_draft_status() {
        let (_dir, app, _clock) = setup_app().await;
        let leader = app.resolve_actor(LEADER).await.expect("leader");
        let staff = app.resolve_actor(STAFF).await.expect("staff");
        let own = add_plan(&app, &leader, Month::Mar, "dewi").await;
        let other = add_plan(&app, &leader, Month::Mar, "Budi").await;

        let updated = app
            .update_status(&staff, own.id, CompletionStatus::OnProgress)
            .await
            .expect("update own");
        assert_eq!(updated.completion(), CompletionStatus::OnProgress);

        let err = app
            .update_status(&staff, other.id, CompletionStatus::Achieved)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");
    }

    #[tokio::test]
    async fn legacy_status_cannot_be_written() {
        let (_dir, app, _clock) = setup_app().await;
        let leader = app.resolve_actor(LEADER).await.expect("leader");
        let plan = add_plan(&app, &leader, Month::Mar, "Dewi").await;
        let err = app
            .update_status(&leader, plan.id, CompletionStatus::WaitingApproval)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn submitted_plan_rejects_edits() {
        let (_dir, app, _clock) = setup_app().await;
        let leader = app.resolve_actor(LEADER).await.expect("leader");
        let ids = add_plans_with_status(&app, &leader, &[CompletionStatus::Achieved]).await;
        app.finalize_month(&leader, &march()).await.expect("finalize");

        let err = app
            .update_plan(
                &leader,
                ids[0],
                PlanChanges {
                    indicator: Some("Changed".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PRECONDITION_FAILED");
        assert!(err.to_string().contains("locked"));

        let err = app
            .update_progress(
                &leader,
                ids[0],
                ProgressChanges {
                    remark: Some("late".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PRECONDITION_FAILED");
    }

    #[tokio::test]
    async fn update_plan_changes_content_fields() {
        let (_dir, app, _clock) = setup_app().await;
        let leader = app.resolve_actor(LEADER).await.expect("leader");
        let plan = add_plan(&app, &leader, Month::Mar, "Dewi").await;
        let updated = app
            .update_plan(
                &leader,
                plan.id,
                PlanChanges {
                    indicator: Some("  Invoices closed  ".to_string()),
                    assignee_id: Some(STAFF.to_string()),
                    ..Default::default()
                },
            )
            .await
            .expect("update");
        assert_eq!(updated.indicator, "Invoices closed");
        assert_eq!(updated.assignee_id.as_deref(), Some(STAFF));
        assert_eq!(updated.action_plan, plan.action_plan);
    }

    #[tokio::test]
    async fn finalize_refuses_month_with_incomplete_item() {
        let (_dir, app, _clock) = setup_app().await;
        let leader = app.resolve_actor(LEADER).await.expect("leader");
        let ids = add_plans_with_status(
            &app,
            &leader,
            &[
                CompletionStatus::Achieved,
                CompletionStatus::Achieved,
                CompletionStatus::NotAchieved,
                CompletionStatus::Pending,
                CompletionStatus::Achieved,
            ],
        )
        .await;

        let err = app.finalize_month(&leader, &march()).await.unwrap_err();
        match err {
            AppError::PreconditionFailed { blockers, .. } => {
                let blocked: Vec<i64> = blockers.iter().map(|blocker| blocker.id).collect();
                assert_eq!(blocked, vec![ids[3]]);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let summary = app.month_summary(&march()).await.expect("summary");
        assert_eq!(summary.draft, 5);
        assert_eq!(summary.submitted_ungraded, 0);
    }

    #[tokio::test]
    async fn finalize_submits_all_drafts_and_notifies() {
        let (_dir, app, _clock) = setup_app().await;
        let leader = app.resolve_actor(LEADER).await.expect("leader");
        let ids = add_plans_with_status(
            &app,
            &leader,
            &[CompletionStatus::Achieved, CompletionStatus::NotAchieved],
        )
        .await;

        let report = app.finalize_month(&leader, &march()).await.expect("finalize");
        assert_eq!(report.succeeded, ids);
        assert!(report.failures.is_empty());
        for id in &ids {
            let plan = app.get_plan(*id).await.expect("plan");
            assert_eq!(plan.submission(), SubmissionStatus::Submitted);
        }

        let notices = app.list_notifications(&leader).await.expect("notices");
        assert_eq!(notices.len(), 2);
        assert!(notices
            .iter()
            .all(|notice| notice.kind == EventKind::StatusChange.as_str()));
    }

    #[tokio::test]
    async fn finalize_of_empty_month_fails() {
        let (_dir, app, _clock) = setup_app().await;
        let leader = app.resolve_actor(LEADER).await.expect("leader");
        let err = app.finalize_month(&leader, &march()).await.unwrap_err();
        assert_eq!(err.code(), "PRECONDITION_FAILED");
        assert!(err.to_string().contains("no draft items"));
    }

    #[tokio::test]
    async fn finalize_other_department_is_denied() {
        let (_dir, app, _clock) = setup_app().await;
        let leader = app.resolve_actor(LEADER).await.expect("leader");
        add_plans_with_status(&app, &leader, &[CompletionStatus::Achieved]).await;
        let hr = app.resolve_actor(HR_LEADER).await.expect("hr");
        let err = app.finalize_month(&hr, &march()).await.unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");
    }

    #[tokio::test]
    async fn recall_month_keeps_graded_items() {
        let (_dir, app, _clock) = setup_app().await;
        let leader = app.resolve_actor(LEADER).await.expect("leader");
        let admin = app.resolve_actor(ADMIN).await.expect("admin");
        let ids = add_plans_with_status(
            &app,
            &leader,
            &[
                CompletionStatus::Achieved,
                CompletionStatus::Achieved,
                CompletionStatus::NotAchieved,
            ],
        )
        .await;
        app.finalize_month(&leader, &march()).await.expect("finalize");
        app.approve(&admin, ids[0], 88, Some("solid".to_string()))
            .await
            .expect("approve");

        let report = app.recall_month(&leader, &march()).await.expect("recall");
        assert_eq!(report.recalled, vec![ids[1], ids[2]]);
        assert_eq!(report.graded_kept, vec![ids[0]]);

        let summary = app.month_summary(&march()).await.expect("summary");
        assert_eq!(summary.submitted_ungraded, 0);
        assert_eq!(summary.graded, 1);
        assert_eq!(summary.draft, 2);
        assert_eq!(summary.average_score, Some(88.0));
    }

    #[tokio::test]
    async fn recall_single_of_graded_plan_is_admin_only() {
        let (_dir, app, _clock) = setup_app().await;
        let leader = app.resolve_actor(LEADER).await.expect("leader");
        let admin = app.resolve_actor(ADMIN).await.expect("admin");
        let ids = add_plans_with_status(
            &app,
            &leader,
            &[CompletionStatus::Achieved, CompletionStatus::Achieved],
        )
        .await;
        app.finalize_month(&leader, &march()).await.expect("finalize");
        app.approve(&admin, ids[0], 75, None).await.expect("approve");

        let err = app.recall_single(&leader, ids[0]).await.unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");

        let ungraded = app.recall_single(&leader, ids[1]).await.expect("recall");
        assert_eq!(ungraded.submission(), SubmissionStatus::Draft);

        let graded = app.recall_single(&admin, ids[0]).await.expect("admin recall");
        assert_eq!(graded.submission(), SubmissionStatus::Draft);
        assert!(graded.quality_score.is_none());

        let err = app.recall_single(&admin, ids[0]).await.unwrap_err();
        assert!(err.to_string().contains("already a draft"));
    }

    #[tokio::test]
    async fn recall_month_refuses_pending_unlocks() {
        let (_dir, app, _clock) = setup_app().await;
        let leader = app.resolve_actor(LEADER).await.expect("leader");
        let ids = add_plans_with_status(
            &app,
            &leader,
            &[CompletionStatus::Achieved, CompletionStatus::Achieved],
        )
        .await;
        app.finalize_month(&leader, &march()).await.expect("finalize");
        app.request_unlock(&leader, &ids[..1], "wrong indicator")
            .await
            .expect("request");

        let err = app.recall_month(&leader, &march()).await.unwrap_err();
        match err {
            AppError::PreconditionFailed { blockers, .. } => {
                assert_eq!(blockers.len(), 1);
                assert_eq!(blockers[0].id, ids[0]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        for id in &ids {
            let plan = app.get_plan(*id).await.expect("plan");
            assert_eq!(plan.submission(), SubmissionStatus::Submitted);
        }
        let plan = app.get_plan(ids[0]).await.expect("plan");
        assert_eq!(plan.unlock(), UnlockStatus::Pending);
    }

    #[tokio::test]
    async fn delete_checks_permission_before_deleted_state() {
        let (_dir, app, _clock) = setup_app().await;
        let leader = app.resolve_actor(LEADER).await.expect("leader");
        let admin = app.resolve_actor(ADMIN).await.expect("admin");
        let hr_leader = app.resolve_actor(HR_LEADER).await.expect("hr leader");
        let plan = add_plan(&app, &leader, Month::Mar, "Dewi").await;
        app.soft_delete(&admin, plan.id, "entered twice")
            .await
            .expect("delete");

        let err = app
            .soft_delete(&hr_leader, plan.id, "again")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");

        let err = app.soft_delete(&admin, plan.id, "again").await.unwrap_err();
        assert_eq!(err.code(), "PRECONDITION_FAILED");
    }

    #[tokio::test]
    async fn achieved_plan_cannot_be_deleted_by_leader() {
        let (_dir, app, _clock) = setup_app().await;
        let leader = app.resolve_actor(LEADER).await.expect("leader");
        let admin = app.resolve_actor(ADMIN).await.expect("admin");
        let ids = add_plans_with_status(&app, &leader, &[CompletionStatus::Achieved]).await;

        let err = app.soft_delete(&leader, ids[0], "duplicate").await.unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");

        let deleted = app
            .soft_delete(&admin, ids[0], "duplicate")
            .await
            .expect("admin delete");
        assert!(deleted.is_deleted());
        assert_eq!(deleted.deleted_by.as_deref(), Some(ADMIN));
    }

    #[tokio::test]
    async fn soft_deleted_plan_leaves_active_scope_and_restores() {
        let (_dir, app, _clock) = setup_app().await;
        let leader = app.resolve_actor(LEADER).await.expect("leader");
        let plan = add_plan(&app, &leader, Month::Mar, "Dewi").await;

        app.soft_delete(&leader, plan.id, "entered twice")
            .await
            .expect("delete");
        let active = app
            .list_plans(&PlanQuery {
                department_code: Some("fin".to_string()),
                ..Default::default()
            })
            .await
            .expect("list");
        assert!(active.is_empty());
        let deleted = app
            .list_plans(&PlanQuery {
                deleted: true,
                ..Default::default()
            })
            .await
            .expect("list deleted");
        assert_eq!(deleted.len(), 1);

        let err = app
            .update_status(&leader, plan.id, CompletionStatus::Achieved)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("deleted"));

        let restored = app.restore(&leader, plan.id).await.expect("restore");
        assert!(!restored.is_deleted());
        assert!(restored.deletion_reason.is_none());
        let err = app.restore(&leader, plan.id).await.unwrap_err();
        assert!(err.to_string().contains("not deleted"));
    }

    #[tokio::test]
    async fn purge_requires_admin_and_prior_soft_delete() {
        let (_dir, app, _clock) = setup_app().await;
        let leader = app.resolve_actor(LEADER).await.expect("leader");
        let admin = app.resolve_actor(ADMIN).await.expect("admin");
        let plan = add_plan(&app, &leader, Month::Mar, "Dewi").await;

        let err = app.purge(&admin, plan.id).await.unwrap_err();
        assert!(err.to_string().contains("must be soft-deleted"));

        app.soft_delete(&leader, plan.id, "obsolete").await.expect("delete");
        let err = app.purge(&leader, plan.id).await.unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");

        app.purge(&admin, plan.id).await.expect("purge");
        let err = app.get_plan(plan.id).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn set_permission_rejects_mandatory_rows_and_invalidates_cache() {
        let (_dir, app, _clock) = setup_app().await;
        let admin = app.resolve_actor(ADMIN).await.expect("admin");
        let staff = app.resolve_actor(STAFF).await.expect("staff");

        let err = app
            .set_permission(&admin, Role::Staff, Resource::ActionPlan, Action::Grade, true)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");

        let engine = app.permission_engine().await.expect("engine");
        assert!(!engine.allowed(Role::Staff, Resource::Report, Action::Export));

        app.set_permission(&admin, Role::Staff, Resource::Report, Action::Export, true)
            .await
            .expect("grant");
        let engine = app.permission_engine().await.expect("engine");
        assert!(engine.allowed(Role::Staff, Resource::Report, Action::Export));

        let err = app
            .set_permission(&staff, Role::Staff, Resource::Report, Action::Export, false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");
    }

    #[tokio::test]
    async fn stored_grant_for_mandatory_off_is_ignored() {
        let (_dir, app, _clock) = setup_app().await;
        role_permission::ActiveModel {
            role: Set("STAFF".to_string()),
            resource: Set("action_plan".to_string()),
            action: Set("grade".to_string()),
            is_allowed: Set(true),
            updated_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&app.db)
        .await
        .expect("insert row");

        let engine = app.permission_engine().await.expect("engine");
        assert!(!engine.allowed(Role::Staff, Resource::ActionPlan, Action::Grade));
    }

    #[tokio::test]
    async fn cached_matrix_is_reused_until_stale() {
        let (_dir, app, clock) = setup_app().await;
        let engine = app.permission_engine().await.expect("engine");
        assert!(engine.allowed(Role::Leader, Resource::Report, Action::Export));

        role_permission::Entity::update_many()
            .set(role_permission::ActiveModel {
                is_allowed: Set(false),
                ..Default::default()
            })
            .filter(role_permission::Column::Role.eq("leader"))
            .filter(role_permission::Column::Resource.eq("report"))
            .exec(&app.db)
            .await
            .expect("direct write");

        let engine = app.permission_engine().await.expect("engine");
        assert!(engine.allowed(Role::Leader, Resource::Report, Action::Export));

        clock.advance(chrono::Duration::minutes(5));
        let engine = app.permission_engine().await.expect("engine");
        assert!(!engine.allowed(Role::Leader, Resource::Report, Action::Export));
    }

    #[tokio::test]
    async fn users_are_managed_within_department() {
        let (_dir, app, _clock) = setup_app().await;
        let admin = app.resolve_actor(ADMIN).await.expect("admin");
        let leader = app.resolve_actor(LEADER).await.expect("leader");

        let err = app
            .add_user(
                &leader,
                NewUser {
                    id: "new-staff".to_string(),
                    full_name: "Sari".to_string(),
                    role: Role::Staff,
                    department_code: Some("FIN".to_string()),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");

        app.set_permission(&admin, Role::Leader, Resource::User, Action::Create, true)
            .await
            .expect("grant");
        let created = app
            .add_user(
                &leader,
                NewUser {
                    id: "new-staff".to_string(),
                    full_name: "Sari".to_string(),
                    role: Role::Staff,
                    department_code: Some("fin".to_string()),
                },
            )
            .await
            .expect("create");
        assert_eq!(created.department_code.as_deref(), Some("FIN"));

        let err = app
            .add_user(
                &leader,
                NewUser {
                    id: "boss".to_string(),
                    full_name: "Boss".to_string(),
                    role: Role::Admin,
                    department_code: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");

        let visible = app.list_users(&leader).await.expect("list");
        assert!(visible
            .iter()
            .all(|row| row.department_code.as_deref() == Some("FIN")));

        let err = app.remove_user(&leader, "new-staff").await.unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");
        app.remove_user(&admin, "new-staff").await.expect("remove");

        let promoted = app
            .update_user_role(&admin, STAFF, Role::Leader)
            .await
            .expect("promote");
        assert_eq!(promoted.role, "leader");
    }

    #[tokio::test]
    async fn setup_admin_only_on_empty_table() {
        let (_dir, app, _clock) = setup_app().await;
        let err = app.setup_admin("root", "Root").await.unwrap_err();
        assert_eq!(err.code(), "PRECONDITION_FAILED");
    }

    #[test]
    fn unique_ids_keeps_first_occurrence_order() {
        assert_eq!(unique_ids(&[3, 1, 3, 2, 1]), vec![3, 1, 2]);
        assert_eq!(join_ids(&[3, 1]), "3, 1");
    }
}
