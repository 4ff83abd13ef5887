//! Role/resource/action authorization.
//!
//! Every non-admin `(role, resource, action)` triple falls in one of three
//! tiers. Mandatory tiers are fixed in code and ignore the stored table;
//! configurable triples read the stored boolean and deny when it is absent.
//! Admin bypasses the matrix.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::entities::{action_plan, role_permission};
use crate::error::AppError;
use crate::model::{Action, Actor, Resource, Role};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RuleTier {
    MandatoryOn,
    MandatoryOff,
    Configurable,
}

impl RuleTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MandatoryOn => "mandatory_on",
            Self::MandatoryOff => "mandatory_off",
            Self::Configurable => "configurable",
        }
    }
}

pub fn rule_tier(role: Role, resource: Resource, action: Action) -> RuleTier {
    use Action::*;
    use Resource::*;

    match (role, resource, action) {
        (Role::Admin, _, _) => RuleTier::MandatoryOn,

        (Role::Staff, ActionPlan, UpdateStatus | UpdateProgress) => RuleTier::MandatoryOn,
        (Role::Staff, ActionPlan, Grade) => RuleTier::MandatoryOff,
        (Role::Staff, User, Create | Edit | Delete) => RuleTier::MandatoryOff,
        (Role::Staff, Settings, Manage) => RuleTier::MandatoryOff,

        (Role::Leader, ActionPlan, UpdateStatus | UpdateProgress | Submit) => RuleTier::MandatoryOn,
        (Role::Leader, ActionPlan, Grade) => RuleTier::MandatoryOff,
        (Role::Leader, User, Delete) => RuleTier::MandatoryOff,
        (Role::Leader, Settings, Manage) => RuleTier::MandatoryOff,

        (Role::Executive, ActionPlan, Grade | Submit) => RuleTier::MandatoryOff,
        (Role::Executive, User, Delete) => RuleTier::MandatoryOff,
        (Role::Executive, Settings, Manage) => RuleTier::MandatoryOff,

        _ => RuleTier::Configurable,
    }
}

/// Seeded values for configurable triples; written only where no row exists.
pub const DEFAULT_GRANTS: &[(Role, Resource, Action, bool)] = &[
    (Role::Leader, Resource::ActionPlan, Action::Create, true),
    (Role::Leader, Resource::ActionPlan, Action::Edit, true),
    (Role::Leader, Resource::ActionPlan, Action::Delete, true),
    (Role::Leader, Resource::User, Action::View, true),
    (Role::Leader, Resource::User, Action::Create, false),
    (Role::Leader, Resource::User, Action::Edit, false),
    (Role::Leader, Resource::Report, Action::Export, true),
    (Role::Staff, Resource::ActionPlan, Action::Create, false),
    (Role::Staff, Resource::ActionPlan, Action::Edit, true),
    (Role::Staff, Resource::ActionPlan, Action::Delete, false),
    (Role::Staff, Resource::ActionPlan, Action::Submit, false),
    (Role::Staff, Resource::User, Action::View, false),
    (Role::Staff, Resource::Report, Action::Export, false),
    (Role::Executive, Resource::ActionPlan, Action::Create, false),
    (Role::Executive, Resource::ActionPlan, Action::Edit, false),
    (Role::Executive, Resource::User, Action::View, true),
    (Role::Executive, Resource::Report, Action::Export, true),
];

/// Stored booleans for configurable triples.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PermissionMatrix {
    entries: HashMap<(Role, Resource, Action), bool>,
}

impl PermissionMatrix {
    pub fn set(&mut self, role: Role, resource: Resource, action: Action, allowed: bool) {
        self.entries.insert((role, resource, action), allowed);
    }

    pub fn stored(&self, role: Role, resource: Resource, action: Action) -> Option<bool> {
        self.entries.get(&(role, resource, action)).copied()
    }

    /// Rows with labels this build does not know are skipped.
    pub fn from_rows(rows: &[role_permission::Model]) -> Self {
        let mut matrix = Self::default();
        for row in rows {
            let Ok(role) = Role::parse(&row.role) else {
                continue;
            };
            let (Ok(resource), Ok(action)) =
                (row.resource.parse::<Resource>(), row.action.parse::<Action>())
            else {
                continue;
            };
            matrix.set(role, resource, action, row.is_allowed);
        }
        matrix
    }
}

pub fn allowed(matrix: &PermissionMatrix, role: Role, resource: Resource, action: Action) -> bool {
    if role == Role::Admin {
        return true;
    }
    if !resource.supports(action) {
        return false;
    }
    match rule_tier(role, resource, action) {
        RuleTier::MandatoryOn => true,
        RuleTier::MandatoryOff => false,
        RuleTier::Configurable => matrix.stored(role, resource, action).unwrap_or(false),
    }
}

/// Actions a staff member may only perform on plans they own.
fn requires_ownership(action: Action) -> bool {
    matches!(
        action,
        Action::Edit | Action::Delete | Action::UpdateStatus | Action::UpdateProgress
    )
}

/// Case-insensitive, whitespace-trimmed display-name comparison.
///
/// Two users with the same display name collide here, which is why an
/// explicit `assignee_id` takes precedence whenever a plan carries one.
pub fn names_match(left: &str, right: &str) -> bool {
    let left = left.trim();
    let right = right.trim();
    !left.is_empty() && left.to_lowercase() == right.to_lowercase()
}

pub fn owns_plan(actor: &Actor, plan: &action_plan::Model) -> bool {
    match plan.assignee_id.as_deref().map(str::trim) {
        Some(assignee) if !assignee.is_empty() => assignee == actor.id,
        _ => names_match(&plan.pic, &actor.name),
    }
}

#[derive(Clone, Debug)]
pub struct PermissionEngine {
    matrix: Arc<PermissionMatrix>,
}

impl PermissionEngine {
    pub fn new(matrix: Arc<PermissionMatrix>) -> Self {
        Self { matrix }
    }

    pub fn allowed(&self, role: Role, resource: Resource, action: Action) -> bool {
        allowed(&self.matrix, role, resource, action)
    }

    /// Single authorization surface: role matrix plus department and ownership scoping.
    pub fn authorize(
        &self,
        actor: &Actor,
        resource: Resource,
        action: Action,
        plan: Option<&action_plan::Model>,
    ) -> bool {
        let Some(plan) = plan else {
            return actor.is_admin() || self.allowed(actor.role, resource, action);
        };
        if !self.authorize_department(actor, resource, action, &plan.department_code) {
            return false;
        }
        if actor.role == Role::Staff && resource == Resource::ActionPlan && requires_ownership(action)
        {
            return owns_plan(actor, plan);
        }
        true
    }

    /// Department-wide operations (month batches, new plans, user management).
    pub fn authorize_department(
        &self,
        actor: &Actor,
        resource: Resource,
        action: Action,
        department_code: &str,
    ) -> bool {
        if actor.is_admin() {
            return true;
        }
        self.allowed(actor.role, resource, action) && actor.in_department(department_code)
    }

    pub fn require(
        &self,
        actor: &Actor,
        resource: Resource,
        action: Action,
        plan: Option<&action_plan::Model>,
    ) -> Result<(), AppError> {
        if self.authorize(actor, resource, action, plan) {
            return Ok(());
        }
        let target = match plan {
            Some(plan) => format!(" on plan id {}", plan.id),
            None => String::new(),
        };
        Err(denied(actor, resource, action, &target))
    }

    pub fn require_department(
        &self,
        actor: &Actor,
        resource: Resource,
        action: Action,
        department_code: &str,
    ) -> Result<(), AppError> {
        if self.authorize_department(actor, resource, action, department_code) {
            return Ok(());
        }
        Err(denied(
            actor,
            resource,
            action,
            &format!(" in department {department_code}"),
        ))
    }

    /// Operations reserved to the highest-privilege role.
    pub fn require_admin(&self, actor: &Actor, operation: &str) -> Result<(), AppError> {
        if actor.is_admin() {
            return Ok(());
        }
        Err(AppError::PermissionDenied(format!(
            "{} ({}) may not {operation}; admin only",
            actor.id,
            actor.role.as_str()
        )))
    }
}

fn denied(actor: &Actor, resource: Resource, action: Action, target: &str) -> AppError {
    AppError::PermissionDenied(format!(
        "{} ({}) may not {}.{}{target}",
        actor.id,
        actor.role.as_str(),
        resource.as_str(),
        action.as_str()
    ))
}

/// Matrix snapshot with the instant it was read from the store.
#[derive(Debug)]
pub struct PermissionCache {
    ttl: Duration,
    entry: Option<(Arc<PermissionMatrix>, DateTime<Utc>)>,
}

impl PermissionCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entry: None }
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match &self.entry {
            Some((_, fetched_at)) => now - *fetched_at >= self.ttl,
            None => true,
        }
    }

    pub fn get(&self, now: DateTime<Utc>) -> Option<Arc<PermissionMatrix>> {
        if self.is_stale(now) {
            return None;
        }
        self.entry.as_ref().map(|(matrix, _)| Arc::clone(matrix))
    }

    pub fn store(&mut self, matrix: PermissionMatrix, now: DateTime<Utc>) -> Arc<PermissionMatrix> {
        let matrix = Arc::new(matrix);
        self.entry = Some((Arc::clone(&matrix), now));
        matrix
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }
}
