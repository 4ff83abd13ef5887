use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, EntityTrait, Set};
use tracing::{debug, warn};

use crate::entities::{action_plan, notification};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventKind {
    StatusChange,
    GradeReceived,
    UnlockApproved,
    UnlockRejected,
    UnlockRevoked,
    Kickback,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatusChange => "STATUS_CHANGE",
            Self::GradeReceived => "GRADE_RECEIVED",
            Self::UnlockApproved => "UNLOCK_APPROVED",
            Self::UnlockRejected => "UNLOCK_REJECTED",
            Self::UnlockRevoked => "UNLOCK_REVOKED",
            Self::Kickback => "KICKBACK",
        }
    }
}

#[derive(Clone, Debug)]
pub struct PlanEvent {
    pub kind: EventKind,
    pub plan_id: i64,
    pub department_code: String,
    pub recipient: Option<String>,
    pub actor_id: String,
    pub message: String,
}

impl PlanEvent {
    pub fn for_plan(
        kind: EventKind,
        plan: &action_plan::Model,
        recipient: Option<String>,
        actor_id: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            plan_id: plan.id,
            department_code: plan.department_code.clone(),
            recipient,
            actor_id: actor_id.to_string(),
            message: message.into(),
        }
    }
}

/// Records events after the owning write has committed.
///
/// Delivery is fire-and-forget: a failed insert is logged and dropped so it
/// never turns a committed transition into an error for the caller.
pub async fn emit<C: ConnectionTrait>(db: &C, events: Vec<PlanEvent>, now: DateTime<Utc>) {
    if events.is_empty() {
        return;
    }
    let count = events.len();
    let rows = events.into_iter().map(|event| notification::ActiveModel {
        kind: Set(event.kind.as_str().to_string()),
        plan_id: Set(event.plan_id),
        department_code: Set(event.department_code),
        recipient: Set(event.recipient),
        actor_id: Set(event.actor_id),
        message: Set(event.message),
        is_read: Set(false),
        created_at: Set(now),
        ..Default::default()
    });
    match notification::Entity::insert_many(rows).exec(db).await {
        Ok(_) => debug!(count, "recorded notifications"),
        Err(err) => warn!(count, error = %err, "dropping notifications"),
    }
}
