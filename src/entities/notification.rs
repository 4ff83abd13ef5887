use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::action_plan;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "notifications")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub kind: String,
    pub plan_id: i64,
    pub department_code: String,
    pub recipient: Option<String>,
    pub actor_id: String,
    pub message: String,
    pub is_read: bool,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter)]
pub enum Relation {
    ActionPlan,
}

impl RelationTrait for Relation {
    fn def(&self) -> RelationDef {
        match self {
            Self::ActionPlan => Entity::belongs_to(action_plan::Entity)
                .from(Column::PlanId)
                .to(action_plan::Column::Id)
                .into(),
        }
    }
}

impl Related<action_plan::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ActionPlan.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
