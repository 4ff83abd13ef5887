use std::fs::{self, File, OpenOptions};
use std::path::Path;

use chrono::Utc;
use sea_orm::sea_query::Index;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseBackend,
    DatabaseConnection, EntityTrait, QueryFilter, Schema, Set, Statement,
};
use url::Url;

use crate::entities::{action_plan, notification, role_permission, user};
use crate::error::AppError;
use crate::permission::DEFAULT_GRANTS;

pub fn ensure_parent_dir(path: &Path) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Advisory lock beside the database file; one CLI process writes at a time.
pub fn open_lock(path: &Path) -> Result<fd_lock::RwLock<File>, AppError> {
    let lock_path = path.with_extension("lock");
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?;
    Ok(fd_lock::RwLock::new(file))
}

pub async fn connect(path: &Path) -> Result<DatabaseConnection, AppError> {
    let mut url = Url::from_file_path(path)
        .map_err(|_| AppError::InvalidInput(format!("invalid sqlite path: {}", path.display())))?;
    url.set_query(Some("mode=rwc"));
    let sqlite_url = url.as_str().replacen("file://", "sqlite://", 1);
    Ok(Database::connect(&sqlite_url).await?)
}

pub async fn ensure_schema(db: &DatabaseConnection) -> Result<(), AppError> {
    db.execute(Statement::from_string(
        DatabaseBackend::Sqlite,
        "PRAGMA foreign_keys = ON;",
    ))
    .await?;

    let builder = db.get_database_backend();
    let schema = Schema::new(builder);

    let mut plan_stmt = schema.create_table_from_entity(action_plan::Entity);
    plan_stmt.if_not_exists();
    db.execute(builder.build(&plan_stmt)).await?;

    let mut user_stmt = schema.create_table_from_entity(user::Entity);
    user_stmt.if_not_exists();
    db.execute(builder.build(&user_stmt)).await?;

    let mut permission_stmt = schema.create_table_from_entity(role_permission::Entity);
    permission_stmt.if_not_exists();
    db.execute(builder.build(&permission_stmt)).await?;

    let mut notification_stmt = schema.create_table_from_entity(notification::Entity);
    notification_stmt.if_not_exists();
    db.execute(builder.build(&notification_stmt)).await?;

    let mut scope_index = Index::create()
        .name("idx_action_plans_scope")
        .table(action_plan::Entity)
        .col(action_plan::Column::DepartmentCode)
        .col(action_plan::Column::Year)
        .col(action_plan::Column::Month)
        .to_owned();
    scope_index.if_not_exists();
    db.execute(builder.build(&scope_index)).await?;

    let mut submission_index = Index::create()
        .name("idx_action_plans_submission")
        .table(action_plan::Entity)
        .col(action_plan::Column::SubmissionStatus)
        .to_owned();
    submission_index.if_not_exists();
    db.execute(builder.build(&submission_index)).await?;

    let mut unlock_index = Index::create()
        .name("idx_action_plans_unlock")
        .table(action_plan::Entity)
        .col(action_plan::Column::UnlockStatus)
        .to_owned();
    unlock_index.if_not_exists();
    db.execute(builder.build(&unlock_index)).await?;

    let mut permission_index = Index::create()
        .name("idx_role_permissions_key")
        .table(role_permission::Entity)
        .col(role_permission::Column::Role)
        .col(role_permission::Column::Resource)
        .col(role_permission::Column::Action)
        .unique()
        .to_owned();
    permission_index.if_not_exists();
    db.execute(builder.build(&permission_index)).await?;

    let mut recipient_index = Index::create()
        .name("idx_notifications_recipient")
        .table(notification::Entity)
        .col(notification::Column::Recipient)
        .to_owned();
    recipient_index.if_not_exists();
    db.execute(builder.build(&recipient_index)).await?;

    seed_permissions(db).await
}

/// Writes default grants for configurable triples that have no stored row.
async fn seed_permissions<C: ConnectionTrait>(db: &C) -> Result<(), AppError> {
    let now = Utc::now();
    for (role, resource, action, is_allowed) in DEFAULT_GRANTS {
        let existing = role_permission::Entity::find()
            .filter(role_permission::Column::Role.eq(role.as_str()))
            .filter(role_permission::Column::Resource.eq(resource.as_str()))
            .filter(role_permission::Column::Action.eq(action.as_str()))
            .one(db)
            .await?;
        if existing.is_some() {
            continue;
        }
        role_permission::ActiveModel {
            role: Set(role.as_str().to_string()),
            resource: Set(resource.as_str().to_string()),
            action: Set(action.as_str().to_string()),
            is_allowed: Set(*is_allowed),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(db)
        .await?;
    }
    Ok(())
}
