use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use crate::app::App;
use crate::clock::{Clock, ManualClock};
use crate::config::Config;
use crate::db;
use crate::entities::action_plan;
use crate::model::{Actor, CompletionStatus, Month, MonthScope, NewUser, PlanInput, Role};

pub const ADMIN: &str = "admin";
pub const LEADER: &str = "lead-fin";
pub const STAFF: &str = "staff-fin";
pub const HR_LEADER: &str = "lead-hr";

pub async fn setup_app() -> (TempDir, App, Arc<ManualClock>) {
    let dir = TempDir::new().expect("temp dir");
    let config = Config::with_home(dir.path().to_path_buf(), None);
    let db_path = config.db_path();
    db::ensure_parent_dir(&db_path).expect("ensure parent");
    let db = db::connect(&db_path).await.expect("connect db");
    db::ensure_schema(&db).await.expect("ensure schema");

    let start = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let shared: Arc<dyn Clock> = clock.clone();
    let app = App::new(db, shared, &config);

    app.setup_admin(ADMIN, "Administrator").await.expect("admin");
    let admin = app.resolve_actor(ADMIN).await.expect("admin actor");
    for (id, name, role, department) in [
        (LEADER, "Rina", Role::Leader, "FIN"),
        (STAFF, "Dewi", Role::Staff, "FIN"),
        (HR_LEADER, "Agus", Role::Leader, "HR"),
    ] {
        app.add_user(
            &admin,
            NewUser {
                id: id.to_string(),
                full_name: name.to_string(),
                role,
                department_code: Some(department.to_string()),
            },
        )
        .await
        .expect("seed user");
    }
    (dir, app, clock)
}

pub fn march() -> MonthScope {
    MonthScope::new("FIN", 2026, Month::Mar)
}

pub async fn add_plan(app: &App, actor: &Actor, month: Month, pic: &str) -> action_plan::Model {
    app.create_plan(
        actor,
        PlanInput {
            department_code: "fin".to_string(),
            year: 2026,
            month: Some(month),
            category: "Finance".to_string(),
            area_focus: "Closing".to_string(),
            goal_strategy: "Faster close".to_string(),
            action_plan: format!("Reconcile ledger for {pic}"),
            indicator: "Ledger reconciled".to_string(),
            pic: pic.to_string(),
            ..Default::default()
        },
    )
    .await
    .expect("create plan")
}

/// March FIN drafts, one per status, in the order given.
pub async fn add_plans_with_status(
    app: &App,
    leader: &Actor,
    statuses: &[CompletionStatus],
) -> Vec<i64> {
    let mut ids = Vec::new();
    for status in statuses {
        let plan = add_plan(app, leader, Month::Mar, "Dewi").await;
        if *status != CompletionStatus::Pending {
            app.update_status(leader, plan.id, *status)
                .await
                .expect("set status");
        }
        ids.push(plan.id);
    }
    ids
}

/// Creates and finalizes March plans, all Achieved.
pub async fn submitted_plans(app: &App, leader: &Actor, count: usize) -> Vec<i64> {
    let statuses = vec![CompletionStatus::Achieved; count];
    let ids = add_plans_with_status(app, leader, &statuses).await;
    app.finalize_month(leader, &march()).await.expect("finalize");
    ids
}
