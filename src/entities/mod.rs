pub mod action_plan;
pub mod notification;
pub mod role_permission;
pub mod user;
