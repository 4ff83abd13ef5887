use std::fmt;

use thiserror::Error;

/// An item that prevents a lifecycle transition from running.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blocker {
    pub id: i64,
    pub reason: String,
}

impl fmt::Display for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "- plan id {}: {}", self.id, self.reason)
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{}", multiline("Not found", .0))]
    NotFound(String),
    #[error("{}", multiline("Invalid input", .0))]
    InvalidInput(String),
    #[error("{}", multiline("Permission denied", .0))]
    PermissionDenied(String),
    #[error("{}", precondition(.message, .blockers))]
    PreconditionFailed {
        message: String,
        blockers: Vec<Blocker>,
    },
    #[error("plan id {0} was recalled by its department; re-fetch before grading again")]
    ItemRecalled(i64),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Io(_) => "IO_ERROR",
            AppError::Db(_) => "STORE_ERROR",
            AppError::Json(_) => "JSON_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::InvalidInput(_) => "VALIDATION_FAILED",
            AppError::PermissionDenied(_) => "PERMISSION_DENIED",
            AppError::PreconditionFailed { .. } => "PRECONDITION_FAILED",
            AppError::ItemRecalled(_) => "ITEM_RECALLED",
        }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        AppError::PreconditionFailed {
            message: message.into(),
            blockers: Vec::new(),
        }
    }

    pub fn blocked(message: impl Into<String>, blockers: Vec<Blocker>) -> Self {
        AppError::PreconditionFailed {
            message: message.into(),
            blockers,
        }
    }
}

fn multiline(label: &str, message: &str) -> String {
    if message.contains('\n') {
        format!("{label}:\n{message}")
    } else {
        format!("{label}: {message}")
    }
}

fn precondition(message: &str, blockers: &[Blocker]) -> String {
    if blockers.is_empty() {
        return multiline("Precondition failed", message);
    }
    let lines = blockers
        .iter()
        .map(|blocker| blocker.to_string())
        .collect::<Vec<_>>()
        .join("\n");
    format!("Precondition failed: {message}\n{lines}")
}
