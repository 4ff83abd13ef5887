use std::env;
use std::path::{Path, PathBuf};

use chrono::Duration;

use crate::error::AppError;

pub const HOME_ENV: &str = "ACTIONPLAN_HOME";
pub const USER_ENV: &str = "ACTIONPLAN_USER";
pub const LOG_ENV: &str = "ACTIONPLAN_LOG";

/// Literal an administrator must type before grades are wiped in bulk.
pub const RESET_CONFIRMATION: &str = "RESET ALL GRADES";

const DATA_DIR: &str = ".actionplan";
const DB_FILE: &str = "actionplan.db";
const PERMISSION_CACHE_TTL_SECS: i64 = 5 * 60;

#[derive(Clone, Debug)]
pub struct Config {
    pub home: PathBuf,
    pub acting_user: Option<String>,
    pub permission_cache_ttl: Duration,
    pub reset_confirmation: String,
}

impl Config {
    /// Flags win over environment variables, which win over `$HOME/.actionplan`.
    pub fn resolve(home: Option<PathBuf>, acting_user: Option<String>) -> Result<Self, AppError> {
        let home = match home {
            Some(path) => path,
            None => resolve_home()?,
        };
        let acting_user = acting_user
            .or_else(|| env::var(USER_ENV).ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        Ok(Self::with_home(home, acting_user))
    }

    pub fn with_home(home: PathBuf, acting_user: Option<String>) -> Self {
        Self {
            home,
            acting_user,
            permission_cache_ttl: Duration::seconds(PERMISSION_CACHE_TTL_SECS),
            reset_confirmation: RESET_CONFIRMATION.to_string(),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        resolve_db_path(&self.home)
    }
}

pub fn resolve_db_path(home: &Path) -> PathBuf {
    home.join(DB_FILE)
}

fn resolve_home() -> Result<PathBuf, AppError> {
    if let Ok(value) = env::var(HOME_ENV) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }
    let home = env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .ok_or_else(|| {
            AppError::InvalidInput(format!(
                "cannot resolve data directory; pass --home or set {HOME_ENV}"
            ))
        })?;
    Ok(PathBuf::from(home).join(DATA_DIR))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_home_wins() {
        let config = Config::resolve(Some(PathBuf::from("/tmp/plans")), Some(" u1 ".to_string()))
            .expect("config");
        assert_eq!(config.db_path(), PathBuf::from("/tmp/plans/actionplan.db"));
        assert_eq!(config.acting_user.as_deref(), Some("u1"));
        assert_eq!(config.permission_cache_ttl, Duration::minutes(5));
        assert_eq!(config.reset_confirmation, RESET_CONFIRMATION);
    }
}
