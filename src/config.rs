use std::path::{Path, PathBuf};

use chrono::Duration;

use crate::error::AppError;

pub const DATA_DIR_ENV: &str = "JOURNEYS_HOME";
pub const SESSION_ENV: &str = "JOURNEYS_SESSION";
pub const MAGIC_LINK_TTL_ENV: &str = "JOURNEYS_MAGIC_LINK_TTL";
pub const LOG_ENV: &str = "JOURNEYS_LOG";

const SESSION_ID_FLAG: &str = "--session-id";
const DEFAULT_DIR_NAME: &str = ".journeys";
pub const DEFAULT_MAGIC_LINK_TTL_MINUTES: i64 = 15;
pub const MAX_MAGIC_LINK_TTL_MINUTES: i64 = 7 * 24 * 60;

/// Runtime settings resolved from flags, with env fallbacks already applied by clap.
#[derive(Clone, Debug)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub session_id: String,
    pub magic_link_ttl: Duration,
}

impl Settings {
    pub fn resolve(
        data_dir: Option<PathBuf>,
        session_id: Option<String>,
        magic_link_ttl_minutes: Option<i64>,
    ) -> Result<Self, AppError> {
        let data_dir = match data_dir {
            Some(dir) => require_dir(dir)?,
            None => default_data_dir()?,
        };
        let session_id = resolve_session_id(session_id)?;
        let magic_link_ttl = resolve_magic_link_ttl(magic_link_ttl_minutes)?;
        Ok(Self {
            data_dir,
            session_id,
            magic_link_ttl,
        })
    }
}

fn resolve_magic_link_ttl(minutes: Option<i64>) -> Result<Duration, AppError> {
    let minutes = minutes.unwrap_or(DEFAULT_MAGIC_LINK_TTL_MINUTES);
    if !(1..=MAX_MAGIC_LINK_TTL_MINUTES).contains(&minutes) {
        return Err(AppError::InvalidInput(format!(
            "magic link ttl must be between 1 and {MAX_MAGIC_LINK_TTL_MINUTES} minutes"
        )));
    }
    Duration::try_minutes(minutes)
        .ok_or_else(|| AppError::InvalidInput(format!("magic link ttl {minutes} is out of range")))
}

fn require_dir(dir: PathBuf) -> Result<PathBuf, AppError> {
    if dir.as_os_str().to_string_lossy().trim().is_empty() {
        return Err(AppError::InvalidInput("--data-dir is empty".to_string()));
    }
    Ok(dir)
}

fn default_data_dir() -> Result<PathBuf, AppError> {
    match std::env::var("HOME") {
        Ok(home) if !home.trim().is_empty() => Ok(Path::new(&home).join(DEFAULT_DIR_NAME)),
        _ => Err(AppError::InvalidInput(format!(
            "unable to resolve data directory; pass --data-dir or set {DATA_DIR_ENV}"
        ))),
    }
}

fn resolve_session_id(session_id: Option<String>) -> Result<String, AppError> {
    let value = session_id
        .ok_or_else(|| AppError::InvalidInput(format!("{SESSION_ID_FLAG} is required")))?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::InvalidInput(format!(
            "{SESSION_ID_FLAG} is empty"
        )));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_values_win() {
        let settings = Settings::resolve(
            Some(PathBuf::from("/tmp/journeys")),
            Some("  abc  ".to_string()),
            Some(5),
        )
        .expect("settings");
        assert_eq!(settings.data_dir, PathBuf::from("/tmp/journeys"));
        assert_eq!(settings.session_id, "abc");
        assert_eq!(settings.magic_link_ttl, Duration::minutes(5));
    }

    #[test]
    fn ttl_defaults_to_fifteen_minutes() {
        let settings =
            Settings::resolve(Some(PathBuf::from("/tmp/j")), Some("s".to_string()), None)
                .expect("settings");
        assert_eq!(settings.magic_link_ttl, Duration::minutes(15));
    }

    #[test]
    fn missing_session_is_rejected() {
        let err = Settings::resolve(Some(PathBuf::from("/tmp/j")), None, None).unwrap_err();
        assert!(err.to_string().contains("--session-id is required"));
        let err = Settings::resolve(Some(PathBuf::from("/tmp/j")), Some("  ".to_string()), None)
            .unwrap_err();
        assert!(err.to_string().contains("--session-id is empty"));
    }

    #[test]
    fn non_positive_ttl_is_rejected() {
        let err = Settings::resolve(Some(PathBuf::from("/tmp/j")), Some("s".to_string()), Some(0))
            .unwrap_err();
        assert!(err.to_string().contains("magic link ttl"));
    }

    #[test]
    fn oversized_ttl_is_rejected() {
        for minutes in [MAX_MAGIC_LINK_TTL_MINUTES + 1, 1_000_000_000_000, i64::MAX] {
            let err = Settings::resolve(
                Some(PathBuf::from("/tmp/j")),
                Some("s".to_string()),
                Some(minutes),
            )
            .unwrap_err();
            assert!(matches!(err, AppError::InvalidInput(_)), "{minutes}: {err}");
        }
        let settings = Settings::resolve(
            Some(PathBuf::from("/tmp/j")),
            Some("s".to_string()),
            Some(MAX_MAGIC_LINK_TTL_MINUTES),
        )
        .expect("settings");
        assert_eq!(settings.magic_link_ttl, Duration::days(7));
    }
}
