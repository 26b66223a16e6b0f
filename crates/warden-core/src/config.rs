use std::{
    env, fs,
    path::{Path, PathBuf},
};

use chrono::Duration;

use crate::{errors::Error, signals::SignalTags, Result};

/// Typed configuration, loaded from the environment (plus `.env` if present).
#[derive(Clone, Debug)]
pub struct Config {
    // Core
    pub telegram_bot_token: String,
    pub owner_id: i64,
    pub database_path: PathBuf,

    // Compliance policy
    pub window: Duration,
    pub warning_offset: Duration,

    // Recognized tags
    pub proof_tag: String,
    pub leave_tag: String,
    pub return_tag: String,

    // Audit
    pub audit_log_path: PathBuf,
    pub audit_log_json: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        // Required env vars
        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let owner_id = env_i64("OWNER_ID").ok_or_else(|| {
            Error::Config("OWNER_ID environment variable is required".to_string())
        })?;

        let database_path =
            env_path("DATABASE_PATH").unwrap_or_else(|| PathBuf::from("warden.db"));
        if let Some(parent) = database_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // Compliance window: removal after `window`, warning at `warning_offset`.
        let window_hours = env_u64("REPORT_WINDOW_HOURS").unwrap_or(168);
        let warning_hours = env_u64("WARNING_AFTER_HOURS").unwrap_or(144);
        if window_hours == 0 {
            return Err(Error::Config(
                "REPORT_WINDOW_HOURS must be greater than zero".to_string(),
            ));
        }
        if warning_hours == 0 || warning_hours >= window_hours {
            return Err(Error::Config(format!(
                "WARNING_AFTER_HOURS ({warning_hours}) must be between 1 and REPORT_WINDOW_HOURS - 1 ({})",
                window_hours - 1
            )));
        }
        let window = Duration::hours(window_hours as i64);
        let warning_offset = Duration::hours(warning_hours as i64);

        // Tags (empty values fall back to defaults)
        let proof_tag = env_str("PROOF_TAG")
            .and_then(non_empty)
            .unwrap_or_else(|| "#report".to_string());
        let leave_tag = env_str("LEAVE_TAG")
            .and_then(non_empty)
            .unwrap_or_else(|| "#away".to_string());
        let return_tag = env_str("RETURN_TAG")
            .and_then(non_empty)
            .unwrap_or_else(|| "#back".to_string());

        // Audit logging
        let audit_log_path =
            env_path("AUDIT_LOG_PATH").unwrap_or_else(|| PathBuf::from("warden-audit.log"));
        let audit_log_json = env_bool("AUDIT_LOG_JSON").unwrap_or(false);

        Ok(Self {
            telegram_bot_token,
            owner_id,
            database_path,
            window,
            warning_offset,
            proof_tag,
            leave_tag,
            return_tag,
            audit_log_path,
            audit_log_json,
        })
    }

    pub fn tags(&self) -> SignalTags {
        SignalTags::new(&self.proof_tag, &self.leave_tag, &self.return_tag)
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_i64(key: &str) -> Option<i64> {
    env_str(key).and_then(|s| s.trim().parse::<i64>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
