//! Persisted host settings.
//!
//! Small JSON state the host keeps between runs: the portal restore
//! token (skips the permission dialog) and the last user choices. Stored
//! at `~/.config/streamlinux/settings.json` with mode 0o600. Session
//! tokens and media are never written here.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::APP_DIR;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// ScreenCast portal restore token.
    pub portal_restore_token: Option<String>,
    /// Monitor selected in the last session.
    pub last_monitor: Option<u32>,
    /// Quality preset selected in the last session.
    pub last_quality: Option<String>,
}

/// Location of the settings file.
pub fn settings_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("no user config directory")?;
    Ok(base.join(APP_DIR).join("settings.json"))
}

/// Load settings; missing or unreadable files yield the defaults.
pub fn load() -> Settings {
    let Ok(path) = settings_path() else {
        return Settings::default();
    };
    match std::fs::read_to_string(&path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            tracing::warn!(?path, "Settings file corrupt, using defaults: {e}");
            Settings::default()
        }),
        Err(_) => Settings::default(),
    }
}

/// Persist settings atomically with owner-only permissions.
pub fn save(settings: &Settings) -> Result<()> {
    let path = settings_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create settings dir: {}", parent.display()))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).context("failed to serialize settings")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &contents)
        .with_context(|| format!("failed to write temp settings: {}", tmp.display()))?;
    std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
        .context("failed to restrict settings permissions")?;
    std::fs::rename(&tmp, &path)
        .with_context(|| format!("failed to rename settings: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip_json() {
        let settings = Settings {
            portal_restore_token: Some("token".into()),
            last_monitor: Some(1),
            last_quality: None,
        };
        let json = serde_json::to_string(&settings).unwrap();
        let back: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(back.portal_restore_token.as_deref(), Some("token"));
        assert_eq!(back.last_monitor, Some(1));
    }

    #[test]
    fn unknown_fields_tolerated() {
        let json = "{\"portal_restore_token\":null,\"future_field\":42}";
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert!(settings.portal_restore_token.is_none());
    }
}
