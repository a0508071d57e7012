use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::settings::MonitorSettings;

pub const CURRENT_REGISTRY_VERSION: u32 = 1;

/// One application gated behind the master password.
///
/// `match_patterns` are lowercase fragments compared case-insensitively
/// against process names and command lines. Every concurrently running match
/// belongs to one group: a browser with a dozen worker processes is a single
/// lockable unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockedApplication {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub exec_path: Option<PathBuf>,
    #[serde(default)]
    pub match_patterns: Vec<String>,
    #[serde(default)]
    pub unlock_count: u64,
    #[serde(default)]
    pub last_unlocked_at: Option<DateTime<Utc>>,
    pub added_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl LockedApplication {
    pub fn new(name: &str, exec_path: Option<PathBuf>) -> Self {
        let now = Utc::now();
        let mut app = Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            exec_path,
            match_patterns: vec![],
            unlock_count: 0,
            last_unlocked_at: None,
            added_at: now,
            modified_at: now,
        };
        app.match_patterns = vec![app.default_pattern()];
        app
    }

    /// The fallback pattern when none were configured: the executable's file
    /// name, or the display name.
    fn default_pattern(&self) -> String {
        self.exec_path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| self.name.to_lowercase())
    }

    /// Case-insensitive match of a running process against this application.
    /// `name` and `cmdline` are compared lowercased; the executable path, if
    /// configured, also matches via the command line.
    pub fn matches(&self, name: &str, cmdline: &str) -> bool {
        let name = name.to_lowercase();
        let cmdline = cmdline.to_lowercase();
        let patterns = if self.match_patterns.is_empty() {
            vec![self.default_pattern()]
        } else {
            self.match_patterns.clone()
        };
        for pattern in &patterns {
            let pattern = pattern.to_lowercase();
            if pattern.is_empty() {
                continue;
            }
            if name.contains(&pattern) || cmdline.contains(&pattern) {
                return true;
            }
        }
        if let Some(path) = &self.exec_path {
            let path = path.to_string_lossy().to_lowercase();
            if !path.is_empty() && cmdline.contains(path.as_str()) {
                return true;
            }
        }
        false
    }
}

/// The decrypted vault payload: locked applications, monitor settings and the
/// manifest signing key. Serialized as JSON inside the AEAD envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRegistry {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub apps: Vec<LockedApplication>,
    #[serde(default)]
    pub settings: MonitorSettings,
    /// Base64 Ed25519 seed used to sign the backup manifest.
    pub signing_key: String,
}

impl AppRegistry {
    pub fn new(signing_key: String) -> Self {
        let now = Utc::now();
        Self {
            version: CURRENT_REGISTRY_VERSION,
            created_at: now,
            last_modified: now,
            apps: vec![],
            settings: MonitorSettings::default(),
            signing_key,
        }
    }

    pub fn add_app(&mut self, app: LockedApplication) {
        self.apps.push(app);
        self.last_modified = Utc::now();
    }

    pub fn remove_app(&mut self, id: Uuid) -> bool {
        let before = self.apps.len();
        self.apps.retain(|a| a.id != id);
        self.last_modified = Utc::now();
        self.apps.len() != before
    }

    pub fn app_mut(&mut self, id: Uuid) -> Option<&mut LockedApplication> {
        self.apps.iter_mut().find(|a| a.id == id)
    }

    /// Decode the Ed25519 seed carried in the payload.
    pub fn manifest_signing_key(&self) -> anyhow::Result<ed25519_dalek::SigningKey> {
        use base64::{engine::general_purpose, Engine as _};
        let bytes = general_purpose::STANDARD
            .decode(&self.signing_key)
            .map_err(|e| anyhow::anyhow!("decode signing key: {e}"))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("signing key length invalid"))?;
        Ok(ed25519_dalek::SigningKey::from_bytes(&bytes))
    }

    pub fn record_unlock(&mut self, id: Uuid, at: DateTime<Utc>) {
        if let Some(app) = self.app_mut(id) {
            app.unlock_count += 1;
            app.last_unlocked_at = Some(at);
            app.modified_at = at;
        }
        self.last_modified = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_name_and_cmdline_case_insensitive() {
        let app = LockedApplication::new("Calculator", Some(PathBuf::from("/usr/bin/gnome-calculator")));
        assert!(app.matches("GNOME-Calculator", ""));
        assert!(app.matches("sh", "/usr/bin/gnome-calculator --standalone"));
        assert!(!app.matches("firefox", "/usr/lib/firefox/firefox"));
    }

    #[test]
    fn group_pattern_matches_family() {
        let mut app = LockedApplication::new("Chrome", None);
        app.match_patterns = vec!["chrome".into()];
        assert!(app.matches("chrome", ""));
        assert!(app.matches("Google Chrome Helper", ""));
        assert!(app.matches("chrome_crashpad_handler", ""));
    }

    #[test]
    fn unlock_bookkeeping() {
        let mut reg = AppRegistry::new(String::new());
        let app = LockedApplication::new("calc", None);
        let id = app.id;
        reg.add_app(app);
        reg.record_unlock(id, Utc::now());
        assert_eq!(reg.apps[0].unlock_count, 1);
        assert!(reg.apps[0].last_unlocked_at.is_some());
        assert!(reg.remove_app(id));
        assert!(!reg.remove_app(id));
    }
}
