use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard},
    time::Duration,
};

use crate::media::{MediaConstraints, DEFAULT_SLICE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub csrf_token: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".into(),
            auth_token: None,
            csrf_token: None,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallSettings {
    pub recording_slice_ms: u64,
    pub capture_video: bool,
}

impl CallSettings {
    pub fn slice(&self) -> Duration {
        Duration::from_millis(self.recording_slice_ms.max(100))
    }

    pub fn constraints(&self) -> MediaConstraints {
        if self.capture_video {
            MediaConstraints::audio_video()
        } else {
            MediaConstraints::audio_only()
        }
    }
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            recording_slice_ms: DEFAULT_SLICE.as_millis() as u64,
            capture_video: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    pub poll_interval_secs: u64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub backend: BackendSettings,
    pub call: CallSettings,
    pub tracker: TrackerSettings,
    /// Submission journal location. Defaults next to the settings file.
    pub journal_path: Option<PathBuf>,
    pub debug: bool,
}

impl AppSettings {
    /// Copy safe to print: bearer and CSRF tokens are masked.
    pub fn redacted(&self) -> Self {
        let mask = |token: &Option<String>| token.as_ref().map(|_| "********".to_string());
        let mut copy = self.clone();
        copy.backend.auth_token = mask(&self.backend.auth_token);
        copy.backend.csrf_token = mask(&self.backend.csrf_token);
        copy
    }

    /// `HIRECALL_BACKEND_URL`, `HIRECALL_AUTH_TOKEN` and `HIRECALL_DEBUG` win over the file.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("HIRECALL_BACKEND_URL").filter(|v| !v.trim().is_empty()) {
            self.backend.base_url = url;
        }
        if let Some(token) = lookup("HIRECALL_AUTH_TOKEN").filter(|v| !v.trim().is_empty()) {
            self.backend.auth_token = Some(token);
        }
        if let Some(debug) = lookup("HIRECALL_DEBUG") {
            self.debug = debug == "1" || debug.eq_ignore_ascii_case("true");
        }
    }
}

pub struct SettingsStore {
    path: PathBuf,
    /// What the file holds; `persist` writes this back, never the env overrides.
    stored: AppSettings,
    data: RwLock<AppSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        Self::with_overrides(path, |key| env::var(key).ok())
    }

    fn with_overrides(path: PathBuf, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let stored: AppSettings = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse settings in {}", path.display()))?
        } else {
            AppSettings::default()
        };
        let mut data = stored.clone();
        data.apply_overrides(lookup);

        Ok(Self {
            path,
            stored,
            data: RwLock::new(data),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, AppSettings> {
        match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> AppSettings {
        self.read().clone()
    }

    pub fn journal_path(&self) -> PathBuf {
        if let Some(path) = self.read().journal_path.clone() {
            return path;
        }
        self.path
            .parent()
            .map(|dir| dir.join("hirecall.sqlite3"))
            .unwrap_or_else(|| PathBuf::from("hirecall.sqlite3"))
    }

    pub fn persist(&self) -> Result<()> {
        let serialized = serde_json::to_string_pretty(&self.stored)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
