use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::names::Labels;

const CONFIG_FILE: &str = "config.json";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct ClientConfig {
    /// Base URL of the backend serving the join/leave endpoints.
    #[serde(default)]
    pub api_base_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    /// Real-time server used when the join response names none.
    #[serde(default)]
    pub transport_url: String,
    #[serde(default)]
    pub current_user_id: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

impl ClientConfig {
    pub fn labels(&self) -> Labels {
        Labels::for_language(self.language.as_deref())
    }
}

/// Loads and persists [`ClientConfig`] as JSON in the app data directory.
pub struct ConfigStore {
    config: Mutex<ClientConfig>,
    file_path: PathBuf,
}

impl ConfigStore {
    pub fn new(data_dir: &str) -> Self {
        let file_path = PathBuf::from(data_dir).join(CONFIG_FILE);
        let config = Self::load(&file_path);
        Self {
            config: Mutex::new(config),
            file_path,
        }
    }

    pub fn get(&self) -> ClientConfig {
        self.lock().clone()
    }

    pub fn set_api(&self, base_url: String, token: Option<String>) {
        {
            let mut config = self.lock();
            config.api_base_url = base_url;
            config.api_token = token;
        }
        self.save();
    }

    pub fn set_transport_url(&self, url: String) {
        self.lock().transport_url = url;
        self.save();
    }

    pub fn set_current_user_id(&self, id: Option<String>) {
        self.lock().current_user_id = id;
        self.save();
    }

    pub fn set_language(&self, lang: Option<String>) {
        self.lock().language = lang;
        self.save();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClientConfig> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save(&self) {
        let config = self.get();
        if let Some(parent) = self.file_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&config) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.file_path, json) {
                    tracing::warn!("failed to write {}: {e}", self.file_path.display());
                }
            }
            Err(e) => tracing::warn!("failed to serialize config: {e}"),
        }
    }

    fn load(path: &Path) -> ClientConfig {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("ignoring unreadable {}: {e}", path.display());
                ClientConfig::default()
            }),
            Err(_) => ClientConfig::default(),
        }
    }
}
