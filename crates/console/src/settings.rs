use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chatkit::{ChatSettings, settings::SETTINGS_ENV_PREFIX};
use chatkit_llm::{DEFAULT_OPENAI_MODEL, ECHO_PROVIDER_ID, ProviderConfig};
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{
    ConsoleResult, CreateDirSnafu, RenameTempFileSnafu, SerializeConfigSnafu, WriteFileSnafu,
};

pub const DEFAULT_PROVIDER_ID: &str = "openai";
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const SETTINGS_DIRECTORY_NAME: &str = "chatkit";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const BOOKMARK_FILE_NAME: &str = "bookmark.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub preamble: Option<String>,
    /// Print raw signal envelopes instead of rendered text.
    #[serde(default)]
    pub json_output: bool,
    #[serde(default)]
    pub chat: ChatSettings,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            model: default_model(),
            preamble: None,
            json_output: false,
            chat: ChatSettings::default(),
        }
    }
}

impl ConsoleSettings {
    /// Provider to talk to; the echo provider when no API key is configured.
    pub fn to_provider_config(&self) -> ProviderConfig {
        if self.api_key.trim().is_empty() {
            return ProviderConfig::new(ECHO_PROVIDER_ID, "", "", None);
        }

        ProviderConfig::new(
            &self.provider_id,
            &self.api_key,
            &self.endpoint,
            Some(self.model.clone()),
        )
    }

    pub fn normalized(mut self) -> Self {
        self.provider_id = self.provider_id.trim().to_string();
        if self.provider_id.is_empty() {
            self.provider_id = default_provider_id();
        }
        self.model = self.model.trim().to_string();
        if self.model.is_empty() {
            self.model = default_model();
        }
        self.preamble = self
            .preamble
            .map(|preamble| preamble.trim().to_string())
            .filter(|preamble| !preamble.is_empty());
        self.chat = self.chat.normalized();
        self
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(SETTINGS_ENV_PREFIX).split("__"))
            .merge(Env::raw().only(&["OPENAI_API_KEY"]).map(|_| "api_key".into()))
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<ConsoleSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".chatkit"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn bookmark_path(&self) -> PathBuf {
        self.config_path.with_file_name(BOOKMARK_FILE_NAME)
    }

    /// Shared cell for readers that must observe later updates.
    pub fn shared(&self) -> Arc<ArcSwap<ConsoleSettings>> {
        self.settings.clone()
    }

    pub fn settings(&self) -> Arc<ConsoleSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ConsoleSettings) -> ConsoleResult<()> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> ConsoleSettings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found, using defaults and environment");
        }

        match ConsoleSettings::figment(path).extract::<ConsoleSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(path = ?path, error = %error, "failed to parse settings, using defaults");
                ConsoleSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ConsoleSettings) -> ConsoleResult<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;
        write_atomically(&self.config_path, content)?;

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

/// Writes through a temporary sibling file so readers never see a partial file.
pub fn write_atomically(path: &Path, content: String) -> ConsoleResult<()> {
    let temp_path = path.with_extension("json.tmp");
    std::fs::write(&temp_path, content).context(WriteFileSnafu {
        stage: "write-temporary-file",
        path: temp_path.clone(),
    })?;

    std::fs::rename(&temp_path, path).context(RenameTempFileSnafu {
        stage: "rename-temporary-file",
        from: temp_path,
        to: path.to_path_buf(),
    })?;
    Ok(())
}

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_model() -> String {
    DEFAULT_OPENAI_MODEL.to_string()
}

#[cfg(test)]
mod tests {
    use chatkit::ErrorPolicy;
    use figment::Jail;

    use super::*;

    #[test]
    fn missing_key_falls_back_to_echo() {
        let settings = ConsoleSettings::default();
        assert_eq!(settings.to_provider_config().provider_id, ECHO_PROVIDER_ID);
    }

    #[test]
    fn file_and_environment_are_layered() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "settings.json",
                r#"{ "model": "gpt-test", "chat": { "on_error": "actual" } }"#,
            )?;
            jail.set_env("OPENAI_API_KEY", "sk-env");
            jail.set_env("CHATKIT_JSON_OUTPUT", "true");

            let store = SettingsStore::new(jail.directory().join("settings.json"));
            let settings = store.settings();
            assert_eq!(settings.model, "gpt-test");
            assert_eq!(settings.api_key, "sk-env");
            assert!(settings.json_output);
            assert_eq!(settings.chat.on_error, ErrorPolicy::Actual);
            assert_eq!(settings.to_provider_config().provider_id, DEFAULT_PROVIDER_ID);
            Ok(())
        });
    }

    #[test]
    fn updates_are_persisted_and_swapped_in() {
        Jail::expect_with(|jail| {
            let path = jail.directory().join("nested").join("settings.json");
            let store = SettingsStore::new(path.clone());

            let mut settings = (*store.settings()).clone();
            settings.json_output = true;
            settings.model = "  ".to_string();
            store.update(settings).map_err(|error| error.to_string())?;

            assert!(store.settings().json_output);
            assert_eq!(store.settings().model, DEFAULT_OPENAI_MODEL);
            assert!(SettingsStore::new(path).settings().json_output);
            Ok(())
        });
    }
}
