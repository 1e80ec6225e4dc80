use std::path::Path;

use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{ChatResult, LoadSettingsSnafu};

pub const DEFAULT_PLACEHOLDER: &str = "Enter a message...";
pub const DEFAULT_SANITIZED_ERROR_MESSAGE: &str =
    "An error has occurred. Check your logs or contact the app author for clarification.";
pub const SETTINGS_ENV_PREFIX: &str = "CHATKIT_";

/// How failures inside submit callbacks and stream producers are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// `sanitize` when the host sanitizes errors, `actual` otherwise.
    #[default]
    Auto,
    Actual,
    Sanitize,
    /// Propagate the error to the caller without notifying the user.
    Unhandled,
}

impl ErrorPolicy {
    pub fn resolve(self, sanitize_errors: bool) -> Self {
        match self {
            Self::Auto if sanitize_errors => Self::Sanitize,
            Self::Auto => Self::Actual,
            other => other,
        }
    }
}

/// Event that triggers an automatic bookmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookmarkOn {
    /// Bookmark once the assistant has finished responding.
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default)]
    pub on_error: ErrorPolicy,
    #[serde(default = "default_sanitize_errors")]
    pub sanitize_errors: bool,
    #[serde(default = "default_sanitized_error_message")]
    pub sanitized_error_message: String,
    #[serde(default = "default_placeholder")]
    pub placeholder: String,
    #[serde(default = "default_bookmark_on")]
    pub bookmark_on: Option<BookmarkOn>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            on_error: ErrorPolicy::default(),
            sanitize_errors: default_sanitize_errors(),
            sanitized_error_message: default_sanitized_error_message(),
            placeholder: default_placeholder(),
            bookmark_on: default_bookmark_on(),
        }
    }
}

impl ChatSettings {
    /// Defaults, then the optional JSON file, then `CHATKIT_*` environment variables.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Json::file(path));
        }
        figment.merge(Env::prefixed(SETTINGS_ENV_PREFIX))
    }

    pub fn load(path: Option<&Path>) -> ChatResult<Self> {
        let settings = Self::figment(path)
            .extract::<Self>()
            .context(LoadSettingsSnafu {
                stage: "extract-chat-settings",
            })?;
        Ok(settings.normalized())
    }

    pub fn resolved_error_policy(&self) -> ErrorPolicy {
        self.on_error.resolve(self.sanitize_errors)
    }

    pub fn normalized(mut self) -> Self {
        self.placeholder = self.placeholder.trim().to_string();
        if self.placeholder.is_empty() {
            self.placeholder = default_placeholder();
        }
        self.sanitized_error_message = self.sanitized_error_message.trim().to_string();
        if self.sanitized_error_message.is_empty() {
            self.sanitized_error_message = default_sanitized_error_message();
        }
        self
    }
}

fn default_sanitize_errors() -> bool {
    true
}

fn default_sanitized_error_message() -> String {
    DEFAULT_SANITIZED_ERROR_MESSAGE.to_string()
}

fn default_placeholder() -> String {
    DEFAULT_PLACEHOLDER.to_string()
}

fn default_bookmark_on() -> Option<BookmarkOn> {
    Some(BookmarkOn::Response)
}
