use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSettings {
    pub new_message: bool,
}

/// Sampling knobs passed to the model backend; `None` keeps the backend default.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmSettings {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub repeat_penalty: Option<f32>,
    pub top_p: Option<f64>,
    pub seed: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    pub server_url: Option<String>,
    pub client_id: Option<String>,
    pub api_key: Option<String>,
}

/// Everything needed to reach a sync server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncCredentials {
    pub server_url: String,
    pub client_id: String,
    pub api_key: String,
}

impl SyncSettings {
    /// Sync is enabled only when all three settings are present.
    pub fn credentials(&self) -> Option<SyncCredentials> {
        fn present(value: &Option<String>) -> Option<String> {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        }
        Some(SyncCredentials {
            server_url: present(&self.server_url)?
                .trim_end_matches('/')
                .to_string(),
            client_id: present(&self.client_id)?,
            api_key: present(&self.api_key)?,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.credentials().is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub user_name: String,
    /// Base URL of the OpenAI-compatible model backend
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub notifications: NotificationSettings,
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub sync: SyncSettings,
}

impl Config {
    pub fn from_defaults(defaults: &ConfigDefaults) -> Self {
        Self {
            user_name: defaults.user_name.clone(),
            api_url: format!("http://localhost:{}/v1", defaults.api_port),
            notifications: NotificationSettings::default(),
            llm: LlmSettings {
                temperature: Some(defaults.temperature),
                ..Default::default()
            },
            sync: SyncSettings::default(),
        }
    }
}

/// Values used to bootstrap the config singleton on a fresh store.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigDefaults {
    pub user_name: String,
    /// Port of the local model backend
    pub api_port: u16,
    pub temperature: f64,
}

impl ConfigDefaults {
    /// Local model servers listen on different ports on Windows.
    pub fn for_host() -> Self {
        let api_port = if cfg!(windows) { 5001 } else { 1234 };
        Self {
            api_port,
            ..Default::default()
        }
    }
}

impl Default for ConfigDefaults {
    fn default() -> Self {
        Self {
            user_name: "User".to_string(),
            api_port: 1234,
            temperature: 0.8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_require_all_three_fields() {
        let mut sync = SyncSettings {
            server_url: Some("https://sync.example.com/".into()),
            client_id: Some("laptop".into()),
            api_key: None,
        };
        assert!(sync.credentials().is_none());
        sync.api_key = Some("  ".into());
        assert!(!sync.is_enabled());
        sync.api_key = Some("secret".into());
        let creds = sync.credentials().unwrap();
        assert_eq!(creds.server_url, "https://sync.example.com");
        assert_eq!(creds.client_id, "laptop");
    }

    #[test]
    fn default_config_uses_injected_port() {
        let config = Config::from_defaults(&ConfigDefaults {
            api_port: 5001,
            ..Default::default()
        });
        assert_eq!(config.user_name, "User");
        assert_eq!(config.api_url, "http://localhost:5001/v1");
        assert_eq!(config.llm.temperature, Some(0.8));
        assert!(!config.notifications.new_message);
        assert!(!config.sync.is_enabled());
    }

    #[test]
    fn missing_sections_deserialize_to_defaults() {
        let config: Config = serde_json::from_str(r#"{"userName":"Alice"}"#).unwrap();
        assert_eq!(config.user_name, "Alice");
        assert_eq!(config.sync, SyncSettings::default());
        assert_eq!(config.llm.max_tokens, None);
    }
}
