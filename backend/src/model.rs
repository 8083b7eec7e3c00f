use async_trait::async_trait;
use serde::Deserialize;
use shared::models::Config;
use std::time::Duration;

/// Answers which model the configured backend currently serves.
#[async_trait]
pub trait ModelResolver: Send + Sync {
    /// `None` when no model is loaded or the backend cannot be reached.
    async fn active_model(&self, config: &Config) -> Option<String>;
}

/// A resolver that always reports the same model.
#[derive(Clone, Debug)]
pub struct FixedModel(pub String);

#[async_trait]
impl ModelResolver for FixedModel {
    async fn active_model(&self, _config: &Config) -> Option<String> {
        Some(self.0.clone())
    }
}

#[derive(Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

/// Asks an OpenAI-compatible backend at `Config::api_url` for its model list and
/// takes the first entry.
#[derive(Clone, Debug)]
pub struct OpenAiModels {
    http: reqwest::Client,
}

impl OpenAiModels {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ModelResolver for OpenAiModels {
    async fn active_model(&self, config: &Config) -> Option<String> {
        let url = format!("{}/models", config.api_url.trim_end_matches('/'));
        let response = match self.http.get(&url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                tracing::debug!(status = %r.status(), %url, "model backend refused model list");
                return None;
            }
            Err(e) => {
                tracing::debug!(error = %e, %url, "model backend unreachable");
                return None;
            }
        };
        let list: ModelList = response.json().await.ok()?;
        list.data.into_iter().next().map(|m| m.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::models::ConfigDefaults;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> Config {
        Config {
            api_url: format!("{}/v1", server.uri()),
            ..Config::from_defaults(&ConfigDefaults::default())
        }
    }

    #[tokio::test]
    async fn first_listed_model_is_active() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "object": "list",
                "data": [{ "id": "mistral-7b" }, { "id": "llama-3" }]
            })))
            .mount(&server)
            .await;

        let resolver = OpenAiModels::new(Duration::from_secs(2)).unwrap();
        assert_eq!(
            resolver.active_model(&config_for(&server)).await.as_deref(),
            Some("mistral-7b")
        );
    }

    #[tokio::test]
    async fn empty_or_failing_backend_has_no_model() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let resolver = OpenAiModels::new(Duration::from_secs(2)).unwrap();
        assert_eq!(resolver.active_model(&config_for(&server)).await, None);
    }
}
