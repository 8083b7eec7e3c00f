use async_trait::async_trait;
use backend::ingest::{CharacterSource, SourceError};
use shared::models::CharacterPayload;
use std::time::Duration;

/// Fetches character cards published as JSON over HTTP.
pub struct HttpCharacterSource {
    http: reqwest::Client,
}

impl HttpCharacterSource {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl CharacterSource for HttpCharacterSource {
    async fn fetch_character_from_url(&self, url: &str) -> Result<CharacterPayload, SourceError> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        let payload: CharacterPayload = response.json().await?;
        if payload.name.trim().is_empty() {
            return Err(SourceError::Invalid(format!("card at {url} has no name")));
        }
        Ok(payload)
    }

    async fn extract_character_from_image(
        &self,
        _image: &[u8],
    ) -> Result<CharacterPayload, SourceError> {
        Err(SourceError::Unsupported(
            "reading cards from images is not supported".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetches_json_cards() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cards/ada.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "Ada",
                "first_messages": ["Hello there."],
                "tags": ["math"]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cards/missing.json"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let source = HttpCharacterSource::new(Duration::from_secs(2)).unwrap();
        let ada = source
            .fetch_character_from_url(&format!("{}/cards/ada.json", server.uri()))
            .await
            .unwrap();
        assert_eq!(ada.name, "Ada");
        assert_eq!(ada.first_messages, vec!["Hello there.".to_string()]);

        let missing = source
            .fetch_character_from_url(&format!("{}/cards/missing.json", server.uri()))
            .await;
        assert!(matches!(missing, Err(SourceError::Http(_))));
    }
}
