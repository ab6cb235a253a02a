//! HTTP client for a Recall-style v1 bot directory.

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::collections::HashSet;
use tracing::debug;

use super::{parse, BotDirectory, BotRecord, CreateBotRequest, Recording};
use crate::config::BotDirectoryConfig;
use crate::error::{classify_status, SyncError};

/// Upper bound on pages followed by one listing.
const MAX_PAGES: usize = 1_000;

#[derive(Debug, Clone)]
pub struct HttpBotDirectory {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
}

impl HttpBotDirectory {
    pub fn new(config: &BotDirectoryConfig) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|err| SyncError::Transient(format!("failed to build HTTP client: {err}")))?;

        Ok(Self {
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn auth_header_value(&self) -> String {
        format!("Token {}", self.api_key)
    }

    fn create_payload(request: &CreateBotRequest) -> JsonValue {
        let mut payload = json!({
            "meeting_url": request.meeting_url,
            "bot_name": request.bot_name,
        });

        if let Some(join_at) = request.join_at {
            payload["join_at"] = JsonValue::String(join_at.to_rfc3339());
        }
        if let Some(provider) = &request.transcript_provider {
            let mut provider_config = serde_json::Map::new();
            provider_config.insert(provider.clone(), json!({}));
            payload["recording_config"] = json!({
                "transcript": { "provider": provider_config }
            });
        }
        if !request.metadata.is_empty() {
            payload["metadata"] = json!(request.metadata);
        }

        payload
    }

    /// Send a request and return the body of a 2xx response.
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<String, SyncError> {
        let response = request
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(classify_status(status.as_u16(), body))
        }
    }
}

#[async_trait]
impl BotDirectory for HttpBotDirectory {
    async fn create_bot(&self, request: &CreateBotRequest) -> Result<String, SyncError> {
        let payload = Self::create_payload(request);
        let body = self
            .send(self.http.post(self.url("/api/v1/bot/")).json(&payload))
            .await?;
        let bot_id = parse::parse_create_response(&body)?;
        debug!("Created bot {} for {}", bot_id, request.meeting_url);
        Ok(bot_id)
    }

    async fn get_bot(&self, bot_id: &str) -> Result<BotRecord, SyncError> {
        let body = self
            .send(self.http.get(self.url(&format!("/api/v1/bot/{bot_id}/"))))
            .await?;
        parse::parse_bot(&body)
    }

    async fn list_bots(&self) -> Result<Vec<BotRecord>, SyncError> {
        let mut bots = Vec::new();
        let mut next_url = Some(self.url("/api/v1/bot/"));
        let mut visited = HashSet::new();

        while let Some(url) = next_url.take() {
            if visited.len() >= MAX_PAGES {
                return Err(SyncError::parse(
                    format!("bot listing exceeds {MAX_PAGES} pages"),
                    &url,
                ));
            }
            if !visited.insert(url.clone()) {
                return Err(SyncError::parse("bot listing pagination repeats a page", &url));
            }

            let body = self.send(self.http.get(&url)).await?;
            let (page, next) = parse::parse_bot_page(&body)?;
            bots.extend(page);
            next_url = next;
        }

        debug!("Listed {} bots across {} pages", bots.len(), visited.len());
        Ok(bots)
    }

    async fn delete_bot(&self, bot_id: &str) -> Result<(), SyncError> {
        self.send(
            self.http
                .delete(self.url(&format!("/api/v1/bot/{bot_id}/"))),
        )
        .await?;
        Ok(())
    }

    async fn recordings(&self, bot_id: &str) -> Result<Vec<Recording>, SyncError> {
        let body = self
            .send(self.http.get(self.url(&format!("/api/v1/bot/{bot_id}/"))))
            .await?;
        parse::parse_recordings(&body)
    }

    async fn transcript_download_url(&self, transcript_id: &str) -> Result<String, SyncError> {
        let body = self
            .send(
                self.http
                    .get(self.url(&format!("/api/v1/transcript/{transcript_id}/"))),
            )
            .await?;
        parse::parse_download_url(&body)
    }

    async fn download(&self, url: &str) -> Result<String, SyncError> {
        // Download URLs are pre-signed; the API token must not be sent along.
        let response = self.http.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(classify_status(status.as_u16(), body))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_create_payload_shape() {
        let mut request = CreateBotRequest::new("https://zoom.us/j/1", "Notetaker");
        request.join_at = Some(Utc.with_ymd_and_hms(2026, 4, 1, 10, 0, 0).unwrap());
        request.transcript_provider = Some("recallai_streaming".to_string());
        request
            .metadata
            .insert("event_id".to_string(), "evt-1".to_string());

        let payload = HttpBotDirectory::create_payload(&request);
        assert_eq!(payload["meeting_url"], "https://zoom.us/j/1");
        assert_eq!(payload["bot_name"], "Notetaker");
        assert_eq!(payload["join_at"], "2026-04-01T10:00:00+00:00");
        assert!(payload["recording_config"]["transcript"]["provider"]
            .get("recallai_streaming")
            .is_some());
        assert_eq!(payload["metadata"]["event_id"], "evt-1");
    }

    #[test]
    fn test_create_payload_omits_optional_fields() {
        let payload =
            HttpBotDirectory::create_payload(&CreateBotRequest::new("https://zoom.us/j/1", "Bot"));
        assert!(payload.get("join_at").is_none());
        assert!(payload.get("recording_config").is_none());
        assert!(payload.get("metadata").is_none());
    }

    #[test]
    fn test_base_url_is_trimmed() {
        let config = BotDirectoryConfig {
            base_url: "http://127.0.0.1:9000/".to_string(),
            ..Default::default()
        };
        let client = HttpBotDirectory::new(&config).unwrap();
        assert_eq!(client.url("/api/v1/bot/"), "http://127.0.0.1:9000/api/v1/bot/");
    }
}
