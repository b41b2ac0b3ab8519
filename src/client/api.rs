use crate::chat::{MessagePage, RoomSummary};
use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

/// REST half of the chat client: conversation list and history pages.
#[derive(Clone)]
pub struct ChatApi {
    http: Client,
    base_url: String,
    bearer: String,
}

impl ChatApi {
    pub fn new(base_url: &str, bearer: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer: bearer.into(),
        })
    }

    pub async fn rooms(&self, participant_id: &str) -> Result<Vec<RoomSummary>> {
        let url = self.url(&format!("/participants/{}/rooms", participant_id));
        self.fetch(self.authorized(self.http.get(url))).await
    }

    pub async fn history(&self, room_id: &str, page: u32, page_size: Option<u32>) -> Result<MessagePage> {
        let mut query = vec![("page", page.to_string())];
        if let Some(size) = page_size {
            query.push(("page_size", size.to_string()));
        }
        let url = self.url(&format!("/rooms/{}/messages", room_id));
        self.fetch(self.authorized(self.http.get(url).query(&query)))
            .await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.bearer)
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await.context("Chat service unreachable")?;
        let response = check(response).await?;
        response
            .json::<T>()
            .await
            .context("Unexpected response body from chat service")
    }
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body: Value = response.json().await.unwrap_or(Value::Null);
    let message = body["message"].as_str().unwrap_or("no details");
    anyhow::bail!("Chat service returned {}: {}", status, message)
}
