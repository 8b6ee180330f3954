use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ChannelId, ChannelKind, MessageId, UserId},
    error::ApiError,
    protocol::{BootstrapSnapshot, ChannelSummary, MessagePayload},
};
use url::Url;

use crate::{config::normalize_server_url, error::ClientError, ClientSettings, DataFetchClient};

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct MessagePageQuery {
    pub(crate) limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) before: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CreateChannelRequest {
    pub(crate) name: String,
    pub(crate) kind: ChannelKind,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RenameChannelRequest {
    pub(crate) name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct EditMessageRequest {
    pub(crate) content: String,
}

/// REST data client. Every request carries the bearer token when one is set.
pub struct HttpDataClient {
    http: Client,
    server_url: String,
    auth_token: Option<String>,
}

impl HttpDataClient {
    pub fn new(server_url: &str, auth_token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: normalize_server_url(server_url),
            auth_token,
        }
    }

    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self::new(&settings.server_url, settings.auth_token.clone())
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.server_url)?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("server url cannot carry a path: {}", self.server_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.http.request(method, url);
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, method: Method, segments: &[&str]) -> Result<Response> {
        let url = self.endpoint(segments)?;
        check_status(self.request(method, url).send().await?).await
    }
}

/// 401 means the session is gone; 429 is a rate limit; other 4xx with an
/// error body are rejections carrying the server's reason.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::UNAUTHORIZED => Err(ClientError::AuthExpired.into()),
        StatusCode::TOO_MANY_REQUESTS => Err(ClientError::RateLimited.into()),
        status if status.is_client_error() => match response.json::<ApiError>().await {
            Ok(body) => Err(ClientError::CommandRejected {
                reason: body.message,
            }
            .into()),
            Err(_) => Err(anyhow!("request failed with status {status}")),
        },
        status => Err(anyhow!("request failed with status {status}")),
    }
}

#[async_trait]
impl DataFetchClient for HttpDataClient {
    async fn bootstrap(&self) -> Result<BootstrapSnapshot> {
        Ok(self.send(Method::GET, &["bootstrap"]).await?.json().await?)
    }

    async fn list_channels(&self) -> Result<Vec<ChannelSummary>> {
        Ok(self.send(Method::GET, &["channels"]).await?.json().await?)
    }

    async fn fetch_messages(
        &self,
        channel_id: ChannelId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessagePayload>> {
        let url = self.endpoint(&["channels", &channel_id.0.to_string(), "messages"])?;
        let response = self
            .request(Method::GET, url)
            .query(&MessagePageQuery { limit, before })
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn create_channel(&self, name: &str, kind: ChannelKind) -> Result<ChannelSummary> {
        let url = self.endpoint(&["channels"])?;
        let response = self
            .request(Method::POST, url)
            .json(&CreateChannelRequest {
                name: name.to_string(),
                kind,
            })
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn rename_channel(&self, channel_id: ChannelId, name: &str) -> Result<()> {
        let url = self.endpoint(&["channels", &channel_id.0.to_string()])?;
        let response = self
            .request(Method::PATCH, url)
            .json(&RenameChannelRequest {
                name: name.to_string(),
            })
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn delete_channel(&self, channel_id: ChannelId) -> Result<()> {
        self.send(Method::DELETE, &["channels", &channel_id.0.to_string()])
            .await?;
        Ok(())
    }

    async fn edit_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        content: &str,
    ) -> Result<()> {
        let url = self.endpoint(&[
            "channels",
            &channel_id.0.to_string(),
            "messages",
            &message_id.0.to_string(),
        ])?;
        let response = self
            .request(Method::PATCH, url)
            .json(&EditMessageRequest {
                content: content.to_string(),
            })
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn delete_message(&self, channel_id: ChannelId, message_id: MessageId) -> Result<()> {
        self.send(
            Method::DELETE,
            &[
                "channels",
                &channel_id.0.to_string(),
                "messages",
                &message_id.0.to_string(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn add_reaction(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<()> {
        self.send(
            Method::PUT,
            &[
                "channels",
                &channel_id.0.to_string(),
                "messages",
                &message_id.0.to_string(),
                "reactions",
                emoji,
            ],
        )
        .await?;
        Ok(())
    }

    async fn remove_reaction(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<()> {
        self.send(
            Method::DELETE,
            &[
                "channels",
                &channel_id.0.to_string(),
                "messages",
                &message_id.0.to_string(),
                "reactions",
                emoji,
            ],
        )
        .await?;
        Ok(())
    }

    fn avatar_url(&self, user_id: UserId) -> String {
        format!("{}/users/{}/avatar", self.server_url, user_id.0)
    }
}
