//! Resolves the Kick channel identity after a fresh authorization.
//!
//! Two dependent lookups:
//! 1. `GET {api_base}/public/v1/channels` → primary channel slug and broadcaster user id
//! 2. `GET {chatroom_base}/api/v2/channels/{slug}` → chatroom id
//!
//! Either step failing aborts the bootstrap; callers get all three identity
//! fields or an error naming the failed step.

use super::AuthError;
use crate::config::KickConfig;
use crate::credentials::SessionIdentity;
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Deserialize, Debug)]
struct ChannelsResponse {
    #[serde(default)]
    data: Vec<Channel>,
}

#[derive(Deserialize, Debug)]
struct Channel {
    broadcaster_user_id: u64,
    slug: String,
}

#[derive(Deserialize, Debug)]
struct ChannelDetails {
    chatroom: Option<Chatroom>,
}

#[derive(Deserialize, Debug)]
struct Chatroom {
    id: u64,
}

pub struct KickBootstrapper {
    http: reqwest::Client,
    api_base_url: String,
    chatroom_base_url: String,
}

impl KickBootstrapper {
    pub fn new(http: reqwest::Client, config: &KickConfig) -> Self {
        Self {
            http,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            chatroom_base_url: config.chatroom_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Runs the lookup chain with `access_token`.
    pub async fn bootstrap(&self, access_token: &str) -> Result<SessionIdentity, AuthError> {
        let channel = self.primary_channel(access_token).await?;
        debug!(slug = %channel.slug, "Resolved primary channel");

        let chatroom_id = self.chatroom_id(access_token, &channel.slug).await?;

        info!(
            username = %channel.slug,
            user_id = channel.broadcaster_user_id,
            chatroom_id,
            "Kick session bootstrapped"
        );

        Ok(SessionIdentity {
            user_id: channel.broadcaster_user_id.to_string(),
            username: channel.slug,
            chatroom_id: chatroom_id.to_string(),
        })
    }

    async fn primary_channel(&self, access_token: &str) -> Result<Channel, AuthError> {
        let url = format!("{}/public/v1/channels", self.api_base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| AuthError::ChannelLookupFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::ChannelLookupFailed(format!(
                "channels endpoint returned {}",
                status
            )));
        }

        let channels: ChannelsResponse = response
            .json()
            .await
            .map_err(|e| AuthError::ChannelLookupFailed(format!("invalid channels response: {}", e)))?;

        channels
            .data
            .into_iter()
            .next()
            .ok_or_else(|| AuthError::ChannelLookupFailed("no channel for this account".to_string()))
    }

    async fn chatroom_id(&self, access_token: &str, slug: &str) -> Result<u64, AuthError> {
        let url = format!(
            "{}/api/v2/channels/{}",
            self.chatroom_base_url,
            urlencoding::encode(slug)
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| AuthError::ChatroomLookupFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::ChatroomLookupFailed(format!(
                "channel details endpoint returned {}",
                status
            )));
        }

        let details: ChannelDetails = response.json().await.map_err(|e| {
            AuthError::ChatroomLookupFailed(format!("invalid channel details response: {}", e))
        })?;

        details
            .chatroom
            .map(|c| c.id)
            .ok_or_else(|| AuthError::ChatroomLookupFailed("channel has no chatroom".to_string()))
    }
}
