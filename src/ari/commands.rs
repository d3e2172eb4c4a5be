//! # PBX Command Interface
//!
//! Call-control commands the bridge issues to the PBX. The `PbxCommands`
//! trait is the seam the session layer talks to; `AriCommands` implements it
//! over the ARI REST API with reqwest.
//!
//! Every command is bounded by the configured command timeout and reports
//! plain success or a `BridgeError`.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{AriConfig, MediaConfig};
use crate::error::BridgeError;

/// Handle to the PBX-side resources backing one external media leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalMedia {
    /// The external media channel the PBX created.
    pub channel_id: String,
    /// Mixing bridge joining the caller and the external media channel.
    pub bridge_id: String,
}

/// Call-control operations against the PBX.
#[async_trait]
pub trait PbxCommands: Send + Sync {
    async fn answer(&self, channel: &str) -> Result<(), BridgeError>;

    /// Bridge `channel`'s audio to a raw media socket at `external_host`
    /// (`host:port`).
    async fn attach_external_media(
        &self,
        channel: &str,
        external_host: &str,
    ) -> Result<ExternalMedia, BridgeError>;

    /// Tear down what `attach_external_media` created. Best effort.
    async fn release_external_media(&self, media: &ExternalMedia);

    /// Hang up `channel`. A channel that is already gone counts as success.
    async fn hangup(&self, channel: &str) -> Result<(), BridgeError>;
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

/// ARI REST implementation of `PbxCommands`.
pub struct AriCommands {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    app_name: String,
    format: String,
    transport: String,
    encapsulation: String,
}

impl AriCommands {
    pub fn new(ari: &AriConfig, media: &MediaConfig) -> Result<Self, BridgeError> {
        let client = reqwest::Client::builder()
            .timeout(ari.command_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: ari.base_url.trim_end_matches('/').to_string(),
            username: ari.username.clone(),
            password: ari.password.clone(),
            app_name: ari.app_name.clone(),
            format: media.pbx_format(),
            transport: ari.external_media_transport.clone(),
            encapsulation: ari.external_media_encapsulation.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/ari{}", self.base_url, path)
    }

    /// Issue one request; 2xx is success and the response is returned.
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<reqwest::Response, BridgeError> {
        debug!(%method, path, "ARI command");

        let response = self
            .client
            .request(method.clone(), self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &format!("{} {}: {}", method, path, body.trim())))
    }

    async fn create_id(&self, method: Method, path: &str, query: &[(&str, &str)]) -> Result<String, BridgeError> {
        let response = self.request(method, path, query).await?;
        let body: IdResponse = response
            .json()
            .await
            .map_err(|e| BridgeError::Decode(format!("ARI response for {}: {}", path, e)))?;
        Ok(body.id)
    }

    async fn destroy_bridge(&self, bridge_id: &str) {
        if let Err(e) = self
            .request(Method::DELETE, &format!("/bridges/{}", bridge_id), &[])
            .await
        {
            if !is_not_found(&e) {
                warn!(bridge_id, error = %e, "Failed to destroy mixing bridge");
            }
        }
    }
}

fn status_error(status: StatusCode, detail: &str) -> BridgeError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BridgeError::Auth(detail.to_string()),
        _ => BridgeError::Command(format!("HTTP {} from {}", status.as_u16(), detail)),
    }
}

fn is_not_found(error: &BridgeError) -> bool {
    matches!(error, BridgeError::Command(detail) if detail.starts_with("HTTP 404"))
}

#[async_trait]
impl PbxCommands for AriCommands {
    async fn answer(&self, channel: &str) -> Result<(), BridgeError> {
        self.request(Method::POST, &format!("/channels/{}/answer", channel), &[])
            .await
            .map(|_| ())
    }

    async fn attach_external_media(
        &self,
        channel: &str,
        external_host: &str,
    ) -> Result<ExternalMedia, BridgeError> {
        let bridge_id = self
            .create_id(Method::POST, "/bridges", &[("type", "mixing")])
            .await?;

        let media_channel = match self
            .create_id(
                Method::POST,
                "/channels/externalMedia",
                &[
                    ("app", self.app_name.as_str()),
                    ("external_host", external_host),
                    ("format", self.format.as_str()),
                    ("transport", self.transport.as_str()),
                    ("encapsulation", self.encapsulation.as_str()),
                ],
            )
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.destroy_bridge(&bridge_id).await;
                return Err(e);
            }
        };

        let media = ExternalMedia {
            channel_id: media_channel,
            bridge_id,
        };

        let members = format!("{},{}", channel, media.channel_id);
        if let Err(e) = self
            .request(
                Method::POST,
                &format!("/bridges/{}/addChannel", media.bridge_id),
                &[("channel", members.as_str())],
            )
            .await
        {
            self.release_external_media(&media).await;
            return Err(e);
        }

        debug!(channel, media_channel = %media.channel_id, bridge = %media.bridge_id, "External media attached");
        Ok(media)
    }

    async fn release_external_media(&self, media: &ExternalMedia) {
        if let Err(e) = self.hangup(&media.channel_id).await {
            warn!(media_channel = %media.channel_id, error = %e, "Failed to hang up external media channel");
        }
        self.destroy_bridge(&media.bridge_id).await;
    }

    async fn hangup(&self, channel: &str) -> Result<(), BridgeError> {
        match self
            .request(Method::DELETE, &format!("/channels/{}", channel), &[])
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!(channel, "Channel already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
