use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::ACCEPT;

use super::{AcquisitionError, ByteStream, Cooldown, normalize_base_url, rejection};
use crate::config::PublisherConfig;

/// Authenticated, rate-limited download client for publisher PDFs.
///
/// Every call to [`fetch`](Self::fetch) first takes the shared [`Cooldown`] permit; the permit
/// travels with the returned stream, so a second download cannot start until the first body
/// has been dropped and the cooldown has elapsed.
pub struct PublisherClient {
    client: Client,
    base_url: String,
    token: String,
    token_header: String,
    cooldown: Cooldown,
}

impl PublisherClient {
    /// Build a client from publisher settings with its own cooldown gate.
    pub fn new(config: &PublisherConfig) -> Result<Self, AcquisitionError> {
        Self::with_cooldown(config, Cooldown::new(config.cooldown))
    }

    /// Build a client that shares an existing cooldown gate.
    pub fn with_cooldown(
        config: &PublisherConfig,
        cooldown: Cooldown,
    ) -> Result<Self, AcquisitionError> {
        let token = config
            .token
            .clone()
            .filter(|token| !token.trim().is_empty())
            .ok_or(AcquisitionError::MissingToken)?;
        let client = Client::builder()
            .user_agent("paperhoard/0.1")
            .timeout(config.timeout)
            .build()
            .map_err(AcquisitionError::Http)?;
        let base_url = normalize_base_url(&config.base_url)?;
        tracing::debug!(
            url = %base_url,
            cooldown_secs = cooldown.interval().as_secs_f64(),
            "Initialized publisher client"
        );

        Ok(Self {
            client,
            base_url,
            token,
            token_header: config.token_header.clone(),
            cooldown,
        })
    }

    /// Download URL for an article identifier.
    pub fn article_url(&self, id: &str) -> String {
        format!("{}/articles/{}", self.base_url, id.trim_start_matches('/'))
    }

    /// Block until the cooldown after the most recent download has elapsed.
    pub async fn settle(&self) {
        self.cooldown.settle().await;
    }

    /// Start a download and hand back the body as a stream.
    pub async fn fetch(&self, id: &str) -> Result<ByteStream, AcquisitionError> {
        let permit = self.cooldown.acquire().await;
        let url = self.article_url(id);
        tracing::info!(doi = id, %url, "Fetching article");

        let response = self
            .client
            .get(&url)
            .header(self.token_header.as_str(), self.token.as_str())
            .header(ACCEPT, "application/pdf")
            .send()
            .await
            .map_err(AcquisitionError::from_reqwest)?;

        if !response.status().is_success() {
            let error = rejection(response).await;
            tracing::warn!(doi = id, error = %error, "Publisher rejected download");
            return Err(error);
        }

        let stream = response.bytes_stream().map(move |chunk| {
            let _permit = &permit;
            chunk.map_err(AcquisitionError::from_reqwest)
        });
        Ok(Box::pin(stream))
    }
}
