//! ICE server configuration fetch
//!
//! Polls `{api}/rtcconfig?appName=..` until it answers with a relay
//! configuration. Failed attempts back off exponentially, capped at 2^5 s.

use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::backoff::exp_backoff_capped;
use crate::types::IceConfig;

/// Backoff exponent cap between fetch attempts
pub const ICE_MAX_BACKOFF: u32 = 5;

#[derive(Error, Debug)]
pub enum IceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status {0}")]
    Status(u16),
}

/// Client for the rtcconfig endpoint
#[derive(Clone)]
pub struct IceConfigClient {
    api: String,
    app_name: String,
    http: reqwest::Client,
}

impl IceConfigClient {
    pub fn new(api: impl Into<String>, app_name: impl Into<String>) -> Result<Self, IceError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            api: api.into().trim_end_matches('/').to_string(),
            app_name: app_name.into(),
            http,
        })
    }

    pub fn url(&self) -> String {
        format!("{}/rtcconfig?appName={}", self.api, self.app_name)
    }

    /// Single request
    pub async fn fetch_once(&self) -> Result<IceConfig, IceError> {
        let response = self.http.get(self.url()).send().await?;
        if !response.status().is_success() {
            return Err(IceError::Status(response.status().as_u16()));
        }
        let config = response.json::<IceConfig>().await?;
        debug!(
            "Fetched {} ICE servers, expires {}",
            config.ice_servers.len(),
            config.expires_on
        );
        Ok(config)
    }

    /// Retry until the endpoint answers
    pub async fn fetch(&self) -> IceConfig {
        let mut attempt = 0;
        loop {
            match self.fetch_once().await {
                Ok(config) => return config,
                Err(e) => {
                    let delay = exp_backoff_capped(attempt, ICE_MAX_BACKOFF);
                    warn!("ICE config fetch failed ({}), retrying in {:?}", e, delay);
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
