//! REST calls to the relay's HTTP side: relay credentials and coarse IP location.

use std::time::Duration;

use anyhow::{Context, Result};
use nearchat_core::TurnCredential;
use serde::Deserialize;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Coarse location derived from the caller's public IP.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoarseLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_km: f64,
    #[serde(default)]
    pub city_name: Option<String>,
    #[serde(default)]
    pub country_name: Option<String>,
}

#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    credential_url: String,
    geo_url: String,
}

impl RestClient {
    pub fn new(credential_url: String, geo_url: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("nearchat/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building http client")?;
        Ok(Self {
            http,
            credential_url,
            geo_url,
        })
    }

    pub async fn turn_credential(&self) -> Result<TurnCredential> {
        self.http
            .get(&self.credential_url)
            .send()
            .await
            .context("credential request")?
            .error_for_status()
            .context("credential endpoint")?
            .json::<TurnCredential>()
            .await
            .context("credential body")
    }

    pub async fn coarse_location(&self) -> Result<CoarseLocation> {
        self.http
            .get(&self.geo_url)
            .send()
            .await
            .context("geo request")?
            .error_for_status()
            .context("geo endpoint")?
            .json::<CoarseLocation>()
            .await
            .context("geo body")
    }
}
