//! IP geolocation through the db-ip.com lookup API.

use crate::config::GeoConfig;
use async_trait::async_trait;
use serde::Deserialize;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("lookup request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("lookup service returned {0}")]
    Status(reqwest::StatusCode),
    #[error("lookup service error: {0}")]
    Service(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoLocation {
    pub city: String,
    pub region: String,
    pub country: String,
}

#[async_trait]
pub trait GeoLocator: Send + Sync {
    async fn locate(&self, ip: IpAddr) -> Result<GeoLocation, GeoError>;
}

/// Wire format of `GET /v2/{key}/{ip}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DbIpResponse {
    error: Option<String>,
    city: Option<String>,
    state_prov: Option<String>,
    country_code: Option<String>,
}

impl DbIpResponse {
    fn into_location(self) -> Result<GeoLocation, GeoError> {
        if let Some(error) = self.error {
            return Err(GeoError::Service(error));
        }
        Ok(GeoLocation {
            city: self.city.unwrap_or_default(),
            region: self.state_prov.unwrap_or_default(),
            country: self.country_code.unwrap_or_default(),
        })
    }
}

pub struct DbIpClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl DbIpClient {
    pub fn new(config: &GeoConfig) -> Result<DbIpClient, GeoError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(DbIpClient {
            http,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl GeoLocator for DbIpClient {
    async fn locate(&self, ip: IpAddr) -> Result<GeoLocation, GeoError> {
        let url = format!("{}/{}/{}", self.base_url, self.api_key, ip);
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(GeoError::Status(response.status()));
        }
        response.json::<DbIpResponse>().await?.into_location()
    }
}
