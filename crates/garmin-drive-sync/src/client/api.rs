//! Authenticated Garmin Connect API client
//!
//! Thin wrapper over reqwest that attaches the OAuth2 bearer token and maps
//! HTTP status codes onto [`SyncError`] variants.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::client::tokens::OAuth2Token;
use crate::error::{Result, SyncError};

/// User agent for Connect API requests
const API_USER_AGENT: &str = "GCM-iOS-5.7.2.1";

pub struct GarminClient {
    client: Client,
    base_url: String,
}

impl GarminClient {
    /// Create a new API client for the given domain
    pub fn new(domain: &str, timeout: Duration) -> Result<Self> {
        Self::new_with_base_url(&format!("https://connectapi.{}", domain), timeout)
    }

    /// Create a new API client with a custom base URL (for testing)
    pub fn new_with_base_url(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn build_headers(&self, token: &OAuth2Token) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(API_USER_AGENT));
        let auth = HeaderValue::from_str(&token.authorization_header())
            .map_err(|_| SyncError::auth("Access token is not a valid header value"))?;
        headers.insert(AUTHORIZATION, auth);
        Ok(headers)
    }

    /// Make an authenticated GET request and return the response
    pub async fn get(&self, token: &OAuth2Token, path: &str) -> Result<Response> {
        let response = self
            .client
            .get(self.build_url(path))
            .headers(self.build_headers(token)?)
            .send()
            .await?;

        handle_response_status(response).await
    }

    /// Make an authenticated GET request and deserialize JSON response
    pub async fn get_json<T: DeserializeOwned>(&self, token: &OAuth2Token, path: &str) -> Result<T> {
        self.get_json_opt(token, path).await?.ok_or_else(|| {
            SyncError::invalid_response(format!("Empty response body from {}", path))
        })
    }

    /// Like [`get_json`](Self::get_json) but a 204 or blank body yields `None`
    pub async fn get_json_opt<T: DeserializeOwned>(
        &self,
        token: &OAuth2Token,
        path: &str,
    ) -> Result<Option<T>> {
        let response = self.get(token, path).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body = response.bytes().await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(&body).map(Some).map_err(|e| {
            SyncError::invalid_response(format!("Failed to parse JSON response: {}", e))
        })
    }
}

/// Convert non-success status codes to errors
pub(crate) async fn handle_response_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::UNAUTHORIZED => Err(SyncError::NotAuthenticated),
        StatusCode::TOO_MANY_REQUESTS => Err(SyncError::RateLimited),
        StatusCode::NOT_FOUND => Err(SyncError::NotFound(response.url().path().to_string())),
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(SyncError::Api {
                status: status.as_u16(),
                message: body,
            })
        }
    }
}
