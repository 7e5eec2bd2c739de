//! Google Drive v3 access for the single history file.
//!
//! Authenticates with a service-account key using the JWT bearer grant and
//! exposes the file through [`TableStore`].

use bytes::Bytes;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::client::api::handle_response_status;
use crate::config::ServiceAccountKey;
use crate::error::{Result, SyncError};
use crate::storage::{DownloadedTable, TableStore};

const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";
const DRIVE_API_BASE: &str = "https://www.googleapis.com";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const CSV_MIME: &str = "text/csv";

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: String,
}

pub struct DriveClient {
    client: Client,
    key: ServiceAccountKey,
    file_id: String,
    api_base: String,
    access_token: OnceCell<String>,
}

impl DriveClient {
    pub fn new(key: ServiceAccountKey, file_id: impl Into<String>, timeout: Duration) -> Result<Self> {
        Self::new_with_base_url(key, file_id, DRIVE_API_BASE, timeout)
    }

    /// Point the client at another host (for testing)
    pub fn new_with_base_url(
        key: ServiceAccountKey,
        file_id: impl Into<String>,
        api_base: &str,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            key,
            file_id: file_id.into(),
            api_base: api_base.trim_end_matches('/').to_string(),
            access_token: OnceCell::new(),
        })
    }

    /// Sign the service-account assertion.
    fn assertion(&self, now: i64) -> Result<String> {
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            scope: DRIVE_SCOPE,
            aud: &self.key.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        let signing_key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|e| SyncError::auth(format!("Service-account private key rejected: {}", e)))?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
            .map_err(|e| SyncError::auth(format!("Failed to sign service-account assertion: {}", e)))
    }

    /// Exchange the signed assertion for a Drive access token, once per client.
    async fn token(&self) -> Result<&str> {
        let token = self
            .access_token
            .get_or_try_init(|| async {
                let assertion = self.assertion(Utc::now().timestamp())?;
                let response = self
                    .client
                    .post(&self.key.token_uri)
                    .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
                    .send()
                    .await?;
                if !response.status().is_success() {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    return Err(SyncError::auth(format!(
                        "Drive token exchange failed ({}): {}",
                        status, body
                    )));
                }
                let parsed: AccessTokenResponse = response.json().await.map_err(|e| {
                    SyncError::invalid_response(format!("Failed to parse Drive token: {}", e))
                })?;
                debug!("Drive access token obtained for {}", self.key.client_email);
                Ok::<_, SyncError>(parsed.access_token)
            })
            .await?;
        Ok(token.as_str())
    }

    fn media_url(&self) -> String {
        format!(
            "{}/drive/v3/files/{}?alt=media&supportsAllDrives=true",
            self.api_base, self.file_id
        )
    }

    fn upload_url(&self) -> String {
        format!(
            "{}/upload/drive/v3/files/{}?uploadType=media&supportsAllDrives=true",
            self.api_base, self.file_id
        )
    }
}

impl TableStore for DriveClient {
    fn describe(&self) -> String {
        format!("drive file {}", self.file_id)
    }

    async fn download(&self) -> Result<DownloadedTable> {
        let token = self.token().await?;
        let response = self
            .client
            .get(self.media_url())
            .bearer_auth(token)
            .send()
            .await?;
        let response = handle_response_status(response).await?;
        let bytes = response.bytes().await?;
        debug!("Downloaded {} bytes from {}", bytes.len(), self.describe());
        Ok(DownloadedTable::from_bytes(bytes))
    }

    async fn replace(&self, csv: Bytes) -> Result<()> {
        let token = self.token().await?;
        let size = csv.len();
        let response = self
            .client
            .patch(self.upload_url())
            .bearer_auth(token)
            .header(CONTENT_TYPE, CSV_MIME)
            .body(csv)
            .send()
            .await?;
        handle_response_status(response).await?;
        debug!("Uploaded {} bytes to {}", size, self.describe());
        Ok(())
    }
}
