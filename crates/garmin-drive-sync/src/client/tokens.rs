use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Long-lived (~1 year) token from the SSO ticket exchange. Only used to mint
/// OAuth2 tokens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuth1Token {
    pub oauth_token: String,
    pub oauth_token_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mfa_token: Option<String>,
    /// SSO domain that issued the token; cached tokens are only reused
    /// when logging in to the same domain
    #[serde(default = "default_domain")]
    pub domain: String,
}

fn default_domain() -> String {
    "garmin.com".to_string()
}

impl OAuth1Token {
    pub fn new(oauth_token: String, oauth_token_secret: String) -> Self {
        Self {
            oauth_token,
            oauth_token_secret,
            mfa_token: None,
            domain: default_domain(),
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }
}

/// Short-lived bearer token sent with every Connect API call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuth2Token {
    pub scope: String,
    pub jti: String,
    pub token_type: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub expires_at: i64,
    pub refresh_token_expires_in: i64,
    #[serde(default)]
    pub refresh_token_expires_at: i64,
}

/// Treat tokens this close to expiry as expired so a run never starts with
/// a token that dies halfway through.
const EXPIRY_MARGIN_SECS: i64 = 120;

impl OAuth2Token {
    /// Fill the absolute expiry timestamps from the relative lifetimes.
    pub fn stamp_expiry(&mut self, now: i64) {
        self.expires_at = now + self.expires_in;
        self.refresh_token_expires_at = now + self.refresh_token_expires_in;
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at - EXPIRY_MARGIN_SECS < Utc::now().timestamp()
    }

    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}
