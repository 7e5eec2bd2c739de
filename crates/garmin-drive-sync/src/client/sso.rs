//! Garmin Connect SSO login for unattended runs.
//!
//! Flow: embed page (cookies) → signin page (CSRF) → credential form (ticket)
//! → preauthorized OAuth1 token → OAuth2 exchange. An MFA challenge cannot be
//! answered without a user, so it ends the login with [`SyncError::MfaRequired`].

use crate::client::oauth1::{parse_oauth_response, OAuth1Signer, OAuthConsumer, OAuthToken};
use crate::client::tokens::{OAuth1Token, OAuth2Token};
use crate::error::{Result, SyncError};
use chrono::Utc;
use regex::Regex;
use reqwest::cookie::Jar;
use reqwest::header::{REFERER, USER_AGENT};
use reqwest::Client;
use serde::Deserialize;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::debug;

/// User agent mimicking the Garmin mobile app
const MOBILE_USER_AGENT: &str = "com.garmin.android.apps.connectmobile";

/// User agent for SSO page requests
const SSO_USER_AGENT: &str = "GCM-iOS-5.7.2.1";

/// Published consumer key pair used by the Garmin mobile apps
const OAUTH_CONSUMER_URL: &str = "https://thegarth.s3.amazonaws.com/oauth_consumer.json";

static CSRF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"name="_csrf"\s+value="([^"]+)""#).expect("static regex"));
static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<title>([^<]+)</title>").expect("static regex"));
static TICKET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"embed\?ticket=([^"]+)""#).expect("static regex"));

#[derive(Debug, Deserialize)]
struct ConsumerResponse {
    consumer_key: String,
    consumer_secret: String,
}

/// Where the SSO flow sends its requests. Overridable for tests.
#[derive(Debug, Clone)]
pub struct SsoEndpoints {
    pub sso_base: String,
    pub connect_api: String,
    pub consumer_url: String,
}

impl SsoEndpoints {
    pub fn for_domain(domain: &str) -> Self {
        Self {
            sso_base: format!("https://sso.{}/sso", domain),
            connect_api: format!("https://connectapi.{}", domain),
            consumer_url: OAUTH_CONSUMER_URL.to_string(),
        }
    }
}

pub struct SsoClient {
    client: Client,
    oauth_client: Client,
    domain: String,
    endpoints: SsoEndpoints,
}

impl SsoClient {
    pub fn new(domain: &str, timeout: Duration) -> Result<Self> {
        Self::with_endpoints(domain, SsoEndpoints::for_domain(domain), timeout)
    }

    pub fn with_endpoints(domain: &str, endpoints: SsoEndpoints, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .cookie_provider(Arc::new(Jar::default()))
            .timeout(timeout)
            .build()?;
        // OAuth calls must not carry the SSO cookies
        let oauth_client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            oauth_client,
            domain: domain.to_string(),
            endpoints,
        })
    }

    /// Full username/password login.
    pub async fn login(&self, email: &str, password: &str) -> Result<(OAuth1Token, OAuth2Token)> {
        let sso_embed = format!("{}/embed", self.endpoints.sso_base);
        let signin_url = format!("{}/signin", self.endpoints.sso_base);
        let signin_params = [
            ("id", "gauth-widget"),
            ("embedWidget", "true"),
            ("gauthHost", sso_embed.as_str()),
            ("service", sso_embed.as_str()),
            ("source", sso_embed.as_str()),
            ("redirectAfterAccountLoginUrl", sso_embed.as_str()),
            ("redirectAfterAccountCreationUrl", sso_embed.as_str()),
        ];

        // Sets the session cookies
        self.client
            .get(&sso_embed)
            .query(&[
                ("id", "gauth-widget"),
                ("embedWidget", "true"),
                ("gauthHost", self.endpoints.sso_base.as_str()),
            ])
            .header(USER_AGENT, SSO_USER_AGENT)
            .send()
            .await?
            .text()
            .await?;

        let signin = self
            .client
            .get(&signin_url)
            .query(&signin_params)
            .header(USER_AGENT, SSO_USER_AGENT)
            .send()
            .await?;
        let referer = signin.url().to_string();
        let csrf = capture(&CSRF_RE, &signin.text().await?, "CSRF token")?;

        let html = self
            .client
            .post(&signin_url)
            .query(&signin_params)
            .header(USER_AGENT, SSO_USER_AGENT)
            .header(REFERER, referer)
            .form(&[
                ("username", email),
                ("password", password),
                ("embed", "true"),
                ("_csrf", csrf.as_str()),
            ])
            .send()
            .await?
            .text()
            .await?;

        let title = capture(&TITLE_RE, &html, "page title")?;
        if title.contains("MFA") {
            return Err(SyncError::MfaRequired);
        }
        if title != "Success" {
            return Err(SyncError::auth(format!("Unexpected login response: {}", title)));
        }
        let ticket = capture(&TICKET_RE, &html, "ticket")?;
        debug!("SSO ticket obtained");

        let consumer = self.fetch_consumer().await?;
        let oauth1 = self.preauthorize(&consumer, &ticket).await?;
        let oauth2 = self.exchange(&consumer, &oauth1).await?;
        Ok((oauth1, oauth2))
    }

    /// Mint a fresh OAuth2 token from a cached OAuth1 token.
    pub async fn refresh_oauth2(&self, oauth1: &OAuth1Token) -> Result<OAuth2Token> {
        let consumer = self.fetch_consumer().await?;
        self.exchange(&consumer, oauth1).await
    }

    async fn fetch_consumer(&self) -> Result<OAuthConsumer> {
        let response: ConsumerResponse = self
            .oauth_client
            .get(&self.endpoints.consumer_url)
            .send()
            .await?
            .json()
            .await
            .map_err(|e| SyncError::invalid_response(format!("Failed to parse OAuth consumer: {}", e)))?;
        Ok(OAuthConsumer {
            key: response.consumer_key,
            secret: response.consumer_secret,
        })
    }

    async fn preauthorize(&self, consumer: &OAuthConsumer, ticket: &str) -> Result<OAuth1Token> {
        let url = format!(
            "{}/oauth-service/oauth/preauthorized?ticket={}&login-url={}/embed&accepts-mfa-tokens=true",
            self.endpoints.connect_api, ticket, self.endpoints.sso_base
        );
        let auth = OAuth1Signer::new(consumer.clone()).sign("GET", &url, &[])?;

        let response = self
            .oauth_client
            .get(&url)
            .header(USER_AGENT, MOBILE_USER_AGENT)
            .header("Authorization", auth)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SyncError::auth(format!(
                "Failed to get OAuth1 token: {}",
                response.status()
            )));
        }

        let params = parse_oauth_response(&response.text().await?);
        let field = |name: &str| {
            params
                .get(name)
                .cloned()
                .ok_or_else(|| SyncError::invalid_response(format!("Missing {}", name)))
        };
        let mut token = OAuth1Token::new(field("oauth_token")?, field("oauth_token_secret")?)
            .with_domain(&self.domain);
        token.mfa_token = params.get("mfa_token").filter(|t| !t.is_empty()).cloned();
        Ok(token)
    }

    async fn exchange(&self, consumer: &OAuthConsumer, oauth1: &OAuth1Token) -> Result<OAuth2Token> {
        let url = format!(
            "{}/oauth-service/oauth/exchange/user/2.0",
            self.endpoints.connect_api
        );
        let form: Vec<(String, String)> = oauth1
            .mfa_token
            .iter()
            .map(|t| ("mfa_token".to_string(), t.clone()))
            .collect();
        let auth = OAuth1Signer::new(consumer.clone())
            .with_token(OAuthToken {
                token: oauth1.oauth_token.clone(),
                secret: oauth1.oauth_token_secret.clone(),
            })
            .sign("POST", &url, &form)?;

        let response = self
            .oauth_client
            .post(&url)
            .header(USER_AGENT, MOBILE_USER_AGENT)
            .header("Authorization", auth)
            .form(&form)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SyncError::auth(format!(
                "Failed to exchange OAuth1 for OAuth2: {}",
                response.status()
            )));
        }

        let mut token: OAuth2Token = response
            .json()
            .await
            .map_err(|e| SyncError::invalid_response(format!("Failed to parse OAuth2 token: {}", e)))?;
        token.stamp_expiry(Utc::now().timestamp());
        Ok(token)
    }
}

fn capture(re: &Regex, html: &str, what: &str) -> Result<String> {
    re.captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| SyncError::invalid_response(format!("Could not find {} in SSO response", what)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_capture_csrf() {
        let html = r#"<input type="hidden" name="_csrf" value="abc123token">"#;
        assert_eq!(capture(&CSRF_RE, html, "CSRF token").unwrap(), "abc123token");
        assert!(capture(&CSRF_RE, "<html></html>", "CSRF token").is_err());
    }

    #[test]
    fn test_capture_title_and_ticket() {
        let html = r#"<title>Success</title><a href="embed?ticket=ST-12345-abc">go</a>"#;
        assert_eq!(capture(&TITLE_RE, html, "page title").unwrap(), "Success");
        assert_eq!(capture(&TICKET_RE, html, "ticket").unwrap(), "ST-12345-abc");
    }

    #[test]
    fn test_endpoints_for_domain() {
        let endpoints = SsoEndpoints::for_domain("garmin.cn");
        assert_eq!(endpoints.sso_base, "https://sso.garmin.cn/sso");
        assert_eq!(endpoints.connect_api, "https://connectapi.garmin.cn");
    }

    async fn mount_login_pages(server: &MockServer, result_title: &str) {
        Mock::given(method("GET"))
            .and(path("/sso/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sso/signin"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<form><input type="hidden" name="_csrf" value="csrf-1"></form>"#,
            ))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sso/signin"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                r#"<html><head><title>{}</title></head><a href="embed?ticket=ST-42">x</a></html>"#,
                result_title
            )))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/consumer.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "consumer_key": "ck",
                "consumer_secret": "cs"
            })))
            .mount(server)
            .await;
    }

    fn test_client(server: &MockServer) -> SsoClient {
        SsoClient::with_endpoints(
            "garmin.com",
            SsoEndpoints {
                sso_base: format!("{}/sso", server.uri()),
                connect_api: server.uri(),
                consumer_url: format!("{}/consumer.json", server.uri()),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_login_full_flow() {
        let server = MockServer::start().await;
        mount_login_pages(&server, "Success").await;
        Mock::given(method("GET"))
            .and(path("/oauth-service/oauth/preauthorized"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("oauth_token=ot&oauth_token_secret=ots"),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth-service/oauth/exchange/user/2.0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "scope": "s",
                "jti": "j",
                "token_type": "Bearer",
                "access_token": "at",
                "refresh_token": "rt",
                "expires_in": 3600,
                "refresh_token_expires_in": 7200
            })))
            .mount(&server)
            .await;

        let (oauth1, oauth2) = test_client(&server).login("me@example.com", "pw").await.unwrap();
        assert_eq!(oauth1.oauth_token, "ot");
        assert_eq!(oauth1.oauth_token_secret, "ots");
        assert!(oauth1.mfa_token.is_none());
        assert_eq!(oauth2.access_token, "at");
        assert!(!oauth2.is_expired());
    }

    #[tokio::test]
    async fn test_login_mfa_challenge_fails() {
        let server = MockServer::start().await;
        mount_login_pages(&server, "GARMIN > MFA Challenge").await;

        let err = test_client(&server).login("me@example.com", "pw").await.unwrap_err();
        assert!(matches!(err, SyncError::MfaRequired));
    }

    #[tokio::test]
    async fn test_login_bad_credentials() {
        let server = MockServer::start().await;
        mount_login_pages(&server, "GARMIN Authentication Application").await;

        let err = test_client(&server).login("me@example.com", "wrong").await.unwrap_err();
        assert!(matches!(err, SyncError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_refresh_rejected() {
        let server = MockServer::start().await;
        mount_login_pages(&server, "Success").await;
        Mock::given(method("POST"))
            .and(path("/oauth-service/oauth/exchange/user/2.0"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let oauth1 = OAuth1Token::new("ot".to_string(), "ots".to_string());
        let err = test_client(&server).refresh_oauth2(&oauth1).await.unwrap_err();
        assert!(err.to_string().contains("OAuth2"));
    }
}
