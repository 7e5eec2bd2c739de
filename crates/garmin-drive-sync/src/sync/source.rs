//! Garmin Connect as a [`DataSource`].

use chrono::NaiveDate;
use serde_json::Value;
use tracing::{info, warn};

use crate::client::{GarminClient, OAuth2Token, SsoClient};
use crate::config::{GarminCredentials, SyncConfig, TokenCache};
use crate::error::{Result, SyncError};
use crate::sync::fetcher::DataSource;

const SOCIAL_PROFILE_PATH: &str = "/userprofile-service/socialProfile";

/// Authenticated Connect session for one run
pub struct GarminSource {
    client: GarminClient,
    token: OAuth2Token,
    display_name: Option<String>,
}

impl GarminSource {
    pub fn new(client: GarminClient, token: OAuth2Token) -> Self {
        Self {
            client,
            token,
            display_name: None,
        }
    }

    /// Log in (reusing cached tokens when possible) and resolve the profile.
    pub async fn connect(config: &SyncConfig) -> Result<Self> {
        let domain = &config.garmin.domain;
        let sso = SsoClient::new(domain, config.http_timeout)?;
        let cache = TokenCache::open(&config.token_dir)?;
        let token = authenticate(&sso, &cache, &config.garmin).await?;

        let mut source = Self::new(GarminClient::new(domain, config.http_timeout)?, token);
        source.resolve_display_name().await;
        Ok(source)
    }

    /// Look up the display name the stats and sleep endpoints are keyed by.
    /// Failure is logged and leaves those two buckets unavailable.
    pub async fn resolve_display_name(&mut self) {
        match self.fetch_display_name().await {
            Ok(name) => self.display_name = Some(name),
            Err(e) => warn!("Could not resolve Garmin display name, stats and sleep will be empty: {}", e),
        }
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    async fn fetch_display_name(&self) -> Result<String> {
        let profile: Value = self.client.get_json(&self.token, SOCIAL_PROFILE_PATH).await?;
        profile
            .get("displayName")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SyncError::invalid_response("Could not get display name"))
    }

    fn require_display_name(&self) -> Result<String> {
        self.display_name
            .as_deref()
            .map(|name| urlencoding::encode(name).into_owned())
            .ok_or_else(|| SyncError::Other("Garmin display name is unknown".to_string()))
    }

    async fn bucket(&self, path: &str) -> Result<Value> {
        Ok(self
            .client
            .get_json_opt(&self.token, path)
            .await?
            .unwrap_or(Value::Null))
    }
}

impl DataSource for GarminSource {
    async fn daily_stats(&self, date: NaiveDate) -> Result<Value> {
        let path = format!(
            "/usersummary-service/usersummary/daily/{}?calendarDate={}",
            self.require_display_name()?,
            date
        );
        self.bucket(&path).await
    }

    async fn sleep(&self, date: NaiveDate) -> Result<Value> {
        let path = format!(
            "/wellness-service/wellness/dailySleepData/{}?date={}&nonSleepBufferMinutes=60",
            self.require_display_name()?,
            date
        );
        self.bucket(&path).await
    }

    async fn hrv(&self, date: NaiveDate) -> Result<Value> {
        self.bucket(&format!("/hrv-service/hrv/{}", date)).await
    }

    async fn recent_activities(&self, limit: u32) -> Result<Vec<Value>> {
        let path = format!(
            "/activitylist-service/activities/search/activities?start=0&limit={}",
            limit
        );
        Ok(self
            .client
            .get_json_opt(&self.token, &path)
            .await?
            .unwrap_or_default())
    }
}

/// Get a usable OAuth2 token: cached, refreshed, or from a fresh login.
pub async fn authenticate(
    sso: &SsoClient,
    cache: &TokenCache,
    credentials: &GarminCredentials,
) -> Result<OAuth2Token> {
    match cache.load() {
        Some((oauth1, _)) if oauth1.domain != credentials.domain => {
            info!(
                "Cached Garmin tokens belong to {}, logging in to {} instead",
                oauth1.domain, credentials.domain
            );
        }
        Some((_, oauth2)) if !oauth2.is_expired() => return Ok(oauth2),
        Some((oauth1, _)) => {
            info!("Refreshing Garmin access token...");
            match sso.refresh_oauth2(&oauth1).await {
                Ok(fresh) => {
                    if let Err(e) = cache.save_oauth2(&fresh) {
                        warn!("Could not update token cache in {}: {}", cache.dir().display(), e);
                    }
                    return Ok(fresh);
                }
                Err(e) => {
                    warn!("Token refresh failed, logging in again: {}", e);
                    if let Err(e) = cache.clear() {
                        warn!("Could not clear token cache in {}: {}", cache.dir().display(), e);
                    }
                }
            }
        }
        None => {}
    }

    info!("Logging in to Garmin Connect as {}", credentials.email);
    let (oauth1, oauth2) = sso.login(&credentials.email, &credentials.password).await?;
    if let Err(e) = cache.save(&oauth1, &oauth2) {
        warn!("Could not write token cache in {}: {}", cache.dir().display(), e);
    }
    Ok(oauth2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{OAuth1Token, SsoEndpoints};
    use chrono::Utc;
    use serde_json::json;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    fn token(access: &str, expires_at: i64) -> OAuth2Token {
        OAuth2Token {
            scope: "s".to_string(),
            jti: "j".to_string(),
            token_type: "Bearer".to_string(),
            access_token: access.to_string(),
            refresh_token: "rt".to_string(),
            expires_in: 3600,
            expires_at,
            refresh_token_expires_in: 7200,
            refresh_token_expires_at: expires_at + 3600,
        }
    }

    fn credentials() -> GarminCredentials {
        GarminCredentials {
            email: "runner@example.com".to_string(),
            password: "pw".to_string(),
            domain: "garmin.com".to_string(),
        }
    }

    fn sso(server: &MockServer) -> SsoClient {
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

    async fn mount_consumer(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/consumer.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "consumer_key": "ck",
                "consumer_secret": "cs"
            })))
            .mount(server)
            .await;
    }

    fn exchange_body(access: &str) -> Value {
        json!({
            "scope": "s",
            "jti": "j",
            "token_type": "Bearer",
            "access_token": access,
            "refresh_token": "rt",
            "expires_in": 3600,
            "refresh_token_expires_in": 7200
        })
    }

    async fn source(server: &MockServer) -> GarminSource {
        let client = GarminClient::new_with_base_url(&server.uri(), Duration::from_secs(5)).unwrap();
        let mut source = GarminSource::new(client, token("at", Utc::now().timestamp() + 3600));
        source.resolve_display_name().await;
        source
    }

    #[tokio::test]
    async fn test_cached_token_skips_network() {
        let server = MockServer::start().await;
        let temp = TempDir::new().unwrap();
        let cache = TokenCache::open(temp.path()).unwrap();
        let cached = token("cached", Utc::now().timestamp() + 3600);
        cache
            .save(&OAuth1Token::new("ot".to_string(), "ots".to_string()), &cached)
            .unwrap();

        let got = authenticate(&sso(&server), &cache, &credentials()).await.unwrap();
        assert_eq!(got.access_token, "cached");
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_and_cached() {
        let server = MockServer::start().await;
        mount_consumer(&server).await;
        Mock::given(method("POST"))
            .and(path("/oauth-service/oauth/exchange/user/2.0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(exchange_body("refreshed")))
            .expect(1)
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let cache = TokenCache::open(temp.path()).unwrap();
        cache
            .save(
                &OAuth1Token::new("ot".to_string(), "ots".to_string()),
                &token("stale", Utc::now().timestamp() - 10),
            )
            .unwrap();

        let got = authenticate(&sso(&server), &cache, &credentials()).await.unwrap();
        assert_eq!(got.access_token, "refreshed");
        assert_eq!(cache.load().unwrap().1.access_token, "refreshed");
    }

    /// SSO pages for an account that stops at an MFA challenge
    async fn mount_mfa_login(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/sso/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sso/signin"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<input type="hidden" name="_csrf" value="c">"#,
            ))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sso/signin"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("<title>GARMIN > MFA Challenge</title>"),
            )
            .mount(server)
            .await;
    }

    fn signin_posts(requests: &[Request]) -> usize {
        requests
            .iter()
            .filter(|r| r.method.as_str() == "POST" && r.url.path() == "/sso/signin")
            .count()
    }

    /// Replaces the cached OAuth1 file with a directory while answering, so
    /// the cache can no longer be cleared.
    struct LockCacheAndReject(PathBuf);

    impl Respond for LockCacheAndReject {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            if self.0.is_file() {
                std::fs::remove_file(&self.0).unwrap();
                std::fs::create_dir(&self.0).unwrap();
                std::fs::write(self.0.join("pinned"), "x").unwrap();
            }
            ResponseTemplate::new(401)
        }
    }

    #[tokio::test]
    async fn test_no_cache_and_mfa_account_fails() {
        let server = MockServer::start().await;
        mount_mfa_login(&server).await;

        let temp = TempDir::new().unwrap();
        let cache = TokenCache::open(temp.path()).unwrap();
        let err = authenticate(&sso(&server), &cache, &credentials()).await.unwrap_err();
        assert!(matches!(err, SyncError::MfaRequired));
        assert!(cache.load().is_none());
    }

    #[tokio::test]
    async fn test_rejected_refresh_clears_cache_and_logs_in() {
        let server = MockServer::start().await;
        mount_consumer(&server).await;
        mount_mfa_login(&server).await;
        Mock::given(method("POST"))
            .and(path("/oauth-service/oauth/exchange/user/2.0"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let cache = TokenCache::open(temp.path()).unwrap();
        cache
            .save(
                &OAuth1Token::new("ot".to_string(), "ots".to_string()),
                &token("stale", Utc::now().timestamp() - 10),
            )
            .unwrap();

        let err = authenticate(&sso(&server), &cache, &credentials()).await.unwrap_err();
        assert!(matches!(err, SyncError::MfaRequired));
        assert!(cache.load().is_none());
        assert_eq!(signin_posts(&server.received_requests().await.unwrap()), 1);
    }

    #[tokio::test]
    async fn test_uncleared_cache_still_falls_back_to_login() {
        let server = MockServer::start().await;
        mount_consumer(&server).await;
        mount_mfa_login(&server).await;

        let temp = TempDir::new().unwrap();
        let cache = TokenCache::open(temp.path()).unwrap();
        cache
            .save(
                &OAuth1Token::new("ot".to_string(), "ots".to_string()),
                &token("stale", Utc::now().timestamp() - 10),
            )
            .unwrap();
        Mock::given(method("POST"))
            .and(path("/oauth-service/oauth/exchange/user/2.0"))
            .respond_with(LockCacheAndReject(temp.path().join("oauth1_token.json")))
            .expect(1)
            .mount(&server)
            .await;

        let err = authenticate(&sso(&server), &cache, &credentials()).await.unwrap_err();
        assert!(matches!(err, SyncError::MfaRequired));
        assert!(cache.clear().is_err());
        assert_eq!(signin_posts(&server.received_requests().await.unwrap()), 1);
    }

    #[tokio::test]
    async fn test_tokens_from_another_domain_are_not_reused() {
        let server = MockServer::start().await;
        mount_mfa_login(&server).await;

        let temp = TempDir::new().unwrap();
        let cache = TokenCache::open(temp.path()).unwrap();
        cache
            .save(
                &OAuth1Token::new("ot".to_string(), "ots".to_string()).with_domain("garmin.cn"),
                &token("cn-session", Utc::now().timestamp() + 3600),
            )
            .unwrap();

        let err = authenticate(&sso(&server), &cache, &credentials()).await.unwrap_err();
        assert!(matches!(err, SyncError::MfaRequired));
        let requests = server.received_requests().await.unwrap();
        assert_eq!(signin_posts(&requests), 1);
        assert!(requests
            .iter()
            .all(|r| r.url.path() != "/oauth-service/oauth/exchange/user/2.0"));
    }

    #[tokio::test]
    async fn test_cached_token_for_same_domain_is_used() {
        let server = MockServer::start().await;
        let temp = TempDir::new().unwrap();
        let cache = TokenCache::open(temp.path()).unwrap();
        cache
            .save(
                &OAuth1Token::new("ot".to_string(), "ots".to_string()).with_domain("garmin.com"),
                &token("com-session", Utc::now().timestamp() + 3600),
            )
            .unwrap();

        let got = authenticate(&sso(&server), &cache, &credentials()).await.unwrap();
        assert_eq!(got.access_token, "com-session");
    }

    #[tokio::test]
    async fn test_bucket_endpoints() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/userprofile-service/socialProfile"))
            .and(header("Authorization", "Bearer at"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"displayName": "runner-1"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/usersummary-service/usersummary/daily/runner-1"))
            .and(query_param("calendarDate", "2024-01-01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"totalSteps": 10})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/wellness-service/wellness/dailySleepData/runner-1"))
            .and(query_param("date", "2024-01-01"))
            .and(query_param("nonSleepBufferMinutes", "60"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/activitylist-service/activities/search/activities"))
            .and(query_param("limit", "5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"activityId": 1}])))
            .mount(&server)
            .await;

        let source = source(&server).await;
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(source.display_name(), Some("runner-1"));
        assert_eq!(source.daily_stats(date).await.unwrap(), json!({"totalSteps": 10}));
        assert_eq!(source.sleep(date).await.unwrap(), Value::Null);
        assert_eq!(source.recent_activities(5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_display_name_only_breaks_named_buckets() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/userprofile-service/socialProfile"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/hrv-service/hrv/2024-01-01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"hrvSummary": {"lastNightAvg": 41}})))
            .mount(&server)
            .await;

        let source = source(&server).await;
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert!(source.display_name().is_none());
        assert!(source.daily_stats(date).await.is_err());
        assert!(source.sleep(date).await.is_err());
        assert_eq!(
            source.hrv(date).await.unwrap(),
            json!({"hrvSummary": {"lastNightAvg": 41}})
        );
    }
}
