//! HMAC-SHA1 OAuth1 request signing (RFC 5849), used for the two Garmin
//! token-exchange calls.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::Rng;
use sha1::Sha1;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use url::Url;

use crate::error::{Result, SyncError};

/// Everything except the RFC 3986 unreserved set gets encoded.
const OAUTH_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Clone)]
pub struct OAuthConsumer {
    pub key: String,
    pub secret: String,
}

#[derive(Debug, Clone, Default)]
pub struct OAuthToken {
    pub token: String,
    pub secret: String,
}

pub struct OAuth1Signer {
    consumer: OAuthConsumer,
    token: Option<OAuthToken>,
}

impl OAuth1Signer {
    pub fn new(consumer: OAuthConsumer) -> Self {
        Self {
            consumer,
            token: None,
        }
    }

    pub fn with_token(mut self, token: OAuthToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Build the `Authorization` header value for a request. Query
    /// parameters in `url` and form parameters in `body_params` are both
    /// part of the signature base string.
    pub fn sign(&self, method: &str, url: &str, body_params: &[(String, String)]) -> Result<String> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
            .to_string();
        let nonce: String = {
            let bytes: [u8; 16] = rand::thread_rng().gen();
            bytes.iter().map(|b| format!("{:02x}", b)).collect()
        };
        self.sign_at(method, url, body_params, &timestamp, &nonce)
    }

    /// Deterministic variant of [`sign`](Self::sign)
    pub fn sign_at(
        &self,
        method: &str,
        url: &str,
        body_params: &[(String, String)],
        timestamp: &str,
        nonce: &str,
    ) -> Result<String> {
        let parsed = Url::parse(url)
            .map_err(|e| SyncError::invalid_response(format!("Cannot sign '{}': {}", url, e)))?;
        let mut base_url = format!("{}://{}", parsed.scheme(), parsed.host_str().unwrap_or(""));
        if let Some(port) = parsed.port() {
            base_url.push_str(&format!(":{}", port));
        }
        base_url.push_str(parsed.path());

        let mut header_params: BTreeMap<&str, String> = BTreeMap::new();
        header_params.insert("oauth_consumer_key", self.consumer.key.clone());
        header_params.insert("oauth_nonce", nonce.to_string());
        header_params.insert("oauth_signature_method", "HMAC-SHA1".to_string());
        header_params.insert("oauth_timestamp", timestamp.to_string());
        header_params.insert("oauth_version", "1.0".to_string());
        if let Some(token) = &self.token {
            header_params.insert("oauth_token", token.token.clone());
        }

        // Parameters are sorted on their encoded form, name first then value.
        let mut encoded: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| (encode(&k), encode(&v)))
            .chain(body_params.iter().map(|(k, v)| (encode(k), encode(v))))
            .chain(header_params.iter().map(|(k, v)| (encode(k), encode(v))))
            .collect();
        encoded.sort();
        let normalized = encoded
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let base_string = format!(
            "{}&{}&{}",
            method.to_uppercase(),
            encode(&base_url),
            encode(&normalized)
        );
        let signing_key = format!(
            "{}&{}",
            encode(&self.consumer.secret),
            encode(self.token.as_ref().map(|t| t.secret.as_str()).unwrap_or(""))
        );

        let mut mac = Hmac::<Sha1>::new_from_slice(signing_key.as_bytes())
            .map_err(|e| SyncError::auth(format!("Invalid OAuth signing key: {}", e)))?;
        mac.update(base_string.as_bytes());
        header_params.insert("oauth_signature", STANDARD.encode(mac.finalize().into_bytes()));

        let fields = header_params
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, encode(v)))
            .collect::<Vec<_>>()
            .join(", ");
        Ok(format!("OAuth {}", fields))
    }
}

fn encode(s: &str) -> String {
    utf8_percent_encode(s, OAUTH_ENCODE).to_string()
}

/// Parse a form-encoded token response such as
/// `oauth_token=abc&oauth_token_secret=def`
pub fn parse_oauth_response(body: &str) -> BTreeMap<String, String> {
    body.trim()
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| {
            (
                urlencoding::decode(k).map(|s| s.into_owned()).unwrap_or_else(|_| k.to_string()),
                urlencoding::decode(v).map(|s| s.into_owned()).unwrap_or_else(|_| v.to_string()),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn twitter_signer() -> OAuth1Signer {
        OAuth1Signer::new(OAuthConsumer {
            key: "xvz1evFS4wEEPTGEFPHBog".to_string(),
            secret: "kAcSOqF21Fu85e7zjz7ZN2U4ZRhfV3WpwPAoE3Z7kBw".to_string(),
        })
        .with_token(OAuthToken {
            token: "370773112-GmHxMAgYyLbNEtIKZeRNFsMKPR9EyMZeS9weJAEb".to_string(),
            secret: "LswwdoUaIvS8ltyTt5jkRh4J50vUPVVHtR2YPi5kE".to_string(),
        })
    }

    #[test]
    fn test_known_signature_vector() {
        let header = twitter_signer()
            .sign_at(
                "POST",
                "https://api.twitter.com/1/statuses/update.json?include_entities=true",
                &[(
                    "status".to_string(),
                    "Hello Ladies + Gentlemen, a signed OAuth request!".to_string(),
                )],
                "1318622958",
                "kYjzVBB8Y0ZFabxSWbWovY3uYSQ2pTgmZeNu2VS4cg",
            )
            .unwrap();

        assert!(header.starts_with("OAuth "));
        assert!(
            header.contains(r#"oauth_signature="tnnArxj06cWHq44gCs1OSKk%2FjLY%3D""#),
            "got {}",
            header
        );
        assert!(!header.contains("status="));
        assert!(!header.contains("include_entities"));
    }

    #[test]
    fn test_consumer_only_signature_omits_token() {
        let signer = OAuth1Signer::new(OAuthConsumer {
            key: "key".to_string(),
            secret: "secret".to_string(),
        });
        let header = signer
            .sign("GET", "https://connectapi.garmin.com/oauth-service/oauth/preauthorized?ticket=ST-1", &[])
            .unwrap();
        assert!(header.contains("oauth_consumer_key=\"key\""));
        assert!(!header.contains("oauth_token="));
    }

    #[test]
    fn test_sign_rejects_relative_url() {
        let signer = OAuth1Signer::new(OAuthConsumer {
            key: "key".to_string(),
            secret: "secret".to_string(),
        });
        assert!(signer.sign("GET", "/no/host", &[]).is_err());
    }

    #[test]
    fn test_encode_keeps_unreserved() {
        assert_eq!(encode("a-b.c_d~e"), "a-b.c_d~e");
        assert_eq!(encode("a b+c/d"), "a%20b%2Bc%2Fd");
    }

    #[test]
    fn test_parse_oauth_response() {
        let params =
            parse_oauth_response("oauth_token=abc&oauth_token_secret=d%2Fe&mfa_token=&junk");
        assert_eq!(params.get("oauth_token").unwrap(), "abc");
        assert_eq!(params.get("oauth_token_secret").unwrap(), "d/e");
        assert_eq!(params.get("mfa_token").unwrap(), "");
        assert!(!params.contains_key("junk"));
    }
}
