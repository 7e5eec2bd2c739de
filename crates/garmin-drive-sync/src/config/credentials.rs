use crate::client::{OAuth1Token, OAuth2Token};
use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};

const OAUTH1_FILENAME: &str = "oauth1_token.json";
const OAUTH2_FILENAME: &str = "oauth2_token.json";

/// On-disk cache for the Garmin OAuth tokens, so scheduled runs reuse a
/// session instead of going through SSO every time.
pub struct TokenCache {
    dir: PathBuf,
}

impl TokenCache {
    /// Open (creating if needed) a token cache in `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load both tokens, returns None if either is missing or unreadable
    pub fn load(&self) -> Option<(OAuth1Token, OAuth2Token)> {
        let oauth1 = read_json::<OAuth1Token>(&self.dir.join(OAUTH1_FILENAME))?;
        let oauth2 = read_json::<OAuth2Token>(&self.dir.join(OAUTH2_FILENAME))?;
        Some((oauth1, oauth2))
    }

    /// Save both tokens
    pub fn save(&self, oauth1: &OAuth1Token, oauth2: &OAuth2Token) -> Result<()> {
        write_private(&self.dir.join(OAUTH1_FILENAME), &serde_json::to_string_pretty(oauth1)?)?;
        self.save_oauth2(oauth2)
    }

    /// Replace only the short-lived token after a refresh
    pub fn save_oauth2(&self, oauth2: &OAuth2Token) -> Result<()> {
        write_private(&self.dir.join(OAUTH2_FILENAME), &serde_json::to_string_pretty(oauth2)?)
    }

    /// Remove cached tokens, e.g. after the server rejected them
    pub fn clear(&self) -> Result<()> {
        for name in [OAUTH1_FILENAME, OAUTH2_FILENAME] {
            let path = self.dir.join(name);
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

// A corrupt cache file is treated like a missing one; the next login rewrites it.
fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let json = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&json) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Ignoring unreadable token cache {}: {}", path.display(), e);
            None
        }
    }
}

fn write_private(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}
