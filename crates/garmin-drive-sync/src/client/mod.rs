pub mod api;
pub mod drive;
pub mod oauth1;
pub mod sso;
pub mod tokens;

pub use api::GarminClient;
pub use drive::DriveClient;
pub use oauth1::{OAuth1Signer, OAuthConsumer, OAuthToken};
pub use sso::{SsoClient, SsoEndpoints};
pub use tokens::{OAuth1Token, OAuth2Token};
