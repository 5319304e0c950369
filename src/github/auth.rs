//! GitHub App authentication: a short-lived RS256 app JWT exchanged for a
//! repository installation token.

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::HostingError;
use crate::ingest::RepoRef;
use crate::util::SecretString;

/// GitHub rejects app JWTs that live longer than ten minutes.
pub const APP_JWT_LIFETIME_SECS: u64 = 600;

#[derive(Debug, Serialize, Deserialize)]
pub struct AppClaims {
    pub iat: u64,
    pub exp: u64,
    pub iss: String,
}

/// Sign an app JWT issued at `now` (seconds since the epoch).
pub fn app_jwt(app_id: &str, private_key_pem: &[u8], now: u64) -> Result<SecretString, HostingError> {
    let key = EncodingKey::from_rsa_pem(private_key_pem)
        .map_err(|e| HostingError::Auth(format!("invalid GitHub App private key: {}", e)))?;
    let claims = AppClaims {
        iat: now,
        exp: now + APP_JWT_LIFETIME_SECS,
        iss: app_id.to_string(),
    };
    encode(&Header::new(Algorithm::RS256), &claims, &key)
        .map(SecretString::from)
        .map_err(|e| HostingError::Auth(format!("failed to sign app JWT: {}", e)))
}

#[derive(Deserialize)]
struct Installation {
    id: u64,
}

#[derive(Deserialize)]
struct AccessToken {
    token: String,
}

/// Exchange an app JWT for an installation token scoped to `repo`.
pub async fn installation_token(
    http: &Client,
    api_url: &str,
    jwt: &SecretString,
    repo: &RepoRef,
) -> Result<SecretString, HostingError> {
    let api = api_url.trim_end_matches('/');

    let response = http
        .get(format!("{}/repos/{}/{}/installation", api, repo.owner, repo.name))
        .bearer_auth(jwt.expose())
        .header("Accept", "application/vnd.github+json")
        .send()
        .await?;
    let installation: Installation = read_json(response).await?;
    debug!("GitHub App installation {} for {}", installation.id, repo.full_name());

    let response = http
        .post(format!("{}/app/installations/{}/access_tokens", api, installation.id))
        .bearer_auth(jwt.expose())
        .header("Accept", "application/vnd.github+json")
        .send()
        .await?;
    let token: AccessToken = read_json(response).await?;
    Ok(SecretString::from(token.token))
}

async fn read_json<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T, HostingError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(HostingError::Auth(format!("status {}: {}", status.as_u16(), body)));
    }
    serde_json::from_str(&body).map_err(|e| HostingError::Decode(format!("{}: {}", e, body)))
}
