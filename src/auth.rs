//! Token acquisition, refresh, and the on-disk credential store.
//!
//! First use is interactive: the user opens the printed authorization URL,
//! logs in, and pastes the resulting redirect URL back. Every later run loads
//! the stored refresh credential and never prompts.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use base64::Engine;
use chrono::{DateTime, TimeDelta, Utc};
use dialoguer::Input;
use rand::Rng;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::{error::DownloadError, prelude::*};

const AUTH_BASE_URL: &str = "https://auth.tesla.com";
const CLIENT_ID: &str = "ownerapi";
const REDIRECT_URI: &str = "https://auth.tesla.com/void/callback";
const SCOPE: &str = "openid email offline_access";

/// Versioned credential record, rewritten after every refresh.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,

    #[serde(default)]
    pub refresh_token: String,

    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    fn from_response(response: TokenResponse, previous_refresh_token: Option<String>) -> Self {
        Self {
            access_token: response.access_token,
            refresh_token: response
                .refresh_token
                .or(previous_refresh_token)
                .unwrap_or_default(),
            expires_at: response.expires_in.map(|seconds| Utc::now() + TimeDelta::seconds(seconds)),
        }
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read `{}`", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse `{}`", path.display()))
    }

    pub fn write_to(&self, path: &Path) -> Result<(), DownloadError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Due for a refresh within the next minute. An unknown expiry is left to
    /// the reactive 401 path instead.
    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at - now < TimeDelta::seconds(60))
    }
}

/// Exchanges and refreshes tokens against the vendor's OAuth2 endpoints.
pub struct Authenticator {
    client: Client,
    auth_base: Url,
    store_path: PathBuf,
    credentials: Mutex<Credentials>,
}

impl Authenticator {
    /// Loads the stored credentials for `email`, falling back to the
    /// interactive first-use login.
    pub async fn log_in_or_load(email: &str) -> Result<Self> {
        let store_path = default_store_path(email)?;
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        let auth_base = Url::parse(AUTH_BASE_URL)?;
        let credentials = if store_path.is_file() {
            Credentials::read_from(&store_path)?
        } else {
            let credentials = log_in(&client, &auth_base).await?;
            credentials.write_to(&store_path)?;
            info!(path = %store_path.display(), "credentials stored");
            credentials
        };
        Ok(Self { client, auth_base, store_path, credentials: Mutex::new(credentials) })
    }

    /// Non-interactive constructor for pre-existing credentials.
    pub fn with_credentials(credentials: Credentials, store_path: PathBuf, auth_base: Url) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self { client, auth_base, store_path, credentials: Mutex::new(credentials) })
    }

    /// Current access token, proactively refreshed when close to expiry.
    pub async fn bearer(&self) -> Result<String, DownloadError> {
        let is_stale = self.credentials.lock().await.is_stale(Utc::now());
        if is_stale {
            self.refresh().await?;
        }
        Ok(self.credentials.lock().await.access_token.clone())
    }

    /// One refresh-token exchange; persists the updated record on success.
    #[instrument(skip_all)]
    pub async fn refresh(&self) -> Result<(), DownloadError> {
        let refresh_token = self.credentials.lock().await.refresh_token.clone();
        if refresh_token.is_empty() {
            return Err(DownloadError::Auth(
                "no refresh token stored, log in interactively first".to_string(),
            ));
        }

        #[derive(Serialize)]
        struct RefreshTokenRequest<'a> {
            grant_type: &'a str,
            client_id: &'a str,
            refresh_token: &'a str,
            scope: &'a str,
        }

        let response = self
            .client
            .post(self.token_endpoint())
            .form(&RefreshTokenRequest {
                grant_type: "refresh_token",
                client_id: CLIENT_ID,
                refresh_token: &refresh_token,
                scope: SCOPE,
            })
            .send()
            .await
            .map_err(|error| DownloadError::Auth(format!("token refresh failed: {error}")))?;
        if !response.status().is_success() {
            return Err(DownloadError::Auth(format!(
                "token refresh rejected with {}",
                response.status(),
            )));
        }
        let response: TokenResponse = response
            .json()
            .await
            .map_err(|error| DownloadError::Auth(format!("malformed token response: {error}")))?;

        let updated = Credentials::from_response(response, Some(refresh_token));
        updated.write_to(&self.store_path)?;
        *self.credentials.lock().await = updated;
        info!("token refreshed");
        Ok(())
    }

    fn token_endpoint(&self) -> String {
        format!("{}/oauth2/v3/token", self.auth_base.as_str().trim_end_matches('/'))
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,

    #[serde(default)]
    refresh_token: Option<String>,

    #[serde(default)]
    expires_in: Option<i64>,
}

fn default_store_path(email: &str) -> Result<PathBuf> {
    let home = dirs::home_dir().context("failed to determine the home directory")?;
    Ok(home.join(".squirrel").join(format!("{email}.json")))
}

/// Interactive first-use flow: authorization-code grant with PKCE, the code
/// pasted back by the user since the redirect URI is a dead end on purpose.
async fn log_in(client: &Client, auth_base: &Url) -> Result<Credentials> {
    let verifier = generate_code_verifier();
    let challenge = generate_code_challenge(&verifier);

    let mut url = auth_base.join("oauth2/v3/authorize")?;
    url.query_pairs_mut()
        .append_pair("client_id", CLIENT_ID)
        .append_pair("code_challenge", &challenge)
        .append_pair("code_challenge_method", "S256")
        .append_pair("redirect_uri", REDIRECT_URI)
        .append_pair("response_type", "code")
        .append_pair("scope", SCOPE);

    println!("STEP 1: log in to your Tesla account. Open this page in a browser:\n");
    println!("{url}\n");
    println!("After a successful login you will get a Page Not Found error. That's expected.");
    println!("Copy the URL of that page and paste it here.\n");
    let pasted: String = Input::new().with_prompt("URL after authentication").interact_text()?;

    let code =
        authorization_code(&pasted).context("the pasted URL carries no authorization code")?;

    #[derive(Serialize)]
    struct TokenRequest<'a> {
        grant_type: &'a str,
        client_id: &'a str,
        code: &'a str,
        code_verifier: &'a str,
        redirect_uri: &'a str,
    }

    let response: TokenResponse = client
        .post(format!("{}/oauth2/v3/token", auth_base.as_str().trim_end_matches('/')))
        .form(&TokenRequest {
            grant_type: "authorization_code",
            client_id: CLIENT_ID,
            code: &code,
            code_verifier: &verifier,
            redirect_uri: REDIRECT_URI,
        })
        .send()
        .await
        .context("failed to exchange the authorization code")?
        .error_for_status()
        .context("the token endpoint rejected the authorization code")?
        .json()
        .await
        .context("failed to parse the token response")?;

    println!("\nSuccess!");
    Ok(Credentials::from_response(response, None))
}

fn authorization_code(pasted_url: &str) -> Option<String> {
    let url = Url::parse(pasted_url.trim()).ok()?;
    url.query_pairs()
        .find(|(key, _)| key == "code")
        .map(|(_, value)| value.into_owned())
}

fn generate_code_verifier() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";
    let mut rng = rand::thread_rng();
    (0..86).map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char).collect()
}

fn generate_code_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}
