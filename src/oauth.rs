//! Google OAuth2 PKCE flow and [`CredentialProvider`] implementation
//! (spec.md §4.5/§6 `sink-auth`). The authorization-code exchange, loopback
//! listener, and token storage are the teacher's `oauth.rs` almost verbatim;
//! credentials are loaded from a downloaded OAuth client JSON file instead of
//! environment variables, per `original_source/gmail/auth.py`'s
//! `load_credentials` (Desktop-app vs Web-application client detection).

use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use oauth2::basic::BasicClient;
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};
use crate::sink::CredentialProvider;

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const SERVICE_NAME: &str = "migrator-google-oauth";

/// Gmail scopes this tool ever requests: inserting/importing mail and
/// managing the labels applied to it (spec.md §4.5).
pub const GMAIL_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.insert",
    "https://www.googleapis.com/auth/gmail.labels",
];

#[derive(Clone, Debug)]
struct TokenBundle {
    access_token: String,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    email: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ClientSecretFile {
    #[serde(default)]
    installed: Option<RawCreds>,
    #[serde(default)]
    web: Option<RawCreds>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawCreds {
    client_id: String,
    client_secret: String,
}

#[derive(Debug, Clone)]
struct InstalledCreds {
    client_id: String,
    client_secret: String,
}

/// Loads an OAuth client JSON file as downloaded from Google Cloud Console,
/// accepting either the "Desktop app" (`installed`) or "Web application"
/// (`web`) client type.
fn load_credentials(credentials_file: &Path) -> AppResult<InstalledCreds> {
    let raw = fs::read_to_string(credentials_file).map_err(|e| {
        AppError::Config(format!(
            "reading OAuth credentials file {}: {e}",
            credentials_file.display()
        ))
    })?;
    let parsed: ClientSecretFile = serde_json::from_str(&raw).map_err(|e| {
        AppError::Config(format!(
            "parsing OAuth credentials file {}: {e}",
            credentials_file.display()
        ))
    })?;

    let creds = parsed
        .installed
        .or(parsed.web)
        .ok_or_else(|| AppError::Config("OAuth credentials file has neither 'installed' nor 'web' client".into()))?;

    Ok(InstalledCreds {
        client_id: creds.client_id,
        client_secret: creds.client_secret,
    })
}

fn build_client(creds: &InstalledCreds, redirect: &str) -> AppResult<BasicClient> {
    let client = BasicClient::new(
        ClientId::new(creds.client_id.clone()),
        Some(ClientSecret::new(creds.client_secret.clone())),
        AuthUrl::new(AUTH_URL.to_string()).unwrap(),
        Some(TokenUrl::new(TOKEN_URL.to_string()).unwrap()),
    )
    .set_redirect_uri(
        RedirectUrl::new(redirect.to_string())
            .map_err(|e| AppError::Config(format!("invalid redirect uri {redirect}: {e}")))?,
    )
    .set_auth_type(oauth2::AuthType::RequestBody);

    Ok(client)
}

fn build_auth_url(client: &BasicClient, scopes: &[Scope]) -> (String, PkceCodeVerifier, CsrfToken) {
    let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
    let mut req = client
        .authorize_url(CsrfToken::new_random)
        .add_extra_param("access_type", "offline")
        .add_extra_param("prompt", "consent")
        .set_pkce_challenge(challenge);
    for scope in scopes {
        req = req.add_scope(scope.clone());
    }
    let (url, csrf) = req.url();
    (url.to_string(), verifier, csrf)
}

async fn try_refresh(client: &BasicClient, refresh_token: &str) -> AppResult<TokenBundle> {
    let refresh = RefreshToken::new(refresh_token.to_string());
    let token_res = client
        .exchange_refresh_token(&refresh)
        .request_async(async_http_client)
        .await
        .map_err(|e| AppError::Auth(format!("refreshing Google access token failed: {e}")))?;

    Ok(TokenBundle {
        access_token: token_res.access_token().secret().to_string(),
        expires_at: token_res
            .expires_in()
            .map(|d| Utc::now() + Duration::from_std(d).unwrap_or_else(|_| Duration::seconds(0))),
    })
}

struct CodeResponse {
    code: String,
    state: String,
}

async fn listen_for_code(listener: TcpListener) -> AppResult<CodeResponse> {
    let (mut stream, _) = listener
        .accept()
        .await
        .map_err(|e| AppError::Unexpected(format!("redirect accept failed: {e}")))?;

    let mut buf = [0u8; 4096];
    let n = stream
        .read(&mut buf)
        .await
        .map_err(|e| AppError::Unexpected(format!("reading auth callback failed: {e}")))?;
    let req = String::from_utf8_lossy(&buf[..n]);
    let first_line = req.lines().next().unwrap_or("");
    let path = first_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| AppError::Unexpected("invalid HTTP request".into()))?;
    let full_url = format!("http://localhost{path}");
    let parsed = url::Url::parse(&full_url)
        .map_err(|e| AppError::Unexpected(format!("failed to parse callback url: {e}")))?;

    let code = parsed
        .query_pairs()
        .find(|(k, _)| k == "code")
        .map(|(_, v)| v.to_string())
        .ok_or_else(|| AppError::Unexpected("callback missing code parameter".into()))?;
    let state = parsed
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.to_string())
        .unwrap_or_default();

    let response =
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nAuthentication complete. You can close this tab.";
    let _ = stream.write_all(response.as_bytes()).await;
    Ok(CodeResponse { code, state })
}

fn open_in_browser(url: &str) {
    let attempt = if cfg!(target_os = "macos") {
        std::process::Command::new("open").arg(url).status()
    } else if cfg!(target_os = "windows") {
        std::process::Command::new("rundll32.exe")
            .args(["url.dll,FileProtocolHandler", url])
            .status()
    } else {
        std::process::Command::new("xdg-open").arg(url).status()
    };
    if let Err(e) = attempt {
        warn!("could not auto-open browser: {e}. Open this URL manually:\n{url}");
    } else {
        println!("If your browser did not open, navigate to:\n{url}");
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct StoredToken {
    refresh_token: String,
}

#[derive(Clone)]
struct TokenStore {
    account_id: String,
}

impl TokenStore {
    fn from_key(key: &str) -> Self {
        Self {
            account_id: key.to_string(),
        }
    }

    fn load(&self) -> AppResult<Option<StoredToken>> {
        match self.load_keyring() {
            Ok(found) => Ok(found),
            Err(e) => {
                warn!("keyring unavailable: {e}");
                Ok(self.load_file())
            }
        }
    }

    fn save(&self, refresh: &str) -> AppResult<()> {
        let token = StoredToken {
            refresh_token: refresh.to_string(),
        };
        let serialized = serde_json::to_string(&token).map_err(|e| AppError::Unexpected(e.to_string()))?;

        if let Err(e) = self.save_keyring(&serialized) {
            warn!("keyring save failed ({e}); writing to temp file as fallback");
            self.save_file(&serialized)?;
        }
        Ok(())
    }

    fn delete(&self) {
        if let Ok(entry) = keyring::Entry::new(SERVICE_NAME, &self.account_id) {
            let _ = entry.delete_password();
        }
        let _ = std::fs::remove_file(self.file_path());
    }

    fn load_keyring(&self) -> Result<Option<StoredToken>, String> {
        let entry = keyring::Entry::new(SERVICE_NAME, &self.account_id)
            .map_err(|e| format!("keyring entry error: {e}"))?;
        match entry.get_password() {
            Ok(pwd) => serde_json::from_str(&pwd)
                .map(Some)
                .map_err(|e| format!("keyring token decode: {e}")),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(format!("keyring read: {e}")),
        }
    }

    fn save_keyring(&self, serialized: &str) -> Result<(), String> {
        let entry = keyring::Entry::new(SERVICE_NAME, &self.account_id)
            .map_err(|e| format!("keyring entry error: {e}"))?;
        entry.set_password(serialized).map_err(|e| format!("keyring write: {e}"))
    }

    fn file_path(&self) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("migrator_token_{}.json", &self.account_id))
    }

    fn load_file(&self) -> Option<StoredToken> {
        let raw = std::fs::read_to_string(self.file_path()).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn save_file(&self, serialized: &str) -> AppResult<()> {
        let tmp = self.file_path();

        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .map_err(|e| AppError::Unexpected(format!("opening temp token file: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = file.set_permissions(fs::Permissions::from_mode(0o600));
        }

        file.write_all(serialized.as_bytes())
            .map_err(|e| AppError::Unexpected(format!("writing token file: {e}")))?;
        file.sync_all()
            .map_err(|e| AppError::Unexpected(format!("syncing token file: {e}")))?;
        warn!(
            path = %tmp.display(),
            "token saved to temp file due to keyring issues; move/delete after debugging"
        );
        Ok(())
    }
}

/// [`CredentialProvider`] backed by a Google OAuth2 installed-app flow with
/// refresh-token persistence.
pub struct GoogleCredentialProvider {
    client: BasicClient,
    token_store: TokenStore,
    cached: Mutex<Option<TokenBundle>>,
}

impl GoogleCredentialProvider {
    /// Run the full interactive consent flow (spec.md §6 `sink-auth`):
    /// open a browser, listen on a loopback port for the redirect, exchange
    /// the code, and persist the refresh token.
    pub async fn authorize_interactive(credentials_file: &Path, account_key: &str) -> AppResult<Self> {
        let creds = load_credentials(credentials_file)?;
        let token_store = TokenStore::from_key(account_key);

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| AppError::Unexpected(format!("failed to bind loopback port: {e}")))?;
        let port = listener
            .local_addr()
            .map(|addr| addr.port())
            .map_err(|e| AppError::Unexpected(format!("failed to read local addr: {e}")))?;
        let redirect = format!("http://127.0.0.1:{port}");

        let client = build_client(&creds, &redirect)?;
        let scopes: Vec<Scope> = GMAIL_SCOPES.iter().map(|s| Scope::new(s.to_string())).collect();
        let (auth_url, verifier, csrf) = build_auth_url(&client, &scopes);

        info!(account = %account_key, %redirect, "opening browser for Google OAuth consent");
        open_in_browser(&auth_url);

        let code = listen_for_code(listener).await?;
        if code.state != *csrf.secret() {
            return Err(AppError::Auth("OAuth callback state mismatch".into()));
        }

        let token_res = client
            .exchange_code(AuthorizationCode::new(code.code))
            .set_pkce_verifier(verifier)
            .request_async(async_http_client)
            .await
            .map_err(|e| AppError::Auth(format!("token exchange failed: {e}")))?;

        let refresh_token = token_res
            .refresh_token()
            .map(|r| r.secret().to_string())
            .ok_or_else(|| AppError::Auth("Google did not return a refresh token; retry with prompt=consent".into()))?;
        token_store.save(&refresh_token)?;

        let bundle = TokenBundle {
            access_token: token_res.access_token().secret().to_string(),
            expires_at: token_res
                .expires_in()
                .map(|d| Utc::now() + Duration::from_std(d).unwrap_or_else(|_| Duration::seconds(0))),
        };

        Ok(GoogleCredentialProvider {
            client,
            token_store,
            cached: Mutex::new(Some(bundle)),
        })
    }

    /// Load a previously stored refresh token; used by `migrate`/`verify`
    /// which should never pop a browser mid-run.
    pub async fn from_stored(credentials_file: &Path, account_key: &str) -> AppResult<Self> {
        let creds = load_credentials(credentials_file)?;
        let token_store = TokenStore::from_key(account_key);

        if token_store.load()?.is_none() {
            return Err(AppError::Auth(format!(
                "no stored Google credentials for {account_key}; run the sink-auth subcommand first"
            )));
        }

        let redirect = "http://127.0.0.1:0".to_string();
        let client = build_client(&creds, &redirect)?;

        Ok(GoogleCredentialProvider {
            client,
            token_store,
            cached: Mutex::new(None),
        })
    }

    async fn refresh(&self) -> AppResult<TokenBundle> {
        let stored = self.token_store.load()?.ok_or_else(|| {
            AppError::Auth("no stored Google refresh token; run the sink-auth subcommand first".into())
        })?;

        match try_refresh(&self.client, &stored.refresh_token).await {
            Ok(bundle) => Ok(bundle),
            Err(err) => {
                self.token_store.delete();
                Err(AppError::Auth(format!(
                    "{err}; run the sink-auth subcommand to re-authenticate"
                )))
            }
        }
    }
}

impl CredentialProvider for GoogleCredentialProvider {
    fn access_token(&self) -> BoxFuture<'_, AppResult<String>> {
        Box::pin(async move {
            {
                let cached = self.cached.lock().await;
                if let Some(bundle) = cached.as_ref() {
                    let fresh = bundle
                        .expires_at
                        .map(|exp| exp > Utc::now() + Duration::seconds(60))
                        .unwrap_or(true);
                    if fresh {
                        return Ok(bundle.access_token.clone());
                    }
                }
            }

            let refreshed = self.refresh().await?;
            let token = refreshed.access_token.clone();
            *self.cached.lock().await = Some(refreshed);
            Ok(token)
        })
    }
}

/// Fetch the authenticated user's email address, used by `sink-auth` to
/// confirm the right account was authorized.
pub async fn fetch_user_email(access_token: &str) -> AppResult<String> {
    let client = reqwest::Client::new();
    let res = client
        .get("https://www.googleapis.com/oauth2/v2/userinfo")
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|e| AppError::TransientIo(format!("userinfo request failed: {e}")))?;
    if !res.status().is_success() {
        return Err(AppError::TransientIo(format!(
            "userinfo failed with status {}",
            res.status()
        )));
    }
    let parsed: UserInfo = res
        .json()
        .await
        .map_err(|e| AppError::Unexpected(format!("parsing userinfo: {e}")))?;
    Ok(parsed.email)
}
