//! Per-deployment auth wall.
//!
//! Deployments with `AuthWall::All` (or `Dev` on the managed dev
//! subdomain) answer unauthenticated requests with a 200 login page. A
//! successful login issues a `stormkit_session` cookie holding an HS256
//! JWT and redirects back to the referrer.

use crate::html;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;
use stormkit_core::{AppConfig, AuthWall as AuthWallMode};
use stormkit_storage::Kv;
use time::OffsetDateTime;

pub const SESSION_COOKIE_NAME: &str = "stormkit_session";

/// Session lifetime: 24 hours.
const SESSION_TTL_SECS: i64 = 24 * 60 * 60;

/// One-time form tokens expire after ten minutes.
const TOKEN_TTL: Duration = Duration::from_secs(10 * 60);

type HmacSha256 = Hmac<Sha256>;

/// Whether this request must carry a valid session.
pub fn requires_session(config: &AppConfig, is_stormkit_subdomain: bool) -> bool {
    match config.auth_wall {
        AuthWallMode::All => true,
        AuthWallMode::Dev => is_stormkit_subdomain,
        AuthWallMode::Off => false,
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    #[serde(rename = "envId")]
    env_id: u64,
    exp: i64,
}

/// Credential source for the login endpoint. The record store itself is
/// external; this is the lookup the edge performs against it.
pub enum LoginBackend {
    /// email → password map.
    Static(HashMap<String, String>),
    /// Internal API performing the lookup and the `last_login` update.
    Http {
        base: String,
        client: reqwest::Client,
    },
}

impl LoginBackend {
    async fn verify(&self, env_id: u64, email: &str, password: &str) -> bool {
        match self {
            LoginBackend::Static(users) => users
                .get(&email.to_lowercase())
                .is_some_and(|expected| expected == password),
            LoginBackend::Http { base, client } => {
                let url = format!("{base}/auth-wall/verify");
                let body = serde_json::json!({
                    "envId": env_id,
                    "email": email,
                    "password": password,
                });
                match client.post(&url).json(&body).send().await {
                    Ok(response) => response.status().is_success(),
                    Err(e) => {
                        tracing::error!("auth wall credential lookup failed: {e}");
                        false
                    }
                }
            }
        }
    }
}

/// Outcome of a login POST.
#[derive(Debug, PartialEq)]
pub enum LoginOutcome {
    /// Set the session cookie and 302 back to the referrer.
    Success {
        cookie: String,
        redirect_to: String,
    },
    /// 302 back to the referrer with `?stormkit_error=invalid_credentials`.
    Failure { redirect_to: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    pub token: String,
    #[serde(rename = "envId")]
    pub env_id: u64,
    #[serde(default)]
    pub referrer: String,
}

pub struct AuthWallGate {
    secret: Vec<u8>,
    kv: Kv,
    backend: LoginBackend,
}

impl AuthWallGate {
    pub fn new(secret: impl Into<Vec<u8>>, kv: Kv, backend: LoginBackend) -> Self {
        Self {
            secret: secret.into(),
            kv,
            backend,
        }
    }

    /// Check the `Cookie` header for a valid session bound to `env_id`.
    pub fn has_valid_session(&self, cookie_header: Option<&str>, env_id: u64) -> bool {
        let Some(header) = cookie_header else {
            return false;
        };

        let Some(token) = header.split(';').find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == SESSION_COOKIE_NAME).then(|| value.to_string())
        }) else {
            return false;
        };

        match self.verify_jwt(&token) {
            Some(claims) => {
                claims.env_id == env_id && claims.exp > OffsetDateTime::now_utc().unix_timestamp()
            }
            None => false,
        }
    }

    /// Render the login page, minting and storing a one-time form token.
    pub async fn login_page(&self, api_url: &str, env_id: u64, referrer: &str) -> String {
        let token = random_token();
        if let Err(e) = self
            .kv
            .set(&token_key(&token), &env_id.to_string(), Some(TOKEN_TTL))
            .await
        {
            tracing::error!("cannot store auth wall token: {e}");
        }

        let action = format!("{api_url}/auth-wall/login");
        html::render(
            "Stormkit - Authentication required",
            "",
            &format!(
                r#"<div class="container text-center">
<h1>This deployment is protected</h1>
<form method="POST" action="{action}">
<input type="hidden" name="token" value="{token}" />
<input type="hidden" name="envId" value="{env_id}" />
<input type="hidden" name="referrer" value="{referrer}" />
<input type="email" name="email" placeholder="Email" />
<input type="password" name="password" placeholder="Password" />
<button type="submit">Sign in</button>
</form>
</div>"#,
                referrer = escape_attr(referrer),
            ),
        )
    }

    /// Handle the login POST: consume the one-time token, verify
    /// credentials, mint the cookie.
    pub async fn handle_login(&self, form: LoginForm) -> LoginOutcome {
        let failure = LoginOutcome::Failure {
            redirect_to: failure_redirect(&form.referrer),
        };

        // The token is single use; missing or reused tokens fail.
        let key = token_key(&form.token);
        match self.kv.get(&key).await {
            Ok(Some(stored_env)) if stored_env == form.env_id.to_string() => {
                let _ = self.kv.del(&key).await;
            }
            _ => return failure,
        }

        if !self
            .backend
            .verify(form.env_id, &form.email, &form.password)
            .await
        {
            return failure;
        }

        LoginOutcome::Success {
            cookie: self.session_cookie(form.env_id),
            redirect_to: success_redirect(&form.referrer),
        }
    }

    /// `Set-Cookie` value for a fresh session.
    pub fn session_cookie(&self, env_id: u64) -> String {
        let jwt = self.issue_jwt(env_id);
        format!(
            "{SESSION_COOKIE_NAME}={jwt}; Path=/; Max-Age={SESSION_TTL_SECS}; HttpOnly; SameSite=Strict"
        )
    }

    fn issue_jwt(&self, env_id: u64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let claims = SessionClaims {
            env_id,
            exp: OffsetDateTime::now_utc().unix_timestamp() + SESSION_TTL_SECS,
        };
        let payload =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap_or_default());
        let signature = self.sign(&format!("{header}.{payload}"));
        format!("{header}.{payload}.{signature}")
    }

    fn verify_jwt(&self, token: &str) -> Option<SessionClaims> {
        let mut parts = token.split('.');
        let header = parts.next()?;
        let payload = parts.next()?;
        let signature = parts.next()?;
        if parts.next().is_some() {
            return None;
        }

        let expected = self.sign(&format!("{header}.{payload}"));
        if expected != signature {
            return None;
        }

        let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
        serde_json::from_slice(&decoded).ok()
    }

    fn sign(&self, input: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(input.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

fn token_key(token: &str) -> String {
    format!("auth-wall-token:{token}")
}

fn random_token() -> String {
    let mut rng = rand::thread_rng();
    (0..20).map(|_| format!("{:02x}", rng.r#gen::<u8>())).collect()
}

/// Redirect target after a successful login: the referrer with any
/// `stormkit_success`/`stormkit_error` markers stripped.
fn success_redirect(referrer: &str) -> String {
    strip_params(referrer, &["stormkit_success", "stormkit_error"])
}

fn failure_redirect(referrer: &str) -> String {
    let base = strip_params(referrer, &["stormkit_success", "stormkit_error"]);
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}stormkit_error=invalid_credentials")
}

fn strip_params(url: &str, names: &[&str]) -> String {
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };

    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let name = pair.split('=').next().unwrap_or_default();
            !names.contains(&name)
        })
        .collect();

    if kept.is_empty() {
        base.to_string()
    } else {
        format!("{base}?{}", kept.join("&"))
    }
}

fn escape_attr(input: &str) -> String {
    input.replace('"', "&quot;")
}
