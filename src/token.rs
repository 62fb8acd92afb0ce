//! Token supplier
//!
//! Produces a currently-valid bearer credential for every authenticated
//! request, from a fixed string, an async callback, or a token-exchange
//! flow trading an identity-provider token for a service-issued one.
//!
//! Concurrent callers needing a refresh all await the same in-flight
//! request. This is a correctness requirement, not an optimization: duplicate
//! concurrent exchanges against the token endpoint could be rate-limited or
//! produce inconsistent session state.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ClientError, Result};

/// Tokens are considered expired slightly before their actual expiry so a
/// request does not start with a credential that dies mid-flight.
const EXPIRY_SKEW: Duration = Duration::from_secs(30);

/// Async callback producing a token string.
pub type TokenCallback =
    Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<String, String>> + Send + Sync>;

/// How the client obtains its bearer credential.
///
/// Discriminated once at construction; `get_token` never re-inspects the
/// shape per call.
#[derive(Clone)]
pub enum TokenConfig {
    /// A fixed token string
    Static(String),
    /// A zero-argument async callback returning a token
    Callback(TokenCallback),
    /// Trade an identity-provider token for a service-issued one
    Exchange(ExchangeConfig),
}

impl fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenConfig::Static(_) => f.write_str("TokenConfig::Static"),
            TokenConfig::Callback(_) => f.write_str("TokenConfig::Callback"),
            TokenConfig::Exchange(cfg) => f
                .debug_struct("TokenConfig::Exchange")
                .field("org_id", &cfg.org_id)
                .field("service", &cfg.service)
                .finish(),
        }
    }
}

/// Token-exchange configuration
#[derive(Clone)]
pub struct ExchangeConfig {
    /// Organization the exchanged token is scoped to
    pub org_id: String,
    /// Token-provider service name registered with the API
    pub service: String,
    /// Callback producing the identity-provider token to trade in
    pub identity_token: TokenCallback,
    /// Override for the exchange endpoint; defaults to `{api_host}/tokens`
    pub token_url: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeRequest<'a> {
    org_id: &'a str,
    service: &'a str,
    token: &'a str,
}

#[derive(Deserialize)]
struct ExchangeResponse {
    token: String,
}

/// A credential plus its derived expiry. Replaced wholesale on refresh,
/// never mutated in place.
#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: Option<SystemTime>,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        match self.expires_at {
            // No parseable expiry: treat as non-expiring until a request fails
            None => true,
            Some(expires_at) => SystemTime::now() + EXPIRY_SKEW < expires_at,
        }
    }
}

type RefreshFuture = Shared<BoxFuture<'static, std::result::Result<CachedToken, String>>>;

#[derive(Default)]
struct TokenState {
    cached: Option<CachedToken>,
    in_flight: Option<RefreshFuture>,
}

/// Resolves and caches the bearer credential for the client.
pub struct TokenProvider {
    config: TokenConfig,
    http: reqwest::Client,
    exchange_url: String,
    state: Mutex<TokenState>,
}

impl TokenProvider {
    pub fn new(config: TokenConfig, http: reqwest::Client, api_host: &str) -> Self {
        let exchange_url = match &config {
            TokenConfig::Exchange(cfg) => cfg
                .token_url
                .clone()
                .unwrap_or_else(|| format!("{}/tokens", api_host.trim_end_matches('/'))),
            _ => String::new(),
        };
        Self {
            config,
            http,
            exchange_url,
            state: Mutex::new(TokenState::default()),
        }
    }

    /// Return a currently-valid bearer token, refreshing if needed.
    ///
    /// At most one refresh is in flight at a time; every concurrent caller
    /// observes the outcome of that same refresh, including failure. A failed
    /// refresh leaves the cache empty so the next call starts from scratch.
    pub async fn get_token(&self) -> Result<String> {
        let refresh = {
            let mut state = self.state.lock().expect("token state poisoned");
            if let Some(cached) = &state.cached {
                if cached.is_fresh() {
                    return Ok(cached.token.clone());
                }
                debug!("cached token expired, refreshing");
            }
            match &state.in_flight {
                Some(in_flight) => in_flight.clone(),
                None => {
                    let future =
                        refresh_token(self.config.clone(), self.http.clone(), self.exchange_url.clone())
                            .boxed()
                            .shared();
                    state.in_flight = Some(future.clone());
                    future
                }
            }
        };

        let outcome = refresh.clone().await;

        {
            let mut state = self.state.lock().expect("token state poisoned");
            // Only the refresh we awaited may record its result; a newer one
            // could already be in flight.
            let ours = state
                .in_flight
                .as_ref()
                .is_some_and(|current| current.ptr_eq(&refresh));
            if ours {
                state.in_flight = None;
                state.cached = outcome.as_ref().ok().cloned();
            }
        }

        match outcome {
            Ok(cached) => Ok(cached.token),
            Err(message) => {
                warn!(error = %message, "token refresh failed");
                Err(ClientError::Authorization(message))
            }
        }
    }
}

async fn refresh_token(
    config: TokenConfig,
    http: reqwest::Client,
    exchange_url: String,
) -> std::result::Result<CachedToken, String> {
    let token = match config {
        TokenConfig::Static(token) => token,
        TokenConfig::Callback(callback) => callback()
            .await
            .map_err(|e| format!("token callback failed: {}", e))?,
        TokenConfig::Exchange(cfg) => {
            let identity = (cfg.identity_token)()
                .await
                .map_err(|e| format!("identity token callback failed: {}", e))?;
            let body = ExchangeRequest {
                org_id: &cfg.org_id,
                service: &cfg.service,
                token: &identity,
            };
            let response = http
                .post(&exchange_url)
                .json(&body)
                .send()
                .await
                .map_err(|e| format!("token exchange request failed: {}", e))?;
            if !response.status().is_success() {
                return Err(format!(
                    "token exchange rejected with status {}",
                    response.status().as_u16()
                ));
            }
            let body: ExchangeResponse = response
                .json()
                .await
                .map_err(|e| format!("invalid token exchange response: {}", e))?;
            body.token
        }
    };

    let expires_at = decode_expiry(&token);
    Ok(CachedToken { token, expires_at })
}

/// Best-effort decode of the `exp` claim from a JWT payload. Anything that
/// fails to decode yields None, which degrades to "never expires".
fn decode_expiry(token: &str) -> Option<SystemTime> {
    let payload = token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?.as_u64()?;
    Some(UNIX_EPOCH + Duration::from_secs(exp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fake_jwt(exp: u64) -> String {
        let encode = |v: &serde_json::Value| {
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(v.to_string())
        };
        format!(
            "{}.{}.sig",
            encode(&serde_json::json!({"alg": "HS256"})),
            encode(&serde_json::json!({"exp": exp})),
        )
    }

    fn unix_now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    #[test]
    fn test_decode_expiry() {
        let token = fake_jwt(1_900_000_000);
        assert_eq!(
            decode_expiry(&token),
            Some(UNIX_EPOCH + Duration::from_secs(1_900_000_000))
        );
    }

    #[test]
    fn test_decode_expiry_opaque_token() {
        assert_eq!(decode_expiry("not-a-jwt"), None);
        assert_eq!(decode_expiry("a.b.c"), None);
    }

    #[tokio::test]
    async fn test_static_token_cached() {
        let provider = TokenProvider::new(
            TokenConfig::Static("tok".into()),
            reqwest::Client::new(),
            "https://api.example",
        );
        assert_eq!(provider.get_token().await.unwrap(), "tok");
        assert_eq!(provider.get_token().await.unwrap(), "tok");
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_cb = calls.clone();
        let callback: TokenCallback = Arc::new(move || {
            let calls = calls_in_cb.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(fake_jwt(unix_now() + 3600))
            }
            .boxed()
        });
        let provider = Arc::new(TokenProvider::new(
            TokenConfig::Callback(callback),
            reqwest::Client::new(),
            "https://api.example",
        ));

        let (a, b) = tokio::join!(provider.get_token(), provider.get_token());
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_surfaces_to_all_waiters_then_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_cb = calls.clone();
        let callback: TokenCallback = Arc::new(move || {
            let calls = calls_in_cb.clone();
            async move {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                if attempt == 0 {
                    Err("provider unavailable".to_string())
                } else {
                    Ok(fake_jwt(unix_now() + 3600))
                }
            }
            .boxed()
        });
        let provider = Arc::new(TokenProvider::new(
            TokenConfig::Callback(callback),
            reqwest::Client::new(),
            "https://api.example",
        ));

        let (a, b) = tokio::join!(provider.get_token(), provider.get_token());
        assert!(matches!(a, Err(ClientError::Authorization(_))));
        assert!(matches!(b, Err(ClientError::Authorization(_))));

        // Cache was left unset, so the next call retries from scratch
        assert!(provider.get_token().await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_token_triggers_refresh() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_cb = calls.clone();
        let callback: TokenCallback = Arc::new(move || {
            let calls = calls_in_cb.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                // Already inside the expiry skew window
                Ok(fake_jwt(unix_now() + 5))
            }
            .boxed()
        });
        let provider = TokenProvider::new(
            TokenConfig::Callback(callback),
            reqwest::Client::new(),
            "https://api.example",
        );

        provider.get_token().await.unwrap();
        provider.get_token().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
