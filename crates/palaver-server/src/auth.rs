//! Bearer-credential verification against the upstream identity authorities.
//!
//! Two authorities are tried in fixed order (the admin endpoint, then the
//! user endpoint); the first success wins. A timeout or transport failure on
//! one authority is treated as that authority rejecting the credential, not
//! as a fatal error, so the other authority is still consulted. Verified
//! credentials are cached for a short TTL in front of the verifier.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use palaver_shared::{Identity, UserKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("No token provided")]
    NoToken,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Authentication service unavailable")]
    ServiceUnavailable,
}

/// Seam for the verification call so tests can supply a double.
#[async_trait]
pub trait VerifyToken: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

// ---------------------------------------------------------------------------
// HTTP verifier
// ---------------------------------------------------------------------------

/// One upstream verification endpoint.
struct Authority {
    name: &'static str,
    url: String,
    /// Kind assumed when the response does not carry an explicit `type`.
    fallback_kind: UserKind,
}

/// Production verifier calling the upstream identity API.
pub struct HttpVerifier {
    http: reqwest::Client,
    authorities: Vec<Authority>,
}

impl HttpVerifier {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let base = base_url.trim_end_matches('/');
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            authorities: vec![
                Authority {
                    name: "admin",
                    url: format!("{base}/admin/verify-token"),
                    fallback_kind: UserKind::Admin,
                },
                Authority {
                    name: "user",
                    url: format!("{base}/api/v2/verify-token"),
                    fallback_kind: UserKind::User,
                },
            ],
        })
    }
}

#[async_trait]
impl VerifyToken for HttpVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::NoToken);
        }

        let mut rejected = false;

        for authority in &self.authorities {
            let response = self
                .http
                .post(&authority.url)
                .bearer_auth(token)
                .header(reqwest::header::ACCEPT, "application/json")
                .send()
                .await;

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    // Timeout or transport failure: this authority said no;
                    // the next one is still tried.
                    warn!(authority = authority.name, error = %e, "authority unreachable");
                    continue;
                }
            };

            let status = response.status();
            match response.json::<Value>().await {
                Ok(body) => {
                    if status.is_success()
                        && body.get("status").and_then(Value::as_i64) == Some(1)
                    {
                        if let Some(identity) = body
                            .get("result")
                            .and_then(|raw| normalize_identity(raw, authority.fallback_kind))
                        {
                            debug!(
                                authority = authority.name,
                                user = %identity.name,
                                "credential verified"
                            );
                            return Ok(identity);
                        }
                    }
                    debug!(
                        authority = authority.name,
                        status = %status,
                        "authority rejected credential"
                    );
                    rejected = true;
                }
                Err(e) => {
                    debug!(authority = authority.name, error = %e, "unreadable authority response");
                    rejected = true;
                }
            }
        }

        if rejected {
            Err(AuthError::InvalidToken)
        } else {
            Err(AuthError::ServiceUnavailable)
        }
    }
}

/// Map either authority's response shape onto the canonical [`Identity`].
///
/// This is the single place the two response dialects are reconciled:
/// numeric or string ids, `name` versus `first_name`/`last_name`, and the
/// various avatar field spellings.
pub fn normalize_identity(raw: &Value, fallback_kind: UserKind) -> Option<Identity> {
    let id = match raw.get("id") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return None,
    };

    let kind = raw
        .get("type")
        .and_then(Value::as_str)
        .and_then(UserKind::parse)
        .unwrap_or(fallback_kind);

    let name = non_empty(raw, "name").unwrap_or_else(|| {
        let first = non_empty(raw, "first_name")
            .or_else(|| non_empty(raw, "firstName"))
            .unwrap_or_default();
        let last = non_empty(raw, "last_name")
            .or_else(|| non_empty(raw, "lastName"))
            .unwrap_or_default();
        format!("{first} {last}").trim().to_string()
    });

    let email = non_empty(raw, "email");
    let profile = non_empty(raw, "profile")
        .or_else(|| non_empty(raw, "profile_picture"))
        .or_else(|| non_empty(raw, "avatar"));

    Some(Identity {
        id,
        kind,
        name,
        email,
        profile,
    })
}

fn non_empty(raw: &Value, key: &str) -> Option<String> {
    raw.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Extract the bearer credential from an `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Result<String, AuthError> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::NoToken)?;

    let token = header.strip_prefix("Bearer ").unwrap_or("").trim();
    if token.is_empty() {
        return Err(AuthError::NoToken);
    }
    Ok(token.to_string())
}

// ---------------------------------------------------------------------------
// Token cache
// ---------------------------------------------------------------------------

struct CachedIdentity {
    identity: Identity,
    verified_at: Instant,
}

/// TTL cache in front of a [`VerifyToken`] implementation, so bursts of
/// requests carrying the same credential hit the upstream once.
pub struct AuthService {
    verifier: Arc<dyn VerifyToken>,
    cache: RwLock<HashMap<String, CachedIdentity>>,
    ttl: Duration,
}

impl AuthService {
    pub fn new(verifier: Arc<dyn VerifyToken>, ttl: Duration) -> Self {
        Self {
            verifier,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Resolve a credential to an identity, via the cache when fresh.
    pub async fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::NoToken);
        }

        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(token) {
                if entry.verified_at.elapsed() < self.ttl {
                    return Ok(entry.identity.clone());
                }
            }
        }

        let identity = self.verifier.verify(token).await?;

        {
            let mut cache = self.cache.write().await;
            cache.insert(
                token.to_string(),
                CachedIdentity {
                    identity: identity.clone(),
                    verified_at: Instant::now(),
                },
            );
        }

        Ok(identity)
    }

    /// Evict expired entries. Run periodically from a maintenance task.
    pub async fn purge_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        let ttl = self.ttl;
        cache.retain(|_, entry| entry.verified_at.elapsed() < ttl);
        let removed = before - cache.len();
        if removed > 0 {
            debug!(removed, "purged expired token cache entries");
        }
    }
}
