//! Auth token validity cache.
//!
//! Validating a token costs a round trip, so the answer is cached per token
//! until an authentication error invalidates it. Tokens that are JWTs with an
//! `exp` claim in the past are rejected locally.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::ports::RemoteSessionStore;

#[derive(Debug, Deserialize)]
struct Claims {
    exp: Option<i64>,
}

/// Caches whether the current auth token is accepted by the remote store.
pub struct TokenValidationService {
    remote: Arc<dyn RemoteSessionStore>,
    cache: Mutex<HashMap<String, bool>>,
}

impl std::fmt::Debug for TokenValidationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidationService").finish_non_exhaustive()
    }
}

impl TokenValidationService {
    /// Create a validation cache in front of `remote`.
    #[must_use]
    pub fn new(remote: Arc<dyn RemoteSessionStore>) -> Self {
        Self {
            remote,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the current token is valid.
    ///
    /// - `None`: there is no token; callers should skip work rather than treat
    ///   it as a rejection.
    /// - `Some(false)`: the token is expired, rejected, or the check failed.
    /// - `Some(true)`: the token is accepted.
    ///
    /// Check failures are not cached, so the next call asks again.
    pub async fn is_valid(&self) -> Option<bool> {
        let token = self.remote.current_token()?;

        if let Some(valid) = self.cache.lock().await.get(&token) {
            return Some(*valid);
        }

        if is_expired(&token, chrono::Utc::now().timestamp()) {
            tracing::debug!("Auth token expired");
            self.cache.lock().await.insert(token, false);
            return Some(false);
        }

        match self.remote.validate_token(&token).await {
            Ok(valid) => {
                if !valid {
                    tracing::info!("Auth token rejected by remote store");
                }
                self.cache.lock().await.insert(token, valid);
                Some(valid)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Token validation failed");
                Some(false)
            }
        }
    }

    /// Forget the cached answer for the current token.
    pub async fn invalidate_cache(&self) {
        if let Some(token) = self.remote.current_token() {
            self.cache.lock().await.remove(&token);
        }
    }

    /// Forget every cached answer.
    pub async fn clear(&self) {
        self.cache.lock().await.clear();
    }
}

/// Whether `token` is a JWT whose `exp` claim is at or before `now` (epoch seconds).
///
/// Tokens that are not JWTs, or carry no `exp`, are never considered expired.
#[must_use]
pub fn is_expired(token: &str, now: i64) -> bool {
    let mut parts = token.split('.');
    let (Some(_), Some(payload), Some(_)) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };

    let Ok(bytes) = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')) else {
        return false;
    };

    serde_json::from_slice::<Claims>(&bytes)
        .ok()
        .and_then(|claims| claims.exp)
        .is_some_and(|exp| exp <= now)
}
