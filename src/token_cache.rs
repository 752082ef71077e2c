use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

const TOKEN_EXPIRY_SKEW_SECS: i64 = 30;
const DEFAULT_TOKEN_TTL_SECS: i64 = 300;

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Per-session upstream JWT cache. Expiry comes from the token's own `exp`
/// claim minus a skew; entries are evicted lazily on read.
#[derive(Default)]
pub struct TokenCache {
    items: RwLock<HashMap<String, CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, session_id: &str) -> Option<String> {
        if session_id.is_empty() {
            return None;
        }
        {
            let items = self.items.read().await;
            match items.get(session_id) {
                Some(entry) if Utc::now() < entry.expires_at => return Some(entry.token.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        let mut items = self.items.write().await;
        if let Some(entry) = items.get(session_id) {
            if Utc::now() < entry.expires_at {
                return Some(entry.token.clone());
            }
            items.remove(session_id);
        }
        None
    }

    pub async fn put(&self, session_id: &str, token: &str) {
        if session_id.is_empty() || token.is_empty() {
            return;
        }
        let expires_at = token_expiry(token)
            .unwrap_or_else(|| Utc::now() + Duration::seconds(DEFAULT_TOKEN_TTL_SECS));
        let mut items = self.items.write().await;
        items.insert(
            session_id.to_string(),
            CachedToken {
                token: token.to_string(),
                expires_at,
            },
        );
    }
}

fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload_part = token.split('.').nth(1)?;
    let payload = URL_SAFE_NO_PAD.decode(payload_part).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&payload).ok()?;
    let exp = claims.get("exp")?.as_i64().filter(|v| *v > 0)?;
    let expires_at = DateTime::<Utc>::from_timestamp(exp, 0)?;
    Some(expires_at - Duration::seconds(TOKEN_EXPIRY_SKEW_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwt_with_exp(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#));
        format!("{header}.{payload}.sig")
    }

    #[tokio::test]
    async fn put_then_get_returns_live_token() {
        let cache = TokenCache::new();
        let token = jwt_with_exp((Utc::now() + Duration::hours(1)).timestamp());
        cache.put("sess_1", &token).await;
        assert_eq!(cache.get("sess_1").await.as_deref(), Some(token.as_str()));
    }

    #[tokio::test]
    async fn expired_token_is_evicted_on_read() {
        let cache = TokenCache::new();
        let token = jwt_with_exp((Utc::now() - Duration::hours(1)).timestamp());
        cache.put("sess_1", &token).await;
        assert!(cache.get("sess_1").await.is_none());
        // Second read hits the empty map, not a stale entry.
        assert!(cache.get("sess_1").await.is_none());
    }

    #[tokio::test]
    async fn skew_pushes_expiry_before_exp() {
        let exp = (Utc::now() + Duration::seconds(10)).timestamp();
        let expiry = token_expiry(&jwt_with_exp(exp)).unwrap();
        assert!(expiry < DateTime::<Utc>::from_timestamp(exp, 0).unwrap());
    }

    #[tokio::test]
    async fn undecodable_token_falls_back_to_short_ttl() {
        let cache = TokenCache::new();
        cache.put("sess_1", "not-a-jwt").await;
        // Still cached: the fallback TTL is in the future.
        assert_eq!(cache.get("sess_1").await.as_deref(), Some("not-a-jwt"));
    }

    #[tokio::test]
    async fn empty_session_id_is_ignored() {
        let cache = TokenCache::new();
        cache.put("", "token").await;
        assert!(cache.get("").await.is_none());
    }
}
