use crate::config::Settings;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 100;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared outbound clients keyed by proxy configuration so keep-alive pools
/// survive across requests instead of paying a TLS handshake per call.
#[derive(Default)]
pub struct TransportPool {
    clients: RwLock<HashMap<String, Arc<reqwest::Client>>>,
}

pub fn proxy_key(settings: &Settings) -> String {
    if settings.proxy_http.is_empty() && settings.proxy_https.is_empty() {
        return "direct".to_string();
    }
    format!(
        "{}|{}|{}",
        settings.proxy_http, settings.proxy_https, settings.proxy_user
    )
}

impl TransportPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn client(&self, settings: &Settings) -> Result<Arc<reqwest::Client>, String> {
        let key = proxy_key(settings);
        {
            let clients = self.clients.read().await;
            if let Some(client) = clients.get(&key) {
                return Ok(client.clone());
            }
        }
        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }
        let client = Arc::new(build_client(settings)?);
        clients.insert(key, client.clone());
        Ok(client)
    }
}

fn build_client(settings: &Settings) -> Result<reqwest::Client, String> {
    // A read timeout rather than a whole-request timeout: live SSE streams
    // must be able to outlast it as long as bytes keep arriving.
    let mut builder = reqwest::Client::builder()
        .user_agent(concat!("trellis/", env!("CARGO_PKG_VERSION")))
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(Duration::from_millis(settings.request_timeout_ms.max(1)))
        .tcp_keepalive(Duration::from_secs(60));
    if !settings.proxy_http.is_empty() {
        let proxy = reqwest::Proxy::http(&settings.proxy_http).map_err(|e| e.to_string())?;
        builder = builder.proxy(proxy);
    }
    if !settings.proxy_https.is_empty() {
        let proxy = reqwest::Proxy::https(&settings.proxy_https).map_err(|e| e.to_string())?;
        builder = builder.proxy(proxy);
    }
    builder.build().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_key_is_direct_without_proxies() {
        let settings = Settings::default();
        assert_eq!(proxy_key(&settings), "direct");
    }

    #[test]
    fn proxy_key_separates_configurations() {
        let mut a = Settings::default();
        a.proxy_http = "http://proxy-a:3128".to_string();
        let mut b = Settings::default();
        b.proxy_http = "http://proxy-b:3128".to_string();
        assert_ne!(proxy_key(&a), proxy_key(&b));
    }

    #[tokio::test]
    async fn pool_reuses_client_per_key() {
        let pool = TransportPool::new();
        let settings = Settings::default();
        let first = pool.client(&settings).await.unwrap();
        let second = pool.client(&settings).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
