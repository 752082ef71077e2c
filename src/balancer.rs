use crate::store::{Account, Store};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalanceError {
    NoAccountsAvailable,
    Store(String),
}

impl std::fmt::Display for BalanceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoAccountsAvailable => write!(f, "no enabled accounts available"),
            Self::Store(err) => write!(f, "account store error: {err}"),
        }
    }
}

struct SnapshotCache {
    accounts: Vec<Account>,
    expires_at: Instant,
}

/// Weighted least-connections account selection over a short-lived snapshot
/// of the enabled-accounts catalog.
pub struct LoadBalancer {
    store: Store,
    cache_ttl: Duration,
    snapshot: RwLock<Option<SnapshotCache>>,
    active: RwLock<HashMap<i64, u32>>,
}

impl LoadBalancer {
    pub fn new(store: Store) -> Self {
        Self::with_cache_ttl(store, DEFAULT_CACHE_TTL)
    }

    pub fn with_cache_ttl(store: Store, cache_ttl: Duration) -> Self {
        Self {
            store,
            cache_ttl,
            snapshot: RwLock::new(None),
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Picks the account with the lowest `active / max(weight, 1)` score among
    /// enabled accounts on `channel` (empty channel matches every account)
    /// that are not excluded. Ties resolve to the earliest snapshot entry,
    /// and the snapshot is ordered by descending weight then id.
    pub async fn select(
        &self,
        channel: &str,
        exclude_ids: &HashSet<i64>,
    ) -> Result<Account, BalanceError> {
        let accounts = self.enabled_accounts().await?;
        let active = self.active.read().await;

        let mut best: Option<(&Account, f64)> = None;
        for account in accounts.iter() {
            if !exclude_ids.is_empty() && exclude_ids.contains(&account.id) {
                continue;
            }
            if !channel.is_empty() && !account.agent_mode.eq_ignore_ascii_case(channel) {
                continue;
            }
            let connections = active.get(&account.id).copied().unwrap_or(0) as f64;
            let score = connections / account.weight.max(1) as f64;
            match best {
                Some((_, best_score)) if score >= best_score => {}
                _ => best = Some((account, score)),
            }
        }
        drop(active);

        let selected = best
            .map(|(account, _)| account.clone())
            .ok_or(BalanceError::NoAccountsAvailable)?;

        let store = self.store.clone();
        let selected_id = selected.id;
        tokio::spawn(async move {
            if let Err(err) = store.increment_request_count(selected_id).await {
                tracing::warn!(account_id = selected_id, %err, "failed to persist request count");
            }
        });

        Ok(selected)
    }

    pub async fn acquire(&self, id: i64) {
        let mut active = self.active.write().await;
        *active.entry(id).or_insert(0) += 1;
    }

    pub async fn release(&self, id: i64) {
        let mut active = self.active.write().await;
        if let Some(count) = active.get_mut(&id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                active.remove(&id);
            }
        }
    }

    pub async fn active_connections(&self, id: i64) -> u32 {
        self.active.read().await.get(&id).copied().unwrap_or(0)
    }

    async fn enabled_accounts(&self) -> Result<Vec<Account>, BalanceError> {
        {
            let snapshot = self.snapshot.read().await;
            if let Some(cache) = snapshot.as_ref() {
                if !cache.accounts.is_empty() && Instant::now() < cache.expires_at {
                    return Ok(cache.accounts.clone());
                }
            }
        }
        let accounts = self
            .store
            .list_enabled_accounts()
            .await
            .map_err(BalanceError::Store)?;
        let mut snapshot = self.snapshot.write().await;
        *snapshot = Some(SnapshotCache {
            accounts: accounts.clone(),
            expires_at: Instant::now() + self.cache_ttl,
        });
        Ok(accounts)
    }
}
