use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_FAILURE_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: Vec<Instant>,
    open_until: Option<Instant>,
    probe_in_flight: bool,
}

/// One circuit per named scope (one per account). Closed counts failures over
/// a sliding window; Open rejects until cool-down; HalfOpen lets exactly one
/// probe through and settles on its outcome.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    failure_window: Duration,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            failure_window: DEFAULT_FAILURE_WINDOW,
            cooldown: DEFAULT_COOLDOWN,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: Vec::new(),
                open_until: None,
                probe_in_flight: false,
            }),
        }
    }

    #[cfg(test)]
    fn with_tuning(name: &str, threshold: u32, window: Duration, cooldown: Duration) -> Self {
        let mut breaker = Self::new(name);
        breaker.failure_threshold = threshold;
        breaker.failure_window = window;
        breaker.cooldown = cooldown;
        breaker
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }

    /// Whether a call may proceed. Moves Open to HalfOpen once the cool-down
    /// has elapsed and hands out a single probe slot.
    pub async fn allow(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled = inner
                    .open_until
                    .map(|until| Instant::now() >= until)
                    .unwrap_or(true);
                if !cooled {
                    return false;
                }
                inner.state = BreakerState::HalfOpen;
                inner.probe_in_flight = true;
                tracing::debug!(breaker = %self.name, "circuit half-open, allowing probe");
                true
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        let recovered = inner.state != BreakerState::Closed;
        inner.state = BreakerState::Closed;
        inner.failures.clear();
        inner.open_until = None;
        inner.probe_in_flight = false;
        if recovered {
            tracing::info!(breaker = %self.name, "circuit closed after success");
        }
    }

    pub async fn on_failure(&self) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.open_until = Some(now + self.cooldown);
                inner.probe_in_flight = false;
                inner.failures.clear();
                tracing::warn!(breaker = %self.name, "probe failed, circuit re-opened");
            }
            BreakerState::Closed | BreakerState::Open => {
                let window = self.failure_window;
                inner.failures.retain(|at| now.duration_since(*at) < window);
                inner.failures.push(now);
                if inner.state == BreakerState::Closed
                    && inner.failures.len() as u32 >= self.failure_threshold
                {
                    inner.state = BreakerState::Open;
                    inner.open_until = Some(now + self.cooldown);
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.failures.len(),
                        "failure threshold reached, circuit opened"
                    );
                }
            }
        }
    }
}

/// Registry of breakers keyed by scope name, created lazily with a
/// double-checked read-then-write pass.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn for_account(&self, account_name: &str) -> Arc<CircuitBreaker> {
        let scope = format!("upstream-{account_name}");
        {
            let breakers = self.breakers.read().await;
            if let Some(breaker) = breakers.get(&scope) {
                return breaker.clone();
            }
        }
        let mut breakers = self.breakers.write().await;
        if let Some(breaker) = breakers.get(&scope) {
            return breaker.clone();
        }
        let breaker = Arc::new(CircuitBreaker::new(scope.clone()));
        breakers.insert(scope, breaker.clone());
        breaker
    }

    pub async fn states(&self) -> HashMap<String, &'static str> {
        let breakers = self.breakers.read().await;
        let mut out = HashMap::with_capacity(breakers.len());
        for (name, breaker) in breakers.iter() {
            out.insert(name.clone(), breaker.state().await.as_str());
        }
        out
    }
}
