//! Circuit breaker: `Closed -> Open -> HalfOpen -> Closed` (§4.10),
//! protecting the exchange adapter, correlation oracle, price feed,
//! upstream advisor channel and the durable store.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

#[derive(Copy, Clone, Debug)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub rolling_window: chrono::Duration,
    pub cooldown: chrono::Duration,
    pub success_threshold: u32,
}

impl BreakerConfig {
    pub fn sane_defaults() -> Self {
        BreakerConfig {
            failure_threshold: 5,
            rolling_window: chrono::Duration::seconds(60),
            cooldown: chrono::Duration::seconds(30),
            success_threshold: 2,
        }
    }
}

/// A before/after transition, recorded for `breaker_audit`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakerTransition {
    pub breaker_name: String,
    pub before: BreakerState,
    pub after: BreakerState,
    pub at: DateTime<Utc>,
}

struct Inner {
    state: BreakerState,
    failure_timestamps: VecDeque<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    consecutive_successes: u32,
    pending: Vec<BreakerTransition>,
}

/// A named circuit breaker. Safe to share across tasks behind an `Arc`.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

/// Error returned by a breaker-guarded call: either the breaker itself
/// rejected the call (without invoking the protected function, per the
/// Breaker Correctness property), or the protected function failed.
#[derive(Debug)]
pub enum BreakerError<E> {
    Open,
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerError::Open => write!(f, "circuit breaker open"),
            BreakerError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for BreakerError<E> {}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        CircuitBreaker {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_timestamps: VecDeque::new(),
                opened_at: None,
                consecutive_successes: 0,
                pending: Vec::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker mutex poisoned").state
    }

    /// Drain transitions recorded since the last drain, for persistence to
    /// `breaker_audit` and `aegis-audit`.
    pub fn drain_transitions(&self) -> Vec<BreakerTransition> {
        std::mem::take(&mut self.inner.lock().expect("breaker mutex poisoned").pending)
    }

    fn transition(inner: &mut Inner, name: &str, to: BreakerState, at: DateTime<Utc>) {
        if inner.state == to {
            return;
        }
        let before = inner.state;
        inner.state = to;
        inner.pending.push(BreakerTransition {
            breaker_name: name.to_string(),
            before,
            after: to,
            at,
        });
        tracing::warn!(breaker = name, ?before, after = ?to, "circuit breaker transition");
    }

    /// Check whether a call is currently allowed, performing the
    /// `Open -> HalfOpen` cooldown transition if due. Does not itself
    /// invoke the protected function.
    fn gate(&self, now: DateTime<Utc>) -> Result<(), ()> {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                if now - opened_at >= self.config.cooldown {
                    Self::transition(&mut inner, &self.name, BreakerState::HalfOpen, now);
                    Ok(())
                } else {
                    Err(())
                }
            }
        }
    }

    fn on_success(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            BreakerState::Closed => {
                inner.failure_timestamps.clear();
            }
            BreakerState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.consecutive_successes = 0;
                    inner.failure_timestamps.clear();
                    inner.opened_at = None;
                    Self::transition(&mut inner, &self.name, BreakerState::Closed, now);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn on_failure(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            BreakerState::Closed => {
                inner.failure_timestamps.push_back(now);
                while let Some(&front) = inner.failure_timestamps.front() {
                    if now - front > self.config.rolling_window {
                        inner.failure_timestamps.pop_front();
                    } else {
                        break;
                    }
                }
                if inner.failure_timestamps.len() as u32 >= self.config.failure_threshold {
                    inner.opened_at = Some(now);
                    Self::transition(&mut inner, &self.name, BreakerState::Open, now);
                }
            }
            BreakerState::HalfOpen => {
                inner.consecutive_successes = 0;
                inner.opened_at = Some(now);
                Self::transition(&mut inner, &self.name, BreakerState::Open, now);
            }
            BreakerState::Open => {}
        }
    }

    /// Run `f` under this breaker's protection. If the breaker is open (and
    /// its cooldown has not elapsed), `f` is never invoked.
    pub async fn call<F, Fut, T, E>(&self, now: DateTime<Utc>, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.gate(now).map_err(|_| BreakerError::Open)?;
        match f().await {
            Ok(v) => {
                self.on_success(now);
                Ok(v)
            }
            Err(e) => {
                self.on_failure(now);
                Err(BreakerError::Inner(e))
            }
        }
    }
}
