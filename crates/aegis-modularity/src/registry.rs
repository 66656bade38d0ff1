//! Module registry: name -> active instance, swap gated by `health_check`,
//! with a `fallback_window` grace period retaining the prior instance
//! (§4.10). Generic over the instance type so it can hold the Execution
//! Router's bound backend, the correlation oracle, or any other hot
//! -swappable collaborator.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

#[derive(Debug)]
pub enum ModuleSwapRejected {
    FailedHealthCheck,
}

impl std::fmt::Display for ModuleSwapRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleSwapRejected::FailedHealthCheck => {
                write!(f, "candidate module instance failed health_check")
            }
        }
    }
}

impl std::error::Error for ModuleSwapRejected {}

/// A single named, hot-swappable module slot.
pub struct ModuleRegistry<T> {
    name: String,
    active: RwLock<Arc<T>>,
    previous: RwLock<Option<(Arc<T>, DateTime<Utc>)>>,
    fallback_window: chrono::Duration,
    swap_lock: Mutex<()>,
}

impl<T: Send + Sync + 'static> ModuleRegistry<T> {
    pub fn new(name: impl Into<String>, initial: Arc<T>, fallback_window: chrono::Duration) -> Self {
        ModuleRegistry {
            name: name.into(),
            active: RwLock::new(initial),
            previous: RwLock::new(None),
            fallback_window,
            swap_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn active(&self) -> Arc<T> {
        self.active.read().await.clone()
    }

    /// Swap in `candidate`, rejecting it if `health_check` reports failure.
    /// The previous instance is retained as a fallback for
    /// `fallback_window` after a successful swap.
    pub async fn swap<F, Fut>(
        &self,
        candidate: Arc<T>,
        health_check: F,
    ) -> Result<(), ModuleSwapRejected>
    where
        F: FnOnce(Arc<T>) -> Fut,
        Fut: Future<Output = bool>,
    {
        let _guard = self.swap_lock.lock().await;

        if !health_check(candidate.clone()).await {
            return Err(ModuleSwapRejected::FailedHealthCheck);
        }

        let now = Utc::now();
        let old = {
            let mut write = self.active.write().await;
            std::mem::replace(&mut *write, candidate)
        };
        *self.previous.write().await = Some((old, now));
        tracing::info!(module = %self.name, "module swapped");
        Ok(())
    }

    /// The previous instance, if still within its fallback window.
    pub async fn fallback(&self) -> Option<Arc<T>> {
        let previous = self.previous.read().await;
        let (instance, swapped_at) = previous.as_ref()?;
        if Utc::now() - *swapped_at <= self.fallback_window {
            Some(instance.clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn swap_rejected_on_failed_health_check() {
        let registry = ModuleRegistry::new("exchange", Arc::new(1u32), chrono::Duration::seconds(30));
        let result = registry.swap(Arc::new(2u32), |_| async { false }).await;
        assert!(matches!(result, Err(ModuleSwapRejected::FailedHealthCheck)));
        assert_eq!(*registry.active().await, 1);
    }

    #[tokio::test]
    async fn swap_succeeds_and_keeps_fallback() {
        let registry = ModuleRegistry::new("exchange", Arc::new(1u32), chrono::Duration::seconds(30));
        registry.swap(Arc::new(2u32), |_| async { true }).await.unwrap();
        assert_eq!(*registry.active().await, 2);
        assert_eq!(registry.fallback().await.map(|a| *a), Some(1));
    }

    #[tokio::test]
    async fn fallback_expires_after_window() {
        let registry = ModuleRegistry::new("exchange", Arc::new(1u32), chrono::Duration::milliseconds(1));
        registry.swap(Arc::new(2u32), |_| async { true }).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(registry.fallback().await, None);
    }
}
