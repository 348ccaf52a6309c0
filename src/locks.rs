use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::timeout;

/// One async mutex per symbol, created on first use and kept for the
/// process lifetime. Signal handling holds a symbol's lock for the whole
/// open sequence so the monitor and competing webhooks stay out.
pub struct SymbolLocks {
    inner: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    acquire_timeout: Duration,
}

impl SymbolLocks {
    pub fn new(acquire_timeout: Duration) -> Self {
        Self {
            inner: StdMutex::new(HashMap::new()),
            acquire_timeout,
        }
    }

    fn entry(&self, symbol: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().unwrap();
        map.entry(symbol.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Waits up to the configured timeout. None means the symbol stayed
    /// busy and the caller should report back-pressure instead of queuing.
    pub async fn acquire(&self, symbol: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = self.entry(symbol);
        match timeout(self.acquire_timeout, lock.lock_owned()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                log::warn!("[LOCK] timeout waiting for {}", symbol);
                None
            }
        }
    }

    /// Non-blocking variant for the periodic monitor. A held lock means a
    /// webhook is mid-flight, so the monitor skips the symbol this tick.
    pub fn try_acquire(&self, symbol: &str) -> Option<OwnedMutexGuard<()>> {
        self.entry(symbol).try_lock_owned().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_times_out_while_symbol_is_busy() {
        let locks = SymbolLocks::new(Duration::from_millis(20));
        let guard = locks.acquire("ETHUSDC").await;
        assert!(guard.is_some());

        let second = locks.acquire("ETHUSDC").await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn lock_is_reusable_after_release() {
        let locks = SymbolLocks::new(Duration::from_millis(20));
        drop(locks.acquire("ETHUSDC").await.unwrap());
        assert!(locks.acquire("ETHUSDC").await.is_some());
    }

    #[tokio::test]
    async fn try_acquire_never_waits() {
        let locks = SymbolLocks::new(Duration::from_secs(5));
        let _guard = locks.acquire("ETHUSDC").await.unwrap();
        assert!(locks.try_acquire("ETHUSDC").is_none());
    }

    #[tokio::test]
    async fn symbols_lock_independently() {
        let locks = SymbolLocks::new(Duration::from_millis(20));
        let _eth = locks.acquire("ETHUSDC").await.unwrap();
        assert!(locks.acquire("BTCUSDC").await.is_some());
    }
}
