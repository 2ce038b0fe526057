//! Call coalescing.
//!
//! Callers are grouped by [`Fingerprint`]. The first caller of a group creates a slot, holds
//! its lock while the real call is in flight and stores the result under the slot's
//! [`LockToken`]. Callers that queued on the same slot meanwhile find that result and return
//! it without calling again.
//!
//! A successful call drops the fingerprint mapping right away, so a caller arriving later gets
//! a fresh slot and a fresh call. A failed or cancelled call keeps it while other callers still
//! wait on the slot: they and any newcomer line up behind the same lock, one call at a time.
//! The mapping goes away with the last of them. Cached results are keyed by token, never by
//! fingerprint, and evicted by a background task once the expiry elapsed.
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tracing::debug;

/// Identity of a call: the method and its canonical parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Object keys are serialized in sorted order, so equal params always give the same key.
    pub fn new(method: &str, params: &Value) -> Self {
        Self(format!("{method}.{params}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Opaque identity of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(u64);

struct Slot {
    token: LockToken,
    lock: tokio::sync::Mutex<()>,
}

struct Entry {
    slot: Arc<Slot>,
    /// Callers holding a [`Claim`] on the slot.
    claims: usize,
}

/// A caller's hold on a slot, given up on drop however the caller ends.
struct Claim<'a, T> {
    coalescer: &'a Coalescer<T>,
    key: Fingerprint,
    slot: Arc<Slot>,
}

impl<T> Drop for Claim<'_, T> {
    fn drop(&mut self) {
        self.coalescer.unclaim(&self.key, &self.slot);
    }
}

pub struct Coalescer<T> {
    expiry: Duration,
    next_token: AtomicU64,
    locks: Mutex<HashMap<Fingerprint, Entry>>,
    results: Arc<Mutex<HashMap<LockToken, Arc<T>>>>,
}

impl<T> std::fmt::Debug for Coalescer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coalescer")
            .field("expiry", &self.expiry)
            .field("in_flight", &self.in_flight())
            .field("cached", &self.cached())
            .finish()
    }
}

impl<T> Coalescer<T> {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            next_token: AtomicU64::new(0),
            locks: Mutex::new(HashMap::new()),
            results: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Number of fingerprints with a call in flight or queued.
    pub fn in_flight(&self) -> usize {
        lock(&self.locks).len()
    }

    /// Number of results waiting for eviction.
    pub fn cached(&self) -> usize {
        lock(&self.results).len()
    }

    fn claim(&self, key: &Fingerprint) -> Claim<'_, T> {
        let mut locks = lock(&self.locks);
        let entry = locks.entry(key.clone()).or_insert_with(|| Entry {
            slot: Arc::new(Slot {
                token: LockToken(self.next_token.fetch_add(1, Ordering::Relaxed)),
                lock: tokio::sync::Mutex::new(()),
            }),
            claims: 0,
        });
        entry.claims += 1;

        Claim {
            coalescer: self,
            key: key.clone(),
            slot: Arc::clone(&entry.slot),
        }
    }

    fn unclaim(&self, key: &Fingerprint, slot: &Arc<Slot>) {
        let mut locks = lock(&self.locks);
        let idle = match locks.get_mut(key) {
            Some(entry) if Arc::ptr_eq(&entry.slot, slot) => {
                entry.claims -= 1;
                entry.claims == 0
            }
            _ => false,
        };
        if idle {
            locks.remove(key);
        }
    }

    /// Drops the mapping of `slot` even if callers still wait on it.
    fn release(&self, key: &Fingerprint, slot: &Arc<Slot>) {
        let mut locks = lock(&self.locks);
        if locks
            .get(key)
            .is_some_and(|entry| Arc::ptr_eq(&entry.slot, slot))
        {
            locks.remove(key);
        }
    }

    fn lookup(&self, token: LockToken) -> Option<Arc<T>> {
        lock(&self.results).get(&token).cloned()
    }
}

impl<T: Send + Sync + 'static> Coalescer<T> {
    /// Runs `call` unless a call with the same fingerprint is already in flight, in which
    /// case its result is shared once it completes.
    ///
    /// Failures are returned to the caller that made the call only. Callers queued behind a
    /// failed call make their own attempt, one after the other.
    pub async fn run<F, Fut, E>(&self, key: Fingerprint, call: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let claim = self.claim(&key);
        let _guard = claim.slot.lock.lock().await;

        if let Some(result) = self.lookup(claim.slot.token) {
            debug!(fingerprint = key.as_str(), "Sharing result of coalesced call");
            return Ok(result);
        }

        let result = Arc::new(call().await?);
        self.store(claim.slot.token, Arc::clone(&result));
        self.release(&key, &claim.slot);
        Ok(result)
    }

    fn store(&self, token: LockToken, result: Arc<T>) {
        lock(&self.results).insert(token, result);

        let results = Arc::clone(&self.results);
        let expiry = self.expiry;
        tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            lock(&results).remove(&token);
        });
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = Fingerprint::new("catalog.Catalog.GetProduct", &json!({ "sku": "A", "n": 1 }));
        let b = Fingerprint::new("catalog.Catalog.GetProduct", &json!({ "n": 1, "sku": "A" }));
        let c = Fingerprint::new("catalog.Catalog.GetProduct", &json!({ "sku": "B", "n": 1 }));
        let d = Fingerprint::new("catalog.Catalog.ListProducts", &json!({ "sku": "A", "n": 1 }));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.as_str(), r#"catalog.Catalog.GetProduct.{"n":1,"sku":"A"}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_identical_calls_share_one_result() {
        let coalescer = Coalescer::new(Duration::from_secs(60));
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let key = Fingerprint::new("get_product", &json!({ "sku": "A" }));
        let call = move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(100)).await;
            Ok::<_, ()>(n)
        };

        let (first, second) = tokio::join!(
            coalescer.run(key.clone(), call),
            coalescer.run(key.clone(), call)
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(coalescer.in_flight(), 0);

        let third = coalescer.run(key.clone(), call).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(*third, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_fingerprints_do_not_wait_for_each_other() {
        let coalescer = Coalescer::new(Duration::from_secs(60));
        let call = |n: u32| async move {
            sleep(Duration::from_millis(100)).await;
            Ok::<_, ()>(n)
        };

        let start = tokio::time::Instant::now();
        let (a, b) = tokio::join!(
            coalescer.run(Fingerprint::new("m", &json!(1)), || call(1)),
            coalescer.run(Fingerprint::new("m", &json!(2)), || call(2))
        );

        assert_eq!((*a.unwrap(), *b.unwrap()), (1, 2));
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_are_evicted_after_expiry() {
        let coalescer = Coalescer::new(Duration::from_secs(5));
        coalescer
            .run(Fingerprint::new("m", &json!({})), || async { Ok::<_, ()>(()) })
            .await
            .unwrap();
        assert_eq!(coalescer.cached(), 1);

        sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        assert_eq!(coalescer.cached(), 0);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let coalescer = Coalescer::<u32>::new(Duration::from_secs(60));
        let key = Fingerprint::new("m", &json!({}));

        let err = coalescer
            .run(key.clone(), || async { Err::<u32, _>("unavailable") })
            .await
            .unwrap_err();

        assert_eq!(err, "unavailable");
        assert_eq!(coalescer.cached(), 0);
        assert_eq!(coalescer.in_flight(), 0);

        let ok = coalescer.run(key, || async { Ok::<_, &str>(7) }).await.unwrap();
        assert_eq!(*ok, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callers_behind_a_failed_call_take_turns() {
        let coalescer = Coalescer::<u32>::new(Duration::from_secs(60));
        let key = Fingerprint::new("m", &json!({}));
        let (active, peak, attempts) = (AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0));
        let (active, peak, attempts) = (&active, &peak, &attempts);
        let call = move |fail: bool| async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(100)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            if fail { Err("unavailable") } else { Ok(7) }
        };

        let (leader, queued, late) = tokio::join!(
            coalescer.run(key.clone(), || call(true)),
            async {
                sleep(Duration::from_millis(10)).await;
                coalescer.run(key.clone(), || call(false)).await
            },
            async {
                sleep(Duration::from_millis(105)).await;
                coalescer.run(key.clone(), || call(false)).await
            }
        );

        assert_eq!(leader.unwrap_err(), "unavailable");
        let (queued, late) = (queued.unwrap(), late.unwrap());
        assert_eq!(*queued, 7);
        assert!(Arc::ptr_eq(&queued, &late));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_call_releases_its_slot() {
        let coalescer = Coalescer::<u32>::new(Duration::from_secs(60));
        let key = Fingerprint::new("m", &json!({}));

        let slow = coalescer.run(key.clone(), || async {
            sleep(Duration::from_secs(1)).await;
            Ok::<_, ()>(1)
        });
        assert!(tokio::time::timeout(Duration::from_millis(10), slow).await.is_err());
        assert_eq!(coalescer.in_flight(), 0);

        let fresh = coalescer.run(key, || async { Ok::<_, ()>(2) }).await.unwrap();
        assert_eq!(*fresh, 2);
        assert_eq!(coalescer.in_flight(), 0);
    }
}
