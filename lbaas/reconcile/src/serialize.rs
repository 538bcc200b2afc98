use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use prometheus_client::metrics::gauge::Gauge;
use std::{hash::Hash, sync::Arc};

/// Admits at most one request per key at a time, in arrival order.
///
/// Each key maps to a fair async mutex: waiters are queued in the order they called
/// [`RequestSerializer::admit`] and are woken when the ticket ahead of them is dropped. Requests
/// for distinct keys never wait on one another. Entries are removed once no ticket for the key is
/// held or awaited.
#[derive(Debug)]
pub struct RequestSerializer<K> {
    slots: Arc<Mutex<HashMap<K, Slot>>>,
    waiters: Gauge,
}

#[derive(Debug)]
struct Slot {
    lock: Arc<tokio::sync::Mutex<()>>,

    /// The number of tickets held or awaited for the key.
    holders: usize,
}

/// Grants exclusive execution for a key until dropped.
#[must_use = "the request is only serialized while the ticket is held"]
#[derive(Debug)]
pub struct Ticket<K: Eq + Hash> {
    // Fields drop in order: the lock is released before the slot is vacated.
    _guard: tokio::sync::OwnedMutexGuard<()>,
    reservation: Reservation<K>,
}

/// Counts a request against its key's slot from the moment it arrives, so that an admission
/// that is cancelled while waiting still releases the slot.
#[derive(Debug)]
struct Reservation<K: Eq + Hash> {
    key: K,
    slots: Arc<Mutex<HashMap<K, Slot>>>,
    waiters: Gauge,
}

// === impl RequestSerializer ===

impl<K: Clone + Eq + Hash> RequestSerializer<K> {
    /// `waiters` tracks the number of requests holding or awaiting a ticket.
    pub fn new(waiters: Gauge) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            waiters,
        }
    }

    /// Waits until every earlier request for `key` has released its ticket.
    pub async fn admit(&self, key: K) -> Ticket<K> {
        let lock = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
                lock: Default::default(),
                holders: 0,
            });
            slot.holders += 1;
            slot.lock.clone()
        };
        self.waiters.inc();
        let reservation = Reservation {
            key,
            slots: self.slots.clone(),
            waiters: self.waiters.clone(),
        };

        let guard = lock.lock_owned().await;
        Ticket {
            _guard: guard,
            reservation,
        }
    }

    /// Returns the number of requests holding or awaiting a ticket for `key`.
    pub fn queued(&self, key: &K) -> usize {
        self.slots.lock().get(key).map_or(0, |slot| slot.holders)
    }
}

impl<K: Clone + Eq + Hash> Default for RequestSerializer<K> {
    fn default() -> Self {
        Self::new(Gauge::default())
    }
}

// === impl Ticket ===

impl<K: Eq + Hash> Ticket<K> {
    pub fn key(&self) -> &K {
        &self.reservation.key
    }
}

// === impl Reservation ===

impl<K: Eq + Hash> Drop for Reservation<K> {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.holders -= 1;
            if slot.holders == 0 {
                slots.remove(&self.key);
            }
        }
        self.waiters.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn admits_in_arrival_order() {
        let serializer = RequestSerializer::default();
        let first = serializer.admit("pool-1").await;

        let mut second = task::spawn(serializer.admit("pool-1"));
        let mut third = task::spawn(serializer.admit("pool-1"));
        assert_pending!(second.poll());
        assert_pending!(third.poll());
        assert_eq!(serializer.queued(&"pool-1"), 3);

        drop(first);
        assert!(second.is_woken());
        let second = assert_ready!(second.poll());
        assert_pending!(third.poll());

        drop(second);
        assert!(third.is_woken());
        let third = assert_ready!(third.poll());
        assert_eq!(third.key(), &"pool-1");

        drop(third);
        assert_eq!(serializer.queued(&"pool-1"), 0);
    }

    #[tokio::test]
    async fn distinct_keys_are_independent() {
        let serializer = RequestSerializer::default();
        let _a = serializer.admit("pool-1").await;
        let mut b = task::spawn(serializer.admit("pool-2"));
        assert_ready!(b.poll());
    }

    #[tokio::test]
    async fn cancelled_admission_releases_its_place() {
        let waiters = Gauge::default();
        let serializer = RequestSerializer::new(waiters.clone());
        let first = serializer.admit("pool-1").await;

        let mut cancelled = task::spawn(serializer.admit("pool-1"));
        assert_pending!(cancelled.poll());
        assert_eq!(waiters.get(), 2);
        drop(cancelled);
        assert_eq!(serializer.queued(&"pool-1"), 1);
        assert_eq!(waiters.get(), 1);

        drop(first);
        assert_eq!(serializer.queued(&"pool-1"), 0);
        assert_eq!(waiters.get(), 0);
    }

    #[tokio::test]
    async fn failed_requests_release_their_ticket() {
        async fn reconcile(serializer: &RequestSerializer<&'static str>) -> Result<(), &'static str> {
            let _ticket = serializer.admit("pool-1").await;
            Err("device fault")
        }

        let serializer = RequestSerializer::default();
        assert!(reconcile(&serializer).await.is_err());
        let mut next = task::spawn(serializer.admit("pool-1"));
        assert_ready!(next.poll());
    }

    #[tokio::test]
    async fn at_most_one_request_per_key_runs() {
        let serializer = Arc::new(RequestSerializer::default());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..8)
            .map(|_| {
                let serializer = serializer.clone();
                let running = running.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    let _ticket = serializer.admit("pool-1").await;
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    for _ in 0..3 {
                        tokio::task::yield_now().await;
                    }
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(serializer.queued(&"pool-1"), 0);
    }
}
