//! Live fan-out of readings to connected subscribers.
//!
//! Each subscriber gets its own bounded channel. Publishing snapshots the
//! subscriber set, releases the lock and then offers the payload to each
//! channel with a non-blocking `try_send`: a full buffer means the consumer is
//! too slow, a closed one means it went away. Either way the subscriber is
//! removed and the remaining deliveries go ahead untouched.
//!
//! A new subscriber's channel is pre-filled with the backlog (the most recent
//! stored rows, oldest first) before it joins the set, so its receiver always
//! yields the backlog ahead of any live reading.
//!
//! Persisted readings are published by the store writer after the commit,
//! keyed by row id. Registration records the highest id already present in
//! the store, and keyed publishes at or below it are skipped for that
//! subscriber: a row reaches each subscriber exactly once, either in the
//! backlog or live.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::reading::{Reading, ReadingPayload, StoredReading};
use crate::store::{Store, StoreError};

/// Why a delivery to one subscriber failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubscriberSendError {
    #[error("subscriber buffer full")]
    Full,
    #[error("subscriber disconnected")]
    Closed,
}

struct Slot {
    tx: mpsc::Sender<ReadingPayload>,
    /// Rows with an id at or below this were already in the store at
    /// registration.
    after_id: i64,
}

type SubscriberSet = HashMap<u64, Slot>;

struct Inner {
    subscribers: Mutex<SubscriberSet>,
    next_id: AtomicU64,
    buffer: usize,
    backlog: usize,
    store: Option<Arc<Store>>,
}

/// Owner of the live subscriber set. Cheap to clone.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Broadcaster {
    /// Broadcaster whose new subscribers receive up to `backlog` stored rows
    /// from `store`, with `buffer` slots for live readings.
    pub fn new(store: Arc<Store>, backlog: usize, buffer: usize) -> Self {
        Self::build(Some(store), backlog, buffer)
    }

    /// Broadcaster without a backing store: subscribers only see live readings.
    pub fn detached(buffer: usize) -> Self {
        Self::build(None, 0, buffer)
    }

    fn build(store: Option<Arc<Store>>, backlog: usize, buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
                backlog,
                store,
            }),
        }
    }

    /// Register a subscriber and queue its backlog.
    ///
    /// The backlog query and the insertion happen under the set lock, so no
    /// publish can slip in between them.
    pub fn register(&self) -> Result<LiveSubscriber, StoreError> {
        let mut subscribers = self.lock();

        let (backlog, after_id) = match &self.inner.store {
            Some(store) if self.inner.backlog > 0 => {
                let rows = store.recent_oldest_first(self.inner.backlog)?;
                let after_id = rows.last().map_or(0, |r| r.id);
                (rows, after_id)
            }
            Some(store) => (Vec::new(), store.latest()?.map_or(0, |r| r.id)),
            None => (Vec::new(), 0),
        };

        let (tx, rx) = mpsc::channel(backlog.len() + self.inner.buffer);
        for row in &backlog {
            // Capacity covers the whole backlog, so this cannot fail.
            let _ = tx.try_send(ReadingPayload::from(row));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        subscribers.insert(id, Slot { tx, after_id });
        let total = subscribers.len();
        drop(subscribers);

        info!(
            "Live subscriber #{id} registered with {} backlog readings up to row {after_id} ({total} connected)",
            backlog.len()
        );
        Ok(LiveSubscriber {
            id,
            rx,
            backlog: backlog.len(),
            broadcaster: self.clone(),
        })
    }

    /// Remove `subscriber` from the set and close its receiver.
    pub fn unregister(&self, subscriber: LiveSubscriber) {
        drop(subscriber);
    }

    fn remove(&self, id: u64) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            debug!("Live subscriber #{id} unregistered");
        }
        removed
    }

    /// Offer a reading that was never persisted to every registered
    /// subscriber. Returns how many accepted it.
    pub fn publish(&self, reading: &Reading) -> usize {
        self.fan_out(ReadingPayload::from_live(reading), None)
    }

    /// Offer a committed row to every subscriber whose backlog did not
    /// already contain it. Returns how many accepted it.
    pub fn publish_stored(&self, row: &StoredReading) -> usize {
        self.fan_out(ReadingPayload::from(row), Some(row.id))
    }

    fn fan_out(&self, payload: ReadingPayload, row_id: Option<i64>) -> usize {
        let snapshot: Vec<(u64, mpsc::Sender<ReadingPayload>)> = self
            .lock()
            .iter()
            .filter(|(_, slot)| row_id.is_none_or(|row| row > slot.after_id))
            .map(|(id, slot)| (*id, slot.tx.clone()))
            .collect();

        let mut delivered = 0;
        let mut stale = Vec::new();
        for (id, tx) in snapshot {
            match deliver(&tx, payload.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!("Dropping live subscriber #{id}: {e}");
                    stale.push(id);
                }
            }
        }
        for id in stale {
            self.remove(id);
        }
        delivered
    }

    /// Disconnect every subscriber. Their receivers drain what is buffered
    /// and then end.
    pub fn close_all(&self) -> usize {
        let mut subscribers = self.lock();
        let n = subscribers.len();
        subscribers.clear();
        if n > 0 {
            info!("Disconnected {n} live subscribers");
        }
        n
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, SubscriberSet> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn deliver(
    tx: &mpsc::Sender<ReadingPayload>,
    payload: ReadingPayload,
) -> Result<(), SubscriberSendError> {
    tx.try_send(payload).map_err(|e| match e {
        TrySendError::Full(_) => SubscriberSendError::Full,
        TrySendError::Closed(_) => SubscriberSendError::Closed,
    })
}

/// One connected live-stream consumer.
///
/// Dropping the handle unregisters it, so a transport task that exits on any
/// path (clean close, send error, panic) leaves no stale entry behind.
pub struct LiveSubscriber {
    id: u64,
    rx: mpsc::Receiver<ReadingPayload>,
    backlog: usize,
    broadcaster: Broadcaster,
}

impl LiveSubscriber {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of backlog messages queued at registration.
    pub fn backlog_len(&self) -> usize {
        self.backlog
    }

    /// Next message; `None` once the subscriber has been dropped from the set
    /// and its buffer is drained.
    pub async fn recv(&mut self) -> Option<ReadingPayload> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ReadingPayload> {
        self.rx.try_recv().ok()
    }
}

impl Drop for LiveSubscriber {
    fn drop(&mut self) {
        self.rx.close();
        self.broadcaster.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_initialized(dir.path().join("fanout.db")).unwrap();
        (dir, Arc::new(store))
    }

    fn drain(sub: &mut LiveSubscriber) -> Vec<i64> {
        let mut out = Vec::new();
        while let Some(p) = sub.try_recv() {
            out.push(p.co2);
        }
        out
    }

    // -----------------------------------------------------------------------
    // Registration and backlog
    // -----------------------------------------------------------------------

    #[test]
    fn test_register_and_drop_updates_count() {
        let b = Broadcaster::detached(4);
        let s1 = b.register().unwrap();
        let s2 = b.register().unwrap();
        assert_ne!(s1.id(), s2.id());
        assert_eq!(b.subscriber_count(), 2);
        b.unregister(s1);
        assert_eq!(b.subscriber_count(), 1);
        drop(s2);
        assert_eq!(b.subscriber_count(), 0);
    }

    #[test]
    fn test_backlog_oldest_first_then_live() {
        let (_dir, store) = temp_store();
        let mut w = store.writer().unwrap();
        for co2 in [401, 402, 403] {
            w.append(&Reading::new(21.0, 40.0, co2)).unwrap();
        }

        let b = Broadcaster::new(Arc::clone(&store), 100, 8);
        let mut sub = b.register().unwrap();
        assert_eq!(sub.backlog_len(), 3);
        assert_eq!(b.publish(&Reading::new(21.0, 40.0, 404)), 1);

        assert_eq!(drain(&mut sub), vec![401, 402, 403, 404]);
    }

    #[test]
    fn test_backlog_is_bounded() {
        let (_dir, store) = temp_store();
        let mut w = store.writer().unwrap();
        for co2 in 0..150 {
            w.append(&Reading::new(21.0, 40.0, co2)).unwrap();
        }

        let b = Broadcaster::new(Arc::clone(&store), 100, 8);
        let mut sub = b.register().unwrap();
        let got = drain(&mut sub);
        assert_eq!(got.len(), 100);
        assert_eq!(got.first(), Some(&50));
        assert_eq!(got.last(), Some(&149));
    }

    #[test]
    fn test_register_on_uninitialized_store_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("bare.db")).unwrap());
        let b = Broadcaster::new(store, 100, 8);
        assert!(matches!(b.register(), Err(StoreError::NotInitialized)));
        assert_eq!(b.subscriber_count(), 0);
    }

    // -----------------------------------------------------------------------
    // Backlog handoff against committed rows
    // -----------------------------------------------------------------------

    #[test]
    fn test_row_committed_before_register_arrives_once() {
        let (_dir, store) = temp_store();
        let mut w = store.writer().unwrap();
        let b = Broadcaster::new(Arc::clone(&store), 100, 8);

        // Commit lands, a subscriber joins, then the writer publishes.
        let row = w.append(&Reading::new(21.0, 40.0, 410)).unwrap();
        let mut late = b.register().unwrap();
        assert_eq!(late.backlog_len(), 1);
        assert_eq!(b.publish_stored(&row), 0);

        assert_eq!(drain(&mut late), vec![410]);
    }

    #[test]
    fn test_row_committed_after_register_arrives_live() {
        let (_dir, store) = temp_store();
        let mut w = store.writer().unwrap();
        w.append(&Reading::new(21.0, 40.0, 400)).unwrap();
        let b = Broadcaster::new(Arc::clone(&store), 100, 8);

        // Subscriber joins, then the commit and its publish follow.
        let mut sub = b.register().unwrap();
        let row = w.append(&Reading::new(21.0, 40.0, 410)).unwrap();
        assert_eq!(b.publish_stored(&row), 1);

        assert_eq!(drain(&mut sub), vec![400, 410]);
    }

    #[test]
    fn test_zero_backlog_still_skips_rows_already_stored() {
        let (_dir, store) = temp_store();
        let mut w = store.writer().unwrap();
        let b = Broadcaster::new(Arc::clone(&store), 0, 8);

        let before = w.append(&Reading::new(21.0, 40.0, 400)).unwrap();
        let mut sub = b.register().unwrap();
        assert_eq!(sub.backlog_len(), 0);
        let after = w.append(&Reading::new(21.0, 40.0, 410)).unwrap();

        assert_eq!(b.publish_stored(&before), 0);
        assert_eq!(b.publish_stored(&after), 1);
        assert_eq!(drain(&mut sub), vec![410]);
    }

    #[test]
    fn test_unpersisted_reading_reaches_everyone() {
        let (_dir, store) = temp_store();
        let mut w = store.writer().unwrap();
        w.append(&Reading::new(21.0, 40.0, 400)).unwrap();
        let b = Broadcaster::new(Arc::clone(&store), 100, 8);
        let mut sub = b.register().unwrap();

        assert_eq!(b.publish(&Reading::new(21.0, 40.0, 999)), 1);
        assert_eq!(drain(&mut sub), vec![400, 999]);
    }

    // -----------------------------------------------------------------------
    // Publish
    // -----------------------------------------------------------------------

    #[test]
    fn test_publish_reaches_every_subscriber() {
        let b = Broadcaster::detached(4);
        let mut subs: Vec<_> = (0..5).map(|_| b.register().unwrap()).collect();
        assert_eq!(b.publish(&Reading::new(22.5, 45.0, 410)), 5);
        for sub in &mut subs {
            assert_eq!(drain(sub), vec![410]);
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let b = Broadcaster::detached(4);
        assert_eq!(b.publish(&Reading::new(22.5, 45.0, 410)), 0);
    }

    #[test]
    fn test_slow_subscriber_is_dropped_others_unaffected() {
        let b = Broadcaster::detached(2);
        let mut slow = b.register().unwrap();
        let mut fast = b.register().unwrap();

        for co2 in [1, 2] {
            b.publish(&Reading::new(20.0, 40.0, co2));
            assert_eq!(drain(&mut fast), vec![co2]);
        }
        // slow never drained: third publish overflows it
        assert_eq!(b.publish(&Reading::new(20.0, 40.0, 3)), 1);
        assert_eq!(b.subscriber_count(), 1);
        assert_eq!(drain(&mut fast), vec![3]);

        // Buffered messages still arrive, then the stream ends.
        assert_eq!(drain(&mut slow), vec![1, 2]);
        b.publish(&Reading::new(20.0, 40.0, 4));
        assert_eq!(drain(&mut slow), Vec::<i64>::new());
        assert_eq!(drain(&mut fast), vec![4]);
    }

    #[tokio::test]
    async fn test_unregistered_subscriber_stream_ends() {
        let b = Broadcaster::detached(4);
        let mut sub = b.register().unwrap();
        b.publish(&Reading::new(20.0, 40.0, 1));
        b.close_all();
        assert_eq!(sub.recv().await.map(|p| p.co2), Some(1));
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn test_concurrent_register_unregister_during_publish() {
        let b = Broadcaster::detached(1024);
        let publisher = {
            let b = b.clone();
            std::thread::spawn(move || {
                for co2 in 0..500 {
                    b.publish(&Reading::new(20.0, 40.0, co2));
                }
            })
        };
        let churners: Vec<_> = (0..4)
            .map(|_| {
                let b = b.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let mut sub = b.register().unwrap();
                        let mut last = -1;
                        while let Some(p) = sub.try_recv() {
                            // Per-subscriber order and no duplicates.
                            assert!(p.co2 > last);
                            last = p.co2;
                        }
                        b.unregister(sub);
                    }
                })
            })
            .collect();

        publisher.join().unwrap();
        for c in churners {
            c.join().unwrap();
        }
        assert_eq!(b.subscriber_count(), 0);
    }
}
