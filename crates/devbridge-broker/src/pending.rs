// ── Response correlation ──
//
// One entry per outstanding command id. The first response that matches
// both id and response topic wins; anything later finds no entry and is
// dropped. Expired entries are resolved as timeouts, lazily on register
// and periodically by the sweeper task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::Error;
use crate::payload::ResponsePayload;

/// What a pending command eventually resolves to.
pub type PendingResult = Result<ResponsePayload, Error>;

struct PendingResponse {
    response_topic: String,
    deadline: Instant,
    timeout: Duration,
    tx: oneshot::Sender<PendingResult>,
}

impl PendingResponse {
    fn expire(self, id: &str) {
        let _ = self.tx.send(Err(timeout_error(id, self.timeout)));
    }
}

fn timeout_error(id: &str, timeout: Duration) -> Error {
    Error::Timeout {
        id: id.to_owned(),
        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
    }
}

/// Shared table of commands awaiting a response.
#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<String, PendingResponse>>,
    /// Response topics subscribed on behalf of waiting senders, with the
    /// number of senders using each. Held across the (un)subscribe call.
    response_filters: AsyncMutex<HashMap<String, usize>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pending command. Fails if the id is already outstanding.
    pub fn register(
        &self,
        id: impl Into<String>,
        response_topic: impl Into<String>,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<PendingResult>, Error> {
        let id = id.into();
        let now = Instant::now();
        let (tx, rx) = oneshot::channel();

        let expired = {
            let mut entries = self.entries.lock();
            let expired = drain_expired(&mut entries, now);
            if entries.contains_key(&id) {
                drop(entries);
                finish_expired(expired);
                return Err(Error::DuplicateCommandId(id));
            }
            entries.insert(
                id,
                PendingResponse {
                    response_topic: response_topic.into(),
                    deadline: now + timeout,
                    timeout,
                    tx,
                },
            );
            expired
        };
        finish_expired(expired);
        Ok(rx)
    }

    /// Deliver a response. Returns `true` when it resolved an entry.
    ///
    /// A response whose topic differs from the one the command was
    /// registered with is ignored and leaves the entry in place. An entry
    /// found past its deadline resolves as a timeout instead.
    pub fn resolve(&self, topic: &str, response: ResponsePayload) -> bool {
        let entry = {
            let mut entries = self.entries.lock();
            match entries.get(&response.id) {
                Some(entry) if entry.response_topic == topic => entries.remove(&response.id),
                _ => None,
            }
        };

        let Some(entry) = entry else {
            trace!(id = %response.id, topic, "discarding uncorrelated response");
            return false;
        };

        if Instant::now() >= entry.deadline {
            debug!(id = %response.id, "response arrived after deadline");
            let id = response.id;
            entry.expire(&id);
            return false;
        }
        entry.tx.send(Ok(response)).is_ok()
    }

    /// Drop an entry without resolving it (the caller has stopped waiting).
    pub fn cancel(&self, id: &str) -> bool {
        self.entries.lock().remove(id).is_some()
    }

    /// Resolve every entry whose deadline is at or before `now` as a
    /// timeout. Returns how many were purged.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired = drain_expired(&mut self.entries.lock(), now);
        let count = expired.len();
        finish_expired(expired);
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub(crate) fn response_filters(&self) -> &AsyncMutex<HashMap<String, usize>> {
        &self.response_filters
    }

    /// Periodically purge expired entries until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = table.sweep(Instant::now());
                        if purged > 0 {
                            debug!(purged, "swept expired pending responses");
                        }
                    }
                }
            }
        })
    }
}

fn drain_expired(
    entries: &mut HashMap<String, PendingResponse>,
    now: Instant,
) -> Vec<(String, PendingResponse)> {
    let ids: Vec<String> = entries
        .iter()
        .filter(|(_, e)| e.deadline <= now)
        .map(|(id, _)| id.clone())
        .collect();
    ids.into_iter()
        .filter_map(|id| entries.remove(&id).map(|e| (id, e)))
        .collect()
}

// Senders are completed outside the lock.
fn finish_expired(expired: Vec<(String, PendingResponse)>) {
    for (id, entry) in expired {
        entry.expire(&id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::payload::Values;
    use pretty_assertions::assert_eq;

    fn ok(id: &str) -> ResponsePayload {
        ResponsePayload::success(id, Values::new())
    }

    #[tokio::test(start_paused = true)]
    async fn first_response_wins() {
        let table = PendingTable::new();
        let rx = table.register("a", "t/resp", Duration::from_secs(5)).unwrap();

        assert!(table.resolve("t/resp", ok("a")));
        assert!(!table.resolve("t/resp", ok("a")));

        let resp = rx.await.unwrap().unwrap();
        assert_eq!(resp.id, "a");
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_ids_are_rejected() {
        let table = PendingTable::new();
        let _rx = table.register("a", "t", Duration::from_secs(5)).unwrap();
        assert!(matches!(
            table.register("a", "t", Duration::from_secs(5)),
            Err(Error::DuplicateCommandId(id)) if id == "a"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_topic_does_not_resolve() {
        let table = PendingTable::new();
        let _rx = table.register("a", "t/resp", Duration::from_secs(5)).unwrap();
        assert!(!table.resolve("other/resp", ok("a")));
        assert!(table.contains("a"));
    }

    #[test]
    fn waiter_wakes_only_on_match() {
        use tokio_test::{assert_pending, assert_ready, task};

        let table = PendingTable::new();
        let mut waiter = task::spawn(table.register("a", "t/resp", Duration::from_secs(5)).unwrap());
        assert_pending!(waiter.poll());

        table.resolve("other/resp", ok("a"));
        assert!(!waiter.is_woken());
        assert_pending!(waiter.poll());

        assert!(table.resolve("t/resp", ok("a")));
        assert!(waiter.is_woken());
        let resp = assert_ready!(waiter.poll()).unwrap().unwrap();
        assert_eq!(resp.id, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_resolves_expired_as_timeout() {
        let table = PendingTable::new();
        let rx_short = table.register("short", "t", Duration::from_millis(100)).unwrap();
        let _rx_long = table.register("long", "t", Duration::from_secs(10)).unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(table.sweep(Instant::now()), 1);
        assert_eq!(table.len(), 1);

        let err = rx_short.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Timeout { ref id, timeout_ms: 100 } if id == "short"));
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_resolves_as_timeout() {
        let table = PendingTable::new();
        let rx = table.register("a", "t", Duration::from_millis(50)).unwrap();
        tokio::time::advance(Duration::from_millis(60)).await;

        assert!(!table.resolve("t", ok("a")));
        assert!(matches!(rx.await.unwrap(), Err(Error::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn register_purges_expired_entries() {
        let table = PendingTable::new();
        let rx = table.register("old", "t", Duration::from_millis(10)).unwrap();
        tokio::time::advance(Duration::from_millis(20)).await;

        let _rx = table.register("new", "t", Duration::from_secs(1)).unwrap();
        assert!(!table.contains("old"));
        assert!(matches!(rx.await.unwrap(), Err(Error::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_purges_periodically() {
        let table = Arc::new(PendingTable::new());
        let cancel = CancellationToken::new();
        let handle = table.spawn_sweeper(Duration::from_millis(100), cancel.clone());

        let rx = table.register("a", "t", Duration::from_millis(150)).unwrap();
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert!(table.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
