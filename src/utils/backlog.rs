use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Bytes accepted for sending but not yet written out
#[derive(Debug, Default)]
pub struct Backlog {
    pending: AtomicUsize,
    closed: AtomicBool,
    drained: Notify,
}

impl Backlog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn charge(&self, bytes: usize) {
        self.pending.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn discharge(&self, bytes: usize) {
        self.pending.fetch_sub(bytes, Ordering::AcqRel);
        self.drained.notify_waiters();
    }

    /// Wakes every waiter for good; nothing will drain any further.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.drained.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Waits until `incoming` more bytes fit under `limit`.
    ///
    /// An empty backlog always admits, so a single message larger than the
    /// limit cannot stall the stream. Returns `false` once closed.
    pub async fn wait_for_room(&self, incoming: usize, limit: usize) -> bool {
        loop {
            // Registered before the check so a discharge in between is not missed.
            let drained = self.drained.notified();
            if self.is_closed() {
                return false;
            }
            let pending = self.pending();
            if pending == 0 || pending + incoming <= limit {
                return true;
            }
            drained.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn admits_while_under_limit() {
        let backlog = Backlog::new();
        backlog.charge(10);
        assert!(backlog.wait_for_room(20, 30).await);
    }

    #[tokio::test]
    async fn empty_backlog_admits_oversized_message() {
        let backlog = Backlog::new();
        assert!(backlog.wait_for_room(1000, 30).await);
    }

    #[tokio::test]
    async fn waits_until_discharged() {
        let backlog = Arc::new(Backlog::new());
        backlog.charge(25);

        let waiter = {
            let backlog = backlog.clone();
            tokio::spawn(async move { backlog.wait_for_room(10, 30).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        backlog.discharge(20);
        let admitted = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(admitted);
        assert_eq!(backlog.pending(), 5);
    }

    #[tokio::test]
    async fn close_releases_waiters() {
        let backlog = Arc::new(Backlog::new());
        backlog.charge(100);

        let waiter = {
            let backlog = backlog.clone();
            tokio::spawn(async move { backlog.wait_for_room(10, 30).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        backlog.close();
        let admitted = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(!admitted);
    }
}
