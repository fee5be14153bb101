use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Counts outstanding work items so shutdown can wait for quiescence. Each
/// enqueue calls `add`, each terminal completion calls `done`; `wait` resolves
/// whenever the count is observed at zero. Unlike a join handle this tracks
/// requests, not workers, because worker tasks outlive any individual batch
/// of requests.
#[derive(Default)]
pub struct WaitGroup {
    count: AtomicUsize,
    notify: Notify,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: usize) {
        self.count.fetch_add(n, Ordering::AcqRel);
    }

    pub fn done(&self) {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "WaitGroup::done without matching add");
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }

    pub async fn wait(&self) {
        loop {
            // Register interest before checking the count, so a done() racing
            // with this check cannot be missed.
            let notified = self.notify.notified();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_immediately_when_idle() {
        let wg = WaitGroup::new();
        wg.wait().await;
    }

    #[tokio::test]
    async fn wait_blocks_until_all_done() {
        let wg = Arc::new(WaitGroup::new());
        wg.add(3);

        let waiter = {
            let wg = wg.clone();
            tokio::spawn(async move { wg.wait().await })
        };

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert!(!waiter.is_finished());
            wg.done();
        }

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait should resolve after final done")
            .unwrap();
    }

    #[tokio::test]
    async fn add_after_drain_blocks_again() {
        let wg = Arc::new(WaitGroup::new());
        wg.add(1);
        wg.done();
        wg.wait().await;

        wg.add(1);
        let waiter = {
            let wg = wg.clone();
            tokio::spawn(async move { wg.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());
        wg.done();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait should resolve")
            .unwrap();
    }
}
