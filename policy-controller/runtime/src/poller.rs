//! Per-account inventory pollers.
//!
//! Each managed account gets at most one lightweight periodic task with its
//! own cancellation token. Shutdown drains every poller before the rest of
//! the runtime tears down.

use ahash::AHashMap as HashMap;
use std::{future::Future, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct PollTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the account-to-poller map; at most one poller per account.
#[derive(Default)]
pub struct Poller {
    tasks: HashMap<String, PollTask>,
}

impl Poller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a poller for an account. Returns false (without side effects)
    /// when the account already has one.
    pub fn add_account<F, Fut>(&mut self, account: &str, interval: Duration, mut poll: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        if self.tasks.contains_key(account) {
            return false;
        }
        let token = CancellationToken::new();
        let task_token = token.clone();
        let task_account = account.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => {
                        debug!(account = %task_account, "poller cancelled");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(error) = poll().await {
                            warn!(account = %task_account, %error, "inventory poll failed");
                        }
                    }
                }
            }
        });
        self.tasks
            .insert(account.to_string(), PollTask { token, handle });
        true
    }

    /// Cancels and forgets an account's poller.
    pub async fn remove_account(&mut self, account: &str) -> bool {
        match self.tasks.remove(account) {
            Some(task) => {
                task.token.cancel();
                let _ = task.handle.await;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, account: &str) -> bool {
        self.tasks.contains_key(account)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Cancels every poller and waits for each task to exit.
    pub async fn shutdown(&mut self) {
        for task in self.tasks.values() {
            task.token.cancel();
        }
        for (account, task) in self.tasks.drain() {
            if task.handle.await.is_err() {
                warn!(account = %account, "poller task panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    #[tokio::test(start_paused = true)]
    async fn one_poller_per_account() {
        let mut poller = Poller::new();
        let ticks = Arc::new(AtomicU32::new(0));

        let counter = ticks.clone();
        assert!(poller.add_account("acct", Duration::from_secs(60), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));
        assert!(
            !poller.add_account("acct", Duration::from_secs(60), || async { Ok(()) }),
            "second poller for the same account must be rejected"
        );
        assert_eq!(poller.len(), 1);

        for _ in 0..121 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }
        assert!(ticks.load(Ordering::SeqCst) >= 2);

        assert!(poller.remove_account("acct").await);
        assert!(poller.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_all_pollers() {
        let mut poller = Poller::new();
        for account in ["a", "b", "c"] {
            poller.add_account(account, Duration::from_secs(60), || async { Ok(()) });
        }
        assert_eq!(poller.len(), 3);
        poller.shutdown().await;
        assert!(poller.is_empty());
    }
}
