//! Controller initialization gating.
//!
//! Dependent controllers block until their prerequisites report an initial
//! sync, bounded by the configured init timeout. Process-scoped state with
//! explicit construction; nothing here is ambient.

use crate::retry::{retry_with_backoff, RetryConfig};
use ahash::AHashSet as HashSet;
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};

/// The controllers whose initial sync other controllers may wait on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ControllerKind {
    CloudProviderAccount,
    CloudEntitySelector,
    NetworkPolicy,
}

impl std::fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CloudProviderAccount => "CloudProviderAccount".fmt(f),
            Self::CloudEntitySelector => "CloudEntitySelector".fmt(f),
            Self::NetworkPolicy => "NetworkPolicy".fmt(f),
        }
    }
}

/// Tracks which controllers have completed their initial sync.
#[derive(Clone, Debug, Default)]
pub struct SyncStatus(Arc<Mutex<HashSet<ControllerKind>>>);

impl SyncStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_synced(&self, kind: ControllerKind) {
        self.0.lock().insert(kind);
    }

    pub fn reset(&self, kind: ControllerKind) {
        self.0.lock().remove(&kind);
    }

    pub fn is_synced(&self, kind: ControllerKind) -> bool {
        self.0.lock().contains(&kind)
    }

    /// Blocks until `kind` reports synced, up to `timeout`.
    pub async fn wait_until_synced(&self, kind: ControllerKind, timeout: Duration) -> Result<()> {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_elapsed: Some(timeout),
        };
        retry_with_backoff(&config, "wait-controller-sync", || async {
            if self.is_synced(kind) {
                Ok(())
            } else {
                Err(anyhow!("controller {} has not synced", kind))
            }
        })
        .await
    }
}
