//! Runtime wiring for the cloud-network policy controller.
//!
//! Cloud-provider plugins construct the adapter and inventory handles,
//! build the input streams, and hand everything to [`Args::build`]; the
//! returned [`Runtime`] owns the reconciler task, the account pollers, and
//! the readiness/status surfaces.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod poller;
pub mod retry;
pub mod sync_status;

pub use self::{
    poller::Poller,
    retry::{retry_with_backoff, RetryConfig},
    sync_status::{ControllerKind, SyncStatus},
};

use anyhow::Result;
use clap::Parser;
use cloudnet_policy_controller_core::{
    CloudSecurityInterface, Inventory, DEFAULT_RESOURCE_PREFIX,
};
use cloudnet_policy_controller_index::{metrics, status, InputWatches, Reconciler, SyncConfig};
use prometheus_client::registry::Registry;
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(
    name = "cloudnet-policy-controller",
    about = "Reconciles declared network policies against cloud security groups"
)]
pub struct Args {
    #[clap(long, default_value = "info", env = "CLOUDNET_POLICY_CONTROLLER_LOG")]
    log_level: String,

    /// Seconds between periodic full cloud syncs.
    #[clap(long, default_value_t = 300)]
    cloud_sync_interval: u64,

    /// Prefix carried by every security group this controller creates.
    #[clap(long, default_value = DEFAULT_RESOURCE_PREFIX)]
    cloud_resource_prefix: String,

    /// Bookmarks required on the policy inputs before the first sync.
    #[clap(long, default_value_t = 3)]
    np_sync_ready_bookmark_cnt: usize,

    /// Seconds a dependent controller waits for its prerequisites.
    #[clap(long, default_value_t = 30)]
    init_timeout: u64,
}

impl Args {
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            cloud_sync_interval: Duration::from_secs(self.cloud_sync_interval),
            np_sync_ready_bookmark_cnt: self.np_sync_ready_bookmark_cnt,
        }
    }

    pub fn cloud_resource_prefix(&self) -> &str {
        &self.cloud_resource_prefix
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout)
    }

    /// Initializes tracing from `--log-level` / the environment.
    pub fn init_tracing(&self) -> Result<()> {
        let filter = EnvFilter::try_new(&self.log_level)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|error| anyhow::anyhow!("failed to initialize tracing: {}", error))?;
        Ok(())
    }

    /// Spawns the reconciler over the provided adapter, inventory, and
    /// input streams.
    pub fn build(
        self,
        cloud: Arc<dyn CloudSecurityInterface>,
        inventory: Arc<dyn Inventory>,
        watches: InputWatches,
    ) -> Runtime {
        let (status_writer, status_reader) = status::pair();
        let (ready_tx, ready_rx) = watch::channel(false);

        let reconciler = Reconciler::new(cloud, inventory, self.sync_config(), status_writer);

        let mut registry = Registry::default();
        metrics::register(&mut registry, reconciler.sizes());

        let task = tokio::spawn(reconciler.run(watches, ready_tx));

        Runtime {
            status: status_reader,
            ready: ready_rx,
            pollers: Poller::new(),
            sync_status: SyncStatus::new(),
            metrics: registry,
            init_timeout: Duration::from_secs(self.init_timeout),
            task,
        }
    }
}

/// A running controller: the reconciler task plus its ancillary state.
pub struct Runtime {
    /// The per-VM policy status surface served by the aggregated API.
    pub status: status::Reader,
    /// Flips to true after the first cloud sync completes.
    pub ready: watch::Receiver<bool>,
    /// Per-account inventory pollers.
    pub pollers: Poller,
    /// Controller initialization gating.
    pub sync_status: SyncStatus,
    /// Prometheus registry carrying the index-size gauges.
    pub metrics: Registry,
    init_timeout: Duration,
    task: JoinHandle<anyhow::Error>,
}

impl Runtime {
    pub fn init_timeout(&self) -> Duration {
        self.init_timeout
    }

    /// Runs until the reconciler fails or a shutdown signal arrives, then
    /// drains pollers before returning.
    pub async fn run(mut self) -> Result<()> {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                self.shutdown().await
            }
            result = &mut self.task => {
                match result {
                    Ok(error) => warn!(%error, "reconciler exited"),
                    Err(error) => warn!(%error, "reconciler task failed"),
                }
                self.pollers.shutdown().await;
                Ok(())
            }
        }
    }

    /// Drains pollers, then stops the reconciler, then releases the rest.
    pub async fn shutdown(mut self) -> Result<()> {
        self.pollers.shutdown().await;
        self.task.abort();
        let _ = (&mut self.task).await;
        info!("controller shut down");
        Ok(())
    }
}
