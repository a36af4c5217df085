use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Regions sampled when none are configured.
pub const DEFAULT_REGIONS: &[&str] = &[
    "us-east-1",
    "us-west-2",
    "us-west-1",
    "eu-west-1",
    "eu-central-1",
    "ap-southeast-1",
    "ap-northeast-1",
    "ap-southeast-2",
    "ap-northeast-2",
    "sa-east-1",
];

/// Compute instance states that no longer count toward inventory.
const INACTIVE_STATES: &[&str] = &["terminated", "stopped"];

#[derive(Debug, Error)]
#[error("{service} inventory in {region} failed: {message}")]
pub struct InventoryError {
    pub service: &'static str,
    pub region: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ComputeInstance {
    pub instance_type: String,
    pub state: String,
}

#[derive(Debug, Clone)]
pub struct DatabaseInstance {
    pub instance_class: String,
}

/// Enumerates instances in one region. Implemented by the cloud API clients.
pub trait InventorySource: Send + Sync {
    fn compute_instances(
        &self,
        region: &str,
    ) -> impl Future<Output = Result<Vec<ComputeInstance>, InventoryError>> + Send;

    fn database_instances(
        &self,
        region: &str,
    ) -> impl Future<Output = Result<Vec<DatabaseInstance>, InventoryError>> + Send;
}

/// Running instance count per instance type.
pub fn count_compute_types(instances: &[ComputeInstance]) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for instance in instances
        .iter()
        .filter(|i| !INACTIVE_STATES.contains(&i.state.as_str()))
    {
        *counts.entry(instance.instance_type.clone()).or_insert(0) += 1;
    }
    counts
}

pub fn count_database_classes(instances: &[DatabaseInstance]) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for instance in instances {
        *counts.entry(instance.instance_class.clone()).or_insert(0) += 1;
    }
    counts
}

pub fn compute_record(region: &str, instance_type: &str, count: u64, timestamp: u64) -> String {
    format!("aws.{region}.instance_types.ec2.{instance_type} {count} {timestamp}")
}

pub fn database_record(region: &str, instance_class: &str, count: u64, timestamp: u64) -> String {
    format!("aws.{region}.instance_types.{instance_class} {count} {timestamp}")
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Samples every region from an [`InventorySource`] and pushes the resulting
/// records to the relay, one batch per region.
///
/// The binary does not start one: it has no built-in cloud API client.
/// Embedders pair a source with [`crate::relay::Relay::records_sender`] and
/// spawn [`Gatherer::run`] beside the relay.
pub struct Gatherer<I> {
    source: I,
    regions: Vec<String>,
    tx: mpsc::Sender<Vec<String>>,
}

impl<I: InventorySource> Gatherer<I> {
    pub fn new(source: I, regions: Vec<String>, tx: mpsc::Sender<Vec<String>>) -> Self {
        let regions = if regions.is_empty() {
            DEFAULT_REGIONS.iter().map(|r| (*r).to_owned()).collect()
        } else {
            regions
        };
        Self {
            source,
            regions,
            tx,
        }
    }

    /// One pass over all regions. A failing region is logged and skipped.
    /// Returns the number of records handed to the relay.
    pub async fn gather_once(&self) -> usize {
        let mut pushed = 0;

        for region in &self.regions {
            let timestamp = unix_now();
            let mut records = Vec::new();

            match self.source.compute_instances(region).await {
                Ok(instances) => records.extend(
                    count_compute_types(&instances)
                        .iter()
                        .map(|(kind, count)| compute_record(region, kind, *count, timestamp)),
                ),
                Err(e) => warn!(error = %e, "skipping compute inventory"),
            }

            match self.source.database_instances(region).await {
                Ok(instances) => records.extend(
                    count_database_classes(&instances)
                        .iter()
                        .map(|(class, count)| database_record(region, class, *count, timestamp)),
                ),
                Err(e) => warn!(error = %e, "skipping database inventory"),
            }

            if records.is_empty() {
                continue;
            }

            let count = records.len();
            if self.tx.send(records).await.is_err() {
                debug!("relay closed, stopping inventory pass");
                break;
            }
            pushed += count;
        }

        pushed
    }

    /// Gather immediately, then every `every`, until `cancel` fires.
    pub async fn run(self, every: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let pushed = self.gather_once().await;
                    debug!(records = pushed, "inventory pass complete");
                }
                _ = cancel.cancelled() => break,
            }
        }
    }
}
