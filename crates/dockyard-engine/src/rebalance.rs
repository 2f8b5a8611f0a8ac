//! Resource fair-sharing across a user's containers.
//!
//! Every rebalancing pass splits a fixed budget (one logical CPU, one GiB
//! of memory) equally over the user's current container set and applies
//! the shares through live resource updates, no restart needed. Shares are
//! floored integer divisions; the remainder stays unclaimed so the sum
//! never exceeds the budget.

use std::collections::HashMap;

use bollard::container::{ListContainersOptions, UpdateContainerOptions};
use bollard::models::ContainerSummary;
use dockyard_common::Result;
use tracing::{debug, instrument, warn};

use crate::manager::{engine_error, summary_id, SandboxManager, LABEL_USER};

/// Total memory budget per user: 1 GiB.
pub const MEMORY_BUDGET_BYTES: i64 = 1_073_741_824;

/// Completely-fair-scheduler quota period, in microseconds. A quota of
/// `CFS_PERIOD_US / N` grants each container a 1/N share of one CPU.
pub const CFS_PERIOD_US: i64 = 100_000;

/// Equal share of `budget` for each of `count` containers, floored.
pub fn fair_share(budget: i64, count: usize) -> i64 {
    budget / count as i64
}

impl SandboxManager {
    /// Memory pass followed by CPU pass. Each pass tolerates per-container
    /// failures; only enumeration errors abort.
    pub async fn rebalance(&self, user: &str) -> Result<()> {
        self.rebalance_memory(user).await?;
        self.rebalance_cpu(user).await
    }

    #[instrument(skip(self))]
    pub async fn rebalance_memory(&self, user: &str) -> Result<()> {
        let containers = self.containers_for_rebalance(user).await?;
        if containers.is_empty() {
            return Ok(());
        }
        let limit = fair_share(MEMORY_BUDGET_BYTES, containers.len());
        for summary in &containers {
            let id = summary_id(summary)?;
            let update = UpdateContainerOptions::<String> {
                memory: Some(limit),
                ..Default::default()
            };
            match self.docker.update_container(id, update).await {
                Ok(_) => debug!(container = %id, limit, "applied memory share"),
                Err(err) => warn!(container = %id, error = %err, "memory update failed, skipping"),
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn rebalance_cpu(&self, user: &str) -> Result<()> {
        let containers = self.containers_for_rebalance(user).await?;
        if containers.is_empty() {
            return Ok(());
        }
        let quota = fair_share(CFS_PERIOD_US, containers.len());
        for summary in &containers {
            let id = summary_id(summary)?;
            let update = UpdateContainerOptions::<String> {
                cpu_period: Some(CFS_PERIOD_US),
                cpu_quota: Some(quota),
                ..Default::default()
            };
            match self.docker.update_container(id, update).await {
                Ok(_) => debug!(container = %id, quota, period = CFS_PERIOD_US, "applied cpu share"),
                Err(err) => warn!(container = %id, error = %err, "cpu update failed, skipping"),
            }
        }
        Ok(())
    }

    async fn containers_for_rebalance(&self, user: &str) -> Result<Vec<ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{LABEL_USER}={user}")]);
        self.docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: !self.settings.rebalance_running_only,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(engine_error)
    }
}
