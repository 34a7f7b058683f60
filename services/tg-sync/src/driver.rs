//! Loop driver for the target group sync.
//!
//! The driver:
//! - Reads the inventory and the target group concurrently
//! - Diffs the two sets and applies the plan
//! - Terminates, blocks until shutdown, or repeats, depending on the run mode
//!
//! Passes never overlap: `run_pass` borrows the driver mutably.

use std::sync::Arc;

use serde::Serialize;
use tgsync_reconcile::{diff, ApplyReport, InstanceSet, ReconciliationPlan};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::applier::Applier;
use crate::config::{Config, RunMode};
use crate::error::SyncError;
use crate::inventory::{InventoryReader, InventorySnapshot};
use crate::provider::{ComputeInventory, LoadBalancer, TargetGroupRef};
use crate::target_group::TargetGroupReader;

/// Driver lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    RunningPass,
    PassSucceeded,
    PassFailed,
    WaitingToRepeat,
    Terminated,
}

/// Result of one successful pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub target_group: TargetGroupRef,

    /// Number of desired instances.
    pub desired: usize,

    /// Number of registered targets before apply.
    pub registered: usize,

    pub plan: ReconciliationPlan,

    pub apply: ApplyReport,
}

/// Totals across a driver run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub succeeded_passes: u64,
    pub failed_passes: u64,
    pub last_report: Option<PassReport>,
}

/// Drives reconciliation passes for one target group.
pub struct Driver {
    config: Config,
    inventory: InventoryReader,
    target_groups: TargetGroupReader,
    applier: Applier,
    state: DriverState,
}

impl Driver {
    /// Create a new driver.
    pub fn new(
        config: Config,
        inventory: Arc<dyn ComputeInventory>,
        load_balancer: Arc<dyn LoadBalancer>,
    ) -> Self {
        let applier = Applier::new(Arc::clone(&load_balancer), config.concurrency);
        Self {
            inventory: InventoryReader::new(inventory),
            target_groups: TargetGroupReader::new(load_balancer),
            applier,
            config,
            state: DriverState::Idle,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DriverState {
        self.state
    }

    fn transition(&mut self, next: DriverState) {
        debug!(from = ?self.state, to = ?next, "Driver state change");
        self.state = next;
    }

    /// Run passes according to the configured mode until done or shut down.
    ///
    /// Returns an error when the config is invalid or when a pass fails
    /// outside continuous mode.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<RunSummary, SyncError> {
        if let Err(e) = self.config.validate() {
            self.transition(DriverState::Terminated);
            return Err(e.into());
        }

        info!(
            target_group = %self.config.target_group_name,
            instance_name_prefix = %self.config.instance_name_prefix,
            port = self.config.instance_port.get(),
            dry_run = self.config.dry_run,
            mode = ?self.config.mode,
            "Starting target group sync"
        );

        let mut summary = RunSummary::default();

        loop {
            self.transition(DriverState::RunningPass);

            match self.run_pass(&mut shutdown).await {
                Ok(report) => {
                    self.transition(DriverState::PassSucceeded);
                    summary.succeeded_passes += 1;
                    summary.last_report = Some(report);
                }
                Err(SyncError::Cancelled) => {
                    info!("Sync cancelled during pass");
                    self.transition(DriverState::Terminated);
                    return Ok(summary);
                }
                Err(e) => {
                    self.transition(DriverState::PassFailed);
                    summary.failed_passes += 1;
                    error!(error = %e, "Sync pass failed");

                    if !matches!(self.config.mode, RunMode::Continuous { .. }) {
                        self.transition(DriverState::Terminated);
                        return Err(e);
                    }
                }
            }

            match self.config.mode {
                RunMode::OneShot => {
                    self.transition(DriverState::Terminated);
                    return Ok(summary);
                }
                RunMode::SleepForever => {
                    if self.config.dry_run {
                        info!("Dry run, not sleeping");
                        self.transition(DriverState::Terminated);
                        return Ok(summary);
                    }

                    self.transition(DriverState::WaitingToRepeat);
                    info!("Sleeping until terminated");
                    wait_for_shutdown(&mut shutdown).await;
                    info!("Sync shutting down");
                    self.transition(DriverState::Terminated);
                    return Ok(summary);
                }
                RunMode::Continuous { interval } => {
                    self.transition(DriverState::WaitingToRepeat);
                    debug!(interval_secs = interval.as_secs(), "Waiting for next pass");

                    tokio::select! {
                        biased;
                        _ = wait_for_shutdown(&mut shutdown) => {
                            info!("Sync shutting down");
                            self.transition(DriverState::Terminated);
                            return Ok(summary);
                        }
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            }
        }
    }

    /// Perform a single reconciliation pass.
    ///
    /// Read errors abort the pass before anything is diffed. Apply errors
    /// are per item and end up in the report.
    pub async fn run_pass(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<PassReport, SyncError> {
        let (snapshot, (target_group, registered)) = self.observe(shutdown).await?;

        info!(
            target_group = %target_group.arn,
            registered = ?ids(&registered),
            "Current target group membership"
        );

        let desired = snapshot.desired_set();
        let plan = diff(&desired, &registered);
        info!(
            desired = desired.len(),
            registered = registered.len(),
            to_add = plan.to_add.len(),
            to_remove = plan.to_remove.len(),
            "Computed reconciliation plan"
        );

        let apply = self
            .applier
            .apply(
                &plan,
                &target_group,
                self.config.instance_port,
                self.config.dry_run,
            )
            .await;

        if let Some(failure) = apply.partial_failure() {
            warn!(
                failed = failure.failures.len(),
                attempted = failure.attempted,
                error = %failure,
                "Sync pass completed with failures"
            );
        } else {
            info!(
                applied = apply.applied_count(),
                planned = plan.len(),
                dry_run = apply.dry_run,
                "Sync pass completed"
            );
        }

        let report = PassReport {
            target_group,
            desired: desired.len(),
            registered: registered.len(),
            plan,
            apply,
        };
        debug!(
            report = %serde_json::to_string(&report).unwrap_or_default(),
            "Pass report"
        );

        Ok(report)
    }

    /// Read both sets, retrying transient provider errors.
    async fn observe(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(InventorySnapshot, (TargetGroupRef, InstanceSet)), SyncError> {
        let retry = &self.config.retry;
        let mut attempt = 1;

        loop {
            let result = tokio::try_join!(
                async {
                    self.inventory
                        .list_desired_instances(&self.config.instance_name_prefix)
                        .await
                        .map_err(SyncError::from)
                },
                self.target_groups.read(&self.config.target_group_name),
            );

            match result {
                Ok(observed) => return Ok(observed),
                Err(e) if e.is_transient() && retry.should_retry(attempt) => {
                    let delay = retry.backoff(attempt);
                    warn!(
                        attempt,
                        max_attempts = retry.max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Read phase failed, retrying"
                    );

                    tokio::select! {
                        biased;
                        _ = wait_for_shutdown(shutdown) => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn ids(set: &InstanceSet) -> Vec<&str> {
    set.iter().map(|id| id.as_str()).collect()
}

/// Resolve once shutdown has been signalled.
///
/// If the sender is dropped no shutdown can ever arrive, so this never resolves.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
