//! Applies a reconciliation plan to the target group.
//!
//! Each register/deregister is its own provider call. Calls run with a
//! bounded concurrency limit, and a failed item never stops the rest of the
//! plan; its outcome lands in the report instead.

use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use tgsync_reconcile::{ApplyReport, InstanceId, ItemOutcome, Operation, Port, ReconciliationPlan};
use tracing::{debug, info, warn};

use crate::provider::{LoadBalancer, ProviderError, Target, TargetGroupRef};

/// Issues register/deregister calls for a plan.
pub struct Applier {
    load_balancer: Arc<dyn LoadBalancer>,
    concurrency: usize,
}

impl Applier {
    /// Create a new applier with at most `concurrency` calls in flight.
    pub fn new(load_balancer: Arc<dyn LoadBalancer>, concurrency: usize) -> Self {
        Self {
            load_balancer,
            concurrency: concurrency.max(1),
        }
    }

    /// Apply `plan` to `target_group`.
    ///
    /// With `dry_run` no mutating call is made and every item is reported
    /// as `WouldApply`.
    pub async fn apply(
        &self,
        plan: &ReconciliationPlan,
        target_group: &TargetGroupRef,
        port: Port,
        dry_run: bool,
    ) -> ApplyReport {
        let mut report = ApplyReport::new(dry_run);

        if dry_run {
            for (operation, id) in plan.operations() {
                info!(
                    %operation,
                    instance_id = %id,
                    target_group = %target_group.arn,
                    port = port.get(),
                    "[DRY RUN] Skipping target change"
                );
                report.record(operation, id.clone(), ItemOutcome::WouldApply);
            }
            return report;
        }

        let results: Vec<(Operation, InstanceId, ItemOutcome)> = stream::iter(plan.operations())
            .map(|(operation, id)| self.apply_one(operation, id, target_group, port))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (operation, id, outcome) in results {
            report.record(operation, id, outcome);
        }
        report
    }

    async fn apply_one(
        &self,
        operation: Operation,
        id: &InstanceId,
        target_group: &TargetGroupRef,
        port: Port,
    ) -> (Operation, InstanceId, ItemOutcome) {
        let target = Target {
            id: id.clone(),
            port,
        };
        let targets = std::slice::from_ref(&target);

        let result = match operation {
            Operation::Register => {
                info!(
                    instance_id = %id,
                    target_group = %target_group.arn,
                    port = port.get(),
                    "Adding instance to target group"
                );
                self.load_balancer
                    .register_targets(target_group, targets)
                    .await
            }
            Operation::Deregister => {
                info!(
                    instance_id = %id,
                    target_group = %target_group.arn,
                    port = port.get(),
                    "Removing instance from target group"
                );
                self.load_balancer
                    .deregister_targets(target_group, targets)
                    .await
            }
        };

        let outcome = match result {
            Ok(()) => ItemOutcome::Applied,
            // Already gone: the desired end state holds.
            Err(ProviderError::InvalidTarget(reason)) if operation == Operation::Deregister => {
                debug!(instance_id = %id, reason = %reason, "Target already deregistered");
                ItemOutcome::Applied
            }
            Err(e) => {
                warn!(
                    %operation,
                    instance_id = %id,
                    target_group = %target_group.arn,
                    error = %e,
                    "Target change failed"
                );
                ItemOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        (operation, target.id, outcome)
    }
}
