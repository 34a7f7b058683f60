//! Target group reader: which instances are registered right now.

use std::sync::Arc;

use tgsync_reconcile::InstanceSet;
use tracing::debug;

use crate::error::{SyncError, TargetGroupResolutionError};
use crate::provider::{LoadBalancer, ProviderError, TargetGroupRef};

/// Resolves the configured target group and reads its membership.
pub struct TargetGroupReader {
    load_balancer: Arc<dyn LoadBalancer>,
}

impl TargetGroupReader {
    /// Create a new target group reader.
    pub fn new(load_balancer: Arc<dyn LoadBalancer>) -> Self {
        Self { load_balancer }
    }

    /// Resolve `name` to exactly one target group.
    ///
    /// Zero or several matches fail the pass; the reader never picks one.
    pub async fn resolve_target_group(&self, name: &str) -> Result<TargetGroupRef, SyncError> {
        let matches = match self
            .load_balancer
            .describe_target_groups(&[name.to_string()])
            .await
        {
            Ok(matches) => matches,
            Err(ProviderError::TargetGroupNotFound(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(exactly_one(name, matches)?)
    }

    /// List registered target ids in any health state.
    pub async fn list_registered_targets(
        &self,
        target_group: &TargetGroupRef,
    ) -> Result<InstanceSet, ProviderError> {
        let health = self
            .load_balancer
            .describe_target_health(target_group)
            .await?;

        Ok(health
            .into_iter()
            .map(|entry| {
                debug!(
                    target_group = %target_group.name,
                    target_id = %entry.target_id,
                    health = %entry.state,
                    "Registered target"
                );
                entry.target_id
            })
            .collect())
    }

    /// Resolve the group and read its membership.
    pub async fn read(&self, name: &str) -> Result<(TargetGroupRef, InstanceSet), SyncError> {
        let target_group = self.resolve_target_group(name).await?;
        let registered = self.list_registered_targets(&target_group).await?;
        Ok((target_group, registered))
    }
}

fn exactly_one(
    name: &str,
    matches: Vec<TargetGroupRef>,
) -> Result<TargetGroupRef, TargetGroupResolutionError> {
    let mut iter = matches.into_iter();
    match (iter.next(), iter.next()) {
        (Some(only), None) => Ok(only),
        (None, _) => Err(TargetGroupResolutionError::Missing {
            name: name.to_string(),
        }),
        (Some(first), Some(second)) => Err(TargetGroupResolutionError::Ambiguous {
            name: name.to_string(),
            arns: [first, second]
                .into_iter()
                .chain(iter)
                .map(|tg| tg.arn)
                .collect(),
        }),
    }
}
