//! Collaborator interfaces for the compute and load balancer APIs.
//!
//! The sync loop only talks to the cloud through these traits:
//! - `ComputeInventory` lists instances by name prefix and state
//! - `LoadBalancer` resolves target groups and mutates their membership
//!
//! `AwsProvider` implements both against EC2 and ELBv2; `InMemoryProvider`
//! implements both for tests.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use tgsync_reconcile::{InstanceId, Port};
use thiserror::Error;

/// Tag key holding the instance name.
pub const NAME_TAG: &str = "Name";

/// Provider API errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The provider rate limited the request.
    #[error("request throttled: {0}")]
    Throttled(String),

    /// Credentials were rejected or lack permission.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The named target group does not exist.
    #[error("target group not found: {0}")]
    TargetGroupNotFound(String),

    /// The target is not valid for the group (terminated, wrong VPC, not registered).
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// The request never got a response.
    #[error("transport error: {0}")]
    Transport(String),

    /// Any other service error.
    #[error("provider api error: {0}")]
    Api(String),
}

impl ProviderError {
    /// Returns true if the same call may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Throttled(_) | Self::Transport(_))
    }
}

/// Instance lifecycle state, as far as the sync loop cares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Running,
    Other(String),
}

impl InstanceState {
    /// Parse a provider state name.
    pub fn from_name(name: &str) -> Self {
        match name {
            "running" => Self::Running,
            other => Self::Other(other.to_string()),
        }
    }

    /// Returns true if the instance is running.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

/// A compute instance as reported by the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    pub id: InstanceId,

    /// Value of the `Name` tag, empty if untagged.
    pub name: String,

    pub state: InstanceState,

    pub tags: BTreeMap<String, String>,
}

impl Instance {
    /// Build an instance record, deriving `name` from the `Name` tag.
    pub fn new(
        id: impl Into<InstanceId>,
        state: InstanceState,
        tags: BTreeMap<String, String>,
    ) -> Self {
        let name = tags.get(NAME_TAG).cloned().unwrap_or_default();
        Self {
            id: id.into(),
            name,
            state,
            tags,
        }
    }

    /// Returns true if this instance belongs in the target group.
    pub fn is_desired(&self, name_prefix: &str) -> bool {
        self.state.is_running() && self.name.starts_with(name_prefix)
    }
}

/// Server-side instance selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceFilter {
    /// Matches `Name` tags starting with this prefix.
    pub name_prefix: String,

    /// Only running instances when set.
    pub running_only: bool,
}

impl InstanceFilter {
    /// Running instances whose name starts with `prefix`.
    pub fn running_with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: prefix.into(),
            running_only: true,
        }
    }

    /// Wildcard pattern for the `tag:Name` filter.
    ///
    /// The prefix is matched literally: `*`, `?` and `\\` are escaped.
    pub fn name_pattern(&self) -> String {
        let mut pattern = String::with_capacity(self.name_prefix.len() + 1);
        for c in self.name_prefix.chars() {
            if matches!(c, '*' | '?' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push('*');
        pattern
    }
}

/// A resolved target group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TargetGroupRef {
    /// Provider identifier (ARN).
    pub arn: String,

    pub name: String,
}

impl fmt::Display for TargetGroupRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.arn)
    }
}

/// Registration endpoint for a target group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub id: InstanceId,
    pub port: Port,
}

/// Health entry for a registered target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetHealth {
    pub target_id: InstanceId,

    /// Provider health state name (initial, healthy, unhealthy, draining, ...).
    pub state: String,
}

/// Compute inventory interface.
#[async_trait]
pub trait ComputeInventory: Send + Sync {
    /// List instances matching the filter.
    async fn describe_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<Instance>, ProviderError>;
}

/// Load balancer interface.
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// List target groups with exactly these names.
    async fn describe_target_groups(
        &self,
        names: &[String],
    ) -> Result<Vec<TargetGroupRef>, ProviderError>;

    /// List registered targets of a group with their health.
    async fn describe_target_health(
        &self,
        target_group: &TargetGroupRef,
    ) -> Result<Vec<TargetHealth>, ProviderError>;

    /// Register targets with a group.
    async fn register_targets(
        &self,
        target_group: &TargetGroupRef,
        targets: &[Target],
    ) -> Result<(), ProviderError>;

    /// Deregister targets from a group.
    async fn deregister_targets(
        &self,
        target_group: &TargetGroupRef,
        targets: &[Target],
    ) -> Result<(), ProviderError>;
}
