//! In-memory provider for testing and development.
//!
//! Simulates EC2 and ELBv2 closely enough to exercise a full pass:
//! - server-side prefix/state filtering
//! - `TargetGroupNotFound` for unknown names
//! - `InvalidTarget` when deregistering a target that is not registered
//!
//! Every mutating call is recorded, and failures can be injected per call
//! or per instance.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tgsync_reconcile::{InstanceId, InstanceSet, Port};

use crate::provider::{
    ComputeInventory, Instance, InstanceFilter, InstanceState, LoadBalancer, ProviderError, Target,
    TargetGroupRef, TargetHealth, NAME_TAG,
};

/// A recorded mutating call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Register { arn: String, target: Target },
    Deregister { arn: String, target: Target },
}

#[derive(Default)]
struct State {
    instances: Vec<Instance>,
    target_groups: Vec<TargetGroupRef>,
    /// arn -> registered targets with health state.
    registered: BTreeMap<String, BTreeMap<InstanceId, (Port, String)>>,
    inventory_failures: VecDeque<ProviderError>,
    target_group_failures: VecDeque<ProviderError>,
    register_failures: BTreeMap<InstanceId, ProviderError>,
    deregister_failures: BTreeMap<InstanceId, ProviderError>,
    calls: Vec<MockCall>,
    describe_instances_calls: usize,
}

/// In-memory compute inventory and load balancer.
#[derive(Default)]
pub struct InMemoryProvider {
    state: Mutex<State>,
}

impl InMemoryProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an instance with a `Name` tag.
    pub fn add_instance(&self, id: &str, name: &str, state: InstanceState) {
        let tags = BTreeMap::from([(NAME_TAG.to_string(), name.to_string())]);
        self.state().instances.push(Instance::new(id, state, tags));
    }

    /// Add a target group and return its reference.
    ///
    /// Names need not be unique, mirroring a misconfigured account.
    pub fn add_target_group(&self, name: &str) -> TargetGroupRef {
        let mut state = self.state();
        let target_group = TargetGroupRef {
            arn: format!(
                "arn:aws:elasticloadbalancing:us-east-1:000000000000:targetgroup/{name}/{:016x}",
                state.target_groups.len()
            ),
            name: name.to_string(),
        };
        state.target_groups.push(target_group.clone());
        state
            .registered
            .insert(target_group.arn.clone(), BTreeMap::new());
        target_group
    }

    /// Register a target directly, without recording a call.
    pub fn seed_target(&self, target_group: &TargetGroupRef, id: &str, port: Port, health: &str) {
        self.state()
            .registered
            .entry(target_group.arn.clone())
            .or_default()
            .insert(InstanceId::from(id), (port, health.to_string()));
    }

    /// Fail the next inventory read.
    pub fn fail_inventory(&self, error: ProviderError) {
        self.state().inventory_failures.push_back(error);
    }

    /// Fail the next target group lookup.
    pub fn fail_target_groups(&self, error: ProviderError) {
        self.state().target_group_failures.push_back(error);
    }

    /// Fail every register call for this instance.
    pub fn fail_register(&self, id: &str, error: ProviderError) {
        self.state()
            .register_failures
            .insert(InstanceId::from(id), error);
    }

    /// Fail every deregister call for this instance.
    pub fn fail_deregister(&self, id: &str, error: ProviderError) {
        self.state()
            .deregister_failures
            .insert(InstanceId::from(id), error);
    }

    /// Currently registered target ids.
    pub fn registered_ids(&self, target_group: &TargetGroupRef) -> InstanceSet {
        self.state()
            .registered
            .get(&target_group.arn)
            .map(|targets| targets.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Mutating calls in the order they were issued.
    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    /// Number of inventory reads.
    pub fn describe_instances_calls(&self) -> usize {
        self.state().describe_instances_calls
    }
}

#[async_trait]
impl ComputeInventory for InMemoryProvider {
    async fn describe_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<Instance>, ProviderError> {
        let mut state = self.state();
        state.describe_instances_calls += 1;
        if let Some(err) = state.inventory_failures.pop_front() {
            return Err(err);
        }

        Ok(state
            .instances
            .iter()
            .filter(|i| i.name.starts_with(&filter.name_prefix))
            .filter(|i| !filter.running_only || i.state.is_running())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl LoadBalancer for InMemoryProvider {
    async fn describe_target_groups(
        &self,
        names: &[String],
    ) -> Result<Vec<TargetGroupRef>, ProviderError> {
        let mut state = self.state();
        if let Some(err) = state.target_group_failures.pop_front() {
            return Err(err);
        }

        let found: Vec<TargetGroupRef> = state
            .target_groups
            .iter()
            .filter(|tg| names.contains(&tg.name))
            .cloned()
            .collect();

        if found.is_empty() {
            return Err(ProviderError::TargetGroupNotFound(names.join(", ")));
        }
        Ok(found)
    }

    async fn describe_target_health(
        &self,
        target_group: &TargetGroupRef,
    ) -> Result<Vec<TargetHealth>, ProviderError> {
        let state = self.state();
        let targets = state
            .registered
            .get(&target_group.arn)
            .ok_or_else(|| ProviderError::TargetGroupNotFound(target_group.arn.clone()))?;

        Ok(targets
            .iter()
            .map(|(id, (_, health))| TargetHealth {
                target_id: id.clone(),
                state: health.clone(),
            })
            .collect())
    }

    async fn register_targets(
        &self,
        target_group: &TargetGroupRef,
        targets: &[Target],
    ) -> Result<(), ProviderError> {
        let mut state = self.state();
        for target in targets {
            state.calls.push(MockCall::Register {
                arn: target_group.arn.clone(),
                target: target.clone(),
            });
        }

        if let Some(err) = targets
            .iter()
            .find_map(|t| state.register_failures.get(&t.id).cloned())
        {
            return Err(err);
        }

        let registered = state
            .registered
            .get_mut(&target_group.arn)
            .ok_or_else(|| ProviderError::TargetGroupNotFound(target_group.arn.clone()))?;
        for target in targets {
            registered
                .entry(target.id.clone())
                .or_insert_with(|| (target.port, "initial".to_string()));
        }
        Ok(())
    }

    async fn deregister_targets(
        &self,
        target_group: &TargetGroupRef,
        targets: &[Target],
    ) -> Result<(), ProviderError> {
        let mut state = self.state();
        for target in targets {
            state.calls.push(MockCall::Deregister {
                arn: target_group.arn.clone(),
                target: target.clone(),
            });
        }

        if let Some(err) = targets
            .iter()
            .find_map(|t| state.deregister_failures.get(&t.id).cloned())
        {
            return Err(err);
        }

        let registered = state
            .registered
            .get_mut(&target_group.arn)
            .ok_or_else(|| ProviderError::TargetGroupNotFound(target_group.arn.clone()))?;
        if let Some(missing) = targets.iter().find(|t| !registered.contains_key(&t.id)) {
            return Err(ProviderError::InvalidTarget(format!(
                "target {} is not registered",
                missing.id
            )));
        }
        for target in targets {
            registered.remove(&target.id);
        }
        Ok(())
    }
}
