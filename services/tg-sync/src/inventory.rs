//! Inventory reader: which instances belong in the target group.

use std::collections::BTreeMap;
use std::sync::Arc;

use tgsync_reconcile::{InstanceId, InstanceSet};
use tracing::debug;

use crate::provider::{ComputeInventory, Instance, InstanceFilter, ProviderError};

/// Desired instances for one pass.
#[derive(Debug, Clone, Default)]
pub struct InventorySnapshot {
    /// Matching running instances by id.
    pub instances: BTreeMap<InstanceId, Instance>,
}

impl InventorySnapshot {
    /// The desired set.
    pub fn desired_set(&self) -> InstanceSet {
        self.instances.keys().cloned().collect()
    }

    /// Number of desired instances.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Returns true if nothing matched.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Reads the desired set from the compute inventory.
pub struct InventoryReader {
    inventory: Arc<dyn ComputeInventory>,
}

impl InventoryReader {
    /// Create a new inventory reader.
    pub fn new(inventory: Arc<dyn ComputeInventory>) -> Self {
        Self { inventory }
    }

    /// List running instances whose name starts with `prefix`.
    ///
    /// The provider filters server-side with the prefix escaped, so `*` and
    /// `?` in it are literal; records that still fail the predicate are
    /// dropped so the desired set is exact.
    pub async fn list_desired_instances(
        &self,
        prefix: &str,
    ) -> Result<InventorySnapshot, ProviderError> {
        let filter = InstanceFilter::running_with_prefix(prefix);
        let found = self.inventory.describe_instances(&filter).await?;
        let total = found.len();

        let instances: BTreeMap<InstanceId, Instance> = found
            .into_iter()
            .filter(|instance| instance.is_desired(prefix))
            .map(|instance| (instance.id.clone(), instance))
            .collect();

        for instance in instances.values() {
            debug!(
                instance_id = %instance.id,
                name = %instance.name,
                state = %instance.state,
                "Desired instance"
            );
        }

        debug!(
            prefix,
            returned = total,
            desired = instances.len(),
            "Inventory read"
        );

        Ok(InventorySnapshot { instances })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::InMemoryProvider;
    use crate::provider::InstanceState;

    #[tokio::test]
    async fn test_lists_running_instances_with_prefix() {
        let provider = Arc::new(InMemoryProvider::new());
        provider.add_instance("i-1", "web-1", InstanceState::Running);
        provider.add_instance("i-2", "web-2", InstanceState::from_name("stopped"));
        provider.add_instance("i-3", "api-1", InstanceState::Running);
        provider.add_instance("i-4", "web-3", InstanceState::Running);

        let reader = InventoryReader::new(provider);
        let snapshot = reader.list_desired_instances("web-").await.unwrap();

        let ids: Vec<&str> = snapshot.instances.keys().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["i-1", "i-4"]);
        assert_eq!(snapshot.desired_set().len(), 2);
        assert_eq!(snapshot.instances[&InstanceId::from("i-1")].name, "web-1");
    }

    #[tokio::test]
    async fn test_prefix_wildcards_match_literally() {
        let provider = Arc::new(InMemoryProvider::new());
        provider.add_instance("i-1", "web*1", InstanceState::Running);
        provider.add_instance("i-2", "web-1", InstanceState::Running);
        provider.add_instance("i-3", "webby", InstanceState::Running);

        let reader = InventoryReader::new(provider);
        let snapshot = reader.list_desired_instances("web*").await.unwrap();

        assert_eq!(
            snapshot.desired_set(),
            InstanceSet::from([InstanceId::from("i-1")])
        );
    }

    #[tokio::test]
    async fn test_propagates_provider_errors() {
        let provider = Arc::new(InMemoryProvider::new());
        provider.fail_inventory(ProviderError::Unauthorized("expired token".into()));

        let reader = InventoryReader::new(provider);
        let err = reader.list_desired_instances("web-").await.unwrap_err();
        assert_eq!(err, ProviderError::Unauthorized("expired token".into()));
    }
}
