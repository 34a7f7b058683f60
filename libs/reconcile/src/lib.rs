//! Target group reconciliation primitives.
//!
//! This library holds the pure half of the sync loop: the identifiers it
//! compares, the diff that turns two sets into a plan, and the report an
//! applier fills in. Key concepts:
//!
//! - **Desired set**: running instances whose name matches the prefix.
//! - **Target set**: instances currently registered in the target group.
//! - **Plan**: the minimal add/remove operations that make the target set
//!   equal the desired set.
//!
//! # Invariants
//!
//! - `to_add` and `to_remove` are always disjoint
//! - Diffing is deterministic given the same inputs
//! - Nothing here performs I/O

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque instance identifier assigned by the compute provider.
///
/// No structure is assumed beyond equality and ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Wrap a provider identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for InstanceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Set of instance identifiers.
pub type InstanceSet = BTreeSet<InstanceId>;

/// Port errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    /// Port zero is not addressable.
    #[error("port must be between 1 and 65535, got {0}")]
    OutOfRange(i64),

    /// Not an integer.
    #[error("invalid port '{0}'")]
    Invalid(String),
}

/// Instance port applied uniformly to every register/deregister in a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u16")]
pub struct Port(u16);

impl Port {
    /// Create a port, rejecting zero.
    pub fn new(port: u16) -> Result<Self, PortError> {
        if port == 0 {
            return Err(PortError::OutOfRange(0));
        }
        Ok(Self(port))
    }

    /// Get the port number.
    pub fn get(&self) -> u16 {
        self.0
    }
}

impl TryFrom<i64> for Port {
    type Error = PortError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        let port = u16::try_from(value).map_err(|_| PortError::OutOfRange(value))?;
        Self::new(port)
    }
}

impl From<Port> for u16 {
    fn from(port: Port) -> Self {
        port.0
    }
}

impl FromStr for Port {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: i64 = s
            .trim()
            .parse()
            .map_err(|_| PortError::Invalid(s.to_string()))?;
        Self::try_from(value)
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operations needed to converge the target set on the desired set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationPlan {
    /// Desired but not registered.
    pub to_add: InstanceSet,

    /// Registered but not desired.
    pub to_remove: InstanceSet,
}

impl ReconciliationPlan {
    /// Returns true if there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    /// Total number of operations in the plan.
    pub fn len(&self) -> usize {
        self.to_add.len() + self.to_remove.len()
    }

    /// Iterate over every planned operation.
    pub fn operations(&self) -> impl Iterator<Item = (Operation, &InstanceId)> {
        self.to_add
            .iter()
            .map(|id| (Operation::Register, id))
            .chain(self.to_remove.iter().map(|id| (Operation::Deregister, id)))
    }
}

/// Compute the plan that turns `actual` into `desired`.
///
/// `to_add = desired - actual`, `to_remove = actual - desired`.
pub fn diff(desired: &InstanceSet, actual: &InstanceSet) -> ReconciliationPlan {
    ReconciliationPlan {
        to_add: desired.difference(actual).cloned().collect(),
        to_remove: actual.difference(desired).cloned().collect(),
    }
}

/// A mutating target group operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Register,
    Deregister,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register => f.write_str("register"),
            Self::Deregister => f.write_str("deregister"),
        }
    }
}

/// Outcome of a single planned operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    /// Dry run: the operation was planned but not issued.
    WouldApply,

    /// The provider accepted the operation.
    Applied,

    /// The provider rejected the operation.
    Failed { reason: String },
}

impl ItemOutcome {
    /// Returns true if the operation failed.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Per-item results of applying a plan.
///
/// Keyed by instance, so completion order never matters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    /// Whether mutating calls were suppressed.
    pub dry_run: bool,

    /// Register outcomes.
    pub registered: BTreeMap<InstanceId, ItemOutcome>,

    /// Deregister outcomes.
    pub deregistered: BTreeMap<InstanceId, ItemOutcome>,
}

impl ApplyReport {
    /// Create an empty report.
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Self::default()
        }
    }

    /// Record the outcome of one operation.
    pub fn record(&mut self, operation: Operation, id: InstanceId, outcome: ItemOutcome) {
        self.outcomes_mut(operation).insert(id, outcome);
    }

    /// Outcomes for one kind of operation.
    pub fn outcomes(&self, operation: Operation) -> &BTreeMap<InstanceId, ItemOutcome> {
        match operation {
            Operation::Register => &self.registered,
            Operation::Deregister => &self.deregistered,
        }
    }

    fn outcomes_mut(&mut self, operation: Operation) -> &mut BTreeMap<InstanceId, ItemOutcome> {
        match operation {
            Operation::Register => &mut self.registered,
            Operation::Deregister => &mut self.deregistered,
        }
    }

    /// Get the outcome for an instance.
    pub fn outcome(&self, operation: Operation, id: &InstanceId) -> Option<&ItemOutcome> {
        self.outcomes(operation).get(id)
    }

    /// The plan this report covers, reconstructed from its items.
    pub fn planned(&self) -> ReconciliationPlan {
        ReconciliationPlan {
            to_add: self.registered.keys().cloned().collect(),
            to_remove: self.deregistered.keys().cloned().collect(),
        }
    }

    /// Number of recorded items.
    pub fn len(&self) -> usize {
        self.registered.len() + self.deregistered.len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of items the provider accepted.
    pub fn applied_count(&self) -> usize {
        self.items()
            .filter(|(_, _, outcome)| matches!(outcome, ItemOutcome::Applied))
            .count()
    }

    /// Iterate over every recorded item.
    pub fn items(&self) -> impl Iterator<Item = (Operation, &InstanceId, &ItemOutcome)> {
        self.registered
            .iter()
            .map(|(id, o)| (Operation::Register, id, o))
            .chain(
                self.deregistered
                    .iter()
                    .map(|(id, o)| (Operation::Deregister, id, o)),
            )
    }

    /// Summarize failed items, if any.
    ///
    /// A partial failure never aborts a pass; callers log it.
    pub fn partial_failure(&self) -> Option<PartialApplyFailure> {
        let failures: Vec<FailedItem> = self
            .items()
            .filter_map(|(operation, id, outcome)| match outcome {
                ItemOutcome::Failed { reason } => Some(FailedItem {
                    operation,
                    instance_id: id.clone(),
                    reason: reason.clone(),
                }),
                _ => None,
            })
            .collect();

        if failures.is_empty() {
            return None;
        }

        Some(PartialApplyFailure {
            attempted: self.len(),
            failures,
        })
    }
}

/// One failed item in a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedItem {
    pub operation: Operation,
    pub instance_id: InstanceId,
    pub reason: String,
}

/// Some operations in a plan failed while others were attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} of {attempted} target operations failed", .failures.len())]
pub struct PartialApplyFailure {
    /// Total operations attempted.
    pub attempted: usize,

    /// The failed operations.
    pub failures: Vec<FailedItem>,
}

/// Backoff policy for retrying the observation phase of a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,

    /// Delay before the second attempt.
    pub initial_backoff: Duration,

    /// Upper bound for any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Returns true if another attempt is allowed after `attempt` (1-based) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait after `attempt` (1-based) failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// Default attempts for the observation phase.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default number of concurrent register/deregister calls.
pub const DEFAULT_APPLY_CONCURRENCY: usize = 4;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(ids: &[&str]) -> InstanceSet {
        ids.iter().map(|id| InstanceId::from(*id)).collect()
    }

    #[test]
    fn test_diff_adds_and_removes() {
        let plan = diff(&set(&["i1", "i2", "i3"]), &set(&["i2", "i3", "i4"]));
        assert_eq!(plan.to_add, set(&["i1"]));
        assert_eq!(plan.to_remove, set(&["i4"]));
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_diff_full_drain() {
        let plan = diff(&set(&[]), &set(&["i1", "i2"]));
        assert!(plan.to_add.is_empty());
        assert_eq!(plan.to_remove, set(&["i1", "i2"]));
    }

    #[test]
    fn test_diff_bootstrap() {
        let plan = diff(&set(&["i1", "i2"]), &set(&[]));
        assert_eq!(plan.to_add, set(&["i1", "i2"]));
        assert!(plan.to_remove.is_empty());
    }

    #[test]
    fn test_diff_converged() {
        let plan = diff(&set(&["i1"]), &set(&["i1"]));
        assert!(plan.is_empty());
        assert_eq!(plan.operations().count(), 0);
    }

    #[test]
    fn test_plan_operations() {
        let plan = diff(&set(&["i1"]), &set(&["i2"]));
        let ops: Vec<_> = plan.operations().collect();
        assert_eq!(
            ops,
            vec![
                (Operation::Register, &InstanceId::from("i1")),
                (Operation::Deregister, &InstanceId::from("i2")),
            ]
        );
    }

    #[test]
    fn test_port_parsing() {
        assert_eq!("8080".parse::<Port>().unwrap().get(), 8080);
        assert_eq!(" 443 ".parse::<Port>().unwrap().get(), 443);
        assert_eq!("0".parse::<Port>(), Err(PortError::OutOfRange(0)));
        assert_eq!("65536".parse::<Port>(), Err(PortError::OutOfRange(65536)));
        assert_eq!("-1".parse::<Port>(), Err(PortError::OutOfRange(-1)));
        assert!(matches!("http".parse::<Port>(), Err(PortError::Invalid(_))));
    }

    #[test]
    fn test_port_serde() {
        let port: Port = serde_json::from_str("8080").unwrap();
        assert_eq!(port.get(), 8080);
        assert!(serde_json::from_str::<Port>("0").is_err());
        assert_eq!(serde_json::to_string(&port).unwrap(), "8080");
    }

    #[test]
    fn test_report_partial_failure() {
        let mut report = ApplyReport::new(false);
        report.record(
            Operation::Register,
            "i1".into(),
            ItemOutcome::Failed {
                reason: "throttled".to_string(),
            },
        );
        report.record(Operation::Register, "i2".into(), ItemOutcome::Applied);
        report.record(Operation::Deregister, "i3".into(), ItemOutcome::Applied);

        assert_eq!(report.len(), 3);
        assert_eq!(report.applied_count(), 2);

        let failure = report.partial_failure().unwrap();
        assert_eq!(failure.attempted, 3);
        assert_eq!(failure.failures.len(), 1);
        assert_eq!(failure.failures[0].instance_id.as_str(), "i1");
        assert_eq!(failure.to_string(), "1 of 3 target operations failed");
    }

    #[test]
    fn test_report_planned_matches_plan() {
        let plan = diff(&set(&["i1", "i2"]), &set(&["i3"]));
        let mut report = ApplyReport::new(true);
        for (op, id) in plan.operations() {
            report.record(op, id.clone(), ItemOutcome::WouldApply);
        }

        assert_eq!(report.planned(), plan);
        assert!(report.partial_failure().is_none());
        assert_eq!(report.applied_count(), 0);
    }

    #[test]
    fn test_report_serializes_outcomes() {
        let mut report = ApplyReport::new(false);
        report.record(
            Operation::Deregister,
            "i-0abc".into(),
            ItemOutcome::Failed {
                reason: "denied".to_string(),
            },
        );

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["deregistered"]["i-0abc"]["status"], "failed");
        assert_eq!(json["deregistered"]["i-0abc"]["reason"], "denied");
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };

        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));

        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));

        let single = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        };
        assert!(!single.should_retry(1));
    }

    fn instance_set() -> impl Strategy<Value = InstanceSet> {
        prop::collection::btree_set("i-[0-9a-f]{2}", 0..12)
            .prop_map(|ids| ids.into_iter().map(InstanceId::from).collect())
    }

    proptest! {
        #[test]
        fn prop_diff_is_set_difference(desired in instance_set(), actual in instance_set()) {
            let plan = diff(&desired, &actual);

            let expected_add: InstanceSet = desired.difference(&actual).cloned().collect();
            let expected_remove: InstanceSet = actual.difference(&desired).cloned().collect();
            prop_assert_eq!(&plan.to_add, &expected_add);
            prop_assert_eq!(&plan.to_remove, &expected_remove);
            prop_assert!(plan.to_add.is_disjoint(&plan.to_remove));
            prop_assert!(plan.to_add.is_subset(&desired));
            prop_assert!(plan.to_remove.is_subset(&actual));
        }

        #[test]
        fn prop_applying_plan_converges(desired in instance_set(), actual in instance_set()) {
            let plan = diff(&desired, &actual);

            let mut converged = actual.clone();
            converged.extend(plan.to_add.iter().cloned());
            converged.retain(|id| !plan.to_remove.contains(id));

            prop_assert_eq!(&converged, &desired);
            prop_assert!(diff(&desired, &converged).is_empty());
        }
    }
}
