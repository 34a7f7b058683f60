//! tg-sync
//!
//! Keeps the membership of one ELBv2 target group equal to the set of running
//! EC2 instances whose `Name` tag starts with a prefix.
//!
//! ## Architecture
//!
//! - **Inventory Reader**: running instances matching the prefix (desired set)
//! - **Target Group Reader**: resolves the group by name, lists registered targets
//! - **Diff Engine**: `tgsync_reconcile::diff`, pure set difference
//! - **Applier**: registers/deregisters per item, with dry-run
//! - **Driver**: runs passes and owns repetition and shutdown
//!
//! The cloud is reached only through the `provider` traits; `aws` implements
//! them with the AWS SDK and `mock` implements them in memory.

pub mod applier;
pub mod aws;
pub mod config;
pub mod driver;
pub mod error;
pub mod inventory;
pub mod mock;
pub mod provider;
pub mod target_group;

// Re-export commonly used types
pub use applier::Applier;
pub use aws::AwsProvider;
pub use config::{Config, ProviderSettings, RunMode};
pub use driver::{Driver, DriverState, PassReport, RunSummary};
pub use error::{SyncError, TargetGroupResolutionError};
pub use inventory::{InventoryReader, InventorySnapshot};
pub use mock::InMemoryProvider;
pub use provider::{ComputeInventory, LoadBalancer, ProviderError, TargetGroupRef};
pub use target_group::TargetGroupReader;
