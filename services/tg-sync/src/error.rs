//! Error types for a sync pass.

use thiserror::Error;

use crate::config::ConfigError;
use crate::provider::ProviderError;

/// Target group name did not resolve to exactly one group.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetGroupResolutionError {
    #[error("no target group named '{name}'")]
    Missing { name: String },

    #[error("target group name '{name}' matched {} groups: {}", .arns.len(), .arns.join(", "))]
    Ambiguous { name: String, arns: Vec<String> },
}

/// Errors that abort a sync pass.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A read against the provider failed.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(#[from] ProviderError),

    /// The configured target group could not be resolved.
    #[error(transparent)]
    TargetGroup(#[from] TargetGroupResolutionError),

    /// Required configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Shutdown was requested before the pass could complete.
    #[error("cancelled")]
    Cancelled,
}

impl SyncError {
    /// Returns true if retrying the pass may help.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ProviderUnavailable(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ambiguous_message_lists_arns() {
        let err = TargetGroupResolutionError::Ambiguous {
            name: "web".to_string(),
            arns: vec!["arn:a".to_string(), "arn:b".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "target group name 'web' matched 2 groups: arn:a, arn:b"
        );
    }

    #[test]
    fn test_only_transient_provider_errors_retry() {
        assert!(SyncError::from(ProviderError::Throttled("x".into())).is_transient());
        assert!(!SyncError::from(ProviderError::Unauthorized("x".into())).is_transient());
        assert!(!SyncError::from(TargetGroupResolutionError::Missing {
            name: "web".into()
        })
        .is_transient());
        assert!(!SyncError::Cancelled.is_transient());
    }
}
