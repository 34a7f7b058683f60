//! EC2 and ELBv2 provider.
//!
//! Uses the official AWS SDK crates. Region and static credentials come from
//! an explicit `ProviderSettings`; anything left unset falls through to the
//! SDK's default provider chain.

use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::config::Credentials;
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types::Filter;
use aws_sdk_elasticloadbalancingv2::types::TargetDescription;
use tgsync_reconcile::InstanceId;
use tracing::{debug, info};

use crate::config::ProviderSettings;
use crate::provider::{
    ComputeInventory, Instance, InstanceFilter, InstanceState, LoadBalancer, ProviderError, Target,
    TargetGroupRef, TargetHealth,
};

/// Provider backed by EC2 and ELBv2.
#[derive(Debug, Clone)]
pub struct AwsProvider {
    ec2: aws_sdk_ec2::Client,
    elbv2: aws_sdk_elasticloadbalancingv2::Client,
}

impl AwsProvider {
    /// Build SDK clients from settings.
    pub async fn connect(settings: &ProviderSettings) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());

        if let Some(region) = &settings.region {
            loader = loader.region(Region::new(region.clone()));
        }

        let static_credentials = settings.static_credentials();
        if let Some((access_key, secret_key)) = static_credentials {
            let creds = Credentials::new(
                access_key,
                secret_key,
                settings.session_token.clone(),
                None, // expiry
                "tg-sync-static",
            );
            loader = loader.credentials_provider(creds);
        }

        let sdk_config = loader.load().await;

        info!(
            region = ?sdk_config.region(),
            explicit_creds = static_credentials.is_some(),
            "AWS provider initialized"
        );

        Self {
            ec2: aws_sdk_ec2::Client::new(&sdk_config),
            elbv2: aws_sdk_elasticloadbalancingv2::Client::new(&sdk_config),
        }
    }
}

#[async_trait]
impl ComputeInventory for AwsProvider {
    async fn describe_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<Instance>, ProviderError> {
        let mut filters = vec![Filter::builder()
            .name("tag:Name")
            .values(filter.name_pattern())
            .build()];
        if filter.running_only {
            filters.push(
                Filter::builder()
                    .name("instance-state-name")
                    .values("running")
                    .build(),
            );
        }

        let mut pages = self
            .ec2
            .describe_instances()
            .set_filters(Some(filters))
            .into_paginator()
            .send();

        let mut instances = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(classify)?;
            for reservation in page.reservations() {
                for instance in reservation.instances() {
                    let Some(id) = instance.instance_id() else {
                        continue;
                    };

                    let tags: BTreeMap<String, String> = instance
                        .tags()
                        .iter()
                        .filter_map(|tag| {
                            Some((
                                tag.key()?.to_string(),
                                tag.value().unwrap_or_default().to_string(),
                            ))
                        })
                        .collect();

                    let state = instance
                        .state()
                        .and_then(|s| s.name())
                        .map(|name| InstanceState::from_name(name.as_str()))
                        .unwrap_or_else(|| InstanceState::Other("unknown".to_string()));

                    instances.push(Instance::new(id, state, tags));
                }
            }
        }

        debug!(
            pattern = %filter.name_pattern(),
            count = instances.len(),
            "DescribeInstances"
        );
        Ok(instances)
    }
}

#[async_trait]
impl LoadBalancer for AwsProvider {
    async fn describe_target_groups(
        &self,
        names: &[String],
    ) -> Result<Vec<TargetGroupRef>, ProviderError> {
        let output = self
            .elbv2
            .describe_target_groups()
            .set_names(Some(names.to_vec()))
            .send()
            .await
            .map_err(classify)?;

        Ok(output
            .target_groups()
            .iter()
            .filter_map(|tg| {
                Some(TargetGroupRef {
                    arn: tg.target_group_arn()?.to_string(),
                    name: tg.target_group_name().unwrap_or_default().to_string(),
                })
            })
            .collect())
    }

    async fn describe_target_health(
        &self,
        target_group: &TargetGroupRef,
    ) -> Result<Vec<TargetHealth>, ProviderError> {
        let output = self
            .elbv2
            .describe_target_health()
            .target_group_arn(&target_group.arn)
            .send()
            .await
            .map_err(classify)?;

        Ok(output
            .target_health_descriptions()
            .iter()
            .filter_map(|description| {
                let target = description.target()?;
                let state = description
                    .target_health()
                    .and_then(|h| h.state())
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                Some(TargetHealth {
                    target_id: InstanceId::from(target.id()),
                    state,
                })
            })
            .collect())
    }

    async fn register_targets(
        &self,
        target_group: &TargetGroupRef,
        targets: &[Target],
    ) -> Result<(), ProviderError> {
        self.elbv2
            .register_targets()
            .target_group_arn(&target_group.arn)
            .set_targets(Some(descriptions(targets)?))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn deregister_targets(
        &self,
        target_group: &TargetGroupRef,
        targets: &[Target],
    ) -> Result<(), ProviderError> {
        self.elbv2
            .deregister_targets()
            .target_group_arn(&target_group.arn)
            .set_targets(Some(descriptions(targets)?))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }
}

fn descriptions(targets: &[Target]) -> Result<Vec<TargetDescription>, ProviderError> {
    targets
        .iter()
        .map(|target| {
            TargetDescription::builder()
                .id(target.id.as_str())
                .port(i32::from(target.port.get()))
                .build()
                .map_err(|e| ProviderError::Api(e.to_string()))
        })
        .collect()
}

/// Map an SDK error onto the provider taxonomy.
fn classify<E, R>(err: SdkError<E, R>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            ProviderError::Transport(message)
        }
        _ => classify_code(
            err.as_service_error().and_then(ProvideErrorMetadata::code),
            message,
        ),
    }
}

fn classify_code(code: Option<&str>, message: String) -> ProviderError {
    match code {
        Some(
            "Throttling"
            | "ThrottlingException"
            | "RequestLimitExceeded"
            | "RequestThrottled"
            | "TooManyRequestsException",
        ) => ProviderError::Throttled(message),
        Some(
            "AuthFailure"
            | "UnauthorizedOperation"
            | "AccessDenied"
            | "AccessDeniedException"
            | "InvalidClientTokenId"
            | "ExpiredToken"
            | "SignatureDoesNotMatch",
        ) => ProviderError::Unauthorized(message),
        Some("TargetGroupNotFound") => ProviderError::TargetGroupNotFound(message),
        Some("InvalidTarget") => ProviderError::InvalidTarget(message),
        _ => ProviderError::Api(message),
    }
}
