//! AWS implementation of [`CloudProvider`] on EC2 + Auto Scaling.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_autoscaling::Client as AsgClient;
use aws_sdk_ec2::error::ProvideErrorMetadata;
use aws_sdk_ec2::types::Tag;
use aws_sdk_ec2::Client as Ec2Client;
use tracing::{debug, warn};

use super::{
    AsgDescription, CloudError, CloudProvider, CloudResult, InstanceDescription, InstanceState,
    ProtectionStatus,
};
use crate::config::CloudConfig;

/// EC2 + Auto Scaling adapter, scoped to a single ASG.
#[derive(Clone)]
pub struct AwsCloud {
    ec2: Ec2Client,
    asg: AsgClient,
    asg_name: String,
}

impl AwsCloud {
    /// Build clients from the ambient credential chain.
    pub async fn new(config: &CloudConfig, asg_name: &str) -> Self {
        let timeouts = TimeoutConfig::builder()
            .operation_timeout(Duration::from_millis(config.rpc_timeout_ms))
            .build();

        let mut loader = aws_config::defaults(BehaviorVersion::latest()).timeout_config(timeouts);
        if !config.region.is_empty() {
            loader = loader.region(Region::new(config.region.clone()));
        }
        let sdk_config = loader.load().await;

        Self {
            ec2: Ec2Client::new(&sdk_config),
            asg: AsgClient::new(&sdk_config),
            asg_name: asg_name.to_string(),
        }
    }
}

/// Map an AWS error code plus message onto the neutral taxonomy.
fn classify_parts(op: &str, code: Option<&str>, detail: String) -> CloudError {
    let code = code.unwrap_or_default();
    let message = format!("{op}: {code}: {detail}");
    match code {
        "Throttling" | "ThrottlingException" | "RequestLimitExceeded" | "ServiceUnavailable"
        | "InternalFailure" | "RequestTimeout" | "RequestTimeoutException" => {
            CloudError::Transient(message)
        }
        "UnauthorizedOperation" | "AccessDenied" | "AccessDeniedException" | "AuthFailure"
        | "InvalidClientTokenId" | "ExpiredToken" => CloudError::Permission(message),
        "IncorrectInstanceState" | "ResourceContention" | "ScalingActivityInProgress" => {
            CloudError::Conflict(message)
        }
        c if c.contains("NotFound") => CloudError::NotFound(message),
        // Transport-level failures carry no service code.
        "" => CloudError::Transient(message),
        _ => CloudError::Fatal(message),
    }
}

#[async_trait]
impl CloudProvider for AwsCloud {
    async fn describe_instance(&self, instance_id: &str) -> CloudResult<InstanceDescription> {
        let output = self
            .ec2
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| classify_parts("DescribeInstances", e.code(), e.to_string()))?;

        let instance = output
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .find(|i| i.instance_id() == Some(instance_id))
            .ok_or_else(|| CloudError::NotFound(format!("instance {instance_id}")))?;

        let state = instance
            .state()
            .and_then(|s| s.name())
            .map(|n| n.as_str().parse().unwrap_or(InstanceState::Other(n.as_str().into())))
            .unwrap_or(InstanceState::Other("unknown".into()));

        let public_endpoint = instance
            .public_ip_address()
            .or(instance.public_dns_name())
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let tags: HashMap<String, String> = instance
            .tags()
            .iter()
            .filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string())))
            .collect();

        Ok(InstanceDescription {
            instance_id: instance_id.to_string(),
            state,
            public_endpoint,
            tags,
        })
    }

    async fn set_tags(&self, instance_id: &str, tags: &[(String, String)]) -> CloudResult<()> {
        let mut req = self.ec2.create_tags().resources(instance_id);
        for (key, value) in tags {
            req = req.tags(Tag::builder().key(key).value(value).build());
        }
        req.send()
            .await
            .map_err(|e| classify_parts("CreateTags", e.code(), e.to_string()))?;
        debug!(instance_id, ?tags, "tags applied");
        Ok(())
    }

    async fn set_scale_in_protection(
        &self,
        instance_ids: &[String],
        protect: bool,
    ) -> CloudResult<Vec<ProtectionStatus>> {
        if instance_ids.is_empty() {
            return Ok(Vec::new());
        }

        let batch = self
            .asg
            .set_instance_protection()
            .auto_scaling_group_name(&self.asg_name)
            .set_instance_ids(Some(instance_ids.to_vec()))
            .protected_from_scale_in(protect)
            .send()
            .await;

        match batch {
            Ok(_) => Ok(instance_ids
                .iter()
                .map(|id| ProtectionStatus {
                    instance_id: id.clone(),
                    ok: true,
                    message: None,
                })
                .collect()),
            Err(batch_err) => {
                // The batch call is all-or-nothing; degrade to per-id calls
                // so one detached instance cannot block the rest.
                warn!(error = %batch_err, "batch protection call failed, retrying per instance");
                let mut statuses = Vec::with_capacity(instance_ids.len());
                for id in instance_ids {
                    let result = self
                        .asg
                        .set_instance_protection()
                        .auto_scaling_group_name(&self.asg_name)
                        .instance_ids(id)
                        .protected_from_scale_in(protect)
                        .send()
                        .await;
                    statuses.push(match result {
                        Ok(_) => ProtectionStatus {
                            instance_id: id.clone(),
                            ok: true,
                            message: None,
                        },
                        Err(e) => ProtectionStatus {
                            instance_id: id.clone(),
                            ok: false,
                            message: Some(
                                classify_parts("SetInstanceProtection", e.code(), e.to_string())
                                    .to_string(),
                            ),
                        },
                    });
                }
                Ok(statuses)
            }
        }
    }

    async fn describe_asg(&self) -> CloudResult<AsgDescription> {
        let output = self
            .asg
            .describe_auto_scaling_groups()
            .auto_scaling_group_names(&self.asg_name)
            .send()
            .await
            .map_err(|e| classify_parts("DescribeAutoScalingGroups", e.code(), e.to_string()))?;

        let group = output
            .auto_scaling_groups()
            .first()
            .ok_or_else(|| CloudError::NotFound(format!("asg {}", self.asg_name)))?;

        Ok(AsgDescription {
            desired_capacity: group.desired_capacity().unwrap_or(0).max(0) as u32,
            min_size: group.min_size().unwrap_or(0).max(0) as u32,
            max_size: group.max_size().unwrap_or(0).max(0) as u32,
            instance_ids: group
                .instances()
                .iter()
                .filter_map(|i| i.instance_id().map(str::to_string))
                .collect(),
        })
    }

    async fn set_desired_capacity(&self, desired: u32) -> CloudResult<()> {
        self.asg
            .set_desired_capacity()
            .auto_scaling_group_name(&self.asg_name)
            .desired_capacity(desired as i32)
            .honor_cooldown(false)
            .send()
            .await
            .map_err(|e| classify_parts("SetDesiredCapacity", e.code(), e.to_string()))?;
        debug!(desired, "desired capacity set");
        Ok(())
    }

    async fn terminate_in_asg_decrementing(&self, instance_id: &str) -> CloudResult<()> {
        self.asg
            .terminate_instance_in_auto_scaling_group()
            .instance_id(instance_id)
            .should_decrement_desired_capacity(true)
            .send()
            .await
            .map_err(|e| {
                classify_parts("TerminateInstanceInAutoScalingGroup", e.code(), e.to_string())
            })?;
        debug!(instance_id, "instance terminated, capacity decremented");
        Ok(())
    }
}
