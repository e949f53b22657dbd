//! EC2 inventory and EC2 Instance Connect key push.
//!
//! Both clients are built from one explicitly configured region; nothing
//! here reads ambient region state after construction.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_ec2::types::{Filter, Instance};
use tracing::debug;

use crate::error::{Error, Result};
use crate::inventory::{InstanceRecord, Inventory, KeyPusher, PushOutcome, Reservation, TagFilter};

const INSTANCE_NOT_FOUND: &str = "InvalidInstanceID.NotFound";
const MALFORMED_INSTANCE_ID: &str = "InvalidInstanceID.Malformed";

/// Load shared SDK configuration (credentials chain etc.) for `region`.
pub async fn load_sdk_config(region: &str) -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .load()
        .await
}

pub struct Ec2Inventory {
    client: aws_sdk_ec2::Client,
}

impl Ec2Inventory {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_ec2::Client::new(config),
        }
    }
}

#[async_trait]
impl Inventory for Ec2Inventory {
    async fn find_instance_by_id(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        debug!("Describing instance {}", instance_id);
        let output = match self
            .client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                let code = e.as_service_error().and_then(|s| s.code());
                if matches!(code, Some(INSTANCE_NOT_FOUND | MALFORMED_INSTANCE_ID)) {
                    return Ok(None);
                }
                return Err(Error::Inventory(DisplayErrorContext(&e).to_string()));
            }
        };

        Ok(output
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .find_map(instance_record))
    }

    async fn find_instances_by_tag(&self, tag: &TagFilter, state: &str) -> Result<Vec<Reservation>> {
        debug!("Describing {} instances tagged {}", state, tag);
        let output = self
            .client
            .describe_instances()
            .filters(tag_filter(tag))
            .filters(filter("instance-state-name", state))
            .send()
            .await
            .map_err(|e| Error::Inventory(DisplayErrorContext(&e).to_string()))?;

        Ok(output
            .reservations()
            .iter()
            .map(|r| Reservation {
                instances: r.instances().iter().filter_map(instance_record).collect(),
            })
            .collect())
    }

    async fn find_capacity_requests_by_tag(
        &self,
        tag: &TagFilter,
        state: &str,
        status: &str,
    ) -> Result<Vec<String>> {
        debug!("Describing {} spot requests tagged {}", state, tag);
        let output = self
            .client
            .describe_spot_instance_requests()
            .filters(tag_filter(tag))
            .filters(filter("state", state))
            .filters(filter("status-code", status))
            .send()
            .await
            .map_err(|e| Error::Inventory(DisplayErrorContext(&e).to_string()))?;

        Ok(output
            .spot_instance_requests()
            .iter()
            .filter_map(|r| r.instance_id().map(String::from))
            .collect())
    }
}

pub struct InstanceConnectPusher {
    client: aws_sdk_ec2instanceconnect::Client,
}

impl InstanceConnectPusher {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_ec2instanceconnect::Client::new(config),
        }
    }
}

#[async_trait]
impl KeyPusher for InstanceConnectPusher {
    async fn push_public_key(
        &self,
        instance: &InstanceRecord,
        os_user: &str,
        public_key: &str,
    ) -> Result<PushOutcome> {
        let result = self
            .client
            .send_ssh_public_key()
            .availability_zone(&instance.availability_zone)
            .instance_id(&instance.instance_id)
            .instance_os_user(os_user)
            .ssh_public_key(public_key)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                if e
                    .as_service_error()
                    .is_some_and(|s| s.is_throttling_exception())
                {
                    return Ok(PushOutcome::Throttled);
                }
                return Err(Error::KeyPush {
                    instance: instance.instance_id.clone(),
                    reason: aws_sdk_ec2instanceconnect::error::DisplayErrorContext(&e).to_string(),
                });
            }
        };

        if !output.success() {
            return Err(Error::KeyPushRejected {
                instance: instance.instance_id.clone(),
                request_id: output.request_id().unwrap_or_default().to_string(),
            });
        }
        Ok(PushOutcome::Accepted)
    }
}

fn filter(name: &str, value: &str) -> Filter {
    Filter::builder().name(name).values(value).build()
}

fn tag_filter(tag: &TagFilter) -> Filter {
    filter(&format!("tag:{}", tag.key), &tag.value)
}

/// Instances without an id are skipped.
fn instance_record(instance: &Instance) -> Option<InstanceRecord> {
    Some(InstanceRecord {
        instance_id: instance.instance_id()?.to_string(),
        public_address: instance.public_ip_address().map(String::from),
        private_address: instance.private_ip_address().map(String::from),
        availability_zone: instance
            .placement()
            .and_then(|p| p.availability_zone())
            .unwrap_or_default()
            .to_string(),
    })
}

#[cfg(test)]
mod tests {
    use aws_sdk_ec2::types::Placement;

    use super::*;

    #[test]
    fn test_instance_record_conversion() {
        let instance = Instance::builder()
            .instance_id("i-0abc")
            .public_ip_address("203.0.113.7")
            .private_ip_address("10.0.0.7")
            .placement(Placement::builder().availability_zone("eu-west-1b").build())
            .build();

        let record = instance_record(&instance).unwrap();
        assert_eq!(record.instance_id, "i-0abc");
        assert_eq!(record.public_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(record.private_address.as_deref(), Some("10.0.0.7"));
        assert_eq!(record.availability_zone, "eu-west-1b");
    }

    #[test]
    fn test_private_only_instance() {
        let instance = Instance::builder()
            .instance_id("i-0def")
            .private_ip_address("10.0.0.8")
            .build();

        let record = instance_record(&instance).unwrap();
        assert_eq!(record.public_address, None);
        assert_eq!(record.availability_zone, "");
    }

    #[test]
    fn test_instance_without_id_is_skipped() {
        assert!(instance_record(&Instance::builder().build()).is_none());
    }

    #[test]
    fn test_tag_filter() {
        let filter = tag_filter(&TagFilter::new("role", "bastion"));
        assert_eq!(filter.name(), Some("tag:role"));
        assert_eq!(filter.values(), ["bastion".to_string()]);
    }
}
