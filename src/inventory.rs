//! Cloud inventory and credential push collaborators.
//!
//! The chain builder only needs three lookups and one push; the concrete
//! implementations live in `aws.rs` and test doubles in `testing.rs`.

use std::fmt;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Instance state accepted by [`Inventory::find_instances_by_tag`].
pub const RUNNING_STATE: &str = "running";

/// Capacity request state accepted by [`Inventory::find_capacity_requests_by_tag`].
pub const ACTIVE_STATE: &str = "active";

/// Capacity request status accepted by [`Inventory::find_capacity_requests_by_tag`].
pub const FULFILLED_STATUS: &str = "fulfilled";

/// One instance as reported by the inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub public_address: Option<String>,
    pub private_address: Option<String>,
    pub availability_zone: String,
}

/// A group of instances launched together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reservation {
    pub instances: Vec<InstanceRecord>,
}

/// A `key:value` tag used for discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    pub key: String,
    pub value: String,
}

impl TagFilter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Parse `key:value`. The value may itself contain colons.
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((key, value)) if !key.is_empty() => Ok(Self::new(key, value)),
            _ => Err(Error::InvalidTag(s.to_string())),
        }
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key, self.value)
    }
}

/// Outcome of a successful key push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// The push was throttled; a recent push is assumed to still be valid.
    Throttled,
}

#[async_trait]
pub trait Inventory: Send + Sync {
    async fn find_instance_by_id(&self, instance_id: &str) -> Result<Option<InstanceRecord>>;

    async fn find_instances_by_tag(&self, tag: &TagFilter, state: &str) -> Result<Vec<Reservation>>;

    /// Returns the instance ids behind matching capacity (spot) requests.
    async fn find_capacity_requests_by_tag(
        &self,
        tag: &TagFilter,
        state: &str,
        status: &str,
    ) -> Result<Vec<String>>;
}

#[async_trait]
pub trait KeyPusher: Send + Sync {
    async fn push_public_key(
        &self,
        instance: &InstanceRecord,
        os_user: &str,
        public_key: &str,
    ) -> Result<PushOutcome>;
}
