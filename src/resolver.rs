//! Maps an explicit instance id or a tag to one concrete instance id.

use std::sync::Arc;

use rand::Rng;
use rand::seq::SliceRandom;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::inventory::{
    ACTIVE_STATE, FULFILLED_STATUS, Inventory, RUNNING_STATE, Reservation, TagFilter,
};

/// Picks a target instance, preferring fulfilled capacity requests over
/// running instances. Candidates behind the same tag are interchangeable,
/// so ties are broken at random.
pub struct Resolver {
    inventory: Arc<dyn Inventory>,
}

impl Resolver {
    pub fn new(inventory: Arc<dyn Inventory>) -> Self {
        Self { inventory }
    }

    /// Resolve to an instance id. An explicit id is returned as-is without
    /// touching the inventory.
    pub async fn resolve(&self, explicit_id: Option<&str>, tag: &TagFilter) -> Result<String> {
        if let Some(id) = explicit_id.filter(|id| !id.is_empty()) {
            debug!("Using explicit instance id {}", id);
            return Ok(id.to_string());
        }

        info!("Looking for capacity requests tagged {}", tag);
        let requests = self
            .inventory
            .find_capacity_requests_by_tag(tag, ACTIVE_STATE, FULFILLED_STATUS)
            .await?;
        let picked = requests.choose(&mut rand::thread_rng()).cloned();
        if let Some(id) = picked {
            debug!("Picked {} from {} capacity request(s)", id, requests.len());
            return Ok(id);
        }

        info!("No capacity requests found, looking for running instances tagged {}", tag);
        let reservations = self
            .inventory
            .find_instances_by_tag(tag, RUNNING_STATE)
            .await?;
        let picked = pick_instance(&reservations, &mut rand::thread_rng());
        if let Some(id) = picked {
            return Ok(id);
        }

        Err(Error::NoTarget(tag.to_string()))
    }
}

/// Uniform over non-empty reservations, then uniform within the reservation.
fn pick_instance<R: Rng>(reservations: &[Reservation], rng: &mut R) -> Option<String> {
    let populated: Vec<&Reservation> = reservations
        .iter()
        .filter(|r| !r.instances.is_empty())
        .collect();
    let reservation = populated.choose(rng)?;
    let instance = reservation.instances.choose(rng)?;
    debug!(
        "Picked {} from {} reservation(s)",
        instance.instance_id,
        populated.len()
    );
    Some(instance.instance_id.clone())
}
