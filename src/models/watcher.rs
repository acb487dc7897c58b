use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ephemeral dispatch bookkeeping for one order.
///
/// `rejected` is not required to be a subset of `available`: a courier who
/// drops out of range after rejecting stays rejected, and one who comes back
/// into range stays excluded. The set difference is the only thing consulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderWatcher {
    pub order_id: Uuid,
    pub restaurant_id: Uuid,
    pub available_couriers: BTreeSet<Uuid>,
    pub rejected_couriers: BTreeSet<Uuid>,
    pub last_tick_at: DateTime<Utc>,
    pub closed: bool,
}

impl OrderWatcher {
    pub fn new(order_id: Uuid, restaurant_id: Uuid, available: BTreeSet<Uuid>) -> Self {
        Self {
            order_id,
            restaurant_id,
            available_couriers: available,
            rejected_couriers: BTreeSet::new(),
            last_tick_at: Utc::now(),
            closed: false,
        }
    }

    pub fn effective_candidates(&self) -> BTreeSet<Uuid> {
        self.available_couriers
            .difference(&self.rejected_couriers)
            .copied()
            .collect()
    }

    pub fn is_offered_to(&self, courier_id: &Uuid) -> bool {
        !self.closed
            && self.available_couriers.contains(courier_id)
            && !self.rejected_couriers.contains(courier_id)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use uuid::Uuid;

    use super::OrderWatcher;

    #[test]
    fn effective_set_is_available_minus_rejected() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let outsider = Uuid::from_u128(3);

        let mut watcher =
            OrderWatcher::new(Uuid::new_v4(), Uuid::new_v4(), BTreeSet::from([a, b]));
        watcher.rejected_couriers.insert(a);
        watcher.rejected_couriers.insert(outsider);

        assert_eq!(watcher.effective_candidates(), BTreeSet::from([b]));
        assert!(watcher.is_offered_to(&b));
        assert!(!watcher.is_offered_to(&a));
        assert!(!watcher.is_offered_to(&outsider));
    }

    #[test]
    fn closed_watcher_offers_to_nobody() {
        let a = Uuid::from_u128(1);
        let mut watcher = OrderWatcher::new(Uuid::new_v4(), Uuid::new_v4(), BTreeSet::from([a]));
        watcher.closed = true;

        assert!(!watcher.is_offered_to(&a));
    }
}
