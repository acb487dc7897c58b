use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::courier::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "delivery_type", rename_all = "snake_case")]
pub enum DeliveryType {
    OnSite,
    Package,
    Pickup,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "order_status", rename_all = "snake_case")]
pub enum OrderStatus {
    Preparing,
    InPool,
    Offered,
    RejectedByCourier,
    CourierCalled,
    Assigned,
    EnRoute,
    AtLocation,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 10] = [
        OrderStatus::Preparing,
        OrderStatus::InPool,
        OrderStatus::Offered,
        OrderStatus::RejectedByCourier,
        OrderStatus::CourierCalled,
        OrderStatus::Assigned,
        OrderStatus::EnRoute,
        OrderStatus::AtLocation,
        OrderStatus::Delivered,
        OrderStatus::Cancelled,
    ];

    /// States a courier is working on. The route stream only runs for the first two.
    pub const CARRYING: [OrderStatus; 3] = [
        OrderStatus::Assigned,
        OrderStatus::EnRoute,
        OrderStatus::AtLocation,
    ];

    pub const ROUTED: [OrderStatus; 2] = [OrderStatus::Assigned, OrderStatus::EnRoute];

    pub const TERMINAL: [OrderStatus; 2] = [OrderStatus::Delivered, OrderStatus::Cancelled];

    /// States from which a courier may claim the order.
    pub const CLAIMABLE: [OrderStatus; 4] = [
        OrderStatus::Offered,
        OrderStatus::InPool,
        OrderStatus::CourierCalled,
        OrderStatus::RejectedByCourier,
    ];

    /// States in which a watcher row is expected to exist.
    pub const WATCHED: [OrderStatus; 3] = [
        OrderStatus::Preparing,
        OrderStatus::Offered,
        OrderStatus::RejectedByCourier,
    ];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Preparing => "preparing",
            OrderStatus::InPool => "in_pool",
            OrderStatus::Offered => "offered",
            OrderStatus::RejectedByCourier => "rejected_by_courier",
            OrderStatus::CourierCalled => "courier_called",
            OrderStatus::Assigned => "assigned",
            OrderStatus::EnRoute => "en_route",
            OrderStatus::AtLocation => "at_location",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// Edges of the lifecycle graph. `cancelled` is reachable from every
    /// non-terminal state; terminal states have no outgoing edges.
    ///
    /// Besides `preparing`, `courier_called` can be entered from `offered` and
    /// `in_pool`: a restaurant may call a courier itself while an offer is
    /// open or the order waits in the pool. The open offer or pool entry is
    /// withdrawn in the same step.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;

        if self.is_terminal() {
            return false;
        }
        if next == Cancelled {
            return true;
        }

        matches!(
            (self, next),
            (Preparing, Offered)
                | (Preparing, InPool)
                | (Preparing, CourierCalled)
                | (Offered, Assigned)
                | (Offered, RejectedByCourier)
                | (Offered, InPool)
                | (Offered, CourierCalled)
                | (RejectedByCourier, Offered)
                | (RejectedByCourier, InPool)
                | (RejectedByCourier, Assigned)
                | (InPool, Assigned)
                | (InPool, CourierCalled)
                | (CourierCalled, Assigned)
                | (Assigned, EnRoute)
                | (EnRoute, AtLocation)
                | (EnRoute, Delivered)
                | (AtLocation, Delivered)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.trim())
            .ok_or_else(|| format!("unknown order status: {s}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderItem {
    pub product_name: String,
    pub price: f64,
    pub quantity: u32,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub restaurant_id: Uuid,
    pub courier_id: Option<Uuid>,
    pub code: String,
    pub customer: String,
    pub phone: String,
    pub address: String,
    pub delivery_address: String,
    pub delivery_type: DeliveryType,
    pub status: OrderStatus,
    pub amount: f64,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub carrier_type: Option<String>,
    pub vehicle_type: Option<String>,
    pub cargo_type: Option<String>,
    pub special_requests: Option<String>,
    pub items: Vec<OrderItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Validated input for a new order. The store assigns id, code, status and timestamps.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub customer: String,
    pub phone: String,
    pub address: String,
    pub delivery_address: String,
    pub delivery_type: DeliveryType,
    pub amount: f64,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub carrier_type: Option<String>,
    pub vehicle_type: Option<String>,
    pub cargo_type: Option<String>,
    pub special_requests: Option<String>,
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub customer: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub delivery_address: Option<String>,
    pub delivery_type: Option<DeliveryType>,
    pub amount: Option<f64>,
    pub dropoff: Option<GeoPoint>,
    pub carrier_type: Option<String>,
    pub vehicle_type: Option<String>,
    pub cargo_type: Option<String>,
    pub special_requests: Option<String>,
}

impl OrderUpdate {
    pub fn is_empty(&self) -> bool {
        self.customer.is_none()
            && self.phone.is_none()
            && self.address.is_none()
            && self.delivery_address.is_none()
            && self.delivery_type.is_none()
            && self.amount.is_none()
            && self.dropoff.is_none()
            && self.carrier_type.is_none()
            && self.vehicle_type.is_none()
            && self.cargo_type.is_none()
            && self.special_requests.is_none()
    }

    pub fn apply(&self, order: &mut Order) {
        if let Some(customer) = &self.customer {
            order.customer = customer.clone();
        }
        if let Some(phone) = &self.phone {
            order.phone = phone.clone();
        }
        if let Some(address) = &self.address {
            order.address = address.clone();
        }
        if let Some(delivery_address) = &self.delivery_address {
            order.delivery_address = delivery_address.clone();
        }
        if let Some(delivery_type) = self.delivery_type {
            order.delivery_type = delivery_type;
        }
        if let Some(amount) = self.amount {
            order.amount = amount;
        }
        if let Some(dropoff) = self.dropoff {
            order.dropoff = dropoff;
        }
        if let Some(carrier_type) = &self.carrier_type {
            order.carrier_type = Some(carrier_type.clone());
        }
        if let Some(vehicle_type) = &self.vehicle_type {
            order.vehicle_type = Some(vehicle_type.clone());
        }
        if let Some(cargo_type) = &self.cargo_type {
            order.cargo_type = Some(cargo_type.clone());
        }
        if let Some(special_requests) = &self.special_requests {
            order.special_requests = Some(special_requests.clone());
        }
    }
}

/// Whose orders a listing covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderScope {
    Restaurant(Uuid),
    Courier(Uuid),
}

#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub statuses: Vec<OrderStatus>,
    pub delivery_type: Option<DeliveryType>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub search: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

impl OrderFilter {
    pub fn matches(&self, order: &Order) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&order.status) {
            return false;
        }
        if let Some(delivery_type) = self.delivery_type {
            if order.delivery_type != delivery_type {
                return false;
            }
        }
        if let Some(from) = self.created_from {
            if order.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.created_to {
            if order.created_at > to {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            let hit = [
                &order.code,
                &order.customer,
                &order.phone,
                &order.delivery_address,
            ]
            .iter()
            .any(|field| field.to_lowercase().contains(&needle));
            if !hit {
                return false;
            }
        }
        true
    }
}
