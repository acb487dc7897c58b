use std::sync::Arc;

use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::Page;
use crate::models::courier::GeoPoint;
use crate::models::order::{
    DeliveryType, NewOrder, Order, OrderFilter, OrderItem, OrderScope, OrderStatus, OrderUpdate,
};
use crate::observability::metrics::Metrics;
use crate::store::DispatchStore;

/// Line totals may differ from the stated amount by rounding only.
const AMOUNT_TOLERANCE: f64 = 0.005;

#[derive(Debug, Clone, Deserialize)]
pub struct OrderItemDraft {
    pub product_name: String,
    pub price: f64,
    pub quantity: u32,
}

/// A restaurant's order as submitted. Pickup falls back to the restaurant's
/// coordinates; amount falls back to the sum of the line totals.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderDraft {
    pub customer: String,
    pub phone: String,
    pub address: String,
    pub delivery_address: String,
    pub delivery_type: DeliveryType,
    pub amount: Option<f64>,
    pub pickup: Option<GeoPoint>,
    pub dropoff: GeoPoint,
    pub carrier_type: Option<String>,
    pub vehicle_type: Option<String>,
    pub cargo_type: Option<String>,
    pub special_requests: Option<String>,
    #[serde(default)]
    pub items: Vec<OrderItemDraft>,
}

/// The only component allowed to change an order's status.
#[derive(Clone)]
pub struct OrderService {
    store: Arc<dyn DispatchStore>,
    metrics: Metrics,
}

impl OrderService {
    pub fn new(store: Arc<dyn DispatchStore>, metrics: Metrics) -> Self {
        Self { store, metrics }
    }

    pub async fn create(&self, restaurant_id: Uuid, draft: OrderDraft) -> Result<Order, AppError> {
        for (field, value) in [
            ("customer", &draft.customer),
            ("phone", &draft.phone),
            ("delivery_address", &draft.delivery_address),
        ] {
            if value.trim().is_empty() {
                return Err(AppError::Validation(format!("{field} cannot be empty")));
            }
        }
        if !draft.dropoff.is_valid() {
            return Err(AppError::Validation("dropoff coordinates out of range".to_string()));
        }

        let pickup = match draft.pickup {
            Some(pickup) => pickup,
            None => self
                .store
                .restaurant(restaurant_id)
                .await?
                .and_then(|restaurant| restaurant.location)
                .ok_or_else(|| {
                    AppError::Validation(
                        "pickup is required when the restaurant has no coordinates".to_string(),
                    )
                })?,
        };
        if !pickup.is_valid() {
            return Err(AppError::Validation("pickup coordinates out of range".to_string()));
        }

        let items = build_items(draft.items)?;
        let amount = settle_amount(draft.amount, &items)?;

        let order = self
            .store
            .insert_order(
                restaurant_id,
                NewOrder {
                    customer: draft.customer.trim().to_string(),
                    phone: draft.phone.trim().to_string(),
                    address: draft.address,
                    delivery_address: draft.delivery_address,
                    delivery_type: draft.delivery_type,
                    amount,
                    pickup,
                    dropoff: draft.dropoff,
                    carrier_type: draft.carrier_type,
                    vehicle_type: draft.vehicle_type,
                    cargo_type: draft.cargo_type,
                    special_requests: draft.special_requests,
                    items,
                },
            )
            .await?;

        self.metrics.orders_created_total.inc();
        info!(
            order_id = %order.id,
            restaurant_id = %restaurant_id,
            code = %order.code,
            "order created"
        );
        Ok(order)
    }

    /// With `restaurant_id`, an order belonging to another restaurant reads as
    /// missing.
    pub async fn get(&self, order_id: Uuid, restaurant_id: Option<Uuid>) -> Result<Order, AppError> {
        self.store
            .fetch_order(order_id)
            .await?
            .filter(|order| restaurant_id.is_none_or(|rid| order.restaurant_id == rid))
            .ok_or_else(|| AppError::NotFound(format!("order {order_id}")))
    }

    pub async fn update(
        &self,
        order_id: Uuid,
        restaurant_id: Uuid,
        update: OrderUpdate,
    ) -> Result<Order, AppError> {
        if update.is_empty() {
            return Err(AppError::Validation("no fields to update".to_string()));
        }
        if update.dropoff.is_some_and(|dropoff| !dropoff.is_valid()) {
            return Err(AppError::Validation("dropoff coordinates out of range".to_string()));
        }

        let current = self.get(order_id, Some(restaurant_id)).await?;
        if current.status.is_terminal() {
            return Err(AppError::InvalidTransition(format!(
                "order is {} and can no longer be changed",
                current.status
            )));
        }

        let updated = self
            .store
            .update_order(order_id, &update)
            .await?
            .ok_or_else(|| {
                AppError::InvalidTransition("order can no longer be changed".to_string())
            })?;

        info!(order_id = %order_id, "order updated");
        Ok(updated)
    }

    pub async fn delete(&self, order_id: Uuid, restaurant_id: Uuid) -> Result<(), AppError> {
        let current = self.get(order_id, Some(restaurant_id)).await?;
        if current.status == OrderStatus::Delivered || !self.store.delete_order(order_id).await? {
            return Err(AppError::InvalidTransition(
                "delivered orders cannot be deleted".to_string(),
            ));
        }

        info!(order_id = %order_id, "order deleted");
        Ok(())
    }

    /// Compare-and-set on status. Every `from → to` pair must be an edge of
    /// the lifecycle graph; `None` means the order was not in any `from` state
    /// (or not held by `held_by`).
    pub async fn transition_status(
        &self,
        order_id: Uuid,
        from: &[OrderStatus],
        to: OrderStatus,
        held_by: Option<Uuid>,
    ) -> Result<Option<Order>, AppError> {
        if let Some(bad) = from.iter().find(|status| !status.can_transition_to(to)) {
            return Err(AppError::InvalidTransition(format!(
                "{bad} cannot move to {to}"
            )));
        }

        let moved = self
            .store
            .transition_status(order_id, from, to, held_by)
            .await?;
        if let Some(order) = &moved {
            info!(order_id = %order.id, status = %to, "order status changed");
        }
        Ok(moved)
    }

    /// Binds the courier and moves the order to `assigned` in one write.
    pub async fn assign_courier(
        &self,
        order_id: Uuid,
        courier_id: Uuid,
    ) -> Result<Option<Order>, AppError> {
        let assigned = self
            .store
            .assign_courier(order_id, courier_id, &OrderStatus::CLAIMABLE)
            .await?;
        if assigned.is_some() {
            info!(order_id = %order_id, courier_id = %courier_id, "courier assigned");
        }
        Ok(assigned)
    }

    pub async fn list_by_restaurant(
        &self,
        restaurant_id: Uuid,
        filter: OrderFilter,
    ) -> Result<Page<Order>, AppError> {
        Ok(self
            .store
            .list_orders(OrderScope::Restaurant(restaurant_id), &filter)
            .await?)
    }

    pub async fn list_by_courier(
        &self,
        courier_id: Uuid,
        filter: OrderFilter,
    ) -> Result<Page<Order>, AppError> {
        Ok(self
            .store
            .list_orders(OrderScope::Courier(courier_id), &filter)
            .await?)
    }

    /// Finished orders of a restaurant. A status filter narrows within the
    /// terminal states.
    pub async fn history(
        &self,
        restaurant_id: Uuid,
        mut filter: OrderFilter,
    ) -> Result<Page<Order>, AppError> {
        filter.statuses = restrict(&filter.statuses, &OrderStatus::TERMINAL);
        if filter.statuses.is_empty() {
            return Ok(Page::from_vec(Vec::new(), filter.limit, filter.offset));
        }
        self.list_by_restaurant(restaurant_id, filter).await
    }

    pub async fn list_assigned_to_courier(
        &self,
        courier_id: Uuid,
        mut filter: OrderFilter,
    ) -> Result<Page<Order>, AppError> {
        filter.statuses = restrict(&filter.statuses, &OrderStatus::CARRYING);
        if filter.statuses.is_empty() {
            return Ok(Page::from_vec(Vec::new(), filter.limit, filter.offset));
        }
        self.list_by_courier(courier_id, filter).await
    }
}

fn restrict(requested: &[OrderStatus], allowed: &[OrderStatus]) -> Vec<OrderStatus> {
    if requested.is_empty() {
        return allowed.to_vec();
    }
    requested
        .iter()
        .copied()
        .filter(|status| allowed.contains(status))
        .collect()
}

fn build_items(drafts: Vec<OrderItemDraft>) -> Result<Vec<OrderItem>, AppError> {
    drafts
        .into_iter()
        .map(|draft| {
            if draft.product_name.trim().is_empty() {
                return Err(AppError::Validation("item product_name cannot be empty".to_string()));
            }
            if draft.quantity == 0 {
                return Err(AppError::Validation("item quantity must be > 0".to_string()));
            }
            if !draft.price.is_finite() || draft.price < 0.0 {
                return Err(AppError::Validation("item price must be >= 0".to_string()));
            }
            Ok(OrderItem {
                total: draft.price * f64::from(draft.quantity),
                product_name: draft.product_name,
                price: draft.price,
                quantity: draft.quantity,
            })
        })
        .collect()
}

fn settle_amount(stated: Option<f64>, items: &[OrderItem]) -> Result<f64, AppError> {
    if items.is_empty() {
        return match stated {
            Some(amount) if amount.is_finite() && amount >= 0.0 => Ok(amount),
            Some(_) => Err(AppError::Validation("amount must be >= 0".to_string())),
            None => Err(AppError::Validation(
                "amount is required when no items are given".to_string(),
            )),
        };
    }

    let sum: f64 = items.iter().map(|item| item.total).sum();
    match stated {
        Some(amount) if (amount - sum).abs() > AMOUNT_TOLERANCE => Err(AppError::Validation(
            format!("amount {amount:.2} does not match item total {sum:.2}"),
        )),
        _ => Ok(sum),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::{OrderDraft, OrderItemDraft, OrderService, restrict, settle_amount};
    use crate::error::AppError;
    use crate::models::courier::{GeoPoint, Restaurant};
    use crate::models::order::{DeliveryType, OrderFilter, OrderStatus, OrderUpdate};
    use crate::observability::metrics::Metrics;
    use crate::store::MemoryStore;

    fn draft(items: Vec<OrderItemDraft>, amount: Option<f64>) -> OrderDraft {
        OrderDraft {
            customer: "Ayşe".to_string(),
            phone: "+905550000000".to_string(),
            address: "Kadıköy".to_string(),
            delivery_address: "Moda Cd. 12".to_string(),
            delivery_type: DeliveryType::Package,
            amount,
            pickup: None,
            dropoff: GeoPoint::new(40.99, 29.03),
            carrier_type: None,
            vehicle_type: None,
            cargo_type: None,
            special_requests: None,
            items,
        }
    }

    fn item(price: f64, quantity: u32) -> OrderItemDraft {
        OrderItemDraft {
            product_name: "lahmacun".to_string(),
            price,
            quantity,
        }
    }

    fn service() -> (OrderService, Arc<MemoryStore>, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let restaurant = Uuid::new_v4();
        store.add_restaurant(Restaurant {
            id: restaurant,
            location: Some(GeoPoint::new(40.0, 29.0)),
        });
        (OrderService::new(store.clone(), Metrics::new()), store, restaurant)
    }

    #[tokio::test]
    async fn codes_are_sequential_per_restaurant() {
        let (orders, store, restaurant) = service();
        let other = Uuid::new_v4();

        let first = orders.create(restaurant, draft(vec![], Some(10.0))).await.unwrap();
        let second = orders.create(restaurant, draft(vec![], Some(10.0))).await.unwrap();
        let mut elsewhere = draft(vec![], Some(5.0));
        elsewhere.pickup = Some(GeoPoint::new(41.0, 29.0));
        let third = orders.create(other, elsewhere).await.unwrap();

        assert_eq!(first.code, "RST001");
        assert_eq!(second.code, "RST002");
        assert_eq!(third.code, "RST001");
        assert_eq!(first.status, OrderStatus::Preparing);
        assert_eq!(first.pickup, GeoPoint::new(40.0, 29.0));
        assert_eq!(store.order_count(), 3);
    }

    #[tokio::test]
    async fn amount_is_derived_from_items() {
        let (orders, _, restaurant) = service();

        let order = orders
            .create(restaurant, draft(vec![item(12.5, 2), item(5.0, 1)], None))
            .await
            .unwrap();

        assert_eq!(order.amount, 30.0);
        assert_eq!(order.items[0].total, 25.0);
    }

    #[test]
    fn mismatched_amount_is_rejected() {
        let items = super::build_items(vec![item(10.0, 3)]).unwrap();
        assert!(matches!(
            settle_amount(Some(31.0), &items),
            Err(AppError::Validation(_))
        ));
        assert_eq!(settle_amount(Some(30.004), &items).unwrap(), 30.0);
    }

    #[tokio::test]
    async fn missing_pickup_without_restaurant_coordinates_fails() {
        let (orders, _, _) = service();
        let err = orders
            .create(Uuid::new_v4(), draft(vec![], Some(1.0)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn foreign_restaurant_reads_as_missing() {
        let (orders, _, restaurant) = service();
        let order = orders.create(restaurant, draft(vec![], Some(1.0))).await.unwrap();

        assert!(orders.get(order.id, Some(restaurant)).await.is_ok());
        assert!(matches!(
            orders.get(order.id, Some(Uuid::new_v4())).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn terminal_orders_refuse_updates() {
        let (orders, _, restaurant) = service();
        let order = orders.create(restaurant, draft(vec![], Some(1.0))).await.unwrap();
        orders
            .transition_status(order.id, &[OrderStatus::Preparing], OrderStatus::Cancelled, None)
            .await
            .unwrap()
            .unwrap();

        let update = OrderUpdate {
            customer: Some("Mehmet".to_string()),
            ..OrderUpdate::default()
        };
        assert!(matches!(
            orders.update(order.id, restaurant, update).await,
            Err(AppError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn transitions_off_the_graph_are_refused() {
        let (orders, _, restaurant) = service();
        let order = orders.create(restaurant, draft(vec![], Some(1.0))).await.unwrap();

        let err = orders
            .transition_status(order.id, &[OrderStatus::Preparing], OrderStatus::Delivered, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));

        let missed = orders
            .transition_status(order.id, &[OrderStatus::Offered], OrderStatus::InPool, None)
            .await
            .unwrap();
        assert!(missed.is_none());
    }

    #[tokio::test]
    async fn delivered_orders_cannot_be_deleted() {
        let (orders, _, restaurant) = service();
        let order = orders.create(restaurant, draft(vec![], Some(1.0))).await.unwrap();
        let courier = Uuid::new_v4();

        orders
            .transition_status(order.id, &[OrderStatus::Preparing], OrderStatus::Offered, None)
            .await
            .unwrap();
        orders.assign_courier(order.id, courier).await.unwrap().unwrap();
        for (from, to) in [
            (OrderStatus::Assigned, OrderStatus::EnRoute),
            (OrderStatus::EnRoute, OrderStatus::Delivered),
        ] {
            orders
                .transition_status(order.id, &[from], to, Some(courier))
                .await
                .unwrap()
                .unwrap();
        }

        assert!(matches!(
            orders.delete(order.id, restaurant).await,
            Err(AppError::InvalidTransition(_))
        ));
        let history = orders
            .history(restaurant, OrderFilter {
                limit: 10,
                ..OrderFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(history.total, 1);
    }

    #[test]
    fn status_filters_narrow_within_the_allowed_set() {
        assert_eq!(restrict(&[], &OrderStatus::TERMINAL), OrderStatus::TERMINAL.to_vec());
        assert_eq!(
            restrict(
                &[OrderStatus::Delivered, OrderStatus::Offered],
                &OrderStatus::TERMINAL
            ),
            vec![OrderStatus::Delivered]
        );
    }
}
