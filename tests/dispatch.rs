mod common;

use std::collections::BTreeSet;

use serde_json::Value;
use yuksi_dispatch::engine::offer::TickOutcome;
use yuksi_dispatch::engine::sweeper::sweep_once;
use yuksi_dispatch::error::AppError;
use yuksi_dispatch::models::courier::GeoPoint;
use yuksi_dispatch::models::offer_log::OfferAction;
use yuksi_dispatch::models::order::{OrderFilter, OrderStatus};
use yuksi_dispatch::store::{OfferLogRepository, PresenceRepository, WatcherRepository};

use common::harness;

#[tokio::test]
async fn direct_assignment() {
    let (h, _rx) = harness();
    let r1 = h.restaurant(Some(GeoPoint::new(40.000, 29.000)));
    let c1 = h.courier(Some(GeoPoint::new(40.001, 29.001)), true).await;
    let _c2 = h.courier(Some(GeoPoint::new(40.001, 29.001)), false).await;

    let o1 = h.dispatch_order(r1, None).await;
    assert_eq!(o1.status, OrderStatus::Offered);
    assert_eq!(o1.code, "RST001");
    assert_eq!(o1.amount, 240.0);

    let watcher = h.store.watcher(o1.id).await.unwrap().unwrap();
    assert_eq!(watcher.available_couriers, BTreeSet::from([c1]));
    assert!(watcher.rejected_couriers.is_empty());

    let assigned = h.state.offers.courier_accept(c1, o1.id).await.unwrap();
    assert_eq!(assigned.status, OrderStatus::Assigned);
    assert_eq!(assigned.courier_id, Some(c1));

    assert!(h.store.watcher(o1.id).await.unwrap().is_none());
    assert_eq!(h.store.pool_len(), 0);

    let log = h.store.offer_log(c1, None, 10, 0).await.unwrap();
    assert_eq!(log.total, 1);
    assert_eq!(log.items[0].order_id, o1.id);
    assert_eq!(log.items[0].action, OfferAction::Accept);
}

#[tokio::test]
async fn reject_then_pool() {
    let (h, _rx) = harness();
    let r1 = h.restaurant(Some(GeoPoint::new(40.000, 29.000)));
    let c1 = h.courier(Some(GeoPoint::new(40.001, 29.001)), true).await;
    let _c2 = h.courier(Some(GeoPoint::new(40.001, 29.001)), false).await;
    let c3 = h.courier(Some(GeoPoint::new(40.002, 29.002)), true).await;

    let o2 = h.dispatch_order(r1, None).await;
    let watcher = h.store.watcher(o2.id).await.unwrap().unwrap();
    assert_eq!(watcher.available_couriers, BTreeSet::from([c1, c3]));

    let after_first = h.state.offers.courier_reject(c1, o2.id).await.unwrap();
    assert_eq!(after_first.status, OrderStatus::RejectedByCourier);
    let watcher = h.store.watcher(o2.id).await.unwrap().unwrap();
    assert_eq!(watcher.rejected_couriers, BTreeSet::from([c1]));
    assert!(!watcher.closed);
    assert_eq!(h.store.pool_len(), 0);

    let after_second = h.state.offers.courier_reject(c3, o2.id).await.unwrap();
    assert_eq!(after_second.status, OrderStatus::InPool);
    let watcher = h.store.watcher(o2.id).await.unwrap().unwrap();
    assert_eq!(watcher.rejected_couriers, BTreeSet::from([c1, c3]));
    assert!(watcher.closed);
    assert_eq!(h.store.pool_len(), 1);
}

#[tokio::test]
async fn repeated_rejection_is_reported_and_changes_nothing() {
    let (h, _rx) = harness();
    let r1 = h.restaurant(Some(GeoPoint::new(40.000, 29.000)));
    let c1 = h.courier(Some(GeoPoint::new(40.001, 29.001)), true).await;
    let _c3 = h.courier(Some(GeoPoint::new(40.002, 29.002)), true).await;

    let order = h.dispatch_order(r1, None).await;
    h.state.offers.courier_reject(c1, order.id).await.unwrap();

    let err = h.state.offers.courier_reject(c1, order.id).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let watcher = h.store.watcher(order.id).await.unwrap().unwrap();
    assert_eq!(watcher.rejected_couriers, BTreeSet::from([c1]));
    assert_eq!(h.store.offer_log(c1, None, 10, 0).await.unwrap().total, 1);
}

#[tokio::test]
async fn rejection_from_outside_the_audience_is_refused() {
    let (h, _rx) = harness();
    let r1 = h.restaurant(Some(GeoPoint::new(40.000, 29.000)));
    let c1 = h.courier(Some(GeoPoint::new(40.001, 29.001)), true).await;
    let stranger = h.courier(Some(GeoPoint::new(45.0, 35.0)), true).await;

    let order = h.dispatch_order(r1, None).await;
    let watcher = h.store.watcher(order.id).await.unwrap().unwrap();
    assert_eq!(watcher.available_couriers, BTreeSet::from([c1]));

    let err = h
        .state
        .offers
        .courier_reject(stranger, order.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));

    let current = h.state.orders.get(order.id, None).await.unwrap();
    assert_eq!(current.status, OrderStatus::Offered);
    let watcher = h.store.watcher(order.id).await.unwrap().unwrap();
    assert!(watcher.rejected_couriers.is_empty());
    assert_eq!(h.store.offer_log(stranger, None, 10, 0).await.unwrap().total, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn race_on_accept() {
    let (h, _rx) = harness();
    let r1 = h.restaurant(Some(GeoPoint::new(40.000, 29.000)));
    let c1 = h.courier(Some(GeoPoint::new(40.001, 29.001)), true).await;
    let c2 = h.courier(Some(GeoPoint::new(40.001, 29.002)), true).await;

    let o3 = h.dispatch_order(r1, None).await;
    assert_eq!(o3.status, OrderStatus::Offered);
    let watcher = h.store.watcher(o3.id).await.unwrap().unwrap();
    assert_eq!(watcher.available_couriers, BTreeSet::from([c1, c2]));

    let first = {
        let offers = h.state.offers.clone();
        tokio::spawn(async move { offers.courier_accept(c1, o3.id).await })
    };
    let second = {
        let offers = h.state.offers.clone();
        tokio::spawn(async move { offers.courier_accept(c2, o3.id).await })
    };
    let results = [first.await.unwrap(), second.await.unwrap()];

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    let losers = results
        .iter()
        .filter(|r| matches!(r, Err(AppError::AlreadyAssigned)))
        .count();
    assert_eq!(losers, 1);

    let order = h.state.orders.get(o3.id, None).await.unwrap();
    assert_eq!(order.status, OrderStatus::Assigned);
    assert_eq!(order.courier_id, winners[0].courier_id);

    for courier in [c1, c2] {
        let log = h.store.offer_log(courier, Some(OfferAction::Accept), 10, 0).await.unwrap();
        assert_eq!(log.total, 1, "accept row for {courier}");
    }
}

#[tokio::test]
async fn pool_lists_nearest_pickup_first() {
    let (h, _rx) = harness();
    let restaurant = h.restaurant(None);
    let c1 = h.courier(Some(GeoPoint::new(40.0, 29.0)), true).await;

    let far = h
        .dispatch_order(restaurant, Some(GeoPoint::new(40.1, 29.0)))
        .await;
    let near = h
        .dispatch_order(restaurant, Some(GeoPoint::new(40.0, 29.05)))
        .await;
    assert_eq!(far.status, OrderStatus::InPool);
    assert_eq!(near.status, OrderStatus::InPool);

    let listings = h.state.pool.list_for_courier(c1).await.unwrap();
    let ids: Vec<_> = listings.iter().map(|l| l.order_id).collect();
    assert_eq!(ids, vec![near.id, far.id]);
}

#[tokio::test]
async fn gps_update_pushes_route_frame() {
    let (h, _rx) = harness();
    let restaurant = h.restaurant(Some(GeoPoint::new(40.000, 29.000)));
    let c1 = h.courier(Some(GeoPoint::new(40.001, 29.001)), true).await;

    let o4 = h.dispatch_order(restaurant, None).await;
    h.state.offers.courier_accept(c1, o4.id).await.unwrap();

    let mut socket = h.state.routes.subscribe(c1);
    h.state
        .presence
        .upsert_location(c1, GeoPoint::new(40.0015, 29.0015))
        .await
        .unwrap();

    let frame: Value = serde_json::from_str(&socket.frames.try_recv().unwrap()).unwrap();
    assert_eq!(frame["type"], "route_update");
    assert_eq!(frame["order_id"], o4.id.to_string());
    assert_eq!(frame["data"]["route_polyline"], "leg-to-pickup");
    assert_eq!(frame["data"]["distance_m"], 3000.0);
    assert_eq!(frame["data"]["duration_s"], 300.0);
    assert_eq!(frame["data"]["driver"]["lat"], 40.0015);
    assert_eq!(
        frame["data"]["steps"],
        serde_json::json!(["head to pickup", "head to dropoff"])
    );

    h.directions.fail_with(Some(503));
    h.state
        .presence
        .upsert_location(c1, GeoPoint::new(40.002, 29.002))
        .await
        .unwrap();

    let frame: Value = serde_json::from_str(&socket.frames.try_recv().unwrap()).unwrap();
    assert_eq!(frame["type"], "route_error");
    assert_eq!(frame["order_id"], o4.id.to_string());
    assert_eq!(frame["status_code"], 503);
    assert!(h.state.routes.is_connected(c1));
}

#[tokio::test]
async fn route_stops_once_courier_is_at_location() {
    let (h, _rx) = harness();
    let restaurant = h.restaurant(Some(GeoPoint::new(40.000, 29.000)));
    let c1 = h.courier(Some(GeoPoint::new(40.001, 29.001)), true).await;

    let order = h.dispatch_order(restaurant, None).await;
    h.state.offers.courier_accept(c1, order.id).await.unwrap();

    let mut socket = h.state.routes.subscribe(c1);
    h.state.offers.pickup(c1, order.id).await.unwrap();
    assert!(socket.frames.try_recv().is_ok());

    h.state.offers.arrive(c1, order.id).await.unwrap();
    assert!(h.state.routes.push_for_courier(c1).await.is_none());
    assert_eq!(h.state.routes.sweep().await, 0);
}

#[tokio::test]
async fn closed_socket_is_pruned_on_next_push() {
    let (h, _rx) = harness();
    let restaurant = h.restaurant(Some(GeoPoint::new(40.000, 29.000)));
    let c1 = h.courier(Some(GeoPoint::new(40.001, 29.001)), true).await;
    let order = h.dispatch_order(restaurant, None).await;
    h.state.offers.courier_accept(c1, order.id).await.unwrap();

    let socket = h.state.routes.subscribe(c1);
    drop(socket);
    assert_eq!(h.state.routes.connection_count(), 1);

    h.state.routes.push_for_courier(c1).await;
    assert_eq!(h.state.routes.connection_count(), 0);
    assert!(!h.state.routes.is_connected(c1));
}

#[tokio::test]
async fn offline_courier_is_not_eligible() {
    let (h, _rx) = harness();
    let r2 = h.restaurant(Some(GeoPoint::new(40.000, 29.000)));
    let _c4 = h.courier(Some(GeoPoint::new(40.0045, 29.000)), false).await;

    let order = h.dispatch_order(r2, None).await;

    let watcher = h.store.watcher(order.id).await.unwrap().unwrap();
    assert!(watcher.available_couriers.is_empty());
    assert!(watcher.closed);
    assert_eq!(order.status, OrderStatus::InPool);
    assert_eq!(h.store.pool_len(), 1);
}

#[tokio::test]
async fn tick_on_pooled_order_is_idle() {
    let (h, _rx) = harness();
    let restaurant = h.restaurant(None);
    let order = h.dispatch_order(restaurant, Some(GeoPoint::new(40.0, 29.0))).await;

    assert_eq!(h.state.offers.tick(order.id).await.unwrap(), TickOutcome::Idle);
    assert_eq!(h.store.pool_len(), 1);

    let err = h
        .state
        .offers
        .send_to_pool(restaurant, order.id, Some("again".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    assert_eq!(h.store.pool_len(), 1);
}

#[tokio::test]
async fn pooled_order_can_be_claimed_by_any_courier() {
    let (h, _rx) = harness();
    let restaurant = h.restaurant(None);
    let order = h.dispatch_order(restaurant, Some(GeoPoint::new(40.0, 29.0))).await;
    let courier = h.courier(Some(GeoPoint::new(40.0, 29.0)), true).await;

    let claimed = h.state.offers.courier_accept(courier, order.id).await.unwrap();
    assert_eq!(claimed.status, OrderStatus::Assigned);
    assert_eq!(h.store.pool_len(), 0);
    assert!(h.store.watcher(order.id).await.unwrap().is_none());
}

#[tokio::test]
async fn dispatch_sweep_follows_presence() {
    let (h, _rx) = harness();
    let restaurant = h.restaurant(Some(GeoPoint::new(40.000, 29.000)));
    let c1 = h.courier(Some(GeoPoint::new(40.001, 29.001)), true).await;
    let c3 = h.courier(Some(GeoPoint::new(40.002, 29.002)), true).await;

    let order = h.dispatch_order(restaurant, None).await;
    h.state.offers.courier_reject(c1, order.id).await.unwrap();

    let newcomer = h.courier(Some(GeoPoint::new(40.003, 29.003)), true).await;
    assert_eq!(sweep_once(&h.state.offers).await, (1, 0));
    let reopened = h.state.orders.get(order.id, None).await.unwrap();
    assert_eq!(reopened.status, OrderStatus::Offered);
    let offers = h.state.offers.offers_for_courier(newcomer).await.unwrap();
    assert_eq!(offers.len(), 1);

    h.store.set_online(c3, false).await.unwrap();
    h.store.set_online(newcomer, false).await.unwrap();
    assert_eq!(sweep_once(&h.state.offers).await, (1, 1));
    let pooled = h.state.orders.get(order.id, None).await.unwrap();
    assert_eq!(pooled.status, OrderStatus::InPool);
}

#[tokio::test]
async fn cancel_drops_dispatch_state() {
    let (h, _rx) = harness();
    let restaurant = h.restaurant(Some(GeoPoint::new(40.000, 29.000)));
    let c1 = h.courier(Some(GeoPoint::new(40.001, 29.001)), true).await;

    let order = h.dispatch_order(restaurant, None).await;
    let cancelled = h.state.offers.cancel(restaurant, order.id).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert!(h.store.watcher(order.id).await.unwrap().is_none());
    assert!(h.state.offers.offers_for_courier(c1).await.unwrap().is_empty());

    let err = h.state.offers.courier_accept(c1, order.id).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));
    let err = h.state.offers.cancel(restaurant, order.id).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));
}

#[tokio::test]
async fn call_courier_takes_order_out_of_the_pool() {
    let (h, _rx) = harness();
    let restaurant = h.restaurant(None);
    let order = h.dispatch_order(restaurant, Some(GeoPoint::new(40.0, 29.0))).await;
    assert_eq!(h.store.pool_len(), 1);

    let called = h.state.offers.call_courier(restaurant, order.id).await.unwrap();
    assert_eq!(called.status, OrderStatus::CourierCalled);
    assert_eq!(h.store.pool_len(), 0);

    let courier = h.courier(None, true).await;
    let assigned = h.state.offers.courier_accept(courier, order.id).await.unwrap();
    assert_eq!(assigned.courier_id, Some(courier));
}

#[tokio::test]
async fn delivery_is_bound_to_the_assigned_courier() {
    let (h, _rx) = harness();
    let restaurant = h.restaurant(Some(GeoPoint::new(40.000, 29.000)));
    let c1 = h.courier(Some(GeoPoint::new(40.001, 29.001)), true).await;
    let stranger = h.courier(Some(GeoPoint::new(40.001, 29.001)), true).await;

    let order = h.dispatch_order(restaurant, None).await;
    h.state.offers.courier_accept(c1, order.id).await.unwrap();

    assert!(matches!(
        h.state.offers.deliver(c1, order.id).await,
        Err(AppError::InvalidTransition(_))
    ));
    assert!(matches!(
        h.state.offers.pickup(stranger, order.id).await,
        Err(AppError::InvalidTransition(_))
    ));

    h.state.offers.pickup(c1, order.id).await.unwrap();
    let delivered = h.state.offers.deliver(c1, order.id).await.unwrap();
    assert_eq!(delivered.status, OrderStatus::Delivered);

    let filter = OrderFilter {
        limit: 10,
        ..Default::default()
    };
    let history = h.state.orders.history(restaurant, filter).await.unwrap();
    assert_eq!(history.total, 1);
    assert_eq!(history.items[0].id, order.id);
}
